//! Fiber lifecycle states

use core::fmt;

/// State of a fiber
///
/// ```text
///   Init ──resume──► Exec ──yield_to_ready──► Ready ──resume──► Exec
///                     │  ──yield_to_hold───► Hold  ──resume──► Exec
///                     │  ──return──────────► Term  ──reset───► Init
///                     └──panic─────────────► Except ──reset──► Init
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FiberState {
    /// Created or reset, body not started
    Init = 0,

    /// Suspended, waiting for someone to reschedule it
    Hold = 1,

    /// Currently executing
    Exec = 2,

    /// Body returned normally
    Term = 3,

    /// Suspended, wants to be put back on the run queue
    Ready = 4,

    /// Body panicked
    Except = 5,
}

impl FiberState {
    /// Body has finished, normally or not
    #[inline]
    pub const fn is_terminated(&self) -> bool {
        matches!(self, FiberState::Term | FiberState::Except)
    }

    /// Stack may be reused for a new body
    #[inline]
    pub const fn can_reset(&self) -> bool {
        matches!(self, FiberState::Init | FiberState::Term | FiberState::Except)
    }
}

impl From<u8> for FiberState {
    fn from(v: u8) -> Self {
        match v {
            0 => FiberState::Init,
            1 => FiberState::Hold,
            2 => FiberState::Exec,
            3 => FiberState::Term,
            4 => FiberState::Ready,
            5 => FiberState::Except,
            _ => FiberState::Except, // corrupted value, never resumable
        }
    }
}

impl From<FiberState> for u8 {
    fn from(state: FiberState) -> u8 {
        state as u8
    }
}

impl fmt::Display for FiberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FiberState::Init => "INIT",
            FiberState::Hold => "HOLD",
            FiberState::Exec => "EXEC",
            FiberState::Term => "TERM",
            FiberState::Ready => "READY",
            FiberState::Except => "EXCEPT",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(FiberState::Term.is_terminated());
        assert!(FiberState::Except.is_terminated());
        assert!(!FiberState::Hold.is_terminated());
        assert!(!FiberState::Exec.is_terminated());
    }

    #[test]
    fn test_reset_allowed() {
        assert!(FiberState::Init.can_reset());
        assert!(FiberState::Term.can_reset());
        assert!(FiberState::Except.can_reset());
        assert!(!FiberState::Ready.can_reset());
        assert!(!FiberState::Exec.can_reset());
    }

    #[test]
    fn test_u8_conversion() {
        for s in [
            FiberState::Init,
            FiberState::Hold,
            FiberState::Exec,
            FiberState::Term,
            FiberState::Ready,
            FiberState::Except,
        ] {
            assert_eq!(FiberState::from(u8::from(s)), s);
        }
        assert_eq!(FiberState::from(200), FiberState::Except);
    }
}
