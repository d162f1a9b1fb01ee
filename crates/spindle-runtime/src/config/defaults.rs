//! Compile-time defaults, generated by `build.rs`

include!(concat!(env!("OUT_DIR"), "/spindle_merged_config.rs"));
