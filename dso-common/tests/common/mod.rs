#![allow(dead_code)]

pub mod fixtures;
pub mod logging;

pub use fixtures::{
    CANONICAL_RELOCATED_16, TestRig, full_artifacts, quick_options, relocated_device,
};
pub use logging::init_test_logging;
