pub mod cancel;
pub mod signal;
pub mod wait_group;
