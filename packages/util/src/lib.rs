pub mod id;
pub mod key_bounds;
pub mod long_timeout;
pub mod timestamp;
