pub mod config;
pub mod duration;
pub mod image;
pub mod types;

pub use config::{ConfigError, StackConfig};
pub use duration::parse_duration;
pub use image::{ImageError, ImageRef};
pub use types::*;
