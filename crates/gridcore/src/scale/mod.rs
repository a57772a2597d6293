pub mod down;
pub mod up;

pub use down::ScaleDownHandler;
pub use up::{ScaleUpConfig, ScaleUpHandler};
