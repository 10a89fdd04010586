pub mod compress;
pub mod focus_crop;
pub mod grounding;
pub mod scene;
pub mod screenshot;
pub mod stability;
pub mod types;

pub use compress::{compress_screenshot, CompressedImage};
pub use grounding::{ground_element, zoom_and_reground};
pub use scene::perceive_scene;
pub use screenshot::{ScreenSource, ScreenshotResult, XcapScreen};
pub use types::{Confidence, ElementLocation, ScreenshotMeta};
