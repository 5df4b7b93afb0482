pub mod device;
pub mod preview;

pub use device::DeviceSink;
pub use preview::{PreviewSink, PreviewStats, PreviewSurface};
