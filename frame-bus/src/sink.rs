use serde::{Deserialize, Serialize};

use crate::{
    error::SinkError,
    frame::{Frame, PixelFormat, StreamFormat},
};

/// A consumer of decoded frames. Every method runs on the sink's own worker
/// thread, so blocking here never holds up the pipeline.
pub trait Sink: Send {
    fn name(&self) -> &str;

    /// Pixel format this sink wants; frames are converted before `consume`.
    fn required_format(&self) -> Option<PixelFormat> {
        None
    }

    /// Called before the first frame and again after every stream format change.
    /// Any error disables the sink.
    fn configure(&mut self, format: &StreamFormat) -> Result<(), SinkError>;

    /// Any error removes the sink.
    fn consume(&mut self, frame: &Frame) -> Result<(), SinkError>;

    fn finalize(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// What the distributor does when a sink's queue is full.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeliveryPolicy {
    /// Wait for space, up to the stall timeout. No frame loss.
    Block,
    /// Evict the oldest queued frame.
    #[default]
    DropOldest,
    /// Discard the incoming frame.
    DropNewest,
}

impl std::str::FromStr for DeliveryPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "block" => Ok(DeliveryPolicy::Block),
            "drop-oldest" => Ok(DeliveryPolicy::DropOldest),
            "drop-newest" => Ok(DeliveryPolicy::DropNewest),
            other => Err(anyhow::anyhow!("unknown delivery policy: {}", other)),
        }
    }
}

/// A sink plus the rules it is served by.
pub struct SinkRegistration {
    pub(crate) sink: Box<dyn Sink>,
    pub(crate) policy: DeliveryPolicy,
    pub(crate) queue_depth: Option<usize>,
    pub(crate) required_format: Option<PixelFormat>,
}

impl SinkRegistration {
    pub fn new<S: Sink + 'static>(sink: S) -> Self {
        Self::boxed(Box::new(sink))
    }

    pub fn boxed(sink: Box<dyn Sink>) -> Self {
        let required_format = sink.required_format();
        Self {
            sink,
            policy: DeliveryPolicy::default(),
            queue_depth: None,
            required_format,
        }
    }

    pub fn policy(mut self, policy: DeliveryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Overrides the pipeline's default queue depth.
    pub fn queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = Some(depth);
        self
    }

    /// Overrides the format the sink asked for; `None` delivers frames as decoded.
    pub fn required_format(mut self, format: Option<PixelFormat>) -> Self {
        self.required_format = format;
        self
    }

    pub fn name(&self) -> &str {
        self.sink.name()
    }
}
