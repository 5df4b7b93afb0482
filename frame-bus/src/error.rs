use thiserror::Error;

/// Connection level failure. Always fatal to the pipeline.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("could not resolve {0}")]
    Resolve(String),

    #[error("read failed: {0}")]
    Read(#[source] std::io::Error),
}

/// Error reported by the codec capability for a single access unit.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("corrupt bitstream: {0}")]
    Corrupt(String),

    #[error("codec failure: {0}")]
    Internal(String),
}

#[derive(Error, Debug)]
pub enum DecodeError {
    /// Corruption seen while the resync policy is `abort`.
    #[error("bitstream corruption: {0}")]
    Corrupt(#[source] CodecError),

    /// A second corruption inside one `feed` call after a resync was already spent.
    #[error("resync exhausted: {0}")]
    ResyncExhausted(#[source] CodecError),

    /// The codec itself broke; the bitstream is not to blame.
    #[error("codec failure: {0}")]
    Codec(#[source] CodecError),

    #[error("flush failed: {0}")]
    Flush(#[source] CodecError),
}

/// Errors a sink reports back to its worker. None of them reach the pipeline.
#[derive(Error, Debug)]
pub enum SinkError {
    /// The sink cannot accept the negotiated stream format.
    #[error("config error: {0}")]
    Config(String),

    /// Device or surface lost.
    #[error("fatal: {0}")]
    Fatal(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum ConvertError {
    #[error("no conversion from {from:?} to {to:?}")]
    Unsupported {
        from: crate::frame::PixelFormat,
        to: crate::frame::PixelFormat,
    },

    #[error("frame buffer too small: expected {expected} bytes, got {actual}")]
    ShortBuffer { expected: usize, actual: usize },

    #[error("{0:?} needs even dimensions, got {1}x{2}")]
    OddDimensions(crate::frame::PixelFormat, u32, u32),
}

impl From<ConvertError> for SinkError {
    fn from(err: ConvertError) -> Self {
        SinkError::Config(err.to_string())
    }
}

/// Reason a pipeline ended in `Failed`.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Decode(#[from] DecodeError),
}
