//! Receive side of a raw H.264 relay: byte source, Annex B decoder and a
//! frame distributor feeding independent sinks.

pub mod annexb;
pub mod codec;
pub mod config;
pub mod convert;
pub mod decoder;
pub mod distributor;
pub mod error;
pub mod frame;
pub mod pipeline;
#[cfg(feature = "ffmpeg")]
pub mod scaler;
pub mod sink;
pub mod source;

#[cfg(test)]
pub(crate) mod testutil;

/// Registers FFmpeg components. Call once at startup; a no-op without the
/// `ffmpeg` feature.
pub fn init() -> anyhow::Result<()> {
    #[cfg(feature = "ffmpeg")]
    ffmpeg_next::init().map_err(|e| anyhow::anyhow!("ffmpeg_next init: {}", e))?;
    Ok(())
}
