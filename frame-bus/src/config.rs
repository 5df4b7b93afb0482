use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Largest access unit the decoder buffers before treating the stream as corrupt.
pub const DEFAULT_MAX_UNIT_BYTES: usize = 16 * 1024 * 1024;

/// What the decoder does when the codec reports a corrupt unit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DecodePolicy {
    /// Drop buffered data up to the next start code and keep going.
    #[default]
    SkipAndResync,
    /// Fail the pipeline on the first corrupt unit.
    Abort,
}

impl std::str::FromStr for DecodePolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "resync" | "skip-and-resync" => Ok(DecodePolicy::SkipAndResync),
            "abort" => Ok(DecodePolicy::Abort),
            other => Err(anyhow::anyhow!("unknown decode policy: {}", other)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Upper bound for a single transport read.
    pub read_chunk_size: usize,
    pub read_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    /// How long a `block` sink may hold up the pipeline before it is removed.
    pub stall_timeout_ms: u64,
    /// Queue depth for sinks that do not set their own.
    pub queue_depth: usize,
    pub decode_policy: DecodePolicy,
    /// Cap on undecoded bytes held for one access unit.
    pub max_unit_bytes: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            read_chunk_size: 64 * 1024,
            read_timeout_ms: 200,
            connect_timeout_ms: 5_000,
            stall_timeout_ms: 2_000,
            queue_depth: 4,
            decode_policy: DecodePolicy::default(),
            max_unit_bytes: DEFAULT_MAX_UNIT_BYTES,
        }
    }
}

impl PipelineConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.max(1))
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.read_chunk_size == 0 {
            anyhow::bail!("read_chunk_size must be greater than zero");
        }
        if self.queue_depth == 0 {
            anyhow::bail!("queue_depth must be at least 1");
        }
        if self.max_unit_bytes < self.read_chunk_size {
            anyhow::bail!("max_unit_bytes must be at least read_chunk_size");
        }
        Ok(())
    }
}
