use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::{
    codec::Codec,
    config::PipelineConfig,
    decoder::Decoder,
    distributor::{Distributor, SinkId, SinkSummary},
    error::{PipelineError, TransportError},
    frame::Frame,
    sink::SinkRegistration,
    source::{ByteSource, ReadOutcome},
};

const LOG_FIRST_FRAMES: u64 = 5;
const LOG_EVERY_FRAMES: u64 = 100;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "kebab-case")]
pub enum PipelineState {
    Connecting,
    Streaming,
    Draining,
    Stopped,
    Failed(String),
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Stopped | PipelineState::Failed(_))
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineState::Connecting => write!(f, "connecting"),
            PipelineState::Streaming => write!(f, "streaming"),
            PipelineState::Draining => write!(f, "draining"),
            PipelineState::Stopped => write!(f, "stopped"),
            PipelineState::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

#[derive(Debug)]
pub struct PipelineReport {
    pub state: PipelineState,
    pub frames_decoded: u64,
    pub frames_distributed: u64,
    pub bytes_read: u64,
    pub resyncs: u64,
    pub elapsed: Duration,
    pub sinks: Vec<SinkSummary>,
}

impl PipelineReport {
    pub fn is_success(&self) -> bool {
        self.state == PipelineState::Stopped
    }

    /// Average receive rate in KiB/s.
    pub fn bandwidth_kib(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.bytes_read as f64 / 1024.0 / secs
        } else {
            0.0
        }
    }
}

/// Cloneable control surface of a running pipeline.
#[derive(Clone)]
pub struct PipelineHandle {
    cancel: CancellationToken,
    state: watch::Receiver<PipelineState>,
    distributor: Arc<Distributor>,
    frames: Arc<AtomicU64>,
}

impl PipelineHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn state(&self) -> PipelineState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PipelineState> {
        self.state.clone()
    }

    pub fn add_sink(&self, registration: SinkRegistration) -> anyhow::Result<SinkId> {
        self.distributor.register(registration)
    }

    pub fn remove_sink(&self, id: SinkId) -> bool {
        self.distributor.deregister(id)
    }

    pub fn sinks(&self) -> Vec<SinkSummary> {
        self.distributor.summaries()
    }

    pub fn frames_distributed(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }
}

/// Drives read -> decode -> distribute on the calling thread.
pub struct Pipeline<C> {
    config: PipelineConfig,
    decoder: Decoder<C>,
    distributor: Arc<Distributor>,
    cancel: CancellationToken,
    state_tx: watch::Sender<PipelineState>,
    frames: Arc<AtomicU64>,
    bytes_read: u64,
}

impl<C: Codec> Pipeline<C> {
    pub fn new(config: PipelineConfig, codec: C, cancel: CancellationToken) -> Self {
        let (state_tx, _) = watch::channel(PipelineState::Connecting);
        Self {
            decoder: Decoder::new(codec, config.decode_policy)
                .with_max_unit_bytes(config.max_unit_bytes),
            distributor: Arc::new(Distributor::new(config.queue_depth, config.stall_timeout())),
            config,
            cancel,
            state_tx,
            frames: Arc::new(AtomicU64::new(0)),
            bytes_read: 0,
        }
    }

    pub fn add_sink(&self, registration: SinkRegistration) -> anyhow::Result<SinkId> {
        self.distributor.register(registration)
    }

    pub fn handle(&self) -> PipelineHandle {
        PipelineHandle {
            cancel: self.cancel.clone(),
            state: self.state_tx.subscribe(),
            distributor: self.distributor.clone(),
            frames: self.frames.clone(),
        }
    }

    /// Connects with `connect` and streams until end of stream, failure or
    /// cancellation. Sinks are drained and finalized before this returns.
    pub fn run<S, F>(mut self, connect: F) -> PipelineReport
    where
        S: ByteSource,
        F: FnOnce() -> Result<S, TransportError>,
    {
        let started = Instant::now();
        self.set_state(PipelineState::Connecting);

        let result = match connect() {
            Ok(mut source) => {
                log::info!("connected to {}", source.description());
                self.set_state(PipelineState::Streaming);
                let result = self.stream(&mut source);
                source.close();
                result
            }
            Err(err) => Err(err.into()),
        };

        let state = match result {
            Ok(()) => PipelineState::Stopped,
            Err(err) => {
                log::error!("pipeline failed: {}", err);
                PipelineState::Failed(err.to_string())
            }
        };

        let sinks = self.distributor.shutdown();
        for sink in &sinks {
            log::info!(
                "{} ({}): delivered={} dropped={} {}",
                sink.id,
                sink.name,
                sink.delivered,
                sink.dropped,
                sink.status
            );
        }
        self.set_state(state.clone());

        PipelineReport {
            state,
            frames_decoded: self.decoder.frames_emitted(),
            frames_distributed: self.frames.load(Ordering::Relaxed),
            bytes_read: self.bytes_read,
            resyncs: self.decoder.resyncs(),
            elapsed: started.elapsed(),
            sinks,
        }
    }

    fn stream<S: ByteSource>(&mut self, source: &mut S) -> Result<(), PipelineError> {
        loop {
            if self.cancel.is_cancelled() {
                log::info!("cancelled, {} bytes buffered are discarded", self.decoder.buffered_bytes());
                self.set_state(PipelineState::Draining);
                return Ok(());
            }

            match source.read(self.config.read_chunk_size)? {
                ReadOutcome::Data(chunk) if chunk.is_empty() => {
                    // read timeout: let a finished picture out without waiting for the next one
                    if !self.cancel.is_cancelled() {
                        let frames = self.decoder.idle()?;
                        self.dispatch(frames);
                    }
                }
                ReadOutcome::Data(chunk) => {
                    self.bytes_read += chunk.len() as u64;
                    let frames = self.decoder.feed(&chunk)?;
                    self.dispatch(frames);
                }
                ReadOutcome::EndOfStream => {
                    log::info!("end of stream after {} bytes", self.bytes_read);
                    self.set_state(PipelineState::Draining);
                    let frames = self.decoder.flush()?;
                    self.dispatch(frames);
                    return Ok(());
                }
            }
        }
    }

    fn dispatch(&self, frames: Vec<Frame>) {
        for frame in frames {
            if self.cancel.is_cancelled() {
                log::debug!("cancelled, dropping frame {}", frame.seq);
                continue;
            }
            let seq = frame.seq;
            let format = frame.format;
            let outcomes = self.distributor.distribute(frame);
            let n = self.frames.fetch_add(1, Ordering::Relaxed) + 1;
            if n <= LOG_FIRST_FRAMES || n % LOG_EVERY_FRAMES == 0 {
                log::debug!(
                    "frame {} ({}) to {} sinks, {} bytes read so far",
                    seq,
                    format,
                    outcomes.len(),
                    self.bytes_read
                );
            }
        }
    }

    fn set_state(&self, state: PipelineState) {
        // terminal states are absorbing
        self.state_tx.send_if_modified(|current| {
            if current.is_terminal() || *current == state {
                return false;
            }
            log::info!("pipeline {} -> {}", current, state);
            *current = state.clone();
            true
        });
    }
}

#[cfg(test)]
#[path = "pipeline_test.rs"]
mod pipeline_test;
