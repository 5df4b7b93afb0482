use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender, TrySendError};
use serde::Serialize;

use crate::{
    convert::Converter,
    error::SinkError,
    frame::{Frame, StreamFormat},
    sink::{DeliveryPolicy, Sink, SinkRegistration},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SinkId(u64);

impl fmt::Display for SinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sink-{}", self.0)
    }
}

/// What happened to one frame for one sink.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// Discarded by a full drop-newest queue. Evictions under drop-oldest
    /// still report the new frame as delivered and only show in the counters.
    Dropped,
    BlockedThenDelivered,
    /// The queue stayed full for the whole stall timeout; the sink was removed.
    Stalled,
    /// The sink had already failed and was pruned.
    Removed,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "kebab-case")]
pub enum SinkStatus {
    Active,
    Finalized,
    /// Rejected a stream format.
    Disabled(String),
    Failed(String),
    Stalled,
    Removed,
}

impl fmt::Display for SinkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SinkStatus::Active => write!(f, "active"),
            SinkStatus::Finalized => write!(f, "finalized"),
            SinkStatus::Disabled(reason) => write!(f, "disabled: {}", reason),
            SinkStatus::Failed(reason) => write!(f, "failed: {}", reason),
            SinkStatus::Stalled => write!(f, "stalled"),
            SinkStatus::Removed => write!(f, "removed"),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct SinkSummary {
    pub id: SinkId,
    pub name: String,
    pub policy: DeliveryPolicy,
    pub delivered: u64,
    pub dropped: u64,
    /// Frames waiting in the sink's queue.
    pub queued: usize,
    pub status: SinkStatus,
}

struct SinkShared {
    name: String,
    alive: AtomicBool,
    delivered: AtomicU64,
    dropped: AtomicU64,
    status: Mutex<SinkStatus>,
}

impl SinkShared {
    fn set_status(&self, status: SinkStatus) {
        let mut current = lock(&self.status);
        if *current == SinkStatus::Active {
            *current = status;
        }
    }

    fn status(&self) -> SinkStatus {
        lock(&self.status).clone()
    }
}

struct SinkSlot {
    id: SinkId,
    policy: DeliveryPolicy,
    shared: Arc<SinkShared>,
    tx: Mutex<Option<Sender<Frame>>>,
    // lets drop-oldest evict from the head of its own queue
    rx: Receiver<Frame>,
    worker: Mutex<Option<JoinHandle<()>>>,
    // disconnects once the worker has finalized its sink
    done: Receiver<()>,
}

impl SinkSlot {
    fn sender(&self) -> Option<Sender<Frame>> {
        lock(&self.tx).clone()
    }

    fn close(&self) {
        lock(&self.tx).take();
    }

    fn summary(&self) -> SinkSummary {
        SinkSummary {
            id: self.id,
            name: self.shared.name.clone(),
            policy: self.policy,
            delivered: self.shared.delivered.load(Ordering::Relaxed),
            dropped: self.shared.dropped.load(Ordering::Relaxed),
            queued: self.rx.len(),
            status: self.shared.status(),
        }
    }
}

/// Fans decoded frames out to every registered sink.
///
/// Each sink gets a bounded queue drained by its own worker thread. A full
/// queue is resolved by the sink's [`DeliveryPolicy`]; only `Block` can make
/// [`Distributor::distribute`] wait, and never longer than the stall timeout.
pub struct Distributor {
    next_id: AtomicU64,
    default_depth: usize,
    stall_timeout: Duration,
    sinks: RwLock<BTreeMap<SinkId, Arc<SinkSlot>>>,
    retired: Mutex<Vec<Arc<SinkSlot>>>,
    closed: AtomicBool,
}

impl Distributor {
    pub fn new(default_depth: usize, stall_timeout: Duration) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            default_depth: default_depth.max(1),
            stall_timeout,
            sinks: RwLock::new(BTreeMap::new()),
            retired: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Starts serving a sink from the next distributed frame on.
    pub fn register(&self, registration: SinkRegistration) -> anyhow::Result<SinkId> {
        if self.closed.load(Ordering::Acquire) {
            anyhow::bail!("distributor is shut down");
        }
        let SinkRegistration {
            sink,
            policy,
            queue_depth,
            required_format,
        } = registration;

        let id = SinkId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let depth = queue_depth.unwrap_or(self.default_depth).max(1);
        let (tx, rx) = crossbeam_channel::bounded(depth);
        let shared = Arc::new(SinkShared {
            name: sink.name().to_string(),
            alive: AtomicBool::new(true),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            status: Mutex::new(SinkStatus::Active),
        });

        let (done_tx, done) = crossbeam_channel::bounded::<()>(0);
        let worker = {
            let rx = rx.clone();
            let shared = shared.clone();
            std::thread::Builder::new()
                .name(format!("sink-{}", shared.name))
                .spawn(move || sink_worker(sink, rx, required_format, shared, done_tx))?
        };

        log::info!(
            "registered {} ({}) policy={:?} depth={}",
            id,
            shared.name,
            policy,
            depth
        );
        let slot = Arc::new(SinkSlot {
            id,
            policy,
            shared,
            tx: Mutex::new(Some(tx)),
            rx,
            worker: Mutex::new(Some(worker)),
            done,
        });
        write(&self.sinks).insert(id, slot);
        Ok(id)
    }

    /// Stops serving a sink. Frames already queued are discarded and the sink
    /// is finalized by its worker. Returns false for unknown ids.
    pub fn deregister(&self, id: SinkId) -> bool {
        match write(&self.sinks).remove(&id) {
            Some(slot) => {
                log::info!("deregistered {} ({})", id, slot.shared.name);
                slot.shared.set_status(SinkStatus::Removed);
                self.retire(slot);
                true
            }
            None => false,
        }
    }

    /// Offers `frame` to every sink, in registration order.
    ///
    /// Every sink but the last receives a cheap clone sharing the frame's
    /// buffer; the last one receives the frame itself.
    pub fn distribute(&self, frame: Frame) -> Vec<(SinkId, DeliveryOutcome)> {
        if self.closed.load(Ordering::Acquire) {
            return Vec::new();
        }
        let snapshot: Vec<Arc<SinkSlot>> = read(&self.sinks).values().cloned().collect();
        let mut outcomes = Vec::with_capacity(snapshot.len());
        let last = snapshot.len().saturating_sub(1);
        let mut frame = Some(frame);

        for (i, slot) in snapshot.iter().enumerate() {
            let item = if i == last { frame.take() } else { frame.clone() };
            let Some(item) = item else { break };

            let outcome = self.deliver(slot, item);
            match outcome {
                DeliveryOutcome::Stalled => {
                    log::warn!(
                        "{} ({}) stalled for {:?}, removing",
                        slot.id,
                        slot.shared.name,
                        self.stall_timeout
                    );
                    slot.shared.set_status(SinkStatus::Stalled);
                    self.evict(slot.id);
                }
                DeliveryOutcome::Removed => self.evict(slot.id),
                _ => {}
            }
            outcomes.push((slot.id, outcome));
        }
        outcomes
    }

    fn deliver(&self, slot: &SinkSlot, frame: Frame) -> DeliveryOutcome {
        if !slot.shared.alive.load(Ordering::Acquire) {
            return DeliveryOutcome::Removed;
        }
        let Some(tx) = slot.sender() else {
            return DeliveryOutcome::Removed;
        };

        match slot.policy {
            DeliveryPolicy::DropNewest => match tx.try_send(frame) {
                Ok(()) => DeliveryOutcome::Delivered,
                Err(TrySendError::Full(_)) => {
                    slot.shared.dropped.fetch_add(1, Ordering::Relaxed);
                    DeliveryOutcome::Dropped
                }
                Err(TrySendError::Disconnected(_)) => DeliveryOutcome::Removed,
            },
            DeliveryPolicy::DropOldest => {
                let mut item = frame;
                loop {
                    match tx.try_send(item) {
                        Ok(()) => return DeliveryOutcome::Delivered,
                        Err(TrySendError::Full(back)) => {
                            item = back;
                            if slot.rx.try_recv().is_ok() {
                                slot.shared.dropped.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                        Err(TrySendError::Disconnected(_)) => return DeliveryOutcome::Removed,
                    }
                }
            }
            DeliveryPolicy::Block => match tx.try_send(frame) {
                Ok(()) => DeliveryOutcome::Delivered,
                Err(TrySendError::Full(back)) => match tx.send_timeout(back, self.stall_timeout) {
                    Ok(()) => DeliveryOutcome::BlockedThenDelivered,
                    Err(SendTimeoutError::Timeout(_)) => DeliveryOutcome::Stalled,
                    Err(SendTimeoutError::Disconnected(_)) => DeliveryOutcome::Removed,
                },
                Err(TrySendError::Disconnected(_)) => DeliveryOutcome::Removed,
            },
        }
    }

    fn evict(&self, id: SinkId) {
        if let Some(slot) = write(&self.sinks).remove(&id) {
            self.retire(slot);
        }
    }

    fn retire(&self, slot: Arc<SinkSlot>) {
        slot.shared.alive.store(false, Ordering::Release);
        slot.close();
        lock(&self.retired).push(slot);
    }

    pub fn sink_count(&self) -> usize {
        read(&self.sinks).len()
    }

    pub fn sink_ids(&self) -> Vec<SinkId> {
        read(&self.sinks).keys().copied().collect()
    }

    /// Live view of every sink, registered or retired.
    pub fn summaries(&self) -> Vec<SinkSummary> {
        let mut out: Vec<SinkSummary> = read(&self.sinks).values().map(|s| s.summary()).collect();
        out.extend(lock(&self.retired).iter().map(|s| s.summary()));
        out.sort_by_key(|s| s.id);
        out
    }

    /// Closes every queue, lets workers drain what is queued and finalize, and
    /// reports each sink.
    ///
    /// Workers share one deadline of `stall_timeout`. A worker still busy when
    /// it passes is detached and its sink reported as failed; stalled sinks
    /// are not waited for at all.
    pub fn shutdown(&self) -> Vec<SinkSummary> {
        self.closed.store(true, Ordering::Release);
        let mut slots: Vec<Arc<SinkSlot>> = std::mem::take(&mut *write(&self.sinks))
            .into_values()
            .collect();
        slots.extend(lock(&self.retired).drain(..));
        slots.sort_by_key(|s| s.id);

        for slot in &slots {
            slot.close();
        }

        let deadline = Instant::now() + self.stall_timeout;
        let mut summaries = Vec::with_capacity(slots.len());
        for slot in slots {
            let worker = lock(&slot.worker).take();
            match (slot.shared.status(), worker) {
                (SinkStatus::Stalled, Some(_)) => {
                    log::warn!("{} ({}) stalled, not waiting for it", slot.id, slot.shared.name);
                }
                (_, Some(worker)) if !finished_by(&slot.done, deadline) => {
                    log::warn!(
                        "{} ({}) did not finish within {:?}, detaching",
                        slot.id,
                        slot.shared.name,
                        self.stall_timeout
                    );
                    slot.shared.alive.store(false, Ordering::Release);
                    slot.shared.set_status(SinkStatus::Failed("finalize timeout".to_string()));
                    drop(worker);
                }
                (_, Some(worker)) => {
                    if worker.join().is_err() {
                        log::error!("{} ({}) worker panicked", slot.id, slot.shared.name);
                        slot.shared.set_status(SinkStatus::Failed("worker panicked".to_string()));
                    }
                }
                (_, None) => {}
            }
            slot.shared.set_status(SinkStatus::Finalized);
            summaries.push(slot.summary());
        }
        summaries
    }
}

impl Drop for Distributor {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            self.shutdown();
        }
    }
}

fn finished_by(done: &Receiver<()>, deadline: Instant) -> bool {
    !matches!(done.recv_deadline(deadline), Err(RecvTimeoutError::Timeout))
}

fn sink_worker(
    mut sink: Box<dyn Sink>,
    rx: Receiver<Frame>,
    required: Option<crate::frame::PixelFormat>,
    shared: Arc<SinkShared>,
    done: Sender<()>,
) {
    let mut converter = required.map(Converter::new);
    let mut configured: Option<(u32, StreamFormat)> = None;
    let mut failure = None;

    for frame in rx.iter() {
        if !shared.alive.load(Ordering::Acquire) {
            break;
        }

        if configured != Some((frame.epoch, frame.format)) {
            if let Err(err) = configure(sink.as_mut(), converter.as_mut(), &frame.format) {
                failure = Some(match err {
                    SinkError::Config(reason) => SinkStatus::Disabled(reason),
                    other => SinkStatus::Failed(other.to_string()),
                });
                break;
            }
            configured = Some((frame.epoch, frame.format));
        }

        let result = match converter.as_mut() {
            Some(converter) => converter
                .convert(&frame)
                .map_err(SinkError::from)
                .and_then(|converted| sink.consume(&converted)),
            None => sink.consume(&frame),
        };
        match result {
            Ok(()) => {
                shared.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                failure = Some(SinkStatus::Failed(err.to_string()));
                break;
            }
        }
    }

    if let Some(status) = failure {
        shared.alive.store(false, Ordering::Release);
        log::warn!("sink {} {}, removing", shared.name, status);
        shared.set_status(status);
    }
    drop(rx);

    if let Err(err) = sink.finalize() {
        log::warn!("finalize of sink {} failed: {}", shared.name, err);
    } else {
        log::debug!("sink {} finalized", shared.name);
    }
    drop(done);
}

fn configure(
    sink: &mut dyn Sink,
    converter: Option<&mut Converter>,
    format: &StreamFormat,
) -> Result<(), SinkError> {
    let target = match converter {
        Some(converter) => {
            converter.reset(*format)?;
            format.with_pixel_format(converter.target())
        }
        None => *format,
    };
    sink.configure(&target)?;
    log::info!("sink {} configured for {}", sink.name(), target);
    Ok(())
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(l: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(l: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
#[path = "distributor_test.rs"]
mod distributor_test;
