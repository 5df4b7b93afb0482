use std::collections::VecDeque;
use std::io;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::config::{DecodePolicy, PipelineConfig};
use crate::error::TransportError;
use crate::pipeline::{Pipeline, PipelineState};
use crate::sink::{DeliveryPolicy, SinkRegistration};
use crate::source::{ByteSource, ReadOutcome};
use crate::testutil::*;

enum Step {
    Data(Vec<u8>),
    Timeout,
    Fail,
    Cancel(CancellationToken),
}

/// Replays a fixed script of reads, then reports end of stream.
struct ScriptedSource {
    steps: VecDeque<Step>,
}

impl ScriptedSource {
    fn new(steps: Vec<Step>) -> Self {
        Self {
            steps: steps.into(),
        }
    }
}

impl ByteSource for ScriptedSource {
    fn read(&mut self, _max_len: usize) -> Result<ReadOutcome, TransportError> {
        match self.steps.pop_front() {
            Some(Step::Data(data)) => Ok(ReadOutcome::Data(Bytes::from(data))),
            Some(Step::Timeout) => Ok(ReadOutcome::Data(Bytes::new())),
            Some(Step::Fail) => Err(TransportError::Read(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "connection reset by peer",
            ))),
            Some(Step::Cancel(token)) => {
                token.cancel();
                Ok(ReadOutcome::Data(Bytes::new()))
            }
            None => Ok(ReadOutcome::EndOfStream),
        }
    }

    fn description(&self) -> String {
        "script".to_string()
    }
}

fn pipeline(policy: DecodePolicy) -> (Pipeline<FakeCodec>, CancellationToken) {
    let cancel = CancellationToken::new();
    let config = PipelineConfig {
        decode_policy: policy,
        ..PipelineConfig::default()
    };
    (Pipeline::new(config, FakeCodec::new(), cancel.clone()), cancel)
}

#[test]
fn test_end_of_stream_flushes_residual() {
    let (pipeline, _) = pipeline(DecodePolicy::default());
    let (sink, record) = TestSink::new("record");
    pipeline
        .add_sink(SinkRegistration::new(sink).policy(DeliveryPolicy::Block))
        .unwrap();
    let handle = pipeline.handle();

    let data = stream(&[sps(4, 2), pps(), idr(1), slice(2)]);
    let (a, b) = data.split_at(9);
    let steps = vec![Step::Data(a.to_vec()), Step::Timeout, Step::Data(b.to_vec())];
    let report = pipeline.run(|| Ok(ScriptedSource::new(steps)));

    assert_eq!(report.state, PipelineState::Stopped);
    assert!(report.is_success());
    assert_eq!(report.frames_decoded, 2);
    assert_eq!(report.frames_distributed, 2);
    assert_eq!(report.bytes_read, data.len() as u64);
    assert_eq!(record.seqs(), vec![1, 2]);
    assert!(record.finalized());
    assert_eq!(handle.state(), PipelineState::Stopped);
    assert_eq!(handle.frames_distributed(), 2);
}

#[test]
fn test_quiet_source_releases_last_picture() {
    let (pipeline, cancel) = pipeline(DecodePolicy::default());
    let (sink, record) = TestSink::new("record");
    pipeline
        .add_sink(SinkRegistration::new(sink).policy(DeliveryPolicy::Block))
        .unwrap();

    let unit1 = stream(&[sps(4, 2), pps(), idr(1)]);
    let (a, b) = unit1.split_at(unit1.len() - 2);
    let steps = vec![
        Step::Data(a.to_vec()),
        Step::Data(b.to_vec()),
        Step::Data(slice(2)),
        Step::Timeout,
        // cancelling skips the end-of-stream flush
        Step::Cancel(cancel),
    ];
    let report = pipeline.run(|| Ok(ScriptedSource::new(steps)));

    assert_eq!(report.state, PipelineState::Stopped);
    assert_eq!(report.frames_decoded, 2);
    assert_eq!(record.seqs(), vec![1, 2]);
}

#[test]
fn test_transport_failure_mid_stream() {
    let (pipeline, _) = pipeline(DecodePolicy::default());
    let (sink, record) = TestSink::new("paced");
    pipeline
        .add_sink(
            SinkRegistration::new(sink.paced(std::time::Duration::from_millis(20)))
                .policy(DeliveryPolicy::Block),
        )
        .unwrap();

    let steps = vec![
        Step::Data(stream(&[sps(4, 2), pps(), idr(1), slice(2), aud()])),
        Step::Fail,
        Step::Data(stream(&[slice(3), aud()])),
    ];
    let report = pipeline.run(|| Ok(ScriptedSource::new(steps)));

    match &report.state {
        PipelineState::Failed(reason) => assert!(reason.contains("connection reset")),
        other => panic!("unexpected state {:?}", other),
    }
    assert!(!report.is_success());
    assert_eq!(report.frames_decoded, 2);
    // queued frames are delivered before teardown
    assert_eq!(record.seqs(), vec![1, 2]);
    assert!(record.finalized());
}

#[test]
fn test_cancellation_skips_flush() {
    let (pipeline, cancel) = pipeline(DecodePolicy::default());
    let (sink, record) = TestSink::new("record");
    pipeline
        .add_sink(SinkRegistration::new(sink).policy(DeliveryPolicy::Block))
        .unwrap();

    let steps = vec![
        Step::Data(stream(&[sps(4, 2), pps(), idr(1), slice(2)])),
        Step::Cancel(cancel),
        Step::Data(stream(&[slice(3), aud()])),
    ];
    let report = pipeline.run(|| Ok(ScriptedSource::new(steps)));

    assert_eq!(report.state, PipelineState::Stopped);
    assert_eq!(record.seqs(), vec![1]);
    assert_eq!(report.frames_decoded, 1);
}

#[test]
fn test_connect_failure() {
    let (pipeline, _) = pipeline(DecodePolicy::default());
    let (sink, record) = TestSink::new("record");
    pipeline.add_sink(SinkRegistration::new(sink)).unwrap();
    let states = pipeline.handle().subscribe();

    let report = pipeline.run(|| -> Result<ScriptedSource, TransportError> {
        Err(TransportError::Resolve("nowhere:1".to_string()))
    });

    assert!(matches!(report.state, PipelineState::Failed(_)));
    assert_eq!(report.frames_decoded, 0);
    assert!(record.finalized());
    assert!(states.borrow().is_terminal());
}

#[test]
fn test_abort_policy_fails_pipeline() {
    let (pipeline, _) = pipeline(DecodePolicy::Abort);
    let (sink, record) = TestSink::new("record");
    pipeline
        .add_sink(SinkRegistration::new(sink).policy(DeliveryPolicy::Block))
        .unwrap();

    let steps = vec![Step::Data(stream(&[
        sps(4, 2),
        pps(),
        idr(1),
        corrupt_slice(),
        slice(3),
    ]))];
    let report = pipeline.run(|| Ok(ScriptedSource::new(steps)));

    assert!(matches!(report.state, PipelineState::Failed(_)));
    assert!(record.seqs().len() <= 1);
}

#[test]
fn test_resync_keeps_streaming() {
    let (pipeline, _) = pipeline(DecodePolicy::SkipAndResync);
    let (sink, record) = TestSink::new("record");
    pipeline
        .add_sink(SinkRegistration::new(sink).policy(DeliveryPolicy::Block))
        .unwrap();

    let steps = vec![
        Step::Data(stream(&[sps(4, 2), pps(), idr(1), corrupt_slice()])),
        Step::Data(stream(&[slice(3), slice(4)])),
    ];
    let report = pipeline.run(|| Ok(ScriptedSource::new(steps)));

    assert_eq!(report.state, PipelineState::Stopped);
    assert_eq!(report.resyncs, 1);
    assert_eq!(record.seqs(), vec![1, 2, 3]);
}

#[test]
fn test_handle_manages_sinks() {
    let (pipeline, _) = pipeline(DecodePolicy::default());
    let handle = pipeline.handle();
    let (kept, kept_record) = TestSink::new("kept");
    let (removed, removed_record) = TestSink::new("removed");
    handle
        .add_sink(SinkRegistration::new(kept).policy(DeliveryPolicy::Block))
        .unwrap();
    let id = handle.add_sink(SinkRegistration::new(removed)).unwrap();
    assert_eq!(handle.sinks().len(), 2);
    assert!(handle.remove_sink(id));

    let steps = vec![Step::Data(stream(&[sps(4, 2), pps(), idr(1)]))];
    let report = pipeline.run(|| Ok(ScriptedSource::new(steps)));

    assert_eq!(kept_record.seqs(), vec![1]);
    assert!(removed_record.seqs().is_empty());
    assert!(removed_record.finalized());
    assert_eq!(report.sinks.len(), 2);
}

#[test]
fn test_terminal_states() {
    assert!(PipelineState::Stopped.is_terminal());
    assert!(PipelineState::Failed("x".into()).is_terminal());
    assert!(!PipelineState::Draining.is_terminal());
    assert_eq!(
        serde_json::to_value(PipelineState::Failed("eof".into())).unwrap(),
        serde_json::json!({"state": "failed", "reason": "eof"})
    );
}
