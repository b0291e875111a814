//! Duration-bounded capture. A pump thread drains the transport into a
//! bounded channel; the loop here gates, accumulates, and decides when the
//! run is over. This keeps slow disks and gate math off the receive path so
//! datagrams are not lost while the loop is busy.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use crossbeam_channel::{bounded, RecvTimeoutError, Sender, TrySendError};
use serde::Serialize;

use crate::gate::{ChunkGate, GateDecision};
use crate::pcm::SampleDecoder;
use crate::transport::{ByteSource, SourceRead};

/// Knobs for one capture run, snapshotted from the CLI before the loop
/// starts.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Wall-clock budget for the whole run.
    pub duration_ms: u64,
    /// Consecutive quiet time after which the source is declared idle.
    pub idle_timeout_ms: u64,
    /// Largest chunk pulled from the transport per read.
    pub chunk_bytes: usize,
    /// Bounded queue depth between the pump thread and the loop.
    pub channel_capacity: usize,
    /// How long one queue wait may block before idle time accrues.
    pub poll_ms: u64,
    /// Hard cap on accumulated bytes; the run stops once it is reached.
    pub max_bytes: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            duration_ms: 5_000,
            idle_timeout_ms: 2_000,
            chunk_bytes: 4_096,
            channel_capacity: 64,
            poll_ms: 100,
            max_bytes: 16 * 1024 * 1024,
        }
    }
}

/// Why the capture loop ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StopReason {
    Deadline,
    SourceIdle { idle_ms: u64 },
    BufferFull,
    Disconnected,
    Error { message: String },
}

impl StopReason {
    pub fn label(&self) -> &'static str {
        match self {
            StopReason::Deadline => "deadline",
            StopReason::SourceIdle { .. } => "source_idle",
            StopReason::BufferFull => "buffer_full",
            StopReason::Disconnected => "disconnected",
            StopReason::Error { .. } => "error",
        }
    }
}

/// Counters for one run, reported in the session summary.
#[derive(Debug, Clone, Serialize)]
pub struct CaptureMetrics {
    pub capture_ms: u64,
    pub chunks_received: u64,
    pub chunks_accepted: u64,
    pub chunks_rejected: u64,
    /// Chunks lost because the queue was full when the pump tried to hand
    /// them over.
    pub chunks_dropped: u64,
    pub bytes_captured: u64,
    pub stop_reason: StopReason,
}

impl Default for CaptureMetrics {
    fn default() -> Self {
        Self {
            capture_ms: 0,
            chunks_received: 0,
            chunks_accepted: 0,
            chunks_rejected: 0,
            chunks_dropped: 0,
            bytes_captured: 0,
            stop_reason: StopReason::Deadline,
        }
    }
}

/// Accumulated payload plus the run's counters.
#[derive(Debug, Clone)]
pub struct CaptureResult {
    pub bytes: Vec<u8>,
    pub metrics: CaptureMetrics,
}

/// Accepted chunks in arrival order, capped at `max_bytes`. A recording has
/// to stay contiguous, so the cap stops the run instead of evicting old
/// data.
pub(crate) struct ChunkAccumulator {
    chunks: Vec<Vec<u8>>,
    total_bytes: usize,
    max_bytes: usize,
}

impl ChunkAccumulator {
    pub(crate) fn new(max_bytes: usize) -> Self {
        Self {
            chunks: Vec::new(),
            total_bytes: 0,
            max_bytes: max_bytes.max(1),
        }
    }

    /// Store as much of `chunk` as the cap allows; returns the stored count.
    pub(crate) fn push_up_to(&mut self, chunk: &[u8]) -> usize {
        let room = self.max_bytes - self.total_bytes;
        let take = chunk.len().min(room);
        if take > 0 {
            self.chunks.push(chunk[..take].to_vec());
            self.total_bytes += take;
        }
        take
    }

    pub(crate) fn is_full(&self) -> bool {
        self.total_bytes >= self.max_bytes
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.total_bytes == 0
    }

    pub(crate) fn into_bytes(self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.total_bytes);
        for chunk in self.chunks {
            bytes.extend(chunk);
        }
        bytes
    }
}

/// Tracks the quiet streak between chunks.
pub(crate) struct IdleTracker {
    idle_timeout_ms: u64,
    idle_streak_ms: u64,
}

impl IdleTracker {
    pub(crate) fn new(idle_timeout_ms: u64) -> Self {
        Self {
            idle_timeout_ms,
            idle_streak_ms: 0,
        }
    }

    pub(crate) fn on_data(&mut self) {
        self.idle_streak_ms = 0;
    }

    pub(crate) fn on_idle(&mut self, waited_ms: u64) -> Option<StopReason> {
        self.idle_streak_ms = self.idle_streak_ms.saturating_add(waited_ms);
        if self.idle_streak_ms >= self.idle_timeout_ms {
            Some(StopReason::SourceIdle {
                idle_ms: self.idle_streak_ms,
            })
        } else {
            None
        }
    }
}

enum PumpEvent {
    Chunk(Vec<u8>),
    Closed,
    Failed(String),
}

fn spawn_pump(
    mut source: Box<dyn ByteSource>,
    chunk_bytes: usize,
    read_timeout: Duration,
    sender: Sender<PumpEvent>,
    dropped: Arc<AtomicUsize>,
    stop: Arc<AtomicBool>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut buf = vec![0u8; chunk_bytes.max(1)];
        while !stop.load(Ordering::Relaxed) {
            match source.read_chunk(&mut buf, read_timeout) {
                Ok(SourceRead::Data(n)) => {
                    let n = n.min(buf.len());
                    match sender.try_send(PumpEvent::Chunk(buf[..n].to_vec())) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            dropped.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(TrySendError::Disconnected(_)) => return,
                    }
                }
                Ok(SourceRead::Idle) => {}
                Ok(SourceRead::Closed) => {
                    let _ = sender.send(PumpEvent::Closed);
                    return;
                }
                Err(err) => {
                    let _ = sender.send(PumpEvent::Failed(format!("{err:#}")));
                    return;
                }
            }
        }
    })
}

/// Read from `source` until the deadline, the idle window, the byte cap, or
/// the source itself ends the run. Chunks failing the gate are counted and
/// discarded; everything else accumulates in arrival order.
pub fn run_capture(
    source: Box<dyn ByteSource>,
    mut gate: Option<&mut (dyn ChunkGate + '_)>,
    decoder: &SampleDecoder,
    cfg: &CaptureConfig,
) -> Result<CaptureResult> {
    let source_name = source.describe();
    let (sender, receiver) = bounded(cfg.channel_capacity.max(1));
    let dropped = Arc::new(AtomicUsize::new(0));
    let stop = Arc::new(AtomicBool::new(false));
    let poll = Duration::from_millis(cfg.poll_ms.max(1));
    let pump = spawn_pump(
        source,
        cfg.chunk_bytes,
        poll,
        sender,
        dropped.clone(),
        stop.clone(),
    );

    let mut accumulator = ChunkAccumulator::new(cfg.max_bytes);
    let mut idle = IdleTracker::new(cfg.idle_timeout_ms);
    let mut metrics = CaptureMetrics::default();
    let started = Instant::now();
    let deadline = started + Duration::from_millis(cfg.duration_ms);
    let stop_reason;

    loop {
        let now = Instant::now();
        if now >= deadline {
            stop_reason = StopReason::Deadline;
            break;
        }
        let wait = poll.min(deadline - now);
        match receiver.recv_timeout(wait) {
            Ok(PumpEvent::Chunk(chunk)) => {
                metrics.chunks_received += 1;
                idle.on_data();
                let decision = match gate {
                    Some(ref mut g) => g.assess(&decoder.gate_view(&chunk)),
                    None => GateDecision::Accept,
                };
                if decision == GateDecision::Reject {
                    metrics.chunks_rejected += 1;
                    continue;
                }
                let stored = accumulator.push_up_to(&chunk);
                metrics.chunks_accepted += 1;
                metrics.bytes_captured += stored as u64;
                if accumulator.is_full() {
                    stop_reason = StopReason::BufferFull;
                    break;
                }
            }
            Ok(PumpEvent::Closed) => {
                stop_reason = StopReason::Disconnected;
                break;
            }
            Ok(PumpEvent::Failed(message)) => {
                stop_reason = StopReason::Error { message };
                break;
            }
            Err(RecvTimeoutError::Timeout) => {
                if let Some(reason) = idle.on_idle(wait.as_millis() as u64) {
                    stop_reason = reason;
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                stop_reason = StopReason::Disconnected;
                break;
            }
        }
    }

    stop.store(true, Ordering::Relaxed);
    drop(receiver);
    let _ = pump.join();

    metrics.capture_ms = started.elapsed().as_millis() as u64;
    metrics.chunks_dropped = dropped.load(Ordering::Relaxed) as u64;
    metrics.stop_reason = stop_reason;

    if accumulator.is_empty() {
        return Err(anyhow!(
            "no bytes captured from {source_name} ({} chunks received, {} rejected, stopped: {})",
            metrics.chunks_received,
            metrics.chunks_rejected,
            metrics.stop_reason.label()
        ));
    }

    Ok(CaptureResult {
        bytes: accumulator.into_bytes(),
        metrics,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::RangeGate;
    use crate::pcm::{DcOffset, SampleWidth};
    use std::collections::VecDeque;

    enum Step {
        Data(Vec<u8>),
        Idle,
        Closed,
        Fail(&'static str),
    }

    struct ScriptedSource {
        steps: VecDeque<Step>,
    }

    impl ScriptedSource {
        fn new(steps: Vec<Step>) -> Box<Self> {
            Box::new(Self {
                steps: steps.into(),
            })
        }
    }

    impl ByteSource for ScriptedSource {
        fn read_chunk(&mut self, buf: &mut [u8], timeout: Duration) -> Result<SourceRead> {
            match self.steps.pop_front() {
                Some(Step::Data(bytes)) => {
                    let n = bytes.len().min(buf.len());
                    buf[..n].copy_from_slice(&bytes[..n]);
                    Ok(SourceRead::Data(n))
                }
                Some(Step::Idle) | None => {
                    thread::sleep(timeout);
                    Ok(SourceRead::Idle)
                }
                Some(Step::Closed) => Ok(SourceRead::Closed),
                Some(Step::Fail(message)) => Err(anyhow!("{message}")),
            }
        }

        fn describe(&self) -> String {
            "scripted://test".to_string()
        }
    }

    fn word_chunk(value: u16, words: usize) -> Vec<u8> {
        std::iter::repeat(value)
            .take(words)
            .flat_map(|w| w.to_le_bytes())
            .collect()
    }

    fn test_decoder() -> SampleDecoder {
        SampleDecoder::new(SampleWidth::Sixteen, DcOffset::None)
    }

    fn quick_config() -> CaptureConfig {
        CaptureConfig {
            duration_ms: 10_000,
            idle_timeout_ms: 60,
            chunk_bytes: 64,
            channel_capacity: 64,
            poll_ms: 10,
            max_bytes: 1024 * 1024,
        }
    }

    #[test]
    fn deadline_ends_a_continuous_stream() {
        let steps: Vec<Step> = (0..10_000)
            .map(|_| Step::Data(word_chunk(100, 4)))
            .collect();
        let cfg = CaptureConfig {
            duration_ms: 60,
            idle_timeout_ms: 10_000,
            poll_ms: 10,
            ..quick_config()
        };
        let result =
            run_capture(ScriptedSource::new(steps), None, &test_decoder(), &cfg).expect("capture");
        assert_eq!(result.metrics.stop_reason, StopReason::Deadline);
        assert!(result.metrics.bytes_captured > 0);
        assert_eq!(result.bytes.len() as u64, result.metrics.bytes_captured);
    }

    #[test]
    fn idle_window_stops_the_run() {
        let steps = vec![
            Step::Data(word_chunk(1, 8)),
            Step::Idle,
            Step::Data(word_chunk(2, 8)),
        ];
        let result = run_capture(
            ScriptedSource::new(steps),
            None,
            &test_decoder(),
            &quick_config(),
        )
        .expect("capture");
        assert!(matches!(
            result.metrics.stop_reason,
            StopReason::SourceIdle { idle_ms } if idle_ms >= 60
        ));
        assert_eq!(result.bytes.len(), 32);
        assert_eq!(result.metrics.chunks_received, 2);
    }

    #[test]
    fn gate_rejections_are_counted_and_skipped() {
        let steps = vec![
            Step::Data(word_chunk(100, 8)),    // plausible, small magnitude
            Step::Data(word_chunk(0x7F00, 8)), // byte-shifted garbage
            Step::Data(word_chunk(200, 8)),
        ];
        let mut gate = RangeGate::new(12, 0.9);
        let result = run_capture(
            ScriptedSource::new(steps),
            Some(&mut gate),
            &test_decoder(),
            &quick_config(),
        )
        .expect("capture");
        assert_eq!(result.metrics.chunks_received, 3);
        assert_eq!(result.metrics.chunks_accepted, 2);
        assert_eq!(result.metrics.chunks_rejected, 1);
        assert_eq!(result.bytes.len(), 32);
    }

    #[test]
    fn byte_cap_truncates_and_stops() {
        let steps: Vec<Step> = (0..5).map(|_| Step::Data(vec![0xAA; 8])).collect();
        let cfg = CaptureConfig {
            max_bytes: 20,
            ..quick_config()
        };
        let result =
            run_capture(ScriptedSource::new(steps), None, &test_decoder(), &cfg).expect("capture");
        assert_eq!(result.metrics.stop_reason, StopReason::BufferFull);
        assert_eq!(result.bytes.len(), 20);
        assert_eq!(result.metrics.bytes_captured, 20);
    }

    #[test]
    fn closed_source_reports_disconnect() {
        let steps = vec![Step::Data(vec![1, 2, 3, 4]), Step::Closed];
        let result = run_capture(
            ScriptedSource::new(steps),
            None,
            &test_decoder(),
            &quick_config(),
        )
        .expect("capture");
        assert_eq!(result.metrics.stop_reason, StopReason::Disconnected);
        assert_eq!(result.bytes, vec![1, 2, 3, 4]);
    }

    #[test]
    fn failing_source_carries_the_message() {
        let steps = vec![Step::Data(vec![9; 4]), Step::Fail("bus fell over")];
        let result = run_capture(
            ScriptedSource::new(steps),
            None,
            &test_decoder(),
            &quick_config(),
        )
        .expect("capture");
        assert!(matches!(
            result.metrics.stop_reason,
            StopReason::Error { ref message } if message.contains("bus fell over")
        ));
    }

    #[test]
    fn empty_capture_is_an_error() {
        let err = run_capture(
            ScriptedSource::new(Vec::new()),
            None,
            &test_decoder(),
            &quick_config(),
        )
        .expect_err("should fail");
        assert!(err.to_string().contains("no bytes captured"));
    }

    #[test]
    fn accumulator_preserves_arrival_order() {
        let mut acc = ChunkAccumulator::new(100);
        acc.push_up_to(&[1, 2]);
        acc.push_up_to(&[3]);
        acc.push_up_to(&[4, 5]);
        assert_eq!(acc.into_bytes(), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn accumulator_stores_partial_chunk_at_the_cap() {
        let mut acc = ChunkAccumulator::new(3);
        assert_eq!(acc.push_up_to(&[1, 2]), 2);
        assert_eq!(acc.push_up_to(&[3, 4]), 1);
        assert!(acc.is_full());
        assert_eq!(acc.push_up_to(&[5]), 0);
        assert_eq!(acc.into_bytes(), vec![1, 2, 3]);
    }

    #[test]
    fn idle_tracker_resets_on_data() {
        let mut idle = IdleTracker::new(50);
        assert!(idle.on_idle(30).is_none());
        idle.on_data();
        assert!(idle.on_idle(30).is_none());
        assert!(matches!(
            idle.on_idle(30),
            Some(StopReason::SourceIdle { idle_ms: 60 })
        ));
    }

    #[test]
    fn stop_reason_labels_are_stable() {
        assert_eq!(StopReason::Deadline.label(), "deadline");
        assert_eq!(StopReason::SourceIdle { idle_ms: 1 }.label(), "source_idle");
        assert_eq!(StopReason::BufferFull.label(), "buffer_full");
        assert_eq!(StopReason::Disconnected.label(), "disconnected");
        assert_eq!(
            StopReason::Error {
                message: "x".into()
            }
            .label(),
            "error"
        );
    }
}
