//! The four stage loops of a chunk run. Each returns an error message when it
//! ended the run abnormally.

use std::io::{ErrorKind, Read};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender, TrySendError};
use log::{debug, error, info, warn};

use crate::core::model::DetectionResult;
use crate::core::store::ResultBatcher;
use crate::core::video::{FrameDemuxer, ProcessGuard, RawFrame, TimeRange, VideoSource};
use crate::frame_extractor::{DetectionFunnel, FunnelOutcome};
use crate::orchestrator::shutdown::{ShutdownSignal, StopReason};
use crate::orchestrator::stats::PipelineStats;

/// Enqueue without blocking. A full queue drops `frame` and counts a skip.
pub fn offer_frame(queue: &Sender<RawFrame>, frame: RawFrame, stats: &PipelineStats) -> bool {
    match queue.try_send(frame) {
        Ok(()) => true,
        Err(TrySendError::Full(frame)) => {
            stats.frame_skipped();
            debug!("⏭️ frame queue full, dropped frame {}", frame.index);
            false
        }
        Err(TrySendError::Disconnected(_)) => false,
    }
}

pub struct AcquisitionStage {
    pub source: Box<dyn VideoSource>,
    pub range: TimeRange,
    pub guard: ProcessGuard,
    pub frames: Sender<RawFrame>,
    pub read_chunk_size: usize,
    pub exit_grace: Duration,
}

impl AcquisitionStage {
    pub fn run(mut self, signal: &ShutdownSignal, stats: &PipelineStats) -> Option<String> {
        let mut reader = match self.source.open(&self.range, &self.guard) {
            Ok(reader) => reader,
            Err(e) => {
                self.guard.terminate(self.exit_grace);
                if signal.should_abort() {
                    return None;
                }
                error!("❌ Video source failed to start: {}", e);
                signal.request(StopReason::SourceFailed);
                return Some(e.to_string());
            }
        };

        let mut demuxer = FrameDemuxer::new();
        let mut buf = vec![0u8; self.read_chunk_size.max(1)];
        loop {
            if signal.should_abort() {
                debug!("acquisition stopping: {}", signal.reason().as_str());
                self.guard.terminate(self.exit_grace);
                return None;
            }
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    stats.add_bytes(n);
                    for frame in demuxer.push(&buf[..n]) {
                        stats.frame_read();
                        offer_frame(&self.frames, frame, stats);
                    }
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.guard.terminate(self.exit_grace);
                    if signal.should_abort() {
                        return None;
                    }
                    signal.request(lost_or_failed(demuxer.frames_emitted()));
                    error!("❌ Video stream read failed: {}", e);
                    return Some(format!("stream read failed: {e}"));
                }
            }
        }

        // EOF here may just be the children being stopped
        if signal.should_abort() {
            self.guard.terminate(self.exit_grace);
            return None;
        }
        let discarded = demuxer.finish();
        if discarded > 0 {
            debug!("discarded {} trailing bytes", discarded);
        }
        let frames = demuxer.frames_emitted();

        if let Err(e) = self.guard.wait_all(self.exit_grace) {
            if !signal.should_abort() {
                signal.request(lost_or_failed(frames));
                error!("❌ {}", e);
                return Some(e.to_string());
            }
            return None;
        }
        if frames == 0 {
            signal.request(StopReason::SourceFailed);
            warn!("⚠️ Video source produced no frames");
            return Some("video source produced no frames".to_string());
        }

        info!("🏁 End of stream after {} frames", frames);
        signal.request(StopReason::InputExhausted);
        None
    }
}

fn lost_or_failed(frames_emitted: u64) -> StopReason {
    if frames_emitted > 0 {
        StopReason::SourceLost
    } else {
        StopReason::SourceFailed
    }
}

pub struct DetectionStage {
    pub funnel: DetectionFunnel,
    pub frames: Receiver<RawFrame>,
    pub results: Sender<DetectionResult>,
    pub start_seconds: u64,
    pub sampling_period: f64,
    pub poll: Duration,
}

impl DetectionStage {
    /// Runs until the frame queue is closed and empty, or an abort.
    pub fn run(mut self, signal: &ShutdownSignal, stats: &PipelineStats) -> Option<String> {
        loop {
            if signal.should_abort() {
                let discarded = self.frames.try_iter().count();
                if discarded > 0 {
                    info!("🗑️ Discarded {} queued frames", discarded);
                }
                return None;
            }
            let frame = match self.frames.recv_timeout(self.poll) {
                Ok(frame) => frame,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return None,
            };

            let timestamp = frame.vod_timestamp(self.start_seconds, self.sampling_period);
            stats.frame_processed();
            match self.funnel.process(&frame, timestamp) {
                FunnelOutcome::Accepted(result) => {
                    stats.detection();
                    info!(
                        "🎯 t={}s {} {} ({:.2})",
                        result.timestamp, result.rank, result.username, result.confidence
                    );
                    if !self.forward(result, signal) {
                        return if signal.should_abort() {
                            None
                        } else {
                            Some("result stage stopped unexpectedly".to_string())
                        };
                    }
                }
                FunnelOutcome::Rejected(reason) => {
                    stats.frame_rejected();
                    debug!("frame {} rejected: {}", frame.index, reason.as_str());
                }
            }
        }
    }

    /// Blocking send that still notices an abort.
    fn forward(&self, mut result: DetectionResult, signal: &ShutdownSignal) -> bool {
        loop {
            match self.results.send_timeout(result, self.poll) {
                Ok(()) => return true,
                Err(SendTimeoutError::Timeout(back)) => {
                    if signal.should_abort() {
                        return false;
                    }
                    result = back;
                }
                Err(SendTimeoutError::Disconnected(_)) => return false,
            }
        }
    }
}

pub struct ResultStage {
    pub batcher: ResultBatcher,
    pub results: Receiver<DetectionResult>,
    pub poll: Duration,
    pub flush_interval: Duration,
}

impl ResultStage {
    /// Runs until the result queue is closed, or an abort; the partial batch
    /// is flushed either way.
    pub fn run(mut self, signal: &ShutdownSignal, stats: &PipelineStats) -> Option<String> {
        loop {
            if signal.should_abort() {
                for result in self.results.try_iter() {
                    if let Some(outcome) = self.batcher.push(result) {
                        stats.record_batch(outcome);
                    }
                }
                break;
            }
            match self.results.recv_timeout(self.poll) {
                Ok(result) => {
                    let outcome = self
                        .batcher
                        .push(result)
                        .or_else(|| self.batcher.flush_if_stale(self.flush_interval));
                    if let Some(outcome) = outcome {
                        stats.record_batch(outcome);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    if let Some(outcome) = self.batcher.flush_if_stale(self.flush_interval) {
                        stats.record_batch(outcome);
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        if self.batcher.pending_len() > 0 {
            stats.record_batch(self.batcher.flush());
        }
        None
    }
}

pub struct ProgressStage {
    /// Closed by the orchestrator once the other stages are done.
    pub done: Receiver<()>,
    pub frame_queue: Receiver<RawFrame>,
    pub interval: Duration,
}

impl ProgressStage {
    pub fn run(self, stats: &PipelineStats) {
        let started = Instant::now();
        let mut last = stats.snapshot();
        let mut last_at = started;

        while let Err(RecvTimeoutError::Timeout) = self.done.recv_timeout(self.interval) {
            let now = Instant::now();
            let snap = stats.snapshot();
            let window = now.duration_since(last_at).as_secs_f64().max(f64::EPSILON);
            let rate = (snap.frames_processed - last.frames_processed) as f64 / window;
            info!(
                "📊 [{:>5}s] read {} | skipped {} | processed {} ({:.2}/s) | detections {} | persisted {} | dropped {} | queue {}",
                started.elapsed().as_secs(),
                snap.frames_read,
                snap.frames_skipped,
                snap.frames_processed,
                rate,
                snap.detections,
                snap.results_persisted,
                snap.results_dropped,
                self.frame_queue.len()
            );
            last = snap;
            last_at = now;
        }
    }
}

/// Run a stage body on a named thread with its own handles to the shared
/// signal and counters.
pub fn spawn_stage<F>(
    name: &str,
    signal: &ShutdownSignal,
    stats: &Arc<PipelineStats>,
    body: F,
) -> std::io::Result<std::thread::JoinHandle<Option<String>>>
where
    F: FnOnce(&ShutdownSignal, &PipelineStats) -> Option<String> + Send + 'static,
{
    let signal = signal.clone();
    let stats = Arc::clone(stats);
    std::thread::Builder::new()
        .name(format!("sfot-{name}"))
        .spawn(move || body(&signal, &stats))
}
