//! 分块流水线编排
//!
//! One chunk runs as four threads joined by two bounded queues:
//!
//! ```text
//! acquisition -> [frame queue] -> detection -> [result queue] -> results
//!                                                   progress (side)
//! ```
//!
//! Acquisition never blocks on a full frame queue; it drops the newest frame.
//! Every stage polls the shared [`ShutdownSignal`] at least once per
//! `poll_interval`.

pub mod shutdown;
pub mod stages;
pub mod stats;

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::bounded;
use log::{error, info, warn};

use crate::core::config::SfotConfig;
use crate::core::model::{Chunk, ChunkStatus};
use crate::core::store::{BackingStore, ResultBatcher};
use crate::core::video::{ProcessGuard, TimeRange, VideoSource};
use crate::frame_extractor::{DetectionFunnel, DetectionServices};

pub use shutdown::{ShutdownSignal, StopReason};
pub use stages::offer_frame;
pub use stats::{PipelineStats, StatsSnapshot};

use stages::{spawn_stage, AcquisitionStage, DetectionStage, ProgressStage, ResultStage};

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineReport {
    pub stop_reason: StopReason,
    pub status: ChunkStatus,
    pub stats: StatsSnapshot,
    /// First abnormal stage exit, if any.
    pub error: Option<String>,
    pub elapsed: Duration,
}

pub struct ChunkPipeline {
    config: SfotConfig,
    services: DetectionServices,
    store: Arc<dyn BackingStore>,
    signal: ShutdownSignal,
}

struct Stage {
    name: &'static str,
    handle: Option<JoinHandle<Option<String>>>,
}

impl ChunkPipeline {
    pub fn new(
        config: SfotConfig,
        services: DetectionServices,
        store: Arc<dyn BackingStore>,
        signal: ShutdownSignal,
    ) -> Self {
        Self {
            config,
            services,
            store,
            signal,
        }
    }

    pub fn signal(&self) -> &ShutdownSignal {
        &self.signal
    }

    /// Process one chunk from `source` to the store. Purging old detections
    /// and writing the chunk status are left to the caller.
    pub fn run(&self, chunk: &Chunk, source: Box<dyn VideoSource>) -> PipelineReport {
        let started = Instant::now();
        let processing = &self.config.processing;
        let stats = Arc::new(PipelineStats::new());
        let guard = ProcessGuard::new();
        let signal = &self.signal;

        info!(
            "🎬 Chunk {} started: source {} [{}s-{}s] at {} fps",
            chunk.id, chunk.source_id, chunk.start_seconds, chunk.end_seconds, processing.frame_rate
        );

        let (frame_tx, frame_rx) = bounded(processing.frame_queue_capacity);
        let (result_tx, result_rx) = bounded(processing.result_queue_capacity);
        let (done_tx, done_rx) = bounded::<()>(0);

        let acquisition = AcquisitionStage {
            source,
            range: TimeRange {
                source_id: chunk.source_id.clone(),
                start_seconds: chunk.start_seconds,
                end_seconds: chunk.end_seconds,
            },
            guard: guard.clone(),
            frames: frame_tx,
            read_chunk_size: processing.read_chunk_size,
            exit_grace: self.config.source.terminate_grace(),
        };
        let detection = DetectionStage {
            funnel: DetectionFunnel::new(self.services.clone(), &self.config, chunk),
            frames: frame_rx.clone(),
            results: result_tx,
            start_seconds: chunk.start_seconds,
            sampling_period: processing.sampling_period(),
            poll: processing.poll_interval(),
        };
        let results = ResultStage {
            batcher: ResultBatcher::new(Arc::clone(&self.store), &self.config.store),
            results: result_rx,
            poll: processing.poll_interval(),
            flush_interval: processing.batch_flush_interval(),
        };
        let progress = ProgressStage {
            done: done_rx,
            frame_queue: frame_rx,
            interval: processing.progress_interval(),
        };

        let mut errors: Vec<String> = Vec::new();
        let mut stages = Vec::new();
        let spawned = [
            (
                "acquisition",
                spawn_stage("acquisition", signal, &stats, move |s, st| acquisition.run(s, st)),
            ),
            (
                "detection",
                spawn_stage("detection", signal, &stats, move |s, st| detection.run(s, st)),
            ),
            (
                "results",
                spawn_stage("results", signal, &stats, move |s, st| results.run(s, st)),
            ),
        ];
        for (name, spawned) in spawned {
            match spawned {
                Ok(handle) => stages.push(Stage {
                    name,
                    handle: Some(handle),
                }),
                Err(e) => {
                    signal.request(StopReason::Fatal);
                    errors.push(format!("failed to spawn {name} stage: {e}"));
                }
            }
        }
        let progress = spawn_stage("progress", signal, &stats, move |_, st| {
            progress.run(st);
            None
        });

        // Wait for the stages to finish on their own, or for an abort.
        let poll = processing.poll_interval();
        while stages.iter().any(|s| s.handle.is_some()) && !signal.should_abort() {
            for stage in stages.iter_mut() {
                if stage.handle.as_ref().map_or(false, |h| h.is_finished()) {
                    if let Some(err) = join_finished(stage, signal) {
                        errors.push(err);
                    }
                }
            }
            thread::sleep(poll.min(Duration::from_millis(50)));
        }

        if signal.should_abort() {
            warn!("🛑 Stopping chunk {}: {}", chunk.id, signal.reason().as_str());
        }
        guard.terminate(self.config.source.terminate_grace());

        let join_timeout = processing.stage_join_timeout();
        for stage in stages.iter_mut() {
            if let Some(err) = join_with_timeout(stage, join_timeout, signal) {
                errors.push(err);
            }
        }

        // acquisition may have adopted a child after the first terminate
        guard.terminate(Duration::ZERO);

        drop(done_tx);
        if let Ok(handle) = progress {
            let _ = handle.join();
        }

        let mut stop_reason = signal.reason();
        if stop_reason == StopReason::Running {
            // every stage returned without saying why
            signal.request(StopReason::Fatal);
            stop_reason = signal.reason();
        }
        let report = PipelineReport {
            stop_reason,
            status: stop_reason.chunk_status(),
            stats: stats.snapshot(),
            error: errors.into_iter().next(),
            elapsed: started.elapsed(),
        };
        info!(
            "🏁 Chunk {} finished: {} -> {} | frames {} (skipped {}) | detections {} | persisted {} | dropped {} | {:.1}s",
            chunk.id,
            report.stop_reason.as_str(),
            report.status.as_str(),
            report.stats.frames_processed,
            report.stats.frames_skipped,
            report.stats.detections,
            report.stats.results_persisted,
            report.stats.results_dropped,
            report.elapsed.as_secs_f64()
        );
        report
    }
}

fn join_finished(stage: &mut Stage, signal: &ShutdownSignal) -> Option<String> {
    let handle = stage.handle.take()?;
    match handle.join() {
        Ok(err) => err,
        Err(_) => {
            error!("💥 {} stage panicked", stage.name);
            signal.request(StopReason::Fatal);
            Some(format!("{} stage panicked", stage.name))
        }
    }
}

fn join_with_timeout(
    stage: &mut Stage,
    timeout: Duration,
    signal: &ShutdownSignal,
) -> Option<String> {
    let deadline = Instant::now() + timeout;
    loop {
        match &stage.handle {
            None => return None,
            Some(handle) if handle.is_finished() => return join_finished(stage, signal),
            Some(_) if Instant::now() >= deadline => {
                // left running; it exits at its next poll
                stage.handle = None;
                warn!("⏱️ {} stage did not stop within {:?}", stage.name, timeout);
                return Some(format!("{} stage did not stop in time", stage.name));
            }
            Some(_) => thread::sleep(Duration::from_millis(20)),
        }
    }
}
