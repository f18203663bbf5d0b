//! 分块任务入口
//!
//! 领取分块 -> 标记 processing -> 清理旧结果 -> 运行流水线 -> 回写最终状态

use std::sync::Arc;

use log::{error, info, warn};

use crate::core::config::SfotConfig;
use crate::core::error::SfotError;
use crate::core::model::ChunkStatus;
use crate::core::store::{BackingStore, ChunkUpdate, ResultBatcher, RetryPolicy, SupabaseStore};
use crate::core::video::{StreamlinkSource, VideoSource};
use crate::frame_extractor::DetectionServices;
use crate::orchestrator::{ChunkPipeline, PipelineReport, ShutdownSignal};

/// Runs chunks one at a time against a backing store.
///
/// ```no_run
/// use sfot::api::ChunkWorker;
/// use sfot::SfotConfig;
///
/// let worker = ChunkWorker::from_config(SfotConfig::default())?;
/// worker.signal().install_termination_handler();
/// let report = worker.run_chunk("chunk-id")?;
/// println!("{}", report.status.as_str());
/// # Ok::<(), sfot::SfotError>(())
/// ```
pub struct ChunkWorker {
    config: SfotConfig,
    services: DetectionServices,
    store: Arc<dyn BackingStore>,
    signal: ShutdownSignal,
}

impl ChunkWorker {
    /// Validate the config, load templates and connect the remote store.
    pub fn from_config(config: SfotConfig) -> Result<Self, SfotError> {
        config.validate()?;
        let services = DetectionServices::from_config(&config)?;
        let store: Arc<dyn BackingStore> = Arc::new(SupabaseStore::from_config(&config.store)?);
        Ok(Self::new(config, services, store, ShutdownSignal::new()))
    }

    pub fn new(
        config: SfotConfig,
        services: DetectionServices,
        store: Arc<dyn BackingStore>,
        signal: ShutdownSignal,
    ) -> Self {
        info!("🎬 ChunkWorker: created");
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

    /// Fetch the recording range through streamlink and ffmpeg.
    pub fn run_chunk(&self, chunk_id: &str) -> Result<PipelineReport, SfotError> {
        let source = StreamlinkSource::new(
            self.config.source.clone(),
            self.config.processing.frame_rate,
        );
        self.run_chunk_with_source(chunk_id, Box::new(source))
    }

    pub fn run_chunk_with_source(
        &self,
        chunk_id: &str,
        source: Box<dyn VideoSource>,
    ) -> Result<PipelineReport, SfotError> {
        if !self.signal.rearm() {
            warn!("🛑 Chunk {}: termination already requested", chunk_id);
        }
        let policy = RetryPolicy::from_config(&self.config.store);

        let chunk = policy
            .run("fetch chunk", || self.store.fetch_chunk(chunk_id))?
            .ok_or_else(|| SfotError::ChunkNotFound(chunk_id.to_string()))?;

        let attempt = chunk.attempt_count.saturating_add(1);
        let processing = ChunkUpdate::new(ChunkStatus::Processing).with_attempt(attempt);
        policy.run("mark chunk processing", || {
            self.store.update_chunk(chunk_id, &processing)
        })?;
        info!(
            "🚀 Chunk {}: attempt {} ({} -> {}s)",
            chunk_id, attempt, chunk.start_seconds, chunk.end_seconds
        );

        let batcher = ResultBatcher::new(Arc::clone(&self.store), &self.config.store);
        if let Err(e) = batcher.purge_chunk(chunk_id) {
            error!("❌ Chunk {}: purge failed: {}", chunk_id, e);
            let failed =
                ChunkUpdate::new(ChunkStatus::Failed).with_error(format!("purge failed: {e}"));
            if let Err(update_err) = policy.run("mark chunk failed", || {
                self.store.update_chunk(chunk_id, &failed)
            }) {
                error!("❌ Chunk {}: could not record failure: {}", chunk_id, update_err);
            }
            return Err(e.into());
        }

        let pipeline = ChunkPipeline::new(
            self.config.clone(),
            self.services.clone(),
            Arc::clone(&self.store),
            self.signal.clone(),
        );
        let report = pipeline.run(&chunk, source);

        let mut update = ChunkUpdate::new(report.status).with_counts(
            report.stats.frames_processed,
            report.stats.results_persisted,
        );
        if let Some(message) = final_error(&report) {
            update = update.with_error(message);
        }
        policy.run("write chunk status", || {
            self.store.update_chunk(chunk_id, &update)
        })?;

        info!("✅ Chunk {}: {}", chunk_id, report.status.as_str());
        Ok(report)
    }
}

fn final_error(report: &PipelineReport) -> Option<String> {
    match (&report.error, report.status) {
        (Some(message), _) => Some(message.clone()),
        (None, ChunkStatus::Completed) => None,
        (None, _) => Some(report.stop_reason.as_str().to_string()),
    }
}

impl Drop for ChunkWorker {
    fn drop(&mut self) {
        info!("🗑️ ChunkWorker: released");
    }
}
