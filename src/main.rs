use std::process::ExitCode;

use log::{error, warn};

use sfot::api::ChunkWorker;
use sfot::core::model::ChunkStatus;
use sfot::{init_logging, SfotConfig, SfotError};

const USAGE: &str = "usage: sfot <chunk_id> [config.json5]  (or CHUNK_ID / SFOT_CONFIG)";

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(chunk_id) = args
        .first()
        .cloned()
        .or_else(|| std::env::var("CHUNK_ID").ok())
    else {
        eprintln!("{USAGE}");
        return ExitCode::from(2);
    };
    let config_path = args
        .get(1)
        .cloned()
        .or_else(|| std::env::var("SFOT_CONFIG").ok());

    match run(&chunk_id, config_path.as_deref()) {
        Ok(ChunkStatus::Completed) => ExitCode::SUCCESS,
        Ok(status) => {
            warn!("⚠️ Chunk {} left {}", chunk_id, status.as_str());
            ExitCode::FAILURE
        }
        Err(e) => {
            // config errors surface before the configured logger exists
            init_logging("info");
            error!("❌ Chunk {}: {}", chunk_id, e);
            ExitCode::FAILURE
        }
    }
}

fn run(chunk_id: &str, config_path: Option<&str>) -> Result<ChunkStatus, SfotError> {
    let mut config = match config_path {
        Some(path) => SfotConfig::from_file(path)?,
        None => SfotConfig::default(),
    };
    config.apply_env();
    init_logging(&config.logging.level);

    let worker = ChunkWorker::from_config(config)?;
    worker.signal().install_termination_handler();
    Ok(worker.run_chunk(chunk_id)?.status)
}
