//! Video acquisition: produces the concatenated-JPEG byte stream for a chunk.

use std::fs::File;
use std::io::{Cursor, Read};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use thiserror::Error;

use crate::core::config::SourceConfig;

const CHILD_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{0} exited during startup ({1})")]
    StartFailed(String, String),
    #[error("{0} exited abnormally ({1})")]
    Exited(String, String),
    #[error("No stdout pipe for {0}")]
    Pipe(&'static str),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeRange {
    pub source_id: String,
    pub start_seconds: u64,
    pub end_seconds: u64,
}

impl TimeRange {
    pub fn duration_seconds(&self) -> u64 {
        self.end_seconds.saturating_sub(self.start_seconds)
    }
}

/// Yields the encoded-frame byte stream for a time range.
pub trait VideoSource: Send {
    /// Start producing bytes for `range`. Child processes started for it are
    /// handed to `guard`, which owns their shutdown.
    fn open(
        &mut self,
        range: &TimeRange,
        guard: &ProcessGuard,
    ) -> Result<Box<dyn Read + Send>, SourceError>;
}

struct GuardedChild {
    name: String,
    child: Child,
}

/// Shared owner of the subprocesses feeding one chunk.
///
/// Clones refer to the same set of children, so the acquisition stage and the
/// orchestrator can both stop them; stopping twice is harmless.
#[derive(Clone, Default)]
pub struct ProcessGuard {
    children: Arc<Mutex<Vec<GuardedChild>>>,
}

impl ProcessGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn adopt(&self, name: impl Into<String>, child: Child) {
        let name = name.into();
        debug!("👶 adopted {} (pid {})", name, child.id());
        self.lock().push(GuardedChild { name, child });
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait up to `timeout`, failing if any child exits unsuccessfully in that
    /// window. Children still running afterwards count as started.
    pub fn confirm_startup(&self, timeout: Duration) -> Result<(), SourceError> {
        let deadline = Instant::now() + timeout;
        loop {
            for guarded in self.lock().iter_mut() {
                if let Some(status) = guarded.child.try_wait()? {
                    if !status.success() {
                        return Err(SourceError::StartFailed(
                            guarded.name.clone(),
                            status.to_string(),
                        ));
                    }
                }
            }
            if Instant::now() >= deadline {
                return Ok(());
            }
            thread::sleep(CHILD_POLL_INTERVAL);
        }
    }

    /// After the stream hit EOF: give children `timeout` to exit on their own
    /// and report the first unsuccessful exit. Stragglers are terminated.
    pub fn wait_all(&self, timeout: Duration) -> Result<(), SourceError> {
        let deadline = Instant::now() + timeout;
        let mut failure = None;
        let mut children = self.lock();
        for guarded in children.iter_mut() {
            loop {
                match guarded.child.try_wait()? {
                    Some(status) => {
                        if !status.success() && failure.is_none() {
                            failure = Some(SourceError::Exited(
                                guarded.name.clone(),
                                status.to_string(),
                            ));
                        }
                        break;
                    }
                    None if Instant::now() >= deadline => {
                        warn!("⏱️ {} still running after end of stream", guarded.name);
                        break;
                    }
                    None => thread::sleep(CHILD_POLL_INTERVAL),
                }
            }
        }
        drop(children);
        self.terminate(Duration::ZERO);
        failure.map_or(Ok(()), Err)
    }

    /// Ask every running child to stop, then kill whatever is left after
    /// `grace`. Reaps all children.
    pub fn terminate(&self, grace: Duration) {
        let mut children = self.lock();
        for guarded in children.iter_mut() {
            if matches!(guarded.child.try_wait(), Ok(None)) {
                info!("🛑 terminating {}", guarded.name);
                request_stop(&mut guarded.child);
            }
        }

        let deadline = Instant::now() + grace;
        for guarded in children.iter_mut() {
            loop {
                match guarded.child.try_wait() {
                    Ok(Some(_)) => break,
                    Ok(None) if Instant::now() < deadline => thread::sleep(CHILD_POLL_INTERVAL),
                    Ok(None) | Err(_) => {
                        warn!("🔪 force killing {}", guarded.name);
                        let _ = guarded.child.kill();
                        let _ = guarded.child.wait();
                        break;
                    }
                }
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<GuardedChild>> {
        self.children.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(unix)]
fn request_stop(child: &mut Child) {
    // SIGTERM lets streamlink/ffmpeg close their pipes cleanly.
    let pid = child.id() as libc::pid_t;
    unsafe {
        libc::kill(pid, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn request_stop(child: &mut Child) {
    let _ = child.kill();
}

/// streamlink → ffmpeg chain: fetches the recording's HLS segments for the
/// range and samples them into an MJPEG pipe.
pub struct StreamlinkSource {
    config: SourceConfig,
    frame_rate: f64,
}

impl StreamlinkSource {
    pub fn new(config: SourceConfig, frame_rate: f64) -> Self {
        Self { config, frame_rate }
    }

    fn streamlink_command(&self, range: &TimeRange) -> Command {
        let url = self.config.vod_url_template.replace("{id}", &range.source_id);
        let mut cmd = Command::new(&self.config.streamlink_path);
        cmd.arg("--default-stream")
            .arg(&self.config.default_stream)
            .arg(url)
            .arg("--hls-start-offset")
            .arg(hms(range.start_seconds))
            .arg("--hls-duration")
            .arg(hms(range.duration_seconds()))
            .arg("--retry-streams")
            .arg(self.config.retry_streams_secs.to_string())
            .arg("--retry-max")
            .arg(self.config.retry_max.to_string())
            .arg("--quiet")
            .arg("-O");
        cmd
    }

    fn ffmpeg_command(&self) -> Command {
        let mut filter = format!("fps={}", self.frame_rate);
        if let Some(crop) = &self.config.crop_filter {
            filter.push(',');
            filter.push_str(crop);
        }

        let mut cmd = Command::new(&self.config.ffmpeg_path);
        cmd.arg("-hide_banner")
            .arg("-loglevel")
            .arg(&self.config.ffmpeg_loglevel);
        if self.config.keyframes_only {
            cmd.arg("-skip_frame").arg("nokey");
        }
        cmd.arg("-i")
            .arg("pipe:0")
            .arg("-vf")
            .arg(filter)
            .arg("-f")
            .arg("image2pipe")
            .arg("-vcodec")
            .arg("mjpeg")
            .arg("pipe:1");
        cmd
    }
}

impl VideoSource for StreamlinkSource {
    fn open(
        &mut self,
        range: &TimeRange,
        guard: &ProcessGuard,
    ) -> Result<Box<dyn Read + Send>, SourceError> {
        let mut streamlink_cmd = self.streamlink_command(range);
        info!(
            "📡 starting streamlink for {} [{}s-{}s]",
            range.source_id, range.start_seconds, range.end_seconds
        );
        let mut streamlink = streamlink_cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| SourceError::Spawn {
                program: self.config.streamlink_path.clone(),
                source,
            })?;
        let hls = streamlink.stdout.take().ok_or(SourceError::Pipe("streamlink"))?;
        guard.adopt("streamlink", streamlink);

        let mut ffmpeg = self
            .ffmpeg_command()
            .stdin(Stdio::from(hls))
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| SourceError::Spawn {
                program: self.config.ffmpeg_path.clone(),
                source,
            })?;
        let frames = ffmpeg.stdout.take().ok_or(SourceError::Pipe("ffmpeg"))?;
        guard.adopt("ffmpeg", ffmpeg);

        guard.confirm_startup(self.config.startup_timeout())?;
        info!("🎞️ ffmpeg sampling at {} fps", self.frame_rate);
        Ok(Box::new(frames))
    }
}

fn hms(seconds: u64) -> String {
    format!(
        "{:02}:{:02}:{:02}",
        seconds / 3600,
        (seconds % 3600) / 60,
        seconds % 60
    )
}

enum ReplayInput {
    Bytes(Vec<u8>),
    File(PathBuf),
}

/// Replays a recorded MJPEG dump (e.g. captured ffmpeg output) instead of
/// fetching the recording. The range is ignored; the dump is the chunk.
pub struct ReplaySource {
    input: ReplayInput,
}

impl ReplaySource {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            input: ReplayInput::Bytes(bytes),
        }
    }

    pub fn from_file(path: impl Into<PathBuf>) -> Self {
        Self {
            input: ReplayInput::File(path.into()),
        }
    }
}

impl VideoSource for ReplaySource {
    fn open(
        &mut self,
        _range: &TimeRange,
        _guard: &ProcessGuard,
    ) -> Result<Box<dyn Read + Send>, SourceError> {
        match &self.input {
            ReplayInput::Bytes(bytes) => Ok(Box::new(Cursor::new(bytes.clone()))),
            ReplayInput::File(path) => Ok(Box::new(File::open(path)?)),
        }
    }
}
