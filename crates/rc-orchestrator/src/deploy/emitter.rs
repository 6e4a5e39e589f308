//! Deployment event emission
//!
//! An [`EventSink`] is the only way a deployment reports anything. It keeps
//! phase and progress updates monotonic, masks secrets in every line, mirrors
//! lines into the transcript file, and never fails: once the client has gone
//! away events are dropped and the run carries on.

use std::fs::{File, OpenOptions};
use std::io::{LineWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use rc_core::time::{file_timestamp, iso_timestamp};
use rc_core::Redactor;
use rc_protocol::{
    DeployEvent, DeployFailure, DeployResult, Heartbeat, LogEntry, LogLevel, Phase, PhaseTracker,
};

/// Sanitized on-disk record of one deployment
///
/// Lines are written synchronously on the emitting task, in event order. Each
/// write is one short append to a local file.
pub struct Transcript {
    path: PathBuf,
    file: Mutex<LineWriter<File>>,
}

impl Transcript {
    /// Create `<dir>/<timestamp>_<server_name>.log`
    pub fn create(dir: &Path, server_name: &str) -> std::io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}_{}.log", file_timestamp(), server_name));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(LineWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_line(&self, line: &str) {
        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = writeln!(file, "{}", line) {
            tracing::debug!("Failed to write transcript {}: {}", self.path.display(), e);
        }
    }
}

/// Emits deployment events to one client
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<DeployEvent>,
    tracker: Arc<Mutex<PhaseTracker>>,
    redactor: Arc<Redactor>,
    transcript: Option<Arc<Transcript>>,
}

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<DeployEvent>, redactor: Redactor) -> Self {
        Self {
            tx,
            tracker: Arc::new(Mutex::new(PhaseTracker::new())),
            redactor: Arc::new(redactor),
            transcript: None,
        }
    }

    /// Sink plus the receiving end of its event stream
    pub fn channel(redactor: Redactor) -> (Self, mpsc::UnboundedReceiver<DeployEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx, redactor), rx)
    }

    /// Also write every line to `transcript`
    pub fn with_transcript(mut self, transcript: Transcript) -> Self {
        self.transcript = Some(Arc::new(transcript));
        self
    }

    /// Open a transcript in `dir`, degrading to none on failure
    pub fn with_transcript_in(self, dir: &Path, server_name: &str) -> Self {
        match Transcript::create(dir, server_name) {
            Ok(transcript) => {
                tracing::debug!("Writing transcript to {}", transcript.path().display());
                self.with_transcript(transcript)
            }
            Err(e) => {
                tracing::warn!(
                    "Failed to create deployment transcript in {}: {}",
                    dir.display(),
                    e
                );
                self
            }
        }
    }

    pub fn transcript_path(&self) -> Option<&Path> {
        self.transcript.as_deref().map(Transcript::path)
    }

    /// Phase of the most recent phase event
    pub fn current_phase(&self) -> Option<Phase> {
        self.tracker().current()
    }

    /// Emit a log line tagged with the current phase
    pub fn log(&self, level: LogLevel, message: &str) {
        let phase = self.current_phase();
        self.log_in(level, message, phase);
    }

    /// Emit a log line tagged with `phase`
    pub fn log_in(&self, level: LogLevel, message: &str, phase: Option<Phase>) {
        let message = self.redactor.redact(message).into_owned();
        tracing::debug!("[deploy] {}: {}", level.as_str(), message);

        let timestamp = iso_timestamp();
        self.record(&format!(
            "[{}] [{}] {}",
            timestamp,
            level.as_str().to_uppercase(),
            message
        ));
        self.send(DeployEvent::Log(LogEntry {
            timestamp,
            level,
            message,
            phase,
        }));
    }

    /// Announce `phase`; returns false when it does not move the run forward
    pub fn phase(&self, phase: Phase) -> bool {
        let update = self.tracker().advance(phase);
        match update {
            Some(update) => {
                self.record(&format!(
                    "[PHASE] {} ({}/{})",
                    update.label, update.step, update.total_steps
                ));
                self.send(DeployEvent::Phase(update));
                true
            }
            None => false,
        }
    }

    /// Report overall progress; lower values than already reported are dropped
    pub fn progress(&self, percent: u8) {
        let update = self.tracker().progress(percent);
        if let Some(update) = update {
            self.send(DeployEvent::Progress(update));
        }
    }

    pub fn heartbeat(&self) {
        self.send(DeployEvent::Heartbeat(Heartbeat {}));
    }

    /// Terminal success event
    pub fn success(&self, result: DeployResult) {
        self.record(&format!(
            "=== Deployment finished successfully at {} ({} at {}) ===",
            iso_timestamp(),
            result.server_name,
            result.ip
        ));
        self.send(DeployEvent::Success(result));
    }

    /// Terminal error event
    pub fn failure(&self, mut failure: DeployFailure) {
        failure.message = self.redactor.redact(&failure.message).into_owned();
        self.record(&format!("ERROR: {}", failure.message));
        self.record(&format!("=== Deployment failed at {} ===", iso_timestamp()));
        self.send(DeployEvent::Error(failure));
    }

    /// Write a line to the transcript only
    pub fn note(&self, line: &str) {
        self.record(line);
    }

    /// Emit heartbeats every `interval` until the returned handle is stopped
    pub fn start_heartbeat(&self, interval: Duration) -> HeartbeatHandle {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let sink = self.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => sink.heartbeat(),
                }
            }
        });

        HeartbeatHandle { cancel, task }
    }

    fn tracker(&self) -> std::sync::MutexGuard<'_, PhaseTracker> {
        self.tracker.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record(&self, line: &str) {
        if let Some(transcript) = &self.transcript {
            transcript.write_line(&self.redactor.redact(line));
        }
    }

    fn send(&self, event: DeployEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("Deployment client disconnected; dropping event");
        }
    }
}

/// Running heartbeat task
pub struct HeartbeatHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl HeartbeatHandle {
    /// Stop the heartbeat; no heartbeat is emitted after this returns
    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}
