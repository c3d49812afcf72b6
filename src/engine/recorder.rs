use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::time::Instant;

/// One Task's snapshot timeline.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RecordingSession {
    pub req_id: String,
    pub stream: bool,
    /// Prompt as submitted to the backend
    pub prompt: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub snapshots: Vec<RecordedSnapshot>,
}

/// Single raw snapshot with timing info
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RecordedSnapshot {
    pub data: String,
    /// Milliseconds since submission
    pub timestamp_ms: u64,
}

/// Appends snapshot timelines to a JSON array file, for tuning the
/// completion detector offline.
pub struct SnapshotRecorder {
    file_path: PathBuf,
    write_lock: Mutex<()>,
}

/// Recording shared by the snapshot readers of one Task.
pub type SharedRecording = Arc<Mutex<ActiveRecording>>;

/// In-flight recording, owned by the running Task.
pub struct ActiveRecording {
    session: RecordingSession,
    start_time: Instant,
}

impl ActiveRecording {
    /// Record a snapshot if it differs from the previous one.
    pub fn record(&mut self, data: &str) {
        if self.session.snapshots.last().map(|s| s.data.as_str()) == Some(data) {
            return;
        }
        self.session.snapshots.push(RecordedSnapshot {
            data: data.to_string(),
            timestamp_ms: self.start_time.elapsed().as_millis() as u64,
        });
    }
}

impl SnapshotRecorder {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            file_path: path.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn start(&self, req_id: &str, stream: bool, prompt: &str) -> ActiveRecording {
        ActiveRecording {
            session: RecordingSession {
                req_id: req_id.to_string(),
                stream,
                prompt: prompt.to_string(),
                timestamp: chrono::Utc::now(),
                snapshots: Vec::new(),
            },
            start_time: Instant::now(),
        }
    }

    /// Append the finished session to the recording file.
    pub fn finish(&self, recording: &ActiveRecording) -> Result<()> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| anyhow::anyhow!("Recording lock poisoned"))?;

        let mut sessions: Vec<RecordingSession> = match std::fs::read_to_string(&self.file_path) {
            Ok(content) if !content.trim().is_empty() => serde_json::from_str(&content)
                .context("Existing recording file is not a JSON array of sessions")?,
            Ok(_) => Vec::new(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e).context("Failed to read recording file"),
        };
        sessions.push(recording.session.clone());

        let json = serde_json::to_string_pretty(&sessions)?;
        std::fs::write(&self.file_path, json).context("Failed to write recording file")?;
        Ok(())
    }

    /// Load all recorded sessions from a file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Vec<RecordingSession>> {
        let content =
            std::fs::read_to_string(path.as_ref()).context("Failed to read recording file")?;
        serde_json::from_str(&content).context("Failed to parse recording file")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn sessions_accumulate_in_one_array() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recording.json");
        let recorder = SnapshotRecorder::new(&path);

        let mut first = recorder.start("abc1234", true, "prompt one");
        first.record("");
        tokio::time::advance(std::time::Duration::from_millis(200)).await;
        first.record("Hel");
        first.record("Hel");
        tokio::time::advance(std::time::Duration::from_millis(200)).await;
        first.record("Hello");
        recorder.finish(&first).unwrap();

        let second = recorder.start("def5678", false, "prompt two");
        recorder.finish(&second).unwrap();

        let sessions = SnapshotRecorder::load(&path).unwrap();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].req_id, "abc1234");
        let data: Vec<_> = sessions[0].snapshots.iter().map(|s| s.data.as_str()).collect();
        assert_eq!(data, vec!["", "Hel", "Hello"]);
        assert_eq!(sessions[0].snapshots[2].timestamp_ms, 400);
        assert!(sessions[1].snapshots.is_empty());
    }
}
