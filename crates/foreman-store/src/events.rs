//! Append-only JSONL event log.
//!
//! One JSON object per line, fsynced before the append returns. Consumers
//! read the most recent N lines without parsing the whole file.

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde_json::Value;

use crate::lock::FileLock;
use crate::models::{new_id, now, Event};
use crate::repo::{StoreError, StoreResult};

/// How far back the tail reader scans per chunk.
const TAIL_CHUNK: u64 = 8 * 1024;

/// The append-only chronological record of state transitions.
#[derive(Debug)]
pub struct EventLog {
    path: PathBuf,
    lock: FileLock,
    mutex: Mutex<()>,
    project_id: String,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>, project_id: impl Into<String>) -> Self {
        let path = path.into();
        let lock_path = path.with_extension("lock");
        Self {
            path,
            lock: FileLock::new(lock_path),
            mutex: Mutex::new(()),
            project_id: project_id.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event and fsync before returning.
    pub fn append(
        &self,
        channel: &str,
        event_type: &str,
        entity_id: &str,
        payload: Value,
    ) -> StoreResult<Event> {
        let event = Event {
            id: new_id("evt"),
            ts: now(),
            channel: channel.to_string(),
            event_type: event_type.to_string(),
            entity_id: entity_id.to_string(),
            payload,
            project_id: self.project_id.clone(),
        };

        let line = serde_json::to_string(&event).map_err(|e| StoreError::Io {
            path: self.path.clone(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
        })?;

        let _guard = self.mutex.lock().unwrap_or_else(|e| e.into_inner());
        let _file_guard = self.lock.acquire().map_err(|e| StoreError::Io {
            path: self.path.clone(),
            source: e,
        })?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Io {
                path: self.path.clone(),
                source: e,
            })?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| StoreError::Io {
                path: self.path.clone(),
                source: e,
            })?;
        file.write_all(line.as_bytes())
            .and_then(|_| file.write_all(b"\n"))
            .and_then(|_| file.sync_all())
            .map_err(|e| StoreError::Io {
                path: self.path.clone(),
                source: e,
            })?;

        Ok(event)
    }

    /// The most recent `limit` events, oldest first.
    ///
    /// Reads backwards in fixed-size chunks until enough newline-delimited
    /// records are in view; malformed lines are skipped.
    pub fn tail(&self, limit: usize) -> StoreResult<Vec<Event>> {
        if limit == 0 || !self.path.exists() {
            return Ok(Vec::new());
        }

        let _guard = self.mutex.lock().unwrap_or_else(|e| e.into_inner());
        let mut file = std::fs::File::open(&self.path).map_err(|e| StoreError::Io {
            path: self.path.clone(),
            source: e,
        })?;
        let len = file
            .metadata()
            .map_err(|e| StoreError::Io {
                path: self.path.clone(),
                source: e,
            })?
            .len();

        let mut buf: Vec<u8> = Vec::new();
        let mut pos = len;
        while pos > 0 {
            let chunk = TAIL_CHUNK.min(pos);
            pos -= chunk;
            file.seek(SeekFrom::Start(pos)).map_err(|e| StoreError::Io {
                path: self.path.clone(),
                source: e,
            })?;
            let mut chunk_buf = vec![0u8; chunk as usize];
            file.read_exact(&mut chunk_buf).map_err(|e| StoreError::Io {
                path: self.path.clone(),
                source: e,
            })?;
            chunk_buf.extend_from_slice(&buf);
            buf = chunk_buf;

            let complete_lines = buf.iter().filter(|&&b| b == b'\n').count();
            if complete_lines > limit {
                break;
            }
        }

        let text = String::from_utf8_lossy(&buf);
        let mut events: Vec<Event> = text
            .lines()
            .filter_map(|line| serde_json::from_str::<Event>(line).ok())
            .collect();
        if events.len() > limit {
            events.drain(..events.len() - limit);
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn log(dir: &TempDir) -> EventLog {
        EventLog::new(dir.path().join("events.jsonl"), "proj-test")
    }

    #[test]
    fn append_then_tail_round_trips_payload() {
        let dir = TempDir::new().unwrap();
        let events = log(&dir);

        let payload = json!({"status": "ready", "nested": {"k": [1, 2, 3]}});
        let appended = events
            .append("tasks", "task.created", "task-1", payload.clone())
            .unwrap();

        let tail = events.tail(10).unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].id, appended.id);
        assert_eq!(tail[0].event_type, "task.created");
        assert_eq!(tail[0].payload, payload);
        assert_eq!(tail[0].project_id, "proj-test");
    }

    #[test]
    fn tail_returns_most_recent_oldest_first() {
        let dir = TempDir::new().unwrap();
        let events = log(&dir);

        for i in 0..25 {
            events
                .append("queue", "task.claimed", &format!("task-{i}"), json!({"i": i}))
                .unwrap();
        }

        let tail = events.tail(10).unwrap();
        assert_eq!(tail.len(), 10);
        assert_eq!(tail[0].entity_id, "task-15");
        assert_eq!(tail[9].entity_id, "task-24");
    }

    #[test]
    fn tail_of_empty_log_is_empty() {
        let dir = TempDir::new().unwrap();
        let events = log(&dir);
        assert!(events.tail(10).unwrap().is_empty());
        assert!(events.tail(0).unwrap().is_empty());
    }

    #[test]
    fn tail_skips_malformed_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("events.jsonl");
        let events = EventLog::new(&path, "proj-test");
        events.append("system", "boot", "coord", json!({})).unwrap();

        // Inject a torn write between two good records.
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(b"{\"truncated\": \n").unwrap();
        }
        events.append("system", "tick", "coord", json!({})).unwrap();

        let tail = events.tail(10).unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].event_type, "boot");
        assert_eq!(tail[1].event_type, "tick");
    }

    #[test]
    fn tail_handles_large_logs_without_full_parse() {
        let dir = TempDir::new().unwrap();
        let events = log(&dir);
        for i in 0..500 {
            events
                .append("tasks", "task.updated", &format!("task-{i}"), json!({"i": i}))
                .unwrap();
        }
        let tail = events.tail(3).unwrap();
        assert_eq!(tail.len(), 3);
        assert_eq!(tail[2].entity_id, "task-499");
    }
}
