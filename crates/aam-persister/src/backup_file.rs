//! The on-disk fallback journal backing [`crate::EventSink::Redundant`].
//!
//! Wire format per record (`spec.md` §6): `kind_tag(u8), event_id(16B),
//! action(u8), occurred_time(i64 micros since epoch), hash_code(i32),
//! payload(length-prefixed bytes)`. Records are framed by their own
//! `payload_len` rather than a newline delimiter, since the JSON payload may
//! itself contain arbitrary bytes — a line-delimited text format would be
//! ambiguous for that field.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::fs::OpenOptions;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use uuid::Uuid;

use aam_types::error::AamError;
use aam_types::event::{Action, Event, EventKind};

fn encode_event(event: &Event) -> Result<Vec<u8>, AamError> {
    let payload = serde_json::to_vec(&event.kind).map_err(|e| AamError::StorageFault(format!("encode backup record: {e}")))?;
    let mut buf = Vec::with_capacity(1 + 16 + 1 + 8 + 4 + 4 + payload.len());
    buf.push(event.kind.tag());
    buf.extend_from_slice(event.event_id.as_bytes());
    buf.push(if event.action == Action::Add { 0 } else { 1 });
    buf.extend_from_slice(&event.occurred_time.timestamp_micros().to_be_bytes());
    buf.extend_from_slice(&event.hash_code.to_be_bytes());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

fn decode_events(bytes: &[u8]) -> Result<Vec<Event>, AamError> {
    let mut events = Vec::new();
    let mut cursor = 0usize;
    while cursor < bytes.len() {
        let header_len = 1 + 16 + 1 + 8 + 4 + 4;
        if cursor + header_len > bytes.len() {
            return Err(AamError::StorageFault("truncated backup record header".into()));
        }
        let _kind_tag = bytes[cursor];
        cursor += 1;
        let event_id = Uuid::from_slice(&bytes[cursor..cursor + 16])
            .map_err(|e| AamError::StorageFault(format!("invalid backup event id: {e}")))?;
        cursor += 16;
        let action = if bytes[cursor] == 0 { Action::Add } else { Action::Remove };
        cursor += 1;
        let occurred_micros = i64::from_be_bytes(bytes[cursor..cursor + 8].try_into().unwrap());
        cursor += 8;
        let hash_code = i32::from_be_bytes(bytes[cursor..cursor + 4].try_into().unwrap());
        cursor += 4;
        let payload_len = u32::from_be_bytes(bytes[cursor..cursor + 4].try_into().unwrap()) as usize;
        cursor += 4;
        if cursor + payload_len > bytes.len() {
            return Err(AamError::StorageFault("truncated backup record payload".into()));
        }
        let kind: EventKind = serde_json::from_slice(&bytes[cursor..cursor + payload_len])
            .map_err(|e| AamError::StorageFault(format!("decode backup record payload: {e}")))?;
        cursor += payload_len;

        let occurred_time = chrono::DateTime::from_timestamp_micros(occurred_micros)
            .ok_or_else(|| AamError::StorageFault("invalid backup occurred_time".into()))?;
        let mut event = Event::new(event_id, kind, action, occurred_time);
        event.hash_code = hash_code;
        events.push(event);
    }
    Ok(events)
}

/// A local append-only journal of not-yet-durably-committed events, used by
/// [`crate::EventSink::Redundant`] as a fallback when the primary store is
/// unavailable. Cheap to clone: all clones share the same path and a single
/// write-serializing lock.
#[derive(Clone)]
pub struct BackupEventFile {
    path: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl BackupEventFile {
    /// Points a new backup file handle at `path`. The file itself is created
    /// lazily on first [`Self::append`].
    pub fn new(path: PathBuf) -> Self {
        Self { path, write_lock: Arc::new(Mutex::new(())) }
    }

    /// Appends `events`, in order, to the journal.
    pub async fn append(&self, events: &[Event]) -> Result<(), AamError> {
        if events.is_empty() {
            return Ok(());
        }
        let _guard = self.write_lock.lock().await;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| AamError::StorageFault(format!("open backup file: {e}")))?;
        for event in events {
            let record = encode_event(event)?;
            file.write_all(&record).await.map_err(|e| AamError::StorageFault(format!("write backup record: {e}")))?;
        }
        file.flush().await.map_err(|e| AamError::StorageFault(format!("flush backup file: {e}")))?;
        Ok(())
    }

    /// Reads every pending record, in order. Returns an empty vec if the
    /// file does not exist yet.
    pub async fn read_all(&self) -> Result<Vec<Event>, AamError> {
        let _guard = self.write_lock.lock().await;
        let mut file = match OpenOptions::new().read(true).open(&self.path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(AamError::StorageFault(format!("open backup file for read: {e}"))),
        };
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes).await.map_err(|e| AamError::StorageFault(format!("read backup file: {e}")))?;
        decode_events(&bytes)
    }

    /// Truncates the journal to empty after a successful replay.
    pub async fn truncate(&self) -> Result<(), AamError> {
        let _guard = self.write_lock.lock().await;
        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)
            .await
            .map_err(|e| AamError::StorageFault(format!("truncate backup file: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aam_types::event::Action;
    use chrono::Utc;

    fn user_event(user: &str) -> Event {
        Event::new(Uuid::new_v4(), EventKind::User { user: user.to_string() }, Action::Add, Utc::now())
    }

    #[tokio::test]
    async fn roundtrip_preserves_order_and_fields() {
        let dir = tempfile::tempdir().unwrap();
        let file = BackupEventFile::new(dir.path().join("backup.log"));
        let a = user_event("alice");
        let b = user_event("bob");
        file.append(&[a.clone(), b.clone()]).await.unwrap();

        let read_back = file.read_all().await.unwrap();
        assert_eq!(read_back.len(), 2);
        assert_eq!(read_back[0].event_id, a.event_id);
        assert_eq!(read_back[0].kind, a.kind);
        assert_eq!(read_back[0].hash_code, a.hash_code);
        assert_eq!(read_back[1].event_id, b.event_id);
    }

    #[tokio::test]
    async fn truncate_clears_pending_records() {
        let dir = tempfile::tempdir().unwrap();
        let file = BackupEventFile::new(dir.path().join("backup.log"));
        file.append(&[user_event("alice")]).await.unwrap();
        file.truncate().await.unwrap();
        assert!(file.read_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn read_all_on_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let file = BackupEventFile::new(dir.path().join("never-written.log"));
        assert!(file.read_all().await.unwrap().is_empty());
    }
}
