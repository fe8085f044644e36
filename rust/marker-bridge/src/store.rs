// marker-bridge: persistent job/sequence store
//
// One JSON document (`job_store.json`) holding everything the controller
// knows about jobs and sequences. A job's Id is assigned once, on first
// write, and never regenerated; CreatedAt survives every later update.
// Access is single-writer, last-writer-wins.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use marker_protocol::JobFields;

use crate::error::{BridgeError, BridgeResult};

/// ISO-8601 UTC at seconds precision with a trailing `Z`.
pub fn iso_now() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Random 24-lowercase-hex identifier, assigned to a job on first write.
pub fn new_object_id() -> String {
    let bytes: [u8; 12] = rand::random();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Persisted job model, serialized with the device-facing field names.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobRecord {
    #[serde(rename = "Id", default)]
    pub id: String,
    #[serde(rename = "JobNumber", default)]
    pub job_number: u32,
    #[serde(rename = "JobName", default)]
    pub job_name: String,
    #[serde(rename = "CharacterString", default)]
    pub character_string: String,
    #[serde(rename = "StartX", default)]
    pub start_x: f64,
    #[serde(rename = "StartY", default)]
    pub start_y: f64,
    #[serde(rename = "PitchX", default)]
    pub pitch_x: f64,
    #[serde(rename = "PitchY", default)]
    pub pitch_y: f64,
    #[serde(rename = "Size", default)]
    pub size: f64,
    #[serde(rename = "Speed", default)]
    pub speed: i32,
    #[serde(rename = "Direction", default)]
    pub direction: i32,
    #[serde(rename = "CreatedAt", default)]
    pub created_at: String,
    #[serde(rename = "LastRunAt", default)]
    pub last_run_at: String,
    /// Device round-trip fields the controller does not model.
    #[serde(rename = "_raw_tail", default)]
    pub raw_tail: Vec<String>,
}

impl JobRecord {
    /// The wire-facing subset of this record.
    pub fn fields(&self) -> JobFields {
        JobFields {
            size: self.size,
            direction: self.direction,
            speed: self.speed,
            start_x: self.start_x,
            start_y: self.start_y,
            pitch_x: self.pitch_x,
            pitch_y: self.pitch_y,
            character_string: self.character_string.clone(),
        }
    }

    /// Overwrite the mutable wire-facing fields from a parsed device reply.
    pub fn apply_fields(&mut self, fields: &JobFields) {
        self.size = fields.size;
        self.direction = fields.direction;
        self.speed = fields.speed;
        self.start_x = fields.start_x;
        self.start_y = fields.start_y;
        self.pitch_x = fields.pitch_x;
        self.pitch_y = fields.pitch_y;
        self.character_string = fields.character_string.clone();
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceRecord {
    pub index: u32,
    #[serde(rename = "commandString")]
    pub command_string: String,
    #[serde(rename = "updatedAt")]
    pub updated_at: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreDoc {
    #[serde(default)]
    jobs: BTreeMap<String, JobRecord>,
    #[serde(default)]
    sequences: BTreeMap<String, SequenceRecord>,
}

/// Persistence contract for jobs and sequences.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Return the job's stable Id, assigning one on first call.
    async fn ensure_job_id(&self, job_number: u32) -> BridgeResult<String>;

    async fn get_job(&self, job_number: u32) -> BridgeResult<Option<JobRecord>>;

    /// Store a job record. An already-assigned Id and CreatedAt always win
    /// over whatever the incoming record carries.
    async fn put_job(&self, job_number: u32, job: JobRecord) -> BridgeResult<()>;

    async fn put_sequence(&self, index: u32, command_string: &str) -> BridgeResult<()>;
}

/// JSON-file implementation of [`JobStore`].
pub struct JsonFileStore {
    path: PathBuf,
    doc: parking_lot::Mutex<StoreDoc>,
}

impl JsonFileStore {
    /// Load the store document, or start empty when the file is missing or
    /// unreadable (matching how the controller has always treated a
    /// corrupt store: recoverable, not fatal).
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let doc = std::fs::read_to_string(&path)
            .ok()
            .and_then(|content| serde_json::from_str(&content).ok())
            .unwrap_or_default();
        Self {
            path,
            doc: parking_lot::Mutex::new(doc),
        }
    }

    fn persist(&self, doc: &StoreDoc) -> BridgeResult<()> {
        let content = serde_json::to_string_pretty(doc)
            .map_err(|e| BridgeError::InternalInvariant(e.to_string()))?;
        std::fs::write(&self.path, content)
            .map_err(|e| BridgeError::Os(format!("write store {}: {e}", self.path.display())))
    }
}

#[async_trait]
impl JobStore for JsonFileStore {
    async fn ensure_job_id(&self, job_number: u32) -> BridgeResult<String> {
        let mut doc = self.doc.lock();
        let key = job_number.to_string();
        let entry = doc.jobs.entry(key).or_insert_with(|| JobRecord {
            job_number,
            created_at: iso_now(),
            last_run_at: iso_now(),
            ..JobRecord::default()
        });
        if entry.id.is_empty() {
            entry.id = new_object_id();
            debug!(job = job_number, id = %entry.id, "assigned job id");
        }
        let id = entry.id.clone();
        self.persist(&doc)?;
        Ok(id)
    }

    async fn get_job(&self, job_number: u32) -> BridgeResult<Option<JobRecord>> {
        let doc = self.doc.lock();
        Ok(doc.jobs.get(&job_number.to_string()).cloned())
    }

    async fn put_job(&self, job_number: u32, mut job: JobRecord) -> BridgeResult<()> {
        let mut doc = self.doc.lock();
        let key = job_number.to_string();
        if let Some(existing) = doc.jobs.get(&key) {
            if !existing.id.is_empty() {
                job.id = existing.id.clone();
            }
            if !existing.created_at.is_empty() {
                job.created_at = existing.created_at.clone();
            }
        }
        if job.id.is_empty() {
            job.id = new_object_id();
        }
        if job.created_at.is_empty() {
            job.created_at = iso_now();
        }
        job.job_number = job_number;
        doc.jobs.insert(key, job);
        self.persist(&doc)
    }

    async fn put_sequence(&self, index: u32, command_string: &str) -> BridgeResult<()> {
        let mut doc = self.doc.lock();
        doc.sequences.insert(
            index.to_string(),
            SequenceRecord {
                index,
                command_string: command_string.to_string(),
                updated_at: iso_now(),
            },
        );
        self.persist(&doc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> (tempfile::TempDir, JsonFileStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = JsonFileStore::open(dir.path().join("job_store.json"));
        (dir, store)
    }

    #[test]
    fn object_ids_are_24_lowercase_hex() {
        let id = new_object_id();
        assert_eq!(id.len(), 24);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn iso_now_shape() {
        let ts = iso_now();
        assert_eq!(ts.len(), 20);
        assert!(ts.ends_with('Z'));
        assert_eq!(&ts[4..5], "-");
    }

    #[tokio::test]
    async fn ensure_job_id_is_idempotent() {
        let (_dir, store) = temp_store();
        let first = store.ensure_job_id(20).await.expect("first");
        let second = store.ensure_job_id(20).await.expect("second");
        assert_eq!(first, second);
        assert_ne!(first, store.ensure_job_id(21).await.expect("other job"));
    }

    #[tokio::test]
    async fn id_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("job_store.json");
        let id = {
            let store = JsonFileStore::open(&path);
            store.ensure_job_id(5).await.expect("assign")
        };
        let store = JsonFileStore::open(&path);
        assert_eq!(store.ensure_job_id(5).await.expect("reload"), id);
    }

    #[tokio::test]
    async fn put_job_preserves_id_and_created_at() {
        let (_dir, store) = temp_store();
        let id = store.ensure_job_id(7).await.expect("assign");
        let created = store
            .get_job(7)
            .await
            .expect("get")
            .expect("exists")
            .created_at
            .clone();

        let incoming = JobRecord {
            id: "feedfacefeedfacefeedface".to_string(),
            created_at: "1999-01-01T00:00:00Z".to_string(),
            character_string: "ABC".to_string(),
            ..JobRecord::default()
        };
        store.put_job(7, incoming).await.expect("put");

        let stored = store.get_job(7).await.expect("get").expect("exists");
        assert_eq!(stored.id, id, "Id never changes once assigned");
        assert_eq!(stored.created_at, created);
        assert_eq!(stored.character_string, "ABC");
        assert_eq!(stored.job_number, 7);
    }

    #[tokio::test]
    async fn sequences_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("job_store.json");
        {
            let store = JsonFileStore::open(&path);
            store.put_sequence(3, "J1 J2 J3").await.expect("put");
        }
        let content = std::fs::read_to_string(&path).expect("read");
        let doc: serde_json::Value = serde_json::from_str(&content).expect("parse");
        assert_eq!(doc["sequences"]["3"]["commandString"], "J1 J2 J3");
        assert_eq!(doc["sequences"]["3"]["index"], 3);
    }

    #[test]
    fn corrupt_store_file_starts_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("job_store.json");
        std::fs::write(&path, "{not json").expect("write");
        let store = JsonFileStore::open(&path);
        assert!(store.doc.lock().jobs.is_empty());
    }
}
