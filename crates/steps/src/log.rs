//! Step log backends.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use relay_domain::{Error, Result};

/// One recorded step output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub run_id: String,
    pub step_key: String,
    pub value: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

/// Persistence for step outputs, keyed by `(run_id, step_key)`.
#[async_trait]
pub trait StepLog: Send + Sync {
    async fn load(&self, run_id: &str, step_key: &str) -> Result<Option<serde_json::Value>>;

    async fn record(&self, run_id: &str, step_key: &str, value: serde_json::Value) -> Result<()>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// In-memory log
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
pub struct MemoryStepLog {
    records: Mutex<HashMap<(String, String), serde_json::Value>>,
}

impl MemoryStepLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[async_trait]
impl StepLog for MemoryStepLog {
    async fn load(&self, run_id: &str, step_key: &str) -> Result<Option<serde_json::Value>> {
        Ok(self
            .records
            .lock()
            .get(&(run_id.to_string(), step_key.to_string()))
            .cloned())
    }

    async fn record(&self, run_id: &str, step_key: &str, value: serde_json::Value) -> Result<()> {
        self.records
            .lock()
            .insert((run_id.to_string(), step_key.to_string()), value);
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// JSONL log
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Append-only JSONL log. Records are replayed into memory at open, so a
/// process restart sees every step the previous run completed. Later records
/// for the same key win, which makes appends naturally idempotent.
pub struct JsonlStepLog {
    path: PathBuf,
    records: Mutex<HashMap<(String, String), serde_json::Value>>,
}

impl JsonlStepLog {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut records = HashMap::new();
        if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            for line in raw.lines().filter(|l| !l.trim().is_empty()) {
                match serde_json::from_str::<StepRecord>(line) {
                    Ok(rec) => {
                        records.insert((rec.run_id, rec.step_key), rec.value);
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "skipping corrupt step record");
                    }
                }
            }
        }

        tracing::debug!(steps = records.len(), path = %path.display(), "step log opened");

        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    fn append(&self, record: &StepRecord) -> Result<()> {
        let line = serde_json::to_string(record)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{line}").map_err(Error::Io)?;
        Ok(())
    }
}

#[async_trait]
impl StepLog for JsonlStepLog {
    async fn load(&self, run_id: &str, step_key: &str) -> Result<Option<serde_json::Value>> {
        Ok(self
            .records
            .lock()
            .get(&(run_id.to_string(), step_key.to_string()))
            .cloned())
    }

    async fn record(&self, run_id: &str, step_key: &str, value: serde_json::Value) -> Result<()> {
        let record = StepRecord {
            run_id: run_id.to_string(),
            step_key: step_key.to_string(),
            value: value.clone(),
            recorded_at: Utc::now(),
        };
        self.append(&record)?;
        self.records
            .lock()
            .insert((record.run_id, record.step_key), value);
        Ok(())
    }
}
