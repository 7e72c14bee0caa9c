//! Series registry: the append-only bijection between `(metric, labels)` and
//! the stable 64-bit series id, plus label matcher resolution.
//!
//! Persistence is a single record log (`metadata.db`). Records are
//! length + CRC32 framed; replay stops at the first damaged record, which
//! makes a torn tail after a crash harmless (the affected series simply gets
//! re-registered with the same key on its next write).

use crate::error::StoreError;
use crate::types::{canonical_labels, Labels, MatchOp, Matcher, SeriesId, Timestamp};

use crc32fast::Hasher as Crc32;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

const META_MAGIC: &[u8; 8] = b"STRMETA1";
const META_VERSION: u32 = 1;
const META_HEADER_LEN: u64 = 12;

/// Upper bounds applied at the write API.
pub const MAX_METRIC_LEN: usize = 255;
pub const MAX_LABEL_LEN: usize = 255;

/// One registered series. Immutable once assigned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesRecord {
    pub id: SeriesId,
    pub metric: String,
    pub labels: Labels,
    pub created_at: Timestamp,
}

#[derive(Debug, Default)]
struct RegistryIndex {
    /// (metric, canonical label blob) -> id
    by_key: HashMap<(String, String), SeriesId>,
    /// id -> position in `records`
    by_id: HashMap<SeriesId, usize>,
    records: Vec<Arc<SeriesRecord>>,
    /// metric -> positions in `records`
    by_metric: HashMap<String, Vec<usize>>,
    next_id: SeriesId,
}

impl RegistryIndex {
    fn insert(&mut self, record: Arc<SeriesRecord>) {
        let pos = self.records.len();
        self.by_key
            .insert((record.metric.clone(), canonical_labels(&record.labels)), record.id);
        self.by_id.insert(record.id, pos);
        self.by_metric
            .entry(record.metric.clone())
            .or_default()
            .push(pos);
        self.next_id = self.next_id.max(record.id + 1);
        self.records.push(record);
    }
}

/// Append-only series registry with an in-memory index for hot lookups.
#[derive(Debug)]
pub struct SeriesRegistry {
    path: PathBuf,
    index: RwLock<RegistryIndex>,
    writer: Mutex<BufWriter<File>>,
}

impl SeriesRegistry {
    /// Opens (or creates) the registry log and replays it into memory.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut index = RegistryIndex { next_id: 1, ..Default::default() };
        let mut valid_len = META_HEADER_LEN;
        let exists = path.exists();
        if exists {
            let mut f = File::open(&path)?;
            let mut header = [0u8; META_HEADER_LEN as usize];
            f.read_exact(&mut header)
                .map_err(|_| StoreError::CorruptWal("Truncated registry header".to_string()))?;
            if &header[..8] != META_MAGIC {
                return Err(StoreError::CorruptWal("Bad registry magic".to_string()));
            }
            let version = u32::from_le_bytes(header[8..12].try_into().unwrap());
            if version != META_VERSION {
                return Err(StoreError::Config(format!(
                    "Unsupported registry version {}",
                    version
                )));
            }

            loop {
                let mut frame = [0u8; 8];
                match f.read_exact(&mut frame) {
                    Ok(()) => {}
                    Err(_) => break,
                }
                let len = u32::from_le_bytes(frame[..4].try_into().unwrap()) as usize;
                let crc = u32::from_le_bytes(frame[4..8].try_into().unwrap());
                let mut payload = vec![0u8; len];
                if f.read_exact(&mut payload).is_err() {
                    break;
                }
                let mut hasher = Crc32::new();
                hasher.update(&payload);
                if hasher.finalize() != crc {
                    break;
                }
                let record: SeriesRecord = match bincode::deserialize(&payload) {
                    Ok(r) => r,
                    Err(_) => break,
                };
                index.insert(Arc::new(record));
                valid_len += 8 + len as u64;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;
        if !exists {
            file.write_all(META_MAGIC)?;
            file.write_all(&META_VERSION.to_le_bytes())?;
            file.sync_data()?;
        } else {
            // Drop any torn tail so appends continue from the last good record.
            let actual = file.metadata()?.len();
            if actual > valid_len {
                file.set_len(valid_len)?;
                file.sync_data()?;
            }
        }
        file.seek(SeekFrom::End(0))?;

        Ok(SeriesRegistry {
            path,
            index: RwLock::new(index),
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    /// Looks up the series id, assigning and persisting a new one on first
    /// sight. Assignment is atomic with respect to concurrent callers.
    pub fn get_or_create(
        &self,
        metric: &str,
        labels: &Labels,
        now: Timestamp,
    ) -> Result<SeriesId, StoreError> {
        let key = (metric.to_string(), canonical_labels(labels));
        {
            let idx = self.index.read()?;
            if let Some(&id) = idx.by_key.get(&key) {
                return Ok(id);
            }
        }

        let mut idx = self.index.write()?;
        if let Some(&id) = idx.by_key.get(&key) {
            return Ok(id);
        }
        let record = SeriesRecord {
            id: idx.next_id,
            metric: metric.to_string(),
            labels: labels.clone(),
            created_at: now,
        };

        // Persist before publishing: a crash between the two re-registers the
        // same key after restart, but never hands out an unpersisted id twice.
        let payload = bincode::serialize(&record)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let mut hasher = Crc32::new();
        hasher.update(&payload);
        let crc = hasher.finalize();
        {
            let mut w = self.writer.lock()?;
            w.write_all(&(payload.len() as u32).to_le_bytes())?;
            w.write_all(&crc.to_le_bytes())?;
            w.write_all(&payload)?;
            w.flush()?;
            w.get_ref().sync_data()?;
        }

        let id = record.id;
        idx.insert(Arc::new(record));
        Ok(id)
    }

    /// Returns the record for an id, if registered.
    pub fn get(&self, id: SeriesId) -> Option<Arc<SeriesRecord>> {
        let idx = self.index.read().ok()?;
        idx.by_id.get(&id).map(|&pos| Arc::clone(&idx.records[pos]))
    }

    /// Resolves all series of `metric` satisfying every matcher.
    pub fn resolve(
        &self,
        metric: &str,
        matchers: &[Matcher],
    ) -> Result<Vec<Arc<SeriesRecord>>, StoreError> {
        let compiled = compile_matchers(matchers)?;
        let idx = self.index.read()?;
        let Some(positions) = idx.by_metric.get(metric) else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        for &pos in positions {
            let record = &idx.records[pos];
            if compiled.iter().all(|m| m.matches(&record.labels)) {
                out.push(Arc::clone(record));
            }
        }
        out.sort_by_key(|r| r.id);
        Ok(out)
    }

    pub fn list_metrics(&self) -> Result<Vec<String>, StoreError> {
        let idx = self.index.read()?;
        let mut out: Vec<String> = idx.by_metric.keys().cloned().collect();
        out.sort();
        Ok(out)
    }

    pub fn list_label_values(&self, name: &str) -> Result<Vec<String>, StoreError> {
        let idx = self.index.read()?;
        let mut out: Vec<String> = idx
            .records
            .iter()
            .filter_map(|r| r.labels.get(name).cloned())
            .collect();
        out.sort();
        out.dedup();
        Ok(out)
    }

    pub fn list_series(&self, metric: &str) -> Result<Vec<Labels>, StoreError> {
        let idx = self.index.read()?;
        let Some(positions) = idx.by_metric.get(metric) else {
            return Ok(Vec::new());
        };
        Ok(positions.iter().map(|&p| idx.records[p].labels.clone()).collect())
    }

    pub fn series_count(&self) -> usize {
        self.index.read().map(|idx| idx.records.len()).unwrap_or(0)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

// --- matcher evaluation ---

enum CompiledMatcher {
    Eq { name: String, value: String },
    Ne { name: String, value: String },
    Re { name: String, re: Regex, negate: bool },
}

impl CompiledMatcher {
    fn matches(&self, labels: &Labels) -> bool {
        match self {
            CompiledMatcher::Eq { name, value } => {
                labels.get(name).map(|v| v == value).unwrap_or(value.is_empty())
            }
            CompiledMatcher::Ne { name, value } => {
                !labels.get(name).map(|v| v == value).unwrap_or(value.is_empty())
            }
            CompiledMatcher::Re { name, re, negate } => {
                let hit = labels.get(name).map(|v| re.is_match(v)).unwrap_or_else(|| re.is_match(""));
                hit != *negate
            }
        }
    }
}

fn compile_matchers(matchers: &[Matcher]) -> Result<Vec<CompiledMatcher>, StoreError> {
    matchers
        .iter()
        .map(|m| match m.op {
            MatchOp::Eq => Ok(CompiledMatcher::Eq { name: m.name.clone(), value: m.value.clone() }),
            MatchOp::Ne => Ok(CompiledMatcher::Ne { name: m.name.clone(), value: m.value.clone() }),
            MatchOp::Re | MatchOp::NotRe => {
                // Anchored full match, Prometheus style.
                let re = Regex::new(&format!("^(?:{})$", m.value)).map_err(|e| {
                    StoreError::InvalidInput(format!("invalid matcher regex {:?}: {}", m.value, e))
                })?;
                Ok(CompiledMatcher::Re {
                    name: m.name.clone(),
                    re,
                    negate: m.op == MatchOp::NotRe,
                })
            }
        })
        .collect()
}

// --- input validation (applied at the write API) ---

pub fn validate_metric(metric: &str) -> Result<(), StoreError> {
    if metric.is_empty() || metric.len() > MAX_METRIC_LEN {
        return Err(StoreError::InvalidInput(format!(
            "metric name must be 1..={} bytes",
            MAX_METRIC_LEN
        )));
    }
    if metric.chars().any(|c| c.is_control()) {
        return Err(StoreError::InvalidInput(
            "metric name must not contain control characters".to_string(),
        ));
    }
    Ok(())
}

pub fn validate_labels(labels: &Labels) -> Result<(), StoreError> {
    for (k, v) in labels {
        if k.is_empty() || k.len() > MAX_LABEL_LEN || v.len() > MAX_LABEL_LEN {
            return Err(StoreError::InvalidInput(format!(
                "label {:?} out of bounds (name 1..={} bytes, value <= {} bytes)",
                k, MAX_LABEL_LEN, MAX_LABEL_LEN
            )));
        }
        if k.chars().any(|c| c.is_control()) || v.chars().any(|c| c.is_control()) {
            return Err(StoreError::InvalidInput(
                "labels must not contain control characters".to_string(),
            ));
        }
    }
    Ok(())
}
