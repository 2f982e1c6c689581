//! Metadata store: `VectorId → Metadata` with inverted lookups.
//!
//! Equality lookups go through an inverted index keyed by field name and
//! the value's canonical string form; the value level is a `BTreeMap` so
//! prefix queries are range scans rather than full scans. Upsert replaces
//! the whole entry and keeps the inverted index consistent.
//!
//! A metadata entry may outlive or predate its vector; callers joining
//! the two sides tolerate absence on either.

use crate::config;
use crate::error::{Error, Result};
use crate::store::persistence::{atomic_write, read_framed, write_framed};
use crate::types::{Metadata, MetadataValue, VectorId};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

const METADATA_MAGIC: &[u8; 4] = b"MMD1";

const TAG_STR: u8 = 0;
const TAG_INT: u8 = 1;
const TAG_FLOAT: u8 = 2;
const TAG_BOOL: u8 = 3;

#[derive(Default, Debug)]
struct Inner {
    entries: HashMap<VectorId, Metadata>,
    /// field → canonical value → IDs in upsert order.
    inverted: HashMap<String, BTreeMap<String, Vec<VectorId>>>,
}

impl Inner {
    fn index_entry(&mut self, id: VectorId, metadata: &Metadata) {
        for (key, value) in metadata {
            self.inverted
                .entry(key.clone())
                .or_default()
                .entry(value.canonical())
                .or_default()
                .push(id);
        }
    }

    fn unindex_entry(&mut self, id: VectorId, metadata: &Metadata) {
        for (key, value) in metadata {
            let mut drop_field = false;
            if let Some(values) = self.inverted.get_mut(key) {
                let canonical = value.canonical();
                let mut drop_value = false;
                if let Some(ids) = values.get_mut(&canonical) {
                    ids.retain(|&existing| existing != id);
                    drop_value = ids.is_empty();
                }
                if drop_value {
                    values.remove(&canonical);
                }
                drop_field = values.is_empty();
            }
            if drop_field {
                self.inverted.remove(key);
            }
        }
    }

    fn set(&mut self, id: VectorId, metadata: Metadata) {
        if let Some(previous) = self.entries.remove(&id) {
            self.unindex_entry(id, &previous);
        }
        self.index_entry(id, &metadata);
        self.entries.insert(id, metadata);
    }
}

/// Thread-safe metadata store.
#[derive(Default, Debug)]
pub struct MetadataStore {
    inner: RwLock<Inner>,
}

fn validate_metadata(metadata: &Metadata) -> Result<()> {
    if metadata.len() > config::MAX_METADATA_KEYS {
        return Err(Error::InputSizeMismatch(format!(
            "too many metadata fields: {} (max {})",
            metadata.len(),
            config::MAX_METADATA_KEYS
        )));
    }
    for (key, value) in metadata {
        if key.is_empty() {
            return Err(Error::InputSizeMismatch("metadata key cannot be empty".into()));
        }
        if key.len() > config::MAX_METADATA_KEY_LEN {
            return Err(Error::InputSizeMismatch(format!(
                "metadata key '{}…' too long (max {})",
                &key[..16.min(key.len())],
                config::MAX_METADATA_KEY_LEN
            )));
        }
        if let MetadataValue::Str(s) = value {
            if s.len() > config::MAX_METADATA_VALUE_LEN {
                return Err(Error::InputSizeMismatch(format!(
                    "metadata value under '{key}' too long (max {})",
                    config::MAX_METADATA_VALUE_LEN
                )));
            }
        }
    }
    Ok(())
}

impl MetadataStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert metadata for an ID, replacing any previous entry.
    pub fn set(&self, id: VectorId, metadata: Metadata) -> Result<()> {
        validate_metadata(&metadata)?;
        self.inner.write().set(id, metadata);
        Ok(())
    }

    /// Batch upsert over aligned ID/metadata slices.
    pub fn set_batch(&self, ids: &[VectorId], metadata: Vec<Metadata>) -> Result<()> {
        if ids.len() != metadata.len() {
            return Err(Error::InputSizeMismatch(format!(
                "{} ids vs {} metadata entries",
                ids.len(),
                metadata.len()
            )));
        }
        for m in &metadata {
            validate_metadata(m)?;
        }
        let mut inner = self.inner.write();
        for (&id, m) in ids.iter().zip(metadata.into_iter()) {
            inner.set(id, m);
        }
        Ok(())
    }

    /// Fetch by ID. Absence is `None`, never an error.
    pub fn get(&self, id: VectorId) -> Option<Metadata> {
        self.inner.read().entries.get(&id).cloned()
    }

    /// Aligned batch fetch; `None` marks absent entries.
    pub fn get_batch(&self, ids: &[VectorId]) -> Vec<Option<Metadata>> {
        let inner = self.inner.read();
        ids.iter().map(|id| inner.entries.get(id).cloned()).collect()
    }

    /// Whether an entry exists for the ID.
    pub fn has(&self, id: VectorId) -> bool {
        self.inner.read().entries.contains_key(&id)
    }

    /// Delete by ID, cleaning the inverted index. Returns `true` when an
    /// entry existed.
    pub fn remove(&self, id: VectorId) -> bool {
        let mut inner = self.inner.write();
        match inner.entries.remove(&id) {
            Some(metadata) => {
                inner.unindex_entry(id, &metadata);
                true
            }
            None => false,
        }
    }

    /// IDs whose value under `key` equals `value`, deduplicated, in upsert
    /// order.
    pub fn find_by_metadata(&self, key: &str, value: &MetadataValue) -> Vec<VectorId> {
        self.inner
            .read()
            .inverted
            .get(key)
            .and_then(|values| values.get(&value.canonical()))
            .cloned()
            .unwrap_or_default()
    }

    /// IDs whose canonical value under `key` starts with `prefix`.
    /// Ordered by value, then upsert order within each value.
    pub fn find_by_metadata_prefix(&self, key: &str, prefix: &str) -> Vec<VectorId> {
        let inner = self.inner.read();
        let mut out = Vec::new();
        if let Some(values) = inner.inverted.get(key) {
            for (value, ids) in values.range(prefix.to_string()..) {
                if !value.starts_with(prefix) {
                    break;
                }
                for &id in ids {
                    if !out.contains(&id) {
                        out.push(id);
                    }
                }
            }
        }
        out
    }

    /// Candidate IDs whose metadata passes the predicate. IDs without
    /// metadata never pass.
    pub fn filter_ids<F>(&self, candidates: &[VectorId], predicate: F) -> Vec<VectorId>
    where
        F: Fn(&Metadata) -> bool,
    {
        let inner = self.inner.read();
        candidates
            .iter()
            .filter(|&&id| inner.entries.get(&id).is_some_and(&predicate))
            .copied()
            .collect()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Distinct key set across all entries, sorted.
    pub fn all_keys(&self) -> Vec<String> {
        let inner = self.inner.read();
        let mut keys: Vec<String> = inner.inverted.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Drop every entry.
    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.entries.clear();
        inner.inverted.clear();
    }

    /// Persist to `path`:
    /// `[count][for each: id, key-count, (key-len, key-bytes, value-tag, value-bytes)…]`
    /// little-endian, framed with magic and CRC32.
    pub fn save(&self, path: &Path) -> Result<()> {
        let inner = self.inner.read();
        let mut payload = Vec::new();
        payload.extend_from_slice(&(inner.entries.len() as u64).to_le_bytes());
        // Sort by ID so the artifact is byte-stable across runs.
        let mut ids: Vec<VectorId> = inner.entries.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            let metadata = &inner.entries[&id];
            payload.extend_from_slice(&id.to_le_bytes());
            payload.extend_from_slice(&(metadata.len() as u64).to_le_bytes());
            let mut keys: Vec<&String> = metadata.keys().collect();
            keys.sort();
            for key in keys {
                payload.extend_from_slice(&(key.len() as u64).to_le_bytes());
                payload.extend_from_slice(key.as_bytes());
                match &metadata[key] {
                    MetadataValue::Str(s) => {
                        payload.push(TAG_STR);
                        payload.extend_from_slice(&(s.len() as u64).to_le_bytes());
                        payload.extend_from_slice(s.as_bytes());
                    }
                    MetadataValue::Int(i) => {
                        payload.push(TAG_INT);
                        payload.extend_from_slice(&i.to_le_bytes());
                    }
                    MetadataValue::Float(f) => {
                        payload.push(TAG_FLOAT);
                        payload.extend_from_slice(&f.to_le_bytes());
                    }
                    MetadataValue::Bool(b) => {
                        payload.push(TAG_BOOL);
                        payload.push(u8::from(*b));
                    }
                }
            }
        }
        let mut framed = Vec::with_capacity(payload.len() + 16);
        write_framed(&mut framed, METADATA_MAGIC, &payload)?;
        atomic_write(path, &framed)?;
        tracing::info!(entries = inner.entries.len(), path = %path.display(), "metadata store saved");
        Ok(())
    }

    /// Restore from `path`, replacing the current contents. A corrupt file
    /// leaves the store untouched.
    pub fn load(&self, path: &Path) -> Result<()> {
        let bytes = std::fs::read(path)?;
        let payload = read_framed(&mut bytes.as_slice(), METADATA_MAGIC)?;
        let mut reader = payload.as_slice();

        let mut fresh = Inner::default();
        let count = read_u64(&mut reader)?;
        for _ in 0..count {
            let id = read_u64(&mut reader)?;
            let key_count = read_u64(&mut reader)? as usize;
            let mut metadata = Metadata::with_capacity(key_count);
            for _ in 0..key_count {
                let key = read_string(&mut reader)?;
                let tag = read_u8(&mut reader)?;
                let value = match tag {
                    TAG_STR => MetadataValue::Str(read_string(&mut reader)?),
                    TAG_INT => MetadataValue::Int(i64::from_le_bytes(read_array(&mut reader)?)),
                    TAG_FLOAT => MetadataValue::Float(f64::from_le_bytes(read_array(&mut reader)?)),
                    TAG_BOOL => MetadataValue::Bool(read_u8(&mut reader)? != 0),
                    other => {
                        return Err(Error::Corruption(format!("unknown metadata value tag {other}")))
                    }
                };
                metadata.insert(key, value);
            }
            fresh.set(id, metadata);
        }
        if !reader.is_empty() {
            return Err(Error::Corruption("trailing bytes after metadata entries".into()));
        }

        *self.inner.write() = fresh;
        tracing::info!(entries = count, path = %path.display(), "metadata store loaded");
        Ok(())
    }
}

fn read_u8(reader: &mut &[u8]) -> Result<u8> {
    let (&byte, rest) = reader
        .split_first()
        .ok_or_else(|| Error::Corruption("truncated metadata stream".into()))?;
    *reader = rest;
    Ok(byte)
}

fn read_u64(reader: &mut &[u8]) -> Result<u64> {
    Ok(u64::from_le_bytes(read_array(reader)?))
}

fn read_array<const N: usize>(reader: &mut &[u8]) -> Result<[u8; N]> {
    if reader.len() < N {
        return Err(Error::Corruption("truncated metadata stream".into()));
    }
    let (head, rest) = reader.split_at(N);
    *reader = rest;
    let mut out = [0u8; N];
    out.copy_from_slice(head);
    Ok(out)
}

fn read_string(reader: &mut &[u8]) -> Result<String> {
    let len = read_u64(reader)? as usize;
    if reader.len() < len {
        return Err(Error::Corruption("truncated metadata string".into()));
    }
    let (head, rest) = reader.split_at(len);
    *reader = rest;
    String::from_utf8(head.to_vec())
        .map_err(|_| Error::Corruption("metadata string is not valid UTF-8".into()))
}
