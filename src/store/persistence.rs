//! On-disk artifact encoding.
//!
//! Three kinds of artifacts exist: framed binary blobs (ANN index and
//! metadata snapshots — 4-byte magic, length, payload, CRC32 footer),
//! fixed-layout little-endian tables (the ID/embedding table and the
//! row-order sequence), and the plain-text `key=value` config file.
//! Writes go through a temp file and rename so a crash never leaves a
//! half-written artifact in place.

use crate::distance::DistanceMetric;
use crate::error::{Error, Result};
use crate::types::{DatabaseConfig, IndexKind, Vector, VectorId};
use std::fs;
use std::io::{Read, Write};
use std::path::Path;

/// Write a framed blob: `[magic 4B][len u64 LE][payload][crc32 u32 LE]`.
pub(crate) fn write_framed(writer: &mut dyn Write, magic: &[u8; 4], payload: &[u8]) -> Result<()> {
    writer.write_all(magic)?;
    writer.write_all(&(payload.len() as u64).to_le_bytes())?;
    writer.write_all(payload)?;
    let crc = crc32fast::hash(payload);
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// Read and verify a framed blob written by [`write_framed`].
pub(crate) fn read_framed(reader: &mut dyn Read, magic: &[u8; 4]) -> Result<Vec<u8>> {
    let mut head = [0u8; 4];
    reader
        .read_exact(&mut head)
        .map_err(|_| Error::Corruption("truncated blob: missing magic".into()))?;
    if &head != magic {
        return Err(Error::Corruption(format!(
            "bad magic: expected {:?}, got {:?}",
            magic, head
        )));
    }
    let len = read_u64(reader)? as usize;
    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .map_err(|_| Error::Corruption("truncated blob payload".into()))?;
    let mut crc_bytes = [0u8; 4];
    reader
        .read_exact(&mut crc_bytes)
        .map_err(|_| Error::Corruption("truncated blob: missing checksum".into()))?;
    let stored = u32::from_le_bytes(crc_bytes);
    let computed = crc32fast::hash(&payload);
    if stored != computed {
        return Err(Error::Corruption(format!(
            "checksum mismatch: stored {stored:#010x}, computed {computed:#010x}"
        )));
    }
    tracing::debug!(len, crc = stored, "blob checksum verified");
    Ok(payload)
}

fn read_u64(reader: &mut dyn Read) -> Result<u64> {
    let mut buf = [0u8; 8];
    reader
        .read_exact(&mut buf)
        .map_err(|_| Error::Corruption("truncated stream: expected u64".into()))?;
    Ok(u64::from_le_bytes(buf))
}

fn read_f32(reader: &mut dyn Read) -> Result<f32> {
    let mut buf = [0u8; 4];
    reader
        .read_exact(&mut buf)
        .map_err(|_| Error::Corruption("truncated stream: expected f32".into()))?;
    Ok(f32::from_le_bytes(buf))
}

/// Atomic write: temp file in the same directory, then rename over the target.
pub(crate) fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Encode the ID/embedding table:
/// `[u64 count][for each: u64 id, u64 len, f32×len]`, little-endian.
pub fn write_id_table(path: &Path, entries: &[(VectorId, &[f32])]) -> Result<()> {
    let payload_len: usize = 8 + entries.iter().map(|(_, v)| 16 + v.len() * 4).sum::<usize>();
    let mut out = Vec::with_capacity(payload_len);
    out.extend_from_slice(&(entries.len() as u64).to_le_bytes());
    for (id, vector) in entries {
        out.extend_from_slice(&id.to_le_bytes());
        out.extend_from_slice(&(vector.len() as u64).to_le_bytes());
        for value in *vector {
            out.extend_from_slice(&value.to_le_bytes());
        }
    }
    atomic_write(path, &out)
}

/// Decode the ID/embedding table written by [`write_id_table`].
pub fn read_id_table(path: &Path) -> Result<Vec<(VectorId, Vector)>> {
    let bytes = fs::read(path)?;
    let mut reader = bytes.as_slice();
    let count = read_u64(&mut reader)? as usize;
    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        let id = read_u64(&mut reader)?;
        if id == 0 {
            return Err(Error::Corruption("id table contains the reserved id 0".into()));
        }
        let len = read_u64(&mut reader)? as usize;
        let mut vector = Vec::with_capacity(len);
        for _ in 0..len {
            vector.push(read_f32(&mut reader)?);
        }
        entries.push((id, vector));
    }
    Ok(entries)
}

/// Encode the row-to-ID sequence: `[u64 count][u64×count]`, little-endian.
pub fn write_order(path: &Path, rows: &[VectorId]) -> Result<()> {
    let mut out = Vec::with_capacity(8 + rows.len() * 8);
    out.extend_from_slice(&(rows.len() as u64).to_le_bytes());
    for id in rows {
        out.extend_from_slice(&id.to_le_bytes());
    }
    atomic_write(path, &out)
}

/// Decode the row-to-ID sequence written by [`write_order`].
pub fn read_order(path: &Path) -> Result<Vec<VectorId>> {
    let bytes = fs::read(path)?;
    let mut reader = bytes.as_slice();
    let count = read_u64(&mut reader)? as usize;
    let mut rows = Vec::with_capacity(count);
    for _ in 0..count {
        rows.push(read_u64(&mut reader)?);
    }
    if !reader.is_empty() {
        return Err(Error::Corruption("trailing bytes after row-order sequence".into()));
    }
    Ok(rows)
}

/// Write the plain-text config artifact: one `key=value` per line.
pub fn write_config_file(path: &Path, config: &DatabaseConfig) -> Result<()> {
    let text = format!(
        "dimension={}\nindex_type={}\nmetric={}\nnlist={}\nm={}\nnbits={}\nM={}\nefConstruction={}\n",
        config.dimension,
        config.index_kind,
        config.metric,
        config.nlist,
        config.pq_m,
        config.pq_nbits,
        config.hnsw_m,
        config.hnsw_ef_construction,
    );
    atomic_write(path, text.as_bytes())
}

/// Read the config artifact written by [`write_config_file`].
pub fn read_config_file(path: &Path) -> Result<DatabaseConfig> {
    let text = fs::read_to_string(path)?;
    let mut config = DatabaseConfig::default();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (key, value) = line
            .split_once('=')
            .ok_or_else(|| Error::Corruption(format!("malformed config line '{line}'")))?;
        match key {
            "dimension" => {
                config.dimension = value
                    .parse()
                    .map_err(|_| Error::Corruption(format!("bad dimension '{value}'")))?;
            }
            "index_type" => {
                config.index_kind = value.parse::<IndexKind>().map_err(|_| {
                    Error::Corruption(format!("bad index_type '{value}'"))
                })?;
            }
            "metric" => {
                config.metric = DistanceMetric::parse(value)
                    .ok_or_else(|| Error::Corruption(format!("bad metric '{value}'")))?;
            }
            "nlist" => {
                config.nlist = value
                    .parse()
                    .map_err(|_| Error::Corruption(format!("bad nlist '{value}'")))?;
            }
            "m" => {
                config.pq_m = value
                    .parse()
                    .map_err(|_| Error::Corruption(format!("bad m '{value}'")))?;
            }
            "nbits" => {
                config.pq_nbits = value
                    .parse()
                    .map_err(|_| Error::Corruption(format!("bad nbits '{value}'")))?;
            }
            "M" => {
                config.hnsw_m = value
                    .parse()
                    .map_err(|_| Error::Corruption(format!("bad M '{value}'")))?;
            }
            "efConstruction" => {
                config.hnsw_ef_construction = value
                    .parse()
                    .map_err(|_| Error::Corruption(format!("bad efConstruction '{value}'")))?;
            }
            other => {
                tracing::warn!(key = other, "ignoring unknown config key");
            }
        }
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_framed_roundtrip() {
        let mut buf = Vec::new();
        write_framed(&mut buf, b"TST1", b"hello world").unwrap();
        let payload = read_framed(&mut buf.as_slice(), b"TST1").unwrap();
        assert_eq!(payload, b"hello world");
    }

    #[test]
    fn test_framed_wrong_magic() {
        let mut buf = Vec::new();
        write_framed(&mut buf, b"TST1", b"payload").unwrap();
        let err = read_framed(&mut buf.as_slice(), b"TST2").unwrap_err();
        assert!(matches!(err, Error::Corruption(_)));
    }

    #[test]
    fn test_framed_corrupted_payload() {
        let mut buf = Vec::new();
        write_framed(&mut buf, b"TST1", b"payload").unwrap();
        // Flip a payload byte; the CRC must catch it
        buf[14] ^= 0xFF;
        let err = read_framed(&mut buf.as_slice(), b"TST1").unwrap_err();
        assert!(matches!(err, Error::Corruption(_)));
    }

    #[test]
    fn test_framed_truncated() {
        let mut buf = Vec::new();
        write_framed(&mut buf, b"TST1", b"payload").unwrap();
        buf.truncate(buf.len() - 3);
        let err = read_framed(&mut buf.as_slice(), b"TST1").unwrap_err();
        assert!(matches!(err, Error::Corruption(_)));
    }

    #[test]
    fn test_id_table_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.vectors.ids");
        let v1 = vec![1.0f32, 2.0, 3.0];
        let v2 = vec![-0.5f32, 0.25];
        write_id_table(&path, &[(1, v1.as_slice()), (7, v2.as_slice())]).unwrap();
        let entries = read_id_table(&path).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0], (1, v1));
        assert_eq!(entries[1], (7, v2));
    }

    #[test]
    fn test_id_table_rejects_reserved_id() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.ids");
        let v = vec![1.0f32];
        write_id_table(&path, &[(0, v.as_slice())]).unwrap();
        assert!(matches!(read_id_table(&path), Err(Error::Corruption(_))));
    }

    #[test]
    fn test_id_table_truncated() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("trunc.ids");
        let v = vec![1.0f32, 2.0];
        write_id_table(&path, &[(3, v.as_slice())]).unwrap();
        let mut bytes = std::fs::read(&path).unwrap();
        bytes.truncate(bytes.len() - 2);
        std::fs::write(&path, &bytes).unwrap();
        assert!(matches!(read_id_table(&path), Err(Error::Corruption(_))));
    }

    #[test]
    fn test_order_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.vectors.order");
        write_order(&path, &[3, 1, 2]).unwrap();
        assert_eq!(read_order(&path).unwrap(), vec![3, 1, 2]);
    }

    #[test]
    fn test_order_trailing_bytes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("extra.order");
        write_order(&path, &[1]).unwrap();
        let mut bytes = std::fs::read(&path).unwrap();
        bytes.push(0xAB);
        std::fs::write(&path, &bytes).unwrap();
        assert!(matches!(read_order(&path), Err(Error::Corruption(_))));
    }

    #[test]
    fn test_config_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.config");
        let mut config = DatabaseConfig::with_dimension(64);
        config.index_kind = IndexKind::IvfPq;
        config.metric = DistanceMetric::Cosine;
        config.nlist = 32;
        config.pq_m = 16;
        write_config_file(&path, &config).unwrap();
        let loaded = read_config_file(&path).unwrap();
        assert_eq!(loaded.dimension, 64);
        assert_eq!(loaded.index_kind, IndexKind::IvfPq);
        assert_eq!(loaded.metric, DistanceMetric::Cosine);
        assert_eq!(loaded.nlist, 32);
        assert_eq!(loaded.pq_m, 16);
    }

    #[test]
    fn test_config_malformed_line() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.config");
        std::fs::write(&path, "dimension 64\n").unwrap();
        assert!(matches!(read_config_file(&path), Err(Error::Corruption(_))));
    }
}
