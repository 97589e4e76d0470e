//! Snapshot codec bridge: converts entities (+TTL) to and from
//! snapshot records and equivalent write commands. The byte layout
//! here is the engine's external snapshot contract.

use super::types::{PersistenceError, Result};
use crate::core::{Store, Value};
use serde::{Deserialize, Serialize};

pub const SNAPSHOT_MAGIC: &[u8; 8] = b"EMBER001";
const SNAPSHOT_VERSION: u8 = 1;

/// One serialized entity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub db_index: u32,
    pub key: String,
    pub value: Value,
    pub expires_at_ms: Option<u64>,
}

/// Convert an entity into the write command(s) that recreate it.
/// TTLs become an absolute PEXPIREAT so replay is time-independent.
pub fn value_to_commands(
    key: &str,
    value: &Value,
    expires_at_ms: Option<u64>,
) -> Vec<Vec<Vec<u8>>> {
    let key_bytes = key.as_bytes().to_vec();
    let rebuild: Vec<Vec<u8>> = match value {
        Value::Str(v) => vec![b"SET".to_vec(), key_bytes.clone(), v.clone()],
        Value::List(items) => {
            let mut line = vec![b"RPUSH".to_vec(), key_bytes.clone()];
            line.extend(items.iter().cloned());
            line
        }
        Value::Hash(fields) => {
            let mut line = vec![b"HSET".to_vec(), key_bytes.clone()];
            for (field, v) in fields {
                line.push(field.as_bytes().to_vec());
                line.push(v.clone());
            }
            line
        }
        Value::Set(members) => {
            let mut line = vec![b"SADD".to_vec(), key_bytes.clone()];
            line.extend(members.iter().cloned());
            line
        }
    };

    let mut lines = vec![rebuild];
    if let Some(at) = expires_at_ms {
        lines.push(vec![
            b"PEXPIREAT".to_vec(),
            key_bytes,
            at.to_string().into_bytes(),
        ]);
    }
    lines
}

fn push_record(out: &mut Vec<u8>, record: &SnapshotRecord) -> Result<()> {
    let data = bincode::serialize(record)?;
    let checksum = crc32fast::hash(&data);
    out.extend_from_slice(&(data.len() as u32).to_be_bytes());
    out.extend_from_slice(&checksum.to_be_bytes());
    out.extend_from_slice(&data);
    Ok(())
}

/// Serialize every live entity of the store.
/// Layout: magic, version byte, framed records, zero-length terminator.
pub fn encode_snapshot(store: &Store) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    out.extend_from_slice(SNAPSHOT_MAGIC);
    out.push(SNAPSHOT_VERSION);

    let mut error = None;
    for db_index in 0..store.db_count() {
        store.for_each_entity(db_index, |key, value, expires_at_ms| {
            if error.is_some() {
                return;
            }
            let record = SnapshotRecord {
                db_index: db_index as u32,
                key: key.to_string(),
                value: value.clone(),
                expires_at_ms,
            };
            if let Err(e) = push_record(&mut out, &record) {
                error = Some(e);
            }
        });
    }
    if let Some(e) = error {
        return Err(e);
    }

    out.extend_from_slice(&0u32.to_be_bytes());
    Ok(out)
}

/// True when `bytes` begins with a snapshot preamble
pub fn starts_with_snapshot(bytes: &[u8]) -> bool {
    bytes.len() >= SNAPSHOT_MAGIC.len() && &bytes[..SNAPSHOT_MAGIC.len()] == SNAPSHOT_MAGIC
}

fn read_u32(bytes: &[u8], pos: usize) -> Result<u32> {
    let end = pos + 4;
    if bytes.len() < end {
        return Err(PersistenceError::SnapshotCorrupted(
            "truncated frame header".to_string(),
        ));
    }
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[pos..end]);
    Ok(u32::from_be_bytes(raw))
}

/// Decode a snapshot at the front of `bytes`. Returns the records and
/// the number of bytes the snapshot occupies (so a command tail can be
/// replayed from there).
pub fn decode_snapshot_prefix(bytes: &[u8]) -> Result<(Vec<SnapshotRecord>, usize)> {
    if !starts_with_snapshot(bytes) {
        return Err(PersistenceError::SnapshotCorrupted(
            "bad magic".to_string(),
        ));
    }
    let mut pos = SNAPSHOT_MAGIC.len();
    let version = *bytes
        .get(pos)
        .ok_or_else(|| PersistenceError::SnapshotCorrupted("missing version".to_string()))?;
    if version != SNAPSHOT_VERSION {
        return Err(PersistenceError::SnapshotCorrupted(format!(
            "unsupported version {version}"
        )));
    }
    pos += 1;

    let mut records = Vec::new();
    loop {
        let len = read_u32(bytes, pos)? as usize;
        pos += 4;
        if len == 0 {
            return Ok((records, pos));
        }

        let expected = read_u32(bytes, pos)?;
        pos += 4;

        if bytes.len() < pos + len {
            return Err(PersistenceError::SnapshotCorrupted(
                "truncated record".to_string(),
            ));
        }
        let data = &bytes[pos..pos + len];
        let actual = crc32fast::hash(data);
        if actual != expected {
            return Err(PersistenceError::ChecksumMismatch { expected, actual });
        }
        records.push(bincode::deserialize(data)?);
        pos += len;
    }
}

/// Load decoded records into a store
pub fn apply_records(store: &Store, records: Vec<SnapshotRecord>) -> Result<()> {
    for record in records {
        let db_index = record.db_index as usize;
        if db_index >= store.db_count() {
            return Err(PersistenceError::SnapshotCorrupted(format!(
                "db index {db_index} out of range"
            )));
        }
        store.load_entry(db_index, record.key, record.value, record.expires_at_ms);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ConnCtx;

    fn line(parts: &[&str]) -> Vec<Vec<u8>> {
        parts.iter().map(|p| p.as_bytes().to_vec()).collect()
    }

    fn populated_store() -> Store {
        let store = Store::new(16);
        let mut ctx = ConnCtx::client();
        store.execute(&mut ctx, &line(&["SET", "s", "v"]));
        store.execute(&mut ctx, &line(&["RPUSH", "l", "a", "b"]));
        store.execute(&mut ctx, &line(&["HSET", "h", "f", "x"]));
        store.execute(&mut ctx, &line(&["SADD", "set", "m1", "m2"]));
        store.execute(&mut ctx, &line(&["SELECT", "2"]));
        store.execute(&mut ctx, &line(&["SET", "other", "db2"]));
        store
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let store = populated_store();
        let bytes = encode_snapshot(&store).unwrap();
        let (records, consumed) = decode_snapshot_prefix(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(records.len(), 5);

        let restored = Store::new(16);
        apply_records(&restored, records).unwrap();
        assert_eq!(restored.key_count(0), (4, 0));
        assert_eq!(restored.key_count(2), (1, 0));

        let mut ctx = ConnCtx::client();
        assert_eq!(
            restored.execute(&mut ctx, &line(&["GET", "s"])).reply,
            crate::core::Reply::Bulk(b"v".to_vec())
        );
    }

    #[test]
    fn test_snapshot_survives_command_tail() {
        let store = populated_store();
        let mut bytes = encode_snapshot(&store).unwrap();
        let snapshot_len = bytes.len();
        bytes.extend(crate::protocol::resp::encode_command(&line(&[
            "SET", "tail", "1",
        ])));

        let (_, consumed) = decode_snapshot_prefix(&bytes).unwrap();
        assert_eq!(consumed, snapshot_len);
    }

    #[test]
    fn test_corrupted_record_detected() {
        let store = populated_store();
        let mut bytes = encode_snapshot(&store).unwrap();
        // Flip a byte inside the first record's payload
        let target = SNAPSHOT_MAGIC.len() + 1 + 8 + 2;
        bytes[target] ^= 0xff;
        assert!(decode_snapshot_prefix(&bytes).is_err());
    }

    #[test]
    fn test_value_to_commands_rebuilds_entity() {
        let store = Store::new(16);
        let mut ctx = ConnCtx::client();
        store.execute(&mut ctx, &line(&["RPUSH", "l", "a", "b", "c"]));

        let mut lines = Vec::new();
        store.for_each_entity(0, |key, value, ttl| {
            lines.extend(value_to_commands(key, value, ttl));
        });
        assert_eq!(lines.len(), 1);

        let rebuilt = Store::new(16);
        let mut ctx = ConnCtx::primary_link();
        for cmd in lines {
            rebuilt.execute(&mut ctx, &cmd);
        }
        assert_eq!(
            rebuilt.execute(&mut ctx, &line(&["LRANGE", "l", "0", "-1"])).reply,
            store.execute(&mut ctx, &line(&["LRANGE", "l", "0", "-1"])).reply
        );
    }

    #[test]
    fn test_ttl_becomes_pexpireat() {
        let lines = value_to_commands("k", &Value::Str(b"v".to_vec()), Some(12345));
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1], line(&["PEXPIREAT", "k", "12345"]));
    }
}
