//! Mechanical per-type command handlers. The durability and
//! replication machinery treats these as opaque: it only sees the
//! accepted command lines reported back through `Exec::writes`.

use super::error::{Result, StoreError};
use super::store::Exec;
use super::types::{now_ms, Database, Entry, Reply, Value};
use std::collections::{BTreeSet, HashMap, VecDeque};

/// Commands that mutate the keyspace
pub fn is_write_command(name: &str) -> bool {
    matches!(
        name,
        "SET" | "DEL" | "PEXPIREAT" | "HSET" | "RPUSH" | "LPUSH" | "SADD" | "FLUSHDB"
    )
}

pub fn dispatch(db: &mut Database, name: &str, args: &[Vec<u8>]) -> Result<Exec> {
    match name {
        "SET" => set(db, args),
        "GET" => get(db, args),
        "DEL" => del(db, args),
        "EXISTS" => exists(db, args),
        "PEXPIREAT" => pexpireat(db, args),
        "PTTL" => pttl(db, args),
        "HSET" => hset(db, args),
        "HGET" => hget(db, args),
        "HGETALL" => hgetall(db, args),
        "RPUSH" => push(db, args, false),
        "LPUSH" => push(db, args, true),
        "LRANGE" => lrange(db, args),
        "SADD" => sadd(db, args),
        "SMEMBERS" => smembers(db, args),
        "DBSIZE" => dbsize(db, args),
        "FLUSHDB" => flushdb(db, args),
        _ => Err(StoreError::UnknownCommand(name.to_ascii_lowercase())),
    }
}

fn read(reply: Reply) -> Exec {
    Exec {
        reply,
        writes: Vec::new(),
    }
}

fn write(reply: Reply, lines: Vec<Vec<Vec<u8>>>) -> Exec {
    Exec {
        reply,
        writes: lines,
    }
}

fn key_of(args: &[Vec<u8>], index: usize, name: &str) -> Result<String> {
    args.get(index)
        .map(|k| String::from_utf8_lossy(k).into_owned())
        .ok_or_else(|| StoreError::WrongArity(name.to_ascii_lowercase()))
}

fn int_of(arg: &[u8]) -> Result<i64> {
    std::str::from_utf8(arg)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or(StoreError::NotAnInteger)
}

pub fn parse_index(args: &[Vec<u8>]) -> Result<usize> {
    if args.len() != 2 {
        return Err(StoreError::WrongArity("select".to_string()));
    }
    let index = int_of(&args[1])?;
    usize::try_from(index).map_err(|_| StoreError::InvalidDbIndex)
}

/// Fetch a live entry, dropping it first if it has expired
fn live<'a>(db: &'a mut Database, key: &str) -> Option<&'a mut Entry> {
    let expired = matches!(db.get(key), Some(e) if e.is_expired(now_ms()));
    if expired {
        db.remove(key);
        return None;
    }
    db.get_mut(key)
}

fn command_line(parts: &[&[u8]]) -> Vec<Vec<u8>> {
    parts.iter().map(|p| p.to_vec()).collect()
}

/// Drop an expired entry, then create the key with `empty` if absent.
/// Returns the entry's value for type checking by the caller.
fn ensure_value<'a>(db: &'a mut Database, key: &str, empty: fn() -> Value) -> &'a mut Value {
    let expired = matches!(db.get(key), Some(e) if e.is_expired(now_ms()));
    if expired {
        db.remove(key);
    }
    if !db.contains_key(key) {
        db.insert(key.to_string(), Entry::new(empty()));
    }
    &mut db.get_mut(key).expect("key just ensured").value
}

fn set(db: &mut Database, args: &[Vec<u8>]) -> Result<Exec> {
    if args.len() != 3 && args.len() != 5 {
        return Err(StoreError::WrongArity("set".to_string()));
    }
    let key = key_of(args, 1, "set")?;
    let value = args[2].clone();

    // Relative expirations are translated to an absolute PEXPIREAT for
    // propagation so replay is time-independent.
    let mut expires_at_ms = None;
    if args.len() == 5 {
        let unit = String::from_utf8_lossy(&args[3]).to_ascii_uppercase();
        let amount = int_of(&args[4])?;
        if amount <= 0 {
            return Err(StoreError::NotAnInteger);
        }
        let millis = match unit.as_str() {
            "EX" => (amount as u64) * 1000,
            "PX" => amount as u64,
            _ => return Err(StoreError::WrongArity("set".to_string())),
        };
        expires_at_ms = Some(now_ms() + millis);
    }

    db.insert(
        key.clone(),
        Entry {
            value: Value::Str(value.clone()),
            expires_at_ms,
        },
    );

    let mut lines = vec![command_line(&[b"SET", key.as_bytes(), &value])];
    if let Some(at) = expires_at_ms {
        lines.push(command_line(&[
            b"PEXPIREAT",
            key.as_bytes(),
            at.to_string().as_bytes(),
        ]));
    }
    Ok(write(Reply::ok(), lines))
}

fn get(db: &mut Database, args: &[Vec<u8>]) -> Result<Exec> {
    let key = key_of(args, 1, "get")?;
    match live(db, &key) {
        Some(entry) => match &entry.value {
            Value::Str(v) => Ok(read(Reply::Bulk(v.clone()))),
            _ => Err(StoreError::WrongType),
        },
        None => Ok(read(Reply::Nil)),
    }
}

fn del(db: &mut Database, args: &[Vec<u8>]) -> Result<Exec> {
    if args.len() < 2 {
        return Err(StoreError::WrongArity("del".to_string()));
    }
    let mut removed = 0;
    for raw in &args[1..] {
        let key = String::from_utf8_lossy(raw).into_owned();
        if live(db, &key).is_some() {
            db.remove(&key);
            removed += 1;
        }
    }
    if removed == 0 {
        return Ok(read(Reply::Integer(0)));
    }
    Ok(write(Reply::Integer(removed), vec![args.to_vec()]))
}

fn exists(db: &mut Database, args: &[Vec<u8>]) -> Result<Exec> {
    if args.len() < 2 {
        return Err(StoreError::WrongArity("exists".to_string()));
    }
    let mut found = 0;
    for raw in &args[1..] {
        let key = String::from_utf8_lossy(raw).into_owned();
        if live(db, &key).is_some() {
            found += 1;
        }
    }
    Ok(read(Reply::Integer(found)))
}

fn pexpireat(db: &mut Database, args: &[Vec<u8>]) -> Result<Exec> {
    if args.len() != 3 {
        return Err(StoreError::WrongArity("pexpireat".to_string()));
    }
    let key = key_of(args, 1, "pexpireat")?;
    let at = int_of(&args[2])?;
    let at = u64::try_from(at).map_err(|_| StoreError::NotAnInteger)?;

    match live(db, &key) {
        Some(entry) => {
            entry.expires_at_ms = Some(at);
            // An already-past deadline deletes immediately
            if entry.is_expired(now_ms()) {
                db.remove(&key);
            }
            Ok(write(Reply::Integer(1), vec![args.to_vec()]))
        }
        None => Ok(read(Reply::Integer(0))),
    }
}

fn pttl(db: &mut Database, args: &[Vec<u8>]) -> Result<Exec> {
    let key = key_of(args, 1, "pttl")?;
    match live(db, &key) {
        Some(entry) => match entry.expires_at_ms {
            Some(at) => Ok(read(Reply::Integer(
                at.saturating_sub(now_ms()) as i64
            ))),
            None => Ok(read(Reply::Integer(-1))),
        },
        None => Ok(read(Reply::Integer(-2))),
    }
}

fn hset(db: &mut Database, args: &[Vec<u8>]) -> Result<Exec> {
    if args.len() < 4 || args.len() % 2 != 0 {
        return Err(StoreError::WrongArity("hset".to_string()));
    }
    let key = key_of(args, 1, "hset")?;
    let hash = match ensure_value(db, &key, || Value::Hash(HashMap::new())) {
        Value::Hash(h) => h,
        _ => return Err(StoreError::WrongType),
    };

    let mut added = 0;
    for pair in args[2..].chunks(2) {
        let field = String::from_utf8_lossy(&pair[0]).into_owned();
        if hash.insert(field, pair[1].clone()).is_none() {
            added += 1;
        }
    }
    Ok(write(Reply::Integer(added), vec![args.to_vec()]))
}

fn hget(db: &mut Database, args: &[Vec<u8>]) -> Result<Exec> {
    if args.len() != 3 {
        return Err(StoreError::WrongArity("hget".to_string()));
    }
    let key = key_of(args, 1, "hget")?;
    let field = String::from_utf8_lossy(&args[2]).into_owned();
    match live(db, &key) {
        Some(entry) => match &entry.value {
            Value::Hash(h) => Ok(read(
                h.get(&field)
                    .map(|v| Reply::Bulk(v.clone()))
                    .unwrap_or(Reply::Nil),
            )),
            _ => Err(StoreError::WrongType),
        },
        None => Ok(read(Reply::Nil)),
    }
}

fn hgetall(db: &mut Database, args: &[Vec<u8>]) -> Result<Exec> {
    let key = key_of(args, 1, "hgetall")?;
    match live(db, &key) {
        Some(entry) => match &entry.value {
            Value::Hash(h) => {
                let mut items = Vec::with_capacity(h.len() * 2);
                for (field, value) in h {
                    items.push(Reply::Bulk(field.as_bytes().to_vec()));
                    items.push(Reply::Bulk(value.clone()));
                }
                Ok(read(Reply::Array(items)))
            }
            _ => Err(StoreError::WrongType),
        },
        None => Ok(read(Reply::Array(Vec::new()))),
    }
}

fn push(db: &mut Database, args: &[Vec<u8>], left: bool) -> Result<Exec> {
    if args.len() < 3 {
        return Err(StoreError::WrongArity(
            if left { "lpush" } else { "rpush" }.to_string(),
        ));
    }
    let key = key_of(args, 1, "rpush")?;
    let list = match ensure_value(db, &key, || Value::List(VecDeque::new())) {
        Value::List(l) => l,
        _ => return Err(StoreError::WrongType),
    };

    for value in &args[2..] {
        if left {
            list.push_front(value.clone());
        } else {
            list.push_back(value.clone());
        }
    }
    let len = list.len() as i64;
    Ok(write(Reply::Integer(len), vec![args.to_vec()]))
}

fn lrange(db: &mut Database, args: &[Vec<u8>]) -> Result<Exec> {
    if args.len() != 4 {
        return Err(StoreError::WrongArity("lrange".to_string()));
    }
    let key = key_of(args, 1, "lrange")?;
    let start = int_of(&args[2])?;
    let stop = int_of(&args[3])?;

    let list = match live(db, &key) {
        Some(entry) => match &entry.value {
            Value::List(l) => l,
            _ => return Err(StoreError::WrongType),
        },
        None => return Ok(read(Reply::Array(Vec::new()))),
    };

    let len = list.len() as i64;
    let normalize = |index: i64| -> i64 {
        if index < 0 {
            (len + index).max(0)
        } else {
            index
        }
    };
    let start = normalize(start);
    let stop = normalize(stop).min(len - 1);
    if start > stop || start >= len {
        return Ok(read(Reply::Array(Vec::new())));
    }

    let items = list
        .iter()
        .skip(start as usize)
        .take((stop - start + 1) as usize)
        .map(|v| Reply::Bulk(v.clone()))
        .collect();
    Ok(read(Reply::Array(items)))
}

fn sadd(db: &mut Database, args: &[Vec<u8>]) -> Result<Exec> {
    if args.len() < 3 {
        return Err(StoreError::WrongArity("sadd".to_string()));
    }
    let key = key_of(args, 1, "sadd")?;
    let set = match ensure_value(db, &key, || Value::Set(BTreeSet::new())) {
        Value::Set(s) => s,
        _ => return Err(StoreError::WrongType),
    };

    let mut added = 0;
    for member in &args[2..] {
        if set.insert(member.clone()) {
            added += 1;
        }
    }
    Ok(write(Reply::Integer(added), vec![args.to_vec()]))
}

fn smembers(db: &mut Database, args: &[Vec<u8>]) -> Result<Exec> {
    let key = key_of(args, 1, "smembers")?;
    match live(db, &key) {
        Some(entry) => match &entry.value {
            Value::Set(s) => Ok(read(Reply::Array(
                s.iter().map(|m| Reply::Bulk(m.clone())).collect(),
            ))),
            _ => Err(StoreError::WrongType),
        },
        None => Ok(read(Reply::Array(Vec::new()))),
    }
}

fn dbsize(db: &mut Database, _args: &[Vec<u8>]) -> Result<Exec> {
    let now = now_ms();
    let count = db.values().filter(|e| !e.is_expired(now)).count();
    Ok(read(Reply::Integer(count as i64)))
}

fn flushdb(db: &mut Database, args: &[Vec<u8>]) -> Result<Exec> {
    db.clear();
    Ok(write(Reply::ok(), vec![args.to_vec()]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(parts: &[&str]) -> Vec<Vec<u8>> {
        parts.iter().map(|p| p.as_bytes().to_vec()).collect()
    }

    #[test]
    fn test_set_with_expiry_propagates_absolute_deadline() {
        let mut db = Database::new();
        let exec = dispatch(&mut db, "SET", &line(&["SET", "a", "1", "EX", "100"])).unwrap();

        assert_eq!(exec.writes.len(), 2);
        assert_eq!(exec.writes[0][0], b"SET".to_vec());
        assert_eq!(exec.writes[1][0], b"PEXPIREAT".to_vec());

        let deadline: u64 = String::from_utf8_lossy(&exec.writes[1][2]).parse().unwrap();
        assert!(deadline > now_ms());
    }

    #[test]
    fn test_wrong_type_rejected() {
        let mut db = Database::new();
        dispatch(&mut db, "SET", &line(&["SET", "a", "1"])).unwrap();
        let err = dispatch(&mut db, "RPUSH", &line(&["RPUSH", "a", "x"])).unwrap_err();
        assert!(matches!(err, StoreError::WrongType));
    }

    #[test]
    fn test_del_of_missing_key_propagates_nothing() {
        let mut db = Database::new();
        let exec = dispatch(&mut db, "DEL", &line(&["DEL", "missing"])).unwrap();
        assert_eq!(exec.reply, Reply::Integer(0));
        assert!(exec.writes.is_empty());
    }

    #[test]
    fn test_list_push_and_range() {
        let mut db = Database::new();
        dispatch(&mut db, "RPUSH", &line(&["RPUSH", "l", "a", "b", "c"])).unwrap();
        let exec = dispatch(&mut db, "LRANGE", &line(&["LRANGE", "l", "0", "-1"])).unwrap();
        assert_eq!(
            exec.reply,
            Reply::Array(vec![
                Reply::Bulk(b"a".to_vec()),
                Reply::Bulk(b"b".to_vec()),
                Reply::Bulk(b"c".to_vec()),
            ])
        );
    }

    #[test]
    fn test_sadd_counts_new_members_only() {
        let mut db = Database::new();
        let exec = dispatch(&mut db, "SADD", &line(&["SADD", "s", "a", "b"])).unwrap();
        assert_eq!(exec.reply, Reply::Integer(2));
        let exec = dispatch(&mut db, "SADD", &line(&["SADD", "s", "b", "c"])).unwrap();
        assert_eq!(exec.reply, Reply::Integer(1));
    }
}
