#![forbid(unsafe_code)]

//! Command dispatch: a stateless mapping from a parsed argv to a store
//! operation and a tagged reply.
//!
//! Nothing escapes this boundary as an error value: command-level failures
//! (unknown command, bad arity, wrong type, unparsable number) become
//! `Reply::Error` and the connection stays healthy. Only protocol-level
//! framing problems, handled upstream, terminate a connection.

use dk_protocol::Reply;
use dk_store::{Store, StoreError, TtlValue};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    EmptyCommand,
    UnknownCommand(String),
    WrongArity(&'static str),
    InvalidInteger,
    InvalidFloat,
    Store(StoreError),
}

impl From<StoreError> for CommandError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}

#[derive(Debug, Clone, Copy)]
enum CommandId {
    Get,
    Set,
    Del,
    Keys,
    Expire,
    Ttl,
    Persist,
    Hset,
    Hget,
    Hdel,
    Hgetall,
    Zadd,
    Zscore,
    Zquery,
    Zrem,
}

/// Execute one command against the store. Always yields a reply frame.
pub fn dispatch(argv: &[Vec<u8>], store: &mut Store, now_ms: u64) -> Reply {
    match dispatch_inner(argv, store, now_ms) {
        Ok(reply) => reply,
        Err(error) => error_reply(&error),
    }
}

fn dispatch_inner(
    argv: &[Vec<u8>],
    store: &mut Store,
    now_ms: u64,
) -> Result<Reply, CommandError> {
    let Some(raw_cmd) = argv.first() else {
        return Err(CommandError::EmptyCommand);
    };
    match classify_command(raw_cmd) {
        Some(CommandId::Get) => get(argv, store, now_ms),
        Some(CommandId::Set) => set(argv, store, now_ms),
        Some(CommandId::Del) => del(argv, store, now_ms),
        Some(CommandId::Keys) => keys(argv, store, now_ms),
        Some(CommandId::Expire) => expire(argv, store, now_ms),
        Some(CommandId::Ttl) => ttl(argv, store, now_ms),
        Some(CommandId::Persist) => persist(argv, store, now_ms),
        Some(CommandId::Hset) => hset(argv, store, now_ms),
        Some(CommandId::Hget) => hget(argv, store, now_ms),
        Some(CommandId::Hdel) => hdel(argv, store, now_ms),
        Some(CommandId::Hgetall) => hgetall(argv, store, now_ms),
        Some(CommandId::Zadd) => zadd(argv, store, now_ms),
        Some(CommandId::Zscore) => zscore(argv, store, now_ms),
        Some(CommandId::Zquery) => zquery(argv, store, now_ms),
        Some(CommandId::Zrem) => zrem(argv, store, now_ms),
        None => Err(CommandError::UnknownCommand(
            String::from_utf8_lossy(raw_cmd).into_owned(),
        )),
    }
}

fn classify_command(cmd: &[u8]) -> Option<CommandId> {
    match cmd.len() {
        3 => {
            if cmd.eq_ignore_ascii_case(b"GET") {
                Some(CommandId::Get)
            } else if cmd.eq_ignore_ascii_case(b"SET") {
                Some(CommandId::Set)
            } else if cmd.eq_ignore_ascii_case(b"DEL") {
                Some(CommandId::Del)
            } else if cmd.eq_ignore_ascii_case(b"TTL") {
                Some(CommandId::Ttl)
            } else {
                None
            }
        }
        4 => {
            if cmd.eq_ignore_ascii_case(b"KEYS") {
                Some(CommandId::Keys)
            } else if cmd.eq_ignore_ascii_case(b"HSET") {
                Some(CommandId::Hset)
            } else if cmd.eq_ignore_ascii_case(b"HGET") {
                Some(CommandId::Hget)
            } else if cmd.eq_ignore_ascii_case(b"HDEL") {
                Some(CommandId::Hdel)
            } else if cmd.eq_ignore_ascii_case(b"ZADD") {
                Some(CommandId::Zadd)
            } else if cmd.eq_ignore_ascii_case(b"ZREM") {
                Some(CommandId::Zrem)
            } else {
                None
            }
        }
        6 => {
            if cmd.eq_ignore_ascii_case(b"EXPIRE") {
                Some(CommandId::Expire)
            } else if cmd.eq_ignore_ascii_case(b"ZSCORE") {
                Some(CommandId::Zscore)
            } else if cmd.eq_ignore_ascii_case(b"ZQUERY") {
                Some(CommandId::Zquery)
            } else {
                None
            }
        }
        7 => {
            if cmd.eq_ignore_ascii_case(b"PERSIST") {
                Some(CommandId::Persist)
            } else if cmd.eq_ignore_ascii_case(b"HGETALL") {
                Some(CommandId::Hgetall)
            } else {
                None
            }
        }
        _ => None,
    }
}

// ── key space ────────────────────────────────────────────────────

fn get(argv: &[Vec<u8>], store: &mut Store, now_ms: u64) -> Result<Reply, CommandError> {
    if argv.len() != 2 {
        return Err(CommandError::WrongArity("GET"));
    }
    match store.get(&argv[1], now_ms)? {
        Some(value) => Ok(Reply::Str(value)),
        None => Ok(Reply::Nil),
    }
}

fn set(argv: &[Vec<u8>], store: &mut Store, now_ms: u64) -> Result<Reply, CommandError> {
    if argv.len() != 3 {
        return Err(CommandError::WrongArity("SET"));
    }
    store.set(argv[1].clone(), argv[2].clone(), now_ms);
    Ok(Reply::Nil)
}

fn del(argv: &[Vec<u8>], store: &mut Store, now_ms: u64) -> Result<Reply, CommandError> {
    if argv.len() != 2 {
        return Err(CommandError::WrongArity("DEL"));
    }
    Ok(Reply::Int(i64::from(store.del(&argv[1], now_ms))))
}

fn keys(argv: &[Vec<u8>], store: &mut Store, now_ms: u64) -> Result<Reply, CommandError> {
    if argv.len() != 1 {
        return Err(CommandError::WrongArity("KEYS"));
    }
    let keys = store.keys(now_ms).into_iter().map(Reply::Str).collect();
    Ok(Reply::Array(keys))
}

// ── expiration ───────────────────────────────────────────────────

fn expire(argv: &[Vec<u8>], store: &mut Store, now_ms: u64) -> Result<Reply, CommandError> {
    if argv.len() != 3 {
        return Err(CommandError::WrongArity("EXPIRE"));
    }
    let seconds = parse_i64(&argv[2])?;
    let ttl_ms = seconds.saturating_mul(1000);
    // Absent key is a no-op, not an error.
    store.expire_in(&argv[1], ttl_ms, now_ms);
    Ok(Reply::Nil)
}

fn ttl(argv: &[Vec<u8>], store: &mut Store, now_ms: u64) -> Result<Reply, CommandError> {
    if argv.len() != 2 {
        return Err(CommandError::WrongArity("TTL"));
    }
    // "no expiry" and "no such key" both surface as -1 on the wire.
    match store.ttl(&argv[1], now_ms) {
        TtlValue::RemainingMs(ms) => {
            let seconds = ms.div_ceil(1000);
            Ok(Reply::Int(i64::try_from(seconds).unwrap_or(i64::MAX)))
        }
        TtlValue::NoExpiry | TtlValue::KeyMissing => Ok(Reply::Int(-1)),
    }
}

fn persist(argv: &[Vec<u8>], store: &mut Store, now_ms: u64) -> Result<Reply, CommandError> {
    if argv.len() != 2 {
        return Err(CommandError::WrongArity("PERSIST"));
    }
    store.persist(&argv[1], now_ms);
    Ok(Reply::Nil)
}

// ── hashes ───────────────────────────────────────────────────────

fn hset(argv: &[Vec<u8>], store: &mut Store, now_ms: u64) -> Result<Reply, CommandError> {
    if argv.len() != 4 {
        return Err(CommandError::WrongArity("HSET"));
    }
    store.hset(&argv[1], argv[2].clone(), argv[3].clone(), now_ms)?;
    Ok(Reply::Nil)
}

fn hget(argv: &[Vec<u8>], store: &mut Store, now_ms: u64) -> Result<Reply, CommandError> {
    if argv.len() != 3 {
        return Err(CommandError::WrongArity("HGET"));
    }
    match store.hget(&argv[1], &argv[2], now_ms)? {
        Some(value) => Ok(Reply::Str(value)),
        None => Ok(Reply::Nil),
    }
}

fn hdel(argv: &[Vec<u8>], store: &mut Store, now_ms: u64) -> Result<Reply, CommandError> {
    if argv.len() != 3 {
        return Err(CommandError::WrongArity("HDEL"));
    }
    store.hdel(&argv[1], &argv[2], now_ms)?;
    Ok(Reply::Nil)
}

fn hgetall(argv: &[Vec<u8>], store: &mut Store, now_ms: u64) -> Result<Reply, CommandError> {
    if argv.len() != 2 {
        return Err(CommandError::WrongArity("HGETALL"));
    }
    let fields = store.hfields(&argv[1], now_ms)?;
    Ok(Reply::Array(fields.into_iter().map(Reply::Str).collect()))
}

// ── sorted sets ──────────────────────────────────────────────────

fn zadd(argv: &[Vec<u8>], store: &mut Store, now_ms: u64) -> Result<Reply, CommandError> {
    if argv.len() != 4 {
        return Err(CommandError::WrongArity("ZADD"));
    }
    let score = parse_f64(&argv[2])?;
    let inserted = store.zadd(&argv[1], score, &argv[3], now_ms)?;
    Ok(Reply::Int(i64::from(inserted)))
}

fn zscore(argv: &[Vec<u8>], store: &mut Store, now_ms: u64) -> Result<Reply, CommandError> {
    if argv.len() != 3 {
        return Err(CommandError::WrongArity("ZSCORE"));
    }
    match store.zscore(&argv[1], &argv[2], now_ms)? {
        Some(score) => Ok(Reply::Double(score)),
        None => Ok(Reply::Nil),
    }
}

fn zquery(argv: &[Vec<u8>], store: &mut Store, now_ms: u64) -> Result<Reply, CommandError> {
    if argv.len() != 6 {
        return Err(CommandError::WrongArity("ZQUERY"));
    }
    let score = parse_f64(&argv[2])?;
    let offset = parse_i64(&argv[4])?;
    let limit = parse_i64(&argv[5])?;
    if limit <= 0 {
        return Ok(Reply::Array(Vec::new()));
    }
    let limit = usize::try_from(limit).unwrap_or(usize::MAX);
    let entries = store.zquery(&argv[1], score, &argv[3], offset, limit, now_ms)?;
    let mut items = Vec::with_capacity(entries.len() * 2);
    for (score, member) in entries {
        items.push(Reply::Double(score));
        items.push(Reply::Str(member));
    }
    Ok(Reply::Array(items))
}

fn zrem(argv: &[Vec<u8>], store: &mut Store, now_ms: u64) -> Result<Reply, CommandError> {
    if argv.len() != 3 {
        return Err(CommandError::WrongArity("ZREM"));
    }
    let removed = store.zrem(&argv[1], &argv[2], now_ms)?;
    Ok(Reply::Int(i64::from(removed)))
}

// ── argument parsing and error surfacing ─────────────────────────

fn parse_i64(arg: &[u8]) -> Result<i64, CommandError> {
    std::str::from_utf8(arg)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or(CommandError::InvalidInteger)
}

fn parse_f64(arg: &[u8]) -> Result<f64, CommandError> {
    std::str::from_utf8(arg)
        .ok()
        .and_then(|s| s.parse::<f64>().ok())
        .filter(|f| !f.is_nan())
        .ok_or(CommandError::InvalidFloat)
}

fn error_reply(error: &CommandError) -> Reply {
    match error {
        CommandError::EmptyCommand => Reply::Error("ERR empty command".to_string()),
        CommandError::UnknownCommand(command) => {
            Reply::Error(format!("ERR unknown command '{command}'"))
        }
        CommandError::WrongArity(command) => Reply::Error(format!(
            "ERR wrong number of arguments for '{command}' command"
        )),
        CommandError::InvalidInteger => {
            Reply::Error("ERR value is not an integer or out of range".to_string())
        }
        CommandError::InvalidFloat => Reply::Error("ERR value is not a valid float".to_string()),
        CommandError::Store(StoreError::WrongType) => Reply::Error(
            "WRONGTYPE Operation against a key holding the wrong kind of value".to_string(),
        ),
    }
}
