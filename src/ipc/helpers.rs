use crate::ipc::error::HandlerErr;
use crate::ipc::types::AppState;
use rusqlite::{Connection, OptionalExtension};
use serde_json::Value;
use uuid::Uuid;

pub fn require_db(state: &AppState) -> Result<&Connection, HandlerErr> {
    state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

pub fn get_required_str(params: &Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

/// Required, trimmed, non-empty, at most `max_len` bytes.
pub fn get_required_text(params: &Value, key: &str, max_len: usize) -> Result<String, HandlerErr> {
    let s = get_required_str(params, key)?;
    parse_text(&Value::String(s), key, max_len)
}

pub fn parse_text(v: &Value, key: &str, max_len: usize) -> Result<String, HandlerErr> {
    let s = v
        .as_str()
        .ok_or_else(|| HandlerErr::bad_params(format!("{} must be string", key)))?
        .trim();
    if s.is_empty() {
        return Err(HandlerErr::bad_params(format!("{} must not be empty", key)));
    }
    if s.len() > max_len {
        return Err(HandlerErr::bad_params(format!(
            "{} length must be <= {}",
            key, max_len
        )));
    }
    Ok(s.to_string())
}

/// Missing, null or blank all read as `None`.
pub fn parse_optional_text(
    v: Option<&Value>,
    key: &str,
    max_len: usize,
) -> Result<Option<String>, HandlerErr> {
    match v {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(other) => parse_text(other, key, max_len).map(Some),
    }
}

pub fn get_optional_text(
    params: &Value,
    key: &str,
    max_len: usize,
) -> Result<Option<String>, HandlerErr> {
    parse_optional_text(params.get(key), key, max_len)
}

pub fn get_bool(params: &Value, key: &str, default: bool) -> Result<bool, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(v) => v
            .as_bool()
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be boolean", key))),
    }
}

pub fn get_optional_i64(params: &Value, key: &str) -> Result<Option<i64>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_i64()
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be integer", key))),
    }
}

pub fn get_required_i64(params: &Value, key: &str) -> Result<i64, HandlerErr> {
    get_optional_i64(params, key)?.ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn get_optional_str_list(params: &Value, key: &str) -> Result<Option<Vec<String>>, HandlerErr> {
    let Some(v) = params.get(key) else {
        return Ok(None);
    };
    if v.is_null() {
        return Ok(None);
    }
    let arr = v
        .as_array()
        .ok_or_else(|| HandlerErr::bad_params(format!("{} must be an array of strings", key)))?;
    arr.iter()
        .map(|x| {
            x.as_str()
                .map(|s| s.to_string())
                .ok_or_else(|| HandlerErr::bad_params(format!("{} must be an array of strings", key)))
        })
        .collect::<Result<Vec<_>, _>>()
        .map(Some)
}

pub fn get_patch(params: &Value) -> Result<&serde_json::Map<String, Value>, HandlerErr> {
    params
        .get("patch")
        .and_then(|v| v.as_object())
        .ok_or_else(|| HandlerErr::bad_params("patch must be an object"))
}

/// `SELECT 1 FROM <table> WHERE id = ?`
pub fn row_exists(conn: &Connection, table: &str, id: &str) -> Result<bool, HandlerErr> {
    let sql = format!("SELECT 1 FROM {} WHERE id = ?", table);
    conn.query_row(&sql, [id], |r| r.get::<_, i64>(0))
        .optional()
        .map(|v| v.is_some())
        .map_err(HandlerErr::db("db_query_failed"))
}

pub fn ensure_exists(conn: &Connection, table: &str, id: &str, what: &str) -> Result<(), HandlerErr> {
    if row_exists(conn, table, id)? {
        Ok(())
    } else {
        Err(HandlerErr::not_found(what))
    }
}

pub fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _)
            if f.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                || f.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
    )
}
