use crate::access;
use crate::db;
use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::helpers::{
    ensure_exists, get_bool, get_patch, get_required_str, get_required_text, is_unique_violation,
    new_id, parse_text, require_db,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};

pub struct UserRow {
    pub id: String,
    pub email: String,
    pub display_name: String,
    pub role: String,
    pub active: bool,
    pub permissions_json: String,
}

impl UserRow {
    fn to_json(&self) -> Value {
        let parsed = access::parse_grants_text(&self.permissions_json);
        json!({
            "id": self.id,
            "email": self.email,
            "displayName": self.display_name,
            "role": self.role,
            "active": self.active,
            "permissions": parsed.canonical_ids(),
            "permissionsMalformed": parsed.malformed
        })
    }
}

fn map_user(r: &rusqlite::Row<'_>) -> rusqlite::Result<UserRow> {
    Ok(UserRow {
        id: r.get(0)?,
        email: r.get(1)?,
        display_name: r.get(2)?,
        role: r.get(3)?,
        active: r.get::<_, i64>(4)? != 0,
        permissions_json: r.get(5)?,
    })
}

pub fn load_user(conn: &Connection, user_id: &str) -> Result<UserRow, HandlerErr> {
    conn.query_row(
        "SELECT id, email, display_name, role, active, permissions_json
         FROM users WHERE id = ?",
        [user_id],
        map_user,
    )
    .optional()
    .map_err(HandlerErr::db("db_query_failed"))?
    .ok_or_else(|| HandlerErr::not_found("user"))
}

fn normalize_email(raw: &str) -> Result<String, HandlerErr> {
    let e = raw.trim().to_ascii_lowercase();
    let valid = e.len() <= 254
        && e.split_once('@')
            .map(|(local, domain)| !local.is_empty() && domain.contains('.') && !domain.starts_with('.'))
            .unwrap_or(false);
    if !valid {
        return Err(HandlerErr::bad_params("email is not a valid address"));
    }
    Ok(e)
}

fn normalize_role(raw: &str) -> Result<String, HandlerErr> {
    let role = parse_text(&Value::String(raw.to_string()), "role", 32)?;
    Ok(role.to_ascii_lowercase())
}

/// Parse a permission array for storage. With `strict`, any entry that does
/// not map onto the catalog rejects the whole list.
fn permissions_for_storage(raw: &Value, strict: bool) -> Result<(Vec<String>, Vec<String>), HandlerErr> {
    if !raw.is_array() {
        return Err(HandlerErr::bad_params("permissions must be an array"));
    }
    let parsed = access::parse_grants(raw);
    let rejected = parsed.rejected();
    if strict && !rejected.is_empty() {
        return Err(HandlerErr::bad_params("permissions contain unknown or ambiguous entries")
            .with_details(json!({
                "unrecognized": parsed.unrecognized,
                "ambiguous": parsed.ambiguous
            })));
    }
    Ok((parsed.canonical_ids(), rejected))
}

fn users_list(conn: &Connection, _params: &Value) -> Result<Value, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT id, email, display_name, role, active, permissions_json
             FROM users
             ORDER BY display_name, email",
        )
        .map_err(HandlerErr::db("db_query_failed"))?;
    let users = stmt
        .query_map([], map_user)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db("db_query_failed"))?;
    let out: Vec<Value> = users.iter().map(UserRow::to_json).collect();
    Ok(json!({ "users": out }))
}

fn users_create(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let email = normalize_email(&get_required_str(params, "email")?)?;
    let display_name = get_required_text(params, "displayName", 120)?;
    let role = match params.get("role").and_then(|v| v.as_str()) {
        Some(r) => normalize_role(r)?,
        None => "staff".to_string(),
    };
    let active = get_bool(params, "active", true)?;
    let (permissions, rejected) = match params.get("permissions") {
        None | Some(Value::Null) => (Vec::new(), Vec::new()),
        Some(raw) => permissions_for_storage(raw, get_bool(params, "strict", false)?)?,
    };

    let user_id = new_id();
    conn.execute(
        "INSERT INTO users(id, email, display_name, role, active, permissions_json, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &user_id,
            &email,
            &display_name,
            &role,
            active as i64,
            json!(permissions).to_string(),
            db::now_rfc3339(),
        ),
    )
    .map_err(|e| {
        if is_unique_violation(&e) {
            HandlerErr::conflict("a user with this email already exists")
        } else {
            HandlerErr::db_table("db_insert_failed", "users")(e)
        }
    })?;

    Ok(json!({
        "userId": user_id,
        "email": email,
        "permissions": permissions,
        "rejected": rejected
    }))
}

fn users_update(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let user_id = get_required_str(params, "userId")?;
    let patch = get_patch(params)?;
    ensure_exists(conn, "users", &user_id, "user")?;

    let mut display_name: Option<String> = None;
    let mut role: Option<String> = None;
    let mut active: Option<bool> = None;
    for (k, v) in patch {
        match k.as_str() {
            "displayName" => display_name = Some(parse_text(v, k, 120)?),
            "role" => {
                let r = v
                    .as_str()
                    .ok_or_else(|| HandlerErr::bad_params("role must be string"))?;
                role = Some(normalize_role(r)?);
            }
            "active" => {
                active = Some(
                    v.as_bool()
                        .ok_or_else(|| HandlerErr::bad_params("active must be boolean"))?,
                )
            }
            _ => return Err(HandlerErr::bad_params(format!("unknown user field: {}", k))),
        }
    }

    conn.execute(
        "UPDATE users SET
           display_name = COALESCE(?, display_name),
           role = COALESCE(?, role),
           active = COALESCE(?, active),
           updated_at = ?
         WHERE id = ?",
        (
            display_name,
            role,
            active.map(|b| b as i64),
            db::now_rfc3339(),
            &user_id,
        ),
    )
    .map_err(HandlerErr::db_table("db_update_failed", "users"))?;

    let user = load_user(conn, &user_id)?;
    Ok(json!({ "user": user.to_json() }))
}

fn users_set_permissions(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let user_id = get_required_str(params, "userId")?;
    let raw = params
        .get("permissions")
        .ok_or_else(|| HandlerErr::bad_params("missing permissions"))?;
    let strict = get_bool(params, "strict", false)?;
    ensure_exists(conn, "users", &user_id, "user")?;

    let (permissions, rejected) = permissions_for_storage(raw, strict)?;
    conn.execute(
        "UPDATE users SET permissions_json = ?, updated_at = ? WHERE id = ?",
        (json!(permissions).to_string(), db::now_rfc3339(), &user_id),
    )
    .map_err(HandlerErr::db_table("db_update_failed", "users"))?;

    tracing::info!(user_id = %user_id, granted = permissions.len(), rejected = rejected.len(), "permissions updated");
    Ok(json!({ "permissions": permissions, "rejected": rejected }))
}

fn users_delete(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let user_id = get_required_str(params, "userId")?;
    let n = conn
        .execute("DELETE FROM users WHERE id = ?", [&user_id])
        .map_err(HandlerErr::db_table("db_delete_failed", "users"))?;
    if n == 0 {
        return Err(HandlerErr::not_found("user"));
    }
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let f: fn(&Connection, &Value) -> Result<Value, HandlerErr> = match req.method.as_str() {
        "users.list" => users_list,
        "users.create" => users_create,
        "users.update" => users_update,
        "users.setPermissions" => users_set_permissions,
        "users.delete" => users_delete,
        _ => return None,
    };
    let result = require_db(state).and_then(|conn| f(conn, &req.params));
    Some(respond(&req.id, result))
}
