use crate::db;
use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::helpers::{
    ensure_exists, get_patch, get_required_str, get_required_text, is_unique_violation, new_id,
    parse_text, require_db,
};
use crate::ipc::types::{AppState, Request};
use crate::rules::{self, FieldSpec, FieldType};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};

pub struct FieldRow {
    pub id: String,
    pub key: String,
    pub label: String,
    pub spec: FieldSpec,
    pub sort_order: i64,
}

impl FieldRow {
    fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "key": self.key,
            "label": self.label,
            "fieldType": self.spec.field_type.as_str(),
            "options": self.spec.options,
            "sortOrder": self.sort_order
        })
    }
}

const FIELD_COLUMNS: &str = "id, key, label, field_type, options_json, sort_order";

fn map_field(r: &rusqlite::Row<'_>) -> rusqlite::Result<FieldRow> {
    let field_type: String = r.get(3)?;
    let options_json: String = r.get(4)?;
    Ok(FieldRow {
        id: r.get(0)?,
        key: r.get(1)?,
        label: r.get(2)?,
        spec: FieldSpec {
            // Only written through `customFields.create`; fall back to text.
            field_type: FieldType::parse(&field_type).unwrap_or(FieldType::Text),
            options: serde_json::from_str(&options_json).unwrap_or_default(),
        },
        sort_order: r.get(5)?,
    })
}

pub fn load_field(conn: &Connection, field_id: &str) -> Result<FieldRow, HandlerErr> {
    conn.query_row(
        &format!("SELECT {} FROM custom_fields WHERE id = ?", FIELD_COLUMNS),
        [field_id],
        map_field,
    )
    .optional()
    .map_err(HandlerErr::db("db_query_failed"))?
    .ok_or_else(|| HandlerErr::not_found("custom field"))
}

pub fn list_fields(conn: &Connection) -> Result<Vec<FieldRow>, HandlerErr> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {} FROM custom_fields ORDER BY sort_order, key",
            FIELD_COLUMNS
        ))
        .map_err(HandlerErr::db("db_query_failed"))?;
    stmt.query_map([], map_field)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db("db_query_failed"))
}

fn normalize_key(raw: &str) -> Result<String, HandlerErr> {
    let key = raw.trim();
    let valid = !key.is_empty()
        && key.len() <= 64
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if !valid {
        return Err(HandlerErr::bad_params(
            "key must be 1..=64 characters of letters, digits, '_' or '-'",
        ));
    }
    Ok(key.to_string())
}

fn custom_fields_list(conn: &Connection, _params: &Value) -> Result<Value, HandlerErr> {
    let fields = list_fields(conn)?;
    let out: Vec<Value> = fields.iter().map(FieldRow::to_json).collect();
    Ok(json!({ "fields": out }))
}

fn custom_fields_create(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let key = normalize_key(&get_required_str(params, "key")?)?;
    let label = get_required_text(params, "label", 120)?;
    let field_type_raw = get_required_str(params, "fieldType")?;
    let field_type = FieldType::parse(&field_type_raw).ok_or_else(|| {
        HandlerErr::bad_params("fieldType must be one of text, number, boolean, select")
    })?;
    let options = match (field_type, params.get("options")) {
        (FieldType::Select, Some(raw)) => {
            rules::normalize_options(raw).map_err(HandlerErr::bad_params)?
        }
        (FieldType::Select, None) => {
            return Err(HandlerErr::bad_params("select fields need options"))
        }
        (_, None) | (_, Some(Value::Null)) => Vec::new(),
        (_, Some(_)) => {
            return Err(HandlerErr::bad_params("options are only valid for select fields"))
        }
    };

    let sort_order: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(sort_order), -1) + 1 FROM custom_fields",
            [],
            |r| r.get(0),
        )
        .map_err(HandlerErr::db("db_query_failed"))?;

    let field_id = new_id();
    conn.execute(
        "INSERT INTO custom_fields(id, key, label, field_type, options_json, sort_order, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &field_id,
            &key,
            &label,
            field_type.as_str(),
            json!(options).to_string(),
            sort_order,
            db::now_rfc3339(),
        ),
    )
    .map_err(|e| {
        if is_unique_violation(&e) {
            HandlerErr::conflict(format!("custom field key already exists: {}", key))
        } else {
            HandlerErr::db_table("db_insert_failed", "custom_fields")(e)
        }
    })?;

    Ok(json!({ "fieldId": field_id }))
}

fn custom_fields_update(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let field_id = get_required_str(params, "fieldId")?;
    let patch = get_patch(params)?;
    let mut field = load_field(conn, &field_id)?;

    let mut options_changed = false;
    for (k, v) in patch {
        match k.as_str() {
            "label" => field.label = parse_text(v, k, 120)?,
            "options" => {
                if field.spec.field_type != FieldType::Select {
                    return Err(HandlerErr::bad_params(
                        "options are only valid for select fields",
                    ));
                }
                field.spec.options = rules::normalize_options(v).map_err(HandlerErr::bad_params)?;
                options_changed = true;
            }
            _ => return Err(HandlerErr::bad_params(format!("unknown field attribute: {}", k))),
        }
    }

    conn.execute(
        "UPDATE custom_fields SET label = ?, options_json = ? WHERE id = ?",
        (&field.label, json!(field.spec.options).to_string(), &field_id),
    )
    .map_err(HandlerErr::db_table("db_update_failed", "custom_fields"))?;

    // Values are kept as-is; the caller decides whether to clean them up.
    let mut orphaned: Vec<Value> = Vec::new();
    if options_changed {
        let mut stmt = conn
            .prepare(
                "SELECT student_id, value FROM student_field_values
                 WHERE field_id = ? ORDER BY student_id",
            )
            .map_err(HandlerErr::db("db_query_failed"))?;
        let rows = stmt
            .query_map([&field_id], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(HandlerErr::db("db_query_failed"))?;
        for (student_id, value) in rows {
            if !field.spec.options.iter().any(|o| o == &value) {
                orphaned.push(json!({ "studentId": student_id, "value": value }));
            }
        }
    }

    Ok(json!({ "field": field.to_json(), "valuesOutsideOptions": orphaned }))
}

fn custom_fields_delete(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let field_id = get_required_str(params, "fieldId")?;
    ensure_exists(conn, "custom_fields", &field_id, "custom field")?;

    let rule_count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM line_item_rules WHERE field_id = ?",
            [&field_id],
            |r| r.get(0),
        )
        .map_err(HandlerErr::db("db_query_failed"))?;
    if rule_count > 0 {
        return Err(HandlerErr::conflict("custom field is used by rules")
            .with_details(json!({ "rules": rule_count })));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(HandlerErr::db("db_tx_failed"))?;
    tx.execute(
        "DELETE FROM student_field_values WHERE field_id = ?",
        [&field_id],
    )
    .map_err(HandlerErr::db_table("db_delete_failed", "student_field_values"))?;
    tx.execute("DELETE FROM custom_fields WHERE id = ?", [&field_id])
        .map_err(HandlerErr::db_table("db_delete_failed", "custom_fields"))?;
    tx.commit().map_err(HandlerErr::db("db_commit_failed"))?;

    Ok(json!({ "ok": true }))
}

fn values_get(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    ensure_exists(conn, "students", &student_id, "student")?;

    let mut stmt = conn
        .prepare(
            "SELECT f.id, f.key, f.label, f.field_type, v.value
             FROM custom_fields f
             LEFT JOIN student_field_values v
               ON v.field_id = f.id AND v.student_id = ?
             ORDER BY f.sort_order, f.key",
        )
        .map_err(HandlerErr::db("db_query_failed"))?;
    let values = stmt
        .query_map([&student_id], |r| {
            Ok(json!({
                "fieldId": r.get::<_, String>(0)?,
                "key": r.get::<_, String>(1)?,
                "label": r.get::<_, String>(2)?,
                "fieldType": r.get::<_, String>(3)?,
                "value": r.get::<_, Option<String>>(4)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db("db_query_failed"))?;

    Ok(json!({ "studentId": student_id, "values": values }))
}

/// Write or clear one normalized value.
fn store_value(
    conn: &Connection,
    student_id: &str,
    field_id: &str,
    value: Option<&str>,
) -> rusqlite::Result<()> {
    match value {
        Some(v) => conn.execute(
            "INSERT INTO student_field_values(student_id, field_id, value, updated_at)
             VALUES(?, ?, ?, ?)
             ON CONFLICT(student_id, field_id) DO UPDATE SET
               value = excluded.value,
               updated_at = excluded.updated_at",
            (student_id, field_id, v, db::now_rfc3339()),
        )?,
        None => conn.execute(
            "DELETE FROM student_field_values WHERE student_id = ? AND field_id = ?",
            (student_id, field_id),
        )?,
    };
    Ok(())
}

fn values_set(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let field_id = get_required_str(params, "fieldId")?;
    let raw = params.get("value").unwrap_or(&Value::Null);
    ensure_exists(conn, "students", &student_id, "student")?;
    let field = load_field(conn, &field_id)?;

    let value = rules::normalize_value(&field.spec, raw).map_err(HandlerErr::bad_params)?;
    store_value(conn, &student_id, &field_id, value.as_deref())
        .map_err(HandlerErr::db_table("db_update_failed", "student_field_values"))?;

    Ok(json!({ "value": value }))
}

fn values_bulk_set(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let field_id = get_required_str(params, "fieldId")?;
    let updates = params
        .get("updates")
        .and_then(|v| v.as_array())
        .ok_or_else(|| HandlerErr::bad_params("updates must be an array"))?;
    let field = load_field(conn, &field_id)?;

    let tx = conn
        .unchecked_transaction()
        .map_err(HandlerErr::db("db_tx_failed"))?;
    let mut applied = 0usize;
    let mut failed: Vec<Value> = Vec::new();
    for u in updates {
        let student_id = u.get("studentId").and_then(|v| v.as_str()).unwrap_or("");
        let fail = |code: &str, message: String| {
            json!({ "studentId": student_id, "code": code, "message": message })
        };
        if student_id.is_empty() {
            failed.push(fail("bad_params", "missing studentId".into()));
            continue;
        }
        let exists = tx
            .query_row("SELECT 1 FROM students WHERE id = ?", [student_id], |r| {
                r.get::<_, i64>(0)
            })
            .optional()
            .map_err(HandlerErr::db("db_query_failed"))?
            .is_some();
        if !exists {
            failed.push(fail("not_found", "student not found".into()));
            continue;
        }
        let value = match rules::normalize_value(&field.spec, u.get("value").unwrap_or(&Value::Null)) {
            Ok(v) => v,
            Err(msg) => {
                failed.push(fail("bad_params", msg));
                continue;
            }
        };
        store_value(&tx, student_id, &field_id, value.as_deref())
            .map_err(HandlerErr::db_table("db_update_failed", "student_field_values"))?;
        applied += 1;
    }
    tx.commit().map_err(HandlerErr::db("db_commit_failed"))?;

    Ok(json!({ "applied": applied, "failed": failed }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let f: fn(&Connection, &Value) -> Result<Value, HandlerErr> = match req.method.as_str() {
        "customFields.list" => custom_fields_list,
        "customFields.create" => custom_fields_create,
        "customFields.update" => custom_fields_update,
        "customFields.delete" => custom_fields_delete,
        "customFields.values.get" => values_get,
        "customFields.values.set" => values_set,
        "customFields.values.bulkSet" => values_bulk_set,
        _ => return None,
    };
    let result = require_db(state).and_then(|conn| f(conn, &req.params));
    Some(respond(&req.id, result))
}
