use crate::db;
use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::helpers::{
    ensure_exists, get_bool, get_optional_text, get_patch, get_required_str, get_required_text,
    is_unique_violation, new_id, parse_optional_text, parse_text, require_db,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};

pub struct StudentRecord {
    pub id: String,
    pub admission_no: Option<String>,
    pub last_name: String,
    pub first_name: String,
    pub grade_level: Option<String>,
    pub active: bool,
}

impl StudentRecord {
    pub fn display_name(&self) -> String {
        format!("{}, {}", self.last_name, self.first_name)
    }

    fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "admissionNo": self.admission_no,
            "lastName": self.last_name,
            "firstName": self.first_name,
            "displayName": self.display_name(),
            "gradeLevel": self.grade_level,
            "active": self.active
        })
    }
}

pub const STUDENT_COLUMNS: &str = "id, admission_no, last_name, first_name, grade_level, active";

pub fn map_student(r: &rusqlite::Row<'_>) -> rusqlite::Result<StudentRecord> {
    Ok(StudentRecord {
        id: r.get(0)?,
        admission_no: r.get(1)?,
        last_name: r.get(2)?,
        first_name: r.get(3)?,
        grade_level: r.get(4)?,
        active: r.get::<_, i64>(5)? != 0,
    })
}

fn load_student(conn: &Connection, student_id: &str) -> Result<StudentRecord, HandlerErr> {
    conn.query_row(
        &format!("SELECT {} FROM students WHERE id = ?", STUDENT_COLUMNS),
        [student_id],
        map_student,
    )
    .optional()
    .map_err(HandlerErr::db("db_query_failed"))?
    .ok_or_else(|| HandlerErr::not_found("student"))
}

fn admission_conflict(e: rusqlite::Error, code: &'static str) -> HandlerErr {
    if is_unique_violation(&e) {
        HandlerErr::conflict("admission number already in use")
    } else {
        HandlerErr::db_table(code, "students")(e)
    }
}

fn students_list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let active_only = get_bool(params, "activeOnly", false)?;
    let grade_level = get_optional_text(params, "gradeLevel", 32)?;

    let mut stmt = conn
        .prepare(&format!(
            "SELECT {}
             FROM students
             WHERE (? = 0 OR active = 1)
               AND (? IS NULL OR grade_level = ?)
             ORDER BY last_name, first_name, id",
            STUDENT_COLUMNS
        ))
        .map_err(HandlerErr::db("db_query_failed"))?;
    let students = stmt
        .query_map(
            (active_only as i64, grade_level.as_deref(), grade_level.as_deref()),
            map_student,
        )
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db("db_query_failed"))?;
    let out: Vec<Value> = students.iter().map(StudentRecord::to_json).collect();
    Ok(json!({ "students": out }))
}

fn students_create(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let last_name = get_required_text(params, "lastName", 80)?;
    let first_name = get_required_text(params, "firstName", 80)?;
    let admission_no = get_optional_text(params, "admissionNo", 32)?;
    let grade_level = get_optional_text(params, "gradeLevel", 32)?;
    let active = get_bool(params, "active", true)?;

    let student_id = new_id();
    conn.execute(
        "INSERT INTO students(id, admission_no, last_name, first_name, grade_level, active, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &student_id,
            &admission_no,
            &last_name,
            &first_name,
            &grade_level,
            active as i64,
            db::now_rfc3339(),
        ),
    )
    .map_err(|e| admission_conflict(e, "db_insert_failed"))?;

    Ok(json!({ "studentId": student_id }))
}

fn students_update(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let patch = get_patch(params)?;
    let mut current = load_student(conn, &student_id)?;

    for (k, v) in patch {
        match k.as_str() {
            "lastName" => current.last_name = parse_text(v, k, 80)?,
            "firstName" => current.first_name = parse_text(v, k, 80)?,
            "admissionNo" => current.admission_no = parse_optional_text(Some(v), k, 32)?,
            "gradeLevel" => current.grade_level = parse_optional_text(Some(v), k, 32)?,
            "active" => {
                current.active = v
                    .as_bool()
                    .ok_or_else(|| HandlerErr::bad_params("active must be boolean"))?
            }
            _ => return Err(HandlerErr::bad_params(format!("unknown student field: {}", k))),
        }
    }

    conn.execute(
        "UPDATE students SET
           admission_no = ?, last_name = ?, first_name = ?, grade_level = ?, active = ?,
           updated_at = ?
         WHERE id = ?",
        (
            &current.admission_no,
            &current.last_name,
            &current.first_name,
            &current.grade_level,
            current.active as i64,
            db::now_rfc3339(),
            &student_id,
        ),
    )
    .map_err(|e| admission_conflict(e, "db_update_failed"))?;

    Ok(json!({ "student": current.to_json() }))
}

fn students_delete(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    ensure_exists(conn, "students", &student_id, "student")?;

    let invoice_count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM invoices WHERE student_id = ?",
            [&student_id],
            |r| r.get(0),
        )
        .map_err(HandlerErr::db("db_query_failed"))?;
    if invoice_count > 0 {
        return Err(HandlerErr::conflict("student has invoices")
            .with_details(json!({ "invoices": invoice_count })));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(HandlerErr::db("db_tx_failed"))?;
    tx.execute(
        "DELETE FROM student_field_values WHERE student_id = ?",
        [&student_id],
    )
    .map_err(HandlerErr::db_table("db_delete_failed", "student_field_values"))?;
    tx.execute(
        "DELETE FROM staged_line_items WHERE student_id = ?",
        [&student_id],
    )
    .map_err(HandlerErr::db_table("db_delete_failed", "staged_line_items"))?;
    tx.execute("DELETE FROM students WHERE id = ?", [&student_id])
        .map_err(HandlerErr::db_table("db_delete_failed", "students"))?;
    tx.commit().map_err(HandlerErr::db("db_commit_failed"))?;

    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let f: fn(&Connection, &Value) -> Result<Value, HandlerErr> = match req.method.as_str() {
        "students.list" => students_list,
        "students.create" => students_create,
        "students.update" => students_update,
        "students.delete" => students_delete,
        _ => return None,
    };
    let result = require_db(state).and_then(|conn| f(conn, &req.params));
    Some(respond(&req.id, result))
}
