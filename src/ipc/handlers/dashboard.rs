use crate::billing::InvoiceStatus;
use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::helpers::require_db;
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::{json, Map, Value};

fn count(conn: &Connection, sql: &str) -> Result<i64, HandlerErr> {
    conn.query_row(sql, [], |r| r.get(0))
        .map_err(HandlerErr::db("db_query_failed"))
}

fn dashboard_summary(conn: &Connection) -> Result<Value, HandlerErr> {
    let students_total = count(conn, "SELECT COUNT(*) FROM students")?;
    let students_active = count(conn, "SELECT COUNT(*) FROM students WHERE active = 1")?;

    let mut by_status = Map::new();
    for status in [
        InvoiceStatus::Draft,
        InvoiceStatus::Finalized,
        InvoiceStatus::Paid,
        InvoiceStatus::Void,
    ] {
        by_status.insert(status.as_str().to_string(), json!(0));
    }
    let mut stmt = conn
        .prepare("SELECT status, COUNT(*) FROM invoices GROUP BY status")
        .map_err(HandlerErr::db("db_query_failed"))?;
    let rows = stmt
        .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db("db_query_failed"))?;
    for (status, n) in rows {
        by_status.insert(status, json!(n));
    }

    // Billed minus paid across finalized invoices; paid ones are zero by construction.
    let outstanding_cents = count(
        conn,
        "SELECT
           COALESCE((SELECT SUM(l.amount_cents)
                     FROM invoice_line_items l
                     JOIN invoices i ON i.id = l.invoice_id
                     WHERE i.status = 'finalized'), 0)
         - COALESCE((SELECT SUM(p.amount_cents)
                     FROM payments p
                     JOIN invoices i ON i.id = p.invoice_id
                     WHERE i.status = 'finalized'), 0)",
    )?;
    let pending_batches = count(
        conn,
        "SELECT COUNT(*) FROM staging_batches WHERE status = 'pending'",
    )?;
    let pending_items = count(
        conn,
        "SELECT COUNT(*) FROM staged_line_items WHERE status = 'pending'",
    )?;
    let users_total = count(conn, "SELECT COUNT(*) FROM users")?;
    let users_active = count(conn, "SELECT COUNT(*) FROM users WHERE active = 1")?;

    Ok(json!({
        "students": { "total": students_total, "active": students_active },
        "invoices": Value::Object(by_status),
        "outstandingCents": outstanding_cents,
        "staging": { "pendingBatches": pending_batches, "pendingItems": pending_items },
        "users": { "total": users_total, "active": users_active }
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    if req.method != "dashboard.summary" {
        return None;
    }
    let result = require_db(state).and_then(dashboard_summary);
    Some(respond(&req.id, result))
}
