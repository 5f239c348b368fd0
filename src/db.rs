use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub const DB_FILE_NAME: &str = "campus.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS users(
            id TEXT PRIMARY KEY,
            email TEXT NOT NULL UNIQUE,
            display_name TEXT NOT NULL,
            role TEXT NOT NULL,
            active INTEGER NOT NULL,
            permissions_json TEXT NOT NULL DEFAULT '[]',
            created_at TEXT NOT NULL,
            updated_at TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            admission_no TEXT UNIQUE,
            last_name TEXT NOT NULL,
            first_name TEXT NOT NULL,
            grade_level TEXT,
            active INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_name ON students(last_name, first_name)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS custom_fields(
            id TEXT PRIMARY KEY,
            key TEXT NOT NULL UNIQUE,
            label TEXT NOT NULL,
            field_type TEXT NOT NULL,
            options_json TEXT NOT NULL DEFAULT '[]',
            sort_order INTEGER NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS student_field_values(
            student_id TEXT NOT NULL,
            field_id TEXT NOT NULL,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY(student_id, field_id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(field_id) REFERENCES custom_fields(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_student_field_values_field ON student_field_values(field_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS line_item_rules(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            description TEXT NOT NULL,
            field_id TEXT NOT NULL,
            operator TEXT NOT NULL,
            operand_json TEXT NOT NULL,
            quantity INTEGER NOT NULL,
            unit_amount_cents INTEGER NOT NULL,
            active INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT,
            FOREIGN KEY(field_id) REFERENCES custom_fields(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_line_item_rules_field ON line_item_rules(field_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS staging_batches(
            id TEXT PRIMARY KEY,
            period TEXT NOT NULL,
            status TEXT NOT NULL,
            created_at TEXT NOT NULL,
            committed_at TEXT,
            closed_at TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS invoices(
            id TEXT PRIMARY KEY,
            seq INTEGER NOT NULL UNIQUE,
            number TEXT NOT NULL UNIQUE,
            student_id TEXT NOT NULL,
            period TEXT NOT NULL,
            status TEXT NOT NULL,
            issued_on TEXT NOT NULL,
            due_on TEXT NOT NULL,
            notes TEXT,
            created_by_batch_id TEXT,
            created_at TEXT NOT NULL,
            finalized_at TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(created_by_batch_id) REFERENCES staging_batches(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_invoices_student_period ON invoices(student_id, period)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_invoices_period ON invoices(period)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS invoice_line_items(
            id TEXT PRIMARY KEY,
            invoice_id TEXT NOT NULL,
            description TEXT NOT NULL,
            quantity INTEGER NOT NULL,
            unit_amount_cents INTEGER NOT NULL,
            amount_cents INTEGER NOT NULL,
            source_rule_id TEXT,
            batch_id TEXT,
            sort_order INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY(invoice_id) REFERENCES invoices(id),
            FOREIGN KEY(batch_id) REFERENCES staging_batches(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_invoice_line_items_invoice ON invoice_line_items(invoice_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_invoice_line_items_batch ON invoice_line_items(batch_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_invoice_line_items_rule ON invoice_line_items(source_rule_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS payments(
            id TEXT PRIMARY KEY,
            invoice_id TEXT NOT NULL,
            amount_cents INTEGER NOT NULL,
            method TEXT,
            reference TEXT,
            paid_on TEXT NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY(invoice_id) REFERENCES invoices(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_payments_invoice ON payments(invoice_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS staged_line_items(
            id TEXT PRIMARY KEY,
            batch_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            rule_id TEXT NOT NULL,
            period TEXT NOT NULL,
            description TEXT NOT NULL,
            quantity INTEGER NOT NULL,
            unit_amount_cents INTEGER NOT NULL,
            amount_cents INTEGER NOT NULL,
            status TEXT NOT NULL,
            line_item_id TEXT,
            skip_reason TEXT,
            sort_order INTEGER NOT NULL,
            FOREIGN KEY(batch_id) REFERENCES staging_batches(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_staged_line_items_batch ON staged_line_items(batch_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_staged_line_items_student ON staged_line_items(student_id)",
        [],
    )?;
    // A (student, rule, period) triple may be pending in at most one batch.
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_staged_line_items_pending
         ON staged_line_items(student_id, rule_id, period)
         WHERE status = 'pending'",
        [],
    )?;

    Ok(conn)
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    let Some(raw) = raw else {
        return Ok(None);
    };
    // A corrupt value reads as unset rather than failing the caller.
    Ok(serde_json::from_str(&raw).ok())
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    let text = serde_json::to_string(value)?;
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, &text),
    )?;
    Ok(())
}

pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}
