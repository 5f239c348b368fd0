use crate::billing::{self, InvoiceStatus, Totals};
use crate::db;
use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::handlers::setup::{billing_settings, BillingSettings};
use crate::ipc::helpers::{
    ensure_exists, get_optional_text, get_required_i64, get_required_str, get_required_text, new_id,
    require_db,
};
use crate::ipc::types::{AppState, Request};
use crate::staging::InvoiceRef;
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use std::path::PathBuf;

pub struct InvoiceRow {
    pub id: String,
    pub number: String,
    pub student_id: String,
    pub student_name: String,
    pub period: String,
    pub status: InvoiceStatus,
    pub issued_on: String,
    pub due_on: String,
    pub notes: Option<String>,
    pub created_by_batch_id: Option<String>,
    pub finalized_at: Option<String>,
    pub totals: Totals,
    pub line_count: i64,
}

impl InvoiceRow {
    fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "number": self.number,
            "studentId": self.student_id,
            "studentName": self.student_name,
            "period": self.period,
            "status": self.status.as_str(),
            "issuedOn": self.issued_on,
            "dueOn": self.due_on,
            "notes": self.notes,
            "createdByBatchId": self.created_by_batch_id,
            "finalizedAt": self.finalized_at,
            "lineCount": self.line_count,
            "subtotalCents": self.totals.subtotal_cents,
            "paidCents": self.totals.paid_cents,
            "balanceCents": self.totals.balance_cents()
        })
    }
}

const INVOICE_SELECT: &str = "SELECT i.id, i.number, i.student_id, s.last_name, s.first_name,
                                     i.period, i.status, i.issued_on, i.due_on, i.notes,
                                     i.created_by_batch_id, i.finalized_at,
                                     COALESCE((SELECT SUM(l.amount_cents) FROM invoice_line_items l
                                               WHERE l.invoice_id = i.id), 0),
                                     COALESCE((SELECT SUM(p.amount_cents) FROM payments p
                                               WHERE p.invoice_id = i.id), 0),
                                     (SELECT COUNT(*) FROM invoice_line_items l
                                      WHERE l.invoice_id = i.id)
                              FROM invoices i
                              JOIN students s ON s.id = i.student_id";

fn map_invoice(r: &rusqlite::Row<'_>) -> rusqlite::Result<InvoiceRow> {
    let status: String = r.get(6)?;
    Ok(InvoiceRow {
        id: r.get(0)?,
        number: r.get(1)?,
        student_id: r.get(2)?,
        student_name: format!("{}, {}", r.get::<_, String>(3)?, r.get::<_, String>(4)?),
        period: r.get(5)?,
        status: InvoiceStatus::parse(&status).unwrap_or(InvoiceStatus::Draft),
        issued_on: r.get(7)?,
        due_on: r.get(8)?,
        notes: r.get(9)?,
        created_by_batch_id: r.get(10)?,
        finalized_at: r.get(11)?,
        totals: Totals {
            subtotal_cents: r.get(12)?,
            paid_cents: r.get(13)?,
        },
        line_count: r.get(14)?,
    })
}

pub fn load_invoice(conn: &Connection, invoice_id: &str) -> Result<InvoiceRow, HandlerErr> {
    conn.query_row(
        &format!("{} WHERE i.id = ?", INVOICE_SELECT),
        [invoice_id],
        map_invoice,
    )
    .optional()
    .map_err(HandlerErr::db("db_query_failed"))?
    .ok_or_else(|| HandlerErr::not_found("invoice"))
}

/// The student's non-void invoice for a period, if any.
pub fn period_invoice(
    conn: &Connection,
    student_id: &str,
    period: &str,
) -> Result<Option<InvoiceRef>, HandlerErr> {
    let row: Option<(String, String)> = conn
        .query_row(
            "SELECT id, status FROM invoices
             WHERE student_id = ? AND period = ? AND status <> 'void'
             ORDER BY seq DESC LIMIT 1",
            (student_id, period),
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(HandlerErr::db("db_query_failed"))?;
    Ok(row.map(|(id, status)| InvoiceRef {
        id,
        status: InvoiceStatus::parse(&status).unwrap_or(InvoiceStatus::Draft),
    }))
}

pub struct NewInvoice<'a> {
    pub student_id: &'a str,
    pub period: &'a str,
    pub issued_on: NaiveDate,
    pub due_on: Option<NaiveDate>,
    pub notes: Option<String>,
    pub batch_id: Option<&'a str>,
}

/// Insert a draft invoice. Callers that batch several inserts pass a
/// transaction so sequence allocation stays consistent.
pub fn create_invoice(
    conn: &Connection,
    settings: &BillingSettings,
    new: NewInvoice<'_>,
) -> Result<(String, String), HandlerErr> {
    if let Some(existing) = period_invoice(conn, new.student_id, new.period)? {
        return Err(HandlerErr::conflict("student already has an invoice for this period")
            .with_details(json!({ "invoiceId": existing.id })));
    }
    let seq: i64 = conn
        .query_row("SELECT COALESCE(MAX(seq), 0) + 1 FROM invoices", [], |r| r.get(0))
        .map_err(HandlerErr::db("db_query_failed"))?;
    let number = billing::format_invoice_number(&settings.invoice_prefix, seq, settings.number_padding);
    let due_on = new
        .due_on
        .unwrap_or_else(|| billing::due_date(new.issued_on, settings.default_due_days));
    if due_on < new.issued_on {
        return Err(HandlerErr::bad_params("dueOn must not be before issuedOn"));
    }

    let invoice_id = new_id();
    conn.execute(
        "INSERT INTO invoices(
           id, seq, number, student_id, period, status, issued_on, due_on, notes,
           created_by_batch_id, created_at)
         VALUES(?, ?, ?, ?, ?, 'draft', ?, ?, ?, ?, ?)",
        (
            &invoice_id,
            seq,
            &number,
            new.student_id,
            new.period,
            new.issued_on.format("%Y-%m-%d").to_string(),
            due_on.format("%Y-%m-%d").to_string(),
            &new.notes,
            new.batch_id,
            db::now_rfc3339(),
        ),
    )
    .map_err(HandlerErr::db_table("db_insert_failed", "invoices"))?;
    Ok((invoice_id, number))
}

pub struct NewLine<'a> {
    pub invoice_id: &'a str,
    pub description: &'a str,
    pub quantity: i64,
    pub unit_amount_cents: i64,
    pub amount_cents: i64,
    pub source_rule_id: Option<&'a str>,
    pub batch_id: Option<&'a str>,
}

pub fn append_line(conn: &Connection, line: NewLine<'_>) -> Result<String, HandlerErr> {
    let sort_order: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(sort_order), -1) + 1 FROM invoice_line_items WHERE invoice_id = ?",
            [line.invoice_id],
            |r| r.get(0),
        )
        .map_err(HandlerErr::db("db_query_failed"))?;
    let line_id = new_id();
    conn.execute(
        "INSERT INTO invoice_line_items(
           id, invoice_id, description, quantity, unit_amount_cents, amount_cents,
           source_rule_id, batch_id, sort_order, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &line_id,
            line.invoice_id,
            line.description,
            line.quantity,
            line.unit_amount_cents,
            line.amount_cents,
            line.source_rule_id,
            line.batch_id,
            sort_order,
            db::now_rfc3339(),
        ),
    )
    .map_err(HandlerErr::db_table("db_insert_failed", "invoice_line_items"))?;
    Ok(line_id)
}

fn today() -> NaiveDate {
    chrono::Local::now().date_naive()
}

fn get_optional_date(params: &Value, key: &str) -> Result<Option<NaiveDate>, HandlerErr> {
    match get_optional_text(params, key, 10)? {
        None => Ok(None),
        Some(s) => billing::parse_date(&s).map(Some).map_err(HandlerErr::bad_params),
    }
}

fn get_period(params: &Value) -> Result<String, HandlerErr> {
    billing::normalize_period(&get_required_str(params, "period")?).map_err(HandlerErr::bad_params)
}

fn require_status(inv: &InvoiceRow, expected: InvoiceStatus, action: &str) -> Result<(), HandlerErr> {
    if inv.status != expected {
        return Err(HandlerErr::conflict(format!(
            "cannot {} a {} invoice",
            action,
            inv.status.as_str()
        ))
        .with_details(json!({ "status": inv.status.as_str() })));
    }
    Ok(())
}

fn invoices_create(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let period = get_period(params)?;
    let issued_on = get_optional_date(params, "issuedOn")?.unwrap_or_else(today);
    let due_on = get_optional_date(params, "dueOn")?;
    let notes = get_optional_text(params, "notes", 500)?;
    ensure_exists(conn, "students", &student_id, "student")?;
    let settings =
        billing_settings(conn).map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;

    let tx = conn
        .unchecked_transaction()
        .map_err(HandlerErr::db("db_tx_failed"))?;
    let (invoice_id, number) = create_invoice(
        &tx,
        &settings,
        NewInvoice {
            student_id: &student_id,
            period: &period,
            issued_on,
            due_on,
            notes,
            batch_id: None,
        },
    )?;
    tx.commit().map_err(HandlerErr::db("db_commit_failed"))?;

    Ok(json!({ "invoiceId": invoice_id, "number": number }))
}

fn invoices_list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let period = match get_optional_text(params, "period", billing::MAX_PERIOD_LEN)? {
        Some(p) => Some(billing::normalize_period(&p).map_err(HandlerErr::bad_params)?),
        None => None,
    };
    let student_id = get_optional_text(params, "studentId", 64)?;
    let status = match get_optional_text(params, "status", 16)? {
        Some(s) => Some(
            InvoiceStatus::parse(&s)
                .ok_or_else(|| HandlerErr::bad_params(format!("unknown status: {}", s)))?
                .as_str(),
        ),
        None => None,
    };

    let mut stmt = conn
        .prepare(&format!(
            "{}
             WHERE (?1 IS NULL OR i.period = ?1)
               AND (?2 IS NULL OR i.student_id = ?2)
               AND (?3 IS NULL OR i.status = ?3)
             ORDER BY i.seq",
            INVOICE_SELECT
        ))
        .map_err(HandlerErr::db("db_query_failed"))?;
    let invoices = stmt
        .query_map((period.as_deref(), student_id.as_deref(), status), map_invoice)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db("db_query_failed"))?;
    let out: Vec<Value> = invoices.iter().map(InvoiceRow::to_json).collect();
    Ok(json!({ "invoices": out }))
}

fn invoices_open(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let invoice_id = get_required_str(params, "invoiceId")?;
    let invoice = load_invoice(conn, &invoice_id)?;

    let mut stmt = conn
        .prepare(
            "SELECT id, description, quantity, unit_amount_cents, amount_cents,
                    source_rule_id, batch_id
             FROM invoice_line_items
             WHERE invoice_id = ?
             ORDER BY sort_order, id",
        )
        .map_err(HandlerErr::db("db_query_failed"))?;
    let lines = stmt
        .query_map([&invoice_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "description": r.get::<_, String>(1)?,
                "quantity": r.get::<_, i64>(2)?,
                "unitAmountCents": r.get::<_, i64>(3)?,
                "amountCents": r.get::<_, i64>(4)?,
                "sourceRuleId": r.get::<_, Option<String>>(5)?,
                "batchId": r.get::<_, Option<String>>(6)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db("db_query_failed"))?;

    let mut stmt = conn
        .prepare(
            "SELECT id, amount_cents, method, reference, paid_on
             FROM payments
             WHERE invoice_id = ?
             ORDER BY paid_on, created_at",
        )
        .map_err(HandlerErr::db("db_query_failed"))?;
    let payments = stmt
        .query_map([&invoice_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "amountCents": r.get::<_, i64>(1)?,
                "method": r.get::<_, Option<String>>(2)?,
                "reference": r.get::<_, Option<String>>(3)?,
                "paidOn": r.get::<_, String>(4)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db("db_query_failed"))?;

    Ok(json!({
        "invoice": invoice.to_json(),
        "lines": lines,
        "payments": payments,
        "totals": {
            "subtotalCents": invoice.totals.subtotal_cents,
            "paidCents": invoice.totals.paid_cents,
            "balanceCents": invoice.totals.balance_cents()
        }
    }))
}

fn invoices_add_line(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let invoice_id = get_required_str(params, "invoiceId")?;
    let description = get_required_text(params, "description", 240)?;
    let quantity = match params.get("quantity") {
        None | Some(Value::Null) => 1,
        Some(_) => get_required_i64(params, "quantity")?,
    };
    billing::validate_quantity(quantity).map_err(HandlerErr::bad_params)?;
    let unit_amount_cents = get_required_i64(params, "unitAmountCents")?;
    let amount_cents = billing::line_amount(quantity, unit_amount_cents)
        .ok_or_else(|| HandlerErr::bad_params("quantity * unitAmountCents overflows"))?;

    let invoice = load_invoice(conn, &invoice_id)?;
    require_status(&invoice, InvoiceStatus::Draft, "add lines to")?;

    let line_id = append_line(
        conn,
        NewLine {
            invoice_id: &invoice_id,
            description: &description,
            quantity,
            unit_amount_cents,
            amount_cents,
            source_rule_id: None,
            batch_id: None,
        },
    )?;
    Ok(json!({ "lineId": line_id, "amountCents": amount_cents }))
}

fn invoices_remove_line(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let line_id = get_required_str(params, "lineId")?;
    let invoice_id: String = conn
        .query_row(
            "SELECT invoice_id FROM invoice_line_items WHERE id = ?",
            [&line_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::db("db_query_failed"))?
        .ok_or_else(|| HandlerErr::not_found("line item"))?;
    let invoice = load_invoice(conn, &invoice_id)?;
    require_status(&invoice, InvoiceStatus::Draft, "remove lines from")?;

    conn.execute("DELETE FROM invoice_line_items WHERE id = ?", [&line_id])
        .map_err(HandlerErr::db_table("db_delete_failed", "invoice_line_items"))?;
    Ok(json!({ "ok": true }))
}

fn invoices_finalize(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let invoice_id = get_required_str(params, "invoiceId")?;
    let invoice = load_invoice(conn, &invoice_id)?;
    require_status(&invoice, InvoiceStatus::Draft, "finalize")?;
    if invoice.line_count == 0 {
        return Err(HandlerErr::conflict("cannot finalize an invoice without lines"));
    }

    conn.execute(
        "UPDATE invoices SET status = 'finalized', finalized_at = ? WHERE id = ?",
        (db::now_rfc3339(), &invoice_id),
    )
    .map_err(HandlerErr::db_table("db_update_failed", "invoices"))?;
    tracing::info!(invoice = %invoice.number, total_cents = invoice.totals.subtotal_cents, "invoice finalized");

    let invoice = load_invoice(conn, &invoice_id)?;
    Ok(json!({ "invoice": invoice.to_json() }))
}

fn invoices_void(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let invoice_id = get_required_str(params, "invoiceId")?;
    let invoice = load_invoice(conn, &invoice_id)?;
    require_status(&invoice, InvoiceStatus::Finalized, "void")?;
    if invoice.totals.paid_cents != 0 {
        return Err(HandlerErr::conflict("cannot void an invoice with payments"));
    }

    conn.execute(
        "UPDATE invoices SET status = 'void' WHERE id = ?",
        [&invoice_id],
    )
    .map_err(HandlerErr::db_table("db_update_failed", "invoices"))?;
    tracing::info!(invoice = %invoice.number, "invoice voided");
    Ok(json!({ "ok": true }))
}

fn invoices_delete(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let invoice_id = get_required_str(params, "invoiceId")?;
    let invoice = load_invoice(conn, &invoice_id)?;
    require_status(&invoice, InvoiceStatus::Draft, "delete")?;

    let tx = conn
        .unchecked_transaction()
        .map_err(HandlerErr::db("db_tx_failed"))?;
    tx.execute(
        "DELETE FROM invoice_line_items WHERE invoice_id = ?",
        [&invoice_id],
    )
    .map_err(HandlerErr::db_table("db_delete_failed", "invoice_line_items"))?;
    tx.execute("DELETE FROM invoices WHERE id = ?", [&invoice_id])
        .map_err(HandlerErr::db_table("db_delete_failed", "invoices"))?;
    tx.commit().map_err(HandlerErr::db("db_commit_failed"))?;

    Ok(json!({ "ok": true }))
}

fn invoices_record_payment(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let invoice_id = get_required_str(params, "invoiceId")?;
    let amount_cents = get_required_i64(params, "amountCents")?;
    let method = get_optional_text(params, "method", 32)?;
    let reference = get_optional_text(params, "reference", 64)?;
    let paid_on = get_optional_date(params, "paidOn")?.unwrap_or_else(today);

    let invoice = load_invoice(conn, &invoice_id)?;
    require_status(&invoice, InvoiceStatus::Finalized, "record a payment on")?;
    let balance = invoice.totals.balance_cents();
    if amount_cents <= 0 || amount_cents > balance {
        return Err(HandlerErr::bad_params(format!(
            "amountCents must be in 1..={}",
            balance
        ))
        .with_details(json!({ "balanceCents": balance })));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(HandlerErr::db("db_tx_failed"))?;
    let payment_id = new_id();
    tx.execute(
        "INSERT INTO payments(id, invoice_id, amount_cents, method, reference, paid_on, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &payment_id,
            &invoice_id,
            amount_cents,
            &method,
            &reference,
            paid_on.format("%Y-%m-%d").to_string(),
            db::now_rfc3339(),
        ),
    )
    .map_err(HandlerErr::db_table("db_insert_failed", "payments"))?;
    let remaining = balance - amount_cents;
    let status = if remaining == 0 {
        tx.execute("UPDATE invoices SET status = 'paid' WHERE id = ?", [&invoice_id])
            .map_err(HandlerErr::db_table("db_update_failed", "invoices"))?;
        InvoiceStatus::Paid
    } else {
        InvoiceStatus::Finalized
    };
    tx.commit().map_err(HandlerErr::db("db_commit_failed"))?;

    Ok(json!({
        "paymentId": payment_id,
        "status": status.as_str(),
        "balanceCents": remaining
    }))
}

fn csv_quote(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

fn invoices_export_csv(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let out_path = get_required_str(params, "outPath")?;
    let period = match get_optional_text(params, "period", billing::MAX_PERIOD_LEN)? {
        Some(p) => Some(billing::normalize_period(&p).map_err(HandlerErr::bad_params)?),
        None => None,
    };

    let mut stmt = conn
        .prepare(
            "SELECT i.number, s.admission_no, s.last_name, s.first_name, i.period, i.status,
                    i.issued_on, i.due_on, l.description, l.quantity, l.unit_amount_cents,
                    l.amount_cents
             FROM invoice_line_items l
             JOIN invoices i ON i.id = l.invoice_id
             JOIN students s ON s.id = i.student_id
             WHERE (?1 IS NULL OR i.period = ?1)
             ORDER BY i.seq, l.sort_order, l.id",
        )
        .map_err(HandlerErr::db("db_query_failed"))?;
    let rows = stmt
        .query_map([period.as_deref()], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, Option<String>>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, String>(4)?,
                r.get::<_, String>(5)?,
                r.get::<_, String>(6)?,
                r.get::<_, String>(7)?,
                r.get::<_, String>(8)?,
                r.get::<_, i64>(9)?,
                r.get::<_, i64>(10)?,
                r.get::<_, i64>(11)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db("db_query_failed"))?;

    let mut csv = String::from(
        "invoice_number,admission_no,student_name,period,status,issued_on,due_on,description,quantity,unit_amount,amount\n",
    );
    let rows_exported = rows.len();
    for (number, admission_no, last, first, period, status, issued_on, due_on, description, quantity, unit, amount) in rows {
        let display_name = format!("{}, {}", last, first);
        csv.push_str(&format!(
            "{},{},{},{},{},{},{},{},{},{},{}\n",
            csv_quote(&number),
            csv_quote(admission_no.as_deref().unwrap_or("")),
            csv_quote(&display_name),
            csv_quote(&period),
            status,
            issued_on,
            due_on,
            csv_quote(&description),
            quantity,
            billing::cents_to_decimal(unit),
            billing::cents_to_decimal(amount)
        ));
    }

    let io_err = |e: std::io::Error| {
        HandlerErr::new("io_failed", e.to_string()).with_details(json!({ "path": out_path }))
    };
    let out = PathBuf::from(&out_path);
    if let Some(parent) = out.parent() {
        std::fs::create_dir_all(parent).map_err(|e| io_err(e))?;
    }
    std::fs::write(&out, csv).map_err(|e| io_err(e))?;

    Ok(json!({ "ok": true, "rowsExported": rows_exported, "path": out_path }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let f: fn(&Connection, &Value) -> Result<Value, HandlerErr> = match req.method.as_str() {
        "invoices.create" => invoices_create,
        "invoices.list" => invoices_list,
        "invoices.open" => invoices_open,
        "invoices.addLine" => invoices_add_line,
        "invoices.removeLine" => invoices_remove_line,
        "invoices.finalize" => invoices_finalize,
        "invoices.void" => invoices_void,
        "invoices.delete" => invoices_delete,
        "invoices.recordPayment" => invoices_record_payment,
        "invoices.exportCsv" => invoices_export_csv,
        _ => return None,
    };
    let result = require_db(state).and_then(|conn| f(conn, &req.params));
    Some(respond(&req.id, result))
}
