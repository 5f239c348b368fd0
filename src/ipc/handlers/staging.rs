use crate::billing::{self, InvoiceStatus};
use crate::db;
use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::handlers::invoices::{append_line, create_invoice, period_invoice, NewInvoice, NewLine};
use crate::ipc::handlers::rules::{list_rules, roster};
use crate::ipc::handlers::setup::{billing_settings, staging_settings};
use crate::ipc::helpers::{get_optional_str_list, get_optional_text, get_required_str, new_id, require_db};
use crate::ipc::types::{AppState, Request};
use crate::staging::{self, InvoiceRef, PairKey, Plan, PlanInput, RuleSpec, StudentRow};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BatchStatus {
    Pending,
    Committed,
    Discarded,
    Reverted,
}

impl BatchStatus {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "committed" => Some(Self::Committed),
            "discarded" => Some(Self::Discarded),
            "reverted" => Some(Self::Reverted),
            _ => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Committed => "committed",
            Self::Discarded => "discarded",
            Self::Reverted => "reverted",
        }
    }
}

struct Evaluation {
    period: String,
    plan: Plan,
    invalid_rules: Vec<Value>,
}

fn get_period(params: &Value) -> Result<String, HandlerErr> {
    billing::normalize_period(&get_required_str(params, "period")?).map_err(HandlerErr::bad_params)
}

/// Active rules (or exactly the listed ones) whose condition still builds.
fn load_rule_specs(
    conn: &Connection,
    rule_ids: Option<&[String]>,
) -> Result<(Vec<RuleSpec>, Vec<Value>), HandlerErr> {
    let rules = list_rules(conn)?;
    if let Some(ids) = rule_ids {
        for id in ids {
            match rules.iter().find(|r| &r.id == id) {
                None => {
                    return Err(HandlerErr::not_found("rule").with_details(json!({ "ruleId": id })))
                }
                Some(r) if !r.active => {
                    return Err(HandlerErr::bad_params(format!("rule is inactive: {}", r.name))
                        .with_details(json!({ "ruleId": id })))
                }
                Some(_) => {}
            }
        }
    }

    let mut specs = Vec::new();
    let mut invalid = Vec::new();
    for rule in rules {
        let selected = match rule_ids {
            Some(ids) => ids.contains(&rule.id),
            None => rule.active,
        };
        if !selected {
            continue;
        }
        match rule.to_spec() {
            Ok(spec) => specs.push(spec),
            Err(message) => {
                tracing::warn!(rule_id = %rule.id, %message, "rule skipped: condition no longer valid");
                invalid.push(json!({ "ruleId": rule.id, "name": rule.name, "message": message }));
            }
        }
    }
    Ok((specs, invalid))
}

fn query_pairs(conn: &Connection, sql: &str, period: &str) -> Result<HashSet<PairKey>, HandlerErr> {
    let mut stmt = conn.prepare(sql).map_err(HandlerErr::db("db_query_failed"))?;
    let pairs = stmt
        .query_map([period], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))
        .and_then(|it| it.collect::<Result<HashSet<_>, _>>())
        .map_err(HandlerErr::db("db_query_failed"))?;
    Ok(pairs)
}

/// Load everything the planner needs and run it.
fn evaluate(conn: &Connection, params: &Value) -> Result<Evaluation, HandlerErr> {
    let period = get_period(params)?;
    let rule_ids = get_optional_str_list(params, "ruleIds")?;
    let student_ids = get_optional_str_list(params, "studentIds")?;
    let settings =
        staging_settings(conn).map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;

    let (rules, invalid_rules) = load_rule_specs(conn, rule_ids.as_deref())?;
    let students: Vec<StudentRow> = roster(conn, student_ids.as_deref())?
        .into_iter()
        .map(|(id, display_name, active)| StudentRow {
            id,
            display_name,
            active,
        })
        .collect();

    let mut stmt = conn
        .prepare("SELECT student_id, field_id, value FROM student_field_values")
        .map_err(HandlerErr::db("db_query_failed"))?;
    let values: HashMap<PairKey, String> = stmt
        .query_map([], |r| {
            Ok((
                (r.get::<_, String>(0)?, r.get::<_, String>(1)?),
                r.get::<_, String>(2)?,
            ))
        })
        .and_then(|it| it.collect::<Result<HashMap<_, _>, _>>())
        .map_err(HandlerErr::db("db_query_failed"))?;

    let committed = query_pairs(
        conn,
        "SELECT i.student_id, l.source_rule_id
         FROM invoice_line_items l
         JOIN invoices i ON i.id = l.invoice_id
         WHERE i.period = ? AND i.status <> 'void' AND l.source_rule_id IS NOT NULL",
        &period,
    )?;
    let pending = query_pairs(
        conn,
        "SELECT student_id, rule_id FROM staged_line_items
         WHERE period = ? AND status = 'pending'",
        &period,
    )?;

    let mut stmt = conn
        .prepare(
            "SELECT student_id, id, status FROM invoices
             WHERE period = ? AND status <> 'void'",
        )
        .map_err(HandlerErr::db("db_query_failed"))?;
    let invoices: HashMap<String, InvoiceRef> = stmt
        .query_map([&period], |r| {
            let status: String = r.get(2)?;
            Ok((
                r.get::<_, String>(0)?,
                InvoiceRef {
                    id: r.get(1)?,
                    status: InvoiceStatus::parse(&status).unwrap_or(InvoiceStatus::Draft),
                },
            ))
        })
        .and_then(|it| it.collect::<Result<HashMap<_, _>, _>>())
        .map_err(HandlerErr::db("db_query_failed"))?;

    let plan = staging::plan(&PlanInput {
        rules: &rules,
        students: &students,
        values: &values,
        committed: &committed,
        pending: &pending,
        invoices: &invoices,
        require_active: settings.require_active_students,
    });
    Ok(Evaluation {
        period,
        plan,
        invalid_rules,
    })
}

fn staging_preview(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let eval = evaluate(conn, params)?;
    Ok(json!({
        "period": eval.period,
        "candidates": eval.plan.candidates.iter().map(staging::candidate_json).collect::<Vec<_>>(),
        "skipped": eval.plan.skipped.iter().map(staging::skipped_json).collect::<Vec<_>>(),
        "totalCents": eval.plan.total_cents(),
        "invalidRules": eval.invalid_rules
    }))
}

fn staging_stage(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let max_items = staging_settings(conn)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?
        .max_items_per_batch;

    let tx = conn
        .unchecked_transaction()
        .map_err(HandlerErr::db("db_tx_failed"))?;
    let eval = evaluate(&tx, params)?;
    let skipped: Vec<Value> = eval.plan.skipped.iter().map(staging::skipped_json).collect();
    if eval.plan.candidates.is_empty() {
        return Ok(json!({
            "batchId": Value::Null,
            "staged": 0,
            "skipped": skipped,
            "invalidRules": eval.invalid_rules,
            "totalCents": 0
        }));
    }
    if eval.plan.candidates.len() > max_items {
        return Err(HandlerErr::bad_params(format!(
            "{} items exceed the batch limit of {}",
            eval.plan.candidates.len(),
            max_items
        ))
        .with_details(json!({ "candidates": eval.plan.candidates.len(), "maxItemsPerBatch": max_items })));
    }

    let batch_id = new_id();
    tx.execute(
        "INSERT INTO staging_batches(id, period, status, created_at) VALUES(?, ?, 'pending', ?)",
        (&batch_id, &eval.period, db::now_rfc3339()),
    )
    .map_err(HandlerErr::db_table("db_insert_failed", "staging_batches"))?;
    {
        let mut insert = tx
            .prepare(
                "INSERT INTO staged_line_items(
                   id, batch_id, student_id, rule_id, period, description, quantity,
                   unit_amount_cents, amount_cents, status, sort_order)
                 VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, 'pending', ?)",
            )
            .map_err(HandlerErr::db("db_query_failed"))?;
        for (i, c) in eval.plan.candidates.iter().enumerate() {
            insert
                .execute((
                    new_id(),
                    &batch_id,
                    &c.student_id,
                    &c.rule_id,
                    &eval.period,
                    &c.description,
                    c.quantity,
                    c.unit_amount_cents,
                    c.amount_cents,
                    i as i64,
                ))
                .map_err(HandlerErr::db_table("db_insert_failed", "staged_line_items"))?;
        }
    }
    tx.commit().map_err(HandlerErr::db("db_commit_failed"))?;

    let total_cents = eval.plan.total_cents();
    tracing::info!(
        batch_id = %batch_id,
        period = %eval.period,
        staged = eval.plan.candidates.len(),
        skipped = skipped.len(),
        total_cents,
        "staging batch created"
    );
    Ok(json!({
        "batchId": batch_id,
        "staged": eval.plan.candidates.len(),
        "skipped": skipped,
        "invalidRules": eval.invalid_rules,
        "totalCents": total_cents
    }))
}

struct BatchRow {
    id: String,
    period: String,
    status: BatchStatus,
    created_at: String,
    committed_at: Option<String>,
    closed_at: Option<String>,
    item_count: i64,
    total_cents: i64,
    pending_count: i64,
    committed_count: i64,
    skipped_count: i64,
}

impl BatchRow {
    fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "period": self.period,
            "status": self.status.as_str(),
            "createdAt": self.created_at,
            "committedAt": self.committed_at,
            "closedAt": self.closed_at,
            "itemCount": self.item_count,
            "totalCents": self.total_cents,
            "pendingCount": self.pending_count,
            "committedCount": self.committed_count,
            "skippedCount": self.skipped_count
        })
    }
}

const BATCH_SELECT: &str = "SELECT b.id, b.period, b.status, b.created_at, b.committed_at, b.closed_at,
                                   COUNT(s.id),
                                   COALESCE(SUM(s.amount_cents), 0),
                                   COALESCE(SUM(s.status = 'pending'), 0),
                                   COALESCE(SUM(s.status = 'committed'), 0),
                                   COALESCE(SUM(s.status = 'skipped'), 0)
                            FROM staging_batches b
                            LEFT JOIN staged_line_items s ON s.batch_id = b.id";

fn map_batch(r: &rusqlite::Row<'_>) -> rusqlite::Result<BatchRow> {
    let status: String = r.get(2)?;
    Ok(BatchRow {
        id: r.get(0)?,
        period: r.get(1)?,
        status: BatchStatus::parse(&status).unwrap_or(BatchStatus::Pending),
        created_at: r.get(3)?,
        committed_at: r.get(4)?,
        closed_at: r.get(5)?,
        item_count: r.get(6)?,
        total_cents: r.get(7)?,
        pending_count: r.get(8)?,
        committed_count: r.get(9)?,
        skipped_count: r.get(10)?,
    })
}

fn load_batch(conn: &Connection, batch_id: &str) -> Result<BatchRow, HandlerErr> {
    conn.query_row(
        &format!("{} WHERE b.id = ? GROUP BY b.id", BATCH_SELECT),
        [batch_id],
        map_batch,
    )
    .optional()
    .map_err(HandlerErr::db("db_query_failed"))?
    .ok_or_else(|| HandlerErr::not_found("batch"))
}

fn staging_batches(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let status = match get_optional_text(params, "status", 16)? {
        Some(s) => Some(
            BatchStatus::parse(&s)
                .ok_or_else(|| HandlerErr::bad_params(format!("unknown batch status: {}", s)))?
                .as_str(),
        ),
        None => None,
    };
    let mut stmt = conn
        .prepare(&format!(
            "{}
             WHERE (?1 IS NULL OR b.status = ?1)
             GROUP BY b.id
             ORDER BY b.created_at DESC, b.id",
            BATCH_SELECT
        ))
        .map_err(HandlerErr::db("db_query_failed"))?;
    let batches = stmt
        .query_map([status], map_batch)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db("db_query_failed"))?;
    let out: Vec<Value> = batches.iter().map(BatchRow::to_json).collect();
    Ok(json!({ "batches": out }))
}

fn staging_open(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let batch_id = get_required_str(params, "batchId")?;
    let batch = load_batch(conn, &batch_id)?;

    let mut stmt = conn
        .prepare(
            "SELECT s.id, s.student_id, st.last_name, st.first_name, s.rule_id, r.name,
                    s.description, s.quantity, s.unit_amount_cents, s.amount_cents,
                    s.status, s.line_item_id, s.skip_reason
             FROM staged_line_items s
             LEFT JOIN students st ON st.id = s.student_id
             LEFT JOIN line_item_rules r ON r.id = s.rule_id
             WHERE s.batch_id = ?
             ORDER BY s.sort_order, s.id",
        )
        .map_err(HandlerErr::db("db_query_failed"))?;
    let items = stmt
        .query_map([&batch_id], |r| {
            let last: Option<String> = r.get(2)?;
            let first: Option<String> = r.get(3)?;
            let student_name = match (last, first) {
                (Some(l), Some(f)) => Some(format!("{}, {}", l, f)),
                _ => None,
            };
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "studentId": r.get::<_, String>(1)?,
                "studentName": student_name,
                "ruleId": r.get::<_, String>(4)?,
                "ruleName": r.get::<_, Option<String>>(5)?,
                "description": r.get::<_, String>(6)?,
                "quantity": r.get::<_, i64>(7)?,
                "unitAmountCents": r.get::<_, i64>(8)?,
                "amountCents": r.get::<_, i64>(9)?,
                "status": r.get::<_, String>(10)?,
                "lineItemId": r.get::<_, Option<String>>(11)?,
                "skipReason": r.get::<_, Option<String>>(12)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db("db_query_failed"))?;

    Ok(json!({ "batch": batch.to_json(), "items": items }))
}

fn require_batch_status(batch: &BatchRow, expected: BatchStatus, action: &str) -> Result<(), HandlerErr> {
    if batch.status != expected {
        return Err(HandlerErr::conflict(format!(
            "cannot {} a {} batch",
            action,
            batch.status.as_str()
        ))
        .with_details(json!({ "status": batch.status.as_str() })));
    }
    Ok(())
}

fn staging_remove_item(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let item_id = get_required_str(params, "stagedItemId")?;
    let batch_id: String = conn
        .query_row(
            "SELECT batch_id FROM staged_line_items WHERE id = ?",
            [&item_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::db("db_query_failed"))?
        .ok_or_else(|| HandlerErr::not_found("staged item"))?;
    let batch = load_batch(conn, &batch_id)?;
    require_batch_status(&batch, BatchStatus::Pending, "edit")?;

    conn.execute("DELETE FROM staged_line_items WHERE id = ?", [&item_id])
        .map_err(HandlerErr::db_table("db_delete_failed", "staged_line_items"))?;
    Ok(json!({ "ok": true, "remaining": batch.item_count - 1 }))
}

struct PendingItem {
    id: String,
    student_id: String,
    rule_id: String,
    description: String,
    quantity: i64,
    unit_amount_cents: i64,
    amount_cents: i64,
}

fn staging_commit(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let batch_id = get_required_str(params, "batchId")?;
    let batch = load_batch(conn, &batch_id)?;
    require_batch_status(&batch, BatchStatus::Pending, "commit")?;
    let settings =
        billing_settings(conn).map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    let issued_on = chrono::Local::now().date_naive();

    let tx = conn
        .unchecked_transaction()
        .map_err(HandlerErr::db("db_tx_failed"))?;
    let items: Vec<PendingItem> = {
        let mut stmt = tx
            .prepare(
                "SELECT id, student_id, rule_id, description, quantity, unit_amount_cents, amount_cents
                 FROM staged_line_items
                 WHERE batch_id = ? AND status = 'pending'
                 ORDER BY sort_order, id",
            )
            .map_err(HandlerErr::db("db_query_failed"))?;
        let rows = stmt
            .query_map([&batch_id], |r| {
                Ok(PendingItem {
                    id: r.get(0)?,
                    student_id: r.get(1)?,
                    rule_id: r.get(2)?,
                    description: r.get(3)?,
                    quantity: r.get(4)?,
                    unit_amount_cents: r.get(5)?,
                    amount_cents: r.get(6)?,
                })
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(HandlerErr::db("db_query_failed"))?;
        rows
    };

    let mut committed = 0usize;
    let mut skipped = 0usize;
    let mut invoices_created: Vec<Value> = Vec::new();
    let mut total_cents = 0i64;
    for item in &items {
        let invoice_id = match period_invoice(&tx, &item.student_id, &batch.period)? {
            Some(inv) if inv.status == InvoiceStatus::Draft => inv.id,
            Some(_) => {
                tx.execute(
                    "UPDATE staged_line_items SET status = 'skipped', skip_reason = 'invoice_locked'
                     WHERE id = ?",
                    [&item.id],
                )
                .map_err(HandlerErr::db_table("db_update_failed", "staged_line_items"))?;
                skipped += 1;
                continue;
            }
            None => {
                let (id, number) = create_invoice(
                    &tx,
                    &settings,
                    NewInvoice {
                        student_id: &item.student_id,
                        period: &batch.period,
                        issued_on,
                        due_on: None,
                        notes: None,
                        batch_id: Some(batch_id.as_str()),
                    },
                )?;
                invoices_created.push(json!({ "invoiceId": id, "number": number }));
                id
            }
        };
        let line_id = append_line(
            &tx,
            NewLine {
                invoice_id: &invoice_id,
                description: &item.description,
                quantity: item.quantity,
                unit_amount_cents: item.unit_amount_cents,
                amount_cents: item.amount_cents,
                source_rule_id: Some(item.rule_id.as_str()),
                batch_id: Some(batch_id.as_str()),
            },
        )?;
        tx.execute(
            "UPDATE staged_line_items SET status = 'committed', line_item_id = ? WHERE id = ?",
            (&line_id, &item.id),
        )
        .map_err(HandlerErr::db_table("db_update_failed", "staged_line_items"))?;
        committed += 1;
        total_cents = total_cents
            .checked_add(item.amount_cents)
            .ok_or_else(|| HandlerErr::bad_params("batch total overflows"))?;
    }

    tx.execute(
        "UPDATE staging_batches SET status = 'committed', committed_at = ? WHERE id = ?",
        (db::now_rfc3339(), &batch_id),
    )
    .map_err(HandlerErr::db_table("db_update_failed", "staging_batches"))?;
    tx.commit().map_err(HandlerErr::db("db_commit_failed"))?;

    tracing::info!(
        batch_id = %batch_id,
        committed,
        skipped,
        invoices_created = invoices_created.len(),
        total_cents,
        "staging batch committed"
    );
    Ok(json!({
        "batchId": batch_id,
        "status": BatchStatus::Committed.as_str(),
        "committed": committed,
        "skipped": skipped,
        "invoicesCreated": invoices_created,
        "totalCents": total_cents
    }))
}

fn staging_undo(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let batch_id = get_required_str(params, "batchId")?;
    let batch = load_batch(conn, &batch_id)?;

    match batch.status {
        BatchStatus::Pending => {
            let tx = conn
                .unchecked_transaction()
                .map_err(HandlerErr::db("db_tx_failed"))?;
            let removed = tx
                .execute("DELETE FROM staged_line_items WHERE batch_id = ?", [&batch_id])
                .map_err(HandlerErr::db_table("db_delete_failed", "staged_line_items"))?;
            tx.execute(
                "UPDATE staging_batches SET status = 'discarded', closed_at = ? WHERE id = ?",
                (db::now_rfc3339(), &batch_id),
            )
            .map_err(HandlerErr::db_table("db_update_failed", "staging_batches"))?;
            tx.commit().map_err(HandlerErr::db("db_commit_failed"))?;

            tracing::info!(batch_id = %batch_id, removed, "staging batch discarded");
            Ok(json!({
                "batchId": batch_id,
                "status": BatchStatus::Discarded.as_str(),
                "removedItems": removed
            }))
        }
        BatchStatus::Committed => {
            let mut stmt = conn
                .prepare(
                    "SELECT DISTINCT i.id, i.number, i.status
                     FROM invoice_line_items l
                     JOIN invoices i ON i.id = l.invoice_id
                     WHERE l.batch_id = ? AND i.status <> 'draft'
                     ORDER BY i.number",
                )
                .map_err(HandlerErr::db("db_query_failed"))?;
            let locked = stmt
                .query_map([&batch_id], |r| {
                    Ok(json!({
                        "invoiceId": r.get::<_, String>(0)?,
                        "number": r.get::<_, String>(1)?,
                        "status": r.get::<_, String>(2)?
                    }))
                })
                .and_then(|it| it.collect::<Result<Vec<_>, _>>())
                .map_err(HandlerErr::db("db_query_failed"))?;
            if !locked.is_empty() {
                return Err(HandlerErr::conflict(
                    "batch lines sit on invoices that are no longer drafts",
                )
                .with_details(json!({ "invoices": locked })));
            }

            let tx = conn
                .unchecked_transaction()
                .map_err(HandlerErr::db("db_tx_failed"))?;
            let lines_removed = tx
                .execute("DELETE FROM invoice_line_items WHERE batch_id = ?", [&batch_id])
                .map_err(HandlerErr::db_table("db_delete_failed", "invoice_line_items"))?;
            let invoices_removed = tx
                .execute(
                    "DELETE FROM invoices
                     WHERE created_by_batch_id = ?
                       AND status = 'draft'
                       AND NOT EXISTS (
                         SELECT 1 FROM invoice_line_items l WHERE l.invoice_id = invoices.id
                       )",
                    [&batch_id],
                )
                .map_err(HandlerErr::db_table("db_delete_failed", "invoices"))?;
            tx.execute(
                "UPDATE staged_line_items SET status = 'reverted', line_item_id = NULL
                 WHERE batch_id = ? AND status = 'committed'",
                [&batch_id],
            )
            .map_err(HandlerErr::db_table("db_update_failed", "staged_line_items"))?;
            tx.execute(
                "UPDATE staging_batches SET status = 'reverted', closed_at = ? WHERE id = ?",
                (db::now_rfc3339(), &batch_id),
            )
            .map_err(HandlerErr::db_table("db_update_failed", "staging_batches"))?;
            tx.commit().map_err(HandlerErr::db("db_commit_failed"))?;

            tracing::info!(batch_id = %batch_id, lines_removed, invoices_removed, "staging batch reverted");
            Ok(json!({
                "batchId": batch_id,
                "status": BatchStatus::Reverted.as_str(),
                "linesRemoved": lines_removed,
                "invoicesRemoved": invoices_removed
            }))
        }
        BatchStatus::Discarded | BatchStatus::Reverted => Err(HandlerErr::conflict(format!(
            "batch is already {}",
            batch.status.as_str()
        ))),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let f: fn(&Connection, &Value) -> Result<Value, HandlerErr> = match req.method.as_str() {
        "staging.preview" => staging_preview,
        "staging.stage" => staging_stage,
        "staging.batches" => staging_batches,
        "staging.open" => staging_open,
        "staging.removeItem" => staging_remove_item,
        "staging.commit" => staging_commit,
        "staging.undo" => staging_undo,
        _ => return None,
    };
    let result = require_db(state).and_then(|conn| f(conn, &req.params));
    Some(respond(&req.id, result))
}
