use crate::billing;
use crate::db;
use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::handlers::custom_fields::load_field;
use crate::ipc::helpers::{
    get_bool, get_optional_str_list, get_optional_text, get_patch, get_required_i64,
    get_required_str, get_required_text, new_id, parse_optional_text, parse_text, require_db,
};
use crate::ipc::types::{AppState, Request};
use crate::rules::{Condition, FieldSpec, FieldType, Operator};
use crate::staging::RuleSpec;
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use std::collections::HashMap;

pub struct RuleRow {
    pub id: String,
    pub name: String,
    pub description: String,
    pub field_id: String,
    pub field_key: String,
    pub field: FieldSpec,
    pub operator: String,
    pub operand_json: String,
    pub quantity: i64,
    pub unit_amount_cents: i64,
    pub active: bool,
}

impl RuleRow {
    pub fn condition(&self) -> Result<Condition, String> {
        Condition::from_stored(self.field.clone(), &self.operator, &self.operand_json)
    }

    pub fn to_spec(&self) -> Result<RuleSpec, String> {
        Ok(RuleSpec {
            id: self.id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            field_id: self.field_id.clone(),
            condition: self.condition()?,
            quantity: self.quantity,
            unit_amount_cents: self.unit_amount_cents,
        })
    }

    fn to_json(&self) -> Value {
        let problem = self.condition().err();
        json!({
            "id": self.id,
            "name": self.name,
            "description": self.description,
            "fieldId": self.field_id,
            "fieldKey": self.field_key,
            "operator": self.operator,
            "operand": serde_json::from_str::<Value>(&self.operand_json).unwrap_or(Value::Null),
            "quantity": self.quantity,
            "unitAmountCents": self.unit_amount_cents,
            "amountCents": billing::line_amount(self.quantity, self.unit_amount_cents),
            "active": self.active,
            "problem": problem
        })
    }
}

const RULE_SELECT: &str = "SELECT r.id, r.name, r.description, r.field_id, f.key, f.field_type,
                                  f.options_json, r.operator, r.operand_json, r.quantity,
                                  r.unit_amount_cents, r.active
                           FROM line_item_rules r
                           JOIN custom_fields f ON f.id = r.field_id";

fn map_rule(r: &rusqlite::Row<'_>) -> rusqlite::Result<RuleRow> {
    let field_type: String = r.get(5)?;
    let options_json: String = r.get(6)?;
    Ok(RuleRow {
        id: r.get(0)?,
        name: r.get(1)?,
        description: r.get(2)?,
        field_id: r.get(3)?,
        field_key: r.get(4)?,
        field: FieldSpec {
            field_type: FieldType::parse(&field_type).unwrap_or(FieldType::Text),
            options: serde_json::from_str(&options_json).unwrap_or_default(),
        },
        operator: r.get(7)?,
        operand_json: r.get(8)?,
        quantity: r.get(9)?,
        unit_amount_cents: r.get(10)?,
        active: r.get::<_, i64>(11)? != 0,
    })
}

pub fn load_rule(conn: &Connection, rule_id: &str) -> Result<RuleRow, HandlerErr> {
    conn.query_row(&format!("{} WHERE r.id = ?", RULE_SELECT), [rule_id], map_rule)
        .optional()
        .map_err(HandlerErr::db("db_query_failed"))?
        .ok_or_else(|| HandlerErr::not_found("rule"))
}

/// All rules, ordered by name then id.
pub fn list_rules(conn: &Connection) -> Result<Vec<RuleRow>, HandlerErr> {
    let mut stmt = conn
        .prepare(&format!("{} ORDER BY r.name, r.id", RULE_SELECT))
        .map_err(HandlerErr::db("db_query_failed"))?;
    stmt.query_map([], map_rule)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db("db_query_failed"))
}

fn parse_operator(raw: &str) -> Result<Operator, HandlerErr> {
    Operator::parse(raw).ok_or_else(|| HandlerErr::bad_params(format!("unknown operator: {}", raw)))
}

fn parse_amounts(quantity: i64, unit_amount_cents: i64) -> Result<(), HandlerErr> {
    billing::validate_quantity(quantity).map_err(HandlerErr::bad_params)?;
    if billing::line_amount(quantity, unit_amount_cents).is_none() {
        return Err(HandlerErr::bad_params("quantity * unitAmountCents overflows"));
    }
    Ok(())
}

fn rules_list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let active_only = get_bool(params, "activeOnly", false)?;
    let rules = list_rules(conn)?;
    let out: Vec<Value> = rules
        .iter()
        .filter(|r| !active_only || r.active)
        .map(RuleRow::to_json)
        .collect();
    Ok(json!({ "rules": out }))
}

fn rules_create(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let name = get_required_text(params, "name", 120)?;
    let description = get_optional_text(params, "description", 240)?.unwrap_or_default();
    let field_id = get_required_str(params, "fieldId")?;
    let op = parse_operator(&get_required_str(params, "operator")?)?;
    let quantity = match params.get("quantity") {
        None | Some(Value::Null) => 1,
        Some(_) => get_required_i64(params, "quantity")?,
    };
    let unit_amount_cents = get_required_i64(params, "unitAmountCents")?;
    let active = get_bool(params, "active", true)?;
    parse_amounts(quantity, unit_amount_cents)?;

    let field = load_field(conn, &field_id)?;
    let condition = Condition::build(
        field.spec,
        op,
        params.get("operand").unwrap_or(&Value::Null),
    )
    .map_err(HandlerErr::bad_params)?;

    let rule_id = new_id();
    conn.execute(
        "INSERT INTO line_item_rules(
           id, name, description, field_id, operator, operand_json,
           quantity, unit_amount_cents, active, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &rule_id,
            &name,
            &description,
            &field_id,
            condition.op.as_str(),
            condition.operand.to_json().to_string(),
            quantity,
            unit_amount_cents,
            active as i64,
            db::now_rfc3339(),
        ),
    )
    .map_err(HandlerErr::db_table("db_insert_failed", "line_item_rules"))?;

    let rule = load_rule(conn, &rule_id)?;
    Ok(json!({ "ruleId": rule_id, "rule": rule.to_json() }))
}

fn rules_update(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let rule_id = get_required_str(params, "ruleId")?;
    let patch = get_patch(params)?;
    let mut rule = load_rule(conn, &rule_id)?;

    let mut operand: Option<Value> = None;
    let mut condition_touched = false;
    for (k, v) in patch {
        match k.as_str() {
            "name" => rule.name = parse_text(v, k, 120)?,
            "description" => {
                rule.description = parse_optional_text(Some(v), k, 240)?.unwrap_or_default()
            }
            "fieldId" => {
                rule.field_id = parse_text(v, k, 64)?;
                condition_touched = true;
            }
            "operator" => {
                rule.operator = parse_operator(&parse_text(v, k, 16)?)?.as_str().to_string();
                condition_touched = true;
            }
            "operand" => {
                operand = Some(v.clone());
                condition_touched = true;
            }
            "quantity" => {
                rule.quantity = v
                    .as_i64()
                    .ok_or_else(|| HandlerErr::bad_params("quantity must be integer"))?
            }
            "unitAmountCents" => {
                rule.unit_amount_cents = v
                    .as_i64()
                    .ok_or_else(|| HandlerErr::bad_params("unitAmountCents must be integer"))?
            }
            "active" => {
                rule.active = v
                    .as_bool()
                    .ok_or_else(|| HandlerErr::bad_params("active must be boolean"))?
            }
            _ => return Err(HandlerErr::bad_params(format!("unknown rule field: {}", k))),
        }
    }
    parse_amounts(rule.quantity, rule.unit_amount_cents)?;

    if condition_touched {
        let field = load_field(conn, &rule.field_id)?;
        let raw = match operand {
            Some(v) => v,
            None => serde_json::from_str(&rule.operand_json).unwrap_or(Value::Null),
        };
        let op = parse_operator(&rule.operator)?;
        let condition = Condition::build(field.spec, op, &raw).map_err(HandlerErr::bad_params)?;
        rule.operand_json = condition.operand.to_json().to_string();
    }

    conn.execute(
        "UPDATE line_item_rules SET
           name = ?, description = ?, field_id = ?, operator = ?, operand_json = ?,
           quantity = ?, unit_amount_cents = ?, active = ?, updated_at = ?
         WHERE id = ?",
        (
            &rule.name,
            &rule.description,
            &rule.field_id,
            &rule.operator,
            &rule.operand_json,
            rule.quantity,
            rule.unit_amount_cents,
            rule.active as i64,
            db::now_rfc3339(),
            &rule_id,
        ),
    )
    .map_err(HandlerErr::db_table("db_update_failed", "line_item_rules"))?;

    let rule = load_rule(conn, &rule_id)?;
    Ok(json!({ "rule": rule.to_json() }))
}

fn rules_delete(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let rule_id = get_required_str(params, "ruleId")?;
    load_rule(conn, &rule_id)?;

    let pending: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM staged_line_items WHERE rule_id = ? AND status = 'pending'",
            [&rule_id],
            |r| r.get(0),
        )
        .map_err(HandlerErr::db("db_query_failed"))?;
    if pending > 0 {
        return Err(HandlerErr::conflict("rule has pending staged items")
            .with_details(json!({ "pendingItems": pending })));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(HandlerErr::db("db_tx_failed"))?;
    let unlinked = tx
        .execute(
            "UPDATE invoice_line_items SET source_rule_id = NULL WHERE source_rule_id = ?",
            [&rule_id],
        )
        .map_err(HandlerErr::db_table("db_update_failed", "invoice_line_items"))?;
    tx.execute("DELETE FROM line_item_rules WHERE id = ?", [&rule_id])
        .map_err(HandlerErr::db_table("db_delete_failed", "line_item_rules"))?;
    tx.commit().map_err(HandlerErr::db("db_commit_failed"))?;

    Ok(json!({ "ok": true, "unlinkedLines": unlinked }))
}

/// (student_id, display name) in roster order, optionally restricted.
pub fn roster(
    conn: &Connection,
    student_ids: Option<&[String]>,
) -> Result<Vec<(String, String, bool)>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT id, last_name, first_name, active FROM students
             ORDER BY last_name, first_name, id",
        )
        .map_err(HandlerErr::db("db_query_failed"))?;
    let all = stmt
        .query_map([], |r| {
            Ok((
                r.get::<_, String>(0)?,
                format!("{}, {}", r.get::<_, String>(1)?, r.get::<_, String>(2)?),
                r.get::<_, i64>(3)? != 0,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db("db_query_failed"))?;
    let Some(ids) = student_ids else {
        return Ok(all);
    };
    for id in ids {
        if !all.iter().any(|(sid, _, _)| sid == id) {
            return Err(HandlerErr::not_found("student")
                .with_details(json!({ "studentId": id })));
        }
    }
    Ok(all.into_iter().filter(|(sid, _, _)| ids.contains(sid)).collect())
}

/// student_id -> value for one field.
pub fn field_values(conn: &Connection, field_id: &str) -> Result<HashMap<String, String>, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT student_id, value FROM student_field_values WHERE field_id = ?")
        .map_err(HandlerErr::db("db_query_failed"))?;
    let rows = stmt
        .query_map([field_id], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))
        .and_then(|it| it.collect::<Result<HashMap<_, _>, _>>())
        .map_err(HandlerErr::db("db_query_failed"))?;
    Ok(rows)
}

fn rules_evaluate(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let rule_id = get_required_str(params, "ruleId")?;
    let student_ids = get_optional_str_list(params, "studentIds")?;
    let rule = load_rule(conn, &rule_id)?;
    let condition = rule
        .condition()
        .map_err(|m| HandlerErr::conflict(format!("rule no longer matches its field: {}", m)))?;

    let students = roster(conn, student_ids.as_deref())?;
    let values = field_values(conn, &rule.field_id)?;
    let mut qualifying = 0usize;
    let results: Vec<Value> = students
        .iter()
        .map(|(id, name, active)| {
            let value = values.get(id).map(String::as_str);
            let qualifies = condition.qualifies(value);
            if qualifies {
                qualifying += 1;
            }
            json!({
                "studentId": id,
                "displayName": name,
                "active": active,
                "value": value,
                "qualifies": qualifies
            })
        })
        .collect();

    Ok(json!({
        "ruleId": rule_id,
        "qualifying": qualifying,
        "results": results
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let f: fn(&Connection, &Value) -> Result<Value, HandlerErr> = match req.method.as_str() {
        "rules.list" => rules_list,
        "rules.create" => rules_create,
        "rules.update" => rules_update,
        "rules.delete" => rules_delete,
        "rules.evaluate" => rules_evaluate,
        _ => return None,
    };
    let result = require_db(state).and_then(|conn| f(conn, &req.params));
    Some(respond(&req.id, result))
}
