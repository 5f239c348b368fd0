//! Planning for conditional line items.
//!
//! `plan` decides, for one billing period, which (student, rule) pairs turn
//! into line items. It is pure: the caller loads students, values, rules and
//! what is already committed or staged, and persists the result.

use crate::billing::{self, InvoiceStatus};
use crate::rules::Condition;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone)]
pub struct RuleSpec {
    pub id: String,
    pub name: String,
    pub description: String,
    pub field_id: String,
    pub condition: Condition,
    pub quantity: i64,
    pub unit_amount_cents: i64,
}

impl RuleSpec {
    pub fn line_description(&self) -> &str {
        if self.description.trim().is_empty() {
            &self.name
        } else {
            &self.description
        }
    }
}

#[derive(Debug, Clone)]
pub struct StudentRow {
    pub id: String,
    pub display_name: String,
    pub active: bool,
}

#[derive(Debug, Clone)]
pub struct InvoiceRef {
    pub id: String,
    pub status: InvoiceStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    InactiveStudent,
    AlreadyCommitted,
    AlreadyStaged,
    InvoiceLocked,
    AmountOverflow,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InactiveStudent => "inactive_student",
            Self::AlreadyCommitted => "already_committed",
            Self::AlreadyStaged => "already_staged",
            Self::InvoiceLocked => "invoice_locked",
            Self::AmountOverflow => "amount_overflow",
        }
    }
}

/// Key of a (student, rule) pair within one period.
pub type PairKey = (String, String);

pub struct PlanInput<'a> {
    pub rules: &'a [RuleSpec],
    pub students: &'a [StudentRow],
    /// (student_id, field_id) -> stored value
    pub values: &'a HashMap<PairKey, String>,
    /// Pairs with a committed line on a non-void invoice of the period.
    pub committed: &'a HashSet<PairKey>,
    /// Pairs with a pending staged item for the period.
    pub pending: &'a HashSet<PairKey>,
    /// student_id -> non-void invoice for the period.
    pub invoices: &'a HashMap<String, InvoiceRef>,
    pub require_active: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub student_id: String,
    pub student_name: String,
    pub rule_id: String,
    pub rule_name: String,
    pub description: String,
    pub quantity: i64,
    pub unit_amount_cents: i64,
    pub amount_cents: i64,
    /// Existing draft invoice the line will land on; `None` means one is
    /// created on commit.
    pub invoice_id: Option<String>,
    pub field_value: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Skipped {
    pub student_id: String,
    pub rule_id: String,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, Default)]
pub struct Plan {
    pub candidates: Vec<Candidate>,
    pub skipped: Vec<Skipped>,
}

impl Plan {
    pub fn total_cents(&self) -> i64 {
        self.candidates
            .iter()
            .fold(0i64, |acc, c| acc.saturating_add(c.amount_cents))
    }
}

pub fn plan(input: &PlanInput<'_>) -> Plan {
    let mut out = Plan::default();
    for rule in input.rules {
        for student in input.students {
            let value = input
                .values
                .get(&(student.id.clone(), rule.field_id.clone()))
                .map(String::as_str);
            if !rule.condition.qualifies(value) {
                continue;
            }
            let key = (student.id.clone(), rule.id.clone());
            let skip = |reason| Skipped {
                student_id: student.id.clone(),
                rule_id: rule.id.clone(),
                reason,
            };
            if input.require_active && !student.active {
                out.skipped.push(skip(SkipReason::InactiveStudent));
                continue;
            }
            if input.committed.contains(&key) {
                out.skipped.push(skip(SkipReason::AlreadyCommitted));
                continue;
            }
            if input.pending.contains(&key) {
                out.skipped.push(skip(SkipReason::AlreadyStaged));
                continue;
            }
            let invoice = input.invoices.get(&student.id);
            if let Some(inv) = invoice {
                if inv.status != InvoiceStatus::Draft {
                    out.skipped.push(skip(SkipReason::InvoiceLocked));
                    continue;
                }
            }
            let Some(amount) = billing::line_amount(rule.quantity, rule.unit_amount_cents) else {
                out.skipped.push(skip(SkipReason::AmountOverflow));
                continue;
            };
            out.candidates.push(Candidate {
                student_id: student.id.clone(),
                student_name: student.display_name.clone(),
                rule_id: rule.id.clone(),
                rule_name: rule.name.clone(),
                description: rule.line_description().to_string(),
                quantity: rule.quantity,
                unit_amount_cents: rule.unit_amount_cents,
                amount_cents: amount,
                invoice_id: invoice.map(|i| i.id.clone()),
                field_value: value.unwrap_or_default().to_string(),
            });
        }
    }
    out
}

pub fn candidate_json(c: &Candidate) -> Value {
    json!({
        "studentId": c.student_id,
        "studentName": c.student_name,
        "ruleId": c.rule_id,
        "ruleName": c.rule_name,
        "description": c.description,
        "quantity": c.quantity,
        "unitAmountCents": c.unit_amount_cents,
        "amountCents": c.amount_cents,
        "invoiceId": c.invoice_id,
        "fieldValue": c.field_value
    })
}

pub fn skipped_json(s: &Skipped) -> Value {
    json!({
        "studentId": s.student_id,
        "ruleId": s.rule_id,
        "reason": s.reason.as_str()
    })
}
