//! Custom-field value normalization and conditional rule evaluation.
//!
//! Values are stored as canonical text so that qualification is a pure
//! function of `(condition, Option<&str>)`.

use serde_json::{json, Value};

pub const MAX_SELECT_OPTIONS: usize = 50;
pub const MAX_LIST_OPERANDS: usize = 100;
pub const MAX_VALUE_LEN: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Text,
    Number,
    Boolean,
    Select,
}

impl FieldType {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" => Some(Self::Text),
            "number" => Some(Self::Number),
            "boolean" | "bool" => Some(Self::Boolean),
            "select" => Some(Self::Select),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Select => "select",
        }
    }
}

/// A custom field definition as the evaluator needs it.
#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub field_type: FieldType,
    pub options: Vec<String>,
}

fn fold_case(s: &str) -> String {
    s.trim().to_lowercase()
}

/// Case-insensitive text comparison, Unicode-aware.
fn same_text(a: &str, b: &str) -> bool {
    fold_case(a) == fold_case(b)
}

pub fn normalize_options(raw: &Value) -> Result<Vec<String>, String> {
    let arr = raw
        .as_array()
        .ok_or_else(|| "options must be an array of strings".to_string())?;
    let mut out: Vec<String> = Vec::new();
    for v in arr {
        let s = v
            .as_str()
            .ok_or_else(|| "options must be an array of strings".to_string())?
            .trim();
        if s.is_empty() {
            return Err("options must not contain blank entries".into());
        }
        if s.len() > 120 {
            return Err("option length must be <= 120".into());
        }
        if out.iter().any(|o| same_text(o, s)) {
            return Err(format!("duplicate option: {}", s));
        }
        out.push(s.to_string());
    }
    if out.is_empty() {
        return Err("select fields need at least one option".into());
    }
    if out.len() > MAX_SELECT_OPTIONS {
        return Err(format!("at most {} options allowed", MAX_SELECT_OPTIONS));
    }
    Ok(out)
}

fn parse_number_text(s: &str) -> Option<f64> {
    let n: f64 = s.trim().parse().ok()?;
    n.is_finite().then_some(n)
}

fn canonical_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

fn parse_bool_text(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "y" | "1" => Some(true),
        "false" | "no" | "n" | "0" => Some(false),
        _ => None,
    }
}

/// Normalize a JSON value into the stored text for a field. `Ok(None)` means
/// "clear the value".
pub fn normalize_value(field: &FieldSpec, raw: &Value) -> Result<Option<String>, String> {
    let text = match raw {
        Value::Null => return Ok(None),
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => return Err("value must be a string, number, boolean or null".into()),
    };
    if text.is_empty() {
        return Ok(None);
    }
    if text.len() > MAX_VALUE_LEN {
        return Err(format!("value length must be <= {}", MAX_VALUE_LEN));
    }
    match field.field_type {
        FieldType::Text => Ok(Some(text)),
        FieldType::Number => parse_number_text(&text)
            .map(|n| Some(canonical_number(n)))
            .ok_or_else(|| format!("{} is not a number", text)),
        FieldType::Boolean => parse_bool_text(&text)
            .map(|b| Some(b.to_string()))
            .ok_or_else(|| format!("{} is not a boolean", text)),
        FieldType::Select => field
            .options
            .iter()
            .find(|o| same_text(o, &text))
            .map(|o| Some(o.clone()))
            .ok_or_else(|| format!("{} is not one of the field options", text)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Equals,
    NotEquals,
    Contains,
    In,
    NotIn,
    GreaterThan,
    GreaterOrEqual,
    LessThan,
    LessOrEqual,
    IsSet,
    IsEmpty,
}

impl Operator {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "equals" | "eq" => Some(Self::Equals),
            "notEquals" | "ne" => Some(Self::NotEquals),
            "contains" => Some(Self::Contains),
            "in" => Some(Self::In),
            "notIn" => Some(Self::NotIn),
            "gt" => Some(Self::GreaterThan),
            "gte" => Some(Self::GreaterOrEqual),
            "lt" => Some(Self::LessThan),
            "lte" => Some(Self::LessOrEqual),
            "isSet" => Some(Self::IsSet),
            "isEmpty" => Some(Self::IsEmpty),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Equals => "equals",
            Self::NotEquals => "notEquals",
            Self::Contains => "contains",
            Self::In => "in",
            Self::NotIn => "notIn",
            Self::GreaterThan => "gt",
            Self::GreaterOrEqual => "gte",
            Self::LessThan => "lt",
            Self::LessOrEqual => "lte",
            Self::IsSet => "isSet",
            Self::IsEmpty => "isEmpty",
        }
    }

    fn is_ordering(self) -> bool {
        matches!(
            self,
            Self::GreaterThan | Self::GreaterOrEqual | Self::LessThan | Self::LessOrEqual
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    None,
    One(String),
    Many(Vec<String>),
}

impl Operand {
    pub fn to_json(&self) -> Value {
        match self {
            Operand::None => Value::Null,
            Operand::One(s) => json!(s),
            Operand::Many(v) => json!(v),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Condition {
    pub field: FieldSpec,
    pub op: Operator,
    pub operand: Operand,
}

fn operand_list(raw: &Value) -> Result<Vec<Value>, String> {
    match raw {
        Value::Array(a) => Ok(a.clone()),
        Value::String(s) => Ok(s
            .split(',')
            .map(|p| Value::String(p.trim().to_string()))
            .collect()),
        _ => Err("operand must be an array or a comma-separated string".into()),
    }
}

impl Condition {
    /// Validate an operator/operand pair against the field and normalize the
    /// operand the same way stored values are normalized.
    pub fn build(field: FieldSpec, op: Operator, raw: &Value) -> Result<Self, String> {
        if op == Operator::Contains && field.field_type != FieldType::Text {
            return Err("contains is only valid for text fields".into());
        }
        if op.is_ordering() && field.field_type != FieldType::Number {
            return Err(format!("{} is only valid for number fields", op.as_str()));
        }
        let operand = match op {
            Operator::IsSet | Operator::IsEmpty => Operand::None,
            Operator::In | Operator::NotIn => {
                let mut vals: Vec<String> = Vec::new();
                for v in operand_list(raw)? {
                    let Some(n) = normalize_value(&field, &v)? else {
                        return Err("operand list must not contain blank values".into());
                    };
                    if !vals.contains(&n) {
                        vals.push(n);
                    }
                }
                if vals.is_empty() || vals.len() > MAX_LIST_OPERANDS {
                    return Err(format!(
                        "operand list must have 1..={} values",
                        MAX_LIST_OPERANDS
                    ));
                }
                Operand::Many(vals)
            }
            Operator::Contains => match raw.as_str().map(str::trim) {
                Some(s) if !s.is_empty() => Operand::One(s.to_string()),
                _ => return Err("contains needs a non-empty string operand".into()),
            },
            _ => match normalize_value(&field, raw)? {
                Some(v) => Operand::One(v),
                None => return Err("operand must not be empty".into()),
            },
        };
        Ok(Self { field, op, operand })
    }

    /// Rebuild from stored columns. Stored operands were normalized on save.
    pub fn from_stored(field: FieldSpec, operator: &str, operand_json: &str) -> Result<Self, String> {
        let op = Operator::parse(operator).ok_or_else(|| format!("unknown operator {}", operator))?;
        let raw: Value = serde_json::from_str(operand_json)
            .map_err(|e| format!("operand is not valid JSON: {}", e))?;
        Self::build(field, op, &raw)
    }

    fn values_equal(&self, a: &str, b: &str) -> bool {
        match self.field.field_type {
            FieldType::Number => match (parse_number_text(a), parse_number_text(b)) {
                (Some(x), Some(y)) => x == y,
                _ => false,
            },
            FieldType::Boolean => a == b,
            FieldType::Text | FieldType::Select => same_text(a, b),
        }
    }

    pub fn qualifies(&self, value: Option<&str>) -> bool {
        let value = value.map(str::trim).filter(|v| !v.is_empty());
        let Some(v) = value else {
            return self.op == Operator::IsEmpty;
        };
        match (self.op, &self.operand) {
            (Operator::IsSet, _) => true,
            (Operator::IsEmpty, _) => false,
            (Operator::Equals, Operand::One(o)) => self.values_equal(v, o),
            (Operator::NotEquals, Operand::One(o)) => !self.values_equal(v, o),
            (Operator::Contains, Operand::One(o)) => fold_case(v).contains(&fold_case(o)),
            (Operator::In, Operand::Many(list)) => list.iter().any(|o| self.values_equal(v, o)),
            (Operator::NotIn, Operand::Many(list)) => {
                !list.iter().any(|o| self.values_equal(v, o))
            }
            (op, Operand::One(o)) if op.is_ordering() => {
                let (Some(x), Some(y)) = (parse_number_text(v), parse_number_text(o)) else {
                    return false;
                };
                match op {
                    Operator::GreaterThan => x > y,
                    Operator::GreaterOrEqual => x >= y,
                    Operator::LessThan => x < y,
                    Operator::LessOrEqual => x <= y,
                    _ => false,
                }
            }
            _ => false,
        }
    }
}
