use crate::access;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use serde_json::{json, Map, Value};

#[derive(Clone, Copy)]
enum SetupSection {
    School,
    Billing,
    Staging,
    Access,
}

impl SetupSection {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "school" => Some(Self::School),
            "billing" => Some(Self::Billing),
            "staging" => Some(Self::Staging),
            "access" => Some(Self::Access),
            _ => None,
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::School => "setup.school",
            Self::Billing => "setup.billing",
            Self::Staging => "setup.staging",
            Self::Access => "setup.access",
        }
    }
}

fn default_section(section: SetupSection) -> Value {
    match section {
        SetupSection::School => json!({
            "name": "",
            "academicYear": ""
        }),
        SetupSection::Billing => json!({
            "currency": "USD",
            "invoicePrefix": "INV-",
            "numberPadding": 5,
            "defaultDueDays": 30
        }),
        SetupSection::Staging => json!({
            "requireActiveStudents": true,
            "maxItemsPerBatch": 5000
        }),
        SetupSection::Access => json!({
            "superRoles": ["admin"],
            "defaultLanding": "dashboard"
        }),
    }
}

fn as_object_mut(value: &mut Value) -> Result<&mut Map<String, Value>, String> {
    value
        .as_object_mut()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())
}

fn parse_bool(v: &Value, key: &str) -> Result<bool, String> {
    v.as_bool()
        .ok_or_else(|| format!("{} must be boolean", key))
}

fn parse_i64_range(v: &Value, key: &str, min: i64, max: i64) -> Result<i64, String> {
    let n = v
        .as_i64()
        .ok_or_else(|| format!("{} must be integer", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn parse_string_max(v: &Value, key: &str, max_len: usize) -> Result<String, String> {
    let s = v.as_str().ok_or_else(|| format!("{} must be string", key))?;
    let s = s.trim();
    if s.len() > max_len {
        return Err(format!("{} length must be <= {}", key, max_len));
    }
    Ok(s.to_string())
}

fn merge_section_patch(
    section: SetupSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = as_object_mut(current)?;
    for (k, v) in patch {
        match section {
            SetupSection::School => match k.as_str() {
                "name" => {
                    obj.insert(k.clone(), Value::String(parse_string_max(v, k, 120)?));
                }
                "academicYear" => {
                    obj.insert(k.clone(), Value::String(parse_string_max(v, k, 16)?));
                }
                _ => return Err(format!("unknown school field: {}", k)),
            },
            SetupSection::Billing => match k.as_str() {
                "currency" => {
                    let c = parse_string_max(v, k, 3)?.to_ascii_uppercase();
                    if c.len() != 3 || !c.chars().all(|ch| ch.is_ascii_alphabetic()) {
                        return Err("currency must be a 3-letter code".into());
                    }
                    obj.insert(k.clone(), Value::String(c));
                }
                "invoicePrefix" => {
                    obj.insert(k.clone(), Value::String(parse_string_max(v, k, 12)?));
                }
                "numberPadding" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 1, 10)?));
                }
                "defaultDueDays" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 0, 365)?));
                }
                _ => return Err(format!("unknown billing field: {}", k)),
            },
            SetupSection::Staging => match k.as_str() {
                "requireActiveStudents" => {
                    obj.insert(k.clone(), Value::Bool(parse_bool(v, k)?));
                }
                "maxItemsPerBatch" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 1, 100_000)?));
                }
                _ => return Err(format!("unknown staging field: {}", k)),
            },
            SetupSection::Access => match k.as_str() {
                "superRoles" => {
                    let arr = v
                        .as_array()
                        .ok_or_else(|| "superRoles must be an array of strings".to_string())?;
                    let mut roles: Vec<String> = Vec::new();
                    for r in arr {
                        let s = parse_string_max(r, k, 32)?.to_ascii_lowercase();
                        if s.is_empty() {
                            return Err("superRoles must not contain blank roles".into());
                        }
                        if !roles.contains(&s) {
                            roles.push(s);
                        }
                    }
                    if roles.is_empty() || roles.len() > 8 {
                        return Err("superRoles must have 1..=8 roles".into());
                    }
                    obj.insert(k.clone(), json!(roles));
                }
                "defaultLanding" => {
                    let s = parse_string_max(v, k, 32)?;
                    let Some(idx) = access::find_module(&s) else {
                        return Err(format!("defaultLanding must be a module id: {}", s));
                    };
                    obj.insert(k.clone(), Value::String(access::CATALOG[idx].id.to_string()));
                }
                _ => return Err(format!("unknown access field: {}", k)),
            },
        }
    }
    Ok(())
}

fn load_section(conn: &rusqlite::Connection, section: SetupSection) -> anyhow::Result<Value> {
    let mut current = default_section(section);
    if let Some(saved) = db::settings_get_json(conn, section.key())? {
        if let Some(saved_obj) = saved.as_object() {
            // Each stored field stands alone; a bad one keeps its default.
            for (k, v) in saved_obj {
                let mut one = Map::new();
                one.insert(k.clone(), v.clone());
                if let Err(message) = merge_section_patch(section, &mut current, &one) {
                    tracing::warn!(section = section.key(), field = %k, %message, "ignoring stored setting");
                }
            }
        }
    }
    Ok(current)
}

#[derive(Debug, Clone)]
pub struct BillingSettings {
    pub invoice_prefix: String,
    pub number_padding: usize,
    pub default_due_days: i64,
}

#[derive(Debug, Clone)]
pub struct StagingSettings {
    pub require_active_students: bool,
    pub max_items_per_batch: usize,
}

#[derive(Debug, Clone)]
pub struct AccessSettings {
    pub super_roles: Vec<String>,
    pub default_landing: String,
}

pub fn billing_settings(conn: &rusqlite::Connection) -> anyhow::Result<BillingSettings> {
    let v = load_section(conn, SetupSection::Billing)?;
    Ok(BillingSettings {
        invoice_prefix: v["invoicePrefix"].as_str().unwrap_or("INV-").to_string(),
        number_padding: v["numberPadding"].as_u64().unwrap_or(5) as usize,
        default_due_days: v["defaultDueDays"].as_i64().unwrap_or(30),
    })
}

pub fn staging_settings(conn: &rusqlite::Connection) -> anyhow::Result<StagingSettings> {
    let v = load_section(conn, SetupSection::Staging)?;
    Ok(StagingSettings {
        require_active_students: v["requireActiveStudents"].as_bool().unwrap_or(true),
        max_items_per_batch: v["maxItemsPerBatch"].as_u64().unwrap_or(5000) as usize,
    })
}

pub fn access_settings(conn: &rusqlite::Connection) -> anyhow::Result<AccessSettings> {
    let v = load_section(conn, SetupSection::Access)?;
    let super_roles = v["superRoles"]
        .as_array()
        .map(|a| {
            a.iter()
                .filter_map(|r| r.as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_else(|| vec!["admin".to_string()]);
    Ok(AccessSettings {
        super_roles,
        default_landing: v["defaultLanding"]
            .as_str()
            .unwrap_or("dashboard")
            .to_string(),
    })
}

fn handle_setup_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let mut out = Map::new();
    for (name, section) in [
        ("school", SetupSection::School),
        ("billing", SetupSection::Billing),
        ("staging", SetupSection::Staging),
        ("access", SetupSection::Access),
    ] {
        match load_section(conn, section) {
            Ok(v) => {
                out.insert(name.to_string(), v);
            }
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    }
    ok(&req.id, Value::Object(out))
}

fn handle_setup_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(section_raw) = req.params.get("section").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing section", None);
    };
    let Some(section) = SetupSection::parse(section_raw) else {
        return err(&req.id, "bad_params", "unknown section", None);
    };
    let Some(patch_obj) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };

    let mut current = match load_section(conn, section) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Err(msg) = merge_section_patch(section, &mut current, patch_obj) {
        return err(&req.id, "bad_params", msg, None);
    }
    if let Err(e) = db::settings_set_json(conn, section.key(), &current) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "setup.get" => Some(handle_setup_get(state, req)),
        "setup.update" => Some(handle_setup_update(state, req)),
        _ => None,
    }
}
