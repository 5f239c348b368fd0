use crate::access::{self, ParsedGrants, Subject, Visibility};
use crate::ipc::error::{ok, respond, HandlerErr};
use crate::ipc::handlers::setup::{access_settings, AccessSettings};
use crate::ipc::handlers::users::load_user;
use crate::ipc::helpers::{get_bool, get_required_str, require_db};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::{json, Value};

struct Resolved {
    grants: ParsedGrants,
    visibility: Visibility,
    settings: AccessSettings,
}

/// Resolve either a stored user (`userId`) or an ad-hoc `role` + `permissions`
/// pair, which the settings screen uses to preview a change before saving.
fn resolve_subject(conn: &Connection, params: &Value) -> Result<Resolved, HandlerErr> {
    let settings = access_settings(conn).map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;

    let (role, active, grants) = if let Some(user_id) = params.get("userId").and_then(|v| v.as_str()) {
        let user = load_user(conn, user_id)?;
        let grants = access::parse_grants_text(&user.permissions_json);
        if grants.malformed {
            tracing::warn!(user_id = %user.id, "stored permissions are not a JSON array; treating as empty");
        }
        (user.role, user.active, grants)
    } else {
        let role = get_required_str(params, "role")?;
        let grants = match params.get("permissions") {
            None => ParsedGrants::default(),
            Some(Value::String(text)) => access::parse_grants_text(text),
            Some(v) => access::parse_grants(v),
        };
        (role, get_bool(params, "active", true)?, grants)
    };

    let visibility = access::resolve(
        Subject {
            role: &role,
            active,
        },
        &grants,
        &settings.super_roles,
    );
    Ok(Resolved {
        grants,
        visibility,
        settings,
    })
}

fn access_resolve(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let r = resolve_subject(conn, params)?;
    Ok(json!({
        "fullAccess": r.visibility.full_access,
        "sections": r.visibility.sections_json(),
        "granted": r.visibility.granted_ids(),
        "unrecognized": r.grants.unrecognized,
        "ambiguous": r.grants.ambiguous,
        "malformed": r.grants.malformed,
        "landingRoute": r.visibility.landing_route(Some(r.settings.default_landing.as_str()))
    }))
}

fn access_check(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let route = get_required_str(params, "route")?;
    let r = resolve_subject(conn, params)?;
    let (matched, allowed) = r.visibility.check_route(&route);
    let reason = match (matched, allowed) {
        (access::RouteMatch::Unknown, _) => "unknown_route",
        (_, true) => "granted",
        (_, false) => "not_granted",
    };
    Ok(json!({
        "allowed": allowed,
        "matched": access::route_match_json(matched),
        "reason": reason,
        "landingRoute": r.visibility.landing_route(Some(r.settings.default_landing.as_str()))
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let f: fn(&Connection, &Value) -> Result<Value, HandlerErr> = match req.method.as_str() {
        // Static; no workspace needed.
        "access.catalog" => return Some(ok(&req.id, json!({ "modules": access::catalog_json() }))),
        "access.resolve" => access_resolve,
        "access.check" => access_check,
        _ => return None,
    };
    let result = require_db(state).and_then(|conn| f(conn, &req.params));
    Some(respond(&req.id, result))
}
