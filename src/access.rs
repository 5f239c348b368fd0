//! Module/submodule visibility.
//!
//! A user's permission list is stored as a JSON array of loosely spelled
//! module or submodule names. This module matches those entries against the
//! static [`CATALOG`], resolves which sections the user can navigate to, and
//! answers route checks for the shell's router guard.

use serde_json::{json, Value};
use std::collections::BTreeSet;

#[derive(Debug)]
pub struct SubmoduleDef {
    pub id: &'static str,
    pub label: &'static str,
    pub route: &'static str,
}

#[derive(Debug)]
pub struct ModuleDef {
    pub id: &'static str,
    pub label: &'static str,
    pub route: &'static str,
    /// Shown to every active user regardless of grants.
    pub always_visible: bool,
    pub submodules: &'static [SubmoduleDef],
}

const fn sub(id: &'static str, label: &'static str, route: &'static str) -> SubmoduleDef {
    SubmoduleDef { id, label, route }
}

pub static CATALOG: &[ModuleDef] = &[
    ModuleDef {
        id: "dashboard",
        label: "Dashboard",
        route: "/dashboard",
        always_visible: true,
        submodules: &[],
    },
    ModuleDef {
        id: "students",
        label: "Students",
        route: "/students",
        always_visible: false,
        submodules: &[
            sub("directory", "Directory", "/students/directory"),
            sub("admissions", "Admissions", "/students/admissions"),
            sub("attendance", "Attendance", "/students/attendance"),
            sub("customFields", "Custom Fields", "/students/custom-fields"),
        ],
    },
    ModuleDef {
        id: "financials",
        label: "Financials",
        route: "/financials",
        always_visible: false,
        submodules: &[
            sub("invoices", "Invoices", "/financials/invoices"),
            sub("payments", "Payments", "/financials/payments"),
            sub("feeStructures", "Fee Structures", "/financials/fee-structures"),
            sub(
                "conditionalItems",
                "Conditional Items",
                "/financials/conditional-items",
            ),
            sub("expenses", "Expenses", "/financials/expenses"),
        ],
    },
    ModuleDef {
        id: "hr",
        label: "HR",
        route: "/hr",
        always_visible: false,
        submodules: &[
            sub("staff", "Staff", "/hr/staff"),
            sub("attendance", "Attendance", "/hr/attendance"),
            sub("payroll", "Payroll", "/hr/payroll"),
            sub("leave", "Leave Requests", "/hr/leave"),
        ],
    },
    ModuleDef {
        id: "inventory",
        label: "Inventory",
        route: "/inventory",
        always_visible: false,
        submodules: &[
            sub("items", "Items", "/inventory/items"),
            sub("suppliers", "Suppliers", "/inventory/suppliers"),
            sub("purchaseOrders", "Purchase Orders", "/inventory/purchase-orders"),
        ],
    },
    ModuleDef {
        id: "library",
        label: "Library",
        route: "/library",
        always_visible: false,
        submodules: &[
            sub("catalog", "Catalog", "/library/catalog"),
            sub("loans", "Loans", "/library/loans"),
        ],
    },
    ModuleDef {
        id: "leads",
        label: "Leads",
        route: "/leads",
        always_visible: false,
        submodules: &[
            sub("pipeline", "Pipeline", "/leads/pipeline"),
            sub("followUps", "Follow-ups", "/leads/follow-ups"),
        ],
    },
    ModuleDef {
        id: "scheduling",
        label: "Scheduling",
        route: "/scheduling",
        always_visible: false,
        submodules: &[
            sub("timetable", "Timetable", "/scheduling/timetable"),
            sub("calendar", "Calendar", "/scheduling/calendar"),
        ],
    },
    ModuleDef {
        id: "settings",
        label: "Settings",
        route: "/settings",
        always_visible: false,
        submodules: &[
            sub("users", "Users", "/settings/users"),
            sub("school", "School Profile", "/settings/school"),
        ],
    },
];

pub fn find_module(id: &str) -> Option<usize> {
    let key = norm(id);
    CATALOG
        .iter()
        .position(|m| norm(m.id) == key || norm(m.label) == key)
}

/// Catalog index of a grant. Ordering follows catalog order, with a module
/// grant sorting before its own submodules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grant {
    Module(usize),
    Submodule(usize, usize),
}

impl Ord for Grant {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

impl PartialOrd for Grant {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Grant {
    fn sort_key(self) -> (usize, usize) {
        match self {
            Grant::Module(m) => (m, 0),
            Grant::Submodule(m, s) => (m, s + 1),
        }
    }

    fn module_index(self) -> usize {
        match self {
            Grant::Module(m) | Grant::Submodule(m, _) => m,
        }
    }

    pub fn canonical_id(self) -> String {
        match self {
            Grant::Module(m) => CATALOG[m].id.to_string(),
            Grant::Submodule(m, s) => {
                format!("{}.{}", CATALOG[m].id, CATALOG[m].submodules[s].id)
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedGrants {
    pub grants: BTreeSet<Grant>,
    pub unrecognized: Vec<String>,
    pub ambiguous: Vec<String>,
    /// Stored text was not a JSON array.
    pub malformed: bool,
}

impl ParsedGrants {
    /// Canonical ids in catalog order. Submodule grants already covered by a
    /// module grant are dropped.
    pub fn canonical_ids(&self) -> Vec<String> {
        self.grants
            .iter()
            .filter(|g| match g {
                Grant::Module(_) => true,
                Grant::Submodule(m, _) => !self.grants.contains(&Grant::Module(*m)),
            })
            .map(|g| g.canonical_id())
            .collect()
    }

    pub fn rejected(&self) -> Vec<String> {
        let mut out = self.unrecognized.clone();
        out.extend(self.ambiguous.iter().cloned());
        out
    }
}

/// Lowercase and drop everything that is not alphanumeric, so that
/// `"Fee Structures"`, `"fee-structures"` and `"feeStructures"` compare equal.
fn norm(s: &str) -> String {
    s.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(|c| c.to_lowercase())
        .collect()
}

fn find_submodule(module: usize, name: &str) -> Option<usize> {
    let key = norm(name);
    CATALOG[module]
        .submodules
        .iter()
        .position(|s| norm(s.id) == key || norm(s.label) == key)
}

enum TokenMatch {
    Found(Grant),
    Ambiguous,
    Unknown,
}

fn match_token(token: &str) -> TokenMatch {
    let t = token.trim();
    if t.is_empty() {
        return TokenMatch::Unknown;
    }
    if let Some(pos) = t.find(['.', '/', ':']) {
        let (module_part, rest) = t.split_at(pos);
        let sub_part = rest[1..].trim();
        let Some(m) = find_module(module_part) else {
            return TokenMatch::Unknown;
        };
        if sub_part == "*" || sub_part.is_empty() {
            return TokenMatch::Found(Grant::Module(m));
        }
        return match find_submodule(m, sub_part) {
            Some(s) => TokenMatch::Found(Grant::Submodule(m, s)),
            None => TokenMatch::Unknown,
        };
    }

    if let Some(m) = find_module(t) {
        return TokenMatch::Found(Grant::Module(m));
    }
    let hits: Vec<Grant> = (0..CATALOG.len())
        .filter_map(|m| find_submodule(m, t).map(|s| Grant::Submodule(m, s)))
        .collect();
    match hits.as_slice() {
        [only] => TokenMatch::Found(*only),
        [] => TokenMatch::Unknown,
        _ => TokenMatch::Ambiguous,
    }
}

fn push_token(out: &mut ParsedGrants, token: &str) {
    match match_token(token) {
        TokenMatch::Found(g) => {
            out.grants.insert(g);
        }
        TokenMatch::Ambiguous => {
            if !out.ambiguous.iter().any(|a| a == token) {
                out.ambiguous.push(token.to_string());
            }
        }
        TokenMatch::Unknown => {
            if !out.unrecognized.iter().any(|a| a == token) {
                out.unrecognized.push(token.to_string());
            }
        }
    }
}

fn push_unrecognized(out: &mut ParsedGrants, label: String) {
    if !out.unrecognized.contains(&label) {
        out.unrecognized.push(label);
    }
}

fn push_entry(out: &mut ParsedGrants, entry: &Value) {
    match entry {
        Value::String(s) => push_token(out, s),
        Value::Object(obj) => {
            if let Some(module) = obj.get("module").and_then(|v| v.as_str()) {
                let Some(m) = find_module(module) else {
                    push_token(out, module);
                    return;
                };
                // Only an absent, null or empty list grants the whole module.
                let subs = match obj.get("submodules") {
                    None | Some(Value::Null) => {
                        out.grants.insert(Grant::Module(m));
                        return;
                    }
                    Some(Value::Array(a)) if a.is_empty() => {
                        out.grants.insert(Grant::Module(m));
                        return;
                    }
                    Some(Value::Array(a)) => a,
                    Some(other) => {
                        push_unrecognized(out, format!("{}.{}", module, other));
                        return;
                    }
                };
                for s in subs {
                    let found = s.as_str().and_then(|name| find_submodule(m, name));
                    match found {
                        Some(si) => {
                            out.grants.insert(Grant::Submodule(m, si));
                        }
                        None => {
                            let name = s.as_str().map(str::to_string).unwrap_or_else(|| s.to_string());
                            push_unrecognized(out, format!("{}.{}", module, name));
                        }
                    }
                }
            } else if let Some(id) = obj.get("id").and_then(|v| v.as_str()) {
                push_token(out, id);
            } else {
                out.unrecognized.push(entry.to_string());
            }
        }
        other => out.unrecognized.push(other.to_string()),
    }
}

pub fn parse_grants(raw: &Value) -> ParsedGrants {
    let mut out = ParsedGrants::default();
    let Some(arr) = raw.as_array() else {
        out.malformed = !raw.is_null();
        return out;
    };
    for entry in arr {
        push_entry(&mut out, entry);
    }
    out
}

/// Parse the stored `permissions_json` column.
pub fn parse_grants_text(text: &str) -> ParsedGrants {
    if text.trim().is_empty() {
        return ParsedGrants::default();
    }
    match serde_json::from_str::<Value>(text) {
        Ok(v) => parse_grants(&v),
        Err(_) => ParsedGrants {
            malformed: true,
            ..ParsedGrants::default()
        },
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VisibleModule {
    pub module: usize,
    pub submodules: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Visibility {
    pub full_access: bool,
    pub modules: Vec<VisibleModule>,
}

#[derive(Debug, Clone, Copy)]
pub struct Subject<'a> {
    pub role: &'a str,
    pub active: bool,
}

pub fn is_super_role(role: &str, super_roles: &[String]) -> bool {
    let r = role.trim();
    super_roles.iter().any(|s| s.eq_ignore_ascii_case(r))
}

pub fn resolve(subject: Subject<'_>, grants: &ParsedGrants, super_roles: &[String]) -> Visibility {
    if !subject.active {
        return Visibility {
            full_access: false,
            modules: Vec::new(),
        };
    }
    if is_super_role(subject.role, super_roles) {
        let modules = CATALOG
            .iter()
            .enumerate()
            .map(|(i, m)| VisibleModule {
                module: i,
                submodules: (0..m.submodules.len()).collect(),
            })
            .collect();
        return Visibility {
            full_access: true,
            modules,
        };
    }

    let mut modules = Vec::new();
    for (i, m) in CATALOG.iter().enumerate() {
        if grants.grants.contains(&Grant::Module(i)) {
            modules.push(VisibleModule {
                module: i,
                submodules: (0..m.submodules.len()).collect(),
            });
            continue;
        }
        let subs: Vec<usize> = grants
            .grants
            .iter()
            .filter(|g| g.module_index() == i)
            .filter_map(|g| match g {
                Grant::Submodule(_, s) => Some(*s),
                Grant::Module(_) => None,
            })
            .collect();
        if !subs.is_empty() || m.always_visible {
            modules.push(VisibleModule {
                module: i,
                submodules: subs,
            });
        }
    }
    Visibility {
        full_access: false,
        modules,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteMatch {
    Root,
    Module(usize),
    Submodule(usize, usize),
    Unknown,
}

fn normalize_route(route: &str) -> String {
    let cut = route.find(['?', '#']).unwrap_or(route.len());
    let mut r = route[..cut].trim().to_ascii_lowercase();
    while r.len() > 1 && r.ends_with('/') {
        r.pop();
    }
    if !r.starts_with('/') {
        r.insert(0, '/');
    }
    r
}

fn route_has_prefix(route: &str, prefix: &str) -> bool {
    route == prefix
        || (route.starts_with(prefix) && route.as_bytes().get(prefix.len()) == Some(&b'/'))
}

pub fn match_route(route: &str) -> RouteMatch {
    let r = normalize_route(route);
    if r == "/" {
        return RouteMatch::Root;
    }
    for (mi, m) in CATALOG.iter().enumerate() {
        if !route_has_prefix(&r, m.route) {
            continue;
        }
        for (si, s) in m.submodules.iter().enumerate() {
            if route_has_prefix(&r, s.route) {
                return RouteMatch::Submodule(mi, si);
            }
        }
        return RouteMatch::Module(mi);
    }
    RouteMatch::Unknown
}

impl Visibility {
    fn module(&self, idx: usize) -> Option<&VisibleModule> {
        self.modules.iter().find(|m| m.module == idx)
    }

    pub fn landing_route(&self, preferred_module: Option<&str>) -> Option<&'static str> {
        if let Some(idx) = preferred_module.and_then(find_module) {
            if self.module(idx).is_some() {
                return Some(CATALOG[idx].route);
            }
        }
        self.modules.first().map(|m| CATALOG[m.module].route)
    }

    /// Returns the match and whether it is allowed.
    pub fn check_route(&self, route: &str) -> (RouteMatch, bool) {
        let matched = match_route(route);
        let allowed = match matched {
            RouteMatch::Root => !self.modules.is_empty(),
            RouteMatch::Module(m) => self.module(m).is_some(),
            RouteMatch::Submodule(m, s) => self
                .module(m)
                .map(|vm| vm.submodules.contains(&s))
                .unwrap_or(false),
            RouteMatch::Unknown => false,
        };
        (matched, allowed)
    }

    pub fn granted_ids(&self) -> Vec<String> {
        let mut out = Vec::new();
        for vm in &self.modules {
            let m = &CATALOG[vm.module];
            if vm.submodules.len() == m.submodules.len() {
                out.push(m.id.to_string());
            } else {
                for s in &vm.submodules {
                    out.push(format!("{}.{}", m.id, m.submodules[*s].id));
                }
            }
        }
        out
    }

    pub fn sections_json(&self) -> Vec<Value> {
        self.modules
            .iter()
            .map(|vm| {
                let m = &CATALOG[vm.module];
                let subs: Vec<Value> = vm
                    .submodules
                    .iter()
                    .map(|s| submodule_json(m, &m.submodules[*s]))
                    .collect();
                json!({
                    "id": m.id,
                    "label": m.label,
                    "route": m.route,
                    "submodules": subs
                })
            })
            .collect()
    }
}

fn submodule_json(m: &ModuleDef, s: &SubmoduleDef) -> Value {
    json!({
        "id": format!("{}.{}", m.id, s.id),
        "label": s.label,
        "route": s.route
    })
}

pub fn catalog_json() -> Vec<Value> {
    CATALOG
        .iter()
        .map(|m| {
            json!({
                "id": m.id,
                "label": m.label,
                "route": m.route,
                "alwaysVisible": m.always_visible,
                "submodules": m.submodules.iter().map(|s| submodule_json(m, s)).collect::<Vec<_>>()
            })
        })
        .collect()
}

pub fn route_match_json(m: RouteMatch) -> Value {
    match m {
        RouteMatch::Module(mi) => json!({ "moduleId": CATALOG[mi].id, "submoduleId": null }),
        RouteMatch::Submodule(mi, si) => json!({
            "moduleId": CATALOG[mi].id,
            "submoduleId": format!("{}.{}", CATALOG[mi].id, CATALOG[mi].submodules[si].id)
        }),
        RouteMatch::Root | RouteMatch::Unknown => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn admins() -> Vec<String> {
        vec!["admin".to_string()]
    }

    fn staff() -> Subject<'static> {
        Subject {
            role: "bursar",
            active: true,
        }
    }

    #[test]
    fn catalog_ids_are_unique_and_routes_nest() {
        let mut seen = BTreeSet::new();
        for m in CATALOG {
            assert!(seen.insert(m.id), "duplicate module {}", m.id);
            for s in m.submodules {
                assert!(
                    route_has_prefix(s.route, m.route),
                    "{} not under {}",
                    s.route,
                    m.route
                );
            }
        }
    }

    #[test]
    fn loose_spellings_match_catalog_entries() {
        let parsed = parse_grants(&json!([
            "Financials/Fee Structures",
            "students.custom-fields",
            "LIBRARY",
            "Purchase Orders"
        ]));
        assert_eq!(
            parsed.canonical_ids(),
            vec![
                "students.customFields",
                "financials.feeStructures",
                "inventory.purchaseOrders",
                "library"
            ]
        );
        assert!(parsed.unrecognized.is_empty());
        assert!(!parsed.malformed);
    }

    #[test]
    fn bare_submodule_shared_by_two_modules_is_ambiguous() {
        let parsed = parse_grants(&json!(["Attendance", "hr:attendance", "nope"]));
        assert_eq!(parsed.ambiguous, vec!["Attendance"]);
        assert_eq!(parsed.unrecognized, vec!["nope"]);
        assert_eq!(parsed.canonical_ids(), vec!["hr.attendance"]);
    }

    #[test]
    fn object_entries_and_wildcards() {
        let parsed = parse_grants(&json!([
            { "module": "financials", "submodules": ["Invoices", "ghost"] },
            { "module": "leads" },
            { "id": "scheduling.*" },
            42
        ]));
        assert_eq!(
            parsed.canonical_ids(),
            vec!["financials.invoices", "leads", "scheduling"]
        );
        assert_eq!(parsed.unrecognized, vec!["financials.ghost", "42"]);
    }

    #[test]
    fn malformed_submodule_lists_grant_nothing() {
        let parsed = parse_grants(&json!([
            { "module": "financials", "submodules": "invoices" },
            { "module": "settings", "submodules": [42] },
            { "module": "hr", "submodules": { "payroll": true } }
        ]));
        assert!(parsed.grants.is_empty());
        assert_eq!(
            parsed.unrecognized,
            vec![
                "financials.\"invoices\"",
                "settings.42",
                "hr.{\"payroll\":true}"
            ]
        );

        let mixed = parse_grants(&json!([{ "module": "settings", "submodules": ["users", 7] }]));
        assert_eq!(mixed.canonical_ids(), vec!["settings.users"]);
        assert_eq!(mixed.unrecognized, vec!["settings.7"]);

        let whole = parse_grants(&json!([
            { "module": "settings", "submodules": null },
            { "module": "hr", "submodules": [] }
        ]));
        assert_eq!(whole.canonical_ids(), vec!["hr", "settings"]);
    }

    #[test]
    fn module_grant_absorbs_its_submodules() {
        let parsed = parse_grants(&json!(["hr.payroll", "hr", "hr.staff"]));
        assert_eq!(parsed.canonical_ids(), vec!["hr"]);
    }

    #[test]
    fn malformed_text_yields_no_grants() {
        let p = parse_grants_text("{not json");
        assert!(p.malformed);
        assert!(p.grants.is_empty());
        let p = parse_grants_text("{\"financials\": true}");
        assert!(p.malformed);
        let p = parse_grants_text("");
        assert!(!p.malformed);
    }

    #[test]
    fn submodule_grant_shows_parent_with_only_that_child() {
        let parsed = parse_grants(&json!(["financials.payments", "financials.invoices"]));
        let vis = resolve(staff(), &parsed, &admins());
        assert!(!vis.full_access);
        let ids: Vec<&str> = vis.modules.iter().map(|m| CATALOG[m.module].id).collect();
        assert_eq!(ids, vec!["dashboard", "financials"]);
        // Catalog order, not grant order.
        assert_eq!(
            vis.granted_ids(),
            vec!["dashboard", "financials.invoices", "financials.payments"]
        );
    }

    #[test]
    fn super_role_sees_everything_case_insensitively() {
        let vis = resolve(
            Subject {
                role: "Admin",
                active: true,
            },
            &ParsedGrants::default(),
            &admins(),
        );
        assert!(vis.full_access);
        assert_eq!(vis.modules.len(), CATALOG.len());
        assert!(vis.check_route("/hr/payroll/2026-01").1);
    }

    #[test]
    fn inactive_user_sees_nothing() {
        let parsed = parse_grants(&json!(["financials"]));
        let vis = resolve(
            Subject {
                role: "admin",
                active: false,
            },
            &parsed,
            &admins(),
        );
        assert!(vis.modules.is_empty());
        assert_eq!(vis.landing_route(Some("dashboard")), None);
        assert!(!vis.check_route("/").1);
    }

    #[test]
    fn route_checks_respect_submodule_scope() {
        let parsed = parse_grants(&json!(["financials.invoices"]));
        let vis = resolve(staff(), &parsed, &admins());

        let (m, allowed) = vis.check_route("/financials/invoices/abc?tab=lines");
        assert_eq!(m, RouteMatch::Submodule(2, 0));
        assert!(allowed);
        assert!(vis.check_route("/financials").1);
        assert!(!vis.check_route("/financials/payments").1);
        assert!(!vis.check_route("/hr").1);
        assert!(vis.check_route("/dashboard/").1);
        assert_eq!(vis.check_route("/nowhere").0, RouteMatch::Unknown);
        assert!(!vis.check_route("/nowhere").1);
        // Segment boundary: "/hrx" is not under "/hr".
        assert_eq!(match_route("/hrx"), RouteMatch::Unknown);
    }

    #[test]
    fn landing_prefers_configured_module_when_visible() {
        let parsed = parse_grants(&json!(["library"]));
        let vis = resolve(staff(), &parsed, &admins());
        assert_eq!(vis.landing_route(Some("library")), Some("/library"));
        assert_eq!(vis.landing_route(Some("hr")), Some("/dashboard"));
        assert_eq!(vis.landing_route(None), Some("/dashboard"));
    }
}
