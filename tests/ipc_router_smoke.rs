use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_campusd");
    let mut child = Command::new(exe)
        .env_remove("CAMPUSD_WORKSPACE")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn campusd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn request_err_code(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> String {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(false),
        "{} unexpectedly succeeded: {}",
        method,
        value
    );
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string()
}

#[test]
fn health_and_protocol_errors() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let health = request_ok(&mut stdin, &mut reader, "1", "health", json!({}));
    assert!(health.get("version").and_then(|v| v.as_str()).is_some());
    assert!(health.get("workspacePath").map(|v| v.is_null()).unwrap_or(false));

    writeln!(stdin, "{{not json").expect("write garbage");
    stdin.flush().expect("flush garbage");
    let mut line = String::new();
    reader.read_line(&mut line).expect("read bad_json response");
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value["ok"], json!(false));
    assert_eq!(value["error"]["code"], json!("bad_json"));

    let code = request_err_code(&mut stdin, &mut reader, "2", "no.such.method", json!({}));
    assert_eq!(code, "not_implemented");

    let code = request_err_code(&mut stdin, &mut reader, "3", "students.list", json!({}));
    assert_eq!(code, "no_workspace");

    // The catalog is static and needs no workspace.
    let catalog = request_ok(&mut stdin, &mut reader, "4", "access.catalog", json!({}));
    let modules = catalog["modules"].as_array().expect("modules");
    assert_eq!(modules[0]["id"], json!("dashboard"));
}

#[test]
fn router_dispatch_smoke_covers_handler_families() {
    let workspace = temp_dir("campus-router-smoke");
    let bundle_out = workspace.join("smoke-backup.zip");
    let csv_out = workspace.join("smoke-invoices.csv");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let selected = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    assert!(selected.get("workspacePath").is_some());

    let calls: Vec<(&str, serde_json::Value)> = vec![
        ("setup.get", json!({})),
        ("access.resolve", json!({ "role": "staff", "permissions": ["students"] })),
        ("access.check", json!({ "role": "staff", "route": "/students" })),
        ("users.list", json!({})),
        ("students.list", json!({})),
        ("customFields.list", json!({})),
        ("rules.list", json!({})),
        ("invoices.list", json!({})),
        ("invoices.exportCsv", json!({ "outPath": csv_out.to_string_lossy() })),
        ("staging.preview", json!({ "period": "2026-T1" })),
        ("staging.batches", json!({})),
        ("dashboard.summary", json!({})),
        (
            "backup.exportWorkspaceBundle",
            json!({ "outPath": bundle_out.to_string_lossy() }),
        ),
        (
            "backup.importWorkspaceBundle",
            json!({ "inPath": bundle_out.to_string_lossy() }),
        ),
    ];
    for (i, (method, params)) in calls.into_iter().enumerate() {
        let id = format!("s{}", i);
        let _ = request_ok(&mut stdin, &mut reader, &id, method, params);
    }

    // Still usable after the import reopened the database.
    let summary = request_ok(&mut stdin, &mut reader, "9", "dashboard.summary", json!({}));
    assert_eq!(summary["students"]["total"], json!(0));
    assert_eq!(summary["invoices"]["draft"], json!(0));
}
