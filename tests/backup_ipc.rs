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

fn seed_workspace(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    prefix: &str,
) -> PathBuf {
    let workspace = temp_dir(prefix);
    let _ = request_ok(
        stdin,
        reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = request_ok(
        stdin,
        reader,
        "seed",
        "students.create",
        json!({ "firstName": "Ada", "lastName": "Lovelace" }),
    );
    workspace
}

fn last_names(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>, id: &str) -> Vec<String> {
    let listed = request_ok(stdin, reader, id, "students.list", json!({}));
    listed["students"]
        .as_array()
        .expect("students")
        .iter()
        .map(|s| s["lastName"].as_str().expect("lastName").to_string())
        .collect()
}

#[test]
fn bundle_import_restores_the_exported_state() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let workspace = seed_workspace(&mut stdin, &mut reader, "campus-backup-ipc-roundtrip");
    let bundle = temp_dir("campus-backup-ipc-out").join("term1.zip");

    let exported = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "backup.exportWorkspaceBundle",
        json!({ "outPath": bundle.to_string_lossy() }),
    );
    assert_eq!(exported["bundleFormat"], json!("campus-workspace-v1"));
    assert_eq!(exported["dbSha256"].as_str().map(|s| s.len()), Some(64));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "students.create",
        json!({ "firstName": "Ben", "lastName": "Babbage" }),
    );
    assert_eq!(last_names(&mut stdin, &mut reader, "3"), vec!["Babbage", "Lovelace"]);

    let imported = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "backup.importWorkspaceBundle",
        json!({ "inPath": bundle.to_string_lossy() }),
    );
    assert_eq!(imported["bundleFormatDetected"], json!("campus-workspace-v1"));
    assert_eq!(
        imported["workspacePath"].as_str(),
        Some(workspace.to_string_lossy().as_ref())
    );
    assert_eq!(last_names(&mut stdin, &mut reader, "5"), vec!["Lovelace"]);
}

#[test]
fn rejected_raw_import_keeps_the_current_workspace() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let workspace = seed_workspace(&mut stdin, &mut reader, "campus-backup-ipc-raw");
    let before = std::fs::read(workspace.join("campus.sqlite3")).expect("read db");

    let csv = temp_dir("campus-backup-ipc-csv").join("notes.csv");
    std::fs::write(&csv, b"name,grade\nAda,7\n").expect("write csv");

    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "1",
        "backup.importWorkspaceBundle",
        json!({ "inPath": csv.to_string_lossy() }),
    );
    assert_eq!(code, "io_failed");

    let after = std::fs::read(workspace.join("campus.sqlite3")).expect("read db");
    assert_eq!(after, before);
    assert!(!workspace.join("campus.sqlite3.importing").exists());
    assert_eq!(last_names(&mut stdin, &mut reader, "2"), vec!["Lovelace"]);

    let health = request_ok(&mut stdin, &mut reader, "3", "health", json!({}));
    assert_eq!(
        health["workspacePath"].as_str(),
        Some(workspace.to_string_lossy().as_ref())
    );
}

#[test]
fn tampered_bundle_is_refused_and_workspace_reopened() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _workspace = seed_workspace(&mut stdin, &mut reader, "campus-backup-ipc-tamper");
    let bundle = temp_dir("campus-backup-ipc-tamper-out").join("tampered.zip");
    {
        let f = std::fs::File::create(&bundle).expect("create bundle");
        let mut zip = zip::ZipWriter::new(f);
        let opts = zip::write::FileOptions::default();
        zip.start_file("manifest.json", opts).expect("manifest entry");
        zip.write_all(json!({ "format": "campus-workspace-v1" }).to_string().as_bytes())
            .expect("write manifest");
        zip.start_file("db/campus.sqlite3", opts).expect("db entry");
        zip.write_all(b"tampered").expect("write db");
        zip.finish().expect("finish zip");
    }

    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "1",
        "backup.importWorkspaceBundle",
        json!({ "inPath": bundle.to_string_lossy() }),
    );
    assert_eq!(code, "io_failed");
    assert_eq!(last_names(&mut stdin, &mut reader, "2"), vec!["Lovelace"]);
}

#[test]
fn import_and_export_validate_their_params() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "1",
        "backup.exportWorkspaceBundle",
        json!({ "outPath": "/tmp/never-written.zip" }),
    );
    assert_eq!(code, "no_workspace");

    let _workspace = seed_workspace(&mut stdin, &mut reader, "campus-backup-ipc-params");
    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "2",
        "backup.importWorkspaceBundle",
        json!({}),
    );
    assert_eq!(code, "bad_params");

    let missing = temp_dir("campus-backup-ipc-missing").join("absent.zip");
    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "3",
        "backup.importWorkspaceBundle",
        json!({ "inPath": missing.to_string_lossy() }),
    );
    assert_eq!(code, "not_found");
    assert_eq!(last_names(&mut stdin, &mut reader, "4"), vec!["Lovelace"]);
}
