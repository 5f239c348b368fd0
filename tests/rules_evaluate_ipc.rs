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

struct Fixture {
    students: Vec<String>,
    field_id: String,
}

/// Three students with a numeric `siblings` field: 0, 2 and unset.
fn seed(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>) -> Fixture {
    let workspace = temp_dir("campus-rules");
    let _ = request_ok(
        stdin,
        reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let field = request_ok(
        stdin,
        reader,
        "f1",
        "customFields.create",
        json!({ "key": "siblings", "label": "Siblings", "fieldType": "number" }),
    );
    let field_id = field["fieldId"].as_str().expect("fieldId").to_string();

    let mut students = Vec::new();
    for (i, (last, value)) in [("Ash", json!(0)), ("Birch", json!(2)), ("Cedar", json!(null))]
        .into_iter()
        .enumerate()
    {
        let created = request_ok(
            stdin,
            reader,
            &format!("s{}", i),
            "students.create",
            json!({ "lastName": last, "firstName": "Kid" }),
        );
        let id = created["studentId"].as_str().expect("studentId").to_string();
        let _ = request_ok(
            stdin,
            reader,
            &format!("v{}", i),
            "customFields.values.set",
            json!({ "studentId": id, "fieldId": field_id, "value": value }),
        );
        students.push(id);
    }
    Fixture { students, field_id }
}

#[test]
fn evaluate_reports_per_student_qualification() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let fx = seed(&mut stdin, &mut reader);

    let rule = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "rules.create",
        json!({
            "name": "Sibling discount",
            "fieldId": fx.field_id,
            "operator": "gte",
            "operand": "1",
            "unitAmountCents": -2500
        }),
    );
    let rule_id = rule["ruleId"].as_str().expect("ruleId").to_string();
    assert_eq!(rule["rule"]["operand"], json!("1"));
    assert_eq!(rule["rule"]["amountCents"], json!(-2500));

    let eval = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "rules.evaluate",
        json!({ "ruleId": rule_id }),
    );
    assert_eq!(eval["qualifying"], json!(1));
    let results = eval["results"].as_array().expect("results");
    let qualifies: Vec<bool> = results
        .iter()
        .map(|r| r["qualifies"].as_bool().expect("qualifies"))
        .collect();
    assert_eq!(qualifies, vec![false, true, false]);
    assert!(results[2]["value"].is_null());

    // A missing value only qualifies for isEmpty.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "rules.update",
        json!({ "ruleId": rule_id, "patch": { "operator": "isEmpty" } }),
    );
    let eval = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "rules.evaluate",
        json!({ "ruleId": rule_id, "studentIds": [fx.students[2].clone(), fx.students[0].clone()] }),
    );
    let results = eval["results"].as_array().expect("results");
    assert_eq!(results.len(), 2);
    assert_eq!(results[0]["studentId"], json!(fx.students[0]));
    assert_eq!(results[0]["qualifies"], json!(false));
    assert_eq!(results[1]["qualifies"], json!(true));
}

#[test]
fn rule_validation_rejects_bad_operator_operand_pairs() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let fx = seed(&mut stdin, &mut reader);

    let cases = [
        json!({ "name": "x", "fieldId": fx.field_id, "operator": "contains", "operand": "1", "unitAmountCents": 1 }),
        json!({ "name": "x", "fieldId": fx.field_id, "operator": "equals", "operand": "many", "unitAmountCents": 1 }),
        json!({ "name": "x", "fieldId": fx.field_id, "operator": "in", "operand": [], "unitAmountCents": 1 }),
        json!({ "name": "x", "fieldId": fx.field_id, "operator": "bogus", "operand": "1", "unitAmountCents": 1 }),
        json!({ "name": "x", "fieldId": fx.field_id, "operator": "isSet", "quantity": 0, "unitAmountCents": 1 }),
        json!({ "name": "x", "fieldId": fx.field_id, "operator": "isSet", "quantity": 10000, "unitAmountCents": i64::MAX }),
    ];
    for (i, params) in cases.into_iter().enumerate() {
        let code = request_err_code(&mut stdin, &mut reader, &format!("c{}", i), "rules.create", params);
        assert_eq!(code, "bad_params");
    }

    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "m",
        "rules.create",
        json!({ "name": "x", "fieldId": "missing", "operator": "isSet", "unitAmountCents": 1 }),
    );
    assert_eq!(code, "not_found");

    let listed = request_ok(&mut stdin, &mut reader, "l", "rules.list", json!({}));
    assert_eq!(listed["rules"], json!([]));
}

#[test]
fn in_operator_accepts_comma_separated_operands() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let fx = seed(&mut stdin, &mut reader);

    let rule = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "rules.create",
        json!({
            "name": "Small families",
            "fieldId": fx.field_id,
            "operator": "in",
            "operand": "0, 1, 0",
            "quantity": 2,
            "unitAmountCents": 1000
        }),
    );
    assert_eq!(rule["rule"]["operand"], json!(["0", "1"]));
    assert_eq!(rule["rule"]["amountCents"], json!(2000));

    let eval = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "rules.evaluate",
        json!({ "ruleId": rule["ruleId"] }),
    );
    assert_eq!(eval["qualifying"], json!(1));
    assert_eq!(eval["results"][0]["qualifies"], json!(true));
}
