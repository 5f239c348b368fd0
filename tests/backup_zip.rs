#[path = "../src/backup.rs"]
mod backup;

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
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

fn seed_sqlite(path: &Path, marker: &str) {
    let conn = rusqlite::Connection::open(path).expect("open sqlite");
    conn.execute_batch("CREATE TABLE IF NOT EXISTS marker(v TEXT NOT NULL); DELETE FROM marker;")
        .expect("create marker table");
    conn.execute("INSERT INTO marker(v) VALUES(?)", [marker])
        .expect("insert marker");
}

fn read_marker(path: &Path) -> String {
    let conn = rusqlite::Connection::open(path).expect("open sqlite");
    conn.query_row("SELECT v FROM marker", [], |r| r.get(0))
        .expect("read marker")
}

fn write_bundle(path: &Path, manifest: serde_json::Value, db_bytes: &[u8]) {
    let f = File::create(path).expect("create bundle");
    let mut zip = zip::ZipWriter::new(f);
    let opts = zip::write::FileOptions::default();
    zip.start_file("manifest.json", opts).expect("manifest entry");
    zip.write_all(manifest.to_string().as_bytes())
        .expect("write manifest");
    zip.start_file("db/campus.sqlite3", opts).expect("db entry");
    zip.write_all(db_bytes).expect("write db");
    zip.finish().expect("finish zip");
}

#[test]
fn zip_export_and_import_roundtrip() {
    let workspace = temp_dir("campus-backup-src");
    let workspace2 = temp_dir("campus-backup-dst");
    let out_dir = temp_dir("campus-backup-out");

    seed_sqlite(&workspace.join("campus.sqlite3"), "exported");

    let bundle_path = out_dir.join("workspace.campus.zip");
    let export = backup::export_workspace_bundle(&workspace, &bundle_path).expect("export bundle");
    assert_eq!(export.bundle_format, backup::BUNDLE_FORMAT_V1);
    assert_eq!(export.entry_count, 3);
    assert_eq!(export.db_sha256.len(), 64);

    let f = File::open(&bundle_path).expect("open bundle");
    let mut archive = zip::ZipArchive::new(f).expect("open zip archive");
    let mut manifest = String::new();
    archive
        .by_name("manifest.json")
        .expect("manifest entry")
        .read_to_string(&mut manifest)
        .expect("read manifest");
    let manifest: serde_json::Value = serde_json::from_str(&manifest).expect("manifest json");
    assert_eq!(manifest["format"], serde_json::json!(backup::BUNDLE_FORMAT_V1));
    assert_eq!(manifest["dbSha256"], serde_json::json!(export.db_sha256));
    archive
        .by_name("db/campus.sqlite3")
        .expect("database entry in bundle");
    archive
        .by_name("meta/workspace.json")
        .expect("workspace meta entry in bundle");

    let import = backup::import_workspace_bundle(&bundle_path, &workspace2).expect("import bundle");
    assert_eq!(import.bundle_format_detected, backup::BUNDLE_FORMAT_V1);

    assert_eq!(read_marker(&workspace2.join("campus.sqlite3")), "exported");

    let _ = std::fs::remove_dir_all(workspace);
    let _ = std::fs::remove_dir_all(workspace2);
    let _ = std::fs::remove_dir_all(out_dir);
}

#[test]
fn raw_sqlite_import_is_supported() {
    let out_dir = temp_dir("campus-backup-raw");
    let workspace = temp_dir("campus-backup-raw-dst");

    let raw_file = out_dir.join("copy.sqlite3");
    seed_sqlite(&raw_file, "raw copy");

    let import = backup::import_workspace_bundle(&raw_file, &workspace).expect("import raw sqlite");
    assert_eq!(import.bundle_format_detected, "raw-sqlite3");

    assert_eq!(read_marker(&workspace.join("campus.sqlite3")), "raw copy");
    assert!(!workspace.join("campus.sqlite3.importing").exists());

    let _ = std::fs::remove_dir_all(out_dir);
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn checksum_mismatch_leaves_workspace_untouched() {
    let out_dir = temp_dir("campus-backup-tampered");
    let workspace = temp_dir("campus-backup-tampered-dst");
    seed_sqlite(&workspace.join("campus.sqlite3"), "original");

    let bundle_path = out_dir.join("tampered.zip");
    write_bundle(
        &bundle_path,
        serde_json::json!({
            "format": backup::BUNDLE_FORMAT_V1,
            "dbSha256": "0".repeat(64)
        }),
        b"replacement",
    );

    let err = backup::import_workspace_bundle(&bundle_path, &workspace)
        .expect_err("tampered bundle must be rejected");
    assert!(err.to_string().contains("checksum"));
    assert_eq!(read_marker(&workspace.join("campus.sqlite3")), "original");
    assert!(!workspace.join("campus.sqlite3.importing").exists());

    let _ = std::fs::remove_dir_all(out_dir);
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn manifest_without_checksum_is_rejected() {
    let out_dir = temp_dir("campus-backup-nosha");
    let workspace = temp_dir("campus-backup-nosha-dst");
    seed_sqlite(&workspace.join("campus.sqlite3"), "original");

    let bundle_path = out_dir.join("nosha.zip");
    write_bundle(
        &bundle_path,
        serde_json::json!({ "format": backup::BUNDLE_FORMAT_V1 }),
        b"tampered",
    );

    let err = backup::import_workspace_bundle(&bundle_path, &workspace)
        .expect_err("bundle without checksum must be rejected");
    assert!(err.to_string().contains("dbSha256"));
    assert_eq!(read_marker(&workspace.join("campus.sqlite3")), "original");
    assert!(!workspace.join("campus.sqlite3.importing").exists());

    let _ = std::fs::remove_dir_all(out_dir);
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn bundle_without_database_entry_cleans_up_temp_file() {
    let out_dir = temp_dir("campus-backup-nodb");
    let workspace = temp_dir("campus-backup-nodb-dst");
    seed_sqlite(&workspace.join("campus.sqlite3"), "original");

    let bundle_path = out_dir.join("nodb.zip");
    {
        let f = File::create(&bundle_path).expect("create bundle");
        let mut zip = zip::ZipWriter::new(f);
        let opts = zip::write::FileOptions::default();
        zip.start_file("manifest.json", opts).expect("manifest entry");
        let manifest = serde_json::json!({
            "format": backup::BUNDLE_FORMAT_V1,
            "dbSha256": "0".repeat(64)
        });
        zip.write_all(manifest.to_string().as_bytes())
            .expect("write manifest");
        zip.finish().expect("finish zip");
    }

    let err = backup::import_workspace_bundle(&bundle_path, &workspace)
        .expect_err("bundle without database must be rejected");
    assert!(err.to_string().contains("db/campus.sqlite3"));
    assert!(!workspace.join("campus.sqlite3.importing").exists());
    assert_eq!(read_marker(&workspace.join("campus.sqlite3")), "original");

    let _ = std::fs::remove_dir_all(out_dir);
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn bundled_file_with_valid_checksum_must_still_be_sqlite() {
    use sha2::{Digest, Sha256};

    let out_dir = temp_dir("campus-backup-notsqlite");
    let workspace = temp_dir("campus-backup-notsqlite-dst");
    seed_sqlite(&workspace.join("campus.sqlite3"), "original");

    let payload = b"name,grade\nAda,7\n";
    let mut hasher = Sha256::new();
    hasher.update(payload);
    let bundle_path = out_dir.join("csv.zip");
    write_bundle(
        &bundle_path,
        serde_json::json!({
            "format": backup::BUNDLE_FORMAT_V1,
            "dbSha256": format!("{:x}", hasher.finalize())
        }),
        payload,
    );

    let err = backup::import_workspace_bundle(&bundle_path, &workspace)
        .expect_err("non-sqlite payload must be rejected");
    assert!(err.to_string().contains("not a SQLite database"));
    assert_eq!(read_marker(&workspace.join("campus.sqlite3")), "original");
    assert!(!workspace.join("campus.sqlite3.importing").exists());

    let _ = std::fs::remove_dir_all(out_dir);
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn raw_import_of_a_non_sqlite_file_is_rejected() {
    let out_dir = temp_dir("campus-backup-csv");
    let workspace = temp_dir("campus-backup-csv-dst");
    seed_sqlite(&workspace.join("campus.sqlite3"), "original");

    let csv = out_dir.join("notes.csv");
    std::fs::write(&csv, b"name,grade\nAda,7\n").expect("write csv");

    let err = backup::import_workspace_bundle(&csv, &workspace)
        .expect_err("csv must not replace the database");
    assert!(err.to_string().contains("neither a workspace bundle nor a SQLite database"));
    assert_eq!(read_marker(&workspace.join("campus.sqlite3")), "original");
    assert!(!workspace.join("campus.sqlite3.importing").exists());

    let _ = std::fs::remove_dir_all(out_dir);
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn raw_import_of_a_truncated_sqlite_file_is_rejected() {
    let out_dir = temp_dir("campus-backup-trunc");
    let workspace = temp_dir("campus-backup-trunc-dst");
    seed_sqlite(&workspace.join("campus.sqlite3"), "original");

    let mut bytes = b"SQLite format 3\0".to_vec();
    bytes.extend_from_slice(&[0u8; 8]);
    let raw = out_dir.join("broken.sqlite3");
    std::fs::write(&raw, &bytes).expect("write truncated file");

    backup::import_workspace_bundle(&raw, &workspace)
        .expect_err("truncated database must be rejected");
    assert_eq!(read_marker(&workspace.join("campus.sqlite3")), "original");
    assert!(!workspace.join("campus.sqlite3.importing").exists());

    let _ = std::fs::remove_dir_all(out_dir);
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn unknown_bundle_format_is_rejected() {
    let out_dir = temp_dir("campus-backup-format");
    let workspace = temp_dir("campus-backup-format-dst");

    let bundle_path = out_dir.join("other.zip");
    {
        let f = File::create(&bundle_path).expect("create bundle");
        let mut zip = zip::ZipWriter::new(f);
        let opts = zip::write::FileOptions::default();
        zip.start_file("manifest.json", opts).expect("manifest entry");
        zip.write_all(br#"{"format":"someone-else-v9"}"#)
            .expect("write manifest");
        zip.finish().expect("finish zip");
    }

    let err = backup::import_workspace_bundle(&bundle_path, &workspace)
        .expect_err("foreign bundle must be rejected");
    assert!(err.to_string().contains("unsupported bundle format"));

    let _ = std::fs::remove_dir_all(out_dir);
    let _ = std::fs::remove_dir_all(workspace);
}
