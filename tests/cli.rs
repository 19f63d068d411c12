//! CLI test cases.
//!
//! These use the `fixture` engine, which replays the `*.ocr.json` files next
//! to each document in `tests/fixtures/docs`, so they need neither network
//! access nor poppler.

use std::{path::Path, process::Command};

use assert_cmd::prelude::*;
use predicates::prelude::*;

static ALPHA: &str = "tests/fixtures/docs/alpha.png";
static BETA: &str = "tests/fixtures/docs/beta.png";
static BROKEN: &str = "tests/fixtures/docs/broken.txt";

/// Create a new `Command` with our binary, using the database at `db`.
fn cmd(db: &Path) -> Command {
    let mut cmd = Command::cargo_bin("ocr-indexer").unwrap();
    cmd.env_remove("GOOGLE_VISION_API_KEY")
        .env_remove("OCR_INDEXER_DATABASE")
        .arg("--database")
        .arg(db);
    cmd
}

/// Ingest `paths` into a fresh database.
fn ingest(db: &Path, paths: &[&str]) {
    cmd(db)
        .args(["ingest", "--engine", "fixture"])
        .args(paths)
        .assert()
        .success();
}

#[test]
fn test_help() {
    Command::cargo_bin("ocr-indexer")
        .unwrap()
        .arg("--help")
        .assert()
        .success();
}

#[test]
fn test_version() {
    Command::cargo_bin("ocr-indexer")
        .unwrap()
        .arg("--version")
        .assert()
        .success();
}

#[test]
fn test_ingest_reports_each_document() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("index.db");
    cmd(&db)
        .args(["ingest", "--engine", "fixture", ALPHA, BROKEN, BETA])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""key":"alpha","status":"ingested""#))
        .stdout(predicate::str::contains(r#""key":"broken","status":"failed""#))
        .stdout(predicate::str::contains(r#""key":"beta","status":"ingested""#))
        .stderr(predicate::str::contains("2 ingested, 0 skipped, 1 failed"));
}

#[test]
fn test_ingest_skips_existing_documents() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("index.db");
    ingest(&db, &[ALPHA]);
    cmd(&db)
        .args(["ingest", "--engine", "fixture", ALPHA])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""status":"skipped""#));
    cmd(&db)
        .args(["ingest", "--engine", "fixture", "--override-existing", ALPHA])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""status":"ingested""#));
}

#[test]
fn test_ingest_single_page() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("index.db");
    cmd(&db)
        .args(["ingest", "--engine", "fixture", "--page", "1", ALPHA])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""status":"failed""#));
    cmd(&db)
        .args(["ingest", "--engine", "fixture", "--page", "0", ALPHA])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""status":"ingested""#));
    cmd(&db)
        .args(["ingest", "--engine", "fixture", "--page", "0", ALPHA, BETA])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--page needs exactly one document"));
}

#[test]
fn test_ingest_reports_keyless_paths() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("index.db");
    ingest(&db, &[ALPHA]);
    cmd(&db)
        .args(["ingest", "--engine", "fixture", "--override-existing", "/", ALPHA])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""path":"/","status":"failed""#))
        .stdout(predicate::str::contains(r#""key":"alpha","status":"ingested""#));
}

#[test]
fn test_max_pages_must_be_positive() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("index.db");
    cmd(&db)
        .args(["ingest", "--engine", "fixture", "--max-pages", "0", ALPHA])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--max-pages"));
}

#[test]
fn test_find_and_search() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("index.db");
    ingest(&db, &[ALPHA, BETA]);

    cmd(&db)
        .args(["find", "hello", "zzz"])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""alpha""#))
        .stdout(predicate::str::contains(r#""Hello""#))
        .stdout(predicate::str::contains("beta").not());

    cmd(&db)
        .args(["find", "moon", "--scope", "alpha"])
        .assert()
        .success()
        .stdout(predicate::str::contains("{}"));

    cmd(&db)
        .args(["search", "WORLD"])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""document_id":"alpha""#))
        .stdout(predicate::str::contains(r#""text":"World""#));
}

#[test]
fn test_text_exists_contains_and_delete() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("index.db");
    ingest(&db, &[ALPHA]);

    cmd(&db)
        .args(["text", ALPHA])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""Hello World""#));
    cmd(&db)
        .args(["contains", ALPHA, "world"])
        .assert()
        .success()
        .stdout(predicate::str::diff("true\n"));
    cmd(&db)
        .args(["exists", ALPHA])
        .assert()
        .success()
        .stdout(predicate::str::diff("true\n"));
    cmd(&db)
        .args(["delete", ALPHA])
        .assert()
        .success()
        .stdout(predicate::str::diff("true\n"));
    cmd(&db)
        .args(["exists", ALPHA])
        .assert()
        .success()
        .stdout(predicate::str::diff("false\n"));
}

#[test]
fn test_live_text_does_not_store_anything() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("index.db");
    cmd(&db)
        .args(["text", "--live", "--engine", "fixture", BETA])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""Goodbye Moon""#));
    cmd(&db)
        .args(["exists", BETA])
        .assert()
        .success()
        .stdout(predicate::str::diff("false\n"));
}

#[test]
fn test_missing_credential_is_a_configuration_error() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("index.db");
    cmd(&db)
        .args(["ingest", "--engine", "vision", ALPHA])
        .assert()
        .failure()
        .stderr(predicate::str::contains("recognition is not configured"));
}

#[test]
#[ignore = "Needs GOOGLE_VISION_API_KEY and poppler-utils"]
fn test_ingest_pdf_with_vision() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("index.db");
    let mut cmd = Command::cargo_bin("ocr-indexer").unwrap();
    cmd.arg("--database")
        .arg(&db)
        .args(["ingest", "tests/fixtures/docs/two_pages.pdf"])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""page_count":2"#));
}
