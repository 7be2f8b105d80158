//! CLI integration tests for mapvault admin commands.
//!
//! Each test uses an isolated temp directory for the database, ensuring tests
//! can run in parallel safely.

#![allow(deprecated)] // Command::cargo_bin deprecation only affects custom build dirs

use std::path::Path;

use assert_cmd::Command;
use chrono::Utc;
use mapvault::store::{SqliteStore, Store};
use mapvault::types::{Node, NodeKind};
use predicates::prelude::*;
use tempfile::TempDir;

struct TestContext {
    temp_dir: TempDir,
}

impl TestContext {
    fn new() -> Self {
        Self {
            temp_dir: TempDir::new().expect("failed to create temp dir"),
        }
    }

    fn data_dir(&self) -> &Path {
        self.temp_dir.path()
    }

    fn data_dir_str(&self) -> String {
        self.data_dir().to_string_lossy().to_string()
    }

    fn cmd(&self) -> Command {
        let mut cmd = Command::cargo_bin("mapvault").expect("failed to find binary");
        cmd.env("NO_COLOR", "1");
        cmd
    }

    fn admin(&self, subcommand: &str) -> assert_cmd::assert::Assert {
        self.cmd()
            .args(["admin", subcommand, "--data-dir", &self.data_dir_str()])
            .assert()
    }
}

#[test]
fn test_init_creates_database_and_secret() {
    let ctx = TestContext::new();

    ctx.admin("init")
        .success()
        .stdout(predicate::str::contains("Presign secret written to"));

    assert!(ctx.data_dir().join("mapvault.db").exists());
    assert!(ctx.data_dir().join("objects").is_dir());

    let secret = std::fs::read_to_string(ctx.data_dir().join(".presign_secret")).unwrap();
    assert_eq!(secret.len(), 64);
    assert!(secret.chars().all(|c| c.is_ascii_hexdigit()));
}

#[test]
fn test_init_twice_fails() {
    let ctx = TestContext::new();
    ctx.admin("init").success();

    ctx.admin("init")
        .failure()
        .stderr(predicate::str::contains("already initialized"));
}

#[test]
fn test_rebuild_closure_requires_init() {
    let ctx = TestContext::new();
    ctx.admin("rebuild-closure")
        .failure()
        .stderr(predicate::str::contains("not initialized"));
}

#[test]
fn test_rebuild_closure_counts_edges() {
    let ctx = TestContext::new();
    ctx.admin("init").success();

    {
        let store = SqliteStore::new(ctx.data_dir().join("mapvault.db")).unwrap();
        let now = Utc::now();
        let folder = |id: &str, parent: Option<&str>| Node {
            id: id.to_string(),
            name: id.to_string(),
            parent_id: parent.map(str::to_string),
            kind: NodeKind::Folder,
            owner_id: "alice".to_string(),
            created_at: now,
            updated_at: now,
        };
        store.create_node(&folder("root", None)).unwrap();
        store.create_node(&folder("child", Some("root"))).unwrap();
    }

    // root: (root,root,0); child: (child,child,0), (root,child,1)
    ctx.admin("rebuild-closure")
        .success()
        .stdout(predicate::str::contains("3 edges"));
}

#[test]
fn test_serve_requires_init() {
    let ctx = TestContext::new();
    ctx.cmd()
        .args(["serve", "--data-dir", &ctx.data_dir_str(), "--port", "0"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not initialized"));
}
