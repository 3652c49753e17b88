use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn qhub(root: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("qhub").expect("binary");
    cmd.current_dir(root.path()).arg("--root").arg(root.path().join("storage"));
    cmd
}

#[test]
fn init_creates_the_repositories() {
    let root = TempDir::new().expect("tempdir");
    qhub(&root).arg("init").assert().success().stdout(predicate::str::contains("Storage ready"));

    for repository in ["persistent", "temporary", "default", "private"] {
        assert!(root.path().join("storage").join(repository).is_dir(), "{repository} missing");
    }
}

#[test]
fn persist_then_clear_origin() {
    let root = TempDir::new().expect("tempdir");
    qhub(&root).args(["persist", "https://a.com"]).assert().success().stdout(predicate::str::contains("Persisted"));
    qhub(&root).args(["clear", "--origin", "https://a.com"]).assert().success().stdout(predicate::str::contains("Removed"));
    qhub(&root).args(["clear", "--private"]).assert().success().stdout(predicate::str::contains("Nothing to remove"));
}

#[test]
fn invalid_origin_fails() {
    let root = TempDir::new().expect("tempdir");
    qhub(&root).args(["estimate", "https://a.com/path"]).assert().failure();
}

#[test]
fn clear_requires_a_target() {
    let root = TempDir::new().expect("tempdir");
    qhub(&root).arg("clear").assert().failure();
}
