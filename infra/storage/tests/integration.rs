use qhub_storage::*;
use tempfile::TempDir;

fn open(temp: &TempDir) -> Storage {
    Storage::builder().root(temp.path()).open().unwrap()
}

#[test]
fn test_path_traversal_blocked() {
    let temp = TempDir::new().unwrap();
    let storage = open(&temp);

    assert!(storage.resolve("../etc/passwd").is_err());
    assert!(storage.resolve("foo/../../bar").is_err());
    assert!(storage.remove_dir_all(".").is_err());
}

#[test]
fn test_write_read_roundtrip_compressed() {
    let temp = TempDir::new().unwrap();
    let storage =
        Storage::builder().root(temp.path()).compression(Compression::Lz4).open().unwrap();

    let payload = vec![1u8; 4096];
    storage.write("bin/data.dat", &payload).unwrap();

    assert_eq!(storage.read("bin/data.dat").unwrap(), payload);
}

#[test]
fn test_create_dir_reports_new_leaf() {
    let temp = TempDir::new().unwrap();
    let storage = open(&temp);

    assert!(storage.create_dir("persistent/https+++a.com/idb").unwrap());
    assert!(!storage.create_dir("persistent/https+++a.com/idb").unwrap());
    assert!(storage.is_dir("persistent/https+++a.com").unwrap());
}

#[test]
fn test_list_dirs_skips_files_and_missing_parents() {
    let temp = TempDir::new().unwrap();
    let storage = open(&temp);

    storage.create_dir("default/b").unwrap();
    storage.create_dir("default/a").unwrap();
    storage.write("default/.metadata", b"x").unwrap();

    assert_eq!(storage.list_dirs("default").unwrap(), vec!["a".to_owned(), "b".to_owned()]);
    assert!(storage.list_dirs("temporary").unwrap().is_empty());
}

#[test]
fn test_dir_size_counts_files_recursively() {
    let temp = TempDir::new().unwrap();
    let storage = open(&temp);

    storage.write("default/o/cache/one.bin", &[0u8; 100]).unwrap();
    storage.write("default/o/idb/two.bin", &[0u8; 50]).unwrap();
    std::fs::write(temp.path().join("default/o/idb/two.bin.qhubtmp.9"), [0u8; 999]).unwrap();

    assert_eq!(storage.dir_size("default/o").unwrap(), 150);
    assert_eq!(storage.dir_size("default/o/cache").unwrap(), 100);
    assert_eq!(storage.dir_size("default/missing").unwrap(), 0);
}

#[test]
fn test_remove_dir_all_is_idempotent() {
    let temp = TempDir::new().unwrap();
    let storage = open(&temp);

    storage.write("temporary/o/file", b"abc").unwrap();
    assert!(storage.remove_dir_all("temporary/o").unwrap());
    assert!(!storage.remove_dir_all("temporary/o").unwrap());
    assert!(!storage.exists("temporary/o").unwrap());
}

#[test]
fn test_delete_and_exists() {
    let temp = TempDir::new().unwrap();
    let storage = open(&temp);

    storage.write("tmp/file.txt", b"x").unwrap();
    assert!(storage.exists("tmp/file.txt").unwrap());

    storage.delete("tmp/file.txt").unwrap();
    assert!(!storage.exists("tmp/file.txt").unwrap());
    assert!(matches!(storage.delete("tmp/file.txt"), Err(StorageError::FileNotFound { .. })));
}

#[test]
fn test_read_missing_returns_file_not_found() {
    let temp = TempDir::new().unwrap();
    let storage = open(&temp);

    let err = storage.read("missing.bin").expect_err("expected error");
    match err {
        StorageError::FileNotFound { .. } => {},
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn test_open_without_create_requires_existing_root() {
    let temp = TempDir::new().unwrap();
    let missing = temp.path().join("nope");

    let err = Storage::builder().root(&missing).create(false).open().expect_err("missing root");
    assert!(matches!(err, StorageError::Io { .. }));
}
