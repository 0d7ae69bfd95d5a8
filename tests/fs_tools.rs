//! Filesystem tool tests: allow-list enforcement and the basic operations.

use gale::error::GaleError;
use gale::fs::{FsTools, WriteMode};

fn tools(dir: &tempfile::TempDir) -> FsTools {
    FsTools::new(vec![dir.path().to_path_buf()])
}

fn path_str(dir: &tempfile::TempDir, name: &str) -> String {
    dir.path().join(name).display().to_string()
}

// ---------------------------------------------------------------------------
// Allow-list enforcement
// ---------------------------------------------------------------------------

#[tokio::test]
async fn access_outside_allowed_dirs_is_denied() {
    let dir = tempfile::tempdir().unwrap();
    let tools = tools(&dir);
    assert!(matches!(
        tools.read_file("/etc/hostname", None, None).await,
        Err(GaleError::PermissionDenied(_))
    ));
    assert!(matches!(
        tools.write_file("/etc/gale-test", "x", WriteMode::Overwrite).await,
        Err(GaleError::PermissionDenied(_))
    ));
}

#[tokio::test]
async fn symlink_escape_is_denied() {
    let dir = tempfile::tempdir().unwrap();
    let outside = tempfile::tempdir().unwrap();
    let secret = outside.path().join("secret.txt");
    tokio::fs::write(&secret, "hidden").await.unwrap();

    let link = dir.path().join("link.txt");
    tokio::fs::symlink(&secret, &link).await.unwrap();

    let tools = tools(&dir);
    assert!(matches!(
        tools.read_file(&link.display().to_string(), None, None).await,
        Err(GaleError::PermissionDenied(_))
    ));
}

#[tokio::test]
async fn empty_allow_list_denies_everything() {
    let tools = FsTools::new(Vec::new());
    assert!(matches!(
        tools.read_file("/tmp/anything", None, None).await,
        Err(GaleError::PermissionDenied(_))
    ));
}

// ---------------------------------------------------------------------------
// Read and write
// ---------------------------------------------------------------------------

#[tokio::test]
async fn write_then_read_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let tools = tools(&dir);
    let path = path_str(&dir, "note.txt");

    tools
        .write_file(&path, "first\nsecond", WriteMode::Overwrite)
        .await
        .unwrap();
    let content = tools.read_file(&path, None, None).await.unwrap();
    assert_eq!(content, "first\nsecond");
}

#[tokio::test]
async fn append_mode_extends_the_file() {
    let dir = tempfile::tempdir().unwrap();
    let tools = tools(&dir);
    let path = path_str(&dir, "log.txt");

    tools.write_file(&path, "a\n", WriteMode::Overwrite).await.unwrap();
    tools.write_file(&path, "b\n", WriteMode::Append).await.unwrap();
    let content = tools.read_file(&path, None, None).await.unwrap();
    assert_eq!(content, "a\nb");
}

#[tokio::test]
async fn head_and_tail_bound_the_read() {
    let dir = tempfile::tempdir().unwrap();
    let tools = tools(&dir);
    let path = path_str(&dir, "lines.txt");
    tools
        .write_file(&path, "1\n2\n3\n4\n5", WriteMode::Overwrite)
        .await
        .unwrap();

    assert_eq!(tools.read_file(&path, Some(2), None).await.unwrap(), "1\n2");
    assert_eq!(tools.read_file(&path, None, Some(2)).await.unwrap(), "4\n5");
    assert!(matches!(
        tools.read_file(&path, Some(1), Some(1)).await,
        Err(GaleError::InvalidArgument(_))
    ));
}

// ---------------------------------------------------------------------------
// Directory operations
// ---------------------------------------------------------------------------

#[tokio::test]
async fn list_directory_is_sorted() {
    let dir = tempfile::tempdir().unwrap();
    let tools = tools(&dir);
    tokio::fs::write(dir.path().join("b.txt"), "b").await.unwrap();
    tokio::fs::write(dir.path().join("a.txt"), "a").await.unwrap();
    tokio::fs::create_dir(dir.path().join("sub")).await.unwrap();

    let entries = tools
        .list_directory(&dir.path().display().to_string())
        .await
        .unwrap();
    let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, ["a.txt", "b.txt", "sub"]);
    assert_eq!(entries[2].kind, "dir");
}

#[tokio::test]
async fn create_move_delete() {
    let dir = tempfile::tempdir().unwrap();
    let tools = tools(&dir);

    tools.create_directory(&path_str(&dir, "nested")).await.unwrap();
    let src = path_str(&dir, "nested/file.txt");
    tools.write_file(&src, "payload", WriteMode::Overwrite).await.unwrap();

    let dst = path_str(&dir, "moved.txt");
    tools.move_file(&src, &dst).await.unwrap();
    assert_eq!(tools.read_file(&dst, None, None).await.unwrap(), "payload");

    tools.delete_file(&dst, false).await.unwrap();
    assert!(tools.read_file(&dst, None, None).await.is_err());
}

#[tokio::test]
async fn deleting_a_directory_requires_recursive() {
    let dir = tempfile::tempdir().unwrap();
    let tools = tools(&dir);
    let sub = path_str(&dir, "sub");
    tools.create_directory(&sub).await.unwrap();
    tools
        .write_file(&path_str(&dir, "sub/x.txt"), "x", WriteMode::Overwrite)
        .await
        .unwrap();

    assert!(matches!(
        tools.delete_file(&sub, false).await,
        Err(GaleError::InvalidArgument(_))
    ));
    tools.delete_file(&sub, true).await.unwrap();
    assert!(!dir.path().join("sub").exists());
}

// ---------------------------------------------------------------------------
// Search and info
// ---------------------------------------------------------------------------

#[tokio::test]
async fn search_is_recursive_case_insensitive_and_skips_hidden() {
    let dir = tempfile::tempdir().unwrap();
    let tools = tools(&dir);
    tools.create_directory(&path_str(&dir, "a/b")).await.unwrap();
    tokio::fs::write(dir.path().join("a/b/Report.md"), "").await.unwrap();
    tokio::fs::write(dir.path().join("report.txt"), "").await.unwrap();
    tokio::fs::write(dir.path().join(".report.hidden"), "").await.unwrap();
    tokio::fs::write(dir.path().join("other.txt"), "").await.unwrap();

    let matches = tools
        .search_files(&dir.path().display().to_string(), "report")
        .await
        .unwrap();
    let names: Vec<String> = matches
        .iter()
        .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
        .collect();
    assert_eq!(matches.len(), 2);
    assert!(names.contains(&"Report.md".to_string()));
    assert!(names.contains(&"report.txt".to_string()));
}

#[tokio::test]
async fn file_info_reports_kind_and_size() {
    let dir = tempfile::tempdir().unwrap();
    let tools = tools(&dir);
    let path = path_str(&dir, "info.txt");
    tools.write_file(&path, "12345", WriteMode::Overwrite).await.unwrap();

    let info = tools.get_file_info(&path).await.unwrap();
    assert_eq!(info.kind, "file");
    assert_eq!(info.size_bytes, 5);
    assert!(info.modified.is_some());
    assert_eq!(info.permissions.len(), 3);
}
