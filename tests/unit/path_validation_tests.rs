use agent_gateway::path_safety::{sanitize_file_name, validate_path};
use agent_gateway::AppError;

#[test]
fn accepts_nested_relative_path() {
    let dir = tempfile::tempdir().expect("tempdir");
    let resolved = validate_path(dir.path(), "out/report.txt").expect("valid");
    let root = dir.path().canonicalize().expect("canonical");
    assert_eq!(resolved, root.join("out").join("report.txt"));
}

#[test]
fn interior_parent_segments_are_normalized() {
    let dir = tempfile::tempdir().expect("tempdir");
    let resolved = validate_path(dir.path(), "a/../b.txt").expect("valid");
    let root = dir.path().canonicalize().expect("canonical");
    assert_eq!(resolved, root.join("b.txt"));
}

#[test]
fn rejects_escape_absolute_and_empty() {
    let dir = tempfile::tempdir().expect("tempdir");
    for bad in ["../secret", "a/../../secret", "/etc/passwd", "", "."] {
        let result = validate_path(dir.path(), bad);
        assert!(
            matches!(result, Err(AppError::PathViolation(_))),
            "{bad:?} should be rejected"
        );
    }
}

#[cfg(unix)]
#[test]
fn rejects_symlink_escape() {
    let outside = tempfile::tempdir().expect("outside");
    let root = tempfile::tempdir().expect("root");
    std::fs::write(outside.path().join("secret.txt"), "x").expect("write");
    std::os::unix::fs::symlink(outside.path(), root.path().join("link")).expect("symlink");

    let result = validate_path(root.path(), "link/secret.txt");
    assert!(matches!(result, Err(AppError::PathViolation(_))));
}

#[test]
fn sanitized_names_are_single_segments() {
    assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
    assert_eq!(sanitize_file_name("C:\\Users\\me\\photo.png"), "photo.png");
    assert_eq!(sanitize_file_name("my file (1).txt"), "my_file__1_.txt");
    assert_eq!(sanitize_file_name(".."), "upload.bin");
    assert_eq!(sanitize_file_name(""), "upload.bin");
    assert_eq!(sanitize_file_name(&"a".repeat(300)).len(), 128);
}
