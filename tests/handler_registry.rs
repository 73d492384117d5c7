//! Integration-style coverage for the handler registry's filesystem scan,
//! exercised against a real directory rather than an in-process fixture —
//! mirrors the teacher crate's own `tests/` directory, which drives its
//! ring setup against a real file descriptor instead of a mock.

use tcmu_rs::HandlerRegistry;

#[test]
fn load_all_skips_unloadable_files_without_failing_the_scan() {
    let dir = tempfile::tempdir().expect("tempdir");

    // Not a valid shared object; `dlopen` will reject it, and `load_all`
    // must log and skip rather than propagate that failure.
    std::fs::write(dir.path().join("handler_broken.so"), b"not an elf file")
        .expect("write fixture");
    // Doesn't match the `handler_*` prefix at all; must be ignored outright.
    std::fs::write(dir.path().join("readme.txt"), b"not a handler")
        .expect("write fixture");

    let mut registry = HandlerRegistry::new();
    let loaded = registry.load_all(dir.path()).expect("load_all");

    assert_eq!(loaded, 0);
    assert!(registry.find("anything").is_none());
}

#[test]
fn load_all_reports_io_error_for_a_missing_directory() {
    let mut registry = HandlerRegistry::new();
    let result = registry.load_all(std::path::Path::new("/nonexistent/handler/dir/for/tests"));
    assert!(result.is_err());
}
