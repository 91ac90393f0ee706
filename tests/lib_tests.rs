use chunkdrive::engine::{format_name, hash_bytes, hash_file, padding, parse_index, scan_chunks};
use chunkdrive::utils::config::resolve_path;
use std::path::PathBuf;
use tempfile::tempdir;

// --- padding ---

#[test]
fn test_padding_minimum_three_digits() {
    assert_eq!(padding(1), 3);
    assert_eq!(padding(10), 3);
    assert_eq!(padding(999), 3);
    assert_eq!(padding(1000), 3);
}

#[test]
fn test_padding_grows_with_total() {
    assert_eq!(padding(1001), 4);
    assert_eq!(padding(10000), 4);
    assert_eq!(padding(10001), 5);
    assert_eq!(padding(100_000), 5);
}

// --- format_name / parse_index ---

#[test]
fn test_format_name_pads_index() {
    assert_eq!(
        format_name("d1", 7, "0123456789abcdef", 3),
        "d1.007.0123456789abcdef.img"
    );
    assert_eq!(
        format_name("d1", 42, "0123456789abcdef", 5),
        "d1.00042.0123456789abcdef.img"
    );
}

#[test]
fn test_format_name_wide_index_not_truncated() {
    assert_eq!(
        format_name("d1", 12345, "0123456789abcdef", 3),
        "d1.12345.0123456789abcdef.img"
    );
}

#[test]
fn test_parse_index_round_trip() {
    let name = format_name("drive", 19, "aabbccddeeff0011", 4);
    assert_eq!(parse_index("drive", &name), Some(19));
}

#[test]
fn test_parse_index_rejects_foreign_files() {
    assert_eq!(parse_index("d1", "other.007.aabbccddeeff0011.img"), None);
    assert_eq!(parse_index("d1", "d1.007.aabbccddeeff0011.tmp"), None);
    assert_eq!(parse_index("d1", "d1.notanumber.aabb.img"), None);
    assert_eq!(parse_index("d1", "d1.db"), None);
}

// --- hashing ---

#[test]
fn test_hash_empty_input_vector() {
    // xxh64 of the empty input, seed 0
    assert_eq!(hash_bytes(b""), "ef46db3751d8e999");
}

#[test]
fn test_hash_file_matches_hash_bytes() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("blob");
    let data = b"chunkdrive hashing test payload";
    std::fs::write(&path, data).unwrap();
    assert_eq!(hash_file(&path).unwrap(), hash_bytes(data));
}

#[test]
fn test_hash_file_empty() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("empty");
    std::fs::write(&path, b"").unwrap();
    assert_eq!(hash_file(&path).unwrap(), "ef46db3751d8e999");
}

#[test]
fn test_hash_spans_window_boundary() {
    // Larger than the 4 MiB streaming window, so the digest covers more
    // than one read.
    let dir = tempdir().unwrap();
    let path = dir.path().join("big");
    let data: Vec<u8> = (0..5 * 1024 * 1024u32).map(|i| (i % 251) as u8).collect();
    std::fs::write(&path, &data).unwrap();
    assert_eq!(hash_file(&path).unwrap(), hash_bytes(&data));
}

#[test]
fn test_hash_shape() {
    let h = hash_bytes(b"anything");
    assert_eq!(h.len(), 16);
    assert!(h.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
}

#[test]
fn test_hash_distinguishes_content() {
    assert_ne!(hash_bytes(b"a"), hash_bytes(b"b"));
}

// --- scan_chunks ---

#[test]
fn test_scan_chunks_maps_indices() {
    let dir = tempdir().unwrap();
    for name in [
        "d1.000.aaaaaaaaaaaaaaaa.img",
        "d1.001.bbbbbbbbbbbbbbbb.img",
        "d1.xyz.img",                   // unparseable index: skipped
        "other.000.cccccccccccccccc.img", // different drive: skipped
        "d1.002.dddddddddddddddd.tmp",  // not a chunk: skipped
        "d1.db",
    ] {
        std::fs::write(dir.path().join(name), b"").unwrap();
    }

    let map = scan_chunks(dir.path(), "d1").unwrap();
    assert_eq!(map.len(), 2);
    assert_eq!(map.get(&0).map(String::as_str), Some("d1.000.aaaaaaaaaaaaaaaa.img"));
    assert_eq!(map.get(&1).map(String::as_str), Some("d1.001.bbbbbbbbbbbbbbbb.img"));
}

// --- resolve_path ---

#[test]
fn test_resolve_path_absolute_passthrough() {
    assert_eq!(
        resolve_path("/var/lib/chunks").unwrap(),
        PathBuf::from("/var/lib/chunks")
    );
}

#[test]
fn test_resolve_path_rejects_relative() {
    assert!(resolve_path("relative/path").is_err());
    assert!(resolve_path("./also-relative").is_err());
}

#[test]
fn test_resolve_path_expands_tilde() {
    // Only meaningful when not running under sudo (the tilde then resolves
    // against SUDO_USER's passwd entry instead of $HOME).
    if std::env::var("SUDO_USER").is_ok() {
        return;
    }
    let Ok(home) = std::env::var("HOME") else {
        return;
    };
    assert_eq!(
        resolve_path("~/drives").unwrap(),
        PathBuf::from(home).join("drives")
    );
}
