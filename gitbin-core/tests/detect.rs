use chrono::{Duration, Utc};
use gitbin_core::detect::{self, build_excludes, classify, list_sources, Change, SourceFile};
use gitbin_core::fs::{MemFs, OsFs};
use gitbin_core::manifest::ManifestEntry;
use gitbin_core::store::{ManifestStore, MemoryStore};
use gitbin_core::Error;
use std::path::{Path, PathBuf};

fn source(name: &str) -> SourceFile {
    SourceFile { name: name.to_string(), path: PathBuf::from("/src").join(name) }
}

#[test]
fn classification_follows_mtime_against_last_backup() {
    let fs = MemFs::new();
    let mut store = MemoryStore::new();
    let backed_up = Utc::now() - Duration::hours(1);

    for name in ["same.txt", "newer.txt"] {
        store.put(ManifestEntry::new(name, backed_up)).unwrap();
    }
    fs.write_at("/src/same.txt", b"x".to_vec(), backed_up);
    fs.write_at("/src/newer.txt", b"x".to_vec(), backed_up + Duration::seconds(1));
    fs.write_at("/src/older.txt", b"x".to_vec(), backed_up - Duration::days(3));
    fs.write_at("/src/fresh.txt", b"x".to_vec(), backed_up);

    assert_eq!(classify(&store, &fs, &source("same.txt")).unwrap(), Change::Unchanged);
    assert_eq!(classify(&store, &fs, &source("newer.txt")).unwrap(), Change::Updated);
    // Never seen before wins over any timestamp.
    assert_eq!(classify(&store, &fs, &source("fresh.txt")).unwrap(), Change::New);

    let files = list_sources(&fs, Path::new("/src"), false, &build_excludes(&[]).unwrap(), &[])
        .unwrap();
    let set = detect::detect_changes(&store, &fs, files).unwrap();
    let names = |v: &[SourceFile]| v.iter().map(|f| f.name.clone()).collect::<Vec<_>>();
    assert_eq!(names(&set.added), vec!["fresh.txt", "older.txt"]);
    assert_eq!(names(&set.updated), vec!["newer.txt"]);
    assert_eq!(set.unchanged, 1);
    assert!(!set.is_empty());
}

#[test]
fn listing_honours_recursion_excludes_and_skip_dirs() {
    let fs = MemFs::new();
    fs.write("/src/a.txt", b"a".to_vec());
    fs.write("/src/notes.tmp", b"t".to_vec());
    fs.write("/src/sub/b.txt", b"b".to_vec());
    fs.write("/src/backup/conv-0/a.txt.zst", b"z".to_vec());

    let none = build_excludes(&[]).unwrap();
    let flat = list_sources(&fs, Path::new("/src"), false, &none, &[]).unwrap();
    assert_eq!(flat.iter().map(|f| f.name.as_str()).collect::<Vec<_>>(), ["a.txt", "notes.tmp"]);

    let excludes = build_excludes(&["*.tmp".to_string()]).unwrap();
    let deep = list_sources(
        &fs,
        Path::new("/src"),
        true,
        &excludes,
        &[Path::new("/src/backup")],
    )
    .unwrap();
    assert_eq!(deep.iter().map(|f| f.name.as_str()).collect::<Vec<_>>(), ["a.txt", "b.txt"]);
    assert_eq!(deep[1].path, PathBuf::from("/src/sub/b.txt"));
}

#[test]
fn duplicate_names_in_recursive_listing_are_rejected() {
    let fs = MemFs::new();
    fs.write("/src/one/data.bin", b"1".to_vec());
    fs.write("/src/two/data.bin", b"2".to_vec());
    let err = list_sources(&fs, Path::new("/src"), true, &build_excludes(&[]).unwrap(), &[])
        .unwrap_err();
    assert!(matches!(err.downcast_ref::<Error>(), Some(Error::Config(_))), "{err:#}");
}

#[test]
fn bad_exclude_pattern_is_config_error() {
    let err = build_excludes(&["a[".to_string()]).unwrap_err();
    assert!(matches!(err.downcast_ref::<Error>(), Some(Error::Config(_))));
}

#[test]
fn skip_dirs_match_whatever_their_spelling() {
    let td = tempfile::tempdir().unwrap();
    let src = td.path().join("src");
    std::fs::create_dir_all(src.join("sub")).unwrap();
    std::fs::create_dir_all(src.join("backup/conv-0")).unwrap();
    std::fs::write(src.join("a.txt"), b"a").unwrap();
    std::fs::write(src.join("backup/conv-0/b.txt.zst"), b"z").unwrap();

    let none = build_excludes(&[]).unwrap();
    let spelled = src.join("sub").join("..").join(".").join("backup");
    let missing = td.path().join("nowhere");
    let files = list_sources(
        &OsFs,
        &td.path().join(".").join("src"),
        true,
        &none,
        &[&spelled, &missing],
    )
    .unwrap();
    assert_eq!(files.iter().map(|f| f.name.as_str()).collect::<Vec<_>>(), ["a.txt"]);
}

#[test]
fn skip_dirs_are_resolved_in_memory_too() {
    let fs = MemFs::new();
    fs.write("/src/a.txt", b"a".to_vec());
    fs.write("/src/backup/x.zst", b"x".to_vec());
    let files = list_sources(
        &fs,
        Path::new("/src"),
        true,
        &build_excludes(&[]).unwrap(),
        &[Path::new("/src/./other/../backup")],
    )
    .unwrap();
    assert_eq!(files.iter().map(|f| f.name.as_str()).collect::<Vec<_>>(), ["a.txt"]);
}
