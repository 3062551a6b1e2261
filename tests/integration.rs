//! CONCLAVE - Storage Integration Tests
//! End-to-end tests of the engine lifecycle:
//! open → put → get → remove → flush → compact → reopen.

use std::fs;
use std::io::{BufRead, BufReader, Seek, SeekFrom};

use conclave::config::Config;
use conclave::engine::codec;
use conclave::engine::directory::StorageDirectory;
use conclave::engine::sstable::SSTable;
use conclave::engine::LsmTree;
use conclave::types::{Lookup, Namespace, Record};

mod common {
    /// Config pointing to a temporary directory, without fsync.
    pub fn temp_config(dir: &std::path::Path) -> conclave::config::Config {
        conclave::config::Config::new(dir).with_sync_writes(false)
    }
}

#[test]
fn test_basic_put_get_remove() {
    let dir = tempfile::tempdir().unwrap();
    let engine = LsmTree::open(common::temp_config(dir.path()), "users").unwrap();

    engine.put("name", "conclave").unwrap();
    engine.put("version", "0.1.0").unwrap();

    assert_eq!(engine.get("name").unwrap(), Some("conclave".to_string()));
    assert_eq!(engine.get("version").unwrap(), Some("0.1.0".to_string()));
    assert_eq!(engine.get("missing").unwrap(), None);

    engine.remove("name").unwrap();
    assert_eq!(engine.get("name").unwrap(), None);
    assert!(!engine.contains_key("name").unwrap());
    assert!(engine.contains_key("version").unwrap());
}

#[test]
fn test_reopen_replays_wal() {
    let dir = tempfile::tempdir().unwrap();
    {
        let engine = LsmTree::open(common::temp_config(dir.path()), "users").unwrap();
        engine.put("a", "1").unwrap();
        engine.put("b", "2").unwrap();
        engine.remove("a").unwrap();
    }
    let engine = LsmTree::open(common::temp_config(dir.path()), "users").unwrap();
    assert_eq!(engine.get("a").unwrap(), None);
    assert_eq!(engine.get("b").unwrap(), Some("2".to_string()));
    assert!(engine.metrics().report().contains("wal records replayed=3"));
}

#[test]
fn test_tombstone_survives_flush_and_reopen() {
    let dir = tempfile::tempdir().unwrap();
    {
        let engine = LsmTree::open(common::temp_config(dir.path()), "users").unwrap();
        engine.put("k", "v").unwrap();
        assert_eq!(engine.flush().unwrap(), Some(1));
        engine.remove("k").unwrap();
        assert_eq!(engine.flush().unwrap(), Some(2));
        assert_eq!(engine.lookup("k").unwrap(), Lookup::Tombstone);
    }
    let engine = LsmTree::open(common::temp_config(dir.path()), "users").unwrap();
    assert_eq!(engine.generations(), vec![2, 1]);
    assert_eq!(engine.get("k").unwrap(), None);
    assert!(!engine.contains_key("k").unwrap());
}

#[test]
fn test_flush_discards_wal() {
    let dir = tempfile::tempdir().unwrap();
    let engine = LsmTree::open(common::temp_config(dir.path()), "users").unwrap();
    engine.put("k", "v").unwrap();
    assert!(dir.path().join("users").exists());

    engine.flush().unwrap();
    assert!(!dir.path().join("users").exists());
    assert!(dir.path().join("users.1").exists());
    assert_eq!(engine.memtable_len(), 0);
    assert_eq!(engine.get("k").unwrap(), Some("v".to_string()));
}

#[test]
fn test_newest_segment_wins_across_compaction() {
    let dir = tempfile::tempdir().unwrap();
    let engine = LsmTree::open(common::temp_config(dir.path()), "users").unwrap();

    for round in 0..4 {
        engine.put("shared", &format!("round-{round}")).unwrap();
        engine.put(&format!("only-{round}"), "x").unwrap();
        engine.flush().unwrap();
    }
    engine.remove("only-0").unwrap();
    engine.flush().unwrap();
    assert_eq!(engine.segment_count(), 5);

    let merges = engine.compact().unwrap();
    assert_eq!(merges, 4);
    assert_eq!(engine.segment_count(), 1);
    assert_eq!(engine.generations(), vec![5]);

    assert_eq!(engine.get("shared").unwrap(), Some("round-3".to_string()));
    assert_eq!(engine.get("only-0").unwrap(), None);
    for round in 1..4 {
        assert_eq!(engine.get(&format!("only-{round}")).unwrap(), Some("x".to_string()));
    }

    let files: Vec<String> = fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(files, vec!["users.5".to_string()]);
}

#[test]
fn test_compacted_segment_is_sorted_and_unique() {
    let dir = tempfile::tempdir().unwrap();
    let engine = LsmTree::open(common::temp_config(dir.path()), "users").unwrap();
    for key in ["delta", "alpha", "charlie"] {
        engine.put(key, "old").unwrap();
    }
    engine.flush().unwrap();
    for key in ["bravo", "charlie", "echo"] {
        engine.put(key, "new").unwrap();
    }
    engine.flush().unwrap();
    engine.compact().unwrap();

    let lines: Vec<(String, Record)> = BufReader::new(fs::File::open(dir.path().join("users.2")).unwrap())
        .split(b'\n')
        .map(|line| codec::decode_line(&line.unwrap()).unwrap())
        .collect();
    let keys: Vec<&str> = lines.iter().map(|(k, _)| k.as_str()).collect();
    assert_eq!(keys, vec!["alpha", "bravo", "charlie", "delta", "echo"]);
    assert_eq!(lines[2].1, Record::Value("new".to_string()));
    assert_eq!(lines[3].1, Record::Value("old".to_string()));
}

#[test]
fn test_index_is_deterministic_and_points_at_lines() {
    let dir = tempfile::tempdir().unwrap();
    let engine = LsmTree::open(common::temp_config(dir.path()).with_index_ratio(0.05), "users").unwrap();
    for i in 0..500 {
        engine.put(&format!("key_{i:05}"), &format!("value_{i}")).unwrap();
    }
    engine.flush().unwrap();

    let path = dir.path().join("users.1");
    let first = SSTable::open(&path, 1, 0.05).unwrap().index().unwrap();
    let second = SSTable::open(&path, 1, 0.05).unwrap().index().unwrap();
    assert_eq!(first, second);
    assert!(first.len() > 1);
    assert_eq!(first[0].offset, 0);

    let mut reader = BufReader::new(fs::File::open(&path).unwrap());
    for entry in first.iter() {
        reader.seek(SeekFrom::Start(entry.offset)).unwrap();
        let mut line = Vec::new();
        reader.read_until(b'\n', &mut line).unwrap();
        let (key, _) = codec::decode_line(&line).unwrap();
        assert_eq!(key, entry.key);
    }

    for i in (0..500).step_by(37) {
        assert_eq!(engine.get(&format!("key_{i:05}")).unwrap(), Some(format!("value_{i}")));
    }
    assert_eq!(engine.get("key_99999").unwrap(), None);
    assert_eq!(engine.get("a").unwrap(), None);
}

#[test]
fn test_empty_key_rejected_before_wal() {
    let dir = tempfile::tempdir().unwrap();
    let engine = LsmTree::open(common::temp_config(dir.path()), "users").unwrap();
    assert!(engine.put("", "v").is_err());
    assert!(!dir.path().join("users").exists());
}

#[test]
fn test_unicode_and_separator_characters() {
    let dir = tempfile::tempdir().unwrap();
    let engine = LsmTree::open(common::temp_config(dir.path()), "users").unwrap();
    engine.put("ключ:1", "значение\nс переводом").unwrap();
    engine.put("empty", "").unwrap();
    engine.flush().unwrap();
    assert_eq!(engine.get("ключ:1").unwrap(), Some("значение\nс переводом".to_string()));
    assert_eq!(engine.get("empty").unwrap(), Some(String::new()));
    assert!(engine.contains_key("empty").unwrap());
}

#[test]
fn test_namespaces_are_isolated() {
    let dir = tempfile::tempdir().unwrap();
    let storage = StorageDirectory::open(Config::new(dir.path()).with_sync_writes(false)).unwrap();
    let users = Namespace::parse("users").unwrap();
    let orders = Namespace::parse("orders").unwrap();
    let default = Namespace::parse("").unwrap();

    storage.set(&users, "k", "user").unwrap();
    storage.set(&default, "k", "default").unwrap();
    assert_eq!(storage.get(&users, "k").unwrap(), Some("user".to_string()));
    assert_eq!(storage.get(&default, "k").unwrap(), Some("default".to_string()));
    assert_eq!(storage.get(&orders, "k").unwrap(), None);
    assert!(!dir.path().join("orders").exists());
    assert!(dir.path().join(".default").exists());

    storage.close_all().unwrap();
    let storage = StorageDirectory::open(Config::new(dir.path()).with_sync_writes(false)).unwrap();
    assert_eq!(storage.get(&users, "k").unwrap(), Some("user".to_string()));
}
