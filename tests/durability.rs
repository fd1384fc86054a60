//! Durability of committed state across close/reopen cycles, and the
//! flush path as a durability point without close.

use eyre::Result;
use tempfile::tempdir;

use hammock::{Config, Database, Error};

fn config_1k() -> Config {
    Config {
        page_size: 1024,
        key_size: 16,
        ..Config::default()
    }
}

#[test]
fn all_record_classes_survive_reopen() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("classes.hdb");

    let cases: Vec<(&[u8], Vec<u8>)> = vec![
        (b"empty", vec![]),
        (b"tiny", b"abc".to_vec()),
        (b"small", b"12345678".to_vec()),
        (b"blob", vec![0xEE; 3000]),
    ];

    let mut db = Database::create(&path, &config_1k())?;
    for (key, value) in &cases {
        db.insert(key, value, 0)?;
    }
    db.close()?;

    let mut db = Database::open(&path, &Config::default())?;
    for (key, value) in &cases {
        assert_eq!(db.find(key)?.data(), &value[..]);
    }
    db.close()
}

#[test]
fn erase_is_durable() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("erase.hdb");

    let mut db = Database::create(&path, &config_1k())?;
    db.insert(b"keep", b"1", 0)?;
    db.insert(b"drop", b"2", 0)?;
    db.erase(b"drop")?;
    db.close()?;

    let mut db = Database::open(&path, &Config::default())?;
    assert_eq!(db.find(b"keep")?.data(), b"1");
    let err = db.find(b"drop").unwrap_err();
    assert_eq!(Error::kind_of(&err), Some(Error::KeyNotFound));
    db.close()
}

#[test]
fn freelist_contents_survive_reopen() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("freelist.hdb");

    let mut db = Database::create(&path, &config_1k())?;
    // A blob record occupies whole pages; erasing frees them.
    db.insert(b"big", &vec![1u8; 3000], 0)?;
    db.erase(b"big")?;
    db.close()?;

    let mut db = Database::open(&path, &Config::default())?;
    let size_before = std::fs::metadata(&path)?.len();

    // The reopened freelist serves the next allocation without growing
    // the file.
    db.insert(b"big2", &vec![2u8; 3000], 0)?;
    assert!(db.metrics().freelist_hits > 0);
    db.flush()?;
    assert_eq!(std::fs::metadata(&path)?.len(), size_before);
    db.close()
}

#[test]
fn flush_makes_state_durable_without_close() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("flush.hdb");

    let db_path = path.clone();
    let mut db = Database::create(&db_path, &config_1k())?;
    for i in 0..100u32 {
        db.insert(format!("w{:03}", i).as_bytes(), &i.to_le_bytes(), 0)?;
    }
    db.flush()?;
    // Simulate a crash: the handle is abandoned without close.
    std::mem::forget(db);

    let mut db = Database::open(&path, &Config::default())?;
    for i in 0..100u32 {
        assert_eq!(db.find(format!("w{:03}", i).as_bytes())?.data(), &i.to_le_bytes());
    }
    db.check_integrity()?;
    db.close()
}

#[test]
fn repeated_open_close_cycles_are_stable() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("cycles.hdb");

    let mut db = Database::create(&path, &config_1k())?;
    db.insert(b"seed", b"0", 0)?;
    db.close()?;

    for round in 1..=5u32 {
        let mut db = Database::open(&path, &Config::default())?;
        db.insert(format!("round{}", round).as_bytes(), &round.to_le_bytes(), 0)?;
        db.check_integrity()?;
        db.close()?;
    }

    let mut db = Database::open(&path, &Config::default())?;
    assert_eq!(db.find(b"seed")?.data(), b"0");
    for round in 1..=5u32 {
        assert_eq!(
            db.find(format!("round{}", round).as_bytes())?.data(),
            &round.to_le_bytes()
        );
    }
    db.close()
}

#[test]
fn extended_keys_survive_reopen() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("extkeys.hdb");

    let long_key = format!("durable-{}", "k".repeat(120));
    let mut db = Database::create(&path, &config_1k())?;
    db.insert(long_key.as_bytes(), b"long-lived", 0)?;
    db.close()?;

    let mut db = Database::open(&path, &Config::default())?;
    assert_eq!(db.find(long_key.as_bytes())?.data(), b"long-lived");
    db.check_integrity()?;
    db.close()
}
