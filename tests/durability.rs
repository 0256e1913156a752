//! End-to-end durability and recovery tests for the public API: large
//! shuffled workloads surviving reopen, master-page validation on open,
//! and the documented failure modes for corrupted files.

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};

use rand::seq::SliceRandom;
use rand::SeedableRng;

use cowkv::Database;

#[test]
fn ten_thousand_shuffled_keys_survive_deletion_and_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bulk.db");

    let mut order: Vec<u32> = (0..10_000).collect();
    let mut rng = rand::rngs::StdRng::seed_from_u64(42);
    order.shuffle(&mut rng);

    {
        let mut db = Database::open(&path).unwrap();
        for &i in &order {
            let key = format!("k{i:05}");
            let value = format!("v{i:05}");
            db.set(key.as_bytes(), value.as_bytes()).unwrap();
        }

        for i in 0..10_000u32 {
            let key = format!("k{i:05}");
            assert_eq!(
                db.get(key.as_bytes()),
                Some(format!("v{i:05}").into_bytes()),
                "missing {key} before reopen"
            );
        }

        for i in (0..10_000u32).step_by(2) {
            let key = format!("k{i:05}");
            assert!(db.del(key.as_bytes()).unwrap(), "del {key} found nothing");
        }
        db.close();
    }

    let db = Database::open(&path).unwrap();
    for i in 0..10_000u32 {
        let key = format!("k{i:05}");
        let got = db.get(key.as_bytes());
        if i % 2 == 0 {
            assert_eq!(got, None, "{key} should stay deleted after reopen");
        } else {
            assert_eq!(
                got,
                Some(format!("v{i:05}").into_bytes()),
                "{key} lost across reopen"
            );
        }
    }
}

#[test]
fn acknowledged_writes_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ack.db");

    {
        let mut db = Database::open(&path).unwrap();
        db.set(b"kept", b"value").unwrap();
        db.set(b"doomed", b"value").unwrap();
        db.del(b"doomed").unwrap();
        db.close();
    }
    {
        let mut db = Database::open(&path).unwrap();
        assert_eq!(db.get(b"kept"), Some(b"value".to_vec()));
        assert_eq!(db.get(b"doomed"), None);
        db.set(b"kept", b"updated").unwrap();
        db.close();
    }

    let db = Database::open(&path).unwrap();
    assert_eq!(db.get(b"kept"), Some(b"updated".to_vec()));
}

#[test]
fn corrupted_signature_is_rejected_on_open() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("corrupt.db");

    {
        let mut db = Database::open(&path).unwrap();
        db.set(b"k", b"v").unwrap();
        db.close();
    }

    let mut file = OpenOptions::new().write(true).open(&path).unwrap();
    file.write_all(b"deadbeefdeadbeef").unwrap();
    file.sync_all().unwrap();
    drop(file);

    let err = Database::open(&path).unwrap_err();
    assert!(
        err.to_string().contains("bad database signature")
            || format!("{err:?}").contains("bad database signature"),
        "unexpected error: {err:?}"
    );
}

#[test]
fn corrupted_master_counts_are_rejected_on_open() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("badmaster.db");

    {
        let mut db = Database::open(&path).unwrap();
        db.set(b"k", b"v").unwrap();
        db.close();
    }

    // Point `used` far beyond the file's page count.
    let mut file = OpenOptions::new().read(true).write(true).open(&path).unwrap();
    file.seek(SeekFrom::Start(24)).unwrap();
    file.write_all(&u64::MAX.to_le_bytes()).unwrap();
    file.sync_all().unwrap();
    drop(file);

    let err = Database::open(&path).unwrap_err();
    assert!(
        format!("{err:?}").contains("bad master page"),
        "unexpected error: {err:?}"
    );
}

#[test]
fn truncated_file_is_rejected_on_open() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ragged.db");

    {
        let mut db = Database::open(&path).unwrap();
        db.set(b"k", b"v").unwrap();
        db.close();
    }

    let file = OpenOptions::new().write(true).open(&path).unwrap();
    let ragged = file.metadata().unwrap().len() - 100;
    file.set_len(ragged).unwrap();
    drop(file);

    let err = Database::open(&path).unwrap_err();
    assert!(
        format!("{err:?}").contains("not a multiple of page size"),
        "unexpected error: {err:?}"
    );
}

#[test]
fn master_page_keeps_previous_state_readable_after_reopen() {
    // Reopening between every operation exercises the master page as the
    // single source of truth: whatever was acknowledged must be found by a
    // cold start, and nothing else.
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("coldstart.db");

    for round in 0..20u32 {
        {
            let mut db = Database::open(&path).unwrap();
            let key = format!("round{round:02}");
            db.set(key.as_bytes(), format!("value{round}").as_bytes())
                .unwrap();
            if round >= 10 {
                let victim = format!("round{:02}", round - 10);
                assert!(db.del(victim.as_bytes()).unwrap());
            }
            db.close();
        }

        let db = Database::open(&path).unwrap();
        let key = format!("round{round:02}");
        assert_eq!(
            db.get(key.as_bytes()),
            Some(format!("value{round}").into_bytes())
        );
    }
}

#[test]
fn reopened_file_starts_with_the_signature() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sig.db");

    {
        let mut db = Database::open(&path).unwrap();
        db.set(b"k", b"v").unwrap();
        db.close();
    }

    let mut file = OpenOptions::new().read(true).open(&path).unwrap();
    let mut signature = [0u8; 16];
    file.read_exact(&mut signature).unwrap();
    assert_eq!(&signature, b"1616161616161616");
}
