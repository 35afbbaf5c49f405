/// Durability and crash recovery.
///
/// A crash is simulated by leaking the database handle (`std::mem::forget`)
/// so no destructor runs: the data file is left stale and the committed
/// transactions exist only in the WAL, exactly as after a `SIGKILL`.
use std::os::unix::fs::FileExt;

use gavran::{Database, DbOptions, GavranError, PAGE_SIZE};
use tempfile::TempDir;

fn small_options() -> DbOptions {
    DbOptions {
        minimum_size: 128 * 1024,
        wal_size: 128 * 1024,
        ..Default::default()
    }
}

#[test]
fn test_committed_data_survives_a_crash() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("db.gvrn");

    {
        let db = Database::open(&path, small_options()).unwrap();
        let mut tx = db.write_txn().unwrap();
        tx.modify_page(3).unwrap()[..13].copy_from_slice(b"Hello Gavran\0");
        tx.commit().unwrap();
        // crash: no cleanup, no flush of the data file
        std::mem::forget(db);
    }

    // the data file itself was never updated
    let raw = std::fs::read(&path).unwrap();
    assert!(raw[3 * PAGE_SIZE..3 * PAGE_SIZE + 13].iter().all(|&b| b == 0));

    let db = Database::open(&path, small_options()).unwrap();
    let mut rtx = db.read_txn().unwrap();
    assert_eq!(&rtx.get_page(3).unwrap().data[..13], b"Hello Gavran\0");
    let header = rtx.get_metadata(0).unwrap().file_header();
    assert_eq!(header.last_tx_id, 2, "init plus one committed transaction");
}

#[test]
fn test_recovery_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("db.gvrn");

    {
        let db = Database::open(&path, small_options()).unwrap();
        let mut tx = db.write_txn().unwrap();
        tx.modify_page(4).unwrap()[0] = 0x77;
        tx.commit().unwrap();
        std::mem::forget(db);
    }
    // recover twice; the second replay must be a no-op over the first
    for _ in 0..2 {
        let db = Database::open(&path, small_options()).unwrap();
        let mut rtx = db.read_txn().unwrap();
        assert_eq!(rtx.get_page(4).unwrap().data[0], 0x77);
        rtx.close().unwrap();
        db.close().unwrap();
    }
}

#[test]
fn test_torn_tail_record_is_discarded() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("db.gvrn");

    {
        let db = Database::open(&path, small_options()).unwrap();
        let mut tx = db.write_txn().unwrap();
        tx.modify_page(3).unwrap()[..4].copy_from_slice(b"torn");
        tx.commit().unwrap();
        std::mem::forget(db);
    }

    // the init transaction occupies the first record; the user transaction
    // starts one page in. Corrupt it, as a torn write would.
    let wal_a = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(format!("{}-a.wal", path.display()))
        .unwrap();
    let mut byte = [0u8; 1];
    wal_a.read_exact_at(&mut byte, (PAGE_SIZE + 200) as u64).unwrap();
    byte[0] ^= 0xFF;
    wal_a.write_all_at(&byte, (PAGE_SIZE + 200) as u64).unwrap();
    wal_a.sync_all().unwrap();
    drop(wal_a);

    // recovery keeps the init transaction and drops the torn one
    let db = Database::open(&path, small_options()).unwrap();
    let mut rtx = db.read_txn().unwrap();
    assert!(rtx.get_page(3).unwrap().data.iter().all(|&b| b == 0));
    let header = rtx.get_metadata(0).unwrap().file_header();
    assert_eq!(header.last_tx_id, 1, "only the init transaction survives");
}

#[test]
fn test_valid_record_after_corruption_is_detected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("db.gvrn");

    {
        let db = Database::open(&path, small_options()).unwrap();
        for value in [1u8, 2u8] {
            let mut tx = db.write_txn().unwrap();
            tx.modify_page(3).unwrap()[0] = value;
            tx.commit().unwrap();
        }
        std::mem::forget(db);
    }

    // records sit at page offsets 0 (init), 1 and 2. Corrupting the middle
    // one leaves a valid, newer record after an invalid one.
    let wal_a = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(format!("{}-a.wal", path.display()))
        .unwrap();
    let offset = (PAGE_SIZE + 4000) as u64; // padding is hashed too
    let mut byte = [0u8; 1];
    wal_a.read_exact_at(&mut byte, offset).unwrap();
    byte[0] ^= 0xFF;
    wal_a.write_all_at(&byte, offset).unwrap();
    wal_a.sync_all().unwrap();
    drop(wal_a);

    match Database::open(&path, small_options()) {
        Err(GavranError::CorruptedLog(_)) => {}
        Ok(_) => panic!("opening a database with a corrupted log must fail"),
        Err(other) => panic!("expected CorruptedLog, got {}", other),
    }
}

#[test]
fn test_crash_after_multiple_commits_recovers_the_newest_state() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("db.gvrn");

    {
        let db = Database::open(&path, small_options()).unwrap();
        for value in 1..=5u8 {
            let mut tx = db.write_txn().unwrap();
            tx.modify_page(2).unwrap()[0] = value;
            tx.modify_page(3).unwrap()[0] = value.wrapping_mul(3);
            tx.commit().unwrap();
        }
        std::mem::forget(db);
    }

    let db = Database::open(&path, small_options()).unwrap();
    let mut rtx = db.read_txn().unwrap();
    assert_eq!(rtx.get_page(2).unwrap().data[0], 5);
    assert_eq!(rtx.get_page(3).unwrap().data[0], 15);
}

#[test]
fn test_wal_rotation_under_an_old_reader() {
    use rand::RngCore;

    let dir = TempDir::new().unwrap();
    let path = dir.path().join("db.gvrn");
    let db = Database::open(&path, small_options()).unwrap();
    let wal_a = format!("{}-a.wal", path.display());
    let wal_b = format!("{}-b.wal", path.display());

    // incompressible content so every record occupies real WAL space
    let commit_batch = |db: &Database| {
        let mut payload = vec![0u8; PAGE_SIZE];
        let mut tx = db.write_txn().unwrap();
        for page_num in 3..8u64 {
            rand::thread_rng().fill_bytes(&mut payload);
            tx.modify_page(page_num).unwrap().copy_from_slice(&payload);
        }
        tx.commit().unwrap();
    };

    for _ in 0..4 {
        commit_batch(&db);
    }

    // an old reader pins every following state in memory: nothing may be
    // flushed, so no checkpoint can reclaim the log and file a must grow
    let mut old_reader = db.read_txn().unwrap();
    let pinned = old_reader.get_page(3).unwrap().data;
    for _ in 0..6 {
        commit_batch(&db);
    }
    assert!(
        std::fs::metadata(&wal_a).unwrap().len() > 128 * 1024,
        "with a reader open the active WAL can only grow"
    );
    assert_eq!(old_reader.get_page(3).unwrap().data, pinned);

    // a newer reader now pins the head; releasing the old one flushes the
    // states in between, and the checkpoint must switch to file b because
    // the tail of file a is still unapplied
    let new_reader = db.read_txn().unwrap();
    old_reader.close().unwrap();
    commit_batch(&db);
    let mut first_record = vec![0u8; 80];
    std::fs::OpenOptions::new()
        .read(true)
        .open(&wal_b)
        .unwrap()
        .read_exact_at(&mut first_record, 0)
        .unwrap();
    assert!(
        first_record[32..40].iter().any(|&b| b != 0),
        "appends switched to WAL file b"
    );
    new_reader.close().unwrap();

    // with no readers left, a few more rounds checkpoint file a back down
    let mut reclaimed = false;
    for _ in 0..8 {
        commit_batch(&db);
        if std::fs::metadata(&wal_a).unwrap().len() <= 128 * 1024 {
            reclaimed = true;
            break;
        }
    }
    {
        // one more interaction releases the final pending commit
        let tx = db.write_txn().unwrap();
        tx.rollback().unwrap();
    }
    assert!(
        reclaimed || std::fs::metadata(&wal_a).unwrap().len() <= 128 * 1024,
        "the first WAL file was reset back to its nominal size"
    );
    db.close().unwrap();
}
