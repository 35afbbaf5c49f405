/// Free-space allocation: bitmap bookkeeping, metadata page lifecycle and
/// file growth.
use gavran::{Database, DbOptions, GavranError};
use tempfile::TempDir;

fn options_with_size(minimum_size: u64) -> DbOptions {
    DbOptions {
        minimum_size,
        wal_size: 128 * 1024,
        ..Default::default()
    }
}

#[test]
fn test_allocate_then_free_restores_the_bitmap() {
    let dir = TempDir::new().unwrap();
    let db = Database::open(dir.path().join("db.gvrn"), options_with_size(128 * 1024)).unwrap();

    let mut tx = db.write_txn().unwrap();
    let before = tx.get_page(1).unwrap().data;

    let page_num = tx.allocate_page(1, 0).unwrap();
    assert!(tx.is_page_busy(page_num).unwrap());

    tx.free_page(page_num).unwrap();
    assert!(!tx.is_page_busy(page_num).unwrap());

    let after = tx.get_page(1).unwrap().data;
    assert_eq!(before, after, "allocate + free must leave the bitmap intact");
    tx.rollback().unwrap();
}

#[test]
fn test_allocations_do_not_overlap() {
    let dir = TempDir::new().unwrap();
    let db = Database::open(dir.path().join("db.gvrn"), options_with_size(128 * 1024)).unwrap();

    let mut tx = db.write_txn().unwrap();
    let mut seen = std::collections::HashSet::new();
    for _ in 0..8 {
        let page_num = tx.allocate_page(1, 0).unwrap();
        assert!(seen.insert(page_num), "page {} allocated twice", page_num);
        assert!(page_num >= 2, "the header and bitmap pages are never handed out");
    }
    tx.commit().unwrap();
}

#[test]
fn test_allocation_survives_commit_and_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("db.gvrn");
    let page_num = {
        let db = Database::open(&path, options_with_size(128 * 1024)).unwrap();
        let mut tx = db.write_txn().unwrap();
        let page_num = tx.allocate_page(1, 0).unwrap();
        tx.modify_page(page_num).unwrap()[..7].copy_from_slice(b"settled");
        tx.commit().unwrap();
        db.close().unwrap();
        page_num
    };
    let db = Database::open(&path, options_with_size(128 * 1024)).unwrap();
    let mut rtx = db.read_txn().unwrap();
    assert_eq!(&rtx.get_page(page_num).unwrap().data[..7], b"settled");
    assert!(rtx.is_page_busy(page_num).unwrap());
}

#[test]
fn test_free_page_zeroes_content_and_metadata() {
    let dir = TempDir::new().unwrap();
    let db = Database::open(dir.path().join("db.gvrn"), options_with_size(128 * 1024)).unwrap();

    let page_num = {
        let mut tx = db.write_txn().unwrap();
        let page_num = tx.allocate_page(1, 0).unwrap();
        tx.modify_page(page_num).unwrap().fill(0x5A);
        let mut record = tx.get_metadata(page_num).unwrap();
        record.set_overflow(1, 42);
        tx.set_metadata(page_num, &record).unwrap();
        tx.commit().unwrap();
        page_num
    };
    {
        let mut tx = db.write_txn().unwrap();
        tx.free_page(page_num).unwrap();
        tx.commit().unwrap();
    }
    let mut rtx = db.read_txn().unwrap();
    assert!(rtx.get_page(page_num).unwrap().data.iter().all(|&b| b == 0));
    // the record body is cleared; the envelope still carries the hash of the
    // zeroed page from the freeing commit
    let record = rtx.get_metadata(page_num).unwrap();
    assert_eq!(record.page_flags_raw(), 0);
    assert_eq!(record.overflow_size_of_value(), 0);
    assert!(!rtx.is_page_busy(page_num).unwrap());
}

#[test]
fn test_metadata_page_birth_and_reaping() {
    let dir = TempDir::new().unwrap();
    // 2 MiB = 256 pages, so group 1 (pages 128..255) is addressable
    let db = Database::open(dir.path().join("db.gvrn"), options_with_size(2 * 1024 * 1024)).unwrap();

    let mut tx = db.write_txn().unwrap();
    assert!(!tx.is_page_busy(128).unwrap(), "group 1 has no metadata page yet");

    let page_num = tx.allocate_page(1, 129).unwrap();
    assert!(page_num > 128, "an allocation never lands on a metadata page");
    assert!(
        tx.is_page_busy(128).unwrap(),
        "allocating in group 1 births its metadata page"
    );

    tx.free_page(page_num).unwrap();
    assert!(
        !tx.is_page_busy(128).unwrap(),
        "freeing the last page of the group reaps the metadata page"
    );
    tx.commit().unwrap();
}

#[test]
fn test_nearby_hint_is_honored() {
    let dir = TempDir::new().unwrap();
    let db = Database::open(dir.path().join("db.gvrn"), options_with_size(2 * 1024 * 1024)).unwrap();

    let mut tx = db.write_txn().unwrap();
    let near_start = tx.allocate_page(1, 0).unwrap();
    let near_hint = tx.allocate_page(1, 140).unwrap();
    assert!(near_start < 64);
    assert!(near_hint >= 129, "the hint moved the search into group 1");
    tx.rollback().unwrap();
}

#[test]
fn test_file_growth_preserves_content() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("db.gvrn");
    let db = Database::open(&path, options_with_size(128 * 1024)).unwrap();

    let mut allocated = Vec::new();
    let mut grew = false;
    // a 16 page file runs out quickly; keep allocating until it grows
    for round in 0..200u64 {
        let mut tx = db.write_txn().unwrap();
        let pages_before = tx.get_metadata(0).unwrap().file_header().number_of_pages;
        let page_num = tx.allocate_page(1, 0).unwrap();
        tx.modify_page(page_num).unwrap()[..8].copy_from_slice(&round.to_le_bytes());
        let pages_after = tx.get_metadata(0).unwrap().file_header().number_of_pages;
        tx.commit().unwrap();
        allocated.push((page_num, round));
        if pages_after > pages_before {
            grew = true;
            break;
        }
    }
    assert!(grew, "the file never grew");

    // everything allocated before the growth still reads back
    let mut rtx = db.read_txn().unwrap();
    for &(page_num, round) in &allocated {
        assert_eq!(
            &rtx.get_page(page_num).unwrap().data[..8],
            &round.to_le_bytes()
        );
    }
    rtx.close().unwrap();

    // and the grown region is allocatable
    let mut tx = db.write_txn().unwrap();
    let page_num = tx.allocate_page(1, 0).unwrap();
    tx.modify_page(page_num).unwrap()[0] = 0xFE;
    tx.commit().unwrap();

    let mut rtx = db.read_txn().unwrap();
    assert_eq!(rtx.get_page(page_num).unwrap().data[0], 0xFE);
}

#[test]
fn test_growth_respects_maximum_size() {
    let dir = TempDir::new().unwrap();
    let options = DbOptions {
        minimum_size: 128 * 1024,
        maximum_size: 256 * 1024,
        wal_size: 128 * 1024,
        ..Default::default()
    };
    let db = Database::open(dir.path().join("db.gvrn"), options).unwrap();

    let mut tx = db.write_txn().unwrap();
    let mut saw_out_of_space = false;
    for _ in 0..100 {
        match tx.allocate_page(1, 0) {
            Ok(_) => {}
            Err(GavranError::OutOfSpace { .. }) => {
                saw_out_of_space = true;
                break;
            }
            Err(other) => panic!("unexpected error: {}", other),
        }
    }
    assert!(saw_out_of_space, "growth must stop at maximum_size");
    tx.rollback().unwrap();
}

#[test]
fn test_multi_page_free_releases_the_whole_run() {
    let dir = TempDir::new().unwrap();
    let db = Database::open(dir.path().join("db.gvrn"), options_with_size(128 * 1024)).unwrap();

    let mut tx = db.write_txn().unwrap();
    let page_num = tx.allocate_page(4, 0).unwrap();
    for i in 0..4 {
        assert!(tx.is_page_busy(page_num + i).unwrap());
    }
    tx.free_page(page_num).unwrap();
    for i in 0..4 {
        assert!(!tx.is_page_busy(page_num + i).unwrap());
    }
    tx.rollback().unwrap();
}
