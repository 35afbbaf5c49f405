/// Crash recovery: replay both WAL files against the data file.
///
/// The file whose first valid record carries the lower transaction id is
/// replayed first, then the other. Replay stops at the first record that
/// fails validation or does not advance the transaction id; the stop position
/// becomes the file's append position so future writes overwrite the junk.
/// After a stop the remainder of the file is probed page by page: a valid
/// record with a *newer* id there means the log is corrupted in the middle,
/// while older ones are the expected residue of a reset.
///
/// Recovery completes by checking that the file header agrees with the last
/// replayed transaction, adopting the header's page count and re-reading
/// every replayed page through the normal validating read path.
use std::collections::HashMap;
use std::os::unix::fs::FileExt;

use tracing::debug;

use crate::db::{ensure_data_file_size, DbState};
use crate::error::{GavranError, Result};
use crate::storage::page::{PAGE_SIZE, PAGE_SIZE_U64};
use crate::storage::pagemap::PageMap;
use crate::tx::transaction::{raw_get_page, validate_page, ReadCtx, TxnMode};
use crate::wal::record::{apply_diff, validate_record, DecodedRecord, WAL_PAGE_FLAG_DIFF};

/// Replay whatever valid records the (already opened) WAL files hold, and
/// install the recovered state.
pub(crate) fn wal_open_and_recover(db: &mut DbState) -> Result<()> {
    let mut contents = [Vec::new(), Vec::new()];
    for (i, slot) in contents.iter_mut().enumerate() {
        let file = &db.wal.files[i];
        let mut data = vec![0u8; file.size as usize];
        file.file.read_exact_at(&mut data, 0)?;
        *slot = data;
    }

    // the file with the lower first transaction id replays first
    let first_ids = [
        validate_record(&contents[0]).map(|record| record.tx_id),
        validate_record(&contents[1]).map(|record| record.tx_id),
    ];
    let order: Vec<usize> = match (first_ids[0], first_ids[1]) {
        (None, None) => Vec::new(),
        (Some(_), None) => vec![0],
        (None, Some(_)) => vec![1],
        (Some(a), Some(b)) => {
            if a < b {
                vec![0, 1]
            } else {
                vec![1, 0]
            }
        }
    };

    let mut last_recovered = 0u64;
    let mut touched: HashMap<u64, u32> = HashMap::new();
    let mut replayed = 0usize;
    for &index in &order {
        let mut pos = 0usize;
        loop {
            let record = validate_record(&contents[index][pos..]);
            match record {
                Some(record) if record.tx_id > last_recovered => {
                    recover_tx(db, &record, &mut touched)?;
                    last_recovered = record.tx_id;
                    db.wal.files[index].last_tx_id = record.tx_id;
                    pos += record.page_aligned_tx_size as usize;
                    replayed += 1;
                }
                _ => {
                    db.wal.files[index].last_write_pos = pos as u64;
                    let baseline = if last_recovered != 0 {
                        last_recovered
                    } else {
                        header_last_tx_id(db)?
                    };
                    scan_tail(&contents[index], pos, baseline)?;
                    break;
                }
            }
        }
    }

    // appends continue in the file holding the newest valid record
    db.wal.current = order.last().copied().unwrap_or(0);
    if replayed > 0 {
        debug!(
            records = replayed,
            last_tx_id = last_recovered,
            "replayed write-ahead log records"
        );
    }
    complete_recovery(db, last_recovered, &touched)
}

/// Probe the rest of a file after replay stopped. Older valid records are
/// the normal post-reset residue; a newer one means valid data follows an
/// invalid record and the log cannot be trusted.
fn scan_tail(contents: &[u8], mut pos: usize, baseline: u64) -> Result<()> {
    while pos + PAGE_SIZE <= contents.len() {
        if let Some(record) = validate_record(&contents[pos..]) {
            if baseline > record.tx_id {
                break;
            }
            return Err(GavranError::CorruptedLog(format!(
                "valid transaction {} found after an invalid record at offset {} \
                 (recovered through {})",
                record.tx_id, pos, baseline
            )));
        }
        pos += PAGE_SIZE;
    }
    Ok(())
}

fn recover_tx(
    db: &mut DbState,
    record: &DecodedRecord,
    touched: &mut HashMap<u64, u32>,
) -> Result<()> {
    for (i, descriptor) in record.pages.iter().enumerate() {
        ensure_data_file_size(
            db,
            descriptor.page_num + descriptor.number_of_pages as u64,
        )?;

        let size = descriptor.number_of_pages as usize * PAGE_SIZE;
        let start = descriptor.offset as usize;
        let end = if i + 1 < record.pages.len() {
            record.pages[i + 1].offset as usize
        } else {
            record.tx_size as usize
        };
        if start > end || end > record.data.len() {
            return Err(GavranError::CorruptedLog(format!(
                "page descriptor {} of transaction {} points outside the record",
                i, record.tx_id
            )));
        }

        let mut buf = vec![0u8; size];
        if descriptor.flags & WAL_PAGE_FLAG_DIFF != 0 {
            // diffs apply on top of whatever the data file holds right now
            db.file
                .read_exact_at(&mut buf, descriptor.page_num * PAGE_SIZE_U64)?;
            apply_diff(&record.data[start..end], &mut buf)?;
        } else {
            if end - start != size {
                return Err(GavranError::CorruptedLog(format!(
                    "full image for page {} has {} bytes, expected {}",
                    descriptor.page_num,
                    end - start,
                    size
                )));
            }
            buf.copy_from_slice(&record.data[start..end]);
        }
        db.file
            .write_all_at(&buf, descriptor.page_num * PAGE_SIZE_U64)?;
        touched.insert(descriptor.page_num, descriptor.number_of_pages);
    }
    Ok(())
}

/// Read the header's last transaction id straight through the default view
/// (needed as the tail-scan baseline when nothing was replayed).
fn header_last_tx_id(db: &mut DbState) -> Result<u64> {
    let global = db.global.clone();
    let ctx = ReadCtx {
        own: None,
        chain: None,
        global: &global,
        mode: TxnMode::Read,
    };
    let mut working_set = PageMap::new();
    let (page0, _) = raw_get_page(db, &ctx, &mut working_set, 0, Some(1))?;
    let record = crate::storage::metadata::PageMetadata::from_bytes(&page0);
    Ok(record.file_header().last_tx_id)
}

fn complete_recovery(
    db: &mut DbState,
    last_recovered: u64,
    touched: &HashMap<u64, u32>,
) -> Result<()> {
    let global = db.global.clone();
    let ctx = ReadCtx {
        own: None,
        chain: None,
        global: &global,
        mode: TxnMode::Read,
    };
    let mut working_set = PageMap::new();
    let (page0, _) = raw_get_page(db, &ctx, &mut working_set, 0, Some(1))?;
    let record = crate::storage::metadata::PageMetadata::from_bytes(&page0);
    let header = record.file_header();

    let mut last_recovered = last_recovered;
    if last_recovered == 0 {
        // empty log: either a fresh database or nothing needed replay
        if header.last_tx_id != 0 {
            last_recovered = header.last_tx_id;
        }
        db.global.header.number_of_pages = db.global.file_size / PAGE_SIZE_U64;
    } else {
        use crate::storage::metadata::PageFlags;
        if record.page_flags_raw() != PageFlags::FileHeader as u8 {
            return Err(GavranError::CorruptedLog(
                "the first page is not a file header after replay".into(),
            ));
        }
        db.global.header = header;
    }

    if header.last_tx_id != last_recovered {
        return Err(GavranError::CorruptedLog(format!(
            "the file header records transaction {} but recovery ended at {}",
            header.last_tx_id, last_recovered
        )));
    }
    db.last_tx_id = header.last_tx_id;
    if header.number_of_pages > 0 {
        ensure_data_file_size(db, header.number_of_pages)?;
    }
    let global = db.global.clone();
    db.txn_mut(0).global = global;

    // catch in-flight corruption that slipped past the record hashes: read
    // every touched page back through the validating path
    for (&page_num, &number_of_pages) in touched {
        let global = db.global.clone();
        let ctx = ReadCtx {
            own: None,
            chain: None,
            global: &global,
            mode: TxnMode::Read,
        };
        let mut working_set = PageMap::new();
        let (data, _) = raw_get_page(db, &ctx, &mut working_set, page_num, Some(number_of_pages))?;
        if !db.options.encrypted {
            validate_page(db, &ctx, &mut working_set, page_num, &data)?;
        }
    }
    Ok(())
}
