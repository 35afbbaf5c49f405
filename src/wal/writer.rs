/// WAL append and the two-file rotation.
///
/// Records are laid out back to back starting at offset zero of the active
/// file. Appending grows the file geometrically when a record does not fit,
/// writes the whole aligned record with one positioned write and makes it
/// durable before the commit returns. Checkpointing resets the file whose
/// content is fully applied to the data file and, when the active file still
/// holds unapplied transactions, switches appends over to the other one.
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::db::DbState;
use crate::error::{GavranError, Result};
use crate::storage::page::{pages_for, PAGE_SIZE, PAGE_SIZE_U64};
use crate::tx::transaction::{resolve_previous_image, TxnMode, TxnState};
use crate::wal::record::{
    compress_payload, diff_page, seal_record, WalPageDescriptor, WalRecordHeader,
    WAL_HEADER_SIZE, WAL_PAGE_DESCRIPTOR_SIZE, WAL_PAGE_FLAG_DIFF, WAL_TXN_FLAG_COMPRESSED,
};

pub(crate) struct WalFileState {
    pub file: File,
    pub path: PathBuf,
    pub size: u64,
    pub last_write_pos: u64,
    pub last_tx_id: u64,
}

pub(crate) struct WalState {
    pub files: [WalFileState; 2],
    pub current: usize,
}

pub(crate) fn wal_file_path(db_path: &Path, code: char) -> PathBuf {
    let mut name = db_path.as_os_str().to_os_string();
    name.push(format!("-{}.wal", code));
    PathBuf::from(name)
}

/// Open (creating and sizing on first use) the pair of WAL files next to the
/// data file.
pub(crate) fn open_wal_files(db_path: &Path, wal_size: u64) -> Result<WalState> {
    let mut files = Vec::with_capacity(2);
    for code in ['a', 'b'] {
        let path = wal_file_path(db_path, code);
        let file = crate::storage::file::open_or_create(&path)?;
        let mut size = file.metadata()?.len();
        if size < wal_size {
            file.set_len(wal_size)?;
            size = wal_size;
        }
        files.push(WalFileState {
            file,
            path,
            size,
            last_write_pos: 0,
            last_tx_id: 0,
        });
    }
    let files: [WalFileState; 2] = match files.try_into() {
        Ok(files) => files,
        Err(_) => unreachable!("exactly two WAL files"),
    };
    Ok(WalState { files, current: 0 })
}

/// Serialize the transaction's modified pages into one page-aligned record:
/// header, page descriptors, then per-page payloads (diffs against each
/// page's pre-image when possible, full images under encryption), compressed
/// when that pays off, hashed over everything after the hash itself.
fn build_record(db: &DbState, st: &TxnState) -> Result<Vec<u8>> {
    let entries: Vec<(u64, u32, bool)> = st
        .modified
        .iter()
        .filter(|(_, entry)| entry.buf.is_some())
        .map(|(page_num, entry)| (page_num, entry.number_of_pages, entry.has_previous))
        .collect();

    let table_size = WAL_HEADER_SIZE + entries.len() * WAL_PAGE_DESCRIPTOR_SIZE;
    let payload_capacity: usize = entries
        .iter()
        .map(|&(_, pages, _)| pages as usize * PAGE_SIZE)
        .sum();
    let mut record = vec![0u8; table_size + payload_capacity];

    let mut descriptors = Vec::with_capacity(entries.len());
    let mut offset = table_size;
    for &(page_num, number_of_pages, has_previous) in &entries {
        let entry = st
            .modified
            .get(page_num)
            .and_then(|entry| entry.buf.as_deref())
            .ok_or_else(|| {
                GavranError::InvariantViolation(format!("page {} lost its buffer", page_num))
            })?;
        let size = number_of_pages as usize * PAGE_SIZE;
        let out = &mut record[offset..offset + size];
        let written = if db.options.encrypted {
            // a diff of ciphertext would leak plaintext structure
            out.copy_from_slice(entry);
            size
        } else {
            match resolve_previous_image(db, st, page_num, number_of_pages) {
                Some(previous) if has_previous => diff_page(&previous, entry, out),
                _ => {
                    out.copy_from_slice(entry);
                    size
                }
            }
        };
        descriptors.push(WalPageDescriptor {
            page_num,
            offset: offset as u64,
            number_of_pages,
            flags: if written == size {
                0
            } else {
                WAL_PAGE_FLAG_DIFF
            },
        });
        offset += written;
    }
    for (i, descriptor) in descriptors.iter().enumerate() {
        descriptor.encode_into(
            &mut record[WAL_HEADER_SIZE + i * WAL_PAGE_DESCRIPTOR_SIZE..],
        );
    }

    let mut flags = 0u32;
    let mut tx_size = offset;
    if !db.options.encrypted {
        let (compressed_end, compressed) = compress_payload(&mut record, tx_size);
        if compressed {
            flags |= WAL_TXN_FLAG_COMPRESSED;
            tx_size = compressed_end;
        }
    }

    let aligned = (pages_for(tx_size as u64) * PAGE_SIZE_U64) as usize;
    record.resize(aligned, 0);
    let mut header = WalRecordHeader {
        hash: [0u8; 32],
        tx_id: st.tx_id,
        page_aligned_tx_size: 0,
        tx_size: 0,
        number_of_modified_pages: entries.len() as u64,
        total_number_of_pages: st.global.header.number_of_pages,
        flags,
    };
    seal_record(&mut record, &mut header, tx_size);
    Ok(record)
}

/// Append the transaction's record to the active WAL file and make it
/// durable. Returns the exact bytes written, for the log-shipping callback.
pub(crate) fn wal_append(db: &mut DbState, st: &mut TxnState) -> Result<Vec<u8>> {
    let record = if st.mode == TxnMode::ApplyLog {
        st.shipped_wal_record.take().ok_or_else(|| {
            GavranError::InvariantViolation(
                "apply-log transaction committed without a shipped record".into(),
            )
        })?
    } else {
        build_record(db, st)?
    };

    let current = db.wal.current;
    let file = &mut db.wal.files[current];
    let required = record.len() as u64;
    if file.last_write_pos + required > file.size {
        let grow_by = (file.size / 10).next_power_of_two().max(required * 2);
        let new_size = file.size + grow_by;
        file.file.set_len(new_size)?;
        file.size = new_size;
    }
    file.file.write_all_at(&record, file.last_write_pos)?;
    file.file.sync_data()?;
    file.last_write_pos += required;
    file.last_tx_id = st.tx_id;
    Ok(record)
}

/// Checkpointing is allowed once the active file is more than half full and
/// everything in the other file is already applied through `tx_id`.
pub(crate) fn wal_will_checkpoint(db: &DbState, tx_id: u64) -> bool {
    let current = &db.wal.files[db.wal.current];
    let other = &db.wal.files[1 - db.wal.current];
    current.last_write_pos > db.options.wal_size / 2 && tx_id > other.last_tx_id
}

fn wal_reset_file(file: &mut WalFileState, wal_size: u64) -> Result<()> {
    // a zeroed first page stops recovery from replaying stale records
    let zero = vec![0u8; PAGE_SIZE];
    file.file.write_all_at(&zero, 0)?;
    file.file.sync_data()?;
    if file.size > wal_size {
        file.file.set_len(wal_size)?;
        file.size = wal_size;
    }
    file.last_write_pos = 0;
    Ok(())
}

/// The data file is durable through `tx_id`; reset what that makes obsolete.
pub(crate) fn wal_checkpoint(db: &mut DbState, tx_id: u64) -> Result<()> {
    let wal_size = db.options.wal_size;
    let other = 1 - db.wal.current;
    if db.wal.files[other].last_write_pos > 0 {
        wal_reset_file(&mut db.wal.files[other], wal_size)?;
    }
    if tx_id >= db.wal.files[db.wal.current].last_tx_id {
        debug!(tx_id, "checkpoint: resetting the active WAL file");
        wal_reset_file(&mut db.wal.files[db.wal.current], wal_size)?;
    } else {
        // the active log still holds unapplied transactions, rotate
        debug!(tx_id, "checkpoint: switching the active WAL file");
        db.wal.current = other;
    }
    Ok(())
}
