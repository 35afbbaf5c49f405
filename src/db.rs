/// Database lifecycle: open/create, startup validation, file growth, close,
/// and the log-shipping receiver.
///
/// A handle is single-threaded cooperative: one write transaction at a time,
/// any number of snapshot readers, nothing blocks. Callers that want to serve
/// multiple threads wrap the handle in their own mutual exclusion.
use std::cell::RefCell;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use memmap2::Mmap;
use tracing::debug;

use crate::crypto::aead::EncryptionKey;
use crate::error::{GavranError, Result};
use crate::options::{DbOptions, EngineOptions, PageValidation, WalWriteCallback};
use crate::storage::bitmap::search_free_range;
use crate::storage::file::{map_file, open_or_create};
use crate::storage::metadata::{
    FileHeader, PageMetadata, FILE_FORMAT_VERSION, FILE_HEADER_MAGIC, METADATA_SIZE,
};
use crate::storage::page::{BITS_IN_PAGE, PAGE_SIZE_U64};
use crate::storage::pagemap::PageMap;
use crate::tx::transaction::{
    commit_internal, invoke_wal_callback, modify_metadata, raw_modify_page,
    release_pending_commit, rollback_state, txn_page_buf_mut, write_metadata, ReadTransaction,
    TxnMode, TxnState, WriteTransaction,
};
use crate::wal::record::{apply_diff, validate_record, WAL_PAGE_FLAG_DIFF};
use crate::wal::recovery::wal_open_and_recover;
use crate::wal::writer::{open_wal_files, WalState};

/// The (map, file size, header) snapshot a transaction reads through. Each
/// transaction state keeps its own clone, so remapping the file for growth
/// never pulls a map out from under an older reader.
#[derive(Clone)]
pub(crate) struct GlobalState {
    pub map: Option<Rc<Mmap>>,
    pub file_size: u64,
    pub header: FileHeader,
}

pub(crate) struct DbState {
    pub options: EngineOptions,
    pub path: PathBuf,
    pub file: File,
    pub global: GlobalState,
    pub wal: WalState,
    /// Arena of transaction states; slot 0 is the permanent default read
    /// transaction, retired slots are recycled through `free_slots`.
    pub txns: Vec<Option<TxnState>>,
    pub free_slots: Vec<usize>,
    pub last_write_tx: usize,
    pub active_write_tx: u64,
    /// The reference the latest commit still holds on its own state; dropped
    /// at the next database interaction.
    pub pending_commit_release: Option<usize>,
    pub first_read_bitmap: Option<Vec<u64>>,
    pub original_number_of_pages: u64,
    pub oldest_active_tx: u64,
    pub last_tx_id: u64,
    pub encryption_key: Option<EncryptionKey>,
    pub closed: bool,
}

impl DbState {
    pub(crate) fn txn(&self, slot: usize) -> &TxnState {
        self.txns[slot].as_ref().expect("live transaction slot")
    }

    pub(crate) fn txn_mut(&mut self, slot: usize) -> &mut TxnState {
        self.txns[slot].as_mut().expect("live transaction slot")
    }
}

pub(crate) struct DbShared {
    pub state: RefCell<DbState>,
    pub wal_write_callback: RefCell<Option<WalWriteCallback>>,
}

/// An embedded transactional page store.
pub struct Database {
    shared: Rc<DbShared>,
}

impl Database {
    /// Open the database at `path`, creating and initializing the file when
    /// it does not exist yet. Crash recovery runs before the handle is
    /// returned.
    pub fn open<P: AsRef<Path>>(path: P, mut options: DbOptions) -> Result<Database> {
        options.validate()?;
        let callback = options.wal_write_callback.take();
        let engine = EngineOptions::from_options(&options);
        let encryption_key = options.encryption_key.map(EncryptionKey::new);
        let path = path.as_ref().to_path_buf();

        let file = open_or_create(&path)?;
        if file.metadata()?.len() < engine.minimum_size {
            file.set_len(engine.minimum_size)?;
        }
        let file_size = file.metadata()?.len();
        let map = if engine.avoid_mmap_io {
            None
        } else {
            Some(Rc::new(map_file(&file)?))
        };
        let global = GlobalState {
            map,
            file_size,
            header: FileHeader {
                number_of_pages: file_size / PAGE_SIZE_U64,
                ..FileHeader::default()
            },
        };
        let wal = open_wal_files(&path, engine.wal_size)?;

        let mut state = DbState {
            options: engine,
            path,
            file,
            global: global.clone(),
            wal,
            txns: vec![Some(TxnState::default_read_tx(global))],
            free_slots: Vec::new(),
            last_write_tx: 0,
            active_write_tx: 0,
            pending_commit_release: None,
            first_read_bitmap: None,
            original_number_of_pages: 0,
            oldest_active_tx: 0,
            last_tx_id: 0,
            encryption_key,
            closed: false,
        };
        wal_open_and_recover(&mut state)?;

        let shared = Rc::new(DbShared {
            state: RefCell::new(state),
            wal_write_callback: RefCell::new(callback),
        });
        let db = Database { shared };
        db.init()?;
        db.setup_page_validation()?;
        Ok(db)
    }

    /// Open a snapshot reader attached to the latest committed state.
    pub fn read_txn(&self) -> Result<ReadTransaction> {
        let mut db = self.shared.state.borrow_mut();
        if db.closed {
            return Err(GavranError::InvalidArgument("the database is closed".into()));
        }
        // attach before dropping the previous commit's own reference, so a
        // reader opened right after a commit pins that state in memory
        let slot = db.last_write_tx;
        db.txn_mut(slot).usages += 1;
        release_pending_commit(&mut db)?;
        Ok(ReadTransaction::new(Rc::clone(&self.shared), slot))
    }

    /// Open the single write transaction. Fails while another one is active.
    pub fn write_txn(&self) -> Result<WriteTransaction> {
        let mut db = self.shared.state.borrow_mut();
        if db.closed {
            return Err(GavranError::InvalidArgument("the database is closed".into()));
        }
        if db.options.log_shipping_target {
            return Err(GavranError::InvalidArgument(
                "a log shipping target only accepts shipped WAL records".into(),
            ));
        }
        release_pending_commit(&mut db)?;
        let state = new_write_state(&mut db, TxnMode::Write)?;
        Ok(WriteTransaction::new(Rc::clone(&self.shared), state))
    }

    /// Apply one shipped WAL record, exactly as produced by the source's
    /// `wal_write_callback`. Records must arrive in commit order.
    pub fn apply_wal_record(&self, tx_id: u64, record: &[u8]) -> Result<()> {
        let callback_payload = {
            let mut db = self.shared.state.borrow_mut();
            if db.closed {
                return Err(GavranError::InvalidArgument("the database is closed".into()));
            }
            if !db.options.log_shipping_target {
                return Err(GavranError::InvalidArgument(
                    "the database was not opened as a log shipping target".into(),
                ));
            }
            let decoded = validate_record(record).ok_or_else(|| {
                GavranError::CorruptedLog("the shipped WAL record failed validation".into())
            })?;
            if decoded.tx_id != tx_id {
                return Err(GavranError::InvalidArgument(format!(
                    "shipped record carries transaction {} but {} was announced",
                    decoded.tx_id, tx_id
                )));
            }

            release_pending_commit(&mut db)?;
            let mut st = new_write_state(&mut db, TxnMode::ApplyLog)?;
            let mut working_set = PageMap::new();
            if st.tx_id != decoded.tx_id {
                let expected = st.tx_id;
                rollback_state(&mut db, st, &mut working_set);
                return Err(GavranError::InvalidArgument(format!(
                    "cannot apply transaction {} out of order, expected {}",
                    decoded.tx_id, expected
                )));
            }

            let applied = (|| -> Result<()> {
                if decoded.total_number_of_pages > st.global.header.number_of_pages {
                    // only the file needs to grow; the shipped records carry
                    // every header and bitmap change the source made
                    ensure_data_file_size(&mut db, decoded.total_number_of_pages)?;
                    st.global.map = db.global.map.clone();
                    st.global.file_size = db.global.file_size;
                    st.global.header.number_of_pages = decoded.total_number_of_pages;
                }
                for (i, descriptor) in decoded.pages.iter().enumerate() {
                    raw_modify_page(
                        &mut db,
                        &mut st,
                        &mut working_set,
                        descriptor.page_num,
                        descriptor.number_of_pages,
                    )?;
                    let start = descriptor.offset as usize;
                    let end = if i + 1 < decoded.pages.len() {
                        decoded.pages[i + 1].offset as usize
                    } else {
                        decoded.tx_size as usize
                    };
                    if start > end || end > decoded.data.len() {
                        return Err(GavranError::CorruptedLog(format!(
                            "page descriptor {} of shipped transaction {} points outside \
                             the record",
                            i, decoded.tx_id
                        )));
                    }
                    let buf = txn_page_buf_mut(&mut st, descriptor.page_num)?;
                    if descriptor.flags & WAL_PAGE_FLAG_DIFF != 0 {
                        apply_diff(&decoded.data[start..end], buf)?;
                    } else {
                        let size = descriptor.number_of_pages as usize
                            * crate::storage::page::PAGE_SIZE;
                        if end - start != size {
                            return Err(GavranError::CorruptedLog(format!(
                                "full image for page {} has {} bytes, expected {}",
                                descriptor.page_num,
                                end - start,
                                size
                            )));
                        }
                        buf.copy_from_slice(&decoded.data[start..end]);
                    }
                }
                Ok(())
            })();
            if let Err(error) = applied {
                rollback_state(&mut db, st, &mut working_set);
                return Err(error);
            }

            st.shipped_wal_record = Some(record.to_vec());
            commit_internal(&mut db, st, &mut working_set)?
        };
        if let Some((tx_id, record)) = callback_payload {
            invoke_wal_callback(&self.shared, tx_id, &record);
        }
        Ok(())
    }

    /// Close the handle: unused transaction states are retired (running
    /// their on-forget callbacks); committed-but-unflushed data stays in the
    /// WAL and replays on the next open.
    pub fn close(self) -> Result<()> {
        Self::close_shared(&self.shared)
    }

    fn close_shared(shared: &Rc<DbShared>) -> Result<()> {
        let mut db = shared.state.borrow_mut();
        if db.closed {
            return Ok(());
        }
        let release_result = release_pending_commit(&mut db);
        db.closed = true;
        for slot in 1..db.txns.len() {
            let retire = match &db.txns[slot] {
                Some(state) => state.usages == 0,
                None => false,
            };
            if !retire {
                continue;
            }
            if let Some(mut state) = db.txns[slot].take() {
                for callback in state.on_forget.drain(..).rev() {
                    callback();
                }
            }
        }
        db.txn_mut(0).next = None;
        db.last_write_tx = 0;
        release_result
    }

    fn init(&self) -> Result<()> {
        if self.shared.state.borrow().options.log_shipping_target {
            // a shipping target is populated entirely by applied records
            return Ok(());
        }
        let is_new = {
            let mut tx = self.read_txn()?;
            let (page0, _) = tx.raw_get_page(0, 1)?;
            let is_new = PageMetadata::from_bytes(&page0).is_zero();
            tx.close()?;
            is_new
        };
        if is_new {
            self.init_file_structure()?;
        }
        self.validate_file_on_startup()
    }

    /// First-time initialization: the file header in page 0 slot 0, and the
    /// free-space bitmap right behind it, all committed through the WAL like
    /// any other transaction.
    fn init_file_structure(&self) -> Result<()> {
        let mut tx = self.write_txn()?;

        let mut header = tx.global_header()?;
        header.version = FILE_FORMAT_VERSION;
        header.page_size_power_of_two = PAGE_SIZE_U64.trailing_zeros() as u8;
        header.free_space_bitmap_start = 1;
        tx.set_global_header(header)?;

        let bitmap_pages = header.number_of_pages.div_ceil(BITS_IN_PAGE).max(1);
        let page0 = tx.raw_modify_page(0, 1)?;
        let mut header_record = PageMetadata::zeroed();
        header_record.set_file_header(&header);
        page0[..METADATA_SIZE].copy_from_slice(header_record.as_bytes());
        let mut bitmap_record = PageMetadata::zeroed();
        bitmap_record.set_free_space(bitmap_pages);
        page0[METADATA_SIZE..2 * METADATA_SIZE].copy_from_slice(bitmap_record.as_bytes());

        let bitmap = tx.raw_modify_page(1, bitmap_pages as u32)?;
        let mut set_busy = |bit: u64| bitmap[(bit / 8) as usize] |= 1 << (bit % 8);
        // the header page and the bitmap itself are always busy
        for bit in 0..=bitmap_pages {
            set_busy(bit);
        }
        // pages past the end of the file must never be found by a search
        for bit in header.number_of_pages..bitmap_pages * BITS_IN_PAGE {
            set_busy(bit);
        }

        tx.commit()
    }

    fn validate_file_on_startup(&self) -> Result<()> {
        let header = {
            let mut tx = self.read_txn()?;
            let (page0, _) = tx.raw_get_page(0, 1)?;
            tx.close()?;
            let record = PageMetadata::from_bytes(&page0);
            if record.file_header_magic() != *FILE_HEADER_MAGIC {
                return Err(GavranError::InvalidArgument(format!(
                    "{} is not a database file (bad magic)",
                    self.shared.state.borrow().path.display()
                )));
            }
            let header = record.file_header();
            if header.version != FILE_FORMAT_VERSION {
                return Err(GavranError::InvalidArgument(format!(
                    "unsupported file format version {}",
                    header.version
                )));
            }
            if 1u64 << header.page_size_power_of_two != PAGE_SIZE_U64 {
                return Err(GavranError::InvalidArgument(format!(
                    "the file uses {} byte pages, this build uses {}",
                    1u64 << header.page_size_power_of_two,
                    PAGE_SIZE_U64
                )));
            }
            header
        };
        let mut db = self.shared.state.borrow_mut();
        if header.number_of_pages * PAGE_SIZE_U64 > db.global.file_size {
            return Err(GavranError::InvalidArgument(format!(
                "the file header claims {} pages but the file holds only {} bytes",
                header.number_of_pages, db.global.file_size
            )));
        }
        db.global.header = header;
        db.last_tx_id = header.last_tx_id;
        let global = db.global.clone();
        db.txn_mut(0).global = global;
        Ok(())
    }

    fn setup_page_validation(&self) -> Result<()> {
        let mut db = self.shared.state.borrow_mut();
        if db.options.page_validation != PageValidation::Once {
            return Ok(());
        }
        let pages = db.global.header.number_of_pages;
        db.original_number_of_pages = pages;
        db.first_read_bitmap = Some(vec![0u64; pages.div_ceil(64) as usize]);
        Ok(())
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        let _ = Self::close_shared(&self.shared);
    }
}

pub(crate) fn new_write_state(db: &mut DbState, mode: TxnMode) -> Result<TxnState> {
    if db.active_write_tx != 0 {
        return Err(GavranError::InvalidArgument(
            "a write transaction is already active".into(),
        ));
    }
    let state = TxnState {
        tx_id: db.last_tx_id + 1,
        mode,
        committed: false,
        global: db.global.clone(),
        modified: PageMap::new(),
        prev: Some(db.last_write_tx),
        next: None,
        usages: 0,
        can_free_after_tx_id: 0,
        on_forget: Vec::new(),
        on_rollback: Vec::new(),
        shipped_wal_record: None,
        temp: Vec::new(),
    };
    db.active_write_tx = state.tx_id;
    Ok(state)
}

/// Grow the file so it can hold at least `min_pages` pages (used by recovery
/// and record application, which bypass the allocator).
pub(crate) fn ensure_data_file_size(db: &mut DbState, min_pages: u64) -> Result<()> {
    let needed = min_pages * PAGE_SIZE_U64;
    if db.global.file_size >= needed {
        return Ok(());
    }
    db.file.set_len(needed)?;
    db.global.file_size = needed;
    if !db.options.avoid_mmap_io {
        db.global.map = Some(Rc::new(map_file(&db.file)?));
    }
    Ok(())
}

/// Next file size on the geometric growth schedule: about 10% of the current
/// size (rounded to a power of two, clamped to [1 MiB, 1 GiB] steps), at
/// least enough for the request, preferring a power-of-two total when that
/// lands close.
fn find_next_db_size(current: u64, requested_size: u64) -> u64 {
    let unit_of_growth = (current / 10).next_power_of_two();
    let mut suggested = unit_of_growth.min(1 << 30);
    while suggested <= requested_size {
        suggested += unit_of_growth;
    }
    if suggested < (1 << 20) {
        suggested = 1 << 20;
    }
    let next_power_of_two_file = (current + suggested).next_power_of_two();
    if next_power_of_two_file < current + unit_of_growth * 2 {
        next_power_of_two_file
    } else {
        current + suggested
    }
}

/// Make sure the grown file also has room for the enlarged free-space bitmap.
fn ensure_new_size_can_fit_free_space_bitmap(current_size: u64, new_size: &mut u64) {
    let bitmap_pages = (*new_size / PAGE_SIZE_U64).div_ceil(BITS_IN_PAGE).max(1);
    let required_pages = bitmap_pages.div_ceil(PAGE_SIZE_U64).max(1) * 2;
    if new_size.saturating_sub(current_size) > required_pages * PAGE_SIZE_U64 {
        return;
    }
    *new_size += required_pages * PAGE_SIZE_U64;
}

/// Grow the data file from within a write transaction: truncate up, swap the
/// map (the old one is released only when no reader can still see this
/// transaction, the new one is dropped on rollback), extend or relocate the
/// free-space bitmap and publish the new page count in the header.
pub(crate) fn db_try_increase_file_size(
    db: &mut DbState,
    st: &mut TxnState,
    working_set: &mut PageMap,
    pages: u64,
) -> Result<()> {
    let current_size = st.global.header.number_of_pages * PAGE_SIZE_U64;
    let mut new_size = find_next_db_size(current_size, pages * PAGE_SIZE_U64);
    ensure_new_size_can_fit_free_space_bitmap(st.global.file_size, &mut new_size);
    if new_size >= db.options.maximum_size {
        return Err(GavranError::OutOfSpace {
            maximum_size: db.options.maximum_size,
            requested: new_size,
        });
    }
    debug!(from = current_size, to = new_size, "growing the data file");
    if new_size > st.global.file_size {
        db.file.set_len(new_size)?;
    }
    let mapped_size = db.file.metadata()?.len();

    let from = st.global.header.number_of_pages;
    let to = new_size / PAGE_SIZE_U64;
    if !db.options.avoid_mmap_io {
        let new_map = Rc::new(map_file(&db.file)?);
        let old_map = st.global.map.take();
        let discard_on_rollback = Rc::clone(&new_map);
        st.on_rollback.push(Box::new(move || drop(discard_on_rollback)));
        if let Some(old_map) = old_map {
            // the old span stays mapped until no reader can look at it
            st.on_forget.push(Box::new(move || drop(old_map)));
        }
        st.global.map = Some(new_map);
    }
    st.global.file_size = mapped_size;

    increase_free_space_bitmap(db, st, working_set, from, to)?;
    st.global.header.number_of_pages = to;
    let mut header_record = modify_metadata(db, st, working_set, 0)?;
    header_record.set_file_header(&st.global.header);
    write_metadata(st, 0, &header_record)?;
    Ok(())
}

fn increase_free_space_bitmap(
    db: &mut DbState,
    st: &mut TxnState,
    working_set: &mut PageMap,
    from: u64,
    to: u64,
) -> Result<()> {
    let bitmap_start = st.global.header.free_space_bitmap_start;
    let record = modify_metadata(db, st, working_set, bitmap_start)?;
    let bitmap_pages = record.free_space_pages().max(1);
    if bitmap_pages * BITS_IN_PAGE > to {
        // room to spare, free the new range in place
        raw_modify_page(db, st, working_set, bitmap_start, bitmap_pages as u32)?;
        let buf = txn_page_buf_mut(st, bitmap_start)?;
        for bit in from..to {
            buf[(bit / 8) as usize] &= !(1 << (bit % 8));
        }
        return Ok(());
    }
    move_free_space_bitmap(db, st, working_set, from, to, bitmap_start, bitmap_pages)
}

/// The bitmap outgrew its run: build the enlarged bitmap, find it a home
/// inside itself, install it there and release the old run.
fn move_free_space_bitmap(
    db: &mut DbState,
    st: &mut TxnState,
    working_set: &mut PageMap,
    from: u64,
    to: u64,
    old_start: u64,
    old_pages: u64,
) -> Result<()> {
    let mut pages = to.div_ceil(BITS_IN_PAGE).max(1);
    pages += (pages / 10).next_power_of_two();

    let mut new_map = vec![0xFFu8; (pages * PAGE_SIZE_U64) as usize];
    {
        let global = st.global.clone();
        let ctx = crate::tx::transaction::ReadCtx {
            own: Some(&st.modified),
            chain: st.prev,
            global: &global,
            mode: st.mode,
        };
        let (old_buf, _) = crate::tx::transaction::raw_get_page(
            db,
            &ctx,
            working_set,
            old_start,
            Some(old_pages as u32),
        )?;
        new_map[..old_buf.len()].copy_from_slice(&old_buf);
    }
    for bit in from..to {
        new_map[(bit / 8) as usize] &= !(1 << (bit % 8));
    }

    let words: Vec<u64> = new_map
        .chunks_exact(8)
        .map(|chunk| u64::from_le_bytes(chunk.try_into().unwrap()))
        .collect();
    let Some(range) = search_free_range(&words, pages, 0) else {
        return Err(GavranError::OutOfSpace {
            maximum_size: db.options.maximum_size,
            requested: to * PAGE_SIZE_U64,
        });
    };
    for i in 0..=pages {
        let bit = range.position + i;
        new_map[(bit / 8) as usize] |= 1 << (bit % 8);
    }

    raw_modify_page(db, st, working_set, range.position, pages as u32)?;
    txn_page_buf_mut(st, range.position)?.copy_from_slice(&new_map);
    let mut record = modify_metadata(db, st, working_set, range.position)?;
    record.set_free_space(pages);
    write_metadata(st, range.position, &record)?;
    st.global.header.free_space_bitmap_start = range.position;

    crate::tx::alloc::txn_free_page(db, st, working_set, old_start)
}
