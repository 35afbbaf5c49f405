/// Transactions and the MVCC chain.
///
/// Committed write transactions form a doubly-linked chain of states, oldest
/// to newest, anchored by the permanent default read transaction (slot 0)
/// that represents "read straight from the file". Readers attach to the
/// current head and hold a reference count; the single open write transaction
/// owns its state directly and is linked into the chain only at commit.
///
/// A read walks: own modified pages (write txn only), the working set of
/// staged buffers, then the chain newest-to-oldest, and finally the file
/// itself. Modification is copy-on-write into the transaction's private page
/// map; commit finalizes page hashes or encryption, appends one WAL record
/// and publishes the state as the new chain head. When the oldest chain
/// states are no longer referenced, GC merges their pages forward, writes
/// them into the data file and retires them.
use std::os::unix::fs::FileExt;
use std::rc::Rc;

use tracing::{debug, warn};
use zeroize::Zeroize;

use crate::crypto::aead::{decrypt_page, encrypt_page, next_nonce};
use crate::crypto::hash::hash_bytes;
use crate::db::{DbShared, DbState, GlobalState};
use crate::error::{GavranError, Result};
use crate::options::PageValidation;
use crate::storage::metadata::{
    metadata_entry, PageMetadata, CRYPTO_ENVELOPE_SIZE, METADATA_SIZE,
};
use crate::storage::page::{
    is_metadata_page, metadata_page_of, metadata_slot_of, zeroed_pages, Page, PageNum,
    PAGE_SIZE_U64,
};
use crate::storage::pagemap::{PageEntry, PageMap};
use crate::wal::writer::{wal_append, wal_checkpoint, wal_will_checkpoint};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TxnMode {
    Read,
    Write,
    /// Write-mode variant used by the log-shipping receiver: pages are
    /// installed from a shipped record verbatim, finalization and local
    /// record synthesis are skipped.
    ApplyLog,
}

type CleanupFn = Box<dyn FnOnce()>;

pub(crate) struct TxnState {
    pub tx_id: u64,
    pub mode: TxnMode,
    pub committed: bool,
    pub global: GlobalState,
    pub modified: PageMap,
    pub prev: Option<usize>,
    pub next: Option<usize>,
    pub usages: u32,
    pub can_free_after_tx_id: u64,
    pub on_forget: Vec<CleanupFn>,
    pub on_rollback: Vec<CleanupFn>,
    pub shipped_wal_record: Option<Vec<u8>>,
    pub temp: Vec<Box<[u8]>>,
}

impl TxnState {
    pub(crate) fn default_read_tx(global: GlobalState) -> TxnState {
        TxnState {
            tx_id: 0,
            mode: TxnMode::Read,
            committed: true,
            global,
            modified: PageMap::new(),
            prev: None,
            next: None,
            usages: 0,
            can_free_after_tx_id: 0,
            on_forget: Vec::new(),
            on_rollback: Vec::new(),
            shipped_wal_record: None,
            temp: Vec::new(),
        }
    }
}

/// Everything the shared read path needs to know about the transaction doing
/// the reading, without borrowing the database state.
pub(crate) struct ReadCtx<'a> {
    /// Uncommitted modified pages of the open write transaction.
    pub own: Option<&'a PageMap>,
    /// First chain slot to search: the attach point for readers, the
    /// previous head for a write transaction.
    pub chain: Option<usize>,
    pub global: &'a GlobalState,
    pub mode: TxnMode,
}

// --- read path ---

fn read_from_file(
    db: &DbState,
    global: &GlobalState,
    page_num: PageNum,
    number_of_pages: u32,
) -> Result<Box<[u8]>> {
    let offset = page_num * PAGE_SIZE_U64;
    let size = number_of_pages as u64 * PAGE_SIZE_U64;
    if offset + size > global.file_size {
        return Err(GavranError::InvalidArgument(format!(
            "page {} ({} pages) is outside the bounds of the file ({} bytes)",
            page_num, number_of_pages, global.file_size
        )));
    }
    let mut buf = zeroed_pages(number_of_pages);
    match &global.map {
        Some(map) => buf.copy_from_slice(&map[offset as usize..(offset + size) as usize]),
        None => db.file.read_exact_at(&mut buf, offset)?,
    }
    Ok(buf)
}

/// Fetch a page by the lookup order: own modified pages, working set, the
/// chain of committed transactions, then the file. Unless the transaction is
/// applying a shipped record, the result is decrypted or validated before it
/// is handed out.
pub(crate) fn raw_get_page(
    db: &mut DbState,
    ctx: &ReadCtx<'_>,
    working_set: &mut PageMap,
    page_num: PageNum,
    number_of_pages: Option<u32>,
) -> Result<(Box<[u8]>, u32)> {
    if let Some(own) = ctx.own {
        if let Some(entry) = own.get(page_num) {
            if let Some(buf) = &entry.buf {
                // the transaction's own writes are plaintext and not yet
                // hashed, nothing to verify
                return Ok((buf.clone(), entry.number_of_pages));
            }
        }
    }
    if let Some(entry) = working_set.get(page_num) {
        if let Some(buf) = &entry.buf {
            return Ok((buf.clone(), entry.number_of_pages));
        }
    }

    let mut found: Option<(Box<[u8]>, u32)> = None;
    let mut cursor = ctx.chain;
    while let Some(slot) = cursor {
        // a retired slot means everything older is already in the file
        let Some(state) = db.txns[slot].as_ref() else {
            break;
        };
        if let Some(entry) = state.modified.get(page_num) {
            if let Some(buf) = &entry.buf {
                found = Some((buf.clone(), entry.number_of_pages));
                break;
            }
        }
        cursor = state.prev;
    }

    let (mut data, number_of_pages) = match found {
        Some(hit) => hit,
        None => {
            let number_of_pages = number_of_pages.unwrap_or(1);
            let data = read_from_file(db, ctx.global, page_num, number_of_pages)?;
            if db.options.avoid_mmap_io {
                working_set.insert(
                    page_num,
                    PageEntry {
                        buf: Some(data.clone()),
                        number_of_pages,
                        has_previous: false,
                    },
                )?;
            }
            (data, number_of_pages)
        }
    };

    if ctx.mode != TxnMode::ApplyLog {
        if db.options.encrypted {
            decrypt_into_working_set(db, ctx, working_set, page_num, &mut data, number_of_pages)?;
        } else {
            ensure_page_is_valid(db, ctx, working_set, page_num, &data)?;
        }
    }
    Ok((data, number_of_pages))
}

fn decrypt_into_working_set(
    db: &mut DbState,
    ctx: &ReadCtx<'_>,
    working_set: &mut PageMap,
    page_num: PageNum,
    data: &mut [u8],
    number_of_pages: u32,
) -> Result<()> {
    let key = db
        .encryption_key
        .clone()
        .ok_or_else(|| GavranError::InvariantViolation("encrypted database without a key".into()))?;
    if is_metadata_page(page_num) {
        // a metadata page carries its own envelope in plaintext
        let envelope = PageMetadata::from_bytes(&data[..METADATA_SIZE]);
        let (nonce, mac) = (envelope.nonce(), envelope.mac());
        let body = &mut data[CRYPTO_ENVELOPE_SIZE..];
        decrypt_page(&key, page_num, &nonce, &mac, body)?;
    } else {
        let metadata = match get_metadata_inner(db, ctx, working_set, page_num) {
            Ok(metadata) => metadata,
            // an unborn group means an untouched page: the zero nonce and
            // MAC hit the fresh-page convention below
            Err(GavranError::InvariantViolation(_)) => PageMetadata::zeroed(),
            Err(error) => return Err(error),
        };
        decrypt_page(&key, page_num, &metadata.nonce(), &metadata.mac(), data)?;
    }

    let plaintext: Box<[u8]> = data.to_vec().into_boxed_slice();
    match working_set.get_mut(page_num) {
        Some(entry) => {
            // replaces the staged ciphertext copy in no-mmap mode
            entry.buf = Some(plaintext);
            entry.number_of_pages = number_of_pages;
        }
        None => working_set.insert(
            page_num,
            PageEntry {
                buf: Some(plaintext),
                number_of_pages,
                has_previous: false,
            },
        )?,
    }
    Ok(())
}

pub(crate) fn ensure_page_is_valid(
    db: &mut DbState,
    ctx: &ReadCtx<'_>,
    working_set: &mut PageMap,
    page_num: PageNum,
    data: &[u8],
) -> Result<()> {
    match db.options.page_validation {
        PageValidation::None => Ok(()),
        PageValidation::Always => validate_page(db, ctx, working_set, page_num, data),
        PageValidation::Once => {
            let checked = match &db.first_read_bitmap {
                // before init completed, or a page added after open
                None => return Ok(()),
                Some(bitmap) => {
                    if page_num >= db.original_number_of_pages {
                        return Ok(());
                    }
                    bitmap[(page_num / 64) as usize] & (1 << (page_num % 64)) != 0
                }
            };
            if checked {
                return Ok(());
            }
            validate_page(db, ctx, working_set, page_num, data)?;
            if let Some(bitmap) = &mut db.first_read_bitmap {
                bitmap[(page_num / 64) as usize] |= 1 << (page_num % 64);
            }
            Ok(())
        }
    }
}

pub(crate) fn validate_page(
    db: &mut DbState,
    ctx: &ReadCtx<'_>,
    working_set: &mut PageMap,
    page_num: PageNum,
    data: &[u8],
) -> Result<()> {
    let (expected, computed) = if is_metadata_page(page_num) {
        // a metadata page is covered by its own envelope, everything past it
        let expected: [u8; 32] = data[..CRYPTO_ENVELOPE_SIZE].try_into().unwrap();
        (expected, hash_bytes(&data[CRYPTO_ENVELOPE_SIZE..]))
    } else {
        // a page whose group was never born has no record; it must read as
        // zeros and is checked against a zero hash below
        let metadata = match get_metadata_inner(db, ctx, working_set, page_num) {
            Ok(metadata) => metadata,
            Err(GavranError::InvariantViolation(_)) => PageMetadata::zeroed(),
            Err(error) => return Err(error),
        };
        (metadata.hash(), hash_bytes(data))
    };
    if expected == computed {
        return Ok(());
    }
    // a zero hash over a zero page is a freshly allocated, never committed page
    if expected == [0u8; 32] && data.iter().all(|&b| b == 0) {
        return Ok(());
    }
    Err(GavranError::CorruptedPage { page_num })
}

/// Read the metadata record for `page_num` through the transaction's view.
pub(crate) fn get_metadata_inner(
    db: &mut DbState,
    ctx: &ReadCtx<'_>,
    working_set: &mut PageMap,
    page_num: PageNum,
) -> Result<PageMetadata> {
    let meta_page = metadata_page_of(page_num);
    let (buf, _) = raw_get_page(db, ctx, working_set, meta_page, Some(1))?;
    metadata_entry(&buf, meta_page, page_num)
}

/// A page's true extent: overflow values and the free-space bitmap span
/// several pages, recorded in their metadata; everything else is one page.
pub(crate) fn resolve_number_of_pages(
    db: &mut DbState,
    ctx: &ReadCtx<'_>,
    working_set: &mut PageMap,
    page_num: PageNum,
) -> Result<u32> {
    use crate::storage::metadata::PageFlags;
    if is_metadata_page(page_num) {
        return Ok(1);
    }
    // a page in a group whose metadata page was never born is a single
    // untouched page, same as the zeroed-record fallback on validation
    let metadata = match get_metadata_inner(db, ctx, working_set, page_num) {
        Ok(metadata) => metadata,
        Err(GavranError::InvariantViolation(_)) => return Ok(1),
        Err(error) => return Err(error),
    };
    let pages = match metadata.page_flags_raw() {
        f if f == PageFlags::Overflow as u8 => metadata.overflow_pages(),
        f if f == PageFlags::FreeSpaceBitmap as u8 => metadata.free_space_pages(),
        _ => 1,
    };
    Ok(pages.max(1) as u32)
}

// --- modify path ---

/// Copy-on-write a page into the transaction's private map. When the
/// requested extent differs from the page's current one the page is treated
/// as born fresh and zero-filled instead of copied.
pub(crate) fn raw_modify_page(
    db: &mut DbState,
    st: &mut TxnState,
    working_set: &mut PageMap,
    page_num: PageNum,
    number_of_pages: u32,
) -> Result<()> {
    if let Some(entry) = st.modified.get(page_num) {
        if entry.buf.is_some() {
            return Ok(());
        }
    }
    let global = st.global.clone();
    let ctx = ReadCtx {
        own: None,
        chain: st.prev,
        global: &global,
        mode: st.mode,
    };
    let (original, original_pages) =
        raw_get_page(db, &ctx, working_set, page_num, Some(number_of_pages))?;
    let entry = if original_pages == number_of_pages {
        PageEntry {
            buf: Some(original),
            number_of_pages,
            has_previous: true,
        }
    } else {
        PageEntry {
            buf: Some(zeroed_pages(number_of_pages)),
            number_of_pages,
            has_previous: false,
        }
    };
    st.modified.insert(page_num, entry)
}

pub(crate) fn txn_page_buf_mut<'a>(
    st: &'a mut TxnState,
    page_num: PageNum,
) -> Result<&'a mut Box<[u8]>> {
    st.modified
        .get_mut(page_num)
        .and_then(|entry| entry.buf.as_mut())
        .ok_or_else(|| {
            GavranError::InvariantViolation(format!(
                "page {} is not modified in this transaction",
                page_num
            ))
        })
}

/// Copy-on-write the metadata page of `page_num` and return its record.
pub(crate) fn modify_metadata(
    db: &mut DbState,
    st: &mut TxnState,
    working_set: &mut PageMap,
    page_num: PageNum,
) -> Result<PageMetadata> {
    let meta_page = metadata_page_of(page_num);
    raw_modify_page(db, st, working_set, meta_page, 1)?;
    let buf = txn_page_buf_mut(st, meta_page)?;
    metadata_entry(buf, meta_page, page_num)
}

/// Write a record back into its (already modified) metadata page.
pub(crate) fn write_metadata(
    st: &mut TxnState,
    page_num: PageNum,
    metadata: &PageMetadata,
) -> Result<()> {
    let meta_page = metadata_page_of(page_num);
    let index = metadata_slot_of(page_num);
    let buf = txn_page_buf_mut(st, meta_page)?;
    buf[index * METADATA_SIZE..(index + 1) * METADATA_SIZE]
        .copy_from_slice(metadata.as_bytes());
    Ok(())
}

/// Resolve the pre-image a modified page is diffed against: the newest copy
/// in the chain before this transaction, or the file itself. The chain is
/// immutable for the duration of the transaction, so this matches what
/// `raw_modify_page` copied.
pub(crate) fn resolve_previous_image(
    db: &DbState,
    st: &TxnState,
    page_num: PageNum,
    number_of_pages: u32,
) -> Option<Box<[u8]>> {
    let mut cursor = st.prev;
    while let Some(slot) = cursor {
        let state = db.txns[slot].as_ref()?;
        if let Some(entry) = state.modified.get(page_num) {
            if let Some(buf) = &entry.buf {
                if entry.number_of_pages != number_of_pages {
                    return None;
                }
                return Some(buf.clone());
            }
        }
        cursor = state.prev;
    }
    read_from_file(db, &st.global, page_num, number_of_pages).ok()
}

// --- finalization (integrity / encryption) ---

fn finalize_regular_page(
    db: &mut DbState,
    st: &mut TxnState,
    working_set: &mut PageMap,
    page_num: PageNum,
) -> Result<()> {
    let mut metadata = modify_metadata(db, st, working_set, page_num)?;
    let mut buf = st
        .modified
        .get_mut(page_num)
        .and_then(|entry| entry.buf.take())
        .ok_or_else(|| {
            GavranError::InvariantViolation(format!("page {} lost its buffer", page_num))
        })?;

    let sealed = if db.options.encrypted {
        match &db.encryption_key {
            Some(key) => {
                let nonce = next_nonce(&metadata.nonce());
                metadata.set_nonce(&nonce);
                encrypt_page(key, page_num, &nonce, &mut buf).map(|mac| metadata.set_mac(&mac))
            }
            None => Err(GavranError::InvariantViolation(
                "encrypted database without a key".into(),
            )),
        }
    } else {
        metadata.set_hash(&hash_bytes(&buf));
        Ok(())
    };

    if let Some(entry) = st.modified.get_mut(page_num) {
        entry.buf = Some(buf);
    }
    sealed?;
    write_metadata(st, page_num, &metadata)
}

fn finalize_metadata_page(db: &DbState, st: &mut TxnState, page_num: PageNum) -> Result<()> {
    let buf = txn_page_buf_mut(st, page_num)?;
    if db.options.encrypted {
        let key = db.encryption_key.as_ref().ok_or_else(|| {
            GavranError::InvariantViolation("encrypted database without a key".into())
        })?;
        let envelope = PageMetadata::from_bytes(&buf[..METADATA_SIZE]);
        let nonce = next_nonce(&envelope.nonce());
        let (head, body) = buf.split_at_mut(CRYPTO_ENVELOPE_SIZE);
        let mac = encrypt_page(key, page_num, &nonce, body)?;
        head[..16].copy_from_slice(&nonce);
        head[16..].copy_from_slice(&mac);
    } else {
        let hash = hash_bytes(&buf[CRYPTO_ENVELOPE_SIZE..]);
        buf[..CRYPTO_ENVELOPE_SIZE].copy_from_slice(&hash);
    }
    Ok(())
}

/// Seal every modified page. Regular pages go first since sealing them
/// updates metadata pages; the metadata pages themselves are sealed last.
fn finalize_modified_pages(
    db: &mut DbState,
    st: &mut TxnState,
    working_set: &mut PageMap,
) -> Result<()> {
    let pages: Vec<PageNum> = st
        .modified
        .iter()
        .filter(|(_, entry)| entry.buf.is_some())
        .map(|(page_num, _)| page_num)
        .collect();
    for &page_num in &pages {
        // make sure the metadata page is part of the transaction even for
        // pages whose record is untouched, its group hash changes regardless
        modify_metadata(db, st, working_set, page_num)?;
        if is_metadata_page(page_num) {
            continue;
        }
        finalize_regular_page(db, st, working_set, page_num)?;
    }
    let metadata_pages: Vec<PageNum> = st
        .modified
        .iter()
        .filter(|(page_num, entry)| is_metadata_page(*page_num) && entry.buf.is_some())
        .map(|(page_num, _)| page_num)
        .collect();
    for page_num in metadata_pages {
        finalize_metadata_page(db, st, page_num)?;
    }
    Ok(())
}

// --- commit / close / GC ---

pub(crate) fn clear_working_set(working_set: &mut PageMap, encrypted: bool) {
    if encrypted {
        for (_, entry) in working_set.iter_mut() {
            if let Some(buf) = &mut entry.buf {
                buf.zeroize();
            }
        }
    }
    *working_set = PageMap::new();
}

pub(crate) fn rollback_state(db: &mut DbState, mut st: TxnState, working_set: &mut PageMap) {
    if db.active_write_tx == st.tx_id {
        db.active_write_tx = 0;
    }
    clear_working_set(working_set, db.options.encrypted);
    for callback in st.on_rollback.drain(..).rev() {
        callback();
    }
    // never ran to completion, on_forget actions are simply dropped
    st.on_forget.clear();
}

fn commit_steps(
    db: &mut DbState,
    st: &mut TxnState,
    working_set: &mut PageMap,
) -> Result<Option<Vec<u8>>> {
    if st.modified.is_empty() {
        return Ok(None);
    }
    if st.mode != TxnMode::ApplyLog {
        st.global.header.last_tx_id = st.tx_id;
        let mut header_record = modify_metadata(db, st, working_set, 0)?;
        header_record.set_file_header(&st.global.header);
        write_metadata(st, 0, &header_record)?;
        finalize_modified_pages(db, st, working_set)?;
    }
    let record = wal_append(db, st)?;
    Ok(Some(record))
}

/// Commit a write transaction and release it, the Rust shape of the original
/// commit-then-close pair. On success returns the WAL record for the shipping
/// callback; on any failure the transaction is rolled back.
pub(crate) fn commit_internal(
    db: &mut DbState,
    mut st: TxnState,
    working_set: &mut PageMap,
) -> Result<Option<(u64, Vec<u8>)>> {
    match commit_steps(db, &mut st, working_set) {
        Ok(None) => {
            rollback_state(db, st, working_set);
            Ok(None)
        }
        Err(error) => {
            rollback_state(db, st, working_set);
            Err(error)
        }
        Ok(Some(record)) => {
            let tx_id = st.tx_id;
            st.committed = true;
            st.usages = 1;
            st.on_rollback.clear();
            st.temp.clear();
            clear_working_set(working_set, db.options.encrypted);

            let prev_slot = db.last_write_tx;
            st.prev = Some(prev_slot);
            let slot = match db.free_slots.pop() {
                Some(slot) => {
                    db.txns[slot] = Some(st);
                    slot
                }
                None => {
                    db.txns.push(Some(st));
                    db.txns.len() - 1
                }
            };
            db.txn_mut(prev_slot).next = Some(slot);
            db.last_write_tx = slot;
            db.last_tx_id = tx_id;
            let global = db.txn(slot).global.clone();
            db.global = global;
            db.active_write_tx = 0;

            // the committed state keeps one reference for the handle; it is
            // released on the next database interaction, giving a reader the
            // chance to attach before GC may flush this state to the file
            db.pending_commit_release = Some(slot);
            Ok(Some((tx_id, record)))
        }
    }
}

/// Move the modified pages of every older transaction into `latest` (newest
/// copy wins), transferring buffer ownership and leaving blanked entries
/// behind in the donors.
fn merge_unique_pages(db: &mut DbState, latest: usize) -> Result<()> {
    let mut cursor = db.txn(latest).prev;
    while let Some(slot) = cursor {
        if db.txns[slot].is_none() {
            break;
        }
        let mut donor = std::mem::take(&mut db.txn_mut(slot).modified);
        for (page_num, entry) in donor.iter_mut() {
            if entry.buf.is_none() {
                continue;
            }
            let already_present = db
                .txn(latest)
                .modified
                .get(page_num)
                .is_some_and(|existing| existing.buf.is_some());
            if already_present {
                continue;
            }
            let moved = PageEntry {
                buf: entry.buf.take(),
                number_of_pages: entry.number_of_pages,
                has_previous: entry.has_previous,
            };
            db.txn_mut(latest).modified.insert(page_num, moved)?;
        }
        let state = db.txn_mut(slot);
        state.modified = donor;
        cursor = state.prev;
    }
    Ok(())
}

/// Write the merged pages of `slot` into the data file, then checkpoint the
/// WAL if policy allows.
fn write_state_to_disk(db: &mut DbState, slot: usize) -> Result<()> {
    let tx_id = db.txn(slot).tx_id;
    let map = std::mem::take(&mut db.txn_mut(slot).modified);
    let mut write_result: Result<()> = Ok(());
    for (page_num, entry) in map.iter() {
        if let Some(buf) = &entry.buf {
            if let Err(error) = db.file.write_all_at(buf, page_num * PAGE_SIZE_U64) {
                write_result = Err(error.into());
                break;
            }
        }
    }
    db.txn_mut(slot).modified = map;
    write_result?;
    db.file.sync_data()?;
    if wal_will_checkpoint(db, tx_id) {
        wal_checkpoint(db, tx_id)?;
    }
    Ok(())
}

/// Retire chain states from the front once nothing can reach them any more,
/// adopting their snapshot into the default read transaction and running
/// their on-forget callbacks.
fn free_registered_transactions(db: &mut DbState) {
    while let Some(slot) = db.txn(0).next {
        let Some(state) = db.txns[slot].as_ref() else {
            break;
        };
        if state.usages > 0 || state.can_free_after_tx_id > db.oldest_active_tx {
            break;
        }
        let next = state.next;
        if let Some(next_slot) = next {
            db.txn_mut(next_slot).prev = None;
        }
        let Some(mut state) = db.txns[slot].take() else {
            break;
        };
        db.txns[0].as_mut().expect("default read tx").next = next;
        db.txns[0].as_mut().expect("default read tx").global = state.global.clone();
        if db.last_write_tx == slot {
            db.last_write_tx = 0;
        }
        for callback in state.on_forget.drain(..).rev() {
            callback();
        }
        db.free_slots.push(slot);
    }
}

/// Runs when a committed transaction loses its last reference: flush the
/// longest unused prefix of the chain to the data file and retire what
/// nothing can see any more.
pub(crate) fn txn_gc(db: &mut DbState, closing: usize) -> Result<()> {
    if let Some(state) = db.txns[closing].as_mut() {
        state.can_free_after_tx_id = db.last_tx_id + 1;
    }
    if db.txn(0).usages > 0 {
        // readers are looking at the file directly, nothing may move
        return Ok(());
    }
    let mut latest_unused = 0usize;
    while let Some(next) = db.txn(latest_unused).next {
        match db.txns[next].as_ref() {
            Some(state) if state.usages == 0 => latest_unused = next,
            _ => break,
        }
    }
    if latest_unused == 0 {
        return Ok(());
    }
    db.oldest_active_tx = db.txn(latest_unused).tx_id + 1;
    if latest_unused == db.last_write_tx {
        // also the head: once flushed, new readers can use the file directly
        db.txn_mut(latest_unused).can_free_after_tx_id = db.last_tx_id;
    }
    debug!(
        tx_id = db.txn(latest_unused).tx_id,
        "flushing unused transactions to the data file"
    );
    merge_unique_pages(db, latest_unused)?;
    write_state_to_disk(db, latest_unused)?;
    free_registered_transactions(db);
    Ok(())
}

/// Drop the reference a commit left for its own transaction state. Runs at
/// the next database interaction, so the flush happens with the same timing
/// as an explicit close right after commit.
pub(crate) fn release_pending_commit(db: &mut DbState) -> Result<()> {
    let Some(slot) = db.pending_commit_release.take() else {
        return Ok(());
    };
    if db.txns[slot].is_none() {
        return Ok(());
    }
    let state = db.txn_mut(slot);
    state.usages -= 1;
    if state.usages == 0 {
        txn_gc(db, slot)?;
    }
    Ok(())
}

/// Shared release path for read transactions.
fn release_read_txn(db: &mut DbState, slot: usize, working_set: &mut PageMap) -> Result<()> {
    clear_working_set(working_set, db.options.encrypted);
    let state = db.txn_mut(slot);
    state.usages -= 1;
    if state.usages == 0 {
        txn_gc(db, slot)?;
    }
    Ok(())
}

// --- public transaction handles ---

/// A snapshot reader. The transaction sees exactly the state committed before
/// it was opened; later commits are invisible to it.
pub struct ReadTransaction {
    shared: Rc<DbShared>,
    slot: usize,
    working_set: PageMap,
    released: bool,
}

impl ReadTransaction {
    pub(crate) fn new(shared: Rc<DbShared>, slot: usize) -> ReadTransaction {
        ReadTransaction {
            shared,
            slot,
            working_set: PageMap::new(),
            released: false,
        }
    }

    /// The id of the commit this reader is attached to.
    pub fn id(&self) -> u64 {
        self.shared.state.borrow().txn(self.slot).tx_id
    }

    pub fn get_page(&mut self, page_num: PageNum) -> Result<Page> {
        let shared = Rc::clone(&self.shared);
        let mut db = shared.state.borrow_mut();
        let global = db.txn(self.slot).global.clone();
        let ctx = ReadCtx {
            own: None,
            chain: Some(self.slot),
            global: &global,
            mode: TxnMode::Read,
        };
        let number_of_pages =
            resolve_number_of_pages(&mut db, &ctx, &mut self.working_set, page_num)?;
        let (data, number_of_pages) = raw_get_page(
            &mut db,
            &ctx,
            &mut self.working_set,
            page_num,
            Some(number_of_pages),
        )?;
        Ok(Page {
            page_num,
            number_of_pages,
            data,
        })
    }

    pub(crate) fn raw_get_page(
        &mut self,
        page_num: PageNum,
        number_of_pages: u32,
    ) -> Result<(Box<[u8]>, u32)> {
        let shared = Rc::clone(&self.shared);
        let mut db = shared.state.borrow_mut();
        let global = db.txn(self.slot).global.clone();
        let ctx = ReadCtx {
            own: None,
            chain: Some(self.slot),
            global: &global,
            mode: TxnMode::Read,
        };
        raw_get_page(
            &mut db,
            &ctx,
            &mut self.working_set,
            page_num,
            Some(number_of_pages),
        )
    }

    pub fn get_metadata(&mut self, page_num: PageNum) -> Result<PageMetadata> {
        let shared = Rc::clone(&self.shared);
        let mut db = shared.state.borrow_mut();
        let global = db.txn(self.slot).global.clone();
        let ctx = ReadCtx {
            own: None,
            chain: Some(self.slot),
            global: &global,
            mode: TxnMode::Read,
        };
        get_metadata_inner(&mut db, &ctx, &mut self.working_set, page_num)
    }

    pub fn is_page_busy(&mut self, page_num: PageNum) -> Result<bool> {
        let shared = Rc::clone(&self.shared);
        let mut db = shared.state.borrow_mut();
        let global = db.txn(self.slot).global.clone();
        let ctx = ReadCtx {
            own: None,
            chain: Some(self.slot),
            global: &global,
            mode: TxnMode::Read,
        };
        crate::tx::alloc::is_page_busy_with(&mut db, &ctx, &mut self.working_set, page_num)
    }

    /// Release the snapshot. Dropping the transaction does the same but
    /// swallows GC errors.
    pub fn close(mut self) -> Result<()> {
        self.released = true;
        let shared = Rc::clone(&self.shared);
        let mut db = shared.state.borrow_mut();
        release_read_txn(&mut db, self.slot, &mut self.working_set)
    }
}

impl Drop for ReadTransaction {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let shared = Rc::clone(&self.shared);
        let mut db = shared.state.borrow_mut();
        if let Err(error) = release_read_txn(&mut db, self.slot, &mut self.working_set) {
            warn!(%error, "failed to release a read transaction");
        }
    }
}

/// The single open write transaction. All changes are private until `commit`;
/// dropping the handle rolls back.
pub struct WriteTransaction {
    shared: Rc<DbShared>,
    state: Option<TxnState>,
    working_set: PageMap,
}

impl WriteTransaction {
    pub(crate) fn new(shared: Rc<DbShared>, state: TxnState) -> WriteTransaction {
        WriteTransaction {
            shared,
            state: Some(state),
            working_set: PageMap::new(),
        }
    }

    fn state_mut(&mut self) -> Result<&mut TxnState> {
        self.state.as_mut().ok_or_else(|| {
            GavranError::InvariantViolation("the write transaction is already finished".into())
        })
    }

    pub fn id(&self) -> u64 {
        self.state.as_ref().map(|state| state.tx_id).unwrap_or(0)
    }

    pub fn get_page(&mut self, page_num: PageNum) -> Result<Page> {
        let shared = Rc::clone(&self.shared);
        let mut db = shared.state.borrow_mut();
        let st = self.state.as_ref().ok_or_else(|| {
            GavranError::InvariantViolation("the write transaction is already finished".into())
        })?;
        let ctx = ReadCtx {
            own: Some(&st.modified),
            chain: st.prev,
            global: &st.global,
            mode: st.mode,
        };
        let number_of_pages =
            resolve_number_of_pages(&mut db, &ctx, &mut self.working_set, page_num)?;
        let (data, number_of_pages) = raw_get_page(
            &mut db,
            &ctx,
            &mut self.working_set,
            page_num,
            Some(number_of_pages),
        )?;
        Ok(Page {
            page_num,
            number_of_pages,
            data,
        })
    }

    pub fn get_metadata(&mut self, page_num: PageNum) -> Result<PageMetadata> {
        let shared = Rc::clone(&self.shared);
        let mut db = shared.state.borrow_mut();
        let st = self.state.as_ref().ok_or_else(|| {
            GavranError::InvariantViolation("the write transaction is already finished".into())
        })?;
        let ctx = ReadCtx {
            own: Some(&st.modified),
            chain: st.prev,
            global: &st.global,
            mode: st.mode,
        };
        get_metadata_inner(&mut db, &ctx, &mut self.working_set, page_num)
    }

    /// COW the page and return its writable buffer. The buffer lives in the
    /// transaction and is exactly what commit persists.
    pub fn modify_page(&mut self, page_num: PageNum) -> Result<&mut [u8]> {
        let shared = Rc::clone(&self.shared);
        {
            let mut db = shared.state.borrow_mut();
            let st = self.state.as_mut().ok_or_else(|| {
                GavranError::InvariantViolation("the write transaction is already finished".into())
            })?;
            if page_num >= st.global.header.number_of_pages {
                return Err(GavranError::InvalidArgument(format!(
                    "cannot modify page {} beyond the end of the file ({} pages)",
                    page_num, st.global.header.number_of_pages
                )));
            }
            let number_of_pages = {
                let ctx = ReadCtx {
                    own: Some(&st.modified),
                    chain: st.prev,
                    global: &st.global,
                    mode: st.mode,
                };
                resolve_number_of_pages(&mut db, &ctx, &mut self.working_set, page_num)?
            };
            raw_modify_page(&mut db, st, &mut self.working_set, page_num, number_of_pages)?;
        }
        let st = self.state_mut()?;
        Ok(txn_page_buf_mut(st, page_num)?.as_mut())
    }

    /// Like `modify_page` with an explicit extent, without the end-of-file
    /// check; the building block for allocation and record application.
    pub fn raw_modify_page(
        &mut self,
        page_num: PageNum,
        number_of_pages: u32,
    ) -> Result<&mut [u8]> {
        let shared = Rc::clone(&self.shared);
        {
            let mut db = shared.state.borrow_mut();
            let st = self.state.as_mut().ok_or_else(|| {
                GavranError::InvariantViolation("the write transaction is already finished".into())
            })?;
            raw_modify_page(&mut db, st, &mut self.working_set, page_num, number_of_pages)?;
        }
        let st = self.state_mut()?;
        Ok(txn_page_buf_mut(st, page_num)?.as_mut())
    }

    pub fn set_metadata(&mut self, page_num: PageNum, metadata: &PageMetadata) -> Result<()> {
        let shared = Rc::clone(&self.shared);
        let mut db = shared.state.borrow_mut();
        let st = self.state.as_mut().ok_or_else(|| {
            GavranError::InvariantViolation("the write transaction is already finished".into())
        })?;
        modify_metadata(&mut db, st, &mut self.working_set, page_num)?;
        write_metadata(st, page_num, metadata)
    }

    /// Allocate `number_of_pages` consecutive pages near the hint, growing
    /// the file when needed. The pages and their metadata record start out
    /// zeroed.
    pub fn allocate_page(&mut self, number_of_pages: u32, nearby_hint: u64) -> Result<PageNum> {
        let shared = Rc::clone(&self.shared);
        let mut db = shared.state.borrow_mut();
        let st = self.state.as_mut().ok_or_else(|| {
            GavranError::InvariantViolation("the write transaction is already finished".into())
        })?;
        crate::tx::alloc::txn_allocate_page(
            &mut db,
            st,
            &mut self.working_set,
            number_of_pages,
            nearby_hint,
        )
    }

    /// Free a page (or overflow run), zeroing content, metadata and bitmap
    /// bits, and reaping the group's metadata page when it becomes the last
    /// busy page of its group.
    pub fn free_page(&mut self, page_num: PageNum) -> Result<()> {
        let shared = Rc::clone(&self.shared);
        let mut db = shared.state.borrow_mut();
        let st = self.state.as_mut().ok_or_else(|| {
            GavranError::InvariantViolation("the write transaction is already finished".into())
        })?;
        crate::tx::alloc::txn_free_page(&mut db, st, &mut self.working_set, page_num)
    }

    pub fn is_page_busy(&mut self, page_num: PageNum) -> Result<bool> {
        let shared = Rc::clone(&self.shared);
        let mut db = shared.state.borrow_mut();
        let st = self.state.as_ref().ok_or_else(|| {
            GavranError::InvariantViolation("the write transaction is already finished".into())
        })?;
        let ctx = ReadCtx {
            own: Some(&st.modified),
            chain: st.prev,
            global: &st.global,
            mode: st.mode,
        };
        crate::tx::alloc::is_page_busy_with(&mut db, &ctx, &mut self.working_set, page_num)
    }

    pub(crate) fn global_header(&self) -> Result<crate::storage::metadata::FileHeader> {
        self.state
            .as_ref()
            .map(|state| state.global.header)
            .ok_or_else(|| {
                GavranError::InvariantViolation("the write transaction is already finished".into())
            })
    }

    pub(crate) fn set_global_header(
        &mut self,
        header: crate::storage::metadata::FileHeader,
    ) -> Result<()> {
        self.state_mut()?.global.header = header;
        Ok(())
    }

    /// Scratch memory that lives exactly as long as the transaction.
    pub fn alloc_temp(&mut self, size: usize) -> Result<&mut [u8]> {
        let st = self.state_mut()?;
        st.temp.push(vec![0u8; size].into_boxed_slice());
        Ok(st.temp.last_mut().expect("just pushed"))
    }

    /// Register a cleanup to run when this transaction's state is finally
    /// retired by GC (after commit, once no reader can see it). Callbacks run
    /// in LIFO order and must not call back into the database.
    pub fn register_on_forget(&mut self, action: impl FnOnce() + 'static) -> Result<()> {
        self.state_mut()?.on_forget.push(Box::new(action));
        Ok(())
    }

    /// Register a cleanup to run if this transaction rolls back instead of
    /// committing. Callbacks run in LIFO order and must not call back into
    /// the database.
    pub fn register_on_rollback(&mut self, action: impl FnOnce() + 'static) -> Result<()> {
        self.state_mut()?.on_rollback.push(Box::new(action));
        Ok(())
    }

    /// Commit all modifications. A transaction that modified nothing simply
    /// ends. On failure the transaction is rolled back; a record partially
    /// written to the WAL fails hash validation and is discarded by the next
    /// recovery.
    pub fn commit(mut self) -> Result<()> {
        let shared = Rc::clone(&self.shared);
        let st = self.state.take().ok_or_else(|| {
            GavranError::InvariantViolation("the write transaction is already finished".into())
        })?;
        let callback_payload = {
            let mut db = shared.state.borrow_mut();
            commit_internal(&mut db, st, &mut self.working_set)?
        };
        if let Some((tx_id, record)) = callback_payload {
            invoke_wal_callback(&shared, tx_id, &record);
        }
        Ok(())
    }

    /// Explicit rollback; dropping the handle does the same.
    pub fn rollback(mut self) -> Result<()> {
        self.rollback_inner();
        Ok(())
    }

    fn rollback_inner(&mut self) {
        let Some(st) = self.state.take() else { return };
        let shared = Rc::clone(&self.shared);
        let mut db = shared.state.borrow_mut();
        rollback_state(&mut db, st, &mut self.working_set);
    }
}

impl Drop for WriteTransaction {
    fn drop(&mut self) {
        self.rollback_inner();
    }
}

pub(crate) fn invoke_wal_callback(shared: &Rc<DbShared>, tx_id: u64, record: &[u8]) {
    if let Some(callback) = shared.wal_write_callback.borrow_mut().as_mut() {
        callback(tx_id, record);
    }
}
