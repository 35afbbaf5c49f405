/// Page allocation over the free-space bitmap.
///
/// Allocation searches the bitmap for a free run near the caller's hint,
/// marks it busy, births the group's metadata page when it does not exist yet
/// and hands back a zeroed range with a zeroed metadata record. Freeing
/// reverses all of it, and reaps a metadata page once it is the only busy
/// page left in its group.
///
/// All bitmap access goes through the run's first page, whose metadata
/// records the run length, so a bitmap spanning several pages is always read
/// and written as one coherent buffer.
use crate::db::{db_try_increase_file_size, DbState};
use crate::error::{GavranError, Result};
use crate::storage::bitmap::search_free_range;
use crate::storage::metadata::{PageFlags, PageMetadata, METADATA_SIZE};
use crate::storage::page::{
    metadata_page_of, metadata_slot_of, PageNum, PAGE_SIZE_U64,
};
use crate::storage::pagemap::PageMap;
use crate::tx::transaction::{
    get_metadata_inner, modify_metadata, raw_get_page, raw_modify_page, resolve_number_of_pages,
    txn_page_buf_mut, write_metadata, ReadCtx, TxnState,
};

fn bitmap_run(
    db: &mut DbState,
    st: &TxnState,
    working_set: &mut PageMap,
) -> Result<(PageNum, u32)> {
    let start = st.global.header.free_space_bitmap_start;
    let global = st.global.clone();
    let ctx = ReadCtx {
        own: Some(&st.modified),
        chain: st.prev,
        global: &global,
        mode: st.mode,
    };
    let metadata = get_metadata_inner(db, &ctx, working_set, start)?;
    if metadata.page_flags_raw() != PageFlags::FreeSpaceBitmap as u8 {
        return Err(GavranError::InvariantViolation(format!(
            "page {} is not the free-space bitmap",
            start
        )));
    }
    Ok((start, metadata.free_space_pages().max(1) as u32))
}

/// Flip one bit of the free-space bitmap through the transaction. Busy and
/// free updates are idempotent, so re-clearing an already free page leaves
/// the bitmap consistent.
fn bitmap_set_bit(
    db: &mut DbState,
    st: &mut TxnState,
    working_set: &mut PageMap,
    page_num: PageNum,
    busy: bool,
) -> Result<()> {
    let (start, run_pages) = bitmap_run(db, st, working_set)?;
    raw_modify_page(db, st, working_set, start, run_pages)?;
    let buf = txn_page_buf_mut(st, start)?;
    let byte = (page_num / 8) as usize;
    let bit = 1u8 << (page_num % 8);
    if byte >= buf.len() {
        return Err(GavranError::InvariantViolation(format!(
            "page {} is beyond the free-space bitmap",
            page_num
        )));
    }
    if busy {
        buf[byte] |= bit;
    } else {
        buf[byte] &= !bit;
    }
    Ok(())
}

fn bitmap_word(
    db: &mut DbState,
    st: &TxnState,
    working_set: &mut PageMap,
    first_bit: u64,
) -> Result<u64> {
    let (start, run_pages) = bitmap_run(db, st, working_set)?;
    let global = st.global.clone();
    let ctx = ReadCtx {
        own: Some(&st.modified),
        chain: st.prev,
        global: &global,
        mode: st.mode,
    };
    let (buf, _) = raw_get_page(db, &ctx, working_set, start, Some(run_pages))?;
    let byte = (first_bit / 8) as usize;
    if byte + 8 > buf.len() {
        return Ok(u64::MAX);
    }
    Ok(u64::from_le_bytes(buf[byte..byte + 8].try_into().unwrap()))
}

pub(crate) fn is_page_busy_with(
    db: &mut DbState,
    ctx: &ReadCtx<'_>,
    working_set: &mut PageMap,
    page_num: PageNum,
) -> Result<bool> {
    let start = ctx.global.header.free_space_bitmap_start;
    let metadata = get_metadata_inner(db, ctx, working_set, start)?;
    let run_pages = metadata.free_space_pages().max(1) as u32;
    let (buf, _) = raw_get_page(db, ctx, working_set, start, Some(run_pages))?;
    let byte = (page_num / 8) as usize;
    if byte >= buf.len() {
        return Ok(true);
    }
    Ok(buf[byte] & (1 << (page_num % 8)) != 0)
}

/// Make sure the metadata page covering `page_num` exists, then claim the
/// record for `page_num`: it must be free, and is handed back zeroed.
fn allocate_metadata_entry(
    db: &mut DbState,
    st: &mut TxnState,
    working_set: &mut PageMap,
    page_num: PageNum,
) -> Result<()> {
    let meta_page = metadata_page_of(page_num);
    let global = st.global.clone();
    let exists = {
        let ctx = ReadCtx {
            own: Some(&st.modified),
            chain: st.prev,
            global: &global,
            mode: st.mode,
        };
        is_page_busy_with(db, &ctx, working_set, meta_page)?
    };
    raw_modify_page(db, st, working_set, meta_page, 1)?;
    if !exists {
        let mut slot0 = PageMetadata::zeroed();
        slot0.set_page_flags(PageFlags::Metadata);
        let buf = txn_page_buf_mut(st, meta_page)?;
        buf[..METADATA_SIZE].copy_from_slice(slot0.as_bytes());
        bitmap_set_bit(db, st, working_set, meta_page, true)?;
    }

    let buf = txn_page_buf_mut(st, meta_page)?;
    let slot0_flags = buf[32];
    let valid = slot0_flags == PageFlags::Metadata as u8
        || (meta_page == 0 && slot0_flags == PageFlags::FileHeader as u8);
    if !valid {
        return Err(GavranError::InvariantViolation(format!(
            "expected page {} to be a metadata page, but its flags are {:#x}",
            meta_page, slot0_flags
        )));
    }
    let index = metadata_slot_of(page_num);
    let record = &mut buf[index * METADATA_SIZE..(index + 1) * METADATA_SIZE];
    if record[32] != PageFlags::Free as u8 {
        return Err(GavranError::InvariantViolation(format!(
            "metadata record for page {} is already in use",
            page_num
        )));
    }
    record.fill(0);
    Ok(())
}

pub(crate) fn txn_allocate_page(
    db: &mut DbState,
    st: &mut TxnState,
    working_set: &mut PageMap,
    number_of_pages: u32,
    nearby_hint: u64,
) -> Result<PageNum> {
    if number_of_pages == 0 {
        return Err(GavranError::InvalidArgument(
            "cannot allocate zero pages".into(),
        ));
    }
    loop {
        let (start, run_pages) = bitmap_run(db, st, working_set)?;
        let words = {
            let global = st.global.clone();
            let ctx = ReadCtx {
                own: Some(&st.modified),
                chain: st.prev,
                global: &global,
                mode: st.mode,
            };
            let (buf, _) = raw_get_page(db, &ctx, working_set, start, Some(run_pages))?;
            buf.chunks_exact(8)
                .map(|chunk| u64::from_le_bytes(chunk.try_into().unwrap()))
                .collect::<Vec<u64>>()
        };

        let Some(range) = search_free_range(&words, number_of_pages as u64, nearby_hint) else {
            db_try_increase_file_size(db, st, working_set, number_of_pages as u64)?;
            continue;
        };

        let position = range.position;
        for i in 0..number_of_pages as u64 {
            bitmap_set_bit(db, st, working_set, position + i, true)?;
        }
        allocate_metadata_entry(db, st, working_set, position)?;
        if number_of_pages > 1 {
            // record the run so later reads resolve its true extent
            let mut metadata = modify_metadata(db, st, working_set, position)?;
            metadata.set_overflow(
                number_of_pages as u64,
                number_of_pages as u64 * PAGE_SIZE_U64,
            );
            write_metadata(st, position, &metadata)?;
        }
        raw_modify_page(db, st, working_set, position, number_of_pages)?;
        txn_page_buf_mut(st, position)?.fill(0);
        return Ok(position);
    }
}

pub(crate) fn txn_free_page(
    db: &mut DbState,
    st: &mut TxnState,
    working_set: &mut PageMap,
    page_num: PageNum,
) -> Result<()> {
    let number_of_pages = {
        let global = st.global.clone();
        let ctx = ReadCtx {
            own: Some(&st.modified),
            chain: st.prev,
            global: &global,
            mode: st.mode,
        };
        resolve_number_of_pages(db, &ctx, working_set, page_num)? as u64
    };
    raw_modify_page(db, st, working_set, page_num, number_of_pages as u32)?;

    let mut pages = number_of_pages;
    if pages % 128 == 0 {
        // allocations on a 128-page boundary carry an extra absorbed page
        pages += 1;
    }
    for i in 0..pages {
        bitmap_set_bit(db, st, working_set, page_num + i, false)?;
        modify_metadata(db, st, working_set, page_num + i)?;
        write_metadata(st, page_num + i, &PageMetadata::zeroed())?;
    }
    txn_page_buf_mut(st, page_num)?.fill(0);

    let meta_page = metadata_page_of(page_num);
    if meta_page != page_num {
        // when the metadata page is the only busy page left in its 128-page
        // group, reap it as well
        let low = bitmap_word(db, st, working_set, meta_page)?;
        if low == 1 {
            let high = bitmap_word(db, st, working_set, meta_page + 64)?;
            if high == 0 {
                txn_free_page(db, st, working_set, meta_page)?;
            }
        }
    }
    Ok(())
}
