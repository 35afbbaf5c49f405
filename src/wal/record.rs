/// WAL record format.
///
/// One committed transaction serializes as:
///
///   [header: 80 bytes]
///     hash_blake2b: [u8; 32]       covers bytes [32, page_aligned_tx_size)
///     tx_id: u64
///     page_aligned_tx_size: u64    on-disk footprint, page aligned
///     tx_size: u64                 logical size before padding
///     number_of_modified_pages: u64
///     total_number_of_pages_in_database: u64
///     flags: u32                   1 = payload is zstd compressed
///     padding: [u8; 4]
///   [page descriptors: 24 bytes each]
///     page_num: u64
///     offset: u64                  bytes from the start of the record
///     number_of_pages: u32
///     flags: u32                   1 = payload is a diff stream
///   [payload blobs, one per page]
///   [zero padding up to page_aligned_tx_size]
///
/// A diff stream is a sequence of `{offset: u32, length: i32}` entries; a
/// positive length is followed by that many content bytes, a negative one
/// zero-fills `|length|` bytes. Compression covers everything after the
/// 80-byte header and is kept only when it strictly shrinks the data.
use crate::crypto::hash::{hash_bytes, HASH_SIZE};
use crate::error::{GavranError, Result};
use crate::storage::page::PAGE_SIZE;

pub(crate) const WAL_HEADER_SIZE: usize = 80;
pub(crate) const WAL_PAGE_DESCRIPTOR_SIZE: usize = 24;

pub(crate) const WAL_TXN_FLAG_COMPRESSED: u32 = 1;
pub(crate) const WAL_PAGE_FLAG_DIFF: u32 = 1;

/// One diff entry caps at 8 MiB of zero fill.
const MAX_DIFF_RUN_WORDS: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy)]
pub(crate) struct WalRecordHeader {
    pub hash: [u8; HASH_SIZE],
    pub tx_id: u64,
    pub page_aligned_tx_size: u64,
    pub tx_size: u64,
    pub number_of_modified_pages: u64,
    pub total_number_of_pages: u64,
    pub flags: u32,
}

impl WalRecordHeader {
    pub(crate) fn decode(bytes: &[u8]) -> WalRecordHeader {
        WalRecordHeader {
            hash: bytes[..32].try_into().unwrap(),
            tx_id: u64::from_le_bytes(bytes[32..40].try_into().unwrap()),
            page_aligned_tx_size: u64::from_le_bytes(bytes[40..48].try_into().unwrap()),
            tx_size: u64::from_le_bytes(bytes[48..56].try_into().unwrap()),
            number_of_modified_pages: u64::from_le_bytes(bytes[56..64].try_into().unwrap()),
            total_number_of_pages: u64::from_le_bytes(bytes[64..72].try_into().unwrap()),
            flags: u32::from_le_bytes(bytes[72..76].try_into().unwrap()),
        }
    }

    pub(crate) fn encode_into(&self, bytes: &mut [u8]) {
        bytes[..32].copy_from_slice(&self.hash);
        bytes[32..40].copy_from_slice(&self.tx_id.to_le_bytes());
        bytes[40..48].copy_from_slice(&self.page_aligned_tx_size.to_le_bytes());
        bytes[48..56].copy_from_slice(&self.tx_size.to_le_bytes());
        bytes[56..64].copy_from_slice(&self.number_of_modified_pages.to_le_bytes());
        bytes[64..72].copy_from_slice(&self.total_number_of_pages.to_le_bytes());
        bytes[72..76].copy_from_slice(&self.flags.to_le_bytes());
        bytes[76..80].fill(0);
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct WalPageDescriptor {
    pub page_num: u64,
    pub offset: u64,
    pub number_of_pages: u32,
    pub flags: u32,
}

impl WalPageDescriptor {
    pub(crate) fn decode(bytes: &[u8]) -> WalPageDescriptor {
        WalPageDescriptor {
            page_num: u64::from_le_bytes(bytes[..8].try_into().unwrap()),
            offset: u64::from_le_bytes(bytes[8..16].try_into().unwrap()),
            number_of_pages: u32::from_le_bytes(bytes[16..20].try_into().unwrap()),
            flags: u32::from_le_bytes(bytes[20..24].try_into().unwrap()),
        }
    }

    pub(crate) fn encode_into(&self, bytes: &mut [u8]) {
        bytes[..8].copy_from_slice(&self.page_num.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.offset.to_le_bytes());
        bytes[16..20].copy_from_slice(&self.number_of_pages.to_le_bytes());
        bytes[20..24].copy_from_slice(&self.flags.to_le_bytes());
    }
}

/// A validated, decompressed record ready for replay.
pub(crate) struct DecodedRecord {
    pub tx_id: u64,
    /// On-disk footprint of the record; the next record starts this many
    /// bytes further on.
    pub page_aligned_tx_size: u64,
    /// Logical size of `data`.
    pub tx_size: u64,
    pub total_number_of_pages: u64,
    pub pages: Vec<WalPageDescriptor>,
    /// Header + descriptors + payload, after decompression.
    pub data: Vec<u8>,
}

/// Validate the record at the start of `region`. Returns `None` when no valid
/// record starts there: a zeroed reset page, a torn write whose hash does not
/// match, an out-of-bounds size, or a payload that will not decompress.
pub(crate) fn validate_record(region: &[u8]) -> Option<DecodedRecord> {
    if region.len() < WAL_HEADER_SIZE {
        return None;
    }
    let header = WalRecordHeader::decode(region);
    if header.tx_id == 0 {
        return None;
    }
    let aligned = header.page_aligned_tx_size;
    if aligned < WAL_HEADER_SIZE as u64
        || aligned > region.len() as u64
        || header.tx_size < WAL_HEADER_SIZE as u64
        || header.tx_size > aligned
    {
        return None;
    }
    let aligned = aligned as usize;
    if hash_bytes(&region[HASH_SIZE..aligned]) != header.hash {
        return None;
    }

    let tx_size = header.tx_size as usize;
    let data = if header.flags & WAL_TXN_FLAG_COMPRESSED != 0 {
        let payload = zstd::stream::decode_all(&region[WAL_HEADER_SIZE..tx_size]).ok()?;
        let mut data = Vec::with_capacity(WAL_HEADER_SIZE + payload.len());
        data.extend_from_slice(&region[..WAL_HEADER_SIZE]);
        data.extend_from_slice(&payload);
        data
    } else {
        region[..tx_size].to_vec()
    };

    let count = header.number_of_modified_pages as usize;
    let descriptors_end = WAL_HEADER_SIZE + count * WAL_PAGE_DESCRIPTOR_SIZE;
    if descriptors_end > data.len() {
        return None;
    }
    let pages = (0..count)
        .map(|i| {
            WalPageDescriptor::decode(
                &data[WAL_HEADER_SIZE + i * WAL_PAGE_DESCRIPTOR_SIZE..],
            )
        })
        .collect();

    Some(DecodedRecord {
        tx_id: header.tx_id,
        page_aligned_tx_size: header.page_aligned_tx_size,
        tx_size: data.len() as u64,
        total_number_of_pages: header.total_number_of_pages,
        pages,
        data,
    })
}

fn read_word(bytes: &[u8], word: usize) -> u64 {
    u64::from_le_bytes(bytes[word * 8..word * 8 + 8].try_into().unwrap())
}

/// Encode the difference between `origin` and `modified` into `out`.
/// Returns the number of bytes written; when the diff would not beat a full
/// image, `out` receives the full image instead.
pub(crate) fn diff_page(origin: &[u8], modified: &[u8], out: &mut [u8]) -> usize {
    debug_assert_eq!(origin.len(), modified.len());
    debug_assert_eq!(out.len(), modified.len());
    let words = modified.len() / 8;
    let mut written = 0usize;
    let mut word = 0usize;

    while word < words {
        if read_word(origin, word) == read_word(modified, word) {
            word += 1;
            continue;
        }
        let run_start = word;
        let mut zeroes = true;
        while word < words && word - run_start < MAX_DIFF_RUN_WORDS {
            if read_word(origin, word) == read_word(modified, word) {
                if zeroes && read_word(modified, word) == 0 {
                    // equal zero words extend a zero-fill run
                    word += 1;
                    continue;
                }
                break;
            }
            zeroes &= read_word(modified, word) == 0;
            word += 1;
        }

        let length = ((word - run_start) * 8) as i32;
        let mut needed = written + 8;
        if !zeroes {
            needed += length as usize;
        }
        if needed >= out.len() {
            out.copy_from_slice(modified);
            return out.len();
        }
        out[written..written + 4].copy_from_slice(&((run_start * 8) as u32).to_le_bytes());
        let encoded_length = if zeroes { -length } else { length };
        out[written + 4..written + 8].copy_from_slice(&encoded_length.to_le_bytes());
        written += 8;
        if !zeroes {
            out[written..written + length as usize]
                .copy_from_slice(&modified[run_start * 8..run_start * 8 + length as usize]);
            written += length as usize;
        }
    }
    written
}

/// Apply a diff stream on top of the current page content.
pub(crate) fn apply_diff(mut input: &[u8], page: &mut [u8]) -> Result<()> {
    while input.len() >= 8 {
        let offset = u32::from_le_bytes(input[..4].try_into().unwrap()) as usize;
        let length = i32::from_le_bytes(input[4..8].try_into().unwrap());
        input = &input[8..];
        if length < 0 {
            let length = length.unsigned_abs() as usize;
            if offset + length > page.len() {
                return Err(GavranError::CorruptedLog(format!(
                    "diff zero-fill runs past the page end (offset {}, length {})",
                    offset, length
                )));
            }
            page[offset..offset + length].fill(0);
        } else {
            let length = length as usize;
            if offset + length > page.len() || length > input.len() {
                return Err(GavranError::CorruptedLog(format!(
                    "diff content runs past the page end (offset {}, length {})",
                    offset, length
                )));
            }
            page[offset..offset + length].copy_from_slice(&input[..length]);
            input = &input[length..];
        }
    }
    Ok(())
}

/// Compress the record region after the header, keeping the result only when
/// it strictly shrinks. Returns the new payload end.
pub(crate) fn compress_payload(record: &mut [u8], payload_end: usize) -> (usize, bool) {
    let input = &record[WAL_HEADER_SIZE..payload_end];
    match zstd::bulk::compress(input, 0) {
        Ok(compressed) if compressed.len() < input.len() => {
            let end = WAL_HEADER_SIZE + compressed.len();
            record[WAL_HEADER_SIZE..end].copy_from_slice(&compressed);
            (end, true)
        }
        _ => (payload_end, false),
    }
}

/// Seal a fully laid out record: pad to the page boundary, fill in the sizes
/// and the hash. `record` must already be sized to the aligned length.
pub(crate) fn seal_record(record: &mut [u8], header: &mut WalRecordHeader, tx_size: usize) {
    let aligned = record.len();
    debug_assert_eq!(aligned % PAGE_SIZE, 0);
    record[tx_size..].fill(0);
    header.tx_size = tx_size as u64;
    header.page_aligned_tx_size = aligned as u64;
    header.encode_into(record);
    let hash = hash_bytes(&record[HASH_SIZE..]);
    header.hash = hash;
    record[..HASH_SIZE].copy_from_slice(&hash);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let header = WalRecordHeader {
            hash: [7u8; 32],
            tx_id: 12,
            page_aligned_tx_size: 8192,
            tx_size: 300,
            number_of_modified_pages: 2,
            total_number_of_pages: 16,
            flags: WAL_TXN_FLAG_COMPRESSED,
        };
        let mut bytes = [0u8; WAL_HEADER_SIZE];
        header.encode_into(&mut bytes);
        let decoded = WalRecordHeader::decode(&bytes);
        assert_eq!(decoded.tx_id, 12);
        assert_eq!(decoded.tx_size, 300);
        assert_eq!(decoded.flags, WAL_TXN_FLAG_COMPRESSED);
        assert_eq!(decoded.hash, [7u8; 32]);
    }

    #[test]
    fn test_diff_small_change() {
        let origin = vec![0u8; PAGE_SIZE];
        let mut modified = origin.clone();
        modified[..13].copy_from_slice(b"Hello Gavran\0");
        let mut out = vec![0u8; PAGE_SIZE];
        let written = diff_page(&origin, &modified, &mut out);
        assert!(written < 64, "small edit should produce a small diff");

        let mut replayed = origin.clone();
        apply_diff(&out[..written], &mut replayed).unwrap();
        assert_eq!(replayed, modified);
    }

    #[test]
    fn test_diff_change_at_page_end() {
        let origin = vec![0u8; PAGE_SIZE];
        let mut modified = origin.clone();
        modified[PAGE_SIZE - 8..].copy_from_slice(&0xDEADBEEFu64.to_le_bytes());
        let mut out = vec![0u8; PAGE_SIZE];
        let written = diff_page(&origin, &modified, &mut out);

        let mut replayed = origin.clone();
        apply_diff(&out[..written], &mut replayed).unwrap();
        assert_eq!(replayed, modified, "the final word of the page must survive");
    }

    #[test]
    fn test_diff_zero_run() {
        let origin = vec![0xFFu8; PAGE_SIZE];
        let modified = vec![0u8; PAGE_SIZE];
        let mut out = vec![0u8; PAGE_SIZE];
        let written = diff_page(&origin, &modified, &mut out);
        assert_eq!(written, 8, "a full zero wipe is one zero-fill entry");

        let mut replayed = origin.clone();
        apply_diff(&out[..written], &mut replayed).unwrap();
        assert_eq!(replayed, modified);
    }

    #[test]
    fn test_diff_falls_back_to_full_image() {
        let origin = vec![0u8; PAGE_SIZE];
        let modified: Vec<u8> = (0..PAGE_SIZE).map(|i| (i * 7 + 1) as u8).collect();
        let mut out = vec![0u8; PAGE_SIZE];
        let written = diff_page(&origin, &modified, &mut out);
        assert_eq!(written, PAGE_SIZE);
        assert_eq!(out, modified);
    }

    #[test]
    fn test_apply_diff_rejects_out_of_bounds() {
        let mut entry = Vec::new();
        entry.extend_from_slice(&(PAGE_SIZE as u32).to_le_bytes());
        entry.extend_from_slice(&16i32.to_le_bytes());
        entry.extend_from_slice(&[0u8; 16]);
        let mut page = vec![0u8; PAGE_SIZE];
        assert!(apply_diff(&entry, &mut page).is_err());
    }

    #[test]
    fn test_compression_skipped_when_not_smaller() {
        // incompressible payload: keep as-is
        let mut record = vec![0u8; WAL_HEADER_SIZE + 64];
        for (i, byte) in record.iter_mut().enumerate().skip(WAL_HEADER_SIZE) {
            *byte = (i * 193 % 251) as u8;
        }
        let (end, compressed) = compress_payload(&mut record.clone(), WAL_HEADER_SIZE + 64);
        // tiny inputs do not shrink under zstd
        assert_eq!(end, WAL_HEADER_SIZE + 64);
        assert!(!compressed);

        // highly repetitive payload: compresses
        let mut record = vec![0xAAu8; WAL_HEADER_SIZE + PAGE_SIZE];
        let (end, compressed) = compress_payload(&mut record, WAL_HEADER_SIZE + PAGE_SIZE);
        assert!(compressed);
        assert!(end < WAL_HEADER_SIZE + PAGE_SIZE);
    }

    #[test]
    fn test_seal_and_validate_roundtrip() {
        let payload = b"some page bytes";
        let tx_size = WAL_HEADER_SIZE + WAL_PAGE_DESCRIPTOR_SIZE + payload.len();
        let mut record = vec![0u8; PAGE_SIZE];
        let descriptor = WalPageDescriptor {
            page_num: 3,
            offset: (WAL_HEADER_SIZE + WAL_PAGE_DESCRIPTOR_SIZE) as u64,
            number_of_pages: 1,
            flags: WAL_PAGE_FLAG_DIFF,
        };
        descriptor.encode_into(&mut record[WAL_HEADER_SIZE..]);
        record[WAL_HEADER_SIZE + WAL_PAGE_DESCRIPTOR_SIZE..tx_size].copy_from_slice(payload);
        let mut header = WalRecordHeader {
            hash: [0u8; 32],
            tx_id: 9,
            page_aligned_tx_size: 0,
            tx_size: 0,
            number_of_modified_pages: 1,
            total_number_of_pages: 16,
            flags: 0,
        };
        seal_record(&mut record, &mut header, tx_size);

        let decoded = validate_record(&record).expect("sealed record validates");
        assert_eq!(decoded.tx_id, 9);
        assert_eq!(decoded.pages.len(), 1);
        assert_eq!(decoded.pages[0].page_num, 3);
        assert_eq!(decoded.pages[0].flags, WAL_PAGE_FLAG_DIFF);

        // any flipped byte kills it
        let mut tampered = record.clone();
        tampered[100] ^= 1;
        assert!(validate_record(&tampered).is_none());

        // a zeroed reset page is not a record
        assert!(validate_record(&vec![0u8; PAGE_SIZE]).is_none());
    }
}
