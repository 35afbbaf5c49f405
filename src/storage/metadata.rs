/// Per-page metadata records.
///
/// Every page has one fixed 64-byte record in its group's metadata page:
///
///   [0..32)  crypto envelope: BLAKE2b hash of the page payload, or, when the
///            file is encrypted, a 16-byte AEAD nonce followed by a 16-byte MAC
///   [32]     page flags
///   [33..64) type-specific body (file header, free-space heart, overflow)
///
/// The file header lives in page 0's slot 0; its body carries the magic,
/// version, page size and the location of the free-space bitmap.
use crate::error::{GavranError, Result};
use crate::storage::page::metadata_slot_of;

pub const METADATA_SIZE: usize = 64;
pub const CRYPTO_ENVELOPE_SIZE: usize = 32;
pub const HASH_SIZE: usize = 32;
pub const STORED_NONCE_SIZE: usize = 16;
pub const MAC_SIZE: usize = 16;

pub const FILE_HEADER_MAGIC: &[u8; 5] = b"GVRN!";
pub const FILE_FORMAT_VERSION: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageFlags {
    Free = 0,
    FileHeader = 1,
    Metadata = 2,
    FreeSpaceBitmap = 3,
    Overflow = 4,
}

impl PageFlags {
    pub fn from_u8(value: u8) -> Result<PageFlags> {
        match value {
            0 => Ok(PageFlags::Free),
            1 => Ok(PageFlags::FileHeader),
            2 => Ok(PageFlags::Metadata),
            3 => Ok(PageFlags::FreeSpaceBitmap),
            4 => Ok(PageFlags::Overflow),
            other => Err(GavranError::InvariantViolation(format!(
                "unknown page flags value {}",
                other
            ))),
        }
    }
}

/// The file header, stored in the body of page 0's metadata record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileHeader {
    pub version: u8,
    pub page_size_power_of_two: u8,
    pub number_of_pages: u64,
    pub last_tx_id: u64,
    pub free_space_bitmap_start: u64,
}

/// One 64-byte metadata record, as a copyable value. Accessors read and write
/// the raw little-endian layout; the transaction layer owns the page buffers
/// these records are stored in.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PageMetadata {
    bytes: [u8; METADATA_SIZE],
}

impl PageMetadata {
    pub fn zeroed() -> Self {
        PageMetadata {
            bytes: [0u8; METADATA_SIZE],
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut record = PageMetadata::zeroed();
        record.bytes.copy_from_slice(&bytes[..METADATA_SIZE]);
        record
    }

    pub fn as_bytes(&self) -> &[u8; METADATA_SIZE] {
        &self.bytes
    }

    pub fn is_zero(&self) -> bool {
        self.bytes.iter().all(|&b| b == 0)
    }

    // --- crypto envelope ---

    pub fn hash(&self) -> [u8; HASH_SIZE] {
        self.bytes[..HASH_SIZE].try_into().unwrap()
    }

    pub fn set_hash(&mut self, hash: &[u8; HASH_SIZE]) {
        self.bytes[..HASH_SIZE].copy_from_slice(hash);
    }

    pub fn nonce(&self) -> [u8; STORED_NONCE_SIZE] {
        self.bytes[..STORED_NONCE_SIZE].try_into().unwrap()
    }

    pub fn set_nonce(&mut self, nonce: &[u8; STORED_NONCE_SIZE]) {
        self.bytes[..STORED_NONCE_SIZE].copy_from_slice(nonce);
    }

    pub fn mac(&self) -> [u8; MAC_SIZE] {
        self.bytes[STORED_NONCE_SIZE..CRYPTO_ENVELOPE_SIZE]
            .try_into()
            .unwrap()
    }

    pub fn set_mac(&mut self, mac: &[u8; MAC_SIZE]) {
        self.bytes[STORED_NONCE_SIZE..CRYPTO_ENVELOPE_SIZE].copy_from_slice(mac);
    }

    // --- common body ---

    pub fn page_flags_raw(&self) -> u8 {
        self.bytes[32]
    }

    pub fn page_flags(&self) -> Result<PageFlags> {
        PageFlags::from_u8(self.bytes[32])
    }

    pub fn set_page_flags(&mut self, flags: PageFlags) {
        self.bytes[32] = flags as u8;
    }

    // --- file header body ---

    pub fn file_header(&self) -> FileHeader {
        FileHeader {
            version: self.bytes[33],
            page_size_power_of_two: self.bytes[34],
            number_of_pages: u64::from_le_bytes(self.bytes[40..48].try_into().unwrap()),
            last_tx_id: u64::from_le_bytes(self.bytes[48..56].try_into().unwrap()),
            free_space_bitmap_start: u64::from_le_bytes(self.bytes[56..64].try_into().unwrap()),
        }
    }

    pub fn file_header_magic(&self) -> [u8; 5] {
        self.bytes[35..40].try_into().unwrap()
    }

    pub fn set_file_header(&mut self, header: &FileHeader) {
        self.bytes[32] = PageFlags::FileHeader as u8;
        self.bytes[33] = header.version;
        self.bytes[34] = header.page_size_power_of_two;
        self.bytes[35..40].copy_from_slice(FILE_HEADER_MAGIC);
        self.bytes[40..48].copy_from_slice(&header.number_of_pages.to_le_bytes());
        self.bytes[48..56].copy_from_slice(&header.last_tx_id.to_le_bytes());
        self.bytes[56..64].copy_from_slice(&header.free_space_bitmap_start.to_le_bytes());
    }

    // --- free-space bitmap body ---

    pub fn free_space_pages(&self) -> u64 {
        u64::from_le_bytes(self.bytes[40..48].try_into().unwrap())
    }

    pub fn set_free_space(&mut self, number_of_pages: u64) {
        self.bytes[32] = PageFlags::FreeSpaceBitmap as u8;
        self.bytes[40..48].copy_from_slice(&number_of_pages.to_le_bytes());
    }

    // --- overflow body ---

    pub fn overflow_pages(&self) -> u64 {
        u64::from_le_bytes(self.bytes[40..48].try_into().unwrap())
    }

    pub fn overflow_size_of_value(&self) -> u64 {
        u64::from_le_bytes(self.bytes[48..56].try_into().unwrap())
    }

    pub fn set_overflow(&mut self, number_of_pages: u64, size_of_value: u64) {
        self.bytes[32] = PageFlags::Overflow as u8;
        self.bytes[40..48].copy_from_slice(&number_of_pages.to_le_bytes());
        self.bytes[48..56].copy_from_slice(&size_of_value.to_le_bytes());
    }
}

impl std::fmt::Debug for PageMetadata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageMetadata")
            .field("page_flags", &self.page_flags_raw())
            .finish()
    }
}

/// Read the record for `page_num` out of its metadata page buffer, checking
/// that the page really is a metadata page (slot 0 must be flagged as
/// metadata, or as the file header for group 0).
pub(crate) fn metadata_entry(
    metadata_page: &[u8],
    metadata_page_num: u64,
    page_num: u64,
) -> Result<PageMetadata> {
    let slot0 = PageMetadata::from_bytes(&metadata_page[..METADATA_SIZE]);
    let flags = slot0.page_flags_raw();
    let valid = flags == PageFlags::Metadata as u8
        || (metadata_page_num == 0 && flags == PageFlags::FileHeader as u8);
    if !valid {
        return Err(GavranError::InvariantViolation(format!(
            "page {} is not a metadata page (flags {:#x}), cannot read metadata for page {}",
            metadata_page_num, flags, page_num
        )));
    }
    let index = metadata_slot_of(page_num);
    Ok(PageMetadata::from_bytes(
        &metadata_page[index * METADATA_SIZE..(index + 1) * METADATA_SIZE],
    ))
}
