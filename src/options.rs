/// Database configuration.
use crate::crypto::aead::KEY_SIZE;
use crate::error::{GavranError, Result};
use crate::storage::page::PAGE_SIZE_U64;

/// Smallest allowed data file and WAL file size.
pub const MIN_FILE_SIZE: u64 = 128 * 1024;

pub const DEFAULT_MINIMUM_SIZE: u64 = 1024 * 1024;
pub const DEFAULT_WAL_SIZE: u64 = 256 * 1024;

/// How page hashes are checked on read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PageValidation {
    /// Never validate.
    #[default]
    None,
    /// Validate each page the first time it is read in this process.
    Once,
    /// Validate on every read.
    Always,
}

/// Invoked with (tx_id, record bytes) after every WAL append; the record can
/// be shipped to a `log_shipping_target` database via
/// [`crate::Database::apply_wal_record`]. The callback must not call back into
/// the database that invoked it.
pub type WalWriteCallback = Box<dyn FnMut(u64, &[u8])>;

pub struct DbOptions {
    /// Initial and minimum file size. Must be at least [`MIN_FILE_SIZE`] and
    /// a multiple of the page size.
    pub minimum_size: u64,
    /// Upper bound for file growth.
    pub maximum_size: u64,
    /// Nominal size of each of the two WAL files.
    pub wal_size: u64,
    /// When set, page contents are sealed with XChaCha20-Poly1305 under
    /// per-page subkeys of this master key.
    pub encryption_key: Option<[u8; KEY_SIZE]>,
    pub page_validation: PageValidation,
    /// Read through positioned reads into per-transaction buffers instead of
    /// a memory map (for address-space constrained hosts).
    pub avoid_mmap_io: bool,
    /// The database only accepts shipped WAL records; local write
    /// transactions are rejected.
    pub log_shipping_target: bool,
    pub wal_write_callback: Option<WalWriteCallback>,
}

impl Default for DbOptions {
    fn default() -> Self {
        DbOptions {
            minimum_size: DEFAULT_MINIMUM_SIZE,
            maximum_size: u64::MAX,
            wal_size: DEFAULT_WAL_SIZE,
            encryption_key: None,
            page_validation: PageValidation::default(),
            avoid_mmap_io: false,
            log_shipping_target: false,
            wal_write_callback: None,
        }
    }
}

impl DbOptions {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.minimum_size < MIN_FILE_SIZE {
            return Err(GavranError::InvalidArgument(format!(
                "minimum_size must be at least {} bytes, got {}",
                MIN_FILE_SIZE, self.minimum_size
            )));
        }
        if self.minimum_size % PAGE_SIZE_U64 != 0 {
            return Err(GavranError::InvalidArgument(format!(
                "minimum_size must be a multiple of the {} byte page size, got {}",
                PAGE_SIZE_U64, self.minimum_size
            )));
        }
        if self.minimum_size > self.maximum_size {
            return Err(GavranError::InvalidArgument(format!(
                "maximum_size ({}) cannot be less than minimum_size ({})",
                self.maximum_size, self.minimum_size
            )));
        }
        if self.wal_size < MIN_FILE_SIZE {
            return Err(GavranError::InvalidArgument(format!(
                "wal_size must be at least {} bytes, got {}",
                MIN_FILE_SIZE, self.wal_size
            )));
        }
        Ok(())
    }
}

/// The option values the engine consults on hot paths, detached from the
/// caller-supplied callback so they stay `Copy`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct EngineOptions {
    pub minimum_size: u64,
    pub maximum_size: u64,
    pub wal_size: u64,
    pub page_validation: PageValidation,
    pub avoid_mmap_io: bool,
    pub log_shipping_target: bool,
    pub encrypted: bool,
}

impl EngineOptions {
    pub(crate) fn from_options(options: &DbOptions) -> Self {
        EngineOptions {
            minimum_size: options.minimum_size,
            maximum_size: options.maximum_size,
            wal_size: options.wal_size,
            page_validation: options.page_validation,
            avoid_mmap_io: options.avoid_mmap_io,
            log_shipping_target: options.log_shipping_target,
            encrypted: options.encryption_key.is_some(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        DbOptions::default().validate().unwrap();
    }

    #[test]
    fn test_rejects_tiny_minimum_size() {
        let options = DbOptions {
            minimum_size: 64 * 1024,
            ..Default::default()
        };
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_rejects_unaligned_minimum_size() {
        let options = DbOptions {
            minimum_size: MIN_FILE_SIZE + 100,
            ..Default::default()
        };
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_rejects_min_above_max() {
        let options = DbOptions {
            minimum_size: 1024 * 1024,
            maximum_size: 512 * 1024,
            ..Default::default()
        };
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_rejects_tiny_wal() {
        let options = DbOptions {
            wal_size: 4096,
            ..Default::default()
        };
        assert!(options.validate().is_err());
    }
}
