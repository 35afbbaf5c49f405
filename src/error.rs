use thiserror::Error;

#[derive(Error, Debug)]
pub enum GavranError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("cannot grow the database past {maximum_size} bytes ({requested} requested)")]
    OutOfSpace { maximum_size: u64, requested: u64 },

    #[error("out of memory: {0}")]
    OutOfMemory(String),

    #[error("page {page_num} failed validation: content does not match its recorded hash")]
    CorruptedPage { page_num: u64 },

    #[error("write-ahead log is corrupted: {0}")]
    CorruptedLog(String),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("encryption failure on page {page_num}: {reason}")]
    Encryption { page_num: u64, reason: String },

    #[error("decryption failure on page {page_num}: ciphertext or MAC rejected")]
    Decryption { page_num: u64 },
}

pub type Result<T> = std::result::Result<T, GavranError>;
