pub(crate) mod alloc;
pub mod transaction;

pub use transaction::{ReadTransaction, WriteTransaction};
