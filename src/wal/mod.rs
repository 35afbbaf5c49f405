pub(crate) mod record;
pub(crate) mod recovery;
pub(crate) mod writer;
