//! Thread and message persistence, independent of the checkpointer

mod threads;

pub use threads::{
    normalize_dsn, MemoryThreadStore, PgThreadStore, StoredMessage, ThreadStore,
};
