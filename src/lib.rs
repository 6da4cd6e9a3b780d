pub mod error;
pub mod expiration;
pub mod http_server;
pub mod index;
pub mod snapshot;
pub mod stats;
pub mod store;
pub mod value;
pub mod wal;

pub use error::{CacheError, Result};
pub use index::Index;
pub use snapshot::Snapshot;
pub use stats::StatsSnapshot;
pub use store::{Item, Store, StoreConfig};
pub use value::IndexValue;
pub use wal::{Wal, WalEntry};

/// Operation types for index WAL records
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum IndexOp {
    Add = 1,
    Remove = 2,
}

impl IndexOp {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(IndexOp::Add),
            2 => Some(IndexOp::Remove),
            _ => None,
        }
    }
}
