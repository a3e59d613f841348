//! caseflow-store
//!
//! The remote store as seen by the sync coordinator: an async trait with
//! tenant-scoped, conditional operations and a push change feed, plus an
//! in-process implementation. The Postgres implementation lives in
//! `caseflow-db`.

mod clock;
mod error;
mod memory;
mod remote;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::StoreError;
pub use memory::MemoryStore;
pub use remote::{
    AmendmentWrite, ChangeFeed, FeedItem, HistoryAppend, LandedWrite, RemoteStore, StatusWrite,
    WriteLookup,
};
