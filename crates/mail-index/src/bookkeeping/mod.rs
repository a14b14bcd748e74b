//! Persistent last-synced bookkeeping and the folder exclusivity flag
//!
//! One record per (context, user, account, folder). Every mutation that
//! decides ownership is a single conditional statement, never a read
//! followed by a blind write.

mod sqlite;
mod timing;
mod traits;

pub use sqlite::SqliteBookkeeping;
pub use timing::staleness_elapsed;
pub use traits::{AcquireOptions, Acquisition, SyncBookkeeping};
