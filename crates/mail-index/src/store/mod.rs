//! Read-only access to the live mail store
//!
//! The engine never mutates the store. The trait keeps the folder listing and
//! message fetches narrow so any backend (IMAP proxy, local database, test
//! fixture) can stand behind it.

mod memory;
mod traits;

pub use memory::InMemoryMailStore;
pub use traits::MailStoreReader;
