//! Persistence layer: libSQL-backed transaction and dead-letter stores.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlStore;
pub use traits::{DeadLetterStore, TransactionStore};
