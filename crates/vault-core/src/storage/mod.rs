//! Storage collaborator for the vault
//!
//! The core only depends on the [`Storage`] / [`Transaction`] traits.
//! [`SqliteStorage`] is the bundled implementation.

mod sqlite;
mod traits;

pub use sqlite::{SqliteStorage, SqliteTransaction};
pub use traits::{Row, Storage, Transaction, Value};
