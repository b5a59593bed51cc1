//! Secret records: persisted form, summaries and update requests

mod store;
mod types;

pub(crate) use store::{fold_case, SecretStore};
pub use types::*;
