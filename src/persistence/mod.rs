//! Persistence layer
//!
//! Translates runs, work items, and failures to and from the store.

mod gateway;
mod records;

pub use gateway::{CreateOutcome, FinishOutcome, PersistenceGateway, DEFAULT_MAX_TEXT_LEN};
