//! qmanager Common Library
//!
//! Storage, validation, process invocation and domain types shared by the
//! qmanager console.

pub mod db;
pub mod error;
pub mod process;
pub mod store;
pub mod types;
pub mod validator;

// Re-export commonly used types
pub use db::Database;
pub use error::{Error, Result};
pub use process::{CommandOutcome, Executor, ProcessInvoker, SystemExecutor};
pub use store::{Filter, Pagination, Row, Store, Value, Values};
pub use types::*;
pub use validator::Validator;

/// qmanager version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
