//! Persistence layer — libSQL-backed storage for job records, job logs,
//! and the imported catalog.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{CatalogRecord, CatalogSink, JobStore};
