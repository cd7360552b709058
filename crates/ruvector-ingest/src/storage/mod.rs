//! Persistent storage: relational metadata and the reference chunk store

pub mod database;
pub mod doc_store;

pub use database::MetadataDb;
pub use doc_store::SqliteDocStore;
