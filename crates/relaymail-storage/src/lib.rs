//! relaymail Storage - Persistence for domains, jobs and sends
//!
//! Repositories are traits with a PostgreSQL implementation (`Db*`) and an
//! in-process implementation ([`MemoryStore`]) used for local runs and tests.

pub mod db;
pub mod memory;
pub mod models;
pub mod repository;

pub use db::DatabasePool;
pub use memory::MemoryStore;
pub use models::*;
pub use repository::*;
