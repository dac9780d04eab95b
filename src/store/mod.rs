//! Persistence layer: libSQL-backed storage for conversations,
//! handoffs, verification challenges and blocked contacts.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{BlockedContact, Database};
