//! SQLite persistence for the extension host.
//!
//! One database file holds the permission grants and the persistent storage
//! areas (`local`, `sync`). The `session` area never touches disk.
//!
//! ```no_run
//! use extension_host::database::Database;
//!
//! let db = Database::open("extension-host.db").expect("failed to open database");
//! let grants: i64 = db
//!     .connection()
//!     .query_row("SELECT COUNT(*) FROM permission_grants", [], |row| row.get(0))
//!     .expect("query");
//! ```

pub mod connection;
pub mod migrations;

pub use connection::Database;
