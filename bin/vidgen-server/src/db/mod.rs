//! Database layer.
//!
//! The durable [`vidgen_core::TaskLedger`] used by the server is
//! [`sqlite::SqliteStore`]. To move to another database, implement
//! `TaskLedger` for the new store and change the concrete type in
//! [`crate::state::AppState`].

pub mod sqlite;
