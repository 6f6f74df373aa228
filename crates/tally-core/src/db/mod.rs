//! Local database layer: connection management and migrations

mod connection;
mod migrations;

pub use connection::Database;
