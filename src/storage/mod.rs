/// Persistence layer
///
/// Single SQLite database shared by the queue, the executor and every
/// orchestrator process pointed at the same file.

pub mod database;

pub use database::Database;
