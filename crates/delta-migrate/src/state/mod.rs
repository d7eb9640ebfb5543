//! Run-state persistence.
//!
//! Runs, leases and checkpoints are stored through a [`StateBackend`]. The
//! backend is chosen at startup and shared as `Arc<dyn StateBackend>`.

mod backend;
mod document;
mod file;
mod memory;
mod postgres;

pub use backend::StateBackend;
pub use file::FileStateBackend;
pub use memory::MemoryStateBackend;
pub use postgres::PgStateBackend;
