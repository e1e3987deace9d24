//! Alert management
//!
//! - `manager`: per-series deduplication and lifecycle
//! - `history`: bounded history shared across series

pub mod history;
pub mod manager;

pub use history::{AlertHistory, HistoryStats};
pub use manager::AlertManager;
