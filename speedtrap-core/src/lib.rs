pub mod config;
pub mod detection;
pub mod dispatch;
pub mod error;
pub mod estimation;
pub mod frame_buffer;
pub mod ledger;
pub mod logging;
pub mod notify;
pub mod pipeline;
pub mod runtime;
pub mod tracking;
pub mod video;

// Collaborator and I/O boundaries use anyhow; per-track failures use error::FinalizationError
pub use anyhow::Error;
pub use anyhow::Result;
