//! error: per-track finalization failures and their kinds

use std::fmt;

use thiserror::Error;

/// Coarse failure class used in logs and run statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The frame source failed; ends the ingestion loop.
    Ingestion,
    /// Regression, frame extraction or clip encoding failed for one track.
    Finalization,
    /// Alert delivery failed for one track.
    Notification,
    /// Ledger append failed for one track.
    Persistence,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ingestion => "ingestion",
            Self::Finalization => "finalization",
            Self::Notification => "notification",
            Self::Persistence => "persistence",
        })
    }
}

/// Why one track's dispatch stopped. The track is discarded either way.
#[derive(Debug, Error)]
pub enum FinalizationError {
    #[error("speed regression failed: {0:#}")]
    Regression(anyhow::Error),

    #[error("frames {first}..={last} are no longer buffered")]
    FramesUnavailable { first: u64, last: u64 },

    #[error("clip encoding failed: {0:#}")]
    Clip(anyhow::Error),

    #[error("notification failed: {0:#}")]
    Notification(anyhow::Error),

    #[error("ledger append failed: {0}")]
    Persistence(#[from] std::io::Error),
}

impl FinalizationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Regression(_) | Self::FramesUnavailable { .. } | Self::Clip(_) => {
                ErrorKind::Finalization
            }
            Self::Notification(_) => ErrorKind::Notification,
            Self::Persistence(_) => ErrorKind::Persistence,
        }
    }
}
