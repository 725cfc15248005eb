//! Stable worker role identifiers.
//!
//! Role ids travel on the wire, so every node must derive the same id for
//! the same stage. Metrics stream stages derive theirs from the stream id
//! and the stage kind; custom stages pick an explicit id.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Numeric identity of a worker graph stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RoleId(pub u32);

/// Stages generated for a metrics stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    Aggregate,
    Persist,
    Hour,
    Day,
}

impl StageKind {
    fn code(self) -> u32 {
        match self {
            StageKind::Aggregate => 1,
            StageKind::Persist => 2,
            StageKind::Hour => 3,
            StageKind::Day => 4,
        }
    }

    pub fn suffix(self) -> &'static str {
        match self {
            StageKind::Aggregate => "aggregate",
            StageKind::Persist => "persist",
            StageKind::Hour => "hour",
            StageKind::Day => "day",
        }
    }
}

/// Largest stream id; the low four bits of a role id hold the stage kind.
pub const MAX_STREAM_ID: u32 = u32::MAX >> 4;

impl RoleId {
    /// Role id of a metrics stream stage: `stream_id << 4 | kind`.
    pub fn for_stream(stream_id: u32, kind: StageKind) -> Result<Self, ConfigError> {
        if stream_id > MAX_STREAM_ID {
            return Err(ConfigError::Invalid(format!(
                "stream id {stream_id} exceeds {MAX_STREAM_ID}"
            )));
        }
        Ok(RoleId((stream_id << 4) | kind.code()))
    }

    pub fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for RoleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
