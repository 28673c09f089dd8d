//! The change-stream operation types this crate knows how to consume.

use std::fmt;

/// A MongoDB change-stream operation type, restricted to the ones this crate
/// can meaningfully drive a process off of.
///
/// `Delete` is deliberately excluded: a deleted document can never carry a
/// process subtree to observe, so no dependency may be configured to listen
/// for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationType {
    Insert,
    Update,
    Replace,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Insert => "insert",
            OperationType::Update => "update",
            OperationType::Replace => "replace",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raised when a change-stream event's `operationType` cannot be mapped onto
/// one of this crate's supported [`OperationType`]s (e.g. `delete`, `drop`,
/// `invalidate` — events this crate never subscribes to but which the driver
/// still models).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnsupportedOperationType;

impl TryFrom<mongodb::change_stream::event::OperationType> for OperationType {
    type Error = UnsupportedOperationType;

    fn try_from(value: mongodb::change_stream::event::OperationType) -> Result<Self, Self::Error> {
        use mongodb::change_stream::event::OperationType as DriverOp;
        match value {
            DriverOp::Insert => Ok(OperationType::Insert),
            DriverOp::Update => Ok(OperationType::Update),
            DriverOp::Replace => Ok(OperationType::Replace),
            _ => Err(UnsupportedOperationType),
        }
    }
}
