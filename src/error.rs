use thiserror::Error;

/// Synchronous action failures. Precondition and dependency-block errors
/// leave the store untouched; invariant errors indicate a modeling bug.
#[derive(Clone, Debug, PartialEq, Error)]
pub enum ActionError {
    #[error("set {0} not found")]
    UnknownSet(u64),
    #[error("station {0} is not registered")]
    UnknownStation(u32),
    #[error("stream {0} is not registered")]
    UnknownStream(u32),
    #[error("set {set_id}: {message}")]
    Precondition { set_id: u64, message: String },
    #[error("set {set_id} has dependents that already progressed: {dependents:?}")]
    DependentSetsProgressed { set_id: u64, dependents: Vec<u64> },
    #[error("invariant violation on set {set_id}: {message}")]
    Invariant { set_id: u64, message: String },
    #[error("transaction {0} not found")]
    UnknownTransaction(u64),
}

impl ActionError {
    pub fn precondition(set_id: u64, message: impl Into<String>) -> Self {
        ActionError::Precondition {
            set_id,
            message: message.into(),
        }
    }
}

/// Reconciliation aborts. An invariant violation suspends the affected
/// record's automatic reconciliation instead of corrupting further records.
#[derive(Clone, Debug, PartialEq, Error)]
pub enum ReconcileError {
    #[error("invariant violation on set {set_id}: {message}")]
    Invariant { set_id: u64, message: String },
}

impl From<ActionError> for ReconcileError {
    fn from(err: ActionError) -> Self {
        match err {
            ActionError::Invariant { set_id, message } => {
                ReconcileError::Invariant { set_id, message }
            }
            other => ReconcileError::Invariant {
                set_id: 0,
                message: other.to_string(),
            },
        }
    }
}

#[derive(Clone, Debug, PartialEq, Error)]
pub enum SnapshotError {
    #[error("snapshot payload malformed: {0}")]
    Malformed(String),
}
