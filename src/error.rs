use thiserror::Error;

/// Errors produced by user stage code.
///
/// `compute` implementations return whatever context-rich error they like;
/// the engine wraps it into [`PullError::Compute`] together with the label of
/// the failing node.
pub use anyhow::Error as StageError;

/// Errors raised by graph-mutating calls.
///
/// A failed wiring call leaves the graph exactly as it was before the call.
/// These errors are never used for control flow inside the update protocol;
/// they always surface to the caller that attempted the mutation.
#[derive(Debug, Error)]
pub enum WiringError {
    #[error("node '{node}' has no input named '{name}'")]
    NoSuchInput { node: String, name: String },

    #[error("node '{node}' has no output named '{name}'")]
    NoSuchOutput { node: String, name: String },

    #[error("node '{node}' has only {count} inputs, index {index} is out of range")]
    NotEnoughInputs {
        node: String,
        index: usize,
        count: usize,
    },

    #[error("node '{node}' has only {count} outputs, index {index} is out of range")]
    NotEnoughOutputs {
        node: String,
        index: usize,
        count: usize,
    },

    #[error(
        "value of type '{found}' cannot be assigned to slot '{slot}' of type '{expected}' on node '{node}'"
    )]
    Assignment {
        node: String,
        slot: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("node '{node}' already has a slot named '{name}'")]
    DuplicateSlot { node: String, name: String },

    #[error("input '{name}' on node '{node}' is not connected to anything")]
    EmptySource { node: String, name: String },
}

/// Errors escaping from a pull through the graph.
#[derive(Debug, Error)]
pub enum PullError {
    /// A stage's `compute` failed. The outputs of the failing node stay
    /// marked clean, so the next pull will not retry automatically; callers
    /// that want a retry mark the relevant output dirty again.
    #[error("stage '{0}':\n{1}")]
    Compute(String, anyhow::Error),
}
