//! Error types shared by circuit builders, step cursors, and engines.

use thiserror::Error;

/// All failure modes reported while building or executing a circuit.
///
/// Builder variants carry the index of the step that would have been
/// appended; a failed append leaves the circuit unchanged.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum Error {
    /// A circuit was requested with no qudits or a dimension below two.
    #[error("invalid circuit shape: {what} is {found}, minimum {min}")]
    InvalidShape {
        what: &'static str,
        found: usize,
        min: usize,
    },

    /// An index fell outside its declared range, or a control collided with
    /// a target.
    #[error("step {step}: invalid {role} index {index} (bound {bound})")]
    InvalidIndex {
        step: usize,
        role: &'static str,
        index: usize,
        bound: usize,
    },

    /// The same index appeared twice in one control or target list.
    #[error("step {step}: duplicate {role} index {index}")]
    DuplicateIndex {
        step: usize,
        role: &'static str,
        index: usize,
    },

    /// An instruction was given an empty control or target list.
    #[error("step {step}: empty {role} set")]
    EmptyTargetSet { step: usize, role: &'static str },

    /// The referenced qudit has already been consumed by a measurement.
    #[error("step {step}: qudit {qudit} already measured")]
    AlreadyMeasured { step: usize, qudit: usize },

    /// An operand matrix was not square, or its size did not match the
    /// dimension implied by the qudits it acts on.
    #[error("step {step}: operand is {rows}x{cols}, expected {expected}x{expected}")]
    ShapeMismatch {
        step: usize,
        rows: usize,
        cols: usize,
        expected: usize,
    },

    /// Two distinct operand matrices mapped to the same content-hash key,
    /// or a recorded key was missing from the operand table.
    #[error("step {step}: operand table integrity violation on key {key:#018x}")]
    IntegrityViolation { step: usize, key: u64 },

    /// The operation is recognized but deliberately not provided.
    #[error("unsupported operation: {what}")]
    UnsupportedOperation { what: &'static str },

    /// A step cursor was advanced or dereferenced past the last step.
    #[error("cursor exhausted at position {position} of {len}")]
    InvalidCursor { position: usize, len: usize },

    /// The executed step belongs to a circuit other than the engine's.
    #[error("step belongs to a different circuit than this engine")]
    BoundMismatch,

    /// A noise channel's qudit dimension disagrees with the circuit's.
    #[error("noise channel dimension {channel} does not match circuit dimension {circuit}")]
    ChannelMismatch { channel: usize, circuit: usize },
}

pub type Result<T> = std::result::Result<T, Error>;
