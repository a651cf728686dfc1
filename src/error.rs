//! Error types for mutator-side handle operations.
//!
//! GC-phase scans never fail; every recoverable error in this crate
//! originates from a handle-creation or bucket-management path driven by
//! the mutator.

use thiserror::Error;

/// Errors reported by fallible handle-table operations.
///
/// # Examples
///
/// ```
/// use holdfast::{HandleError, HandleResult};
///
/// let failure: HandleResult<()> = Err(HandleError::OutOfResources);
/// assert_eq!(
///     failure.unwrap_err().to_string(),
///     "out of resources while growing handle storage",
/// );
/// ```
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleError {
    /// Storage growth failed while creating a bucket, growing the bucket
    /// directory, or allocating the dependent-scan contexts. Partially
    /// built structures are rolled back before this is returned.
    #[error("out of resources while growing handle storage")]
    OutOfResources,
    /// The caller supplied an invalid handle type, an invalid
    /// variable-strength mask, or a handle of the wrong type.
    #[error("invalid argument supplied to handle operation")]
    InvalidArgument,
    /// A handle table's slot free-list is empty and the table has reached
    /// its configured capacity. Public entry points surface this as
    /// [`HandleError::OutOfResources`].
    #[error("handle table slot free-list exhausted")]
    HandleExhausted,
}

/// Result type for handle operations.
pub type HandleResult<T> = Result<T, HandleError>;
