//! Result codes shared by the topology engine and the container layer.
//!
//! Every failure path in the runtime collapses to one [`SpfError`]. The numeric
//! [`code()`](SpfError::code) is what travels back to the command issuer in the
//! acknowledgement packet, so the values are fixed.

/// Failure taxonomy of the runtime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SpfError {
    /// Generic failure.
    Failed,
    /// Malformed payload or a size smaller than the claimed sub-struct.
    BadParam,
    /// Feature compiled out or opcode not recognized.
    Unsupported,
    /// Operation not expected in the current context.
    Unexpected,
    /// Resource not ready yet.
    NotReady,
    /// More data is needed before the operation can complete.
    NeedMore,
    /// Allocation failure.
    NoMemory,
    /// Subgraph, module or port id absent.
    NotFound,
}

/// Result alias used across the runtime.
pub type SpfResult<T> = Result<T, SpfError>;

impl SpfError {
    /// Ack result code for this error. Success is `0` and is never produced here.
    pub fn code(self) -> u32 {
        match self {
            Self::Failed => 1,
            Self::BadParam => 2,
            Self::Unsupported => 3,
            Self::Unexpected => 5,
            Self::NotReady => 10,
            Self::NeedMore => 17,
            Self::NoMemory => 18,
            Self::NotFound => 19,
        }
    }

    /// Maps an ack result code back to an error. `0` maps to `None`.
    ///
    /// Unknown non-zero codes are reported as [`SpfError::Failed`].
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => None,
            2 => Some(Self::BadParam),
            3 => Some(Self::Unsupported),
            5 => Some(Self::Unexpected),
            10 => Some(Self::NotReady),
            17 => Some(Self::NeedMore),
            18 => Some(Self::NoMemory),
            19 => Some(Self::NotFound),
            _ => Some(Self::Failed),
        }
    }
}

impl core::fmt::Display for SpfError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Failed => write!(f, "operation failed"),
            Self::BadParam => write!(f, "bad parameter"),
            Self::Unsupported => write!(f, "unsupported operation"),
            Self::Unexpected => write!(f, "unexpected in current context"),
            Self::NotReady => write!(f, "not ready"),
            Self::NeedMore => write!(f, "need more data"),
            Self::NoMemory => write!(f, "out of memory"),
            Self::NotFound => write!(f, "entity not found"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for SpfError {}

/// Folds a result code into an accumulated one, keeping the first failure.
///
/// Several handlers keep going after a partial failure and report the first
/// error at the end.
pub fn accumulate(acc: &mut SpfResult<()>, next: SpfResult<()>) {
    if acc.is_ok() {
        *acc = next;
    }
}
