use crate::network::types::layer::Layer;
use thiserror::Error;

/// Why an operation ended in [`DivertError::Canceled`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The caller's own cancellation token fired.
    Token,
    /// The service was disposed while the operation was in flight.
    Disposed,
}

/// Operations attempted against an object in the wrong state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidState {
    /// A layer-specific projection was requested on a record of another layer.
    #[error("address belongs to the {} layer, not {expected:?}", layer_name(.actual))]
    WrongLayer { actual: u8, expected: Layer },

    /// The service has been disposed.
    #[error("service has been disposed")]
    Disposed,

    /// The underlying driver handle has already been closed.
    #[error("handle is closed")]
    Closed,

    /// A result was consumed twice or after its engine was recycled.
    #[error("operation result is no longer available")]
    Stale,
}

#[derive(Debug, Error)]
pub enum DivertError {
    /// Argument outside its documented range or otherwise malformed
    #[error("invalid argument `{name}`: {reason}")]
    ArgumentInvalid { name: &'static str, reason: String },

    /// The driver rejected a filter while compiling or opening
    #[error("{message} ({position}): ...{remainder}")]
    FilterRejected {
        message: String,
        position: usize,
        remainder: String,
    },

    /// Non-zero native status code
    #[error("native error {code}")]
    Native { code: u32 },

    /// Operation was canceled before or during submission
    #[error("operation canceled ({0:?})")]
    Canceled(CancelReason),

    /// Operation not allowed in the current state
    #[error("invalid state: {0}")]
    InvalidState(#[from] InvalidState),

    /// I/O errors from file operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration could not be parsed
    #[error("failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Configuration could not be serialized
    #[error("failed to serialize configuration: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),
}

fn layer_name(raw: &u8) -> String {
    match Layer::from_raw(u32::from(*raw)) {
        Some(layer) => format!("{layer:?}"),
        None => format!("unknown ({raw})"),
    }
}

/// A convenient Result type alias using `DivertError`.
pub type Result<T> = std::result::Result<T, DivertError>;

impl DivertError {
    /// Creates a new invalid argument error with a descriptive reason.
    pub fn invalid_argument(name: &'static str, reason: impl Into<String>) -> Self {
        Self::ArgumentInvalid {
            name,
            reason: reason.into(),
        }
    }

    /// Creates a native error from a raw status code.
    pub fn native(code: u32) -> Self {
        Self::Native { code }
    }

    /// Returns the raw native status code, if this error carries one.
    pub fn native_code(&self) -> Option<u32> {
        match self {
            Self::Native { code } => Some(*code),
            _ => None,
        }
    }

    /// Returns `true` if the operation ended because of a cancellation.
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled(_))
    }
}
