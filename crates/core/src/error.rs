/// Result alias that carries the custom [`VisualiserError`] type.
pub type Result<T> = std::result::Result<T, VisualiserError>;

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum VisualiserError {
    /// Free-form error surfaced to the operator as-is.
    #[error("{0}")]
    Message(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// A caller handed a pipeline stage data it cannot work with.
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    /// Configuration rejected at the boundary.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// No usable audio input. Fatal at startup.
    #[error("audio input unavailable: {0}")]
    AudioUnavailable(String),
    #[error("fft failed: {0}")]
    Fft(#[from] realfft::FftError),
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    /// The broker refused the session or spoke something we do not understand.
    #[error("broker error: {0}")]
    Broker(String),
    /// The broker connection went away underneath us.
    #[error("broker connection closed")]
    ConnectionClosed,
}

impl VisualiserError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }

    pub fn config<T: Into<String>>(msg: T) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// True for errors that mean the transport is gone and a reconnect is due.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Broker(_) | Self::ConnectionClosed)
    }
}

impl From<&str> for VisualiserError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for VisualiserError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}
