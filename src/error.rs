use thiserror::Error;

/// Failures originating inside the analysis core itself.
///
/// Errors produced by caller-supplied operations stay opaque and travel as
/// `anyhow::Error`; this enum covers only the core's own failure surface.
#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("serialization error for key '{key}': {message}")]
    Serialization { key: String, message: String },

    #[error("queued analysis '{key}' was dropped before execution")]
    ChannelClosed { key: String },
}

impl AnalysisError {
    pub fn serialization(key: impl Into<String>, message: impl Into<String>) -> Self {
        AnalysisError::Serialization {
            key: key.into(),
            message: message.into(),
        }
    }
}
