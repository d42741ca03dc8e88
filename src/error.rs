use tracing::error;

#[derive(Debug)]
pub struct AppError(pub &'static str);

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for AppError {
    fn description(&self) -> &str {
        self.0
    }
}

/// Failures talking to the CRM manager service.
#[derive(Debug, thiserror::Error)]
pub enum CrmError {
    #[error("crm request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("crm responded with {status}: {message}")]
    Api { status: u16, message: String },
    #[error("failed to decode crm response: {0}")]
    Decode(String),
    #[error("{0} not found")]
    NotFound(&'static str),
}

impl CrmError {
    /// Message suitable for relaying to the caller through the LLM.
    pub fn user_message(&self) -> String {
        match self {
            CrmError::Api { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} not set")]
    Missing(&'static str),
    #[error("{name} is invalid: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// Failures producing or uploading a call recording.
#[derive(Debug, thiserror::Error)]
pub enum RecordingError {
    #[error("failed to encode wav: {0}")]
    Encode(#[from] hound::Error),
    #[error("invalid storage endpoint: {0}")]
    Endpoint(String),
    #[error("failed to sign upload: {0}")]
    Signing(String),
    #[error("upload request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("storage responded with {status}: {body}")]
    Rejected { status: u16, body: String },
}

pub async fn handle_error(e: impl std::error::Error) {
    error!("ERROR: {e}")
}
