use crate::credential::CredentialError;
use reqwest::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("no credential available: {0}")]
    NoCredential(#[source] CredentialError),

    #[error("re-authentication failed: {0}")]
    Refresh(#[source] CredentialError),

    #[error("API key still rejected after {attempts} refresh(es)")]
    AuthExpired { attempts: u32 },

    #[error("unexpected status {status}: {body}")]
    UnexpectedStatus { status: StatusCode, body: String },

    #[error("API key is not a valid header value")]
    InvalidToken,

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("failed to write output: {0}")]
    Output(#[from] std::io::Error),
}
