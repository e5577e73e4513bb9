use controller_runtime::ReconcileError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StdError {
    #[error("JsonSerializationError: {0}")]
    JsonSerializationError(#[source] serde_json::Error),

    #[error("Kube Error: {0}")]
    KubeError(#[source] kube::Error),

    #[error("MetadataMissing: {0}")]
    MetadataMissing(String),

    #[error("InvalidArgument: {0}")]
    InvalidArgument(String),

    #[error("CryptoError: {0}")]
    CryptoError(String),

    #[error("TlsError: {0}")]
    TlsError(String),

    #[error("HttpError: {0}")]
    HttpError(String),
}

impl StdError {
    pub fn metric_label(&self) -> String {
        format!("{self:?}").to_lowercase()
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Standard Error: {0}")]
    StdError(#[source] StdError),
}

impl Error {
    pub fn metric_label(&self) -> String {
        match self {
            Error::StdError(e) => e.metric_label(),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Boundary mapping into the dispatcher's classification. Kubernetes API
/// failures and transport errors retry with backoff; bad inputs do not.
impl From<Error> for ReconcileError {
    fn from(err: Error) -> Self {
        match err {
            Error::StdError(StdError::InvalidArgument(msg)) => ReconcileError::PermanentDeny(msg),
            Error::StdError(e) => ReconcileError::Transient(e.to_string()),
        }
    }
}

pub fn kube_err(e: kube::Error) -> Error {
    Error::StdError(StdError::KubeError(e))
}
