use podflux_k8s::SelectorParseError;
use thiserror::Error;

pub type IngestResult<T> = Result<T, IngestError>;

/// Errors surfaced synchronously from construction and configuration paths.
///
/// Steady-state failures after a successful start (a namespace watch error,
/// a single container's stream failing to open or read) are logged and
/// degrade only the affected scope; they never appear here.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("invalid label selector: {0}")]
    InvalidSelector(#[from] SelectorParseError),

    #[error("failed to build kubernetes client: {0}")]
    ClientBuild(#[source] anyhow::Error),

    #[error("kubernetes api request failed: {0}")]
    Api(#[from] kube::Error),
}
