//! Error types for the operator process

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Reconciliation failed: {0}")]
    Engine(#[from] shardkeeper::Error),

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("CRD not installed. Please install the RedisCluster CRD first.")]
    CrdNotInstalled,

    #[error("Metrics registry error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl Error {
    /// Label used for the error counter.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Engine(e) => e.kind(),
            Error::Kube(_) => "kube",
            Error::CrdNotInstalled => "crd_not_installed",
            Error::Metrics(_) => "metrics",
        }
    }
}
