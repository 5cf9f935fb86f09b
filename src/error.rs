use crate::{
    clients::{azure, credentials, kubernetes},
    config,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Kubernetes(#[from] kubernetes::Error),

    #[error("API request failed: {0}")]
    Api(#[from] kube::Error),

    #[error(transparent)]
    Cloud(#[from] azure::Error),

    #[error(transparent)]
    Credentials(#[from] credentials::Error),

    #[error(transparent)]
    Config(#[from] config::Error),

    #[error("{0} has not been created yet")]
    NotCreated(&'static str),

    #[error("pod {name} failed ({reason}), last log lines:\n{logs}")]
    PodFailed {
        name: String,
        reason: String,
        logs: String,
    },

    #[error("pod {name} is in phase {phase}")]
    PodNotReady { name: String, phase: String },

    #[error("pod {name} terminated with phase {phase} before it was running")]
    PodTerminated { name: String, phase: String },

    #[error("persistent volume claim {name} is in phase {phase}")]
    ClaimNotBound { name: String, phase: String },

    #[error("volume snapshot {name} is not ready to use: {}", .message.as_deref().unwrap_or("no error reported"))]
    SnapshotNotReady {
        name: String,
        message: Option<String>,
    },

    #[error("persistent volume {volume} failed validation: {reason}")]
    VolumeValidation { volume: String, reason: String },

    #[error("the writer pod needs at least one volume")]
    NoVolumes,

    #[error("refusing to delete resource group {0} which was not created by this run")]
    ForeignResourceGroup(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
