//! Controller-specific error types.
//!
//! `ControllerError` covers startup and the runtime around the controllers.
//! The reconcile path uses `ActuatorError` (returned by actuators) and
//! `ReconcileError` (returned by the generic reconciler).

use azure_client::AzureError;
use kube::Error as KubeError;
use thiserror::Error;

/// Errors that can occur while starting or running the remedy controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Azure API error
    #[error("Azure error: {0}")]
    Azure(#[from] AzureError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Metrics endpoint failure
    #[error("Metrics error: {0}")]
    Metrics(String),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),
}

impl From<prometheus::Error> for ControllerError {
    fn from(e: prometheus::Error) -> Self {
        ControllerError::Metrics(e.to_string())
    }
}

/// Errors returned by actuators.
#[derive(Debug, Error)]
pub enum ActuatorError {
    /// Kubernetes API error
    #[error(transparent)]
    Kube(#[from] KubeError),

    /// Azure API error
    #[error(transparent)]
    Azure(#[from] AzureError),

    /// Status could not be serialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Error with a message describing what was being done
    #[error("{context}: {source}")]
    Context {
        /// What was being done
        context: String,
        /// Underlying error
        #[source]
        source: Box<ActuatorError>,
    },
}

impl ActuatorError {
    /// Wrap the error with a message describing what was being done.
    #[must_use]
    pub fn context(self, context: impl Into<String>) -> Self {
        ActuatorError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }
}

/// Errors returned by the generic reconciler.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// The object could not be read
    #[error("could not get object: {0}")]
    Get(#[source] KubeError),

    /// `should_finalize` failed
    #[error("could not check if the object should be finalized: {0}")]
    ShouldFinalize(#[source] ActuatorError),

    /// `create_or_update` failed
    #[error("could not reconcile object creation or update: {0}")]
    CreateOrUpdate(#[source] ActuatorError),

    /// `delete` failed
    #[error("could not reconcile object deletion: {0}")]
    Delete(#[source] ActuatorError),

    /// `delete` on an object that is already gone failed
    #[error("could not ensure object deletion: {0}")]
    EnsureDeleted(#[source] ActuatorError),

    /// The finalizer could not be added
    #[error("could not add finalizer: {0}")]
    AddFinalizer(#[source] KubeError),

    /// The finalizer could not be removed
    #[error("could not remove finalizer: {0}")]
    RemoveFinalizer(#[source] KubeError),
}
