//! ---
//! fleet_section: "02-launch-orchestration"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Launch failure taxonomy."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use std::fmt;

use r_fleet_model::Node;
use r_fleet_supervisor::Interrupted;
use strum::{AsRefStr, Display, IntoStaticStr};
use thiserror::Error;

use crate::drivers::DriverError;

/// Boxed underlying cause of a failure.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// How the caller should react to a failed launch step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum FailureKind {
    /// Non-recoverable; the launch is abandoned.
    Fatal,
    /// Transient; the same work may be attempted again.
    CanRetry,
    /// Cancelled from outside; not an error.
    Interrupted,
    /// The chosen region cannot host the node; another may.
    UnavailableRegion,
}

/// A classified launch failure, optionally carrying the node it affected.
#[derive(Error)]
#[error("{kind} launch failure: {message}")]
pub struct LaunchFailure {
    kind: FailureKind,
    message: String,
    node: Option<Box<Node>>,
    #[source]
    source: Option<BoxError>,
}

impl fmt::Debug for LaunchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LaunchFailure")
            .field("kind", &self.kind)
            .field("message", &self.message)
            .field("node", &self.node.as_ref().map(|node| node.id.as_str()))
            .field("source", &self.source)
            .finish()
    }
}

/// Result of a single pipeline step.
pub type StepResult<T> = Result<T, LaunchFailure>;

impl LaunchFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            node: None,
            source: None,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Fatal, message)
    }

    pub fn can_retry(message: impl Into<String>) -> Self {
        Self::new(FailureKind::CanRetry, message)
    }

    pub fn interrupted(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Interrupted, message)
    }

    pub fn unavailable_region(message: impl Into<String>) -> Self {
        Self::new(FailureKind::UnavailableRegion, message)
    }

    /// Attach the node the failure applies to, replacing any previous one.
    pub fn with_node(mut self, node: Node) -> Self {
        self.node = Some(Box::new(node));
        self
    }

    /// Attach the node unless one is already attached.
    pub fn or_node(self, node: Option<&Node>) -> Self {
        match (&self.node, node) {
            (None, Some(node)) => self.with_node(node.clone()),
            _ => self,
        }
    }

    pub fn with_source(mut self, source: impl Into<BoxError>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn kind(&self) -> FailureKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn node(&self) -> Option<&Node> {
        self.node.as_deref()
    }

    pub fn is_fatal(&self) -> bool {
        self.kind == FailureKind::Fatal
    }

    pub fn is_interrupted(&self) -> bool {
        self.kind == FailureKind::Interrupted
    }

    /// Classify an error caught while doing `what`. Launch failures keep
    /// their kind, interruptions map to `interrupted`, driver errors follow
    /// [`FailureKind::from`], anything else is fatal.
    pub(crate) fn classify(error: BoxError, what: &str) -> Self {
        let error = match error.downcast::<LaunchFailure>() {
            Ok(failure) => return *failure,
            Err(error) => error,
        };
        let error = match error.downcast::<Interrupted>() {
            Ok(_) => return Self::interrupted(format!("{}: interrupted", what)),
            Err(error) => error,
        };
        match error.downcast::<DriverError>() {
            Ok(driver) => Self::from_driver(*driver, what),
            Err(error) => Self::fatal(format!("{}: {}", what, error)).with_source(error),
        }
    }

    /// Classify a driver error raised while doing `what`.
    pub fn from_driver(error: DriverError, what: &str) -> Self {
        let kind = FailureKind::from(&error);
        Self::new(kind, format!("{}: {}", what, error)).with_source(error)
    }
}

impl From<&DriverError> for FailureKind {
    fn from(error: &DriverError) -> Self {
        match error {
            DriverError::RegionUnavailable { .. } => FailureKind::UnavailableRegion,
            DriverError::Transient(_) | DriverError::Timeout(_) => FailureKind::CanRetry,
            DriverError::Interrupted => FailureKind::Interrupted,
            DriverError::Failed(_)
            | DriverError::CloudNotFound(_)
            | DriverError::ForeignDelegate { .. }
            | DriverError::Repository(_)
            | DriverError::Io(_) => FailureKind::Fatal,
        }
    }
}

impl From<Interrupted> for LaunchFailure {
    fn from(_: Interrupted) -> Self {
        Self::interrupted("launch interrupted")
    }
}
