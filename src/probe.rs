use std::fmt::{Display, Formatter};
use std::path::PathBuf;

use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::error::{PolicydError, PolicydResult};
use crate::observability;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome", content = "detail")]
pub enum VerificationOutcome {
    Allowed,
    Denied,
    Error(String),
}

impl VerificationOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Allowed => "allowed",
            Self::Denied => "denied",
            Self::Error(_) => "error",
        }
    }

    /// The policy decision observed, if the probe reached one.
    pub fn enforcement(&self) -> Option<Enforcement> {
        match self {
            Self::Allowed => Some(Enforcement::Allowed),
            Self::Denied => Some(Enforcement::Denied),
            Self::Error(_) => None,
        }
    }
}

impl Display for VerificationOutcome {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error(detail) => write!(f, "error ({})", detail),
            other => write!(f, "{}", other.label()),
        }
    }
}

/// Enforcement a probe is expected to observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Enforcement {
    Allowed,
    Denied,
}

impl Enforcement {
    pub fn label(self) -> &'static str {
        match self {
            Self::Allowed => "allowed",
            Self::Denied => "denied",
        }
    }

    fn matches(self, outcome: &VerificationOutcome) -> bool {
        outcome.enforcement() == Some(self)
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub user_domain: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("user_domain", &self.user_domain)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    Domain(String),
    Project { name: String, domain: String },
}

/// One addressable endpoint of the deployed service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    pub label: String,
    pub endpoint: String,
    pub ca_cert: Option<PathBuf>,
}

/// A privileged call whose authorization is governed by the override.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOperation {
    pub name: String,
    pub method: String,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationError {
    Forbidden(String),
    Transport(String),
}

pub trait IdentitySession {
    fn perform(&self, operation: &ProbeOperation) -> Result<(), OperationError>;
}

pub trait IdentityClient: Send + Sync {
    fn open_session(
        &self,
        target: &ProbeTarget,
        credentials: &Credentials,
        scope: &Scope,
    ) -> Result<Box<dyn IdentitySession>, OperationError>;
}

/// Opens a session and attempts `operation`, classifying the response.
#[instrument(
    name = "probe.run",
    skip(client, credentials, scope),
    fields(target = %target.label, operation = %operation.name)
)]
pub fn run_probe(
    client: &dyn IdentityClient,
    target: &ProbeTarget,
    credentials: &Credentials,
    scope: &Scope,
    operation: &ProbeOperation,
) -> VerificationOutcome {
    let outcome = match client
        .open_session(target, credentials, scope)
        .and_then(|session| session.perform(operation))
    {
        Ok(()) => VerificationOutcome::Allowed,
        Err(OperationError::Forbidden(_)) => VerificationOutcome::Denied,
        Err(OperationError::Transport(message)) => VerificationOutcome::Error(message),
    };

    match &outcome {
        VerificationOutcome::Error(message) => {
            warn!(error = %message, "probe failed before reaching a policy decision")
        }
        other => info!(outcome = other.label(), "probe completed"),
    }
    observability::record_probe_outcome(&operation.name, outcome.label());
    outcome
}

/// Checks a probe outcome against the expected enforcement. An `Error`
/// outcome is surfaced as a transport failure, never as a policy result.
pub fn expect_enforcement(
    outcome: &VerificationOutcome,
    expected: Enforcement,
    target: &ProbeTarget,
    operation: &ProbeOperation,
) -> PolicydResult<()> {
    if let VerificationOutcome::Error(message) = outcome {
        return Err(PolicydError::transport(format!(
            "probe {} at {} failed: {}",
            operation.name, target.label, message
        )));
    }
    if expected.matches(outcome) {
        return Ok(());
    }
    Err(PolicydError::UnexpectedOutcome {
        target: target.label.clone(),
        operation: operation.name.clone(),
        expected: expected.label().to_string(),
        observed: outcome.label().to_string(),
    })
}
