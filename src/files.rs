use std::fmt::{Display, Formatter};

use tracing::info;

use crate::error::PolicydResult;
use crate::model::{application_status, DeploymentModel, RemoteFile};
use crate::poll::{wait_until, PollOptions};

/// Where the charm for `service` drops override entries on each unit.
pub fn policy_path(service: &str, entry: &str) -> String {
    format!("/etc/{}/policy.d/{}", service, entry)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileCondition {
    Contains(String),
    Missing,
}

impl FileCondition {
    fn holds(&self, file: &RemoteFile) -> bool {
        match (self, file) {
            (Self::Contains(expected), RemoteFile::Present(content)) => {
                content.contains(expected.as_str())
            }
            (Self::Missing, RemoteFile::Missing) => true,
            _ => false,
        }
    }

    /// True only when every unit satisfies the condition. Partial
    /// propagation, or an empty fleet, is not yet satisfied.
    pub fn holds_everywhere(&self, observed: &[(String, RemoteFile)]) -> bool {
        !observed.is_empty() && observed.iter().all(|(_, file)| self.holds(file))
    }
}

impl Display for FileCondition {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Contains(expected) => write!(f, "containing {:?}", expected),
            Self::Missing => write!(f, "missing"),
        }
    }
}

pub fn observe_file(
    model: &dyn DeploymentModel,
    application: &str,
    path: &str,
) -> PolicydResult<Vec<(String, RemoteFile)>> {
    let status = application_status(model, application)?;
    status
        .units
        .iter()
        .map(|unit| {
            model
                .read_unit_file(&unit.name, path)
                .map(|file| (unit.name.clone(), file))
        })
        .collect()
}

pub fn await_file(
    model: &dyn DeploymentModel,
    application: &str,
    path: &str,
    condition: &FileCondition,
    options: PollOptions,
) -> PolicydResult<Vec<(String, RemoteFile)>> {
    let description = format!("file {} {} on every unit of {}", path, condition, application);
    info!(application = application, path = path, condition = %condition, "awaiting remote file");
    wait_until(
        &description,
        options,
        || observe_file(model, application, path),
        |observed| condition.holds_everywhere(observed),
    )
}

pub fn await_file_contains(
    model: &dyn DeploymentModel,
    application: &str,
    path: &str,
    expected: &str,
    options: PollOptions,
) -> PolicydResult<Vec<(String, RemoteFile)>> {
    await_file(
        model,
        application,
        path,
        &FileCondition::Contains(expected.to_string()),
        options,
    )
}

pub fn await_file_missing(
    model: &dyn DeploymentModel,
    application: &str,
    path: &str,
    options: PollOptions,
) -> PolicydResult<Vec<(String, RemoteFile)>> {
    await_file(model, application, path, &FileCondition::Missing, options)
}
