use std::fmt::{Display, Formatter};

use tracing::info;

use crate::error::PolicydResult;
use crate::model::{application_status, await_all_units_idle, DeploymentModel};
use crate::poll::{wait_until, PollOptions};

/// Prefix shown on every unit while a valid override is active.
pub const OVERRIDE_ACTIVE_PREFIX: &str = "PO:";
/// Prefix shown when the attached override could not be applied.
pub const OVERRIDE_BROKEN_PREFIX: &str = "PO (broken):";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusPrefix {
    pub prefix: String,
    pub negate: bool,
}

impl StatusPrefix {
    pub fn starts_with(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            negate: false,
        }
    }

    pub fn not_starts_with(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            negate: true,
        }
    }

    /// Positive: every unit matches. Negated: no unit matches. A fleet with
    /// no units satisfies neither.
    pub fn matches(&self, info_lines: &[(String, String)]) -> bool {
        if info_lines.is_empty() {
            return false;
        }
        if self.negate {
            !info_lines
                .iter()
                .any(|(_, info)| info.starts_with(&self.prefix))
        } else {
            info_lines
                .iter()
                .all(|(_, info)| info.starts_with(&self.prefix))
        }
    }
}

impl Display for StatusPrefix {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.negate {
            write!(f, "workload status info not starting with {:?}", self.prefix)
        } else {
            write!(f, "workload status info starting with {:?}", self.prefix)
        }
    }
}

pub fn await_status_prefix(
    model: &dyn DeploymentModel,
    application: &str,
    expected: &StatusPrefix,
    options: PollOptions,
) -> PolicydResult<Vec<(String, String)>> {
    let description = format!("{} on {}", expected, application);
    info!(application = application, predicate = %expected, "awaiting workload status");
    wait_until(
        &description,
        options,
        || application_status(model, application).map(|status| status.info_lines()),
        |lines| expected.matches(lines),
    )
}

/// Waits for `expected`, then for the whole model to go idle, then for
/// `expected` once more.
///
/// Units can drop a status prefix while their own hooks are still running
/// and other units have not caught up yet, so one match does not prove the
/// fleet has settled.
pub fn await_status_settled(
    model: &dyn DeploymentModel,
    application: &str,
    expected: &StatusPrefix,
    options: PollOptions,
    idle_options: PollOptions,
) -> PolicydResult<Vec<(String, String)>> {
    await_status_prefix(model, application, expected, options)?;
    await_all_units_idle(model, idle_options)?;
    await_status_prefix(model, application, expected, options)
}
