//! Contract with the deployment layer plus the pieces built directly on it.
//!
//! The deployment layer owns applications and units; everything here only
//! triggers asynchronous changes or observes their effects.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Serialize;
use tracing::{error, info};

use crate::error::{PolicydError, PolicydResult};
use crate::poll::{wait_until, PollOptions};

pub const AGENT_IDLE: &str = "idle";

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct WorkloadStatus {
    pub code: String,
    pub info: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct Unit {
    pub name: String,
    pub address: Option<String>,
    pub workload: WorkloadStatus,
    pub agent_status: String,
    pub subordinates: Vec<Unit>,
}

impl Unit {
    fn collect_busy(&self, busy: &mut Vec<String>) {
        if self.agent_status != AGENT_IDLE {
            busy.push(format!("{}={}", self.name, self.agent_status));
        }
        for sub in &self.subordinates {
            sub.collect_busy(busy);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct ApplicationStatus {
    pub name: String,
    pub units: Vec<Unit>,
}

impl ApplicationStatus {
    pub fn info_lines(&self) -> Vec<(String, String)> {
        self.units
            .iter()
            .map(|unit| (unit.name.clone(), unit.workload.info.clone()))
            .collect()
    }

    pub fn unit_names(&self) -> Vec<String> {
        self.units.iter().map(|unit| unit.name.clone()).collect()
    }

    pub fn addresses(&self) -> Vec<String> {
        self.units
            .iter()
            .filter_map(|unit| unit.address.clone())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct ModelStatus {
    pub applications: Vec<ApplicationStatus>,
}

impl ModelStatus {
    pub fn application(&self, name: &str) -> Option<&ApplicationStatus> {
        self.applications.iter().find(|app| app.name == name)
    }

    /// Units (subordinates included) whose agent still has pending work.
    pub fn busy_units(&self) -> Vec<String> {
        let mut busy = Vec::new();
        for app in &self.applications {
            for unit in &app.units {
                unit.collect_busy(&mut busy);
            }
        }
        busy
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteFile {
    Missing,
    Present(String),
}

/// Operations the verifier needs from the deployment layer.
pub trait DeploymentModel: Send + Sync {
    fn set_config(&self, application: &str, config: &BTreeMap<String, String>)
        -> PolicydResult<()>;

    fn attach_resource(&self, application: &str, resource: &str, artifact: &Path)
        -> PolicydResult<()>;

    fn model_status(&self) -> PolicydResult<ModelStatus>;

    fn read_unit_file(&self, unit: &str, path: &str) -> PolicydResult<RemoteFile>;
}

pub fn application_status(
    model: &dyn DeploymentModel,
    application: &str,
) -> PolicydResult<ApplicationStatus> {
    let status = model.model_status()?;
    status.application(application).cloned().ok_or_else(|| {
        PolicydError::transport(format!(
            "application '{}' is not present in model status",
            application
        ))
    })
}

/// Blocks until no unit in the model has pending agent work.
pub fn await_all_units_idle(model: &dyn DeploymentModel, options: PollOptions) -> PolicydResult<()> {
    wait_until(
        "all units idle",
        options,
        || model.model_status().map(|status| status.busy_units()),
        |busy| busy.is_empty(),
    )?;
    Ok(())
}

/// Config applied for a scope and reverted when the scope ends.
///
/// `restore` reports the revert result; dropping without calling it still
/// reverts and logs any failure.
pub struct ConfigChange<'a> {
    model: &'a dyn DeploymentModel,
    application: String,
    default: BTreeMap<String, String>,
    restored: bool,
}

impl<'a> ConfigChange<'a> {
    pub fn apply(
        model: &'a dyn DeploymentModel,
        application: &str,
        default: BTreeMap<String, String>,
        alternate: &BTreeMap<String, String>,
    ) -> PolicydResult<Self> {
        info!(application = application, config = ?alternate, "applying scoped config change");
        model.set_config(application, alternate)?;
        Ok(Self {
            model,
            application: application.to_string(),
            default,
            restored: false,
        })
    }

    pub fn restore(mut self) -> PolicydResult<()> {
        self.restored = true;
        info!(application = %self.application, config = ?self.default, "restoring config");
        self.model.set_config(&self.application, &self.default)
    }
}

impl Drop for ConfigChange<'_> {
    fn drop(&mut self) {
        if self.restored {
            return;
        }
        info!(application = %self.application, config = ?self.default, "restoring config");
        if let Err(err) = self.model.set_config(&self.application, &self.default) {
            error!(
                application = %self.application,
                error = %err,
                "failed to restore config after scoped change"
            );
        }
    }
}

pub fn config_map<K, V, I>(pairs: I) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    pairs
        .into_iter()
        .map(|(key, value)| (key.into(), value.into()))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, VecDeque};
    use std::path::Path;
    use std::sync::Mutex;
    use std::time::Duration;

    use super::{
        await_all_units_idle, config_map, ApplicationStatus, ConfigChange, DeploymentModel,
        ModelStatus, RemoteFile, Unit, WorkloadStatus,
    };
    use crate::error::{PolicydError, PolicydResult};
    use crate::poll::PollOptions;

    #[derive(Default)]
    struct RecordingModel {
        configs: Mutex<Vec<BTreeMap<String, String>>>,
        statuses: Mutex<VecDeque<ModelStatus>>,
    }

    impl DeploymentModel for RecordingModel {
        fn set_config(&self, _application: &str, config: &BTreeMap<String, String>) -> PolicydResult<()> {
            self.configs.lock().expect("lock").push(config.clone());
            Ok(())
        }

        fn attach_resource(&self, _application: &str, _resource: &str, _artifact: &Path) -> PolicydResult<()> {
            Ok(())
        }

        fn model_status(&self) -> PolicydResult<ModelStatus> {
            let mut statuses = self.statuses.lock().expect("lock");
            if statuses.len() > 1 {
                Ok(statuses.pop_front().unwrap_or_default())
            } else {
                statuses
                    .front()
                    .cloned()
                    .ok_or_else(|| PolicydError::transport("no status scripted"))
            }
        }

        fn read_unit_file(&self, _unit: &str, _path: &str) -> PolicydResult<RemoteFile> {
            Ok(RemoteFile::Missing)
        }
    }

    fn unit(name: &str, agent: &str) -> Unit {
        Unit {
            name: name.to_string(),
            address: Some("10.0.0.1".to_string()),
            workload: WorkloadStatus {
                code: "active".to_string(),
                info: "Unit is ready".to_string(),
            },
            agent_status: agent.to_string(),
            subordinates: Vec::new(),
        }
    }

    fn model_with(units: Vec<Unit>) -> ModelStatus {
        ModelStatus {
            applications: vec![ApplicationStatus {
                name: "keystone".to_string(),
                units,
            }],
        }
    }

    #[test]
    fn busy_units_include_subordinates() {
        let mut principal = unit("keystone/0", "idle");
        principal.subordinates.push(unit("hacluster/0", "executing"));
        let status = model_with(vec![principal, unit("keystone/1", "idle")]);
        assert_eq!(status.busy_units(), vec!["hacluster/0=executing".to_string()]);
    }

    #[test]
    fn idle_barrier_waits_for_every_unit() {
        let model = RecordingModel::default();
        {
            let mut statuses = model.statuses.lock().expect("lock");
            statuses.push_back(model_with(vec![unit("keystone/0", "executing"), unit("keystone/1", "idle")]));
            statuses.push_back(model_with(vec![unit("keystone/0", "idle"), unit("keystone/1", "executing")]));
            statuses.push_back(model_with(vec![unit("keystone/0", "idle"), unit("keystone/1", "idle")]));
        }
        let options = PollOptions::new(Duration::from_millis(500), Duration::from_millis(1));
        await_all_units_idle(&model, options).expect("converges");
        assert!(model.statuses.lock().expect("lock").len() == 1);
    }

    #[test]
    fn idle_barrier_times_out_with_busy_units() {
        let model = RecordingModel::default();
        model
            .statuses
            .lock()
            .expect("lock")
            .push_back(model_with(vec![unit("keystone/0", "executing")]));
        let options = PollOptions::new(Duration::from_millis(20), Duration::from_millis(2));
        let err = await_all_units_idle(&model, options).expect_err("never idle");
        assert!(err.to_string().contains("keystone/0=executing"));
    }

    #[test]
    fn config_change_restores_on_explicit_restore_and_drop() {
        let model = RecordingModel::default();
        let default = config_map([("preferred-api-version", "2")]);
        let alternate = config_map([("preferred-api-version", "3")]);

        let change = ConfigChange::apply(&model, "keystone", default.clone(), &alternate).expect("apply");
        change.restore().expect("restore");

        {
            let _change = ConfigChange::apply(&model, "keystone", default.clone(), &alternate).expect("apply");
        }

        let configs = model.configs.lock().expect("lock").clone();
        assert_eq!(configs, vec![alternate.clone(), default.clone(), alternate, default]);
    }
}
