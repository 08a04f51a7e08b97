use std::collections::BTreeMap;
use std::path::Path;

use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::error::{PolicydError, PolicydResult};
use crate::model::{ApplicationStatus, DeploymentModel, ModelStatus, RemoteFile, Unit, WorkloadStatus};
use crate::runner::{CliRunOutput, CliRunner, SystemCliRunner};

const MISSING_FILE_MARKER: &str = "No such file or directory";

/// `DeploymentModel` backed by the `juju` command line client.
pub struct JujuCli {
    bin: String,
    model: Option<String>,
    runner: Box<dyn CliRunner>,
}

impl JujuCli {
    pub fn new(bin: &str, model: Option<String>) -> Self {
        Self::with_runner(bin, model, Box::new(SystemCliRunner))
    }

    pub fn with_runner(bin: &str, model: Option<String>, runner: Box<dyn CliRunner>) -> Self {
        Self {
            bin: bin.to_string(),
            model,
            runner,
        }
    }

    fn command_args(&self, subcommand: &str) -> Vec<String> {
        let mut args = vec![subcommand.to_string()];
        if let Some(model) = self.model.as_ref() {
            args.push("-m".to_string());
            args.push(model.clone());
        }
        args
    }

    fn invoke(&self, args: &[String]) -> PolicydResult<CliRunOutput> {
        self.runner
            .run(&self.bin, args)
            .map_err(|err| PolicydError::transport(format!("{:#}", err)))
    }

    fn invoke_checked(&self, args: &[String]) -> PolicydResult<CliRunOutput> {
        let output = self.invoke(args)?;
        if !output.success() {
            return Err(PolicydError::transport(output.failure_summary(&self.bin)));
        }
        Ok(output)
    }
}

impl DeploymentModel for JujuCli {
    fn set_config(&self, application: &str, config: &BTreeMap<String, String>) -> PolicydResult<()> {
        if config.is_empty() {
            return Ok(());
        }
        let mut args = self.command_args("config");
        args.push(application.to_string());
        args.extend(config.iter().map(|(key, value)| format!("{}={}", key, value)));
        info!(application = application, config = ?config, "setting application config");
        self.invoke_checked(&args)?;
        Ok(())
    }

    fn attach_resource(&self, application: &str, resource: &str, artifact: &Path) -> PolicydResult<()> {
        let mut args = self.command_args("attach-resource");
        args.push(application.to_string());
        args.push(format!("{}={}", resource, artifact.display()));
        info!(
            application = application,
            resource = resource,
            artifact = %artifact.display(),
            "attaching resource"
        );
        self.invoke_checked(&args)?;
        Ok(())
    }

    fn model_status(&self) -> PolicydResult<ModelStatus> {
        let mut args = self.command_args("status");
        args.push("--format=json".to_string());
        let output = self.invoke_checked(&args)?;
        parse_model_status(&output.stdout)
    }

    fn read_unit_file(&self, unit: &str, path: &str) -> PolicydResult<RemoteFile> {
        let mut args = self.command_args("ssh");
        args.push("--pty=false".to_string());
        args.push(unit.to_string());
        args.push("sudo".to_string());
        args.push("cat".to_string());
        args.push(path.to_string());

        let output = self.invoke(&args)?;
        if output.success() {
            return Ok(RemoteFile::Present(output.stdout));
        }
        if output.stderr.contains(MISSING_FILE_MARKER) || output.stdout.contains(MISSING_FILE_MARKER) {
            debug!(unit = unit, path = path, "remote file missing");
            return Ok(RemoteFile::Missing);
        }
        Err(PolicydError::transport(output.failure_summary(&self.bin)))
    }
}

/// Parses `juju status --format=json`.
pub fn parse_model_status(raw: &str) -> PolicydResult<ModelStatus> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|err| PolicydError::transport(format!("juju status returned invalid json: {}", err)))?;

    let applications = value
        .get("applications")
        .and_then(Value::as_object)
        .map(|apps| {
            apps.iter()
                .map(|(name, app)| ApplicationStatus {
                    name: name.clone(),
                    units: app
                        .get("units")
                        .and_then(Value::as_object)
                        .map(parse_units)
                        .unwrap_or_default(),
                })
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    Ok(ModelStatus { applications })
}

fn parse_units(units: &Map<String, Value>) -> Vec<Unit> {
    units
        .iter()
        .map(|(name, unit)| Unit {
            name: name.clone(),
            address: unit
                .get("public-address")
                .and_then(Value::as_str)
                .map(ToString::to_string),
            workload: WorkloadStatus {
                code: status_field(unit, "workload-status", "current"),
                info: status_field(unit, "workload-status", "message"),
            },
            agent_status: status_field(unit, "juju-status", "current"),
            subordinates: unit
                .get("subordinates")
                .and_then(Value::as_object)
                .map(parse_units)
                .unwrap_or_default(),
        })
        .collect()
}

fn status_field(unit: &Value, section: &str, field: &str) -> String {
    unit.get(section)
        .and_then(|s| s.get(field))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}
