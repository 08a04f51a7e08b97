use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use policyd_verify::bundle;
use policyd_verify::error::{PolicydError, PolicydResult};
use policyd_verify::files::policy_path;
use policyd_verify::keystone::{KeystoneAdapter, KeystoneAdapterSettings};
use policyd_verify::model::{
    ApplicationStatus, DeploymentModel, ModelStatus, RemoteFile, Unit, WorkloadStatus,
};
use policyd_verify::orchestrator::{Orchestrator, OrchestratorSettings};
use policyd_verify::poll::PollOptions;
use policyd_verify::probe::{
    Credentials, IdentityClient, IdentitySession, OperationError, ProbeOperation, ProbeTarget,
    Scope, VerificationOutcome,
};
use policyd_verify::report::{CaseStatus, ProbePhase, ProtocolState};
use policyd_verify::target::{GenericAdapter, TargetAdapter, BAD_YAML_CASE, GOOD_YAML_CASE};

const APPLICATION: &str = "keystone";
const CONFIG_KEY: &str = "use-policyd-override";

#[derive(Debug, Clone, Default)]
struct View {
    info: String,
    files: BTreeMap<String, String>,
    denied_operations: Vec<String>,
}

/// A two-unit deployment whose charm reacts to config and resource changes
/// after a few status reads.
struct World {
    units: Vec<(String, String)>,
    config: BTreeMap<String, String>,
    config_log: Vec<BTreeMap<String, String>>,
    attached: BTreeMap<String, String>,
    attach_count: usize,
    visible: View,
    pending: Option<View>,
    pending_reads: u32,
    lag: u32,
    ignored_entries: Vec<String>,
    /// Files stay on disk after the override stops writing them.
    keep_removed_files: bool,
    enforce_rules: bool,
    /// Operations denied regardless of any override.
    denied_by_default: Vec<String>,
    identity_transport_error: Option<String>,
    /// 1-based `set_config` call that the model rejects.
    failing_config_call: Option<usize>,
    config_calls: usize,
    status_reads: u32,
}

impl World {
    fn new() -> Self {
        Self {
            units: vec![
                ("keystone/0".to_string(), "10.5.0.10".to_string()),
                ("keystone/1".to_string(), "10.5.0.11".to_string()),
            ],
            config: BTreeMap::new(),
            config_log: Vec::new(),
            attached: BTreeMap::new(),
            attach_count: 0,
            visible: View {
                info: "Unit is ready".to_string(),
                ..View::default()
            },
            pending: None,
            pending_reads: 0,
            lag: 2,
            ignored_entries: Vec::new(),
            keep_removed_files: false,
            enforce_rules: true,
            denied_by_default: Vec::new(),
            identity_transport_error: None,
            failing_config_call: None,
            config_calls: 0,
            status_reads: 0,
        }
    }

    fn target_view(&self) -> View {
        let enabled = self.config.get(CONFIG_KEY).is_some_and(|value| value == "True");
        if !enabled || self.attached.is_empty() {
            return View {
                info: "Unit is ready".to_string(),
                ..View::default()
            };
        }
        // An unterminated quote stands in for YAML the charm refuses to load.
        if self
            .attached
            .values()
            .any(|content| content.matches('\'').count() % 2 == 1)
        {
            return View {
                info: "PO (broken): Unit is ready".to_string(),
                ..View::default()
            };
        }

        let files = self
            .attached
            .iter()
            .filter(|(entry, _)| !self.ignored_entries.contains(entry))
            .map(|(entry, content)| (policy_path(APPLICATION, entry), content.clone()))
            .collect();
        let denied_operations = if self.enforce_rules {
            self.attached
                .values()
                .filter_map(|content| content.strip_suffix(": '!'"))
                .map(str::to_string)
                .collect()
        } else {
            Vec::new()
        };
        View {
            info: "PO: Unit is ready".to_string(),
            files,
            denied_operations,
        }
    }

    fn changed(&mut self) {
        self.pending = Some(self.target_view());
        self.pending_reads = self.lag;
    }

    /// Returns the view a reader sees now and whether agents are still busy.
    fn observe(&mut self) -> (View, bool) {
        if let Some(pending) = self.pending.take() {
            if self.pending_reads > 0 {
                self.pending_reads -= 1;
                self.pending = Some(pending);
                return (self.visible.clone(), true);
            }
            let mut pending = pending;
            if self.keep_removed_files {
                for (path, content) in &self.visible.files {
                    pending
                        .files
                        .entry(path.clone())
                        .or_insert_with(|| content.clone());
                }
            }
            self.visible = pending;
        }
        (self.visible.clone(), false)
    }
}

#[derive(Clone)]
struct SimulatedModel {
    world: Arc<Mutex<World>>,
}

impl DeploymentModel for SimulatedModel {
    fn set_config(&self, _application: &str, config: &BTreeMap<String, String>) -> PolicydResult<()> {
        let mut world = self.world.lock().expect("world lock");
        world.config_calls += 1;
        if world.failing_config_call == Some(world.config_calls) {
            return Err(PolicydError::transport("juju config exited with code 1: ERROR connection is shut down"));
        }
        world.config_log.push(config.clone());
        for (key, value) in config {
            world.config.insert(key.clone(), value.clone());
        }
        world.changed();
        Ok(())
    }

    fn attach_resource(&self, _application: &str, resource: &str, artifact: &Path) -> PolicydResult<()> {
        assert_eq!(resource, "policyd-override");
        let entries = bundle::read_entries(artifact)?;
        let mut world = self.world.lock().expect("world lock");
        world.attached = entries;
        world.attach_count += 1;
        world.changed();
        Ok(())
    }

    fn model_status(&self) -> PolicydResult<ModelStatus> {
        let mut world = self.world.lock().expect("world lock");
        world.status_reads += 1;
        let (view, busy) = world.observe();
        let units = world
            .units
            .iter()
            .map(|(name, address)| Unit {
                name: name.clone(),
                address: Some(address.clone()),
                workload: WorkloadStatus {
                    code: "active".to_string(),
                    info: view.info.clone(),
                },
                agent_status: if busy { "executing" } else { "idle" }.to_string(),
                subordinates: Vec::new(),
            })
            .collect();
        Ok(ModelStatus {
            applications: vec![ApplicationStatus {
                name: APPLICATION.to_string(),
                units,
            }],
        })
    }

    fn read_unit_file(&self, _unit: &str, path: &str) -> PolicydResult<RemoteFile> {
        let mut world = self.world.lock().expect("world lock");
        let (view, _) = world.observe();
        Ok(match view.files.get(path) {
            Some(content) => RemoteFile::Present(content.clone()),
            None => RemoteFile::Missing,
        })
    }
}

struct FakeIdentity {
    world: Arc<Mutex<World>>,
}

struct FakeSession {
    denied: Vec<String>,
}

impl IdentitySession for FakeSession {
    fn perform(&self, operation: &ProbeOperation) -> Result<(), OperationError> {
        if self.denied.contains(&operation.name) {
            return Err(OperationError::Forbidden(format!("{} is disallowed by policy", operation.name)));
        }
        Ok(())
    }
}

impl IdentityClient for FakeIdentity {
    fn open_session(
        &self,
        _target: &ProbeTarget,
        credentials: &Credentials,
        scope: &Scope,
    ) -> Result<Box<dyn IdentitySession>, OperationError> {
        assert_eq!(credentials.username, "demo_admin");
        assert_eq!(scope, &Scope::Domain("demo_domain".to_string()));
        let world = self.world.lock().expect("world lock");
        if let Some(message) = world.identity_transport_error.as_ref() {
            return Err(OperationError::Transport(message.clone()));
        }
        let mut denied = world.visible.denied_operations.clone();
        denied.extend(world.denied_by_default.iter().cloned());
        Ok(Box::new(FakeSession { denied }))
    }
}

fn settings() -> OrchestratorSettings {
    let options = PollOptions::new(Duration::from_millis(500), Duration::from_millis(1));
    OrchestratorSettings {
        resource_name: "policyd-override".to_string(),
        override_config_key: CONFIG_KEY.to_string(),
        poll: options,
        idle: options,
        os_release: None,
    }
}

fn keystone_adapter() -> KeystoneAdapter {
    KeystoneAdapter::new(
        APPLICATION,
        APPLICATION,
        KeystoneAdapterSettings {
            credentials: Credentials {
                username: "demo_admin".to_string(),
                password: "password".to_string(),
                user_domain: "demo_domain".to_string(),
            },
            port: 5000,
            ca_cert: None::<PathBuf>,
            default_api_version: "3".to_string(),
            override_config_key: CONFIG_KEY.to_string(),
        },
    )
}

fn fixture() -> (Arc<Mutex<World>>, SimulatedModel, FakeIdentity) {
    let world = Arc::new(Mutex::new(World::new()));
    let model = SimulatedModel {
        world: Arc::clone(&world),
    };
    let identity = FakeIdentity {
        world: Arc::clone(&world),
    };
    (world, model, identity)
}

fn override_config(value: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(CONFIG_KEY.to_string(), value.to_string())])
}

#[test]
fn good_bundle_walks_the_full_valid_path() {
    let (world, model, identity) = fixture();
    let adapter = GenericAdapter::new(APPLICATION, APPLICATION);
    let orchestrator = Orchestrator::new(&model, &identity, &adapter, settings());

    let report = orchestrator
        .run_cases(&[GOOD_YAML_CASE.to_string()])
        .expect("suite runs");

    assert!(report.passed());
    let case = &report.cases[0];
    assert_eq!(case.status, CaseStatus::Passed);
    assert_eq!(case.final_state, ProtocolState::Reverted);
    let states = case.transitions.iter().map(|t| t.to).collect::<Vec<_>>();
    assert_eq!(
        states,
        vec![
            ProtocolState::BundleAttached,
            ProtocolState::OverrideEnabled,
            ProtocolState::EnforcementVerified,
            ProtocolState::OverrideDisabled,
            ProtocolState::Reverted,
        ]
    );
    assert_eq!(case.bundle_sha256.as_ref().map(String::len), Some(64));
    assert!(case.probes.is_empty());

    let world = world.lock().expect("world lock");
    assert_eq!(world.attach_count, 1);
    assert_eq!(
        world.config_log,
        vec![override_config("True"), override_config("False")]
    );
}

#[test]
fn bad_bundle_is_rejected_without_writing_files() {
    let (world, model, identity) = fixture();
    let adapter = GenericAdapter::new(APPLICATION, APPLICATION);
    let orchestrator = Orchestrator::new(&model, &identity, &adapter, settings());

    let report = orchestrator
        .run_cases(&[BAD_YAML_CASE.to_string()])
        .expect("suite runs");

    let case = &report.cases[0];
    assert_eq!(case.status, CaseStatus::Passed, "{:?}", case.failure);
    assert_eq!(case.final_state, ProtocolState::RejectedVerified);
    assert_eq!(case.transitions.len(), 3);

    let world = world.lock().expect("world lock");
    assert_eq!(world.config_log, vec![override_config("True")]);
    assert!(world.visible.info.starts_with("PO (broken):"));
}

#[test]
fn bad_bundle_fails_when_a_previous_valid_file_lingers() {
    let (world, model, identity) = fixture();
    world.lock().expect("world lock").keep_removed_files = true;
    let adapter = GenericAdapter::new(APPLICATION, APPLICATION);
    let mut fast = settings();
    fast.poll = PollOptions::new(Duration::from_millis(50), Duration::from_millis(1));
    let orchestrator = Orchestrator::new(&model, &identity, &adapter, fast);

    let report = orchestrator.run_suite().expect("suite runs");

    let good = &report.cases[0];
    assert_eq!(good.status, CaseStatus::Failed);
    let failure = good.failure.as_ref().expect("failure detail");
    assert_eq!(failure.transition, "OVERRIDE_DISABLED -> REVERTED");

    let bad = &report.cases[1];
    assert_eq!(bad.case, BAD_YAML_CASE);
    assert_eq!(bad.status, CaseStatus::Failed);
    assert_eq!(bad.final_state, ProtocolState::OverrideEnabled);
    let failure = bad.failure.as_ref().expect("failure detail");
    assert_eq!(failure.transition, "OVERRIDE_ENABLED -> REJECTED_VERIFIED");
    assert_eq!(failure.kind, "poll_timeout");
    assert!(failure.message.contains("/etc/keystone/policy.d/file1.yaml"));

    let world = world.lock().expect("world lock");
    assert_eq!(world.attach_count, 2);
    assert!(world.visible.info.starts_with("PO (broken):"));
    assert!(world
        .visible
        .files
        .contains_key(&policy_path(APPLICATION, "file1.yaml")));
}

#[test]
fn enforcement_case_probes_baseline_override_and_revert() {
    let (world, model, identity) = fixture();
    let adapter = keystone_adapter();
    let orchestrator = Orchestrator::new(&model, &identity, &adapter, settings());

    let report = orchestrator
        .run_cases(&["enforcement".to_string()])
        .expect("suite runs");

    let case = &report.cases[0];
    assert_eq!(case.status, CaseStatus::Passed, "{:?}", case.failure);
    assert_eq!(case.final_state, ProtocolState::Reverted);
    assert_eq!(case.probes.len(), 6);
    for record in &case.probes {
        let expected = match record.phase {
            ProbePhase::Overridden => VerificationOutcome::Denied,
            ProbePhase::Baseline | ProbePhase::Reverted => VerificationOutcome::Allowed,
        };
        assert_eq!(record.outcome, expected, "{} {:?}", record.target, record.phase);
        assert_eq!(record.operation, "identity:list_services");
    }
    assert!(case
        .probes
        .iter()
        .any(|record| record.target == "keystone/1 (10.5.0.11)"));

    let world = world.lock().expect("world lock");
    let restored = BTreeMap::from([
        ("preferred-api-version".to_string(), "3".to_string()),
        (CONFIG_KEY.to_string(), "False".to_string()),
    ]);
    assert_eq!(
        world.config_log,
        vec![
            BTreeMap::from([("preferred-api-version".to_string(), "3".to_string())]),
            override_config("True"),
            override_config("False"),
            restored,
        ]
    );
}

#[test]
fn unenforced_override_fails_at_enforcement_and_restores_config() {
    let (world, model, identity) = fixture();
    world.lock().expect("world lock").enforce_rules = false;
    let adapter = keystone_adapter();
    let orchestrator = Orchestrator::new(&model, &identity, &adapter, settings());

    let report = orchestrator
        .run_cases(&["enforcement".to_string()])
        .expect("suite runs");

    let case = &report.cases[0];
    assert_eq!(case.status, CaseStatus::Failed);
    assert_eq!(case.final_state, ProtocolState::OverrideEnabled);
    let failure = case.failure.as_ref().expect("failure detail");
    assert_eq!(failure.transition, "OVERRIDE_ENABLED -> ENFORCEMENT_VERIFIED");
    assert_eq!(failure.kind, "unexpected_outcome");
    assert!(failure.message.contains("expected denied, observed allowed"));

    let world = world.lock().expect("world lock");
    let last = world.config_log.last().expect("config restored");
    assert_eq!(last.get(CONFIG_KEY).map(String::as_str), Some("False"));
    assert_eq!(last.get("preferred-api-version").map(String::as_str), Some("3"));
}

#[test]
fn denied_baseline_fails_before_attaching() {
    let (world, model, identity) = fixture();
    world.lock().expect("world lock").denied_by_default = vec!["identity:list_services".to_string()];
    let adapter = keystone_adapter();
    let orchestrator = Orchestrator::new(&model, &identity, &adapter, settings());

    let report = orchestrator
        .run_cases(&["enforcement".to_string()])
        .expect("suite runs");

    let case = &report.cases[0];
    assert_eq!(case.status, CaseStatus::Failed);
    assert_eq!(case.final_state, ProtocolState::Init);
    let failure = case.failure.as_ref().expect("failure detail");
    assert_eq!(failure.transition, "INIT -> BUNDLE_ATTACHED");
    assert_eq!(failure.kind, "unexpected_outcome");
    assert_eq!(case.probes.len(), 1);
    assert_eq!(case.probes[0].phase, ProbePhase::Baseline);
    assert_eq!(case.probes[0].outcome, VerificationOutcome::Denied);

    let world = world.lock().expect("world lock");
    assert_eq!(world.attach_count, 0);
    let last = world.config_log.last().expect("config restored");
    assert_eq!(last.get(CONFIG_KEY).map(String::as_str), Some("False"));
}

#[test]
fn failed_restore_after_passing_case_fails_at_teardown() {
    let (world, model, identity) = fixture();
    // alternate, True, False, then the restore.
    world.lock().expect("world lock").failing_config_call = Some(4);
    let adapter = keystone_adapter();
    let orchestrator = Orchestrator::new(&model, &identity, &adapter, settings());

    let report = orchestrator
        .run_cases(&["enforcement".to_string()])
        .expect("suite runs");

    let case = &report.cases[0];
    assert_eq!(case.status, CaseStatus::Failed);
    assert_eq!(case.final_state, ProtocolState::Reverted);
    assert_eq!(case.transitions.len(), 5);
    assert_eq!(case.probes.len(), 6);
    let failure = case.failure.as_ref().expect("failure detail");
    assert_eq!(failure.transition, "REVERTED -> teardown");
    assert_eq!(failure.kind, "transport");
    assert!(failure.message.contains("connection is shut down"));

    let world = world.lock().expect("world lock");
    assert_eq!(world.config_calls, 4);
    assert_eq!(world.config_log.len(), 3);
}

#[test]
fn probe_transport_error_is_not_treated_as_denied() {
    let (world, model, identity) = fixture();
    world.lock().expect("world lock").identity_transport_error =
        Some("Failed to connect to 10.5.0.10 port 5000".to_string());
    let adapter = keystone_adapter();
    let orchestrator = Orchestrator::new(&model, &identity, &adapter, settings());

    let report = orchestrator
        .run_cases(&["enforcement".to_string()])
        .expect("suite runs");

    let case = &report.cases[0];
    assert_eq!(case.status, CaseStatus::Failed);
    assert_eq!(case.final_state, ProtocolState::Init);
    let failure = case.failure.as_ref().expect("failure detail");
    assert_eq!(failure.transition, "INIT -> BUNDLE_ATTACHED");
    assert_eq!(failure.kind, "transport");
    assert!(matches!(case.probes[0].outcome, VerificationOutcome::Error(_)));

    let world = world.lock().expect("world lock");
    assert_eq!(world.attach_count, 0);
    assert_eq!(
        world
            .config_log
            .last()
            .and_then(|config| config.get(CONFIG_KEY))
            .map(String::as_str),
        Some("False")
    );
}

#[test]
fn timeout_names_transition_and_later_cases_still_run() {
    let (world, model, identity) = fixture();
    world.lock().expect("world lock").ignored_entries = vec!["file1.yaml".to_string()];
    let adapter = GenericAdapter::new(APPLICATION, APPLICATION);
    let mut fast = settings();
    fast.poll = PollOptions::new(Duration::from_millis(50), Duration::from_millis(1));
    let orchestrator = Orchestrator::new(&model, &identity, &adapter, fast);

    let report = orchestrator.run_suite().expect("suite runs");

    assert!(!report.passed());
    assert_eq!(report.cases.len(), 2);
    let good = &report.cases[0];
    assert_eq!(good.case, GOOD_YAML_CASE);
    assert_eq!(good.status, CaseStatus::Failed);
    let failure = good.failure.as_ref().expect("failure detail");
    assert_eq!(failure.transition, "BUNDLE_ATTACHED -> OVERRIDE_ENABLED");
    assert_eq!(failure.kind, "poll_timeout");
    assert!(failure.message.contains("/etc/keystone/policy.d/file1.yaml"));
    assert!(failure.message.contains("Missing"));

    let bad = &report.cases[1];
    assert_eq!(bad.case, BAD_YAML_CASE);
    assert_eq!(bad.status, CaseStatus::Passed, "{:?}", bad.failure);
    assert_eq!(report.failed_cases().len(), 1);
}

#[test]
fn releases_before_queens_skip_every_case_untouched() {
    let (world, model, identity) = fixture();
    let adapter = keystone_adapter();
    let mut gated = settings();
    gated.os_release = Some("xenial_pike".parse().expect("release"));
    let orchestrator = Orchestrator::new(&model, &identity, &adapter, gated);

    let report = orchestrator.run_suite().expect("suite runs");

    assert_eq!(report.cases.len(), 3);
    assert!(report.passed());
    for case in &report.cases {
        assert_eq!(case.status, CaseStatus::Skipped);
        assert!(case
            .skip_reason
            .as_deref()
            .is_some_and(|reason| reason.contains("xenial_queens")));
    }
    let world = world.lock().expect("world lock");
    assert!(world.config_log.is_empty());
    assert_eq!(world.attach_count, 0);
    assert_eq!(world.status_reads, 0);
}

#[test]
fn unknown_case_name_is_a_config_error() {
    let (_world, model, identity) = fixture();
    let adapter = GenericAdapter::new(APPLICATION, APPLICATION);
    let orchestrator = Orchestrator::new(&model, &identity, &adapter, settings());

    let err = orchestrator
        .run_cases(&["enforcement".to_string()])
        .expect_err("generic adapter has no enforcement case");
    assert_eq!(err.kind(), "config");
    assert_eq!(adapter.cases().expect("cases").len(), 2);
}

#[test]
fn suite_report_serializes_protocol_states() {
    let (_world, model, identity) = fixture();
    let adapter = GenericAdapter::new(APPLICATION, APPLICATION);
    let orchestrator = Orchestrator::new(&model, &identity, &adapter, settings());

    let report = orchestrator
        .run_cases(&[GOOD_YAML_CASE.to_string()])
        .expect("suite runs");
    let encoded = report.to_json().expect("encode");
    let decoded: serde_json::Value = serde_json::from_str(&encoded).expect("decode");

    assert_eq!(decoded["application"], "keystone");
    assert_eq!(decoded["cases"][0]["status"], "passed");
    assert_eq!(decoded["cases"][0]["final_state"], "REVERTED");
    assert_eq!(decoded["cases"][0]["transitions"][0]["from"], "INIT");
}
