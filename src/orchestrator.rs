//! The override verification protocol.
//!
//! Valid bundle:
//! `INIT -> BUNDLE_ATTACHED -> OVERRIDE_ENABLED -> ENFORCEMENT_VERIFIED -> OVERRIDE_DISABLED -> REVERTED`
//!
//! Invalid bundle:
//! `INIT -> BUNDLE_ATTACHED -> OVERRIDE_ENABLED -> REJECTED_VERIFIED`
//!
//! Every transition is a hard gate. Retrying happens only inside the poller;
//! a failed gate ends the case with the failing transition recorded.

use std::collections::{BTreeMap, HashMap};
use std::fmt::{Display, Formatter};
use std::time::Instant;

use chrono::Utc;
use tracing::{error, info, instrument, warn};

use crate::bundle;
use crate::context::TestContext;
use crate::error::{PolicydError, PolicydResult};
use crate::files::{await_file_contains, await_file_missing, policy_path};
use crate::model::{application_status, await_all_units_idle, ConfigChange, DeploymentModel};
use crate::poll::PollOptions;
use crate::probe::{expect_enforcement, run_probe, Enforcement, IdentityClient, ProbeTarget};
use crate::release::OpenStackRelease;
use crate::report::{
    CaseReport, CaseStatus, FailureDetail, ProbePhase, ProbeRecord, ProtocolState, SuiteReport,
    TransitionRecord,
};
use crate::status::{
    await_status_prefix, await_status_settled, StatusPrefix, OVERRIDE_ACTIVE_PREFIX,
    OVERRIDE_BROKEN_PREFIX,
};
use crate::target::{CaseKind, PolicyCase, ProbePlan, TargetAdapter};

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub resource_name: String,
    pub override_config_key: String,
    pub poll: PollOptions,
    pub idle: PollOptions,
    pub os_release: Option<OpenStackRelease>,
}

/// A failed gate: which case, which transition, and why.
#[derive(Debug)]
pub struct ProtocolFailure {
    pub case: String,
    pub from: ProtocolState,
    /// `None` when the failure happened while tearing the case down.
    pub to: Option<ProtocolState>,
    pub error: PolicydError,
}

impl ProtocolFailure {
    pub fn transition(&self) -> String {
        match self.to {
            Some(to) => format!("{} -> {}", self.from, to),
            None => format!("{} -> teardown", self.from),
        }
    }
}

impl Display for ProtocolFailure {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "case {} failed at {}: {}",
            self.case,
            self.transition(),
            self.error
        )
    }
}

impl std::error::Error for ProtocolFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

struct ProtocolRun {
    case: String,
    state: ProtocolState,
    transitions: Vec<TransitionRecord>,
    probes: Vec<ProbeRecord>,
    bundle_sha256: Option<String>,
}

impl ProtocolRun {
    fn new(case: &str) -> Self {
        Self {
            case: case.to_string(),
            state: ProtocolState::Init,
            transitions: Vec::new(),
            probes: Vec::new(),
            bundle_sha256: None,
        }
    }

    /// Moves to `to` when the gate `result` succeeded.
    fn advance(&mut self, to: ProtocolState, result: PolicydResult<()>) -> Result<(), ProtocolFailure> {
        if let Err(error) = result {
            return Err(self.failure(Some(to), error));
        }
        if !self.state.can_advance_to(to) {
            let error = PolicydError::Config(format!("illegal transition {} -> {}", self.state, to));
            return Err(self.failure(Some(to), error));
        }
        info!(case = %self.case, from = %self.state, to = %to, "transition complete");
        self.transitions.push(TransitionRecord {
            from: self.state,
            to,
            at: Utc::now().to_rfc3339(),
        });
        self.state = to;
        Ok(())
    }

    fn failure(&self, to: Option<ProtocolState>, error: PolicydError) -> ProtocolFailure {
        ProtocolFailure {
            case: self.case.clone(),
            from: self.state,
            to,
            error,
        }
    }
}

pub struct Orchestrator<'a> {
    model: &'a dyn DeploymentModel,
    identity: &'a dyn IdentityClient,
    adapter: &'a dyn TargetAdapter,
    settings: OrchestratorSettings,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        model: &'a dyn DeploymentModel,
        identity: &'a dyn IdentityClient,
        adapter: &'a dyn TargetAdapter,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            model,
            identity,
            adapter,
            settings,
        }
    }

    fn application(&self) -> &str {
        self.adapter.application()
    }

    /// Runs every case the adapter offers, in order. A failing case does not
    /// stop the ones after it.
    pub fn run_suite(&self) -> PolicydResult<SuiteReport> {
        self.run_cases(&[])
    }

    /// Runs the named cases (all of them when `names` is empty).
    pub fn run_cases(&self, names: &[String]) -> PolicydResult<SuiteReport> {
        let started_at = Utc::now().to_rfc3339();
        let mut cases = self.adapter.cases()?;
        if !names.is_empty() {
            for name in names {
                if !cases.iter().any(|case| &case.name == name) {
                    return Err(PolicydError::Config(format!(
                        "case '{}' is not available for {}",
                        name,
                        self.application()
                    )));
                }
            }
            cases.retain(|case| names.contains(&case.name));
        }

        let skip_reason = self.settings.os_release.and_then(|release| {
            (!release.supports_policy_overrides()).then(|| {
                format!(
                    "policy overrides are not supported before {} (deployed: {})",
                    OpenStackRelease::minimum(),
                    release
                )
            })
        });

        let reports = cases
            .iter()
            .map(|case| match skip_reason.as_ref() {
                Some(reason) => {
                    warn!(case = %case.name, reason = %reason, "skipping case");
                    skipped_report(case, reason)
                }
                None => self.run_case(case),
            })
            .collect();

        Ok(SuiteReport {
            application: self.application().to_string(),
            service: self.adapter.service().to_string(),
            started_at,
            finished_at: Utc::now().to_rfc3339(),
            cases: reports,
        })
    }

    #[instrument(name = "policyd.case", skip_all, fields(case = %case.name, application = %self.application()))]
    pub fn run_case(&self, case: &PolicyCase) -> CaseReport {
        let started_at = Utc::now().to_rfc3339();
        let started = Instant::now();
        let mut run = ProtocolRun::new(&case.name);

        let outcome = match TestContext::new(&case.name) {
            Ok(context) => {
                let outcome = self.execute(case, &context, &mut run);
                context.release();
                outcome
            }
            Err(error) => Err(run.failure(Some(ProtocolState::BundleAttached), error)),
        };

        let failure = match outcome {
            Ok(()) => {
                info!(case = %case.name, final_state = %run.state, "case passed");
                None
            }
            Err(failure) => {
                error!(
                    case = %case.name,
                    transition = %failure.transition(),
                    error = %failure.error,
                    "case failed"
                );
                Some(FailureDetail {
                    transition: failure.transition(),
                    kind: failure.error.kind().to_string(),
                    message: failure.to_string(),
                })
            }
        };

        CaseReport {
            case: case.name.clone(),
            status: if failure.is_some() {
                CaseStatus::Failed
            } else {
                CaseStatus::Passed
            },
            final_state: run.state,
            transitions: run.transitions,
            probes: run.probes,
            bundle_sha256: run.bundle_sha256,
            failure,
            skip_reason: None,
            started_at,
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        }
    }

    fn execute(
        &self,
        case: &PolicyCase,
        context: &TestContext,
        run: &mut ProtocolRun,
    ) -> Result<(), ProtocolFailure> {
        let scoped = match case.scoped_config.as_ref() {
            Some(scoped) => Some(
                ConfigChange::apply(
                    self.model,
                    self.application(),
                    scoped.default.clone(),
                    &scoped.alternate,
                )
                .map_err(|error| run.failure(Some(ProtocolState::BundleAttached), error))?,
            ),
            None => None,
        };

        let result = match case.kind {
            CaseKind::Valid => self.valid_path(case, context, run),
            CaseKind::Invalid => self.invalid_path(case, context, run),
        };

        match (result, scoped) {
            (Ok(()), Some(change)) => {
                let restored = change
                    .restore()
                    .and_then(|()| await_all_units_idle(self.model, self.settings.idle));
                restored.map_err(|error| run.failure(None, error))
            }
            // Dropping the change still reverts it; the gate failure wins.
            (result, _) => result,
        }
    }

    fn valid_path(
        &self,
        case: &PolicyCase,
        context: &TestContext,
        run: &mut ProtocolRun,
    ) -> Result<(), ProtocolFailure> {
        let path = policy_path(self.adapter.service(), &case.checked_entry);

        let attached = self
            .capture_baseline(case, run)
            .and_then(|()| self.attach_bundle(case, context, run));
        run.advance(ProtocolState::BundleAttached, attached)?;

        let enabled = self.set_override(true).and_then(|()| {
            await_all_units_idle(self.model, self.settings.idle)?;
            info!(path = %path, "checking for override file contents");
            await_file_contains(
                self.model,
                self.application(),
                &path,
                &case.expected_content,
                self.settings.poll,
            )?;
            await_status_prefix(
                self.model,
                self.application(),
                &StatusPrefix::starts_with(OVERRIDE_ACTIVE_PREFIX),
                self.settings.poll,
            )?;
            Ok(())
        });
        run.advance(ProtocolState::OverrideEnabled, enabled)?;

        let verified = match case.probes.as_ref() {
            Some(plan) => self.probe_all(plan, ProbePhase::Overridden, run, |_| plan.overridden),
            None => {
                info!(case = %case.name, "no enforcement probes for this case");
                Ok(())
            }
        };
        run.advance(ProtocolState::EnforcementVerified, verified)?;

        let disabled = self.set_override(false).and_then(|()| {
            await_status_settled(
                self.model,
                self.application(),
                &StatusPrefix::not_starts_with(OVERRIDE_ACTIVE_PREFIX),
                self.settings.poll,
                self.settings.idle,
            )
            .map(|_| ())
        });
        run.advance(ProtocolState::OverrideDisabled, disabled)?;

        info!(path = %path, "checking that override file has been removed");
        let reverted = await_file_missing(self.model, self.application(), &path, self.settings.poll)
            .map(|_| ())
            .and_then(|()| match case.probes.as_ref() {
                Some(plan) => {
                    let baselines = baseline_map(run);
                    self.probe_all(plan, ProbePhase::Reverted, run, |target| {
                        baselines.get(target).copied().unwrap_or(plan.baseline)
                    })
                }
                None => Ok(()),
            });
        run.advance(ProtocolState::Reverted, reverted)
    }

    fn invalid_path(
        &self,
        case: &PolicyCase,
        context: &TestContext,
        run: &mut ProtocolRun,
    ) -> Result<(), ProtocolFailure> {
        let attached = self.attach_bundle(case, context, run);
        run.advance(ProtocolState::BundleAttached, attached)?;

        let enabled = self.set_override(true).and_then(|()| {
            await_status_prefix(
                self.model,
                self.application(),
                &StatusPrefix::starts_with(OVERRIDE_BROKEN_PREFIX),
                self.settings.poll,
            )?;
            await_all_units_idle(self.model, self.settings.idle)
        });
        run.advance(ProtocolState::OverrideEnabled, enabled)?;

        let rejected = std::iter::once(&case.checked_entry)
            .chain(case.residual_entries.iter())
            .try_for_each(|entry| {
                let path = policy_path(self.adapter.service(), entry);
                info!(path = %path, "checking that file is not present");
                await_file_missing(self.model, self.application(), &path, self.settings.poll)
                    .map(|_| ())
            });
        run.advance(ProtocolState::RejectedVerified, rejected)
    }

    fn attach_bundle(
        &self,
        case: &PolicyCase,
        context: &TestContext,
        run: &mut ProtocolRun,
    ) -> PolicydResult<()> {
        let built = bundle::build(context.scratch_dir(), &case.bundle_name, &case.bundle)?;
        run.bundle_sha256 = Some(built.sha256.clone());
        info!(
            case = %case.name,
            bundle = %built.path.display(),
            sha256 = %built.sha256,
            "attaching policy bundle as a resource"
        );
        self.model.attach_resource(
            self.application(),
            &self.settings.resource_name,
            &built.path,
        )?;
        await_all_units_idle(self.model, self.settings.idle)
    }

    fn set_override(&self, enabled: bool) -> PolicydResult<()> {
        let value = if enabled { "True" } else { "False" };
        let mut config = BTreeMap::new();
        config.insert(self.settings.override_config_key.clone(), value.to_string());
        info!(config = ?config, "setting policy override config");
        self.model.set_config(self.application(), &config)
    }

    fn capture_baseline(&self, case: &PolicyCase, run: &mut ProtocolRun) -> PolicydResult<()> {
        let Some(plan) = case.probes.as_ref() else {
            return Ok(());
        };
        await_all_units_idle(self.model, self.settings.idle)?;
        self.probe_all(plan, ProbePhase::Baseline, run, |_| plan.baseline)
    }

    fn probe_targets(&self) -> PolicydResult<Vec<ProbeTarget>> {
        let status = application_status(self.model, self.application())?;
        let targets = self.adapter.probe_targets(&status);
        if targets.is_empty() {
            return Err(PolicydError::transport(format!(
                "no probe targets found for {}",
                self.application()
            )));
        }
        Ok(targets)
    }

    fn probe_all<F>(
        &self,
        plan: &ProbePlan,
        phase: ProbePhase,
        run: &mut ProtocolRun,
        expected_for: F,
    ) -> PolicydResult<()>
    where
        F: Fn(&str) -> Enforcement,
    {
        for target in self.probe_targets()? {
            let outcome = run_probe(
                self.identity,
                &target,
                &plan.credentials,
                &plan.scope,
                &plan.operation,
            );
            run.probes.push(ProbeRecord {
                phase,
                target: target.label.clone(),
                operation: plan.operation.name.clone(),
                outcome: outcome.clone(),
            });
            expect_enforcement(&outcome, expected_for(&target.label), &target, &plan.operation)?;
        }
        Ok(())
    }
}

/// Outcomes observed before the override, keyed by probe target.
fn baseline_map(run: &ProtocolRun) -> HashMap<String, Enforcement> {
    run.probes
        .iter()
        .filter(|record| record.phase == ProbePhase::Baseline)
        .filter_map(|record| {
            record
                .outcome
                .enforcement()
                .map(|observed| (record.target.clone(), observed))
        })
        .collect()
}

fn skipped_report(case: &PolicyCase, reason: &str) -> CaseReport {
    CaseReport {
        case: case.name.clone(),
        status: CaseStatus::Skipped,
        final_state: ProtocolState::Init,
        transitions: Vec::new(),
        probes: Vec::new(),
        bundle_sha256: None,
        failure: None,
        skip_reason: Some(reason.to_string()),
        started_at: Utc::now().to_rfc3339(),
        duration_ms: 0,
    }
}
