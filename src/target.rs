//! What varies between deployed services: where override files land, which
//! cases run, and how enforcement is probed.

use std::collections::BTreeMap;

use crate::bundle::PolicyBundle;
use crate::error::PolicydResult;
use crate::model::ApplicationStatus;
use crate::probe::{Credentials, Enforcement, ProbeOperation, ProbeTarget, Scope};

pub const GOOD_YAML_CASE: &str = "good_yaml";
pub const BAD_YAML_CASE: &str = "bad_yaml";
pub const ENFORCEMENT_CASE: &str = "enforcement";

const GOOD_ENTRY: &str = "file1.yaml";
const GOOD_RULE: &str = "rule1: '!'";
const BAD_ENTRY: &str = "file2.yaml";
const BAD_RULE: &str = "{'rule': '!}";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaseKind {
    /// Syntactically valid override expected to be materialized.
    Valid,
    /// Malformed override expected to be rejected.
    Invalid,
}

/// Config held for a whole case and put back afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopedConfig {
    pub default: BTreeMap<String, String>,
    pub alternate: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct ProbePlan {
    pub operation: ProbeOperation,
    pub credentials: Credentials,
    pub scope: Scope,
    pub baseline: Enforcement,
    pub overridden: Enforcement,
}

#[derive(Debug, Clone)]
pub struct PolicyCase {
    pub name: String,
    pub kind: CaseKind,
    pub bundle_name: String,
    pub bundle: PolicyBundle,
    /// Entry whose remote path is checked.
    pub checked_entry: String,
    /// Text the remote file must contain once a valid override lands.
    pub expected_content: String,
    /// Entries from earlier bundles that must not linger.
    pub residual_entries: Vec<String>,
    pub scoped_config: Option<ScopedConfig>,
    pub probes: Option<ProbePlan>,
}

impl PolicyCase {
    pub fn good_yaml() -> PolicydResult<Self> {
        Ok(Self {
            name: GOOD_YAML_CASE.to_string(),
            kind: CaseKind::Valid,
            bundle_name: "good.zip".to_string(),
            bundle: PolicyBundle::single(GOOD_ENTRY, GOOD_RULE)?,
            checked_entry: GOOD_ENTRY.to_string(),
            expected_content: GOOD_RULE.to_string(),
            residual_entries: Vec::new(),
            scoped_config: None,
            probes: None,
        })
    }

    pub fn bad_yaml() -> PolicydResult<Self> {
        Ok(Self {
            name: BAD_YAML_CASE.to_string(),
            kind: CaseKind::Invalid,
            bundle_name: "bad.zip".to_string(),
            bundle: PolicyBundle::single(BAD_ENTRY, BAD_RULE)?,
            checked_entry: BAD_ENTRY.to_string(),
            expected_content: String::new(),
            residual_entries: vec![GOOD_ENTRY.to_string()],
            scoped_config: None,
            probes: None,
        })
    }
}

/// Per-service plug-in for the orchestrator.
pub trait TargetAdapter {
    fn application(&self) -> &str;

    /// Service identity owning `/etc/<service>/policy.d`.
    fn service(&self) -> &str;

    /// Service-specific case proving the override is actually enforced.
    fn enforcement_case(&self) -> PolicydResult<Option<PolicyCase>> {
        Ok(None)
    }

    /// Endpoints to probe, one per reachable unit.
    fn probe_targets(&self, _status: &ApplicationStatus) -> Vec<ProbeTarget> {
        Vec::new()
    }

    fn cases(&self) -> PolicydResult<Vec<PolicyCase>> {
        let mut cases = vec![PolicyCase::good_yaml()?, PolicyCase::bad_yaml()?];
        if let Some(case) = self.enforcement_case()? {
            cases.push(case);
        }
        Ok(cases)
    }
}

/// Adapter for charms with no service-specific probe.
#[derive(Debug, Clone)]
pub struct GenericAdapter {
    application: String,
    service: String,
}

impl GenericAdapter {
    pub fn new(application: &str, service: &str) -> Self {
        Self {
            application: application.to_string(),
            service: service.to_string(),
        }
    }
}

impl TargetAdapter for GenericAdapter {
    fn application(&self) -> &str {
        &self.application
    }

    fn service(&self) -> &str {
        &self.service
    }
}
