use serde::Serialize;

use crate::probe::VerificationOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProtocolState {
    Init,
    BundleAttached,
    OverrideEnabled,
    EnforcementVerified,
    OverrideDisabled,
    Reverted,
    RejectedVerified,
}

impl ProtocolState {
    pub fn label(self) -> &'static str {
        match self {
            Self::Init => "INIT",
            Self::BundleAttached => "BUNDLE_ATTACHED",
            Self::OverrideEnabled => "OVERRIDE_ENABLED",
            Self::EnforcementVerified => "ENFORCEMENT_VERIFIED",
            Self::OverrideDisabled => "OVERRIDE_DISABLED",
            Self::Reverted => "REVERTED",
            Self::RejectedVerified => "REJECTED_VERIFIED",
        }
    }

    /// Legal single-step transitions of both protocol paths.
    pub fn can_advance_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Init, Self::BundleAttached)
                | (Self::BundleAttached, Self::OverrideEnabled)
                | (Self::OverrideEnabled, Self::EnforcementVerified)
                | (Self::EnforcementVerified, Self::OverrideDisabled)
                | (Self::OverrideDisabled, Self::Reverted)
                | (Self::OverrideEnabled, Self::RejectedVerified)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Reverted | Self::RejectedVerified)
    }
}

impl std::fmt::Display for ProtocolState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CaseStatus {
    Passed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransitionRecord {
    pub from: ProtocolState,
    pub to: ProtocolState,
    pub at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbePhase {
    Baseline,
    Overridden,
    Reverted,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProbeRecord {
    pub phase: ProbePhase,
    pub target: String,
    pub operation: String,
    pub outcome: VerificationOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailureDetail {
    pub transition: String,
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CaseReport {
    pub case: String,
    pub status: CaseStatus,
    pub final_state: ProtocolState,
    pub transitions: Vec<TransitionRecord>,
    pub probes: Vec<ProbeRecord>,
    pub bundle_sha256: Option<String>,
    pub failure: Option<FailureDetail>,
    pub skip_reason: Option<String>,
    pub started_at: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SuiteReport {
    pub application: String,
    pub service: String,
    pub started_at: String,
    pub finished_at: String,
    pub cases: Vec<CaseReport>,
}

impl SuiteReport {
    pub fn failed_cases(&self) -> Vec<&CaseReport> {
        self.cases
            .iter()
            .filter(|case| case.status == CaseStatus::Failed)
            .collect()
    }

    pub fn passed(&self) -> bool {
        self.failed_cases().is_empty()
    }

    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
