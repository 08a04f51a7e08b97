use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};

use policyd_verify::config::Settings;
use policyd_verify::model::application_status;
use policyd_verify::observability::ObservabilityGuard;
use policyd_verify::orchestrator::Orchestrator;
use policyd_verify::report::{CaseStatus, SuiteReport};
use policyd_verify::target::{BAD_YAML_CASE, ENFORCEMENT_CASE, GOOD_YAML_CASE};

#[derive(Parser, Debug)]
#[command(name = "policyd-verify")]
#[command(about = "Verify policy override bundles on a deployed application", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print effective settings and configuration warnings.
    Doctor,
    /// Run the override verification cases against the deployment.
    Run {
        #[arg(long, value_enum, default_value_t = CaseSelection::All)]
        case: CaseSelection,
        /// Print the suite report as JSON instead of a summary.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Show workload and agent status for every unit of the application.
    Status,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum CaseSelection {
    Good,
    Bad,
    Enforcement,
    All,
}

impl CaseSelection {
    fn case_names(self) -> Vec<String> {
        match self {
            Self::Good => vec![GOOD_YAML_CASE.to_string()],
            Self::Bad => vec![BAD_YAML_CASE.to_string()],
            Self::Enforcement => vec![ENFORCEMENT_CASE.to_string()],
            Self::All => Vec::new(),
        }
    }
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    // Loading settings seeds the env from dotenv, which also carries the
    // OTLP endpoint and RUST_LOG.
    let settings = Settings::load()?;
    let _observability = ObservabilityGuard::init();

    match cli.command.unwrap_or(Commands::Doctor) {
        Commands::Doctor => {
            print_doctor(&settings);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Run { case, json } => run_cases(&settings, case, json),
        Commands::Status => {
            print_status(&settings)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn print_doctor(settings: &Settings) {
    let report = settings.doctor_report();
    println!("policyd-verify doctor");
    println!("application: {}", report.application);
    println!("service: {}", report.service);
    println!("target: {}", report.target);
    println!("juju_bin: {}", report.juju_bin);
    println!(
        "juju_model: {}",
        report.juju_model.unwrap_or_else(|| "<current>".to_string())
    );
    println!("resource_name: {}", report.resource_name);
    println!("config_key: {}", report.config_key);
    println!("poll_timeout_secs: {}", report.poll_timeout_secs);
    println!("poll_interval_ms: {}", report.poll_interval_ms);
    println!("idle_timeout_secs: {}", report.idle_timeout_secs);
    println!(
        "os_release: {}",
        report.os_release.unwrap_or_else(|| "<unset>".to_string())
    );
    println!("curl_bin: {}", report.curl_bin);
    println!("request_timeout_secs: {}", report.request_timeout_secs);
    println!("keystone_username: {}", report.keystone_username);
    println!("keystone_password_loaded: {}", report.keystone_password_loaded);
    println!("keystone_domain: {}", report.keystone_domain);
    println!("keystone_port: {}", report.keystone_port);
    println!(
        "keystone_cacert: {}",
        report
            .keystone_ca_cert
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "<unset>".to_string())
    );
    if report.warnings.is_empty() {
        println!("status: ok");
    } else {
        println!("status: warning");
        for warning in report.warnings {
            println!("- {}", warning);
        }
    }
}

fn run_cases(settings: &Settings, selection: CaseSelection, json: bool) -> Result<ExitCode> {
    let model = settings.deployment_model();
    let identity = settings.identity_client();
    let adapter = settings.target_adapter()?;
    let orchestrator = Orchestrator::new(
        &model,
        &identity,
        adapter.as_ref(),
        settings.orchestrator_settings()?,
    );

    let report = orchestrator
        .run_cases(&selection.case_names())
        .with_context(|| format!("failed to run cases for {}", settings.application))?;

    if json {
        println!("{}", report.to_json()?);
    } else {
        print_summary(&report);
    }

    Ok(if report.passed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn print_summary(report: &SuiteReport) {
    println!(
        "policyd-verify: {} (service {})",
        report.application, report.service
    );
    for case in &report.cases {
        let status = match case.status {
            CaseStatus::Passed => "passed",
            CaseStatus::Failed => "FAILED",
            CaseStatus::Skipped => "skipped",
        };
        println!(
            "{:<12} {:<8} final_state={} duration_ms={}",
            case.case, status, case.final_state, case.duration_ms
        );
        if let Some(failure) = case.failure.as_ref() {
            println!("  {} [{}]", failure.message, failure.kind);
        }
        if let Some(reason) = case.skip_reason.as_ref() {
            println!("  {}", reason);
        }
    }
    let failed = report.failed_cases().len();
    if failed == 0 {
        println!("result: ok");
    } else {
        println!("result: {} case(s) failed", failed);
    }
}

fn print_status(settings: &Settings) -> Result<()> {
    let model = settings.deployment_model();
    let status = application_status(&model, &settings.application)
        .with_context(|| format!("failed reading status of {}", settings.application))?;

    println!("{}", status.name);
    for unit in &status.units {
        println!(
            "{} workload={} agent={} address={} info={:?}",
            unit.name,
            unit.workload.code,
            unit.agent_status,
            unit.address.as_deref().unwrap_or("-"),
            unit.workload.info
        );
        for sub in &unit.subordinates {
            println!(
                "  {} workload={} agent={} info={:?}",
                sub.name, sub.workload.code, sub.agent_status, sub.workload.info
            );
        }
    }
    Ok(())
}
