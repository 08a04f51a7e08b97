use std::path::PathBuf;
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::debug;

use crate::bundle::PolicyBundle;
use crate::error::PolicydResult;
use crate::model::{config_map, ApplicationStatus};
use crate::probe::{
    Credentials, Enforcement, IdentityClient, IdentitySession, OperationError, ProbeOperation,
    ProbeTarget, Scope,
};
use crate::runner::{CliRunner, SystemCliRunner};
use crate::target::{CaseKind, PolicyCase, ProbePlan, ScopedConfig, TargetAdapter, ENFORCEMENT_CASE};

const SUBJECT_TOKEN_HEADER: &str = "x-subject-token";
const LIST_SERVICES_RULE_ENTRY: &str = "rule.yaml";
const LIST_SERVICES_RULE: &str = "identity:list_services: '!'";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Parses `curl -i` output, skipping interim `1xx` responses.
pub fn parse_http_response(raw: &str) -> Option<HttpResponse> {
    let mut rest = raw;
    loop {
        let (head, body) = split_head(rest)?;
        let mut lines = head.lines();
        let status_line = lines.next()?.trim();
        if !status_line.starts_with("HTTP/") {
            return None;
        }
        let status = status_line
            .split_whitespace()
            .nth(1)
            .and_then(|code| code.parse::<u16>().ok())?;

        if (100..200).contains(&status) && body.trim_start().starts_with("HTTP/") {
            rest = body.trim_start();
            continue;
        }

        let headers = lines
            .filter_map(|line| {
                let (key, value) = line.split_once(':')?;
                Some((key.trim().to_string(), value.trim().to_string()))
            })
            .collect();
        return Some(HttpResponse {
            status,
            headers,
            body: body.to_string(),
        });
    }
}

fn split_head(raw: &str) -> Option<(&str, &str)> {
    if let Some(idx) = raw.find("\r\n\r\n") {
        return Some((&raw[..idx], &raw[idx + 4..]));
    }
    if let Some(idx) = raw.find("\n\n") {
        return Some((&raw[..idx], &raw[idx + 2..]));
    }
    if raw.starts_with("HTTP/") {
        return Some((raw, ""));
    }
    None
}

/// Keystone v3 client issuing requests through curl.
pub struct KeystoneCurlClient {
    curl_bin: String,
    timeout_secs: u64,
    runner: Arc<dyn CliRunner>,
}

impl KeystoneCurlClient {
    pub fn new(curl_bin: &str, timeout_secs: u64) -> Self {
        Self::with_runner(curl_bin, timeout_secs, Arc::new(SystemCliRunner))
    }

    pub fn with_runner(curl_bin: &str, timeout_secs: u64, runner: Arc<dyn CliRunner>) -> Self {
        Self {
            curl_bin: curl_bin.to_string(),
            timeout_secs,
            runner,
        }
    }
}

/// Request material that must stay off the command line. curl reads it from
/// stdin via `@-`.
enum SecretInput<'a> {
    Body(&'a str),
    Header(&'a str),
}

fn curl_request(
    runner: &dyn CliRunner,
    curl_bin: &str,
    timeout_secs: u64,
    target: &ProbeTarget,
    method: &str,
    url: &str,
    headers: &[String],
    secret: SecretInput<'_>,
) -> Result<HttpResponse, OperationError> {
    let mut args = vec![
        "-sS".to_string(),
        "-i".to_string(),
        "-m".to_string(),
        timeout_secs.to_string(),
        "-X".to_string(),
        method.to_string(),
    ];
    if let Some(ca_cert) = target.ca_cert.as_ref() {
        args.push("--cacert".to_string());
        args.push(ca_cert.display().to_string());
    }
    for header in headers {
        args.push("-H".to_string());
        args.push(header.clone());
    }
    let input = match secret {
        SecretInput::Body(body) => {
            args.push("--data-binary".to_string());
            args.push("@-".to_string());
            body.to_string()
        }
        SecretInput::Header(header) => {
            args.push("-H".to_string());
            args.push("@-".to_string());
            format!("{}\n", header)
        }
    };
    args.push(url.to_string());

    let output = runner
        .run_with_input(curl_bin, &args, Some(&input))
        .map_err(|err| OperationError::Transport(format!("{:#}", err)))?;
    if !output.success() {
        return Err(OperationError::Transport(output.failure_summary(curl_bin)));
    }
    let response = parse_http_response(&output.stdout).ok_or_else(|| {
        OperationError::Transport(format!("unparseable http response from {}", url))
    })?;
    debug!(url = url, method = method, status = response.status, "keystone request completed");
    Ok(response)
}

fn classify_status(response: &HttpResponse, what: &str) -> Result<(), OperationError> {
    match response.status {
        200..=299 => Ok(()),
        403 => Err(OperationError::Forbidden(format!("{} returned http 403", what))),
        status => Err(OperationError::Transport(format!(
            "{} returned http {}: {}",
            what,
            status,
            excerpt(&response.body)
        ))),
    }
}

fn excerpt(body: &str) -> String {
    let trimmed = body.trim();
    let short = trimmed.chars().take(200).collect::<String>();
    if short.len() < trimmed.len() {
        format!("{}...", short)
    } else {
        short
    }
}

fn token_request_body(credentials: &Credentials, scope: &Scope) -> Value {
    let scope = match scope {
        Scope::Domain(name) => json!({ "domain": { "name": name } }),
        Scope::Project { name, domain } => {
            json!({ "project": { "name": name, "domain": { "name": domain } } })
        }
    };
    json!({
        "auth": {
            "identity": {
                "methods": ["password"],
                "password": {
                    "user": {
                        "name": credentials.username,
                        "domain": { "name": credentials.user_domain },
                        "password": credentials.password
                    }
                }
            },
            "scope": scope
        }
    })
}

impl IdentityClient for KeystoneCurlClient {
    fn open_session(
        &self,
        target: &ProbeTarget,
        credentials: &Credentials,
        scope: &Scope,
    ) -> Result<Box<dyn IdentitySession>, OperationError> {
        let body = token_request_body(credentials, scope).to_string();
        let url = format!("{}/auth/tokens", target.endpoint.trim_end_matches('/'));
        let response = curl_request(
            self.runner.as_ref(),
            &self.curl_bin,
            self.timeout_secs,
            target,
            "POST",
            &url,
            &["Content-Type: application/json".to_string()],
            SecretInput::Body(&body),
        )?;
        classify_status(&response, "token request")?;

        let token = response
            .header(SUBJECT_TOKEN_HEADER)
            .map(ToString::to_string)
            .ok_or_else(|| {
                OperationError::Transport("token response carried no X-Subject-Token".to_string())
            })?;

        Ok(Box::new(KeystoneSession {
            runner: Arc::clone(&self.runner),
            curl_bin: self.curl_bin.clone(),
            timeout_secs: self.timeout_secs,
            target: target.clone(),
            token,
        }))
    }
}

struct KeystoneSession {
    runner: Arc<dyn CliRunner>,
    curl_bin: String,
    timeout_secs: u64,
    target: ProbeTarget,
    token: String,
}

impl IdentitySession for KeystoneSession {
    fn perform(&self, operation: &ProbeOperation) -> Result<(), OperationError> {
        let url = format!(
            "{}{}",
            self.target.endpoint.trim_end_matches('/'),
            operation.path
        );
        let response = curl_request(
            self.runner.as_ref(),
            &self.curl_bin,
            self.timeout_secs,
            &self.target,
            &operation.method,
            &url,
            &[],
            SecretInput::Header(&format!("X-Auth-Token: {}", self.token)),
        )?;
        classify_status(&response, &operation.name)
    }
}

#[derive(Debug, Clone)]
pub struct KeystoneAdapterSettings {
    pub credentials: Credentials,
    pub port: u16,
    pub ca_cert: Option<PathBuf>,
    pub default_api_version: String,
    pub override_config_key: String,
}

/// Keystone adds a case proving that an override denying
/// `identity:list_services` is enforced by every unit.
#[derive(Debug, Clone)]
pub struct KeystoneAdapter {
    application: String,
    service: String,
    settings: KeystoneAdapterSettings,
}

impl KeystoneAdapter {
    pub fn new(application: &str, service: &str, settings: KeystoneAdapterSettings) -> Self {
        Self {
            application: application.to_string(),
            service: service.to_string(),
            settings,
        }
    }

    fn endpoint_for(&self, address: &str) -> String {
        let scheme = if self.settings.ca_cert.is_some() {
            "https"
        } else {
            "http"
        };
        let host = if address.contains(':') && !address.starts_with('[') {
            format!("[{}]", address)
        } else {
            address.to_string()
        };
        format!("{}://{}:{}/v3", scheme, host, self.settings.port)
    }
}

impl TargetAdapter for KeystoneAdapter {
    fn application(&self) -> &str {
        &self.application
    }

    fn service(&self) -> &str {
        &self.service
    }

    fn enforcement_case(&self) -> PolicydResult<Option<PolicyCase>> {
        let key = self.settings.override_config_key.as_str();
        Ok(Some(PolicyCase {
            name: ENFORCEMENT_CASE.to_string(),
            kind: CaseKind::Valid,
            bundle_name: "rules.zip".to_string(),
            bundle: PolicyBundle::single(LIST_SERVICES_RULE_ENTRY, LIST_SERVICES_RULE)?,
            checked_entry: LIST_SERVICES_RULE_ENTRY.to_string(),
            expected_content: LIST_SERVICES_RULE.to_string(),
            residual_entries: Vec::new(),
            scoped_config: Some(ScopedConfig {
                default: config_map([
                    ("preferred-api-version", self.settings.default_api_version.as_str()),
                    (key, "False"),
                ]),
                alternate: config_map([("preferred-api-version", "3")]),
            }),
            probes: Some(ProbePlan {
                operation: ProbeOperation {
                    name: "identity:list_services".to_string(),
                    method: "GET".to_string(),
                    path: "/services".to_string(),
                },
                credentials: self.settings.credentials.clone(),
                scope: Scope::Domain(self.settings.credentials.user_domain.clone()),
                baseline: Enforcement::Allowed,
                overridden: Enforcement::Denied,
            }),
        }))
    }

    fn probe_targets(&self, status: &ApplicationStatus) -> Vec<ProbeTarget> {
        status
            .units
            .iter()
            .filter_map(|unit| {
                let address = unit.address.as_ref()?;
                Some(ProbeTarget {
                    label: format!("{} ({})", unit.name, address),
                    endpoint: self.endpoint_for(address),
                    ca_cert: self.settings.ca_cert.clone(),
                })
            })
            .collect()
    }
}
