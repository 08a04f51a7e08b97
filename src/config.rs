use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};

use crate::error::{PolicydError, PolicydResult};
use crate::juju::JujuCli;
use crate::keystone::{KeystoneAdapter, KeystoneAdapterSettings, KeystoneCurlClient};
use crate::orchestrator::OrchestratorSettings;
use crate::poll::PollOptions;
use crate::probe::Credentials;
use crate::release::OpenStackRelease;
use crate::target::{GenericAdapter, TargetAdapter};

const ENV_FILE_ENV: &str = "POLICYD_ENV_FILE";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    Generic,
    Keystone,
}

impl TargetKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "generic" => Some(Self::Generic),
            "keystone" => Some(Self::Keystone),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub application: String,
    pub service: String,
    pub target: String,
    pub juju_bin: String,
    pub juju_model: Option<String>,
    pub resource_name: String,
    pub config_key: String,
    pub poll_timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub idle_timeout_secs: u64,
    pub os_release: Option<String>,
    pub curl_bin: String,
    pub request_timeout_secs: u64,
    pub keystone: KeystoneSettings,
}

#[derive(Clone)]
pub struct KeystoneSettings {
    pub username: String,
    pub password: String,
    pub domain: String,
    pub port: u16,
    pub ca_cert: Option<PathBuf>,
    pub default_api_version: String,
}

impl std::fmt::Debug for KeystoneSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeystoneSettings")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("domain", &self.domain)
            .field("port", &self.port)
            .field("ca_cert", &self.ca_cert)
            .field("default_api_version", &self.default_api_version)
            .finish()
    }
}

impl Settings {
    pub fn load() -> Result<Self> {
        load_dotenv()?;

        let application = read_string_env("POLICYD_APPLICATION", "keystone");
        let service =
            read_non_empty_env("POLICYD_SERVICE").unwrap_or_else(|| application.clone());
        let target = read_string_env("POLICYD_TARGET", "generic").to_ascii_lowercase();

        let keystone = KeystoneSettings {
            username: read_string_env("POLICYD_KEYSTONE_USERNAME", "demo_admin"),
            password: env::var("POLICYD_KEYSTONE_PASSWORD")
                .unwrap_or_else(|_| "password".to_string()),
            domain: read_string_env("POLICYD_KEYSTONE_DOMAIN", "demo_domain"),
            port: read_u16_env("POLICYD_KEYSTONE_PORT", 5000),
            ca_cert: read_non_empty_env("POLICYD_KEYSTONE_CACERT").map(PathBuf::from),
            default_api_version: read_string_env("POLICYD_KEYSTONE_DEFAULT_API_VERSION", "3"),
        };

        Ok(Self {
            application,
            service,
            target,
            juju_bin: read_string_env("POLICYD_JUJU_BIN", "juju"),
            juju_model: read_non_empty_env("POLICYD_JUJU_MODEL"),
            resource_name: read_string_env("POLICYD_RESOURCE_NAME", "policyd-override"),
            config_key: read_string_env("POLICYD_CONFIG_KEY", "use-policyd-override"),
            poll_timeout_secs: read_u64_env("POLICYD_POLL_TIMEOUT_SECS", 2700),
            poll_interval_ms: read_u64_env("POLICYD_POLL_INTERVAL_MS", 5000),
            idle_timeout_secs: read_u64_env("POLICYD_IDLE_TIMEOUT_SECS", 2700),
            os_release: read_non_empty_env("POLICYD_OS_RELEASE"),
            curl_bin: read_string_env("POLICYD_CURL_BIN", "curl"),
            request_timeout_secs: read_u64_env("POLICYD_REQUEST_TIMEOUT_SECS", 30),
            keystone,
        })
    }

    pub fn target_kind(&self) -> PolicydResult<TargetKind> {
        TargetKind::parse(&self.target).ok_or_else(|| {
            PolicydError::Config(format!(
                "POLICYD_TARGET '{}' is not one of: generic, keystone",
                self.target
            ))
        })
    }

    pub fn openstack_release(&self) -> PolicydResult<Option<OpenStackRelease>> {
        self.os_release
            .as_deref()
            .map(str::parse::<OpenStackRelease>)
            .transpose()
    }

    pub fn poll_options(&self) -> PollOptions {
        PollOptions::new(
            Duration::from_secs(self.poll_timeout_secs),
            Duration::from_millis(self.poll_interval_ms),
        )
    }

    /// The idle barrier retries on the same interval as the predicate poller.
    pub fn idle_options(&self) -> PollOptions {
        PollOptions::new(
            Duration::from_secs(self.idle_timeout_secs),
            Duration::from_millis(self.poll_interval_ms),
        )
    }

    pub fn orchestrator_settings(&self) -> PolicydResult<OrchestratorSettings> {
        Ok(OrchestratorSettings {
            resource_name: self.resource_name.clone(),
            override_config_key: self.config_key.clone(),
            poll: self.poll_options(),
            idle: self.idle_options(),
            os_release: self.openstack_release()?,
        })
    }

    pub fn keystone_adapter_settings(&self) -> KeystoneAdapterSettings {
        KeystoneAdapterSettings {
            credentials: Credentials {
                username: self.keystone.username.clone(),
                password: self.keystone.password.clone(),
                user_domain: self.keystone.domain.clone(),
            },
            port: self.keystone.port,
            ca_cert: self.keystone.ca_cert.clone(),
            default_api_version: self.keystone.default_api_version.clone(),
            override_config_key: self.config_key.clone(),
        }
    }

    pub fn target_adapter(&self) -> PolicydResult<Box<dyn TargetAdapter>> {
        let adapter: Box<dyn TargetAdapter> = match self.target_kind()? {
            TargetKind::Generic => Box::new(GenericAdapter::new(&self.application, &self.service)),
            TargetKind::Keystone => Box::new(KeystoneAdapter::new(
                &self.application,
                &self.service,
                self.keystone_adapter_settings(),
            )),
        };
        Ok(adapter)
    }

    pub fn deployment_model(&self) -> JujuCli {
        JujuCli::new(&self.juju_bin, self.juju_model.clone())
    }

    pub fn identity_client(&self) -> KeystoneCurlClient {
        KeystoneCurlClient::new(&self.curl_bin, self.request_timeout_secs)
    }

    pub fn doctor_report(&self) -> DoctorReport {
        let mut warnings = Vec::new();

        for (key, value) in [
            ("POLICYD_POLL_TIMEOUT_SECS", self.poll_timeout_secs),
            ("POLICYD_POLL_INTERVAL_MS", self.poll_interval_ms),
            ("POLICYD_IDLE_TIMEOUT_SECS", self.idle_timeout_secs),
            ("POLICYD_REQUEST_TIMEOUT_SECS", self.request_timeout_secs),
        ] {
            if value == 0 {
                warnings.push(format!("{} should be > 0", key));
            }
        }
        if self.poll_interval_ms > self.poll_timeout_secs.saturating_mul(1000) {
            warnings.push(
                "POLICYD_POLL_INTERVAL_MS is larger than POLICYD_POLL_TIMEOUT_SECS; predicates get a single attempt"
                    .to_string(),
            );
        }
        if self.application.is_empty() {
            warnings.push("POLICYD_APPLICATION is empty".to_string());
        }

        let target_kind = TargetKind::parse(&self.target);
        if target_kind.is_none() {
            warnings.push(format!(
                "POLICYD_TARGET '{}' is unknown; expected generic or keystone",
                self.target
            ));
        }

        match self.openstack_release() {
            Ok(Some(release)) if !release.supports_policy_overrides() => warnings.push(format!(
                "POLICYD_OS_RELEASE {} predates {}; every case will be skipped",
                release,
                OpenStackRelease::minimum()
            )),
            Ok(_) => {}
            Err(err) => warnings.push(format!("POLICYD_OS_RELEASE is invalid: {}", err)),
        }

        if target_kind == Some(TargetKind::Keystone) {
            if self.keystone.username.is_empty() || self.keystone.password.is_empty() {
                warnings.push(
                    "Keystone target selected but POLICYD_KEYSTONE_USERNAME or POLICYD_KEYSTONE_PASSWORD is empty"
                        .to_string(),
                );
            }
            if self.keystone.domain.is_empty() {
                warnings.push(
                    "Keystone target selected but POLICYD_KEYSTONE_DOMAIN is empty".to_string(),
                );
            }
        }
        if let Some(path) = self.keystone.ca_cert.as_ref() {
            if !path.is_file() {
                warnings.push(format!(
                    "POLICYD_KEYSTONE_CACERT points at a missing file: {}",
                    path.display()
                ));
            }
        }

        DoctorReport {
            application: self.application.clone(),
            service: self.service.clone(),
            target: self.target.clone(),
            juju_bin: self.juju_bin.clone(),
            juju_model: self.juju_model.clone(),
            resource_name: self.resource_name.clone(),
            config_key: self.config_key.clone(),
            poll_timeout_secs: self.poll_timeout_secs,
            poll_interval_ms: self.poll_interval_ms,
            idle_timeout_secs: self.idle_timeout_secs,
            os_release: self.os_release.clone(),
            curl_bin: self.curl_bin.clone(),
            request_timeout_secs: self.request_timeout_secs,
            keystone_username: self.keystone.username.clone(),
            keystone_password_loaded: !self.keystone.password.is_empty(),
            keystone_domain: self.keystone.domain.clone(),
            keystone_port: self.keystone.port,
            keystone_ca_cert: self.keystone.ca_cert.clone(),
            warnings,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DoctorReport {
    pub application: String,
    pub service: String,
    pub target: String,
    pub juju_bin: String,
    pub juju_model: Option<String>,
    pub resource_name: String,
    pub config_key: String,
    pub poll_timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub idle_timeout_secs: u64,
    pub os_release: Option<String>,
    pub curl_bin: String,
    pub request_timeout_secs: u64,
    pub keystone_username: String,
    pub keystone_password_loaded: bool,
    pub keystone_domain: String,
    pub keystone_port: u16,
    pub keystone_ca_cert: Option<PathBuf>,
    pub warnings: Vec<String>,
}

fn read_string_env(key: &str, default: &str) -> String {
    env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .trim()
        .to_string()
}

fn read_non_empty_env(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn read_u64_env(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn read_u16_env(key: &str, default: u16) -> u16 {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u16>().ok())
        .unwrap_or(default)
}

fn load_dotenv() -> Result<()> {
    if let Ok(path) = env::var(ENV_FILE_ENV) {
        if !path.trim().is_empty() {
            dotenvy::from_path(path.trim())
                .with_context(|| format!("failed loading {} from {}", ENV_FILE_ENV, path.trim()))?;
            return Ok(());
        }
    }

    if Path::new(".env").exists() {
        dotenvy::from_path(".env").context("failed loading .env from current directory")?;
    }

    Ok(())
}
