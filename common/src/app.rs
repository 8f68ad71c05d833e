use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// The contract file checked into each app repository at
/// `{repo}/{workdir}/paasdeploy.json`.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AppContract {
    pub name: String,
    #[serde(default)]
    pub runtime: Runtime,
    #[serde(default)]
    pub build: BuildConfig,
    #[serde(default)]
    pub healthcheck: HealthcheckConfig,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub host_port: Option<u16>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub resources: ResourceLimits,
    #[serde(default)]
    pub domains: Vec<String>,
}

impl AppContract {
    pub fn from_json(raw: &str) -> Result<Self, ContractError> {
        let contract: AppContract = serde_json::from_str(raw)?;
        validate_name(&contract.name)?;
        Ok(contract)
    }

    /// Contract env vars merged beneath operator-configured ones: a key set
    /// through the platform always wins over the repository's value.
    pub fn merged_env(&self, configured: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        let mut merged = self.env.clone();
        for (key, value) in configured {
            merged.insert(key.clone(), value.clone());
        }
        merged
    }
}

/// App names double as container and compose service names: 2-63 chars,
/// lowercase alphanumerics and hyphens, starting and ending alphanumeric.
pub fn validate_name(name: &str) -> Result<(), ContractError> {
    let valid = name.len() >= 2
        && name.len() <= 63
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.starts_with('-')
        && !name.ends_with('-');

    if valid {
        Ok(())
    } else {
        Err(ContractError::InvalidName(name.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ContractError {
    #[error("invalid app name '{0}': expected 2-63 lowercase alphanumerics or hyphens")]
    InvalidName(String),
    #[error("invalid duration '{0}': expected forms like 30s, 2m or 500ms")]
    InvalidDuration(String),
    #[error("failed to parse contract: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Display, Serialize, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum Runtime {
    Node,
    Python,
    Go,
    Ruby,
    Php,
    #[default]
    Generic,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BuildConfig {
    #[serde(rename = "type", default = "default_build_type")]
    pub build_type: String,
    #[serde(default = "default_dockerfile")]
    pub dockerfile: String,
    #[serde(default = "default_context")]
    pub context: String,
    #[serde(default)]
    pub args: BTreeMap<String, String>,
    #[serde(default)]
    pub target: Option<String>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            build_type: default_build_type(),
            dockerfile: default_dockerfile(),
            context: default_context(),
            args: BTreeMap::new(),
            target: None,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HealthcheckConfig {
    #[serde(default = "default_health_path")]
    pub path: String,
    #[serde(default = "default_interval")]
    pub interval: String,
    #[serde(default = "default_timeout")]
    pub timeout: String,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_start_period")]
    pub start_period: String,
}

impl HealthcheckConfig {
    pub fn start_period_duration(&self) -> Result<Duration, ContractError> {
        parse_duration(&self.start_period)
    }
}

impl Default for HealthcheckConfig {
    fn default() -> Self {
        Self {
            path: default_health_path(),
            interval: default_interval(),
            timeout: default_timeout(),
            retries: default_retries(),
            start_period: default_start_period(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct ResourceLimits {
    #[serde(default = "default_memory")]
    pub memory: String,
    #[serde(default = "default_cpu")]
    pub cpu: String,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory: default_memory(),
            cpu: default_cpu(),
        }
    }
}

/// Parse the duration forms the contract file allows: `500ms`, `30s`, `2m`.
pub fn parse_duration(raw: &str) -> Result<Duration, ContractError> {
    let raw = raw.trim();
    let err = || ContractError::InvalidDuration(raw.to_string());

    let (digits, unit) = raw.split_at(raw.find(|c: char| !c.is_ascii_digit()).ok_or_else(err)?);
    let value: u64 = digits.parse().map_err(|_| err())?;

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        _ => Err(err()),
    }
}

fn default_port() -> u16 {
    8080
}

fn default_build_type() -> String {
    "dockerfile".to_string()
}

fn default_dockerfile() -> String {
    "./Dockerfile".to_string()
}

fn default_context() -> String {
    ".".to_string()
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_interval() -> String {
    "30s".to_string()
}

fn default_timeout() -> String {
    "5s".to_string()
}

fn default_retries() -> u32 {
    3
}

fn default_start_period() -> String {
    "10s".to_string()
}

fn default_memory() -> String {
    "512m".to_string()
}

fn default_cpu() -> String {
    "0.5".to_string()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use super::{parse_duration, validate_name, AppContract, Runtime};

    #[test]
    fn minimal_contract_gets_defaults() {
        let contract = AppContract::from_json(r#"{"name": "api"}"#).unwrap();

        assert_eq!(contract.name, "api");
        assert_eq!(contract.runtime, Runtime::Generic);
        assert_eq!(contract.port, 8080);
        assert_eq!(contract.host_port, None);
        assert_eq!(contract.build.dockerfile, "./Dockerfile");
        assert_eq!(contract.build.context, ".");
        assert_eq!(contract.healthcheck.path, "/health");
        assert_eq!(contract.healthcheck.interval, "30s");
        assert_eq!(contract.healthcheck.retries, 3);
        assert_eq!(contract.resources.memory, "512m");
        assert_eq!(contract.resources.cpu, "0.5");
        assert!(contract.domains.is_empty());
    }

    #[test]
    fn full_contract_round_trips() {
        let raw = r#"{
            "name": "web-shop",
            "runtime": "node",
            "build": {"type": "dockerfile", "dockerfile": "./docker/Dockerfile", "context": "./", "args": {"NODE_ENV": "production"}},
            "healthcheck": {"path": "/healthz", "interval": "10s", "timeout": "2s", "retries": 5, "startPeriod": "20s"},
            "port": 3000,
            "hostPort": 8090,
            "env": {"LOG_LEVEL": "debug"},
            "resources": {"memory": "1g", "cpu": "1.5"},
            "domains": ["shop.example.com", "example.com/shop"]
        }"#;

        let contract = AppContract::from_json(raw).unwrap();
        assert_eq!(contract.runtime, Runtime::Node);
        assert_eq!(contract.port, 3000);
        assert_eq!(contract.host_port, Some(8090));
        assert_eq!(contract.healthcheck.start_period, "20s");
        assert_eq!(
            contract.healthcheck.start_period_duration().unwrap(),
            Duration::from_secs(20)
        );
        assert_eq!(contract.domains.len(), 2);
    }

    #[test]
    fn name_validation() {
        assert!(validate_name("api").is_ok());
        assert!(validate_name("my-app-2").is_ok());
        assert!(validate_name("a").is_err());
        assert!(validate_name("Has-Upper").is_err());
        assert!(validate_name("-leading").is_err());
        assert!(validate_name("trailing-").is_err());
        assert!(validate_name(&"x".repeat(64)).is_err());
    }

    #[test]
    fn env_merge_prefers_configured() {
        let contract = AppContract::from_json(
            r#"{"name": "api", "env": {"A": "contract", "B": "contract"}}"#,
        )
        .unwrap();

        let configured = BTreeMap::from([("B".to_string(), "operator".to_string())]);
        let merged = contract.merged_env(&configured);

        assert_eq!(merged["A"], "contract");
        assert_eq!(merged["B"], "operator");
    }

    #[test]
    fn durations() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert!(parse_duration("30").is_err());
        assert!(parse_duration("s").is_err());
        assert!(parse_duration("1h").is_err());
    }
}
