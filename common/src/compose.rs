use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::app::{AppContract, Runtime};
use crate::OVERLAY_NETWORK;

/// TLS certificate resolver the reverse proxy is configured with.
const TLS_RESOLVER: &str = "letsencrypt";

/// A generated compose file: one service named after the app, attached to
/// the shared overlay network, carrying the reverse-proxy routing labels.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct ComposeFile {
    pub services: BTreeMap<String, Service>,
    pub networks: BTreeMap<String, Network>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Service {
    pub image: String,
    pub container_name: String,
    pub restart: String,
    pub ports: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
    pub healthcheck: Healthcheck,
    pub deploy: Deploy,
    pub networks: Vec<String>,
    pub labels: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Healthcheck {
    pub test: Vec<String>,
    pub interval: String,
    pub timeout: String,
    pub retries: u32,
    pub start_period: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Deploy {
    pub resources: Resources,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Resources {
    pub limits: Limits,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Limits {
    pub memory: String,
    pub cpus: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Network {
    pub external: bool,
}

impl ComposeFile {
    /// Build the compose model for one app deployment. `env` is the already
    /// merged environment (contract beneath operator overrides).
    pub fn new(
        app_name: &str,
        image_tag: &str,
        contract: &AppContract,
        env: &BTreeMap<String, String>,
    ) -> Self {
        let ports = match contract.host_port {
            Some(host_port) => vec![format!("{host_port}:{}", contract.port)],
            None => vec![contract.port.to_string()],
        };

        let environment = env
            .iter()
            .map(|(k, v)| (k.clone(), escape_env(v)))
            .collect();

        let service = Service {
            image: image_tag.to_string(),
            container_name: app_name.to_string(),
            restart: "unless-stopped".to_string(),
            ports,
            environment,
            healthcheck: Healthcheck {
                test: health_test(
                    contract.runtime,
                    contract.port,
                    &contract.healthcheck.path,
                ),
                interval: contract.healthcheck.interval.clone(),
                timeout: contract.healthcheck.timeout.clone(),
                retries: contract.healthcheck.retries,
                start_period: contract.healthcheck.start_period.clone(),
            },
            deploy: Deploy {
                resources: Resources {
                    limits: Limits {
                        memory: contract.resources.memory.clone(),
                        cpus: contract.resources.cpu.clone(),
                    },
                },
            },
            networks: vec![OVERLAY_NETWORK.to_string()],
            labels: router_labels(app_name, contract.port, &contract.domains),
        };

        ComposeFile {
            services: BTreeMap::from([(app_name.to_string(), service)]),
            networks: BTreeMap::from([(
                OVERLAY_NETWORK.to_string(),
                Network { external: true },
            )]),
        }
    }

    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }
}

/// Compose interpolates `$VAR`; a literal dollar has to be doubled.
pub fn escape_env(value: &str) -> String {
    value.replace('$', "$$")
}

/// Reverse-proxy labels for the service: one router per domain entry plus a
/// single loadbalancer target. Longer path prefixes get higher priority so
/// they win over bare host rules.
pub fn router_labels(app_name: &str, port: u16, domains: &[String]) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();

    if domains.is_empty() {
        return labels;
    }

    labels.insert("traefik.enable".to_string(), "true".to_string());
    labels.insert(
        format!("traefik.http.services.{app_name}.loadbalancer.server.port"),
        port.to_string(),
    );

    for (i, domain) in domains.iter().enumerate() {
        let router = format!("{app_name}-{i}");
        let (host, prefix) = split_domain(domain);

        let (rule, priority) = match prefix {
            Some(prefix) => (
                format!("Host(`{host}`) && PathPrefix(`{prefix}`)"),
                100 + prefix.len(),
            ),
            None => (format!("Host(`{host}`)"), 1),
        };

        labels.insert(
            format!("traefik.http.routers.{router}.rule"),
            rule,
        );
        labels.insert(
            format!("traefik.http.routers.{router}.priority"),
            priority.to_string(),
        );
        labels.insert(
            format!("traefik.http.routers.{router}.entrypoints"),
            "websecure".to_string(),
        );
        labels.insert(
            format!("traefik.http.routers.{router}.tls.certresolver"),
            TLS_RESOLVER.to_string(),
        );
    }

    labels
}

/// Split a domain entry into host and optional path prefix:
/// `example.com` or `example.com/shop`.
fn split_domain(domain: &str) -> (&str, Option<&str>) {
    match domain.find('/') {
        Some(idx) => (&domain[..idx], Some(&domain[idx..])),
        None => (domain, None),
    }
}

/// The healthcheck command baked into the container, selected by runtime so
/// images without a shell toolchain still get a workable probe.
fn health_test(runtime: Runtime, port: u16, path: &str) -> Vec<String> {
    let url = format!("http://localhost:{port}{path}");

    match runtime {
        Runtime::Node => vec![
            "CMD".to_string(),
            "node".to_string(),
            "-e".to_string(),
            format!(
                "require('http').get('{url}', r => process.exit(r.statusCode < 400 ? 0 : 1)).on('error', () => process.exit(1))"
            ),
        ],
        Runtime::Python => vec![
            "CMD".to_string(),
            "python".to_string(),
            "-c".to_string(),
            format!(
                "import urllib.request, sys; sys.exit(0 if urllib.request.urlopen('{url}').status < 400 else 1)"
            ),
        ],
        Runtime::Go => vec![
            "CMD-SHELL".to_string(),
            format!("wget -q --spider {url} || exit 1"),
        ],
        Runtime::Ruby => vec![
            "CMD".to_string(),
            "ruby".to_string(),
            "-rnet/http".to_string(),
            "-e".to_string(),
            format!("exit(Net::HTTP.get_response(URI('{url}')).code.to_i < 400 ? 0 : 1)"),
        ],
        Runtime::Php => vec![
            "CMD".to_string(),
            "php".to_string(),
            "-r".to_string(),
            format!("exit(@file_get_contents('{url}') === false ? 1 : 0);"),
        ],
        Runtime::Generic => vec![
            "CMD-SHELL".to_string(),
            format!("curl -fsS {url} || wget -q -O- {url} || exit 1"),
        ],
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use pretty_assertions::assert_eq;

    use super::{escape_env, ComposeFile};
    use crate::app::AppContract;
    use crate::OVERLAY_NETWORK;

    fn contract(raw: &str) -> AppContract {
        AppContract::from_json(raw).unwrap()
    }

    #[test]
    fn yaml_round_trip_has_one_service() {
        let contract = contract(
            r#"{"name": "api", "domains": ["api.example.com", "example.com/api"]}"#,
        );
        let env = BTreeMap::from([("KEY".to_string(), "value".to_string())]);
        let compose = ComposeFile::new("api", "registry.local/api:abc123abc123", &contract, &env);

        let yaml = compose.to_yaml().unwrap();
        let parsed: ComposeFile = serde_yaml::from_str(&yaml).unwrap();

        assert_eq!(parsed.services.len(), 1);
        let service = &parsed.services["api"];
        assert_eq!(service.image, "registry.local/api:abc123abc123");
        assert_eq!(service.container_name, "api");
        assert_eq!(service.restart, "unless-stopped");
        assert_eq!(service.ports, vec!["8080".to_string()]);
        assert!(!service.healthcheck.test.is_empty());
        assert_eq!(service.networks, vec![OVERLAY_NETWORK.to_string()]);
        assert!(parsed.networks[OVERLAY_NETWORK].external);
    }

    #[test]
    fn host_port_maps_to_container_port() {
        let contract = contract(r#"{"name": "api", "port": 3000, "hostPort": 8090}"#);
        let compose = ComposeFile::new("api", "t", &contract, &BTreeMap::new());

        assert_eq!(compose.services["api"].ports, vec!["8090:3000".to_string()]);
    }

    #[test]
    fn router_labels_follow_domains_and_port() {
        let contract = contract(
            r#"{"name": "api", "port": 3000, "domains": ["api.example.com", "example.com/api"]}"#,
        );
        let compose = ComposeFile::new("api", "t", &contract, &BTreeMap::new());
        let labels = &compose.services["api"].labels;

        assert_eq!(labels["traefik.enable"], "true");
        assert_eq!(
            labels["traefik.http.services.api.loadbalancer.server.port"],
            "3000"
        );
        assert_eq!(
            labels["traefik.http.routers.api-0.rule"],
            "Host(`api.example.com`)"
        );
        assert_eq!(labels["traefik.http.routers.api-0.priority"], "1");
        assert_eq!(
            labels["traefik.http.routers.api-1.rule"],
            "Host(`example.com`) && PathPrefix(`/api`)"
        );
        // "/api" is four chars, so the prefixed router outranks the bare one
        assert_eq!(labels["traefik.http.routers.api-1.priority"], "104");
        assert_eq!(
            labels["traefik.http.routers.api-1.tls.certresolver"],
            "letsencrypt"
        );
    }

    #[test]
    fn no_domains_means_no_router_labels() {
        let contract = contract(r#"{"name": "api"}"#);
        let compose = ComposeFile::new("api", "t", &contract, &BTreeMap::new());

        assert!(compose.services["api"].labels.is_empty());
    }

    #[test]
    fn dollars_are_escaped() {
        assert_eq!(escape_env("pa$$word"), "pa$$$$word");
        assert_eq!(escape_env("plain"), "plain");

        let contract = contract(r#"{"name": "api"}"#);
        let env = BTreeMap::from([("SECRET".to_string(), "a$b".to_string())]);
        let compose = ComposeFile::new("api", "t", &contract, &env);

        assert_eq!(compose.services["api"].environment["SECRET"], "a$$b");
    }

    #[test]
    fn runtime_selects_health_command() {
        let node = contract(r#"{"name": "api", "runtime": "node"}"#);
        let compose = ComposeFile::new("api", "t", &node, &BTreeMap::new());
        assert_eq!(compose.services["api"].healthcheck.test[0], "CMD");
        assert_eq!(compose.services["api"].healthcheck.test[1], "node");

        let generic = contract(r#"{"name": "api"}"#);
        let compose = ComposeFile::new("api", "t", &generic, &BTreeMap::new());
        assert_eq!(compose.services["api"].healthcheck.test[0], "CMD-SHELL");
        assert!(compose.services["api"].healthcheck.test[1].contains("curl"));
    }
}
