use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::rules::{ConditionKind, ConditionOp};

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub listeners: Vec<ListenerConfig>,
    #[serde(default)]
    pub node_groups: Vec<NodeGroupConfig>,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

/// A listener is, essentially, an opened port on the server that will wait for
/// connections and requests.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ListenerConfig {
    /// TCP address to listen on, in the form "host:port".
    pub addr: String,

    /// Enables HTTP/2 support for this listener. HTTPS needed.
    #[serde(default)]
    pub http2: bool,

    /// TLS settings. With at least one certificate the listener serves HTTPS.
    #[serde(default)]
    pub tls: Option<TlsConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    #[serde(default)]
    pub certs: Vec<CertificateConfig>,

    /// Minimum TLS version supported by the listener. Zero means TLS 1.0.
    #[serde(default)]
    pub min_tls_version: u16,

    /// Maximum TLS version supported by the listener. Zero means TLS 1.3.
    #[serde(default)]
    pub max_tls_version: u16,
}

/// Certificate and key file paths for use on TLS.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CertificateConfig {
    pub cert_file: String,
    pub key_file: String,
}

/// A named group of target node servers balanced together.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NodeGroupConfig {
    pub name: String,
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,

    /// Connections to this group use HTTPS.
    #[serde(default)]
    pub https: bool,

    /// Load balancing algorithm used to route requests to this group:
    /// "rr", "wrr" or "lc".
    pub algorithm: String,

    #[serde(default)]
    pub health_check: HealthCheckConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NodeConfig {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

/// Health check settings of a node group. Missing or zero fields fall back to
/// probing "/" every 5 seconds with a 3 second timeout.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    pub path: String,
    /// Seconds between health check requests.
    pub interval: u64,
    /// Seconds until a health check request is considered failed.
    pub timeout: u64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            path: "/".to_string(),
            interval: 5,
            timeout: 3,
        }
    }
}

impl HealthCheckConfig {
    /// Returns a copy with empty or zero fields replaced by the defaults.
    pub fn normalized(&self) -> Self {
        let defaults = Self::default();
        Self {
            path: if self.path.is_empty() {
                defaults.path
            } else {
                self.path.clone()
            },
            interval: if self.interval == 0 {
                defaults.interval
            } else {
                self.interval
            },
            timeout: if self.timeout == 0 {
                defaults.timeout
            } else {
                self.timeout
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RuleConfig {
    #[serde(default)]
    pub priority: i32,

    /// Address of the listener this rule applies to.
    pub listener: String,

    #[serde(default)]
    pub conditions: Vec<ConditionConfig>,

    #[serde(default)]
    pub action: ActionConfig,

    /// Reserved.
    #[serde(default)]
    pub dynamic: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConditionConfig {
    #[serde(default)]
    pub not: bool,

    /// Condition type code: 0=Path, 1=Query, 2=BodyString, 3=BodyForm,
    /// 4=Header, 5=IP.
    #[serde(rename = "type")]
    pub kind: u8,

    #[serde(default)]
    pub key: String,

    /// Operation code: 0=Equal, 1=BeginWith, 2=Regex, 3=Range.
    pub operation: u8,

    #[serde(default)]
    pub value: String,
}

/// The three action facets are co-resident on the wire; the first non-empty
/// one, checked in field order, wins.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ActionConfig {
    #[serde(default)]
    pub node_group: String,
    #[serde(default)]
    pub reject: RejectConfig,
    #[serde(default)]
    pub redirect: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RejectConfig {
    #[serde(default)]
    pub status_code: u16,
    #[serde(default)]
    pub message: String,
}

impl Config {
    /// Load the configuration JSON from a file and validate it.
    pub async fn load(path: &str) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read config file: {}", path))?;

        let config: Config = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration. Anything the runtime would have to panic on
    /// later is rejected here instead.
    pub fn validate(&self) -> Result<()> {
        for listener in &self.listeners {
            if listener.addr.is_empty() {
                bail!("listener addr cannot be empty");
            }
        }

        let mut group_names = HashSet::new();
        for group in &self.node_groups {
            if group.name.is_empty() {
                bail!("node group name cannot be empty");
            }
            if !group_names.insert(group.name.as_str()) {
                bail!("duplicate node group name: {}", group.name);
            }
            if !matches!(group.algorithm.as_str(), "rr" | "wrr" | "lc") {
                bail!(
                    "invalid load balancing algorithm {} in node group {}",
                    group.algorithm,
                    group.name
                );
            }
            for node in &group.nodes {
                if node.weight == 0 {
                    bail!(
                        "node {}:{} in group {} has zero weight",
                        node.host,
                        node.port,
                        group.name
                    );
                }
            }
        }

        for rule in &self.rules {
            for condition in &rule.conditions {
                let kind = ConditionKind::try_from(condition.kind)
                    .with_context(|| format!("rule with priority {}", rule.priority))?;
                let op = ConditionOp::try_from(condition.operation)
                    .with_context(|| format!("rule with priority {}", rule.priority))?;
                match (kind, op) {
                    (ConditionKind::Ip, ConditionOp::Range) => {}
                    (ConditionKind::Ip, _) | (_, ConditionOp::Range) => bail!(
                        "rule with priority {}: operation {} is not valid for condition type {}",
                        rule.priority,
                        condition.operation,
                        condition.kind
                    ),
                    _ => {}
                }
                if op == ConditionOp::Regex {
                    regex::Regex::new(&condition.value.to_lowercase()).with_context(|| {
                        format!(
                            "rule with priority {}: invalid regex {:?}",
                            rule.priority, condition.value
                        )
                    })?;
                }
            }

            let action = &rule.action;
            if !action.node_group.is_empty() && !group_names.contains(action.node_group.as_str())
            {
                bail!(
                    "rule with priority {} references unknown node group {}",
                    rule.priority,
                    action.node_group
                );
            }
            if action.node_group.is_empty()
                && action.reject.status_code != 0
                && !(100..=599).contains(&action.reject.status_code)
            {
                bail!(
                    "rule with priority {} has invalid reject status code {}",
                    rule.priority,
                    action.reject.status_code
                );
            }
        }

        Ok(())
    }
}
