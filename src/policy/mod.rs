//! The whitelist policy document pushed by the management plane.

use serde::{Deserialize, Serialize};

pub mod store;

pub use store::PolicyStore;

/// Identifies a workload group (namespace + name). Doubles as the peer
/// reference in whitelist clauses and as a map key; the `Ord` derive gives
/// lexicographic (namespace, name) ordering.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WorkloadKey {
    pub namespace: String,
    pub name: String,
}

impl WorkloadKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for WorkloadKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyDocument {
    #[serde(default)]
    pub default_action: String,
    #[serde(default)]
    pub workloads: Vec<WorkloadPolicy>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadPolicy {
    pub namespace: String,
    pub name: String,
    /// Peers allowed to reach this workload. Empty means no ingress
    /// restriction.
    #[serde(default)]
    pub ingress_from: Vec<WorkloadKey>,
    /// Peers this workload may reach. Empty means no egress restriction.
    #[serde(default)]
    pub egress_to: Vec<WorkloadKey>,
    /// CIDR/port rules, consulted only when `ingress_from` is empty.
    #[serde(default)]
    pub rules: Vec<LegacyRule>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LegacyRule {
    #[serde(default)]
    pub action: String,
    #[serde(default, rename = "srcCIDR")]
    pub src_cidr: String,
    #[serde(default)]
    pub protocol: String,
    /// Destination port; 0 means unset. Meaningful only with a tcp/udp
    /// protocol.
    #[serde(default)]
    pub port: u16,
}

impl PolicyDocument {
    /// The document used when nothing was configured or persisted.
    pub fn default_accept() -> Self {
        Self {
            default_action: "ACCEPT".to_string(),
            workloads: Vec::new(),
        }
    }

    /// Fill in the default action when the management plane omitted it.
    pub fn normalized(mut self) -> Self {
        if self.default_action.trim().is_empty() {
            self.default_action = "ACCEPT".to_string();
        }
        self
    }

    pub fn workload(&self, key: &WorkloadKey) -> Option<&WorkloadPolicy> {
        self.workloads
            .iter()
            .find(|w| w.namespace == key.namespace && w.name == key.name)
    }
}

/// Map a policy action to an iptables target. Unrecognized actions map to
/// the empty string; the rule emitter drops such rules.
pub fn normalize_action(action: &str) -> &'static str {
    match action.trim().to_ascii_uppercase().as_str() {
        "ALLOW" | "ACCEPT" => "ACCEPT",
        "DENY" | "DROP" => "DROP",
        "REJECT" => "REJECT",
        "RETURN" => "RETURN",
        _ => "",
    }
}
