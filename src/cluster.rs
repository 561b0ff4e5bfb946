//! Cluster snapshot access: projects Deployments and Pods into the small
//! views the reconciler consumes. Snapshots are full lists on purpose —
//! the reconciler is a pure function of (policy, snapshot) with no
//! incremental watch state to diverge.

use crate::error::Result;
use crate::policy::WorkloadKey;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::ListParams;
use kube::{Api, Client};
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

/// Per-pod projection: labels, IP (may be empty while the pod starts up),
/// and the node it runs on.
#[derive(Clone, Debug, Default)]
pub struct PodView {
    pub labels: BTreeMap<String, String>,
    pub ip: String,
    pub node: String,
}

/// Per-workload projection: identity plus the compiled selector.
#[derive(Clone, Debug)]
pub struct WorkloadView {
    pub key: WorkloadKey,
    pub selector: Selector,
}

#[derive(Clone, Debug, Default)]
pub struct ClusterSnapshot {
    pub workloads: Vec<WorkloadView>,
    pub pods: Vec<PodView>,
}

/// A compiled label selector: the conjunction of equality clauses and
/// set-membership expressions.
#[derive(Clone, Debug, Default)]
pub struct Selector {
    match_labels: BTreeMap<String, String>,
    match_expressions: Vec<Expression>,
}

#[derive(Clone, Debug)]
struct Expression {
    key: String,
    operator: Operator,
    values: BTreeSet<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Operator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

impl Selector {
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        for (key, value) in &self.match_labels {
            if labels.get(key) != Some(value) {
                return false;
            }
        }
        for expr in &self.match_expressions {
            if !expr.matches(labels) {
                return false;
            }
        }
        true
    }
}

impl Expression {
    fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match self.operator {
            Operator::In => labels
                .get(&self.key)
                .is_some_and(|v| self.values.contains(v)),
            Operator::NotIn => labels
                .get(&self.key)
                .is_none_or(|v| !self.values.contains(v)),
            Operator::Exists => labels.contains_key(&self.key),
            Operator::DoesNotExist => !labels.contains_key(&self.key),
        }
    }
}

impl TryFrom<&LabelSelector> for Selector {
    type Error = String;

    fn try_from(selector: &LabelSelector) -> std::result::Result<Self, String> {
        let mut match_expressions = Vec::new();
        for requirement in selector.match_expressions.iter().flatten() {
            let values: BTreeSet<String> = requirement
                .values
                .clone()
                .unwrap_or_default()
                .into_iter()
                .collect();
            let operator = match requirement.operator.as_str() {
                "In" => Operator::In,
                "NotIn" => Operator::NotIn,
                "Exists" => Operator::Exists,
                "DoesNotExist" => Operator::DoesNotExist,
                other => return Err(format!("unknown operator {}", other)),
            };
            match operator {
                Operator::In | Operator::NotIn if values.is_empty() => {
                    return Err(format!("{} requires values for key {}", requirement.operator, requirement.key));
                }
                Operator::Exists | Operator::DoesNotExist if !values.is_empty() => {
                    return Err(format!("{} takes no values for key {}", requirement.operator, requirement.key));
                }
                _ => {}
            }
            match_expressions.push(Expression {
                key: requirement.key.clone(),
                operator,
                values,
            });
        }
        Ok(Self {
            match_labels: selector.match_labels.clone().unwrap_or_default(),
            match_expressions,
        })
    }
}

/// Reads full-cluster snapshots. Pods are listed cluster-wide so peer
/// whitelists resolve IPs for pods on other nodes.
pub struct ClusterReader {
    client: Client,
}

impl ClusterReader {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn snapshot(&self) -> Result<ClusterSnapshot> {
        let deployments = Api::<Deployment>::all(self.client.clone())
            .list(&ListParams::default())
            .await?;

        let mut workloads = Vec::new();
        for deployment in deployments.items {
            let (Some(namespace), Some(name)) =
                (deployment.metadata.namespace, deployment.metadata.name)
            else {
                continue;
            };
            let key = WorkloadKey::new(namespace, name);
            let Some(spec) = deployment.spec else {
                continue;
            };
            match Selector::try_from(&spec.selector) {
                Ok(selector) => workloads.push(WorkloadView { key, selector }),
                Err(reason) => warn!("invalid selector for {}: {}", key, reason),
            }
        }

        let pods = Api::<Pod>::all(self.client.clone())
            .list(&ListParams::default())
            .await?;
        let pods = pods
            .items
            .into_iter()
            .map(|pod| PodView {
                labels: pod.metadata.labels.unwrap_or_default(),
                ip: pod
                    .status
                    .and_then(|status| status.pod_ip)
                    .unwrap_or_default(),
                node: pod
                    .spec
                    .and_then(|spec| spec.node_name)
                    .unwrap_or_default(),
            })
            .collect();

        Ok(ClusterSnapshot { workloads, pods })
    }
}
