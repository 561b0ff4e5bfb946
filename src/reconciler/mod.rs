//! The reconciliation core: turns (workload snapshot, pod snapshot,
//! policy) into the node's chain topology and rule state.
//!
//! Each sync replaces the contents of every owned chain wholesale, so the
//! state after a cycle is a pure function of the inputs and a transient
//! failure heals on the next tick.

use crate::cluster::{ClusterReader, ClusterSnapshot};
use crate::config::DaemonConfig;
use crate::error::Result;
use crate::firewall::names::{self, CHAIN_PREFIX};
use crate::firewall::{FilterDriver, JumpPosition};
use crate::policy::{PolicyDocument, PolicyStore, WorkloadKey};
use crate::telemetry::Metrics;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{error, info, warn};

pub mod rules;

type PodIpMap = BTreeMap<WorkloadKey, Vec<String>>;

/// Everything a fully-synced workload contributed this cycle; the caller
/// registers it as desired only on success.
struct WorkloadState {
    chain_in: String,
    chain_out: String,
    sets: Vec<String>,
}

pub struct Reconciler {
    driver: FilterDriver,
    store: Arc<PolicyStore>,
    metrics: Arc<Metrics>,
    node_name: String,
    jump_position: JumpPosition,
}

impl Reconciler {
    pub fn new(
        config: &DaemonConfig,
        driver: FilterDriver,
        store: Arc<PolicyStore>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            driver,
            store,
            metrics,
            node_name: config.node_name.clone(),
            jump_position: config.forward_jump_position,
        }
    }

    /// One full reconciliation pass. Idempotent: unchanged inputs produce
    /// unchanged packet-filter state.
    pub async fn sync(&self, reader: &ClusterReader) -> Result<()> {
        self.metrics.record_sync();
        let snapshot = reader.snapshot().await?;
        let policy = self.store.get();
        self.apply(&snapshot, &policy)
    }

    /// The driver-facing half of a sync, separated from snapshot I/O so
    /// its behavior is a function of its arguments.
    pub fn apply(&self, snapshot: &ClusterSnapshot, policy: &PolicyDocument) -> Result<()> {
        let (all_pod_ips, local_pod_ips) = project(snapshot, &self.node_name);

        let root_in = names::encode_name(CHAIN_PREFIX, "ROOT", "IN");
        let root_out = names::encode_name(CHAIN_PREFIX, "ROOT", "OUT");
        self.driver.ensure_chain(&root_out)?;
        self.driver.ensure_chain(&root_in)?;

        // The FORWARD chain must evaluate OUT before IN. Under append the
        // OUT jump goes in first; under insert-at-1 the IN jump goes in
        // first so the OUT jump ends up in front of it.
        match self.jump_position {
            JumpPosition::Insert => {
                self.driver.ensure_jump(&root_in, self.jump_position)?;
                self.driver.ensure_jump(&root_out, self.jump_position)?;
            }
            JumpPosition::Append => {
                self.driver.ensure_jump(&root_out, self.jump_position)?;
                self.driver.ensure_jump(&root_in, self.jump_position)?;
            }
        }

        let mut desired_in = Vec::new();
        let mut desired_out = Vec::new();
        let mut desired_sets = BTreeSet::new();

        for (key, local_ips) in &local_pod_ips {
            match self.sync_workload(key, local_ips, policy, &all_pod_ips) {
                Ok(workload) => {
                    desired_in.push(workload.chain_in);
                    desired_out.push(workload.chain_out);
                    desired_sets.extend(workload.sets);
                }
                Err(err) => {
                    warn!("workload {} skipped this cycle: {}", key, err);
                    self.metrics.record_workload_skipped();
                }
            }
        }

        desired_in.sort();
        desired_out.sort();
        self.rebuild_root(&root_in, &desired_in);
        self.rebuild_root(&root_out, &desired_out);

        let desired_chains: BTreeSet<String> =
            desired_in.into_iter().chain(desired_out).collect();
        self.collect_garbage(&desired_chains, &desired_sets);

        info!("sync completed for node {}", self.node_name);
        Ok(())
    }

    /// Rebuild one workload's chains and sets. Any error skips the
    /// workload for the cycle; nothing the workload built is registered
    /// as desired until every step succeeded, so a half-synced workload
    /// (set in place, chain rules missing) is collected like any other
    /// stale state instead of surviving unreferenced.
    fn sync_workload(
        &self,
        key: &WorkloadKey,
        local_ips: &[String],
        policy: &PolicyDocument,
        all_pod_ips: &PodIpMap,
    ) -> Result<WorkloadState> {
        let qualifier = names::workload_qualifier(key);
        let chain_in = names::encode_name(CHAIN_PREFIX, "IN", &qualifier);
        let chain_out = names::encode_name(CHAIN_PREFIX, "OUT", &qualifier);

        self.driver.ensure_chain(&chain_in)?;
        self.driver.ensure_chain(&chain_out)?;

        let workload_policy = policy.workload(key);
        let mut sets = Vec::new();

        let mut src_set = None;
        if let Some(wp) = workload_policy {
            if !wp.ingress_from.is_empty() {
                let set = names::encode_name(CHAIN_PREFIX, "SRC", &qualifier);
                let allowed = rules::collect_peer_ips(&wp.ingress_from, all_pod_ips);
                self.driver.sync_ipset(&set, &allowed)?;
                sets.push(set.clone());
                src_set = Some(set);
            }
        }

        let mut dst_set = None;
        if let Some(wp) = workload_policy {
            if !wp.egress_to.is_empty() {
                let set = names::encode_name(CHAIN_PREFIX, "DST", &qualifier);
                let allowed = rules::collect_peer_ips(&wp.egress_to, all_pod_ips);
                self.driver.sync_ipset(&set, &allowed)?;
                sets.push(set.clone());
                dst_set = Some(set);
            }
        }

        let ingress = rules::build_ingress_rules(local_ips, policy, key, src_set.as_deref());
        self.driver.sync_rules(&chain_in, &ingress)?;

        let egress = rules::build_egress_rules(local_ips, dst_set.as_deref());
        self.driver.sync_rules(&chain_out, &egress)?;

        Ok(WorkloadState {
            chain_in,
            chain_out,
            sets,
        })
    }

    /// Rewrite a root chain: conntrack ACCEPT first so return traffic of
    /// established flows never meets the whitelist, then the workload
    /// jumps in identifier order.
    fn rebuild_root(&self, root: &str, workload_chains: &[String]) {
        let mut root_rules = vec![vec![
            "-m".to_string(),
            "conntrack".to_string(),
            "--ctstate".to_string(),
            "ESTABLISHED,RELATED".to_string(),
            "-j".to_string(),
            "ACCEPT".to_string(),
        ]];
        for chain in workload_chains {
            root_rules.push(vec!["-j".to_string(), chain.clone()]);
        }
        if let Err(err) = self.driver.sync_rules(root, &root_rules) {
            error!("sync rules for {}: {}", root, err);
        }
    }

    /// Remove owned workload chains and sets that no current workload
    /// accounts for. Runs after the root chains were rewritten, so the
    /// victims are unreferenced. Best-effort.
    fn collect_garbage(&self, desired_chains: &BTreeSet<String>, desired_sets: &BTreeSet<String>) {
        let chain_prefixes = [
            format!("{}-IN-", CHAIN_PREFIX),
            format!("{}-OUT-", CHAIN_PREFIX),
        ];
        match self.driver.list_chains() {
            Ok(chains) => {
                for chain in chains {
                    let owned = chain_prefixes.iter().any(|p| chain.starts_with(p.as_str()));
                    if owned && !desired_chains.contains(&chain) {
                        match self.driver.delete_chain(&chain) {
                            Ok(()) => info!("removed stale chain {}", chain),
                            Err(err) => warn!("remove stale chain {}: {}", chain, err),
                        }
                    }
                }
            }
            Err(err) => warn!("list chains for cleanup: {}", err),
        }

        let set_prefixes = [
            format!("{}-SRC-", CHAIN_PREFIX),
            format!("{}-DST-", CHAIN_PREFIX),
        ];
        match self.driver.list_sets() {
            Ok(sets) => {
                for set in sets {
                    let owned = set_prefixes.iter().any(|p| set.starts_with(p.as_str()));
                    if owned && !desired_sets.contains(&set) {
                        match self.driver.destroy_set(&set) {
                            Ok(()) => info!("removed stale ipset {}", set),
                            Err(err) => warn!("remove stale ipset {}: {}", set, err),
                        }
                    }
                }
            }
            Err(err) => warn!("list ipsets for cleanup: {}", err),
        }
    }
}

/// Build the workload -> pod-IP maps, cluster-wide and node-local. Pods
/// without an IP yet contribute nothing.
fn project(snapshot: &ClusterSnapshot, node_name: &str) -> (PodIpMap, PodIpMap) {
    let mut all_pod_ips = PodIpMap::new();
    let mut local_pod_ips = PodIpMap::new();

    for pod in &snapshot.pods {
        if pod.ip.trim().is_empty() {
            continue;
        }
        for workload in &snapshot.workloads {
            if workload.selector.matches(&pod.labels) {
                all_pod_ips
                    .entry(workload.key.clone())
                    .or_default()
                    .push(pod.ip.clone());
                if pod.node == node_name {
                    local_pod_ips
                        .entry(workload.key.clone())
                        .or_default()
                        .push(pod.ip.clone());
                }
            }
        }
    }

    (all_pod_ips, local_pod_ips)
}
