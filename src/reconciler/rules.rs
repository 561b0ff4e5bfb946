//! Rule synthesis. Every function here is a pure mapping from (policy,
//! pod IPs) to iptables argument vectors; the sync engine decides where
//! the output lands.

use crate::policy::{normalize_action, LegacyRule, PolicyDocument, WorkloadKey, WorkloadPolicy};
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

fn rule(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

/// Ingress rules for one workload's IN chain.
///
/// No policy, or a policy with neither whitelist nor legacy rules, permits
/// everything addressed to the workload's pods. A whitelist emits a
/// set-match ACCEPT immediately followed by a DROP per pod IP, so traffic
/// that fails the set match is rejected before the next pod's ACCEPT can
/// see it.
pub fn build_ingress_rules(
    local_ips: &[String],
    policy: &PolicyDocument,
    key: &WorkloadKey,
    src_set: Option<&str>,
) -> Vec<Vec<String>> {
    let Some(workload_policy) = policy.workload(key) else {
        return accept_all(local_ips);
    };

    if workload_policy.ingress_from.is_empty() {
        if !workload_policy.rules.is_empty() {
            return build_legacy_ingress_rules(local_ips, policy, workload_policy, key);
        }
        return accept_all(local_ips);
    }

    let mut rules = Vec::new();
    for ip in local_ips {
        if let Some(set) = src_set {
            rules.push(rule(&[
                "-m", "set", "--match-set", set, "src", "-d", ip, "-j", "ACCEPT",
            ]));
        }
        rules.push(rule(&["-d", ip, "-j", "DROP"]));
    }
    rules
}

/// Egress rules for one workload's OUT chain. Permitted traffic RETURNs
/// rather than ACCEPTs so control rejoins the forwarding chain and still
/// meets the destination's IN chain.
pub fn build_egress_rules(local_ips: &[String], dst_set: Option<&str>) -> Vec<Vec<String>> {
    let Some(set) = dst_set else {
        return local_ips
            .iter()
            .map(|ip| rule(&["-s", ip, "-j", "RETURN"]))
            .collect();
    };

    let mut rules = Vec::new();
    for ip in local_ips {
        rules.push(rule(&[
            "-m", "set", "--match-set", set, "dst", "-s", ip, "-j", "RETURN",
        ]));
        rules.push(rule(&["-s", ip, "-j", "DROP"]));
    }
    rules
}

/// CIDR/port rules, active only when no ingress whitelist is configured.
fn build_legacy_ingress_rules(
    local_ips: &[String],
    policy: &PolicyDocument,
    workload_policy: &WorkloadPolicy,
    key: &WorkloadKey,
) -> Vec<Vec<String>> {
    let mut rules = Vec::new();
    for ip in local_ips {
        for legacy in &workload_policy.rules {
            if let Some(args) = legacy_rule_args(ip, legacy, &policy.default_action, key) {
                rules.push(args);
            }
        }
    }
    rules
}

fn legacy_rule_args(
    ip: &str,
    legacy: &LegacyRule,
    default_action: &str,
    key: &WorkloadKey,
) -> Option<Vec<String>> {
    let mut action = normalize_action(&legacy.action);
    if action.is_empty() {
        action = normalize_action(default_action);
    }
    // both the rule action and the default failed to normalize
    if action.is_empty() {
        warn!("policy rule with unusable action skipped for {}", key);
        return None;
    }

    let mut args = vec!["-d".to_string(), ip.to_string()];
    if !legacy.src_cidr.trim().is_empty() {
        args.push("-s".to_string());
        args.push(legacy.src_cidr.clone());
    }

    let protocol = legacy.protocol.trim();
    if !protocol.is_empty() {
        args.push("-p".to_string());
        args.push(protocol.to_ascii_lowercase());
        if legacy.port > 0 {
            args.push("--dport".to_string());
            args.push(legacy.port.to_string());
        }
    } else if legacy.port > 0 {
        warn!("policy rule ignored port without protocol for {}", key);
    }

    args.push("-j".to_string());
    args.push(action.to_string());
    Some(args)
}

fn accept_all(local_ips: &[String]) -> Vec<Vec<String>> {
    local_ips
        .iter()
        .map(|ip| rule(&["-d", ip, "-j", "ACCEPT"]))
        .collect()
}

/// Expand peer references into the union of their pod IPs, deduplicated
/// and sorted.
pub fn collect_peer_ips(
    peers: &[WorkloadKey],
    all_pod_ips: &BTreeMap<WorkloadKey, Vec<String>>,
) -> Vec<String> {
    let mut unique = BTreeSet::new();
    for peer in peers {
        if let Some(ips) = all_pod_ips.get(peer) {
            unique.extend(ips.iter().cloned());
        }
    }
    unique.into_iter().collect()
}
