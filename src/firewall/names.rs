//! Chain and IP-set identifier derivation.
//!
//! Kernel chain names are length-limited (28 on common kernels); encoded
//! identifiers are capped one word lower at 26 to leave margin. Truncation
//! is silent, so two workloads sharing a long prefix can alias to the same
//! identifier; operators must keep namespace/workload names short.

use crate::policy::WorkloadKey;

/// Prefix distinguishing this daemon's chains and sets from everything
/// else on the host (CNI chains included).
pub const CHAIN_PREFIX: &str = "MS";

const MAX_NAME_LEN: usize = 26;

/// Derive an identifier from (prefix, scope, qualifier): hyphen-joined,
/// upper-cased, any character outside [A-Z0-9-] replaced with '-', then
/// truncated to the length the kernel honors.
pub fn encode_name(prefix: &str, scope: &str, qualifier: &str) -> String {
    let raw = format!("{}-{}-{}", prefix, scope, qualifier);
    let mut encoded: String = raw
        .chars()
        .map(|c| {
            let c = c.to_ascii_uppercase();
            if c.is_ascii_uppercase() || c.is_ascii_digit() || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    encoded.truncate(MAX_NAME_LEN);
    encoded
}

/// The `<ns>-<wl>` qualifier shared by a workload's chains and sets.
pub fn workload_qualifier(key: &WorkloadKey) -> String {
    format!("{}-{}", key.namespace, key.name)
}
