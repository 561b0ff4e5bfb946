//! Thin blocking wrapper around the host `iptables` and `ipset` binaries.
//!
//! Every iptables invocation passes `-w` so the call waits for the xtables
//! lock instead of failing when another writer (typically the CNI daemon)
//! holds it. The driver never reads state and then writes based on that
//! read, except where a lost race is tolerable and detected.

use crate::error::{Error, Result};
use std::process::Command;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

pub mod names;

const IPTABLES: &str = "iptables";
const IPSET: &str = "ipset";

/// The shared kernel chain traversed by forwarded traffic; the only chain
/// the daemon touches that it does not own.
pub const FORWARD_CHAIN: &str = "FORWARD";

/// Placement of the daemon's jumps in the FORWARD chain. `Insert` puts
/// them ahead of CNI rules; `Append` is defeated when the CNI accepts
/// traffic earlier in the chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JumpPosition {
    Insert,
    Append,
}

impl FromStr for JumpPosition {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "insert" => Ok(JumpPosition::Insert),
            "append" => Ok(JumpPosition::Append),
            other => Err(Error::ConfigError(format!(
                "Invalid FORWARD_JUMP_POSITION: {}",
                other
            ))),
        }
    }
}

/// Subprocess choke point. The one production implementation shells out;
/// tests substitute an in-memory kernel model.
pub trait ToolRunner: Send + Sync {
    fn run(&self, tool: &str, args: &[String]) -> Result<String>;
}

/// Runs the tool on the host, surfacing stderr on non-zero exit.
pub struct HostRunner;

impl ToolRunner for HostRunner {
    fn run(&self, tool: &str, args: &[String]) -> Result<String> {
        let output = Command::new(tool)
            .args(args)
            .output()
            .map_err(|e| Error::CommandError {
                tool: tool.to_string(),
                message: e.to_string(),
            })?;
        if !output.status.success() {
            return Err(Error::CommandError {
                tool: tool.to_string(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

pub struct FilterDriver {
    runner: Arc<dyn ToolRunner>,
}

impl FilterDriver {
    pub fn new(runner: Arc<dyn ToolRunner>) -> Self {
        Self { runner }
    }

    pub fn host() -> Self {
        Self::new(Arc::new(HostRunner))
    }

    fn iptables<I, S>(&self, args: I) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut full = vec!["-w".to_string()];
        full.extend(args.into_iter().map(Into::into));
        self.runner.run(IPTABLES, &full)
    }

    fn ipset<I, S>(&self, args: I) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let full: Vec<String> = args.into_iter().map(Into::into).collect();
        self.runner.run(IPSET, &full)
    }

    /// Create the chain if it does not exist. A concurrent creator winning
    /// the race between inspection and creation counts as success.
    pub fn ensure_chain(&self, chain: &str) -> Result<()> {
        if self.iptables(["-n", "-L", chain]).is_ok() {
            return Ok(());
        }
        match self.iptables(["-N", chain]) {
            Ok(_) => {
                info!("created chain {}", chain);
                Ok(())
            }
            Err(create_err) => {
                if self.iptables(["-n", "-L", chain]).is_ok() {
                    Ok(())
                } else {
                    Err(create_err)
                }
            }
        }
    }

    /// Guarantee a FORWARD rule jumping to `root`. Append mode leaves an
    /// existing jump alone; insert mode deletes any existing jump
    /// (best-effort) and reinserts at index 1 so it stays in front.
    pub fn ensure_jump(&self, root: &str, position: JumpPosition) -> Result<()> {
        match position {
            JumpPosition::Insert => {
                let _ = self.iptables(["-D", FORWARD_CHAIN, "-j", root]);
                self.iptables(["-I", FORWARD_CHAIN, "1", "-j", root])?;
                Ok(())
            }
            JumpPosition::Append => {
                if self.iptables(["-C", FORWARD_CHAIN, "-j", root]).is_ok() {
                    return Ok(());
                }
                self.iptables(["-A", FORWARD_CHAIN, "-j", root])?;
                Ok(())
            }
        }
    }

    /// Replace the chain's contents with `rules`, in order. The chain
    /// itself is never deleted. `changed` is always true; no diffing.
    pub fn sync_rules(&self, chain: &str, rules: &[Vec<String>]) -> Result<bool> {
        self.iptables(["-F", chain])?;
        for rule in rules {
            let mut args = vec!["-A".to_string(), chain.to_string()];
            args.extend(rule.iter().cloned());
            self.iptables(args)?;
        }
        debug!("rules synced for chain {}", chain);
        Ok(true)
    }

    /// Replace the membership of a hash:ip set with `elements`, building a
    /// temporary set and swapping so kernel readers never observe the set
    /// mid-update.
    pub fn sync_ipset(&self, set: &str, elements: &[String]) -> Result<()> {
        let temp = format!("{}-T", set);
        self.ipset(["create", set, "hash:ip", "-exist"])?;
        self.ipset(["create", temp.as_str(), "hash:ip", "-exist"])?;
        self.ipset(["flush", temp.as_str()])?;
        for element in elements {
            self.ipset(["add", temp.as_str(), element.as_str()])?;
        }
        self.ipset(["swap", temp.as_str(), set])?;
        self.ipset(["destroy", temp.as_str()])?;
        debug!("ipset {} synced with {} elements", set, elements.len());
        Ok(())
    }

    /// All chain names in the filter table.
    pub fn list_chains(&self) -> Result<Vec<String>> {
        let output = self.iptables(["-S"])?;
        Ok(output
            .lines()
            .filter_map(|line| line.strip_prefix("-N "))
            .map(|name| name.trim().to_string())
            .collect())
    }

    /// Flush and delete a chain. Fails while rules still reference it.
    pub fn delete_chain(&self, chain: &str) -> Result<()> {
        self.iptables(["-F", chain])?;
        self.iptables(["-X", chain])?;
        Ok(())
    }

    /// All set names known to ipset.
    pub fn list_sets(&self) -> Result<Vec<String>> {
        let output = self.ipset(["list", "-n"])?;
        Ok(output
            .lines()
            .map(|line| line.trim().to_string())
            .filter(|line| !line.is_empty())
            .collect())
    }

    /// Destroy a set. Fails while rules still reference it.
    pub fn destroy_set(&self, set: &str) -> Result<()> {
        self.ipset(["destroy", set])?;
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::fake::FakeRunner;
    use super::*;

    fn jump(root: &str) -> Vec<String> {
        vec!["-j".to_string(), root.to_string()]
    }

    #[test]
    fn test_ensure_chain_creates_once() {
        let runner = FakeRunner::new();
        let driver = FilterDriver::new(runner.clone());

        driver.ensure_chain("MS-ROOT-IN").unwrap();
        driver.ensure_chain("MS-ROOT-IN").unwrap();

        assert_eq!(runner.chain("MS-ROOT-IN"), Some(Vec::new()));
        let creates = runner
            .state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|(_, args)| args.iter().any(|a| a == "-N"))
            .count();
        assert_eq!(creates, 1);
    }

    #[test]
    fn test_ensure_jump_append_idempotent() {
        let runner = FakeRunner::new();
        let driver = FilterDriver::new(runner.clone());

        driver.ensure_jump("MS-ROOT-IN", JumpPosition::Append).unwrap();
        driver.ensure_jump("MS-ROOT-IN", JumpPosition::Append).unwrap();

        let forward = runner.chain(FORWARD_CHAIN).unwrap();
        assert_eq!(forward, vec![jump("MS-ROOT-IN")]);
    }

    #[test]
    fn test_ensure_jump_insert_converges_to_single_front_jump() {
        let runner = FakeRunner::new();
        // a CNI rule already sits in FORWARD
        runner
            .state
            .lock()
            .unwrap()
            .chains
            .get_mut(FORWARD_CHAIN)
            .unwrap()
            .push(vec!["-j".to_string(), "CNI-FORWARD".to_string()]);
        let driver = FilterDriver::new(runner.clone());

        for _ in 0..3 {
            driver.ensure_jump("MS-ROOT-IN", JumpPosition::Insert).unwrap();
        }

        let forward = runner.chain(FORWARD_CHAIN).unwrap();
        let ours: Vec<_> = forward
            .iter()
            .filter(|r| **r == jump("MS-ROOT-IN"))
            .collect();
        assert_eq!(ours.len(), 1);
        assert_eq!(forward[0], jump("MS-ROOT-IN"));
        assert_eq!(forward[1], jump("CNI-FORWARD"));
    }

    #[test]
    fn test_sync_rules_replaces_contents() {
        let runner = FakeRunner::new();
        let driver = FilterDriver::new(runner.clone());
        driver.ensure_chain("MS-IN-DEFAULT-WEB").unwrap();
        driver
            .sync_rules(
                "MS-IN-DEFAULT-WEB",
                &[vec!["-d".into(), "10.0.0.9".into(), "-j".into(), "ACCEPT".into()]],
            )
            .unwrap();

        let rules = vec![
            vec!["-d".to_string(), "10.0.0.5".to_string(), "-j".to_string(), "ACCEPT".to_string()],
            vec!["-d".to_string(), "10.0.0.5".to_string(), "-j".to_string(), "DROP".to_string()],
        ];
        let changed = driver.sync_rules("MS-IN-DEFAULT-WEB", &rules).unwrap();

        assert!(changed);
        assert_eq!(runner.chain("MS-IN-DEFAULT-WEB"), Some(rules));
    }

    #[test]
    fn test_sync_ipset_replaces_and_cleans_up() {
        let runner = FakeRunner::new();
        let driver = FilterDriver::new(runner.clone());

        driver
            .sync_ipset("MS-SRC-DEFAULT-WEB", &["10.0.1.7".to_string()])
            .unwrap();
        assert_eq!(
            runner.set("MS-SRC-DEFAULT-WEB").unwrap().into_iter().collect::<Vec<_>>(),
            vec!["10.0.1.7".to_string()]
        );

        driver
            .sync_ipset("MS-SRC-DEFAULT-WEB", &["10.0.2.1".to_string(), "10.0.2.2".to_string()])
            .unwrap();
        let members = runner.set("MS-SRC-DEFAULT-WEB").unwrap();
        assert_eq!(members.len(), 2);
        assert!(members.contains("10.0.2.1"));

        // the temporary swap set never survives
        assert!(runner.set("MS-SRC-DEFAULT-WEB-T").is_none());
    }

    #[test]
    fn test_sync_ipset_empty_is_legal() {
        let runner = FakeRunner::new();
        let driver = FilterDriver::new(runner.clone());

        driver.sync_ipset("MS-DST-DEFAULT-WEB", &["10.0.0.1".to_string()]).unwrap();
        driver.sync_ipset("MS-DST-DEFAULT-WEB", &[]).unwrap();
        assert!(runner.set("MS-DST-DEFAULT-WEB").unwrap().is_empty());
    }

    #[test]
    fn test_list_and_delete_chains() {
        let runner = FakeRunner::new();
        let driver = FilterDriver::new(runner.clone());
        driver.ensure_chain("MS-IN-DEFAULT-WEB").unwrap();
        driver.ensure_chain("MS-OUT-DEFAULT-WEB").unwrap();

        let chains = driver.list_chains().unwrap();
        assert!(chains.contains(&"MS-IN-DEFAULT-WEB".to_string()));
        assert!(!chains.contains(&FORWARD_CHAIN.to_string()));

        driver.delete_chain("MS-IN-DEFAULT-WEB").unwrap();
        assert!(runner.chain("MS-IN-DEFAULT-WEB").is_none());
    }

    #[test]
    fn test_delete_chain_fails_while_referenced() {
        let runner = FakeRunner::new();
        let driver = FilterDriver::new(runner.clone());
        driver.ensure_chain("MS-ROOT-IN").unwrap();
        driver.ensure_chain("MS-IN-DEFAULT-WEB").unwrap();
        driver
            .sync_rules(
                "MS-ROOT-IN",
                &[vec!["-j".to_string(), "MS-IN-DEFAULT-WEB".to_string()]],
            )
            .unwrap();

        assert!(driver.delete_chain("MS-IN-DEFAULT-WEB").is_err());
    }

    #[test]
    fn test_jump_position_parsing() {
        assert_eq!("insert".parse::<JumpPosition>().unwrap(), JumpPosition::Insert);
        assert_eq!("append".parse::<JumpPosition>().unwrap(), JumpPosition::Append);
        assert!("prepend".parse::<JumpPosition>().is_err());
    }
}
