use crate::error::{Error, Result};
use crate::firewall::JumpPosition;
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    /// Node this daemon filters for; pods on other nodes only contribute
    /// peer addresses.
    pub node_name: String,

    // Admin API
    pub api_bind: SocketAddr,
    pub api_token: Option<String>,

    // Policy persistence
    pub policy_file: Option<PathBuf>,

    // FORWARD chain jump placement
    pub forward_jump_position: JumpPosition,
}

impl DaemonConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            node_name: env::var("NODE_NAME")
                .map_err(|_| Error::ConfigError("NODE_NAME required".into()))?,
            api_bind: parse_bind_addr(
                &env::var("API_BIND").unwrap_or_else(|_| ":18080".to_string()),
            )?,
            api_token: env::var("API_TOKEN")
                .ok()
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty()),
            policy_file: env::var("POLICY_FILE")
                .ok()
                .filter(|p| !p.trim().is_empty())
                .map(PathBuf::from),
            forward_jump_position: match env::var("FORWARD_JUMP_POSITION") {
                Ok(v) => v.parse()?,
                Err(_) => JumpPosition::Insert,
            },
        })
    }
}

/// Parse a listen address, accepting the bare-port form `:18080` as a
/// shorthand for all interfaces.
fn parse_bind_addr(addr: &str) -> Result<SocketAddr> {
    let full = if addr.starts_with(':') {
        format!("0.0.0.0{}", addr)
    } else {
        addr.to_string()
    };
    full.parse()
        .map_err(|_| Error::ConfigError(format!("Invalid API_BIND address: {}", addr)))
}

/// Parse an interval string like "30s", "2m", "1h30m" into a Duration.
pub fn parse_interval(interval_str: &str) -> Result<Duration> {
    let mut total_seconds = 0u64;
    let mut current_num = String::new();

    for ch in interval_str.chars() {
        if ch.is_ascii_digit() {
            current_num.push(ch);
        } else if !current_num.is_empty() {
            let num: u64 = current_num
                .parse()
                .map_err(|_| Error::ConfigError(format!("Invalid number: {}", current_num)))?;

            match ch {
                'h' => total_seconds += num * 3600,
                'm' => total_seconds += num * 60,
                's' => total_seconds += num,
                _ => return Err(Error::ConfigError(format!("Invalid time unit: {}", ch))),
            }

            current_num.clear();
        } else {
            return Err(Error::ConfigError(format!(
                "Invalid interval: {}",
                interval_str
            )));
        }
    }

    if !current_num.is_empty() {
        return Err(Error::ConfigError(
            "Interval must end with a unit (h/m/s)".to_string(),
        ));
    }
    if total_seconds == 0 {
        return Err(Error::ConfigError("Interval must be non-zero".to_string()));
    }

    Ok(Duration::from_secs(total_seconds))
}
