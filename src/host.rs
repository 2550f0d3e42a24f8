//! Hosts taking part in a run, their roles, and the capability descriptor
//! resolved once per run.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Logical participant in a multi-host test. Role names are
/// case-insensitive and always stored lowercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Role {
    Sender,
    Receiver,
    Forwarder,
    Server,
    Client,
    /// Any workload-specific role name not covered above.
    Other(String),
}

impl Serialize for Role {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Role {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        if name.trim().is_empty() {
            return Err(serde::de::Error::custom("role cannot be empty"));
        }
        name.parse().map_err(serde::de::Error::custom)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Sender => write!(f, "sender"),
            Role::Receiver => write!(f, "receiver"),
            Role::Forwarder => write!(f, "forwarder"),
            Role::Server => write!(f, "server"),
            Role::Client => write!(f, "client"),
            Role::Other(name) => write!(f, "{}", name),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "sender" => Role::Sender,
            "receiver" => Role::Receiver,
            "forwarder" => Role::Forwarder,
            "server" => Role::Server,
            "client" => Role::Client,
            other => Role::Other(other.to_string()),
        })
    }
}

/// A remote machine taking part in a run. Immutable for the run's duration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    /// Short unique name used by the plan to refer to this host.
    pub name: String,
    /// IP address or DNS name.
    pub address: String,
    pub role: Role,
    /// Login user; falls back to the executor's configured user.
    #[serde(default)]
    pub user: Option<String>,
    /// Private key reference; falls back to the executor's configured key.
    #[serde(default)]
    pub identity_file: Option<String>,
    /// Capabilities, when known up front. Otherwise probed at run start.
    #[serde(default)]
    pub capabilities: Option<HostCapabilities>,
}

impl Host {
    pub fn new(name: impl Into<String>, address: impl Into<String>, role: Role) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            role,
            user: None,
            identity_file: None,
            capabilities: None,
        }
    }

    /// Check that the host entry is usable before a run starts.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("host name cannot be empty".to_string());
        }
        validate_address(&self.address)
            .map_err(|e| format!("host '{}': {}", self.name, e))
    }
}

/// Reject addresses that would be interpreted as ssh options or contain
/// shell metacharacters.
pub fn validate_address(address: &str) -> Result<(), String> {
    if address.is_empty() {
        return Err("address cannot be empty".to_string());
    }
    if address.starts_with('-') {
        return Err("address cannot start with hyphen".to_string());
    }
    // Allow alphanumeric, dot, hyphen, underscore, colon (IPv6)
    if address
        .chars()
        .any(|c| !c.is_alphanumeric() && c != '.' && c != '-' && c != '_' && c != ':')
    {
        return Err(format!("address '{}' contains invalid characters", address));
    }
    Ok(())
}

/// What a host's environment provides. Resolved once per run and handed to
/// every component that needs it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostCapabilities {
    /// `ID` from /etc/os-release, e.g. "ubuntu".
    #[serde(default)]
    pub distro: String,
    /// `VERSION_ID` from /etc/os-release.
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub kernel: String,
    /// Feature flags such as "sriov", "rdma", "nested_virt".
    #[serde(default)]
    pub features: BTreeSet<String>,
}

impl HostCapabilities {
    /// Build capabilities from the output of
    /// `cat /etc/os-release; echo; uname -r`.
    pub fn from_probe_output(output: &str) -> Self {
        let mut caps = HostCapabilities::default();
        for line in output.lines() {
            let line = line.trim();
            if let Some(v) = line.strip_prefix("ID=") {
                caps.distro = v.trim_matches('"').to_string();
            } else if let Some(v) = line.strip_prefix("VERSION_ID=") {
                caps.version = v.trim_matches('"').to_string();
            } else if !line.is_empty() && !line.contains('=') && caps.kernel.is_empty() {
                // uname -r prints a bare release string
                caps.kernel = line.to_string();
            }
        }
        caps
    }

    pub fn has_feature(&self, feature: &str) -> bool {
        self.features.contains(feature)
    }

    /// Features from `required` this host lacks.
    pub fn missing<'a>(&self, required: &'a [String]) -> Vec<&'a str> {
        required
            .iter()
            .filter(|f| !self.has_feature(f))
            .map(|f| f.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_parse_and_display() {
        assert_eq!("Sender".parse::<Role>().unwrap(), Role::Sender);
        assert_eq!("forwarder".parse::<Role>().unwrap(), Role::Forwarder);
        assert_eq!(
            "nvme-target".parse::<Role>().unwrap(),
            Role::Other("nvme-target".to_string())
        );
        assert_eq!(Role::Receiver.to_string(), "receiver");
    }

    #[test]
    fn test_validate_address() {
        assert!(validate_address("10.0.0.4").is_ok());
        assert!(validate_address("vm-01.internal").is_ok());
        assert!(validate_address("fe80::1").is_ok());
        assert!(validate_address("").is_err());
        assert!(validate_address("-oProxyCommand=x").is_err());
        assert!(validate_address("host;rm -rf").is_err());
    }

    #[test]
    fn test_capabilities_from_probe_output() {
        let out = "NAME=\"Ubuntu\"\nID=ubuntu\nVERSION_ID=\"22.04\"\n\n5.15.0-1057-azure\n";
        let caps = HostCapabilities::from_probe_output(out);
        assert_eq!(caps.distro, "ubuntu");
        assert_eq!(caps.version, "22.04");
        assert_eq!(caps.kernel, "5.15.0-1057-azure");
    }

    #[test]
    fn test_missing_features() {
        let mut caps = HostCapabilities::default();
        caps.features.insert("sriov".to_string());
        let required = vec!["sriov".to_string(), "rdma".to_string()];
        assert_eq!(caps.missing(&required), vec!["rdma"]);
    }

    #[test]
    fn test_role_deserializes_from_toml() {
        #[derive(Deserialize)]
        struct Wrapper {
            role: Role,
        }
        let w: Wrapper = toml::from_str("role = \"receiver\"").unwrap();
        assert_eq!(w.role, Role::Receiver);
        let w: Wrapper = toml::from_str("role = \"initiator\"").unwrap();
        assert_eq!(w.role, Role::Other("initiator".to_string()));
    }

    #[test]
    fn test_role_names_ignore_case() {
        #[derive(Deserialize)]
        struct Wrapper {
            role: Role,
        }
        let w: Wrapper = toml::from_str("role = \"Sender\"").unwrap();
        assert_eq!(w.role, Role::Sender);
        let w: Wrapper = toml::from_str("role = \"RECEIVER\"").unwrap();
        assert_eq!(w.role, Role::Receiver);
        let w: Wrapper = toml::from_str("role = \"Initiator\"").unwrap();
        assert_eq!(w.role, Role::Other("initiator".to_string()));
        assert!(toml::from_str::<Wrapper>("role = \"\"").is_err());

        assert_eq!(serde_json::to_string(&Role::Sender).unwrap(), "\"sender\"");
        let mut per_role = std::collections::BTreeMap::new();
        per_role.insert(Role::Other("initiator".to_string()), 1);
        assert_eq!(serde_json::to_string(&per_role).unwrap(), "{\"initiator\":1}");
    }
}
