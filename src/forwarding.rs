use serde::{Deserialize, Serialize};

use crate::error::{TunnelError, TunnelResult};

/// Direction of a forward
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardingMode {
    /// Listen locally, connect to the target through the jump host (`-L`)
    #[default]
    Local,
    /// Listen on the jump host, connect to the target from this machine (`-R`)
    Remote,
}

impl ForwardingMode {
    /// Convert to SSH flag string
    pub fn to_ssh_flag(&self) -> &'static str {
        match self {
            ForwardingMode::Local => "-L",
            ForwardingMode::Remote => "-R",
        }
    }
}

/// Represents a port forwarding specification
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ForwardSpec {
    /// Which side listens
    pub mode: ForwardingMode,
    /// Bind address (optional)
    pub bind_address: Option<String>,
    /// Bind port, 0 requests an ephemeral port
    pub bind_port: u16,
    /// Host the relayed connections are delivered to
    pub target_host: String,
    /// Port the relayed connections are delivered to
    pub target_port: u16,
    /// Free-form label shown to the operator
    #[serde(default)]
    pub label: String,
}

impl ForwardSpec {
    /// Parse a forwarding specification string
    ///
    /// Supported formats:
    /// - "port:host:port" (e.g., "8080:127.0.0.1:8080")
    /// - "address:port:host:port" (e.g., "0.0.0.0:8080:127.0.0.1:8080")
    /// - IPv6 addresses must be enclosed in brackets, e.g., "[::1]:80:localhost:80"
    pub fn parse(spec: &str, mode: ForwardingMode) -> TunnelResult<Self> {
        // Parse from right to left so bracketed IPv6 bind addresses keep their colons.
        // Format is always: [bind_addr:]bind_port:target_host:target_port

        let last_colon = spec
            .rfind(':')
            .ok_or_else(|| TunnelError::config(format!("Invalid forwarding specification: {spec}")))?;

        let target_port_str = &spec[last_colon + 1..];
        let target_port = target_port_str
            .parse::<u16>()
            .map_err(|_| TunnelError::config(format!("Invalid target port: {target_port_str}")))?;

        let rest = &spec[..last_colon];

        let (rest2, target_host) = split_host_suffix(rest)
            .ok_or_else(|| TunnelError::config(format!("Invalid forwarding specification: {spec}")))?;

        let (bind_addr, bind_port_str) = match split_host_prefix(rest2) {
            Some((addr, port)) => (Some(addr), port),
            None => (None, rest2),
        };

        let bind_port = bind_port_str
            .parse::<u16>()
            .map_err(|_| TunnelError::config(format!("Invalid bind port: {bind_port_str}")))?;

        if target_host.is_empty() {
            return Err(TunnelError::config(format!(
                "Missing target host in forwarding specification: {spec}"
            )));
        }

        Ok(ForwardSpec {
            mode,
            bind_address: bind_addr.filter(|a| !a.is_empty()),
            bind_port,
            target_host,
            target_port,
            label: String::new(),
        })
    }

    /// Attach an operator label
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Convert to SSH forwarding argument format
    pub fn to_ssh_arg(&self) -> String {
        let host = bracket(&self.target_host);
        match &self.bind_address {
            Some(addr) => format!(
                "{}:{}:{}:{}",
                bracket(addr),
                self.bind_port,
                host,
                self.target_port
            ),
            None => format!("{}:{}:{}", self.bind_port, host, self.target_port),
        }
    }

    /// Identifier of this forward within its group, e.g. `-L 8080:db:5432`
    pub fn id(&self) -> String {
        format!("{} {}", self.mode.to_ssh_flag(), self.to_ssh_arg())
    }

    /// Get the effective bind address (default to 127.0.0.1 if not specified)
    pub fn effective_bind_address(&self) -> &str {
        match (&self.bind_address, self.mode) {
            (Some(addr), _) => addr,
            (None, ForwardingMode::Local) => "127.0.0.1",
            (None, ForwardingMode::Remote) => "localhost",
        }
    }

    /// Check the fields a spec needs before it can be bound
    pub fn validate(&self) -> TunnelResult<()> {
        if self.target_host.trim().is_empty() {
            return Err(TunnelError::config(format!(
                "Forward {} has an empty target host",
                self.id()
            )));
        }
        if self.target_port == 0 {
            return Err(TunnelError::config(format!(
                "Forward {} has target port 0",
                self.id()
            )));
        }
        if self.label.chars().any(|c| c.is_control()) {
            return Err(TunnelError::config(format!(
                "Label of forward {} must be printable",
                self.id()
            )));
        }
        Ok(())
    }
}

impl std::fmt::Display for ForwardSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.label.is_empty() {
            write!(f, "{}", self.id())
        } else {
            write!(f, "{} ({})", self.id(), self.label)
        }
    }
}

/// Split "<prefix>:<host>" where host may be bracketed
fn split_host_suffix(s: &str) -> Option<(&str, String)> {
    if s.ends_with(']') {
        let open = s.rfind('[')?;
        let prefix = s[..open].strip_suffix(':')?;
        return Some((prefix, s[open + 1..s.len() - 1].to_string()));
    }
    let idx = s.rfind(':')?;
    Some((&s[..idx], s[idx + 1..].to_string()))
}

/// Split "<addr>:<port>" where addr may be bracketed; None if there is no address
fn split_host_prefix(s: &str) -> Option<(String, &str)> {
    if let Some(inner) = s.strip_prefix('[') {
        let close = inner.find(']')?;
        let port = inner[close + 1..].strip_prefix(':')?;
        return Some((inner[..close].to_string(), port));
    }
    let idx = s.rfind(':')?;
    Some((s[..idx].to_string(), &s[idx + 1..]))
}

fn bracket(host: &str) -> String {
    if host.contains(':') {
        format!("[{host}]")
    } else {
        host.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_three_part_spec() {
        let spec = ForwardSpec::parse("8080:127.0.0.1:9000", ForwardingMode::Local).unwrap();
        assert_eq!(spec.bind_address, None);
        assert_eq!(spec.bind_port, 8080);
        assert_eq!(spec.target_host, "127.0.0.1");
        assert_eq!(spec.target_port, 9000);
    }

    #[test]
    fn test_parse_four_part_spec() {
        let spec =
            ForwardSpec::parse("0.0.0.0:8080:192.168.1.10:9000", ForwardingMode::Remote).unwrap();
        assert_eq!(spec.mode, ForwardingMode::Remote);
        assert_eq!(spec.bind_address, Some("0.0.0.0".to_string()));
        assert_eq!(spec.bind_port, 8080);
        assert_eq!(spec.target_host, "192.168.1.10");
        assert_eq!(spec.target_port, 9000);
    }

    #[test]
    fn test_parse_ipv6() {
        let spec = ForwardSpec::parse("[::1]:80:[fe80::2]:8080", ForwardingMode::Local).unwrap();
        assert_eq!(spec.bind_address.as_deref(), Some("::1"));
        assert_eq!(spec.bind_port, 80);
        assert_eq!(spec.target_host, "fe80::2");
        assert_eq!(spec.to_ssh_arg(), "[::1]:80:[fe80::2]:8080");
    }

    #[test]
    fn test_to_ssh_arg_and_id() {
        let spec1 = ForwardSpec::parse("8080:127.0.0.1:9000", ForwardingMode::Local).unwrap();
        assert_eq!(spec1.to_ssh_arg(), "8080:127.0.0.1:9000");
        assert_eq!(spec1.id(), "-L 8080:127.0.0.1:9000");

        let spec2 =
            ForwardSpec::parse("0.0.0.0:8080:192.168.1.10:9000", ForwardingMode::Remote).unwrap();
        assert_eq!(spec2.id(), "-R 0.0.0.0:8080:192.168.1.10:9000");
    }

    #[test]
    fn test_effective_bind_address() {
        let spec1 = ForwardSpec::parse("8080:127.0.0.1:9000", ForwardingMode::Local).unwrap();
        assert_eq!(spec1.effective_bind_address(), "127.0.0.1");

        let spec2 = ForwardSpec::parse("0.0.0.0:8080:127.0.0.1:9000", ForwardingMode::Local).unwrap();
        assert_eq!(spec2.effective_bind_address(), "0.0.0.0");
    }

    #[test]
    fn test_invalid_specs() {
        let local = ForwardingMode::Local;
        assert!(ForwardSpec::parse("invalid", local).is_err());
        assert!(ForwardSpec::parse("8080:host", local).is_err());
        assert!(ForwardSpec::parse("8080:host:port:extra:part", local).is_err());
        assert!(ForwardSpec::parse("invalid_port:host:9000", local).is_err());
        assert!(ForwardSpec::parse("8080::9000", local).is_err());
    }

    #[test]
    fn test_validate_rejects_unprintable_label() {
        let spec = ForwardSpec::parse("8080:db:5432", ForwardingMode::Local)
            .unwrap()
            .with_label("db\n");
        assert!(spec.validate().is_err());
        assert!(spec.with_label("db").validate().is_ok());
    }
}
