use std::{
    net::Ipv4Addr,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
    error::{TunnelError, TunnelResult},
    forwarding::{ForwardSpec, ForwardingMode},
    jump::JumpHost,
    store::{TunnelGroup, TunnelStore},
    supervisor::SupervisorOptions,
};

/// Prefix of environment overrides, e.g. `JUMPGATE__CONNECT_TIMEOUT=20`
const ENV_PREFIX: &str = "JUMPGATE";

/// Configuration for the tunnel supervisor
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Tunnel groups, one jump host each
    #[serde(default)]
    pub groups: Vec<GroupConfig>,
    /// Session establishment timeout in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_timeout: Option<u64>,
    /// Bind timeout in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind_timeout: Option<u64>,
    /// Events buffered per subscriber
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_capacity: Option<usize>,
}

/// A named group of forwards behind one jump host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupConfig {
    pub name: String,
    pub jump: JumpHostConfig,
    #[serde(default)]
    pub forwardings: Vec<ForwardConfig>,
}

/// Jump host SSH server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JumpHostConfig {
    /// Hostname or IP address
    pub host: String,
    /// SSH port (default: 22)
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    /// Username for SSH connection
    #[serde(default)]
    pub user: String,
    /// Path to private key file (optional)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Pinned host key fingerprint (optional)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
}

/// One forwarding entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwardConfig {
    /// `[bind_addr:]port:host:port`
    pub spec: String,
    #[serde(default)]
    pub mode: ForwardingMode,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub label: String,
}

fn default_ssh_port() -> u16 {
    22
}

impl Config {
    /// Load configuration from a file, with `JUMPGATE__*` environment overrides
    pub fn from_file<P: AsRef<Path>>(path: P) -> TunnelResult<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(TunnelError::config(format!(
                "Config file {} not found",
                path.display()
            )));
        }

        let settings = ::config::Config::builder()
            .add_source(::config::File::from(path))
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| TunnelError::config(format!("Failed to read config file: {e}")))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| TunnelError::config(format!("Failed to parse config: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a JSON file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> TunnelResult<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| TunnelError::config(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| TunnelError::config(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> TunnelResult<()> {
        for (i, group) in self.groups.iter().enumerate() {
            if self.groups[..i].iter().any(|g| g.name == group.name) {
                return Err(TunnelError::config(format!(
                    "Duplicate group name '{}'",
                    group.name
                )));
            }
            group.validate()?;
        }
        Ok(())
    }

    pub fn group(&self, name: &str) -> Option<&GroupConfig> {
        self.groups.iter().find(|g| g.name == name)
    }

    pub fn supervisor_options(&self) -> SupervisorOptions {
        let defaults = SupervisorOptions::default();
        SupervisorOptions {
            connect_timeout: self
                .connect_timeout
                .map(Duration::from_secs)
                .unwrap_or(defaults.connect_timeout),
            bind_timeout: self
                .bind_timeout
                .map(Duration::from_secs)
                .unwrap_or(defaults.bind_timeout),
            event_capacity: self.event_capacity.unwrap_or(defaults.event_capacity),
        }
    }

    /// Typed definitions for the supervisor
    pub fn into_store(self) -> TunnelResult<TunnelStore> {
        let groups = self
            .groups
            .iter()
            .map(GroupConfig::to_group)
            .collect::<TunnelResult<Vec<_>>>()?;
        TunnelStore::from_groups(groups)
    }
}

impl GroupConfig {
    /// Validate a single group
    pub fn validate(&self) -> TunnelResult<()> {
        if self.name.trim().is_empty() {
            return Err(TunnelError::config("Group name cannot be empty"));
        }
        self.jump.validate()?;
        if self.forwardings.is_empty() {
            return Err(TunnelError::config(format!(
                "Forwarding list of group '{}' cannot be empty",
                self.name
            )));
        }
        // Parses every spec and checks binds are unique within the group
        self.to_group()?.validate()
    }

    /// Convert to the typed group definition
    pub fn to_group(&self) -> TunnelResult<TunnelGroup> {
        let mut jump = JumpHost::new(&self.jump.host, self.jump.port, &self.jump.user);
        jump.fingerprint = self.jump.fingerprint.clone();

        let forwards = self
            .forwardings
            .iter()
            .map(|f| ForwardSpec::parse(&f.spec, f.mode).map(|spec| spec.with_label(&f.label)))
            .collect::<TunnelResult<Vec<_>>>()?;

        Ok(TunnelGroup {
            name: self.name.clone(),
            jump,
            forwards,
        })
    }

    /// Import an OpenSSH command line such as
    /// `ssh ops@bastion -p 2222 -i ~/.ssh/id_ed25519 -L 8080:db:5432 -N`.
    /// Unknown options are ignored.
    pub fn from_ssh_command(name: &str, command: &str) -> TunnelResult<Self> {
        let args = split_command(command)?;
        let mut args = args.into_iter();
        match args.next().as_deref() {
            Some("ssh") => {}
            _ => {
                return Err(TunnelError::config(format!(
                    "Not an ssh command: '{command}'"
                )));
            }
        }

        let mut destination = None;
        let mut port = default_ssh_port();
        let mut key = None;
        let mut forwardings = Vec::new();

        while let Some(arg) = args.next() {
            let Some(option) = arg.strip_prefix('-').filter(|o| !o.is_empty()) else {
                if destination.is_none() {
                    destination = Some(arg.clone());
                }
                continue;
            };
            let (flag, attached) = option.split_at(option.chars().next().map_or(0, char::len_utf8));

            let mut value = |flag: &str| -> TunnelResult<String> {
                if !attached.is_empty() {
                    return Ok(attached.to_string());
                }
                args.next()
                    .ok_or_else(|| TunnelError::config(format!("Option -{flag} needs a value")))
            };

            match flag {
                "p" => {
                    let raw = value(flag)?;
                    port = raw
                        .parse()
                        .map_err(|_| TunnelError::config(format!("Invalid port '{raw}'")))?;
                }
                "i" => key = Some(value(flag)?),
                "L" | "R" => {
                    let mode = if flag == "L" {
                        ForwardingMode::Local
                    } else {
                        ForwardingMode::Remote
                    };
                    forwardings.push(ForwardConfig {
                        spec: value(flag)?,
                        mode,
                        label: String::new(),
                    });
                }
                _ => {}
            }
        }

        let destination = destination
            .ok_or_else(|| TunnelError::config("ssh command has no destination"))?;
        let (user, host) = match destination.split_once('@') {
            Some((user, host)) => (user.to_string(), host.to_string()),
            None => (current_user()?, destination),
        };

        let group = GroupConfig {
            name: name.to_string(),
            jump: JumpHostConfig {
                host,
                port,
                user,
                key,
                fingerprint: None,
            },
            forwardings,
        };
        group.validate()?;
        Ok(group)
    }

    /// Render the equivalent OpenSSH command line
    pub fn to_ssh_command(&self) -> String {
        let mut command = String::from("ssh ");
        if !self.jump.user.is_empty() {
            command.push_str(&self.jump.user);
            command.push('@');
        }
        command.push_str(&self.jump.host);
        if self.jump.port != default_ssh_port() {
            command.push_str(&format!(" -p {}", self.jump.port));
        }
        if let Some(key) = &self.jump.key {
            command.push_str(&format!(" -i {}", expand_path(key).display()));
        }
        for forward in &self.forwardings {
            command.push_str(&format!(" {} {}", forward.mode.to_ssh_flag(), forward.spec));
        }
        command.push_str(" -N");
        command
    }
}

impl JumpHostConfig {
    pub fn validate(&self) -> TunnelResult<()> {
        validate_hostname(&self.host)?;
        if self.port == 0 {
            return Err(TunnelError::config("Jump host port cannot be 0"));
        }
        if self.user.is_empty() {
            return Err(TunnelError::config(format!(
                "Jump host {} needs a user",
                self.host
            )));
        }
        if !self.user.chars().all(char::is_alphanumeric) {
            return Err(TunnelError::config(format!(
                "'{}' is not an alphanumeric username",
                self.user
            )));
        }
        if let Some(path) = self.key_path().filter(|p| !p.is_file()) {
            return Err(TunnelError::config(format!(
                "Key file {} not found",
                path.display()
            )));
        }
        Ok(())
    }

    /// Key file with `~` and environment variables expanded
    pub fn key_path(&self) -> Option<PathBuf> {
        self.key.as_deref().map(expand_path)
    }
}

/// Login name ssh itself would use when the destination names no user
fn current_user() -> TunnelResult<String> {
    ["USER", "LOGNAME", "USERNAME"]
        .iter()
        .find_map(|var| std::env::var(var).ok().filter(|user| !user.is_empty()))
        .ok_or_else(|| TunnelError::config("ssh command has no user and USER is not set"))
}

/// Hostnames must be non-empty; anything shaped like a dotted quad must be a valid IPv4 address
fn validate_hostname(host: &str) -> TunnelResult<()> {
    if host.trim().is_empty() {
        return Err(TunnelError::config("Jump host cannot be empty"));
    }
    let dotted_quad = host.split('.').count() == 4
        && host.chars().all(|c| c.is_ascii_digit() || c == '.');
    if dotted_quad && host.parse::<Ipv4Addr>().is_err() {
        return Err(TunnelError::config(format!(
            "'{host}' is not a valid IPv4 address"
        )));
    }
    Ok(())
}

/// Expand `~` and `$VAR` / `${VAR}`; unknown variables are left as written
pub fn expand_path(path: &str) -> PathBuf {
    let home = std::env::var("HOME").ok();
    let path = match (path.strip_prefix('~'), &home) {
        (Some(rest), Some(home)) if rest.is_empty() || rest.starts_with('/') => {
            format!("{home}{rest}")
        }
        _ => path.to_string(),
    };

    let mut expanded = String::with_capacity(path.len());
    let mut chars = path.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '$' {
            expanded.push(c);
            continue;
        }
        let braced = chars.next_if_eq(&'{').is_some();
        let mut name = String::new();
        while let Some(c) = chars.next_if(|c| c.is_ascii_alphanumeric() || *c == '_') {
            name.push(c);
        }
        let closed = braced && chars.next_if_eq(&'}').is_some();

        match std::env::var(&name) {
            Ok(value) if !name.is_empty() && braced == closed => expanded.push_str(&value),
            _ => {
                expanded.push('$');
                if braced {
                    expanded.push('{');
                }
                expanded.push_str(&name);
                if closed {
                    expanded.push('}');
                }
            }
        }
    }
    PathBuf::from(expanded)
}

/// Whitespace split honouring single and double quotes
fn split_command(command: &str) -> TunnelResult<Vec<String>> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_arg = false;
    let mut quote: Option<char> = None;

    for c in command.chars() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), c) => current.push(c),
            (None, '\'' | '"') => {
                quote = Some(c);
                in_arg = true;
            }
            (None, c) if c.is_whitespace() => {
                if in_arg {
                    args.push(std::mem::take(&mut current));
                    in_arg = false;
                }
            }
            (None, c) => {
                current.push(c);
                in_arg = true;
            }
        }
    }
    if quote.is_some() {
        return Err(TunnelError::config(format!(
            "Unterminated quote in '{command}'"
        )));
    }
    if in_arg {
        args.push(current);
    }
    Ok(args)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(name: &str, specs: &[&str]) -> GroupConfig {
        GroupConfig {
            name: name.to_string(),
            jump: JumpHostConfig {
                host: "192.168.1.100".to_string(),
                port: 22,
                user: "admin".to_string(),
                key: None,
                fingerprint: None,
            },
            forwardings: specs
                .iter()
                .map(|s| ForwardConfig {
                    spec: s.to_string(),
                    mode: ForwardingMode::Local,
                    label: String::new(),
                })
                .collect(),
        }
    }

    #[test]
    fn test_config_validation() {
        let config = Config {
            groups: vec![group("db", &["8080:127.0.0.1:8080"])],
            connect_timeout: Some(5),
            ..Default::default()
        };
        assert!(config.validate().is_ok());

        let duplicate = Config {
            groups: vec![group("db", &["8080:db:1"]), group("db", &["8081:db:1"])],
            ..Default::default()
        };
        assert!(duplicate.validate().is_err());

        let mut bad_ip = group("ip", &["8080:db:1"]);
        bad_ip.jump.host = "300.1.1.1".to_string();
        assert!(bad_ip.validate().is_err());

        let mut bad_user = group("user", &["8080:db:1"]);
        bad_user.jump.user = "ad min".to_string();
        assert!(bad_user.validate().is_err());

        let mut missing_key = group("key", &["8080:db:1"]);
        missing_key.jump.key = Some("/nonexistent/jumpgate/id_ed25519".to_string());
        assert!(missing_key.validate().is_err());

        assert!(group("spec", &["8080:db"]).validate().is_err());
        assert!(group("empty", &[]).validate().is_err());

        let mut bad_label = group("label", &["8080:db:1"]);
        bad_label.forwardings[0].label = "line\nbreak".to_string();
        assert!(bad_label.validate().is_err());
    }

    #[test]
    fn test_config_file_operations() {
        let mut remote = group("remote", &["9000:localhost:9000"]);
        remote.jump.port = 2222;
        remote.forwardings[0].mode = ForwardingMode::Remote;
        remote.forwardings[0].label = "metrics".to_string();
        let config = Config {
            groups: vec![group("web", &["8080:127.0.0.1:8080", "8443:web:443"]), remote],
            connect_timeout: Some(10),
            bind_timeout: None,
            event_capacity: Some(64),
        };

        let mut temp_file = std::env::temp_dir();
        temp_file.push("jumpgate_test_config.json");

        config.to_file(&temp_file).unwrap();
        let loaded = Config::from_file(&temp_file).unwrap();
        let _ = std::fs::remove_file(&temp_file);

        assert_eq!(loaded.groups.len(), 2);
        assert_eq!(loaded.groups[1].jump.port, 2222);
        assert_eq!(loaded.groups[1].forwardings[0].mode, ForwardingMode::Remote);
        assert_eq!(loaded.groups[1].forwardings[0].label, "metrics");
        assert_eq!(loaded.connect_timeout, Some(10));

        let options = loaded.supervisor_options();
        assert_eq!(options.connect_timeout, Duration::from_secs(10));
        assert_eq!(options.bind_timeout, Duration::from_secs(5));
        assert_eq!(options.event_capacity, 64);
    }

    #[test]
    fn test_missing_file() {
        let err = Config::from_file("/nonexistent/jumpgate.json").unwrap_err();
        assert!(matches!(err, TunnelError::Configuration(_)));
    }

    #[test]
    fn test_into_store() {
        let config = Config {
            groups: vec![group("a", &["8080:web:80"]), group("b", &["8081:web:80"])],
            ..Default::default()
        };
        let store = config.into_store().unwrap();
        assert_eq!(store.names(), vec!["a", "b"]);
        assert_eq!(store.get("a").unwrap().jump.id().user, "admin");
    }

    #[test]
    fn test_from_ssh_command() {
        let group = GroupConfig::from_ssh_command(
            "office",
            "ssh ops@bastion.example.com -p 2222 -L 8080:db:5432 -R 9000:localhost:3000 -N -o ServerAliveInterval=30",
        )
        .unwrap();

        assert_eq!(group.jump.user, "ops");
        assert_eq!(group.jump.host, "bastion.example.com");
        assert_eq!(group.jump.port, 2222);
        assert_eq!(group.forwardings.len(), 2);
        assert_eq!(group.forwardings[1].mode, ForwardingMode::Remote);

        assert_eq!(
            group.to_ssh_command(),
            "ssh ops@bastion.example.com -p 2222 -L 8080:db:5432 -R 9000:localhost:3000 -N"
        );
    }

    #[test]
    fn test_from_ssh_command_defaults_to_current_user() {
        let imported = GroupConfig::from_ssh_command("office", "ssh bastion -L 8080:db:5432");
        match current_user() {
            Ok(user) if user.chars().all(char::is_alphanumeric) => {
                let group = imported.unwrap();
                assert_eq!(group.jump.user, user);
                assert_eq!(group.jump.host, "bastion");
            }
            // No usable login name in this environment
            _ => assert!(imported.is_err()),
        }
    }

    #[test]
    fn test_from_ssh_command_rejects_garbage() {
        assert!(GroupConfig::from_ssh_command("x", "scp file host:").is_err());
        assert!(GroupConfig::from_ssh_command("x", "ssh ops@bastion -L").is_err());
        assert!(GroupConfig::from_ssh_command("x", "ssh ops@bastion -L 'oops").is_err());
        // No forwards
        assert!(GroupConfig::from_ssh_command("x", "ssh ops@bastion -N").is_err());
    }

    #[test]
    fn test_split_command_quotes() {
        assert_eq!(
            split_command(r#"ssh -i "/keys/my key" ops@host"#).unwrap(),
            vec!["ssh", "-i", "/keys/my key", "ops@host"]
        );
    }

    #[test]
    fn test_expand_path_keeps_unknown_variables() {
        assert_eq!(
            expand_path("/keys/$JUMPGATE_SURELY_UNSET_VAR/id"),
            PathBuf::from("/keys/$JUMPGATE_SURELY_UNSET_VAR/id")
        );
    }
}
