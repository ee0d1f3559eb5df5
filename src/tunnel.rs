use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, Ipv4Addr};

use crate::dns::Resolve;
use crate::error::{Error, Result};
use crate::ini::FieldSet;
use crate::validate;

pub const DEFAULT_LOCAL_ADDRESS: Ipv4Addr = Ipv4Addr::new(127, 1, 1, 1);
pub const DEFAULT_SSH_PORT: u16 = 22;
pub const DEFAULT_SSH_OPTIONS: &[&str] = &[
    "-n",
    "-o",
    "ServerAliveInterval=60",
    "-o",
    "ServerAliveCountMax=3",
];

/// Every key a tunnel section may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Reverse,
    RemotePort,
    LocalPort,
    SshPort,
    LocalAddress,
    SshUser,
    SshKey,
    SshOptions,
    RemoteServer,
    GroupName,
    TunnelName,
}

impl Field {
    fn from_key(key: &str) -> Option<Self> {
        Some(match key {
            "reverse" => Self::Reverse,
            "remote_port" => Self::RemotePort,
            "local_port" => Self::LocalPort,
            "ssh_port" => Self::SshPort,
            "local_address" => Self::LocalAddress,
            "user" | "ssh_user" => Self::SshUser,
            "key" | "ssh_key" => Self::SshKey,
            "ssh_options" => Self::SshOptions,
            "server" | "remote_server" => Self::RemoteServer,
            "group_name" => Self::GroupName,
            "tunnel_name" => Self::TunnelName,
            _ => return None,
        })
    }
}

/// One validated SSH forward. Built once at load time, never mutated.
///
/// Two tunnels are equal when they reach the same remote address and port.
#[derive(Debug, Clone)]
pub struct Tunnel {
    name: String,
    group_name: String,
    ssh_options: Vec<String>,
    ssh_key: Option<String>,
    ssh_user: Option<String>,
    ssh_port: u16,
    remote_server: String,
    remote_address: IpAddr,
    remote_port: u16,
    local_address: Ipv4Addr,
    local_port: u16,
    reverse: bool,
}

impl Tunnel {
    /// Validate a merged field set of `group` into a tunnel.
    ///
    /// Resolves the remote server (and a non-literal local address) through
    /// `resolver`, so the stored address is the one every later lookup uses.
    pub fn build(group: &str, fields: &FieldSet, resolver: &dyn Resolve) -> Result<Self> {
        let tunnel_name = fields.get("tunnel_name").unwrap_or_default();
        let label = format!("{}'s {} tunnel", group, tunnel_name);
        let invalid = |key: &str| {
            Error::config(format!("Invalid value for param '{}' of {}", key, label))
        };

        let mut name = tunnel_name.to_string();
        let mut group_name = group.to_string();
        let mut remote_server = group.to_string();
        let mut ssh_options: Vec<String> = DEFAULT_SSH_OPTIONS.iter().map(|s| s.to_string()).collect();
        let mut ssh_key = None;
        let mut ssh_user = None;
        let mut ssh_port = DEFAULT_SSH_PORT;
        let mut local_address = DEFAULT_LOCAL_ADDRESS;
        let mut remote_port = None;
        let mut local_port = None;
        let mut reverse = false;

        for (raw_key, value) in fields.iter() {
            let key = raw_key.trim().to_lowercase();
            let field = Field::from_key(&key).ok_or_else(|| {
                Error::config(format!("Unknown param '{}' in {}", key, label))
            })?;
            let value = value.trim();

            match field {
                Field::Reverse => {
                    reverse = validate::parse_bool(value).ok_or_else(|| invalid(&key))?;
                }
                Field::RemotePort => {
                    remote_port = Some(validate::parse_port(value).ok_or_else(|| invalid(&key))?);
                }
                Field::LocalPort => {
                    local_port = Some(validate::parse_port(value).ok_or_else(|| invalid(&key))?);
                }
                Field::SshPort => {
                    ssh_port = validate::parse_port(value).ok_or_else(|| invalid(&key))?;
                }
                Field::LocalAddress => {
                    let addr = resolve_local_address(value, resolver)?;
                    if !validate::is_loopback(addr) {
                        return Err(Error::config(format!(
                            "Invalid value for param '{}' of {}: {} is not a loopback address",
                            key, label, addr
                        )));
                    }
                    local_address = addr;
                }
                Field::SshUser => {
                    if !validate::is_valid_username(value) {
                        return Err(invalid(&key));
                    }
                    ssh_user = Some(value.to_string());
                }
                Field::SshKey => {
                    ssh_key = (!value.is_empty()).then(|| value.to_string());
                }
                Field::SshOptions => {
                    ssh_options = shell_words::split(value).map_err(|_| invalid(&key))?;
                }
                Field::RemoteServer => remote_server = value.to_string(),
                Field::GroupName => group_name = value.to_string(),
                Field::TunnelName => name = value.to_string(),
            }
        }

        for (field, value) in [
            ("tunnel_name", &name),
            ("group_name", &group_name),
            ("remote_server", &remote_server),
        ] {
            if value.is_empty() {
                return Err(invalid(field));
            }
        }
        let missing = |key: &str| Error::config(format!("Missing param '{}' of {}", key, label));
        let remote_port = remote_port.ok_or_else(|| missing("remote_port"))?;
        let local_port = local_port.ok_or_else(|| missing("local_port"))?;

        let remote_address = resolver
            .resolve(&remote_server)
            .map_err(|source| Error::Resolution {
                host: remote_server.clone(),
                source,
            })?;

        Ok(Self {
            name,
            group_name,
            ssh_options,
            ssh_key,
            ssh_user,
            ssh_port,
            remote_server,
            remote_address,
            remote_port,
            local_address,
            local_port,
            reverse,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn group_name(&self) -> &str {
        &self.group_name
    }

    pub fn ssh_options(&self) -> &[String] {
        &self.ssh_options
    }

    pub fn ssh_key(&self) -> Option<&str> {
        self.ssh_key.as_deref()
    }

    pub fn ssh_user(&self) -> Option<&str> {
        self.ssh_user.as_deref()
    }

    pub fn ssh_port(&self) -> u16 {
        self.ssh_port
    }

    pub fn remote_server(&self) -> &str {
        &self.remote_server
    }

    pub fn remote_address(&self) -> IpAddr {
        self.remote_address
    }

    pub fn remote_port(&self) -> u16 {
        self.remote_port
    }

    pub fn local_address(&self) -> Ipv4Addr {
        self.local_address
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn reverse(&self) -> bool {
        self.reverse
    }

    /// `group/name`, used to label helper processes.
    pub fn label(&self) -> String {
        format!("{}/{}", self.group_name, self.name)
    }

    /// Configured user, or the invoking OS user.
    pub fn effective_user(&self) -> String {
        self.ssh_user.clone().unwrap_or_else(whoami::username)
    }

    /// Argument for `-L` or `-R`, depending on direction.
    pub fn forward_spec(&self) -> String {
        if self.reverse {
            format!(
                "{}:{}:{}:{}",
                self.remote_server, self.remote_port, self.local_address, self.local_port
            )
        } else {
            format!(
                "{}:{}:{}:{}",
                self.local_address, self.local_port, self.remote_server, self.remote_port
            )
        }
    }

    /// Arguments for the keep-alive helper (autossh) running this tunnel as `user`.
    pub fn helper_args(&self, user: &str) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-M".into(),
            "0".into(),
            "-p".into(),
            self.ssh_port.to_string(),
            "-T".into(),
            "-N".into(),
        ];
        args.extend(self.ssh_options.iter().cloned());
        if let Some(key) = &self.ssh_key {
            args.push("-i".into());
            args.push(key.clone());
        }
        args.push("-l".into());
        args.push(user.to_string());
        args.push(format!("{}@{}", user, self.remote_server));
        args.push(if self.reverse { "-R" } else { "-L" }.into());
        args.push(self.forward_spec());
        args
    }
}

impl PartialEq for Tunnel {
    fn eq(&self, other: &Self) -> bool {
        self.remote_address == other.remote_address && self.remote_port == other.remote_port
    }
}

impl Eq for Tunnel {}

impl Hash for Tunnel {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.remote_address.hash(state);
        self.remote_port.hash(state);
    }
}

impl fmt::Display for Tunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let arrow = if self.reverse { "<==" } else { "==>" };
        write!(
            f,
            "{}:{} {} {}:{}",
            self.local_address, self.local_port, arrow, self.remote_server, self.remote_port
        )
    }
}

fn resolve_local_address(value: &str, resolver: &dyn Resolve) -> Result<Ipv4Addr> {
    if let Ok(addr) = value.parse::<Ipv4Addr>() {
        return Ok(addr);
    }
    let addrs = resolver.lookup(value).map_err(|source| Error::Resolution {
        host: value.to_string(),
        source,
    })?;
    addrs
        .into_iter()
        .find_map(|a| match a {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        })
        .ok_or_else(|| Error::config(format!("Local address '{}' has no IPv4 address", value)))
}
