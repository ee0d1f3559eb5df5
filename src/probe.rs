use std::cell::OnceCell;
use std::io;
use std::process::Command;

use tracing::debug;

use crate::error::{Error, Result};

/// Account the packaged systemd units run tunnels as.
pub const TUNNEL_USER: &str = "ssh-tunnel";

/// One TCP socket held by an ssh-ish process, from `lsof`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketEntry {
    pub command: String,
    /// `addr:port` or `addr:port->peer:port`.
    pub name: String,
    /// `LISTEN`, `ESTABLISHED`, ... without parentheses.
    pub state: Option<String>,
}

impl SocketEntry {
    /// Local port of a `127.0.0.1:<port>` listening socket.
    pub fn loopback_listen_port(&self) -> Option<u16> {
        if self.state.as_deref() != Some("LISTEN") {
            return None;
        }
        self.name.strip_prefix("127.0.0.1:")?.parse().ok()
    }
}

/// What the status reports need to know about the running system.
pub trait SystemProbe {
    /// Command lines of running helper (autossh) processes.
    fn helper_processes(&self) -> Result<Vec<String>>;
    /// TCP sockets owned by `ssh`, `sshd` or the tunnel account.
    fn ssh_sockets(&self) -> Result<Vec<SocketEntry>>;
    /// Whether systemd is the running service manager.
    fn has_service_manager(&self) -> bool;
    /// Unit names that look like tunnel units.
    fn tunnel_units(&self) -> Result<Vec<String>>;
    fn unit_enabled(&self, unit: &str) -> bool;
}

/// Probe backed by `ps`, `lsof`, `pidof` and `systemctl`.
pub struct SystemCommands;

fn run(program: &str, args: &[&str]) -> Result<String> {
    let output = Command::new(program).args(args).output().map_err(|e| {
        Error::Io(io::Error::new(e.kind(), format!("failed to run {}: {}", program, e)))
    })?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::Io(io::Error::other(format!(
            "{} {} failed: {}",
            program,
            args.join(" "),
            stderr.trim()
        ))));
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

impl SystemProbe for SystemCommands {
    fn helper_processes(&self) -> Result<Vec<String>> {
        Ok(parse_helper_processes(&run("ps", &["-eo", "args="])?))
    }

    fn ssh_sockets(&self) -> Result<Vec<SocketEntry>> {
        Ok(parse_lsof(&run("lsof", &["-i", "TCP", "-P", "-n"])?))
    }

    fn has_service_manager(&self) -> bool {
        Command::new("pidof")
            .arg("systemd")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn tunnel_units(&self) -> Result<Vec<String>> {
        let mut units = parse_units(&run("systemctl", &["list-units", "--all", "--plain", "--no-legend"])?);
        for unit in parse_units(&run("systemctl", &["list-unit-files", "--plain", "--no-legend"])?) {
            if !units.contains(&unit) {
                units.push(unit);
            }
        }
        Ok(units)
    }

    fn unit_enabled(&self, unit: &str) -> bool {
        Command::new("systemctl")
            .args(["is-enabled", unit])
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }
}

/// `ps -eo args=` lines whose program is autossh.
pub fn parse_helper_processes(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| {
            line.split_whitespace()
                .next()
                .is_some_and(|program| program.contains("autossh"))
        })
        .map(str::to_string)
        .collect()
}

/// `lsof -i TCP -P -n` rows for ssh, sshd or the tunnel account.
pub fn parse_lsof(output: &str) -> Vec<SocketEntry> {
    output
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 9 {
                return None;
            }
            let command = fields[0];
            let user = fields[2];
            if command != "ssh" && command != "sshd" && user != TUNNEL_USER {
                return None;
            }
            Some(SocketEntry {
                command: command.to_string(),
                name: fields[8].to_string(),
                state: fields
                    .get(9)
                    .map(|s| s.trim_start_matches('(').trim_end_matches(')').to_string()),
            })
        })
        .collect()
}

/// First column of `systemctl list-units`/`list-unit-files` rows naming
/// both "ssh" and "tunnel".
pub fn parse_units(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .filter(|unit| unit.contains("ssh") && unit.contains("tunnel"))
        .map(str::to_string)
        .collect()
}

/// Memoizes each probe listing for one command invocation.
pub struct ProbeCache<'a> {
    probe: &'a dyn SystemProbe,
    helpers: OnceCell<std::result::Result<Vec<String>, String>>,
    sockets: OnceCell<std::result::Result<Vec<SocketEntry>, String>>,
    units: OnceCell<Vec<String>>,
    service_manager: OnceCell<bool>,
}

impl<'a> ProbeCache<'a> {
    pub fn new(probe: &'a dyn SystemProbe) -> Self {
        Self {
            probe,
            helpers: OnceCell::new(),
            sockets: OnceCell::new(),
            units: OnceCell::new(),
            service_manager: OnceCell::new(),
        }
    }

    pub fn helper_processes(&self) -> Result<&[String]> {
        self.helpers
            .get_or_init(|| self.probe.helper_processes().map_err(|e| e.to_string()))
            .as_deref()
            .map_err(|msg| Error::Io(io::Error::other(msg.clone())))
    }

    pub fn ssh_sockets(&self) -> Result<&[SocketEntry]> {
        self.sockets
            .get_or_init(|| self.probe.ssh_sockets().map_err(|e| e.to_string()))
            .as_deref()
            .map_err(|msg| Error::Io(io::Error::other(msg.clone())))
    }

    pub fn has_service_manager(&self) -> bool {
        *self
            .service_manager
            .get_or_init(|| self.probe.has_service_manager())
    }

    /// Tunnel unit names; empty without systemd or when listing fails.
    pub fn tunnel_units(&self) -> &[String] {
        self.units.get_or_init(|| {
            if !self.has_service_manager() {
                return Vec::new();
            }
            self.probe.tunnel_units().unwrap_or_else(|e| {
                debug!("Unable to list systemd units: {}", e);
                Vec::new()
            })
        })
    }

    pub fn unit_enabled(&self, unit: &str) -> bool {
        self.probe.unit_enabled(unit)
    }
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::cell::Cell;

    /// Canned probe answers, counting how often listings are taken.
    #[derive(Default)]
    pub struct FakeProbe {
        pub helpers: Vec<String>,
        pub sockets: Option<Vec<SocketEntry>>,
        pub systemd: bool,
        pub units: Vec<String>,
        pub enabled: Vec<String>,
        pub calls: Cell<usize>,
    }

    impl SystemProbe for FakeProbe {
        fn helper_processes(&self) -> Result<Vec<String>> {
            self.calls.set(self.calls.get() + 1);
            Ok(self.helpers.clone())
        }

        fn ssh_sockets(&self) -> Result<Vec<SocketEntry>> {
            self.calls.set(self.calls.get() + 1);
            self.sockets
                .clone()
                .ok_or_else(|| Error::Io(io::Error::other("lsof: permission denied")))
        }

        fn has_service_manager(&self) -> bool {
            self.systemd
        }

        fn tunnel_units(&self) -> Result<Vec<String>> {
            self.calls.set(self.calls.get() + 1);
            Ok(self.units.clone())
        }

        fn unit_enabled(&self, unit: &str) -> bool {
            self.enabled.iter().any(|u| u == unit)
        }
    }
}
