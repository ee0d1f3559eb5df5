use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::probe::TUNNEL_USER;
use crate::tunnel::Tunnel;

const PING: &str = "ping_test";

fn is_executable(path: &Path) -> bool {
    fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Absolute path of `program`, searched on `$PATH` unless it has a slash.
pub fn which(program: &str) -> Result<PathBuf> {
    if program.contains('/') {
        let path = PathBuf::from(program);
        return if is_executable(&path) {
            Ok(path)
        } else {
            Err(Error::HelperNotFound(program.to_string()))
        };
    }
    let search = std::env::var_os("PATH").unwrap_or_default();
    std::env::split_paths(&search)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
        .ok_or_else(|| Error::HelperNotFound(program.to_string()))
}

/// `ssh ... user@server echo ping_test` for a one-shot connectivity test.
pub fn check_command(tunnel: &Tunnel) -> Vec<String> {
    let mut cmd = vec!["ssh".to_string(), "-p".to_string(), tunnel.ssh_port().to_string()];
    cmd.extend(tunnel.ssh_options().iter().cloned());
    if let Some(key) = tunnel.ssh_key() {
        cmd.push("-i".into());
        cmd.push(key.to_string());
    }
    cmd.push(format!("{}@{}", tunnel.effective_user(), tunnel.remote_server()));
    cmd.push("echo".into());
    cmd.push(PING.into());
    cmd
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    Ok,
    /// Why the round-trip failed: ssh's stderr or the unexpected reply.
    Failed(String),
}

pub fn evaluate(output: &Output) -> CheckOutcome {
    let stdout = String::from_utf8_lossy(&output.stdout);
    if output.status.success() && stdout.trim() == PING {
        return CheckOutcome::Ok;
    }
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if stderr.is_empty() {
        CheckOutcome::Failed(format!("Bad response: {}", stdout.trim()))
    } else {
        CheckOutcome::Failed(stderr)
    }
}

/// Run the ping round-trip, as the tunnel account when a unit runs it.
pub fn check_connection(tunnel: &Tunnel, as_service_user: bool) -> CheckOutcome {
    let cmd = check_command(tunnel);
    let mut command = if as_service_user {
        let mut sudo = Command::new("sudo");
        sudo.args(["su", "-l", TUNNEL_USER, "-s", "/bin/bash", "/bin/bash", "-c"])
            .arg(shell_words::join(&cmd));
        sudo
    } else {
        let mut ssh = Command::new(&cmd[0]);
        ssh.args(&cmd[1..]);
        ssh
    };
    debug!("Checking {} with {:?}", tunnel.label(), command);
    match command.stdin(Stdio::null()).output() {
        Ok(output) => evaluate(&output),
        Err(e) => CheckOutcome::Failed(format!("failed to run {}: {}", cmd[0], e)),
    }
}

/// Make sure `server` has a host key in `~/.ssh/known_hosts`, scanning it
/// when missing. Problems are only logged.
pub fn ensure_known_host(server: &str) {
    let known = Command::new("ssh-keygen")
        .args(["-F", server])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false);
    if known {
        debug!("Host key of {} already known", server);
        return;
    }

    let Some(home) = dirs::home_dir() else {
        warn!("Cannot determine home directory, not registering {}", server);
        return;
    };
    let ssh_dir = home.join(".ssh");

    let output = match Command::new("ssh-keyscan")
        .args(["-H", server])
        .stderr(Stdio::null())
        .output()
    {
        Ok(output) if output.status.success() && !output.stdout.is_empty() => output,
        Ok(_) => {
            warn!("Unable to fetch the host key of {}", server);
            return;
        }
        Err(e) => {
            warn!("Unable to run ssh-keyscan: {}", e);
            return;
        }
    };

    let appended = fs::create_dir_all(&ssh_dir).and_then(|_| {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(ssh_dir.join("known_hosts"))?
            .write_all(&output.stdout)
    });
    match appended {
        Ok(()) => info!("Registered host key of {}", server),
        Err(e) => warn!("Unable to update known_hosts for {}: {}", server, e),
    }
}
