use colored::Colorize;
use tracing::{debug, warn};

use crate::probe::ProbeCache;
use crate::systemd::{self, UnitState};
use crate::tunnel::Tunnel;

type ServerGroups<'a> = Vec<(&'a str, Vec<(&'a str, Vec<&'a Tunnel>)>)>;

/// Group tunnels by remote server, then by group, in first-seen order.
fn group_by_server<'a>(tunnels: &[&'a Tunnel]) -> ServerGroups<'a> {
    let mut servers: ServerGroups<'a> = Vec::new();
    for &tunnel in tunnels {
        let server = tunnel.remote_server();
        let idx = match servers.iter().position(|(s, _)| *s == server) {
            Some(idx) => idx,
            None => {
                servers.push((server, Vec::new()));
                servers.len() - 1
            }
        };
        let groups = &mut servers[idx].1;
        match groups.iter_mut().find(|(g, _)| *g == tunnel.group_name()) {
            Some((_, list)) => list.push(tunnel),
            None => groups.push((tunnel.group_name(), vec![tunnel])),
        }
    }
    servers
}

fn indent(text: &str, level: usize) -> String {
    let pad = "  ".repeat(level);
    text.lines()
        .map(|line| {
            if line.is_empty() {
                String::new()
            } else {
                format!("{}{}", pad, line)
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Lay tunnel descriptions out under `server (group):` or
/// `server:` / `group:` headings. With `titled`, each description sits
/// under its own `name:` line.
fn render_grouped<F>(tunnels: &[&Tunnel], titled: bool, describe: F) -> String
where
    F: Fn(&Tunnel) -> String,
{
    let mut blocks = Vec::new();
    for (server, groups) in group_by_server(tunnels) {
        let mut out = Vec::new();
        let single = groups.len() == 1;
        if single {
            out.push(format!("{} ({}):", server.bold(), groups[0].0));
        } else {
            out.push(format!("{}:", server.bold()));
        }
        for (group, members) in &groups {
            let base = if single {
                1
            } else {
                out.push(indent(&format!("{}:", group), 1));
                2
            };
            for tunnel in members {
                if titled {
                    out.push(indent(&format!("{}:", tunnel.name()), base));
                    out.push(indent(&describe(tunnel), base + 1));
                } else {
                    out.push(indent(&describe(tunnel), base));
                }
            }
        }
        blocks.push(out.join("\n"));
    }
    blocks.join("\n\n")
}

/// Whether some running helper carries every argument this tunnel would use.
pub fn is_running(tunnel: &Tunnel, processes: &[String]) -> bool {
    let args = tunnel.helper_args(&tunnel.effective_user());
    processes
        .iter()
        .any(|cmd| args.iter().all(|arg| cmd.contains(arg.as_str())))
}

pub fn render_status(tunnels: &[&Tunnel], cache: &ProbeCache) -> String {
    let processes = cache.helper_processes().unwrap_or_else(|e| {
        warn!("Unable to list running processes: {}", e);
        &[][..]
    });

    render_grouped(tunnels, false, |tunnel| {
        let running = if is_running(tunnel, processes) {
            "running".green()
        } else {
            "NOT RUNNING".red()
        };
        let unit = match systemd::unit_state(tunnel, cache) {
            UnitState::NotInstalled => "NOT INSTALLED".yellow(),
            UnitState::Enabled => "enabled".green(),
            UnitState::Disabled => "DISABLED".yellow(),
        };
        format!("{} [{}] [{}]: {}", tunnel.name(), running, unit, tunnel)
    })
}

pub fn describe_config(tunnel: &Tunnel) -> String {
    let auto = || "[AUTO]".to_string();
    [
        format!("name: {}", tunnel.name()),
        format!("group name: {}", tunnel.group_name()),
        format!("local address: {}", tunnel.local_address()),
        format!("local port: {}", tunnel.local_port()),
        format!("remote server: {}", tunnel.remote_server()),
        format!("remote address: {}", tunnel.remote_address()),
        format!("remote port: {}", tunnel.remote_port()),
        format!("reverse: {}", tunnel.reverse()),
        format!("ssh user: {}", tunnel.ssh_user().map(str::to_string).unwrap_or_else(auto)),
        format!("ssh key: {}", tunnel.ssh_key().map(str::to_string).unwrap_or_else(auto)),
        format!("ssh port: {}", tunnel.ssh_port()),
        format!("ssh options: {}", shell_words::join(tunnel.ssh_options())),
    ]
    .join("\n")
}

pub fn render_config(tunnels: &[&Tunnel]) -> String {
    render_grouped(tunnels, true, describe_config)
}

/// Loopback ports sshd listens on that no configured tunnel uses: reverse
/// tunnels opened from other machines. `None` when sockets can't be listed.
pub fn render_detected_remote(configured: &[Tunnel], cache: &ProbeCache) -> Option<String> {
    let sockets = match cache.ssh_sockets() {
        Ok(sockets) => sockets,
        Err(e) => {
            debug!("Skipping remote tunnel detection: {}", e);
            return None;
        }
    };

    let mut ports: Vec<u16> = Vec::new();
    for socket in sockets.iter().filter(|s| s.command == "sshd") {
        if let Some(port) = socket.loopback_listen_port()
            && !configured.iter().any(|t| t.local_port() == port)
            && !ports.contains(&port)
        {
            ports.push(port);
        }
    }

    let mut out = String::from("Detected remote tunnels from other computers:\n");
    if ports.is_empty() {
        out.push_str(&indent("Nothing found", 1));
    } else {
        let lines: Vec<String> = ports.iter().map(|p| indent(&p.to_string(), 1)).collect();
        out.push_str(&lines.join("\n"));
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::fake::FakeResolver;
    use crate::ini::FieldSet;
    use crate::probe::SocketEntry;
    use crate::probe::fake::FakeProbe;

    fn plain() {
        colored::control::set_override(false);
    }

    fn tunnel(group: &str, name: &str, server: &str, local_port: &str, extra: &[(&str, &str)]) -> Tunnel {
        let mut fields: FieldSet = [
            ("tunnel_name", name),
            ("remote_server", server),
            ("remote_port", "80"),
            ("local_port", local_port),
            ("user", "ops"),
        ]
        .into_iter()
        .collect();
        fields.overlay(&extra.iter().copied().collect());
        let resolver = FakeResolver::new()
            .with("a.example", "10.0.0.1")
            .with("b.example", "10.0.0.2");
        Tunnel::build(group, &fields, &resolver).unwrap()
    }

    fn sample() -> Vec<Tunnel> {
        vec![
            tunnel("web", "front", "a.example", "8080", &[]),
            tunnel("api", "rest", "a.example", "8081", &[]),
            tunnel("web", "admin", "a.example", "8082", &[]),
            tunnel("db", "pg", "b.example", "15432", &[("reverse", "yes")]),
        ]
    }

    #[test]
    fn grouping_keeps_first_seen_order() {
        let tunnels = sample();
        let refs: Vec<&Tunnel> = tunnels.iter().collect();
        let grouped = group_by_server(&refs);
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped[0].0, "a.example");
        let groups: Vec<&str> = grouped[0].1.iter().map(|(g, _)| *g).collect();
        assert_eq!(groups, vec!["web", "api"]);
        assert_eq!(grouped[0].1[0].1.len(), 2);
    }

    #[test]
    fn status_layout() {
        plain();
        let tunnels = sample();
        let refs: Vec<&Tunnel> = tunnels.iter().collect();
        let running = tunnels[0].helper_args("ops").join(" ");
        let probe = FakeProbe {
            helpers: vec![format!("/usr/bin/autossh {}", running)],
            sockets: Some(Vec::new()),
            ..Default::default()
        };
        let text = render_status(&refs, &ProbeCache::new(&probe));
        let expected = "\
a.example:
  web:
    front [running] [NOT INSTALLED]: 127.1.1.1:8080 ==> a.example:80
    admin [NOT RUNNING] [NOT INSTALLED]: 127.1.1.1:8082 ==> a.example:80
  api:
    rest [NOT RUNNING] [NOT INSTALLED]: 127.1.1.1:8081 ==> a.example:80

b.example (db):
  pg [NOT RUNNING] [NOT INSTALLED]: 127.1.1.1:15432 <== b.example:80";
        assert_eq!(text, expected);
    }

    #[test]
    fn config_layout() {
        plain();
        let tunnels = sample();
        let refs: Vec<&Tunnel> = tunnels[3..].iter().collect();
        let text = render_config(&refs);
        assert!(text.starts_with("b.example (db):\n  pg:\n    name: pg\n    group name: db\n"));
        assert!(text.contains("    remote address: 10.0.0.2\n"));
        assert!(text.contains("    reverse: true\n"));
        assert!(text.contains("    ssh user: ops\n"));
        assert!(text.contains("    ssh key: [AUTO]\n"));
        let options = text.lines().last().unwrap();
        assert!(options.starts_with("    ssh options: -n -o "));
        assert!(options.contains("ServerAliveCountMax=3"));
    }

    #[test]
    fn running_needs_every_argument() {
        let t = tunnel("web", "front", "a.example", "8080", &[]);
        let full = format!("autossh {}", t.helper_args("ops").join(" "));
        assert!(is_running(&t, &[full.clone()]));
        let partial = full.replace("127.1.1.1:8080", "127.1.1.1:9999");
        assert!(!is_running(&t, &[partial]));
    }

    fn listen(command: &str, name: &str) -> SocketEntry {
        SocketEntry {
            command: command.into(),
            name: name.into(),
            state: Some("LISTEN".into()),
        }
    }

    #[test]
    fn detected_remote_skips_configured_ports() {
        plain();
        let tunnels = sample();
        let probe = FakeProbe {
            sockets: Some(vec![
                listen("sshd", "127.0.0.1:8080"),
                listen("sshd", "127.0.0.1:2200"),
                listen("sshd", "127.0.0.1:2200"),
                listen("ssh", "127.0.0.1:3300"),
                listen("sshd", "*:22"),
            ]),
            ..Default::default()
        };
        let text = render_detected_remote(&tunnels, &ProbeCache::new(&probe)).unwrap();
        assert_eq!(text, "Detected remote tunnels from other computers:\n  2200");
    }

    #[test]
    fn detected_remote_nothing_found() {
        let probe = FakeProbe {
            sockets: Some(Vec::new()),
            ..Default::default()
        };
        let text = render_detected_remote(&[], &ProbeCache::new(&probe)).unwrap();
        assert!(text.ends_with("  Nothing found"));
    }

    #[test]
    fn detected_remote_skipped_without_lsof() {
        let probe = FakeProbe::default();
        assert!(render_detected_remote(&[], &ProbeCache::new(&probe)).is_none());
    }
}
