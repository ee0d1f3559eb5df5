use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::supervisor::SupervisorOptions;

/// Tunnel config looked up in the working directory, then beside the binary.
pub const DEFAULT_TUNNELS_CONFIG: &str = "sshtunnel.conf";

/// `~/.sshtunnel/config.toml`, if a home directory exists.
pub fn settings_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".sshtunnel").join("config.toml"))
}

/// The tunnel config to read, and whether the user named it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigLocation {
    pub path: PathBuf,
    pub explicit: bool,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Tunnel configuration used when `--config` is not given
    pub tunnels_config: Option<PathBuf>,
    /// Keep-alive helper, looked up on $PATH
    pub helper: String,
    /// Grace period between SIGTERM and SIGKILL on shutdown
    pub shutdown_timeout_secs: u64,
    /// Bound on each liveness check of a running helper
    pub poll_interval_ms: u64,
    /// Log filter when RUST_LOG is unset
    pub log_filter: String,
    /// Register unknown servers in ~/.ssh/known_hosts before `run`
    pub scan_known_hosts: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            tunnels_config: None,
            helper: "autossh".to_string(),
            shutdown_timeout_secs: 30,
            poll_interval_ms: 100,
            log_filter: "sshtunnel=info".to_string(),
            scan_known_hosts: true,
        }
    }
}

impl Settings {
    /// Load `~/.sshtunnel/config.toml`; defaults when it does not exist.
    pub fn load() -> Result<Self> {
        match settings_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))
    }

    /// `--config`, else `tunnels_config`, else the default file name.
    pub fn locate_tunnels_config(&self, cli: Option<&Path>) -> ConfigLocation {
        if let Some(path) = cli.or(self.tunnels_config.as_deref()) {
            return ConfigLocation {
                path: path.to_path_buf(),
                explicit: true,
            };
        }
        let local = PathBuf::from(DEFAULT_TUNNELS_CONFIG);
        if local.exists() {
            return ConfigLocation {
                path: local,
                explicit: false,
            };
        }
        let beside_exe = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join(DEFAULT_TUNNELS_CONFIG)))
            .filter(|path| path.exists());
        ConfigLocation {
            path: beside_exe.unwrap_or(local),
            explicit: false,
        }
    }

    pub fn supervisor_options(&self) -> SupervisorOptions {
        SupervisorOptions {
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let s = Settings::default();
        assert_eq!(s.helper, "autossh");
        assert_eq!(s.shutdown_timeout_secs, 30);
        assert!(s.scan_known_hosts);
        let opts = s.supervisor_options();
        assert_eq!(opts.poll_interval, Duration::from_millis(100));
        assert_eq!(opts.shutdown_timeout, Duration::from_secs(30));
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let path = std::env::temp_dir().join(format!("sshtunnel_test_settings_{}.toml", std::process::id()));
        fs::write(
            &path,
            "tunnels_config = \"/etc/sshtunnel.conf\"\nshutdown_timeout_secs = 5\npoll_interval_ms = 0\n",
        )
        .unwrap();

        let s = Settings::load_from(&path).unwrap();
        fs::remove_file(&path).unwrap();

        assert_eq!(s.tunnels_config, Some(PathBuf::from("/etc/sshtunnel.conf")));
        assert_eq!(s.shutdown_timeout_secs, 5);
        assert_eq!(s.helper, "autossh");
        assert_eq!(s.supervisor_options().poll_interval, Duration::from_millis(1));
    }

    #[test]
    fn config_location_precedence() {
        let mut s = Settings::default();
        let found = s.locate_tunnels_config(None);
        assert!(!found.explicit);
        assert!(found.path.ends_with(DEFAULT_TUNNELS_CONFIG));

        s.tunnels_config = Some(PathBuf::from("/etc/sshtunnel/tunnels.conf"));
        let found = s.locate_tunnels_config(None);
        assert_eq!(found.path, PathBuf::from("/etc/sshtunnel/tunnels.conf"));
        assert!(found.explicit);

        let found = s.locate_tunnels_config(Some(Path::new("mine.conf")));
        assert_eq!(found.path, PathBuf::from("mine.conf"));
        assert!(found.explicit);
    }

    #[test]
    fn invalid_file_is_an_error() {
        let path = std::env::temp_dir().join(format!("sshtunnel_test_settings_bad_{}.toml", std::process::id()));
        fs::write(&path, "shutdown_timeout_secs = \"soon\"\n").unwrap();

        let err = Settings::load_from(&path).unwrap_err();
        fs::remove_file(&path).unwrap();

        assert!(format!("{:#}", err).contains("failed to parse"));
    }
}
