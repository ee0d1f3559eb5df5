use std::io;
use std::process::ExitStatus;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or invalid tunnel configuration. Never partially applied.
    #[error("{0}")]
    Config(String),

    /// A server or local address could not be resolved at load time.
    #[error("Unable to resolve '{host}': {source}")]
    Resolution {
        host: String,
        #[source]
        source: io::Error,
    },

    /// Identifiers that matched no configured tunnel, all of them.
    #[error("Unknown tunnels: {}", .0.join(", "))]
    UnknownTunnels(Vec<String>),

    #[error("Unable to find path for executable {0}")]
    HelperNotFound(String),

    /// A supervised helper exited. Any exit counts, even a clean one.
    #[error("{program} for tunnel {tunnel} stopped with {}", describe_status(.status))]
    HelperExited {
        program: String,
        tunnel: String,
        status: ExitStatus,
    },

    /// Operator interrupt. Reported as an abort, not as a failure.
    #[error("Interrupted")]
    Interrupted,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

fn describe_status(status: &ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;

    match (status.code(), status.signal()) {
        (Some(code), _) => format!("exit code {}", code),
        (None, Some(sig)) => format!("signal {}", sig),
        (None, None) => "unknown status".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;

    #[test]
    fn unknown_tunnels_lists_every_identifier() {
        let err = Error::UnknownTunnels(vec!["foo".into(), "bar".into()]);
        assert_eq!(err.to_string(), "Unknown tunnels: foo, bar");
    }

    #[test]
    fn helper_exit_names_the_code() {
        let err = Error::HelperExited {
            program: "autossh".into(),
            tunnel: "db/web".into(),
            status: ExitStatus::from_raw(3 << 8),
        };
        assert_eq!(err.to_string(), "autossh for tunnel db/web stopped with exit code 3");
    }

    #[test]
    fn helper_exit_names_the_signal() {
        let err = Error::HelperExited {
            program: "autossh".into(),
            tunnel: "db/web".into(),
            status: ExitStatus::from_raw(9),
        };
        assert!(err.to_string().ends_with("signal 9"));
    }
}
