use std::io;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{Level, debug, error, info, warn};

use crate::error::{Error, Result};
use crate::interrupt::StopSignal;
use crate::log_pipe::LogPipe;
use crate::tunnel::Tunnel;

/// Sleep between `try_wait` probes while waiting on one child.
const WAIT_STEP: Duration = Duration::from_millis(10);

/// One helper process to launch and watch.
#[derive(Debug, Clone)]
pub struct HelperCommand {
    pub label: String,
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl HelperCommand {
    pub fn for_tunnel(program: &Path, tunnel: &Tunnel) -> Self {
        Self {
            label: tunnel.label(),
            program: program.to_path_buf(),
            args: tunnel.helper_args(&tunnel.effective_user()),
        }
    }

    fn program_name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.program.display().to_string())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SupervisorOptions {
    /// Bound on each non-blocking liveness check.
    pub poll_interval: Duration,
    /// How long survivors get between SIGTERM and SIGKILL.
    pub shutdown_timeout: Duration,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

struct Tracked {
    label: String,
    program: String,
    child: Child,
}

/// Why the running phase ended.
enum Trigger {
    Exited {
        label: String,
        program: String,
        status: ExitStatus,
    },
    Interrupted,
    Failed(Error),
}

pub struct Supervisor {
    options: SupervisorOptions,
}

impl Supervisor {
    pub fn new(options: SupervisorOptions) -> Self {
        Self { options }
    }

    /// Launch every helper and watch them until one exits or `stop` fires.
    ///
    /// Never returns `Ok` once something was launched: a helper exit, even
    /// with status 0, is [`Error::HelperExited`]; a stop is
    /// [`Error::Interrupted`]. Every child is gone and both log pipes are
    /// drained before this returns.
    pub fn run(&self, helpers: &[HelperCommand], stop: &StopSignal) -> Result<()> {
        if helpers.is_empty() {
            return Ok(());
        }

        let stdout = LogPipe::new(Level::INFO)?;
        let stderr = LogPipe::new(Level::WARN)?;
        let mut tracked = Vec::with_capacity(helpers.len());

        let trigger = match self.launch(helpers, &stdout, &stderr, stop, &mut tracked) {
            Ok(()) => self.watch(&mut tracked, stop),
            Err(e) => Trigger::Failed(e),
        };

        self.shutdown(&mut tracked, stop);
        stderr.close();
        stdout.close();

        match trigger {
            Trigger::Exited {
                label,
                program,
                status,
            } => Err(Error::HelperExited {
                program,
                tunnel: label,
                status,
            }),
            Trigger::Interrupted => Err(Error::Interrupted),
            Trigger::Failed(e) => Err(e),
        }
    }

    fn launch(
        &self,
        helpers: &[HelperCommand],
        stdout: &LogPipe,
        stderr: &LogPipe,
        stop: &StopSignal,
        tracked: &mut Vec<Tracked>,
    ) -> Result<()> {
        for helper in helpers {
            if stop.is_triggered() {
                break;
            }
            debug!("Launching {} {}", helper.program.display(), helper.args.join(" "));
            let child = Command::new(&helper.program)
                .args(&helper.args)
                .stdin(Stdio::null())
                .stdout(stdout.stdio()?)
                .stderr(stderr.stdio()?)
                // Own process group: a terminal Ctrl-C reaches us, not the helpers.
                .process_group(0)
                .spawn()
                .map_err(|e| {
                    Error::Io(io::Error::new(
                        e.kind(),
                        format!("failed to start {} for {}: {}", helper.program.display(), helper.label, e),
                    ))
                })?;
            info!("Started tunnel {} (pid {})", helper.label, child.id());
            stop.track_group(child.id());
            tracked.push(Tracked {
                label: helper.label.clone(),
                program: helper.program_name(),
                child,
            });
        }
        Ok(())
    }

    fn watch(&self, tracked: &mut Vec<Tracked>, stop: &StopSignal) -> Trigger {
        loop {
            if stop.is_triggered() {
                return Trigger::Interrupted;
            }
            let mut idx = 0;
            while idx < tracked.len() {
                match wait_timeout(&mut tracked[idx].child, self.options.poll_interval) {
                    Ok(Some(status)) => {
                        let gone = tracked.remove(idx);
                        stop.untrack_group(gone.child.id());
                        error!("Tunnel {} stopped ({})", gone.label, status);
                        return Trigger::Exited {
                            label: gone.label,
                            program: gone.program,
                            status,
                        };
                    }
                    Ok(None) => {}
                    Err(e) => return Trigger::Failed(Error::Io(e)),
                }
                if stop.is_triggered() {
                    return Trigger::Interrupted;
                }
                idx += 1;
            }
        }
    }

    /// SIGTERM everything, wait up to the deadline, SIGKILL the rest.
    fn shutdown(&self, tracked: &mut Vec<Tracked>, stop: &StopSignal) {
        if tracked.is_empty() {
            return;
        }
        info!("Stopping {} tunnel(s)", tracked.len());
        for t in tracked.iter() {
            if let Err(e) = signal_group(&t.child, libc::SIGTERM) {
                debug!("SIGTERM to {} failed: {}", t.label, e);
            }
        }

        let deadline = Instant::now() + self.options.shutdown_timeout;
        while !tracked.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let step = remaining.min(self.options.poll_interval);
            tracked.retain_mut(|t| match wait_timeout(&mut t.child, step) {
                Ok(Some(status)) => {
                    debug!("Tunnel {} exited ({})", t.label, status);
                    stop.untrack_group(t.child.id());
                    false
                }
                Ok(None) => true,
                Err(_) => {
                    stop.untrack_group(t.child.id());
                    false
                }
            });
        }

        for mut t in tracked.drain(..) {
            warn!("Tunnel {} ignored SIGTERM, killing it", t.label);
            if signal_group(&t.child, libc::SIGKILL).is_err() {
                let _ = t.child.kill();
            }
            let _ = t.child.wait();
            stop.untrack_group(t.child.id());
        }
    }
}

/// Signal the child's process group, so anything it forked (autossh's ssh)
/// goes down with it and releases the log pipes.
fn signal_group(child: &Child, sig: libc::c_int) -> io::Result<()> {
    let ret = unsafe { libc::kill(-(child.id() as i32), sig) };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Wait up to `timeout` for `child`; `None` if it is still running.
pub fn wait_timeout(child: &mut Child, timeout: Duration) -> io::Result<Option<ExitStatus>> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(None);
        }
        thread::sleep(remaining.min(WAIT_STEP));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(label: &str, script: &str) -> HelperCommand {
        HelperCommand {
            label: label.to_string(),
            program: PathBuf::from("sh"),
            args: vec!["-c".to_string(), script.to_string()],
        }
    }

    fn quick() -> Supervisor {
        Supervisor::new(SupervisorOptions {
            poll_interval: Duration::from_millis(50),
            shutdown_timeout: Duration::from_millis(500),
        })
    }

    #[test]
    fn wait_timeout_reports_running_and_exited() {
        let mut child = Command::new("sleep").arg("5").spawn().unwrap();
        assert!(wait_timeout(&mut child, Duration::from_millis(50)).unwrap().is_none());
        child.kill().unwrap();
        let status = wait_timeout(&mut child, Duration::from_secs(5)).unwrap();
        assert!(status.is_some());
    }

    #[test]
    fn failure_tears_down_survivors() {
        let helpers = vec![
            sh("db/pg", "exec sleep 30"),
            sh("db/failing", "sleep 0.3; exit 3"),
            sh("web/stubborn", "trap '' TERM; while :; do sleep 1; done"),
        ];
        let started = Instant::now();
        let err = quick().run(&helpers, &StopSignal::new()).unwrap_err();

        match err {
            Error::HelperExited {
                program,
                tunnel,
                status,
            } => {
                assert_eq!(program, "sh");
                assert_eq!(tunnel, "db/failing");
                assert_eq!(status.code(), Some(3));
            }
            other => panic!("unexpected error {:?}", other),
        }
        // the stubborn one needed SIGKILL, yet everything is gone well before 30s
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn finished_run_tracks_no_groups() {
        let stop = StopSignal::new();
        let helpers = vec![sh("a/one", "exec sleep 30"), sh("a/two", "sleep 0.2; exit 1")];
        assert!(quick().run(&helpers, &stop).is_err());
        assert!(stop.tracked_groups().is_empty());
    }

    #[test]
    fn group_kill_cuts_a_stuck_shutdown_short() {
        let helpers = vec![sh("a/stubborn", "trap '' TERM; while :; do sleep 1; done")];
        let supervisor = Supervisor::new(SupervisorOptions {
            poll_interval: Duration::from_millis(50),
            shutdown_timeout: Duration::from_secs(60),
        });
        let stop = StopSignal::new();
        let escalate = stop.clone();
        let started = Instant::now();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(300));
            escalate.trigger();
            thread::sleep(Duration::from_millis(300));
            // what the third interrupt does before exiting
            escalate.kill_groups()
        });

        let err = supervisor.run(&helpers, &stop).unwrap_err();
        assert_eq!(handle.join().unwrap(), 1);
        assert!(matches!(err, Error::Interrupted));
        assert!(started.elapsed() < Duration::from_secs(20));
    }

    #[test]
    fn clean_exit_is_still_a_failure() {
        let helpers = vec![sh("a/ok", "exit 0"), sh("a/other", "exec sleep 30")];
        let err = quick().run(&helpers, &StopSignal::new()).unwrap_err();
        match err {
            Error::HelperExited { tunnel, status, .. } => {
                assert_eq!(tunnel, "a/ok");
                assert!(status.success());
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn stop_signal_interrupts() {
        let helpers = vec![sh("a/one", "exec sleep 30"), sh("a/two", "exec sleep 30")];
        let stop = StopSignal::new();
        let trigger = stop.clone();
        let started = Instant::now();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            trigger.trigger();
        });

        let err = quick().run(&helpers, &stop).unwrap_err();
        handle.join().unwrap();
        assert!(matches!(err, Error::Interrupted));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn stop_before_launch_starts_nothing() {
        let stop = StopSignal::new();
        stop.trigger();
        let err = quick().run(&[sh("a/one", "exec sleep 30")], &stop).unwrap_err();
        assert!(matches!(err, Error::Interrupted));
    }

    #[test]
    fn spawn_failure_stops_already_started() {
        let helpers = vec![
            sh("a/first", "exec sleep 30"),
            HelperCommand {
                label: "a/missing".into(),
                program: PathBuf::from("/nonexistent/autossh"),
                args: vec![],
            },
        ];
        let started = Instant::now();
        let err = quick().run(&helpers, &StopSignal::new()).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.to_string().contains("a/missing"));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn nothing_to_run() {
        assert!(quick().run(&[], &StopSignal::new()).is_ok());
    }
}
