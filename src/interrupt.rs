use std::collections::VecDeque;
use std::io::{self, PipeReader, Read};
use std::os::fd::IntoRawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use crate::error::{Error, Result};

/// Interrupts needed inside [`ESCALATION_WINDOW`] to force a hard exit.
const ESCALATION_COUNT: usize = 3;
const ESCALATION_WINDOW: Duration = Duration::from_secs(1);

/// Write end of the self-pipe, read by the watcher thread. -1 until installed.
static WAKE_FD: AtomicI32 = AtomicI32::new(-1);
static INSTALLED: Mutex<Option<StopSignal>> = Mutex::new(None);

#[derive(Debug, Default)]
struct Shared {
    triggered: AtomicBool,
    /// Process groups of running helpers, killed on a hard exit.
    groups: Mutex<Vec<i32>>,
}

/// Shared "stop now" flag polled by the supervisor and the commands.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<Shared>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.triggered.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.triggered.load(Ordering::SeqCst)
    }

    /// [`Error::Interrupted`] once triggered.
    pub fn check(&self) -> Result<()> {
        if self.is_triggered() {
            return Err(Error::Interrupted);
        }
        Ok(())
    }

    pub fn track_group(&self, pgid: u32) {
        self.groups().push(pgid as i32);
    }

    pub fn untrack_group(&self, pgid: u32) {
        self.groups().retain(|&g| g != pgid as i32);
    }

    /// SIGKILL every tracked process group. Returns how many were signaled.
    pub fn kill_groups(&self) -> usize {
        let groups = std::mem::take(&mut *self.groups());
        for &pgid in &groups {
            unsafe {
                libc::kill(-pgid, libc::SIGKILL);
            }
        }
        groups.len()
    }

    fn groups(&self) -> MutexGuard<'_, Vec<i32>> {
        self.0.groups.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[cfg(test)]
    pub fn tracked_groups(&self) -> Vec<i32> {
        self.groups().clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Escalation {
    /// Ask the supervisor to shut down in order.
    Stop,
    /// Too many interrupts too fast: exit without cleanup.
    HardExit,
}

/// Remembers the last few interrupt times to apply the escalation rule.
#[derive(Debug, Default)]
pub struct InterruptTracker {
    recent: VecDeque<Instant>,
}

impl InterruptTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, at: Instant) -> Escalation {
        self.recent.push_back(at);
        while self.recent.len() > ESCALATION_COUNT {
            self.recent.pop_front();
        }
        match self.recent.front() {
            Some(first)
                if self.recent.len() == ESCALATION_COUNT
                    && at.saturating_duration_since(*first) < ESCALATION_WINDOW =>
            {
                Escalation::HardExit
            }
            _ => Escalation::Stop,
        }
    }
}

extern "C" fn handle_interrupt(sig: libc::c_int) {
    let fd = WAKE_FD.load(Ordering::SeqCst);
    if fd >= 0 {
        let byte = sig as u8;
        unsafe {
            libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
        }
    }
}

/// Route SIGINT and SIGTERM to the returned [`StopSignal`].
///
/// The handler only writes to a self-pipe; a watcher thread does the rest.
/// Installing twice returns the same signal.
pub fn install() -> io::Result<StopSignal> {
    let mut installed = INSTALLED.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(stop) = installed.as_ref() {
        return Ok(stop.clone());
    }

    let stop = StopSignal::new();
    let (reader, writer) = io::pipe()?;
    let watcher_stop = stop.clone();
    thread::Builder::new()
        .name("interrupts".into())
        .spawn(move || watch(reader, watcher_stop))?;
    WAKE_FD.store(writer.into_raw_fd(), Ordering::SeqCst);

    for sig in [libc::SIGINT, libc::SIGTERM] {
        let ret = unsafe {
            let mut sa: libc::sigaction = std::mem::zeroed();
            sa.sa_sigaction = handle_interrupt as *const () as usize;
            sa.sa_flags = libc::SA_RESTART;
            libc::sigemptyset(&mut sa.sa_mask);
            libc::sigaction(sig, &sa, std::ptr::null_mut())
        };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
    }

    *installed = Some(stop.clone());
    Ok(stop)
}

fn watch(mut reader: PipeReader, stop: StopSignal) {
    let mut tracker = InterruptTracker::new();
    let mut buf = [0u8; 1];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(_) => {
                info!("Signal {} received", buf[0]);
                match tracker.record(Instant::now()) {
                    Escalation::HardExit => {
                        let killed = stop.kill_groups();
                        error!("Hard exit, killed {} helper group(s)", killed);
                        unsafe { libc::_exit(1) };
                    }
                    Escalation::Stop => stop.trigger(),
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!("Interrupt watcher stopped: {}", e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn three_within_a_second_escalate() {
        let t0 = Instant::now();
        let mut tracker = InterruptTracker::new();
        assert_eq!(tracker.record(t0), Escalation::Stop);
        assert_eq!(tracker.record(t0 + Duration::from_millis(300)), Escalation::Stop);
        assert_eq!(tracker.record(t0 + Duration::from_millis(600)), Escalation::HardExit);
    }

    #[test]
    fn three_over_five_seconds_do_not() {
        let t0 = Instant::now();
        let mut tracker = InterruptTracker::new();
        for ms in [0, 2500, 5000] {
            assert_eq!(tracker.record(t0 + Duration::from_millis(ms)), Escalation::Stop);
        }
    }

    #[test]
    fn window_slides_over_the_last_three() {
        let t0 = Instant::now();
        let mut tracker = InterruptTracker::new();
        assert_eq!(tracker.record(t0), Escalation::Stop);
        assert_eq!(tracker.record(t0 + Duration::from_secs(2)), Escalation::Stop);
        assert_eq!(tracker.record(t0 + Duration::from_millis(2300)), Escalation::Stop);
        assert_eq!(tracker.record(t0 + Duration::from_millis(2600)), Escalation::HardExit);
    }

    #[test]
    fn exactly_one_second_is_not_enough() {
        let t0 = Instant::now();
        let mut tracker = InterruptTracker::new();
        tracker.record(t0);
        tracker.record(t0 + Duration::from_millis(500));
        assert_eq!(tracker.record(t0 + Duration::from_secs(1)), Escalation::Stop);
    }

    #[test]
    fn stop_signal_is_shared() {
        let stop = StopSignal::new();
        let other = stop.clone();
        assert!(!other.is_triggered());
        assert!(other.check().is_ok());
        stop.trigger();
        assert!(other.is_triggered());
        assert!(matches!(other.check(), Err(Error::Interrupted)));
    }

    #[test]
    fn kill_groups_takes_down_the_whole_group() {
        use std::os::unix::process::{CommandExt, ExitStatusExt};
        use std::process::Command;

        let mut child = Command::new("sh")
            .args(["-c", "trap '' TERM INT; sleep 30 & wait"])
            .process_group(0)
            .spawn()
            .unwrap();
        let stop = StopSignal::new();
        stop.track_group(child.id());
        stop.track_group(child.id() + 1_000_000);
        stop.untrack_group(child.id() + 1_000_000);
        assert_eq!(stop.tracked_groups(), vec![child.id() as i32]);

        assert_eq!(stop.clone().kill_groups(), 1);
        let status = child.wait().unwrap();
        assert_eq!(status.signal(), Some(libc::SIGKILL));
        assert!(stop.tracked_groups().is_empty());
    }
}
