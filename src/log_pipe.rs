use std::io::{self, BufRead, BufReader, PipeReader, PipeWriter};
use std::process::Stdio;
use std::thread::{self, JoinHandle};

use tracing::{Level, debug, error, info, trace, warn};

/// A pipe whose write end is handed to child processes and whose read end
/// is drained line by line on a background thread.
pub struct LogPipe {
    writer: Option<PipeWriter>,
    pump: Option<JoinHandle<()>>,
}

impl LogPipe {
    /// Forward every line into `tracing` at `level`, target `sshtunnel::helper`.
    pub fn new(level: Level) -> io::Result<Self> {
        Self::with_sink(format!("log-pipe-{}", level), move |line| emit(level, line))
    }

    /// Hand every line (newline stripped, lossily decoded) to `sink`.
    pub fn with_sink<F>(name: String, sink: F) -> io::Result<Self>
    where
        F: FnMut(&str) + Send + 'static,
    {
        let (reader, writer) = io::pipe()?;
        let pump = thread::Builder::new()
            .name(name)
            .spawn(move || pump(reader, sink))?;
        Ok(Self {
            writer: Some(writer),
            pump: Some(pump),
        })
    }

    /// A fresh handle on the write end, for a child's stdout or stderr.
    pub fn stdio(&self) -> io::Result<Stdio> {
        let writer = self
            .writer
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "log pipe already closed"))?;
        Ok(writer.try_clone()?.into())
    }

    /// Close our write end and wait for the pump to drain.
    ///
    /// Returns once every child holding the write end has exited.
    pub fn close(mut self) {
        self.writer.take();
        if let Some(pump) = self.pump.take()
            && pump.join().is_err()
        {
            warn!("Log pipe reader panicked");
        }
    }
}

impl Drop for LogPipe {
    fn drop(&mut self) {
        // Without a join: a child that outlives us would block it forever.
        self.writer.take();
    }
}

fn pump<F: FnMut(&str)>(reader: PipeReader, mut sink: F) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                sink(line.trim_end_matches(['\n', '\r']));
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!("Log pipe read failed: {}", e);
                break;
            }
        }
    }
}

fn emit(level: Level, line: &str) {
    if level == Level::ERROR {
        error!(target: "sshtunnel::helper", "{}", line);
    } else if level == Level::WARN {
        warn!(target: "sshtunnel::helper", "{}", line);
    } else if level == Level::INFO {
        info!(target: "sshtunnel::helper", "{}", line);
    } else if level == Level::DEBUG {
        debug!(target: "sshtunnel::helper", "{}", line);
    } else {
        trace!(target: "sshtunnel::helper", "{}", line);
    }
}
