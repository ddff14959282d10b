//! The peer runtime as a child process.
//!
//! The runtime is started with the socket path as its first argument. Its
//! stdout and stderr are captured line by line into a bounded console buffer. The
//! process is killed when the communicator is terminated, or when the
//! `PeerProcess` is dropped.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, trace};

use crate::error::Result;

type Console = Arc<Mutex<String>>;

/// A spawned peer runtime.
pub struct PeerProcess {
    child: Child,
    console: Console,
}

impl PeerProcess {
    /// Spawn `command` with `socket_path` appended as an argument.
    ///
    /// Any arguments already on `command` (such as the script to run) come
    /// first, so a runtime invoked as `node script.js` sees the path as
    /// `argv[2]`, which is the script's first argument.
    pub fn spawn(mut command: Command, socket_path: &Path) -> Result<Self> {
        command
            .arg(socket_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn()?;
        let console = Console::default();

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(capture(stdout, console.clone(), "stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(capture(stderr, console.clone(), "stderr"));
        }

        debug!(pid = ?child.id(), path = %socket_path.display(), "Peer runtime started");
        Ok(Self { child, console })
    }

    /// OS process id, while the process is running.
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Everything the process has printed so far.
    pub fn console_output(&self) -> String {
        self.console
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Kill the process and wait for it to exit.
    pub async fn kill(&mut self) -> Result<()> {
        if self.child.try_wait()?.is_some() {
            return Ok(());
        }
        self.child.kill().await?;
        debug!("Peer runtime killed");
        Ok(())
    }

    /// Wait for the process to exit on its own.
    pub async fn wait(&mut self) -> Result<ExitStatus> {
        Ok(self.child.wait().await?)
    }

    /// Exit status, if the process has already exited.
    pub fn try_wait(&mut self) -> Result<Option<ExitStatus>> {
        Ok(self.child.try_wait()?)
    }
}

/// Most console output kept per process. Older output is dropped first.
pub const CONSOLE_LIMIT: usize = 1024 * 1024;

async fn capture<R>(stream: R, console: Console, name: &'static str)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut raw = Vec::new();

    loop {
        raw.clear();
        match reader.read_until(b'\n', &mut raw).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(stream = name, "Console read failed: {}", e);
                break;
            }
        }

        // Runtimes may print bytes that are not UTF-8.
        let text = String::from_utf8_lossy(&raw);
        let line = text.trim_end_matches(|c| c == '\n' || c == '\r');
        trace!(stream = name, "{}", line);

        let mut console = console.lock().unwrap_or_else(|e| e.into_inner());
        append_line(&mut console, line, CONSOLE_LIMIT);
    }
}

fn append_line(console: &mut String, line: &str, limit: usize) {
    console.push_str(line);
    console.push('\n');

    if console.len() > limit {
        let mut cut = console.len() - limit;
        while !console.is_char_boundary(cut) {
            cut += 1;
        }
        console.drain(..cut);
    }
}
