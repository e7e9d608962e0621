//! Long-lived worker process driven over an interactive container exec.
//!
//! The worker is opaque and line-oriented: commands go in on stdin, one
//! response line comes back per command. A single demux task drains the
//! attached output stream into a bounded queue tagged by stream, so output
//! capture stays ordered without shared buffers.

use bollard::container::LogOutput;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::Docker;
use conductor_core::{Error, Result};
use std::pin::Pin;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, warn};

const OUTPUT_QUEUE_DEPTH: usize = 1024;
const READ_POLL: Duration = Duration::from_millis(100);
const STOP_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputStream::Stdout => "stdout",
            OutputStream::Stderr => "stderr",
        }
    }
}

/// One line of worker output.
#[derive(Debug, Clone)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub content: String,
}

type ExecInput = Pin<Box<dyn AsyncWrite + Send>>;

/// Handle to the worker process running inside the agent's container.
pub struct WorkerProcess {
    docker: Docker,
    container_name: String,
    /// argv[0] of the worker command, used to signal the process.
    process_name: String,
    input: Mutex<ExecInput>,
    output_rx: Mutex<mpsc::Receiver<OutputLine>>,
    demux_handle: StdMutex<Option<JoinHandle<()>>>,
}

impl WorkerProcess {
    /// Launch `command` inside `container_name` with attached pipes.
    pub async fn start(
        docker: Docker,
        container_name: impl Into<String>,
        command: Vec<String>,
    ) -> Result<Self> {
        let container_name = container_name.into();
        let process_name = command
            .first()
            .cloned()
            .ok_or_else(|| Error::Worker("empty worker command".into()))?;

        let options = CreateExecOptions {
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            cmd: Some(command),
            ..Default::default()
        };
        let exec = docker
            .create_exec(&container_name, options)
            .await
            .map_err(|e| Error::Worker(format!("create exec: {e}")))?;

        let started = docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| Error::Worker(format!("start exec: {e}")))?;
        let (output, input) = match started {
            StartExecResults::Attached { output, input } => (output, input),
            StartExecResults::Detached => {
                return Err(Error::Worker("worker exec started detached".into()));
            }
        };

        let (line_tx, line_rx) = mpsc::channel(OUTPUT_QUEUE_DEPTH);
        let demux_handle = tokio::spawn(demux_output(output, line_tx));

        debug!(container = %container_name, worker = %process_name, "Worker process started");

        Ok(Self {
            docker,
            container_name,
            process_name,
            input: Mutex::new(input),
            output_rx: Mutex::new(line_rx),
            demux_handle: StdMutex::new(Some(demux_handle)),
        })
    }

    /// Whether the worker's output stream is still open.
    pub fn is_running(&self) -> bool {
        self.demux_handle
            .lock()
            .expect("demux handle lock poisoned")
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Write one command line to the worker's stdin.
    pub async fn send_command(&self, command: &str) -> Result<()> {
        if !self.is_running() {
            return Err(Error::Worker("worker process is not running".into()));
        }
        let mut input = self.input.lock().await;
        let line = format!("{command}\n");
        input
            .write_all(line.as_bytes())
            .await
            .map_err(|e| Error::Worker(format!("write to worker: {e}")))?;
        input
            .flush()
            .await
            .map_err(|e| Error::Worker(format!("flush to worker: {e}")))?;
        Ok(())
    }

    /// Collect output lines for up to `window`, returning early once output
    /// has arrived and the stream goes quiet.
    pub async fn read_output(&self, window: Duration) -> Vec<OutputLine> {
        let deadline = Instant::now() + window;
        let mut lines = Vec::new();
        let mut rx = self.output_rx.lock().await;

        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let poll = READ_POLL.min(deadline - now);
            match timeout(poll, rx.recv()).await {
                Ok(Some(line)) => lines.push(line),
                Ok(None) => break,
                Err(_) => {
                    if !lines.is_empty() {
                        break;
                    }
                }
            }
        }
        lines
    }

    /// Signal the worker process inside the container. Best-effort; the
    /// container may already be gone.
    async fn signal(&self, signal: &str) {
        let command = format!("pkill -{signal} -f {}", self.process_name);
        let options = CreateExecOptions {
            attach_stdout: Some(false),
            attach_stderr: Some(false),
            cmd: Some(vec!["sh".to_string(), "-c".to_string(), command]),
            ..Default::default()
        };
        match self.docker.create_exec(&self.container_name, options).await {
            Ok(exec) => {
                if let Err(e) = self.docker.start_exec(&exec.id, None).await {
                    debug!(error = %e, "Worker signal exec failed");
                }
            }
            Err(e) => {
                debug!(error = %e, "Worker signal exec failed");
            }
        }
    }

    /// Terminate the worker: TERM, a grace window, then KILL.
    pub async fn stop(&self) {
        self.signal("TERM").await;

        let handle = self
            .demux_handle
            .lock()
            .expect("demux handle lock poisoned")
            .take();
        if let Some(handle) = handle {
            if !handle.is_finished() {
                match timeout(STOP_GRACE, handle).await {
                    Ok(_) => {}
                    Err(_) => {
                        warn!(
                            container = %self.container_name,
                            "Worker did not exit within grace period, killing"
                        );
                        self.signal("KILL").await;
                    }
                }
            }
        }

        // Close stdin so a stubborn worker blocked on a read also unblocks.
        let mut input = self.input.lock().await;
        let _ = input.shutdown().await;
        debug!(container = %self.container_name, "Worker process stopped");
    }
}

async fn demux_output(
    mut output: Pin<
        Box<dyn futures::Stream<Item = std::result::Result<LogOutput, bollard::errors::Error>> + Send>,
    >,
    line_tx: mpsc::Sender<OutputLine>,
) {
    use futures::StreamExt;

    let mut stdout_buf = String::new();
    let mut stderr_buf = String::new();

    while let Some(chunk) = output.next().await {
        let (stream, bytes) = match chunk {
            Ok(LogOutput::StdOut { message }) => (OutputStream::Stdout, message),
            Ok(LogOutput::StdErr { message }) => (OutputStream::Stderr, message),
            Ok(_) => continue,
            Err(e) => {
                debug!(error = %e, "Worker output stream error");
                break;
            }
        };

        let buf = match stream {
            OutputStream::Stdout => &mut stdout_buf,
            OutputStream::Stderr => &mut stderr_buf,
        };
        buf.push_str(&String::from_utf8_lossy(&bytes));

        while let Some(newline) = buf.find('\n') {
            let line: String = buf.drain(..=newline).collect();
            let content = line.trim_end_matches(['\n', '\r']).to_string();
            if content.is_empty() {
                continue;
            }
            if line_tx.send(OutputLine { stream, content }).await.is_err() {
                return;
            }
        }
    }

    // Flush unterminated trailing output.
    for (stream, buf) in [
        (OutputStream::Stdout, stdout_buf),
        (OutputStream::Stderr, stderr_buf),
    ] {
        let content = buf.trim_end_matches(['\n', '\r']).to_string();
        if !content.is_empty() {
            let _ = line_tx.send(OutputLine { stream, content }).await;
        }
    }
}
