// SPDX-License-Identifier: Apache-2.0
//! C2 — child transport.
//!
//! Two variants behind one capability set: spawn an MCP child over stdio, or
//! dial a Unix domain socket when the host itself is nested inside another
//! MCP runtime and cannot share its own stdio (§4.2, §6 `MCP_NESTED`).
//!
//! Both variants expose the same three operations: `send`, a channel of
//! incoming [`Frame`]s, and `stop`. Writes after `stop` fail with
//! `TransportClosed`, and `stop` is safe to call concurrently with an
//! in-flight `send`.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, warn};

use crate::codec::{Frame, JsonRpcCodec};
use crate::error::McpError;

const GRACEFUL_WAIT: Duration = Duration::from_secs(5);

/// How to reach an MCP child process.
#[derive(Debug, Clone)]
pub enum TransportSpec {
    /// Spawn `command` with `args`, inheriting the host environment plus
    /// `env` overrides.
    Stdio {
        command: String,
        args: Vec<String>,
        env: Vec<(String, String)>,
        /// Tee the child's stderr to the host's stderr. Disabled in quiet mode.
        tee_stderr: bool,
    },
    /// Dial an already-listening Unix domain socket (nested mode, §4.2).
    Socket { path: std::path::PathBuf },
}

enum Owner {
    /// Stdio children are killed on stop; sockets have nothing to own.
    Child(Mutex<Child>),
    None,
}

/// A live connection to one MCP child, stdio or socket, behind one interface.
pub struct ChildTransport {
    write: Mutex<FramedWrite<Box<dyn AsyncWrite + Unpin + Send>, JsonRpcCodec>>,
    incoming: Mutex<mpsc::Receiver<Result<Frame, McpError>>>,
    closed: Arc<AtomicBool>,
    owner: Owner,
}

impl ChildTransport {
    /// Connect using `spec`. For `Socket`, a dial failure is returned as-is;
    /// the caller (C5) decides whether to fall back to stdio.
    pub async fn connect(spec: &TransportSpec) -> Result<Self, McpError> {
        match spec {
            TransportSpec::Stdio { command, args, env, tee_stderr } => {
                Self::spawn_stdio(command, args, env, *tee_stderr).await
            }
            TransportSpec::Socket { path } => Self::dial_socket(path).await,
        }
    }

    async fn spawn_stdio(
        command: &str,
        args: &[String],
        env: &[(String, String)],
        tee_stderr: bool,
    ) -> Result<Self, McpError> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .envs(env.iter().cloned())
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| McpError::HandshakeFailed {
                server: command.to_string(),
                reason: format!("spawn failed: {e}"),
            })?;

        let stdin = child.stdin.take().expect("piped stdin");
        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take();

        if let Some(mut stderr) = stderr {
            tokio::spawn(async move {
                use tokio::io::AsyncBufReadExt;
                let mut lines = tokio::io::BufReader::new(&mut stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if tee_stderr {
                        eprintln!("{line}");
                    } else {
                        debug!(child_stderr = %line, "suppressed child stderr");
                    }
                }
            });
        }

        let transport = Self::from_halves(stdin, stdout);
        Ok(Self { owner: Owner::Child(Mutex::new(child)), ..transport })
    }

    async fn dial_socket(path: &Path) -> Result<Self, McpError> {
        let stream = UnixStream::connect(path).await.map_err(|e| McpError::HandshakeFailed {
            server: path.display().to_string(),
            reason: format!("socket dial failed: {e}"),
        })?;
        let (read, write) = stream.into_split();
        Ok(Self { owner: Owner::None, ..Self::from_halves(write, read) })
    }

    fn from_halves(
        write_half: impl AsyncWrite + Unpin + Send + 'static,
        read_half: impl AsyncRead + Unpin + Send + 'static,
    ) -> Self {
        let write = FramedWrite::new(Box::new(write_half) as Box<dyn AsyncWrite + Unpin + Send>, JsonRpcCodec::new());
        let (tx, rx) = mpsc::channel(64);
        let closed = Arc::new(AtomicBool::new(false));

        let mut reader = FramedRead::new(read_half, JsonRpcCodec::new());
        tokio::spawn(async move {
            use futures::StreamExt;
            while let Some(item) = reader.next().await {
                let stop = item.is_err();
                if tx.send(item).await.is_err() {
                    break;
                }
                if stop {
                    break;
                }
            }
            let _ = tx.send(Err(McpError::TransportClosed("EOF from child".into()))).await;
        });

        Self {
            write: Mutex::new(write),
            incoming: Mutex::new(rx),
            closed,
            owner: Owner::None,
        }
    }

    /// Send one frame. Fails with `TransportClosed` if `stop` already ran.
    pub async fn send(&self, frame: Frame) -> Result<(), McpError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(McpError::TransportClosed("write after stop".into()));
        }
        use futures::SinkExt;
        let mut w = self.write.lock().await;
        w.send(frame).await.map_err(|e| McpError::TransportClosed(e.to_string()))?;
        w.flush().await.map_err(|e| McpError::TransportClosed(e.to_string()))
    }

    /// Receive the next frame, or `None` once the transport has drained and
    /// every pending waiter has been notified. Only the dispatcher's single
    /// reader loop should call this.
    pub async fn recv(&self) -> Option<Result<Frame, McpError>> {
        self.incoming.lock().await.recv().await
    }

    /// Stop this transport. Safe to call concurrently with `send`/`recv`,
    /// and safe to call more than once.
    ///
    /// For stdio children: close stdin, wait up to 5s for exit, send SIGTERM,
    /// wait another 5s, then force-kill.
    pub async fn stop(&self) {
        self.closed.store(true, Ordering::Release);
        {
            let mut w = self.write.lock().await;
            let _ = w.get_mut().shutdown().await;
        }
        if let Owner::Child(child) = &self.owner {
            let mut child = child.lock().await;
            if let Ok(Some(_)) = child.try_wait() {
                return;
            }
            if timeout(GRACEFUL_WAIT, child.wait()).await.is_ok() {
                return;
            }
            #[cfg(unix)]
            if let Some(pid) = child.id() {
                unsafe {
                    libc::kill(pid as i32, libc::SIGTERM);
                }
            }
            if timeout(GRACEFUL_WAIT, child.wait()).await.is_ok() {
                return;
            }
            warn!("child did not exit after SIGTERM; force-killing");
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }
}
