//! Child-process invoker.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn, Instrument, Span};

use super::protocol::{decode_line, ControlMessage, Decoded, Frame};
use super::{BridgeError, Invoker, MethodStream, StreamMessage};

const STREAM_CAPACITY: usize = 64;

/// Runs every invocation as `<executable> [base args] <method> <json-arg>...`.
///
/// Each invocation gets its own child; nothing is shared between them.
#[derive(Debug, Clone)]
pub struct SubprocessInvoker {
    executable: PathBuf,
    base_args: Vec<String>,
    env: Vec<(String, String)>,
    cwd: Option<PathBuf>,
}

impl SubprocessInvoker {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            base_args: Vec::new(),
            env: Vec::new(),
            cwd: None,
        }
    }

    /// Arguments placed before the method name, e.g. a script path for an interpreter.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.base_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    fn command(&self, method: &str, args: &[Value]) -> Result<Command, BridgeError> {
        let mut command = Command::new(&self.executable);
        command.args(&self.base_args).arg(method);
        for arg in args {
            command.arg(serde_json::to_string(arg)?);
        }
        for (key, value) in &self.env {
            command.env(key, value);
        }
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        Ok(command)
    }
}

#[async_trait]
impl Invoker for SubprocessInvoker {
    async fn stream(
        &self,
        method: &str,
        cancel: &CancellationToken,
        args: &[Value],
    ) -> Result<MethodStream, BridgeError> {
        let mut child = self
            .command(method, args)?
            .spawn()
            .map_err(|source| BridgeError::Spawn {
                method: method.to_string(),
                source,
            })?;
        let pipe_missing = |name: &str| BridgeError::Spawn {
            method: method.to_string(),
            source: std::io::Error::other(format!("{} not captured", name)),
        };
        let stdin = child.stdin.take().ok_or_else(|| pipe_missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| pipe_missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| pipe_missing("stderr"))?;

        debug!(
            executable = %self.executable.display(),
            method,
            pid = child.id(),
            "Started plugin process"
        );

        let span = Span::current();
        tokio::spawn(forward_stderr(method.to_string(), stderr).instrument(span.clone()));

        let (tx, rx) = mpsc::channel(STREAM_CAPACITY);
        let session = Session {
            method: method.to_string(),
            child,
            stdin: Some(stdin),
            cancel: cancel.clone(),
            cancel_sent: false,
            failure: None,
            tx,
        };
        tokio::spawn(session.run(stdout).instrument(span));

        Ok(MethodStream::from_receiver(rx))
    }
}

async fn forward_stderr(method: String, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if !line.trim().is_empty() {
            info!(method = %method, stream = "stderr", "{}", line);
        }
    }
}

/// One running invocation.
struct Session {
    method: String,
    child: Child,
    stdin: Option<ChildStdin>,
    cancel: CancellationToken,
    cancel_sent: bool,
    failure: Option<BridgeError>,
    tx: mpsc::Sender<Result<StreamMessage, BridgeError>>,
}

impl Session {
    async fn run(mut self, stdout: ChildStdout) {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(line)) => self.handle_line(&line).await,
                    Ok(None) => break,
                    Err(e) => {
                        self.failure.get_or_insert(BridgeError::Io(e));
                        break;
                    }
                },
                _ = self.cancel.cancelled(), if !self.cancel_sent => self.send_cancel().await,
            }
        }

        // The child finishes on its own, even after a cancel.
        let outcome = match self.child.wait().await {
            Err(e) => Err(BridgeError::Io(e)),
            Ok(_) if self.cancel_sent => Err(BridgeError::Cancelled {
                method: self.method.clone(),
            }),
            Ok(status) => match self.failure.take() {
                Some(failure) => Err(failure),
                None if !status.success() => Err(BridgeError::NonZeroExit {
                    method: self.method.clone(),
                    code: status.code(),
                }),
                None => Ok(()),
            },
        };

        match &outcome {
            Ok(()) => debug!(method = %self.method, "Plugin process finished"),
            Err(e) => warn!(method = %self.method, error = %e, "Plugin process failed"),
        }
        if let Err(e) = outcome {
            let _ = self.tx.send(Err(e)).await;
        }
    }

    async fn send_cancel(&mut self) {
        self.cancel_sent = true;
        let Some(mut stdin) = self.stdin.take() else {
            return;
        };
        let line = ControlMessage::Cancel.to_line();
        if let Err(e) = stdin.write_all(line.as_bytes()).await {
            debug!(method = %self.method, error = %e, "Plugin process stdin already closed");
        }
        let _ = stdin.shutdown().await;
        info!(method = %self.method, "Sent cancel to plugin process");
    }

    async fn handle_line(&mut self, line: &str) {
        match decode_line(line) {
            Decoded::Frame(Frame::Log { level, message }) => {
                let method = self.method.as_str();
                match level.to_ascii_lowercase().as_str() {
                    "error" => error!(method, "{}", message),
                    "warn" | "warning" => warn!(method, "{}", message),
                    "debug" => debug!(method, "{}", message),
                    "trace" => trace!(method, "{}", message),
                    _ => info!(method, "{}", message),
                }
            }
            Decoded::Frame(Frame::Progress(progress)) => {
                self.deliver(StreamMessage::Progress(progress)).await;
            }
            Decoded::Frame(Frame::Result { data }) => {
                self.deliver(StreamMessage::Result(data)).await;
            }
            Decoded::Frame(Frame::Error { message }) => {
                self.failure.get_or_insert(BridgeError::Remote {
                    method: self.method.clone(),
                    message,
                });
            }
            Decoded::Malformed(detail) => {
                self.failure.get_or_insert(BridgeError::MalformedOutput {
                    method: self.method.clone(),
                    detail,
                });
            }
            Decoded::Text(text) => info!(method = %self.method, "{}", text),
            Decoded::Empty => {}
        }
    }

    async fn deliver(&self, message: StreamMessage) {
        // A dropped receiver only means nobody listens; stdout is still drained.
        let _ = self.tx.send(Ok(message)).await;
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn sh(script: &str) -> SubprocessInvoker {
        SubprocessInvoker::new("sh").with_args(["-c", script, "plugin"])
    }

    #[tokio::test]
    async fn test_call_returns_last_result() {
        let invoker = sh(r#"echo "starting $1"; echo '{"type":"result","data":{"ok":true}}'"#);
        let result = invoker
            .call("plugin-info", &CancellationToken::new(), &[])
            .await
            .unwrap();
        assert_eq!(result.data["ok"], true);
    }

    #[tokio::test]
    async fn test_arguments_are_json_encoded() {
        let invoker = sh(r#"printf '{"type":"result","data":%s}\n' "$2""#);
        let result = invoker
            .call("echo", &CancellationToken::new(), &[serde_json::json!({"a": [1, 2]})])
            .await
            .unwrap();
        assert_eq!(result.data, serde_json::json!({"a": [1, 2]}));
    }

    #[tokio::test]
    async fn test_error_frame_names_method() {
        let invoker = sh(r#"echo '{"type":"error","message":"token expired"}'"#);
        let err = invoker
            .call("run-subtask", &CancellationToken::new(), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Remote { ref method, .. } if method == "run-subtask"));
    }

    #[tokio::test]
    async fn test_progress_before_failure_is_kept() {
        let invoker = sh(r#"echo '{"type":"progress","increment":2}'; exit 3"#);
        let mut stream = invoker
            .stream("run-subtask", &CancellationToken::new(), &[])
            .await
            .unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert!(matches!(first, StreamMessage::Progress(p) if p.increment == 2));
        let last = stream.next().await.unwrap();
        assert!(matches!(last, Err(BridgeError::NonZeroExit { code: Some(3), .. })));
        assert!(stream.next().await.is_none());
    }
}
