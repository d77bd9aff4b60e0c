//! Remote plugin bridge.
//!
//! An [`Invoker`] runs a named method somewhere else and reports back, either
//! once ([`Invoker::call`]) or as a stream of progress and results
//! ([`Invoker::stream`]). [`SubprocessInvoker`] runs each invocation in its own
//! child process speaking the NDJSON frames of [`protocol`];
//! [`load_remote_plugin`] turns such an executable into a regular
//! [`PluginDescriptor`](crate::plugin::PluginDescriptor).

pub mod protocol;
pub mod remote;
pub mod subprocess;

use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

pub use protocol::{decode_line, ControlMessage, Decoded, Frame, RemoteProgress};
pub use remote::{load_remote_plugin, run_remote_subtask, RemotePluginInfo, RemoteSubTaskInfo, RemoteTaskData};
pub use subprocess::SubprocessInvoker;

/// Method every remote plugin answers with its description.
pub const PLUGIN_INFO_METHOD: &str = "plugin-info";
/// Method that runs one subtask.
pub const RUN_SUBTASK_METHOD: &str = "run-subtask";

/// Errors raised while invoking a remote method.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Failed to start {method}: {source}")]
    Spawn {
        method: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Bridge I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{method} exited with code {code:?}")]
    NonZeroExit { method: String, code: Option<i32> },

    #[error("{method} produced malformed output: {detail}")]
    MalformedOutput { method: String, detail: String },

    #[error("{method} failed: {message}")]
    Remote { method: String, message: String },

    #[error("{method} was cancelled")]
    Cancelled { method: String },

    #[error("Bridge serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Final value of a method.
#[derive(Debug, Clone, PartialEq)]
pub struct CallResult {
    pub data: Value,
}

impl CallResult {
    pub fn get<T: DeserializeOwned>(&self) -> Result<T, BridgeError> {
        Ok(serde_json::from_value(self.data.clone())?)
    }
}

/// One message of a streamed invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamMessage {
    Progress(RemoteProgress),
    Result(Value),
}

/// Messages of one streamed invocation, ending with an error if it failed.
pub struct MethodStream {
    inner: ReceiverStream<Result<StreamMessage, BridgeError>>,
}

impl MethodStream {
    pub fn from_receiver(rx: mpsc::Receiver<Result<StreamMessage, BridgeError>>) -> Self {
        Self {
            inner: ReceiverStream::new(rx),
        }
    }

    /// Drains the stream and returns the last result.
    pub async fn into_result(mut self, method: &str) -> Result<CallResult, BridgeError> {
        let mut last = None;
        while let Some(message) = self.next().await {
            if let StreamMessage::Result(data) = message? {
                last = Some(data);
            }
        }
        last.map(|data| CallResult { data })
            .ok_or_else(|| BridgeError::MalformedOutput {
                method: method.to_string(),
                detail: "no result frame".into(),
            })
    }
}

impl Stream for MethodStream {
    type Item = Result<StreamMessage, BridgeError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// Runs methods of a plugin that lives outside this process.
#[async_trait]
pub trait Invoker: Send + Sync {
    /// Single request, single result.
    async fn call(
        &self,
        method: &str,
        cancel: &CancellationToken,
        args: &[Value],
    ) -> Result<CallResult, BridgeError> {
        self.stream(method, cancel, args).await?.into_result(method).await
    }

    /// Single request, many messages.
    async fn stream(
        &self,
        method: &str,
        cancel: &CancellationToken,
        args: &[Value],
    ) -> Result<MethodStream, BridgeError>;
}
