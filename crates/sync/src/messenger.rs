// Host messenger: notifications to the editor host and LLM completions.
//
// The engine never talks to an editor or model directly. Hosts implement
// `ExtensionMessenger`; the headless daemon uses `LoggingMessenger`.

use std::error::Error;
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::pin::Pin;

use serde::Serialize;
use tracing::info;

/// Messages pushed to the host UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostMessage {
    /// Focus a (possibly freshly restored) task.
    ShowTask { task_id: String },
    SessionShared { session_id: String, share_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionError {
    /// The host has no completion backend.
    Unavailable,
    ClientError(String),
    EmptyResponse,
}

impl Display for CompletionError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            CompletionError::Unavailable => write!(f, "completions are unavailable"),
            CompletionError::ClientError(msg) => write!(f, "completion client error: {msg}"),
            CompletionError::EmptyResponse => write!(f, "completion returned an empty response"),
        }
    }
}

impl Error for CompletionError {}

pub type CompletionFuture = Pin<Box<dyn Future<Output = Result<String, CompletionError>> + Send>>;

pub trait ExtensionMessenger: Send + Sync {
    fn send_message(&self, message: HostMessage);

    /// One-shot LLM completion. Callers apply their own timeout.
    fn request_completion(&self, system: &str, prompt: &str) -> CompletionFuture;
}

/// Messenger for headless operation.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingMessenger;

impl ExtensionMessenger for LoggingMessenger {
    fn send_message(&self, message: HostMessage) {
        match serde_json::to_string(&message) {
            Ok(payload) => info!(message = %payload, "host message"),
            Err(error) => info!(error = %error, ?message, "host message"),
        }
    }

    fn request_completion(&self, _system: &str, _prompt: &str) -> CompletionFuture {
        Box::pin(async { Err(CompletionError::Unavailable) })
    }
}
