// Session titles.
//
// Short first utterances become the title verbatim. Longer ones are
// summarized by the host's LLM with a bounded wait, falling back to
// truncation. A per-session pending marker keeps generation single-shot.

use std::sync::Arc;
use std::time::Duration;

use tether_common::protocol::api::UpdateSessionRequest;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::messenger::{CompletionError, ExtensionMessenger};
use crate::state::SessionStateStore;
use crate::transcript::first_utterance;
use crate::transport::{SessionTransport, TransportError};

pub const MAX_TITLE_CHARS: usize = 140;
pub const DEFAULT_COMPLETION_TIMEOUT: Duration = Duration::from_secs(30);

const ELLIPSIS: char = '…';

pub const TITLE_SYSTEM_PROMPT: &str = "\
You name coding sessions. Summarize the user's request as a title.\n\
Rules:\n\
- At most 12 words, no trailing punctuation\n\
- Plain text only, no quotes or markdown\n\
- Output ONLY the title, nothing else";

#[derive(Debug, Error)]
pub enum TitleError {
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Title for `utterance` without an LLM, or `None` if it is too long.
pub fn heuristic_title(utterance: &str) -> Option<String> {
    let utterance = utterance.trim();
    (!utterance.is_empty() && utterance.chars().count() <= MAX_TITLE_CHARS)
        .then(|| utterance.to_string())
}

/// Hard limit at `MAX_TITLE_CHARS`, ellipsis included.
pub fn truncate_title(text: &str) -> String {
    let text = text.trim();
    if text.chars().count() <= MAX_TITLE_CHARS {
        return text.to_string();
    }
    let mut truncated: String = text.chars().take(MAX_TITLE_CHARS - 1).collect();
    truncated.push(ELLIPSIS);
    truncated
}

/// Remove one or more layers of matching quotes around `text`.
pub fn strip_wrapping_quotes(text: &str) -> &str {
    const PAIRS: [(char, char); 5] =
        [('"', '"'), ('\'', '\''), ('`', '`'), ('“', '”'), ('‘', '’')];

    let mut current = text.trim();
    loop {
        let stripped = PAIRS.iter().find_map(|(open, close)| {
            current
                .strip_prefix(*open)
                .and_then(|rest| rest.strip_suffix(*close))
                .map(str::trim)
        });
        match stripped {
            Some(inner) if inner.len() < current.len() => current = inner,
            _ => return current,
        }
    }
}

/// Title for `utterance` when no session store race is involved.
pub fn derive_title_locally(utterance: &str) -> String {
    heuristic_title(utterance).unwrap_or_else(|| truncate_title(utterance))
}

pub struct SessionTitleService {
    transport: Arc<dyn SessionTransport>,
    messenger: Arc<dyn ExtensionMessenger>,
    state: Arc<SessionStateStore>,
    completion_timeout: Duration,
}

impl SessionTitleService {
    pub fn new(
        transport: Arc<dyn SessionTransport>,
        messenger: Arc<dyn ExtensionMessenger>,
        state: Arc<SessionStateStore>,
    ) -> Self {
        Self { transport, messenger, state, completion_timeout: DEFAULT_COMPLETION_TIMEOUT }
    }

    pub fn with_completion_timeout(mut self, timeout: Duration) -> Self {
        self.completion_timeout = timeout;
        self
    }

    /// Generate a title for `session_id` from `transcript` and write it remotely.
    ///
    /// Returns `Ok(None)` when skipped: generation already pending or done, the
    /// remote session already has a title, or the transcript has no text.
    /// Any error clears the pending marker so a later pass retries.
    pub async fn generate_and_update_title(
        &self,
        session_id: &str,
        transcript: &[u8],
    ) -> Result<Option<String>, TitleError> {
        if !self.state.try_begin_title(session_id) {
            debug!(session_id, "title generation already pending or done");
            return Ok(None);
        }

        match self.generate(session_id, transcript).await {
            Ok(Some(title)) => {
                self.state.set_title(session_id, title.clone());
                Ok(Some(title))
            }
            Ok(None) => {
                self.state.abandon_title(session_id);
                Ok(None)
            }
            Err(error) => {
                self.state.abandon_title(session_id);
                Err(error)
            }
        }
    }

    async fn generate(&self, session_id: &str, transcript: &[u8]) -> Result<Option<String>, TitleError> {
        let remote = self.transport.get(session_id, false).await?;
        if let Some(existing) = remote.existing_title() {
            debug!(session_id, "remote session already has a title");
            let existing = existing.to_string();
            self.state.observe_remote(&remote);
            self.state.set_title(session_id, existing);
            return Ok(None);
        }

        let Some(utterance) = first_utterance(transcript) else {
            debug!(session_id, "transcript has no text to title from");
            return Ok(None);
        };

        let title = match heuristic_title(&utterance) {
            Some(title) => title,
            None => self.summarize(session_id, &utterance).await,
        };

        let request = UpdateSessionRequest { title: Some(title.clone()), ..Default::default() };
        let updated = self.transport.update(session_id, request).await?;
        self.state.advance_high_water_mark(session_id, updated.updated_at);
        info!(session_id, title = %title, "session title updated");
        Ok(Some(title))
    }

    async fn summarize(&self, session_id: &str, utterance: &str) -> String {
        let request = self.messenger.request_completion(TITLE_SYSTEM_PROMPT, utterance);
        let outcome = match tokio::time::timeout(self.completion_timeout, request).await {
            Ok(Ok(response)) => {
                let title = strip_wrapping_quotes(&response);
                if title.is_empty() {
                    Err(CompletionError::EmptyResponse)
                } else {
                    Ok(truncate_title(title))
                }
            }
            Ok(Err(error)) => Err(error),
            Err(_) => Err(CompletionError::ClientError(format!(
                "timed out after {}s",
                self.completion_timeout.as_secs()
            ))),
        };

        outcome.unwrap_or_else(|error| {
            warn!(session_id, error = %error, "title completion failed; truncating first message");
            truncate_title(utterance)
        })
    }
}
