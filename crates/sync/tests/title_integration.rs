// Integration tests: session title generation against a recording store.

mod support;

use std::sync::Arc;
use std::time::Duration;

use tether_common::types::BlobKind;
use tether_sync::messenger::CompletionError;
use tether_sync::state::{SessionStateStore, TitleState};
use tether_sync::title::{SessionTitleService, TitleError, MAX_TITLE_CHARS};

use support::{conversation, MockTransport, RecordingMessenger};

struct Fixture {
    transport: Arc<MockTransport>,
    messenger: Arc<RecordingMessenger>,
    state: Arc<SessionStateStore>,
    service: SessionTitleService,
}

fn fixture() -> Fixture {
    let transport = Arc::new(MockTransport::new());
    let messenger = Arc::new(RecordingMessenger::default());
    let state = Arc::new(SessionStateStore::new());
    let service = SessionTitleService::new(transport.clone(), messenger.clone(), state.clone())
        .with_completion_timeout(Duration::from_millis(100));
    transport.seed_session("s-1", None, &[]);
    Fixture { transport, messenger, state, service }
}

fn long_request() -> String {
    "please ".repeat(30) + "refactor the authentication flow"
}

#[tokio::test]
async fn short_utterance_becomes_title_without_llm() {
    let f = fixture();

    let title = f
        .service
        .generate_and_update_title("s-1", conversation("  Fix flaky test ").as_bytes())
        .await
        .unwrap();

    assert_eq!(title.as_deref(), Some("Fix flaky test"));
    assert_eq!(f.messenger.completion_requests(), 0);
    let updates = f.transport.updates();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].1.title.as_deref(), Some("Fix flaky test"));
    assert_eq!(f.state.title("s-1"), TitleState::Known("Fix flaky test".into()));
    assert_eq!(
        f.state.high_water_mark("s-1"),
        f.transport.session("s-1").map(|session| session.updated_at)
    );
}

#[tokio::test]
async fn long_utterance_is_summarized_and_unquoted() {
    let f = fixture();
    f.messenger.set_completion(Ok("  \"Refactor auth flow\"  ".into()));

    let title = f
        .service
        .generate_and_update_title("s-1", conversation(&long_request()).as_bytes())
        .await
        .unwrap();

    assert_eq!(title.as_deref(), Some("Refactor auth flow"));
    assert_eq!(f.messenger.completion_requests(), 1);
}

#[tokio::test]
async fn unavailable_completion_falls_back_to_truncation() {
    let f = fixture();

    let title = f
        .service
        .generate_and_update_title("s-1", conversation(&long_request()).as_bytes())
        .await
        .unwrap()
        .expect("title should be generated");

    assert_eq!(title.chars().count(), MAX_TITLE_CHARS);
    assert!(title.ends_with('…'));
    assert!(title.starts_with("please please"));
}

#[tokio::test]
async fn slow_completion_times_out_to_truncation() {
    let f = fixture();
    f.messenger.set_completion(Ok("Too late".into()));
    f.messenger.set_completion_delay(Duration::from_secs(2));

    let title = f
        .service
        .generate_and_update_title("s-1", conversation(&long_request()).as_bytes())
        .await
        .unwrap()
        .expect("title should be generated");

    assert!(title.ends_with('…'));
}

#[tokio::test]
async fn blank_completion_falls_back_to_truncation() {
    let f = fixture();
    f.messenger.set_completion(Ok("\"\"".into()));

    let title = f
        .service
        .generate_and_update_title("s-1", conversation(&long_request()).as_bytes())
        .await
        .unwrap()
        .expect("title should be generated");

    assert!(title.ends_with('…'));
}

#[tokio::test]
async fn existing_remote_title_is_kept() {
    let f = fixture();
    f.transport.seed_session("s-2", Some("Named elsewhere"), &[]);

    let title = f
        .service
        .generate_and_update_title("s-2", conversation("New name").as_bytes())
        .await
        .unwrap();

    assert_eq!(title, None);
    assert!(f.transport.updates().is_empty());
    assert_eq!(f.state.title("s-2"), TitleState::Known("Named elsewhere".into()));
}

#[tokio::test]
async fn title_is_generated_at_most_once() {
    let f = fixture();
    let transcript = conversation("Add caching");

    let (a, b) = tokio::join!(
        f.service.generate_and_update_title("s-1", transcript.as_bytes()),
        f.service.generate_and_update_title("s-1", transcript.as_bytes()),
    );
    let again = f.service.generate_and_update_title("s-1", transcript.as_bytes()).await.unwrap();

    let generated = [a.unwrap(), b.unwrap()].into_iter().flatten().count();
    assert_eq!(generated, 1);
    assert_eq!(again, None);
    assert_eq!(f.transport.updates().len(), 1);
}

#[tokio::test]
async fn transport_failure_clears_pending_marker() {
    let f = fixture();

    let result = f.service.generate_and_update_title("missing", conversation("Hi").as_bytes()).await;

    assert!(matches!(result, Err(TitleError::Transport(error)) if error.is_not_found()));
    assert_eq!(f.state.title("missing"), TitleState::Unknown);
    assert!(f.state.needs_title("missing"));
}

#[tokio::test]
async fn transcript_without_text_is_skipped() {
    let f = fixture();

    let title = f.service.generate_and_update_title("s-1", b"[]").await.unwrap();

    assert_eq!(title, None);
    assert!(f.transport.updates().is_empty());
    assert!(f.state.needs_title("s-1"));
}

#[tokio::test]
async fn completion_error_variants_are_reported() {
    let f = fixture();
    f.messenger.set_completion(Err(CompletionError::ClientError("quota".into())));

    let title = f
        .service
        .generate_and_update_title("s-1", conversation(&long_request()).as_bytes())
        .await
        .unwrap()
        .expect("title should be generated");

    assert!(title.ends_with('…'));
    assert_eq!(f.transport.uploads_of(BlobKind::Conversation), 0);
}
