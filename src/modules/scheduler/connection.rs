//! WebSocket transport for the worker protocol: one writer task draining the
//! connection's send queue, one read loop feeding the lifecycle.

use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::lifecycle::JobLifecycle;
use super::model::Registration;
use super::protocol::{ServerMessage, WorkerMessage};
use crate::state::AppState;

pub async fn worker_socket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "failed to encode server message");
                    continue;
                }
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let frames = text_frames(&mut stream);
    serve_frames(&state.lifecycle, frames, tx).await;
    writer.abort();
}

/// Text frames until the peer closes or errors; other frame kinds are skipped.
fn text_frames<'a, S>(stream: &'a mut S) -> impl Stream<Item = String> + Unpin + 'a
where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    stream
        .take_while(|frame| {
            let open = matches!(frame, Ok(message) if !matches!(message, Message::Close(_)));
            futures_util::future::ready(open)
        })
        .filter_map(|frame| {
            futures_util::future::ready(match frame {
                Ok(Message::Text(text)) => Some(text.as_str().to_string()),
                _ => None,
            })
        })
}

/// Runs the protocol over decoded text frames. Returns after the peer is
/// gone, having started the reconnect grace window if it had registered.
pub(crate) async fn serve_frames<S>(
    lifecycle: &JobLifecycle,
    mut frames: S,
    outbound: mpsc::UnboundedSender<ServerMessage>,
) -> Option<Registration>
where
    S: Stream<Item = String> + Unpin,
{
    let mut registration: Option<Registration> = None;

    while let Some(frame) = frames.next().await {
        let message: WorkerMessage = match serde_json::from_str(&frame) {
            Ok(message) => message,
            Err(e) => {
                debug!(error = %e, "ignoring malformed worker frame");
                continue;
            }
        };
        match (&registration, message) {
            (None, WorkerMessage::Register { previous_id, token }) => {
                registration = lifecycle
                    .scheduler()
                    .register(previous_id, &token, outbound.clone());
            }
            (None, _) => debug!("ignoring worker message before register"),
            (Some(reg), message) => lifecycle.on_message(reg.id, message).await,
        }
    }

    if let Some(reg) = &registration {
        lifecycle.scheduler().disconnect(reg.id, reg.epoch);
    }
    registration
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::Duration;

    use futures_util::stream;

    use super::*;
    use crate::config::settings::VerifierConfig;
    use crate::infrastructure::storage::memory::MemoryStorage;
    use crate::modules::asset::model::{Asset, Job, JobState};
    use crate::modules::asset::repository::{AssetStore, MemoryAssetStore};
    use crate::modules::asset::tracker::VariantTracker;
    use crate::modules::asset::verifier::Verifier;
    use crate::modules::manifest::ManifestService;
    use crate::modules::scheduler::protocol::issue_worker_token;
    use crate::modules::scheduler::service::tests::{SECRET, scheduler};
    use crate::modules::signer::Signer;
    use crate::infrastructure::queue::LogNotifier;
    use crate::test_support::DurationProber;

    fn lifecycle(store: Arc<MemoryAssetStore>) -> JobLifecycle {
        let storage = Arc::new(MemoryStorage::new());
        let prober = Arc::new(DurationProber::new(&[]));
        let manifests = Arc::new(ManifestService::new(
            storage.clone(),
            prober.clone(),
            Signer::new("secret", "http://localhost:3000"),
            None,
            Duration::from_secs(60),
        ));
        let verifier = Arc::new(Verifier::new(
            storage,
            prober,
            manifests.clone(),
            store.clone(),
            VerifierConfig::default(),
        ));
        let tracker = Arc::new(VariantTracker::new(
            store.clone(),
            manifests,
            verifier,
            Arc::new(LogNotifier),
        ));
        JobLifecycle::new(scheduler(5), store, tracker, None, None)
    }

    fn frames(items: Vec<String>) -> impl Stream<Item = String> + Unpin {
        stream::iter(items)
    }

    #[tokio::test]
    async fn messages_before_register_and_garbage_are_ignored() {
        let lifecycle = lifecycle(Arc::new(MemoryAssetStore::new()));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let token = issue_worker_token(SECRET, "enc-1", 60);
        let input = vec![
            r#"{"type":"info","capabilities":{"class":"gpu"}}"#.to_string(),
            "not json".to_string(),
            r#"{"type":"register","token":"forged"}"#.to_string(),
            format!(r#"{{"type":"register","token":"{token}"}}"#),
            r#"{"type":"info","capabilities":{"class":"gpu"}}"#.to_string(),
        ];

        let reg = serve_frames(&lifecycle, frames(input), tx).await.unwrap();
        assert_eq!(rx.try_recv().unwrap(), ServerMessage::Registered { id: reg.id });

        let snapshot = lifecycle.scheduler().snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].priority, 10);
        assert!(!snapshot[0].connected);
    }

    #[tokio::test]
    async fn registered_worker_receives_queued_job() {
        let store = Arc::new(MemoryAssetStore::new());
        let lifecycle = lifecycle(store.clone());
        let asset = Asset::new("Film", vec!["1000k".to_string()], 10.0, BTreeMap::new());
        let job = Job::for_asset(&asset, serde_json::json!({"args": ["-crf", "23"]}));
        store.create(&asset, &job).await.unwrap();
        lifecycle.enqueue(&job).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let token = issue_worker_token(SECRET, "enc-1", 60);
        let input = vec![
            format!(r#"{{"type":"register","token":"{token}"}}"#),
            r#"{"type":"info","capabilities":{"class":"cpu"}}"#.to_string(),
            format!(r#"{{"type":"assign-ack","job_id":"{}","accepted":true}}"#, job.id),
            format!(r#"{{"type":"progress","job_id":"{}","position_seconds":4.5}}"#, job.id),
        ];
        serve_frames(&lifecycle, frames(input), tx).await.unwrap();

        assert!(matches!(rx.try_recv().unwrap(), ServerMessage::Registered { .. }));
        match rx.try_recv().unwrap() {
            ServerMessage::AssignJob { job_id, descriptor, variants, .. } => {
                assert_eq!(job_id, job.id);
                assert_eq!(variants, vec!["1000k"]);
                assert_eq!(descriptor["args"][1], "23");
            }
            other => panic!("unexpected {other:?}"),
        }
        let stored = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Encoding);
        assert_eq!(stored.progress_secs, 4.5);
    }
}
