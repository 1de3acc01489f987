//! Bot Flow Integration Tests
//!
//! End-to-end flows without a live provider or backend: a recording provider
//! and a scripted gateway wrap the real store, session, retrieval and
//! feedback components on a temporary database.

use async_trait::async_trait;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;

use vigil_bot::alerts::{spawn_alert_listener, AlertDispatchContext};
use vigil_bot::feedback::{FeedbackAggregator, FeedbackConfig, FeedbackEvent};
use vigil_bot::gateway::{
    ActorGateway, ChatTurn, ImageAnalysis, RerankItem, SimilarityHit, FACTS_TAG,
};
use vigil_bot::provider::{
    InboundMessage, MediaKind, MediaRef, MessagingProvider, OutgoingMessage, ProviderError,
    ProviderEvent, QuotedMessage, ReactionEvent, RetryPolicy, SendOptions,
};
use vigil_bot::retrieval::RetrievalPipeline;
use vigil_bot::session::{SessionLimits, SessionStore};
use vigil_bot::storage::ObjectStorage;
use vigil_bot::store::{RecordStore, SqliteStore, Statement, ANOMALIES_TABLE};
use vigil_bot::{Bot, FlowError};

/// Provider double that records every send and can be told to fail
struct RecordingProvider {
    sent: Mutex<Vec<(String, OutgoingMessage, SendOptions)>>,
    calls: AtomicUsize,
    rate_limit_budget: AtomicUsize,
    hard_fail_budget: AtomicUsize,
}

impl RecordingProvider {
    fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            rate_limit_budget: AtomicUsize::new(0),
            hard_fail_budget: AtomicUsize::new(0),
        }
    }

    /// Rate-limit the first `times` sends
    fn rate_limited(times: usize) -> Self {
        let provider = Self::new();
        provider.rate_limit_budget.store(times, Ordering::SeqCst);
        provider
    }

    /// Hard-fail the first `times` sends
    fn failing(times: usize) -> Self {
        let provider = Self::new();
        provider.hard_fail_budget.store(times, Ordering::SeqCst);
        provider
    }

    fn sent_texts(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(_, m, _)| m.text.clone())
            .collect()
    }
}

#[async_trait]
impl MessagingProvider for RecordingProvider {
    fn name(&self) -> &str {
        "stub"
    }

    async fn send_text(&self, chat_id: &str, text: &str) -> Result<String, ProviderError> {
        self.send_message(chat_id, &OutgoingMessage::text(text), &SendOptions::default())
            .await
    }

    async fn send_message(
        &self,
        chat_id: &str,
        message: &OutgoingMessage,
        options: &SendOptions,
    ) -> Result<String, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if self.rate_limit_budget.load(Ordering::SeqCst) > 0 {
            self.rate_limit_budget.fetch_sub(1, Ordering::SeqCst);
            return Err(ProviderError::RateLimited(1));
        }
        if self.hard_fail_budget.load(Ordering::SeqCst) > 0 {
            self.hard_fail_budget.fetch_sub(1, Ordering::SeqCst);
            return Err(ProviderError::SendFailed("bridge down".to_string()));
        }

        let mut sent = self.sent.lock().unwrap();
        let id = format!("sent-{}", sent.len());
        sent.push((chat_id.to_string(), message.clone(), options.clone()));
        Ok(id)
    }

    async fn save_file(&self, media: &MediaRef) -> Result<PathBuf, ProviderError> {
        Ok(PathBuf::from(format!("/tmp/{}.jpg", media.id)))
    }
}

/// Gateway double with scripted recall results; captures chat prompts
struct ScriptedGateway {
    fact_hits: Vec<SimilarityHit>,
    conversation_hits: Vec<SimilarityHit>,
    rerank_items: Vec<RerankItem>,
    prompts: Mutex<Vec<Vec<ChatTurn>>>,
}

impl ScriptedGateway {
    fn quiet() -> Self {
        Self {
            fact_hits: Vec::new(),
            conversation_hits: Vec::new(),
            rerank_items: Vec::new(),
            prompts: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl ActorGateway for ScriptedGateway {
    async fn chat(&self, messages: &[ChatTurn], _session_id: &str) -> Result<ChatTurn, FlowError> {
        self.prompts.lock().unwrap().push(messages.to_vec());
        let last = messages.last().map(|m| m.content.clone()).unwrap_or_default();
        Ok(ChatTurn::new("assistant", format!("Noted: {}", last)))
    }

    async fn embeddings(&self, _texts: &[String], _tag: &str) -> Result<(), FlowError> {
        Ok(())
    }

    async fn similarity(
        &self,
        _query: &str,
        tag: &str,
        _k: usize,
        _threshold: f32,
    ) -> Result<Vec<SimilarityHit>, FlowError> {
        if tag == FACTS_TAG {
            Ok(self.fact_hits.clone())
        } else {
            Ok(self.conversation_hits.clone())
        }
    }

    async fn rerank(&self, _query: &str, _texts: &[String]) -> Result<Vec<RerankItem>, FlowError> {
        Ok(self.rerank_items.clone())
    }

    async fn analyze_image(
        &self,
        _image_path: &Path,
        caption: Option<&str>,
    ) -> Result<ImageAnalysis, FlowError> {
        Ok(ImageAnalysis {
            analysis_id: "analysis-1".to_string(),
            target_ref: "anomaly-7".to_string(),
            results: format!("a raccoon ({})", caption.unwrap_or("no caption")),
        })
    }
}

/// Full bot wiring on a temporary database
struct TestEnvironment {
    bot: Arc<Bot>,
    provider: Arc<RecordingProvider>,
    gateway: Arc<ScriptedGateway>,
    store: Arc<SqliteStore>,
    feedback_rx: mpsc::UnboundedReceiver<FeedbackEvent>,
    _temp_dir: TempDir,
}

impl TestEnvironment {
    fn new() -> Self {
        Self::with(RecordingProvider::new(), ScriptedGateway::quiet())
    }

    fn with(provider: RecordingProvider, gateway: ScriptedGateway) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let db_path = temp_dir.path().join("vigil.db");
        let store = Arc::new(SqliteStore::open(&db_path).expect("Failed to create store"));

        let provider = Arc::new(provider);
        let gateway = Arc::new(gateway);

        let sessions = Arc::new(SessionStore::new(
            store.clone() as Arc<dyn RecordStore>,
            gateway.clone() as Arc<dyn ActorGateway>,
            SessionLimits::default(),
        ));

        let config = FeedbackConfig {
            window: Duration::from_millis(100),
            ..FeedbackConfig::default()
        };
        let (feedback, feedback_rx) =
            FeedbackAggregator::new(store.clone() as Arc<dyn RecordStore>, config);

        let bot = Arc::new(Bot {
            provider: provider.clone() as Arc<dyn MessagingProvider>,
            gateway: gateway.clone() as Arc<dyn ActorGateway>,
            sessions,
            retrieval: RetrievalPipeline::new(gateway.clone() as Arc<dyn ActorGateway>),
            feedback,
            system_prompt: "You watch cameras for this household.".to_string(),
            retry: RetryPolicy {
                max_retries: 3,
                backoff: Duration::from_millis(10),
            },
        });

        Self {
            bot,
            provider,
            gateway,
            store,
            feedback_rx,
            _temp_dir: temp_dir,
        }
    }

    async fn seed_anomaly(&self, id: &str) {
        self.store
            .query(Statement::new(
                "INSERT INTO anomalies (id, camera, object_path, summary, detected_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                vec![
                    json!(id),
                    json!("gate"),
                    json!("2026/08/21/snap.jpg"),
                    json!("person at the gate"),
                    json!(1000),
                ],
            ))
            .await
            .unwrap();
    }
}

fn inbound(id: &str, chat_id: &str, body: &str) -> InboundMessage {
    InboundMessage {
        id: id.to_string(),
        chat_id: chat_id.to_string(),
        sender_id: "user-1".to_string(),
        sender_name: Some("Ana".to_string()),
        is_group: false,
        body: body.to_string(),
        media: None,
        quoted: None,
        timestamp: 1_700_000_000,
    }
}

// ============ Conversation Flows ============

mod conversation {
    use super::*;

    #[tokio::test]
    async fn test_turn_reaches_gateway_and_database() {
        let env = TestEnvironment::new();

        env.bot
            .handle_message(inbound("m1", "chat-1", "any movement today?"))
            .await;

        let texts = env.provider.sent_texts();
        assert_eq!(texts, vec!["Noted: Ana: any movement today?".to_string()]);

        let prompts = env.gateway.prompts.lock().unwrap();
        assert_eq!(prompts.len(), 1);
        assert_eq!(prompts[0][0].role, "system");
        assert!(prompts[0][0].content.contains("Relevant facts:"));
        assert_eq!(
            prompts[0].last().unwrap().content,
            "Ana: any movement today?"
        );
        drop(prompts);

        let rows = env
            .store
            .query(Statement::new(
                "SELECT role FROM messages WHERE conversation = ?1 ORDER BY created_at",
                vec![json!("chat-1")],
            ))
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["role"], "user");
        assert_eq!(rows[1]["role"], "assistant");
    }

    #[tokio::test]
    async fn test_fact_recall_lands_in_the_system_turn() {
        let gateway = ScriptedGateway {
            fact_hits: vec![SimilarityHit {
                text: "the gate code changed in July".to_string(),
                similarity: 0.9,
            }],
            rerank_items: vec![RerankItem { index: 0, score: 0.9 }],
            ..ScriptedGateway::quiet()
        };
        let env = TestEnvironment::with(RecordingProvider::new(), gateway);

        env.bot
            .handle_message(inbound("m1", "chat-1", "what is the gate code?"))
            .await;

        let prompts = env.gateway.prompts.lock().unwrap();
        assert!(prompts[0][0]
            .content
            .contains("the gate code changed in July"));
    }

    #[tokio::test]
    async fn test_old_turns_come_back_through_recall() {
        let gateway = ScriptedGateway {
            conversation_hits: vec![SimilarityHit {
                text: "turn 0".to_string(),
                similarity: 0.8,
            }],
            rerank_items: vec![RerankItem { index: 0, score: 0.5 }],
            ..ScriptedGateway::quiet()
        };
        let env = TestEnvironment::with(RecordingProvider::new(), gateway);

        // Six round trips leave twelve history turns, two beyond the
        // verbatim window.
        for i in 0..6 {
            env.bot
                .handle_message(inbound(&format!("m{}", i), "chat-1", &format!("turn {}", i)))
                .await;
        }
        env.bot
            .handle_message(inbound("m9", "chat-1", "what did I say first?"))
            .await;

        let prompts = env.gateway.prompts.lock().unwrap();
        let last = prompts.last().unwrap();

        // system + 1 recalled + 10 verbatim + live user turn
        assert_eq!(last.len(), 13);
        assert_eq!(last[1].content, "turn 0");
        assert_eq!(last[12].content, "Ana: what did I say first?");
    }

    #[tokio::test]
    async fn test_quoted_reply_is_recorded_and_cached() {
        let env = TestEnvironment::new();

        let mut msg = inbound("m1", "chat-1", "is this the same person?");
        msg.quoted = Some(QuotedMessage {
            sender_id: Some("user-2".to_string()),
            body: "someone rang the doorbell at noon".to_string(),
        });
        env.bot.handle_message(msg).await;

        let rows = env
            .store
            .query(Statement::new(
                "SELECT content FROM messages WHERE conversation = ?1 AND role = 'user'",
                vec![json!("chat-1")],
            ))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0]["content"]
            .as_str()
            .unwrap()
            .contains("\n> someone rang the doorbell at noon"));

        let prompts = env.gateway.prompts.lock().unwrap();
        assert!(prompts[0][0].content.contains("Quotes from Ana:"));
        assert!(prompts[0][0]
            .content
            .contains("\"someone rang the doorbell at noon\""));
    }
}

// ============ Snapshot Flow ============

mod snapshots {
    use super::*;

    #[tokio::test]
    async fn test_photo_analysis_feeds_the_vote_cycle() {
        let mut env = TestEnvironment::new();
        env.seed_anomaly("anomaly-7").await;

        let mut msg = inbound("m1", "chat-1", "driveway");
        msg.media = Some(MediaRef {
            id: "f-1".to_string(),
            kind: MediaKind::Image,
            url: None,
        });
        env.bot.handle_message(msg).await;

        {
            let sent = env.provider.sent.lock().unwrap();
            assert_eq!(sent.len(), 1);
            assert!(sent[0].1.text.contains("a raccoon (driveway)"));
            assert_eq!(sent[0].2.quote.as_deref(), Some("m1"));
        }

        env.bot
            .handle_reactions(vec![ReactionEvent {
                message_id: "sent-0".to_string(),
                chat_id: "chat-1".to_string(),
                sender_id: "user-2".to_string(),
                emoji: "\u{2705}".to_string(),
            }])
            .await;

        tokio::time::sleep(Duration::from_millis(250)).await;

        match env.feedback_rx.try_recv().unwrap() {
            FeedbackEvent::Resolved { status, votes, .. } => {
                assert_eq!(status, Some(true));
                assert_eq!(votes, 1);
            }
            other => panic!("unexpected event: {:?}", other),
        }

        let rows = env
            .store
            .query(Statement::new(
                "SELECT feedback_status FROM anomalies WHERE id = ?1",
                vec![json!("anomaly-7")],
            ))
            .await
            .unwrap();
        assert_eq!(rows[0]["feedback_status"], 1);
    }
}

// ============ Alert Dispatch ============

mod alerts {
    use super::*;

    struct FixedStorage;

    #[async_trait]
    impl ObjectStorage for FixedStorage {
        async fn presigned_get_object(
            &self,
            bucket: &str,
            path: &str,
            _expiry_secs: u64,
        ) -> Result<String, FlowError> {
            Ok(format!("https://storage.test/{}/{}", bucket, path))
        }

        async fn bucket_exists(&self, _bucket: &str) -> Result<bool, FlowError> {
            Ok(true)
        }

        async fn make_bucket(&self, _bucket: &str) -> Result<(), FlowError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_new_anomaly_fans_out_and_collects_votes() {
        let mut env = TestEnvironment::new();

        let ctx = AlertDispatchContext {
            provider: env.provider.clone() as Arc<dyn MessagingProvider>,
            storage: Arc::new(FixedStorage),
            feedback: env.bot.feedback.clone(),
            alert_chats: vec!["ops-chat".to_string()],
            bucket: "snapshots".to_string(),
            signed_url_expiry_secs: 600,
            retry: RetryPolicy {
                max_retries: 1,
                backoff: Duration::from_millis(10),
            },
        };
        let listener = spawn_alert_listener(ctx, env.store.subscribe(ANOMALIES_TABLE));

        env.seed_anomaly("anomaly-42").await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        {
            let sent = env.provider.sent.lock().unwrap();
            assert_eq!(sent.len(), 1);
            assert_eq!(sent[0].0, "ops-chat");
            assert!(sent[0].1.text.contains("Anomaly on camera gate"));
            assert_eq!(
                sent[0].1.media_url.as_deref(),
                Some("https://storage.test/snapshots/2026/08/21/snap.jpg")
            );
        }

        // Two votes for, one against.
        env.bot
            .handle_reactions(vec![
                ReactionEvent {
                    message_id: "sent-0".to_string(),
                    chat_id: "ops-chat".to_string(),
                    sender_id: "user-1".to_string(),
                    emoji: "\u{2705}".to_string(),
                },
                ReactionEvent {
                    message_id: "sent-0".to_string(),
                    chat_id: "ops-chat".to_string(),
                    sender_id: "user-2".to_string(),
                    emoji: "\u{1F44D}".to_string(),
                },
                ReactionEvent {
                    message_id: "sent-0".to_string(),
                    chat_id: "ops-chat".to_string(),
                    sender_id: "user-3".to_string(),
                    emoji: "\u{274C}".to_string(),
                },
            ])
            .await;

        tokio::time::sleep(Duration::from_millis(250)).await;

        match env.feedback_rx.try_recv().unwrap() {
            FeedbackEvent::Resolved { status, votes, .. } => {
                assert_eq!(status, Some(true));
                assert_eq!(votes, 3);
            }
            other => panic!("unexpected event: {:?}", other),
        }

        let rows = env
            .store
            .query(Statement::new(
                "SELECT feedback_status, resolved_at FROM anomalies WHERE id = ?1",
                vec![json!("anomaly-42")],
            ))
            .await
            .unwrap();
        assert_eq!(rows[0]["feedback_status"], 1);
        assert!(rows[0]["resolved_at"].as_i64().unwrap() > 0);

        listener.abort();
    }

    #[tokio::test]
    async fn test_status_update_is_not_re_announced() {
        let env = TestEnvironment::new();

        let ctx = AlertDispatchContext {
            provider: env.provider.clone() as Arc<dyn MessagingProvider>,
            storage: Arc::new(FixedStorage),
            feedback: env.bot.feedback.clone(),
            alert_chats: vec!["ops-chat".to_string()],
            bucket: "snapshots".to_string(),
            signed_url_expiry_secs: 600,
            retry: RetryPolicy::default(),
        };
        let listener = spawn_alert_listener(ctx, env.store.subscribe(ANOMALIES_TABLE));

        env.seed_anomaly("anomaly-1").await;
        env.store
            .query(Statement::new(
                "UPDATE anomalies SET summary = ?1 WHERE id = ?2",
                vec![json!("person at the gate (reviewed)"), json!("anomaly-1")],
            ))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(env.provider.sent.lock().unwrap().len(), 1);
        listener.abort();
    }
}

// ============ Delivery Reliability ============

mod reliability {
    use super::*;

    #[tokio::test]
    async fn test_rate_limited_reply_is_retried() {
        let env = TestEnvironment::with(
            RecordingProvider::rate_limited(2),
            ScriptedGateway::quiet(),
        );

        env.bot.handle_message(inbound("m1", "chat-1", "hello")).await;

        // Two limited attempts, then the delivery.
        assert_eq!(env.provider.calls.load(Ordering::SeqCst), 3);
        assert_eq!(env.provider.sent_texts(), vec!["Noted: Ana: hello".to_string()]);
    }

    #[tokio::test]
    async fn test_retries_stop_at_the_bound() {
        let env = TestEnvironment::with(
            RecordingProvider::rate_limited(4),
            ScriptedGateway::quiet(),
        );

        env.bot.handle_message(inbound("m1", "chat-1", "hello")).await;

        // First try plus three retries, then one fallback send.
        assert_eq!(env.provider.calls.load(Ordering::SeqCst), 5);
        assert_eq!(
            env.provider.sent_texts(),
            vec!["The backend is not responding right now, please try again in a moment."
                .to_string()]
        );
    }

    #[tokio::test]
    async fn test_hard_send_failure_is_not_retried() {
        let env =
            TestEnvironment::with(RecordingProvider::failing(1), ScriptedGateway::quiet());

        env.bot.handle_message(inbound("m1", "chat-1", "hello")).await;

        // One failed try, one fallback send.
        assert_eq!(env.provider.calls.load(Ordering::SeqCst), 2);
        assert_eq!(env.provider.sent_texts().len(), 1);
    }
}

// ============ Event Loop ============

mod event_loop {
    use super::*;

    #[tokio::test]
    async fn test_run_drains_messages_and_reactions() {
        let mut env = TestEnvironment::new();
        env.seed_anomaly("anomaly-7").await;

        let (tx, rx) = mpsc::unbounded_channel();
        let loop_handle = tokio::spawn(Arc::clone(&env.bot).run(rx));

        let mut msg = inbound("m1", "chat-1", "front door");
        msg.media = Some(MediaRef {
            id: "f-2".to_string(),
            kind: MediaKind::Image,
            url: None,
        });
        tx.send(ProviderEvent::Message(msg)).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        tx.send(ProviderEvent::Reactions(vec![ReactionEvent {
            message_id: "sent-0".to_string(),
            chat_id: "chat-1".to_string(),
            sender_id: "user-2".to_string(),
            emoji: "\u{1F44D}".to_string(),
        }]))
        .unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;

        match env.feedback_rx.try_recv().unwrap() {
            FeedbackEvent::Resolved { status, .. } => assert_eq!(status, Some(true)),
            other => panic!("unexpected event: {:?}", other),
        }

        // Closing the channel ends the loop.
        drop(tx);
        loop_handle.await.unwrap();
    }
}
