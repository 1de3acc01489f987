//! Alert Feedback
//!
//! Collects emoji reactions on dispatched alert messages and folds them
//! into a verdict on the underlying anomaly record.
//!
//! Lifecycle per alert: Dispatched (registered, no votes) -> Collecting
//! (first vote arms a single resolution timer) -> Resolving (timer fired,
//! votes tallied and persisted) -> Resolved (removed from the active map).
//! Later votes within the window join the running tally; they never arm
//! a second timer.

use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, error, info};

use crate::error::FlowError;
use crate::store::{RecordStore, Statement, ANOMALIES_TABLE};

/// Feedback collection configuration
#[derive(Debug, Clone)]
pub struct FeedbackConfig {
    /// Collection window, armed by the first vote on an alert
    pub window: Duration,
    /// Reactions counted as "alert was correct"
    pub correct_emojis: Vec<String>,
    /// Reactions counted as "alert was wrong"
    pub incorrect_emojis: Vec<String>,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(300),
            correct_emojis: vec!["\u{2705}".to_string(), "\u{1F44D}".to_string()], // ✅ 👍
            incorrect_emojis: vec!["\u{274C}".to_string(), "\u{1F44E}".to_string()], // ❌ 👎
        }
    }
}

/// Votes collected for one dispatched alert message
#[derive(Debug)]
struct AlertEntry {
    /// Anomaly record the alert reported on
    source_ref: String,
    /// Chat the alert was dispatched to
    chat_id: String,
    /// true = correct, false = wrong
    votes: Vec<bool>,
    /// Set once the resolution timer is armed
    awaiting_resolution: bool,
}

/// What happened to an inbound reaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactionDisposition {
    /// Counted as a vote
    Recorded,
    /// The reacted message is not a tracked alert
    NotTracked,
}

/// Emitted when a collection window closes
#[derive(Debug, Clone)]
pub enum FeedbackEvent {
    /// Votes tallied and written to the anomaly record
    Resolved {
        chat_id: String,
        alert_id: String,
        /// Some(true)/Some(false) on a majority, None on a tie
        status: Option<bool>,
        votes: usize,
    },
    /// The anomaly record disappeared before resolution
    RecordMissing { chat_id: String, alert_id: String },
    /// The status write failed
    PersistFailed { chat_id: String, alert_id: String },
}

/// Tracks dispatched alerts and resolves their reaction votes
#[derive(Clone)]
pub struct FeedbackAggregator {
    config: FeedbackConfig,
    store: Arc<dyn RecordStore>,
    active: Arc<RwLock<HashMap<String, Arc<Mutex<AlertEntry>>>>>,
    events: mpsc::UnboundedSender<FeedbackEvent>,
}

impl FeedbackAggregator {
    /// Create the aggregator and the event feed its resolutions land on
    pub fn new(
        store: Arc<dyn RecordStore>,
        config: FeedbackConfig,
    ) -> (Self, mpsc::UnboundedReceiver<FeedbackEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                config,
                store,
                active: Arc::new(RwLock::new(HashMap::new())),
                events: tx,
            },
            rx,
        )
    }

    /// Start tracking a dispatched alert message
    pub async fn register(&self, alert_id: &str, source_ref: &str, chat_id: &str) {
        let entry = AlertEntry {
            source_ref: source_ref.to_string(),
            chat_id: chat_id.to_string(),
            votes: Vec::new(),
            awaiting_resolution: false,
        };

        self.active
            .write()
            .await
            .insert(alert_id.to_string(), Arc::new(Mutex::new(entry)));

        debug!("Tracking alert {} for anomaly {}", alert_id, source_ref);
    }

    /// Whether a message id is a tracked alert
    pub async fn is_tracked(&self, alert_id: &str) -> bool {
        self.active.read().await.contains_key(alert_id)
    }

    /// Number of alerts currently collecting feedback
    pub async fn active_alerts(&self) -> usize {
        self.active.read().await.len()
    }

    /// Fold one reaction into an alert's tally. The first vote on an alert
    /// arms its resolution timer; later votes join the tally without
    /// touching the timer. Reactions on untracked messages are ignored,
    /// unrecognized emojis on tracked alerts are a validation failure.
    pub async fn record_reaction(
        &self,
        alert_id: &str,
        emoji: &str,
    ) -> Result<ReactionDisposition, FlowError> {
        let entry = match self.active.read().await.get(alert_id) {
            Some(e) => Arc::clone(e),
            None => {
                debug!("Reaction on untracked message {}", alert_id);
                return Ok(ReactionDisposition::NotTracked);
            }
        };

        let vote = self.classify(emoji).ok_or_else(|| {
            FlowError::Validation(format!("unrecognized reaction {:?}", emoji))
        })?;

        let mut alert = entry.lock().await;
        alert.votes.push(vote);
        debug!(
            "Vote {} on alert {} ({} so far)",
            vote,
            alert_id,
            alert.votes.len()
        );

        if !alert.awaiting_resolution {
            alert.awaiting_resolution = true;

            let aggregator = self.clone();
            let id = alert_id.to_string();
            let window = self.config.window;
            tokio::spawn(async move {
                tokio::time::sleep(window).await;
                aggregator.resolve(&id).await;
            });

            debug!("Resolution timer armed for alert {}", alert_id);
        }

        Ok(ReactionDisposition::Recorded)
    }

    /// Map a reaction emoji to a vote
    fn classify(&self, emoji: &str) -> Option<bool> {
        if self.config.correct_emojis.iter().any(|e| e == emoji) {
            Some(true)
        } else if self.config.incorrect_emojis.iter().any(|e| e == emoji) {
            Some(false)
        } else {
            None
        }
    }

    /// Close an alert's window: tally, persist, drop from the active map
    async fn resolve(&self, alert_id: &str) {
        let entry = match self.active.write().await.remove(alert_id) {
            Some(e) => e,
            None => return,
        };

        let alert = entry.lock().await;
        let status = tally(&alert.votes);

        info!(
            "Resolving alert {}: {} vote(s) -> {:?}",
            alert_id,
            alert.votes.len(),
            status
        );

        match self.persist_status(&alert.source_ref, status).await {
            Ok(true) => {
                let _ = self.events.send(FeedbackEvent::Resolved {
                    chat_id: alert.chat_id.clone(),
                    alert_id: alert_id.to_string(),
                    status,
                    votes: alert.votes.len(),
                });
            }
            Ok(false) => {
                error!(
                    "Anomaly record {} missing at feedback resolution",
                    alert.source_ref
                );
                let _ = self.events.send(FeedbackEvent::RecordMissing {
                    chat_id: alert.chat_id.clone(),
                    alert_id: alert_id.to_string(),
                });
            }
            Err(e) => {
                error!("Failed to persist feedback for {}: {}", alert.source_ref, e);
                let _ = self.events.send(FeedbackEvent::PersistFailed {
                    chat_id: alert.chat_id.clone(),
                    alert_id: alert_id.to_string(),
                });
            }
        }
    }

    /// Write the verdict onto the anomaly record. A tie is stored as NULL
    /// with `resolved_at` set, which keeps it distinct from both verdicts
    /// and from never-resolved records. Returns false when the record no
    /// longer exists.
    async fn persist_status(
        &self,
        source_ref: &str,
        status: Option<bool>,
    ) -> Result<bool, FlowError> {
        let resolved_at = chrono::Utc::now().timestamp_millis();

        let rows = self
            .store
            .query(Statement::new(
                format!(
                    "UPDATE {} SET feedback_status = ?1, resolved_at = ?2 WHERE id = ?3 RETURNING id",
                    ANOMALIES_TABLE
                ),
                vec![
                    match status {
                        Some(b) => json!(b),
                        None => json!(null),
                    },
                    json!(resolved_at),
                    json!(source_ref),
                ],
            ))
            .await?;

        Ok(!rows.is_empty())
    }
}

/// Majority tally over collected votes: Some(true) when correct votes
/// strictly outnumber incorrect ones, Some(false) for the reverse, None
/// on a tie.
pub fn tally(votes: &[bool]) -> Option<bool> {
    let correct = votes.iter().filter(|v| **v).count();
    let incorrect = votes.len() - correct;

    match correct.cmp(&incorrect) {
        std::cmp::Ordering::Greater => Some(true),
        std::cmp::Ordering::Less => Some(false),
        std::cmp::Ordering::Equal => None,
    }
}
