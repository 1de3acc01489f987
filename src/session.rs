//! Conversation Sessions
//!
//! In-memory conversation state with bounded history, persisted turn by turn
//! through the record store. One session per chat, guarded by its own lock so
//! turns for the same chat never interleave while different chats proceed in
//! parallel.
//!
//! History is trimmed oldest-first under two budgets: total characters, then
//! message count. The system prompt sits at index 0 and is never evicted.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::collections::hash_map::Entry;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::error::FlowError;
use crate::gateway::{ActorGateway, CONVERSATION_TAG};
use crate::store::{RecordStore, Statement, MESSAGES_TABLE};

/// A reference to a record in another table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordRef {
    pub table: String,
    pub id: String,
}

/// A role field as stored: either a plain string or a reference into a
/// role table. References resolve to their record id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RoleValue {
    ById(RecordRef),
    Direct(String),
}

impl RoleValue {
    /// Resolve to the plain role name
    pub fn resolve(&self) -> &str {
        match self {
            RoleValue::ById(r) => &r.id,
            RoleValue::Direct(s) => s,
        }
    }
}

/// A single message in a conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub role: String,
    pub text: String,
    pub created_at: i64,
}

/// Input for a turn about to be recorded
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub role: String,
    pub text: String,
}

impl NewMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            text: text.into(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            text: text.into(),
        }
    }
}

/// A chat member seen by the session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub external_id: String,
    pub display_name: String,
    pub joined_at: i64,
}

/// History and quote-cache budgets
#[derive(Debug, Clone, Copy)]
pub struct SessionLimits {
    /// Total character budget across all messages
    pub max_chars: usize,
    /// Message-count budget
    pub max_messages: usize,
    /// Per-user quote cache capacity
    pub max_quotes: usize,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_chars: 16_000,
            max_messages: 50,
            max_quotes: 20,
        }
    }
}

/// Per-chat conversation state
pub struct ConversationSession {
    /// Conversation key (the provider chat id)
    pub key: String,
    messages: Vec<ChatMessage>,
    participants: Vec<Participant>,
    quotes: HashMap<String, VecDeque<String>>,
    limits: SessionLimits,
}

impl ConversationSession {
    fn new(key: &str, system_prompt: &str, limits: SessionLimits) -> Self {
        let system = ChatMessage {
            id: uuid::Uuid::new_v4().to_string(),
            role: "system".to_string(),
            text: system_prompt.to_string(),
            created_at: chrono::Utc::now().timestamp_millis(),
        };

        Self {
            key: key.to_string(),
            messages: vec![system],
            participants: Vec::new(),
            quotes: HashMap::new(),
            limits,
        }
    }

    /// The system prompt seeded at creation
    pub fn system_prompt(&self) -> &str {
        &self.messages[0].text
    }

    /// All messages including the system prompt
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// Conversation turns, system prompt excluded
    pub fn history(&self) -> &[ChatMessage] {
        if self.messages.is_empty() {
            &[]
        } else {
            &self.messages[1..]
        }
    }

    pub fn participants(&self) -> &[Participant] {
        &self.participants
    }

    /// Sum of message text lengths in characters
    pub fn total_chars(&self) -> usize {
        self.messages.iter().map(|m| m.text.chars().count()).sum()
    }

    /// Register a chat member. Idempotent: the first sighting of an
    /// external id wins, later display names are ignored.
    pub fn add_participant(&mut self, external_id: &str, display_name: &str) {
        if self.participants.iter().any(|p| p.external_id == external_id) {
            return;
        }

        self.participants.push(Participant {
            external_id: external_id.to_string(),
            display_name: display_name.to_string(),
            joined_at: chrono::Utc::now().timestamp_millis(),
        });
    }

    /// Initialize an empty quote cache for a user, keeping any existing one
    pub fn create_quotes_by_user(&mut self, user: &str) {
        if let Entry::Vacant(e) = self.quotes.entry(user.to_string()) {
            e.insert(VecDeque::new());
        }
    }

    /// Cache a quote for a user, evicting the single oldest entry when full
    pub fn add_quote_by_user(&mut self, user: &str, quote: &str) {
        let entries = self.quotes.entry(user.to_string()).or_default();
        if entries.len() >= self.limits.max_quotes {
            entries.pop_front();
        }
        entries.push_back(quote.to_string());
    }

    /// All cached quotes for a user as newline-joined quoted strings,
    /// oldest first. Empty string when the user has no quotes.
    pub fn quotes_by_user(&self, user: &str) -> String {
        match self.quotes.get(user) {
            Some(entries) => entries
                .iter()
                .map(|q| format!("\"{}\"", q))
                .collect::<Vec<_>>()
                .join("\n"),
            None => String::new(),
        }
    }

    fn append(&mut self, messages: Vec<ChatMessage>) {
        self.messages.extend(messages);
        self.trim();
    }

    /// Enforce both budgets, oldest non-system message first. The character
    /// pass runs to completion before the count pass. Index 0 survives even
    /// when it alone exceeds the character budget.
    fn trim(&mut self) {
        while self.total_chars() > self.limits.max_chars && self.messages.len() > 1 {
            self.messages.remove(1);
        }

        while self.messages.len() > self.limits.max_messages && self.messages.len() > 1 {
            self.messages.remove(1);
        }
    }
}

/// Owns every live session and the persistence path for turns
pub struct SessionStore {
    limits: SessionLimits,
    store: Arc<dyn RecordStore>,
    gateway: Arc<dyn ActorGateway>,
    sessions: RwLock<HashMap<String, Arc<Mutex<ConversationSession>>>>,
}

impl SessionStore {
    pub fn new(
        store: Arc<dyn RecordStore>,
        gateway: Arc<dyn ActorGateway>,
        limits: SessionLimits,
    ) -> Self {
        Self {
            limits,
            store,
            gateway,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Existing session handle for a chat, if one was created
    pub async fn get(&self, key: &str) -> Option<Arc<Mutex<ConversationSession>>> {
        self.sessions.read().await.get(key).cloned()
    }

    /// Session handle for a chat, created with `system_prompt` on first use.
    /// Callers hold the returned lock for the whole turn, which is what
    /// serializes turns per chat.
    pub async fn get_or_create(
        &self,
        key: &str,
        system_prompt: &str,
    ) -> Arc<Mutex<ConversationSession>> {
        if let Some(handle) = self.sessions.read().await.get(key) {
            return Arc::clone(handle);
        }

        let mut map = self.sessions.write().await;
        let handle = map.entry(key.to_string()).or_insert_with(|| {
            debug!("Creating session for chat {}", key);
            Arc::new(Mutex::new(ConversationSession::new(key, system_prompt, self.limits)))
        });
        Arc::clone(handle)
    }

    /// Number of live sessions
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Persist a turn's messages in one transaction, then append the
    /// returned canonical records to the session and re-trim. On any
    /// persistence failure nothing is appended and the error surfaces.
    ///
    /// Embedding generation for the new texts runs on a detached task;
    /// the turn completes regardless of its outcome.
    pub async fn record_turn(
        &self,
        session: &mut ConversationSession,
        new_messages: &[NewMessage],
    ) -> Result<Vec<ChatMessage>, FlowError> {
        if new_messages.is_empty() {
            return Ok(Vec::new());
        }

        let base = chrono::Utc::now().timestamp_millis();

        let statements: Vec<Statement> = new_messages
            .iter()
            .enumerate()
            .map(|(i, m)| {
                Statement::new(
                    format!(
                        "INSERT INTO {} (id, conversation, role, content, created_at)
                         VALUES (?1, ?2, ?3, ?4, ?5)
                         RETURNING id, role, content, created_at",
                        MESSAGES_TABLE
                    ),
                    vec![
                        json!(uuid::Uuid::new_v4().to_string()),
                        json!(session.key),
                        json!(m.role),
                        json!(m.text),
                        json!(base + i as i64), // +i ms keeps intra-turn ordering
                    ],
                )
            })
            .collect();

        let batches = self.store.transaction(statements).await?;

        let mut canonical = Vec::with_capacity(batches.len());
        for rows in &batches {
            let row = rows.first().ok_or_else(|| {
                FlowError::Persistence("turn insert returned no canonical record".to_string())
            })?;
            canonical.push(parse_message(row)?);
        }

        session.append(canonical.clone());

        let texts: Vec<String> = canonical.iter().map(|m| m.text.clone()).collect();
        let gateway = Arc::clone(&self.gateway);
        tokio::spawn(async move {
            if let Err(e) = gateway.embeddings(&texts, CONVERSATION_TAG).await {
                warn!("Embedding generation failed: {}", e);
            }
        });

        debug!(
            "Recorded {} message(s) for chat {}",
            canonical.len(),
            session.key
        );

        Ok(canonical)
    }
}

/// Decode a canonical message row. Role fields may be plain strings or
/// record references; references resolve to their id here, once.
fn parse_message(row: &serde_json::Value) -> Result<ChatMessage, FlowError> {
    let id = row
        .get("id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| FlowError::Persistence("message record missing id".to_string()))?;

    let role_value: RoleValue = serde_json::from_value(
        row.get("role")
            .cloned()
            .ok_or_else(|| FlowError::Persistence("message record missing role".to_string()))?,
    )?;

    let text = row
        .get("content")
        .and_then(|v| v.as_str())
        .ok_or_else(|| FlowError::Persistence("message record missing content".to_string()))?;

    let created_at = row.get("created_at").and_then(|v| v.as_i64()).unwrap_or_default();

    Ok(ChatMessage {
        id: id.to_string(),
        role: role_value.resolve().to_string(),
        text: text.to_string(),
        created_at,
    })
}
