//! Vigil Bot
//!
//! WhatsApp/Telegram chat-bot for a camera monitoring deployment. Relays
//! user messages to a remote actor-based AI backend and dispatches anomaly
//! alerts with reaction-based feedback voting.
//!
//! # Features
//!
//! - **Bounded sessions**: per-chat conversation memory trimmed by character
//!   and message budgets, with participant tracking and per-user quote caches
//! - **Two-stage retrieval**: similarity search then rerank over past
//!   messages and stored facts before every prompt
//! - **Feedback voting**: emoji reactions on alert messages tallied over a
//!   fixed window and persisted to the anomaly record
//! - **Live alerts**: record-store subscriptions push fresh anomalies out as
//!   signed snapshot URLs
//!
//! # Architecture
//!
//! ```text
//! WhatsApp bridge ──► webhook ──┐
//! Telegram ──► long polling ────┤──► Bot event loop ──► flows
//!                               │         │
//!                               │         ├── SessionStore (SQLite)
//!                               │         ├── RetrievalPipeline ──► ActorGateway
//!                               │         ├── FeedbackAggregator
//!                               │         └── provider sends (retry on rate limit)
//!                               └── alerts ◄── live queries + SignedUrlCache
//! ```

pub mod alerts;
pub mod bot;
pub mod config;
pub mod error;
pub mod feedback;
pub mod gateway;
pub mod prompt;
pub mod provider;
pub mod retrieval;
pub mod router;
pub mod session;
pub mod storage;
pub mod store;
pub mod webhook;

pub use bot::Bot;
pub use config::Config;
pub use error::FlowError;
pub use feedback::{FeedbackAggregator, FeedbackConfig, FeedbackEvent};
pub use gateway::{ActorGateway, ChatTurn, HttpActorGateway, ImageAnalysis};
pub use prompt::build_messages;
pub use retrieval::{RankedMessage, RetrievalPipeline};
pub use session::{ChatMessage, ConversationSession, NewMessage, SessionLimits, SessionStore};
pub use storage::{HttpObjectStorage, ObjectStorage, SignedUrlCache};
pub use store::{RecordStore, SqliteStore, Statement};
