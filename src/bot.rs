//! Bot event loop and flows.
//!
//! One `Bot` instance drains the provider's event channel and dispatches
//! each event to a flow: chat turns through the retrieval pipeline, snapshot
//! analysis, keyword commands, and reaction votes. Flows own their error
//! handling end to end: a failed flow logs the error and produces exactly
//! one user-visible fallback message.

use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::FlowError;
use crate::feedback::{FeedbackAggregator, FeedbackEvent, ReactionDisposition};
use crate::gateway::ActorGateway;
use crate::prompt::build_messages;
use crate::provider::{
    with_retry, InboundMessage, MessagingProvider, OutgoingMessage, ProviderEvent, ReactionEvent,
    RetryPolicy, SendOptions,
};
use crate::retrieval::RetrievalPipeline;
use crate::router::{classify, Command, Flow};
use crate::session::{NewMessage, SessionStore};

const HELP_TEXT: &str = "Commands:\n\
!help - this message\n\
!status - session and alert counts\n\
!facts <query> - look up stored facts\n\
Send a photo to have it analyzed. React to an alert with ✅/👍 or ❌/👎 to rate it.";

const INVALID_REACTION_TEXT: &str =
    "That reaction is not a feedback vote. Use ✅/👍 for correct or ❌/👎 for incorrect.";

/// Shared handles for every flow
pub struct Bot {
    pub provider: Arc<dyn MessagingProvider>,
    pub gateway: Arc<dyn ActorGateway>,
    pub sessions: Arc<SessionStore>,
    pub retrieval: RetrievalPipeline,
    pub feedback: FeedbackAggregator,
    pub system_prompt: String,
    pub retry: RetryPolicy,
}

impl Bot {
    /// Drain provider events until the channel closes.
    ///
    /// Each event runs on its own task so unrelated conversations interleave
    /// freely; turns within one chat are serialized by the session lock.
    pub async fn run(self: Arc<Self>, mut events: UnboundedReceiver<ProviderEvent>) {
        info!("Event loop started on provider {}", self.provider.name());
        while let Some(event) = events.recv().await {
            let bot = Arc::clone(&self);
            tokio::spawn(async move {
                match event {
                    ProviderEvent::Message(msg) => bot.handle_message(msg).await,
                    ProviderEvent::Reactions(reactions) => bot.handle_reactions(reactions).await,
                }
            });
        }
        info!("Provider event stream closed");
    }

    pub async fn handle_message(&self, msg: InboundMessage) {
        let flow = classify(&msg);
        debug!("Message {} in {} routed to {:?}", msg.id, msg.chat_id, flow);

        let outcome = match flow {
            Flow::Chat => self.chat_flow(&msg).await,
            Flow::Snap => self.snap_flow(&msg).await,
            Flow::Command(command) => self.command_flow(&msg, command).await,
        };

        if let Err(e) = outcome {
            error!("Flow for message {} failed: {}", msg.id, e);
            if let Err(send_err) = self.provider.send_text(&msg.chat_id, fallback_text(&e)).await {
                error!("Fallback delivery failed: {}", send_err);
            }
        }
    }

    /// Conversational turn: record, retrieve, assemble, complete, reply.
    async fn chat_flow(&self, msg: &InboundMessage) -> Result<(), FlowError> {
        if msg.body.trim().is_empty() {
            debug!("Ignoring empty message {}", msg.id);
            return Ok(());
        }

        let user_name = msg
            .sender_name
            .clone()
            .unwrap_or_else(|| msg.sender_id.clone());

        // Malformed quotes are rejected before any state is touched.
        let quote = match &msg.quoted {
            Some(quoted) => {
                let text = quoted.body.trim();
                if text.is_empty() {
                    return Err(FlowError::Validation(
                        "quoted message carries no text".to_string(),
                    ));
                }
                Some(text)
            }
            None => None,
        };

        let handle = self
            .sessions
            .get_or_create(&msg.chat_id, &self.system_prompt)
            .await;
        // Held for the whole turn; a second message in this chat waits here.
        let mut session = handle.lock().await;

        session.add_participant(&msg.sender_id, &user_name);

        let mut body = msg.body.clone();
        if let Some(quote) = quote {
            session.create_quotes_by_user(&msg.sender_id);
            session.add_quote_by_user(&msg.sender_id, quote);
            body = format!("{}\n> {}", msg.body, quote);
        }

        self.sessions
            .record_turn(&mut session, &[NewMessage::user(&body)])
            .await?;

        let mut facts = self.retrieval.retrieve_facts(&msg.body).await?;
        let quotes = session.quotes_by_user(&msg.sender_id);
        if !quotes.is_empty() {
            facts = format!("{}\n\nQuotes from {}:\n{}", facts, user_name, quotes);
        }

        // The turn just recorded is excluded from the pool; the assembler
        // appends it as the live user message.
        let history = session.history();
        let pool = &history[..history.len().saturating_sub(1)];
        let ranked = self.retrieval.retrieve_relevant(&msg.body, pool).await?;

        let turns = build_messages(
            session.system_prompt(),
            &facts,
            &ranked,
            &user_name,
            &msg.body,
        );
        let reply = self.gateway.chat(&turns, &msg.chat_id).await?;

        self.sessions
            .record_turn(&mut session, &[NewMessage::assistant(&reply.content)])
            .await?;

        let outgoing = OutgoingMessage::text(reply.content);
        let options = SendOptions {
            quote: msg.is_group.then(|| msg.id.clone()),
        };
        with_retry(&self.retry, || {
            self.provider.send_message(&msg.chat_id, &outgoing, &options)
        })
        .await?;

        Ok(())
    }

    /// Snapshot analysis: download, analyze, reply, track for feedback.
    async fn snap_flow(&self, msg: &InboundMessage) -> Result<(), FlowError> {
        let media = msg
            .media
            .as_ref()
            .ok_or_else(|| FlowError::Validation("snap flow without media".to_string()))?;

        let path = self.provider.save_file(media).await?;
        let caption = msg.body.trim();
        let analysis = self
            .gateway
            .analyze_image(&path, (!caption.is_empty()).then_some(caption))
            .await?;

        let outgoing = OutgoingMessage::text(format!("Snapshot analysis:\n{}", analysis.results));
        let options = SendOptions {
            quote: Some(msg.id.clone()),
        };
        let sent_id = with_retry(&self.retry, || {
            self.provider.send_message(&msg.chat_id, &outgoing, &options)
        })
        .await?;

        self.feedback
            .register(&sent_id, &analysis.target_ref, &msg.chat_id)
            .await;

        info!(
            "Analyzed snapshot {} as {} ({})",
            msg.id, analysis.analysis_id, analysis.target_ref
        );
        Ok(())
    }

    async fn command_flow(&self, msg: &InboundMessage, command: Command) -> Result<(), FlowError> {
        let reply = match command {
            Command::Help => HELP_TEXT.to_string(),
            Command::Status => {
                let sessions = self.sessions.session_count().await;
                let alerts = self.feedback.active_alerts().await;
                format!(
                    "Online via {}. {} active session(s), {} alert(s) awaiting feedback.",
                    self.provider.name(),
                    sessions,
                    alerts
                )
            }
            Command::Facts(query) => {
                if query.is_empty() {
                    "Usage: !facts <what to look up>".to_string()
                } else {
                    let facts = self.retrieval.retrieve_facts(&query).await?;
                    if facts.is_empty() {
                        "No stored facts matched that query.".to_string()
                    } else {
                        facts
                    }
                }
            }
            Command::Unknown(keyword) => format!("Unknown command !{}. Try !help.", keyword),
        };

        with_retry(&self.retry, || self.provider.send_text(&msg.chat_id, &reply)).await?;
        Ok(())
    }

    /// Route reaction votes into the aggregator. Unrecognized emojis get a
    /// guidance reply; reactions on untracked messages are ignored.
    pub async fn handle_reactions(&self, reactions: Vec<ReactionEvent>) {
        for reaction in reactions {
            match self
                .feedback
                .record_reaction(&reaction.message_id, &reaction.emoji)
                .await
            {
                Ok(ReactionDisposition::Recorded) => {
                    debug!(
                        "Recorded {} vote on alert {}",
                        reaction.emoji, reaction.message_id
                    );
                }
                Ok(ReactionDisposition::NotTracked) => {}
                Err(e) => {
                    warn!("Reaction on {} rejected: {}", reaction.message_id, e);
                    if let Err(send_err) = self
                        .provider
                        .send_text(&reaction.chat_id, INVALID_REACTION_TEXT)
                        .await
                    {
                        error!("Fallback delivery failed: {}", send_err);
                    }
                }
            }
        }
    }
}

fn fallback_text(err: &FlowError) -> &'static str {
    match err {
        FlowError::TransientRemote(_) => {
            "The backend is not responding right now, please try again in a moment."
        }
        FlowError::Persistence(_) => "I could not save that message, so I have not answered it.",
        FlowError::Validation(_) => "I could not make sense of that message.",
        FlowError::NotFound(_) => "Sorry, I no longer have the record that refers to.",
    }
}

/// Forward feedback resolution outcomes to users.
///
/// Successful resolutions are only logged; missing records and failed
/// status writes produce the apology the error design calls for.
pub fn spawn_feedback_notifier(
    provider: Arc<dyn MessagingProvider>,
    mut events: UnboundedReceiver<FeedbackEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                FeedbackEvent::Resolved {
                    chat_id,
                    alert_id,
                    status,
                    votes,
                } => {
                    debug!(
                        "Alert {} in {} resolved to {:?} from {} vote(s)",
                        alert_id, chat_id, status, votes
                    );
                }
                FeedbackEvent::RecordMissing { chat_id, alert_id } => {
                    let text =
                        "Sorry, I could not store that feedback: the alert record no longer exists.";
                    if let Err(e) = provider.send_text(&chat_id, text).await {
                        error!("Apology delivery for alert {} failed: {}", alert_id, e);
                    }
                }
                FeedbackEvent::PersistFailed { chat_id, alert_id } => {
                    let text = "Sorry, something went wrong while saving that feedback.";
                    if let Err(e) = provider.send_text(&chat_id, text).await {
                        error!("Apology delivery for alert {} failed: {}", alert_id, e);
                    }
                }
            }
        }
    })
}
