//! Prompt Assembly
//!
//! Pure construction of the message list sent to the gateway's chat
//! endpoint. No IO, no state: system prompt plus facts block first, then
//! the retrieved context, then the live user turn.

use crate::gateway::ChatTurn;
use crate::retrieval::RankedMessage;

/// Build the chat message list for one turn.
///
/// The facts block is always present in the system message, even when
/// empty, so the model sees a stable frame. The user turn is prefixed
/// with the sender's display name so the model can track speakers in
/// group chats.
pub fn build_messages(
    system_prompt: &str,
    facts_text: &str,
    ranked: &[RankedMessage],
    user_name: &str,
    body: &str,
) -> Vec<ChatTurn> {
    let mut messages = Vec::with_capacity(ranked.len() + 2);

    messages.push(ChatTurn::new(
        "system",
        format!("{}\n\nRelevant facts:\n\n{}", system_prompt, facts_text),
    ));

    messages.extend(
        ranked
            .iter()
            .map(|m| ChatTurn::new(m.role.clone(), m.content.clone())),
    );

    messages.push(ChatTurn::new("user", format!("{}: {}", user_name, body)));

    messages
}
