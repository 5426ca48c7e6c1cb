use std::sync::Arc;

use crate::error::EngineResult;
use crate::llm::{ChatMessage, ChatTransport};
use crate::store::{Conversation, ConversationStore, MessageStatus, Sender};

const SUMMARY_INSTRUCTION: &str =
    "Compress the conversation above into a durable memory note. Keep emotional \
     continuity (how the two of you feel about each other, running jokes, promises) \
     and factual continuity (names, dates, money, plans). Write a compact paragraph; \
     it replaces any previous note entirely.";

/// Periodically compresses older history into the conversation's durable
/// summary. The stored summary is replaced, never appended; the
/// `summarized_count` high-water mark records how much of the log it
/// covers — everything older than the active context window.
pub struct MemorySummarizer {
    store: Arc<ConversationStore>,
    transport: Arc<dyn ChatTransport>,
    /// How many trailing messages are rendered into the request.
    window: usize,
}

impl MemorySummarizer {
    pub fn new(
        store: Arc<ConversationStore>,
        transport: Arc<dyn ChatTransport>,
        window: usize,
    ) -> Self {
        Self {
            store,
            transport,
            window,
        }
    }

    /// Auto-trigger check: enough unsummarized messages have accumulated.
    pub fn due(&self, conversation: &Conversation) -> EngineResult<bool> {
        if conversation.settings.summarize_every == 0 {
            return Ok(false);
        }
        let active = self.store.count_active_messages(&conversation.id)?;
        Ok(active.saturating_sub(conversation.summarized_count)
            >= conversation.settings.summarize_every)
    }

    /// On-demand summarization. Overwrites the stored summary on success.
    pub async fn summarize(&self, conversation_id: &str) -> EngineResult<()> {
        let Some(conversation) = self.store.get_conversation(conversation_id)? else {
            return Err(anyhow::anyhow!("conversation {} not found", conversation_id).into());
        };

        let messages = self.store.recent_messages(conversation_id, self.window)?;
        if messages.is_empty() {
            return Ok(());
        }

        let mut rendered = String::new();
        for message in &messages {
            let sender = match message.sender {
                Sender::User => "user",
                Sender::Persona => conversation.persona_name.as_str(),
            };
            let content = if message.status == MessageStatus::Recalled {
                "(withdrew a message)"
            } else {
                message.content.as_str()
            };
            rendered.push_str(&format!("{}: {}\n", sender, content));
        }

        let request = vec![
            ChatMessage::system(format!(
                "You maintain the long-term memory for {}'s conversation with the user.",
                conversation.persona_name
            )),
            ChatMessage::user(format!("{}\n{}", rendered, SUMMARY_INSTRUCTION)),
        ];

        let summary = self.transport.generate(request).await?;

        // The summary covers exactly the messages older than what remains in
        // the active context window.
        let active = self.store.count_active_messages(conversation_id)?;
        let covered = active.saturating_sub(conversation.settings.context_limit);
        self.store
            .set_summary(conversation_id, summary.trim(), covered)?;

        tracing::info!(
            conversation = %conversation_id,
            covered,
            "conversation memory summary refreshed"
        );
        Ok(())
    }

    /// Pipeline hook: summarize when due; failure is logged and never
    /// propagates. A stale summary beats a crashed pipeline.
    pub async fn maybe_summarize(&self, conversation: &Conversation) {
        match self.due(conversation) {
            Ok(false) => {}
            Ok(true) => {
                if let Err(e) = self.summarize(&conversation.id).await {
                    tracing::warn!(
                        conversation = %conversation.id,
                        "summarization failed, keeping prior summary: {}",
                        e
                    );
                }
            }
            Err(e) => {
                tracing::warn!(conversation = %conversation.id, "summarization check failed: {}", e);
            }
        }
    }
}
