use std::sync::Arc;

use crate::directive::{Directive, ScanOutcome};
use crate::error::EngineResult;
use crate::store::{
    CardKind, Conversation, ConversationStore, Message, MessageKind, NewMessage, Sender,
};

/// What one executor pass did: the residual display text plus every message
/// it inserted, so the caller can surface them as events.
#[derive(Debug, Default)]
pub struct ExecutionReport {
    pub clean_text: String,
    pub appended: Vec<Message>,
    pub applied: usize,
    pub dropped: usize,
}

/// Applies parsed directives to shared state, exactly once each, in source
/// order. Effects are incremental: a failure partway through leaves earlier
/// effects in place.
pub struct DirectiveExecutor {
    store: Arc<ConversationStore>,
}

impl DirectiveExecutor {
    pub fn new(store: Arc<ConversationStore>) -> Self {
        Self { store }
    }

    pub fn execute(
        &self,
        conversation: &Conversation,
        outcome: &ScanOutcome,
    ) -> EngineResult<ExecutionReport> {
        let mut report = ExecutionReport {
            clean_text: outcome.clean_text(),
            ..Default::default()
        };

        for directive in outcome.directives() {
            if self.apply(conversation, directive, &mut report)? {
                report.applied += 1;
            } else {
                report.dropped += 1;
            }
        }

        Ok(report)
    }

    /// Returns whether the directive took effect. `Ok(false)` is the silent
    /// drop path (unresolved reference, inapplicable avatar change).
    fn apply(
        &self,
        conversation: &Conversation,
        directive: &Directive,
        report: &mut ExecutionReport,
    ) -> EngineResult<bool> {
        match directive {
            Directive::Remark { name } => {
                self.store.set_user_remark(&conversation.id, name)?;
                let notice = self.store.append_message(
                    &conversation.id,
                    NewMessage::card(
                        Sender::Persona,
                        CardKind::Notice,
                        format!("{} now calls you \u{201c}{}\u{201d}", conversation.persona_name, name),
                    ),
                )?;
                report.appended.push(notice);
                Ok(true)
            }
            Directive::Status { text } => {
                self.store.set_status_text(&conversation.id, text)?;
                Ok(true)
            }
            Directive::AvatarChange => {
                // Only meaningful when the user's latest message is an image.
                let latest = self
                    .store
                    .latest_message_from(&conversation.id, Sender::User)?;
                match latest {
                    Some(message) if message.kind == MessageKind::Image => {
                        self.store
                            .set_persona_avatar(&conversation.id, &message.content)?;
                        Ok(true)
                    }
                    _ => {
                        tracing::debug!(
                            conversation = %conversation.id,
                            "avatar change dropped: latest user message is not an image"
                        );
                        Ok(false)
                    }
                }
            }
            Directive::AppRedirect { target } => {
                // UI deep-link; stripped from text, no core state change.
                tracing::debug!(%target, "app redirect directive forwarded to UI layer");
                Ok(true)
            }
            Directive::Transfer { amount } => {
                self.store.wallet_credit(
                    *amount,
                    &format!("transfer from {}", conversation.persona_name),
                )?;
                let card = self.store.append_message(
                    &conversation.id,
                    NewMessage::card(Sender::Persona, CardKind::Transfer, "Transfer")
                        .with_amount(*amount),
                )?;
                report.appended.push(card);
                Ok(true)
            }
            Directive::RedPacket { amount, note } => {
                let content = note.clone().unwrap_or_else(|| "Open me!".to_string());
                let card = self.store.append_message(
                    &conversation.id,
                    NewMessage::card(Sender::Persona, CardKind::RedPacket, content)
                        .with_amount(*amount),
                )?;
                report.appended.push(card);
                Ok(true)
            }
            Directive::PayForMe { amount } => {
                let card = self.store.append_message(
                    &conversation.id,
                    NewMessage::card(Sender::Persona, CardKind::PayForMe, "Pay for me?")
                        .with_amount(*amount),
                )?;
                report.appended.push(card);
                Ok(true)
            }
            Directive::FamilyCard { limit } => {
                let card = self.store.append_message(
                    &conversation.id,
                    NewMessage::card(Sender::Persona, CardKind::FamilyCard, "Family card")
                        .with_amount(*limit),
                )?;
                report.appended.push(card);
                Ok(true)
            }
            Directive::OrderFood { item, price } => {
                let card = self.store.append_message(
                    &conversation.id,
                    NewMessage::card(Sender::Persona, CardKind::Food, item.clone())
                        .with_amount(*price),
                )?;
                report.appended.push(card);
                Ok(true)
            }
            Directive::InviteGroup { name } => {
                self.ensure_group(conversation, name, Vec::new(), report)?;
                Ok(true)
            }
            Directive::CreateGroup { name, members } => {
                self.ensure_group(conversation, name, members.clone(), report)?;
                Ok(true)
            }
            Directive::Emoji { id } => match self.store.get_emoji(id)? {
                Some(description) => {
                    let emoji = self.store.append_message(
                        &conversation.id,
                        NewMessage::card(Sender::Persona, CardKind::Emoji, description),
                    )?;
                    report.appended.push(emoji);
                    Ok(true)
                }
                None => {
                    tracing::debug!(emoji_id = %id, "emoji directive dropped: unknown id");
                    Ok(false)
                }
            },
            Directive::Recall => {
                let recalled = self.store.recall_latest_persona_message(&conversation.id)?;
                Ok(recalled.is_some())
            }
            Directive::Like { moment_id } => {
                if !self.store.moment_exists(moment_id)? {
                    tracing::debug!(%moment_id, "like directive dropped: unknown moment");
                    return Ok(false);
                }
                self.store.like_moment(moment_id, &conversation.persona_name)?;
                Ok(true)
            }
            Directive::Comment { moment_id, text } => {
                if !self.store.moment_exists(moment_id)? {
                    tracing::debug!(%moment_id, "comment directive dropped: unknown moment");
                    return Ok(false);
                }
                self.store
                    .comment_moment(moment_id, &conversation.persona_name, text)?;
                Ok(true)
            }
        }
    }

    /// Look up or create the named group, then drop an informational card
    /// into the current conversation. Idempotent on group name.
    fn ensure_group(
        &self,
        conversation: &Conversation,
        name: &str,
        extra_members: Vec<String>,
        report: &mut ExecutionReport,
    ) -> EngineResult<()> {
        let already = self.store.find_group_by_name(name)?;
        if already.is_none() {
            let mut members = vec![conversation.persona_name.clone(), "user".to_string()];
            members.extend(extra_members);
            members.dedup();
            self.store.create_group_conversation(name, members)?;
        }

        let card = self.store.append_message(
            &conversation.id,
            NewMessage::card(
                Sender::Persona,
                CardKind::Group,
                format!("{} invited you to \u{201c}{}\u{201d}", conversation.persona_name, name),
            ),
        )?;
        report.appended.push(card);
        Ok(())
    }
}
