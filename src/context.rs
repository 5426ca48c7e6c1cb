use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;

use crate::directive;
use crate::error::{EngineError, EngineResult};
use crate::llm::ChatMessage;
use crate::store::{
    CardKind, Conversation, Message, MessageKind, MessageStatus, Moment, Sender,
};

const RECALLED_PLACEHOLDER: &str = "(a message was withdrawn)";

/// Cross-app state the persona is allowed to reference: wallet balance and
/// a snapshot of the recent feed.
#[derive(Debug, Default)]
pub struct WorldSnapshot {
    pub wallet_balance: Decimal,
    pub recent_moments: Vec<Moment>,
}

/// Builds the role-tagged message sequence for one generation request:
/// a single system instruction followed by the trailing window of history.
pub struct ContextAssembler {
    world_setting: String,
}

impl ContextAssembler {
    pub fn new(world_setting: String) -> Self {
        Self { world_setting }
    }

    pub fn assemble(
        &self,
        conversation: &Conversation,
        history: &[Message],
        world: &WorldSnapshot,
        now: DateTime<Utc>,
    ) -> EngineResult<Vec<ChatMessage>> {
        if conversation.kind == crate::store::ConversationKind::Direct
            && conversation.persona_prompt.trim().is_empty()
        {
            return Err(EngineError::PersonaMissing(conversation.id.clone()));
        }

        let mut messages = Vec::with_capacity(conversation.settings.context_limit + 1);
        messages.push(ChatMessage::system(self.system_prompt(conversation, world, now)));

        let window = trailing_window(history, conversation.settings.context_limit);
        for message in window {
            let role = match message.sender {
                Sender::User => "user",
                Sender::Persona => "assistant",
            };
            messages.push(ChatMessage {
                role: role.to_string(),
                content: render_message(message),
            });
        }

        Ok(messages)
    }

    fn system_prompt(
        &self,
        conversation: &Conversation,
        world: &WorldSnapshot,
        now: DateTime<Utc>,
    ) -> String {
        let mut prompt = String::new();

        prompt.push_str(&format!(
            "You are {}, chatting with the user inside a phone app.\n{}\n",
            conversation.persona_name, conversation.persona_prompt
        ));

        if !self.world_setting.trim().is_empty() {
            prompt.push_str(&format!("\nWorld setting: {}\n", self.world_setting));
        }

        if !conversation.user_persona.trim().is_empty() {
            prompt.push_str(&format!("\nAbout the user: {}\n", conversation.user_persona));
        }
        if !conversation.user_remark.trim().is_empty() {
            prompt.push_str(&format!(
                "You currently call the user \u{201c}{}\u{201d}.\n",
                conversation.user_remark
            ));
        }
        if !conversation.status_text.trim().is_empty() {
            prompt.push_str(&format!("Your current status line: {}\n", conversation.status_text));
        }

        if !conversation.memory_summary.trim().is_empty() {
            prompt.push_str(&format!(
                "\nWhat you remember from earlier in this relationship:\n{}\n",
                conversation.memory_summary
            ));
        }

        if conversation.settings.time_sense {
            let local = now + Duration::minutes(conversation.settings.utc_offset_minutes as i64);
            prompt.push_str(&format!(
                "\nReal time (UTC): {}\nYour local time: {}\n",
                now.format("%Y-%m-%d %H:%M"),
                local.format("%Y-%m-%d %H:%M"),
            ));
        } else {
            prompt.push_str(&format!("\nCurrent time: {}\n", now.format("%Y-%m-%d %H:%M")));
        }

        if let Some(reference) = conversation.settings.cycle_reference_date {
            let day = (now.date_naive() - reference).num_days().rem_euclid(28) + 1;
            prompt.push_str(&format!("Cycle tracker: day {} of 28.\n", day));
        }

        prompt.push_str(&format!(
            "\nThe user's wallet balance is {}.\n",
            world.wallet_balance
        ));
        if !world.recent_moments.is_empty() {
            prompt.push_str("Recent feed posts:\n");
            for moment in &world.recent_moments {
                prompt.push_str(&format!(
                    "- [{}] {}: {}\n",
                    moment.id, moment.author, moment.content
                ));
            }
        }

        if conversation.settings.offline_mode {
            prompt.push_str(
                "\nWrite in flowing narrative prose; your whole reply is delivered as one message.\n",
            );
        } else {
            prompt.push_str(
                "\nReply the way a person types on a phone: short bursts, no long paragraphs.\n",
            );
        }

        prompt.push('\n');
        prompt.push_str(directive::grammar_instructions());
        prompt
    }
}

fn trailing_window(history: &[Message], limit: usize) -> &[Message] {
    let active_len = history.len();
    if active_len > limit {
        &history[active_len - limit..]
    } else {
        history
    }
}

fn render_message(message: &Message) -> String {
    if message.status == MessageStatus::Recalled {
        return RECALLED_PLACEHOLDER.to_string();
    }
    match message.kind {
        MessageKind::Text => message.content.clone(),
        MessageKind::Image => "[image]".to_string(),
        MessageKind::Card => {
            let label = match message.subtype {
                Some(CardKind::Transfer) => "transfer",
                Some(CardKind::RedPacket) => "red packet",
                Some(CardKind::PayForMe) => "payment request",
                Some(CardKind::FamilyCard) => "family card",
                Some(CardKind::Food) => "food order",
                Some(CardKind::Emoji) => "sticker",
                Some(CardKind::Group) => "group invite",
                Some(CardKind::Notice) | None => "notice",
            };
            match message.amount {
                Some(amount) => format!("[{} card: {} ({})]", label, message.content, amount),
                None => format!("[{} card: {}]", label, message.content),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ConversationSettings, ConversationStore, NewMessage};
    use chrono::NaiveDate;

    fn conversation_with(settings: ConversationSettings) -> Conversation {
        let store = ConversationStore::in_memory().expect("store init");
        store
            .create_conversation("小狐", "A playful fox spirit", settings)
            .expect("create conversation")
    }

    fn history_of(n: usize) -> Vec<Message> {
        let store = ConversationStore::in_memory().expect("store init");
        let conversation = store
            .create_conversation("小狐", "persona", ConversationSettings::default())
            .expect("create");
        for idx in 0..n {
            let sender = if idx % 2 == 0 { Sender::User } else { Sender::Persona };
            store
                .append_message(&conversation.id, NewMessage::text(sender, format!("m{}", idx)))
                .expect("append");
        }
        store.recent_messages(&conversation.id, n).expect("history")
    }

    #[test]
    fn missing_persona_aborts_before_any_request() {
        let conversation = conversation_with(ConversationSettings::default());
        let mut empty = conversation.clone();
        empty.persona_prompt = "  ".to_string();

        let assembler = ContextAssembler::new(String::new());
        let err = assembler
            .assemble(&empty, &[], &WorldSnapshot::default(), Utc::now())
            .unwrap_err();
        assert!(matches!(err, EngineError::PersonaMissing(_)));
    }

    #[test]
    fn window_never_exceeds_context_limit() {
        let conversation = conversation_with(ConversationSettings {
            context_limit: 4,
            ..Default::default()
        });
        let history = history_of(12);

        let assembler = ContextAssembler::new(String::new());
        let messages = assembler
            .assemble(&conversation, &history, &WorldSnapshot::default(), Utc::now())
            .expect("assemble");

        // One system message plus exactly the trailing window.
        assert_eq!(messages.len(), 5);
        assert_eq!(messages[0].role, "system");
        assert_eq!(messages[1].content, "m8");
        assert_eq!(messages[4].content, "m11");
    }

    #[test]
    fn roles_map_user_and_persona() {
        let conversation = conversation_with(ConversationSettings::default());
        let history = history_of(2);

        let assembler = ContextAssembler::new(String::new());
        let messages = assembler
            .assemble(&conversation, &history, &WorldSnapshot::default(), Utc::now())
            .expect("assemble");
        assert_eq!(messages[1].role, "user");
        assert_eq!(messages[2].role, "assistant");
    }

    #[test]
    fn recalled_messages_render_as_placeholder() {
        let store = ConversationStore::in_memory().expect("store init");
        let conversation = store
            .create_conversation("小狐", "persona", ConversationSettings::default())
            .expect("create");
        store
            .append_message(&conversation.id, NewMessage::text(Sender::Persona, "秘密"))
            .expect("append");
        store
            .recall_latest_persona_message(&conversation.id)
            .expect("recall");
        let history = store.recent_messages(&conversation.id, 10).expect("history");

        let assembler = ContextAssembler::new(String::new());
        let messages = assembler
            .assemble(&conversation, &history, &WorldSnapshot::default(), Utc::now())
            .expect("assemble");
        assert_eq!(messages[1].content, RECALLED_PLACEHOLDER);
        assert!(!messages[1].content.contains("秘密"));
    }

    #[test]
    fn time_sense_embeds_offset_local_time() {
        let conversation = conversation_with(ConversationSettings {
            time_sense: true,
            utc_offset_minutes: 480,
            ..Default::default()
        });
        let now = DateTime::parse_from_rfc3339("2024-06-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);

        let assembler = ContextAssembler::new(String::new());
        let messages = assembler
            .assemble(&conversation, &[], &WorldSnapshot::default(), now)
            .expect("assemble");
        let system = &messages[0].content;
        assert!(system.contains("2024-06-01 10:00"));
        assert!(system.contains("2024-06-01 18:00"));
    }

    #[test]
    fn cycle_day_is_reference_modulo_28() {
        let conversation = conversation_with(ConversationSettings {
            cycle_reference_date: NaiveDate::from_ymd_opt(2024, 5, 1),
            ..Default::default()
        });
        // 31 days later: 31 % 28 = 3, so day 4.
        let now = DateTime::parse_from_rfc3339("2024-06-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);

        let assembler = ContextAssembler::new(String::new());
        let messages = assembler
            .assemble(&conversation, &[], &WorldSnapshot::default(), now)
            .expect("assemble");
        assert!(messages[0].content.contains("day 4 of 28"));
    }

    #[test]
    fn system_prompt_carries_grammar_and_memory() {
        let store = ConversationStore::in_memory().expect("store init");
        let conversation = store
            .create_conversation("小狐", "persona", ConversationSettings::default())
            .expect("create");
        store
            .set_summary(&conversation.id, "You bonded over milk tea.", 12)
            .expect("summary");
        store
            .set_user_persona(&conversation.id, "a night-shift nurse")
            .expect("user persona");
        let conversation = store
            .get_conversation(&conversation.id)
            .expect("get")
            .expect("exists");

        let assembler = ContextAssembler::new("A neon coastal city.".to_string());
        let messages = assembler
            .assemble(&conversation, &[], &WorldSnapshot::default(), Utc::now())
            .expect("assemble");
        let system = &messages[0].content;
        assert!(system.contains("[TRANSFER:amount]"));
        assert!(system.contains("milk tea"));
        assert!(system.contains("neon coastal city"));
        assert!(system.contains("night-shift nurse"));
    }
}
