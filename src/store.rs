use anyhow::{anyhow, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
    Direct,
    Group,
}

impl ConversationKind {
    fn as_db_str(self) -> &'static str {
        match self {
            ConversationKind::Direct => "direct",
            ConversationKind::Group => "group",
        }
    }

    fn from_db(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "group" => ConversationKind::Group,
            _ => ConversationKind::Direct,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sender {
    User,
    Persona,
}

impl Sender {
    fn as_db_str(self) -> &'static str {
        match self {
            Sender::User => "user",
            Sender::Persona => "persona",
        }
    }

    fn from_db(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "user" => Sender::User,
            _ => Sender::Persona,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Image,
    Card,
}

impl MessageKind {
    fn as_db_str(self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Image => "image",
            MessageKind::Card => "card",
        }
    }

    fn from_db(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "image" => MessageKind::Image,
            "card" => MessageKind::Card,
            _ => MessageKind::Text,
        }
    }
}

/// Structured non-free-text message payloads (economic/social actions).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CardKind {
    Transfer,
    RedPacket,
    PayForMe,
    FamilyCard,
    Food,
    Emoji,
    Group,
    Notice,
}

impl CardKind {
    fn as_db_str(self) -> &'static str {
        match self {
            CardKind::Transfer => "transfer",
            CardKind::RedPacket => "redpacket",
            CardKind::PayForMe => "payforme",
            CardKind::FamilyCard => "familycard",
            CardKind::Food => "food",
            CardKind::Emoji => "emoji",
            CardKind::Group => "group",
            CardKind::Notice => "notice",
        }
    }

    fn from_db(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "transfer" => Some(CardKind::Transfer),
            "redpacket" => Some(CardKind::RedPacket),
            "payforme" => Some(CardKind::PayForMe),
            "familycard" => Some(CardKind::FamilyCard),
            "food" => Some(CardKind::Food),
            "emoji" => Some(CardKind::Emoji),
            "group" => Some(CardKind::Group),
            "notice" => Some(CardKind::Notice),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Normal,
    Recalled,
    Deleted,
}

impl MessageStatus {
    fn as_db_str(self) -> &'static str {
        match self {
            MessageStatus::Normal => "normal",
            MessageStatus::Recalled => "recalled",
            MessageStatus::Deleted => "deleted",
        }
    }

    fn from_db(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "recalled" => MessageStatus::Recalled,
            "deleted" => MessageStatus::Deleted,
            _ => MessageStatus::Normal,
        }
    }
}

/// Per-conversation behavior switches. Defaults come from `EngineConfig`
/// at creation time; user edits go through `SettingsPatch`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSettings {
    pub context_limit: usize,
    pub summarize_every: usize,
    pub time_sense: bool,
    pub utc_offset_minutes: i32,
    pub offline_mode: bool,
    pub couple_avatar: bool,
    pub cycle_reference_date: Option<NaiveDate>,
}

impl Default for ConversationSettings {
    fn default() -> Self {
        Self {
            context_limit: 10,
            summarize_every: 20,
            time_sense: false,
            utc_offset_minutes: 0,
            offline_mode: false,
            couple_avatar: false,
            cycle_reference_date: None,
        }
    }
}

/// Partial settings update; `None` leaves the stored value untouched.
#[derive(Debug, Clone, Default)]
pub struct SettingsPatch {
    pub context_limit: Option<usize>,
    pub summarize_every: Option<usize>,
    pub time_sense: Option<bool>,
    pub utc_offset_minutes: Option<i32>,
    pub offline_mode: Option<bool>,
    pub couple_avatar: Option<bool>,
    pub cycle_reference_date: Option<Option<NaiveDate>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub kind: ConversationKind,
    pub persona_name: String,
    pub persona_prompt: String,
    pub user_persona: String,
    /// How the persona refers to the user; mutated by the REMARK directive.
    pub user_remark: String,
    pub status_text: String,
    pub persona_avatar: Option<String>,
    pub members: Vec<String>,
    pub settings: ConversationSettings,
    pub memory_summary: String,
    /// High-water mark: how many log entries the stored summary covers.
    pub summarized_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub seq: i64,
    pub sender: Sender,
    pub kind: MessageKind,
    pub subtype: Option<CardKind>,
    pub content: String,
    /// Original content of a recalled message, kept for audit.
    pub hidden_content: Option<String>,
    pub amount: Option<Decimal>,
    pub claimed: bool,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
}

/// Append payload; id/seq/timestamp are allocated by the store.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub sender: Sender,
    pub kind: MessageKind,
    pub subtype: Option<CardKind>,
    pub content: String,
    pub amount: Option<Decimal>,
}

impl NewMessage {
    pub fn text(sender: Sender, content: impl Into<String>) -> Self {
        Self {
            sender,
            kind: MessageKind::Text,
            subtype: None,
            content: content.into(),
            amount: None,
        }
    }

    pub fn card(sender: Sender, card: CardKind, content: impl Into<String>) -> Self {
        Self {
            sender,
            kind: MessageKind::Card,
            subtype: Some(card),
            content: content.into(),
            amount: None,
        }
    }

    pub fn with_amount(mut self, amount: Decimal) -> Self {
        self.amount = Some(amount);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletEntry {
    pub id: String,
    pub amount: Decimal,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Moment {
    pub id: String,
    pub author: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MomentComment {
    pub id: String,
    pub moment_id: String,
    pub author: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Keyed persistent store for conversations, the wallet and the moments
/// feed. One sqlite connection behind a mutex; every read-modify-write the
/// directive executor performs happens under that lock, which is what makes
/// wallet credits and red-packet claims atomic.
pub struct ConversationStore {
    conn: Mutex<Connection>,
}

impl ConversationStore {
    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow!("Database lock poisoned: {}", e))
    }

    /// Create or open the database
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock_conn()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                persona_name TEXT NOT NULL,
                persona_prompt TEXT NOT NULL,
                user_persona TEXT NOT NULL DEFAULT '',
                user_remark TEXT NOT NULL DEFAULT '',
                status_text TEXT NOT NULL DEFAULT '',
                persona_avatar TEXT,
                members TEXT NOT NULL DEFAULT '[]',
                context_limit INTEGER NOT NULL DEFAULT 10,
                summarize_every INTEGER NOT NULL DEFAULT 20,
                time_sense INTEGER NOT NULL DEFAULT 0,
                utc_offset_minutes INTEGER NOT NULL DEFAULT 0,
                offline_mode INTEGER NOT NULL DEFAULT 0,
                couple_avatar INTEGER NOT NULL DEFAULT 0,
                cycle_reference_date TEXT,
                memory_summary TEXT NOT NULL DEFAULT '',
                summarized_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                sender TEXT NOT NULL,
                kind TEXT NOT NULL,
                subtype TEXT,
                content TEXT NOT NULL,
                hidden_content TEXT,
                amount TEXT,
                claimed INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'normal',
                created_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_messages_conversation_seq
             ON messages(conversation_id, seq)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS wallet (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                balance TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "INSERT OR IGNORE INTO wallet (id, balance) VALUES (1, '0')",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS wallet_history (
                id TEXT PRIMARY KEY,
                amount TEXT NOT NULL,
                reason TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS moments (
                id TEXT PRIMARY KEY,
                author TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS moment_likes (
                moment_id TEXT NOT NULL,
                author TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE(moment_id, author)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS moment_comments (
                id TEXT PRIMARY KEY,
                moment_id TEXT NOT NULL,
                author TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS emojis (
                id TEXT PRIMARY KEY,
                description TEXT NOT NULL
            )",
            [],
        )?;

        Ok(())
    }

    // ---- conversations ----

    pub fn create_conversation(
        &self,
        persona_name: &str,
        persona_prompt: &str,
        settings: ConversationSettings,
    ) -> Result<Conversation> {
        self.insert_conversation(
            ConversationKind::Direct,
            persona_name,
            persona_prompt,
            Vec::new(),
            settings,
        )
    }

    pub fn create_group_conversation(
        &self,
        group_name: &str,
        members: Vec<String>,
    ) -> Result<Conversation> {
        self.insert_conversation(
            ConversationKind::Group,
            group_name,
            "",
            members,
            ConversationSettings::default(),
        )
    }

    fn insert_conversation(
        &self,
        kind: ConversationKind,
        persona_name: &str,
        persona_prompt: &str,
        members: Vec<String>,
        settings: ConversationSettings,
    ) -> Result<Conversation> {
        let now = Utc::now();
        let conversation = Conversation {
            id: Uuid::new_v4().to_string(),
            kind,
            persona_name: persona_name.to_string(),
            persona_prompt: persona_prompt.to_string(),
            user_persona: String::new(),
            user_remark: String::new(),
            status_text: String::new(),
            persona_avatar: None,
            members,
            settings,
            memory_summary: String::new(),
            summarized_count: 0,
            created_at: now,
            updated_at: now,
        };

        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO conversations (
                id, kind, persona_name, persona_prompt, user_persona, user_remark,
                status_text, persona_avatar, members, context_limit, summarize_every,
                time_sense, utc_offset_minutes, offline_mode, couple_avatar,
                cycle_reference_date, memory_summary, summarized_count, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)",
            params![
                conversation.id,
                conversation.kind.as_db_str(),
                conversation.persona_name,
                conversation.persona_prompt,
                conversation.user_persona,
                conversation.user_remark,
                conversation.status_text,
                conversation.persona_avatar,
                serde_json::to_string(&conversation.members)?,
                conversation.settings.context_limit as i64,
                conversation.settings.summarize_every as i64,
                conversation.settings.time_sense as i64,
                conversation.settings.utc_offset_minutes,
                conversation.settings.offline_mode as i64,
                conversation.settings.couple_avatar as i64,
                conversation
                    .settings
                    .cycle_reference_date
                    .map(|d| d.to_string()),
                conversation.memory_summary,
                conversation.summarized_count as i64,
                conversation.created_at.to_rfc3339(),
                conversation.updated_at.to_rfc3339(),
            ],
        )?;

        Ok(conversation)
    }

    pub fn get_conversation(&self, id: &str) -> Result<Option<Conversation>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, kind, persona_name, persona_prompt, user_persona, user_remark,
                    status_text, persona_avatar, members, context_limit, summarize_every,
                    time_sense, utc_offset_minutes, offline_mode, couple_avatar,
                    cycle_reference_date, memory_summary, summarized_count, created_at, updated_at
             FROM conversations WHERE id = ?1",
        )?;
        let conversation = stmt
            .query_row([id], Self::map_conversation_row)
            .optional()?;
        Ok(conversation)
    }

    pub fn list_conversations(&self) -> Result<Vec<Conversation>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, kind, persona_name, persona_prompt, user_persona, user_remark,
                    status_text, persona_avatar, members, context_limit, summarize_every,
                    time_sense, utc_offset_minutes, offline_mode, couple_avatar,
                    cycle_reference_date, memory_summary, summarized_count, created_at, updated_at
             FROM conversations ORDER BY created_at",
        )?;
        let conversations = stmt
            .query_map([], Self::map_conversation_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(conversations)
    }

    /// Group lookup by display name; backs the idempotence of the
    /// CREATE_GROUP / INVITE_GROUP directives.
    pub fn find_group_by_name(&self, name: &str) -> Result<Option<Conversation>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, kind, persona_name, persona_prompt, user_persona, user_remark,
                    status_text, persona_avatar, members, context_limit, summarize_every,
                    time_sense, utc_offset_minutes, offline_mode, couple_avatar,
                    cycle_reference_date, memory_summary, summarized_count, created_at, updated_at
             FROM conversations WHERE kind = 'group' AND persona_name = ?1",
        )?;
        let conversation = stmt
            .query_row([name], Self::map_conversation_row)
            .optional()?;
        Ok(conversation)
    }

    fn map_conversation_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
        let members_raw: String = row.get(8)?;
        let members = serde_json::from_str(&members_raw).unwrap_or_default();
        let cycle_raw: Option<String> = row.get(15)?;
        let cycle_reference_date = cycle_raw.and_then(|raw| raw.parse().ok());
        Ok(Conversation {
            id: row.get(0)?,
            kind: ConversationKind::from_db(&row.get::<_, String>(1)?),
            persona_name: row.get(2)?,
            persona_prompt: row.get(3)?,
            user_persona: row.get(4)?,
            user_remark: row.get(5)?,
            status_text: row.get(6)?,
            persona_avatar: row.get(7)?,
            members,
            settings: ConversationSettings {
                context_limit: row.get::<_, i64>(9)?.max(0) as usize,
                summarize_every: row.get::<_, i64>(10)?.max(0) as usize,
                time_sense: row.get::<_, i64>(11)? != 0,
                utc_offset_minutes: row.get::<_, i64>(12)? as i32,
                offline_mode: row.get::<_, i64>(13)? != 0,
                couple_avatar: row.get::<_, i64>(14)? != 0,
                cycle_reference_date,
            },
            memory_summary: row.get(16)?,
            summarized_count: row.get::<_, i64>(17)?.max(0) as usize,
            created_at: parse_timestamp(row, 18)?,
            updated_at: parse_timestamp(row, 19)?,
        })
    }

    pub fn update_settings(&self, id: &str, patch: &SettingsPatch) -> Result<()> {
        let Some(conversation) = self.get_conversation(id)? else {
            return Err(anyhow!("conversation {} not found", id));
        };
        let mut settings = conversation.settings;

        if let Some(value) = patch.context_limit {
            settings.context_limit = value;
        }
        if let Some(value) = patch.summarize_every {
            settings.summarize_every = value;
        }
        if let Some(value) = patch.time_sense {
            settings.time_sense = value;
        }
        if let Some(value) = patch.utc_offset_minutes {
            settings.utc_offset_minutes = value;
        }
        if let Some(value) = patch.offline_mode {
            settings.offline_mode = value;
        }
        if let Some(value) = patch.couple_avatar {
            settings.couple_avatar = value;
        }
        if let Some(value) = patch.cycle_reference_date {
            settings.cycle_reference_date = value;
        }

        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE conversations SET
                context_limit = ?2, summarize_every = ?3, time_sense = ?4,
                utc_offset_minutes = ?5, offline_mode = ?6, couple_avatar = ?7,
                cycle_reference_date = ?8, updated_at = ?9
             WHERE id = ?1",
            params![
                id,
                settings.context_limit as i64,
                settings.summarize_every as i64,
                settings.time_sense as i64,
                settings.utc_offset_minutes,
                settings.offline_mode as i64,
                settings.couple_avatar as i64,
                settings.cycle_reference_date.map(|d| d.to_string()),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Replace (not append) the durable memory summary and advance the
    /// covered-messages high-water mark.
    pub fn set_summary(&self, id: &str, summary: &str, summarized_count: usize) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE conversations SET memory_summary = ?2, summarized_count = ?3, updated_at = ?4
             WHERE id = ?1",
            params![
                id,
                summary,
                summarized_count as i64,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    pub fn set_status_text(&self, id: &str, status: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE conversations SET status_text = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, status, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn set_user_remark(&self, id: &str, remark: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE conversations SET user_remark = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, remark, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn set_user_persona(&self, id: &str, user_persona: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE conversations SET user_persona = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, user_persona, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn set_persona_avatar(&self, id: &str, avatar_ref: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE conversations SET persona_avatar = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, avatar_ref, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    // ---- messages ----

    /// Append a message. Sequence numbers are allocated under the store
    /// lock and the timestamp is clamped forward so `(seq, created_at)` is
    /// strictly non-decreasing per conversation even across clock jitter.
    pub fn append_message(&self, conversation_id: &str, new: NewMessage) -> Result<Message> {
        let conn = self.lock_conn()?;

        let (next_seq, last_at): (i64, Option<String>) = conn.query_row(
            "SELECT COALESCE(MAX(seq), 0) + 1, MAX(created_at)
             FROM messages WHERE conversation_id = ?1",
            [conversation_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let mut created_at = Utc::now();
        if let Some(last) = last_at.and_then(|raw| raw.parse::<DateTime<Utc>>().ok()) {
            if created_at < last {
                created_at = last;
            }
        }

        let message = Message {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            seq: next_seq,
            sender: new.sender,
            kind: new.kind,
            subtype: new.subtype,
            content: new.content,
            hidden_content: None,
            amount: new.amount,
            claimed: false,
            status: MessageStatus::Normal,
            created_at,
        };

        conn.execute(
            "INSERT INTO messages (id, conversation_id, seq, sender, kind, subtype, content,
                                   hidden_content, amount, claimed, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                message.id,
                message.conversation_id,
                message.seq,
                message.sender.as_db_str(),
                message.kind.as_db_str(),
                message.subtype.map(|c| c.as_db_str()),
                message.content,
                message.hidden_content,
                message.amount.map(|a| a.to_string()),
                message.claimed as i64,
                message.status.as_db_str(),
                message.created_at.to_rfc3339(),
            ],
        )?;

        Ok(message)
    }

    /// Trailing window of the most recent non-deleted messages, oldest first.
    pub fn recent_messages(&self, conversation_id: &str, limit: usize) -> Result<Vec<Message>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, seq, sender, kind, subtype, content, hidden_content,
                    amount, claimed, status, created_at
             FROM messages
             WHERE conversation_id = ?1 AND status != 'deleted'
             ORDER BY seq DESC
             LIMIT ?2",
        )?;
        let messages = stmt
            .query_map(params![conversation_id, limit as i64], Self::map_message_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(messages.into_iter().rev().collect())
    }

    pub fn get_message(&self, id: &str) -> Result<Option<Message>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, seq, sender, kind, subtype, content, hidden_content,
                    amount, claimed, status, created_at
             FROM messages WHERE id = ?1",
        )?;
        let message = stmt.query_row([id], Self::map_message_row).optional()?;
        Ok(message)
    }

    pub fn count_active_messages(&self, conversation_id: &str) -> Result<usize> {
        let conn = self.lock_conn()?;
        let count = conn.query_row(
            "SELECT COUNT(1) FROM messages WHERE conversation_id = ?1 AND status != 'deleted'",
            [conversation_id],
            |row| row.get::<_, i64>(0),
        )?;
        Ok(count.max(0) as usize)
    }

    /// Most recent non-deleted message from the given sender, if any.
    pub fn latest_message_from(
        &self,
        conversation_id: &str,
        sender: Sender,
    ) -> Result<Option<Message>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, seq, sender, kind, subtype, content, hidden_content,
                    amount, claimed, status, created_at
             FROM messages
             WHERE conversation_id = ?1 AND sender = ?2 AND status != 'deleted'
             ORDER BY seq DESC LIMIT 1",
        )?;
        let message = stmt
            .query_row(params![conversation_id, sender.as_db_str()], Self::map_message_row)
            .optional()?;
        Ok(message)
    }

    /// Flip the most recent normal persona message to `recalled`, moving its
    /// content into the hidden shadow field. Cards can be recalled too; side
    /// effects already applied stay applied. No-op when nothing qualifies.
    pub fn recall_latest_persona_message(&self, conversation_id: &str) -> Result<Option<Message>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, seq, sender, kind, subtype, content, hidden_content,
                    amount, claimed, status, created_at
             FROM messages
             WHERE conversation_id = ?1 AND sender = 'persona' AND status = 'normal'
             ORDER BY seq DESC LIMIT 1",
        )?;
        let Some(mut message) = stmt.query_row([conversation_id], Self::map_message_row).optional()?
        else {
            return Ok(None);
        };

        conn.execute(
            "UPDATE messages SET status = 'recalled', hidden_content = content, content = ''
             WHERE id = ?1",
            [&message.id],
        )?;

        message.hidden_content = Some(std::mem::take(&mut message.content));
        message.status = MessageStatus::Recalled;
        Ok(Some(message))
    }

    pub fn mark_deleted(&self, message_id: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE messages SET status = 'deleted' WHERE id = ?1",
            [message_id],
        )?;
        Ok(())
    }

    /// Claim a red-packet card, crediting the wallet exactly once. Returns
    /// the credited amount, or `None` when the card was already claimed or
    /// the id does not name a red packet. The guarded UPDATE and the wallet
    /// credit run under the same connection lock.
    pub fn claim_redpacket(&self, message_id: &str) -> Result<Option<Decimal>> {
        let conn = self.lock_conn()?;

        let affected = conn.execute(
            "UPDATE messages SET claimed = 1
             WHERE id = ?1 AND subtype = 'redpacket' AND claimed = 0",
            [message_id],
        )?;
        if affected == 0 {
            return Ok(None);
        }

        let amount_raw: Option<String> = conn.query_row(
            "SELECT amount FROM messages WHERE id = ?1",
            [message_id],
            |row| row.get(0),
        )?;
        let amount = amount_raw
            .as_deref()
            .map(Decimal::from_str)
            .transpose()
            .map_err(|e| anyhow!("stored red-packet amount is not a decimal: {}", e))?
            .unwrap_or_default();

        Self::apply_wallet_delta(&conn, amount, "redpacket claim")?;
        Ok(Some(amount))
    }

    // ---- wallet ----

    pub fn wallet_balance(&self) -> Result<Decimal> {
        let conn = self.lock_conn()?;
        let raw: String =
            conn.query_row("SELECT balance FROM wallet WHERE id = 1", [], |row| {
                row.get(0)
            })?;
        Decimal::from_str(&raw).map_err(|e| anyhow!("stored balance is not a decimal: {}", e))
    }

    pub fn wallet_credit(&self, amount: Decimal, reason: &str) -> Result<Decimal> {
        let conn = self.lock_conn()?;
        Self::apply_wallet_delta(&conn, amount, reason)
    }

    /// Debits do not check sufficiency; overdraft is permitted by design.
    pub fn wallet_debit(&self, amount: Decimal, reason: &str) -> Result<Decimal> {
        let conn = self.lock_conn()?;
        Self::apply_wallet_delta(&conn, -amount, reason)
    }

    fn apply_wallet_delta(conn: &Connection, delta: Decimal, reason: &str) -> Result<Decimal> {
        let raw: String =
            conn.query_row("SELECT balance FROM wallet WHERE id = 1", [], |row| {
                row.get(0)
            })?;
        let balance = Decimal::from_str(&raw)
            .map_err(|e| anyhow!("stored balance is not a decimal: {}", e))?;
        let next = balance + delta;

        conn.execute(
            "UPDATE wallet SET balance = ?1 WHERE id = 1",
            [next.to_string()],
        )?;
        conn.execute(
            "INSERT INTO wallet_history (id, amount, reason, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                Uuid::new_v4().to_string(),
                delta.to_string(),
                reason,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(next)
    }

    pub fn wallet_history(&self, limit: usize) -> Result<Vec<WalletEntry>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, amount, reason, created_at FROM wallet_history
             ORDER BY created_at DESC LIMIT ?1",
        )?;
        let entries = stmt
            .query_map([limit as i64], |row| {
                let amount_raw: String = row.get(1)?;
                Ok(WalletEntry {
                    id: row.get(0)?,
                    amount: Decimal::from_str(&amount_raw).map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(
                            1,
                            rusqlite::types::Type::Text,
                            Box::new(e),
                        )
                    })?,
                    reason: row.get(2)?,
                    created_at: parse_timestamp(row, 3)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    // ---- moments ----

    pub fn add_moment(&self, author: &str, content: &str) -> Result<Moment> {
        let moment = Moment {
            id: Uuid::new_v4().to_string(),
            author: author.to_string(),
            content: content.to_string(),
            created_at: Utc::now(),
        };
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO moments (id, author, content, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                moment.id,
                moment.author,
                moment.content,
                moment.created_at.to_rfc3339()
            ],
        )?;
        Ok(moment)
    }

    pub fn moment_exists(&self, moment_id: &str) -> Result<bool> {
        let conn = self.lock_conn()?;
        let count = conn.query_row(
            "SELECT COUNT(1) FROM moments WHERE id = ?1",
            [moment_id],
            |row| row.get::<_, i64>(0),
        )?;
        Ok(count > 0)
    }

    /// Idempotent on (moment, author): repeated likes collapse to one row.
    pub fn like_moment(&self, moment_id: &str, author: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO moment_likes (moment_id, author, created_at)
             VALUES (?1, ?2, ?3)",
            params![moment_id, author, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn comment_moment(&self, moment_id: &str, author: &str, content: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO moment_comments (id, moment_id, author, content, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                Uuid::new_v4().to_string(),
                moment_id,
                author,
                content,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn latest_moment_by(&self, author: &str) -> Result<Option<Moment>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, author, content, created_at FROM moments
             WHERE author = ?1 ORDER BY created_at DESC LIMIT 1",
        )?;
        let moment = stmt
            .query_row([author], |row| {
                Ok(Moment {
                    id: row.get(0)?,
                    author: row.get(1)?,
                    content: row.get(2)?,
                    created_at: parse_timestamp(row, 3)?,
                })
            })
            .optional()?;
        Ok(moment)
    }

    pub fn has_comment_by(&self, moment_id: &str, author: &str) -> Result<bool> {
        let conn = self.lock_conn()?;
        let count = conn.query_row(
            "SELECT COUNT(1) FROM moment_comments WHERE moment_id = ?1 AND author = ?2",
            params![moment_id, author],
            |row| row.get::<_, i64>(0),
        )?;
        Ok(count > 0)
    }

    pub fn recent_moments(&self, limit: usize) -> Result<Vec<Moment>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, author, content, created_at FROM moments
             ORDER BY created_at DESC LIMIT ?1",
        )?;
        let moments = stmt
            .query_map([limit as i64], |row| {
                Ok(Moment {
                    id: row.get(0)?,
                    author: row.get(1)?,
                    content: row.get(2)?,
                    created_at: parse_timestamp(row, 3)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(moments)
    }

    // ---- emoji registry ----

    pub fn register_emoji(&self, id: &str, description: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO emojis (id, description) VALUES (?1, ?2)
             ON CONFLICT(id) DO UPDATE SET description = excluded.description",
            params![id, description],
        )?;
        Ok(())
    }

    pub fn get_emoji(&self, id: &str) -> Result<Option<String>> {
        let conn = self.lock_conn()?;
        let description = conn
            .query_row("SELECT description FROM emojis WHERE id = ?1", [id], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(description)
    }

    fn map_message_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
        let subtype_raw: Option<String> = row.get(5)?;
        let amount_raw: Option<String> = row.get(8)?;
        let amount = match amount_raw {
            Some(raw) => Some(Decimal::from_str(&raw).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    8,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })?),
            None => None,
        };
        Ok(Message {
            id: row.get(0)?,
            conversation_id: row.get(1)?,
            seq: row.get(2)?,
            sender: Sender::from_db(&row.get::<_, String>(3)?),
            kind: MessageKind::from_db(&row.get::<_, String>(4)?),
            subtype: subtype_raw.as_deref().and_then(CardKind::from_db),
            content: row.get(6)?,
            hidden_content: row.get(7)?,
            amount,
            claimed: row.get::<_, i64>(9)? != 0,
            status: MessageStatus::from_db(&row.get::<_, String>(10)?),
            created_at: parse_timestamp(row, 11)?,
        })
    }
}

fn parse_timestamp(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}
