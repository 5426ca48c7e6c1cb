use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::PacingConfig;
use crate::error::EngineResult;
use crate::store::{ConversationStore, Message, NewMessage, Sender};

/// Resolved splitting/delay parameters, derived from config once per engine.
#[derive(Debug, Clone)]
pub struct PacingPolicy {
    pub base_delay_ms: u64,
    pub jitter_max_ms: u64,
    pub per_char_ms: u64,
    pub typing_cap_ms: u64,
    pub cut_len: usize,
    terminal: Vec<char>,
}

impl PacingPolicy {
    pub fn from_config(config: &PacingConfig) -> Self {
        Self {
            base_delay_ms: config.base_delay_ms,
            jitter_max_ms: config.jitter_max_ms,
            per_char_ms: config.per_char_ms,
            typing_cap_ms: config.typing_cap_ms,
            cut_len: config.cut_len,
            terminal: config.terminal_punctuation.chars().collect(),
        }
    }

    fn is_terminal(&self, ch: char) -> bool {
        self.terminal.contains(&ch)
    }
}

impl Default for PacingPolicy {
    fn default() -> Self {
        Self::from_config(&PacingConfig::default())
    }
}

/// Split residual text into delivery turns. Offline (narrative) mode sends
/// the whole text as one message. Otherwise: cut after the next terminal
/// punctuation mark; failing that, at `cut_len` characters when the
/// remainder runs longer; failing that, take the remainder whole.
/// Concatenating the turns always reproduces the input exactly.
pub fn split_turns(text: &str, policy: &PacingPolicy, offline: bool) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }
    if offline {
        return vec![text.to_string()];
    }

    let mut turns = Vec::new();
    let mut rest = text;
    while !rest.is_empty() {
        let cut = next_cut(rest, policy);
        let (turn, remainder) = rest.split_at(cut);
        turns.push(turn.to_string());
        rest = remainder;
    }
    turns
}

fn next_cut(rest: &str, policy: &PacingPolicy) -> usize {
    let mut bound_byte = None;
    let mut chars = 0usize;

    for (byte_idx, ch) in rest.char_indices() {
        if policy.is_terminal(ch) {
            return byte_idx + ch.len_utf8();
        }
        if chars == policy.cut_len {
            bound_byte = bound_byte.or(Some(byte_idx));
        }
        chars += 1;
    }

    if chars > policy.cut_len {
        bound_byte.unwrap_or(rest.len())
    } else {
        rest.len()
    }
}

/// `base + jitter + min(len * per_char, cap)`, all in milliseconds. The
/// jitter is passed in so the function stays deterministic for tests.
pub fn turn_delay(policy: &PacingPolicy, turn: &str, jitter_ms: u64) -> Duration {
    let typing = (turn.chars().count() as u64)
        .saturating_mul(policy.per_char_ms)
        .min(policy.typing_cap_ms);
    Duration::from_millis(policy.base_delay_ms + jitter_ms + typing)
}

/// Appends turns to the log at human pace, strictly in order with one sleep
/// in flight. The cancel flag is checked before each turn; turns already
/// committed stay in the log.
pub struct Pacer {
    store: Arc<ConversationStore>,
    policy: PacingPolicy,
}

impl Pacer {
    pub fn new(store: Arc<ConversationStore>, policy: PacingPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &PacingPolicy {
        &self.policy
    }

    pub async fn deliver(
        &self,
        conversation_id: &str,
        turns: Vec<String>,
        cancel: &AtomicBool,
        mut on_delivered: impl FnMut(&Message),
    ) -> EngineResult<Vec<Message>> {
        let mut delivered = Vec::with_capacity(turns.len());

        for turn in turns {
            if cancel.load(Ordering::SeqCst) {
                tracing::debug!(conversation = %conversation_id, "delivery cancelled mid-response");
                break;
            }

            let jitter = rand::thread_rng().gen_range(0..=self.policy.jitter_max_ms);
            tokio::time::sleep(turn_delay(&self.policy, &turn, jitter)).await;

            if cancel.load(Ordering::SeqCst) {
                break;
            }

            let message = self
                .store
                .append_message(conversation_id, NewMessage::text(Sender::Persona, turn))?;
            on_delivered(&message);
            delivered.push(message);
        }

        Ok(delivered)
    }
}
