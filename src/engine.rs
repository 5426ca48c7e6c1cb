use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};

use flume::Sender;
use rust_decimal::Decimal;
use tokio::sync::Mutex as AsyncMutex;

use crate::config::EngineConfig;
use crate::context::{ContextAssembler, WorldSnapshot};
use crate::directive::{self, executor::DirectiveExecutor};
use crate::error::{EngineError, EngineResult};
use crate::llm::{ChatMessage, ChatTransport};
use crate::pacing::{split_turns, Pacer, PacingPolicy};
use crate::store::{CardKind, ConversationStore, Message, NewMessage, Sender as MsgSender};
use crate::summarizer::MemorySummarizer;

/// Fire-and-forget notification payload for the UI layer.
#[derive(Debug, Clone)]
pub struct Notification {
    pub title: String,
    pub body: String,
    pub icon: Option<String>,
    pub target_id: String,
}

#[derive(Debug, Clone)]
pub enum EngineEvent {
    MessageAppended {
        conversation_id: String,
        message: Message,
    },
    Notification(Notification),
    TransportFailed {
        conversation_id: String,
        detail: String,
    },
}

/// The directive-driven conversation engine: context assembly, generation,
/// directive execution, paced delivery and rolling summarization around one
/// shared conversation store.
///
/// At most one pipeline runs per conversation at a time. Foreground turns
/// queue on the per-conversation lock; the background scheduler try-locks
/// and skips instead.
pub struct Engine {
    store: Arc<ConversationStore>,
    transport: Arc<dyn ChatTransport>,
    assembler: ContextAssembler,
    executor: DirectiveExecutor,
    pacer: Pacer,
    summarizer: MemorySummarizer,
    event_tx: Sender<EngineEvent>,
    locks: StdMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    cancel_flags: StdMutex<HashMap<String, Arc<AtomicBool>>>,
    focused: RwLock<Option<String>>,
    primary: RwLock<Option<String>>,
}

impl Engine {
    pub fn new(
        config: &EngineConfig,
        store: Arc<ConversationStore>,
        transport: Arc<dyn ChatTransport>,
        event_tx: Sender<EngineEvent>,
    ) -> Self {
        let policy = PacingPolicy::from_config(&config.pacing);
        Self {
            assembler: ContextAssembler::new(config.world_setting.clone()),
            executor: DirectiveExecutor::new(store.clone()),
            pacer: Pacer::new(store.clone(), policy),
            summarizer: MemorySummarizer::new(
                store.clone(),
                transport.clone(),
                config.summary_window,
            ),
            store,
            transport,
            event_tx,
            locks: StdMutex::new(HashMap::new()),
            cancel_flags: StdMutex::new(HashMap::new()),
            focused: RwLock::new(None),
            primary: RwLock::new(None),
        }
    }

    pub fn store(&self) -> &Arc<ConversationStore> {
        &self.store
    }

    /// Mark the conversation whose view is open. Switching away (or passing
    /// `None`) cancels any in-flight delivery for the previous one; already
    /// committed turns stay in the log.
    pub fn set_focused(&self, conversation_id: Option<&str>) -> EngineResult<()> {
        let mut focused = self
            .focused
            .write()
            .map_err(|e| poisoned_lock("focus", &e))?;
        if focused.as_deref() != conversation_id {
            if let Some(previous) = focused.as_deref() {
                let flags = self
                    .cancel_flags
                    .lock()
                    .map_err(|e| poisoned_lock("cancel map", &e))?;
                if let Some(flag) = flags.get(previous) {
                    flag.store(true, Ordering::SeqCst);
                }
            }
        }
        *focused = conversation_id.map(|id| id.to_string());
        Ok(())
    }

    pub fn set_primary(&self, conversation_id: &str) -> EngineResult<()> {
        *self
            .primary
            .write()
            .map_err(|e| poisoned_lock("primary", &e))? = Some(conversation_id.to_string());
        Ok(())
    }

    pub fn primary(&self) -> EngineResult<Option<String>> {
        Ok(self
            .primary
            .read()
            .map_err(|e| poisoned_lock("primary", &e))?
            .clone())
    }

    /// Foreground turn: append the user's message, then run the pipeline.
    /// Queues behind any pipeline already in flight for this conversation.
    pub async fn run_user_turn(&self, conversation_id: &str, text: &str) -> EngineResult<()> {
        let lock = self.conversation_lock(conversation_id)?;
        let _guard = lock.lock().await;

        let message = self
            .store
            .append_message(conversation_id, NewMessage::text(MsgSender::User, text))?;
        self.emit_appended(conversation_id, &message);

        self.run_pipeline(conversation_id, None).await
    }

    /// Background turn: no user message; a synthetic instruction takes its
    /// place in the request. Fails with `Busy` instead of queuing so the
    /// scheduler can never interleave with a foreground pass.
    pub async fn run_background_turn(
        &self,
        conversation_id: &str,
        instruction: &str,
    ) -> EngineResult<()> {
        let lock = self.conversation_lock(conversation_id)?;
        let Ok(_guard) = lock.try_lock() else {
            return Err(EngineError::Busy(conversation_id.to_string()));
        };

        self.run_pipeline(conversation_id, Some(instruction)).await
    }

    /// Claim a red-packet card; credits the wallet exactly once.
    pub fn claim_redpacket(&self, message_id: &str) -> EngineResult<Option<Decimal>> {
        Ok(self.store.claim_redpacket(message_id)?)
    }

    /// On-demand summarization entry point.
    pub async fn summarize_now(&self, conversation_id: &str) -> EngineResult<()> {
        self.summarizer.summarize(conversation_id).await
    }

    async fn run_pipeline(
        &self,
        conversation_id: &str,
        synthetic_instruction: Option<&str>,
    ) -> EngineResult<()> {
        let Some(conversation) = self.store.get_conversation(conversation_id)? else {
            return Err(anyhow::anyhow!("conversation {} not found", conversation_id).into());
        };

        let history = self
            .store
            .recent_messages(conversation_id, conversation.settings.context_limit)?;
        let world = WorldSnapshot {
            wallet_balance: self.store.wallet_balance()?,
            recent_moments: self.store.recent_moments(5)?,
        };

        let mut request =
            self.assembler
                .assemble(&conversation, &history, &world, chrono::Utc::now())?;
        if let Some(instruction) = synthetic_instruction {
            request.push(ChatMessage::user(instruction));
        }

        // Registered before the generation await so a focus switch while the
        // request is in flight cancels the delivery that would follow it.
        let cancel = self.fresh_cancel_flag(conversation_id)?;

        let completion = match self.transport.generate(request).await {
            Ok(completion) => completion,
            Err(e) => {
                tracing::warn!(conversation = %conversation_id, "generation failed: {}", e);
                let notice = self.store.append_message(
                    conversation_id,
                    NewMessage::card(
                        MsgSender::Persona,
                        CardKind::Notice,
                        "Message could not be delivered. Check the connection and try again.",
                    ),
                )?;
                self.emit_appended(conversation_id, &notice);
                let _ = self.event_tx.send(EngineEvent::TransportFailed {
                    conversation_id: conversation_id.to_string(),
                    detail: e.to_string(),
                });
                return Err(e);
            }
        };

        let outcome = directive::scan(&completion);
        let report = self.executor.execute(&conversation, &outcome)?;
        for message in &report.appended {
            self.emit_appended(conversation_id, message);
        }

        let turns = split_turns(
            report.clean_text.trim(),
            self.pacer.policy(),
            conversation.settings.offline_mode,
        );

        self.pacer
            .deliver(conversation_id, turns, &cancel, |message| {
                self.emit_appended(conversation_id, message);
                self.maybe_notify(&conversation.persona_name, &conversation.persona_avatar, message);
            })
            .await?;

        // Deliver-then-summarize; never interleaved within one pipeline run.
        let Some(conversation) = self.store.get_conversation(conversation_id)? else {
            return Ok(());
        };
        self.summarizer.maybe_summarize(&conversation).await;

        Ok(())
    }

    fn conversation_lock(&self, conversation_id: &str) -> EngineResult<Arc<AsyncMutex<()>>> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|e| poisoned_lock("lock map", &e))?;
        Ok(locks
            .entry(conversation_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone())
    }

    fn fresh_cancel_flag(&self, conversation_id: &str) -> EngineResult<Arc<AtomicBool>> {
        let flag = Arc::new(AtomicBool::new(false));
        self.cancel_flags
            .lock()
            .map_err(|e| poisoned_lock("cancel map", &e))?
            .insert(conversation_id.to_string(), flag.clone());
        Ok(flag)
    }

    fn emit_appended(&self, conversation_id: &str, message: &Message) {
        let _ = self.event_tx.send(EngineEvent::MessageAppended {
            conversation_id: conversation_id.to_string(),
            message: message.clone(),
        });
    }

    fn maybe_notify(&self, persona_name: &str, avatar: &Option<String>, message: &Message) {
        // Poisoning never blocks the event path; a poisoned focus lock just
        // means nothing counts as focused.
        let focused = self
            .focused
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if focused.as_deref() == Some(message.conversation_id.as_str()) {
            return;
        }
        let _ = self.event_tx.send(EngineEvent::Notification(Notification {
            title: persona_name.to_string(),
            body: message.content.chars().take(80).collect(),
            icon: avatar.clone(),
            target_id: message.conversation_id.clone(),
        }));
    }
}

fn poisoned_lock(what: &str, e: &dyn std::fmt::Display) -> EngineError {
    EngineError::Store(anyhow::anyhow!("{} lock poisoned: {}", what, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ConversationSettings, MessageKind, MessageStatus};
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::sync::Mutex;

    struct ScriptedTransport {
        replies: Mutex<Vec<Result<String, String>>>,
    }

    impl ScriptedTransport {
        fn new(replies: Vec<Result<String, String>>) -> Self {
            Self {
                replies: Mutex::new(replies),
            }
        }
    }

    #[async_trait]
    impl ChatTransport for ScriptedTransport {
        async fn generate(&self, _messages: Vec<ChatMessage>) -> EngineResult<String> {
            let mut replies = self.replies.lock().unwrap();
            if replies.is_empty() {
                return Ok(String::new());
            }
            match replies.remove(0) {
                Ok(reply) => Ok(reply),
                Err(reason) => Err(EngineError::Transport(reason)),
            }
        }
    }

    fn build_engine(
        replies: Vec<Result<String, String>>,
    ) -> (Arc<Engine>, flume::Receiver<EngineEvent>, String) {
        let store = Arc::new(ConversationStore::in_memory().expect("store init"));
        let conversation = store
            .create_conversation("小狐", "A playful fox spirit", ConversationSettings::default())
            .expect("create");
        let (tx, rx) = flume::unbounded();
        let engine = Arc::new(Engine::new(
            &EngineConfig::default(),
            store,
            Arc::new(ScriptedTransport::new(replies)),
            tx,
        ));
        (engine, rx, conversation.id)
    }

    #[tokio::test(start_paused = true)]
    async fn user_turn_runs_full_pipeline() {
        let (engine, _rx, conversation_id) =
            build_engine(vec![Ok("[ACTION:TRANSFER:88.88]好好花。别客气！".to_string())]);
        engine
            .store()
            .wallet_credit(dec!(100.00), "seed")
            .expect("seed");

        engine
            .run_user_turn(&conversation_id, "在吗")
            .await
            .expect("turn");

        assert_eq!(
            engine.store().wallet_balance().expect("balance"),
            dec!(188.88)
        );
        let history = engine
            .store()
            .recent_messages(&conversation_id, 20)
            .expect("history");
        let contents: Vec<_> = history
            .iter()
            .map(|m| (m.kind, m.content.as_str()))
            .collect();
        assert_eq!(
            contents,
            vec![
                (MessageKind::Text, "在吗"),
                (MessageKind::Card, "Transfer"),
                (MessageKind::Text, "好好花。"),
                (MessageKind::Text, "别客气！"),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn transport_failure_leaves_inline_notice_and_aborts() {
        let (engine, rx, conversation_id) =
            build_engine(vec![Err("connection refused".to_string())]);

        let result = engine.run_user_turn(&conversation_id, "在吗").await;
        assert!(matches!(result, Err(EngineError::Transport(_))));

        let history = engine
            .store()
            .recent_messages(&conversation_id, 20)
            .expect("history");
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].subtype, Some(CardKind::Notice));

        let saw_failure_event = rx
            .drain()
            .any(|e| matches!(e, EngineEvent::TransportFailed { .. }));
        assert!(saw_failure_event);
    }

    #[tokio::test(start_paused = true)]
    async fn background_turn_is_rejected_while_foreground_holds_the_lock() {
        let (engine, _rx, conversation_id) = build_engine(vec![Ok("好。".to_string())]);

        let lock = engine.conversation_lock(&conversation_id).expect("lock");
        let guard = lock.lock().await;
        let result = engine
            .run_background_turn(&conversation_id, "say something")
            .await;
        assert!(matches!(result, Err(EngineError::Busy(_))));
        drop(guard);

        engine
            .run_background_turn(&conversation_id, "say something")
            .await
            .expect("background turn");
        let history = engine
            .store()
            .recent_messages(&conversation_id, 20)
            .expect("history");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].sender, MsgSender::Persona);
    }

    #[tokio::test(start_paused = true)]
    async fn unfocused_delivery_enqueues_notifications() {
        let (engine, rx, conversation_id) = build_engine(vec![Ok("来了。".to_string())]);
        engine.set_focused(None).expect("focus");

        engine
            .run_user_turn(&conversation_id, "在吗")
            .await
            .expect("turn");

        let notifications: Vec<_> = rx
            .drain()
            .filter_map(|e| match e {
                EngineEvent::Notification(n) => Some(n),
                _ => None,
            })
            .collect();
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].title, "小狐");
        assert_eq!(notifications[0].target_id, conversation_id);
    }

    #[tokio::test(start_paused = true)]
    async fn focused_delivery_stays_silent() {
        let (engine, rx, conversation_id) = build_engine(vec![Ok("来了。".to_string())]);
        engine.set_focused(Some(&conversation_id)).expect("focus");

        engine
            .run_user_turn(&conversation_id, "在吗")
            .await
            .expect("turn");

        let notifications = rx
            .drain()
            .filter(|e| matches!(e, EngineEvent::Notification(_)))
            .count();
        assert_eq!(notifications, 0);
    }

    struct GatedTransport {
        started: Arc<tokio::sync::Notify>,
        release: Arc<tokio::sync::Notify>,
    }

    #[async_trait]
    impl ChatTransport for GatedTransport {
        async fn generate(&self, _messages: Vec<ChatMessage>) -> EngineResult<String> {
            self.started.notify_one();
            self.release.notified().await;
            Ok("一。二。三。".to_string())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn closing_the_view_during_generation_cancels_delivery() {
        let store = Arc::new(ConversationStore::in_memory().expect("store init"));
        let conversation = store
            .create_conversation("小狐", "A playful fox spirit", ConversationSettings::default())
            .expect("create");
        let (tx, _rx) = flume::unbounded();
        let started = Arc::new(tokio::sync::Notify::new());
        let release = Arc::new(tokio::sync::Notify::new());
        let engine = Arc::new(Engine::new(
            &EngineConfig::default(),
            store,
            Arc::new(GatedTransport {
                started: started.clone(),
                release: release.clone(),
            }),
            tx,
        ));
        engine.set_focused(Some(&conversation.id)).expect("focus");

        let task = tokio::spawn({
            let engine = engine.clone();
            let id = conversation.id.clone();
            async move { engine.run_user_turn(&id, "在吗").await }
        });

        // Close the view while the generation request is still in flight.
        started.notified().await;
        engine.set_focused(None).expect("focus");
        release.notify_one();
        task.await.expect("join").expect("turn");

        let history = engine
            .store()
            .recent_messages(&conversation.id, 10)
            .expect("history");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].sender, MsgSender::User);
    }

    #[tokio::test(start_paused = true)]
    async fn offline_mode_delivers_one_message() {
        let (engine, _rx, conversation_id) = build_engine(vec![Ok(
            "夜色落下来。她收起伞，看了你很久。然后笑了。".to_string(),
        )]);
        engine
            .store()
            .update_settings(
                &conversation_id,
                &crate::store::SettingsPatch {
                    offline_mode: Some(true),
                    ..Default::default()
                },
            )
            .expect("patch");

        engine
            .run_user_turn(&conversation_id, "继续")
            .await
            .expect("turn");

        let history = engine
            .store()
            .recent_messages(&conversation_id, 20)
            .expect("history");
        // User message plus exactly one narrative reply.
        assert_eq!(history.len(), 2);
        assert!(history[1].content.contains("夜色"));
    }

    #[tokio::test(start_paused = true)]
    async fn summary_and_context_window_do_not_overlap() {
        // Summarize, then check the next assembled request: round-trip
        // property — nothing older than the summary shows up twice.
        let (engine, _rx, conversation_id) = build_engine(vec![
            Ok("好。".to_string()),
            Ok("嗯。".to_string()),
        ]);
        for idx in 0..25 {
            engine
                .store()
                .append_message(
                    &conversation_id,
                    NewMessage::text(MsgSender::User, format!("m{}", idx)),
                )
                .expect("append");
        }

        engine
            .run_user_turn(&conversation_id, "最近怎么样")
            .await
            .expect("turn");

        let conversation = engine
            .store()
            .get_conversation(&conversation_id)
            .expect("get")
            .expect("exists");
        let active = engine
            .store()
            .count_active_messages(&conversation_id)
            .expect("count");
        // The summary high-water mark plus the context window cover the log
        // with no overlap.
        assert_eq!(
            conversation.summarized_count,
            active - conversation.settings.context_limit
        );

        let window = engine
            .store()
            .recent_messages(&conversation_id, conversation.settings.context_limit)
            .expect("window");
        assert!(window
            .iter()
            .all(|m| m.seq > conversation.summarized_count as i64));
    }

    #[tokio::test(start_paused = true)]
    async fn claim_redpacket_round_trip_through_engine() {
        let (engine, _rx, conversation_id) =
            build_engine(vec![Ok("[REDPACKET:5.20:拿去]".to_string())]);

        engine
            .run_user_turn(&conversation_id, "有红包吗")
            .await
            .expect("turn");

        let history = engine
            .store()
            .recent_messages(&conversation_id, 20)
            .expect("history");
        let card = history
            .iter()
            .find(|m| m.subtype == Some(CardKind::RedPacket))
            .expect("red packet card");
        assert_eq!(card.status, MessageStatus::Normal);

        assert_eq!(
            engine.claim_redpacket(&card.id).expect("claim"),
            Some(dec!(5.20))
        );
        assert_eq!(engine.claim_redpacket(&card.id).expect("claim"), None);
        assert_eq!(
            engine.store().wallet_balance().expect("balance"),
            dec!(5.20)
        );
    }
}
