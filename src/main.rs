use std::io::{BufRead, Write};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing_subscriber::EnvFilter;

use pocketworld::config::EngineConfig;
use pocketworld::engine::{Engine, EngineEvent};
use pocketworld::llm::LlmClient;
use pocketworld::scheduler::BackgroundScheduler;
use pocketworld::store::{ConversationKind, ConversationSettings, ConversationStore};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,pocketworld=debug")),
        )
        .init();

    let config = EngineConfig::load();
    let store = Arc::new(ConversationStore::new(&config.database_path)?);

    let conversation_id = match store
        .list_conversations()?
        .into_iter()
        .find(|c| c.kind == ConversationKind::Direct)
    {
        Some(conversation) => conversation.id,
        None => {
            let conversation = store.create_conversation(
                "Lin",
                "You are Lin, a warm and slightly mischievous companion who lives \
                 inside the user's phone. You text casually and care about their day.",
                ConversationSettings {
                    context_limit: config.context_limit,
                    summarize_every: config.summarize_every,
                    ..Default::default()
                },
            )?;
            tracing::info!(conversation = %conversation.id, "Created default conversation");
            conversation.id
        }
    };

    let transport = Arc::new(LlmClient::new(
        config.llm_api_url.clone(),
        config.llm_api_key.clone(),
        config.llm_model.clone(),
        Duration::from_secs(config.llm_timeout_secs),
    ));

    let (event_tx, event_rx) = flume::unbounded();
    let engine = Arc::new(Engine::new(&config, store, transport, event_tx));
    engine.set_primary(&conversation_id)?;
    engine.set_focused(Some(&conversation_id))?;

    tokio::spawn(
        BackgroundScheduler::new(
            engine.clone(),
            config.background_interval_secs,
            config.moment_comment_chance,
            config.primary_weight,
        )
        .run(),
    );

    // Print delivered messages and notifications as they happen.
    tokio::spawn(async move {
        while let Ok(event) = event_rx.recv_async().await {
            match event {
                EngineEvent::MessageAppended { message, .. } => {
                    let label = match message.sender {
                        pocketworld::store::Sender::User => "you",
                        pocketworld::store::Sender::Persona => "them",
                    };
                    println!("  {} | {}", label, message.content);
                }
                EngineEvent::Notification(n) => {
                    println!("  [notification] {}: {}", n.title, n.body);
                }
                EngineEvent::TransportFailed { detail, .. } => {
                    println!("  [offline] {}", detail);
                }
            }
        }
    });

    tracing::info!("pocketworld ready; type a message and press enter (ctrl-d to quit)");

    let stdin = std::io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next() else { break };
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        if let Err(e) = engine.run_user_turn(&conversation_id, line.trim()).await {
            tracing::warn!("turn failed: {}", e);
        }
    }

    Ok(())
}
