use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

/// Turn-splitting and delivery-delay knobs for the pacing simulator.
///
/// These are design constants inherited from the original behavior; they are
/// kept configurable rather than baked into the splitter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacingConfig {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_jitter_max_ms")]
    pub jitter_max_ms: u64,
    #[serde(default = "default_per_char_ms")]
    pub per_char_ms: u64,
    #[serde(default = "default_typing_cap_ms")]
    pub typing_cap_ms: u64,
    #[serde(default = "default_cut_len")]
    pub cut_len: usize,
    #[serde(default = "default_terminal_punctuation")]
    pub terminal_punctuation: String,
}

fn default_base_delay_ms() -> u64 {
    800
}

fn default_jitter_max_ms() -> u64 {
    1000
}

fn default_per_char_ms() -> u64 {
    50
}

fn default_typing_cap_ms() -> u64 {
    2000
}

fn default_cut_len() -> usize {
    20
}

fn default_terminal_punctuation() -> String {
    "。！？!?.~～".to_string()
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            jitter_max_ms: default_jitter_max_ms(),
            per_char_ms: default_per_char_ms(),
            typing_cap_ms: default_typing_cap_ms(),
            cut_len: default_cut_len(),
            terminal_punctuation: default_terminal_punctuation(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    // LLM configuration (OpenAI-compatible: Ollama, LM Studio, vLLM, OpenAI, etc.)
    #[serde(default = "default_llm_url")]
    pub llm_api_url: String,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
    #[serde(default)]
    pub llm_api_key: Option<String>,
    #[serde(default = "default_llm_timeout_secs")]
    pub llm_timeout_secs: u64,

    // Conversation defaults; per-conversation settings override these.
    #[serde(default = "default_context_limit")]
    pub context_limit: usize,
    #[serde(default = "default_summarize_every")]
    pub summarize_every: usize,
    #[serde(default = "default_summary_window")]
    pub summary_window: usize,

    // World flavor injected into every system prompt.
    #[serde(default)]
    pub world_setting: String,

    // Background activity loop. 0 disables it.
    #[serde(default = "default_background_interval_secs")]
    pub background_interval_secs: u64,
    #[serde(default = "default_moment_comment_chance")]
    pub moment_comment_chance: f64,
    #[serde(default = "default_primary_weight")]
    pub primary_weight: f64,

    #[serde(default = "default_database_path")]
    pub database_path: String,

    #[serde(default)]
    pub pacing: PacingConfig,
}

fn default_llm_url() -> String {
    "http://localhost:11434/v1".to_string()
}

fn default_llm_model() -> String {
    "llama3.2".to_string()
}

fn default_llm_timeout_secs() -> u64 {
    90
}

fn default_context_limit() -> usize {
    10
}

fn default_summarize_every() -> usize {
    20
}

fn default_summary_window() -> usize {
    50
}

fn default_background_interval_secs() -> u64 {
    0
}

fn default_moment_comment_chance() -> f64 {
    0.5
}

fn default_primary_weight() -> f64 {
    0.6
}

fn default_database_path() -> String {
    "pocketworld.db".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            llm_api_url: default_llm_url(),
            llm_model: default_llm_model(),
            llm_api_key: None,
            llm_timeout_secs: default_llm_timeout_secs(),
            context_limit: default_context_limit(),
            summarize_every: default_summarize_every(),
            summary_window: default_summary_window(),
            world_setting: String::new(),
            background_interval_secs: default_background_interval_secs(),
            moment_comment_chance: default_moment_comment_chance(),
            primary_weight: default_primary_weight(),
            database_path: default_database_path(),
            pacing: PacingConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Directory containing the executable; config and database live here.
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    pub fn config_path() -> PathBuf {
        Self::get_base_dir().join("pocketworld.toml")
    }

    /// Load config from pocketworld.toml next to the executable, falling
    /// back to environment variables when no file is present.
    pub fn load() -> Self {
        let path = Self::config_path();

        if let Ok(contents) = fs::read_to_string(&path) {
            match toml::from_str::<EngineConfig>(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {:?}", path);
                    return config;
                }
                Err(e) => {
                    tracing::error!("Failed to parse {:?}: {}", path, e);
                }
            }
        }

        tracing::warn!("No config file found, using defaults + env vars");
        Self::from_env()
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path();

        let toml_string = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&path, toml_string)
            .with_context(|| format!("Failed to write config to {:?}", path))?;

        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = env::var("LLM_API_URL") {
            config.llm_api_url = url;
        }

        if let Ok(model) = env::var("LLM_MODEL") {
            config.llm_model = model;
        }

        if let Ok(key) = env::var("LLM_API_KEY") {
            config.llm_api_key = Some(key);
        }

        if let Ok(secs) = env::var("POCKETWORLD_LLM_TIMEOUT_SECS") {
            if let Ok(value) = secs.parse() {
                config.llm_timeout_secs = value;
            }
        }

        if let Ok(interval) = env::var("POCKETWORLD_BACKGROUND_INTERVAL_SECS") {
            if let Ok(seconds) = interval.parse() {
                config.background_interval_secs = seconds;
            }
        }

        if let Ok(limit) = env::var("POCKETWORLD_CONTEXT_LIMIT") {
            if let Ok(value) = limit.parse() {
                config.context_limit = value;
            }
        }

        if let Ok(path) = env::var("POCKETWORLD_DATABASE_PATH") {
            if !path.trim().is_empty() {
                config.database_path = path;
            }
        }

        if let Ok(setting) = env::var("POCKETWORLD_WORLD_SETTING") {
            config.world_setting = setting;
        }

        config
    }
}
