use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

const CONFIG_FILE: &str = "config.yml";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_output")]
    pub output_folder: String,

    pub llm: LlmConfig,

    #[serde(default)]
    pub image: ImageConfig,

    #[serde(default)]
    pub story: StoryConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LlmConfig {
    pub provider: String, // "gemini" or "openai"
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    /// Ask the provider for JSON output when it supports it.
    #[serde(default = "default_true")]
    pub json_output: bool,
    pub gemini: Option<GeminiConfig>,
    pub openai: Option<OpenAIConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GeminiConfig {
    pub api_key: Option<String>,
    #[serde(default = "default_gemini_model")]
    pub model: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OpenAIConfig {
    pub api_key: Option<String>,
    pub model: String,
    pub base_url: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ImageMode {
    Pull,
    #[default]
    Push,
    Disabled,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ImageConfig {
    #[serde(default)]
    pub mode: ImageMode,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    /// Wraps the model's visual description. `{prompt}` is replaced.
    #[serde(default = "default_style")]
    pub style: String,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_seconds: u64,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub push: PushImageConfig,
    #[serde(default)]
    pub pull: PullImageConfig,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            mode: ImageMode::default(),
            width: default_width(),
            height: default_height(),
            style: default_style(),
            retry_attempts: default_retry_attempts(),
            retry_backoff_seconds: default_retry_backoff(),
            timeout_seconds: default_timeout(),
            push: PushImageConfig::default(),
            pull: PullImageConfig::default(),
        }
    }
}

impl ImageConfig {
    pub fn styled_prompt(&self, prompt: &str) -> String {
        if self.style.contains("{prompt}") {
            self.style.replace("{prompt}", prompt)
        } else {
            format!("{}, {}", self.style, prompt)
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PushImageConfig {
    pub api_key: Option<String>,
    #[serde(default = "default_push_url")]
    pub url: String,
}

impl Default for PushImageConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            url: default_push_url(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PullImageConfig {
    #[serde(default = "default_pull_url")]
    pub base_url: String,
}

impl Default for PullImageConfig {
    fn default() -> Self {
        Self {
            base_url: default_pull_url(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StoryConfig {
    #[serde(default = "default_title")]
    pub title: String,
    #[serde(default = "default_welcome")]
    pub welcome: String,
    #[serde(default = "default_system_instruction")]
    pub system_instruction: String,
    #[serde(default = "default_action_label")]
    pub action_label: String,
}

impl Default for StoryConfig {
    fn default() -> Self {
        Self {
            title: default_title(),
            welcome: default_welcome(),
            system_instruction: default_system_instruction(),
            action_label: default_action_label(),
        }
    }
}

fn default_output() -> String {
    "output".to_string()
}
fn default_true() -> bool {
    true
}
fn default_temperature() -> f32 {
    1.0
}
fn default_top_p() -> f32 {
    0.95
}
fn default_gemini_model() -> String {
    "gemini-3-flash-preview".to_string()
}
fn default_width() -> u32 {
    1024
}
fn default_height() -> u32 {
    768
}
fn default_style() -> String {
    "Cinematic 1930s pulp adventure style, gritty atmosphere, {prompt}, highly detailed, oil painting texture, dramatic lighting".to_string()
}
fn default_retry_attempts() -> u32 {
    5
}
fn default_retry_backoff() -> u64 {
    8
}
fn default_timeout() -> u64 {
    60
}
fn default_push_url() -> String {
    "https://api-inference.huggingface.co/models/black-forest-labs/FLUX.1-schnell".to_string()
}
fn default_pull_url() -> String {
    "https://image.pollinations.ai/prompt/".to_string()
}
fn default_title() -> String {
    "Pulp Cthulhu: Crónicas de 1934".to_string()
}
fn default_welcome() -> String {
    "¡Bienvenido, aventurero! El motor de tu hidroavión tose humo negro sobre la selva. \
     El destino te espera. ¿Quién eres y qué haces primero?"
        .to_string()
}
fn default_system_instruction() -> String {
    "Eres un narrador de rol experto en Pulp Cthulhu.\n\
     Responde SIEMPRE en JSON con esta estructura exacta:\n\
     {\n\
     \x20   \"historia\": \"Escribe aquí la narración literaria usando Markdown.\",\n\
     \x20   \"imagen_prompt\": \"Descripción visual detallada en INGLÉS para la imagen.\"\n\
     }"
    .to_string()
}
fn default_action_label() -> String {
    "Acción del jugador".to_string()
}

/// Configured secret, or the environment variable when the file leaves it empty.
fn resolve_secret(configured: Option<String>, env_value: Option<String>) -> Option<String> {
    configured
        .filter(|v| !v.trim().is_empty())
        .or_else(|| env_value.filter(|v| !v.trim().is_empty()))
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = Path::new(CONFIG_FILE);
        if !path.exists() {
            anyhow::bail!("config.yml not found. Please create one.");
        }
        Self::load_from(path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Config = serde_yaml_ng::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(config)
    }

    // Environment fallbacks are resolved on read and never stored, so
    // `save` only writes keys that were in the file or typed in setup.

    pub fn gemini_api_key(&self) -> Option<String> {
        let configured = self.llm.gemini.as_ref().and_then(|g| g.api_key.clone());
        resolve_secret(configured, std::env::var("GOOGLE_API_KEY").ok())
    }

    pub fn gemini_model(&self) -> String {
        self.llm
            .gemini
            .as_ref()
            .map(|g| g.model.clone())
            .unwrap_or_else(default_gemini_model)
    }

    pub fn openai_api_key(&self) -> Option<String> {
        let configured = self.llm.openai.as_ref().and_then(|o| o.api_key.clone());
        resolve_secret(configured, std::env::var("OPENAI_API_KEY").ok())
    }

    pub fn image_api_key(&self) -> Option<String> {
        resolve_secret(self.image.push.api_key.clone(), std::env::var("HF_TOKEN").ok())
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(Path::new(CONFIG_FILE))
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let content = serde_yaml_ng::to_string(self)?;
        fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    pub fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(&self.output_folder)?;
        Ok(())
    }
}
