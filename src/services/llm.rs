use crate::core::config::Config;
use crate::core::history::{ChatMessage, Role};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::info;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// Everything the text model needs for one turn.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub history: Vec<ChatMessage>,
    pub system_instruction: String,
    pub prompt: String,
}

#[derive(Debug, Clone, Copy)]
pub struct GenerationSettings {
    pub temperature: f32,
    pub top_p: f32,
    pub json_output: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Candidate {
    pub segments: Vec<String>,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Generation {
    pub candidates: Vec<Candidate>,
    /// Set when the provider refused the prompt itself.
    pub block_reason: Option<String>,
}

impl Generation {
    /// Text of the first segment of the first candidate, or the reason
    /// nothing usable came back.
    pub fn first_text(&self) -> std::result::Result<&str, String> {
        let Some(first) = self.candidates.first() else {
            return Err(match &self.block_reason {
                Some(reason) => format!("prompt blocked ({})", reason),
                None => "no candidates returned".to_string(),
            });
        };

        match first.segments.first() {
            Some(text) if !text.trim().is_empty() => Ok(text.as_str()),
            _ => Err(format!(
                "empty candidate, finish reason: {}",
                first.finish_reason.as_deref().unwrap_or("UNKNOWN")
            )),
        }
    }
}

#[async_trait]
pub trait LlmClient: Send + Sync + Debug {
    async fn generate(&self, request: &GenerationRequest) -> Result<Generation>;
}

pub fn create_llm(config: &Config) -> Result<Box<dyn LlmClient>> {
    let settings = GenerationSettings {
        temperature: config.llm.temperature,
        top_p: config.llm.top_p,
        json_output: config.llm.json_output,
    };
    info!("Initializing LLM client for provider: {}", config.llm.provider);
    match config.llm.provider.as_str() {
        "gemini" => {
            let api_key = config
                .gemini_api_key()
                .context("Gemini API key missing (GOOGLE_API_KEY)")?;
            Ok(Box::new(GeminiClient::new(&api_key, &config.gemini_model(), settings)))
        }
        "openai" => {
            let cfg = config.llm.openai.as_ref().context("OpenAI config missing")?;
            let api_key = config.openai_api_key();
            Ok(Box::new(OpenAIClient::new(
                api_key.as_deref(),
                &cfg.model,
                cfg.base_url.as_deref(),
                settings,
            )))
        }
        _ => Err(anyhow!("Unknown LLM provider: {}", config.llm.provider)),
    }
}

// --- Gemini ---

const GEMINI_HARM_CATEGORIES: [&str; 4] = [
    "HARM_CATEGORY_HARASSMENT",
    "HARM_CATEGORY_HATE_SPEECH",
    "HARM_CATEGORY_SEXUALLY_EXPLICIT",
    "HARM_CATEGORY_DANGEROUS_CONTENT",
];

#[derive(Debug)]
struct GeminiClient {
    api_key: String,
    model: String,
    settings: GenerationSettings,
    client: reqwest::Client,
}

impl GeminiClient {
    fn new(api_key: &str, model: &str, settings: GenerationSettings) -> Self {
        Self {
            api_key: api_key.to_string(),
            model: model.to_string(),
            settings,
            client: reqwest::Client::new(),
        }
    }

    fn build_request(&self, request: &GenerationRequest) -> GeminiRequest {
        let mut contents: Vec<GeminiContent> = request
            .history
            .iter()
            .map(|message| GeminiContent {
                role: gemini_role(message.role).to_string(),
                parts: vec![GeminiPart {
                    text: message.text.clone(),
                }],
            })
            .collect();
        contents.push(GeminiContent {
            role: "user".to_string(),
            parts: vec![GeminiPart {
                text: request.prompt.clone(),
            }],
        });

        GeminiRequest {
            contents,
            system_instruction: Some(GeminiSystemInstruction {
                parts: vec![GeminiPart {
                    text: request.system_instruction.clone(),
                }],
            }),
            generation_config: GeminiGenerationConfig {
                temperature: self.settings.temperature,
                top_p: self.settings.top_p,
                response_mime_type: self
                    .settings
                    .json_output
                    .then(|| "application/json".to_string()),
            },
            safety_settings: GEMINI_HARM_CATEGORIES
                .iter()
                .map(|category| GeminiSafetySetting {
                    category: category.to_string(),
                    threshold: "BLOCK_NONE".to_string(),
                })
                .collect(),
        }
    }
}

fn gemini_role(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Narrator => "model",
    }
}

#[derive(Serialize)]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiSystemInstruction>,
    #[serde(rename = "generationConfig")]
    generation_config: GeminiGenerationConfig,
    #[serde(rename = "safetySettings")]
    safety_settings: Vec<GeminiSafetySetting>,
}

#[derive(Serialize)]
struct GeminiContent {
    role: String,
    parts: Vec<GeminiPart>,
}

#[derive(Serialize)]
struct GeminiSystemInstruction {
    parts: Vec<GeminiPart>,
}

#[derive(Serialize)]
struct GeminiPart {
    text: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    temperature: f32,
    top_p: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<String>,
}

#[derive(Serialize)]
struct GeminiSafetySetting {
    category: String,
    threshold: String,
}

#[derive(Deserialize)]
struct GeminiResponse {
    candidates: Option<Vec<GeminiCandidate>>,
    #[serde(rename = "promptFeedback")]
    prompt_feedback: Option<GeminiPromptFeedback>,
    error: Option<GeminiError>,
}

#[derive(Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContentResponse>,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct GeminiContentResponse {
    #[serde(default)]
    parts: Vec<GeminiPartResponse>,
}

#[derive(Deserialize)]
struct GeminiPartResponse {
    text: Option<String>,
}

#[derive(Deserialize)]
struct GeminiPromptFeedback {
    #[serde(rename = "blockReason")]
    block_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct GeminiError {
    message: String,
}

impl GeminiResponse {
    fn into_generation(self) -> Result<Generation> {
        if let Some(err) = self.error {
            return Err(anyhow!("Gemini API returned error: {}", err.message));
        }

        let candidates = self
            .candidates
            .unwrap_or_default()
            .into_iter()
            .map(|candidate| Candidate {
                segments: candidate
                    .content
                    .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
                    .unwrap_or_default(),
                finish_reason: candidate.finish_reason,
            })
            .collect();

        Ok(Generation {
            candidates,
            block_reason: self.prompt_feedback.and_then(|f| f.block_reason),
        })
    }
}

impl GeminiClient {
    fn endpoint(&self) -> String {
        format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent",
            self.model
        )
    }
}

#[async_trait]
impl LlmClient for GeminiClient {
    async fn generate(&self, request: &GenerationRequest) -> Result<Generation> {
        // The key travels in a header so it never shows up in request errors.
        let resp = self
            .client
            .post(self.endpoint())
            .header("x-goog-api-key", &self.api_key)
            .json(&self.build_request(request))
            .send()
            .await?;

        if !resp.status().is_success() {
            let error_text = resp.text().await?;
            return Err(anyhow!("Gemini API error: {}", error_text));
        }

        let response_text = resp.text().await?;
        let result: GeminiResponse = match serde_json::from_str(&response_text) {
            Ok(r) => r,
            Err(e) => {
                return Err(anyhow!(
                    "Failed to parse Gemini response: {}. Body: {}",
                    e,
                    response_text
                ))
            }
        };

        result.into_generation()
    }
}

// --- OpenAI ---

#[derive(Debug)]
struct OpenAIClient {
    api_key: Option<String>,
    model: String,
    base_url: String,
    settings: GenerationSettings,
    client: reqwest::Client,
}

impl OpenAIClient {
    fn new(
        api_key: Option<&str>,
        model: &str,
        base_url: Option<&str>,
        settings: GenerationSettings,
    ) -> Self {
        Self {
            api_key: api_key.map(str::to_string),
            model: model.to_string(),
            base_url: base_url
                .unwrap_or("https://api.openai.com/v1")
                .trim_end_matches('/')
                .to_string(),
            settings,
            client: reqwest::Client::new(),
        }
    }

    fn build_request(&self, request: &GenerationRequest) -> OpenAIRequest {
        let mut messages = vec![OpenAIMessage {
            role: "system".to_string(),
            content: request.system_instruction.clone(),
        }];
        messages.extend(request.history.iter().map(|message| OpenAIMessage {
            role: match message.role {
                Role::User => "user",
                Role::Narrator => "assistant",
            }
            .to_string(),
            content: message.text.clone(),
        }));
        messages.push(OpenAIMessage {
            role: "user".to_string(),
            content: request.prompt.clone(),
        });

        OpenAIRequest {
            model: self.model.clone(),
            messages,
            temperature: self.settings.temperature,
            top_p: self.settings.top_p,
            response_format: self.settings.json_output.then(|| OpenAIResponseFormat {
                kind: "json_object".to_string(),
            }),
        }
    }
}

#[derive(Serialize)]
struct OpenAIRequest {
    model: String,
    messages: Vec<OpenAIMessage>,
    temperature: f32,
    top_p: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<OpenAIResponseFormat>,
}

#[derive(Serialize)]
struct OpenAIMessage {
    role: String,
    content: String,
}

#[derive(Serialize)]
struct OpenAIResponseFormat {
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Deserialize)]
struct OpenAIResponse {
    #[serde(default)]
    choices: Vec<OpenAIChoice>,
}

#[derive(Deserialize)]
struct OpenAIChoice {
    message: Option<OpenAIMessageResponse>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct OpenAIMessageResponse {
    content: Option<String>,
}

impl OpenAIResponse {
    fn into_generation(self) -> Generation {
        Generation {
            candidates: self
                .choices
                .into_iter()
                .map(|choice| Candidate {
                    segments: choice.message.and_then(|m| m.content).into_iter().collect(),
                    finish_reason: choice.finish_reason,
                })
                .collect(),
            block_reason: None,
        }
    }
}

#[async_trait]
impl LlmClient for OpenAIClient {
    async fn generate(&self, request: &GenerationRequest) -> Result<Generation> {
        let url = format!("{}/chat/completions", self.base_url);

        let mut req = self.client.post(&url).json(&self.build_request(request));
        if let Some(key) = &self.api_key {
            req = req.header("Authorization", format!("Bearer {}", key));
        }
        let resp = req.send().await?;

        if !resp.status().is_success() {
            let error_text = resp.text().await?;
            return Err(anyhow!("OpenAI API error: {}", error_text));
        }

        let result: OpenAIResponse = resp.json().await?;
        Ok(result.into_generation())
    }
}
