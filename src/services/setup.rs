use crate::core::config::{Config, GeminiConfig, ImageMode};
use anyhow::{anyhow, Result};
use inquire::{Password, PasswordDisplayMode, Select};

const ENTER_TOKEN: &str = "Enter an image API token";
const USE_PULL: &str = "Use URL-based images (no token needed)";
const DISABLE_IMAGES: &str = "Play without illustrations";

/// Asks for whatever the configuration is missing before a session can start.
pub fn run_setup(config: &mut Config) -> Result<()> {
    let mut needs_save = false;

    match config.llm.provider.as_str() {
        "gemini" => {
            if config.gemini_api_key().is_none() {
                let key = prompt_secret("Gemini API key:")?;
                let model = config.gemini_model();
                let gemini = config.llm.gemini.get_or_insert_with(|| GeminiConfig {
                    api_key: None,
                    model,
                });
                gemini.api_key = Some(key);
                needs_save = true;
            }
        }
        "openai" => {
            if config.llm.openai.is_none() {
                return Err(anyhow!("OpenAI config missing (llm.openai.model is required)"));
            }
        }
        other => return Err(anyhow!("Unknown LLM provider: {}", other)),
    }

    if config.image.mode == ImageMode::Push && config.image_api_key().is_none() {
        let choice = Select::new(
            "No image API token configured (HF_TOKEN). How do you want to continue?",
            vec![ENTER_TOKEN, USE_PULL, DISABLE_IMAGES],
        )
        .prompt()?;

        match choice {
            ENTER_TOKEN => config.image.push.api_key = Some(prompt_secret("Image API token:")?),
            USE_PULL => config.image.mode = ImageMode::Pull,
            _ => config.image.mode = ImageMode::Disabled,
        }
        needs_save = true;
    }

    if needs_save {
        config.save()?;
        println!("Configuration saved to config.yml");
    }

    Ok(())
}

fn prompt_secret(message: &str) -> Result<String> {
    let value = Password::new(message)
        .with_display_mode(PasswordDisplayMode::Masked)
        .without_confirmation()
        .prompt()?;
    let value = value.trim().to_string();
    if value.is_empty() {
        return Err(anyhow!("An empty key was entered"));
    }
    Ok(value)
}
