use anyhow::Result;
use pulp_storyteller::core::config::Config;
use pulp_storyteller::services::image::create_illustrator;
use pulp_storyteller::services::llm::create_llm;
use pulp_storyteller::services::session::StorySession;
use pulp_storyteller::services::setup::run_setup;
use pulp_storyteller::services::turn::TurnProcessor;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    // 1. Load config (secrets may also come from the environment)
    let mut config = match Config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading config: {}", e);
            eprintln!("Please ensure 'config.yml' exists with valid LLM settings.");
            return Err(e);
        }
    };

    // 2. Ask for missing keys
    run_setup(&mut config)?;
    config.ensure_directories()?;

    // 3. Collaborators
    let llm = create_llm(&config)?;
    let illustrator = create_illustrator(&config)?;

    // 4. Play
    let processor = TurnProcessor::new(llm, illustrator, config.story.clone());
    let mut session = StorySession::new(config, processor);
    session.run().await?;

    Ok(())
}
