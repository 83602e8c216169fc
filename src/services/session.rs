use crate::core::config::Config;
use crate::core::history::{ConversationHistory, ConversationTurn, ImageReference, Role};
use crate::core::reply::StructuredReply;
use crate::services::turn::{IllustrationOutcome, TurnEvents, TurnOutcome, TurnProcessor, TurnState};
use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};
use inquire::Text;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const QUIT_COMMAND: &str = "/quit";
const HISTORY_COMMAND: &str = "/history";

/// Interactive terminal loop. One turn runs to completion before the next
/// action is read.
pub struct StorySession {
    config: Config,
    processor: TurnProcessor,
    history: ConversationHistory,
    /// Prefix for saved images so a new session never overwrites an old one.
    session_id: String,
}

impl StorySession {
    pub fn new(config: Config, processor: TurnProcessor) -> Self {
        let history = ConversationHistory::new(&processor.story().welcome);
        let started = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        Self {
            config,
            processor,
            history,
            session_id: format!("session_{}", started),
        }
    }

    pub async fn run(&mut self) -> Result<()> {
        println!("=== {} ===\n", self.processor.story().title);
        if let Some(welcome) = self.history.last() {
            print_turn(welcome);
        }
        println!("(type {} to leave, {} to reread the story)\n", QUIT_COMMAND, HISTORY_COMMAND);

        loop {
            let input = match Text::new("Your action:").prompt() {
                Ok(input) => input,
                Err(_) => {
                    println!("Input closed, ending session.");
                    break;
                }
            };

            match input.trim() {
                "" => continue,
                QUIT_COMMAND => break,
                HISTORY_COMMAND => {
                    for turn in self.history.turns() {
                        print_turn(turn);
                    }
                    continue;
                }
                _ => {}
            }

            let mut events = ConsoleEvents::default();
            let result = self
                .processor
                .process_turn(&mut self.history, &input, &mut events)
                .await;
            events.stop_spinner();

            match result {
                Ok(outcome) => self.show_illustration(&outcome).await,
                Err(e) => println!("⚠️  {}\n", e),
            }
        }

        println!("The story pauses here.");
        Ok(())
    }

    async fn show_illustration(&self, outcome: &TurnOutcome) {
        match &outcome.illustration {
            IllustrationOutcome::NotRequested => {}
            IllustrationOutcome::Unavailable(_) => {
                println!("⌛ The illustrator is busy, but the story goes on...\n");
            }
            IllustrationOutcome::Ready(illustration) => match &illustration.reference {
                ImageReference::Remote { url, .. } => println!("🖼  {}\n", url),
                ImageReference::Bytes(bytes) => {
                    let path = image_path(&self.config.output_folder, &self.session_id, self.history.len());
                    match tokio::fs::write(&path, bytes).await {
                        Ok(()) => println!("🖼  Scene saved to {}\n", path.display()),
                        Err(e) => {
                            log::warn!("Failed to write {}: {}", path.display(), e);
                            println!("⌛ The scene could not be saved, but the story goes on...\n");
                        }
                    }
                }
            },
        }
    }
}

fn image_path(output_folder: &str, session_id: &str, turn_index: usize) -> PathBuf {
    Path::new(output_folder).join(format!("{}_turn_{:04}.png", session_id, turn_index))
}

fn print_turn(turn: &ConversationTurn) {
    match turn.role {
        Role::User => println!("> {}\n", turn.raw_content),
        Role::Narrator => {
            println!("{}\n", turn.rendered_narrative());
            if let Some(ImageReference::Remote { url, .. }) = &turn.image {
                println!("🖼  {}\n", url);
            }
        }
    }
}

/// Spinner while the collaborators are busy; prints the narrative as soon
/// as it is extracted.
#[derive(Default)]
struct ConsoleEvents {
    spinner: Option<ProgressBar>,
}

impl ConsoleEvents {
    fn start_spinner(&mut self, message: &str) {
        self.stop_spinner();
        let pb = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} {msg}") {
            pb.set_style(style);
        }
        pb.set_message(message.to_string());
        pb.enable_steady_tick(Duration::from_millis(120));
        self.spinner = Some(pb);
    }

    fn stop_spinner(&mut self) {
        if let Some(pb) = self.spinner.take() {
            pb.finish_and_clear();
        }
    }
}

impl TurnEvents for ConsoleEvents {
    fn on_state(&mut self, state: TurnState) {
        match state {
            TurnState::Generating => self.start_spinner("The Keeper is weaving reality..."),
            TurnState::Illustrating => self.start_spinner("Painting the scene..."),
            _ => self.stop_spinner(),
        }
    }

    fn on_narrative(&mut self, reply: &StructuredReply) {
        self.stop_spinner();
        println!("\n{}\n", reply.narrative);
    }
}
