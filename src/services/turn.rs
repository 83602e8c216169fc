//! One conversational turn: user action in, narrator reply (and maybe an
//! illustration) out.
//!
//! ```text
//! AwaitingInput -> UserSubmitted -> Generating -> Extracted -> Illustrating -> TurnComplete
//!                                             \-> GenerationFailed -> AwaitingInput
//! ```
//!
//! A failed generation leaves the history with the user's turn appended and
//! no narrator turn. Illustration failures never undo the narrative.

use crate::core::config::StoryConfig;
use crate::core::history::ConversationHistory;
use crate::core::reply::{extract_reply, ExtractionStep, StructuredReply};
use crate::services::image::{Illustration, Illustrator};
use crate::services::llm::{GenerationRequest, LlmClient};
use log::{info, warn};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    AwaitingInput,
    UserSubmitted,
    Generating,
    Extracted,
    GenerationFailed,
    Illustrating,
    TurnComplete,
}

#[derive(Debug, Error)]
pub enum TurnError {
    #[error("Action is empty")]
    EmptyAction,

    #[error("The narrator could not answer: {reason}")]
    Suppressed { reason: String },

    #[error("Technical error: {0:#}")]
    Transport(#[from] anyhow::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IllustrationOutcome {
    /// No image prompt in the reply, or illustrations are disabled.
    NotRequested,
    Ready(Illustration),
    Unavailable(String),
}

#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub reply: StructuredReply,
    pub step: ExtractionStep,
    pub illustration: IllustrationOutcome,
}

/// Progress hooks for whoever is rendering the turn.
pub trait TurnEvents {
    fn on_state(&mut self, _state: TurnState) {}

    /// Called as soon as the reply is known, before any image is requested.
    fn on_narrative(&mut self, _reply: &StructuredReply) {}
}

pub struct NoopEvents;

impl TurnEvents for NoopEvents {}

pub struct TurnProcessor {
    llm: Box<dyn LlmClient>,
    illustrator: Option<Box<dyn Illustrator>>,
    story: StoryConfig,
}

impl TurnProcessor {
    pub fn new(
        llm: Box<dyn LlmClient>,
        illustrator: Option<Box<dyn Illustrator>>,
        story: StoryConfig,
    ) -> Self {
        Self {
            llm,
            illustrator,
            story,
        }
    }

    pub fn story(&self) -> &StoryConfig {
        &self.story
    }

    pub async fn process_turn(
        &self,
        history: &mut ConversationHistory,
        action: &str,
        events: &mut dyn TurnEvents,
    ) -> Result<TurnOutcome, TurnError> {
        let action = action.trim();
        if action.is_empty() {
            return Err(TurnError::EmptyAction);
        }

        history.push_user(action);
        events.on_state(TurnState::UserSubmitted);

        let result = self.complete_turn(history, action, events).await;
        if let Err(e) = &result {
            warn!("Turn abandoned: {}", e);
            events.on_state(TurnState::GenerationFailed);
            events.on_state(TurnState::AwaitingInput);
        }
        result
    }

    async fn complete_turn(
        &self,
        history: &mut ConversationHistory,
        action: &str,
        events: &mut dyn TurnEvents,
    ) -> Result<TurnOutcome, TurnError> {
        let request = GenerationRequest {
            history: history.sanitized(),
            system_instruction: self.story.system_instruction.clone(),
            prompt: format!(
                "{}\n\n{}: {}",
                self.story.system_instruction, self.story.action_label, action
            ),
        };

        events.on_state(TurnState::Generating);
        let generation = self.llm.generate(&request).await?;
        let raw_text = generation
            .first_text()
            .map_err(|reason| TurnError::Suppressed { reason })?;

        let extraction = extract_reply(raw_text);
        if extraction.reply.narrative.trim().is_empty() {
            return Err(TurnError::Suppressed {
                reason: "empty narrative".to_string(),
            });
        }
        let reply = extraction.reply;
        events.on_state(TurnState::Extracted);
        events.on_narrative(&reply);

        let illustration = match (&reply.image_prompt, &self.illustrator) {
            (Some(prompt), Some(illustrator)) => {
                events.on_state(TurnState::Illustrating);
                match illustrator.illustrate(prompt).await {
                    Ok(illustration) => IllustrationOutcome::Ready(illustration),
                    Err(e) => {
                        warn!("Illustration unavailable: {:#}", e);
                        IllustrationOutcome::Unavailable(format!("{:#}", e))
                    }
                }
            }
            _ => IllustrationOutcome::NotRequested,
        };

        let image = match &illustration {
            IllustrationOutcome::Ready(i) => Some(i.reference.clone()),
            _ => None,
        };
        history.push_narrator(&reply, image)?;
        info!("Turn complete ({} turns in history)", history.len());
        events.on_state(TurnState::TurnComplete);

        Ok(TurnOutcome {
            reply,
            step: extraction.step,
            illustration,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::history::{ImageReference, Role};
    use crate::services::llm::{Candidate, Generation};
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    #[derive(Debug)]
    enum Scripted {
        Text(&'static str),
        NoCandidates,
        EmptyCandidate(&'static str),
        Error,
    }

    #[derive(Debug)]
    struct MockLlmClient {
        script: Scripted,
        call_count: Arc<Mutex<usize>>,
        requests: Arc<Mutex<Vec<GenerationRequest>>>,
    }

    impl MockLlmClient {
        fn new(script: Scripted) -> Self {
            Self {
                script,
                call_count: Arc::new(Mutex::new(0)),
                requests: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    #[async_trait]
    impl LlmClient for MockLlmClient {
        async fn generate(&self, request: &GenerationRequest) -> Result<Generation> {
            *self.call_count.lock().unwrap() += 1;
            self.requests.lock().unwrap().push(request.clone());

            match &self.script {
                Scripted::Text(text) => Ok(Generation {
                    candidates: vec![Candidate {
                        segments: vec![text.to_string()],
                        finish_reason: Some("STOP".to_string()),
                    }],
                    block_reason: None,
                }),
                Scripted::NoCandidates => Ok(Generation::default()),
                Scripted::EmptyCandidate(reason) => Ok(Generation {
                    candidates: vec![Candidate {
                        segments: vec![],
                        finish_reason: Some(reason.to_string()),
                    }],
                    block_reason: None,
                }),
                Scripted::Error => Err(anyhow!("connection refused")),
            }
        }
    }

    struct MockIllustrator {
        fail: bool,
        calls: Arc<Mutex<Vec<String>>>,
    }

    impl MockIllustrator {
        fn new(fail: bool) -> Self {
            Self {
                fail,
                calls: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    #[async_trait]
    impl Illustrator for MockIllustrator {
        async fn illustrate(&self, prompt: &str) -> Result<Illustration> {
            self.calls.lock().unwrap().push(prompt.to_string());
            if self.fail {
                return Err(anyhow!("Image generator still unavailable after 5 attempts"));
            }
            Ok(Illustration {
                reference: ImageReference::Bytes(vec![1, 2, 3]),
                attempts: 1,
            })
        }
    }

    #[derive(Default)]
    struct RecordingEvents {
        states: Vec<TurnState>,
        narratives: Vec<String>,
    }

    impl TurnEvents for RecordingEvents {
        fn on_state(&mut self, state: TurnState) {
            self.states.push(state);
        }

        fn on_narrative(&mut self, reply: &StructuredReply) {
            self.narratives.push(reply.narrative.clone());
        }
    }

    fn story() -> StoryConfig {
        StoryConfig {
            system_instruction: "Responde en JSON.".to_string(),
            action_label: "Acción del jugador".to_string(),
            ..StoryConfig::default()
        }
    }

    fn processor(llm: MockLlmClient, illustrator: Option<MockIllustrator>) -> TurnProcessor {
        TurnProcessor::new(
            Box::new(llm),
            illustrator.map(|i| Box::new(i) as Box<dyn Illustrator>),
            story(),
        )
    }

    #[tokio::test]
    async fn test_full_turn_with_illustration() -> Result<()> {
        let llm = MockLlmClient::new(Scripted::Text(
            "Here you go:\n```json\n{\"historia\": \"A storm rises.\", \"imagen_prompt\": \"stormy sea\"}\n```\nHope that helps!",
        ));
        let illustrator = MockIllustrator::new(false);
        let image_calls = illustrator.calls.clone();
        let processor = processor(llm, Some(illustrator));

        let mut history = ConversationHistory::new("Welcome.");
        let mut events = RecordingEvents::default();
        let outcome = processor.process_turn(&mut history, "  Sail on.  ", &mut events).await?;

        assert_eq!(outcome.reply.narrative, "A storm rises.");
        assert_eq!(outcome.step, ExtractionStep::Bracketed);
        assert!(matches!(outcome.illustration, IllustrationOutcome::Ready(_)));
        assert_eq!(*image_calls.lock().unwrap(), vec!["stormy sea".to_string()]);

        assert_eq!(history.len(), 3);
        assert_eq!(history.turns()[1].raw_content, "Sail on.");
        let narrator = history.last().unwrap();
        assert_eq!(narrator.role, Role::Narrator);
        assert_eq!(narrator.image, Some(ImageReference::Bytes(vec![1, 2, 3])));
        assert_eq!(
            StructuredReply::parse(&narrator.raw_content),
            Some(outcome.reply.clone())
        );

        assert_eq!(
            events.states,
            vec![
                TurnState::UserSubmitted,
                TurnState::Generating,
                TurnState::Extracted,
                TurnState::Illustrating,
                TurnState::TurnComplete,
            ]
        );
        assert_eq!(events.narratives, vec!["A storm rises.".to_string()]);
        Ok(())
    }

    #[tokio::test]
    async fn test_request_uses_sanitized_history() -> Result<()> {
        let llm = MockLlmClient::new(Scripted::Text(r#"{"historia": "Next."}"#));
        let requests = llm.requests.clone();
        let processor = processor(llm, None);

        let mut history = ConversationHistory::new("Welcome.");
        history.push_user("First.");
        history.push_narrator(
            &StructuredReply {
                narrative: "You wait.".to_string(),
                image_prompt: Some("waiting".to_string()),
            },
            None,
        )?;

        processor.process_turn(&mut history, "Second.", &mut NoopEvents).await?;

        let request = requests.lock().unwrap()[0].clone();
        let texts: Vec<&str> = request.history.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["Welcome.", "First.", "You wait."]);
        assert_eq!(request.system_instruction, "Responde en JSON.");
        assert_eq!(request.prompt, "Responde en JSON.\n\nAcción del jugador: Second.");
        Ok(())
    }

    #[tokio::test]
    async fn test_plain_prose_reply_completes_without_image() -> Result<()> {
        let llm = MockLlmClient::new(Scripted::Text("The hero draws his sword."));
        let illustrator = MockIllustrator::new(false);
        let image_calls = illustrator.calls.clone();
        let processor = processor(llm, Some(illustrator));

        let mut history = ConversationHistory::new("Welcome.");
        let outcome = processor.process_turn(&mut history, "Fight!", &mut NoopEvents).await?;

        assert_eq!(outcome.reply.narrative, "The hero draws his sword.");
        assert_eq!(outcome.illustration, IllustrationOutcome::NotRequested);
        assert!(image_calls.lock().unwrap().is_empty());
        assert_eq!(history.len(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_reply_without_image_prompt_skips_illustration() -> Result<()> {
        let llm = MockLlmClient::new(Scripted::Text(r#"{"historia": "Quiet night."}"#));
        let illustrator = MockIllustrator::new(false);
        let image_calls = illustrator.calls.clone();
        let processor = processor(llm, Some(illustrator));

        let mut history = ConversationHistory::new("Welcome.");
        let mut events = RecordingEvents::default();
        let outcome = processor.process_turn(&mut history, "Sleep.", &mut events).await?;

        assert_eq!(outcome.reply.narrative, "Quiet night.");
        assert_eq!(outcome.illustration, IllustrationOutcome::NotRequested);
        assert!(image_calls.lock().unwrap().is_empty());
        assert!(!events.states.contains(&TurnState::Illustrating));
        Ok(())
    }

    #[tokio::test]
    async fn test_image_failure_keeps_narrative() -> Result<()> {
        let llm = MockLlmClient::new(Scripted::Text(
            r#"{"historia": "The idol glows.", "imagen_prompt": "glowing idol"}"#,
        ));
        let processor = processor(llm, Some(MockIllustrator::new(true)));

        let mut history = ConversationHistory::new("Welcome.");
        let outcome = processor.process_turn(&mut history, "Touch it.", &mut NoopEvents).await?;

        assert_eq!(outcome.reply.narrative, "The idol glows.");
        assert!(matches!(outcome.illustration, IllustrationOutcome::Unavailable(_)));
        assert_eq!(history.len(), 3);
        assert!(history.last().unwrap().image.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_no_candidates_leaves_only_user_turn() {
        let llm = MockLlmClient::new(Scripted::NoCandidates);
        let processor = processor(llm, Some(MockIllustrator::new(false)));

        let mut history = ConversationHistory::new("Welcome.");
        let before = history.len();
        let mut events = RecordingEvents::default();
        let err = processor
            .process_turn(&mut history, "Jump.", &mut events)
            .await
            .unwrap_err();

        assert!(matches!(err, TurnError::Suppressed { .. }));
        assert_eq!(history.len(), before + 1);
        assert_eq!(history.last().unwrap().role, Role::User);
        assert_eq!(
            events.states,
            vec![
                TurnState::UserSubmitted,
                TurnState::Generating,
                TurnState::GenerationFailed,
                TurnState::AwaitingInput,
            ]
        );
    }

    #[tokio::test]
    async fn test_safety_stop_is_suppression() {
        let llm = MockLlmClient::new(Scripted::EmptyCandidate("SAFETY"));
        let processor = processor(llm, None);

        let mut history = ConversationHistory::new("Welcome.");
        let err = processor
            .process_turn(&mut history, "Jump.", &mut NoopEvents)
            .await
            .unwrap_err();

        match err {
            TurnError::Suppressed { reason } => assert!(reason.contains("SAFETY")),
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(history.len(), 2);
    }

    #[tokio::test]
    async fn test_transport_error_is_contained() {
        let llm = MockLlmClient::new(Scripted::Error);
        let processor = processor(llm, None);

        let mut history = ConversationHistory::new("Welcome.");
        let err = processor
            .process_turn(&mut history, "Jump.", &mut NoopEvents)
            .await
            .unwrap_err();

        assert!(matches!(err, TurnError::Transport(_)));
        assert!(err.to_string().contains("connection refused"));
        assert_eq!(history.len(), 2);
    }

    #[tokio::test]
    async fn test_retry_after_failure_is_clean() -> Result<()> {
        let failing = processor(MockLlmClient::new(Scripted::NoCandidates), None);
        let working = processor(MockLlmClient::new(Scripted::Text(r#"{"historia": "Better."}"#)), None);

        let mut history = ConversationHistory::new("Welcome.");
        assert!(failing.process_turn(&mut history, "Try.", &mut NoopEvents).await.is_err());
        working.process_turn(&mut history, "Try again.", &mut NoopEvents).await?;

        let roles: Vec<Role> = history.turns().iter().map(|t| t.role).collect();
        assert_eq!(roles, vec![Role::Narrator, Role::User, Role::User, Role::Narrator]);
        Ok(())
    }

    #[tokio::test]
    async fn test_empty_action_is_rejected() {
        let llm = MockLlmClient::new(Scripted::Text("unused"));
        let calls = llm.call_count.clone();
        let processor = processor(llm, None);

        let mut history = ConversationHistory::new("Welcome.");
        let err = processor
            .process_turn(&mut history, "   ", &mut NoopEvents)
            .await
            .unwrap_err();

        assert!(matches!(err, TurnError::EmptyAction));
        assert_eq!(history.len(), 1);
        assert_eq!(*calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_whitespace_reply_is_suppression() {
        let llm = MockLlmClient::new(Scripted::Text("   \n  "));
        let processor = processor(llm, None);

        let mut history = ConversationHistory::new("Welcome.");
        let err = processor
            .process_turn(&mut history, "Speak.", &mut NoopEvents)
            .await
            .unwrap_err();

        assert!(matches!(err, TurnError::Suppressed { .. }));
        assert_eq!(history.len(), 2);
    }
}
