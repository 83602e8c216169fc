use crate::core::reply::StructuredReply;
use anyhow::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Narrator,
}

/// Where a turn's illustration comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageReference {
    /// Pull mode: the image is resolved when the URL is fetched.
    Remote { prompt: String, url: String },
    /// Push mode: image bytes fetched while the turn was created.
    Bytes(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationTurn {
    pub role: Role,
    pub raw_content: String,
    pub image: Option<ImageReference>,
}

impl ConversationTurn {
    /// Narrative text for display, recomputed from the raw content.
    pub fn rendered_narrative(&self) -> String {
        match self.role {
            Role::Narrator => StructuredReply::parse(&self.raw_content)
                .map(|reply| reply.narrative)
                .unwrap_or_else(|| self.raw_content.clone()),
            Role::User => self.raw_content.clone(),
        }
    }
}

/// Plain role-tagged text handed to the text-generation collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: Role,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct ConversationHistory {
    turns: Vec<ConversationTurn>,
}

impl ConversationHistory {
    /// Starts a session with the narrator's welcome message.
    pub fn new(welcome: &str) -> Self {
        Self {
            turns: vec![ConversationTurn {
                role: Role::Narrator,
                raw_content: welcome.to_string(),
                image: None,
            }],
        }
    }

    pub fn turns(&self) -> &[ConversationTurn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn last(&self) -> Option<&ConversationTurn> {
        self.turns.last()
    }

    pub fn push_user(&mut self, action: &str) {
        self.turns.push(ConversationTurn {
            role: Role::User,
            raw_content: action.to_string(),
            image: None,
        });
    }

    /// Records a narrator reply. The reply is stored serialized so later
    /// turns can recover the narrative from it.
    pub fn push_narrator(
        &mut self,
        reply: &StructuredReply,
        image: Option<ImageReference>,
    ) -> Result<()> {
        let raw_content = serde_json::to_string(reply)?;
        self.turns.push(ConversationTurn {
            role: Role::Narrator,
            raw_content,
            image,
        });
        Ok(())
    }

    /// History as the text model should see it: structured narrator turns
    /// reduced to their narrative, and the in-progress last turn dropped.
    pub fn sanitized(&self) -> Vec<ChatMessage> {
        let Some((_, previous)) = self.turns.split_last() else {
            return Vec::new();
        };

        previous
            .iter()
            .map(|turn| {
                let text = match turn.role {
                    Role::Narrator => StructuredReply::parse(&turn.raw_content)
                        .map(|reply| reply.narrative)
                        .unwrap_or_else(|| turn.raw_content.clone()),
                    Role::User => turn.raw_content.clone(),
                };
                ChatMessage {
                    role: turn.role,
                    text,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(narrative: &str, prompt: Option<&str>) -> StructuredReply {
        StructuredReply {
            narrative: narrative.to_string(),
            image_prompt: prompt.map(str::to_string),
        }
    }

    #[test]
    fn test_new_history_starts_with_plain_welcome() {
        let history = ConversationHistory::new("Bienvenido, aventurero.");
        assert_eq!(history.len(), 1);
        let first = &history.turns()[0];
        assert_eq!(first.role, Role::Narrator);
        assert_eq!(first.raw_content, "Bienvenido, aventurero.");
        assert!(StructuredReply::parse(&first.raw_content).is_none());
    }

    #[test]
    fn test_sanitized_excludes_in_progress_turn() {
        let mut history = ConversationHistory::new("Welcome.");
        history.push_user("I look around.");

        let sanitized = history.sanitized();
        assert_eq!(
            sanitized,
            vec![ChatMessage {
                role: Role::Narrator,
                text: "Welcome.".to_string()
            }]
        );
    }

    #[test]
    fn test_sanitized_strips_structured_markup() -> Result<()> {
        let mut history = ConversationHistory::new("Welcome.");
        history.push_user("Open the crate.");
        history.push_narrator(&reply("Inside, a *statue*.", Some("jade idol")), None)?;
        history.push_user("Take it.");

        let sanitized = history.sanitized();
        assert_eq!(sanitized.len(), 3);
        assert_eq!(sanitized[2].role, Role::Narrator);
        assert_eq!(sanitized[2].text, "Inside, a *statue*.");
        for message in &sanitized {
            assert!(!message.text.contains("historia"));
            assert!(!message.text.contains("imagen_prompt"));
        }
        Ok(())
    }

    #[test]
    fn test_sanitized_keeps_user_text_verbatim() {
        let mut history = ConversationHistory::new("Welcome.");
        history.push_user(r#"I shout {"historia": "nope"}"#);
        history.push_user("again");

        let sanitized = history.sanitized();
        assert_eq!(sanitized[1].text, r#"I shout {"historia": "nope"}"#);
    }

    #[test]
    fn test_sanitize_is_idempotent_on_plain_turns() -> Result<()> {
        let mut history = ConversationHistory::new("Welcome.");
        history.push_user("Walk north.");
        history.push_narrator(&reply("The road ends.", None), None)?;
        history.push_user("Turn back.");

        let once = history.sanitized();

        // Rebuild a history from the sanitized output (plus a fresh in-progress turn).
        let mut rebuilt = ConversationHistory::new(&once[0].text);
        for message in &once[1..] {
            match message.role {
                Role::User => rebuilt.push_user(&message.text),
                Role::Narrator => rebuilt.turns.push(ConversationTurn {
                    role: Role::Narrator,
                    raw_content: message.text.clone(),
                    image: None,
                }),
            }
        }
        rebuilt.push_user("Turn back.");

        assert_eq!(rebuilt.sanitized(), once);
        Ok(())
    }

    #[test]
    fn test_rendered_narrative() -> Result<()> {
        let mut history = ConversationHistory::new("Welcome.");
        history.push_user("Run!");
        history.push_narrator(&reply("You escape.", Some("escape")), None)?;

        let rendered: Vec<String> = history
            .turns()
            .iter()
            .map(ConversationTurn::rendered_narrative)
            .collect();
        assert_eq!(rendered, vec!["Welcome.", "Run!", "You escape."]);
        Ok(())
    }
}
