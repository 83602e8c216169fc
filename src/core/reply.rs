use log::debug;
use serde::{Deserialize, Serialize};

/// Narrator output in the `{historia, imagen_prompt}` shape the system
/// instruction asks the model for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuredReply {
    #[serde(rename = "historia", alias = "narrative")]
    pub narrative: String,

    #[serde(
        rename = "imagen_prompt",
        alias = "image_prompt",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub image_prompt: Option<String>,
}

impl StructuredReply {
    pub fn plain(text: &str) -> Self {
        Self {
            narrative: text.to_string(),
            image_prompt: None,
        }
    }

    /// Parses `text` as JSON and keeps the result only if it carries a
    /// non-blank narrative. Blank image prompts collapse to `None`.
    fn from_json(text: &str) -> Option<Self> {
        let mut reply: StructuredReply = serde_json::from_str(text).ok()?;
        if reply.narrative.trim().is_empty() {
            return None;
        }
        if reply
            .image_prompt
            .as_deref()
            .is_some_and(|p| p.trim().is_empty())
        {
            reply.image_prompt = None;
        }
        Some(reply)
    }

    /// Structured steps of the fallback chain only. Used when deciding
    /// whether a stored narrator turn holds a reply or plain text.
    pub fn parse(text: &str) -> Option<Self> {
        parse_structured(text).map(|(reply, _)| reply)
    }
}

/// Which link of the fallback chain produced the reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionStep {
    Direct,
    Fenced,
    Bracketed,
    PlainText,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extraction {
    pub reply: StructuredReply,
    pub step: ExtractionStep,
}

/// Recovers a `StructuredReply` from whatever the text model returned.
/// Never fails: unstructured output becomes the narrative verbatim.
pub fn extract_reply(raw: &str) -> Extraction {
    let (reply, step) = parse_structured(raw)
        .unwrap_or_else(|| (StructuredReply::plain(raw.trim()), ExtractionStep::PlainText));
    debug!("Reply extracted via {:?}", step);
    Extraction { reply, step }
}

fn parse_structured(raw: &str) -> Option<(StructuredReply, ExtractionStep)> {
    parse_direct(raw)
        .map(|r| (r, ExtractionStep::Direct))
        .or_else(|| parse_fenced(raw).map(|r| (r, ExtractionStep::Fenced)))
        .or_else(|| parse_bracketed(raw).map(|r| (r, ExtractionStep::Bracketed)))
}

fn parse_direct(raw: &str) -> Option<StructuredReply> {
    StructuredReply::from_json(raw.trim())
}

fn parse_fenced(raw: &str) -> Option<StructuredReply> {
    let inner = strip_code_blocks(raw)?;
    StructuredReply::from_json(inner)
}

fn parse_bracketed(raw: &str) -> Option<StructuredReply> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end <= start {
        return None;
    }
    StructuredReply::from_json(&raw[start..=end])
}

/// Strips a surrounding triple-backtick fence, including an optional
/// language tag on the opening line. Returns `None` if `s` is not fenced.
pub fn strip_code_blocks(s: &str) -> Option<&str> {
    let s = s.trim();
    let rest = s.strip_prefix("```")?;
    let body = match rest.find('\n') {
        Some(pos) => &rest[pos + 1..],
        // Single line fence, e.g. ```{"historia": "..."}```
        None => rest.trim_start_matches(|c: char| c.is_ascii_alphanumeric()),
    };
    let body = body.trim_end();
    Some(body.strip_suffix("```").unwrap_or(body).trim())
}
