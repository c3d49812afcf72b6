//! Request validation and the instructions sent to the backend.

use super::error::{EngineError, Result};
use crate::types::{ChatMessage, MessageContent};
use tracing::warn;

const TURN_SEPARATOR: &str = "\n---\n";

/// Validated view of a chat request.
#[derive(Debug, Clone, PartialEq)]
pub struct Conversation {
    /// Text of the last user message.
    pub user_prompt: String,
    /// First system message, if any.
    pub system_prompt: Option<String>,
    /// Earlier non-system turns as (role, text), oldest first.
    pub history: Vec<(String, String)>,
    /// One message, or exactly one system plus one user message.
    pub is_new: bool,
}

fn message_text(req_id: &str, message: &ChatMessage) -> String {
    match &message.content {
        None => String::new(),
        Some(MessageContent::Text(text)) => text.clone(),
        Some(MessageContent::Parts(parts)) => {
            let mut texts = Vec::new();
            for part in parts {
                match (part.kind.as_str(), &part.text) {
                    ("text", Some(text)) => texts.push(text.clone()),
                    ("image_url", _) => {
                        warn!("[{}] Ignoring image_url content part", req_id)
                    }
                    (kind, _) => warn!("[{}] Ignoring '{}' content part", req_id, kind),
                }
            }
            texts.join("\n")
        }
    }
}

pub fn validate(req_id: &str, messages: &[ChatMessage]) -> Result<Conversation> {
    if messages.is_empty() {
        return Err(EngineError::InvalidRequest(
            "'messages' array is missing or empty".to_string(),
        ));
    }
    let last_user = messages
        .iter()
        .rposition(|m| m.role == "user")
        .ok_or_else(|| EngineError::InvalidRequest("No user message found".to_string()))?;

    let user_prompt = message_text(req_id, &messages[last_user]);
    if user_prompt.trim().is_empty() {
        warn!("[{}] Last user message is empty", req_id);
    }

    let system_prompt = messages
        .iter()
        .find(|m| m.role == "system")
        .map(|m| message_text(req_id, m))
        .filter(|s| !s.trim().is_empty());

    let history = messages[..last_user]
        .iter()
        .filter(|m| m.role != "system")
        .map(|m| (m.role.clone(), message_text(req_id, m)))
        .filter(|(_, text)| !text.trim().is_empty())
        .collect();

    let is_new = messages.len() == 1
        || (messages.len() == 2 && messages[0].role == "system" && messages[1].role == "user");

    Ok(Conversation {
        user_prompt,
        system_prompt,
        history,
        is_new,
    })
}

fn role_label(role: &str) -> String {
    let mut chars = role.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

impl Conversation {
    /// The user prompt, preceded by a transcript of earlier turns when
    /// `include_history` is set.
    fn combined_user_prompt(&self, include_history: bool) -> String {
        if !include_history || self.history.is_empty() {
            return self.user_prompt.clone();
        }
        let mut turns: Vec<String> = self
            .history
            .iter()
            .map(|(role, text)| format!("{}:\n{}", role_label(role), text.trim()))
            .collect();
        turns.push(format!("User:\n{}", self.user_prompt.trim()));
        turns.join(TURN_SEPARATOR)
    }

    /// Full prompt submitted to the backend.
    pub fn backend_prompt(&self, stream: bool, marker: &str, include_history: bool) -> String {
        let mut prompt = if stream {
            stream_instructions(marker)
        } else {
            json_instructions(marker)
        };

        if let Some(system) = &self.system_prompt {
            prompt.push_str(&format!("\nSystem Instruction: {}\n", system.trim()));
        }

        let examples = if stream {
            stream_examples(marker)
        } else {
            json_examples(marker)
        };
        prompt.push_str(&examples);
        prompt.push_str(&format!(
            "\nUser Prompt: \"{}\"\n\n",
            self.combined_user_prompt(include_history)
        ));
        prompt.push_str(if stream {
            "Your Response (Streaming, within a markdown code block):\n"
        } else {
            "Your JSON Response:\n"
        });
        prompt
    }
}

fn json_instructions(marker: &str) -> String {
    format!(
        "\nIMPORTANT: Your entire response MUST be a single JSON object. Do not include any text outside of this JSON object.\n\
         The JSON object must have a single key named \"response\".\n\
         Inside the value of the \"response\" key (which is a string), you MUST put the exact marker \"{marker}\" at the very beginning of your actual answer. \
         There should be NO text before this marker within the response string.\n"
    )
}

fn json_examples(marker: &str) -> String {
    format!(
        "\nExample 1:\nUser asks: \"What is the capital of France?\"\nYour response MUST be:\n\
         {{\n  \"response\": \"{marker}The capital of France is Paris.\"\n}}\n\n\
         Example 2:\nUser asks: \"Write a python function to add two numbers\"\nYour response MUST be:\n\
         {{\n  \"response\": \"{marker}```python\\ndef add(a, b):\\n  return a + b\\n```\"\n}}\n\n\
         Now, answer the following user prompt, ensuring your output strictly adheres to the JSON format AND the start marker requirement described above:\n"
    )
}

fn stream_instructions(marker: &str) -> String {
    format!(
        "\nIMPORTANT: For this streaming request, your entire response MUST be enclosed in a single markdown code block (like ``` block ```).\n\
         Inside this code block, your actual answer text MUST start immediately after the exact marker \"{marker}\".\n\
         Start your response exactly with \"```\\n{marker}\" followed by your answer content.\n\
         Continue outputting your answer content. You SHOULD include the final closing \"```\" at the very end of your full response stream.\n"
    )
}

fn stream_examples(marker: &str) -> String {
    format!(
        "\nExample 1 (Streaming):\nUser asks: \"What is the capital of France?\"\nYour streamed response MUST look like this over time:\n\
         Stream part 1: ```\\n{marker}The capital\nStream part 2:  of France is\nStream part 3:  Paris.\\n```\n\n\
         Now, answer the following user prompt, ensuring your output strictly adheres to the markdown code block, start marker, and streaming requirements described above:\n"
    )
}
