//! Prompt templates
//!
//! Pure string builders; nothing here touches the engine.

use serde::{Deserialize, Serialize};

const SYSTEM_LINE: &str = "You are a helpful assistant.";

/// Wraps a user message in the ChatML turn layout
pub fn chat_prompt(user: &str) -> String {
    format!(
        "<|im_start|>system\n{SYSTEM_LINE}<|im_end|>\n\
         <|im_start|>user\n{user}<|im_end|>\n\
         <|im_start|>assistant\n"
    )
}

/// Parameters of an essay request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EssayRequest {
    pub title: String,
    /// Target length in words
    pub word_limit: u32,
    /// Language name as it should appear in the instruction
    pub lang: String,
    /// Words learners often get wrong
    pub mistaken_words: Vec<String>,
    /// Vocabulary the essay should practice
    pub frequent_words: Vec<String>,
    /// Overrides the budget derived from `word_limit`
    pub max_new_tokens: Option<usize>,
}

impl Default for EssayRequest {
    fn default() -> Self {
        Self {
            title: "An Essay".to_string(),
            word_limit: 200,
            lang: "en".to_string(),
            mistaken_words: Vec::new(),
            frequent_words: Vec::new(),
            max_new_tokens: None,
        }
    }
}

impl EssayRequest {
    /// Roughly three tokens per word, never below 256
    pub fn token_budget(&self) -> usize {
        self.max_new_tokens
            .unwrap_or_else(|| (self.word_limit as usize).saturating_mul(3).max(256))
    }
}

fn push_word_list(out: &mut String, lead: &str, words: &[String]) {
    if words.is_empty() {
        return;
    }
    out.push_str(lead);
    out.push_str(&words.join(", "));
    out.push_str(".\n");
}

/// Plain-text instruction block. No chat wrapping, so the model does not
/// echo the requirements back.
pub fn essay_prompt(request: &EssayRequest) -> String {
    let mut out = String::new();
    out.push_str(&format!("Write a {} essay.\n", request.lang));
    out.push_str(&format!("Title: {}\n", request.title));
    out.push_str(&format!("Length: ~{} words.\n", request.word_limit.max(50)));
    out.push_str("Requirements:\n");
    out.push_str("- Clear structure with introduction, body, and conclusion.\n");
    out.push_str("- Use simple sentences suitable for ESL learners.\n");
    push_word_list(
        &mut out,
        "- Pay attention to commonly mistaken words: ",
        &request.mistaken_words,
    );
    push_word_list(
        &mut out,
        "- Try to include high-frequency vocabulary: ",
        &request.frequent_words,
    );
    out.push_str("- Avoid overly complex grammar. Keep the vocabulary practical.\n");
    out.push_str("Now produce only the final essay content.\n");
    out
}
