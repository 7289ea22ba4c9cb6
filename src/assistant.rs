//! Consultation assistant: turns a prior prediction and a user question into
//! a guarded prompt for an external text-generation service.

use std::{fmt::Write as _, sync::Arc};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::AssistantConfig;
use crate::labels::ClassLabels;

/// Results under this confidence (percent) are flagged as needing confirmation.
pub const LOW_CONFIDENCE_THRESHOLD: f64 = 70.0;

#[derive(Error, Debug)]
pub enum AssistantError {
    #[error("chat assistant is not configured; set GEMINI_API_KEY to enable it")]
    Unavailable,

    #[error("text generation failed: {0}")]
    Call(String),
}

/// The prediction a chat question refers to, as sent back by the caller.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatContext {
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
}

#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String, AssistantError>;
}

/// Gemini `generateContent` client. The HTTP client is built once and reused.
pub struct GeminiClient {
    client: reqwest::Client,
    config: AssistantConfig,
}

impl GeminiClient {
    pub fn new(config: AssistantConfig) -> Result<Self, AssistantError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| AssistantError::Call(e.to_string()))?;
        Ok(Self { client, config })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/models/{}:generateContent",
            self.config.base_url, self.config.model
        )
    }
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    text: Option<String>,
}

impl GenerateResponse {
    fn into_text(self) -> Option<String> {
        let text: String = self
            .candidates
            .into_iter()
            .next()?
            .content?
            .parts
            .into_iter()
            .filter_map(|p| p.text)
            .collect();
        (!text.is_empty()).then_some(text)
    }
}

#[async_trait]
impl TextGenerator for GeminiClient {
    async fn generate(&self, prompt: &str) -> Result<String, AssistantError> {
        let body = json!({ "contents": [{ "parts": [{ "text": prompt }] }] });

        let response = self
            .client
            .post(self.endpoint())
            .header("x-goog-api-key", &self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| AssistantError::Call(e.without_url().to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            let detail: String = detail.chars().take(300).collect();
            return Err(AssistantError::Call(format!("{status}: {detail}")));
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| AssistantError::Call(format!("malformed response: {e}")))?;
        parsed
            .into_text()
            .ok_or_else(|| AssistantError::Call("response contained no text".to_string()))
    }
}

/// Either `Ready` with a generator, or `Unconfigured` when no credential was
/// provided at startup.
#[derive(Clone)]
pub struct Assistant {
    generator: Option<Arc<dyn TextGenerator>>,
    labels: Arc<ClassLabels>,
    domain: String,
}

impl Assistant {
    pub fn new(
        generator: Option<Arc<dyn TextGenerator>>,
        labels: Arc<ClassLabels>,
        domain: impl Into<String>,
    ) -> Self {
        Self {
            generator,
            labels,
            domain: domain.into(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.generator.is_some()
    }

    pub async fn reply(&self, message: &str, context: &ChatContext) -> Result<String, AssistantError> {
        let generator = self.generator.as_ref().ok_or(AssistantError::Unavailable)?;
        let prompt = build_prompt(&self.domain, &self.labels, context, message);
        debug!(prompt_len = prompt.len(), "sending chat prompt");

        generator.generate(&prompt).await.map_err(|e| {
            warn!(error = %e, "chat completion failed");
            e
        })
    }
}

pub fn build_prompt(
    domain: &str,
    labels: &ClassLabels,
    context: &ChatContext,
    message: &str,
) -> String {
    let label = context.result.as_deref().unwrap_or("unknown");
    let confidence = context.confidence.unwrap_or(0.0);
    let description = labels.describe(label);

    let mut prompt = String::new();
    let _ = writeln!(
        prompt,
        "You are an assistant that helps users understand the result of an automated {domain} screening of a medical image."
    );
    prompt.push('\n');
    prompt.push_str("Current analysis:\n");
    let _ = writeln!(prompt, "- Diagnosis: {label}");
    let _ = writeln!(prompt, "- Description: {description}");
    let _ = writeln!(prompt, "- Confidence: {confidence:.2}%");
    prompt.push('\n');

    prompt.push_str("Possible classes:\n");
    for class in labels.iter() {
        let _ = writeln!(
            prompt,
            "- {}: {}",
            class.name,
            class.description.as_deref().unwrap_or(&class.name)
        );
    }
    prompt.push('\n');

    prompt.push_str("Instructions:\n");
    prompt.push_str("1. Explain the result in plain language that a non-specialist can follow.\n");
    prompt.push_str("2. Give general educational information only; do not prescribe treatment or medication.\n");
    prompt.push_str("3. If the user asks about any of the classes or subtypes above, explain what it means.\n");
    prompt.push_str("4. Recommend follow-up with a qualified doctor or specialist.\n");
    prompt.push_str("5. Always state that this result is a screening aid and not a final diagnosis.\n");
    prompt.push_str("6. Keep an empathetic tone that does not alarm the user.\n");
    let _ = writeln!(
        prompt,
        "7. If the confidence is below {LOW_CONFIDENCE_THRESHOLD:.0}%, point out that the result is uncertain and must be confirmed by further testing."
    );
    let _ = writeln!(
        prompt,
        "8. Stay factual and within the topic of {domain}."
    );
    if confidence < LOW_CONFIDENCE_THRESHOLD {
        let _ = writeln!(
            prompt,
            "Note: the confidence of this result ({confidence:.2}%) is below {LOW_CONFIDENCE_THRESHOLD:.0}% and requires confirmation."
        );
    }
    prompt.push('\n');

    let _ = writeln!(prompt, "User question: {message}");
    prompt.push('\n');
    prompt.push_str("Answer concisely, in at most three short paragraphs.");
    prompt
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;

    /// Records every prompt and answers with a canned reply or error.
    #[derive(Default)]
    pub struct RecordingGenerator {
        pub prompts: Mutex<Vec<String>>,
        pub fail_with: Option<String>,
    }

    #[async_trait]
    impl TextGenerator for RecordingGenerator {
        async fn generate(&self, prompt: &str) -> Result<String, AssistantError> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            match &self.fail_with {
                Some(msg) => Err(AssistantError::Call(msg.clone())),
                None => Ok("This is general information only.".to_string()),
            }
        }
    }
}
