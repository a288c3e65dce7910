mod tensorzero;

pub use tensorzero::{LlmClient, LlmConfig, LlmError, LlmMessage};

use async_trait::async_trait;
use tracing::debug;

/// Scores one rendered listing against a cached instruction block.
///
/// Returns the model's raw text; validation happens in `grading`.
#[async_trait]
pub trait Grader: Send + Sync {
    /// Identifier recorded on every grade row.
    fn model(&self) -> &str;

    async fn score(&self, instructions: &str, item_prompt: &str) -> Result<String, LlmError>;
}

#[async_trait]
impl Grader for LlmClient {
    fn model(&self) -> &str {
        self.model_label()
    }

    async fn score(&self, instructions: &str, item_prompt: &str) -> Result<String, LlmError> {
        let messages = [
            LlmMessage {
                role: "system".into(),
                content: instructions.to_string(),
            },
            LlmMessage {
                role: "user".into(),
                content: item_prompt.to_string(),
            },
        ];
        let response = self.chat(&messages).await?;
        if let Some(usage) = response.usage {
            debug!(
                target = "grader.llm",
                input_tokens = ?usage.input_tokens,
                output_tokens = ?usage.output_tokens,
                "inference usage"
            );
        }
        Ok(response.text)
    }
}
