//! Sample activities

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;
use waypoint_durable::{Activity, ActivityContext, ActivityError};

/// Input of the `process` activity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessInput {
    pub message: String,
    pub language: String,
}

/// Echoes a message on behalf of a language runtime
pub struct ProcessActivity;

#[async_trait]
impl Activity for ProcessActivity {
    const TYPE: &'static str = "process";
    type Input = ProcessInput;
    type Output = String;

    async fn execute(
        &self,
        ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError> {
        let language = display_language(&input.language).ok_or_else(|| {
            ActivityError::non_retryable("language must not be empty").with_type("invalid_input")
        })?;

        info!(
            run_id = %ctx.run_id,
            activity_id = %ctx.activity_id,
            attempt = ctx.attempt,
            %language,
            "processing message"
        );
        Ok(format!("{language} says: {}", input.message))
    }
}

/// Human name of a language id: `csharp` is "C#", `typescript` is
/// "TypeScript", anything else is title-cased
pub fn display_language(language: &str) -> Option<String> {
    let language = language.trim();
    match language.to_ascii_lowercase().as_str() {
        "" => None,
        "csharp" => Some("C#".to_string()),
        "typescript" => Some("TypeScript".to_string()),
        lower => {
            let mut chars = lower.chars();
            chars
                .next()
                .map(|first| first.to_uppercase().chain(chars).collect())
        }
    }
}
