//! The text-generation collaborator.
//!
//! The pipeline only needs something that turns a prompt into text. [OpenAiChat] talks to a
//! chat completions service; tests and embedders can pass any closure with the right shape.
//! A boxed `dyn Fn` is a closure too, which is how a generator is picked at runtime.
use thiserror::Error;

#[cfg(feature = "llm")]
pub mod openai;
pub mod prompt;

#[cfg(feature = "llm")]
pub use openai::OpenAiChat;
pub use prompt::{build_prompt, PromptStyle};

/// A failed generation request. There is no retry: the request fails with it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GenerationError {
    /// The environment variable meant to hold the API key is unset or empty
    #[error("API key must be provided in the {0} environment variable")]
    MissingApiKey(String),
    /// The service could not be reached or answered with an error status
    #[error("generation request failed: {0}")]
    Request(String),
    /// The service answered, but not with usable text
    #[error("unexpected generation response: {0}")]
    Response(String),
    /// Generation is not available in this build or configuration
    #[error("{0}")]
    Unavailable(String),
}

/// Turns a prompt into generated text
pub trait TextGenerator {
    fn generate(&self, prompt: &str) -> Result<String, GenerationError>;
}

impl<F> TextGenerator for F
where
    F: Fn(&str) -> Result<String, GenerationError>,
{
    fn generate(&self, prompt: &str) -> Result<String, GenerationError> {
        self(prompt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closures_are_generators() {
        let echo = |prompt: &str| -> Result<String, GenerationError> { Ok(prompt.to_uppercase()) };
        assert_eq!(echo.generate("abc").unwrap(), "ABC");

        let boxed: Box<dyn Fn(&str) -> Result<String, GenerationError>> =
            Box::new(|_: &str| Err(GenerationError::Request("offline".to_string())));
        assert_eq!(
            boxed.generate("x").unwrap_err().to_string(),
            "generation request failed: offline"
        );
    }
}
