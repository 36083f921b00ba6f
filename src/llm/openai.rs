//! A [TextGenerator] backed by an OpenAI-compatible chat completions endpoint.
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::config::LlmConfig;
use crate::llm::{GenerationError, TextGenerator};

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f64,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ReplyMessage,
}

#[derive(Debug, Deserialize)]
struct ReplyMessage {
    content: Option<String>,
}

/// Blocking chat completions client
#[derive(Debug, Clone)]
pub struct OpenAiChat {
    endpoint: String,
    model: String,
    api_key: String,
    system_prompt: String,
    temperature: f64,
    max_tokens: u32,
    timeout: Duration,
}

impl OpenAiChat {
    /// A client for the `[llm]` configuration. Fails when the API key variable is unset.
    pub fn from_config(config: &LlmConfig) -> Result<Self, GenerationError> {
        let api_key = config
            .api_key()
            .ok_or_else(|| GenerationError::MissingApiKey(config.api_key_env.clone()))?;
        debug!(model = %config.model, endpoint = %config.endpoint, "initialized generation client");
        Ok(OpenAiChat {
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            api_key,
            system_prompt: config.system_prompt.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            timeout: Duration::from_secs(config.timeout_secs),
        })
    }

    fn request<'a>(&'a self, prompt: &'a str) -> ChatRequest<'a> {
        ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &self.system_prompt,
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        }
    }
}

fn first_reply(response: ChatResponse) -> Result<String, GenerationError> {
    response
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .filter(|content| !content.trim().is_empty())
        .ok_or_else(|| GenerationError::Response("the response contained no text".to_string()))
}

impl TextGenerator for OpenAiChat {
    fn generate(&self, prompt: &str) -> Result<String, GenerationError> {
        debug!(model = %self.model, prompt_len = prompt.len(), "requesting generation");
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(self.timeout))
            .build()
            .into();
        let response = agent
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("content-type", "application/json")
            .send_json(self.request(prompt))
            .map_err(|e| {
                error!(error = %e, "generation request failed");
                GenerationError::Request(e.to_string())
            })?;
        let response: ChatResponse = response
            .into_body()
            .read_json()
            .map_err(|e| GenerationError::Response(e.to_string()))?;
        let text = first_reply(response)?;
        debug!(reply_len = text.len(), "generation finished");
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> OpenAiChat {
        OpenAiChat {
            endpoint: "http://localhost:9/v1/chat/completions".to_string(),
            model: "gpt-4".to_string(),
            api_key: "k".to_string(),
            system_prompt: "sys".to_string(),
            temperature: 0.2,
            max_tokens: 2000,
            timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn request_carries_system_and_user_messages() {
        let client = client();
        let json = serde_json::to_value(client.request("solve this")).unwrap();
        assert_eq!(json["model"], "gpt-4");
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][1]["content"], "solve this");
        assert_eq!(json["max_tokens"], 2000);
    }

    #[test]
    fn reply_is_the_first_choice() {
        let response: ChatResponse = serde_json::from_str(
            r#"{"choices":[{"message":{"role":"assistant","content":"```python\nx = 1\n```"}}]}"#,
        )
        .unwrap();
        assert_eq!(first_reply(response).unwrap(), "```python\nx = 1\n```");

        let empty: ChatResponse = serde_json::from_str(r#"{"choices":[]}"#).unwrap();
        assert!(matches!(first_reply(empty), Err(GenerationError::Response(_))));
    }

    #[test]
    fn missing_key_is_reported_by_variable_name() {
        let config = LlmConfig {
            api_key_env: "AUTOOPT_TEST_KEY_THAT_IS_NEVER_SET".to_string(),
            ..LlmConfig::default()
        };
        let err = OpenAiChat::from_config(&config).unwrap_err();
        assert_eq!(
            err,
            GenerationError::MissingApiKey("AUTOOPT_TEST_KEY_THAT_IS_NEVER_SET".to_string())
        );
    }
}
