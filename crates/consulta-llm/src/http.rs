use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use consulta_core::errors::ResponderError;
use consulta_core::responder::{ChatTurn, Responder, TurnRole};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection settings for an OpenAI-compatible chat-completions endpoint.
#[derive(Debug)]
pub struct HttpResponderConfig {
    /// Base URL without the `/chat/completions` suffix.
    pub base_url: String,
    pub model: String,
    pub api_key: SecretString,
    pub request_timeout: Duration,
    pub temperature: f32,
}

impl HttpResponderConfig {
    pub fn new(api_key: SecretString) -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key,
            request_timeout: Duration::from_secs(60),
            temperature: 0.3,
        }
    }
}

pub struct HttpResponder {
    client: Client,
    config: HttpResponderConfig,
}

impl HttpResponder {
    pub fn new(config: HttpResponderConfig) -> Result<Self, ResponderError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ResponderError::Other(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

fn build_request<'a>(
    model: &'a str,
    temperature: f32,
    prompt: &'a str,
    history: &'a [ChatTurn],
) -> CompletionRequest<'a> {
    let mut messages: Vec<WireMessage<'a>> = history
        .iter()
        .map(|turn| WireMessage {
            role: match turn.role {
                TurnRole::User => "user",
                TurnRole::Assistant => "assistant",
            },
            content: &turn.text,
        })
        .collect();
    messages.push(WireMessage { role: "user", content: prompt });
    CompletionRequest { model, messages, temperature }
}

fn parse_response(body: &str) -> Result<String, ResponderError> {
    let parsed: CompletionResponse = serde_json::from_str(body)
        .map_err(|e| ResponderError::Other(format!("malformed completion: {e}")))?;
    let choice = parsed
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ResponderError::Other("completion had no choices".into()))?;

    if choice.finish_reason.as_deref() == Some("content_filter") {
        return Err(ResponderError::SafetyBlocked("finish_reason=content_filter".into()));
    }

    match choice.message.content {
        Some(text) if !text.trim().is_empty() => Ok(text),
        _ => Err(ResponderError::Other("completion was empty".into())),
    }
}

fn classify_transport(e: &reqwest::Error, timeout: Duration) -> ResponderError {
    if e.is_timeout() {
        ResponderError::Timeout(timeout)
    } else if e.is_connect() || e.is_request() {
        ResponderError::Network(e.to_string())
    } else {
        ResponderError::Other(e.to_string())
    }
}

#[async_trait]
impl Responder for HttpResponder {
    fn name(&self) -> &str {
        &self.config.model
    }

    #[instrument(skip_all, fields(model = %self.config.model, history_len = history.len()))]
    async fn generate(&self, prompt: &str, history: &[ChatTurn]) -> Result<String, ResponderError> {
        let body = build_request(&self.config.model, self.config.temperature, prompt, history);

        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(self.config.api_key.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_transport(&e, self.config.request_timeout))?;

        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| classify_transport(&e, self.config.request_timeout))?;

        if !(200..300).contains(&status) {
            debug!(status, "responder returned error status");
            return Err(ResponderError::from_status(status, text));
        }
        parse_response(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_appends_prompt_after_history() {
        let history = vec![ChatTurn::user("hola"), ChatTurn::assistant("buenas")];
        let req = build_request("m", 0.3, "¿y ahora?", &history);
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["model"], "m");
        assert_eq!(json["messages"].as_array().unwrap().len(), 3);
        assert_eq!(json["messages"][1]["role"], "assistant");
        assert_eq!(json["messages"][2]["content"], "¿y ahora?");
    }

    #[test]
    fn parse_extracts_first_choice() {
        let body = r#"{"choices":[{"message":{"content":"Respuesta"},"finish_reason":"stop"}]}"#;
        assert_eq!(parse_response(body).unwrap(), "Respuesta");
    }

    #[test]
    fn parse_content_filter_is_safety_block() {
        let body = r#"{"choices":[{"message":{"content":null},"finish_reason":"content_filter"}]}"#;
        assert!(matches!(parse_response(body), Err(ResponderError::SafetyBlocked(_))));
    }

    #[test]
    fn parse_empty_and_malformed() {
        assert!(matches!(
            parse_response(r#"{"choices":[]}"#),
            Err(ResponderError::Other(_))
        ));
        assert!(matches!(parse_response("not json"), Err(ResponderError::Other(_))));
        assert!(matches!(
            parse_response(r#"{"choices":[{"message":{"content":"   "}}]}"#),
            Err(ResponderError::Other(_))
        ));
    }

    #[test]
    fn endpoint_strips_trailing_slash() {
        let mut config = HttpResponderConfig::new(SecretString::from("k".to_string()));
        config.base_url = "http://localhost:8080/v1/".into();
        let responder = HttpResponder::new(config).unwrap();
        assert_eq!(responder.endpoint(), "http://localhost:8080/v1/chat/completions");
    }
}
