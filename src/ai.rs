//! OpenWebUI chat-completions client used as the optional [`CategorySuggester`].

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::classify::{CATEGORIES, CategorySuggester, ClassifyRequest, parse_category_list};
use crate::config::AppConfig;
use crate::error::Result;
use crate::model::extension_of;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(8);
const COMPLETIONS_PATH: &str = "/chat/completions";

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    max_tokens: u32,
    temperature: f32,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    #[serde(default)]
    message: Option<Message>,
}

#[derive(Deserialize)]
struct Message {
    #[serde(default)]
    content: String,
}

/// Client for an OpenWebUI (OpenAI-compatible) endpoint.
#[derive(Debug, Clone)]
pub struct OpenWebUiClient {
    http: reqwest::Client,
    endpoint: String,
    classify_models: Vec<String>,
    describe_model: Option<String>,
    api_key: Option<String>,
}

impl OpenWebUiClient {
    /// Builds a client from the `ai` section, or `None` when it is not configured.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn from_config(config: &AppConfig) -> Result<Option<Self>> {
        if !config.ai.is_configured() {
            return Ok(None);
        }
        let describe_model = Some(config.ai.model.clone()).filter(|m| !m.is_empty());
        let api_key = Some(config.ai.api_key.clone()).filter(|k| !k.is_empty());
        Self::new(&config.ai.url, config.classify_models(), describe_model, api_key).map(Some)
    }

    /// Creates a client against `base_url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(
        base_url: &str,
        classify_models: Vec<String>,
        describe_model: Option<String>,
        api_key: Option<String>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            http,
            endpoint: completions_endpoint(base_url),
            classify_models,
            describe_model,
            api_key,
        })
    }

    /// Resolved chat-completions url.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn complete(&self, model: &str, system: &str, prompt: &str, max_tokens: u32, temperature: f32) -> Option<String> {
        let body = ChatRequest {
            model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
            max_tokens,
            temperature,
        };
        let mut request = self.http.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = match request.send().await {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                log::debug!("OpenWebUI model {model} answered {}", r.status());
                return None;
            }
            Err(e) => {
                log::debug!("OpenWebUI request for model {model} failed: {e}");
                return None;
            }
        };
        let parsed: ChatResponse = response.json().await.ok()?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message)
            .map(|m| m.content.trim().to_string())
            .filter(|c| !c.is_empty())
    }
}

/// Appends the chat-completions path unless the url already carries it.
fn completions_endpoint(base_url: &str) -> String {
    let base = base_url.trim().trim_end_matches('/');
    if base.ends_with(COMPLETIONS_PATH) {
        base.to_string()
    } else if base.contains("/api/v1") {
        format!("{base}{COMPLETIONS_PATH}")
    } else {
        format!("{base}/api/v1{COMPLETIONS_PATH}")
    }
}

fn classify_prompt(request: &ClassifyRequest<'_>) -> String {
    let ext = extension_of(request.file_name);
    let hints: String = format!(
        "{} {} {}",
        request.bundle_title, request.product_title, request.file_name
    )
    .chars()
    .take(500)
    .collect();
    format!(
        "Classify this Humble download. Choose one or two categories from: {}.\n\
         Prefer the end content (a .zip holding a tileset or a course is tileset or tutorial, not archive). \
         Only answer archive when the content is truly mixed or unknown.\n\
         Bundle: {}\nProduct: {}\nFilename: {}\nExtension: {}\nPlatform hint: {}\nText hints: {hints}\n\
         Answer with one or two category words from the list (comma-separated if two).",
        CATEGORIES.join(", "),
        request.bundle_title,
        request.product_title,
        request.file_name,
        if ext.is_empty() { "none" } else { ext.as_str() },
        if request.platform.is_empty() { "unknown" } else { request.platform },
    )
}

fn describe_prompt(request: &ClassifyRequest<'_>) -> String {
    format!(
        "Write a brief, neutral 1-2 sentence description of this Humble item.\n\
         Bundle: {}\nProduct: {}\nFilename: {}\n",
        request.bundle_title, request.product_title, request.file_name
    )
}

#[async_trait]
impl CategorySuggester for OpenWebUiClient {
    async fn suggest_categories(&self, request: &ClassifyRequest<'_>) -> Vec<String> {
        let system = format!(
            "You classify Humble Bundle items into up to two categories. Choose one or two from: {}. \
             If the download is a packaged archive but clearly holds tilesets, sprites, characters or a course, \
             choose that content category instead of archive.",
            CATEGORIES.join(", ")
        );
        let prompt = classify_prompt(request);
        let mut merged: Vec<String> = Vec::new();
        for model in &self.classify_models {
            let Some(answer) = self.complete(model, &system, &prompt, 8, 0.0).await else {
                continue;
            };
            let guesses = parse_category_list(&answer);
            if guesses.is_empty() {
                log::debug!("OpenWebUI answer outside vocabulary ({model}): {answer}");
            }
            for guess in guesses {
                if !merged.contains(&guess) {
                    merged.push(guess);
                }
            }
        }
        merged
    }

    async fn describe(&self, request: &ClassifyRequest<'_>) -> Option<String> {
        let model = self.describe_model.as_deref()?;
        self.complete(
            model,
            "You write concise, neutral blurbs about Humble Bundle items.",
            &describe_prompt(request),
            120,
            0.3,
        )
        .await
    }
}
