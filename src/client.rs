use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::config::Provider;

const GROQ_BASE: &str = "https://api.groq.com/openai/v1";
const GEMINI_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
const GEMINI_KEY_HEADER: &str = "x-goog-api-key";

// ── Request / reply ───────────────────────────────────────────────────────────

/// One prior query/response pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exchange {
    pub query: String,
    pub response: String,
}

#[derive(Debug, Clone)]
pub struct Request<'a> {
    pub provider: Provider,
    pub model: &'a str,
    pub api_key: &'a str,
    pub instruction: Option<&'a str>,
    /// Prior exchanges, oldest first. Empty when context is off.
    pub history: &'a [Exchange],
    pub query: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub text: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

/// Anything that can answer a query.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn ask(&self, request: &Request<'_>) -> Result<Reply>;

    /// Model identifiers the provider offers for this key.
    async fn models(&self, provider: Provider, api_key: &str) -> Result<Vec<String>>;
}

// ── HTTP client ───────────────────────────────────────────────────────────────

pub struct Client {
    http: reqwest::Client,
    groq_base: String,
    gemini_base: String,
}

impl Client {
    pub fn new() -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            http,
            groq_base: GROQ_BASE.to_string(),
            gemini_base: GEMINI_BASE.to_string(),
        })
    }

    async fn post_json(&self, req: reqwest::RequestBuilder, body: &Value) -> Result<Value> {
        let resp = req
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(reqwest::Error::without_url)?;
        read_json(resp).await
    }

    async fn ask_groq(&self, request: &Request<'_>) -> Result<Reply> {
        let body = serde_json::json!({
            "model": request.model,
            "messages": groq_messages(request),
        });
        let url = format!("{}/chat/completions", self.groq_base);
        let req = self.http.post(&url).bearer_auth(request.api_key);
        let value = self.post_json(req, &body).await?;
        let parsed: GroqResponse =
            serde_json::from_value(value).context("Unexpected response from groq")?;

        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| anyhow!("groq returned no choices"))?;
        let usage = parsed.usage.unwrap_or_default();
        Ok(Reply {
            text,
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
        })
    }

    async fn ask_gemini(&self, request: &Request<'_>) -> Result<Reply> {
        let mut body = serde_json::json!({
            "contents": gemini_contents(request),
        });
        if let Some(instruction) = request.instruction {
            body["system_instruction"] = serde_json::json!({
                "parts": [{ "text": instruction }]
            });
        }
        // the key goes in a header so it never shows up in a logged URL
        let url = format!("{}/models/{}:generateContent", self.gemini_base, request.model);
        let req = self.http.post(&url).header(GEMINI_KEY_HEADER, request.api_key);
        let value = self.post_json(req, &body).await?;
        let parsed: GeminiResponse =
            serde_json::from_value(value).context("Unexpected response from gemini")?;

        let candidate = parsed
            .candidates
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("gemini returned no candidates"))?;
        let text: String = candidate
            .content
            .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
            .unwrap_or_default();
        let usage = parsed.usage_metadata.unwrap_or_default();
        Ok(Reply {
            text,
            prompt_tokens: usage.prompt_token_count,
            completion_tokens: usage.candidates_token_count,
        })
    }

    async fn groq_models(&self, api_key: &str) -> Result<Vec<String>> {
        let url = format!("{}/models", self.groq_base);
        let resp = self
            .http
            .get(&url)
            .bearer_auth(api_key)
            .send()
            .await
            .map_err(reqwest::Error::without_url)?;
        let parsed: GroqModels =
            serde_json::from_value(read_json(resp).await?).context("Unexpected model list from groq")?;
        let mut ids: Vec<String> = parsed.data.into_iter().map(|m| m.id).collect();
        ids.sort();
        Ok(ids)
    }

    async fn gemini_models(&self, api_key: &str) -> Result<Vec<String>> {
        let url = format!("{}/models?pageSize=1000", self.gemini_base);
        let resp = self
            .http
            .get(&url)
            .header(GEMINI_KEY_HEADER, api_key)
            .send()
            .await
            .map_err(reqwest::Error::without_url)?;
        let parsed: GeminiModels = serde_json::from_value(read_json(resp).await?)
            .context("Unexpected model list from gemini")?;
        Ok(parsed
            .models
            .into_iter()
            .filter(|m| m.supported_generation_methods.iter().any(|g| g == "generateContent"))
            .map(|m| m.name.trim_start_matches("models/").to_string())
            .collect())
    }
}

#[async_trait]
impl LanguageModel for Client {
    async fn ask(&self, request: &Request<'_>) -> Result<Reply> {
        match request.provider {
            Provider::Groq => self.ask_groq(request).await,
            Provider::Gemini => self.ask_gemini(request).await,
        }
    }

    async fn models(&self, provider: Provider, api_key: &str) -> Result<Vec<String>> {
        match provider {
            Provider::Groq => self.groq_models(api_key).await,
            Provider::Gemini => self.gemini_models(api_key).await,
        }
    }
}

/// Decode a JSON body, turning non-2xx statuses into errors carrying the
/// provider's own message.
async fn read_json(resp: reqwest::Response) -> Result<Value> {
    let status = resp.status();
    let text = resp.text().await.map_err(reqwest::Error::without_url)?;
    if !status.is_success() {
        return Err(anyhow!("API error {}: {}", status, error_message(&text)));
    }
    serde_json::from_str(&text).context("Response was not JSON")
}

/// Both providers wrap failures as `{"error": {"message": ...}}`.
fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
        .unwrap_or_else(|| body.to_string())
}

// ── Wire formats ──────────────────────────────────────────────────────────────

fn groq_messages(request: &Request<'_>) -> Vec<Value> {
    let mut out = Vec::new();
    if let Some(instruction) = request.instruction {
        out.push(serde_json::json!({ "role": "system", "content": instruction }));
    }
    for exchange in request.history {
        out.push(serde_json::json!({ "role": "user", "content": exchange.query }));
        out.push(serde_json::json!({ "role": "assistant", "content": exchange.response }));
    }
    out.push(serde_json::json!({ "role": "user", "content": request.query }));
    out
}

fn gemini_contents(request: &Request<'_>) -> Vec<Value> {
    let turn = |role: &str, text: &str| {
        serde_json::json!({ "role": role, "parts": [{ "text": text }] })
    };
    let mut out = Vec::new();
    for exchange in request.history {
        out.push(turn("user", &exchange.query));
        out.push(turn("model", &exchange.response));
    }
    out.push(turn("user", request.query));
    out
}

#[derive(Debug, Deserialize)]
struct GroqResponse {
    #[serde(default)]
    choices: Vec<GroqChoice>,
    usage: Option<GroqUsage>,
}

#[derive(Debug, Deserialize)]
struct GroqChoice {
    message: GroqMessage,
}

#[derive(Debug, Deserialize)]
struct GroqMessage {
    content: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct GroqUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct GroqModels {
    #[serde(default)]
    data: Vec<GroqModel>,
}

#[derive(Debug, Deserialize)]
struct GroqModel {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    usage_metadata: Option<GeminiUsage>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContent>,
}

#[derive(Debug, Deserialize)]
struct GeminiContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Deserialize)]
struct GeminiPart {
    text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiUsage {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
}

#[derive(Debug, Deserialize)]
struct GeminiModels {
    #[serde(default)]
    models: Vec<GeminiModel>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiModel {
    name: String,
    #[serde(default)]
    supported_generation_methods: Vec<String>,
}
