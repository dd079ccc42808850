//! Speech synthesis — one provider request per text chunk.
//!
//! [`SpeechSynthesizer`] is the seam between the pipeline and the provider.
//! The shipped implementation, [`OpenAiSpeech`], talks to any
//! OpenAI-compatible `POST /audio/speech` endpoint:
//!
//! | Field             | Source                                            |
//! |-------------------|---------------------------------------------------|
//! | `model`           | job `model_id`                                    |
//! | `voice`           | job `voice_id`                                    |
//! | `input`           | chunk text                                        |
//! | `response_format` | fixed per client, so every segment shares a codec |
//! | `instructions`    | job style, only for style-capable models          |

use std::{fmt, time::Duration};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default OpenAI API root.
pub const DEFAULT_API_BASE_URL: &str = "https://api.openai.com/v1";

/// Models that accept free-form `instructions` (matches OpenAI's lineup).
pub const DEFAULT_STYLE_MODEL_PATTERN: &str = r"^gpt-4o(-mini)?-tts";

static DEFAULT_STYLE_MODELS: Lazy<Regex> =
    Lazy::new(|| Regex::new(DEFAULT_STYLE_MODEL_PATTERN).expect("valid regex"));

// ─────────────────────────────────────────────────────────────────────────────
// Request / errors
// ─────────────────────────────────────────────────────────────────────────────

/// Everything a provider needs to voice one chunk.
#[derive(Debug, Clone, Copy)]
pub struct SpeechRequest<'a> {
    pub text: &'a str,
    pub voice_id: &'a str,
    pub model_id: &'a str,
    pub style_instructions: Option<&'a str>,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("speech request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("speech provider returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("speech provider returned no audio")]
    EmptyAudio,
}

/// Encoded audio container produced by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    #[default]
    Mp3,
    Opus,
    Aac,
    Flac,
    Wav,
}

impl AudioFormat {
    /// File extension used for scratch files.
    pub fn extension(self) -> &'static str {
        match self {
            Self::Mp3 => "mp3",
            Self::Opus => "opus",
            Self::Aac => "aac",
            Self::Flac => "flac",
            Self::Wav => "wav",
        }
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl std::str::FromStr for AudioFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mp3" => Ok(Self::Mp3),
            "opus" => Ok(Self::Opus),
            "aac" => Ok(Self::Aac),
            "flac" => Ok(Self::Flac),
            "wav" => Ok(Self::Wav),
            other => Err(format!("unsupported audio format '{other}'")),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Trait
// ─────────────────────────────────────────────────────────────────────────────

/// Converts one chunk of text into encoded audio bytes.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, request: SpeechRequest<'_>) -> Result<Vec<u8>, ProviderError>;

    /// Container of the bytes returned by [`synthesize`](Self::synthesize).
    fn format(&self) -> AudioFormat {
        AudioFormat::Mp3
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// OpenAI-compatible client
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct SpeechBody<'a> {
    model: &'a str,
    voice: &'a str,
    input: &'a str,
    response_format: AudioFormat,
    #[serde(skip_serializing_if = "Option::is_none")]
    instructions: Option<&'a str>,
}

/// Client for an OpenAI-compatible `/audio/speech` endpoint.
pub struct OpenAiSpeech {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    format: AudioFormat,
    style_models: Regex,
}

impl OpenAiSpeech {
    /// Build a client with a per-request `timeout`.
    pub fn new(base_url: impl Into<String>, api_key: Option<String>, timeout: Duration) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            format: AudioFormat::default(),
            style_models: DEFAULT_STYLE_MODELS.clone(),
        })
    }

    pub fn with_format(mut self, format: AudioFormat) -> Self {
        self.format = format;
        self
    }

    /// Replace the set of models that receive style instructions.
    pub fn with_style_models(mut self, pattern: Regex) -> Self {
        self.style_models = pattern;
        self
    }

    /// Whether `model_id` takes free-form style directives.
    pub fn supports_style(&self, model_id: &str) -> bool {
        self.style_models.is_match(model_id)
    }

    fn endpoint(&self) -> String {
        format!("{}/audio/speech", self.base_url)
    }
}

#[async_trait]
impl SpeechSynthesizer for OpenAiSpeech {
    async fn synthesize(&self, request: SpeechRequest<'_>) -> Result<Vec<u8>, ProviderError> {
        // Unsupported models get no instructions at all rather than an error.
        let instructions = request
            .style_instructions
            .filter(|s| !s.trim().is_empty())
            .filter(|_| self.supports_style(request.model_id));

        let body = SpeechBody {
            model: request.model_id,
            voice: request.voice_id,
            input: request.text,
            response_format: self.format,
            instructions,
        };

        let mut builder = self.client.post(self.endpoint()).json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Status { status: status.as_u16(), body });
        }

        let audio = response.bytes().await?;
        if audio.is_empty() {
            return Err(ProviderError::EmptyAudio);
        }
        Ok(audio.to_vec())
    }

    fn format(&self) -> AudioFormat {
        self.format
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_style_models() {
        let client = OpenAiSpeech::new(DEFAULT_API_BASE_URL, None, Duration::from_secs(5)).unwrap();
        assert!(client.supports_style("gpt-4o-mini-tts"));
        assert!(client.supports_style("gpt-4o-tts"));
        assert!(!client.supports_style("tts-1"));
        assert!(!client.supports_style("tts-1-hd"));
    }

    #[test]
    fn test_audio_format_parsing() {
        assert_eq!("MP3".parse::<AudioFormat>(), Ok(AudioFormat::Mp3));
        assert_eq!("wav".parse::<AudioFormat>(), Ok(AudioFormat::Wav));
        assert!("ogg".parse::<AudioFormat>().is_err());
        assert_eq!(AudioFormat::Opus.to_string(), "opus");
    }

    #[test]
    fn test_body_omits_missing_instructions() {
        let body = SpeechBody {
            model: "tts-1",
            voice: "alloy",
            input: "Hi.",
            response_format: AudioFormat::Mp3,
            instructions: None,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"model": "tts-1", "voice": "alloy", "input": "Hi.", "response_format": "mp3"})
        );
    }

    #[cfg(feature = "server")]
    mod provider_stub {
        use super::*;
        use std::sync::Arc;

        use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
        use parking_lot::Mutex;

        type Seen = Arc<Mutex<Vec<serde_json::Value>>>;

        async fn speech(State(seen): State<Seen>, Json(body): Json<serde_json::Value>) -> (StatusCode, Vec<u8>) {
            let input = body["input"].as_str().unwrap_or_default().to_string();
            seen.lock().push(body);
            if input.contains("boom") {
                (StatusCode::TOO_MANY_REQUESTS, b"slow down".to_vec())
            } else {
                (StatusCode::OK, input.into_bytes())
            }
        }

        async fn spawn_stub() -> (String, Seen) {
            let seen: Seen = Arc::default();
            let app = Router::new().route("/v1/audio/speech", post(speech)).with_state(Arc::clone(&seen));
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
            (format!("http://{addr}/v1"), seen)
        }

        fn request<'a>(text: &'a str, model: &'a str, style: Option<&'a str>) -> SpeechRequest<'a> {
            SpeechRequest { text, voice_id: "nova", model_id: model, style_instructions: style }
        }

        #[tokio::test]
        async fn test_forwards_style_only_to_capable_models() {
            let (base, seen) = spawn_stub().await;
            let client = OpenAiSpeech::new(base, Some("sk-test".into()), Duration::from_secs(5)).unwrap();

            let audio = client.synthesize(request("Hello.", "gpt-4o-mini-tts", Some("Whisper."))).await.unwrap();
            assert_eq!(audio, b"Hello.");
            client.synthesize(request("World.", "tts-1", Some("Whisper."))).await.unwrap();

            let seen = seen.lock();
            assert_eq!(seen[0]["instructions"], "Whisper.");
            assert_eq!(seen[0]["voice"], "nova");
            assert_eq!(seen[0]["response_format"], "mp3");
            assert!(seen[1].get("instructions").is_none());
        }

        #[tokio::test]
        async fn test_non_success_status_is_provider_error() {
            let (base, _seen) = spawn_stub().await;
            let client = OpenAiSpeech::new(base, None, Duration::from_secs(5)).unwrap();
            let err = client.synthesize(request("boom", "tts-1", None)).await.unwrap_err();
            match err {
                ProviderError::Status { status, body } => {
                    assert_eq!(status, 429);
                    assert_eq!(body, "slow down");
                }
                other => panic!("unexpected error: {other}"),
            }
        }

        #[tokio::test]
        async fn test_unreachable_provider_is_transport_error() {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            let addr = listener.local_addr().unwrap();
            drop(listener);
            let client = OpenAiSpeech::new(format!("http://{addr}"), None, Duration::from_secs(2)).unwrap();
            let err = client.synthesize(request("Hi.", "tts-1", None)).await.unwrap_err();
            assert!(matches!(err, ProviderError::Transport(_)));
        }
    }
}
