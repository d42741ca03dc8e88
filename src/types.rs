use crate::config::Config;
use crate::crm_client::CrmApi;
use crate::crm_types::Language;
use crate::deepgram_types::StreamingResponse;
use crate::error::AppError;
use crate::storage::RecordingStore;
use crate::tts_types::{
    AudioConfig, AudioEncoding, SynthesisInput, SynthesizeSpeechRequest,
    SynthesizeSpeechResponse, VoiceSelectionParams,
};
use crate::twilio_types::TwilioConnectPayload;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, RwLock};
use tracing::error;

/// Indicator of whether we are currently listening or talking
pub enum CurrentBotAction {
    Listening(mpsc::Sender<ConversationSignal>),
    Talking,
}

/// What the caller said during one listening phase
pub struct ConversationTurn {
    pub caller_side: Arc<RwLock<String>>,
}

impl ConversationTurn {
    pub fn new() -> Self {
        Self {
            caller_side: Arc::new(RwLock::new(String::new())),
        }
    }
}

/// Message type consumed by the caller-side turn manager.  `StreamingResponse` tells the manager
/// to continue handling DG streaming responses; `Go` tells the manager to respond to the caller.
pub enum ConversationSignal {
    StreamingResponse(StreamingResponse),
    Go,
}

/// Output of the bot side, in playback order.
pub enum BotMedia {
    /// Raw 8 kHz μ-law audio
    Audio(Vec<u8>),
    /// Twilio echoes a mark once everything queued before it has played.
    Mark(&'static str),
}

pub struct AppState {
    pub config: Config,
    pub http_client: reqwest::Client,
    pub crm: Arc<dyn CrmApi>,
    pub recordings: Option<RecordingStore>,
    // call sid => twilio connect meta
    pub streams: Arc<Mutex<HashMap<String, TwilioConnectPayload>>>,
}

impl AppState {
    /// Synthesize `text` as base64 MULAW (with Google's WAV header still attached).
    pub async fn get_google_tts(
        &self,
        text: &str,
        language: Language,
    ) -> Result<String, AppError> {
        let speech_request = SynthesizeSpeechRequest {
            input: SynthesisInput {
                text: text.to_string(),
            },
            voice: VoiceSelectionParams::for_language(language),
            audio_config: AudioConfig {
                audio_encoding: AudioEncoding::Mulaw,
                sample_rate_hertz: 8_000,
            },
        };
        let resp = self
            .http_client
            .post(format!(
                "{}/v1/text:synthesize",
                self.config.google_tts_base_url
            ))
            .query(&[("key", self.config.google_tts_api_key.as_str())])
            .json(&speech_request)
            .send()
            .await
            .map_err(|e| {
                error!(error=%e, "failed to send request to Google TTS");
                AppError("Failed to send request to Google TTS")
            })?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            error!(%status, body=%body, "Google TTS rejected synthesize request");
            return Err(AppError("Google TTS request failed"));
        }
        let synthesize_response = resp.json::<SynthesizeSpeechResponse>().await.map_err(|e| {
            error!(error=%e, "failed to deserialize Google TTS response");
            AppError("Google TTS deserialization error")
        })?;

        Ok(synthesize_response.audio_content)
    }
}
