//! Request and response bodies of Google Cloud Text-to-Speech `text:synthesize`.

use crate::crm_types::Language;

use serde::{Deserialize, Serialize};

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct SynthesizeSpeechRequest {
    pub input: SynthesisInput,
    pub voice: VoiceSelectionParams,
    pub audio_config: AudioConfig,
}

#[derive(Serialize, Debug)]
pub struct SynthesisInput {
    pub text: String,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct VoiceSelectionParams {
    pub language_code: &'static str,
    pub name: &'static str,
    pub ssml_gender: &'static str,
}

impl VoiceSelectionParams {
    pub fn for_language(language: Language) -> Self {
        match language {
            Language::Uk => Self {
                language_code: "uk-UA",
                name: "uk-UA-Standard-A",
                ssml_gender: "FEMALE",
            },
            Language::En => Self {
                language_code: "en-US",
                name: "en-US-Standard-E",
                ssml_gender: "FEMALE",
            },
        }
    }
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct AudioConfig {
    pub audio_encoding: AudioEncoding,
    pub sample_rate_hertz: u32,
}

#[derive(Serialize, Clone, Copy, Debug)]
pub enum AudioEncoding {
    /// 8-bit μ-law with a WAV header, the format Twilio media streams carry.
    #[serde(rename = "MULAW")]
    Mulaw,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct SynthesizeSpeechResponse {
    /// Base64-encoded audio
    pub audio_content: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_uses_google_field_names() {
        let request = SynthesizeSpeechRequest {
            input: SynthesisInput {
                text: "Got it.".into(),
            },
            voice: VoiceSelectionParams::for_language(Language::Uk),
            audio_config: AudioConfig {
                audio_encoding: AudioEncoding::Mulaw,
                sample_rate_hertz: 8_000,
            },
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["voice"]["languageCode"], "uk-UA");
        assert_eq!(value["audioConfig"]["audioEncoding"], "MULAW");
        assert_eq!(value["audioConfig"]["sampleRateHertz"], 8000);
        assert_eq!(value["input"]["text"], "Got it.");
    }

    #[test]
    fn voice_follows_call_language() {
        assert_eq!(VoiceSelectionParams::for_language(Language::En).language_code, "en-US");
        assert_eq!(VoiceSelectionParams::for_language(Language::Uk).language_code, "uk-UA");
    }
}
