use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Text frames on the Deepgram live transcription socket.
#[derive(Deserialize, Debug)]
#[serde(tag = "type")]
pub enum StreamMessage {
    #[serde(rename = "Results")]
    StreamingResponse(StreamingResponse),
    #[serde(rename = "Metadata")]
    StreamingMeta(StreamingMeta),
    /// SpeechStarted, UtteranceEnd and anything newer
    #[serde(other)]
    Other,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct StreamingResponse {
    pub channel_index: (u16, u16),
    pub duration: f32,
    pub start: f32,
    pub is_final: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speech_final: Option<bool>,
    pub channel: Channel,
}

impl StreamingResponse {
    /// Best transcript of this result; empty when Deepgram heard nothing.
    pub fn transcript(&self) -> &str {
        self.channel
            .alternatives
            .first()
            .map(|a| a.transcript.as_str())
            .unwrap_or("")
    }
}

#[derive(Deserialize, Clone, Debug)]
pub struct StreamingMeta {
    pub request_id: Uuid,
}

#[derive(Serialize, Deserialize, Clone, Default, PartialEq, Debug)]
pub struct Channel {
    pub alternatives: Vec<Alternative>,
}

#[derive(Serialize, Deserialize, Clone, Default, PartialEq, Debug)]
pub struct Alternative {
    pub transcript: String,
    pub confidence: f32,
    #[serde(default)]
    pub words: Vec<Word>,
}

#[derive(Serialize, Deserialize, Clone, Default, PartialEq, Debug)]
pub struct Word {
    pub word: String,
    pub start: f32,
    pub end: f32,
    pub confidence: f32,
}

/// Asks Deepgram to flush remaining results and close the stream.
pub const CLOSE_STREAM: &str = r#"{"type":"CloseStream"}"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn results_and_metadata_are_distinguished() {
        let results = r#"{"type":"Results","channel_index":[0,1],"duration":1.2,"start":0.0,
            "is_final":true,"speech_final":true,
            "channel":{"alternatives":[{"transcript":"I want to check in","confidence":0.98,
            "words":[{"word":"i","start":0.1,"end":0.2,"confidence":0.9,"punctuated_word":"I"}]}]}}"#;
        match serde_json::from_str::<StreamMessage>(results).unwrap() {
            StreamMessage::StreamingResponse(r) => {
                assert!(r.is_final);
                assert_eq!(r.transcript(), "I want to check in");
            }
            other => panic!("unexpected message {other:?}"),
        }

        let meta = r#"{"type":"Metadata","transaction_key":"deprecated",
            "request_id":"6c2a1a52-6d8b-4b1e-9f0b-4b8b7e1f5e01","sha256":"x","created":"2025-05-01T10:00:00Z",
            "duration":12.5,"channels":1}"#;
        assert!(matches!(
            serde_json::from_str::<StreamMessage>(meta).unwrap(),
            StreamMessage::StreamingMeta(_)
        ));

        let other = r#"{"type":"UtteranceEnd","channel":[0,1],"last_word_end":2.1}"#;
        assert!(matches!(
            serde_json::from_str::<StreamMessage>(other).unwrap(),
            StreamMessage::Other
        ));
    }
}
