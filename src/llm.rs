use crate::error::AppError;
use crate::openai_types::{
    parse_stream_chunk, OpenAIMessage, OpenAIPayload, OpenAIStreamResponse, OpenAITool,
};

use tracing::error;

const MAX_COMPLETION_TOKENS: u32 = 400;

/// Start a streamed chat completion; the caller reads `bytes_stream()` of the response.
pub async fn stream_chat_completion(
    http_client: &reqwest::Client,
    base_url: &str,
    api_key: &str,
    model: &str,
    messages: Vec<OpenAIMessage>,
    tools: Vec<OpenAITool>,
) -> Result<reqwest::Response, AppError> {
    let payload = OpenAIPayload {
        model: model.to_string(),
        messages,
        tools,
        stream: Some(true),
        max_tokens: Some(MAX_COMPLETION_TOKENS),
    };
    let resp = http_client
        .post(format!("{base_url}/chat/completions"))
        .header(reqwest::header::AUTHORIZATION, format!("Bearer {api_key}"))
        .json(&payload)
        .send()
        .await
        .map_err(|e| {
            error!(error=%e, "failed to send request to OpenAI");
            AppError("Failed to send request to OpenAI")
        })?;
    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        error!(%status, body=%body, "OpenAI rejected chat completion request");
        return Err(AppError("OpenAI chat completion request failed"));
    }
    Ok(resp)
}

/// Reassembles server-sent event lines split across network chunks.
#[derive(Default)]
pub struct SseBuffer {
    /// Bytes, not text: a chunk may end inside a multi-byte character.
    pending: Vec<u8>,
}

impl SseBuffer {
    /// Feed raw bytes; returns the events whose lines are complete.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<OpenAIStreamResponse> {
        self.pending.extend_from_slice(chunk);
        let Some(end) = self.pending.iter().rposition(|b| *b == b'\n') else {
            return vec![];
        };
        let complete: Vec<u8> = self.pending.drain(..=end).collect();
        parse_stream_chunk(&String::from_utf8_lossy(&complete))
    }

    /// Whatever is left once the stream has ended.
    pub fn finish(&mut self) -> Vec<OpenAIStreamResponse> {
        let rest = std::mem::take(&mut self.pending);
        parse_stream_chunk(&String::from_utf8_lossy(&rest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_split_across_chunks_are_reassembled() {
        let event = r#"data: {"id":"c1","object":"chat.completion.chunk","created":1,"model":"m","choices":[{"index":0,"delta":{"content":"Hello."},"finish_reason":null}]}"#;
        let (head, tail) = event.split_at(40);

        let mut buffer = SseBuffer::default();
        assert!(buffer.push(head.as_bytes()).is_empty());
        let events = buffer.push(format!("{tail}\n\n").as_bytes());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].choices[0].delta.content.as_deref(), Some("Hello."));

        assert!(buffer.push(b"data: [DONE]\n\n").is_empty());
        assert!(buffer.finish().is_empty());
    }

    #[test]
    fn trailing_event_without_newline_is_kept_for_finish() {
        let event = r#"data: {"id":"c1","object":"chat.completion.chunk","created":1,"model":"m","choices":[{"index":0,"delta":{},"finish_reason":"stop"}]}"#;
        let mut buffer = SseBuffer::default();
        assert!(buffer.push(event.as_bytes()).is_empty());
        let events = buffer.finish();
        assert_eq!(events[0].choices[0].finish_reason.as_deref(), Some("stop"));
    }
}
