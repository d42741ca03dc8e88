use crate::flow_manager::FlowManager;
use crate::flows::Intent;

use serde::Serialize;
use tracing::{error, info, warn};

#[derive(Serialize, Clone, Copy, PartialEq, Eq, Debug)]
#[serde(rename_all = "lowercase")]
pub enum SpeakerRole {
    User,
    Assistant,
}

#[derive(Serialize, Clone, PartialEq, Debug)]
pub struct TranscriptReplica {
    pub role: SpeakerRole,
    pub text: String,
}

/// Summary of a finished call, emitted once for downstream reporting.
#[derive(Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CallCompletedEvent {
    pub intent: Option<Intent>,
    pub client_id: Option<String>,
    pub accommodation_id: Option<String>,
    pub caller_phone_number: String,
    pub transcript: Vec<TranscriptReplica>,
    /// Object key of the recording in the bucket
    pub audio_file_id: Option<String>,
}

impl CallCompletedEvent {
    pub fn from_flow(flow: &FlowManager, audio_file_id: Option<String>) -> Self {
        let ctx = flow.context();
        let transcript = flow
            .history()
            .iter()
            .filter_map(|m| {
                let role = match m.role.as_str() {
                    "user" => SpeakerRole::User,
                    "assistant" => SpeakerRole::Assistant,
                    _ => return None,
                };
                let text = m.content.as_deref()?.trim();
                (!text.is_empty()).then(|| TranscriptReplica {
                    role,
                    text: text.to_string(),
                })
            })
            .collect();
        Self {
            intent: ctx.intent,
            client_id: ctx.client_id().map(str::to_string),
            accommodation_id: ctx.accommodation_id().map(str::to_string),
            caller_phone_number: ctx.phone_number.clone(),
            transcript,
            audio_file_id,
        }
    }
}

/// Log the event and, when a webhook is configured, deliver it there. Delivery is best effort.
pub async fn publish(
    event: &CallCompletedEvent,
    http_client: &reqwest::Client,
    webhook_url: Option<&str>,
) {
    match serde_json::to_string(event) {
        Ok(json) => info!(event=%json, "call completed"),
        Err(e) => error!(error=%e, "failed to serialize call completed event"),
    }
    let Some(url) = webhook_url else {
        return;
    };
    match http_client.post(url).json(event).send().await {
        Ok(resp) if resp.status().is_success() => {}
        Ok(resp) => warn!(status=%resp.status(), "call events webhook rejected event"),
        Err(e) => error!(error=%e, "failed to deliver call completed event"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ConversationContext;
    use crate::crm_client::testing::{sample_accommodation, sample_client, FakeCrm};
    use crate::openai_types::{OpenAIFunctionCall, OpenAIToolCall};
    use chrono::NaiveDate;
    use std::sync::Arc;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn finished_flow() -> FlowManager {
        let mut ctx = ConversationContext::new("+380501112233");
        ctx.client = Some(sample_client());
        ctx.accommodation = Some(sample_accommodation("settled"));
        let mut flow = FlowManager::new(ctx, Arc::new(FakeCrm::default()));
        flow.record_assistant("Hello Olena, how can I help?");
        flow.record_user("The kitchen is flooding!");
        let call = OpenAIToolCall {
            id: "call_1".into(),
            kind: "function".into(),
            function: OpenAIFunctionCall {
                name: "route_by_intent".into(),
                arguments: r#"{"intent":"info-or-emergency"}"#.into(),
            },
        };
        flow.record_tool_calls(None, vec![call.clone()]);
        let now = NaiveDate::from_ymd_opt(2025, 5, 3)
            .unwrap()
            .and_hms_opt(22, 0, 0)
            .unwrap();
        flow.handle_tool_call(&call, now).await;
        flow.record_assistant("Please close the main water valve under the sink.");
        flow
    }

    #[tokio::test]
    async fn event_carries_context_and_spoken_transcript() {
        let flow = finished_flow().await;
        let key = "Olena_Shevchenko_conversation_recording20250503_220000.wav";
        let event = CallCompletedEvent::from_flow(&flow, Some(key.into()));
        assert_eq!(event.intent, Some(Intent::InfoOrEmergency));
        assert_eq!(event.client_id.as_deref(), Some("c-1"));
        assert_eq!(event.accommodation_id.as_deref(), Some("acc-1"));
        assert_eq!(event.transcript.len(), 3);
        assert_eq!(event.transcript[1].role, SpeakerRole::User);
    }

    #[tokio::test]
    async fn event_serializes_to_post_processing_shape() {
        let flow = finished_flow().await;
        let key = "Olena_Shevchenko_conversation_recording20250503_220000.wav";
        let value = serde_json::to_value(CallCompletedEvent::from_flow(&flow, Some(key.into()))).unwrap();
        assert_eq!(value["intent"], "info-or-emergency");
        assert_eq!(value["clientId"], "c-1");
        assert_eq!(value["accommodationId"], "acc-1");
        assert_eq!(value["callerPhoneNumber"], "+380501112233");
        assert_eq!(value["audioFileId"], key);
        assert_eq!(value["transcript"][0]["role"], "assistant");
        assert_eq!(value["transcript"][1]["role"], "user");
        assert!(value.get("client_id").is_none());
    }

    #[tokio::test]
    async fn publish_posts_to_webhook() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/events"))
            .and(body_partial_json(serde_json::json!({"clientId": "c-1"})))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let flow = finished_flow().await;
        let event = CallCompletedEvent::from_flow(&flow, None);
        let url = format!("{}/events", server.uri());
        publish(&event, &reqwest::Client::new(), Some(&url)).await;
    }
}
