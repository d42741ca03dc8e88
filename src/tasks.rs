use crate::config::Config;
use crate::consts::HANGUP_MARK;
use crate::context::{identify_caller, ConversationContext};
use crate::conversation_state::ConversationState;
use crate::deepgram_types::CLOSE_STREAM;
use crate::error::AppError;
use crate::events::{self, CallCompletedEvent};
use crate::flow_manager::FlowManager;
use crate::recording::CallRecorder;
use crate::storage::recording_key;
use crate::twilio_types::{MediaTrack, StartMeta, TwilioMessage};
use crate::types::AppState;
use crate::utils::b64_decode_to_buf;

use axum::extract::ws::{Message, WebSocket};
use chrono::Utc;
use futures_util::{
    sink::SinkExt,
    stream::{SplitSink, SplitStream, StreamExt},
};
use std::sync::{Arc, Mutex};
use tokio::net::TcpStream;
use tokio_tungstenite::{tungstenite, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type DgSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, tungstenite::Message>;
type DgStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Task that streams all Twilio media messages with encoded caller-side audio to Deepgram, and
/// keeps a copy for the call recording.
pub async fn stream_twilio_audio_to_deepgram(
    mut twilio_stream: SplitStream<WebSocket>,
    mut dg_sink: DgSink,
    call_sid: String,
    recorder: Arc<Mutex<CallRecorder>>,
    app_state: Arc<AppState>,
) -> Result<(), AppError> {
    let res = loop {
        match twilio_stream.next().await {
            Some(msg) => match msg {
                Ok(Message::Text(json)) => match serde_json::from_str(&json) {
                    Ok(message) => match message {
                        TwilioMessage::Media { media, .. } => {
                            if media.track != MediaTrack::Inbound {
                                continue;
                            }
                            let mut chunk = Vec::new();
                            if let Err(e) = b64_decode_to_buf(media.payload, &mut chunk) {
                                break Err(e);
                            }
                            recorder
                                .lock()
                                .unwrap_or_else(|poisoned| poisoned.into_inner())
                                .push_caller(&chunk);
                            dg_sink
                                .send(tungstenite::Message::Binary(chunk))
                                .await
                                .map_err(|e| {
                                    error!(error=%e, "failed to send audio to Deepgram");
                                    AppError("Failed to send audio to Deepgram")
                                })?;
                        }
                        TwilioMessage::Stop {
                            sequence_number,
                            stop,
                            ..
                        } => {
                            debug!(call_sid=%stop.call_sid, "Got stop message {sequence_number}");
                            break Ok(());
                        }
                        TwilioMessage::Mark { mark, .. } => {
                            debug!(mark=%mark.name, "got mark message");
                            if mark.name == HANGUP_MARK {
                                // Twilio follows up with a stop message once the call is over
                                if let Err(e) = complete_twilio_call(
                                    &app_state.http_client,
                                    &app_state.config,
                                    &call_sid,
                                )
                                .await
                                {
                                    warn!(error=%e, "failed to hang up call");
                                }
                            }
                        }
                        _ => {
                            break Err(AppError(
                                "We should not be getting Connected or Start messages now!",
                            ));
                        }
                    },
                    Err(e) => {
                        error!(error=%e, "failed to parse Twilio text message");
                        break Err(AppError("Failed to parse incoming text message"));
                    }
                },
                Ok(Message::Ping(_)) => (),
                Ok(Message::Close(_)) => {
                    info!("twilio closed the stream");
                    break Ok(());
                }
                Ok(m) => {
                    warn!(message=?m, "unsupported message type from Twilio");
                    continue;
                }
                Err(e) => {
                    error!(error=%e, "failed to receive message from Twilio");
                    break Err(AppError("Failed to receive message from Twilio stream"));
                }
            },
            None => {
                info!("end of twilio stream");
                break Ok(());
            }
        }
    };

    // lets Deepgram flush its last results and close, which ends the conversation task
    if let Err(e) = dg_sink
        .send(tungstenite::Message::Text(CLOSE_STREAM.to_string()))
        .await
    {
        warn!(error=%e, "failed to send CloseStream to Deepgram");
    }
    res
}

/// End the call through the Twilio REST API.
async fn complete_twilio_call(
    http_client: &reqwest::Client,
    config: &Config,
    call_sid: &str,
) -> Result<(), AppError> {
    let account_sid = &config.twilio_account_sid;
    let url = format!(
        "{}/2010-04-01/Accounts/{account_sid}/Calls/{call_sid}.json",
        config.twilio_api_base_url
    );
    let resp = http_client
        .post(url)
        .basic_auth(account_sid, Some(&config.twilio_auth_token))
        .form(&[("Status", "completed")])
        .send()
        .await
        .map_err(|e| {
            error!(error=%e, "failed to send hangup request to twilio");
            AppError("twilio calls api")
        })?;
    if !resp.status().is_success() {
        error!(status=%resp.status(), "twilio refused to complete call");
        return Err(AppError("twilio calls api"));
    }
    info!(call_sid, "call completed");
    Ok(())
}

/// Find out who is calling: the number comes from the cached connect payload, falling back to
/// the stream parameters, and is then looked up in the CRM.
pub async fn caller_context(start_meta: &StartMeta, app_state: &AppState) -> ConversationContext {
    // remove connect payload from app state cache
    let connect_payload = {
        let mut streams = app_state
            .streams
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        streams.remove(&start_meta.call_sid)
    };
    let phone_number = match connect_payload {
        Some(payload) => payload.from,
        None => {
            warn!(call_sid=%start_meta.call_sid, "no cached connect payload; using stream parameters");
            start_meta
                .custom_parameters
                .get("from")
                .cloned()
                .unwrap_or_default()
        }
    };
    identify_caller(&phone_number, app_state.crm.as_ref()).await
}

/// Task that handles the back and forth of the bot's interaction with a caller
pub async fn manage_conversation(
    mut dg_stream: DgStream,
    twilio_sink: SplitSink<WebSocket, Message>,
    twilio_start_meta: StartMeta,
    ctx: ConversationContext,
    recorder: Arc<Mutex<CallRecorder>>,
    app_state: Arc<AppState>,
) -> Result<(), AppError> {
    let flow = FlowManager::new(ctx, app_state.crm.clone());
    let mut state = ConversationState::new(
        twilio_start_meta.stream_sid,
        twilio_sink,
        flow,
        recorder.clone(),
        app_state.clone(),
    )
    .await?;
    state.start();

    // While a call is ongoing, we continuously loop over streaming responses from DG
    let res = loop {
        if let Some(res) = dg_stream.next().await {
            match res {
                Ok(dg_msg) => {
                    if let Err(e) = state.handle_dg_message(dg_msg).await {
                        break Err(e);
                    }
                }
                Err(e) => {
                    error!(error=%e, "failed to handle DG message");
                    break Err(AppError("dg stream error"));
                }
            }
        } else {
            debug!(twilio_stream=%state.twilio_stream_id, "dg stream completed");
            break Ok(());
        }
    };

    let flow = state.finish().await;
    let flow = flow.lock().await;
    let audio_file_id = upload_recording(&app_state, &recorder, &flow.context().recording_name()).await;
    let event = CallCompletedEvent::from_flow(&flow, audio_file_id);
    events::publish(
        &event,
        &app_state.http_client,
        app_state.config.call_events_url.as_deref(),
    )
    .await;

    res
}

/// Returns the object key of the uploaded recording, if there is one.
async fn upload_recording(
    app_state: &AppState,
    recorder: &Mutex<CallRecorder>,
    name: &str,
) -> Option<String> {
    let Some(store) = &app_state.recordings else {
        debug!("recording storage not configured");
        return None;
    };
    let wav = {
        let recorder = recorder
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if recorder.is_empty() {
            return None;
        }
        recorder.to_wav()
    };
    let wav = match wav {
        Ok(wav) => wav,
        Err(e) => {
            error!(error=%e, "failed to encode call recording");
            return None;
        }
    };
    let now = Utc::now();
    let key = recording_key(name, now);
    match store.put(&key, wav, "audio/wav", now).await {
        Ok(stored) => Some(stored),
        Err(e) => {
            error!(error=%e, key, "failed to upload call recording");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::config_for;
    use wiremock::matchers::{body_string, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn hangup_completes_call_through_rest_api() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/2010-04-01/Accounts/AC123/Calls/CA1.json"))
            // base64("AC123:tok")
            .and(header("authorization", "Basic QUMxMjM6dG9r"))
            .and(body_string("Status=completed"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "sid": "CA1",
                "status": "completed"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let config = config_for(&server.uri());
        complete_twilio_call(&reqwest::Client::new(), &config, "CA1")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn refused_hangup_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(404).set_body_json(serde_json::json!({
                "code": 20404,
                "message": "The requested resource was not found"
            })))
            .mount(&server)
            .await;

        let config = config_for(&server.uri());
        assert!(complete_twilio_call(&reqwest::Client::new(), &config, "CA404")
            .await
            .is_err());
    }
}
