use crate::crm_types::Language;
use crate::error::{handle_error, AppError};
use crate::recording::CallRecorder;
use crate::tasks::{caller_context, manage_conversation, stream_twilio_audio_to_deepgram};
use crate::twilio_types::{
    wrap_twiml, ConnectAction, Connection, Response, ResponseAction, StartMeta, StreamAction,
    StreamParameter, StreamTrack, TwilioConnectPayload, TwilioMessage,
};
use crate::types::AppState;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Host, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
};
use futures_util::stream::{SplitSink, SplitStream, StreamExt};
use std::sync::{Arc, Mutex};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, client::IntoClientRequest},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, trace};

/// Capture the Twilio Start media message from the beginning of a Twilio websocket stream for the
/// stream id.
async fn get_twilio_start_meta(
    twilio_stream: &mut SplitStream<WebSocket>,
) -> Result<StartMeta, AppError> {
    loop {
        match twilio_stream.next().await {
            Some(msg) => match msg {
                Ok(Message::Text(json)) => match serde_json::from_str(&json) {
                    Ok(message) => match message {
                        TwilioMessage::Connected { protocol, version } => {
                            trace!("Got connected message with {protocol} and {version}");
                        }
                        TwilioMessage::Start {
                            start: start_meta, ..
                        } => {
                            break Ok(start_meta);
                        }
                        _ => {
                            break Err(AppError("At this point in a stream, we only expect a Connected message or a Start message.  Any others constitute an error."));
                        }
                    },
                    Err(e) => {
                        error!(error=%e, "failed to deserialize Twilio text message");
                        break Err(AppError("Error deserializing twilio text message"));
                    }
                },
                _ => {
                    break Err(AppError(
                        "Got unexpected websocket message type from Twilio!",
                    ));
                }
            },
            None => break Err(AppError("End of stream")),
        }
    }
}

/// Streaming transcription endpoint for a call held in `language`.
fn deepgram_listen_url(language: Language) -> String {
    let language = match language {
        Language::En => "en-US",
        Language::Uk => "uk",
    };
    format!(
        "wss://api.deepgram.com/v1/listen\
         ?model=nova-2\
         &language={language}\
         &encoding=mulaw\
         &sample_rate=8000\
         &interim_results=true\
         &smart_format=true\
         &endpointing=false"
    )
}

/// Open websocket connection to Deepgram.
async fn open_dg_stream(
    app_state: &Arc<AppState>,
    language: Language,
) -> Result<
    (
        SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, tungstenite::Message>,
        SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>,
    ),
    AppError,
> {
    trace!("Connecting to DG");
    let mut rq = deepgram_listen_url(language).into_client_request().map_err(|e| {
        error!(error=%e, "failed to build Deepgram request");
        AppError("Invalid Deepgram request")
    })?;
    let auth = http::header::HeaderValue::from_str(&format!(
        "Token {}",
        app_state.config.deepgram_api_key
    ))
    .map_err(|e| {
        error!(error=%e, "Deepgram api key is not a valid header value");
        AppError("Invalid Deepgram api key")
    })?;
    rq.headers_mut()
        .entry(http::header::AUTHORIZATION)
        .or_insert(auth);
    let (ws_stream, _) = connect_async(rq).await.map_err(|e| {
        error!(error=%e, "failed to connect to Deepgram");
        AppError("Failed to connect to Deepgram")
    })?;
    Ok(ws_stream.split())
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(app_state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| socket_handler(socket, app_state))
}

async fn socket_handler(socket: WebSocket, app_state: Arc<AppState>) {
    let (twilio_sink, mut twilio_stream) = socket.split();
    // Get Twilio stream id
    let start_meta = match get_twilio_start_meta(&mut twilio_stream).await {
        Ok(start_meta) => start_meta,
        Err(e) => {
            handle_error(e).await;
            return;
        }
    };
    debug!(meta = ?start_meta, "got start meta from twilio stream");

    // The caller's language decides how Deepgram listens
    let ctx = caller_context(&start_meta, &app_state).await;

    // Open streaming connection to DG
    let (dg_sink, dg_stream) = match open_dg_stream(&app_state, ctx.language()).await {
        Ok(dg) => dg,
        Err(e) => {
            handle_error(e).await;
            return;
        }
    };
    info!(language=?ctx.language(), "opened connection to Deepgram");

    // Both tasks run to the end so the call is always wrapped up and reported
    let recorder = Arc::new(Mutex::new(CallRecorder::default()));
    let call_sid = start_meta.call_sid.clone();
    let (audio_res, conversation_res) = tokio::join!(
        stream_twilio_audio_to_deepgram(
            twilio_stream,
            dg_sink,
            call_sid,
            recorder.clone(),
            app_state.clone()
        ),
        manage_conversation(
            dg_stream,
            twilio_sink,
            start_meta,
            ctx,
            recorder,
            app_state.clone()
        ),
    );
    if let Err(e) = audio_res {
        handle_error(e).await;
    }
    if let Err(e) = conversation_res {
        handle_error(e).await;
    }
}

pub async fn twiml_start_connect(
    Host(host): Host,
    State(app_state): State<Arc<AppState>>,
    body: String,
) -> impl IntoResponse {
    trace!(body=%body, "start request body");
    let payload = match serde_urlencoded::from_str::<TwilioConnectPayload>(&body) {
        Ok(payload) => payload,
        Err(e) => {
            error!(error=%e, "failed to deserialize Twilio connect payload");
            return (
                StatusCode::BAD_REQUEST,
                HeaderMap::new(),
                "Bad request".to_string(),
            );
        }
    };
    info!(
        call_sid=%payload.call_sid,
        from=%payload.from,
        to=%payload.to,
        status=?payload.call_status,
        direction=?payload.direction,
        "incoming call"
    );
    let from = payload.from.clone();
    {
        let mut streams = app_state
            .streams
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        streams.insert(payload.call_sid.clone(), payload);
    }

    let twiml = connect_twiml(&host, &from);
    trace!("twiml: '{}'", twiml);

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/xml"),
    );
    (StatusCode::OK, headers, twiml)
}

/// `<Connect><Stream>` to our websocket; the caller number rides along as a stream parameter.
fn connect_twiml(host: &str, from: &str) -> String {
    let stream_action = StreamAction {
        url: format!("wss://{}/connect", host),
        track: Some(StreamTrack::Inbound),
        parameters: vec![StreamParameter {
            name: "from".to_string(),
            value: from.to_string(),
        }],
        ..Default::default()
    };
    let connect_action = ConnectAction {
        connection: Connection::Stream(stream_action),
    };
    let response = Response {
        actions: vec![ResponseAction::Connect(connect_action)],
    };
    wrap_twiml(xmlserde::xml_serialize(response))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_twiml_has_no_greeting() {
        let twiml = connect_twiml("agent.example.com", "+380501112233");
        assert!(twiml.contains(r#"url="wss://agent.example.com/connect""#));
        assert!(!twiml.contains("<Say"));
    }

    #[test]
    fn deepgram_listens_in_call_language() {
        let url = deepgram_listen_url(Language::Uk);
        assert!(url.starts_with("wss://api.deepgram.com/v1/listen?model=nova-2&"));
        assert!(url.contains("&language=uk&"));
        assert!(url.contains("&encoding=mulaw&sample_rate=8000"));
        assert!(deepgram_listen_url(Language::En).contains("&language=en-US&"));
    }
}
