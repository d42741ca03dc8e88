use crate::consts::{ASCII_CLAUSE_ENDINGS, HANGUP_MARK, MAX_TOOL_ROUNDS, POLITENESS_DELAY_MILLIS};
use crate::crm_types::Language;
use crate::deepgram_types::{StreamMessage, StreamingResponse};
use crate::error::AppError;
use crate::flow_manager::FlowManager;
use crate::llm::{stream_chat_completion, SseBuffer};
use crate::openai_types::{OpenAIMessage, OpenAITool, OpenAIToolCall, ToolCallAccumulator};
use crate::recording::CallRecorder;
use crate::twilio_types::{OutboundMarkMeta, TwilioOutbound};
use crate::types::{AppState, BotMedia, ConversationSignal, ConversationTurn, CurrentBotAction};
use crate::utils::{google_tts_to_mulaw, mulaw2twilio};

use axum::extract::ws::{Message, WebSocket};
use futures_util::{
    sink::SinkExt,
    stream::{SplitSink, StreamExt},
};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio::task;
use tokio::time::sleep;
use tokio_tungstenite::tungstenite;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub struct ConversationState {
    /// Short acknowledgement played when the caller stops talking, as raw μ-law
    pub pause_msg: Vec<u8>,
    /// Place to store spawned task handles for duration of caller interaction
    pub join_handles: Vec<task::JoinHandle<Result<(), AppError>>>,
    /// How we track whether we are currently speaking or listening
    pub current_bot_action: CurrentBotAction,
    /// The caller's current turn and the task collecting it
    pub current_turn: Option<(Arc<ConversationTurn>, task::JoinHandle<Result<(), AppError>>)>,
    /// Structure to measure how long since the caller has paused
    pub last_talking: Instant,
    /// The stream id collected from the Twilio Media message stream
    pub twilio_stream_id: String,
    /// The request id for our Deepgram stream; we won't know this until the end of the stream
    pub dg_request_id: Option<Uuid>,
    /// Task by which, when talking, we are sending Media messages to Twilio.  It is decoupled from
    /// the main `twilio_sink`, and made Option, in order to facilitate stopping talking when the
    /// caller cuts us off, but still collect a complete response from OpenAI for complete context.
    pub current_twilio_media_message_stream: Option<task::JoinHandle<Result<(), AppError>>>,
    /// Sink by which we send TwilioOutbound messages to the main `twilio_sink` manager
    pub twilio_outbound_sink: mpsc::Sender<TwilioOutbound>,
    /// Conversation graph; held by at most one bot turn at a time
    pub flow: Arc<Mutex<FlowManager>>,
    pub recorder: Arc<StdMutex<CallRecorder>>,
    pub app_state: Arc<AppState>,
}

fn pause_phrase(language: Language) -> &'static str {
    match language {
        Language::Uk => "Зрозуміло.",
        Language::En => "Got it.",
    }
}

impl ConversationState {
    pub async fn new(
        twilio_stream_id: String,
        twilio_sink: SplitSink<WebSocket, Message>,
        flow: FlowManager,
        recorder: Arc<StdMutex<CallRecorder>>,
        app_state: Arc<AppState>,
    ) -> Result<Self, AppError> {
        let language = flow.context().language();
        let pause_tts = app_state
            .get_google_tts(pause_phrase(language), language)
            .await?;
        let pause_msg = google_tts_to_mulaw(pause_tts)?;
        let mut join_handles: Vec<task::JoinHandle<Result<(), AppError>>> = vec![];
        let (twilio_outbound_sink, twilio_outbound_stream) = mpsc::channel(1);
        let twilio_ws_message_handle =
            tokio::spawn(send_twilio_ws_messages(twilio_outbound_stream, twilio_sink));
        join_handles.push(twilio_ws_message_handle);

        Ok(Self {
            pause_msg,
            join_handles,
            current_bot_action: CurrentBotAction::Talking,
            current_turn: None,
            last_talking: Instant::now(),
            twilio_stream_id,
            dg_request_id: None,
            current_twilio_media_message_stream: None,
            twilio_outbound_sink,
            flow: Arc::new(Mutex::new(flow)),
            recorder,
            app_state,
        })
    }

    /// The assistant opens the call with the initial node's greeting.
    pub fn start(&mut self) {
        self.current_bot_action = CurrentBotAction::Talking;
        self.spawn_bot_side(None);
    }

    fn spawn_bot_side(&mut self, caller_text: Option<String>) {
        let (media_sink, media_stream) = mpsc::channel::<BotMedia>(1);
        let handle = tokio::spawn(bot_side_manager(
            self.flow.clone(),
            caller_text,
            media_sink,
            self.app_state.clone(),
        ));
        self.join_handles.push(handle);
        let media_message_stream_handle = tokio::spawn(send_twilio_media_messages_until_aborted(
            media_stream,
            self.twilio_stream_id.clone(),
            self.twilio_outbound_sink.clone(),
            self.recorder.clone(),
        ));
        self.current_twilio_media_message_stream = Some(media_message_stream_handle);
    }

    async fn send_pause_msg(&self) -> Result<(), AppError> {
        lock_recorder(&self.recorder).push_assistant(&self.pause_msg);
        self.twilio_outbound_sink
            .send(mulaw2twilio(&self.pause_msg, &self.twilio_stream_id))
            .await
            .map_err(|e| {
                error!(error=%e, "failed to send pause message to twilio");
                AppError("Error sending twilio outbound message")
            })
    }

    /// Logic that controls the bot's action when we detect that the user is listening while we are
    /// listening
    async fn caller_listens_while_we_are_listening(&mut self) -> Result<(), AppError> {
        match &self.current_bot_action {
            CurrentBotAction::Listening(turn_sink) => {
                let since_last_talking = self.last_talking.elapsed().as_millis();
                // If not enough time has passed to give the caller polite space, then do
                // nothing.
                if since_last_talking < POLITENESS_DELAY_MILLIS {
                    return Ok(());
                }
                // Otherwise, acknowledge the caller...
                self.send_pause_msg().await?;
                // and prepare a response
                turn_sink.send(ConversationSignal::Go).await.map_err(|e| {
                    error!(error=%e, "failed to send message to turn handler");
                    AppError("Failed to stop message to turn manager.")
                })?;
                self.current_bot_action = CurrentBotAction::Talking;
                let caller_text = match self.current_turn.take() {
                    Some((turn, handle)) => {
                        match handle.await {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => warn!(error=%e, "caller side manager failed"),
                            Err(e) => warn!(error=%e, "caller side manager did not finish"),
                        }
                        let text = turn.caller_side.read().await;
                        text.clone()
                    }
                    None => String::new(),
                };
                debug!(caller=%caller_text, "caller finished talking");
                self.spawn_bot_side(Some(caller_text));

                Ok(())
            }
            CurrentBotAction::Talking => Err(AppError("Conversation state out of whack")),
        }
    }

    /// Logic that controls the bot's action when we detect that the user is talking while we
    /// are listening
    async fn caller_speaks_while_we_are_listening(
        &mut self,
        streaming_response: StreamingResponse,
    ) -> Result<(), AppError> {
        match &self.current_bot_action {
            CurrentBotAction::Listening(turn_sink) => {
                self.last_talking = Instant::now();
                turn_sink
                    .send(ConversationSignal::StreamingResponse(streaming_response))
                    .await
                    .map_err(|e| {
                        error!(error=%e, "failed to send transcript to turn manager");
                        AppError("Failed to send transcript to turn manager.")
                    })
            }
            CurrentBotAction::Talking => Err(AppError("Conversation state out of whack")),
        }
    }

    /// Logic that controls the bot's action when we detect that the user starts talking while we
    /// are talking
    async fn caller_speaks_while_we_are_talking(
        &mut self,
        streaming_response: StreamingResponse,
    ) -> Result<(), AppError> {
        // 1. send twilio clear message and shut up
        if let Some(handle) = self.current_twilio_media_message_stream.take() {
            let outbound_clear = TwilioOutbound::Clear {
                stream_sid: self.twilio_stream_id.clone(),
            };
            self.twilio_outbound_sink
                .send(outbound_clear)
                .await
                .map_err(|e| {
                    error!(error=%e, "failed to send clear message to twilio");
                    AppError("Error sending twilio outbound message")
                })?;
            handle.abort();
            lock_recorder(&self.recorder).truncate_assistant();
        }
        // 2. change state to listening and start a new turn
        self.last_talking = Instant::now();
        let (turn_sink, turn_stream) = mpsc::channel::<ConversationSignal>(1);
        turn_sink
            .send(ConversationSignal::StreamingResponse(streaming_response))
            .await
            .map_err(|e| {
                error!(error=%e, "failed to send transcript via channel");
                AppError("Failed to send transcript to turn manager.")
            })?;
        self.current_bot_action = CurrentBotAction::Listening(turn_sink);
        let turn = Arc::new(ConversationTurn::new());
        // 3. spawn turn manager -> handler
        let handle = tokio::spawn(caller_side_manager(turn.clone(), turn_stream));
        self.current_turn = Some((turn, handle));

        Ok(())
    }

    /// Decisions about next actions are a function of our current state (talking/listening) and
    /// what we get back from DG
    pub async fn handle_dg_message(
        &mut self,
        dg_msg: tungstenite::Message,
    ) -> Result<(), AppError> {
        match dg_msg {
            tungstenite::Message::Text(msg) => {
                let stream_message = serde_json::from_str::<StreamMessage>(&msg).map_err(|e| {
                    error!(msg=%msg, error=%e, "failed to deserialize DG stream message");
                    AppError("deserialization error")
                })?;
                match stream_message {
                    StreamMessage::StreamingResponse(streaming_response) => {
                        let is_empty = streaming_response.transcript().is_empty();
                        debug!(transcript=%streaming_response.transcript(), "got dg text message");
                        match (&self.current_bot_action, is_empty) {
                            (CurrentBotAction::Listening(_), true) => {
                                self.caller_listens_while_we_are_listening().await
                            }
                            (CurrentBotAction::Listening(_), false) => {
                                self.caller_speaks_while_we_are_listening(streaming_response)
                                    .await
                            }
                            (CurrentBotAction::Talking, true) => Ok(()),
                            (CurrentBotAction::Talking, false) => {
                                self.caller_speaks_while_we_are_talking(streaming_response)
                                    .await
                            }
                        }
                    }
                    StreamMessage::StreamingMeta(streaming_meta) => {
                        self.dg_request_id = Some(streaming_meta.request_id);
                        Ok(())
                    }
                    StreamMessage::Other => Ok(()),
                }
            }
            _ => Ok(()),
        }
    }

    /// Wait (briefly) for in-flight turns to settle and hand back the conversation.
    pub async fn finish(self) -> Arc<Mutex<FlowManager>> {
        let Self {
            join_handles,
            current_turn,
            twilio_outbound_sink,
            flow,
            dg_request_id,
            ..
        } = self;
        info!(dg_request_id=?dg_request_id, "conversation finished");
        // the websocket writer exits once every sender is gone
        drop(twilio_outbound_sink);
        if let Some((_, handle)) = current_turn {
            handle.abort();
        }
        // wait up to 5 seconds for all unfinished tasks to complete
        let mut tries = 0;
        while tries < 5 && !join_handles.iter().all(|h| h.is_finished()) {
            tries += 1;
            sleep(Duration::from_millis(1_000)).await;
        }
        for handle in join_handles.iter().filter(|h| !h.is_finished()) {
            warn!("aborting unfinished conversation task");
            handle.abort();
        }
        flow
    }
}

fn lock_recorder(recorder: &StdMutex<CallRecorder>) -> std::sync::MutexGuard<'_, CallRecorder> {
    recorder.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Task that is the funnel of all TwilioOutbound messages going to Twilio.
async fn send_twilio_ws_messages(
    mut twilio_outbound_stream: mpsc::Receiver<TwilioOutbound>,
    mut twilio_ws_sink: SplitSink<WebSocket, Message>,
) -> Result<(), AppError> {
    while let Some(twilio_outbound) = twilio_outbound_stream.recv().await {
        let json = serde_json::to_string(&twilio_outbound).map_err(|e| {
            error!(error=%e, "failed to serialize Twilio outbound");
            AppError("Twilio message serialization error")
        })?;
        let message = Message::Text(json);
        twilio_ws_sink.send(message).await.map_err(|e| {
            error!(error=%e, "failed to send message to Twilio");
            AppError("Failed to send message to Twilio")
        })?;
    }

    Ok(())
}

/// One assistant turn: completions with tool calls until the model answers in words.
async fn bot_side_manager(
    flow: Arc<Mutex<FlowManager>>,
    caller_text: Option<String>,
    media_sink: mpsc::Sender<BotMedia>,
    app_state: Arc<AppState>,
) -> Result<(), AppError> {
    let mut flow = flow.lock().await;
    if let Some(caller_text) = caller_text {
        flow.record_user(&caller_text);
    }

    for round in 1..=MAX_TOOL_ROUNDS {
        let language = flow.context().language();
        let reply = complete_and_speak(
            flow.messages(),
            flow.tools(),
            language,
            &media_sink,
            &app_state,
        )
        .await?;
        if reply.tool_calls.is_empty() {
            flow.record_assistant(&reply.content);
            break;
        }
        debug!(round, calls = reply.tool_calls.len(), node = flow.node().name, "running tool calls");
        flow.record_tool_calls(Some(reply.content), reply.tool_calls.clone());
        let now = app_state.config.rental_now();
        for call in &reply.tool_calls {
            flow.handle_tool_call(call, now).await;
        }
        if round == MAX_TOOL_ROUNDS {
            warn!(node = flow.node().name, "tool round limit reached without a spoken reply");
        }
    }

    // end_call in the last round still owes the caller a goodbye
    if flow.node().ends_conversation() && !flow.should_end() {
        let language = flow.context().language();
        let reply = complete_and_speak(
            flow.messages(),
            flow.tools(),
            language,
            &media_sink,
            &app_state,
        )
        .await?;
        flow.record_assistant(&reply.content);
    }

    if flow.should_end() {
        info!("goodbye queued; hanging up once it has played");
        // a closed channel means the caller cut us off; they get another turn instead
        let _ = media_sink.send(BotMedia::Mark(HANGUP_MARK)).await;
    }

    Ok(())
}

struct ModelReply {
    content: String,
    tool_calls: Vec<OpenAIToolCall>,
}

/// Stream one completion, speaking text at clause endings and collecting any tool calls.
async fn complete_and_speak(
    messages: Vec<OpenAIMessage>,
    tools: Vec<OpenAITool>,
    language: Language,
    media_sink: &mpsc::Sender<BotMedia>,
    app_state: &AppState,
) -> Result<ModelReply, AppError> {
    let resp = stream_chat_completion(
        &app_state.http_client,
        &app_state.config.openai_base_url,
        &app_state.config.openai_api_key,
        &app_state.config.openai_model,
        messages,
        tools,
    )
    .await?;
    let mut response_stream = resp.bytes_stream();
    let mut sse = SseBuffer::default();
    let mut content = String::new();
    let mut chat_buffer = String::new();
    let mut tool_calls = ToolCallAccumulator::default();
    let mut stream_done = false;

    while !stream_done {
        let responses = match response_stream.next().await {
            Some(Ok(chunk)) => sse.push(&chunk),
            Some(Err(e)) => {
                error!(error=%e, "failed to read bytes from OpenAI response");
                return Err(AppError(
                    "Error getting bytes chunk from OpenAI response stream",
                ));
            }
            None => {
                stream_done = true;
                sse.finish()
            }
        };
        for response in responses {
            let Some(choice) = response.choices.into_iter().next() else {
                continue;
            };
            if let Some(role) = &choice.delta.role {
                if role != "assistant" {
                    warn!(role=%role, "got openai delta with unexpected role");
                }
            }
            for delta in &choice.delta.tool_calls {
                tool_calls.push(delta);
            }
            if let Some(text) = &choice.delta.content {
                content.push_str(text);
                chat_buffer.push_str(text);
                if ends_clause(text) {
                    let tts_text = std::mem::take(&mut chat_buffer);
                    speak(&tts_text, language, media_sink, app_state).await;
                }
            }
        }
    }
    speak(&chat_buffer, language, media_sink, app_state).await;

    Ok(ModelReply {
        content,
        tool_calls: tool_calls.finish(),
    })
}

fn ends_clause(delta: &str) -> bool {
    let delta = delta.trim_end();
    ASCII_CLAUSE_ENDINGS.iter().any(|e| delta.ends_with(e))
}

async fn speak(
    text: &str,
    language: Language,
    media_sink: &mpsc::Sender<BotMedia>,
    app_state: &AppState,
) {
    // nobody is listening after a barge-in; the text still lands in the history
    if text.trim().is_empty() || media_sink.is_closed() {
        return;
    }
    let mulaw = match app_state.get_google_tts(text, language).await {
        Ok(payload) => google_tts_to_mulaw(payload),
        Err(e) => Err(e),
    };
    match mulaw {
        Ok(mulaw) => {
            debug!("got google tts payload");
            let _ = media_sink.send(BotMedia::Audio(mulaw)).await;
        }
        Err(e) => warn!(error=%e, text, "skipping unspeakable text"),
    }
}

async fn send_twilio_media_messages_until_aborted(
    mut media_stream: mpsc::Receiver<BotMedia>,
    stream_id: String,
    twilio_outbound_sink: mpsc::Sender<TwilioOutbound>,
    recorder: Arc<StdMutex<CallRecorder>>,
) -> Result<(), AppError> {
    while let Some(media) = media_stream.recv().await {
        let twilio_msg = match media {
            BotMedia::Audio(mulaw) => {
                debug!("sending tts to twilio");
                lock_recorder(&recorder).push_assistant(&mulaw);
                mulaw2twilio(&mulaw, &stream_id)
            }
            BotMedia::Mark(name) => TwilioOutbound::Mark {
                mark: OutboundMarkMeta {
                    name: name.to_string(),
                },
                stream_sid: stream_id.clone(),
            },
        };
        twilio_outbound_sink.send(twilio_msg).await.map_err(|e| {
            error!(error=%e, "failed to send twilio outbound message through channel");
            AppError("Error sending twilio outbound through channel")
        })?;
    }

    Ok(())
}

async fn extend_caller_side(turn: &Arc<ConversationTurn>, chunk: &str) {
    let mut buf = turn.caller_side.write().await;
    if !buf.is_empty() {
        buf.push(' ');
    }
    buf.push_str(chunk);
}

async fn caller_side_manager(
    turn: Arc<ConversationTurn>,
    mut turn_stream: mpsc::Receiver<ConversationSignal>,
) -> Result<(), AppError> {
    while let Some(signal) = turn_stream.recv().await {
        match signal {
            ConversationSignal::Go => break,
            ConversationSignal::StreamingResponse(streaming_response) => {
                if streaming_response.is_final {
                    extend_caller_side(&turn, streaming_response.transcript()).await
                }
            }
        }
    }

    Ok(())
}
