mod config;
mod context;
mod conversation_state;
mod crm_client;
mod crm_types;
mod deepgram_types;
mod eligibility;
mod error;
mod events;
mod flow_manager;
mod flows;
mod handlers;
mod llm;
mod openai_types;
mod recording;
mod storage;
mod tasks;
mod tools;
mod tts_types;
mod twilio_types;
mod types;
mod utils;

use crate::config::Config;
use crate::crm_client::CrmClient;
use crate::storage::RecordingStore;
use crate::types::AppState;

use axum::{
    routing::{get, post},
    Router,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{error, info};
use tracing_subscriber::prelude::*;

pub mod consts {
    pub const ASCII_CLAUSE_ENDINGS: &[&str] = &[".", "?", "!", ";"];
    pub const GOOGLE_WAV_HEADER_SZ: usize = 58;
    pub const POLITENESS_DELAY_MILLIS: u128 = 1_500;
    /// Mark queued after the goodbye; once Twilio echoes it the call is hung up.
    pub const HANGUP_MARK: &str = "hangup";
    /// Completions per caller turn before we give up on a model that keeps calling tools.
    pub const MAX_TOOL_ROUNDS: usize = 4;
}

#[tokio::main]
async fn main() {
    let subscriber = tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_file(true)
                .with_line_number(true),
        )
        .with(tracing_subscriber::filter::Targets::new().with_targets([
            ("hyper", tracing_subscriber::filter::LevelFilter::OFF),
            (
                "rental_call_agent",
                tracing_subscriber::filter::LevelFilter::DEBUG,
            ),
        ]));
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("failed to install tracing subscriber: {e}");
    }

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error=%e, "invalid configuration");
            std::process::exit(1);
        }
    };

    let http_client = reqwest::Client::new();
    let crm = Arc::new(CrmClient::new(
        config.crm_manager_url.clone(),
        http_client.clone(),
    ));
    let recordings = config
        .recording_storage
        .clone()
        .map(|storage| RecordingStore::new(storage, http_client.clone()));
    if recordings.is_none() {
        info!("recording storage not configured; call recordings will be discarded");
    }
    let listen_addr = config.listen_addr;

    let app_state = Arc::new(AppState {
        config,
        http_client,
        crm,
        recordings,
        streams: Arc::new(Mutex::new(HashMap::new())),
    });

    let app = Router::new()
        .route("/connect", get(handlers::ws_handler))
        .route("/twilio/twiml/start", post(handlers::twiml_start_connect))
        .route("/", get(|| async { "Hello, World!" }))
        .with_state(app_state);

    info!(%listen_addr, "listening");
    if let Err(e) = axum::Server::bind(&listen_addr)
        .serve(app.into_make_service())
        .await
    {
        error!(error=%e, "server error");
    }
}
