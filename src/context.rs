use crate::crm_client::CrmApi;
use crate::crm_types::{ClientAccommodationDto, ClientDto, Language};
use crate::flows::Intent;

use tracing::{info, warn};

/// Everything we learn about the caller during a single call.
#[derive(Debug, Clone)]
pub struct ConversationContext {
    pub phone_number: String,
    pub client: Option<ClientDto>,
    /// Fetched once at call start; not refreshed unless a tool asks for it again.
    pub accommodation: Option<ClientAccommodationDto>,
    pub intent: Option<Intent>,
    /// Language the call is held in; STT, TTS and prompts all follow it.  Chosen once at call
    /// start from the client's preference; a preference saved mid-call applies from the next call.
    pub call_language: Language,
}

impl ConversationContext {
    pub fn new(phone_number: impl Into<String>) -> Self {
        Self {
            phone_number: phone_number.into(),
            client: None,
            accommodation: None,
            intent: None,
            call_language: Language::En,
        }
    }

    pub fn is_identified(&self) -> bool {
        self.client.is_some()
    }

    pub fn client_id(&self) -> Option<&str> {
        self.client.as_ref().map(|c| c.id.as_str())
    }

    pub fn language(&self) -> Language {
        self.call_language
    }

    pub fn accommodation_id(&self) -> Option<&str> {
        self.accommodation.as_ref().map(|a| a.id.as_str())
    }

    /// Name used for recording keys: the client's full name, or the phone number when unknown.
    pub fn recording_name(&self) -> String {
        let raw = match &self.client {
            Some(client) => client.full_name(),
            None => self.phone_number.clone(),
        };
        raw.split_whitespace()
            .collect::<Vec<_>>()
            .join("_")
            .chars()
            .filter(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '+'))
            .collect()
    }
}

/// Look the caller up by phone number and load their current accommodation.
///
/// CRM failures are logged and leave the caller unidentified; the call goes on regardless.
pub async fn identify_caller(phone_number: &str, crm: &dyn CrmApi) -> ConversationContext {
    let mut ctx = ConversationContext::new(phone_number);
    let client = match crm.find_client_by_phone(phone_number).await {
        Ok(client) => client,
        Err(e) => {
            warn!(error=%e, "failed to look up caller");
            None
        }
    };
    let Some(client) = client else {
        info!("caller is not in the crm");
        return ctx;
    };
    info!(client_id=%client.id, "identified caller");
    match crm.get_current_accommodation(&client.id).await {
        Ok(accommodation) => ctx.accommodation = accommodation,
        Err(e) => warn!(error=%e, client_id=%client.id, "failed to load current accommodation"),
    }
    if let Some(language) = client.preferred_language {
        ctx.call_language = language;
    }
    ctx.client = Some(client);
    ctx
}
