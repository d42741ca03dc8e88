use crate::crm_types::{
    AvailableDateSpansDto, BookRentalDto, ClientAccommodationDto, ClientDto, CompactRentalDto,
    CreateClientDto, Language, RentalEmergencyDetailsDto, RentalSettlementDetailsDto,
    UpdateClientNameDto, UpdateClientPreferencesDto, UpdateClientPreferredLanguageDto,
};
use crate::error::CrmError;

use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error};

/// Operations the call agent needs from the CRM manager.
#[async_trait]
pub trait CrmApi: Send + Sync {
    /// `Ok(None)` when nobody with that number is on file.
    async fn find_client_by_phone(&self, phone: &str) -> Result<Option<ClientDto>, CrmError>;
    async fn get_client_by_id(&self, id: &str) -> Result<ClientDto, CrmError>;
    async fn create_client(&self, dto: &CreateClientDto) -> Result<ClientDto, CrmError>;
    async fn update_client_name(&self, id: &str, dto: &UpdateClientNameDto)
        -> Result<(), CrmError>;
    async fn update_client_preferences(&self, id: &str, preferences: Vec<String>)
        -> Result<(), CrmError>;
    async fn update_client_preferred_language(
        &self,
        id: &str,
        language: Language,
    ) -> Result<(), CrmError>;
    /// `Ok(None)` when the client has no accommodation.
    async fn get_current_accommodation(
        &self,
        client_id: &str,
    ) -> Result<Option<ClientAccommodationDto>, CrmError>;
    async fn get_rentals(&self) -> Result<Vec<CompactRentalDto>, CrmError>;
    async fn get_rental_by_id(&self, id: &str) -> Result<CompactRentalDto, CrmError>;
    async fn get_rental_available_dates(
        &self,
        id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<AvailableDateSpansDto, CrmError>;
    async fn get_rental_emergency_details(
        &self,
        id: &str,
    ) -> Result<RentalEmergencyDetailsDto, CrmError>;
    async fn get_rental_settlement_details(
        &self,
        id: &str,
    ) -> Result<RentalSettlementDetailsDto, CrmError>;
    async fn create_booking(&self, dto: &BookRentalDto) -> Result<(), CrmError>;
    async fn confirm_settlement(&self, accommodation_id: &str) -> Result<(), CrmError>;
}

/// HTTP client for the CRM manager REST API.
pub struct CrmClient {
    base_url: String,
    http_client: reqwest::Client,
}

impl CrmClient {
    pub fn new(base_url: impl Into<String>, http_client: reqwest::Client) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            base_url,
            http_client,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&B>,
    ) -> Result<reqwest::Response, CrmError> {
        let mut rq = self.http_client.request(method.clone(), self.url(path));
        if !query.is_empty() {
            rq = rq.query(query);
        }
        if let Some(body) = body {
            rq = rq.json(body);
        }
        let resp = rq.send().await.map_err(|e| {
            error!(error=%e, %method, path, "failed to send request to crm");
            CrmError::Transport(e)
        })?;
        debug!(%method, path, status=%resp.status(), "crm response");
        if resp.status().is_success() {
            Ok(resp)
        } else {
            Err(api_error(resp).await)
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, CrmError> {
        let resp = self.send::<()>(Method::GET, path, &[], None).await?;
        decode(resp).await
    }

    /// Like `get_json`, but a 404 means "nothing there" rather than an error.
    async fn get_json_opt<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>, CrmError> {
        match self.get_json(path).await {
            Ok(value) => Ok(Some(value)),
            Err(CrmError::Api { status: 404, .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, CrmError> {
    let bytes = resp.bytes().await?;
    serde_json::from_slice(&bytes).map_err(|e| {
        error!(error=%e, body=%String::from_utf8_lossy(&bytes), "failed to decode crm response");
        CrmError::Decode(e.to_string())
    })
}

/// Turn a non-2xx response into `CrmError::Api`, preferring the JSON `message` field.
async fn api_error(resp: reqwest::Response) -> CrmError {
    let status = resp.status();
    let text = resp.text().await.unwrap_or_default();
    let message = error_message(status, &text);
    error!(status=%status, message=%message, "crm request failed");
    CrmError::Api {
        status: status.as_u16(),
        message,
    }
}

fn error_message(status: StatusCode, body: &str) -> String {
    let parsed = serde_json::from_str::<serde_json::Value>(body).ok();
    let message = parsed.as_ref().and_then(|v| match &v["message"] {
        serde_json::Value::String(s) => Some(s.clone()),
        // Nest validation errors come back as a list of messages
        serde_json::Value::Array(items) => Some(
            items
                .iter()
                .filter_map(|i| i.as_str())
                .collect::<Vec<_>>()
                .join("; "),
        ),
        _ => None,
    });
    match message {
        Some(m) if !m.is_empty() => m,
        _ if !body.trim().is_empty() => body.trim().to_string(),
        _ => status
            .canonical_reason()
            .unwrap_or("unknown error")
            .to_string(),
    }
}

#[async_trait]
impl CrmApi for CrmClient {
    async fn find_client_by_phone(&self, phone: &str) -> Result<Option<ClientDto>, CrmError> {
        self.get_json_opt(&format!("/clients/phone/{}", urlencoding::encode(phone)))
            .await
    }

    async fn get_client_by_id(&self, id: &str) -> Result<ClientDto, CrmError> {
        self.get_json(&format!("/clients/{}", urlencoding::encode(id)))
            .await
    }

    async fn create_client(&self, dto: &CreateClientDto) -> Result<ClientDto, CrmError> {
        let resp = self
            .send(Method::POST, "/clients", &[], Some(dto))
            .await?;
        decode(resp).await
    }

    async fn update_client_name(
        &self,
        id: &str,
        dto: &UpdateClientNameDto,
    ) -> Result<(), CrmError> {
        let path = format!("/clients/{}/name", urlencoding::encode(id));
        self.send(Method::PUT, &path, &[], Some(dto)).await?;
        Ok(())
    }

    async fn update_client_preferences(
        &self,
        id: &str,
        preferences: Vec<String>,
    ) -> Result<(), CrmError> {
        let path = format!("/clients/{}/preferences", urlencoding::encode(id));
        let dto = UpdateClientPreferencesDto { preferences };
        self.send(Method::PUT, &path, &[], Some(&dto)).await?;
        Ok(())
    }

    async fn update_client_preferred_language(
        &self,
        id: &str,
        language: Language,
    ) -> Result<(), CrmError> {
        let path = format!("/clients/{}/preferred-language", urlencoding::encode(id));
        let dto = UpdateClientPreferredLanguageDto { language };
        self.send(Method::PUT, &path, &[], Some(&dto)).await?;
        Ok(())
    }

    async fn get_current_accommodation(
        &self,
        client_id: &str,
    ) -> Result<Option<ClientAccommodationDto>, CrmError> {
        self.get_json_opt(&format!(
            "/clients/{}/current-accommodation",
            urlencoding::encode(client_id)
        ))
        .await
    }

    async fn get_rentals(&self) -> Result<Vec<CompactRentalDto>, CrmError> {
        self.get_json("/rentals").await
    }

    async fn get_rental_by_id(&self, id: &str) -> Result<CompactRentalDto, CrmError> {
        self.get_json_opt(&format!("/rentals/{}", urlencoding::encode(id)))
            .await?
            .ok_or(CrmError::NotFound("rental"))
    }

    async fn get_rental_available_dates(
        &self,
        id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<AvailableDateSpansDto, CrmError> {
        let path = format!("/rentals/{}/available-dates", urlencoding::encode(id));
        let query = [
            ("startDate", start.format("%Y-%m-%d").to_string()),
            ("endDate", end.format("%Y-%m-%d").to_string()),
        ];
        let resp = self.send::<()>(Method::GET, &path, &query, None).await?;
        decode(resp).await
    }

    async fn get_rental_emergency_details(
        &self,
        id: &str,
    ) -> Result<RentalEmergencyDetailsDto, CrmError> {
        self.get_json(&format!("/rentals/{}/emergency-details", urlencoding::encode(id)))
            .await
    }

    async fn get_rental_settlement_details(
        &self,
        id: &str,
    ) -> Result<RentalSettlementDetailsDto, CrmError> {
        self.get_json(&format!(
            "/rentals/{}/settlement-details",
            urlencoding::encode(id)
        ))
        .await
    }

    async fn create_booking(&self, dto: &BookRentalDto) -> Result<(), CrmError> {
        self.send(Method::POST, "/accommodations", &[], Some(dto))
            .await?;
        Ok(())
    }

    async fn confirm_settlement(&self, accommodation_id: &str) -> Result<(), CrmError> {
        let path = format!(
            "/accommodations/{}/confirm-settlement",
            urlencoding::encode(accommodation_id)
        );
        self.send::<()>(Method::POST, &path, &[], None).await?;
        Ok(())
    }
}
