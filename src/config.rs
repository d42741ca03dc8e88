use crate::error::ConfigError;

use chrono::{FixedOffset, Local, NaiveDateTime, Utc};
use std::env;
use std::net::SocketAddr;

const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";
const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:3000";
const DEFAULT_S3_REGION: &str = "us-east-1";
const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_GOOGLE_TTS_BASE_URL: &str = "https://texttospeech.googleapis.com";
const DEFAULT_TWILIO_API_BASE_URL: &str = "https://api.twilio.com";

/// Where finished call recordings go.  Only present when a bucket and credentials are configured.
#[derive(Clone, Debug)]
pub struct RecordingStorageConfig {
    pub bucket: String,
    /// Custom endpoint for S3-compatible stores (localstack, minio).  `None` means AWS.
    pub endpoint: Option<String>,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub deepgram_api_key: String,
    pub openai_api_key: String,
    pub openai_model: String,
    pub openai_base_url: String,
    pub google_tts_api_key: String,
    pub google_tts_base_url: String,
    pub twilio_account_sid: String,
    pub twilio_auth_token: String,
    pub twilio_api_base_url: String,
    pub crm_manager_url: String,
    pub listen_addr: SocketAddr,
    pub recording_storage: Option<RecordingStorageConfig>,
    pub call_events_url: Option<String>,
    /// UTC offset of the rentals; check-in and checkout hours are judged in it.  `None` uses the
    /// server clock.
    pub rental_utc_offset: Option<FixedOffset>,
}

impl Config {
    /// Read configuration from the process environment, after loading `.env` if there is one.
    pub fn from_env() -> Result<Self, ConfigError> {
        // a missing .env is fine; the variables may come from the environment itself
        let _ = dotenvy::dotenv();
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let required = |name: &'static str| {
            lookup(name)
                .filter(|v| !v.trim().is_empty())
                .ok_or(ConfigError::Missing(name))
        };
        let optional = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let listen_addr = optional("LISTEN_ADDR")
            .unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string())
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::Invalid {
                name: "LISTEN_ADDR",
                reason: e.to_string(),
            })?;

        let recording_storage = match (
            optional("S3_BUCKET"),
            optional("AWS_ACCESS_KEY_ID"),
            optional("AWS_SECRET_ACCESS_KEY"),
        ) {
            (Some(bucket), Some(access_key_id), Some(secret_access_key)) => {
                Some(RecordingStorageConfig {
                    bucket,
                    endpoint: optional("S3_ENDPOINT"),
                    region: optional("S3_REGION")
                        .unwrap_or_else(|| DEFAULT_S3_REGION.to_string()),
                    access_key_id,
                    secret_access_key,
                })
            }
            _ => None,
        };

        let rental_utc_offset = optional("RENTAL_UTC_OFFSET")
            .map(|v| {
                v.trim().parse::<FixedOffset>().map_err(|e| ConfigError::Invalid {
                    name: "RENTAL_UTC_OFFSET",
                    reason: e.to_string(),
                })
            })
            .transpose()?;

        Ok(Self {
            deepgram_api_key: required("DEEPGRAM_API_KEY")?,
            openai_api_key: required("OPENAI_API_KEY")?,
            openai_model: optional("OPENAI_MODEL")
                .unwrap_or_else(|| DEFAULT_OPENAI_MODEL.to_string()),
            openai_base_url: base_url(optional("OPENAI_BASE_URL"), DEFAULT_OPENAI_BASE_URL),
            google_tts_api_key: required("GOOGLE_TTS_API_KEY")?,
            google_tts_base_url: base_url(
                optional("GOOGLE_TTS_BASE_URL"),
                DEFAULT_GOOGLE_TTS_BASE_URL,
            ),
            twilio_account_sid: required("TWILIO_ACCOUNT_SID")?,
            twilio_auth_token: required("TWILIO_AUTH_TOKEN")?,
            twilio_api_base_url: base_url(
                optional("TWILIO_API_BASE_URL"),
                DEFAULT_TWILIO_API_BASE_URL,
            ),
            crm_manager_url: required("CRM_MANAGER_URL")?,
            listen_addr,
            recording_storage,
            call_events_url: optional("CALL_EVENTS_URL"),
            rental_utc_offset,
        })
    }

    /// Wall-clock time where the rentals are.
    pub fn rental_now(&self) -> NaiveDateTime {
        match self.rental_utc_offset {
            Some(offset) => Utc::now().with_timezone(&offset).naive_local(),
            None => Local::now().naive_local(),
        }
    }
}

fn base_url(value: Option<String>, default: &str) -> String {
    value
        .as_deref()
        .unwrap_or(default)
        .trim_end_matches('/')
        .to_string()
}

/// Configuration with every external service pointed at `base` (a mock server).
#[cfg(test)]
pub(crate) fn config_for(base: &str) -> Config {
    Config {
        deepgram_api_key: "dg".into(),
        openai_api_key: "oa".into(),
        openai_model: DEFAULT_OPENAI_MODEL.into(),
        openai_base_url: format!("{base}/v1"),
        google_tts_api_key: "gtts".into(),
        google_tts_base_url: base.into(),
        twilio_account_sid: "AC123".into(),
        twilio_auth_token: "tok".into(),
        twilio_api_base_url: base.into(),
        crm_manager_url: base.into(),
        listen_addr: DEFAULT_LISTEN_ADDR.parse().unwrap(),
        recording_storage: None,
        call_events_url: None,
        rental_utc_offset: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn base_env() -> HashMap<&'static str, &'static str> {
        HashMap::from([
            ("DEEPGRAM_API_KEY", "dg"),
            ("OPENAI_API_KEY", "oa"),
            ("GOOGLE_TTS_API_KEY", "gtts"),
            ("TWILIO_ACCOUNT_SID", "AC123"),
            ("TWILIO_AUTH_TOKEN", "tok"),
            ("CRM_MANAGER_URL", "http://localhost:3001"),
        ])
    }

    fn load(vars: &HashMap<&'static str, &'static str>) -> Result<Config, ConfigError> {
        Config::from_lookup(|name| vars.get(name).map(|v| v.to_string()))
    }

    #[test]
    fn defaults_apply_when_optional_values_missing() {
        let config = load(&base_env()).unwrap();
        assert_eq!(config.openai_model, DEFAULT_OPENAI_MODEL);
        assert_eq!(config.listen_addr.port(), 3000);
        assert!(config.recording_storage.is_none());
        assert!(config.call_events_url.is_none());
        assert_eq!(config.openai_base_url, "https://api.openai.com/v1");
        assert_eq!(config.twilio_api_base_url, "https://api.twilio.com");
    }

    #[test]
    fn service_base_urls_can_be_overridden() {
        let mut vars = base_env();
        vars.insert("OPENAI_BASE_URL", "http://localhost:8080/v1/");
        vars.insert("TWILIO_API_BASE_URL", "http://localhost:8081");
        let config = load(&vars).unwrap();
        assert_eq!(config.openai_base_url, "http://localhost:8080/v1");
        assert_eq!(config.twilio_api_base_url, "http://localhost:8081");
    }

    #[test]
    fn missing_required_value_is_reported_by_name() {
        let mut vars = base_env();
        vars.remove("CRM_MANAGER_URL");
        let err = load(&vars).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("CRM_MANAGER_URL")));
    }

    #[test]
    fn recording_storage_requires_bucket_and_credentials() {
        let mut vars = base_env();
        vars.insert("S3_BUCKET", "calls");
        assert!(load(&vars).unwrap().recording_storage.is_none());

        vars.insert("AWS_ACCESS_KEY_ID", "test");
        vars.insert("AWS_SECRET_ACCESS_KEY", "test");
        vars.insert("S3_ENDPOINT", "http://localhost:4566");
        let storage = load(&vars).unwrap().recording_storage.unwrap();
        assert_eq!(storage.bucket, "calls");
        assert_eq!(storage.region, "us-east-1");
        assert_eq!(storage.endpoint.as_deref(), Some("http://localhost:4566"));
    }

    #[test]
    fn rental_clock_uses_configured_offset() {
        let mut vars = base_env();
        vars.insert("RENTAL_UTC_OFFSET", "+03:00");
        let config = load(&vars).unwrap();
        assert_eq!(
            config.rental_utc_offset,
            Some(FixedOffset::east_opt(3 * 3600).unwrap())
        );
        let ahead = config.rental_now() - Utc::now().naive_utc();
        assert!((ahead.num_seconds() - 3 * 3600).abs() < 5);

        vars.insert("RENTAL_UTC_OFFSET", "Kyiv");
        assert!(matches!(
            load(&vars),
            Err(ConfigError::Invalid {
                name: "RENTAL_UTC_OFFSET",
                ..
            })
        ));
    }

    #[test]
    fn bad_listen_addr_is_rejected() {
        let mut vars = base_env();
        vars.insert("LISTEN_ADDR", "not-an-addr");
        assert!(matches!(
            load(&vars),
            Err(ConfigError::Invalid {
                name: "LISTEN_ADDR",
                ..
            })
        ));
    }
}
