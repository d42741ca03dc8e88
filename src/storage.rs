//! Upload of call recordings to S3-compatible object storage, signed with AWS Signature V4.

use crate::config::RecordingStorageConfig;
use crate::error::RecordingError;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use tracing::{error, info};

type HmacSha256 = Hmac<Sha256>;

const SIGNED_HEADERS: &str = "host;x-amz-content-sha256;x-amz-date";

pub struct RecordingStore {
    config: RecordingStorageConfig,
    http_client: reqwest::Client,
}

impl RecordingStore {
    pub fn new(config: RecordingStorageConfig, http_client: reqwest::Client) -> Self {
        Self {
            config,
            http_client,
        }
    }

    fn endpoint(&self) -> String {
        match &self.config.endpoint {
            Some(endpoint) => endpoint.trim_end_matches('/').to_string(),
            None => format!("https://s3.{}.amazonaws.com", self.config.region),
        }
    }

    /// PUT `body` under `key`; returns the key of the stored object.
    pub async fn put(
        &self,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
        now: DateTime<Utc>,
    ) -> Result<String, RecordingError> {
        let path = format!(
            "/{}/{}",
            urlencoding::encode(&self.config.bucket),
            urlencoding::encode(key)
        );
        let url = reqwest::Url::parse(&format!("{}{}", self.endpoint(), path))
            .map_err(|e| RecordingError::Endpoint(e.to_string()))?;
        let host = match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            (None, _) => return Err(RecordingError::Endpoint(url.to_string())),
        };

        let payload_hash = hex::encode(Sha256::digest(&body));
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();
        let scope = format!("{date}/{}/s3/aws4_request", self.config.region);
        let canonical_request = format!(
            "PUT\n{path}\n\nhost:{host}\nx-amz-content-sha256:{payload_hash}\nx-amz-date:{amz_date}\n\n{SIGNED_HEADERS}\n{payload_hash}"
        );
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{amz_date}\n{scope}\n{}",
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );
        let key_bytes = signing_key(&self.config.secret_access_key, &date, &self.config.region, "s3")?;
        let signature = hex::encode(hmac_sha256(&key_bytes, string_to_sign.as_bytes())?);
        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{scope}, SignedHeaders={SIGNED_HEADERS}, Signature={signature}",
            self.config.access_key_id
        );

        let size = body.len();
        let resp = self
            .http_client
            .put(url)
            .header("x-amz-date", amz_date)
            .header("x-amz-content-sha256", payload_hash)
            .header(reqwest::header::AUTHORIZATION, authorization)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                error!(error=%e, key, "failed to send recording upload");
                RecordingError::Transport(e)
            })?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            error!(%status, body=%body, key, "storage rejected recording upload");
            return Err(RecordingError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        info!(key, bytes = size, "uploaded recording");
        Ok(key.to_string())
    }
}

/// Object key for a call recording, e.g. `Olena_Shevchenko_conversation_recording20250501_140000.wav`.
pub fn recording_key(name: &str, at: DateTime<Utc>) -> String {
    format!(
        "{name}_conversation_recording{}.wav",
        at.format("%Y%m%d_%H%M%S")
    )
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>, RecordingError> {
    let mut mac =
        HmacSha256::new_from_slice(key).map_err(|e| RecordingError::Signing(e.to_string()))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn signing_key(
    secret: &str,
    date: &str,
    region: &str,
    service: &str,
) -> Result<Vec<u8>, RecordingError> {
    let k_date = hmac_sha256(format!("AWS4{secret}").as_bytes(), date.as_bytes())?;
    let k_region = hmac_sha256(&k_date, region.as_bytes())?;
    let k_service = hmac_sha256(&k_region, service.as_bytes())?;
    hmac_sha256(&k_service, b"aws4_request")
}
