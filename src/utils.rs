use crate::consts::GOOGLE_WAV_HEADER_SZ;
use crate::error::AppError;
use crate::twilio_types::{OutboundMediaMeta, TwilioOutbound};

use base64::{engine, read, Engine};
use std::io::{Cursor, Read};
use tracing::error;

/// Strip the WAV header Google puts in front of MULAW audio, leaving raw 8 kHz μ-law bytes.
pub fn google_tts_to_mulaw(google_tts: String) -> Result<Vec<u8>, AppError> {
    let mut body = Vec::new();
    b64_decode_to_buf(google_tts, &mut body)?;
    if body.len() < GOOGLE_WAV_HEADER_SZ {
        error!(len = body.len(), "google tts payload shorter than its header");
        return Err(AppError("Google TTS payload too short"));
    }
    Ok(body.split_off(GOOGLE_WAV_HEADER_SZ))
}

/// Prepare a TwilioOutbound media message from raw μ-law bytes.
pub fn mulaw2twilio(mulaw: &[u8], stream_sid: &str) -> TwilioOutbound {
    let re_encoded: String = engine::general_purpose::STANDARD.encode(mulaw);
    TwilioOutbound::Media {
        media: OutboundMediaMeta {
            payload: re_encoded,
        },
        stream_sid: stream_sid.to_string(),
    }
}

pub fn b64_decode_to_buf(enc: String, buf: &mut Vec<u8>) -> Result<(), AppError> {
    let mut cur = Cursor::new(enc);
    let mut decoder = read::DecoderReader::new(&mut cur, &engine::general_purpose::STANDARD);
    decoder.read_to_end(buf).map_err(|e| {
        error!(error=%e, "failed to decode base64 payload");
        AppError("base64 decode error")
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn google_header_is_stripped() {
        let mut wav = vec![0u8; GOOGLE_WAV_HEADER_SZ];
        wav.extend_from_slice(&[0x7f, 0xff, 0x00]);
        let encoded = engine::general_purpose::STANDARD.encode(&wav);
        assert_eq!(google_tts_to_mulaw(encoded).unwrap(), vec![0x7f, 0xff, 0x00]);

        let short = engine::general_purpose::STANDARD.encode([1u8, 2, 3]);
        assert!(google_tts_to_mulaw(short).is_err());
    }

    #[test]
    fn invalid_base64_is_an_error() {
        let mut buf = Vec::new();
        assert!(b64_decode_to_buf("not base64!!".to_string(), &mut buf).is_err());
    }
}
