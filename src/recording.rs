//! Call recording: both sides of the call on one timeline, written out as a stereo WAV.
//!
//! Caller audio arrives in real time from the media stream, so its length doubles as the call
//! clock. Assistant audio is placed at the later of "now" and the end of the previous reply,
//! which mirrors how Twilio queues our outbound media.

use crate::error::RecordingError;

use tracing::debug;

pub const SAMPLE_RATE: u32 = 8_000;

#[derive(Default)]
pub struct CallRecorder {
    caller: Vec<i16>,
    assistant: Vec<i16>,
}

impl CallRecorder {
    pub fn push_caller(&mut self, mulaw: &[u8]) {
        self.caller.extend(mulaw.iter().map(|b| mulaw_to_linear(*b)));
    }

    pub fn push_assistant(&mut self, mulaw: &[u8]) {
        let now = self.caller.len();
        if self.assistant.len() < now {
            self.assistant.resize(now, 0);
        }
        self.assistant
            .extend(mulaw.iter().map(|b| mulaw_to_linear(*b)));
    }

    /// Drop assistant audio that was queued but never played (the caller cut in).
    pub fn truncate_assistant(&mut self) {
        let now = self.caller.len();
        if self.assistant.len() > now {
            debug!(
                dropped = self.assistant.len() - now,
                "dropping unplayed assistant audio"
            );
            self.assistant.truncate(now);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.caller.is_empty() && self.assistant.is_empty()
    }

    /// Stereo 16-bit WAV: caller on the left channel, assistant on the right.
    pub fn to_wav(&self) -> Result<Vec<u8>, RecordingError> {
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: SAMPLE_RATE,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let frames = self.caller.len().max(self.assistant.len());
        let mut cursor = std::io::Cursor::new(Vec::with_capacity(44 + frames * 4));
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
            for i in 0..frames {
                writer.write_sample(self.caller.get(i).copied().unwrap_or(0))?;
                writer.write_sample(self.assistant.get(i).copied().unwrap_or(0))?;
            }
            writer.finalize()?;
        }
        Ok(cursor.into_inner())
    }
}

/// G.711 μ-law to 16-bit linear PCM.
pub fn mulaw_to_linear(byte: u8) -> i16 {
    let b = !byte;
    let exponent = (b >> 4) & 0x07;
    let mantissa = (b & 0x0f) as i32;
    let magnitude = (((mantissa << 3) + 0x84) << exponent) - 0x84;
    if b & 0x80 != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mulaw_decodes_reference_values() {
        assert_eq!(mulaw_to_linear(0xff), 0);
        assert_eq!(mulaw_to_linear(0x7f), 0);
        assert_eq!(mulaw_to_linear(0x80), 32124);
        assert_eq!(mulaw_to_linear(0x00), -32124);
        assert_eq!(mulaw_to_linear(0xfe), 8);
    }

    #[test]
    fn assistant_audio_starts_no_earlier_than_now() {
        let mut recorder = CallRecorder::default();
        recorder.push_caller(&[0xff; 100]);
        recorder.push_assistant(&[0x80; 10]);
        assert_eq!(recorder.assistant.len(), 110);
        assert_eq!(recorder.assistant[99], 0);
        assert_eq!(recorder.assistant[100], 32124);

        // a second reply queues behind the first
        recorder.push_assistant(&[0x80; 10]);
        assert_eq!(recorder.assistant.len(), 120);
    }

    #[test]
    fn barge_in_drops_unplayed_audio() {
        let mut recorder = CallRecorder::default();
        recorder.push_caller(&[0xff; 10]);
        recorder.push_assistant(&[0x80; 50]);
        recorder.push_caller(&[0xff; 20]);
        recorder.truncate_assistant();
        assert_eq!(recorder.assistant.len(), 30);
    }

    #[test]
    fn wav_is_stereo_and_covers_both_sides() {
        let mut recorder = CallRecorder::default();
        assert!(recorder.is_empty());
        recorder.push_caller(&[0x80; 4]);
        recorder.push_assistant(&[0x00; 6]);

        let wav = recorder.to_wav().unwrap();
        let reader = hound::WavReader::new(std::io::Cursor::new(wav)).unwrap();
        assert_eq!(reader.spec().channels, 2);
        assert_eq!(reader.spec().sample_rate, 8_000);
        let samples: Vec<i16> = reader.into_samples().map(|s| s.unwrap()).collect();
        assert_eq!(samples.len(), 20);
        // frame 0: caller speaking, assistant silent
        assert_eq!(&samples[0..2], &[32124, 0]);
        // frame 4: caller done, assistant speaking
        assert_eq!(&samples[8..10], &[0, -32124]);
    }
}
