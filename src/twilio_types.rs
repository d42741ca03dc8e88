pub fn wrap_twiml(twiml: String) -> String {
    format!("<?xml version=\"1.0\" encoding=\"UTF-8\"?>{twiml}")
}

mod twiml {
    use xmlserde::xml_serde_enum;
    use xmlserde_derives::XmlSerialize;

    #[derive(PartialEq, Eq, XmlSerialize)]
    #[xmlserde(root = b"Response")]
    pub struct Response {
        #[xmlserde(ty = "untag")]
        pub actions: Vec<ResponseAction>,
    }

    #[derive(PartialEq, Eq, XmlSerialize)]
    pub enum ResponseAction {
        #[xmlserde(name = b"Connect")]
        Connect(ConnectAction),
    }

    #[derive(PartialEq, Eq, XmlSerialize)]
    pub struct ConnectAction {
        #[xmlserde(ty = "untag")]
        pub connection: Connection,
    }

    #[derive(PartialEq, Eq, XmlSerialize)]
    pub enum Connection {
        #[xmlserde(name = b"Stream")]
        Stream(StreamAction),
    }

    #[derive(PartialEq, Eq, XmlSerialize, Default)]
    pub struct StreamAction {
        #[xmlserde(name = b"url", ty = "attr")]
        pub url: String,
        #[xmlserde(name = b"name", ty = "attr")]
        pub name: Option<String>,
        #[xmlserde(name = b"track", ty = "attr")]
        pub track: Option<StreamTrack>,
        /// Handed back to us in the `start` message as `customParameters`
        #[xmlserde(name = b"Parameter", ty = "child")]
        pub parameters: Vec<StreamParameter>,
    }

    #[derive(PartialEq, Eq, XmlSerialize, Default)]
    pub struct StreamParameter {
        #[xmlserde(name = b"name", ty = "attr")]
        pub name: String,
        #[xmlserde(name = b"value", ty = "attr")]
        pub value: String,
    }

    xml_serde_enum! {
        #[derive(PartialEq, Eq, Debug)]
        StreamTrack {
            Inbound => "inbound_track",
        }
    }
}
pub use twiml::*;

mod ws {
    use serde::{Deserialize, Serialize};
    use std::collections::HashMap;

    #[derive(Clone, Serialize, Deserialize)]
    pub struct OutboundMarkMeta {
        pub name: String,
    }

    #[derive(Clone, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase", tag = "event")]
    pub enum TwilioOutbound {
        Mark {
            mark: OutboundMarkMeta,
            #[serde(rename = "streamSid")]
            stream_sid: String,
        },
        Media {
            media: OutboundMediaMeta,
            #[serde(rename = "streamSid")]
            stream_sid: String,
        },
        Clear {
            #[serde(rename = "streamSid")]
            stream_sid: String,
        },
    }

    #[derive(Clone, Serialize, Deserialize)]
    pub struct OutboundMediaMeta {
        pub payload: String,
    }

    #[derive(Serialize, Deserialize)]
    #[serde(rename_all = "lowercase", tag = "event")]
    pub enum TwilioMessage {
        Connected {
            protocol: String,
            version: String,
        },
        Start {
            #[serde(rename = "sequenceNumber")]
            sequence_number: String,
            start: StartMeta,
            #[serde(rename = "streamSid")]
            stream_sid: String,
        },
        Media {
            #[serde(rename = "sequenceNumber")]
            sequence_number: String,
            media: MediaMeta,
            #[serde(rename = "streamSid")]
            stream_sid: String,
        },
        Stop {
            #[serde(rename = "sequenceNumber")]
            sequence_number: String,
            stop: StopMeta,
            #[serde(rename = "streamSid")]
            stream_sid: String,
        },
        Mark {
            #[serde(rename = "sequenceNumber")]
            sequence_number: String,
            mark: MarkMeta,
            #[serde(rename = "streamSid")]
            stream_sid: String,
        },
    }

    #[derive(Serialize, Deserialize, Debug)]
    pub struct StartMeta {
        #[serde(rename = "streamSid")]
        pub stream_sid: String,
        #[serde(rename = "accountSid")]
        pub account_sid: String,
        #[serde(rename = "callSid")]
        pub call_sid: String,
        #[serde(default)]
        pub tracks: Vec<String>,
        #[serde(rename = "customParameters", default)]
        pub custom_parameters: HashMap<String, String>,
        #[serde(rename = "mediaFormat")]
        pub media_format: MediaFormat,
    }

    #[derive(Serialize, Deserialize, Debug)]
    pub struct MediaFormat {
        pub encoding: String,
        #[serde(rename = "sampleRate")]
        pub sample_rate: u32,
        pub channels: u16,
    }

    #[derive(Serialize, Deserialize)]
    pub struct MediaMeta {
        pub track: MediaTrack,
        /// Base64 μ-law, 8 kHz mono
        pub payload: String,
    }

    #[derive(Serialize, Deserialize, PartialEq, Eq, Debug)]
    #[serde(rename_all = "lowercase")]
    pub enum MediaTrack {
        Inbound,
        Outbound,
    }

    #[derive(Serialize, Deserialize)]
    pub struct StopMeta {
        #[serde(rename = "callSid")]
        pub call_sid: String,
    }

    #[derive(Serialize, Deserialize)]
    pub struct MarkMeta {
        pub name: String,
    }
}
pub use ws::*;

mod connect {
    use serde::Deserialize;

    #[derive(Deserialize, Debug, PartialEq, Eq)]
    #[serde(rename_all = "kebab-case")]
    pub enum CallStatus {
        Queued,
        Ringing,
        InProgress,
        Completed,
        Busy,
        Failed,
        NoAnswer,
    }

    #[derive(Deserialize, Debug, PartialEq, Eq)]
    #[serde(rename_all = "kebab-case")]
    pub enum CallDirection {
        Inbound,
        OutboundApi,
        OutboundDial,
    }

    /// Form body of the voice webhook; Twilio sends more fields than we read.
    #[derive(Deserialize, Debug)]
    #[serde(rename_all = "PascalCase")]
    pub struct TwilioConnectPayload {
        pub call_sid: String,
        pub call_status: CallStatus,
        pub direction: CallDirection,
        pub from: String,
        pub from_country: Option<String>,
        pub to: String,
    }
}
pub use connect::*;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_twiml_points_at_stream_endpoint() {
        let response = Response {
            actions: vec![ResponseAction::Connect(ConnectAction {
                connection: Connection::Stream(StreamAction {
                    url: "wss://agent.example.com/connect".to_string(),
                    track: Some(StreamTrack::Inbound),
                    parameters: vec![StreamParameter {
                        name: "from".to_string(),
                        value: "+380501112233".to_string(),
                    }],
                    ..Default::default()
                }),
            })],
        };
        let twiml = wrap_twiml(xmlserde::xml_serialize(response));
        assert!(twiml.starts_with("<?xml"));
        assert!(twiml.contains("<Connect>"));
        assert!(twiml.contains("<Stream "));
        assert!(twiml.contains(r#"url="wss://agent.example.com/connect""#));
        assert!(twiml.contains(r#"track="inbound_track""#));
        assert!(twiml.contains(r#"<Parameter name="from" value="+380501112233""#));
    }

    #[test]
    fn connect_payload_parses_from_form() {
        let body = "AccountSid=AC1&ApiVersion=2010-04-01&CallSid=CA1&CallStatus=ringing\
                    &Called=%2B15550001111&Direction=inbound&From=%2B380501112233\
                    &To=%2B15550001111&FromCountry=UA";
        let payload: TwilioConnectPayload = serde_urlencoded::from_str(body).unwrap();
        assert_eq!(payload.call_sid, "CA1");
        assert_eq!(payload.from, "+380501112233");
        assert_eq!(payload.from_country.as_deref(), Some("UA"));
        assert_eq!(payload.call_status, CallStatus::Ringing);
        assert_eq!(payload.direction, CallDirection::Inbound);
    }

    #[test]
    fn inbound_messages_are_tagged_by_event() {
        let mark = r#"{"event":"mark","sequenceNumber":"7","streamSid":"MZ1","mark":{"name":"hangup"}}"#;
        match serde_json::from_str::<TwilioMessage>(mark).unwrap() {
            TwilioMessage::Mark { mark, .. } => assert_eq!(mark.name, "hangup"),
            _ => panic!("expected mark"),
        }

        let outbound = TwilioOutbound::Clear {
            stream_sid: "MZ1".to_string(),
        };
        let value = serde_json::to_value(&outbound).unwrap();
        assert_eq!(value["event"], "clear");
        assert_eq!(value["streamSid"], "MZ1");
    }
}
