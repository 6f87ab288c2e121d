//! Protocol definition for the event channel.
//!
//! Every message is a JSON text frame `{"event": <name>, "data": <payload>}`.
//!
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::detection::Detection;

/// Messages sent from the camera side to the server.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "lowercase")]
pub enum ClientMsg {
    Image(ImageMsg),
}

/// Messages sent from the server to the camera side.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "lowercase")]
pub enum ServerMsg {
    Predictions(PredictionsMsg),
}

/// Encoded frame on the wire.
///
/// Older clients send the base64 string without a sequence id, which is accepted and mapped to
/// `seq == 0`.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(from = "ImagePayload")]
pub struct ImageMsg {
    pub seq: u64,
    pub data: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ImagePayload {
    Sequenced { seq: u64, data: String },
    Bare(String),
}

impl From<ImagePayload> for ImageMsg {
    fn from(payload: ImagePayload) -> Self {
        match payload {
            ImagePayload::Sequenced { seq, data } => Self { seq, data },
            ImagePayload::Bare(data) => Self { seq: 0, data },
        }
    }
}

/// Detections for the frame with sequence id `seq`.
///
/// Answers to frames without a sequence id (`seq == 0`) go out as a bare list of detections,
/// which is also what older servers send.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(from = "PredictionsPayload", into = "PredictionsPayload")]
pub struct PredictionsMsg {
    pub seq: u64,
    pub detections: Vec<Detection>,
}

#[derive(Deserialize, Serialize)]
#[serde(untagged)]
enum PredictionsPayload {
    Sequenced {
        seq: u64,
        detections: Vec<Detection>,
    },
    Bare(Vec<Detection>),
}

impl From<PredictionsPayload> for PredictionsMsg {
    fn from(payload: PredictionsPayload) -> Self {
        match payload {
            PredictionsPayload::Sequenced { seq, detections } => Self { seq, detections },
            PredictionsPayload::Bare(detections) => Self { seq: 0, detections },
        }
    }
}

impl From<PredictionsMsg> for PredictionsPayload {
    fn from(msg: PredictionsMsg) -> Self {
        match msg.seq {
            0 => PredictionsPayload::Bare(msg.detections),
            seq => PredictionsPayload::Sequenced {
                seq,
                detections: msg.detections,
            },
        }
    }
}

/// One encoded still image with the sequence id assigned by its sender.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Frame {
    pub seq: u64,
    pub jpeg: Bytes,
}

impl Frame {
    pub fn new(seq: u64, jpeg: impl Into<Bytes>) -> Self {
        Self {
            seq,
            jpeg: jpeg.into(),
        }
    }
}

impl ImageMsg {
    pub fn encode(frame: &Frame) -> Self {
        Self {
            seq: frame.seq,
            data: STANDARD.encode(&frame.jpeg),
        }
    }

    pub fn decode(&self) -> Result<Frame, base64::DecodeError> {
        let jpeg = STANDARD.decode(self.data.as_bytes())?;
        Ok(Frame::new(self.seq, jpeg))
    }
}

impl ClientMsg {
    pub fn image(frame: &Frame) -> Self {
        ClientMsg::Image(ImageMsg::encode(frame))
    }

    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl ServerMsg {
    pub fn predictions(seq: u64, detections: Vec<Detection>) -> Self {
        ServerMsg::Predictions(PredictionsMsg { seq, detections })
    }

    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod test {

    use super::*;
    use crate::Error;

    #[test]
    fn test_image_event_shape() -> Result<(), Error> {
        let frame = Frame::new(7, vec![0xff, 0xd8, 0x00, 0x01, 0xff, 0xd9]);
        let json = ClientMsg::image(&frame).to_json()?;

        let value: serde_json::Value = serde_json::from_str(&json)?;
        assert_eq!(value["event"], "image");
        assert_eq!(value["data"]["seq"], 7);
        assert_eq!(value["data"]["data"], "/9gAAf/Z");

        let ClientMsg::Image(msg) = ClientMsg::from_json(&json)?;
        assert_eq!(msg.decode()?, frame);

        Ok(())
    }

    #[test]
    fn test_bare_image_payload() -> Result<(), Error> {
        let ClientMsg::Image(msg) = ClientMsg::from_json(r#"{"event":"image","data":"AQID"}"#)?;
        assert_eq!(msg.seq, 0);
        assert_eq!(&msg.decode()?.jpeg[..], &[1, 2, 3]);

        Ok(())
    }

    #[test]
    fn test_predictions_event_shape() -> Result<(), Error> {
        let msg = ServerMsg::predictions(
            3,
            vec![Detection::new("cup", [10.0, 20.0, 30.0, 40.0], 0.61)],
        );
        let value: serde_json::Value = serde_json::from_str(&msg.to_json()?)?;

        assert_eq!(value["event"], "predictions");
        assert_eq!(value["data"]["seq"], 3);
        assert_eq!(value["data"]["detections"][0]["class"], "cup");

        Ok(())
    }

    #[test]
    fn test_unsequenced_predictions_are_a_bare_list() -> Result<(), Error> {
        let msg = ServerMsg::predictions(0, vec![Detection::new("cup", [1.0, 2.0, 3.0, 4.0], 0.7)]);
        let value: serde_json::Value = serde_json::from_str(&msg.to_json()?)?;

        assert_eq!(value["event"], "predictions");
        assert!(value["data"].is_array());
        assert_eq!(value["data"][0]["class"], "cup");
        assert_eq!(value["data"][0]["bbox"][3], 4.0);

        let ServerMsg::Predictions(parsed) = ServerMsg::from_json(
            r#"{"event":"predictions","data":[{"class":"dog","bbox":[0,0,5,5],"score":0.9}]}"#,
        )?;
        assert_eq!(parsed.seq, 0);
        assert_eq!(parsed.detections[0].label(), "dog");

        let ServerMsg::Predictions(empty) =
            ServerMsg::from_json(r#"{"event":"predictions","data":[]}"#)?;
        assert_eq!(empty, PredictionsMsg::default());

        Ok(())
    }

    #[test]
    fn test_sequenced_predictions_parse() -> Result<(), Error> {
        let ServerMsg::Predictions(parsed) = ServerMsg::from_json(
            r#"{"event":"predictions","data":{"seq":9,"detections":[]}}"#,
        )?;
        assert_eq!(parsed.seq, 9);
        assert!(parsed.detections.is_empty());

        Ok(())
    }

    #[test]
    fn test_rejects_unknown_event_and_bad_base64() {
        assert!(ClientMsg::from_json(r#"{"event":"video","data":"AQID"}"#).is_err());
        assert!(ClientMsg::from_json("not json").is_err());

        let msg = ImageMsg {
            seq: 1,
            data: "***".into(),
        };
        assert!(msg.decode().is_err());
    }
}
