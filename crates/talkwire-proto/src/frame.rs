use rmpv::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed frame")]
    MalformedFrame,
    #[error("unsupported channel type {0}")]
    UnsupportedType(u64),
    #[error("frame encode failed: {0}")]
    Encode(String),
}

/// Addressing mode of a frame: one peer, or a group channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChannelType {
    Private = 0,
    Group = 1,
}

impl TryFrom<u64> for ChannelType {
    type Error = CodecError;

    fn try_from(raw: u64) -> Result<Self, Self::Error> {
        match raw {
            0 => Ok(ChannelType::Private),
            1 => Ok(ChannelType::Group),
            other => Err(CodecError::UnsupportedType(other)),
        }
    }
}

/// The five-field wire frame: `[channelType, messageType, fromId, toId, payload]`.
///
/// The payload is an opaque MessagePack value — audio bytes, a structured
/// map, or nil. The codec never interprets it.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub channel_type: ChannelType,
    pub message_type: u8,
    pub from_id: String,
    pub to_id: String,
    pub payload: Value,
}

impl Frame {
    pub fn new(
        channel_type: ChannelType,
        message_type: u8,
        from_id: impl Into<String>,
        to_id: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            channel_type,
            message_type,
            from_id: from_id.into(),
            to_id: to_id.into(),
            payload,
        }
    }

    /// A server-originated control frame with no routing target.
    pub fn control(message_type: u8, to_id: impl Into<String>, payload: Value) -> Self {
        Self::new(ChannelType::Private, message_type, "", to_id, payload)
    }

    /// Convert a JSON structure into a frame payload.
    pub fn json_payload(value: &serde_json::Value) -> Value {
        rmpv::ext::to_value(value).unwrap_or(Value::Nil)
    }

    /// Encode as a positional MessagePack array.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let value = Value::Array(vec![
            Value::from(self.channel_type as u8),
            Value::from(self.message_type),
            Value::from(self.from_id.as_str()),
            Value::from(self.to_id.as_str()),
            self.payload.clone(),
        ]);
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, &value)
            .map_err(|err| CodecError::Encode(err.to_string()))?;
        Ok(buf)
    }

    /// Decode a positional MessagePack array into a frame.
    ///
    /// Peer implementations sometimes send numeric ids (`toId = 0` for
    /// broadcast); those are accepted and stringified.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut cursor = bytes;
        let value =
            rmpv::decode::read_value(&mut cursor).map_err(|_| CodecError::MalformedFrame)?;
        let Value::Array(fields) = value else {
            return Err(CodecError::MalformedFrame);
        };
        if fields.len() != 5 {
            return Err(CodecError::MalformedFrame);
        }
        let mut fields = fields.into_iter();
        // len checked above; the iterator yields exactly five values
        let channel = fields.next().ok_or(CodecError::MalformedFrame)?;
        let message = fields.next().ok_or(CodecError::MalformedFrame)?;
        let from = fields.next().ok_or(CodecError::MalformedFrame)?;
        let to = fields.next().ok_or(CodecError::MalformedFrame)?;
        let payload = fields.next().ok_or(CodecError::MalformedFrame)?;

        let channel_type =
            ChannelType::try_from(channel.as_u64().ok_or(CodecError::MalformedFrame)?)?;
        let message_type = message
            .as_u64()
            .filter(|raw| *raw <= u8::MAX as u64)
            .ok_or(CodecError::MalformedFrame)? as u8;

        Ok(Self {
            channel_type,
            message_type,
            from_id: id_field(&from).ok_or(CodecError::MalformedFrame)?,
            to_id: id_field(&to).ok_or(CodecError::MalformedFrame)?,
            payload,
        })
    }
}

fn id_field(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => s.as_str().map(str::to_string),
        Value::Integer(i) => Some(i.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::*;

    fn sample_frames() -> Vec<Frame> {
        vec![
            Frame::new(
                ChannelType::Private,
                MSG_TEXT,
                "TELENET_81*14946*0011",
                "TELENET_81*14946*0022",
                Value::from("hello"),
            ),
            Frame::new(
                ChannelType::Group,
                MSG_AUDIO,
                "alice",
                "dispatch-east",
                Value::Binary(vec![0x01, 0x02, 0xff, 0x00, 0x7f]),
            ),
            Frame::new(
                ChannelType::Private,
                MSG_HEARTBEAT,
                "alice",
                "0",
                Value::Nil,
            ),
            Frame::control(
                MSG_PRESENCE_UPDATE,
                BROADCAST_TARGET,
                Frame::json_payload(&serde_json::json!({
                    "type": "presence_update",
                    "userId": "bob",
                    "status": "online",
                })),
            ),
        ]
    }

    #[test]
    fn roundtrip_preserves_every_field() {
        for frame in sample_frames() {
            let bytes = frame.encode().expect("encode");
            let decoded = Frame::decode(&bytes).expect("decode");
            assert_eq!(decoded, frame);
        }
    }

    #[test]
    fn decode_accepts_numeric_ids() {
        let value = Value::Array(vec![
            Value::from(0u8),
            Value::from(MSG_HEARTBEAT),
            Value::from("alice"),
            Value::from(0u8),
            Value::Nil,
        ]);
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, &value).expect("write");
        let frame = Frame::decode(&buf).expect("decode");
        assert_eq!(frame.to_id, "0");
    }

    #[test]
    fn decode_rejects_truncated_input() {
        let bytes = sample_frames()[0].encode().expect("encode");
        let err = Frame::decode(&bytes[..bytes.len() / 2]).unwrap_err();
        assert!(matches!(err, CodecError::MalformedFrame));
    }

    #[test]
    fn decode_rejects_non_array_value() {
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, &Value::from("not a frame")).expect("write");
        assert!(matches!(
            Frame::decode(&buf),
            Err(CodecError::MalformedFrame)
        ));
    }

    #[test]
    fn decode_rejects_wrong_arity() {
        let value = Value::Array(vec![Value::from(0u8), Value::from(1u8)]);
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, &value).expect("write");
        assert!(matches!(
            Frame::decode(&buf),
            Err(CodecError::MalformedFrame)
        ));
    }

    #[test]
    fn decode_rejects_unknown_channel() {
        let value = Value::Array(vec![
            Value::from(7u8),
            Value::from(MSG_TEXT),
            Value::from("a"),
            Value::from("b"),
            Value::Nil,
        ]);
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, &value).expect("write");
        assert!(matches!(
            Frame::decode(&buf),
            Err(CodecError::UnsupportedType(7))
        ));
    }

    #[test]
    fn audio_payload_bytes_survive_unchanged() {
        let audio: Vec<u8> = (0..=255).collect();
        let frame = Frame::new(
            ChannelType::Group,
            MSG_AUDIO,
            "a",
            "g",
            Value::Binary(audio.clone()),
        );
        let decoded = Frame::decode(&frame.encode().expect("encode")).expect("decode");
        assert_eq!(decoded.payload, Value::Binary(audio));
    }
}
