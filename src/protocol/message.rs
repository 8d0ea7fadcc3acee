//! RTMP message model
//!
//! Converts reassembled [`RawMessage`]s into typed messages and back.
//! Audio and video bodies stay opaque here; `media::flv` interprets them.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::amf::{self, AmfValue};
use crate::error::{ProtocolError, Result};
use crate::protocol::chunk::{MessageHeader, RawMessage};
use crate::protocol::constants::*;

#[derive(Debug, Clone, PartialEq)]
pub enum UserControlEvent {
    StreamBegin(u32),
    StreamEof(u32),
    SetBufferLength { stream_id: u32, buffer_ms: u32 },
    PingRequest(u32),
    PingResponse(u32),
    Other { event_type: u16, data: Bytes },
}

/// An AMF0 command: name, transaction id, command object, extra arguments
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub name: String,
    pub transaction_id: f64,
    pub object: AmfValue,
    pub args: Vec<AmfValue>,
}

impl Command {
    pub fn new(name: &str, transaction_id: f64, object: AmfValue, args: Vec<AmfValue>) -> Self {
        Self {
            name: name.to_string(),
            transaction_id,
            object,
            args,
        }
    }

    /// `_result` answering `transaction_id`
    pub fn result(transaction_id: f64, object: AmfValue, args: Vec<AmfValue>) -> Self {
        Self::new(CMD_RESULT, transaction_id, object, args)
    }

    /// `onStatus` notification carrying `level`, `code` and `description`
    pub fn on_status(level: &str, code: &str, description: &str) -> Self {
        let info = crate::amf_object! {
            "level" => level,
            "code" => code,
            "description" => description,
        };
        Self::new(CMD_ON_STATUS, 0.0, AmfValue::Null, vec![info])
    }

    /// First string argument, e.g. the stream name of `publish`/`play`
    pub fn string_arg(&self, index: usize) -> Option<&str> {
        self.args.get(index)?.as_str()
    }

    pub fn number_arg(&self, index: usize) -> Option<f64> {
        self.args.get(index)?.as_number()
    }

    fn parse(payload: &Bytes) -> Result<Self> {
        let mut values = amf::decode_all(payload)?.into_iter();
        let name = match values.next() {
            Some(AmfValue::String(name)) => name,
            _ => return Err(ProtocolError::MalformedMessage("command").into()),
        };
        let transaction_id = values.next().and_then(|v| v.as_number()).unwrap_or(0.0);
        let object = values.next().unwrap_or(AmfValue::Null);
        Ok(Self {
            name,
            transaction_id,
            object,
            args: values.collect(),
        })
    }

    fn encode(&self) -> Bytes {
        let mut encoder = amf::Amf0Encoder::new();
        encoder.encode(&AmfValue::String(self.name.clone()));
        encoder.encode(&AmfValue::Number(self.transaction_id));
        encoder.encode(&self.object);
        encoder.encode_all(&self.args);
        encoder.finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RtmpMessage {
    SetChunkSize(u32),
    Abort(u32),
    Acknowledgement(u32),
    UserControl(UserControlEvent),
    WindowAckSize(u32),
    SetPeerBandwidth { size: u32, limit_type: u8 },
    Audio(Bytes),
    Video(Bytes),
    /// AMF0 data message such as `@setDataFrame` / `onMetaData`
    Data(Vec<AmfValue>),
    Command(Command),
    Unknown { type_id: u8, payload: Bytes },
}

impl RtmpMessage {
    pub fn parse(raw: &RawMessage) -> Result<Self> {
        let mut p = raw.payload.clone();
        let msg = match raw.header.type_id {
            MSG_SET_CHUNK_SIZE => {
                RtmpMessage::SetChunkSize(read_u32(&mut p, "set chunk size")? & 0x7FFF_FFFF)
            }
            MSG_ABORT => RtmpMessage::Abort(read_u32(&mut p, "abort")?),
            MSG_ACKNOWLEDGEMENT => RtmpMessage::Acknowledgement(read_u32(&mut p, "ack")?),
            MSG_WINDOW_ACK_SIZE => RtmpMessage::WindowAckSize(read_u32(&mut p, "window ack size")?),
            MSG_SET_PEER_BANDWIDTH => {
                let size = read_u32(&mut p, "peer bandwidth")?;
                let limit_type = if p.has_remaining() { p.get_u8() } else { BANDWIDTH_LIMIT_DYNAMIC };
                RtmpMessage::SetPeerBandwidth { size, limit_type }
            }
            MSG_USER_CONTROL => RtmpMessage::UserControl(parse_user_control(p)?),
            MSG_AUDIO => RtmpMessage::Audio(p),
            MSG_VIDEO => RtmpMessage::Video(p),
            MSG_DATA_AMF0 => RtmpMessage::Data(amf::decode_all(&p)?),
            MSG_COMMAND_AMF0 => RtmpMessage::Command(Command::parse(&p)?),
            type_id => RtmpMessage::Unknown { type_id, payload: p },
        };
        Ok(msg)
    }

    pub fn type_id(&self) -> u8 {
        match self {
            RtmpMessage::SetChunkSize(_) => MSG_SET_CHUNK_SIZE,
            RtmpMessage::Abort(_) => MSG_ABORT,
            RtmpMessage::Acknowledgement(_) => MSG_ACKNOWLEDGEMENT,
            RtmpMessage::UserControl(_) => MSG_USER_CONTROL,
            RtmpMessage::WindowAckSize(_) => MSG_WINDOW_ACK_SIZE,
            RtmpMessage::SetPeerBandwidth { .. } => MSG_SET_PEER_BANDWIDTH,
            RtmpMessage::Audio(_) => MSG_AUDIO,
            RtmpMessage::Video(_) => MSG_VIDEO,
            RtmpMessage::Data(_) => MSG_DATA_AMF0,
            RtmpMessage::Command(_) => MSG_COMMAND_AMF0,
            RtmpMessage::Unknown { type_id, .. } => *type_id,
        }
    }

    /// Chunk stream the message is written on
    pub fn csid(&self) -> u32 {
        match self {
            RtmpMessage::Audio(_) => CSID_AUDIO,
            RtmpMessage::Video(_) => CSID_VIDEO,
            RtmpMessage::Data(_) => CSID_DATA,
            RtmpMessage::Command(_) => CSID_COMMAND,
            _ => CSID_PROTOCOL_CONTROL,
        }
    }

    pub fn encode_payload(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            RtmpMessage::SetChunkSize(v)
            | RtmpMessage::Abort(v)
            | RtmpMessage::Acknowledgement(v)
            | RtmpMessage::WindowAckSize(v) => buf.put_u32(*v),
            RtmpMessage::SetPeerBandwidth { size, limit_type } => {
                buf.put_u32(*size);
                buf.put_u8(*limit_type);
            }
            RtmpMessage::UserControl(event) => encode_user_control(event, &mut buf),
            RtmpMessage::Audio(data) | RtmpMessage::Video(data) => return data.clone(),
            RtmpMessage::Unknown { payload, .. } => return payload.clone(),
            RtmpMessage::Data(values) => return amf::encode_all(values),
            RtmpMessage::Command(cmd) => return cmd.encode(),
        }
        buf.freeze()
    }

    /// Header for sending this message at `timestamp` on `stream_id`
    pub fn header(&self, timestamp: u32, stream_id: u32) -> MessageHeader {
        MessageHeader {
            timestamp,
            length: 0,
            type_id: self.type_id(),
            stream_id,
        }
    }
}

fn read_u32(p: &mut Bytes, what: &'static str) -> Result<u32> {
    if p.remaining() < 4 {
        return Err(ProtocolError::MalformedMessage(what).into());
    }
    Ok(p.get_u32())
}

fn parse_user_control(mut p: Bytes) -> Result<UserControlEvent> {
    if p.remaining() < 2 {
        return Err(ProtocolError::MalformedMessage("user control").into());
    }
    let event_type = p.get_u16();
    let event = match event_type {
        UC_STREAM_BEGIN => UserControlEvent::StreamBegin(read_u32(&mut p, "stream begin")?),
        UC_STREAM_EOF => UserControlEvent::StreamEof(read_u32(&mut p, "stream eof")?),
        UC_SET_BUFFER_LENGTH => UserControlEvent::SetBufferLength {
            stream_id: read_u32(&mut p, "set buffer length")?,
            buffer_ms: read_u32(&mut p, "set buffer length")?,
        },
        UC_PING_REQUEST => UserControlEvent::PingRequest(read_u32(&mut p, "ping")?),
        UC_PING_RESPONSE => UserControlEvent::PingResponse(read_u32(&mut p, "ping")?),
        _ => UserControlEvent::Other { event_type, data: p },
    };
    Ok(event)
}

fn encode_user_control(event: &UserControlEvent, buf: &mut BytesMut) {
    match event {
        UserControlEvent::StreamBegin(id) => {
            buf.put_u16(UC_STREAM_BEGIN);
            buf.put_u32(*id);
        }
        UserControlEvent::StreamEof(id) => {
            buf.put_u16(UC_STREAM_EOF);
            buf.put_u32(*id);
        }
        UserControlEvent::SetBufferLength { stream_id, buffer_ms } => {
            buf.put_u16(UC_SET_BUFFER_LENGTH);
            buf.put_u32(*stream_id);
            buf.put_u32(*buffer_ms);
        }
        UserControlEvent::PingRequest(t) => {
            buf.put_u16(UC_PING_REQUEST);
            buf.put_u32(*t);
        }
        UserControlEvent::PingResponse(t) => {
            buf.put_u16(UC_PING_RESPONSE);
            buf.put_u32(*t);
        }
        UserControlEvent::Other { event_type, data } => {
            buf.put_u16(*event_type);
            buf.put_slice(data);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amf_object;

    fn raw(msg: &RtmpMessage) -> RawMessage {
        let payload = msg.encode_payload();
        RawMessage {
            csid: msg.csid(),
            header: MessageHeader {
                length: payload.len() as u32,
                ..msg.header(0, 0)
            },
            payload,
        }
    }

    #[test]
    fn test_control_messages() {
        for msg in [
            RtmpMessage::SetChunkSize(4096),
            RtmpMessage::WindowAckSize(2_500_000),
            RtmpMessage::Acknowledgement(1234),
            RtmpMessage::SetPeerBandwidth {
                size: 2_500_000,
                limit_type: BANDWIDTH_LIMIT_DYNAMIC,
            },
            RtmpMessage::UserControl(UserControlEvent::StreamBegin(1)),
            RtmpMessage::UserControl(UserControlEvent::SetBufferLength {
                stream_id: 1,
                buffer_ms: 3000,
            }),
        ] {
            assert_eq!(msg.csid(), CSID_PROTOCOL_CONTROL);
            assert_eq!(RtmpMessage::parse(&raw(&msg)).unwrap(), msg);
        }
    }

    #[test]
    fn test_publish_command() {
        let cmd = Command::new(
            CMD_PUBLISH,
            5.0,
            AmfValue::Null,
            vec![AmfValue::from("cam1"), AmfValue::from("live")],
        );
        let msg = RtmpMessage::Command(cmd);
        let parsed = RtmpMessage::parse(&raw(&msg)).unwrap();
        match parsed {
            RtmpMessage::Command(cmd) => {
                assert_eq!(cmd.name, "publish");
                assert_eq!(cmd.transaction_id, 5.0);
                assert_eq!(cmd.string_arg(0), Some("cam1"));
                assert_eq!(cmd.string_arg(1), Some("live"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_connect_object_fields() {
        let msg = RtmpMessage::Command(Command::new(
            CMD_CONNECT,
            1.0,
            amf_object! { "app" => "live", "tcUrl" => "rtmp://h/live" },
            vec![],
        ));
        let RtmpMessage::Command(cmd) = RtmpMessage::parse(&raw(&msg)).unwrap() else {
            panic!("not a command");
        };
        assert_eq!(cmd.object.get_string("app"), Some("live"));
    }

    #[test]
    fn test_on_status_shape() {
        let cmd = Command::on_status("status", NS_PLAY_START, "Started");
        assert_eq!(cmd.name, CMD_ON_STATUS);
        assert_eq!(cmd.object, AmfValue::Null);
        assert_eq!(cmd.args[0].get_string("code"), Some(NS_PLAY_START));
    }

    #[test]
    fn test_malformed_messages() {
        let truncated = RawMessage {
            csid: 2,
            header: MessageHeader {
                timestamp: 0,
                length: 2,
                type_id: MSG_SET_CHUNK_SIZE,
                stream_id: 0,
            },
            payload: Bytes::from_static(&[0, 1]),
        };
        assert!(RtmpMessage::parse(&truncated).is_err());

        let no_name = RawMessage {
            csid: 3,
            header: MessageHeader {
                timestamp: 0,
                length: 9,
                type_id: MSG_COMMAND_AMF0,
                stream_id: 0,
            },
            payload: amf::encode_all(&[AmfValue::Number(1.0)]),
        };
        assert!(RtmpMessage::parse(&no_name).is_err());
    }
}
