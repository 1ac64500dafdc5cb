//! Producer/consumer message envelope.
//!
//! Every envelope starts with a one-byte discriminant selecting the variant,
//! followed by the variant's fields in big-endian order. Strings are
//! u16-length-prefixed UTF-8 and payloads are i32-length-prefixed.
//!
//! The transport hands raw envelopes to [`Message::decode`] once and the
//! broker matches the resulting enum exhaustively; nothing past this boundary
//! sees undecoded bytes.
//!
//! | Tag | Variant |
//! |-----|---------|
//! | 0 | [`Message::Publish`] |
//! | 1 | [`Message::FetchResponse`] |
//! | 2 | [`Message::OffsetRequest`] |
//! | 5 | [`Message::FetchRequest`] |
//! | 6 | [`Message::NoNewMessage`] |
//! | 7 | [`Message::MessageReceived`] |
//! | 8 | [`Message::OffsetResponse`] |
//! | 9 | [`Message::StoreOffset`] |

use bytes::{BufMut, Bytes, BytesMut};
use nom::{
    IResult,
    number::complete::{be_i32, be_i64, be_u8},
};
use nombytes::NomBytes;

use crate::encode::{ToByte, encode_array};
use crate::error::{Error, Result};
use crate::parser::{parse_array, parse_bytes, parse_string};
use crate::types::PartitionIndex;

/// Fetch offset meaning "start from the group's committed offset".
pub const USE_COMMITTED_OFFSET: i64 = -1;

/// Topic and partition a message refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    pub topic: String,
    pub partition: PartitionIndex,
}

impl MessageHeader {
    pub fn new(topic: impl Into<String>, partition: PartitionIndex) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl ToByte for MessageHeader {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        self.topic.encode(buffer)?;
        self.partition.encode(buffer)
    }
}

fn parse_header(s: NomBytes) -> IResult<NomBytes, MessageHeader> {
    let (s, topic) = parse_string(s)?;
    let (s, partition) = be_i32(s)?;
    Ok((s, MessageHeader { topic, partition }))
}

/// Consumer group, topic and partition a consumer request refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupPartition {
    pub consumer_group: String,
    pub topic: String,
    pub partition: PartitionIndex,
}

impl ToByte for GroupPartition {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        self.consumer_group.encode(buffer)?;
        self.topic.encode(buffer)?;
        self.partition.encode(buffer)
    }
}

fn parse_group_partition(s: NomBytes) -> IResult<NomBytes, GroupPartition> {
    let (s, consumer_group) = parse_string(s)?;
    let (s, topic) = parse_string(s)?;
    let (s, partition) = be_i32(s)?;
    Ok((
        s,
        GroupPartition {
            consumer_group,
            topic,
            partition,
        },
    ))
}

/// A decoded envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Producer batch: every payload is appended as its own record.
    Publish {
        header: MessageHeader,
        messages: Vec<Bytes>,
    },
    /// Records returned to a consumer. `offset` is the number of log bytes
    /// they occupied, whichever offset the request started from.
    FetchResponse {
        header: MessageHeader,
        offset: i64,
        messages: Vec<Bytes>,
    },
    /// Ask for the group's committed offset.
    OffsetRequest(GroupPartition),
    /// Pull up to `read_size` bytes starting at `offset`
    /// ([`USE_COMMITTED_OFFSET`] for the committed offset).
    FetchRequest {
        target: GroupPartition,
        offset: i64,
        read_size: i32,
    },
    /// The fetch found nothing new.
    NoNewMessage { header: MessageHeader },
    /// Acknowledges a publish.
    MessageReceived,
    /// The group's committed offset.
    OffsetResponse { header: MessageHeader, offset: i64 },
    /// Commit a consumer offset.
    StoreOffset { target: GroupPartition, offset: i64 },
}

impl Message {
    /// Wire discriminant of this variant.
    pub fn tag(&self) -> u8 {
        match self {
            Message::Publish { .. } => 0,
            Message::FetchResponse { .. } => 1,
            Message::OffsetRequest(_) => 2,
            Message::FetchRequest { .. } => 5,
            Message::NoNewMessage { .. } => 6,
            Message::MessageReceived => 7,
            Message::OffsetResponse { .. } => 8,
            Message::StoreOffset { .. } => 9,
        }
    }

    /// Short variant name for logs and metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Publish { .. } => "publish",
            Message::FetchResponse { .. } => "fetch_response",
            Message::OffsetRequest(_) => "offset_request",
            Message::FetchRequest { .. } => "fetch_request",
            Message::NoNewMessage { .. } => "no_new_message",
            Message::MessageReceived => "message_received",
            Message::OffsetResponse { .. } => "offset_response",
            Message::StoreOffset { .. } => "store_offset",
        }
    }

    /// Serialize into a fresh buffer.
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        buf.put_u8(self.tag());
        match self {
            Message::Publish { header, messages } => {
                header.encode(&mut buf)?;
                encode_array(&mut buf, messages)?;
            }
            Message::FetchResponse {
                header,
                offset,
                messages,
            } => {
                header.encode(&mut buf)?;
                offset.encode(&mut buf)?;
                encode_array(&mut buf, messages)?;
            }
            Message::OffsetRequest(target) => target.encode(&mut buf)?,
            Message::FetchRequest {
                target,
                offset,
                read_size,
            } => {
                target.encode(&mut buf)?;
                offset.encode(&mut buf)?;
                read_size.encode(&mut buf)?;
            }
            Message::NoNewMessage { header } => header.encode(&mut buf)?,
            Message::MessageReceived => {}
            Message::OffsetResponse { header, offset } => {
                header.encode(&mut buf)?;
                offset.encode(&mut buf)?;
            }
            Message::StoreOffset { target, offset } => {
                target.encode(&mut buf)?;
                offset.encode(&mut buf)?;
            }
        }
        Ok(buf.freeze())
    }

    /// Decode one envelope. Trailing bytes are rejected.
    pub fn decode(data: Bytes) -> Result<Message> {
        if data.is_empty() {
            return Err(Error::MissingData("empty envelope".to_string()));
        }
        let (rest, message) =
            parse_message(NomBytes::new(data.clone())).map_err(|_| Error::ParsingError(data.clone()))?;
        if !rest.into_bytes().is_empty() {
            return Err(Error::ParsingError(data));
        }
        Ok(message)
    }
}

fn parse_message(s: NomBytes) -> IResult<NomBytes, Message> {
    let (s, tag) = be_u8(s)?;
    match tag {
        0 => {
            let (s, header) = parse_header(s)?;
            let (s, messages) = parse_array(parse_bytes)(s)?;
            Ok((s, Message::Publish { header, messages }))
        }
        1 => {
            let (s, header) = parse_header(s)?;
            let (s, offset) = be_i64(s)?;
            let (s, messages) = parse_array(parse_bytes)(s)?;
            Ok((
                s,
                Message::FetchResponse {
                    header,
                    offset,
                    messages,
                },
            ))
        }
        2 => {
            let (s, target) = parse_group_partition(s)?;
            Ok((s, Message::OffsetRequest(target)))
        }
        5 => {
            let (s, target) = parse_group_partition(s)?;
            let (s, offset) = be_i64(s)?;
            let (s, read_size) = be_i32(s)?;
            Ok((
                s,
                Message::FetchRequest {
                    target,
                    offset,
                    read_size,
                },
            ))
        }
        6 => {
            let (s, header) = parse_header(s)?;
            Ok((s, Message::NoNewMessage { header }))
        }
        7 => Ok((s, Message::MessageReceived)),
        8 => {
            let (s, header) = parse_header(s)?;
            let (s, offset) = be_i64(s)?;
            Ok((s, Message::OffsetResponse { header, offset }))
        }
        9 => {
            let (s, target) = parse_group_partition(s)?;
            let (s, offset) = be_i64(s)?;
            Ok((s, Message::StoreOffset { target, offset }))
        }
        _ => Err(nom::Err::Failure(nom::error::Error::new(
            s,
            nom::error::ErrorKind::Switch,
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> GroupPartition {
        GroupPartition {
            consumer_group: "g1".to_string(),
            topic: "orders".to_string(),
            partition: 3,
        }
    }

    #[test]
    fn test_fetch_request_layout() {
        let msg = Message::FetchRequest {
            target: target(),
            offset: USE_COMMITTED_OFFSET,
            read_size: 4096,
        };
        let bytes = msg.encode().unwrap();
        assert_eq!(bytes[0], 5);
        assert_eq!(&bytes[1..3], &[0, 2]);
        assert_eq!(Message::decode(bytes).unwrap(), msg);
    }

    #[test]
    fn test_publish_decodes_payloads_in_order() {
        let msg = Message::Publish {
            header: MessageHeader::new("orders", 0),
            messages: vec![Bytes::from_static(b"a"), Bytes::from_static(b"bb")],
        };
        let decoded = Message::decode(msg.encode().unwrap()).unwrap();
        match decoded {
            Message::Publish { header, messages } => {
                assert_eq!(header.topic, "orders");
                assert_eq!(messages.len(), 2);
                assert_eq!(messages[1], Bytes::from_static(b"bb"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_message_received_is_tag_only() {
        let bytes = Message::MessageReceived.encode().unwrap();
        assert_eq!(bytes.as_ref(), &[7]);
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let err = Message::decode(Bytes::from_static(&[3, 0, 0])).unwrap_err();
        assert!(matches!(err, Error::ParsingError(_)));
    }

    #[test]
    fn test_truncated_rejected() {
        let bytes = Message::StoreOffset {
            target: target(),
            offset: 10,
        }
        .encode()
        .unwrap();
        let truncated = bytes.slice(..bytes.len() - 2);
        assert!(Message::decode(truncated).is_err());
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut buf = BytesMut::from(&Message::MessageReceived.encode().unwrap()[..]);
        buf.put_u8(0);
        assert!(Message::decode(buf.freeze()).is_err());
    }

    #[test]
    fn test_empty_envelope() {
        assert_eq!(
            Message::decode(Bytes::new()).unwrap_err(),
            Error::MissingData("empty envelope".to_string())
        );
    }

    #[test]
    fn test_kind_labels() {
        assert_eq!(Message::MessageReceived.kind(), "message_received");
        assert_eq!(Message::OffsetRequest(target()).kind(), "offset_request");
    }
}
