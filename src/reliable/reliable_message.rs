use anyhow::anyhow;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::util::buf::{put_string, try_get_string};

const ID_MESSAGE: u8 = 1;
const ID_ACKNOWLEDGE: u8 = 2;

/// The envelope that reliable channels exchange: application messages carry an id, and the
///  receiving side acknowledges each of them by echoing the id.
#[derive(Eq, PartialEq, Debug, Clone)]
pub enum ReliableMessage {
    Message { message_id: String, payload: Bytes },
    Acknowledge { message_id: String },
}

impl ReliableMessage {
    pub fn id(&self) -> u8 {
        match self {
            ReliableMessage::Message { .. } => ID_MESSAGE,
            ReliableMessage::Acknowledge { .. } => ID_ACKNOWLEDGE,
        }
    }

    pub fn message_id(&self) -> &str {
        match self {
            ReliableMessage::Message { message_id, .. } => message_id,
            ReliableMessage::Acknowledge { message_id } => message_id,
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(self.id());
        put_string(buf, self.message_id());
        if let ReliableMessage::Message { payload, .. } = self {
            buf.put_slice(payload);
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.ser(&mut buf);
        buf.freeze()
    }

    pub fn deser(mut buf: Bytes) -> anyhow::Result<ReliableMessage> {
        let id = buf.try_get_u8()?;
        let message_id = try_get_string(&mut buf)?;
        match id {
            ID_MESSAGE => Ok(ReliableMessage::Message { message_id, payload: buf }),
            ID_ACKNOWLEDGE => {
                if buf.has_remaining() {
                    return Err(anyhow!("acknowledge for {:?} has {} trailing bytes", message_id, buf.remaining()));
                }
                Ok(ReliableMessage::Acknowledge { message_id })
            }
            id => Err(anyhow!("invalid reliable message discriminator {}", id)),
        }
    }
}


#[cfg(test)]
mod test {
    use rstest::*;

    use ReliableMessage::*;

    use super::*;

    #[rstest]
    #[case::message(Message { message_id: "m-1".to_string(), payload: Bytes::from_static(b"hello") }, ID_MESSAGE)]
    #[case::empty_payload(Message { message_id: "m-2".to_string(), payload: Bytes::new() }, ID_MESSAGE)]
    #[case::acknowledge(Acknowledge { message_id: "m-1".to_string() }, ID_ACKNOWLEDGE)]
    fn test_ser_reliable_message(#[case] msg: ReliableMessage, #[case] msg_id: u8) {
        assert_eq!(msg.id(), msg_id);

        let buf = msg.to_bytes();
        let deser_msg = ReliableMessage::deser(buf).unwrap();
        assert_eq!(msg, deser_msg);
    }

    #[test]
    fn test_wire_format() {
        let msg = Message { message_id: "ab".to_string(), payload: Bytes::from_static(b"xyz") };
        assert_eq!(msg.to_bytes().as_ref(), b"\x01\x02abxyz");
    }

    #[rstest]
    #[case::empty(b"")]
    #[case::missing_id(b"\x01")]
    #[case::truncated_id(b"\x01\x05ab")]
    #[case::unknown_discriminator(b"\x07\x01a")]
    #[case::trailing_bytes_after_ack(b"\x02\x01ax")]
    fn test_deser_invalid(#[case] buf: &'static [u8]) {
        assert!(ReliableMessage::deser(Bytes::from_static(buf)).is_err());
    }
}
