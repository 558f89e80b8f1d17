use anyhow::anyhow;
use bytes::{Buf, BufMut, Bytes, BytesMut};

const ID_PING: u8 = 1;
const ID_MESSAGE: u8 = 2;

/// The envelope that monitored channels exchange on top of the underlying channel: either a
///  ping or an application message. The payload is carried as-is after the discriminator byte.
#[derive(Eq, PartialEq, Debug, Clone)]
pub enum MonitorMessage {
    Ping,
    Message(Bytes),
}

impl MonitorMessage {
    pub fn id(&self) -> u8 {
        match self {
            MonitorMessage::Ping => ID_PING,
            MonitorMessage::Message(_) => ID_MESSAGE,
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(self.id());
        if let MonitorMessage::Message(payload) = self {
            buf.put_slice(payload);
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.ser(&mut buf);
        buf.freeze()
    }

    pub fn deser(mut buf: Bytes) -> anyhow::Result<MonitorMessage> {
        match buf.try_get_u8()? {
            ID_PING => Ok(MonitorMessage::Ping),
            ID_MESSAGE => Ok(MonitorMessage::Message(buf)),
            id => Err(anyhow!("invalid monitor message discriminator {}", id)),
        }
    }
}


#[cfg(test)]
mod test {
    use rstest::*;

    use MonitorMessage::*;

    use super::*;

    #[rstest]
    #[case::ping(Ping, ID_PING)]
    #[case::message(Message(Bytes::from_static(b"hello")), ID_MESSAGE)]
    #[case::empty_message(Message(Bytes::new()), ID_MESSAGE)]
    fn test_ser_monitor_message(#[case] msg: MonitorMessage, #[case] msg_id: u8) {
        assert_eq!(msg.id(), msg_id);

        let buf = msg.to_bytes();
        assert_eq!(buf[0], msg_id);
        let deser_msg = MonitorMessage::deser(buf).unwrap();
        assert_eq!(msg, deser_msg);
    }

    #[rstest]
    #[case::empty(b"")]
    #[case::unknown_discriminator(b"\x07abc")]
    fn test_deser_invalid(#[case] buf: &'static [u8]) {
        assert!(MonitorMessage::deser(Bytes::from_static(buf)).is_err());
    }
}
