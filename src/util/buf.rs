use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};


pub fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_usize_varint(s.len());
    buf.put_slice(s.as_bytes());
}

pub fn try_get_string(buf: &mut impl Buf) -> anyhow::Result<String> {
    let len = buf.try_get_usize_varint()?;
    if buf.remaining() < len {
        bail!("string length {} exceeds remaining buffer of {} bytes", len, buf.remaining());
    }

    let raw = buf.copy_to_bytes(len);
    let s = String::from_utf8(raw.to_vec())?;
    Ok(s)
}


#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::empty("", b"\0")]
    #[case::ascii("abc", b"\x03abc")]
    #[case::uuid("0b6e0a1f-5e0c-4a3b-9b0e-2f1d9a6c7e11", b"\x240b6e0a1f-5e0c-4a3b-9b0e-2f1d9a6c7e11")]
    fn test_put_string(#[case] s: &str, #[case] expected: &[u8]) {
        let mut buf = BytesMut::new();
        put_string(&mut buf, s);
        assert_eq!(buf.as_ref(), expected);

        let mut parse_buf: &[u8] = &buf;
        assert_eq!(try_get_string(&mut parse_buf).unwrap(), s);
        assert!(parse_buf.is_empty());
    }

    #[rstest]
    #[case::missing_len(b"")]
    #[case::truncated(b"\x05abc")]
    #[case::invalid_utf8(b"\x02\xff\xfe")]
    fn test_try_get_string_invalid(#[case] mut buf: &[u8]) {
        assert!(try_get_string(&mut buf).is_err());
    }
}
