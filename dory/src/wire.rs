use bytes::Buf;
use thiserror::Error;

/// Checked big-endian reads over a byte slice cursor. Both the client
/// input framing and the Kafka codecs parse with these; writers use
/// `BufMut` directly since writes cannot fail.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum WireError {
    #[error("truncated input")]
    Truncated,
}

pub fn get_i8(buf: &mut &[u8]) -> Result<i8, WireError> {
    ensure(buf, 1)?;
    Ok(buf.get_i8())
}

pub fn get_i16(buf: &mut &[u8]) -> Result<i16, WireError> {
    ensure(buf, 2)?;
    Ok(buf.get_i16())
}

pub fn get_u16(buf: &mut &[u8]) -> Result<u16, WireError> {
    ensure(buf, 2)?;
    Ok(buf.get_u16())
}

pub fn get_i32(buf: &mut &[u8]) -> Result<i32, WireError> {
    ensure(buf, 4)?;
    Ok(buf.get_i32())
}

pub fn get_u32(buf: &mut &[u8]) -> Result<u32, WireError> {
    ensure(buf, 4)?;
    Ok(buf.get_u32())
}

pub fn get_i64(buf: &mut &[u8]) -> Result<i64, WireError> {
    ensure(buf, 8)?;
    Ok(buf.get_i64())
}

/// Splits the next `n` bytes off the front of the cursor.
pub fn take<'a>(buf: &mut &'a [u8], n: usize) -> Result<&'a [u8], WireError> {
    if buf.len() < n {
        return Err(WireError::Truncated);
    }
    let (head, tail) = buf.split_at(n);
    *buf = tail;
    Ok(head)
}

fn ensure(buf: &[u8], n: usize) -> Result<(), WireError> {
    if buf.len() < n {
        return Err(WireError::Truncated);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_consume_in_order() {
        let data = [0x01, 0x02, 0x00, 0x03, b'a', b'b'];
        let mut cursor = &data[..];
        assert_eq!(get_i16(&mut cursor), Ok(0x0102));
        assert_eq!(get_i16(&mut cursor), Ok(3));
        assert_eq!(take(&mut cursor, 2), Ok(&b"ab"[..]));
        assert_eq!(get_i8(&mut cursor), Err(WireError::Truncated));
    }

    #[test]
    fn take_does_not_consume_on_error() {
        let data = [1u8, 2];
        let mut cursor = &data[..];
        assert_eq!(take(&mut cursor, 3), Err(WireError::Truncated));
        assert_eq!(cursor.len(), 2);
    }
}
