//! RFC 6455 frame wire format: header encode/decode and masking.

use smol::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::stream::AsyncStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    fn from_bits(bits: u8) -> Result<Self> {
        Ok(match bits {
            0 => Opcode::Continuation,
            1 => Opcode::Text,
            2 => Opcode::Binary,
            8 => Opcode::Close,
            9 => Opcode::Ping,
            10 => Opcode::Pong,
            other => return Err(Error::protocol_error(format!("unsupported opcode: {other}"))),
        })
    }

    fn to_bits(self) -> u8 {
        match self {
            Opcode::Continuation => 0,
            Opcode::Text => 1,
            Opcode::Binary => 2,
            Opcode::Close => 8,
            Opcode::Ping => 9,
            Opcode::Pong => 10,
        }
    }

    pub fn is_control(self) -> bool {
        matches!(self, Opcode::Close | Opcode::Ping | Opcode::Pong)
    }
}

#[derive(Debug)]
pub struct FrameHeader {
    pub fin: bool,
    pub opcode: Opcode,
    pub len: u64,
    pub mask_key: Option<[u8; 4]>,
}

/// Reads one frame header off `stream`, leaving the payload (still masked,
/// if any) to be read separately.
pub async fn read_header(stream: &mut dyn AsyncStream) -> Result<FrameHeader> {
    let mut first_two = [0u8; 2];
    read_exact(stream, &mut first_two).await?;

    let fin = first_two[0] & 0x80 != 0;
    let reserved = first_two[0] & 0x70;
    if reserved != 0 {
        return Err(Error::protocol_error("reserved bits must be zero"));
    }
    let opcode = Opcode::from_bits(first_two[0] & 0x0f)?;

    let masked = first_two[1] & 0x80 != 0;
    let len_field = first_two[1] & 0x7f;

    let len = match len_field {
        126 => {
            let mut buf = [0u8; 2];
            read_exact(stream, &mut buf).await?;
            u16::from_be_bytes(buf) as u64
        }
        127 => {
            let mut buf = [0u8; 8];
            read_exact(stream, &mut buf).await?;
            u64::from_be_bytes(buf)
        }
        n => n as u64,
    };

    let mask_key = if masked {
        let mut key = [0u8; 4];
        read_exact(stream, &mut key).await?;
        Some(key)
    } else {
        None
    };

    Ok(FrameHeader { fin, opcode, len, mask_key })
}

pub async fn read_payload(stream: &mut dyn AsyncStream, header: &FrameHeader) -> Result<Vec<u8>> {
    let mut payload = vec![0u8; header.len as usize];
    read_exact(stream, &mut payload).await?;
    if let Some(key) = header.mask_key {
        apply_mask(&mut payload, &key);
    }
    Ok(payload)
}

/// Writes one frame. `role == Client` sets the mask bit and masks the
/// payload with an all-zero key (permitted by the spec, simplifies the fast
/// path); servers never mask.
pub async fn write_frame(
    stream: &mut dyn AsyncStream,
    role: Role,
    fin: bool,
    opcode: Opcode,
    payload: &[u8],
) -> Result<()> {
    let mut header = Vec::with_capacity(14);
    let first_byte = (if fin { 0x80 } else { 0 }) | opcode.to_bits();
    header.push(first_byte);

    let mask_bit = if role == Role::Client { 0x80 } else { 0 };
    let len = payload.len();
    if len <= 125 {
        header.push(mask_bit | len as u8);
    } else if len <= 0xFFFF {
        header.push(mask_bit | 126);
        header.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        header.push(mask_bit | 127);
        header.extend_from_slice(&(len as u64).to_be_bytes());
    }

    stream.write_all(&header).await?;
    if role == Role::Client {
        header.clear();
        stream.write_all(&[0, 0, 0, 0]).await?;
        // Masking key is all-zero, so XOR is a no-op: the payload goes out
        // unchanged but the MASK bit above still marks it as masked.
        stream.write_all(payload).await?;
    } else {
        stream.write_all(payload).await?;
    }
    Ok(())
}

/// XORs `data` in place with `key`, cycling the 4-byte key. Self-inverse:
/// applying it twice with the same key restores the original bytes.
pub fn apply_mask(data: &mut [u8], key: &[u8; 4]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

async fn read_exact(stream: &mut dyn AsyncStream, buf: &mut [u8]) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = stream.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Err(Error::UnexpectedEndOfStream);
        }
        filled += n;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_is_self_inverse_at_every_offset() {
        let key = [0x12, 0x34, 0x56, 0x78];
        for offset in 0..8 {
            let original: Vec<u8> = (0..32u8).map(|b| b.wrapping_add(offset)).collect();
            let mut data = original.clone();
            apply_mask(&mut data, &key);
            apply_mask(&mut data, &key);
            assert_eq!(data, original);
        }
    }

    #[test]
    fn opcode_round_trips() {
        for bits in [0u8, 1, 2, 8, 9, 10] {
            let op = Opcode::from_bits(bits).unwrap();
            assert_eq!(op.to_bits(), bits);
        }
        assert!(Opcode::from_bits(3).is_err());
    }
}
