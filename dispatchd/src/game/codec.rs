use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound for any frame we accept
pub const MAX_PACKET_LEN: usize = 2 * 1024 * 1024;

/// Handshake frames are tiny; anything bigger is not a client
pub const MAX_HANDSHAKE_LEN: usize = 1024;

const MAX_ADDRESS_LEN: usize = 255;
const LEGACY_PING: u8 = 0xfe;

pub const HANDSHAKE_ID: i32 = 0x00;
pub const STATUS_REQUEST_ID: i32 = 0x00;
pub const STATUS_RESPONSE_ID: i32 = 0x00;
pub const PING_ID: i32 = 0x01;
pub const LOGIN_DISCONNECT_ID: i32 = 0x00;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("varint longer than 5 bytes")]
    VarIntTooLong,

    #[error("invalid frame length {0}")]
    InvalidLength(i64),

    #[error("packet truncated")]
    Truncated,

    #[error("string of {0} bytes exceeds limit")]
    StringTooLong(usize),

    #[error("string is not utf-8")]
    InvalidString,

    #[error("unexpected packet id {0:#04x}")]
    UnexpectedPacket(i32),

    #[error("unknown handshake intent {0}")]
    UnknownIntent(i32),

    #[error("legacy server list ping")]
    LegacyPing,

    #[error("malformed status json: {0}")]
    Json(#[from] serde_json::Error),
}

/// A decoded frame: packet id plus the bytes that follow it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub id: i32,
    pub data: Vec<u8>,
}

pub async fn read_varint<R: AsyncRead + Unpin>(reader: &mut R) -> Result<i32, CodecError> {
    let mut value: u32 = 0;
    for i in 0..5 {
        let byte = reader.read_u8().await?;
        value |= u32::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(value as i32);
        }
    }
    Err(CodecError::VarIntTooLong)
}

pub fn write_varint(buf: &mut Vec<u8>, value: i32) {
    let mut value = value as u32;
    loop {
        if value & !0x7f == 0 {
            buf.push(value as u8);
            return;
        }
        buf.push((value & 0x7f) as u8 | 0x80);
        value >>= 7;
    }
}

pub fn write_string(buf: &mut Vec<u8>, value: &str) {
    write_varint(buf, value.len() as i32);
    buf.extend_from_slice(value.as_bytes());
}

/// Read one length-prefixed frame
pub async fn read_packet<R: AsyncRead + Unpin>(reader: &mut R, max_len: usize) -> Result<Packet, CodecError> {
    let first = reader.read_u8().await?;
    if first == LEGACY_PING {
        return Err(CodecError::LegacyPing);
    }

    // first byte already consumed; finish the varint by hand
    let len = if first & 0x80 == 0 {
        i64::from(first)
    } else {
        let rest = read_varint(reader).await?;
        i64::from(first & 0x7f) | (i64::from(rest as u32) << 7)
    };
    if len <= 0 || len as usize > max_len {
        return Err(CodecError::InvalidLength(len));
    }

    let mut frame = vec![0u8; len as usize];
    reader.read_exact(&mut frame).await?;

    let mut cursor = PacketReader::new(&frame);
    let id = cursor.read_varint()?;
    let data = cursor.remaining().to_vec();
    Ok(Packet { id, data })
}

pub fn encode_packet(id: i32, payload: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(payload.len() + 5);
    write_varint(&mut body, id);
    body.extend_from_slice(payload);

    let mut frame = Vec::with_capacity(body.len() + 5);
    write_varint(&mut frame, body.len() as i32);
    frame.extend_from_slice(&body);
    frame
}

pub async fn write_packet<W: AsyncWrite + Unpin>(writer: &mut W, id: i32, payload: &[u8]) -> Result<(), CodecError> {
    writer.write_all(&encode_packet(id, payload)).await?;
    writer.flush().await?;
    Ok(())
}

/// Cursor over a packet body
pub struct PacketReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PacketReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        let end = self.pos.checked_add(n).ok_or(CodecError::Truncated)?;
        let bytes = self.buf.get(self.pos..end).ok_or(CodecError::Truncated)?;
        self.pos = end;
        Ok(bytes)
    }

    pub fn read_varint(&mut self) -> Result<i32, CodecError> {
        let mut value: u32 = 0;
        for i in 0..5 {
            let byte = self.take(1)?[0];
            value |= u32::from(byte & 0x7f) << (7 * i);
            if byte & 0x80 == 0 {
                return Ok(value as i32);
            }
        }
        Err(CodecError::VarIntTooLong)
    }

    pub fn read_string(&mut self, max_len: usize) -> Result<String, CodecError> {
        let len = self.read_varint()?;
        if len < 0 {
            return Err(CodecError::InvalidLength(i64::from(len)));
        }
        let len = len as usize;
        if len > max_len {
            return Err(CodecError::StringTooLong(len));
        }
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidString)
    }

    pub fn read_u16(&mut self) -> Result<u16, CodecError> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub fn remaining(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }
}

/// What the client wants after the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Status,
    Login,
    Transfer,
}

impl Intent {
    fn from_wire(value: i32) -> Result<Self, CodecError> {
        match value {
            1 => Ok(Self::Status),
            2 => Ok(Self::Login),
            3 => Ok(Self::Transfer),
            other => Err(CodecError::UnknownIntent(other)),
        }
    }

    fn to_wire(self) -> i32 {
        match self {
            Self::Status => 1,
            Self::Login => 2,
            Self::Transfer => 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub protocol_version: i32,
    pub server_address: String,
    pub server_port: u16,
    pub intent: Intent,
}

impl Handshake {
    pub fn decode(packet: &Packet) -> Result<Self, CodecError> {
        if packet.id != HANDSHAKE_ID {
            return Err(CodecError::UnexpectedPacket(packet.id));
        }

        let mut cursor = PacketReader::new(&packet.data);
        let protocol_version = cursor.read_varint()?;
        let server_address = cursor.read_string(MAX_ADDRESS_LEN)?;
        let server_port = cursor.read_u16()?;
        let intent = Intent::from_wire(cursor.read_varint()?)?;

        Ok(Self {
            protocol_version,
            server_address,
            server_port,
            intent,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        write_varint(&mut payload, self.protocol_version);
        write_string(&mut payload, &self.server_address);
        payload.extend_from_slice(&self.server_port.to_be_bytes());
        write_varint(&mut payload, self.intent.to_wire());
        encode_packet(HANDSHAKE_ID, &payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varint_known_encodings() {
        let cases: [(i32, &[u8]); 6] = [
            (0, &[0x00]),
            (1, &[0x01]),
            (127, &[0x7f]),
            (128, &[0x80, 0x01]),
            (25565, &[0xdd, 0xc7, 0x01]),
            (-1, &[0xff, 0xff, 0xff, 0xff, 0x0f]),
        ];

        for (value, bytes) in cases {
            let mut buf = Vec::new();
            write_varint(&mut buf, value);
            assert_eq!(buf, bytes, "encoding {}", value);
            assert_eq!(PacketReader::new(bytes).read_varint().unwrap(), value);
        }
    }

    #[test]
    fn test_varint_too_long() {
        let bytes = [0x80, 0x80, 0x80, 0x80, 0x80, 0x01];
        assert!(matches!(
            PacketReader::new(&bytes).read_varint(),
            Err(CodecError::VarIntTooLong)
        ));
    }

    #[tokio::test]
    async fn test_handshake_through_framing() {
        let handshake = Handshake {
            protocol_version: 765,
            server_address: "survival.mc.example.com".to_string(),
            server_port: 30000,
            intent: Intent::Login,
        };
        let bytes = handshake.encode();

        let mut reader = &bytes[..];
        let packet = read_packet(&mut reader, MAX_HANDSHAKE_LEN).await.unwrap();
        assert_eq!(Handshake::decode(&packet).unwrap(), handshake);
        assert!(reader.is_empty());
    }

    #[tokio::test]
    async fn test_rejects_oversized_frame() {
        let frame = encode_packet(0, &vec![0u8; 2000]);
        let mut reader = &frame[..];
        assert!(matches!(
            read_packet(&mut reader, MAX_HANDSHAKE_LEN).await,
            Err(CodecError::InvalidLength(_))
        ));
    }

    #[tokio::test]
    async fn test_rejects_legacy_ping() {
        let bytes = [0xfe, 0x01, 0xfa];
        let mut reader = &bytes[..];
        assert!(matches!(
            read_packet(&mut reader, MAX_PACKET_LEN).await,
            Err(CodecError::LegacyPing)
        ));
    }

    #[test]
    fn test_unknown_intent() {
        let mut payload = Vec::new();
        write_varint(&mut payload, 765);
        write_string(&mut payload, "host");
        payload.extend_from_slice(&25565u16.to_be_bytes());
        write_varint(&mut payload, 9);

        let packet = Packet { id: HANDSHAKE_ID, data: payload };
        assert!(matches!(Handshake::decode(&packet), Err(CodecError::UnknownIntent(9))));
    }

    #[test]
    fn test_truncated_handshake() {
        let packet = Packet { id: HANDSHAKE_ID, data: vec![0xfd, 0x05, 0x04, b'h'] };
        assert!(matches!(Handshake::decode(&packet), Err(CodecError::Truncated)));
    }
}
