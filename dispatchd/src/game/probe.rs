use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use crate::game::codec::{
    encode_packet, read_packet, write_packet, CodecError, Handshake, Intent, PacketReader,
    MAX_PACKET_LEN, PING_ID, STATUS_REQUEST_ID, STATUS_RESPONSE_ID,
};
use crate::error::Result;
use crate::game::status::StatusResponse;

/// Protocol version sent when we only want the status document
const PROBE_PROTOCOL_VERSION: i32 = -1;

/// What a live backend reported about itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub version: String,
    pub online: i64,
    pub max: i64,
}

/// Server list ping against `addr`, bounded by `timeout` end to end.
/// Wire and timeout failures surface as `DispatchError::Protocol`.
pub async fn ping(addr: SocketAddr, timeout: Duration) -> Result<StatusReport> {
    match tokio::time::timeout(timeout, ping_inner(addr)).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(CodecError::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!("status probe to {} timed out after {:?}", addr, timeout),
        ))
        .into()),
    }
}

async fn ping_inner(addr: SocketAddr) -> std::result::Result<StatusReport, CodecError> {
    let mut stream = TcpStream::connect(addr).await?;

    let handshake = Handshake {
        protocol_version: PROBE_PROTOCOL_VERSION,
        server_address: addr.ip().to_string(),
        server_port: addr.port(),
        intent: Intent::Status,
    };
    let mut request = handshake.encode();
    request.extend_from_slice(&encode_packet(STATUS_REQUEST_ID, &[]));
    stream.write_all(&request).await?;

    let packet = read_packet(&mut stream, MAX_PACKET_LEN).await?;
    if packet.id != STATUS_RESPONSE_ID {
        return Err(CodecError::UnexpectedPacket(packet.id));
    }

    let mut cursor = PacketReader::new(&packet.data);
    let json = cursor.read_string(MAX_PACKET_LEN)?;
    let status: StatusResponse = serde_json::from_str(&json)?;

    // be polite; the server expects the exchange to end with a ping
    let _ = write_packet(&mut stream, PING_ID, &0i64.to_be_bytes()).await;

    Ok(StatusReport {
        version: status.version.name,
        online: status.players.online,
        max: status.players.max,
    })
}
