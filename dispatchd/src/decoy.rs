use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use crate::error::{DispatchError, Result};
use crate::game::codec::{
    read_packet, write_packet, write_string, CodecError, Handshake, Intent, Packet,
    LOGIN_DISCONNECT_ID, MAX_HANDSHAKE_LEN, MAX_PACKET_LEN, PING_ID, STATUS_REQUEST_ID,
    STATUS_RESPONSE_ID,
};
use crate::game::status::{disconnect_reason, StatusResponse};

/// Invoked on every login attempt. Debouncing is up to the owner.
pub type LoginCallback = Arc<dyn Fn() + Send + Sync>;

/// How long a connection may sit silent between packets
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Grace period for the login start packet that follows a login handshake
const LOGIN_START_TIMEOUT: Duration = Duration::from_secs(2);

struct DecoyState {
    name: String,
    descriptor: RwLock<String>,
    kick_message: RwLock<String>,
    on_login: RwLock<Option<LoginCallback>>,
}

impl DecoyState {
    fn descriptor(&self) -> String {
        self.descriptor.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn kick_message(&self) -> String {
        self.kick_message.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn fire_login(&self) {
        let callback = self.on_login.read().unwrap_or_else(PoisonError::into_inner).clone();
        if let Some(callback) = callback {
            callback();
        }
    }
}

/// Stand-in game server for a powered-off backend.
///
/// Answers server list pings with a synthetic status and turns away every
/// login with the kick message, reporting the attempt through the login
/// callback. Holds no reference to the endpoint that owns it.
pub struct DecoyResponder {
    bind: SocketAddr,
    state: Arc<DecoyState>,
    cancel: CancellationToken,
}

impl DecoyResponder {
    /// `cancel` ends the accept loop; pass a child of the owner's token.
    pub fn new(name: &str, bind: SocketAddr, motd: &str, kick_message: &str, cancel: CancellationToken) -> Self {
        Self {
            bind,
            state: Arc::new(DecoyState {
                name: name.to_string(),
                descriptor: RwLock::new(motd.to_string()),
                kick_message: RwLock::new(kick_message.to_string()),
                on_login: RwLock::new(None),
            }),
            cancel,
        }
    }

    /// Replace the login callback
    pub fn on_login_attempt(&self, callback: impl Fn() + Send + Sync + 'static) {
        *self.state.on_login.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(callback));
    }

    pub fn set_descriptor(&self, motd: &str) {
        *self.state.descriptor.write().unwrap_or_else(PoisonError::into_inner) = motd.to_string();
    }

    pub fn set_kick_message(&self, message: &str) {
        *self.state.kick_message.write().unwrap_or_else(PoisonError::into_inner) = message.to_string();
    }

    /// Bind the port and spawn the accept loop. Returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr> {
        let listener = TcpListener::bind(self.bind)
            .await
            .map_err(|source| DispatchError::Bind { addr: self.bind, source })?;
        let local = listener.local_addr().unwrap_or(self.bind);

        tracing::info!("Decoy for {} listening on {}", self.state.name, local);

        let state = self.state.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(accept_loop(listener, state, cancel));

        Ok(local)
    }

    /// Close the listener. Connections already accepted run to completion.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

async fn accept_loop(listener: TcpListener, state: Arc<DecoyState>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let state = state.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, &state).await {
                                tracing::debug!("Decoy connection from {} for {} ended: {}", peer, state.name, e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!("Decoy for {} failed to accept: {}", state.name, e);
                    }
                }
            }
            _ = cancel.cancelled() => {
                tracing::info!("Decoy for {} shutting down", state.name);
                break;
            }
        }
    }
}

async fn next_packet(stream: &mut TcpStream, max_len: usize, timeout: Duration) -> std::result::Result<Packet, CodecError> {
    match tokio::time::timeout(timeout, read_packet(stream, max_len)).await {
        Ok(packet) => packet,
        Err(_) => Err(CodecError::Io(std::io::ErrorKind::TimedOut.into())),
    }
}

async fn handle_connection(mut stream: TcpStream, state: &DecoyState) -> std::result::Result<(), CodecError> {
    let packet = next_packet(&mut stream, MAX_HANDSHAKE_LEN, CONNECTION_TIMEOUT).await?;
    let handshake = Handshake::decode(&packet)?;

    match handshake.intent {
        Intent::Status => serve_status(&mut stream, state, handshake.protocol_version).await,
        Intent::Login | Intent::Transfer => reject_login(&mut stream, state).await,
    }
}

async fn serve_status(stream: &mut TcpStream, state: &DecoyState, protocol: i32) -> std::result::Result<(), CodecError> {
    loop {
        let packet = next_packet(stream, MAX_PACKET_LEN, CONNECTION_TIMEOUT).await?;
        match packet.id {
            STATUS_REQUEST_ID => {
                let status = StatusResponse::sleeping(&state.name, &state.descriptor(), protocol);
                let mut payload = Vec::new();
                write_string(&mut payload, &serde_json::to_string(&status)?);
                write_packet(stream, STATUS_RESPONSE_ID, &payload).await?;
            }
            PING_ID => {
                write_packet(stream, PING_ID, &packet.data).await?;
                return Ok(());
            }
            other => return Err(CodecError::UnexpectedPacket(other)),
        }
    }
}

async fn reject_login(stream: &mut TcpStream, state: &DecoyState) -> std::result::Result<(), CodecError> {
    // Drain the login start so closing doesn't reset the connection before
    // the client reads the disconnect. Its contents don't matter.
    let _ = next_packet(stream, MAX_PACKET_LEN, LOGIN_START_TIMEOUT).await;

    let mut payload = Vec::new();
    write_string(&mut payload, &disconnect_reason(&state.kick_message()));
    let sent = write_packet(stream, LOGIN_DISCONNECT_ID, &payload).await;

    tracing::info!("Rejected login attempt on decoy for {}", state.name);
    state.fire_login();

    let _ = stream.shutdown().await;
    sent
}
