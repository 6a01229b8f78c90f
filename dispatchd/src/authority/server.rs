use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::rdata::{A, SRV};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use shared::protocol::{SRV_PRIORITY, SRV_WEIGHT};
use shared::types::RecordSnapshot;
use crate::authority::records::RecordTable;
use crate::error::{DispatchError, Result};

const MAX_DATAGRAM: usize = 4096;

/// Authoritative resolver for the dispatcher's zone.
///
/// Holds the service-location and address tables the controller steers
/// clients with, and answers SRV/A queries for names under the root domain.
pub struct Authority {
    ttl: u32,
    /// Lower-case, always ends with '.'
    root_domain: String,
    listen: SocketAddr,
    services: RecordTable,
    addresses: RecordTable,
    cancel: CancellationToken,
}

impl Authority {
    pub fn new(ttl: u32, root_domain: &str, listen: SocketAddr) -> Self {
        let mut root_domain = root_domain.trim_start_matches('.').to_ascii_lowercase();
        if !root_domain.ends_with('.') {
            root_domain.push('.');
        }

        Self {
            ttl,
            root_domain,
            listen,
            services: RecordTable::default(),
            addresses: RecordTable::default(),
            cancel: CancellationToken::new(),
        }
    }

    /// Root domain with its trailing dot
    pub fn root_domain(&self) -> &str {
        &self.root_domain
    }

    /// Fully qualified name for a label under the root, without trailing dot
    pub fn qualify(&self, label: &str) -> String {
        format!("{}.{}", label, self.root_domain.trim_end_matches('.'))
    }

    /// Add or replace a service record. `target` is "host:port".
    pub fn add_service_record(&self, service_name: &str, target: &str) {
        tracing::info!("Adding service record for {}: {}", service_name, target);
        self.services.insert(service_name, target);
    }

    pub fn remove_service_record(&self, service_name: &str) {
        if self.services.remove(service_name).is_some() {
            tracing::info!("Removed service record for {}", service_name);
        }
    }

    pub fn add_address_record(&self, name: &str, ip: Ipv4Addr) {
        tracing::info!("Adding address record for {}: {}", name, ip);
        self.addresses.insert(name, &ip.to_string());
    }

    pub fn remove_address_record(&self, name: &str) {
        if self.addresses.remove(name).is_some() {
            tracing::info!("Removed address record for {}", name);
        }
    }

    pub fn service_record(&self, service_name: &str) -> Option<String> {
        self.services.get(service_name)
    }

    pub fn address_record(&self, name: &str) -> Option<String> {
        self.addresses.get(name)
    }

    pub fn snapshot(&self) -> RecordSnapshot {
        RecordSnapshot {
            services: self.services.snapshot(),
            addresses: self.addresses.snapshot(),
        }
    }

    /// Bind the configured listen address
    pub async fn bind(&self) -> Result<UdpSocket> {
        UdpSocket::bind(self.listen)
            .await
            .map_err(|source| DispatchError::Bind { addr: self.listen, source })
    }

    /// Bind and answer queries until `stop` is called
    pub async fn serve(self: Arc<Self>) -> Result<()> {
        let socket = self.bind().await?;
        self.serve_on(socket).await
    }

    /// Answer queries arriving on an already bound socket until `stop` is called.
    /// Every datagram is handled on its own task.
    pub async fn serve_on(self: Arc<Self>, socket: UdpSocket) -> Result<()> {
        let socket = Arc::new(socket);
        let local = socket.local_addr().unwrap_or(self.listen);
        tracing::info!("Resolution authority listening on {} for {}", local, self.root_domain);

        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            tokio::select! {
                received = socket.recv_from(&mut buf) => {
                    let (len, peer) = match received {
                        Ok(received) => received,
                        Err(e) => {
                            tracing::warn!("Failed to receive query: {}", e);
                            continue;
                        }
                    };

                    let datagram = buf[..len].to_vec();
                    let authority = self.clone();
                    let socket = socket.clone();
                    tokio::spawn(async move {
                        let Some(reply) = authority.handle_datagram(&datagram) else {
                            return;
                        };
                        if let Err(e) = socket.send_to(&reply, peer).await {
                            tracing::warn!("Failed to send response to {}: {}", peer, e);
                        }
                    });
                }
                _ = self.cancel.cancelled() => {
                    tracing::info!("Resolution authority shutting down");
                    break;
                }
            }
        }

        Ok(())
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Decode one datagram and encode the reply. Undecodable queries get a
    /// name-error reply when their id is readable, and no reply otherwise.
    pub fn handle_datagram(&self, datagram: &[u8]) -> Option<Vec<u8>> {
        let response = match Message::from_vec(datagram) {
            Ok(request) => self.answer(&request),
            Err(e) => {
                tracing::debug!("Malformed query: {}", e);
                let id = u16::from_be_bytes([*datagram.first()?, *datagram.get(1)?]);
                Message::error_msg(id, OpCode::Query, ResponseCode::NXDomain)
            }
        };

        match response.to_vec() {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                tracing::warn!("Failed to encode response: {}", e);
                None
            }
        }
    }

    /// Build the response for a decoded query
    pub fn answer(&self, request: &Message) -> Message {
        let mut response = Message::new();
        response
            .set_id(request.id())
            .set_message_type(MessageType::Response)
            .set_op_code(request.op_code())
            .set_authoritative(true)
            .set_recursion_desired(request.recursion_desired());
        for query in request.queries() {
            response.add_query(query.clone());
        }

        let code = self.resolve(request, &mut response);
        response.set_response_code(code);
        response
    }

    fn resolve(&self, request: &Message, response: &mut Message) -> ResponseCode {
        let [query] = request.queries() else {
            return ResponseCode::NXDomain;
        };

        let Some(label) = self.strip_root(&query.name().to_ascii()) else {
            return ResponseCode::NXDomain;
        };

        tracing::debug!("Received {} query for {}", query.query_type(), label);

        match query.query_type() {
            RecordType::SRV => {
                let Some(target) = self.services.get(&label) else {
                    return ResponseCode::NXDomain;
                };
                match self.srv_answer(query.name().clone(), &target) {
                    Some(record) => {
                        response.add_answer(record);
                        ResponseCode::NoError
                    }
                    None => {
                        tracing::warn!("Malformed service record for {}: {}", label, target);
                        ResponseCode::ServFail
                    }
                }
            }
            RecordType::A => {
                let Some(ip) = self.addresses.get(&label) else {
                    return ResponseCode::NXDomain;
                };
                match ip.parse::<Ipv4Addr>() {
                    Ok(ip) => {
                        response.add_answer(Record::from_rdata(
                            query.name().clone(),
                            self.ttl,
                            RData::A(A(ip)),
                        ));
                        ResponseCode::NoError
                    }
                    Err(_) => {
                        tracing::warn!("Malformed address record for {}: {}", label, ip);
                        ResponseCode::ServFail
                    }
                }
            }
            _ => ResponseCode::NXDomain,
        }
    }

    /// "_minecraft._tcp.survival.mc.example.com." -> "_minecraft._tcp.survival"
    fn strip_root(&self, name: &str) -> Option<String> {
        let mut name = name.to_ascii_lowercase();
        if !name.ends_with('.') {
            name.push('.');
        }
        if name.len() <= self.root_domain.len() {
            return None;
        }

        let label = name.strip_suffix(&self.root_domain)?.strip_suffix('.')?;
        if label.is_empty() {
            return None;
        }
        Some(label.to_string())
    }

    fn srv_answer(&self, name: Name, target: &str) -> Option<Record> {
        let (host, port) = target.rsplit_once(':')?;
        let port = port.parse::<u16>().ok()?;
        if host.is_empty() {
            return None;
        }

        let mut host = host.to_string();
        if !host.ends_with('.') {
            host.push('.');
        }
        let host = Name::from_ascii(&host).ok()?;

        Some(Record::from_rdata(
            name,
            self.ttl,
            RData::SRV(SRV::new(SRV_PRIORITY, SRV_WEIGHT, port, host)),
        ))
    }
}
