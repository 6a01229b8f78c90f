pub mod endpoint;
pub mod ports;
pub mod sweep;

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use shared::protocol::service_record_name;
use shared::types::{EndpointSnapshot, PowerState};
use crate::authority::Authority;
use crate::config::Config;
use crate::decoy::DecoyResponder;
use crate::error::{DispatchError, Result};
use crate::provider::ProviderStatus;
pub use endpoint::{Endpoint, EndpointSpec};
use ports::PortAllocator;

const BIND_RETRY_INITIAL: Duration = Duration::from_secs(1);
const BIND_RETRY_MAX: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct ControllerOptions {
    /// Label under the root domain that resolves to this host
    pub host_label: String,
    pub public_ip: Ipv4Addr,
    pub decoy_bind: IpAddr,
    pub port_range: RangeInclusive<u16>,
    pub sweep_interval: Duration,
    pub idle_timeout: Duration,
    pub start_timeout: Duration,
    pub poll_interval: Duration,
    pub probe_timeout: Duration,
    pub login_cooldown: Duration,
    pub require_players: bool,
    pub motd: String,
    pub kick_message: String,
}

impl ControllerOptions {
    pub fn from_config(config: &Config) -> Self {
        let dispatch = &config.dispatch;
        Self {
            host_label: dispatch.host_label.clone(),
            public_ip: dispatch.public_ip,
            decoy_bind: dispatch.bind,
            port_range: dispatch.port_start..=dispatch.port_end,
            sweep_interval: dispatch.sweep_interval(),
            idle_timeout: dispatch.idle_timeout(),
            start_timeout: dispatch.start_timeout(),
            poll_interval: dispatch.poll_interval(),
            probe_timeout: dispatch.probe_timeout(),
            login_cooldown: dispatch.login_cooldown(),
            require_players: dispatch.require_players,
            motd: config.messages.motd.clone(),
            kick_message: config.messages.kick.clone(),
        }
    }
}

/// Owns the endpoint registry and keeps the authority's records in line
/// with what each backend's provider reports.
///
/// While a backend is not confirmed running its service record points at
/// the dispatcher and its decoy port, and it has no address record. Once
/// running, the service record points at the backend and the address
/// record carries the provider-reported IP.
pub struct DispatchController {
    options: ControllerOptions,
    authority: Arc<Authority>,
    registry: RwLock<HashMap<String, Arc<Endpoint>>>,
    ports: Mutex<PortAllocator>,
    quit: CancellationToken,
}

impl DispatchController {
    /// Also publishes the dispatcher's own address record
    pub fn new(options: ControllerOptions, authority: Arc<Authority>) -> Arc<Self> {
        authority.add_address_record(&options.host_label, options.public_ip);

        Arc::new(Self {
            ports: Mutex::new(PortAllocator::new(options.port_range.clone())),
            options,
            authority,
            registry: RwLock::new(HashMap::new()),
            quit: CancellationToken::new(),
        })
    }

    pub fn authority(&self) -> &Arc<Authority> {
        &self.authority
    }

    /// Allocate a decoy, start it, route the endpoint's name to it and add
    /// the endpoint to the registry.
    pub async fn register_endpoint(self: &Arc<Self>, spec: EndpointSpec) -> Result<Arc<Endpoint>> {
        if self.read_registry().contains_key(&spec.name) {
            return Err(DispatchError::AlreadyRegistered(spec.name));
        }

        let (decoy_port, in_use) = {
            let mut ports = self.lock_ports();
            (ports.allocate()?, ports.in_use())
        };
        tracing::info!("Allocated port {} for server {} ({} in use)", decoy_port, spec.name, in_use);

        let cancel = self.quit.child_token();
        let decoy = DecoyResponder::new(
            &spec.name,
            SocketAddr::new(self.options.decoy_bind, decoy_port),
            &self.options.motd,
            &self.options.kick_message,
            cancel.child_token(),
        );
        let endpoint = Arc::new(Endpoint::new(
            spec,
            decoy_port,
            decoy,
            cancel,
            self.options.login_cooldown,
        ));

        // nothing else can see the endpoint yet, so this never waits
        let guard = endpoint.transition.lock().await;

        {
            let mut registry = self.write_registry();
            if registry.contains_key(&endpoint.name) {
                drop(registry);
                endpoint.cancel.cancel();
                self.lock_ports().release(decoy_port);
                return Err(DispatchError::AlreadyRegistered(endpoint.name.clone()));
            }
            registry.insert(endpoint.name.clone(), endpoint.clone());
        }

        self.wire_login_trigger(&endpoint);
        self.start_decoy(&endpoint).await;
        self.route_to_decoy(&endpoint);
        drop(guard);

        tracing::info!(
            "Registered server {} ({}) with decoy on port {}",
            endpoint.name,
            self.authority.qualify(&endpoint.sub_domain),
            decoy_port
        );
        Ok(endpoint)
    }

    /// Power the backend on if needed, wait for it to run, then route
    /// clients to it.
    pub async fn start_endpoint(&self, name: &str) -> Result<()> {
        let endpoint = self.endpoint(name)?;
        self.start(&endpoint).await
    }

    /// Power the backend off if it runs, and route clients back to the
    /// decoy whatever the provider said.
    pub async fn stop_endpoint(&self, name: &str) -> Result<()> {
        let endpoint = self.endpoint(name)?;
        self.stop(&endpoint).await
    }

    /// Remove an endpoint: cancel its tasks, stop its backend best-effort,
    /// drop both records and free its decoy port.
    pub async fn unregister_endpoint(&self, name: &str) -> Result<()> {
        let endpoint = self
            .write_registry()
            .remove(name)
            .ok_or_else(|| DispatchError::NotFound(name.to_string()))?;

        endpoint.cancel.cancel();
        endpoint.decoy.stop();

        // in-flight transitions unwind at their next await; a provider call
        // already on the wire finishes first
        let _guard = endpoint.transition.lock().await;

        if let Err(e) = endpoint.provider.stop().await {
            tracing::warn!("Failed to stop server {} during removal: {:#}", name, e);
        }

        self.authority.remove_service_record(&service_record_name(&endpoint.sub_domain));
        self.authority.remove_address_record(&endpoint.sub_domain);
        self.lock_ports().release(endpoint.decoy_port);

        tracing::info!("Unregistered server {}", name);
        Ok(())
    }

    pub fn endpoint(&self, name: &str) -> Result<Arc<Endpoint>> {
        self.read_registry()
            .get(name)
            .cloned()
            .ok_or_else(|| DispatchError::NotFound(name.to_string()))
    }

    pub fn endpoints(&self) -> Vec<Arc<Endpoint>> {
        let mut endpoints: Vec<_> = self.read_registry().values().cloned().collect();
        endpoints.sort_by(|a, b| a.name.cmp(&b.name));
        endpoints
    }

    /// Snapshots with current routing, without touching the providers
    pub fn snapshots(&self) -> Vec<EndpointSnapshot> {
        self.endpoints().iter().map(|e| self.snapshot(e, None)).collect()
    }

    /// Snapshot with the provider's live state
    pub async fn describe(&self, name: &str) -> Result<EndpointSnapshot> {
        let endpoint = self.endpoint(name)?;
        let status = self.status(&endpoint).await?;
        Ok(self.snapshot(&endpoint, Some(status.state)))
    }

    pub fn snapshot(&self, endpoint: &Endpoint, state: Option<PowerState>) -> EndpointSnapshot {
        EndpointSnapshot {
            route: self.authority.service_record(&service_record_name(&endpoint.sub_domain)),
            address: self.authority.address_record(&endpoint.sub_domain),
            ..endpoint.snapshot(state)
        }
    }

    /// Replace the texts the endpoint's decoy serves to new connections
    pub fn set_decoy_messages(&self, name: &str, motd: Option<&str>, kick_message: Option<&str>) -> Result<()> {
        let endpoint = self.endpoint(name)?;
        if let Some(motd) = motd {
            endpoint.decoy.set_descriptor(motd);
        }
        if let Some(kick_message) = kick_message {
            endpoint.decoy.set_kick_message(kick_message);
        }
        tracing::info!("Updated decoy messages for {}", name);
        Ok(())
    }

    /// Stop the authority, unregister everything and drop the dispatcher record
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down dispatch controller");
        self.quit.cancel();
        self.authority.stop();

        let names: Vec<String> = self.read_registry().keys().cloned().collect();
        for name in names {
            if let Err(e) = self.unregister_endpoint(&name).await {
                tracing::warn!("Failed to unregister {}: {}", name, e);
            }
        }

        self.authority.remove_address_record(&self.options.host_label);
    }

    pub fn quit_token(&self) -> CancellationToken {
        self.quit.clone()
    }

    async fn start(&self, endpoint: &Arc<Endpoint>) -> Result<()> {
        let _guard = tokio::select! {
            guard = endpoint.transition.lock() => guard,
            _ = endpoint.cancel.cancelled() => return Err(DispatchError::Cancelled(endpoint.name.clone())),
        };
        self.ensure_live(endpoint)?;
        // a start in progress is activity
        endpoint.touch();

        let deadline = Instant::now() + self.options.start_timeout;
        let mut status = self.status(endpoint).await?;

        if status.state == PowerState::Stopping {
            tracing::info!("Server {} is stopping, waiting before start", endpoint.name);
            status = self.wait_while(endpoint, PowerState::Stopping, deadline).await?;
        }

        if status.state == PowerState::Stopped {
            tracing::info!("Starting server {}", endpoint.name);
            endpoint
                .provider
                .start()
                .await
                .map_err(|e| DispatchError::provider(&endpoint.name, e))?;
            self.ensure_live(endpoint)?;
            status = self.status(endpoint).await?;
        }

        if status.state != PowerState::Running {
            status = self.wait_until_running(endpoint, status, deadline).await?;
        }

        let ip = status.ip.ok_or_else(|| DispatchError::Provider {
            endpoint: endpoint.name.clone(),
            message: "backend is running but reported no address".to_string(),
        })?;

        self.ensure_live(endpoint)?;
        self.route_to_backend(endpoint, ip);
        endpoint.touch();

        tracing::info!("Server {} is running at {}", endpoint.name, ip);
        Ok(())
    }

    async fn stop(&self, endpoint: &Arc<Endpoint>) -> Result<()> {
        let _guard = tokio::select! {
            guard = endpoint.transition.lock() => guard,
            _ = endpoint.cancel.cancelled() => return Err(DispatchError::Cancelled(endpoint.name.clone())),
        };
        self.ensure_live(endpoint)?;
        self.stop_locked(endpoint).await
    }

    /// Stops the backend only if it is still idle for at least `threshold`
    /// once the transition lock is held. Returns whether a stop was attempted.
    pub(crate) async fn stop_if_idle(&self, endpoint: &Arc<Endpoint>, threshold: Duration) -> Result<bool> {
        let _guard = tokio::select! {
            guard = endpoint.transition.lock() => guard,
            _ = endpoint.cancel.cancelled() => return Err(DispatchError::Cancelled(endpoint.name.clone())),
        };
        self.ensure_live(endpoint)?;

        let idle = endpoint.idle_for();
        if idle < threshold {
            tracing::debug!("Server {} saw activity while waiting, keeping it up", endpoint.name);
            return Ok(false);
        }
        if self.status(endpoint).await?.state != PowerState::Running {
            return Ok(false);
        }

        tracing::info!("Server {} idle for {}s, stopping", endpoint.name, idle.as_secs());
        self.stop_locked(endpoint).await?;
        Ok(true)
    }

    /// Caller holds `endpoint.transition`
    async fn stop_locked(&self, endpoint: &Arc<Endpoint>) -> Result<()> {
        let result = match self.status(endpoint).await {
            Ok(status) if status.state == PowerState::Running => {
                tracing::info!("Stopping server {}", endpoint.name);
                endpoint
                    .provider
                    .stop()
                    .await
                    .map_err(|e| DispatchError::provider(&endpoint.name, e))
            }
            Ok(_) => Ok(()),
            Err(e) => Err(e),
        };

        self.ensure_live(endpoint)?;
        self.route_to_decoy(endpoint);

        if let Err(e) = &result {
            tracing::warn!("Stop of {} did not complete cleanly: {}", endpoint.name, e);
        }
        result
    }

    async fn wait_until_running(
        &self,
        endpoint: &Endpoint,
        mut status: ProviderStatus,
        deadline: Instant,
    ) -> Result<ProviderStatus> {
        while status.state != PowerState::Running {
            tracing::info!("Waiting for server {} to start ({})", endpoint.name, status.state);
            self.pause_until_next_poll(endpoint, deadline).await?;
            status = self.status(endpoint).await?;
        }
        Ok(status)
    }

    async fn wait_while(&self, endpoint: &Endpoint, state: PowerState, deadline: Instant) -> Result<ProviderStatus> {
        loop {
            self.pause_until_next_poll(endpoint, deadline).await?;
            let status = self.status(endpoint).await?;
            if status.state != state {
                return Ok(status);
            }
        }
    }

    async fn pause_until_next_poll(&self, endpoint: &Endpoint, deadline: Instant) -> Result<()> {
        let now = Instant::now();
        if now >= deadline {
            return Err(DispatchError::StartTimeout {
                endpoint: endpoint.name.clone(),
                waited: self.options.start_timeout,
            });
        }

        let pause = self.options.poll_interval.min(deadline - now);
        tokio::select! {
            _ = tokio::time::sleep(pause) => Ok(()),
            _ = endpoint.cancel.cancelled() => Err(DispatchError::Cancelled(endpoint.name.clone())),
        }
    }

    async fn status(&self, endpoint: &Endpoint) -> Result<ProviderStatus> {
        endpoint
            .provider
            .status()
            .await
            .map_err(|e| DispatchError::provider(&endpoint.name, e))
    }

    fn ensure_live(&self, endpoint: &Endpoint) -> Result<()> {
        if endpoint.is_cancelled() {
            return Err(DispatchError::Cancelled(endpoint.name.clone()));
        }
        Ok(())
    }

    /// Address first, so a client following the new service record can resolve it
    fn route_to_backend(&self, endpoint: &Endpoint, ip: Ipv4Addr) {
        self.authority.add_address_record(&endpoint.sub_domain, ip);
        self.authority.add_service_record(
            &service_record_name(&endpoint.sub_domain),
            &format!("{}:{}", self.authority.qualify(&endpoint.sub_domain), endpoint.port),
        );
    }

    /// Service record first, so no client is sent to a dying backend
    fn route_to_decoy(&self, endpoint: &Endpoint) {
        self.authority.add_service_record(
            &service_record_name(&endpoint.sub_domain),
            &format!("{}:{}", self.authority.qualify(&self.options.host_label), endpoint.decoy_port),
        );
        self.authority.remove_address_record(&endpoint.sub_domain);
    }

    /// Login attempts on the decoy start the backend, at most once per cool-down
    fn wire_login_trigger(self: &Arc<Self>, endpoint: &Arc<Endpoint>) {
        let controller = Arc::downgrade(self);
        let weak_endpoint = Arc::downgrade(endpoint);

        endpoint.decoy.on_login_attempt(move || {
            let (Some(controller), Some(endpoint)) = (controller.upgrade(), weak_endpoint.upgrade()) else {
                return;
            };
            if endpoint.is_cancelled() {
                return;
            }
            if !endpoint.try_trigger(Instant::now()) {
                tracing::debug!("Ignoring login on {} within cool-down", endpoint.name);
                return;
            }

            tracing::info!("Login attempt on {}, starting backend", endpoint.name);
            tokio::spawn(async move {
                if let Err(e) = controller.start(&endpoint).await {
                    tracing::warn!("Failed to start server {}: {}", endpoint.name, e);
                }
            });
        });
    }

    /// Bind the decoy now, or keep retrying with backoff until it binds or
    /// the endpoint goes away
    async fn start_decoy(&self, endpoint: &Arc<Endpoint>) {
        let Err(e) = endpoint.decoy.start().await else {
            return;
        };
        tracing::error!("Decoy for {} failed to start: {}; retrying", endpoint.name, e);

        let endpoint = Arc::downgrade(endpoint);
        tokio::spawn(async move {
            let mut delay = BIND_RETRY_INITIAL;
            loop {
                let Some(cancel) = endpoint.upgrade().map(|e| e.cancel.clone()) else {
                    return;
                };
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return,
                }

                let Some(endpoint) = endpoint.upgrade() else {
                    return;
                };
                if endpoint.decoy.is_stopped() {
                    return;
                }
                match endpoint.decoy.start().await {
                    Ok(_) => return,
                    Err(e) => {
                        tracing::warn!("Decoy for {} still failing: {}", endpoint.name, e);
                        delay = (delay * 2).min(BIND_RETRY_MAX);
                    }
                }
            }
        });
    }

    fn read_registry(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<Endpoint>>> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_registry(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<Endpoint>>> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_ports(&self) -> std::sync::MutexGuard<'_, PortAllocator> {
        self.ports.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU16, Ordering};
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;
    use crate::game::codec::{read_packet, Handshake, Intent, LOGIN_DISCONNECT_ID, MAX_PACKET_LEN};
    use hickory_proto::op::{Message, ResponseCode};
    use hickory_proto::rr::{RData, RecordType};
    use crate::authority::server::tests::query;
    use crate::provider::testing::MockProvider;

    // each test gets its own slice of ports so parallel tests never collide
    static NEXT_RANGE: AtomicU16 = AtomicU16::new(41000);

    pub(crate) fn options(range_len: u16) -> ControllerOptions {
        let start = NEXT_RANGE.fetch_add(range_len.max(1) + 1, Ordering::SeqCst);
        ControllerOptions {
            host_label: "dispatch".to_string(),
            public_ip: Ipv4Addr::new(203, 0, 113, 10),
            decoy_bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port_range: start..=start + range_len - 1,
            sweep_interval: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(60),
            start_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(10),
            probe_timeout: Duration::from_millis(500),
            login_cooldown: Duration::from_secs(10),
            require_players: true,
            motd: "Sleeping".to_string(),
            kick_message: "Starting".to_string(),
        }
    }

    pub(crate) fn controller(options: ControllerOptions) -> Arc<DispatchController> {
        let authority = Arc::new(Authority::new(60, "mc.example.com", SocketAddr::from(([127, 0, 0, 1], 0))));
        DispatchController::new(options, authority)
    }

    pub(crate) fn spec(name: &str, provider: Arc<MockProvider>) -> EndpointSpec {
        EndpointSpec {
            name: name.to_string(),
            sub_domain: name.to_string(),
            port: 25565,
            provider,
        }
    }

    fn mock() -> Arc<MockProvider> {
        Arc::new(MockProvider::new(Ipv4Addr::new(10, 0, 0, 5)))
    }

    fn srv(controller: &DispatchController, sub_domain: &str) -> Option<String> {
        controller.authority().service_record(&service_record_name(sub_domain))
    }

    pub(crate) fn assert_decoy_routing(controller: &DispatchController, endpoint: &Endpoint) {
        assert_eq!(
            srv(controller, &endpoint.sub_domain),
            Some(format!("dispatch.mc.example.com:{}", endpoint.decoy_port))
        );
        assert_eq!(controller.authority().address_record(&endpoint.sub_domain), None);
    }

    async fn eventually(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        check()
    }

    #[tokio::test]
    async fn test_new_publishes_dispatcher_address() {
        let controller = controller(options(1));
        assert_eq!(
            controller.authority().address_record("dispatch").as_deref(),
            Some("203.0.113.10")
        );
    }

    #[tokio::test]
    async fn test_registered_endpoint_routes_to_decoy() {
        let options = options(4);
        let first_port = *options.port_range.start();
        let controller = controller(options);

        let endpoint = controller.register_endpoint(spec("survival", mock())).await.unwrap();

        assert_eq!(endpoint.decoy_port, first_port);
        assert_decoy_routing(&controller, &endpoint);
    }

    #[tokio::test]
    async fn test_register_removes_stale_address_record() {
        let controller = controller(options(2));
        controller.authority().add_address_record("survival", Ipv4Addr::new(10, 9, 9, 9));

        let endpoint = controller.register_endpoint(spec("survival", mock())).await.unwrap();
        assert_decoy_routing(&controller, &endpoint);
    }

    #[tokio::test]
    async fn test_distinct_ports_until_exhausted() {
        let controller = controller(options(3));

        let mut ports = std::collections::HashSet::new();
        for name in ["a", "b", "c"] {
            let endpoint = controller.register_endpoint(spec(name, mock())).await.unwrap();
            assert!(ports.insert(endpoint.decoy_port));
        }
        assert_eq!(ports.len(), 3);

        let err = controller.register_endpoint(spec("d", mock())).await.unwrap_err();
        assert!(matches!(err, DispatchError::PortExhausted { .. }), "{}", err);
        assert!(controller.endpoint("d").is_err());
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected() {
        let controller = controller(options(2));
        controller.register_endpoint(spec("survival", mock())).await.unwrap();

        let err = controller.register_endpoint(spec("survival", mock())).await.unwrap_err();
        assert!(matches!(err, DispatchError::AlreadyRegistered(_)));
        assert_eq!(controller.lock_ports().in_use(), 1);
    }

    #[tokio::test]
    async fn test_start_then_stop() {
        let controller = controller(options(1));
        let provider = Arc::new(MockProvider::new(Ipv4Addr::new(10, 0, 0, 5)).with_boot_polls(3));
        let endpoint = controller.register_endpoint(spec("survival", provider.clone())).await.unwrap();

        controller.start_endpoint("survival").await.unwrap();

        assert_eq!(provider.start_calls(), 1);
        assert_eq!(srv(&controller, "survival").as_deref(), Some("survival.mc.example.com:25565"));
        assert_eq!(controller.authority().address_record("survival").as_deref(), Some("10.0.0.5"));

        controller.stop_endpoint("survival").await.unwrap();

        assert_eq!(provider.stop_calls(), 1);
        assert_eq!(provider.state(), PowerState::Stopped);
        assert_decoy_routing(&controller, &endpoint);
    }

    #[tokio::test]
    async fn test_snapshots_show_routing() {
        let controller = controller(options(1));
        let endpoint = controller.register_endpoint(spec("survival", mock())).await.unwrap();

        let snapshots = controller.snapshots();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(
            snapshots[0].route,
            Some(format!("dispatch.mc.example.com:{}", endpoint.decoy_port))
        );
        assert_eq!(snapshots[0].address, None);

        controller.start_endpoint("survival").await.unwrap();
        let snapshot = controller.describe("survival").await.unwrap();
        assert_eq!(snapshot.route.as_deref(), Some("survival.mc.example.com:25565"));
        assert_eq!(snapshot.address.as_deref(), Some("10.0.0.5"));
        assert_eq!(snapshot.state, Some(PowerState::Running));
    }

    #[tokio::test]
    async fn test_start_when_already_running_skips_provider_start() {
        let controller = controller(options(1));
        let provider = mock();
        provider.set_state(PowerState::Running);
        controller.register_endpoint(spec("survival", provider.clone())).await.unwrap();

        controller.start_endpoint("survival").await.unwrap();

        assert_eq!(provider.start_calls(), 0);
        assert_eq!(controller.authority().address_record("survival").as_deref(), Some("10.0.0.5"));
    }

    #[tokio::test]
    async fn test_start_waits_out_stopping() {
        let controller = controller(options(1));
        let provider = mock();
        provider.set_state(PowerState::Stopping);
        controller.register_endpoint(spec("survival", provider.clone())).await.unwrap();

        let handle = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.start_endpoint("survival").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(provider.start_calls(), 0, "must not start while stopping");
        provider.set_state(PowerState::Stopped);

        handle.await.unwrap().unwrap();
        assert_eq!(provider.start_calls(), 1);
        assert_eq!(provider.state(), PowerState::Running);
    }

    #[tokio::test]
    async fn test_start_unknown_endpoint() {
        let controller = controller(options(1));
        assert!(matches!(
            controller.start_endpoint("nope").await,
            Err(DispatchError::NotFound(_))
        ));
        assert!(matches!(
            controller.stop_endpoint("nope").await,
            Err(DispatchError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_start_timeout_keeps_decoy_routing() {
        let mut options = options(1);
        options.start_timeout = Duration::from_millis(100);
        let controller = controller(options);
        let provider = Arc::new(MockProvider::new(Ipv4Addr::new(10, 0, 0, 5)).with_boot_polls(u32::MAX));
        let endpoint = controller.register_endpoint(spec("survival", provider)).await.unwrap();

        let err = controller.start_endpoint("survival").await.unwrap_err();

        assert!(matches!(err, DispatchError::StartTimeout { .. }), "{}", err);
        assert_decoy_routing(&controller, &endpoint);
    }

    #[tokio::test]
    async fn test_start_provider_error_propagates() {
        let controller = controller(options(1));
        let provider = mock();
        provider.fail_start(true);
        let endpoint = controller.register_endpoint(spec("survival", provider)).await.unwrap();

        let err = controller.start_endpoint("survival").await.unwrap_err();

        assert!(matches!(err, DispatchError::Provider { .. }), "{}", err);
        assert_decoy_routing(&controller, &endpoint);
    }

    #[tokio::test]
    async fn test_stop_when_stopped_is_noop() {
        let controller = controller(options(1));
        let provider = mock();
        let endpoint = controller.register_endpoint(spec("survival", provider.clone())).await.unwrap();

        controller.stop_endpoint("survival").await.unwrap();
        controller.stop_endpoint("survival").await.unwrap();

        assert_eq!(provider.stop_calls(), 0);
        assert_decoy_routing(&controller, &endpoint);
    }

    #[tokio::test]
    async fn test_stop_failure_still_restores_decoy() {
        let controller = controller(options(1));
        let provider = mock();
        let endpoint = controller.register_endpoint(spec("survival", provider.clone())).await.unwrap();
        controller.start_endpoint("survival").await.unwrap();

        provider.fail_stop(true);
        let err = controller.stop_endpoint("survival").await.unwrap_err();

        assert!(matches!(err, DispatchError::Provider { .. }));
        assert_decoy_routing(&controller, &endpoint);
    }

    #[tokio::test]
    async fn test_status_failure_on_stop_still_restores_decoy() {
        let controller = controller(options(1));
        let provider = mock();
        let endpoint = controller.register_endpoint(spec("survival", provider.clone())).await.unwrap();
        controller.start_endpoint("survival").await.unwrap();

        provider.fail_status(true);
        assert!(controller.stop_endpoint("survival").await.is_err());
        assert_decoy_routing(&controller, &endpoint);
    }

    #[tokio::test]
    async fn test_concurrent_start_and_stop_leave_consistent_records() {
        let controller = controller(options(1));
        let provider = Arc::new(MockProvider::new(Ipv4Addr::new(10, 0, 0, 5)).with_boot_polls(2));
        let endpoint = controller.register_endpoint(spec("survival", provider.clone())).await.unwrap();

        let start = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.start_endpoint("survival").await })
        };
        let stop = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.stop_endpoint("survival").await })
        };
        let _ = start.await.unwrap();
        let _ = stop.await.unwrap();

        // whichever finished last decides, but records always agree with each other
        match provider.state() {
            PowerState::Running => {
                assert_eq!(srv(&controller, "survival").as_deref(), Some("survival.mc.example.com:25565"));
                assert_eq!(controller.authority().address_record("survival").as_deref(), Some("10.0.0.5"));
            }
            _ => assert_decoy_routing(&controller, &endpoint),
        }
    }

    #[tokio::test]
    async fn test_unregister_cleans_up() {
        let controller = controller(options(1));
        let provider = mock();
        let endpoint = controller.register_endpoint(spec("survival", provider.clone())).await.unwrap();
        controller.start_endpoint("survival").await.unwrap();

        controller.unregister_endpoint("survival").await.unwrap();

        assert!(endpoint.is_cancelled());
        assert!(endpoint.decoy.is_stopped());
        assert_eq!(provider.state(), PowerState::Stopped);
        assert_eq!(srv(&controller, "survival"), None);
        assert_eq!(controller.authority().address_record("survival"), None);
        assert!(matches!(controller.endpoint("survival"), Err(DispatchError::NotFound(_))));
        assert_eq!(controller.lock_ports().in_use(), 0);

        // the freed port is handed out again
        let again = controller.register_endpoint(spec("creative", mock())).await.unwrap();
        assert_eq!(again.decoy_port, endpoint.decoy_port);
    }

    #[tokio::test]
    async fn test_unregister_unknown() {
        let controller = controller(options(1));
        assert!(matches!(
            controller.unregister_endpoint("nope").await,
            Err(DispatchError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_unregister_during_start_discards_result() {
        let mut options = options(1);
        options.start_timeout = Duration::from_secs(30);
        let controller = controller(options);
        let provider = Arc::new(MockProvider::new(Ipv4Addr::new(10, 0, 0, 5)).with_boot_polls(u32::MAX));
        controller.register_endpoint(spec("survival", provider.clone())).await.unwrap();

        let start = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.start_endpoint("survival").await })
        };
        assert!(eventually(|| provider.start_calls() == 1).await);

        controller.unregister_endpoint("survival").await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(2), start).await.unwrap().unwrap();
        assert!(matches!(result, Err(DispatchError::Cancelled(_))), "{:?}", result);
        assert_eq!(srv(&controller, "survival"), None);
        assert_eq!(controller.authority().address_record("survival"), None);
    }

    #[tokio::test]
    async fn test_shutdown_unregisters_everything() {
        let controller = controller(options(2));
        let a = mock();
        let b = mock();
        controller.register_endpoint(spec("a", a.clone())).await.unwrap();
        controller.register_endpoint(spec("b", b.clone())).await.unwrap();

        controller.shutdown().await;

        assert!(controller.endpoints().is_empty());
        assert_eq!(a.stop_calls(), 1);
        assert_eq!(b.stop_calls(), 1);
        assert_eq!(controller.authority().snapshot(), shared::types::RecordSnapshot::default());
    }

    async fn attempt_login(port: u16) {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let handshake = Handshake {
            protocol_version: 765,
            server_address: "survival.mc.example.com".to_string(),
            server_port: port,
            intent: Intent::Login,
        };
        stream.write_all(&handshake.encode()).await.unwrap();
        stream.write_all(&crate::game::codec::encode_packet(0x00, &[0x05, b'S', b't', b'e', b'v', b'e'])).await.unwrap();
        let packet = read_packet(&mut stream, MAX_PACKET_LEN).await.unwrap();
        assert_eq!(packet.id, LOGIN_DISCONNECT_ID);
    }

    #[tokio::test]
    async fn test_login_within_cooldown_starts_once() {
        let controller = controller(options(1));
        let provider = mock();
        let endpoint = controller.register_endpoint(spec("survival", provider.clone())).await.unwrap();

        attempt_login(endpoint.decoy_port).await;
        attempt_login(endpoint.decoy_port).await;

        assert!(eventually(|| controller.authority().address_record("survival").is_some()).await);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(provider.start_calls(), 1);
    }

    #[tokio::test]
    async fn test_login_after_cooldown_starts_again() {
        let mut options = options(1);
        options.login_cooldown = Duration::from_millis(200);
        let controller = controller(options);
        let provider = mock();
        let endpoint = controller.register_endpoint(spec("survival", provider.clone())).await.unwrap();

        attempt_login(endpoint.decoy_port).await;
        assert!(eventually(|| provider.start_calls() == 1).await);

        // backend went away again
        controller.stop_endpoint("survival").await.unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;

        attempt_login(endpoint.decoy_port).await;
        assert!(eventually(|| provider.start_calls() == 2).await);
    }

    #[tokio::test]
    async fn test_survival_scenario() {
        let controller = controller(options(11));
        let provider = Arc::new(MockProvider::new(Ipv4Addr::new(10, 0, 0, 5)).with_boot_polls(2));
        let endpoint = controller
            .register_endpoint(EndpointSpec {
                name: "survival".to_string(),
                sub_domain: "survival".to_string(),
                port: 25565,
                provider: provider.clone(),
            })
            .await
            .unwrap();

        assert_eq!(endpoint.decoy_port, *controller.options.port_range.start());
        assert_decoy_routing(&controller, &endpoint);

        // what a client resolving the server sees while it sleeps
        let asleep = controller.authority().answer(&query(SURVIVAL_SRV, RecordType::SRV));
        assert_eq!(asleep.response_code(), ResponseCode::NoError);
        assert_eq!(srv_answer(&asleep), ("dispatch.mc.example.com.".to_string(), endpoint.decoy_port));
        let no_address = controller.authority().answer(&query("survival.mc.example.com.", RecordType::A));
        assert_eq!(no_address.response_code(), ResponseCode::NXDomain);

        attempt_login(endpoint.decoy_port).await;

        assert!(eventually(|| srv(&controller, "survival").as_deref() == Some("survival.mc.example.com:25565")).await);
        assert_eq!(controller.authority().address_record("survival").as_deref(), Some("10.0.0.5"));

        let awake = controller.authority().answer(&query(SURVIVAL_SRV, RecordType::SRV));
        assert_eq!(srv_answer(&awake), ("survival.mc.example.com.".to_string(), 25565));
        let address = controller.authority().answer(&query("survival.mc.example.com.", RecordType::A));
        assert_eq!(address.response_code(), ResponseCode::NoError);
        match address.answers().first().and_then(|record| record.data()) {
            Some(RData::A(a)) => assert_eq!(a.0, Ipv4Addr::new(10, 0, 0, 5)),
            other => panic!("unexpected answer: {:?}", other),
        }
    }

    const SURVIVAL_SRV: &str = "_minecraft._tcp.survival.mc.example.com.";

    fn srv_answer(response: &Message) -> (String, u16) {
        match response.answers().first().and_then(|record| record.data()) {
            Some(RData::SRV(srv)) => (srv.target().to_ascii(), srv.port()),
            other => panic!("unexpected answer: {:?}", other),
        }
    }
}
