use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use shared::types::{EndpointSnapshot, PowerState};
use crate::decoy::DecoyResponder;
use crate::provider::LifecycleProvider;

/// Registration input for one backend
#[derive(Debug, Clone)]
pub struct EndpointSpec {
    pub name: String,
    pub sub_domain: String,
    pub port: u16,
    pub provider: Arc<dyn LifecycleProvider>,
}

/// One managed backend, owned by the controller's registry
pub struct Endpoint {
    pub name: String,
    pub sub_domain: String,
    /// Port the real backend listens on
    pub port: u16,
    pub decoy_port: u16,
    pub provider: Arc<dyn LifecycleProvider>,
    pub decoy: DecoyResponder,
    /// Serializes start/stop so their record writes never interleave
    pub(super) transition: tokio::sync::Mutex<()>,
    pub(super) cancel: CancellationToken,
    last_activity: Mutex<Instant>,
    last_trigger: Mutex<Option<Instant>>,
    login_cooldown: Duration,
}

impl Endpoint {
    pub(super) fn new(
        spec: EndpointSpec,
        decoy_port: u16,
        decoy: DecoyResponder,
        cancel: CancellationToken,
        login_cooldown: Duration,
    ) -> Self {
        Self {
            name: spec.name,
            sub_domain: spec.sub_domain,
            port: spec.port,
            decoy_port,
            provider: spec.provider,
            decoy,
            transition: tokio::sync::Mutex::new(()),
            cancel,
            last_activity: Mutex::new(Instant::now()),
            last_trigger: Mutex::new(None),
            login_cooldown,
        }
    }

    pub fn touch(&self) {
        *self.last_activity.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Debounce gate for login-triggered starts. Checks and stamps the last
    /// trigger under one lock, so concurrent logins let exactly one through
    /// per cool-down window.
    pub fn try_trigger(&self, now: Instant) -> bool {
        let mut last = self.last_trigger.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = *last {
            if now.saturating_duration_since(previous) < self.login_cooldown {
                return false;
            }
        }
        *last = Some(now);
        true
    }

    pub fn snapshot(&self, state: Option<PowerState>) -> EndpointSnapshot {
        let idle = self.idle_for();
        let last_activity = chrono::Duration::from_std(idle)
            .ok()
            .and_then(|idle| Utc::now().checked_sub_signed(idle))
            .unwrap_or_else(Utc::now);

        EndpointSnapshot {
            name: self.name.clone(),
            sub_domain: self.sub_domain.clone(),
            port: self.port,
            decoy_port: self.decoy_port,
            last_activity,
            idle_secs: idle.as_secs(),
            route: None,
            address: None,
            state,
        }
    }

    #[cfg(test)]
    pub(super) fn set_idle_for(&self, idle: Duration) {
        let mut last = self.last_activity.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(past) = Instant::now().checked_sub(idle) {
            *last = past;
        }
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("name", &self.name)
            .field("sub_domain", &self.sub_domain)
            .field("port", &self.port)
            .field("decoy_port", &self.decoy_port)
            .finish_non_exhaustive()
    }
}
