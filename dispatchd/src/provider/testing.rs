use std::net::Ipv4Addr;
use std::sync::Mutex;
use anyhow::{bail, Result};
use async_trait::async_trait;
use shared::types::PowerState;
use crate::provider::{LifecycleProvider, ProviderStatus};

/// Scripted provider for tests. After `start`, the backend reports
/// `Starting` for `boot_polls` status calls, then `Running`.
#[derive(Debug)]
pub struct MockProvider {
    inner: Mutex<MockState>,
}

#[derive(Debug, Default, Clone)]
struct MockState {
    state: Option<PowerState>,
    ip: Option<Ipv4Addr>,
    boot_polls: u32,
    polls_left: u32,
    start_calls: usize,
    stop_calls: usize,
    status_calls: usize,
    fail_start: bool,
    fail_stop: bool,
    fail_status: bool,
}

impl MockProvider {
    pub fn new(ip: Ipv4Addr) -> Self {
        Self {
            inner: Mutex::new(MockState {
                state: Some(PowerState::Stopped),
                ip: Some(ip),
                ..MockState::default()
            }),
        }
    }

    pub fn with_boot_polls(self, polls: u32) -> Self {
        self.inner.lock().unwrap().boot_polls = polls;
        self
    }

    pub fn set_state(&self, state: PowerState) {
        self.inner.lock().unwrap().state = Some(state);
    }

    pub fn state(&self) -> PowerState {
        self.inner.lock().unwrap().state.unwrap_or(PowerState::Stopped)
    }

    pub fn fail_start(&self, fail: bool) {
        self.inner.lock().unwrap().fail_start = fail;
    }

    pub fn fail_stop(&self, fail: bool) {
        self.inner.lock().unwrap().fail_stop = fail;
    }

    pub fn fail_status(&self, fail: bool) {
        self.inner.lock().unwrap().fail_status = fail;
    }

    pub fn start_calls(&self) -> usize {
        self.inner.lock().unwrap().start_calls
    }

    pub fn stop_calls(&self) -> usize {
        self.inner.lock().unwrap().stop_calls
    }

    pub fn status_calls(&self) -> usize {
        self.inner.lock().unwrap().status_calls
    }
}

#[async_trait]
impl LifecycleProvider for MockProvider {
    async fn start(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.start_calls += 1;
        if inner.fail_start {
            bail!("mock start failure");
        }
        if inner.boot_polls == 0 {
            inner.state = Some(PowerState::Running);
        } else {
            inner.state = Some(PowerState::Starting);
            inner.polls_left = inner.boot_polls;
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.stop_calls += 1;
        if inner.fail_stop {
            bail!("mock stop failure");
        }
        inner.state = Some(PowerState::Stopped);
        Ok(())
    }

    async fn status(&self) -> Result<ProviderStatus> {
        let mut inner = self.inner.lock().unwrap();
        inner.status_calls += 1;
        if inner.fail_status {
            bail!("mock status failure");
        }

        let mut state = inner.state.unwrap_or(PowerState::Stopped);
        if state == PowerState::Starting {
            if inner.polls_left == 0 {
                state = PowerState::Running;
                inner.state = Some(state);
            } else {
                inner.polls_left -= 1;
            }
        }

        let ip = if state == PowerState::Running { inner.ip } else { None };
        Ok(ProviderStatus { state, ip })
    }
}
