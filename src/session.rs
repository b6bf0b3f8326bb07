use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::agent::{AgentError, Desktop};

#[derive(Clone, Copy, Debug, Default)]
struct Lifecycle {
    initialized: bool,
    sandbox_active: bool,
    started_at: Option<Instant>,
}

/// Owned handle to one sandbox and its provisioning flags. One `Agent` owns
/// exactly one session; nothing here is process-global.
pub struct Session<D: Desktop> {
    desktop: Arc<D>,
    lifecycle: Mutex<Lifecycle>,
    max_lifetime: Option<Duration>,
}

impl<D: Desktop> Session<D> {
    pub fn new(desktop: D) -> Self {
        Self {
            desktop: Arc::new(desktop),
            lifecycle: Mutex::new(Lifecycle::default()),
            max_lifetime: None,
        }
    }

    /// Sandboxes older than `lifetime` are torn down on next use.
    pub fn with_max_lifetime(mut self, lifetime: Option<Duration>) -> Self {
        self.max_lifetime = lifetime.filter(|d| !d.is_zero());
        self
    }

    pub fn desktop(&self) -> Arc<D> {
        self.desktop.clone()
    }

    pub async fn provision(&self) -> Result<(), AgentError> {
        let mut lc = self.lifecycle.lock().await;
        if lc.sandbox_active {
            return Ok(());
        }
        self.desktop.start().await?;
        *lc = Lifecycle {
            initialized: true,
            sandbox_active: true,
            started_at: Some(Instant::now()),
        };
        info!("sandbox provisioned");
        Ok(())
    }

    pub async fn teardown(&self) -> Result<(), AgentError> {
        let mut lc = self.lifecycle.lock().await;
        if !lc.sandbox_active && !lc.initialized {
            return Ok(());
        }
        *lc = Lifecycle::default();
        drop(lc);
        let res = self.desktop.stop().await;
        match &res {
            Ok(()) => info!("sandbox stopped"),
            Err(e) => warn!("sandbox stop failed: {}", e),
        }
        res
    }

    /// Fails with `NotReady` unless the sandbox is up. An expired sandbox is
    /// torn down here.
    pub async fn ensure_ready(&self) -> Result<(), AgentError> {
        let lc = *self.lifecycle.lock().await;
        if !lc.initialized || !lc.sandbox_active {
            return Err(AgentError::NotReady("sandbox is not running".into()));
        }
        if let (Some(limit), Some(started)) = (self.max_lifetime, lc.started_at) {
            if started.elapsed() >= limit {
                warn!(lifetime_s = limit.as_secs(), "sandbox exceeded its lifetime, shutting down");
                return Err(match self.teardown().await {
                    Ok(()) => AgentError::NotReady("sandbox expired".into()),
                    Err(e) => AgentError::NotReady(format!("sandbox expired; stop failed: {e}")),
                });
            }
        }
        Ok(())
    }

    pub async fn flags(&self) -> (bool, bool, Option<Duration>) {
        let lc = *self.lifecycle.lock().await;
        (lc.initialized, lc.sandbox_active, lc.started_at.map(|s| s.elapsed()))
    }
}
