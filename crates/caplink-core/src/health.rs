//! Connection health monitoring
//!
//! Detects silently-broken connections with a lightweight protocol probe and
//! downgrades them so an explicit connect (or auto-connect) can retry.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, warn};

use crate::connection::{ConnectionManager, ConnectionState};
use crate::error::{CoreError, Result};

const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Aggregated outcome of a full health sweep
#[derive(Debug, Clone, Serialize)]
pub struct HealthSummary {
    pub connected_servers: usize,
    pub total_servers: usize,
    /// Per-server probe outcome
    pub servers: Vec<(String, bool)>,
}

/// Probes connected servers and drives auto-reconnect
pub struct HealthMonitor {
    connections: Arc<ConnectionManager>,
    probe_timeout: Duration,
}

impl HealthMonitor {
    pub fn new(connections: Arc<ConnectionManager>) -> Self {
        Self {
            connections,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Probe one server. Returns `true` when healthy; an unhealthy probe
    /// downgrades the connection to the error state.
    pub async fn check_server(&self, id: &str) -> Result<bool> {
        // Unknown ids are the caller's mistake, not an unhealthy server
        self.connections
            .registry()
            .get(id)
            .ok_or_else(|| CoreError::ServerNotFound(id.to_string()))?;

        let Some(entry) = self.connections.entry(id) else {
            return Ok(false);
        };
        if *entry.state.read() != ConnectionState::Connected {
            return Ok(false);
        }

        // A probe already in flight answers for this one too
        if entry
            .probing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(server = %id, "Probe already in flight, skipping");
            return Ok(*entry.state.read() == ConnectionState::Connected);
        }

        let result = async {
            let Some(client) = self.connections.client(id) else {
                return Ok::<bool, CoreError>(false);
            };

            match client.ping(self.probe_timeout).await {
                Ok(()) => {
                    *entry.last_health_check.write() = Some(Utc::now());
                    Ok(true)
                }
                Err(e) => {
                    warn!(server = %id, error = %e, "Health probe failed");
                    self.connections
                        .mark_error(id, format!("health probe failed: {}", e))
                        .await;
                    Ok(false)
                }
            }
        }
        .await;

        entry.probing.store(false, Ordering::SeqCst);
        result
    }

    /// Probe every configured server concurrently
    pub async fn check_all(&self) -> HealthSummary {
        let statuses = self.connections.all_servers();
        let total_servers = statuses.len();

        let probes = statuses.iter().map(|status| {
            let id = status.id.clone();
            async move {
                let healthy = self.check_server(&id).await.unwrap_or(false);
                (id, healthy)
            }
        });

        let mut servers = join_all(probes).await;
        servers.sort_by(|a, b| a.0.cmp(&b.0));
        let connected_servers = servers.iter().filter(|(_, healthy)| *healthy).count();

        HealthSummary {
            connected_servers,
            total_servers,
            servers,
        }
    }

    /// Connect every enabled server that is not already connected.
    ///
    /// Failures are isolated per server; returns `(server id, reason)` for
    /// each failed attempt.
    pub async fn auto_connect_all(&self) -> Vec<(String, String)> {
        let candidates: Vec<String> = self
            .connections
            .all_servers()
            .into_iter()
            .filter(|s| s.enabled && s.state != ConnectionState::Connected)
            .map(|s| s.id)
            .collect();

        let attempts = candidates.into_iter().map(|id| async move {
            match self.connections.connect(&id).await {
                Ok(()) => None,
                Err(e) => Some((id, e.to_string())),
            }
        });

        join_all(attempts).await.into_iter().flatten().collect()
    }
}
