//! Reconciliation of the proxy's listener groups with the app registry
//!
//! One reconciliation resolves an app's domain and port, fetches the live
//! listener-group map, rewrites it in memory and pushes it back. The
//! fetch/mutate/replace cycle runs under a lock so two reconciliations never
//! interleave and drop each other's changes.

use crate::error::{NotFoundError, ReconcileError, TransportError};
use crate::transport::AdminTransport;
use crate::tree::{ListenerGroup, ListenerGroupMap, Route};
use hyper::body::Bytes;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Name of the group created when nothing listens for secure traffic
pub const SECURE_GROUP_NAME: &str = "routesync_https";

/// Where the reconciler gets an app's domain and port from
pub trait BindingSource: Send + Sync {
    fn lookup_domain(&self, app_id: i64) -> anyhow::Result<Option<String>>;

    /// The app's port as stored; may be empty
    fn lookup_port(&self, app_id: i64) -> anyhow::Result<Option<String>>;

    /// Every registered app, in the order a full resync visits them
    fn app_ids(&self) -> anyhow::Result<Vec<i64>>;
}

/// The state one app should have in the proxy
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DesiredBinding {
    pub domain: String,
    /// `host:port` the proxy dials, without scheme
    pub backend_address: String,
}

#[derive(Debug, Clone)]
pub struct ReconcileOptions {
    /// Port that marks a group as plaintext
    pub http_port: u16,
    /// Port that marks a group as secure
    pub https_port: u16,
    /// Host part of every backend address
    pub upstream_host: String,
    /// Drop `file_server` handlers from catch-all routes of plaintext groups
    pub strip_plaintext_catch_all: bool,
    /// Name of the group synthesized for secure traffic
    pub secure_group_name: String,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            http_port: 80,
            https_port: 443,
            upstream_host: "127.0.0.1".to_string(),
            strip_plaintext_catch_all: true,
            secure_group_name: SECURE_GROUP_NAME.to_string(),
        }
    }
}

/// What a reconciliation changed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Changes {
    /// Groups whose managed route got a new dial address
    pub updated: Vec<String>,
    /// Groups that received a new route
    pub installed: Vec<String>,
    /// Name of the group created for secure traffic
    pub created_group: Option<String>,
    /// Number of catch-all `file_server` handlers removed
    pub removed_catch_all: usize,
}

impl Changes {
    pub fn is_empty(&self) -> bool {
        self.updated.is_empty()
            && self.installed.is_empty()
            && self.created_group.is_none()
            && self.removed_catch_all == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    /// The live configuration already matched; nothing was written
    Unchanged,
    /// The mutated configuration was pushed
    Applied(Changes),
}

/// One app that failed during a full resync
#[derive(Debug, Clone, Serialize)]
pub struct SyncFailure {
    pub app_id: i64,
    pub error: String,
}

/// Result of reconciling every registered app
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub applied: Vec<i64>,
    pub unchanged: Vec<i64>,
    pub failed: Vec<SyncFailure>,
}

impl SyncReport {
    pub fn total(&self) -> usize {
        self.applied.len() + self.unchanged.len() + self.failed.len()
    }
}

/// Rewrite `groups` so that `binding` is routed.
///
/// Pure in-memory step of a reconciliation; running it again on its own
/// output yields no changes.
pub fn apply_binding(
    groups: &mut ListenerGroupMap,
    binding: &DesiredBinding,
    options: &ReconcileOptions,
) -> Changes {
    let mut changes = Changes::default();

    let mut targets: Vec<String> = groups
        .iter()
        .filter(|(_, group)| {
            group.listens_on(options.http_port) || group.listens_on(options.https_port)
        })
        .map(|(name, _)| name.clone())
        .collect();

    if !groups.values().any(|group| group.listens_on(options.https_port)) {
        let name = &options.secure_group_name;
        if groups.contains_key(name) {
            debug!(group = %name, "Secure group name already taken, leaving existing group alone");
        } else {
            let secure = ListenerGroup::listening_on([format!(":{}", options.https_port)]);
            groups.insert(name.clone(), secure);
            targets.push(name.clone());
            changes.created_group = Some(name.clone());
        }
    }

    for name in &targets {
        let Some(group) = groups.get_mut(name) else {
            continue;
        };

        if options.strip_plaintext_catch_all && group.listens_on(options.http_port) {
            changes.removed_catch_all += group.strip_catch_all_file_servers();
        }

        match group.managed_upstream_mut() {
            Some(upstream) => {
                if upstream.dial != binding.backend_address {
                    debug!(
                        group = %name,
                        from = %upstream.dial,
                        to = %binding.backend_address,
                        "Updating dial address"
                    );
                    upstream.dial = binding.backend_address.clone();
                    changes.updated.push(name.clone());
                }
            }
            None => {
                debug!(group = %name, domain = %binding.domain, "Installing route");
                group
                    .routes
                    .push(Route::proxy_for_host(&binding.domain, &binding.backend_address));
                changes.installed.push(name.clone());
            }
        }
    }

    changes
}

/// Keeps the proxy's listener groups in line with the registry
pub struct Reconciler<T, B> {
    transport: T,
    bindings: Arc<B>,
    options: ReconcileOptions,
    /// Serializes every read-modify-write of the proxy configuration
    lock: Mutex<()>,
}

impl<T, B> Reconciler<T, B>
where
    T: AdminTransport,
    B: BindingSource,
{
    pub fn new(transport: T, bindings: Arc<B>, options: ReconcileOptions) -> Self {
        Self {
            transport,
            bindings,
            options,
            lock: Mutex::new(()),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Look up the domain and backend address for an app
    pub fn resolve_binding(&self, app_id: i64) -> Result<DesiredBinding, ReconcileError> {
        let domain = self
            .bindings
            .lookup_domain(app_id)
            .map_err(ReconcileError::Storage)?
            .map(|domain| domain.trim().to_string())
            .filter(|domain| !domain.is_empty())
            .ok_or(NotFoundError::Domain(app_id))?;

        let port = self
            .bindings
            .lookup_port(app_id)
            .map_err(ReconcileError::Storage)?
            .ok_or(NotFoundError::Port(app_id))?;
        let port = port.trim();
        if port.is_empty() {
            return Err(NotFoundError::EmptyPort(app_id).into());
        }

        Ok(DesiredBinding {
            domain,
            backend_address: format!("{}:{}", self.options.upstream_host, port),
        })
    }

    /// Route one app through the proxy
    pub async fn reconcile(&self, app_id: i64) -> Result<ReconcileOutcome, ReconcileError> {
        let binding = self.resolve_binding(app_id)?;

        let _guard = self.lock.lock().await;
        let mut groups = self.transport.fetch_listener_groups().await?;
        let changes = apply_binding(&mut groups, &binding, &self.options);

        if changes.is_empty() {
            debug!(app_id, domain = %binding.domain, "Proxy configuration already up to date");
            return Ok(ReconcileOutcome::Unchanged);
        }

        self.transport.replace_listener_groups(&groups).await?;
        info!(
            app_id,
            domain = %binding.domain,
            backend = %binding.backend_address,
            updated = ?changes.updated,
            installed = ?changes.installed,
            created_group = ?changes.created_group,
            removed_catch_all = changes.removed_catch_all,
            "Proxy configuration reconciled"
        );
        Ok(ReconcileOutcome::Applied(changes))
    }

    /// Reconcile every registered app, carrying on past failures
    ///
    /// Apps sharing the same target groups also share their managed route:
    /// each one rewrites its dial, so after a full pass the route points at
    /// the last app's backend and keeps the first app's host.
    pub async fn reconcile_all(&self) -> Result<SyncReport, ReconcileError> {
        let app_ids = self.bindings.app_ids().map_err(ReconcileError::Storage)?;
        let mut report = SyncReport::default();

        for app_id in app_ids {
            match self.reconcile(app_id).await {
                Ok(ReconcileOutcome::Unchanged) => report.unchanged.push(app_id),
                Ok(ReconcileOutcome::Applied(_)) => report.applied.push(app_id),
                Err(e) => {
                    warn!(app_id, error = %e, "App reconciliation failed");
                    report.failed.push(SyncFailure {
                        app_id,
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(
            total = report.total(),
            applied = report.applied.len(),
            unchanged = report.unchanged.len(),
            failed = report.failed.len(),
            "Full resync finished"
        );
        Ok(report)
    }

    /// Load a whole proxy configuration (raw editor), serialized with reconciliations
    pub async fn load_full_config(&self, config: Bytes) -> Result<(), TransportError> {
        let _guard = self.lock.lock().await;
        self.transport.replace_full_config(config).await
    }
}
