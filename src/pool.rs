//! The connection pool: bounded rent/return with waiters, idle pruning,
//! minimum-size top-up, per-host candidate selection, and the process-wide
//! pool registry keyed by the canonical connection string.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use log::{debug, info, warn};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

use crate::auth::GssTokenProvider;
use crate::cancellation::CancelToken;
use crate::config::{ConnectionString, HostSpec, TargetSessionAttributes};
use crate::connector::{Connector, ConnectorState};
use crate::errors::Error;
use crate::hosts::{self, HostRole};
use crate::multiplexing::{self, CommandHandle};
use crate::stats::{ensure_collector, PoolStats, COUNTERS};

/// Every pool in the process, keyed by canonical connection string. Pools
/// are created on first use and never destroyed during the process
/// lifetime.
pub static POOLS: Lazy<ArcSwap<HashMap<String, ConnectionPool>>> =
    Lazy::new(|| ArcSwap::from_pointee(HashMap::default()));

static POOL_CREATE_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

/// Fetch the pool for a connection string, creating it on first use.
pub fn get_or_create_pool(settings: &ConnectionString) -> Result<ConnectionPool, Error> {
    if !settings.pooling {
        return Err(Error::ConfigurationInvalid(
            "Pooling=false; open connectors directly instead".to_string(),
        ));
    }
    let key = settings.canonical_string();
    if let Some(pool) = POOLS.load().get(&key) {
        return Ok(pool.clone());
    }

    let _guard = POOL_CREATE_LOCK.lock();
    if let Some(pool) = POOLS.load().get(&key) {
        return Ok(pool.clone());
    }

    let pool = ConnectionPool::new(settings.clone())?;
    let mut pools = HashMap::clone(&POOLS.load());
    pools.insert(key, pool.clone());
    POOLS.store(Arc::new(pools));
    COUNTERS.pools.fetch_add(1, Ordering::Relaxed);
    Ok(pool)
}

pub(crate) struct PoolInner {
    pub(crate) settings: Arc<ConnectionString>,
    permits: Arc<Semaphore>,
    idle: Mutex<VecDeque<Connector>>,
    pub(crate) stats: Arc<PoolStats>,
    round_robin: AtomicUsize,
    retry_transient_opens: AtomicBool,
    gss: Mutex<Option<Arc<dyn GssTokenProvider>>>,
    pub(crate) mux_tx: Mutex<Option<mpsc::Sender<CommandHandle>>>,
}

/// A bounded multiset of connectors for one connection string.
#[derive(Clone)]
pub struct ConnectionPool {
    pub(crate) inner: Arc<PoolInner>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("settings", &self.inner.settings.to_string())
            .field("idle", &self.idle_count())
            .field("busy", &self.busy_count())
            .finish()
    }
}

impl ConnectionPool {
    /// Build a standalone pool (most callers want [`get_or_create_pool`]).
    /// Spawns the maintenance task and, when configured, the multiplexing
    /// writer.
    pub fn new(settings: ConnectionString) -> Result<ConnectionPool, Error> {
        let settings = Arc::new(settings);
        info!("Creating pool for {settings}");
        let inner = Arc::new(PoolInner {
            permits: Arc::new(Semaphore::new(settings.max_pool_size)),
            idle: Mutex::new(VecDeque::new()),
            stats: Arc::new(PoolStats::default()),
            round_robin: AtomicUsize::new(0),
            retry_transient_opens: AtomicBool::new(false),
            gss: Mutex::new(None),
            mux_tx: Mutex::new(None),
            settings: settings.clone(),
        });
        let pool = ConnectionPool { inner };

        ensure_collector();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let maintenance = pool.inner.clone();
            handle.spawn(async move {
                PoolInner::maintenance_loop(maintenance).await;
            });
            if settings.multiplexing {
                multiplexing::start(pool.clone());
            }
        }
        Ok(pool)
    }

    /// Opt into one retry of transient open failures (sqlstate classes
    /// 57/08/53 and refused connections). Commands are never retried.
    pub fn set_retry_transient_opens(&self, retry: bool) {
        self.inner
            .retry_transient_opens
            .store(retry, Ordering::Relaxed);
    }

    /// Install the opaque GSS/SSPI token provider used by new connectors.
    pub fn set_gss_provider(&self, provider: Arc<dyn GssTokenProvider>) {
        *self.inner.gss.lock() = Some(provider);
    }

    pub fn settings(&self) -> &ConnectionString {
        &self.inner.settings
    }

    pub fn idle_count(&self) -> usize {
        self.inner.stats.idle_count()
    }

    pub fn busy_count(&self) -> usize {
        self.inner.stats.busy_count()
    }

    pub fn stats(&self) -> Arc<PoolStats> {
        self.inner.stats.clone()
    }

    /// Rent a connector: wait for capacity within `Timeout`, prefer a
    /// matching idle connector, open a new one otherwise.
    pub async fn rent(&self, cancel: &CancelToken) -> Result<PooledConnector, Error> {
        let inner = &self.inner;
        let deadline = Instant::now() + inner.settings.timeout;

        let permit = tokio::select! {
            biased;
            _ = cancel.canceled() => return Err(Error::Canceled),
            acquired = tokio::time::timeout_at(deadline, inner.permits.clone().acquire_owned()) => {
                match acquired {
                    Ok(Ok(permit)) => permit,
                    Ok(Err(_)) => return Err(Error::Broken("pool semaphore closed".to_string())),
                    Err(_) => return Err(Error::Timeout("pool rent".to_string())),
                }
            }
        };

        let order = hosts::candidate_order(&inner.settings, &inner.round_robin);

        // Prefer idle connectors. The candidate filter only governs new
        // opens: an already-open connector on a host that is temporarily
        // marked offline is still live, so the idle scan walks every
        // configured host, preferred candidates first.
        let mut idle_order = order.clone();
        for index in 0..inner.settings.hosts.len() {
            if !idle_order.contains(&index) {
                idle_order.push(index);
            }
        }
        for &index in &idle_order {
            while let Some(mut connector) = inner.pop_idle_matching(&inner.settings.hosts[index]) {
                match inner.verify_host(&mut connector).await {
                    Ok(true) => {
                        inner.stats.connector_rented();
                        return Ok(PooledConnector {
                            connector: Some(connector),
                            permit: Some(permit),
                            pool: inner.clone(),
                        });
                    }
                    Ok(false) => {
                        connector.terminate().await;
                        break;
                    }
                    Err(err) => {
                        debug!("Discarding idle connector that failed verification: {err}");
                        drop(connector);
                    }
                }
            }
        }

        // Nothing idle: open against each candidate until one sticks.
        if order.is_empty() {
            return Err(Error::ConnectionFailed(
                "no host satisfies the target session attributes".to_string(),
            ));
        }
        inner.make_room_for_open();
        let mut last_error = None;
        for &index in &order {
            let host = inner.settings.hosts[index].clone();
            match inner.open_with_retry(&host, cancel).await {
                Ok(mut connector) => match inner.verify_host(&mut connector).await {
                    Ok(true) => {
                        inner.stats.connector_rented();
                        return Ok(PooledConnector {
                            connector: Some(connector),
                            permit: Some(permit),
                            pool: inner.clone(),
                        });
                    }
                    Ok(false) => {
                        debug!(
                            "Host {host} does not satisfy TargetSessionAttributes; trying next"
                        );
                        connector.terminate().await;
                        last_error = Some(Error::ConnectionFailed(format!(
                            "host {host} does not satisfy the target session attributes"
                        )));
                    }
                    Err(err) => last_error = Some(err),
                },
                Err(err) => {
                    if matches!(err, Error::ConnectionFailed(_)) {
                        hosts::mark_offline(&host);
                    }
                    last_error = Some(err);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            Error::ConnectionFailed("no suitable host available".to_string())
        }))
    }
}

impl PoolInner {
    async fn open_with_retry(
        self: &Arc<Self>,
        host: &HostSpec,
        cancel: &CancelToken,
    ) -> Result<Connector, Error> {
        let gss = self.gss.lock().clone();
        let first =
            Connector::open(self.settings.clone(), host.clone(), gss.clone(), cancel).await;
        match first {
            Ok(connector) => Ok(connector),
            // Failed opens are never cached; one retry when opted in.
            Err(err)
                if err.is_transient() && self.retry_transient_opens.load(Ordering::Relaxed) =>
            {
                warn!("Retrying transient open failure against {host}: {err}");
                Connector::open(self.settings.clone(), host.clone(), gss, cancel).await
            }
            Err(err) => Err(err),
        }
    }

    /// Refresh the host-role cache when stale and check the connector's
    /// host against the target session attributes.
    async fn verify_host(self: &Arc<Self>, connector: &mut Connector) -> Result<bool, Error> {
        let settings = &self.settings;
        let target = settings.target_session_attributes;
        let multi_host = settings.hosts.len() > 1;
        if !multi_host && target == TargetSessionAttributes::Any {
            return Ok(true);
        }

        let host = connector.host().clone();
        let mut role = hosts::cached_role(&host, settings.host_recheck_seconds);
        let probed = role == HostRole::Unknown;
        if probed {
            let recovery = connector.internal_query("select pg_is_in_recovery()").await?;
            role = match recovery.as_deref() {
                Some(b"t") | Some(b"true") => HostRole::Standby,
                _ => HostRole::Primary,
            };
            hosts::update_role(&host, role);
        }

        match target {
            TargetSessionAttributes::Any
            | TargetSessionAttributes::PreferPrimary
            | TargetSessionAttributes::PreferStandby => Ok(true),
            TargetSessionAttributes::Primary => Ok(role == HostRole::Primary),
            TargetSessionAttributes::Standby => Ok(role == HostRole::Standby),
            // The read-write targets go by the session default, checked
            // once per probe window; a cached role answers in between.
            TargetSessionAttributes::ReadWrite | TargetSessionAttributes::ReadOnly => {
                if probed {
                    let read_only = connector
                        .internal_query("SHOW transaction_read_only")
                        .await?;
                    let is_read_only = matches!(read_only.as_deref(), Some(b"on"));
                    Ok(if target == TargetSessionAttributes::ReadOnly {
                        is_read_only
                    } else {
                        !is_read_only
                    })
                } else if target == TargetSessionAttributes::ReadOnly {
                    Ok(role == HostRole::Standby)
                } else {
                    Ok(role == HostRole::Primary)
                }
            }
        }
    }

    /// Permits track rented connectors only, so before opening a new one
    /// the renter (already holding its permit) must leave room for every
    /// idle connector: `busy + idle` may never exceed MaxPoolSize. Any
    /// overflow here is idle connectors the scan could not hand out (for
    /// example a role mismatch on a multi-host pool); the oldest are
    /// closed to free their slots.
    fn make_room_for_open(self: &Arc<Self>) {
        let max = self.settings.max_pool_size;
        let mut evicted = Vec::new();
        {
            let mut idle = self.idle.lock();
            let busy = max - self.permits.available_permits();
            while busy + idle.len() > max {
                match idle.pop_front() {
                    Some(connector) => {
                        self.stats.idle_removed();
                        evicted.push(connector);
                    }
                    None => break,
                }
            }
        }
        for connector in evicted {
            debug!("Evicting idle connector to stay within MaxPoolSize: {connector}");
            drop(connector);
        }
    }

    /// Claim the freshest idle connector for a host, discarding any
    /// lifetime-expired ones met along the way.
    fn pop_idle_matching(self: &Arc<Self>, host: &HostSpec) -> Option<Connector> {
        let lifetime = self.settings.connection_lifetime;
        let mut expired = Vec::new();
        let mut claimed = None;
        {
            let mut idle = self.idle.lock();
            let mut i = idle.len();
            while i > 0 {
                i -= 1;
                if lifetime > 0 && idle[i].age() >= Duration::from_secs(lifetime) {
                    if let Some(connector) = idle.remove(i) {
                        self.stats.idle_removed();
                        expired.push(connector);
                    }
                    continue;
                }
                if idle[i].host() == host {
                    claimed = idle.remove(i);
                    self.stats.idle_removed();
                    break;
                }
            }
        }
        for connector in expired {
            debug!("Closing idle connector past ConnectionLifetime: {connector}");
            drop(connector);
        }
        claimed
    }

    /// Return one connector to the idle queue, closing it instead when it
    /// is broken, dirty, or past its lifetime. The permit is released only
    /// after the connector is requeued, so a broken connector leaves the
    /// accounting before any waiter is woken.
    pub(crate) async fn checkin(self: Arc<Self>, mut connector: Connector, permit: OwnedSemaphorePermit) {
        match connector.state() {
            ConnectorState::Ready => {}
            ConnectorState::Executing | ConnectorState::Fetching => {
                let drained = tokio::time::timeout(
                    self.settings.internal_command_timeout(),
                    connector.drain_to_ready(),
                )
                .await;
                match drained {
                    Ok(Ok(())) => {}
                    _ => {
                        drop(connector);
                        drop(permit);
                        return;
                    }
                }
            }
            _ => {
                drop(connector);
                drop(permit);
                return;
            }
        }

        let lifetime = self.settings.connection_lifetime;
        if lifetime > 0 && connector.age() >= Duration::from_secs(lifetime) {
            debug!("Closing connector past ConnectionLifetime on checkin: {connector}");
            drop(connector);
            drop(permit);
            return;
        }

        if let Err(err) = connector.reset().await {
            debug!("Discarding connector that failed reset: {err}");
            drop(connector);
            drop(permit);
            return;
        }

        self.idle.lock().push_back(connector);
        self.stats.idle_added();
        drop(permit);
    }

    /// Runs every `ConnectionPruningInterval` seconds: close idle
    /// connectors past `ConnectionIdleLifetime` (preserving MinPoolSize),
    /// ping the rest when `KeepAlive` is due, and top back up to
    /// MinPoolSize.
    async fn maintenance_loop(pool: Arc<PoolInner>) {
        let period = Duration::from_secs(pool.settings.connection_pruning_interval.max(1));
        loop {
            tokio::time::sleep(period).await;
            pool.prune_and_keepalive().await;
            pool.ensure_min_pool_size().await;
        }
    }

    async fn prune_and_keepalive(self: &Arc<Self>) {
        let settings = &self.settings;
        let idle_lifetime = Duration::from_secs(settings.connection_idle_lifetime);
        let lifetime = settings.connection_lifetime;

        let mut candidates = {
            let mut idle = self.idle.lock();
            let drained: Vec<Connector> = idle.drain(..).collect();
            for _ in 0..drained.len() {
                self.stats.idle_removed();
            }
            drained
        };

        let mut keep = Vec::with_capacity(candidates.len());
        let mut lifetime_expired = Vec::new();
        let mut idle_expired = Vec::new();
        for connector in candidates.drain(..) {
            if lifetime > 0 && connector.age() >= Duration::from_secs(lifetime) {
                lifetime_expired.push(connector);
            } else if connector.idle_for() >= idle_lifetime {
                idle_expired.push(connector);
            } else {
                keep.push(connector);
            }
        }

        // Idle-expired connectors get a reprieve while closing them would
        // take the pool under MinPoolSize; lifetime-capped ones never do.
        let busy = self.stats.busy_count();
        while busy + keep.len() < settings.min_pool_size {
            match idle_expired.pop() {
                Some(connector) => keep.push(connector),
                None => break,
            }
        }

        for connector in lifetime_expired.into_iter().chain(idle_expired) {
            debug!("Pruning idle connector: {connector}");
            drop(connector);
        }

        // Application-level keepalive for connectors idle past the window.
        let keepalive = settings.keepalive_seconds;
        let mut survivors = Vec::with_capacity(keep.len());
        for mut connector in keep {
            if keepalive > 0 && connector.idle_for() >= Duration::from_secs(keepalive) {
                match connector.keepalive().await {
                    Ok(()) => survivors.push(connector),
                    Err(err) => {
                        warn!("Keepalive failed, discarding connector: {err}");
                        drop(connector);
                    }
                }
            } else {
                survivors.push(connector);
            }
        }

        let mut idle = self.idle.lock();
        for connector in survivors {
            idle.push_back(connector);
            self.stats.idle_added();
        }
    }

    async fn ensure_min_pool_size(self: &Arc<Self>) {
        let min = self.settings.min_pool_size;
        if min == 0 {
            return;
        }
        let cancel = CancelToken::none();
        loop {
            let total = self.stats.busy_count() + self.stats.idle_count();
            if total >= min {
                return;
            }
            // Hold a permit while opening so the cap still binds.
            let Ok(permit) = self.permits.clone().try_acquire_owned() else {
                return;
            };
            let order = hosts::candidate_order(&self.settings, &self.round_robin);
            let Some(&index) = order.first() else { return };
            let host = self.settings.hosts[index].clone();
            match self.open_with_retry(&host, &cancel).await {
                Ok(connector) => {
                    self.idle.lock().push_back(connector);
                    self.stats.idle_added();
                    drop(permit);
                }
                Err(err) => {
                    debug!("MinPoolSize top-up open failed: {err}");
                    if matches!(err, Error::ConnectionFailed(_)) {
                        hosts::mark_offline(&host);
                    }
                    return;
                }
            }
        }
    }
}

/// An exclusively rented connector. Dropping it returns it to the pool
/// (asynchronously); broken connectors are discarded and never leak slot
/// capacity.
pub struct PooledConnector {
    connector: Option<Connector>,
    permit: Option<OwnedSemaphorePermit>,
    pool: Arc<PoolInner>,
}

impl std::fmt::Debug for PooledConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnector")
            .field("connector", &self.connector)
            .finish()
    }
}

impl std::ops::Deref for PooledConnector {
    type Target = Connector;

    fn deref(&self) -> &Connector {
        self.connector.as_ref().expect("connector already returned")
    }
}

impl std::ops::DerefMut for PooledConnector {
    fn deref_mut(&mut self) -> &mut Connector {
        self.connector.as_mut().expect("connector already returned")
    }
}

impl PooledConnector {
    /// Return to the pool inline, including the session reset.
    pub async fn checkin(mut self) {
        let connector = self.connector.take().expect("connector already returned");
        let permit = self.permit.take().expect("permit already returned");
        self.pool.stats.connector_released();
        self.pool.clone().checkin(connector, permit).await;
    }
}

impl Drop for PooledConnector {
    fn drop(&mut self) {
        let (Some(connector), Some(permit)) = (self.connector.take(), self.permit.take()) else {
            return;
        };
        self.pool.stats.connector_released();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let pool = self.pool.clone();
                handle.spawn(async move {
                    pool.checkin(connector, permit).await;
                });
            }
            Err(_) => {
                drop(connector);
                drop(permit);
            }
        }
    }
}
