//! Database node pool with failover.
//!
//! Transactions go to the next healthy node in approximate round-robin
//! order. A node whose connection turns out to be dead is marked down and
//! the whole transaction is retried on the next node, up to a bounded
//! number of attempts. Background tasks periodically ping down nodes to put
//! them back into rotation and delete expired flows and codes.

use crate::db::{self, Database, PoolSettings, Purged, Tx, TxFuture};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

/// A connection to one database node.
#[async_trait]
pub trait Connection: Send + Sync {
    fn name(&self) -> &str;

    /// Whether the node answers. May reopen a lost pool.
    async fn ping(&self) -> bool;

    /// The node's connection pool, or [`Error::ConnectionDead`].
    async fn database(&self) -> Result<Database>;
}

/// A node reached through an sqlx connection pool.
///
/// The pool is opened on first use and the schema applied to it. A pool
/// that was closed stays closed until the next successful [`ping`].
///
/// [`ping`]: Connection::ping
#[derive(Debug)]
pub struct PoolConnection {
    name: String,
    url: Option<String>,
    settings: PoolSettings,
    db: Mutex<Option<Database>>,
}

impl PoolConnection {
    /// A node at `url`, connected lazily.
    pub fn new(url: impl Into<String>, settings: PoolSettings) -> Self {
        let url = url.into();
        Self {
            name: redact(&url),
            url: Some(url),
            settings,
            db: Mutex::new(None),
        }
    }

    /// A node serving an already open database. It cannot be reopened once
    /// closed.
    pub fn attached(name: impl Into<String>, db: Database) -> Self {
        Self {
            name: name.into(),
            url: None,
            settings: PoolSettings::default(),
            db: Mutex::new(Some(db)),
        }
    }

    /// Close the pool, as if the node went away.
    pub async fn close(&self) {
        let db = self.db.lock().await.clone();
        if let Some(db) = db {
            db.close_pool().await;
        }
    }

    async fn open(&self) -> Result<Database> {
        let url = self
            .url
            .as_deref()
            .ok_or_else(|| Error::ConnectionDead(self.name.clone()))?;
        let db = Database::connect(url, self.settings).await?;
        db.migrate().await?;
        debug!(node = %self.name, "Database pool opened");
        Ok(db)
    }
}

#[async_trait]
impl Connection for PoolConnection {
    fn name(&self) -> &str {
        &self.name
    }

    async fn ping(&self) -> bool {
        let db = {
            let mut slot = self.db.lock().await;
            match slot.as_ref() {
                Some(db) if !db.is_closed() => db.clone(),
                _ => match self.open().await {
                    Ok(db) => {
                        *slot = Some(db.clone());
                        db
                    }
                    Err(e) => {
                        debug!(node = %self.name, error = %e, "Node still unreachable");
                        return false;
                    }
                },
            }
        };
        db.ping().await.is_ok()
    }

    async fn database(&self) -> Result<Database> {
        let mut slot = self.db.lock().await;
        if let Some(db) = slot.as_ref() {
            // A closed pool is handed out as is; using it fails with
            // ConnectionDead.
            return Ok(db.clone());
        }
        let db = self.open().await?;
        *slot = Some(db.clone());
        Ok(db)
    }
}

/// Hide the password of a connection URL.
fn redact(url: &str) -> String {
    match reqwest::Url::parse(url) {
        Ok(mut parsed) if parsed.password().is_some() => {
            if parsed.set_password(Some("***")).is_ok() {
                parsed.to_string()
            } else {
                url.to_string()
            }
        }
        _ => url.to_string(),
    }
}

struct Node {
    conn: Arc<dyn Connection>,
    up: AtomicBool,
}

/// A pool of database nodes.
pub struct Cluster {
    nodes: Vec<Node>,
    next: AtomicUsize,
    max_attempts: usize,
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("active", &self.active_nodes())
            .field("down", &self.down_nodes())
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}

impl Cluster {
    /// Build a pool. `max_attempts == 0` selects twice the node count.
    pub fn new(connections: Vec<Arc<dyn Connection>>, max_attempts: usize) -> Self {
        let max_attempts = if max_attempts == 0 {
            (2 * connections.len()).max(1)
        } else {
            max_attempts
        };
        Self {
            nodes: connections
                .into_iter()
                .map(|conn| Node {
                    conn,
                    up: AtomicBool::new(true),
                })
                .collect(),
            next: AtomicUsize::new(0),
            max_attempts,
        }
    }

    /// One pooled node per URL, connected lazily.
    pub fn from_urls(urls: &[String], settings: PoolSettings, max_attempts: usize) -> Self {
        let conns = urls
            .iter()
            .map(|url| Arc::new(PoolConnection::new(url.clone(), settings)) as Arc<dyn Connection>)
            .collect();
        Self::new(conns, max_attempts)
    }

    /// A pool of one node serving `db`.
    pub fn single(db: Database) -> Self {
        Self::new(vec![Arc::new(PoolConnection::attached("local", db))], 0)
    }

    /// Open every node. Unreachable nodes are marked down; fails only when
    /// no node could be reached.
    pub async fn connect(&self) -> Result<()> {
        for node in &self.nodes {
            match node.conn.database().await {
                Ok(_) => info!(node = %node.conn.name(), "Database node connected"),
                Err(e) => self.mark_down(node, &e),
            }
        }
        if self.active_nodes().is_empty() {
            return Err(Error::NoDatabaseNode);
        }
        Ok(())
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    pub fn active_nodes(&self) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|n| n.up.load(Ordering::SeqCst))
            .map(|n| n.conn.name().to_string())
            .collect()
    }

    pub fn down_nodes(&self) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|n| !n.up.load(Ordering::SeqCst))
            .map(|n| n.conn.name().to_string())
            .collect()
    }

    fn pick(&self) -> Option<&Node> {
        let n = self.nodes.len();
        if n == 0 {
            return None;
        }
        let start = self.next.fetch_add(1, Ordering::Relaxed);
        (0..n)
            .map(|i| &self.nodes[(start + i) % n])
            .find(|node| node.up.load(Ordering::SeqCst))
    }

    fn mark_down(&self, node: &Node, reason: &Error) {
        if node.up.swap(false, Ordering::SeqCst) {
            warn!(node = %node.conn.name(), error = %reason, "Database node marked down");
        }
    }

    /// Run `f` in a transaction on a healthy node, failing over on dead
    /// connections.
    ///
    /// `f` is cloned for every attempt, so it must capture owned values only.
    pub async fn transact<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: for<'t> FnOnce(&'t mut Tx) -> TxFuture<'t, T> + Clone + Send,
    {
        for attempt in 1..=self.max_attempts {
            let node = self.pick().ok_or(Error::NoDatabaseNode)?;
            let result = match node.conn.database().await {
                Ok(db) => db.transact(f.clone()).await,
                Err(e) => Err(e),
            };
            match result {
                Err(e @ Error::ConnectionDead(_)) => {
                    self.mark_down(node, &e);
                    debug!(attempt, max_attempts = self.max_attempts, "Retrying transaction on next node");
                }
                other => return other,
            }
        }
        Err(Error::NoDatabaseNode)
    }

    /// Ping every down node and reactivate the reachable ones.
    ///
    /// Returns the number of reactivated nodes.
    pub async fn check_nodes_down(&self) -> usize {
        let mut reconnected = 0;
        for node in self.nodes.iter().filter(|n| !n.up.load(Ordering::SeqCst)) {
            if node.conn.ping().await {
                node.up.store(true, Ordering::SeqCst);
                reconnected += 1;
                info!(node = %node.conn.name(), "Database node reconnected");
            }
        }
        reconnected
    }

    /// Delete authorization flows and codes that expired before `now`.
    pub async fn purge_expired(&self, now: i64) -> Result<Purged> {
        let purged = self
            .transact(move |tx| Box::pin(async move { db::purge_expired(tx, now).await }))
            .await?;
        if purged != Purged::default() {
            info!(auth_flows = purged.auth_flows, codes = purged.codes, "Expired rows deleted");
        }
        Ok(purged)
    }

    /// Start the reconnect loop on the current runtime.
    pub fn spawn_reconnector(self: &Arc<Self>, every: Duration) -> Periodic {
        let cluster = Arc::clone(self);
        Periodic::spawn("reconnector", every, move || {
            let cluster = Arc::clone(&cluster);
            async move {
                cluster.check_nodes_down().await;
            }
        })
    }

    /// Start the expiry sweep on the current runtime. `clock` yields the
    /// current unix time.
    pub fn spawn_sweeper<C>(self: &Arc<Self>, every: Duration, clock: C) -> Periodic
    where
        C: Fn() -> i64 + Send + Sync + 'static,
    {
        let cluster = Arc::clone(self);
        Periodic::spawn("sweeper", every, move || {
            let cluster = Arc::clone(&cluster);
            let now = clock();
            async move {
                if let Err(e) = cluster.purge_expired(now).await {
                    warn!(error = %e, "Expiry sweep failed");
                }
            }
        })
    }
}

/// Handle of a background loop. Stopping is final.
#[derive(Debug)]
pub struct Periodic {
    stop: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl Periodic {
    /// Run `task` every `every`, starting one period from now.
    pub fn spawn<F, Fut>(what: &'static str, every: Duration, mut task: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let mut ticker = interval(every);
            // Skip the first immediate tick
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        task().await;
                    }
                    _ = &mut stop_rx => {
                        debug!(task = what, "Background task stopped");
                        break;
                    }
                }
            }
        });
        Self {
            stop: Some(stop_tx),
            handle,
        }
    }

    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        let _ = (&mut self.handle).await;
    }
}
