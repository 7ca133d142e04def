//! kdns store: coalescing ingest queue and keyed snapshot cache.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use kdns_core::{Delta, DeltaKind, Meta, WorldSnapshot};
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace};

/// Coalescing queue keyed by object key with FIFO order.
///
/// The queue never drops a delta. Once it holds `cap` distinct keys it
/// reports full and the owner is expected to drain it.
pub struct Coalescer<T> {
    map: FxHashMap<String, Delta<T>>,
    order: VecDeque<String>,
    cap: usize,
}

impl<T> Coalescer<T> {
    pub fn with_capacity(cap: usize) -> Self {
        Self { map: FxHashMap::default(), order: VecDeque::new(), cap: cap.max(1) }
    }

    pub fn len(&self) -> usize { self.map.len() }
    pub fn is_empty(&self) -> bool { self.map.is_empty() }
    pub fn is_full(&self) -> bool { self.order.len() >= self.cap }

    /// Queue a delta; a newer delta for a queued key replaces the older one in place.
    /// Returns `true` when the queue is full after the push.
    pub fn push(&mut self, d: Delta<T>) -> bool {
        if !self.map.contains_key(&d.key) {
            self.order.push_back(d.key.clone());
        }
        self.map.insert(d.key.clone(), d);
        self.is_full()
    }

    /// Drain all currently coalesced deltas in arrival order of their keys.
    pub fn drain_ready(&mut self) -> Vec<Delta<T>> {
        let mut out = Vec::with_capacity(self.order.len());
        while let Some(key) = self.order.pop_front() {
            if let Some(d) = self.map.remove(&key) {
                out.push(d);
            }
        }
        out
    }
}

/// Builds snapshots of reduced objects from deltas.
pub struct CacheBuilder<T> {
    epoch: u64,
    items: BTreeMap<String, T>,
}

impl<T> Default for CacheBuilder<T> {
    fn default() -> Self { Self { epoch: 0, items: BTreeMap::new() } }
}

impl<T: Meta + Clone> CacheBuilder<T> {
    pub fn new() -> Self { Self::default() }

    pub fn epoch(&self) -> u64 { self.epoch }
    pub fn len(&self) -> usize { self.items.len() }
    pub fn is_empty(&self) -> bool { self.items.is_empty() }

    /// Apply a batch of deltas and bump the epoch.
    ///
    /// An applied object whose resource version matches the cached one is
    /// left in place.
    pub fn apply(&mut self, batch: Vec<Delta<T>>) {
        for d in batch {
            match (d.kind, d.obj) {
                (DeltaKind::Applied, Some(obj)) => {
                    if let Some(cur) = self.items.get(&d.key) {
                        if !obj.resource_version().is_empty() && cur.resource_version() == obj.resource_version() {
                            trace!(key = %d.key, rv = %obj.resource_version(), "unchanged; skipping");
                            metrics::counter!("cache_unchanged_total", 1u64);
                            continue;
                        }
                    }
                    self.items.insert(d.key, obj);
                }
                (DeltaKind::Applied, None) => {
                    debug!(key = %d.key, "applied delta without object; ignoring");
                }
                (DeltaKind::Deleted, _) => {
                    self.items.remove(&d.key);
                }
            }
        }
        self.epoch = self.epoch.saturating_add(1);
        metrics::gauge!("cache_services", self.items.len() as f64);
    }

    pub fn freeze(&self) -> Arc<WorldSnapshot<T>> {
        Arc::new(WorldSnapshot { epoch: self.epoch, items: self.items.clone() })
    }
}

/// Handle for readers to access the current snapshot and subscribe to swaps.
pub struct BackendHandle<T> {
    snap: Arc<ArcSwap<WorldSnapshot<T>>>,
    epoch_rx: watch::Receiver<u64>,
}

impl<T> Clone for BackendHandle<T> {
    fn clone(&self) -> Self {
        Self { snap: Arc::clone(&self.snap), epoch_rx: self.epoch_rx.clone() }
    }
}

impl<T> BackendHandle<T> {
    pub fn current(&self) -> Arc<WorldSnapshot<T>> { self.snap.load_full() }
    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.epoch_rx.clone() }

    pub fn get(&self, key: &str) -> Option<T>
    where
        T: Clone,
    {
        self.snap.load().get(key).cloned()
    }

    /// Wait until `ready` holds for the current snapshot or `timeout` elapses,
    /// then return the snapshot observed last.
    pub async fn wait_until<F>(&self, timeout: Duration, mut ready: F) -> Arc<WorldSnapshot<T>>
    where
        F: FnMut(&WorldSnapshot<T>) -> bool,
    {
        let mut rx = self.subscribe_epoch();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let snap = self.current();
            if ready(&snap) {
                return snap;
            }
            match tokio::time::timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => {
                    debug!(epoch = snap.epoch, "ingest loop gone while waiting for snapshot");
                    return self.current();
                }
                Err(_) => {
                    debug!(epoch = snap.epoch, items = snap.len(), "timed out waiting for snapshot");
                    return self.current();
                }
            }
        }
    }
}

fn flush<T: Meta + Clone>(
    coalescer: &mut Coalescer<T>,
    builder: &mut CacheBuilder<T>,
    snap: &ArcSwap<WorldSnapshot<T>>,
    epoch_tx: &watch::Sender<u64>,
) {
    let batch = coalescer.drain_ready();
    if batch.is_empty() {
        return;
    }
    builder.apply(batch);
    let next = builder.freeze();
    let epoch = next.epoch;
    snap.store(next);
    if epoch_tx.send(epoch).is_err() {
        trace!(epoch, "no snapshot readers left");
    }
}

/// Spawn an ingest loop consuming deltas and swapping snapshots. Returns a sender for deltas and a handle for reads.
pub fn spawn_ingest<T>(cap: usize) -> (mpsc::Sender<Delta<T>>, BackendHandle<T>)
where
    T: Meta + Clone + Send + Sync + 'static,
{
    let (tx, mut rx) = mpsc::channel::<Delta<T>>(cap.max(1));
    let snap = Arc::new(ArcSwap::from_pointee(WorldSnapshot::default()));
    let (epoch_tx, epoch_rx) = watch::channel(0u64);
    let snap_clone = Arc::clone(&snap);

    tokio::spawn(async move {
        let mut coalescer = Coalescer::with_capacity(cap);
        let mut builder = CacheBuilder::new();
        let mut ticker = tokio::time::interval(Duration::from_millis(8));
        loop {
            tokio::select! {
                maybe = rx.recv() => {
                    match maybe {
                        Some(d) => {
                            if coalescer.push(d) {
                                trace!(queued = coalescer.len(), "coalescer full; flushing early");
                                metrics::counter!("coalescer_full_flushes_total", 1u64);
                                flush(&mut coalescer, &mut builder, &snap_clone, &epoch_tx);
                            }
                        }
                        None => {
                            debug!("delta channel closed; draining and exiting ingest loop");
                            flush(&mut coalescer, &mut builder, &snap_clone, &epoch_tx);
                            break;
                        }
                    }
                }
                _ = ticker.tick() => {
                    flush(&mut coalescer, &mut builder, &snap_clone, &epoch_tx);
                }
            }
        }
        info!(items = builder.len(), epoch = builder.epoch(), "ingest loop stopped");
    });

    (tx, BackendHandle { snap, epoch_rx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use kdns_core::{service_key, Service, ServicePort, ServiceType};

    fn svc(name: &str, rv: &str) -> Service {
        Service {
            version: rv.to_string(),
            name: name.to_string(),
            namespace: "ns".to_string(),
            index: service_key("ns", name),
            cluster_ip: "10.0.0.1".to_string(),
            type_: ServiceType::ClusterIP,
            external_name: String::new(),
            ports: [ServicePort::sentinel()].into_iter().collect(),
        }
    }

    #[test]
    fn coalescer_keeps_latest_per_key() {
        let mut c = Coalescer::with_capacity(8);
        c.push(Delta::applied(svc("a", "1")));
        c.push(Delta::applied(svc("b", "1")));
        c.push(Delta::applied(svc("a", "2")));
        assert_eq!(c.len(), 2);
        let out = c.drain_ready();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].key, "ns/a");
        assert_eq!(out[0].obj.as_ref().map(|s| s.version.as_str()), Some("2"));
        assert_eq!(out[1].key, "ns/b");
        assert!(c.is_empty());
    }

    #[test]
    fn full_queue_keeps_every_delta() {
        let mut c = Coalescer::with_capacity(2);
        assert!(!c.push(Delta::applied(svc("a", "1"))));
        assert!(c.push(Delta::applied(svc("b", "1"))));
        assert!(c.push(Delta::applied(svc("c", "1"))));
        assert_eq!(c.len(), 3);
        let keys: Vec<_> = c.drain_ready().into_iter().map(|d| d.key).collect();
        assert_eq!(keys, vec!["ns/a".to_string(), "ns/b".to_string(), "ns/c".to_string()]);
        assert!(!c.is_full());
    }

    #[test]
    fn queued_delete_survives_full_queue() {
        let mut b = CacheBuilder::new();
        b.apply(vec![Delta::applied(svc("gone", "1"))]);

        let mut c = Coalescer::with_capacity(2);
        c.push(Delta::deleted("ns/gone"));
        c.push(Delta::applied(svc("x", "1")));
        c.push(Delta::applied(svc("y", "1")));
        b.apply(c.drain_ready());

        let snap = b.freeze();
        assert!(snap.get("ns/gone").is_none(), "deleted service must not stay cached");
        assert!(snap.get("ns/x").is_some());
        assert!(snap.get("ns/y").is_some());
    }

    #[test]
    fn same_version_does_not_replace() {
        let mut b = CacheBuilder::new();
        b.apply(vec![Delta::applied(svc("a", "1"))]);
        let mut again = svc("a", "1");
        again.cluster_ip = "10.9.9.9".to_string();
        b.apply(vec![Delta::applied(again)]);
        let snap = b.freeze();
        assert_eq!(snap.epoch, 2);
        assert_eq!(snap.get("ns/a").map(|s| s.cluster_ip.as_str()), Some("10.0.0.1"));

        let mut newer = svc("a", "2");
        newer.cluster_ip = "10.9.9.9".to_string();
        b.apply(vec![Delta::applied(newer)]);
        assert_eq!(b.freeze().get("ns/a").map(|s| s.cluster_ip.as_str()), Some("10.9.9.9"));
    }
}
