//! kdns kubehub – list/watch wiring that feeds projected objects into the cache

#![forbid(unsafe_code)]

use std::collections::BTreeSet;

use anyhow::{Context, Result};
use tracing::{debug, info, trace, warn};

use futures::TryStreamExt;
use kdns_core::{service_key, Delta, DeltaKind, Meta, Projector};
use kube::{
    api::{Api, ListParams},
    core::{ApiResource, DynamicObject, TypeMeta},
    runtime::watcher::{self, Event},
    Client,
};
use tokio::sync::mpsc;

fn api_for(client: Client, ar: &ApiResource, namespace: Option<&str>) -> Api<DynamicObject> {
    match namespace {
        Some(ns) => Api::namespaced_with(client, ns, ar),
        None => Api::all_with(client, ar),
    }
}

// List items come back without apiVersion/kind; restore them from the resource we asked for.
fn ensure_types(obj: &mut DynamicObject, ar: &ApiResource) {
    if obj.types.is_none() {
        obj.types = Some(TypeMeta { api_version: ar.api_version.clone(), kind: ar.kind.clone() });
    }
}

fn is_resource(obj: &DynamicObject, ar: &ApiResource) -> bool {
    obj.types
        .as_ref()
        .map(|t| t.api_version == ar.api_version && t.kind == ar.kind)
        .unwrap_or(false)
}

fn meta_key(obj: &DynamicObject) -> Option<String> {
    let name = obj.metadata.name.as_deref()?;
    Some(service_key(obj.metadata.namespace.as_deref().unwrap_or(""), name))
}

fn delta_for<P: Projector>(projector: &P, ar: &ApiResource, mut obj: DynamicObject, kind: DeltaKind) -> Option<Delta<P::Output>> {
    ensure_types(&mut obj, ar);
    // A delete only needs the key; the body may be a tombstone the projector rejects.
    if kind == DeltaKind::Deleted && is_resource(&obj, ar) {
        if let Some(key) = meta_key(&obj) {
            return Some(Delta::deleted(key));
        }
    }
    let name = obj.metadata.name.clone();
    match projector.project(obj) {
        Some(out) => {
            metrics::counter!("objects_projected_total", 1u64, "kind" => ar.kind.clone());
            Some(match kind {
                DeltaKind::Applied => Delta::applied(out),
                DeltaKind::Deleted => Delta::deleted(out.key()),
            })
        }
        None => {
            metrics::counter!("objects_projection_skipped_total", 1u64, "kind" => ar.kind.clone());
            trace!(name = ?name, "projector declined object");
            None
        }
    }
}

/// Keys the watcher has reported as present. A relist replaces the set and
/// yields deletes for keys that vanished while the watch was down.
#[derive(Debug, Default)]
struct KnownKeys(BTreeSet<String>);

impl KnownKeys {
    fn observe<T>(&mut self, d: &Delta<T>) {
        match d.kind {
            DeltaKind::Applied => {
                self.0.insert(d.key.clone());
            }
            DeltaKind::Deleted => {
                self.0.remove(&d.key);
            }
        }
    }

    fn replace<T: Meta>(&mut self, listed: Vec<Delta<T>>) -> Vec<Delta<T>> {
        let keys: BTreeSet<String> = listed.iter().map(|d| d.key.clone()).collect();
        let mut out: Vec<Delta<T>> = self.0.difference(&keys).map(|k| Delta::deleted(k.clone())).collect();
        if !out.is_empty() {
            debug!(stale = out.len(), "relist dropped keys missing from the list");
        }
        out.extend(listed);
        self.0 = keys;
        out
    }
}

async fn forward<T>(delta_tx: &mpsc::Sender<Delta<T>>, d: Delta<T>) -> bool {
    if delta_tx.send(d).await.is_err() {
        debug!("delta receiver dropped");
        return false;
    }
    true
}

/// List the projector's resource once and send an applied delta per object.
/// Returns the keys that were sent.
pub async fn prime_list<P: Projector>(projector: &P, namespace: Option<&str>, delta_tx: &mpsc::Sender<Delta<P::Output>>) -> Result<Vec<String>> {
    let client = Client::try_default().await.context("creating kube client")?;
    let ar = projector.api_resource();
    let api = api_for(client, &ar, namespace);
    let list = api.list(&ListParams::default()).await.with_context(|| format!("listing {}", ar.plural))?;
    let mut sent = Vec::with_capacity(list.items.len());
    for o in list.items {
        if let Some(d) = delta_for(projector, &ar, o, DeltaKind::Applied) {
            let key = d.key.clone();
            if !forward(delta_tx, d).await {
                break;
            }
            sent.push(key);
        }
    }
    debug!(kind = %ar.kind, ns = ?namespace, sent = sent.len(), "primed initial list");
    Ok(sent)
}

/// Start list+watch for the projector's resource and send projected deltas into the channel.
pub async fn start_watcher<P: Projector>(projector: P, namespace: Option<&str>, delta_tx: mpsc::Sender<Delta<P::Output>>) -> Result<()> {
    let client = Client::try_default().await.context("creating kube client")?;
    let ar = projector.api_resource();
    let api = api_for(client, &ar, namespace);

    let cfg = watcher::Config::default();
    let stream = watcher::watcher(api, cfg);
    futures::pin_mut!(stream);
    info!(kind = %ar.kind, ns = ?namespace, "watcher started");
    let mut known = KnownKeys::default();
    while let Some(ev) = stream.try_next().await.context("reading watch stream")? {
        let batch: Vec<Delta<P::Output>> = match ev {
            Event::Applied(o) => delta_for(&projector, &ar, o, DeltaKind::Applied).into_iter().collect(),
            Event::Deleted(o) => delta_for(&projector, &ar, o, DeltaKind::Deleted).into_iter().collect(),
            Event::Restarted(list) => {
                debug!(count = list.len(), "watch restart");
                let listed = list
                    .into_iter()
                    .filter_map(|o| delta_for(&projector, &ar, o, DeltaKind::Applied))
                    .collect();
                known.replace(listed)
            }
        };
        for d in batch {
            known.observe(&d);
            if !forward(&delta_tx, d).await {
                return Ok(());
            }
        }
    }
    warn!("watcher stream ended");
    Ok(())
}
