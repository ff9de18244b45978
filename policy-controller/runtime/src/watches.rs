//! Watches the kinds of objects that policies depend on.
//!
//! The set of kinds changes as policies come and go, so watches are started
//! and stopped dynamically rather than spawned once at startup.

use crate::{
    core::Store,
    index::{KindRef, SharedIndex},
    k8s::{self, watcher, DynamicObject, ResourceExt},
    store::KubeStore,
};
use ahash::AHashMap as HashMap;
use futures::prelude::*;
use kube::runtime::WatchStreamExt;
use std::{collections::BTreeSet, sync::Arc};
use tokio::{sync::watch, task::AbortHandle, time};
use tracing::{debug, info, info_span, warn, Instrument};

/// How long to wait before retrying discovery of a kind that isn't served.
const RESOLVE_RETRY: time::Duration = time::Duration::from_secs(30);

pub async fn run(
    client: k8s::Client,
    store: Arc<KubeStore>,
    index: SharedIndex,
    mut kinds: watch::Receiver<BTreeSet<KindRef>>,
) {
    let mut running = HashMap::<KindRef, AbortHandle>::new();
    loop {
        let wanted = kinds.borrow_and_update().clone();

        running.retain(|kind, task| {
            if wanted.contains(kind) {
                return true;
            }
            info!(%kind, "Stopping watch");
            task.abort();
            false
        });

        for kind in wanted {
            if running.contains_key(&kind) {
                continue;
            }
            info!(%kind, "Starting watch");
            let span = info_span!("watch", %kind);
            let task = tokio::spawn(
                watch_kind(client.clone(), store.clone(), index.clone(), kind.clone())
                    .instrument(span),
            );
            running.insert(kind, task.abort_handle());
        }

        if kinds.changed().await.is_err() {
            debug!("Index dropped; stopping watches");
            for (_, task) in running.drain() {
                task.abort();
            }
            return;
        }
    }
}

async fn watch_kind(client: k8s::Client, store: Arc<KubeStore>, index: SharedIndex, kind: KindRef) {
    let info = loop {
        match store.resolve_kind(&kind.api_version, &kind.kind).await {
            Ok(Some(info)) => break info,
            Ok(None) => debug!("Kind is not served; retrying later"),
            Err(error) => warn!(%error, "Failed to resolve kind"),
        }
        time::sleep(RESOLVE_RETRY).await;
    };

    let resource = crate::store::api_resource(&info);
    let api = k8s::Api::<DynamicObject>::all_with(client, &resource);
    let events = watcher::watcher(api, watcher::Config::default()).default_backoff();
    futures::pin_mut!(events);

    while let Some(event) = events.next().await {
        match event {
            Ok(watcher::Event::Apply(object) | watcher::Event::Delete(object)) => {
                notify(&index, &kind, &object);
            }
            // Objects listed after a restart may have changed while the
            // watch was down.
            Ok(watcher::Event::InitApply(object)) => notify(&index, &kind, &object),
            Ok(watcher::Event::Init | watcher::Event::InitDone) => {}
            Err(error) => warn!(%error, "Watch failed"),
        }
    }
}

fn notify(index: &SharedIndex, kind: &KindRef, object: &DynamicObject) {
    index.write().object_event(
        &kind.api_version,
        &kind.kind,
        object.namespace().as_deref(),
        &object.name_any(),
    );
}
