//! The watch-maintained local mirror of function instances.
//!
//! The index owns the mirror and marks keys dirty in the work queue on every
//! observed change, subject to a caller-supplied predicate. Reconcilers read
//! through [`Store`] handles; a cache miss means the resource was deleted.
//! Read-your-writes is never assumed: the mirror may lag the API server.

use crate::queue::WorkQueue;
use ahash::AHashMap as HashMap;
use functions_controller_core::ResourceId;
use functions_controller_k8s_api::{ApiResource, DynamicObject, Function};
use futures::prelude::*;
use kube::runtime::watcher;
use kubert::index::IndexNamespacedResource;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::time;

/// A read handle onto the mirror.
#[derive(Debug)]
pub struct Store<T> {
    inner: Arc<RwLock<HashMap<ResourceId, T>>>,
}

impl<T> Clone for Store<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for Store<T> {
    fn default() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl<T: Clone> Store<T> {
    pub fn get(&self, namespace: &str, name: &str) -> Option<T> {
        let id = ResourceId::new(namespace.to_string(), name.to_string());
        self.inner.read().get(&id).cloned()
    }

    pub fn keys(&self) -> Vec<ResourceId> {
        self.inner.read().keys().cloned().collect()
    }
}

pub type Predicate = Box<dyn Fn(&DynamicObject) -> bool + Send + Sync>;

/// Maintains the function mirror for one discovered kind and feeds the work
/// queue.
pub struct FunctionIndex {
    resource: ApiResource,
    store: Store<Function>,
    queue: Arc<WorkQueue>,
    predicate: Option<Predicate>,
}

pub type SharedIndex = Arc<RwLock<FunctionIndex>>;

impl FunctionIndex {
    pub fn shared(resource: ApiResource, queue: Arc<WorkQueue>) -> SharedIndex {
        Arc::new(RwLock::new(Self {
            resource,
            store: Store::default(),
            queue,
            predicate: None,
        }))
    }

    /// Restricts the index to objects matching `predicate`. An object that
    /// stops matching is dropped from the mirror, so the next reconciliation
    /// observes it as deleted.
    pub fn with_predicate(
        index: SharedIndex,
        predicate: impl Fn(&DynamicObject) -> bool + Send + Sync + 'static,
    ) -> SharedIndex {
        index.write().predicate = Some(Box::new(predicate));
        index
    }

    pub fn store(&self) -> Store<Function> {
        self.store.clone()
    }

    /// Replaces the mirror with a freshly-listed world, enqueueing both the
    /// listed keys and any key that disappeared while the watch was down.
    fn restart(&mut self, objs: Vec<DynamicObject>) {
        let listed: ahash::AHashSet<ResourceId> = objs
            .iter()
            .filter_map(|obj| Some(ResourceId::new(obj.metadata.namespace.clone()?, obj.metadata.name.clone()?)))
            .collect();
        for id in self.store.keys() {
            if !listed.contains(&id) {
                self.delete(id.namespace, id.name);
            }
        }
        for obj in objs {
            self.apply(obj);
        }
    }
}

impl IndexNamespacedResource<DynamicObject> for FunctionIndex {
    fn apply(&mut self, obj: DynamicObject) {
        let (Some(namespace), Some(name)) =
            (obj.metadata.namespace.clone(), obj.metadata.name.clone())
        else {
            tracing::warn!("Ignoring object without namespace/name");
            return;
        };
        let id = ResourceId::new(namespace, name);

        if let Some(predicate) = &self.predicate {
            if !predicate(&obj) {
                if self.store.inner.write().remove(&id).is_some() {
                    self.queue.add(id);
                }
                return;
            }
        }

        let function = Function::from_dynamic(obj, &self.resource);
        self.store.inner.write().insert(id.clone(), function);
        self.queue.add(id);
    }

    fn delete(&mut self, namespace: String, name: String) {
        let id = ResourceId::new(namespace, name);
        if self.store.inner.write().remove(&id).is_some() {
            self.queue.add(id);
        }
    }
}

/// Drives an index from a watch stream until the stream ends.
///
/// Watch-level errors are transient: log, back off briefly, and keep
/// consuming. The watcher re-lists on its own and surfaces the result as a
/// restart event.
pub async fn sync_index<S>(index: SharedIndex, events: S)
where
    S: Stream<Item = watcher::Result<watcher::Event<DynamicObject>>>,
{
    tokio::pin!(events);
    loop {
        match events.next().await {
            None => return,
            Some(Err(error)) => {
                tracing::info!(%error, "Watch stream failed");
                time::sleep(time::Duration::from_secs(1)).await;
            }
            Some(Ok(watcher::Event::Applied(obj))) => index.write().apply(obj),
            Some(Ok(watcher::Event::Deleted(obj))) => {
                let (Some(namespace), Some(name)) =
                    (obj.metadata.namespace, obj.metadata.name)
                else {
                    continue;
                };
                index.write().delete(namespace, name);
            }
            Some(Ok(watcher::Event::Restarted(objs))) => index.write().restart(objs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use functions_controller_k8s_api::GroupVersionKind;
    use serde_json::json;
    use std::time::Duration;

    fn resource() -> ApiResource {
        ApiResource::from_gvk_with_plural(
            &GroupVersionKind::gvk("functions.knative.dev", "v1alpha1", "Filter"),
            "filters",
        )
    }

    fn obj(namespace: &str, name: &str) -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "functions.knative.dev/v1alpha1",
            "kind": "Filter",
            "metadata": { "namespace": namespace, "name": name, "labels": { "app": name } },
            "spec": { "language": "js" },
        }))
        .unwrap()
    }

    fn queue() -> Arc<WorkQueue> {
        WorkQueue::new(Duration::from_millis(5), Duration::from_secs(300), 3)
    }

    #[tokio::test]
    async fn apply_and_delete_enqueue_keys() {
        let q = queue();
        let index = FunctionIndex::shared(resource(), q.clone());
        let store = index.read().store();

        index.write().apply(obj("ns", "fn-a"));
        assert_eq!(q.next().await, Some(ResourceId::new("ns".into(), "fn-a".into())));
        q.done(&ResourceId::new("ns".into(), "fn-a".into()));
        assert!(store.get("ns", "fn-a").is_some());

        index.write().delete("ns".to_string(), "fn-a".to_string());
        assert_eq!(q.next().await, Some(ResourceId::new("ns".into(), "fn-a".into())));
        assert!(store.get("ns", "fn-a").is_none());
    }

    #[tokio::test]
    async fn predicate_filters_objects() {
        let q = queue();
        let index = FunctionIndex::with_predicate(FunctionIndex::shared(resource(), q.clone()), |obj| {
            obj.metadata
                .labels
                .as_ref()
                .is_some_and(|labels| labels.get("app").map(String::as_str) == Some("fn-keep"))
        });
        let store = index.read().store();

        index.write().apply(obj("ns", "fn-skip"));
        assert!(store.get("ns", "fn-skip").is_none());
        assert!(q.is_empty());

        index.write().apply(obj("ns", "fn-keep"));
        assert!(store.get("ns", "fn-keep").is_some());
        assert_eq!(q.next().await, Some(ResourceId::new("ns".into(), "fn-keep".into())));
    }

    #[tokio::test]
    async fn restart_reconciles_removed_keys() {
        let q = queue();
        let index = FunctionIndex::shared(resource(), q.clone());
        let store = index.read().store();

        index.write().apply(obj("ns", "fn-a"));
        index.write().apply(obj("ns", "fn-b"));
        while !q.is_empty() {
            let key = q.next().await.unwrap();
            q.done(&key);
        }

        index.write().restart(vec![obj("ns", "fn-b")]);
        assert!(store.get("ns", "fn-a").is_none());
        assert!(store.get("ns", "fn-b").is_some());
    }
}
