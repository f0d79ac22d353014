//! The API-client boundary.
//!
//! The engine only needs get/create/update per child kind, a status
//! subresource writer, and an event sink. Each is a narrow trait so the
//! reconciler can run against an in-memory cluster in tests; the production
//! implementation delegates to `kube`.

use crate::status::StatusWriter;
use functions_controller_core::{Error, Result, CONTROLLER_NAME};
use functions_controller_k8s_api::{
    self as k8s, serving, Api, ApiResource, Client, CustomResourceDefinition, Function,
    PostParams, Resource,
};
use k8s_openapi::api::core::v1::ObjectReference;
use kube::{
    core::NamespaceResourceScope,
    runtime::events::{Event, EventType, Recorder, Reporter},
};
use serde::{de::DeserializeOwned, Serialize};
use std::fmt::Debug;

#[async_trait::async_trait]
pub trait ClusterApi<T>: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<T>>;
    async fn create(&self, namespace: &str, obj: &T) -> Result<T>;
    async fn update(&self, namespace: &str, obj: &T) -> Result<T>;
}

#[async_trait::async_trait]
pub trait EventSink: Send + Sync {
    /// Records a warning event against the function.
    async fn warn(&self, function: &Function, reason: &str, note: String);
}

/// Everything a reconciler needs from the cluster, in one bound.
pub trait Cluster:
    ClusterApi<k8s::ConfigMap>
    + ClusterApi<k8s::Service>
    + ClusterApi<serving::Route>
    + ClusterApi<serving::Service>
    + ClusterApi<CustomResourceDefinition>
    + StatusWriter
    + EventSink
{
}

impl<C> Cluster for C where
    C: ClusterApi<k8s::ConfigMap>
        + ClusterApi<k8s::Service>
        + ClusterApi<serving::Route>
        + ClusterApi<serving::Service>
        + ClusterApi<CustomResourceDefinition>
        + StatusWriter
        + EventSink
{
}

/// The production client, scoped to one discovered function kind.
pub struct KubeCluster {
    pub(crate) client: Client,
    pub(crate) resource: ApiResource,
    reporter: Reporter,
}

impl KubeCluster {
    pub fn new(client: Client, resource: ApiResource) -> Self {
        let reporter = Reporter {
            controller: CONTROLLER_NAME.to_string(),
            instance: std::env::var("HOSTNAME").ok(),
        };
        Self {
            client,
            resource,
            reporter,
        }
    }

    async fn get_in<T>(&self, namespace: &str, name: &str) -> Result<Option<T>>
    where
        T: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Debug,
    {
        Api::namespaced(self.client.clone(), namespace)
            .get_opt(name)
            .await
            .map_err(Error::transient)
    }

    async fn create_in<T>(&self, namespace: &str, obj: &T) -> Result<T>
    where
        T: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Serialize
            + Debug,
    {
        Api::namespaced(self.client.clone(), namespace)
            .create(&PostParams::default(), obj)
            .await
            .map_err(Error::transient)
    }

    /// Replaces the object, relying on its resourceVersion for optimistic
    /// concurrency. A 409 surfaces as a transient error and the next pass
    /// recomputes from fresher cache state.
    async fn update_in<T>(&self, namespace: &str, obj: &T) -> Result<T>
    where
        T: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Serialize
            + Debug,
    {
        let name = obj.meta().name.clone().unwrap_or_default();
        Api::namespaced(self.client.clone(), namespace)
            .replace(&name, &PostParams::default(), obj)
            .await
            .map_err(Error::transient)
    }
}

macro_rules! impl_namespaced_cluster_api {
    ($kind:ty) => {
        #[async_trait::async_trait]
        impl ClusterApi<$kind> for KubeCluster {
            async fn get(&self, namespace: &str, name: &str) -> Result<Option<$kind>> {
                self.get_in(namespace, name).await
            }

            async fn create(&self, namespace: &str, obj: &$kind) -> Result<$kind> {
                self.create_in(namespace, obj).await
            }

            async fn update(&self, namespace: &str, obj: &$kind) -> Result<$kind> {
                self.update_in(namespace, obj).await
            }
        }
    };
}

impl_namespaced_cluster_api!(k8s::ConfigMap);
impl_namespaced_cluster_api!(k8s::Service);
impl_namespaced_cluster_api!(serving::Route);
impl_namespaced_cluster_api!(serving::Service);

// CRDs are cluster-scoped; the namespace argument is ignored.
#[async_trait::async_trait]
impl ClusterApi<CustomResourceDefinition> for KubeCluster {
    async fn get(&self, _namespace: &str, name: &str) -> Result<Option<CustomResourceDefinition>> {
        Api::all(self.client.clone())
            .get_opt(name)
            .await
            .map_err(Error::transient)
    }

    async fn create(&self, _namespace: &str, obj: &CustomResourceDefinition) -> Result<CustomResourceDefinition> {
        Api::all(self.client.clone())
            .create(&PostParams::default(), obj)
            .await
            .map_err(Error::transient)
    }

    async fn update(&self, _namespace: &str, obj: &CustomResourceDefinition) -> Result<CustomResourceDefinition> {
        let name = obj.meta().name.clone().unwrap_or_default();
        Api::all(self.client.clone())
            .replace(&name, &PostParams::default(), obj)
            .await
            .map_err(Error::transient)
    }
}

#[async_trait::async_trait]
impl EventSink for KubeCluster {
    async fn warn(&self, function: &Function, reason: &str, note: String) {
        let reference = ObjectReference {
            api_version: Some(function.api_version.clone()),
            kind: Some(function.kind.clone()),
            namespace: function.metadata.namespace.clone(),
            name: function.metadata.name.clone(),
            uid: function.metadata.uid.clone(),
            ..Default::default()
        };
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), reference);
        let event = Event {
            type_: EventType::Warning,
            reason: reason.to_string(),
            note: Some(note),
            action: "Reconcile".to_string(),
            secondary: None,
        };
        // Event delivery is best-effort; a failure must not fail the pass.
        if let Err(error) = recorder.publish(event).await {
            tracing::warn!(%error, "Failed to publish event");
        }
    }
}
