//! The per-key reconciliation pass and the worker pool that drives it.

use crate::{
    cache::Store,
    client::{Cluster, ClusterApi},
    queue::WorkQueue,
    resources,
    sync::{self, OwnerHandle},
};
use functions_controller_core::{
    ConditionManager, ConditionSet, ConditionStatus, Error, ResourceId, Result,
};
use functions_controller_k8s_api::{
    serving, Addressable, ConfigMap, CustomResourceDefinition, Function, FunctionView,
    IMAGE_ANNOTATION,
};
use std::{collections::BTreeMap, str::FromStr, sync::Arc};
use tracing::{info_span, Instrument};

pub const CONFIG_MAP_SYNCED: &str = "ConfigMapSynced";
pub const SERVICE_SYNCED: &str = "ServiceSynced";
pub const ROUTE_READY: &str = "RouteReady";
pub const ADDRESSABLE: &str = "Addressable";

/// How a function kind converges onto its children.
///
/// The source system grew two divergent shapes of the same algorithm; they
/// are kept as distinct policies selectable per kind rather than collapsed
/// into one.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Policy {
    /// Per-function ExternalName service pointing at a per-language
    /// dispatcher, with a shared per-language config map keyed by the
    /// service's cluster DNS name.
    ExternalName,
    /// Per-function route onto a per-kind dispatcher service, with the
    /// dispatcher config document keyed by the route's address and route
    /// readiness propagated into the function's conditions.
    Routed,
}

impl Policy {
    pub fn condition_set(self) -> ConditionSet {
        match self {
            Policy::ExternalName => {
                ConditionSet::new([SERVICE_SYNCED, CONFIG_MAP_SYNCED, ADDRESSABLE])
            }
            Policy::Routed => ConditionSet::new([
                CONFIG_MAP_SYNCED,
                SERVICE_SYNCED,
                ROUTE_READY,
                ADDRESSABLE,
            ]),
        }
    }
}

impl FromStr for Policy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "external-name" => Ok(Self::ExternalName),
            "routed" => Ok(Self::Routed),
            other => anyhow::bail!("unknown policy {other:?}"),
        }
    }
}

/// Static configuration for one discovered function kind.
#[derive(Clone, Debug)]
pub struct Settings {
    /// The lowercase plural kind name, e.g. `filters`.
    pub kind: String,
    /// The CRD name, e.g. `filters.functions.knative.dev`.
    pub crd_name: String,
    /// The namespace holding shared dispatcher resources.
    pub system_namespace: String,
    pub cluster_domain: String,
    pub policy: Policy,
}

pub struct Reconciler<C> {
    cluster: Arc<C>,
    store: Store<Function>,
    conditions: ConditionSet,
    settings: Settings,
}

impl<C: Cluster> Reconciler<C> {
    pub fn new(cluster: Arc<C>, store: Store<Function>, settings: Settings) -> Self {
        Self {
            cluster,
            store,
            conditions: settings.policy.condition_set(),
            settings,
        }
    }

    /// One reconciliation pass for `key`.
    ///
    /// All mutation happens on a working copy; the snapshot read from the
    /// cache is kept only for the final status diff. The cache may lag the
    /// API server, so an unchanged status is never written back -- it could
    /// overwrite a newer status persisted by a pass this cache has not
    /// observed yet.
    pub async fn reconcile(&self, key: &ResourceId) -> Result<()> {
        let Some(original) = self.store.get(&key.namespace, &key.name) else {
            tracing::debug!(%key, "Function no longer exists");
            return Ok(());
        };
        let mut working = original.clone();

        let outcome = self.converge(&mut working).await;

        if working.status != original.status {
            if let Err(error) = self.cluster.persist(&working).await {
                tracing::warn!(%key, %error, "Failed to update status");
                self.cluster
                    .warn(
                        &working,
                        "UpdateFailed",
                        format!("Failed to update status for {}: {error}", working.name()),
                    )
                    .await;
                return Err(error);
            }
        }

        if let Err(error) = &outcome {
            self.cluster
                .warn(&working, "InternalError", error.to_string())
                .await;
        }
        outcome
    }

    /// Called when the retry budget for `key` is spent; the key is dropped
    /// until the next observed cache change.
    pub async fn record_abandoned(&self, key: &ResourceId, error: &Error) {
        tracing::error!(%key, %error, "Reconciliation failed; retry budget exhausted");
        if let Some(function) = self.store.get(&key.namespace, &key.name) {
            self.cluster
                .warn(
                    &function,
                    "RetriesExhausted",
                    format!("Giving up on {key} until the next update: {error}"),
                )
                .await;
        }
    }

    async fn converge(&self, function: &mut Function) -> Result<()> {
        if function.metadata.deletion_timestamp.is_some() {
            // Finalizer handling, were it needed, would go here.
            return Ok(());
        }

        self.manager(function).init_unset();
        let view = FunctionView::try_from(&*function)?;

        match self.settings.policy {
            Policy::ExternalName => self.converge_external_name(function, &view).await?,
            Policy::Routed => self.converge_routed(function, &view).await?,
        }

        function.status.observed_generation = function.metadata.generation;
        Ok(())
    }

    fn manager<'a>(&'a self, function: &'a mut Function) -> ConditionManager<'a> {
        ConditionManager::new(&self.conditions, &mut function.status.conditions)
    }

    async fn crd(&self) -> Result<(CustomResourceDefinition, OwnerHandle)> {
        let crd = <C as ClusterApi<CustomResourceDefinition>>::get(
            &self.cluster,
            "",
            &self.settings.crd_name,
        )
        .await?
        .ok_or_else(|| {
            Error::Config(format!("function CRD {} not found", self.settings.crd_name))
        })?;
        let owner = OwnerHandle {
            api_version: "apiextensions.k8s.io/v1".to_string(),
            kind: "CustomResourceDefinition".to_string(),
            name: crd.metadata.name.clone().unwrap_or_default(),
            uid: crd.metadata.uid.clone().unwrap_or_default(),
        };
        Ok((crd, owner))
    }

    async fn converge_external_name(
        &self,
        function: &mut Function,
        view: &FunctionView,
    ) -> Result<()> {
        let Settings {
            kind,
            system_namespace,
            cluster_domain,
            ..
        } = &self.settings;
        let owner = OwnerHandle::from(&*function);

        // The per-function service forwards to the shared per-language
        // dispatcher.
        let dispatcher_host = resources::cluster_address(
            &resources::language_config_name(kind, &view.language),
            system_namespace,
            cluster_domain,
        );
        let service_spec = resources::ExternalService {
            namespace: function.namespace().to_string(),
            name: resources::service_name(function.name()),
            external_name: dispatcher_host,
        };
        let service = match sync::ensure(self.cluster.as_ref(), &owner, &service_spec).await {
            Ok(service) => {
                self.manager(function).mark_true(SERVICE_SYNCED);
                service
            }
            Err(error) => {
                self.manager(function)
                    .mark_false(SERVICE_SYNCED, "SyncFailed", &error);
                return Err(error);
            }
        };

        // Shared children belong to the CRD, not to any one function.
        let (_, crd_owner) = self.crd().await?;
        let address = resources::cluster_address(
            service.metadata.name.as_deref().unwrap_or_default(),
            function.namespace(),
            cluster_domain,
        );
        let document = serde_json::to_string(&function.spec).map_err(Error::transient)?;
        let config_spec = resources::FunctionConfig {
            namespace: system_namespace.clone(),
            name: resources::language_config_name(kind, &view.language),
            entries: BTreeMap::from([(address.clone(), document)]),
            insert_only: false,
        };
        if let Err(error) = sync::ensure(self.cluster.as_ref(), &crd_owner, &config_spec).await {
            self.manager(function)
                .mark_false(CONFIG_MAP_SYNCED, "UpdateFailed", &error);
            return Err(error);
        }
        self.manager(function).mark_true(CONFIG_MAP_SYNCED);

        function.status.address = Some(Addressable {
            url: format!("http://{address}"),
        });
        self.manager(function).mark_true(ADDRESSABLE);
        Ok(())
    }

    async fn converge_routed(&self, function: &mut Function, view: &FunctionView) -> Result<()> {
        let Settings {
            kind,
            system_namespace,
            cluster_domain,
            ..
        } = &self.settings;
        let owner = OwnerHandle::from(&*function);

        let (crd, crd_owner) = match self.crd().await {
            Ok(found) => found,
            Err(error) => {
                self.manager(function)
                    .mark_unknown(SERVICE_SYNCED, "FunctionCrdGetFailed", &error);
                return Err(error);
            }
        };

        // Seed the dispatcher configuration document without clobbering
        // accumulated entries.
        let config_name = resources::dispatcher_config_name(kind);
        let baseline = resources::FunctionConfig {
            namespace: system_namespace.clone(),
            name: config_name.clone(),
            entries: BTreeMap::from([(resources::CONFIG_KEY.to_string(), "{}".to_string())]),
            insert_only: true,
        };
        let config = match sync::ensure(self.cluster.as_ref(), &crd_owner, &baseline).await {
            Ok(config) => config,
            Err(error) => {
                self.manager(function)
                    .mark_false(CONFIG_MAP_SYNCED, "CheckExistFailed", &error);
                return Err(error);
            }
        };

        if let Err(error) = self.ensure_dispatcher(&crd, &crd_owner, &config).await {
            self.manager(function)
                .mark_false(SERVICE_SYNCED, "CheckExistFailed", &error);
            return Err(error);
        }

        let route_spec = resources::FunctionRoute {
            namespace: system_namespace.clone(),
            name: resources::route_name(kind, function.namespace(), function.name()),
            configuration: resources::configuration_name(kind, &view.language),
        };
        let route = match sync::ensure(self.cluster.as_ref(), &owner, &route_spec).await {
            Ok(route) => route,
            Err(error) => {
                self.manager(function)
                    .mark_false(ROUTE_READY, "ReconcileFailed", &error);
                return Err(error);
            }
        };
        self.propagate_route_readiness(function, &route)?;

        // Record this function under the route's address in the dispatcher
        // configuration.
        let config = match self.update_config_document(function, &route, &config, &crd_owner).await
        {
            Ok(config) => config,
            Err(error) => {
                self.manager(function)
                    .mark_false(CONFIG_MAP_SYNCED, "UpdateFailed", &error);
                return Err(error);
            }
        };
        self.manager(function).mark_true(CONFIG_MAP_SYNCED);

        // Re-sync the dispatcher so a configuration change rolls out a fresh
        // revision.
        match self.ensure_dispatcher(&crd, &crd_owner, &config).await {
            Ok(_) => self.manager(function).mark_true(SERVICE_SYNCED),
            Err(error) => {
                self.manager(function)
                    .mark_false(SERVICE_SYNCED, "UpdateFailed", &error);
                return Err(error);
            }
        }

        let route_host = resources::cluster_address(
            route.metadata.name.as_deref().unwrap_or_default(),
            system_namespace,
            cluster_domain,
        );
        function.status.address = Some(Addressable {
            url: format!("http://{route_host}"),
        });
        function.status.url = route.status.as_ref().and_then(|s| s.url.clone());
        self.manager(function).mark_true(ADDRESSABLE);
        Ok(())
    }

    async fn ensure_dispatcher(
        &self,
        crd: &CustomResourceDefinition,
        crd_owner: &OwnerHandle,
        config: &ConfigMap,
    ) -> Result<serving::Service> {
        let image = crd
            .metadata
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(IMAGE_ANNOTATION))
            .cloned()
            .ok_or_else(|| {
                Error::Config(format!(
                    "missing {IMAGE_ANNOTATION} annotation on function CRD {}",
                    self.settings.crd_name,
                ))
            })?;
        let spec = resources::DispatcherService {
            namespace: self.settings.system_namespace.clone(),
            kind: self.settings.kind.clone(),
            image,
            config_version: config.metadata.resource_version.clone().unwrap_or_default(),
        };
        sync::ensure(self.cluster.as_ref(), crd_owner, &spec).await
    }

    fn propagate_route_readiness(
        &self,
        function: &mut Function,
        route: &serving::Route,
    ) -> Result<()> {
        let name = route.metadata.name.as_deref().unwrap_or_default().to_string();
        match route.status.as_ref().and_then(|s| s.ready()) {
            Some(condition) if condition.status == ConditionStatus::True => {
                self.manager(function).mark_true(ROUTE_READY);
                Ok(())
            }
            Some(condition) => {
                let reason = condition.reason.clone().unwrap_or_default();
                let message = condition.message.clone().unwrap_or_default();
                self.manager(function)
                    .mark_false(ROUTE_READY, &reason, message);
                Err(Error::transient(anyhow::anyhow!("route {name} is not ready")))
            }
            None => {
                self.manager(function)
                    .mark_unknown(ROUTE_READY, "Unknown", "");
                Err(Error::transient(anyhow::anyhow!(
                    "route {name} has not reported readiness"
                )))
            }
        }
    }

    /// Folds this function's spec into the dispatcher configuration document
    /// under the route's address key, updating the config map only when the
    /// document actually changes.
    async fn update_config_document(
        &self,
        function: &Function,
        route: &serving::Route,
        config: &ConfigMap,
        crd_owner: &OwnerHandle,
    ) -> Result<ConfigMap> {
        let Some(key) = route
            .status
            .as_ref()
            .and_then(|s| s.address.as_ref())
            .and_then(|a| config_key_from_url(&a.url))
        else {
            // No address yet; nothing to record.
            return Ok(config.clone());
        };

        let raw = config
            .data
            .as_ref()
            .and_then(|data| data.get(resources::CONFIG_KEY))
            .map(String::as_str)
            .unwrap_or("{}");
        let mut document: serde_json::Map<String, serde_json::Value> =
            serde_json::from_str(raw).map_err(|e| {
                Error::Config(format!("dispatcher configuration is not valid JSON: {e}"))
            })?;

        let spec = serde_json::Value::Object(function.spec.clone());
        if document.get(&key) == Some(&spec) {
            return Ok(config.clone());
        }
        document.insert(key, spec);
        let serialized =
            serde_json::to_string(&serde_json::Value::Object(document)).map_err(Error::transient)?;

        let spec = resources::FunctionConfig {
            namespace: self.settings.system_namespace.clone(),
            name: resources::dispatcher_config_name(&self.settings.kind),
            entries: BTreeMap::from([(resources::CONFIG_KEY.to_string(), serialized)]),
            insert_only: false,
        };
        sync::ensure(self.cluster.as_ref(), crd_owner, &spec).await
    }
}

/// Derives the dispatcher config key from a route address URL: the first two
/// DNS labels of the host, i.e. `name.namespace`.
fn config_key_from_url(url: &str) -> Option<String> {
    let host = url
        .trim_start_matches("http://")
        .trim_start_matches("https://")
        .split('/')
        .next()?;
    let mut labels = host.split('.');
    match (labels.next(), labels.next()) {
        (Some(name), Some(namespace)) if !name.is_empty() && !namespace.is_empty() => {
            Some(format!("{name}.{namespace}"))
        }
        _ => None,
    }
}

/// Runs a fixed pool of workers until shutdown is signaled, then lets
/// in-flight passes finish before returning.
pub async fn run_workers<C>(
    reconciler: Arc<Reconciler<C>>,
    queue: Arc<WorkQueue>,
    workers: usize,
    shutdown: drain::Watch,
) where
    C: Cluster + Send + Sync + 'static,
{
    let tasks: Vec<_> = (0..workers)
        .map(|worker| {
            tokio::spawn(
                process(reconciler.clone(), queue.clone())
                    .instrument(info_span!("worker", worker)),
            )
        })
        .collect();

    let release = shutdown.signaled().await;
    queue.shutdown();
    for task in tasks {
        let _ = task.await;
    }
    drop(release);
}

async fn process<C>(reconciler: Arc<Reconciler<C>>, queue: Arc<WorkQueue>)
where
    C: Cluster + Send + Sync,
{
    while let Some(key) = queue.next().await {
        let result = reconciler.reconcile(&key).await;
        queue.done(&key);
        match result {
            Ok(()) => queue.forget(&key),
            Err(error) => {
                if queue.add_rate_limited(key.clone()) {
                    tracing::warn!(%key, %error, "Reconciliation failed; requeued");
                } else {
                    reconciler.record_abandoned(&key, &error).await;
                }
            }
        }
    }
}
