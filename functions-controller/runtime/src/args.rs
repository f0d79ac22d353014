use crate::discovery;
use anyhow::{bail, Result};
use clap::Parser;
use functions_controller_k8s_api::{Api, DynamicObject};
use functions_controller_k8s_reconcile::{
    cache, FunctionIndex, KubeCluster, Policy, Reconciler, Settings, WorkQueue,
};
use kube::runtime::watcher;
use prometheus_client::registry::Registry;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{info_span, Instrument};

#[derive(Debug, Parser)]
#[clap(name = "functions", about = "A function resource controller")]
pub struct Args {
    #[clap(
        long,
        default_value = "functions=info,warn",
        env = "FUNCTIONS_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Namespace holding the shared dispatcher services and config maps.
    #[clap(long, default_value = "knative-functions")]
    system_namespace: String,

    #[clap(long, default_value = "cluster.local")]
    cluster_domain: String,

    /// Convergence policy for function CRDs that do not declare one.
    #[clap(long, default_value = "external-name")]
    default_policy: Policy,

    /// Concurrent reconciliation workers per function kind.
    #[clap(long, default_value = "2")]
    workers: usize,

    /// Failed-key retries before a key is dropped until its next update.
    #[clap(long, default_value = "12")]
    max_retries: u32,

    #[clap(long, default_value = "5")]
    retry_base_delay_ms: u64,

    #[clap(long, default_value = "1000")]
    retry_max_delay_secs: u64,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            admin,
            client,
            log_level,
            log_format,
            system_namespace,
            cluster_domain,
            default_policy,
            workers,
            max_retries,
            retry_base_delay_ms,
            retry_max_delay_secs,
        } = self;

        let mut prom = <Registry>::default();
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;
        let client = runtime.client();

        // Function kinds are ordinary CRDs discovered at startup; each gets
        // its own watch, cache, queue, and worker pool.
        let kinds = discovery::function_kinds(&client, default_policy).await?;
        if kinds.is_empty() {
            tracing::warn!("No function CRDs found; nothing to reconcile");
        }

        let shutdown = runtime.shutdown_handle();
        for kind in kinds {
            tracing::info!(
                kind = %kind.plural,
                policy = ?kind.policy,
                "Reconciling function kind",
            );

            let queue = WorkQueue::new(
                Duration::from_millis(retry_base_delay_ms),
                Duration::from_secs(retry_max_delay_secs),
                max_retries,
            );
            let index = FunctionIndex::shared(kind.resource.clone(), queue.clone());
            let store = index.read().store();

            let api = Api::<DynamicObject>::all_with(client.clone(), &kind.resource);
            let events = watcher::watcher(api, watcher::Config::default());
            tokio::spawn(
                cache::sync_index(index, events)
                    .instrument(info_span!("watch", kind = %kind.plural)),
            );

            let cluster = Arc::new(KubeCluster::new(client.clone(), kind.resource.clone()));
            let reconciler = Arc::new(Reconciler::new(
                cluster,
                store,
                Settings {
                    kind: kind.plural.clone(),
                    crd_name: kind.crd_name.clone(),
                    system_namespace: system_namespace.clone(),
                    cluster_domain: cluster_domain.clone(),
                    policy: kind.policy,
                },
            ));
            tokio::spawn(
                functions_controller_k8s_reconcile::run_workers(
                    reconciler,
                    queue,
                    workers,
                    shutdown.clone(),
                )
                .instrument(info_span!("workers", kind = %kind.plural)),
            );
        }

        // Block the main thread on the shutdown signal. Once it fires, wait
        // for the worker pools to drain before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}
