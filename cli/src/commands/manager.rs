// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! `axamm manager`
//!
//! Boot order: required environment, AXDB readiness, schema seeding, secret
//! keys, cache and bus, then the background loops and the `/v1` listener.
//! Only this bootstrap exits the process; once the loops run, failures are
//! logged and retried.

use anyhow::{bail, Context, Result};
use axamm_core::application::deployment_monitor::{DeploymentMonitor, HeartbeatEmitter, MonitorConfig};
use axamm_core::application::deployment_service::{DeploymentServiceConfig, StandardDeploymentService};
use axamm_core::application::search_index::SearchIndexer;
use axamm_core::application::supervisor::Supervisor;
use axamm_core::domain::platform::AdmissionController;
use axamm_core::domain::repository::DeploymentRepository;
use axamm_core::infrastructure::admission_client::{AdmissionClient, UnlimitedAdmission};
use axamm_core::infrastructure::am_client::{AmClient, DEFAULT_AM_URL_TEMPLATE};
use axamm_core::infrastructure::axdb::bootstrap::{seed_tables, wait_until_ready};
use axamm_core::infrastructure::axdb::schema::catalog;
use axamm_core::infrastructure::axdb::{DatabaseClient, HttpDatabaseClient};
use axamm_core::infrastructure::bus::producer::BROKER_INIT_TIMEOUT;
use axamm_core::infrastructure::bus::redis_streams::RedisStreamLog;
use axamm_core::infrastructure::cache::{CacheClient, RedisCache};
use axamm_core::infrastructure::etag::EtagRotator;
use axamm_core::infrastructure::notification_producer::{EventNotificationProducer, EventNotifier};
use axamm_core::infrastructure::repositories::{AxdbDeploymentRepository, AxdbSearchIndexRepository};
use axamm_core::infrastructure::rest_client::RestClient;
use axamm_core::infrastructure::secrets::SecretKeyStore;
use axamm_core::infrastructure::{HeartbeatRegistry, KeyedLockGroup};
use axamm_core::presentation::api::{self, ApiState};
use axamm_core::presentation::server;
use clap::Args;
use futures::FutureExt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const FACILITY: &str = "axamm";

#[derive(Args, Debug, Clone)]
pub struct ManagerArgs {
    /// Kubernetes namespace the manager runs in
    #[arg(long, env = "AX_NAMESPACE")]
    namespace: Option<String>,

    /// Platform version tag
    #[arg(long = "ax-version", env = "AX_VERSION")]
    ax_version: Option<String>,

    /// Restrict the manager to one application
    #[arg(long, env = "APPLICATION_NAME")]
    application_name: Option<String>,

    /// Address of the `/v1` listener
    #[arg(long, env = "AXAMM_LISTEN_ADDR", default_value = "0.0.0.0:8966")]
    listen: SocketAddr,

    /// AXDB root URL
    #[arg(long, env = "AXDB_URL", default_value = "http://axdb.axsys:8083/v1")]
    axdb_url: String,

    /// How long to wait for AXDB before giving up
    #[arg(long, env = "AXDB_WAIT", default_value = "20m", value_parser = humantime::parse_duration)]
    axdb_wait: Duration,

    /// Redis URL for the cache and the message log
    #[arg(long, env = "REDIS_URL", default_value = "redis://redis.axsys:6379")]
    redis_url: String,

    /// Admission controller root URL; admission is unlimited when unset
    #[arg(long, env = "ADC_URL")]
    admission_url: Option<String>,

    /// Side-car URL template, `{app}` is replaced by the application name
    #[arg(long, env = "AM_URL_TEMPLATE", default_value = DEFAULT_AM_URL_TEMPLATE)]
    am_url_template: String,

    /// Upstream AMM that receives this manager's heartbeats
    #[arg(long, env = "AXAMM_UPSTREAM_URL")]
    upstream_url: Option<String>,

    /// PEM file holding the secret encryption key; generated when missing
    #[arg(long, env = "AX_SECRET_KEY_PATH")]
    secret_key_path: Option<PathBuf>,

    /// Cluster name stamped on outgoing notifications
    #[arg(long, env = "AX_CLUSTER_NAME_ID", default_value = "")]
    cluster_name: String,

    /// Idle time after which a per-deployment lock is collected
    #[arg(long, env = "AXAMM_LOCK_TTL", default_value = "1h", value_parser = humantime::parse_duration)]
    lock_ttl: Duration,

    /// Prometheus exporter address
    #[arg(long, env = "AXAMM_METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,
}

pub async fn run(args: ManagerArgs, cancel: CancellationToken) -> Result<()> {
    let Some(namespace) = args.namespace.as_deref().filter(|s| !s.is_empty()) else {
        bail!("AX_NAMESPACE is required");
    };
    let Some(version) = args.ax_version.as_deref().filter(|s| !s.is_empty()) else {
        bail!("AX_VERSION is required");
    };
    info!("Starting axamm manager {} in namespace {}", version, namespace);

    super::init_metrics(args.metrics_addr)?;

    let db: Arc<dyn DatabaseClient> =
        Arc::new(HttpDatabaseClient::new(&args.axdb_url).context("Invalid AXDB URL")?);
    info!("Waiting up to {} for AXDB at {}", humantime::format_duration(args.axdb_wait), args.axdb_url);
    wait_until_ready(db.as_ref(), args.axdb_wait)
        .await
        .context("AXDB is not reachable")?;
    seed_tables(db.as_ref(), &catalog())
        .await
        .context("Failed to seed AXDB schemas")?;

    let secrets = SecretKeyStore::load(args.secret_key_path.as_deref()).context("Failed to load secret keys")?;
    info!("Loaded secret key version {}", secrets.version());

    let redis = RedisCache::connect(&args.redis_url)
        .await
        .context("Failed to connect to Redis")?;
    let log = Arc::new(RedisStreamLog::new(redis.pool().clone()));
    let cache: Arc<dyn CacheClient> = Arc::new(redis);

    let notifier: Arc<dyn EventNotifier> = Arc::new(
        EventNotificationProducer::new(FACILITY, log, BROKER_INIT_TIMEOUT).with_cluster(&args.cluster_name),
    );

    let admission: Arc<dyn AdmissionController> = match args.admission_url.as_deref() {
        Some(url) => Arc::new(AdmissionClient::new(url).context("Invalid admission controller URL")?),
        None => {
            warn!("No admission controller configured, reservations are not enforced");
            Arc::new(UnlimitedAdmission)
        }
    };

    let repository: Arc<dyn DeploymentRepository> = Arc::new(AxdbDeploymentRepository::new(db.clone()));
    let (indexer, index_worker) = SearchIndexer::channel(Arc::new(AxdbSearchIndexRepository::new(db.clone())));
    let locks = Arc::new(KeyedLockGroup::new(args.lock_ttl));
    let service = Arc::new(
        StandardDeploymentService::new(
            repository,
            admission,
            Arc::new(AmClient::new(&args.am_url_template)),
            cache.clone(),
            Arc::new(HeartbeatRegistry::new()),
            locks.clone(),
            DeploymentServiceConfig {
                application_name: args.application_name.clone(),
                ..DeploymentServiceConfig::default()
            },
        )
        .with_search_index(indexer),
    );
    service
        .restore_heartbeats()
        .await
        .context("Failed to restore heartbeat handlers")?;

    let etag = Arc::new(EtagRotator::new(cache, Some(notifier)));
    let monitor = Arc::new(DeploymentMonitor::new(
        service.clone(),
        MonitorConfig {
            application_name: args.application_name.clone(),
            ..MonitorConfig::default()
        },
    ));

    let mut supervisor = Supervisor::new(cancel.clone());
    {
        let monitor = monitor.clone();
        supervisor.spawn("deployment-monitor", move |c| monitor.clone().run(c).boxed());
    }
    supervisor.spawn("reservation-extender", move |c| monitor.clone().run_extender(c).boxed());
    {
        let etag = etag.clone();
        supervisor.spawn("etag-ticker", move |c| etag.clone().run_ticker(c).boxed());
    }
    {
        let etag = etag.clone();
        supervisor.spawn("etag-listener", move |c| etag.clone().run_listener(c).boxed());
    }
    supervisor.spawn("lock-gc", move |c| locks.clone().run_gc(c).boxed());
    supervisor.spawn_once("search-index", move |c| index_worker.run(c));

    match (args.upstream_url.as_deref(), args.application_name.as_deref()) {
        (Some(url), Some(app)) => {
            let client = RestClient::new(url, Duration::from_secs(60)).context("Invalid upstream AMM URL")?;
            let emitter = Arc::new(HeartbeatEmitter::new(client, app, service.clone()));
            supervisor.spawn("heartbeat-emitter", move |c| emitter.clone().run(c).boxed());
        }
        (Some(_), None) => warn!("AXAMM_UPSTREAM_URL is set without APPLICATION_NAME, not sending heartbeats"),
        _ => {}
    }

    let app = api::router(Arc::new(ApiState {
        deployments: service,
        etag,
        secrets: Arc::new(secrets),
    }));
    let listener = TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("Failed to bind {}", args.listen))?;
    let served = server::serve(listener, app, None, cancel.clone()).await;

    info!("Manager shutting down");
    supervisor.shutdown().await;
    served.context("HTTP server failed")
}
