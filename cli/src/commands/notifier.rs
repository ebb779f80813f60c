// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! `axamm notifier`
//!
//! Waits for the message bus, seeds the default rule and the code taxonomy,
//! then runs the `axnc` dispatcher next to one worker per channel topic.

use anyhow::{Context, Result};
use axamm_core::application::notification_center::{
    ChannelWorker, EventDispatcher, NotificationCenterService, StandardNotificationCenter, DISPATCHER_GROUP,
};
use axamm_core::application::supervisor::Supervisor;
use axamm_core::domain::notification::TOPIC_AXNC;
use axamm_core::infrastructure::axdb::bootstrap::{seed_tables, wait_until_ready, DATABASE_WAIT};
use axamm_core::infrastructure::axdb::schema::notification_tables;
use axamm_core::infrastructure::axdb::{DatabaseClient, HttpDatabaseClient};
use axamm_core::infrastructure::bus::{BusProducer, Consumer, ConsumerConfig, MessageHandler, MessageLog, RedisStreamLog};
use axamm_core::infrastructure::cache::RedisCache;
use axamm_core::infrastructure::repositories::{AxdbCodeRepository, AxdbEventRepository, AxdbRuleRepository};
use clap::Args;
use futures::FutureExt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Args, Debug, Clone)]
pub struct NotifierArgs {
    /// AXDB root URL
    #[arg(long, env = "AXDB_URL", default_value = "http://axdb.axsys:8083/v1")]
    axdb_url: String,

    /// Redis URL of the message log
    #[arg(long, env = "REDIS_URL", default_value = "redis://redis.axsys:6379")]
    redis_url: String,

    /// How long to wait for the message bus before giving up
    #[arg(long, env = "AXNC_BUS_WAIT", default_value = "15m", value_parser = humantime::parse_duration)]
    bus_wait: Duration,

    /// Cluster name used for events that carry none
    #[arg(long, env = "AX_CLUSTER_NAME_ID", default_value = "")]
    cluster_name: String,

    /// External DNS name substituted into event details
    #[arg(long, env = "AXOPS_EXT_DNS", default_value = "")]
    ext_dns: String,

    /// Dispatcher member name within its consumer group
    #[arg(long, env = "HOSTNAME", default_value = "axnc-0")]
    member: String,

    /// Prometheus exporter address
    #[arg(long, env = "AXNC_METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,
}

pub async fn run(args: NotifierArgs, cancel: CancellationToken) -> Result<()> {
    info!("Starting axamm notifier");
    super::init_metrics(args.metrics_addr)?;

    let db: Arc<dyn DatabaseClient> =
        Arc::new(HttpDatabaseClient::new(&args.axdb_url).context("Invalid AXDB URL")?);
    wait_until_ready(db.as_ref(), DATABASE_WAIT)
        .await
        .context("AXDB is not reachable")?;
    seed_tables(db.as_ref(), &notification_tables())
        .await
        .context("Failed to seed notification schemas")?;

    let redis = RedisCache::connect(&args.redis_url)
        .await
        .context("Failed to connect to Redis")?;
    let log: Arc<dyn MessageLog> = Arc::new(RedisStreamLog::new(redis.pool().clone()));
    let producer = BusProducer::connect(log.clone(), args.bus_wait, Some(&cancel))
        .await
        .context("Message bus is not reachable")?;

    let rules = Arc::new(AxdbRuleRepository::new(db.clone()));
    let events = Arc::new(AxdbEventRepository::new(db.clone()));
    let center = StandardNotificationCenter::new(rules.clone(), events.clone(), Arc::new(AxdbCodeRepository::new(db)));
    center
        .seed_defaults()
        .await
        .context("Failed to seed default notification rules")?;

    let dispatcher: Arc<dyn MessageHandler> = Arc::new(
        EventDispatcher::new(rules, events, producer)
            .with_cluster(&args.cluster_name)
            .with_substitution("%%AX_CLUSTER_NAME_ID%%", &args.cluster_name)
            .with_substitution("%%AXOPS_EXT_DNS%%", &args.ext_dns),
    );

    let mut supervisor = Supervisor::new(cancel.clone());
    {
        let log = log.clone();
        let config = ConsumerConfig::new(TOPIC_AXNC, DISPATCHER_GROUP, &args.member);
        supervisor.spawn("axnc-dispatcher", move |c| {
            Consumer::new(log.clone(), config.clone()).run(dispatcher.clone(), c).boxed()
        });
    }
    for worker in ChannelWorker::defaults(log) {
        supervisor.spawn("axnc-channel", move |c| worker.clone().run(c).boxed());
    }

    cancel.cancelled().await;
    info!("Notifier shutting down");
    supervisor.shutdown().await;
    Ok(())
}
