// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! `axamm pod-agent`

use anyhow::{Context, Result};
use axamm_core::infrastructure::pod_proxy::kube::KubeApiClient;
use axamm_core::presentation::pod_agent::{self, PodAgentState, POD_AGENT_PORT};
use axamm_core::presentation::server::{self, load_tls_acceptor};
use clap::Args;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Args, Debug, Clone)]
pub struct PodAgentArgs {
    /// Namespace holding the token secret
    #[arg(long, env = "AX_NAMESPACE", default_value = "axsys")]
    namespace: String,

    /// Secret whose value callers must present
    #[arg(long, env = "POD_AGENT_SECRET", default_value = "axam-pod-agent")]
    secret_name: String,

    /// Key within the secret
    #[arg(long, env = "POD_AGENT_SECRET_KEY", default_value = "token")]
    secret_key: String,

    /// Listener port
    #[arg(long, env = "POD_AGENT_PORT", default_value_t = POD_AGENT_PORT)]
    port: u16,

    /// PEM certificate chain; TLS is enabled when both cert and key are set
    #[arg(long, env = "POD_AGENT_TLS_CERT", requires = "tls_key")]
    tls_cert: Option<PathBuf>,

    /// PEM private key
    #[arg(long, env = "POD_AGENT_TLS_KEY", requires = "tls_cert")]
    tls_key: Option<PathBuf>,
}

pub async fn run(args: PodAgentArgs, cancel: CancellationToken) -> Result<()> {
    let kube = KubeApiClient::in_cluster().context("Failed to configure the apiserver client")?;
    let token = kube
        .read_secret(&args.namespace, &args.secret_name, &args.secret_key)
        .await
        .context("Failed to load the pod agent token")?;
    info!("Loaded pod agent token from {}/{}", args.namespace, args.secret_name);

    let tls = match (&args.tls_cert, &args.tls_key) {
        (Some(cert), Some(key)) => Some(load_tls_acceptor(cert, key).context("Failed to load TLS material")?),
        _ => {
            warn!("No TLS certificate configured, serving plain HTTP");
            None
        }
    };

    let app = pod_agent::router(Arc::new(PodAgentState::new(Arc::new(kube), &token)));
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, args.port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    server::serve(listener, app, tls, cancel)
        .await
        .context("Pod agent server failed")?;
    info!("Pod agent stopped");
    Ok(())
}
