// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Listener loops shared by the manager API and the pod agent.
//!
//! Plain HTTP goes through `axum::serve`; TLS connections are accepted with
//! `tokio-rustls` and served by `hyper-util`'s auto (HTTP/1 + HTTP/2)
//! builder. Both stop accepting when the token is cancelled.

use crate::domain::error::{codes, AxError, AxResult};
use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use hyper_util::service::TowerToHyperService;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Build an acceptor from PEM certificate chain and private key files.
pub fn load_tls_acceptor(cert_path: &Path, key_path: &Path) -> AxResult<TlsAcceptor> {
    let open = |path: &Path| {
        std::fs::File::open(path)
            .map(BufReader::new)
            .map_err(|e| AxError::from_cause(e, codes::ERR_INTERNAL, format!("Failed to open {}", path.display())))
    };
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut open(cert_path)?)
        .collect::<Result<_, _>>()
        .map_err(|e| AxError::from_cause(e, codes::ERR_INTERNAL, "Invalid TLS certificate"))?;
    if certs.is_empty() {
        return Err(AxError::internal(format!("No certificate in {}", cert_path.display())));
    }
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut open(key_path)?)
        .map_err(|e| AxError::from_cause(e, codes::ERR_INTERNAL, "Invalid TLS key"))?
        .ok_or_else(|| AxError::internal(format!("No private key in {}", key_path.display())))?;

    let config = ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| AxError::from_cause(e, codes::ERR_INTERNAL, "Unsupported TLS protocol set"))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| AxError::from_cause(e, codes::ERR_INTERNAL, "TLS certificate and key do not match"))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Serve `app` on `listener` until `cancel` fires.
pub async fn serve(
    listener: TcpListener,
    app: Router,
    tls: Option<TlsAcceptor>,
    cancel: CancellationToken,
) -> AxResult<()> {
    let addr = listener
        .local_addr()
        .map_err(|e| AxError::from_cause(e, codes::ERR_INTERNAL, "Listener has no address"))?;
    match tls {
        None => {
            info!("Listening on http://{}", addr);
            axum::serve(listener, app)
                .with_graceful_shutdown(cancel.cancelled_owned())
                .await
                .map_err(|e| AxError::from_cause(e, codes::ERR_INTERNAL, "HTTP server failed"))
        }
        Some(acceptor) => {
            info!("Listening on https://{}", addr);
            serve_tls(listener, app, acceptor, cancel).await;
            Ok(())
        }
    }
}

async fn serve_tls(listener: TcpListener, app: Router, acceptor: TlsAcceptor, cancel: CancellationToken) {
    loop {
        let (tcp, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                    continue;
                }
            },
        };
        let acceptor = acceptor.clone();
        let app = app.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let stream = match acceptor.accept(tcp).await {
                Ok(stream) => stream,
                Err(e) => {
                    debug!("TLS handshake with {} failed: {}", peer, e);
                    return;
                }
            };
            let service = TowerToHyperService::new(app);
            let builder = Builder::new(TokioExecutor::new());
            let conn = builder.serve_connection_with_upgrades(TokioIo::new(stream), service);
            tokio::pin!(conn);
            tokio::select! {
                result = conn.as_mut() => {
                    if let Err(e) = result {
                        debug!("Connection with {} ended: {}", peer, e);
                    }
                }
                _ = cancel.cancelled() => {
                    conn.as_mut().graceful_shutdown();
                    let _ = conn.await;
                }
            }
        });
    }
    info!("TLS listener stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_missing_certificate_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("tls.crt");
        let key = dir.path().join("tls.key");
        std::fs::File::create(&cert).unwrap().write_all(b"not a pem").unwrap();
        std::fs::File::create(&key).unwrap();

        let err = load_tls_acceptor(&cert, &key).err().expect("expected TLS load error");
        assert!(err.message().contains("No certificate"));
        assert!(load_tls_acceptor(&dir.path().join("absent"), &key).is_err());
    }

    #[tokio::test]
    async fn test_plain_server_stops_on_cancel() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(serve(listener, Router::new(), None, cancel.clone()));
        cancel.cancel();
        task.await.unwrap().unwrap();
    }
}
