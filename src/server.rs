//! The frontend of the load balancer: listeners accept the connections,
//! terminate TLS when configured, tag each request with its arrival listener
//! and hand it to the handler chain.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{body::Body, extract::ConnectInfo, http::Request};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::error::{Result, StateraError};
use crate::mux::SharedHandler;

/// How long a listener waits for in-flight requests on shutdown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

// TLS registry protocol version identifiers, as used in the configuration.
const TLS_VERSION_1_0: u16 = 0x0301;
const TLS_VERSION_1_2: u16 = 0x0303;
const TLS_VERSION_1_3: u16 = 0x0304;

#[derive(Debug, Clone)]
pub struct CertificatePaths {
    pub cert_file: String,
    pub key_file: String,
}

#[derive(Debug, Clone)]
pub struct TlsSettings {
    pub certs: Vec<CertificatePaths>,
    /// Minimum TLS version. Zero means TLS 1.0.
    pub min_version: u16,
    /// Maximum TLS version. Zero means TLS 1.3.
    pub max_version: u16,
}

/// Request extension carrying the address of the listener through which the
/// request arrived.
#[derive(Debug, Clone)]
pub struct ArrivalListener(pub Arc<str>);

/// Returns the arrival listener address of the request, if tagged.
pub fn arrival_listener(req: &Request<Body>) -> Option<&str> {
    req.extensions()
        .get::<ArrivalListener>()
        .map(|listener| listener.0.as_ref())
}

/// An opened port waiting for connections and requests.
pub struct Listener {
    pub addr: String,
    /// Enables HTTP/2 for this listener. HTTPS needed: without TLS the ALPN
    /// negotiation that selects h2 never happens.
    pub http2: bool,
    pub tls: Option<TlsSettings>,
    handler: SharedHandler,
}

impl Listener {
    pub fn new(
        addr: String,
        http2: bool,
        tls: Option<TlsSettings>,
        handler: SharedHandler,
    ) -> Self {
        Self {
            addr,
            http2,
            tls,
            handler,
        }
    }

    /// Binds the listener address and serves until a shutdown signal arrives,
    /// then drains in-flight connections for up to 30 seconds.
    pub async fn listen_and_serve(&self, shutdown: watch::Receiver<()>) -> Result<()> {
        let tcp = TcpListener::bind(&self.addr).await?;
        self.serve(tcp, shutdown).await
    }

    pub(crate) async fn serve(
        &self,
        tcp: TcpListener,
        mut shutdown: watch::Receiver<()>,
    ) -> Result<()> {
        let acceptor = match &self.tls {
            Some(tls) if !tls.certs.is_empty() => {
                Some(TlsAcceptor::from(build_tls_config(tls, self.http2)?))
            }
            _ => None,
        };

        let tag: Arc<str> = Arc::from(self.addr.as_str());
        let connections = TaskTracker::new();
        info!(
            "listener {} accepting {} connections",
            self.addr,
            if acceptor.is_some() { "TLS" } else { "plain" }
        );

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = tcp.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(err) => {
                            error!("listener {}: accept failed: {}", self.addr, err);
                            continue;
                        }
                    };
                    let handler = self.handler.clone();
                    let tag = tag.clone();
                    let conn_shutdown = shutdown.clone();
                    match acceptor.clone() {
                        Some(acceptor) => {
                            connections.spawn(serve_tls(
                                stream, peer, acceptor, handler, tag, conn_shutdown,
                            ));
                        }
                        None => {
                            connections.spawn(serve_plain(
                                stream, peer, handler, tag, conn_shutdown,
                            ));
                        }
                    }
                }
            }
        }

        // stop accepting, then wait for in-flight requests; connections got
        // their own shutdown signal and disable keep-alive on it
        drop(tcp);
        connections.close();
        info!("listener {} draining connections", self.addr);
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, connections.wait())
            .await
            .is_err()
        {
            warn!(
                "listener {}: shutdown timed out with connections still open",
                self.addr
            );
        }
        Ok(())
    }
}

async fn serve_plain(
    stream: TcpStream,
    peer: SocketAddr,
    handler: SharedHandler,
    tag: Arc<str>,
    mut shutdown: watch::Receiver<()>,
) {
    // tag each request with the arrival listener and the peer address before
    // it enters the handler chain
    let service = service_fn(move |req: Request<Incoming>| {
        let handler = handler.clone();
        let tag = tag.clone();
        async move {
            let mut req = req.map(Body::new);
            req.extensions_mut().insert(ArrivalListener(tag));
            req.extensions_mut().insert(ConnectInfo(peer));
            Ok::<_, std::convert::Infallible>(handler.handle(req).await)
        }
    });
    let conn = hyper::server::conn::http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service);
    tokio::pin!(conn);

    tokio::select! {
        result = conn.as_mut() => {
            if let Err(err) = result {
                debug!("connection from {} ended with error: {}", peer, err);
            }
        }
        _ = shutdown.changed() => {
            conn.as_mut().graceful_shutdown();
            if let Err(err) = conn.as_mut().await {
                debug!("connection from {} ended with error: {}", peer, err);
            }
        }
    }
}

async fn serve_tls(
    stream: TcpStream,
    peer: SocketAddr,
    acceptor: TlsAcceptor,
    handler: SharedHandler,
    tag: Arc<str>,
    mut shutdown: watch::Receiver<()>,
) {
    let tls_stream = match acceptor.accept(stream).await {
        Ok(stream) => stream,
        Err(err) => {
            debug!("TLS handshake with {} failed: {}", peer, err);
            return;
        }
    };

    let service = service_fn(move |req: Request<Incoming>| {
        let handler = handler.clone();
        let tag = tag.clone();
        async move {
            let mut req = req.map(Body::new);
            req.extensions_mut().insert(ArrivalListener(tag));
            req.extensions_mut().insert(ConnectInfo(peer));
            Ok::<_, std::convert::Infallible>(handler.handle(req).await)
        }
    });
    // auto picks HTTP/1.1 or HTTP/2 according to the ALPN outcome
    let builder = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new());
    let conn = builder.serve_connection(TokioIo::new(tls_stream), service);
    tokio::pin!(conn);

    tokio::select! {
        result = conn.as_mut() => {
            if let Err(err) = result {
                debug!("connection from {} ended with error: {}", peer, err);
            }
        }
        _ = shutdown.changed() => {
            conn.as_mut().graceful_shutdown();
            if let Err(err) = conn.as_mut().await {
                debug!("connection from {} ended with error: {}", peer, err);
            }
        }
    }
}

fn build_tls_config(tls: &TlsSettings, http2: bool) -> Result<Arc<rustls::ServerConfig>> {
    let mut certified = Vec::with_capacity(tls.certs.len());
    for paths in &tls.certs {
        certified.push(Arc::new(load_certified_key(paths)?));
    }

    let versions = protocol_versions(tls.min_version, tls.max_version)?;
    let mut config = rustls::ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_protocol_versions(&versions)
    .map_err(|e| StateraError::Tls(e.to_string()))?
    .with_no_client_auth()
    .with_cert_resolver(Arc::new(CertificateStore { certified }));

    config.alpn_protocols = if http2 {
        vec![b"h2".to_vec(), b"http/1.1".to_vec()]
    } else {
        vec![b"http/1.1".to_vec()]
    };
    Ok(Arc::new(config))
}

fn load_certified_key(paths: &CertificatePaths) -> Result<CertifiedKey> {
    let cert_pem = std::fs::read(&paths.cert_file)?;
    let chain: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_pem.as_slice())
        .collect::<std::result::Result<_, _>>()?;
    if chain.is_empty() {
        return Err(StateraError::Tls(format!(
            "no certificate found in {}",
            paths.cert_file
        )));
    }

    let key_pem = std::fs::read(&paths.key_file)?;
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut key_pem.as_slice())?
        .ok_or_else(|| {
            StateraError::Tls(format!("no private key found in {}", paths.key_file))
        })?;
    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
        .map_err(|e| StateraError::Tls(e.to_string()))?;

    Ok(CertifiedKey::new(chain, signing_key))
}

/// Maps the configured TLS version range onto the protocols rustls ships.
/// rustls implements 1.2 and 1.3 only, so floors below 1.2 clamp upward.
fn protocol_versions(
    min: u16,
    max: u16,
) -> Result<Vec<&'static rustls::SupportedProtocolVersion>> {
    let min = if min == 0 { TLS_VERSION_1_0 } else { min };
    let max = if max == 0 { TLS_VERSION_1_3 } else { max };
    if min > max {
        return Err(StateraError::Tls(
            "minimum TLS version above maximum".to_string(),
        ));
    }

    let mut versions = Vec::new();
    if min <= TLS_VERSION_1_2 && max >= TLS_VERSION_1_2 {
        versions.push(&rustls::version::TLS12);
    }
    if max >= TLS_VERSION_1_3 {
        versions.push(&rustls::version::TLS13);
    }
    if versions.is_empty() {
        return Err(StateraError::Tls(
            "configured TLS version range supports no protocol".to_string(),
        ));
    }
    Ok(versions)
}

/// Serves the first configured certificate for every handshake.
#[derive(Debug)]
struct CertificateStore {
    certified: Vec<Arc<CertifiedKey>>,
}

impl ResolvesServerCert for CertificateStore {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.certified.first().cloned()
    }
}
