//! Node groups and the router: owns the backend pools and forwards evaluated
//! requests to the node picked by the group balancer.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use axum::{
    body::Body,
    http::{HeaderName, Request},
    response::{IntoResponse, Response},
};
use futures_util::StreamExt;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::load_balancer::{
    Balancer, LeastConnections, RoundRobin, Selection, WeightedRoundRobin,
};
use crate::config::NodeGroupConfig;
use crate::error::{Result, StateraError};
use crate::health;
use crate::mux::{Handler, Middleware, SharedHandler};
use crate::rules::EvaluationResult;

// Outbound connection pool tuning. The pool is shared by every node of one
// group, so the idle caps are sized for fan-out.
const DIAL_TIMEOUT: Duration = Duration::from_secs(15);
const IDLE_CONN_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_IDLE_CONNS_PER_HOST: usize = 1000;

/// Identifies a node within its group by host and port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeKey {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// One backend server of a node group.
pub struct Node {
    pub key: NodeKey,
    /// Used by balancing algorithms that demand a weight.
    pub weight: u32,
    pub(crate) state: Mutex<NodeState>,
}

#[derive(Default)]
pub(crate) struct NodeState {
    pub(crate) healthy: bool,
    pub(crate) probe: Option<JoinHandle<()>>,
}

impl Node {
    pub fn new(key: NodeKey, weight: u32) -> Arc<Self> {
        Arc::new(Self {
            key,
            weight,
            state: Mutex::new(NodeState::default()),
        })
    }
}

/// Health check settings of a node group.
#[derive(Debug, Clone)]
pub struct HealthCheckSettings {
    pub path: String,
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for HealthCheckSettings {
    fn default() -> Self {
        Self {
            path: "/".to_string(),
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(3),
        }
    }
}

/// A named pool of nodes balanced together, with the HTTP client used to
/// reach them.
pub struct NodeGroup {
    pub name: String,
    /// Connections to this group use HTTPS.
    pub https: bool,
    pub health_check: HealthCheckSettings,
    pub(crate) balancer: Arc<dyn Balancer>,
    pub(crate) nodes: RwLock<HashMap<NodeKey, Arc<Node>>>,
    pub(crate) client: reqwest::Client,
    /// Handle to this group for the probe tasks; weak, so the probes never
    /// keep a dropped group alive.
    weak: Weak<NodeGroup>,
}

impl NodeGroup {
    pub fn new(
        name: String,
        https: bool,
        algorithm: &str,
        health_check: HealthCheckSettings,
    ) -> anyhow::Result<Arc<Self>> {
        let balancer: Arc<dyn Balancer> = match algorithm {
            "rr" => Arc::new(RoundRobin::new()),
            "wrr" => Arc::new(WeightedRoundRobin::new()),
            "lc" => Arc::new(LeastConnections::new()),
            other => anyhow::bail!("invalid load balancing algorithm {}", other),
        };

        let client = reqwest::Client::builder()
            .connect_timeout(DIAL_TIMEOUT)
            .pool_idle_timeout(IDLE_CONN_TIMEOUT)
            .pool_max_idle_per_host(MAX_IDLE_CONNS_PER_HOST)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .with_context(|| format!("failed to create HTTP client for node group {}", name))?;

        Ok(Arc::new_cyclic(|weak| Self {
            name,
            https,
            health_check,
            balancer,
            nodes: RwLock::new(HashMap::new()),
            client,
            weak: weak.clone(),
        }))
    }

    pub fn from_config(cfg: &NodeGroupConfig) -> anyhow::Result<Arc<Self>> {
        let health_check = cfg.health_check.normalized();
        let group = Self::new(
            cfg.name.clone(),
            cfg.https,
            &cfg.algorithm,
            HealthCheckSettings {
                path: health_check.path,
                interval: Duration::from_secs(health_check.interval),
                timeout: Duration::from_secs(health_check.timeout),
            },
        )?;

        for node in &cfg.nodes {
            group.add_node(Node::new(
                NodeKey {
                    host: node.host.clone(),
                    port: node.port,
                },
                node.weight,
            ));
        }
        info!(
            "configured node group {} with {} nodes",
            group.name,
            cfg.nodes.len()
        );
        Ok(group)
    }

    /// Adds the node to the group and starts its health checker. The node
    /// stays out of the balancer until its first successful probe.
    pub fn add_node(&self, node: Arc<Node>) {
        let mut nodes = self.nodes.write();
        nodes.insert(node.key.clone(), node.clone());

        let mut state = node.state.lock();
        if state.probe.is_none() {
            state.probe = Some(health::spawn_probe(self.weak.clone(), node.clone()));
        }
    }

    /// Removes the node from the group: stops its health checker and detaches
    /// it from the balancer. Requests already in flight are not canceled.
    pub fn delete_node(&self, key: &NodeKey) {
        let mut nodes = self.nodes.write();
        let Some(node) = nodes.remove(key) else {
            return;
        };
        let mut state = node.state.lock();
        if let Some(probe) = state.probe.take() {
            probe.abort();
        }
        self.balancer.remove_node(key);
    }

    /// Executes a single HTTP request against a node selected by the group
    /// balancer, streaming both bodies.
    pub(crate) async fn round_trip(&self, req: Request<Body>) -> Result<Response> {
        let Some(Selection { node, flight }) = self.balancer.balance() else {
            return Err(StateraError::NoNodeAvailable);
        };

        let scheme = if self.https { "https" } else { "http" };
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let url = format!("{}://{}{}", scheme, node.key, path_and_query);
        debug!("forwarding request to {}", url);

        let (parts, body) = req.into_parts();
        let mut outbound = self.client.request(parts.method, url);
        for (name, value) in parts.headers.iter() {
            if !is_hop_by_hop(name) {
                outbound = outbound.header(name, value);
            }
        }
        let backend = outbound
            .body(reqwest::Body::wrap_stream(body.into_data_stream()))
            .send()
            .await?;

        let mut response = Response::builder().status(backend.status());
        for (name, value) in backend.headers().iter() {
            if !is_hop_by_hop(name) {
                response = response.header(name, value);
            }
        }

        // the flight guard rides the response stream: dropping the stream,
        // whether on completion or client disconnect, ends the dispatch
        let stream = backend.bytes_stream().map(move |chunk| {
            let _flight = &flight;
            chunk
        });
        response
            .body(Body::from_stream(stream))
            .map_err(|e| StateraError::Internal(e.to_string()))
    }
}

/// Hop-by-hop headers are consumed by each hop and must not be forwarded.
fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Routes evaluated requests to their node group.
pub struct Router {
    groups: HashMap<String, Arc<NodeGroup>>,
}

impl Router {
    pub fn new(groups: Vec<Arc<NodeGroup>>) -> Arc<Self> {
        let groups = groups
            .into_iter()
            .map(|group| (group.name.clone(), group))
            .collect();
        Arc::new(Self { groups })
    }

    pub fn group(&self, name: &str) -> Option<&Arc<NodeGroup>> {
        self.groups.get(name)
    }
}

impl Middleware for Arc<Router> {
    fn wrap(&self, _next: SharedHandler) -> SharedHandler {
        Arc::new(RouterHandler {
            router: self.clone(),
        })
    }
}

struct RouterHandler {
    router: Arc<Router>,
}

#[async_trait]
impl Handler for RouterHandler {
    async fn handle(&self, req: Request<Body>) -> Response {
        let Some(result) = req.extensions().get::<EvaluationResult>().cloned() else {
            let err = StateraError::MissingEvaluation;
            error!("{}", err);
            return err.into_response();
        };

        let Some(group) = self.router.group(&result.node_group) else {
            let err = StateraError::UnknownNodeGroup(result.node_group);
            error!("{}", err);
            return err.into_response();
        };

        match group.round_trip(req).await {
            Ok(response) => response,
            Err(err) => {
                error!("forwarding to node group {} failed: {}", group.name, err);
                err.into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use http_body_util::BodyExt;
    use hyper::body::Incoming;
    use hyper::service::service_fn;
    use hyper_util::rt::TokioIo;
    use std::convert::Infallible;

    /// Backend that echoes method, path+query, one request header and the
    /// request body, and sets a marker response header.
    async fn spawn_echo_backend() -> std::net::SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let service = service_fn(|req: hyper::Request<Incoming>| async move {
                        let method = req.method().clone();
                        let uri = req.uri().clone();
                        let tenant = req
                            .headers()
                            .get("x-tenant")
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or("-")
                            .to_string();
                        let body = req.into_body().collect().await.unwrap().to_bytes();
                        let reply = format!(
                            "{} {} {} {}",
                            method,
                            uri,
                            tenant,
                            String::from_utf8_lossy(&body)
                        );
                        Ok::<_, Infallible>(
                            hyper::Response::builder()
                                .header("x-backend", "echo")
                                .body(Body::from(reply))
                                .unwrap(),
                        )
                    });
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });
        addr
    }

    fn test_group() -> Arc<NodeGroup> {
        NodeGroup::new(
            "backend".to_string(),
            false,
            "rr",
            HealthCheckSettings::default(),
        )
        .unwrap()
    }

    async fn body_string(response: Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_round_trip_forwards_request_and_response() {
        let addr = spawn_echo_backend().await;
        let group = test_group();
        group.balancer.add_node(Node::new(
            NodeKey {
                host: addr.ip().to_string(),
                port: addr.port(),
            },
            1,
        ));

        let req = Request::builder()
            .method("POST")
            .uri("/submit?kind=form")
            .header("x-tenant", "acme")
            .body(Body::from("payload"))
            .unwrap();

        let response = group.round_trip(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-backend"], "echo");
        assert_eq!(
            body_string(response).await,
            "POST /submit?kind=form acme payload"
        );
    }

    #[tokio::test]
    async fn test_round_trip_without_nodes_fails() {
        let group = test_group();
        let req = Request::builder().uri("/").body(Body::empty()).unwrap();
        assert!(matches!(
            group.round_trip(req).await,
            Err(StateraError::NoNodeAvailable)
        ));
    }

    #[tokio::test]
    async fn test_router_missing_evaluation_is_500() {
        let router = Router::new(Vec::new());
        let handler = router.wrap(Arc::new(NoopNext));

        let req = Request::builder().uri("/").body(Body::empty()).unwrap();
        let response = handler.handle(req).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            body_string(response).await,
            "<html><body><h1>There was a problem</h1><h3></h3></body></html>"
        );
    }

    #[tokio::test]
    async fn test_router_unknown_group_is_500() {
        let router = Router::new(Vec::new());
        let handler = router.wrap(Arc::new(NoopNext));

        let mut req = Request::builder().uri("/").body(Body::empty()).unwrap();
        req.extensions_mut().insert(EvaluationResult {
            node_group: "ghost".to_string(),
        });
        let response = handler.handle(req).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_router_empty_pool_is_502() {
        let router = Router::new(vec![test_group()]);
        let handler = router.wrap(Arc::new(NoopNext));

        let mut req = Request::builder().uri("/").body(Body::empty()).unwrap();
        req.extensions_mut().insert(EvaluationResult {
            node_group: "backend".to_string(),
        });
        let response = handler.handle(req).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert!(body_string(response).await.contains("bad gateway"));
    }

    struct NoopNext;

    #[async_trait]
    impl Handler for NoopNext {
        async fn handle(&self, _req: Request<Body>) -> Response {
            Response::new(Body::empty())
        }
    }
}
