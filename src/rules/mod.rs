//! The rule engine evaluates the user rules over each request and takes the
//! action of the first matching rule.

pub mod condition;

pub use condition::{Condition, ConditionKind, ConditionOp};

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    response::{IntoResponse, Response},
};
use tokio::sync::RwLock;
use tracing::error;

use crate::config::{ActionConfig, RuleConfig};
use crate::error::{error_response, StateraError};
use crate::mux::{Handler, Middleware, SharedHandler};
use crate::server::arrival_listener;

/// The behaviour taken when a rule is satisfied.
#[derive(Debug, Clone)]
pub enum Action {
    /// Forward the request to this node group.
    Forward { node_group: String },
    /// Refuse the request with a status and message.
    Reject { status_code: u16, message: String },
    /// Redirect the client to this address.
    Redirect { url: String },
    /// The matched rule carries no action.
    None,
}

impl Action {
    /// The wire format carries all three facets side by side; the first
    /// non-empty one wins, checked in field order.
    pub fn from_config(cfg: &ActionConfig) -> Self {
        if !cfg.node_group.is_empty() {
            return Action::Forward {
                node_group: cfg.node_group.clone(),
            };
        }
        if cfg.reject.status_code != 0 {
            return Action::Reject {
                status_code: cfg.reject.status_code,
                message: cfg.reject.message.clone(),
            };
        }
        if !cfg.redirect.is_empty() {
            return Action::Redirect {
                url: cfg.redirect.clone(),
            };
        }
        Action::None
    }
}

/// A prioritized set of conditions and the action taken when they all match.
#[derive(Debug)]
pub struct Rule {
    pub priority: i32,
    /// Address of the listener this rule applies to.
    pub listener: String,
    pub conditions: Vec<Condition>,
    pub action: Action,
}

impl Rule {
    pub fn from_config(cfg: &RuleConfig) -> anyhow::Result<Self> {
        let mut conditions = Vec::with_capacity(cfg.conditions.len());
        for c in &cfg.conditions {
            conditions.push(Condition {
                not: c.not,
                kind: ConditionKind::try_from(c.kind)?,
                key: c.key.clone(),
                op: ConditionOp::try_from(c.operation)?,
                value: c.value.clone(),
            });
        }
        Ok(Self {
            priority: cfg.priority,
            listener: cfg.listener.clone(),
            conditions,
            action: Action::from_config(&cfg.action),
        })
    }
}

/// The annotation left on a forwarded request for the router.
#[derive(Debug, Clone)]
pub struct EvaluationResult {
    pub node_group: String,
}

/// Rule engine: holds the rules, stably sorted by ascending priority, and
/// evaluates each request against them in order.
#[derive(Default)]
pub struct RuleEngine {
    rules: RwLock<Vec<Arc<Rule>>>,
}

impl RuleEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the rule to the engine, keeping the list sorted. Returns a handle
    /// usable with [`delete_rule`](Self::delete_rule).
    pub async fn add_rule(&self, rule: Rule) -> Arc<Rule> {
        let rule = Arc::new(rule);
        let mut rules = self.rules.write().await;
        rules.push(rule.clone());
        rules.sort_by_key(|r| r.priority);
        rule
    }

    /// Removes the rule from the engine.
    pub async fn delete_rule(&self, rule: &Arc<Rule>) {
        let mut rules = self.rules.write().await;
        rules.retain(|r| !Arc::ptr_eq(r, rule));
    }

    /// Evaluates the rules in priority order until a match, returning the
    /// matched rule's action. A rule is satisfied when the request arrived on
    /// its listener and all of its conditions hold.
    async fn evaluate_request(&self, req: &mut Request<Body>) -> Result<Action, StateraError> {
        let arrival = arrival_listener(req).map(str::to_owned);
        let rules = self.rules.read().await;

        for rule in rules.iter() {
            match &arrival {
                Some(tag) if *tag == rule.listener => {}
                _ => continue,
            }

            let mut satisfied = true;
            for cond in &rule.conditions {
                if !condition::evaluate(req, cond).await? {
                    satisfied = false;
                    break;
                }
            }
            if satisfied {
                return Ok(rule.action.clone());
            }
        }

        Ok(Action::Reject {
            status_code: 500,
            message: "no rule was satisfied".to_string(),
        })
    }
}

impl Middleware for Arc<RuleEngine> {
    fn wrap(&self, next: SharedHandler) -> SharedHandler {
        Arc::new(RuleHandler {
            engine: self.clone(),
            next,
        })
    }
}

struct RuleHandler {
    engine: Arc<RuleEngine>,
    next: SharedHandler,
}

#[async_trait]
impl Handler for RuleHandler {
    async fn handle(&self, mut req: Request<Body>) -> Response {
        let action = match self.engine.evaluate_request(&mut req).await {
            Ok(action) => action,
            Err(err) => {
                error!("rule evaluation failed: {}", err);
                return error_response(StatusCode::BAD_GATEWAY, "rule evaluation failed");
            }
        };

        match action {
            Action::Forward { node_group } => {
                req.extensions_mut().insert(EvaluationResult { node_group });
                self.next.handle(req).await
            }
            Action::Reject {
                status_code,
                message,
            } => {
                let status =
                    StatusCode::from_u16(status_code).unwrap_or(StatusCode::BAD_GATEWAY);
                error_response(status, &message)
            }
            Action::Redirect { url } => redirect_response(&url),
            Action::None => {
                error_response(StatusCode::BAD_GATEWAY, "rule matched has no action")
            }
        }
    }
}

fn redirect_response(url: &str) -> Response {
    Response::builder()
        .status(StatusCode::FOUND)
        .header(header::LOCATION, url)
        .body(Body::empty())
        .unwrap_or_else(|e| {
            error!("failed to build redirect response: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::ArrivalListener;
    use http_body_util::BodyExt;

    fn forward_rule(priority: i32, listener: &str, group: &str) -> Rule {
        Rule {
            priority,
            listener: listener.to_string(),
            conditions: Vec::new(),
            action: Action::Forward {
                node_group: group.to_string(),
            },
        }
    }

    fn path_condition(value: &str) -> Condition {
        Condition {
            not: false,
            kind: ConditionKind::Path,
            key: String::new(),
            op: ConditionOp::Equal,
            value: value.to_string(),
        }
    }

    fn tagged_request(listener: &str, uri: &str) -> Request<Body> {
        let mut req = Request::builder().uri(uri).body(Body::empty()).unwrap();
        req.extensions_mut()
            .insert(ArrivalListener(Arc::from(listener)));
        req
    }

    /// Next handler that echoes the evaluation result left on the request.
    struct EchoGroup;

    #[async_trait]
    impl Handler for EchoGroup {
        async fn handle(&self, req: Request<Body>) -> Response {
            let group = req
                .extensions()
                .get::<EvaluationResult>()
                .map(|e| e.node_group.clone())
                .unwrap_or_default();
            Response::new(Body::from(group))
        }
    }

    async fn body_string(response: Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_no_rule_satisfied_is_500() {
        let engine = RuleEngine::new();
        let mut req = tagged_request("host:80", "/");
        let action = engine.evaluate_request(&mut req).await.unwrap();
        match action {
            Action::Reject {
                status_code,
                message,
            } => {
                assert_eq!(status_code, 500);
                assert_eq!(message, "no rule was satisfied");
            }
            other => panic!("unexpected action {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rules_match_in_priority_order() {
        let engine = RuleEngine::new();
        engine.add_rule(forward_rule(20, "host:80", "late")).await;
        engine.add_rule(forward_rule(10, "host:80", "early")).await;

        let mut req = tagged_request("host:80", "/");
        let action = engine.evaluate_request(&mut req).await.unwrap();
        match action {
            Action::Forward { node_group } => assert_eq!(node_group, "early"),
            other => panic!("unexpected action {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_equal_priority_keeps_insertion_order() {
        let engine = RuleEngine::new();
        engine.add_rule(forward_rule(5, "host:80", "first")).await;
        engine.add_rule(forward_rule(5, "host:80", "second")).await;
        engine.add_rule(forward_rule(5, "host:80", "third")).await;

        let mut req = tagged_request("host:80", "/");
        let action = engine.evaluate_request(&mut req).await.unwrap();
        match action {
            Action::Forward { node_group } => assert_eq!(node_group, "first"),
            other => panic!("unexpected action {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_listener_filter() {
        let engine = RuleEngine::new();
        let mut rule = forward_rule(1, "host:81", "web");
        rule.conditions.push(path_condition("/x"));
        engine.add_rule(rule).await;

        // same path, wrong listener: falls through to the synthetic reject
        let mut req = tagged_request("host:80", "/x");
        assert!(matches!(
            engine.evaluate_request(&mut req).await.unwrap(),
            Action::Reject { status_code: 500, .. }
        ));

        let mut req = tagged_request("host:81", "/x");
        assert!(matches!(
            engine.evaluate_request(&mut req).await.unwrap(),
            Action::Forward { .. }
        ));
    }

    #[tokio::test]
    async fn test_conditions_short_circuit_on_first_false() {
        let engine = RuleEngine::new();
        let mut rule = forward_rule(1, "host:80", "web");
        rule.conditions.push(path_condition("/nope"));
        // invalid regex after a false condition must never be reached
        rule.conditions.push(Condition {
            not: false,
            kind: ConditionKind::Path,
            key: String::new(),
            op: ConditionOp::Regex,
            value: "(".to_string(),
        });
        engine.add_rule(rule).await;

        let mut req = tagged_request("host:80", "/other");
        assert!(engine.evaluate_request(&mut req).await.is_ok());
    }

    #[tokio::test]
    async fn test_delete_rule() {
        let engine = RuleEngine::new();
        let handle = engine.add_rule(forward_rule(1, "host:80", "web")).await;
        engine.delete_rule(&handle).await;

        let mut req = tagged_request("host:80", "/");
        assert!(matches!(
            engine.evaluate_request(&mut req).await.unwrap(),
            Action::Reject { status_code: 500, .. }
        ));
    }

    #[tokio::test]
    async fn test_handler_forward_annotates_request() {
        let engine = Arc::new(RuleEngine::new());
        engine.add_rule(forward_rule(1, "host:80", "web")).await;

        let handler = engine.wrap(Arc::new(EchoGroup));
        let response = handler.handle(tagged_request("host:80", "/")).await;
        assert_eq!(body_string(response).await, "web");
    }

    #[tokio::test]
    async fn test_handler_reject() {
        let engine = Arc::new(RuleEngine::new());
        let mut rule = forward_rule(1, "host:80", "");
        rule.action = Action::Reject {
            status_code: 403,
            message: "nope".to_string(),
        };
        engine.add_rule(rule).await;

        let handler = engine.wrap(Arc::new(EchoGroup));
        let response = handler.handle(tagged_request("host:80", "/")).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert!(body_string(response).await.contains("nope"));
    }

    #[tokio::test]
    async fn test_handler_redirect() {
        let engine = Arc::new(RuleEngine::new());
        let mut rule = forward_rule(1, "host:80", "");
        rule.action = Action::Redirect {
            url: "https://example.com/".to_string(),
        };
        engine.add_rule(rule).await;

        let handler = engine.wrap(Arc::new(EchoGroup));
        let response = handler.handle(tagged_request("host:80", "/")).await;
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.headers()[header::LOCATION], "https://example.com/");
    }

    #[tokio::test]
    async fn test_handler_actionless_match_is_502() {
        let engine = Arc::new(RuleEngine::new());
        let mut rule = forward_rule(1, "host:80", "");
        rule.action = Action::None;
        engine.add_rule(rule).await;

        let handler = engine.wrap(Arc::new(EchoGroup));
        let response = handler.handle(tagged_request("host:80", "/")).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert!(body_string(response).await.contains("rule matched has no action"));
    }

    #[tokio::test]
    async fn test_handler_evaluation_error_is_502() {
        let engine = Arc::new(RuleEngine::new());
        let mut rule = forward_rule(1, "host:80", "web");
        rule.conditions.push(Condition {
            not: false,
            kind: ConditionKind::Path,
            key: String::new(),
            op: ConditionOp::Regex,
            value: "(".to_string(),
        });
        engine.add_rule(rule).await;

        let handler = engine.wrap(Arc::new(EchoGroup));
        let response = handler.handle(tagged_request("host:80", "/")).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert!(body_string(response).await.contains("rule evaluation failed"));
    }

    #[tokio::test]
    async fn test_action_from_config_checks_facets_in_order() {
        let cfg = ActionConfig {
            node_group: "web".to_string(),
            reject: crate::config::RejectConfig {
                status_code: 403,
                message: "x".to_string(),
            },
            redirect: "https://example.com/".to_string(),
        };
        assert!(matches!(Action::from_config(&cfg), Action::Forward { .. }));

        let cfg = ActionConfig {
            node_group: String::new(),
            reject: crate::config::RejectConfig {
                status_code: 403,
                message: "x".to_string(),
            },
            redirect: "https://example.com/".to_string(),
        };
        assert!(matches!(Action::from_config(&cfg), Action::Reject { .. }));

        let cfg = ActionConfig {
            node_group: String::new(),
            reject: crate::config::RejectConfig::default(),
            redirect: "https://example.com/".to_string(),
        };
        assert!(matches!(Action::from_config(&cfg), Action::Redirect { .. }));

        let cfg = ActionConfig::default();
        assert!(matches!(Action::from_config(&cfg), Action::None));
    }
}
