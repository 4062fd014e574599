use std::sync::Arc;

use async_trait::async_trait;
use axum::{body::Body, http::Request, response::Response};

/// A request handler. The chain passes each request through handlers of this
/// shape until one of them produces the response.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, req: Request<Body>) -> Response;
}

pub type SharedHandler = Arc<dyn Handler>;

/// A middleware takes the next handler of the chain and returns the handler
/// that should run in front of it. Returning a response without invoking the
/// next handler aborts the passage through the chain.
pub trait Middleware: Send + Sync {
    fn wrap(&self, next: SharedHandler) -> SharedHandler;
}

/// Mux composes chained middlewares into a single handler. When a request
/// arrives, it passes in order through each of the chained middlewares.
#[derive(Default)]
pub struct Mux {
    chain: Vec<Box<dyn Middleware>>,
}

impl Mux {
    pub fn new() -> Self {
        Self { chain: Vec::new() }
    }

    /// Appends a middleware to the request handling chain.
    pub fn chain(&mut self, middleware: Box<dyn Middleware>) {
        self.chain.push(middleware);
    }

    /// Composes the chain right-to-left over the terminal endpoint and returns
    /// the resulting handler.
    ///
    /// Panics when fewer than two middlewares are chained; a shorter chain is
    /// a wiring bug, not a runtime condition.
    pub fn into_handler(self) -> SharedHandler {
        assert!(
            self.chain.len() >= 2,
            "mux: at least 2 chained handlers are necessary to use mux"
        );

        let mut handler: SharedHandler = Arc::new(Endpoint);
        for middleware in self.chain.iter().rev() {
            handler = middleware.wrap(handler);
        }
        handler
    }
}

/// The last handler of the chain. Every middleware takes a next handler, so
/// the final one needs something to point at; it intentionally does nothing.
struct Endpoint;

#[async_trait]
impl Handler for Endpoint {
    async fn handle(&self, _req: Request<Body>) -> Response {
        Response::new(Body::empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct Recorder {
        label: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    impl Middleware for Recorder {
        fn wrap(&self, next: SharedHandler) -> SharedHandler {
            Arc::new(RecorderHandler {
                label: self.label,
                log: self.log.clone(),
                next,
            })
        }
    }

    struct RecorderHandler {
        label: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
        next: SharedHandler,
    }

    #[async_trait]
    impl Handler for RecorderHandler {
        async fn handle(&self, req: Request<Body>) -> Response {
            self.log.lock().push(self.label);
            self.next.handle(req).await
        }
    }

    #[tokio::test]
    async fn test_chain_runs_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut mux = Mux::new();
        mux.chain(Box::new(Recorder {
            label: "first",
            log: log.clone(),
        }));
        mux.chain(Box::new(Recorder {
            label: "second",
            log: log.clone(),
        }));

        let handler = mux.into_handler();
        let req = Request::builder().body(Body::empty()).unwrap();
        handler.handle(req).await;

        assert_eq!(*log.lock(), vec!["first", "second"]);
    }

    #[test]
    #[should_panic(expected = "at least 2 chained handlers")]
    fn test_short_chain_panics() {
        let mut mux = Mux::new();
        mux.chain(Box::new(Recorder {
            label: "only",
            log: Arc::new(Mutex::new(Vec::new())),
        }));
        mux.into_handler();
    }
}
