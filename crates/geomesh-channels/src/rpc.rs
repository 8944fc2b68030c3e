//! Static routing table for requests received over a session.
//!
//! Routes are keyed by exact endpoint string and method. The table is built
//! once at startup; registering the same route twice is an error.

use crate::RouterError;
use futures_util::future::BoxFuture;
use geomesh_types::{JsonMap, RpcMethod, RpcRequest, RpcResponse};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

/// One inbound request together with the user whose session carried it.
#[derive(Debug, Clone)]
pub struct RpcCall {
    pub user_id: String,
    pub request: RpcRequest,
}

impl RpcCall {
    /// The request body, or an empty object when absent.
    pub fn body(&self) -> JsonMap {
        self.request.body.clone().unwrap_or_default()
    }

    /// A query parameter, if present.
    pub fn query(&self, key: &str) -> Option<&str> {
        self.request
            .query
            .as_ref()
            .and_then(|q| q.get(key))
            .map(String::as_str)
    }
}

/// Successful handler result.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcOutcome {
    pub status_code: u16,
    pub data: JsonMap,
}

impl RpcOutcome {
    pub fn ok(data: JsonMap) -> Self {
        Self {
            status_code: 200,
            data,
        }
    }

    pub fn created(data: JsonMap) -> Self {
        Self {
            status_code: 201,
            data,
        }
    }
}

/// Handler failure, reported to the caller as an error response.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct RpcError {
    pub status_code: u16,
    pub message: String,
}

impl RpcError {
    pub fn new(status_code: u16, message: impl Into<String>) -> Self {
        Self {
            status_code,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(400, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(404, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(500, message)
    }
}

type Handler = Arc<dyn Fn(RpcCall) -> BoxFuture<'static, Result<RpcOutcome, RpcError>> + Send + Sync>;

/// Immutable endpoint -> method -> handler table.
#[derive(Default)]
pub struct RpcTable {
    routes: HashMap<String, HashMap<RpcMethod, Handler>>,
}

impl RpcTable {
    pub fn builder() -> RpcTableBuilder {
        RpcTableBuilder::default()
    }

    /// Registered `(method, endpoint)` pairs, sorted.
    pub fn routes(&self) -> Vec<(RpcMethod, String)> {
        let mut routes: Vec<_> = self
            .routes
            .iter()
            .flat_map(|(endpoint, methods)| methods.keys().map(|m| (*m, endpoint.clone())))
            .collect();
        routes.sort_by(|a, b| a.1.cmp(&b.1).then(a.0.as_str().cmp(b.0.as_str())));
        routes
    }

    /// Runs the matching handler and builds the correlated response.
    ///
    /// Unknown endpoints yield 404; a known endpoint with an unregistered
    /// method yields 405. Handler errors become error responses.
    pub async fn dispatch(&self, call: RpcCall) -> RpcResponse {
        let request_id = call.request.request_id.clone();
        let Some(methods) = self.routes.get(&call.request.endpoint) else {
            return RpcResponse::failure(
                request_id,
                404,
                format!("endpoint not found: {}", call.request.endpoint),
            );
        };
        let Some(handler) = methods.get(&call.request.method) else {
            return RpcResponse::failure(
                request_id,
                405,
                format!(
                    "method {} not allowed for {}",
                    call.request.method, call.request.endpoint
                ),
            );
        };

        match handler(call).await {
            Ok(outcome) => RpcResponse::success(request_id, outcome.status_code, outcome.data),
            Err(e) => RpcResponse::failure(request_id, e.status_code, e.message),
        }
    }
}

/// Collects routes and rejects duplicates on [`build`](Self::build).
#[derive(Default)]
pub struct RpcTableBuilder {
    routes: Vec<(RpcMethod, String, Handler)>,
}

impl RpcTableBuilder {
    pub fn route<F, Fut>(mut self, method: RpcMethod, endpoint: &str, handler: F) -> Self
    where
        F: Fn(RpcCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<RpcOutcome, RpcError>> + Send + 'static,
    {
        let handler: Handler = Arc::new(
            move |call| -> BoxFuture<'static, Result<RpcOutcome, RpcError>> {
                Box::pin(handler(call))
            },
        );
        self.routes.push((method, endpoint.to_string(), handler));
        self
    }

    pub fn build(self) -> Result<RpcTable, RouterError> {
        let mut table = RpcTable::default();
        for (method, endpoint, handler) in self.routes {
            let methods = table.routes.entry(endpoint.clone()).or_default();
            if methods.insert(method, handler).is_some() {
                return Err(RouterError::DuplicateRoute { method, endpoint });
            }
        }
        Ok(table)
    }
}
