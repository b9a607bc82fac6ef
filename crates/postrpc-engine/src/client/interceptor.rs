//! Request/response interceptor pipeline.
//!
//! Request interceptors run in registration order before the envelope is
//! composed. Response interceptors see every outcome, including timeouts
//! and transport failures; an `on_error` that returns `Ok` recovers.

use std::sync::Arc;

use async_trait::async_trait;

use postrpc_core::error::RequestError;
use postrpc_core::protocol::{Cookies, Headers};

use super::body::{RequestBody, Response};

/// Request as seen by interceptors, before it becomes an envelope.
#[derive(Debug)]
pub struct OutgoingRequest {
    pub path: String,
    pub body: RequestBody,
    pub headers: Headers,
    pub cookies: Cookies,
}

#[async_trait]
pub trait RequestInterceptor: Send + Sync {
    async fn on_request(&self, req: OutgoingRequest) -> Result<OutgoingRequest, RequestError>;
}

#[async_trait]
pub trait ResponseInterceptor: Send + Sync {
    async fn on_response(&self, res: Response) -> Result<Response, RequestError> {
        Ok(res)
    }

    async fn on_error(&self, err: RequestError) -> Result<Response, RequestError> {
        Err(err)
    }
}

pub(crate) async fn run_request_chain(
    chain: &[Arc<dyn RequestInterceptor>],
    mut req: OutgoingRequest,
) -> Result<OutgoingRequest, RequestError> {
    for i in chain {
        req = i.on_request(req).await?;
    }
    Ok(req)
}

pub(crate) async fn run_response_chain(
    chain: &[Arc<dyn ResponseInterceptor>],
    mut outcome: Result<Response, RequestError>,
) -> Result<Response, RequestError> {
    for i in chain {
        outcome = match outcome {
            Ok(res) => i.on_response(res).await,
            Err(err) => i.on_error(err).await,
        };
    }
    outcome
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::client::body::ResponseBody;
    use postrpc_core::error::ErrorCode;
    use serde_json::json;

    struct Stamp;

    #[async_trait]
    impl RequestInterceptor for Stamp {
        async fn on_request(&self, mut req: OutgoingRequest) -> Result<OutgoingRequest, RequestError> {
            req.headers.insert("x-stamp".into(), "1".into());
            Ok(req)
        }
    }

    struct RecoverTimeout;

    #[async_trait]
    impl ResponseInterceptor for RecoverTimeout {
        async fn on_error(&self, err: RequestError) -> Result<Response, RequestError> {
            if err.code != ErrorCode::Timeout {
                return Err(err);
            }
            Ok(Response {
                request_id: err.request_id.unwrap_or_default(),
                path: String::new(),
                status: 200,
                status_text: "OK".into(),
                headers: Headers::new(),
                body: ResponseBody::Data(json!("fallback")),
                responder: None,
            })
        }
    }

    #[tokio::test]
    async fn request_chain_runs_in_order() {
        let chain: Vec<Arc<dyn RequestInterceptor>> = vec![Arc::new(Stamp)];
        let req = OutgoingRequest {
            path: "a".into(),
            body: RequestBody::empty(),
            headers: Headers::new(),
            cookies: Cookies::new(),
        };
        let out = run_request_chain(&chain, req).await.unwrap();
        assert_eq!(out.headers["x-stamp"], "1");
    }

    #[tokio::test]
    async fn error_chain_can_recover() {
        let chain: Vec<Arc<dyn ResponseInterceptor>> = vec![Arc::new(RecoverTimeout)];
        let timeout = RequestError::new(ErrorCode::Timeout, "late").with_request_id("r1");
        let res = run_response_chain(&chain, Err(timeout)).await.unwrap();
        assert_eq!(res.data(), Some(&json!("fallback")));

        let other = RequestError::new(ErrorCode::MethodNotFound, "nope");
        let err = run_response_chain(&chain, Err(other)).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::MethodNotFound);
    }
}
