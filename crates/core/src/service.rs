//! The handler-chain boundary between the protocol engines and application
//! code.

use std::sync::Arc;

use crate::catcher;
use crate::handler::{Handler, Outcome};
use crate::http::{header, HeaderValue, StatusCode, StatusError};
use crate::{Error, Request, Response, Result};

/// Hook consulted for handler errors before the default page is rendered.
/// Returning `true` means the hook produced the response itself.
pub type UnhandledErrorHandler =
    Arc<dyn Fn(&Error, &mut Response) -> bool + Send + Sync + 'static>;

/// Ordered application handlers consulted for each request.
#[derive(Default)]
pub struct HandlerChain {
    handlers: Vec<Arc<dyn Handler>>,
    error_hook: Option<UnhandledErrorHandler>,
}

impl HandlerChain {
    /// An empty chain; every request falls through to `404`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a handler to the chain.
    #[must_use]
    pub fn push(mut self, handler: impl Handler) -> Self {
        self.handlers.push(Arc::new(handler));
        self
    }

    /// Installs the unhandled-error hook.
    #[must_use]
    pub fn on_unhandled_error(mut self, hook: UnhandledErrorHandler) -> Self {
        self.error_hook = Some(hook);
        self
    }

    /// Consults the chain in order until one handler claims the exchange.
    ///
    /// A handler that claims async completion and then returns `NotHandled`
    /// violates the contract and fails the exchange.
    pub(crate) async fn dispatch(&self, req: &mut Request, res: &mut Response) -> Result<Outcome> {
        for handler in &self.handlers {
            match handler.handle(req, res).await? {
                Outcome::Handled => return Ok(Outcome::Handled),
                Outcome::NotHandled => {
                    if req.ctx.is_async() {
                        return Err(Error::IllegalHandlerState(
                            "handler returned NotHandled after claiming async completion",
                        ));
                    }
                }
            }
        }
        Ok(Outcome::NotHandled)
    }

    /// Applies the error policy for a failed exchange whose response has not
    /// started. Returns `false` when the connection must simply close.
    pub(crate) fn render_error(&self, error: &Error, res: &mut Response) -> bool {
        if res.is_started() {
            return false;
        }
        if let Error::Redirect(target) = error {
            let ok = res.status_code(StatusCode::MOVED_PERMANENTLY).is_ok();
            if let Ok(location) = HeaderValue::from_str(target) {
                let _ = res.set_header(header::LOCATION, location);
            }
            return ok;
        }
        if let Some(hook) = &self.error_hook {
            if hook(error, res) {
                return true;
            }
        }
        let Some(status) = error.status() else {
            return false;
        };
        let status_error = match error {
            Error::Status(e) => StatusError::from_code(status)
                .unwrap_or_else(StatusError::internal_server_error)
                .detail(e.brief.clone()),
            _ => {
                tracing::error!(%error, "request failed");
                StatusError::from_code(status).unwrap_or_else(StatusError::internal_server_error)
            }
        };
        if res.status_code(status).is_err() {
            return false;
        }
        res.html(catcher::error_page(&status_error));
        true
    }
}

impl std::fmt::Debug for HandlerChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerChain")
            .field("handlers", &self.handlers.len())
            .field("has_error_hook", &self.error_hook.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::http::{HeaderMap, Method};

    struct Declines;
    #[async_trait]
    impl Handler for Declines {
        async fn handle(&self, _req: &mut Request, _res: &mut Response) -> Result<Outcome> {
            Ok(Outcome::NotHandled)
        }
    }

    struct Claims;
    #[async_trait]
    impl Handler for Claims {
        async fn handle(&self, _req: &mut Request, res: &mut Response) -> Result<Outcome> {
            res.text("claimed");
            Ok(Outcome::Handled)
        }
    }

    struct AsyncThenDeclines;
    #[async_trait]
    impl Handler for AsyncThenDeclines {
        async fn handle(&self, req: &mut Request, _res: &mut Response) -> Result<Outcome> {
            let _handle = req.handle_async()?;
            Ok(Outcome::NotHandled)
        }
    }

    fn fresh_res() -> Response {
        let (ops_tx, _ops_rx) = crate::exchange::ops_channel();
        Response::new(crate::exchange::ExchangeCtx::new(
            crate::http::Version::HTTP_11,
            ops_tx,
            tokio_util::sync::CancellationToken::new(),
        ))
    }

    #[tokio::test]
    async fn test_chain_order() {
        let chain = HandlerChain::new().push(Declines).push(Claims);
        let mut req = Request::synthetic(Method::GET, "/", HeaderMap::new());
        let mut res = fresh_res();
        assert_eq!(
            chain.dispatch(&mut req, &mut res).await.expect("dispatch"),
            Outcome::Handled
        );
    }

    #[tokio::test]
    async fn test_all_decline() {
        let chain = HandlerChain::new().push(Declines);
        let mut req = Request::synthetic(Method::GET, "/", HeaderMap::new());
        let mut res = fresh_res();
        assert_eq!(
            chain.dispatch(&mut req, &mut res).await.expect("dispatch"),
            Outcome::NotHandled
        );
    }

    #[tokio::test]
    async fn test_async_claim_then_decline_fails_fast() {
        let chain = HandlerChain::new().push(AsyncThenDeclines).push(Claims);
        let mut req = Request::synthetic(Method::GET, "/", HeaderMap::new());
        let mut res = fresh_res();
        assert!(matches!(
            chain.dispatch(&mut req, &mut res).await,
            Err(Error::IllegalHandlerState(_))
        ));
    }

    #[tokio::test]
    async fn test_error_hook_suppresses_default() {
        let chain = HandlerChain::new().on_unhandled_error(Arc::new(|_error, res| {
            let _ = res.status_code(StatusCode::IM_A_TEAPOT);
            res.text("hooked");
            true
        }));
        let mut res = fresh_res();
        assert!(chain.render_error(&Error::other("boom"), &mut res));
        assert_eq!(res.status(), Some(StatusCode::IM_A_TEAPOT));
    }

    #[tokio::test]
    async fn test_redirect_renders_location() {
        let chain = HandlerChain::new();
        let mut res = fresh_res();
        assert!(chain.render_error(&Error::Redirect("/blah?x=1".to_owned()), &mut res));
        assert_eq!(res.status(), Some(StatusCode::MOVED_PERMANENTLY));
        assert_eq!(
            res.header(header::LOCATION),
            Some(HeaderValue::from_static("/blah?x=1"))
        );
    }
}
