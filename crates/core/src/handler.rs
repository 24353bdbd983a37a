//! Handler contract and the route helper.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use percent_encoding::percent_decode_str;
use regex::Regex;

use crate::http::{Method, Request, Response};
use crate::{Error, Result};

/// What a handler did with the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The handler claimed the exchange; no further handlers run.
    Handled,
    /// The handler declined; the next handler in the chain is consulted.
    NotHandled,
}

/// A unit of application logic consulted for each request.
///
/// Handlers run on the application executor and may await freely. For
/// CPU-heavy or genuinely blocking work, wrap the logic with
/// [`blocking`].
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Handles one request.
    async fn handle(&self, req: &mut Request, res: &mut Response) -> Result<Outcome>;
}

#[async_trait]
impl Handler for Arc<dyn Handler> {
    async fn handle(&self, req: &mut Request, res: &mut Response) -> Result<Outcome> {
        (**self).handle(req, res).await
    }
}

/// Adapts a borrowing async function into a [`Handler`].
///
/// ```ignore
/// fn hello<'a>(
///     _req: &'a mut Request,
///     res: &'a mut Response,
/// ) -> BoxFuture<'a, Result<Outcome>> {
///     Box::pin(async move {
///         res.write("hello").await?;
///         Ok(Outcome::Handled)
///     })
/// }
/// let handler = handler_fn(hello);
/// ```
pub fn handler_fn<F>(f: F) -> FnHandler<F>
where
    F: for<'a> Fn(&'a mut Request, &'a mut Response) -> BoxFuture<'a, Result<Outcome>>
        + Send
        + Sync
        + 'static,
{
    FnHandler(f)
}

/// See [`handler_fn`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F> Handler for FnHandler<F>
where
    F: for<'a> Fn(&'a mut Request, &'a mut Response) -> BoxFuture<'a, Result<Outcome>>
        + Send
        + Sync
        + 'static,
{
    async fn handle(&self, req: &mut Request, res: &mut Response) -> Result<Outcome> {
        (self.0)(req, res).await
    }
}

/// Adapts a blocking closure into a [`Handler`].
///
/// The closure runs with the worker marked as blocking, so synchronous
/// application logic does not stall other connections. Returning `true`
/// claims the exchange.
pub fn blocking<F>(f: F) -> BlockingHandler<F>
where
    F: Fn(&mut Request, &mut Response) -> Result<bool> + Send + Sync + 'static,
{
    BlockingHandler(f)
}

/// See [`blocking`].
pub struct BlockingHandler<F>(F);

#[async_trait]
impl<F> Handler for BlockingHandler<F>
where
    F: Fn(&mut Request, &mut Response) -> Result<bool> + Send + Sync + 'static,
{
    async fn handle(&self, req: &mut Request, res: &mut Response) -> Result<Outcome> {
        let claimed = tokio::task::block_in_place(|| (self.0)(req, res))?;
        Ok(if claimed {
            Outcome::Handled
        } else {
            Outcome::NotHandled
        })
    }
}

#[derive(Debug)]
enum Segment {
    Literal(String),
    Param { name: String, pattern: Option<Regex> },
}

/// A URI-template routed handler.
///
/// Templates are `/` separated; a segment of the form `{name}` captures
/// anything, `{name: regex}` captures when the regex matches the whole
/// segment. Captures are URL-decoded. Matrix parameters (`;k=v`) on incoming
/// segments are ignored for matching. Trailing slashes are lenient: `/blah/`
/// matches a `/blah` template.
pub struct Route {
    method: Option<Method>,
    segments: Vec<Segment>,
    inner: Arc<dyn Handler>,
}

impl Route {
    /// Builds a route. An invalid `{name: regex}` pattern is an error.
    pub fn new(
        method: impl Into<Option<Method>>,
        template: &str,
        handler: impl Handler,
    ) -> Result<Self> {
        let mut segments = Vec::new();
        for part in template.split('/').filter(|p| !p.is_empty()) {
            if part.starts_with('{') && part.ends_with('}') {
                let body = &part[1..part.len() - 1];
                let (name, pattern) = match body.split_once(':') {
                    Some((name, regex)) => {
                        let regex = Regex::new(&format!("^(?:{})$", regex.trim()))
                            .map_err(Error::other)?;
                        (name.trim().to_owned(), Some(regex))
                    }
                    None => (body.trim().to_owned(), None),
                };
                if name.is_empty() {
                    return Err(Error::other("route template capture without a name"));
                }
                segments.push(Segment::Param { name, pattern });
            } else {
                segments.push(Segment::Literal(part.to_owned()));
            }
        }
        Ok(Self {
            method: method.into(),
            segments,
            inner: Arc::new(handler),
        })
    }

    fn matches(&self, path: &str) -> Option<Vec<(String, String)>> {
        let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
        if parts.len() != self.segments.len() {
            return None;
        }
        let mut params = Vec::new();
        for (segment, part) in self.segments.iter().zip(&parts) {
            // Matrix parameters do not take part in matching.
            let bare = part.split(';').next().unwrap_or("");
            match segment {
                Segment::Literal(lit) => {
                    if lit != bare {
                        return None;
                    }
                }
                Segment::Param { name, pattern } => {
                    if let Some(pattern) = pattern {
                        if !pattern.is_match(bare) {
                            return None;
                        }
                    }
                    let decoded = percent_decode_str(bare).decode_utf8_lossy().into_owned();
                    params.push((name.clone(), decoded));
                }
            }
        }
        Some(params)
    }
}

#[async_trait]
impl Handler for Route {
    async fn handle(&self, req: &mut Request, res: &mut Response) -> Result<Outcome> {
        if let Some(method) = &self.method {
            // HEAD rides the GET route so the two stay consistent.
            let effective = if *req.method() == Method::HEAD && *method == Method::GET {
                Method::GET
            } else {
                req.method().clone()
            };
            if effective != *method {
                return Ok(Outcome::NotHandled);
            }
        }
        let Some(params) = self.matches(req.path()) else {
            return Ok(Outcome::NotHandled);
        };
        for (name, value) in params {
            req.params.insert(name, value);
        }
        self.inner.handle(req, res).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::HeaderMap;

    fn nop<'a>(
        _req: &'a mut Request,
        _res: &'a mut Response,
    ) -> BoxFuture<'a, Result<Outcome>> {
        Box::pin(async move { Ok(Outcome::Handled) })
    }

    fn get(path: &str) -> Request {
        Request::synthetic(Method::GET, path, HeaderMap::new())
    }

    #[test]
    fn test_template_matching() {
        let route = Route::new(Method::GET, "/users/{id}/posts", handler_fn(nop)).expect("route");
        assert!(route.matches("/users/42/posts").is_some());
        assert!(route.matches("/users/42/posts/").is_some(), "lenient trailing slash");
        assert!(route.matches("/users/42").is_none());
        assert!(route.matches("/groups/42/posts").is_none());
        let params = route.matches("/users/jo%20na/posts").expect("match");
        assert_eq!(params, vec![("id".to_owned(), "jo na".to_owned())]);
    }

    #[test]
    fn test_regex_capture() {
        let route =
            Route::new(Method::GET, "/items/{id: [0-9]+}", handler_fn(nop)).expect("route");
        assert!(route.matches("/items/123").is_some());
        assert!(route.matches("/items/abc").is_none());
        assert!(Route::new(Method::GET, "/x/{bad: [}", handler_fn(nop)).is_err());
    }

    #[test]
    fn test_matrix_params_ignored_for_matching() {
        let route = Route::new(Method::GET, "/cars/{make}", handler_fn(nop)).expect("route");
        let params = route.matches("/cars/tesla;color=red").expect("match");
        assert_eq!(params, vec![("make".to_owned(), "tesla".to_owned())]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_method_filter_and_params() {
        struct Echo;
        #[async_trait]
        impl Handler for Echo {
            async fn handle(&self, req: &mut Request, _res: &mut Response) -> Result<Outcome> {
                assert_eq!(req.param("id"), Some("7"));
                Ok(Outcome::Handled)
            }
        }
        let route = Route::new(Method::GET, "/users/{id}", Echo).expect("route");

        let mut req = get("/users/7");
        let (ops_tx, _ops_rx) = crate::exchange::ops_channel();
        let ctx = crate::exchange::ExchangeCtx::new(
            crate::http::Version::HTTP_11,
            ops_tx,
            tokio_util::sync::CancellationToken::new(),
        );
        let mut res = Response::new(ctx);
        assert_eq!(route.handle(&mut req, &mut res).await.expect("handle"), Outcome::Handled);

        let mut req = Request::synthetic(Method::POST, "/users/7", HeaderMap::new());
        assert_eq!(
            route.handle(&mut req, &mut res).await.expect("handle"),
            Outcome::NotHandled
        );

        // HEAD matches the GET route.
        let mut req = Request::synthetic(Method::HEAD, "/users/7", HeaderMap::new());
        assert_eq!(route.handle(&mut req, &mut res).await.expect("handle"), Outcome::Handled);
    }
}
