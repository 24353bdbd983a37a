//! Rampart core: an embeddable HTTP/1.1 and HTTP/2 server with its own wire
//! protocol engine.
//!
//! The crate owns the whole path from accepted socket to application
//! callback: the incremental HTTP/1.1 parser and serializer, the HTTP/2
//! frame multiplexer with per-stream flow control, TLS via rustls with ALPN
//! dispatch, per-request exchange lifecycle with backpressure and timeouts,
//! and graceful shutdown.
//!
//! ```no_run
//! use rampart_core::conf::ServerConfig;
//! use rampart_core::prelude::*;
//!
//! fn hello<'a>(
//!     _req: &'a mut Request,
//!     res: &'a mut Response,
//! ) -> futures_util::future::BoxFuture<'a, rampart_core::Result<Outcome>> {
//!     Box::pin(async move {
//!         res.write("hello world").await?;
//!         Ok(Outcome::Handled)
//!     })
//! }
//!
//! #[tokio::main]
//! async fn main() -> rampart_core::Result<()> {
//!     let chain = HandlerChain::new().push(handler_fn(hello));
//!     Server::new(ServerConfig::new().http_port(8080), chain).serve().await
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(unsafe_code)]

macro_rules! cfg_feature {
    (
        #![$meta:meta]
        $($item:item)*
    ) => {
        $(
            #[cfg($meta)]
            #[cfg_attr(docsrs, doc(cfg($meta)))]
            $item
        )*
    }
}

pub mod buffer;
pub mod catcher;
pub mod conf;
pub mod conn;
mod error;
mod exchange;
mod fuse;
pub mod handler;
pub mod http;
pub mod proto;
mod server;
pub mod service;
pub mod stats;

pub use error::{BoxedError, Error, TimeoutCause};
pub use exchange::{AsyncHandle, ExchangeState};
pub use handler::{blocking, handler_fn, Handler, Outcome, Route};
pub use self::http::{Request, Response};
pub use server::{Server, ServerHandle};
pub use service::HandlerChain;

/// Result type alias with this crate's [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// A list of things that every application handler needs.
pub mod prelude {
    pub use crate::conf::ServerConfig;
    pub use crate::handler::{blocking, handler_fn, Handler, Outcome, Route};
    pub use crate::http::{Method, Request, Response, StatusCode, StatusError};
    pub use crate::service::HandlerChain;
    pub use crate::{AsyncHandle, Server, ServerHandle};
    pub use async_trait::async_trait;
}
