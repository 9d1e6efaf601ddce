use std::fmt::{Debug, Formatter};

use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;

use crate::session::request::Request;

/// A result that can be encoded as a response payload
#[cfg_attr(test, automock)]
pub trait Marshal: Send + Sync {
    fn marshal(&self) -> anyhow::Result<Bytes>;
}

/// Raw bytes that are sent as they are
#[derive(Clone, Eq, PartialEq)]
pub struct BytesResult(pub Bytes);

impl Marshal for BytesResult {
    fn marshal(&self) -> anyhow::Result<Bytes> {
        Ok(self.0.clone())
    }
}

impl Debug for BytesResult {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "BytesResult({})", String::from_utf8_lossy(&self.0))
    }
}

/// The outcome of dispatching a request
pub struct Dispatched {
    /// `None` if there is nothing to send back
    pub result: Option<Box<dyn Marshal>>,
    /// the router's own timeout elapsed; `result` then holds whatever the router sends instead
    pub timed_out: bool,
}

impl Dispatched {
    pub fn new(result: impl Marshal + 'static) -> Dispatched {
        Dispatched {
            result: Some(Box::new(result)),
            timed_out: false,
        }
    }

    pub fn none() -> Dispatched {
        Dispatched {
            result: None,
            timed_out: false,
        }
    }
}

/// Executes routed requests (by module and action id). This is where application logic plugs
///  into the tunnel.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Router: Send + Sync + 'static {
    async fn dispatch(&self, request: &Request) -> Dispatched;
}
