use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use crate::session::request::Request;
use crate::session::router::{BytesResult, Dispatched, Router};

/// Sends every request's payload back. Some module ids trigger special behavior for testing
///  timeouts and failure isolation.
#[derive(Default)]
pub struct EchoRouter {
    pub num_dispatched: Arc<AtomicUsize>,
}

impl EchoRouter {
    /// answers after [EchoRouter::SLOW_DELAY]
    pub const SLOW_MID: u8 = 0xf0;
    pub const PANIC_MID: u8 = 0xf1;
    /// never answers
    pub const HANGING_MID: u8 = 0xf2;

    pub const SLOW_DELAY: Duration = Duration::from_secs(33);
}

#[async_trait]
impl Router for EchoRouter {
    async fn dispatch(&self, request: &Request) -> Dispatched {
        self.num_dispatched.fetch_add(1, Ordering::AcqRel);
        debug!(mid = request.mid(), aid = request.aid(), "echoing request");

        match request.mid() {
            Self::SLOW_MID => tokio::time::sleep(Self::SLOW_DELAY).await,
            Self::PANIC_MID => panic!("dispatching a request with module id {}", request.mid()),
            Self::HANGING_MID => std::future::pending::<()>().await,
            _ => {}
        }
        Dispatched::new(BytesResult(Bytes::copy_from_slice(request.data())))
    }
}
