//! Backend provider abstraction.
//!
//! A provider wraps one concrete agent backend and exposes a single
//! capability: given a prompt and options, produce a cancellable, ordered,
//! lazy stream of [`NormalizedEvent`]s. Resuming a prior backend session and
//! starting fresh go through the same call; `QueryOptions::resume` decides.

pub mod anthropic;
pub mod claudecode;
pub mod error;
pub mod events;
pub mod registry;
pub mod shared;

use std::path::PathBuf;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use tokio_util::sync::CancellationToken;

pub use error::{ProviderError, ProviderErrorKind};
pub use events::{NormalizedEvent, Usage};
pub use registry::{BackendInfo, BackendRegistry};

/// Finite, single-consumer stream of normalized events. An `Err` item is
/// terminal.
pub type EventStream = BoxStream<'static, Result<NormalizedEvent, ProviderError>>;

#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub working_dir: PathBuf,
    /// Backend session id to resume; `None` starts a fresh backend session.
    pub resume: Option<String>,
    pub model: Option<String>,
    /// Extended-thinking budget; 0 disables thinking.
    pub max_thinking_tokens: u32,
}

#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub prompt: String,
    pub options: QueryOptions,
    pub cancel: CancellationToken,
}

#[async_trait]
pub trait Backend: Send + Sync {
    fn id(&self) -> &str;
    fn name(&self) -> &str;
    async fn create_query(&self, request: QueryRequest) -> Result<EventStream, ProviderError>;
}

/// Race every pull of `stream` against `cancel`.
///
/// Once the token fires, the next pull yields a `Cancelled` error without
/// waiting on the inner stream, which is then dropped.
pub fn cancellable(mut stream: EventStream, cancel: CancellationToken) -> EventStream {
    Box::pin(async_stream::stream! {
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                item = stream.next() => Some(item),
            };
            match next {
                None => {
                    yield Err(ProviderError::cancelled());
                    break;
                }
                Some(Some(Ok(event))) => yield Ok(event),
                Some(Some(Err(e))) => {
                    yield Err(e);
                    break;
                }
                Some(None) => break,
            }
        }
    })
}
