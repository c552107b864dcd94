//! Streaming delivery of a run to the chat surface.
//!
//! [`StreamingDelivery`] turns the normalized event stream of one run into
//! create/edit/delete calls on a [`ChatTransport`]:
//!
//! - thinking and tool events become short-lived ephemeral messages that are
//!   deleted when the run completes;
//! - text deltas are grouped into segments (a segment is closed by a tool
//!   invocation or by completion), each rendered as one message that is
//!   edited in place at most once per `edit_throttle`;
//! - a closed segment gets a final full-content edit, or is re-sent as
//!   several messages when it no longer fits in one.
//!
//! Transport failures never fail the run; they are logged and skipped.

mod format;
mod transport;

pub use format::{
    split_formatted, split_message, truncate_formatted, HtmlFormatter, MessageFormat, PlainText,
    TextFormatter,
};
pub use transport::{ChatTransport, ConsoleTransport, MessageHandle, TransportError};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::backend::NormalizedEvent;
use crate::session::RunObserver;
use crate::util::truncate_with_ellipsis;

const TOOL_SUMMARY_CHARS: usize = 80;
const THINKING_PREVIEW_CHARS: usize = 300;
/// Input keys that best describe what a tool is about to do, in priority order.
const TOOL_SUMMARY_KEYS: &[&str] = &[
    "command",
    "file_path",
    "notebook_path",
    "path",
    "pattern",
    "url",
    "query",
    "description",
];

#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Minimum gap between two edits of the same segment.
    pub edit_throttle: Duration,
    /// Longest message the transport accepts, in characters.
    pub message_limit: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            edit_throttle: Duration::from_millis(500),
            message_limit: 4096,
        }
    }
}

/// The open text segment.
#[derive(Debug)]
struct Segment {
    id: u64,
    text: String,
    handle: Option<MessageHandle>,
    last_edit: Instant,
    /// What the chat surface currently shows for this segment.
    displayed: String,
}

/// Consecutive thinking deltas share one ephemeral message.
#[derive(Debug)]
struct ThinkingBlock {
    text: String,
    handle: MessageHandle,
    last_edit: Instant,
}

/// Per-run rendering state. Discarded at run end or on rollback.
#[derive(Debug, Default)]
struct DeliveryState {
    next_segment_id: u64,
    current: Option<Segment>,
    thinking: Option<ThinkingBlock>,
    /// Messages of closed segments; kept visible unless rolled back.
    finalized: Vec<MessageHandle>,
    ephemeral: Vec<MessageHandle>,
}

pub struct StreamingDelivery {
    transport: Arc<dyn ChatTransport>,
    formatter: Arc<dyn TextFormatter>,
    config: DeliveryConfig,
    state: DeliveryState,
}

impl StreamingDelivery {
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        formatter: Arc<dyn TextFormatter>,
        config: DeliveryConfig,
    ) -> Self {
        Self {
            transport,
            formatter,
            config,
            state: DeliveryState::default(),
        }
    }

    /// Number of text segments opened during this run.
    pub fn segments_opened(&self) -> u64 {
        self.state.next_segment_id
    }

    async fn create(&self, text: &str) -> Option<MessageHandle> {
        match self.transport.create_message(text).await {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!("Failed to create chat message: {}", e);
                None
            }
        }
    }

    async fn edit(&self, handle: &MessageHandle, text: &str) -> bool {
        match self.transport.edit_message(handle, text).await {
            Ok(()) => true,
            Err(e) => {
                warn!(message = %handle, "Failed to edit chat message: {}", e);
                false
            }
        }
    }

    async fn delete(&self, handle: &MessageHandle) {
        if let Err(e) = self.transport.delete_message(handle).await {
            warn!(message = %handle, "Failed to delete chat message: {}", e);
        }
    }

    /// Formatted streaming preview that fits in one message.
    fn preview(&self, text: &str) -> String {
        truncate_formatted(self.formatter.as_ref(), text, self.config.message_limit)
    }

    async fn on_thinking(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        // Consecutive deltas extend one message, edited under the text
        // throttle, instead of posting a message per delta.
        match self.state.thinking.take() {
            Some(mut block) => {
                block.text.push_str(text);
                if block.last_edit.elapsed() >= self.config.edit_throttle {
                    let shown = self.formatter.format(&format!(
                        "🧠 {}",
                        truncate_with_ellipsis(&block.text, THINKING_PREVIEW_CHARS)
                    ));
                    self.edit(&block.handle, &shown).await;
                    block.last_edit = Instant::now();
                }
                self.state.thinking = Some(block);
            }
            None => {
                let shown = self.formatter.format(&format!(
                    "🧠 {}",
                    truncate_with_ellipsis(text, THINKING_PREVIEW_CHARS)
                ));
                if let Some(handle) = self.create(&shown).await {
                    self.state.ephemeral.push(handle.clone());
                    self.state.thinking = Some(ThinkingBlock {
                        text: text.to_string(),
                        handle,
                        last_edit: Instant::now(),
                    });
                }
            }
        }
    }

    async fn on_tool(&mut self, name: &str, input: &Value) {
        self.state.thinking = None;
        self.close_segment().await;
        let shown = match tool_summary(input) {
            Some(summary) => format!("🔧 {}: {}", name, summary),
            None => format!("🔧 {}", name),
        };
        if let Some(handle) = self.create(&self.formatter.format(&shown)).await {
            self.state.ephemeral.push(handle);
        }
    }

    async fn on_text(&mut self, text: &str) {
        self.state.thinking = None;
        if text.is_empty() {
            return;
        }

        let Some(mut segment) = self.state.current.take() else {
            let id = self.state.next_segment_id;
            self.state.next_segment_id += 1;
            let preview = self.preview(text);
            let handle = self.create(&preview).await;
            debug!(segment = id, "Opened text segment");
            self.state.current = Some(Segment {
                id,
                text: text.to_string(),
                displayed: if handle.is_some() { preview } else { String::new() },
                handle,
                last_edit: Instant::now(),
            });
            return;
        };

        segment.text.push_str(text);
        if segment.last_edit.elapsed() >= self.config.edit_throttle {
            let preview = self.preview(&segment.text);
            match segment.handle.clone() {
                Some(handle) => {
                    if self.edit(&handle, &preview).await {
                        segment.displayed = preview;
                    }
                }
                None => {
                    // The first create failed; try again with everything so far.
                    segment.handle = self.create(&preview).await;
                    if segment.handle.is_some() {
                        segment.displayed = preview;
                    }
                }
            }
            segment.last_edit = Instant::now();
        }
        self.state.current = Some(segment);
    }

    /// Render the complete text of the open segment, if any, and close it.
    async fn close_segment(&mut self) {
        let Some(segment) = self.state.current.take() else {
            return;
        };
        let formatted = self.formatter.format(&segment.text);

        if formatted.chars().count() > self.config.message_limit {
            if let Some(handle) = &segment.handle {
                self.delete(handle).await;
            }
            let chunks = split_formatted(
                self.formatter.as_ref(),
                &segment.text,
                self.config.message_limit,
            );
            debug!(segment = segment.id, chunks = chunks.len(), "Splitting long segment");
            for chunk in chunks {
                if let Some(handle) = self.create(&chunk).await {
                    self.state.finalized.push(handle);
                }
            }
            return;
        }

        match segment.handle {
            Some(handle) => {
                if formatted != segment.displayed {
                    self.edit(&handle, &formatted).await;
                }
                self.state.finalized.push(handle);
            }
            None => {
                if let Some(handle) = self.create(&formatted).await {
                    self.state.finalized.push(handle);
                }
            }
        }
    }

    async fn clear_ephemeral(&mut self) {
        self.state.thinking = None;
        for handle in std::mem::take(&mut self.state.ephemeral) {
            self.delete(&handle).await;
        }
    }
}

#[async_trait]
impl RunObserver for StreamingDelivery {
    async fn on_event(&mut self, event: &NormalizedEvent) {
        match event {
            NormalizedEvent::ThinkingDelta { text } => self.on_thinking(text).await,
            NormalizedEvent::ToolInvocation { name, input } => self.on_tool(name, input).await,
            NormalizedEvent::TextDelta { text } => self.on_text(text).await,
            NormalizedEvent::Completed { .. } => {
                self.close_segment().await;
                self.clear_ephemeral().await;
            }
            NormalizedEvent::Started { .. } | NormalizedEvent::Error { .. } => {}
        }
    }

    async fn rollback(&mut self) {
        let state = std::mem::take(&mut self.state);
        let mut handles = state.ephemeral;
        handles.extend(state.finalized);
        handles.extend(state.current.and_then(|segment| segment.handle));
        debug!(messages = handles.len(), "Rolling back delivered messages");
        for handle in handles {
            self.delete(&handle).await;
        }
    }

    async fn finish(&mut self) {
        self.close_segment().await;
        self.clear_ephemeral().await;
    }
}

/// Short description of a tool call from its most telling input field.
fn tool_summary(input: &Value) -> Option<String> {
    TOOL_SUMMARY_KEYS
        .iter()
        .find_map(|key| input.get(*key).and_then(Value::as_str))
        .map(|value| value.lines().next().unwrap_or("").trim())
        .filter(|value| !value.is_empty())
        .map(|value| truncate_with_ellipsis(value, TOOL_SUMMARY_CHARS))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordingTransport, TransportCall};
    use serde_json::json;

    fn delivery(transport: &Arc<RecordingTransport>, config: DeliveryConfig) -> StreamingDelivery {
        StreamingDelivery::new(transport.clone(), Arc::new(PlainText), config)
    }

    fn text(t: &str) -> NormalizedEvent {
        NormalizedEvent::TextDelta {
            text: t.to_string(),
        }
    }

    fn completed() -> NormalizedEvent {
        NormalizedEvent::Completed {
            usage: Default::default(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_deltas_within_throttle_produce_one_edit() {
        let transport = Arc::new(RecordingTransport::new());
        let mut d = delivery(&transport, DeliveryConfig::default());

        d.on_event(&text("Hel")).await;
        tokio::time::advance(Duration::from_millis(100)).await;
        d.on_event(&text("lo")).await;
        tokio::time::advance(Duration::from_millis(100)).await;
        d.on_event(&text(" world")).await;
        d.on_event(&completed()).await;

        assert_eq!(
            transport.calls(),
            vec![
                TransportCall::Create {
                    id: "m1".to_string(),
                    text: "Hel".to_string()
                },
                TransportCall::Edit {
                    id: "m1".to_string(),
                    text: "Hello world".to_string()
                },
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_edit_after_throttle_interval() {
        let transport = Arc::new(RecordingTransport::new());
        let mut d = delivery(&transport, DeliveryConfig::default());

        d.on_event(&text("a")).await;
        tokio::time::advance(Duration::from_millis(600)).await;
        d.on_event(&text("b")).await;
        d.on_event(&completed()).await;

        // The final edit is skipped because "ab" is already displayed.
        assert_eq!(transport.edits(), vec![("m1".to_string(), "ab".to_string())]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tool_splits_text_into_two_segments() {
        let transport = Arc::new(RecordingTransport::new());
        let mut d = delivery(&transport, DeliveryConfig::default());

        d.on_event(&text("a")).await;
        d.on_event(&NormalizedEvent::ToolInvocation {
            name: "Bash".to_string(),
            input: json!({"command": "cargo test\n--all"}),
        })
        .await;
        d.on_event(&text("b")).await;
        d.on_event(&completed()).await;

        assert_eq!(d.segments_opened(), 2);
        assert_eq!(
            transport.calls(),
            vec![
                TransportCall::Create {
                    id: "m1".to_string(),
                    text: "a".to_string()
                },
                TransportCall::Create {
                    id: "m2".to_string(),
                    text: "🔧 Bash: cargo test".to_string()
                },
                TransportCall::Create {
                    id: "m3".to_string(),
                    text: "b".to_string()
                },
                TransportCall::Delete {
                    id: "m2".to_string()
                },
            ]
        );
        assert_eq!(transport.visible(), vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_thinking_is_ephemeral_and_coalesced() {
        let transport = Arc::new(RecordingTransport::new());
        let mut d = delivery(&transport, DeliveryConfig::default());

        d.on_event(&NormalizedEvent::ThinkingDelta {
            text: "Let me".to_string(),
        })
        .await;
        d.on_event(&NormalizedEvent::ThinkingDelta {
            text: " look".to_string(),
        })
        .await;
        d.on_event(&text("Done")).await;
        d.on_event(&completed()).await;

        assert_eq!(transport.created_texts(), vec!["🧠 Let me", "Done"]);
        assert_eq!(transport.visible(), vec!["Done".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_segment_is_resent_in_chunks() {
        let transport = Arc::new(RecordingTransport::new());
        let mut d = delivery(
            &transport,
            DeliveryConfig {
                edit_throttle: Duration::from_millis(500),
                message_limit: 10,
            },
        );

        d.on_event(&text("first line")).await;
        d.on_event(&text("\nsecond")).await;
        d.on_event(&completed()).await;

        assert_eq!(
            transport.visible(),
            vec!["first line".to_string(), "second".to_string()]
        );
        assert!(transport.calls().contains(&TransportCall::Delete {
            id: "m1".to_string()
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_streaming_preview_is_truncated() {
        let transport = Arc::new(RecordingTransport::new());
        let mut d = delivery(
            &transport,
            DeliveryConfig {
                edit_throttle: Duration::from_millis(500),
                message_limit: 5,
            },
        );

        d.on_event(&text("abcdefgh")).await;
        assert_eq!(transport.created_texts(), vec!["abcd…"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rollback_deletes_everything() {
        let transport = Arc::new(RecordingTransport::new());
        let mut d = delivery(&transport, DeliveryConfig::default());

        d.on_event(&text("partial")).await;
        d.on_event(&NormalizedEvent::ToolInvocation {
            name: "Read".to_string(),
            input: json!({"file_path": "/tmp/x"}),
        })
        .await;
        d.on_event(&text("more")).await;
        d.rollback().await;

        assert!(transport.visible().is_empty());
        assert_eq!(d.segments_opened(), 0);

        d.on_event(&text("fresh")).await;
        d.finish().await;
        assert_eq!(transport.visible(), vec!["fresh".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_failures_are_swallowed() {
        let transport = Arc::new(RecordingTransport::new());
        transport.fail_creates(true);
        let mut d = delivery(&transport, DeliveryConfig::default());

        d.on_event(&text("lost")).await;
        transport.fail_creates(false);
        d.on_event(&completed()).await;

        // The segment is created on close once the transport recovers.
        assert_eq!(transport.visible(), vec!["lost".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_html_chunks_fit_message_limit() {
        let transport = Arc::new(RecordingTransport::new());
        let mut d = StreamingDelivery::new(
            transport.clone(),
            Arc::new(HtmlFormatter),
            DeliveryConfig {
                edit_throttle: Duration::from_millis(500),
                message_limit: 10,
            },
        );

        d.on_event(&text("a<b<c<d<e<f<g")).await;
        d.on_event(&completed()).await;

        let created = transport.created_texts();
        assert!(created.iter().all(|t| t.chars().count() <= 10), "{:?}", created);
        assert_eq!(
            transport.visible(),
            vec!["a&lt;b&lt;", "c&lt;d&lt;", "e&lt;f&lt;", "g"]
        );
    }

    #[test]
    fn test_tool_summary_prefers_command() {
        assert_eq!(
            tool_summary(&json!({"description": "list", "command": "ls"})),
            Some("ls".to_string())
        );
        assert_eq!(tool_summary(&json!({"other": 1})), None);
    }
}
