//! Reply Generation
//!
//! This module turns a transcript into a spoken reply. It comes in two
//! delivery modes that share one contract: the reply is pushed to a
//! [`FragmentSink`] and the full text is returned so the caller can record it.
//!
//! Whatever happens on the backend, a responder never fails. A backend error
//! becomes the fixed [`APOLOGY`], and every call ends with exactly one fragment
//! marked `last`, so a listener can always tell the reply is over.

use crate::{
    llm_client::{LLMClient, LLMStreamEvent},
    transcript::Transcript,
};
use async_trait::async_trait;
use futures::StreamExt;
use std::{fmt, str::FromStr, sync::Arc};
use tracing::{debug, error, warn};

/// Spoken in place of a reply whenever the generation backend fails.
pub const APOLOGY: &str = "I'm sorry, I'm having trouble processing your request right now.";

/// Substituted for an empty caller utterance so the backend never sees an
/// empty user turn.
pub const REPROMPT: &str = "I didn't catch that. Could you please repeat?";

/// Used when no system prompt is configured.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant on a phone call. \
Keep your answers short and conversational, because they will be spoken aloud.";

/// Receives a reply as it is produced.
///
/// Delivery problems belong to the implementor. `emit` has no error channel,
/// so the responder cannot be interrupted by a lost fragment.
#[async_trait]
pub trait FragmentSink: Send + Sync {
    async fn emit(&self, token: &str, last: bool);
}

/// Generates the assistant's next turn for a transcript.
#[async_trait]
pub trait Responder: Send + Sync {
    /// Delivers the reply through `sink` and returns its full text.
    async fn respond(&self, transcript: &Transcript, sink: &dyn FragmentSink) -> String;
}

/// Selects how replies are delivered to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseMode {
    /// One message carrying the whole reply.
    Complete,
    /// Incremental fragments followed by an empty terminal message.
    Streaming,
}

impl fmt::Display for ResponseMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseMode::Complete => write!(f, "complete"),
            ResponseMode::Streaming => write!(f, "streaming"),
        }
    }
}

impl FromStr for ResponseMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "complete" | "sync" => Ok(ResponseMode::Complete),
            "streaming" | "stream" => Ok(ResponseMode::Streaming),
            other => Err(format!("'{}' is not a response mode", other)),
        }
    }
}

/// Builds the responder for the configured mode.
pub fn responder_for(mode: ResponseMode, client: Arc<dyn LLMClient>) -> Arc<dyn Responder> {
    match mode {
        ResponseMode::Complete => Arc::new(CompletionResponder::new(client)),
        ResponseMode::Streaming => Arc::new(StreamingResponder::new(client)),
    }
}

/// Request/response variant: waits for the whole reply, then emits it once.
pub struct CompletionResponder {
    client: Arc<dyn LLMClient>,
}

impl CompletionResponder {
    pub fn new(client: Arc<dyn LLMClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Responder for CompletionResponder {
    async fn respond(&self, transcript: &Transcript, sink: &dyn FragmentSink) -> String {
        let reply = match self
            .client
            .complete(
                transcript.system_instruction().to_string(),
                transcript.history().to_vec(),
            )
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                error!(error = ?e, "Completion request failed; answering with apology");
                APOLOGY.to_string()
            }
        };

        sink.emit(&reply, true).await;
        reply
    }
}

/// Streaming variant: forwards each fragment as soon as the backend yields it.
pub struct StreamingResponder {
    client: Arc<dyn LLMClient>,
}

impl StreamingResponder {
    pub fn new(client: Arc<dyn LLMClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Responder for StreamingResponder {
    async fn respond(&self, transcript: &Transcript, sink: &dyn FragmentSink) -> String {
        let mut stream = match self
            .client
            .stream(
                transcript.system_instruction().to_string(),
                transcript.history().to_vec(),
            )
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                error!(error = ?e, "Streaming request failed before the first fragment");
                sink.emit(APOLOGY, true).await;
                return APOLOGY.to_string();
            }
        };

        let mut reply = String::new();
        let mut fragments = 0usize;
        while let Some(event) = stream.next().await {
            match event {
                Ok(LLMStreamEvent::TextChunk(chunk)) => {
                    sink.emit(&chunk, false).await;
                    reply.push_str(&chunk);
                    fragments += 1;
                }
                Err(e) => {
                    error!(error = ?e, fragments, "Stream broke off mid-reply");
                    sink.emit(APOLOGY, true).await;
                    return APOLOGY.to_string();
                }
            }
        }

        sink.emit("", true).await;
        if fragments == 0 {
            warn!("Backend finished the stream without producing any text");
        }
        debug!(fragments, chars = reply.len(), "Streamed reply complete");
        reply
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm_client::{LLMStream, MockLLMClient};
    use crate::transcript::Role;
    use anyhow::anyhow;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        fragments: Mutex<Vec<(String, bool)>>,
    }

    impl RecordingSink {
        fn take(&self) -> Vec<(String, bool)> {
            self.fragments.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl FragmentSink for RecordingSink {
        async fn emit(&self, token: &str, last: bool) {
            self.fragments
                .lock()
                .unwrap()
                .push((token.to_string(), last));
        }
    }

    fn transcript_with_prompt(prompt: &str) -> Transcript {
        let mut transcript = Transcript::new("You are a helpful assistant.");
        transcript.push_user(prompt);
        transcript
    }

    fn chunks(parts: &[&str]) -> LLMStream {
        let events: Vec<anyhow::Result<LLMStreamEvent>> = parts
            .iter()
            .map(|p| Ok(LLMStreamEvent::TextChunk(p.to_string())))
            .collect();
        Box::pin(futures::stream::iter(events))
    }

    #[tokio::test]
    async fn test_completion_emits_whole_reply_once() {
        let mut client = MockLLMClient::new();
        client
            .expect_complete()
            .withf(|system, history| {
                system == "You are a helpful assistant."
                    && history.len() == 1
                    && history[0].role == Role::User
                    && history[0].content == "Hello"
            })
            .times(1)
            .returning(|_, _| Ok("Hi there".to_string()));

        let responder = CompletionResponder::new(Arc::new(client));
        let sink = RecordingSink::default();
        let reply = responder
            .respond(&transcript_with_prompt("Hello"), &sink)
            .await;

        assert_eq!(reply, "Hi there");
        assert_eq!(sink.take(), vec![("Hi there".to_string(), true)]);
    }

    #[tokio::test]
    async fn test_completion_failure_becomes_apology() {
        let mut client = MockLLMClient::new();
        client
            .expect_complete()
            .returning(|_, _| Err(anyhow!("backend unavailable")));

        let responder = CompletionResponder::new(Arc::new(client));
        let sink = RecordingSink::default();
        let reply = responder
            .respond(&transcript_with_prompt("Hello"), &sink)
            .await;

        assert_eq!(reply, APOLOGY);
        assert_eq!(sink.take(), vec![(APOLOGY.to_string(), true)]);
    }

    #[tokio::test]
    async fn test_streaming_forwards_fragments_in_order_then_terminates() {
        let mut client = MockLLMClient::new();
        client
            .expect_stream()
            .times(1)
            .returning(|_, _| Ok(chunks(&["Once ", "upon ", "a time"])));

        let responder = StreamingResponder::new(Arc::new(client));
        let sink = RecordingSink::default();
        let reply = responder
            .respond(&transcript_with_prompt("Tell me a story"), &sink)
            .await;

        assert_eq!(reply, "Once upon a time");
        assert_eq!(
            sink.take(),
            vec![
                ("Once ".to_string(), false),
                ("upon ".to_string(), false),
                ("a time".to_string(), false),
                (String::new(), true),
            ]
        );
    }

    #[tokio::test]
    async fn test_streaming_failure_before_first_fragment() {
        let mut client = MockLLMClient::new();
        client
            .expect_stream()
            .returning(|_, _| Err(anyhow!("connection refused")));

        let responder = StreamingResponder::new(Arc::new(client));
        let sink = RecordingSink::default();
        let reply = responder
            .respond(&transcript_with_prompt("Hello"), &sink)
            .await;

        assert_eq!(reply, APOLOGY);
        assert_eq!(sink.take(), vec![(APOLOGY.to_string(), true)]);
    }

    #[tokio::test]
    async fn test_streaming_failure_mid_stream_ends_with_single_terminal_apology() {
        let mut client = MockLLMClient::new();
        client.expect_stream().returning(|_, _| {
            let events: Vec<anyhow::Result<LLMStreamEvent>> = vec![
                Ok(LLMStreamEvent::TextChunk("Partial".to_string())),
                Err(anyhow!("stream reset")),
                Ok(LLMStreamEvent::TextChunk("never seen".to_string())),
            ];
            Ok(Box::pin(futures::stream::iter(events)) as LLMStream)
        });

        let responder = StreamingResponder::new(Arc::new(client));
        let sink = RecordingSink::default();
        let reply = responder
            .respond(&transcript_with_prompt("Hello"), &sink)
            .await;

        assert_eq!(reply, APOLOGY);
        let fragments = sink.take();
        assert_eq!(
            fragments,
            vec![
                ("Partial".to_string(), false),
                (APOLOGY.to_string(), true)
            ]
        );
        assert_eq!(fragments.iter().filter(|(_, last)| *last).count(), 1);
    }

    #[tokio::test]
    async fn test_streaming_empty_stream_still_terminates() {
        let mut client = MockLLMClient::new();
        client.expect_stream().returning(|_, _| Ok(chunks(&[])));

        let responder = StreamingResponder::new(Arc::new(client));
        let sink = RecordingSink::default();
        let reply = responder
            .respond(&transcript_with_prompt("Hello"), &sink)
            .await;

        assert_eq!(reply, "");
        assert_eq!(sink.take(), vec![(String::new(), true)]);
    }

    #[test]
    fn test_response_mode_parsing() {
        assert_eq!(
            "streaming".parse::<ResponseMode>(),
            Ok(ResponseMode::Streaming)
        );
        assert_eq!(
            "COMPLETE".parse::<ResponseMode>(),
            Ok(ResponseMode::Complete)
        );
        assert!("chunked".parse::<ResponseMode>().is_err());
        assert_eq!(ResponseMode::Streaming.to_string(), "streaming");
    }
}
