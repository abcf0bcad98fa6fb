//! Call Relay Core
//!
//! Transport-independent pieces of the voice-call relay: the conversation
//! transcript, the generation backend client and the responders that turn a
//! transcript into a spoken reply.

pub mod llm_client;
pub mod responder;
pub mod transcript;
