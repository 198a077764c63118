//! Middleware pipeline
//!
//! An ordered chain of [`Stage`]s. Each stage receives the in-flight
//! [`PipelineMessage`] plus a [`Next`] handle for the rest of the chain, and
//! either returns a message itself or calls [`Next::forward`]. The last stage
//! is terminal and never forwards.

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use tracing::{debug, warn};

/// Error message produced when a non-terminal stage has nothing to forward to
pub const NEXT_STAGE_MISSING: &str = "next stage missing";

/// The value threaded through the chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineMessage {
    /// Success without payload
    Ok,
    /// Nothing to deliver
    Empty,
    /// Failure, propagated unchanged to the caller
    Error(String),
    /// Raw HTTP bytes
    Payload(Bytes),
}

impl PipelineMessage {
    pub fn error(msg: impl Into<String>) -> Self {
        Self::Error(msg.into())
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Empty => "empty",
            Self::Error(_) => "error",
            Self::Payload(_) => "payload",
        }
    }
}

impl fmt::Display for PipelineMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Payload(bytes) => write!(f, "payload ({} bytes)", bytes.len()),
            Self::Error(msg) => write!(f, "error: {}", msg),
            other => f.write_str(other.kind()),
        }
    }
}

/// One link of the chain
#[async_trait]
pub trait Stage: Send {
    /// Stable name used in diagnostics
    fn name(&self) -> &'static str;

    /// Handle `msg`, optionally delegating to the rest of the chain via `next`
    async fn process(&mut self, msg: PipelineMessage, next: Next<'_>) -> PipelineMessage;
}

/// Handle to the stages after the current one
pub struct Next<'a> {
    rest: &'a mut [Box<dyn Stage>],
}

impl<'a> Next<'a> {
    /// Hand `msg` to the next stage
    ///
    /// Yields `Error("next stage missing")` when the chain ends here.
    pub async fn forward(self, msg: PipelineMessage) -> PipelineMessage {
        match self.rest.split_first_mut() {
            Some((stage, rest)) => {
                debug!(stage = stage.name(), message = %msg, "pipeline forward");
                stage.process(msg, Next { rest }).await
            }
            None => PipelineMessage::error(NEXT_STAGE_MISSING),
        }
    }
}

/// Ordered stage chain
pub struct Pipeline {
    stages: Vec<Box<dyn Stage>>,
}

impl Pipeline {
    pub fn new(stages: Vec<Box<dyn Stage>>) -> Self {
        Self { stages }
    }

    /// Stage names in order
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|stage| stage.name()).collect()
    }

    /// Run `msg` through the chain from the first stage
    pub async fn process(&mut self, msg: PipelineMessage) -> PipelineMessage {
        let result = Next {
            rest: &mut self.stages,
        }
        .forward(msg)
        .await;
        if result.is_error() {
            warn!(result = %result, "pipeline failed");
        } else {
            debug!(result = %result, "pipeline complete");
        }
        result
    }
}
