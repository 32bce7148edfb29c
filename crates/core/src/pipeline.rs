//! Outbound text pipeline.
//!
//! Optional transformations applied to user text before it is sent, composed
//! in a fixed order instead of by wrapping send functions.

/// One transformation step.
pub trait OutboundStage: Send + Sync {
    fn apply(&self, text: String) -> String;
}

impl<F> OutboundStage for F
where
    F: Fn(String) -> String + Send + Sync,
{
    fn apply(&self, text: String) -> String {
        self(text)
    }
}

/// Prefixes each message with the conversation topic and learner level so
/// the assistant can adapt its replies.
#[derive(Debug, Clone)]
pub struct ContextPrefix {
    pub topic: String,
    pub level: String,
}

impl ContextPrefix {
    pub fn new(topic: impl Into<String>, level: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            level: level.into(),
        }
    }
}

impl OutboundStage for ContextPrefix {
    fn apply(&self, text: String) -> String {
        format!("[Topic: {}, Level: {}] {}", self.topic, self.level, text)
    }
}

/// Stages run in insertion order.
#[derive(Default)]
pub struct OutboundPipeline {
    stages: Vec<Box<dyn OutboundStage>>,
}

impl OutboundPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, stage: impl OutboundStage + 'static) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    pub fn apply(&self, text: String) -> String {
        self.stages
            .iter()
            .fold(text, |text, stage| stage.apply(text))
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}
