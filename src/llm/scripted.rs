//! In-process model double for tests.

use crate::llm::{CompletionOptions, ContentPart, ModelClient, ModelError};
use async_trait::async_trait;
use std::sync::Mutex;

#[derive(Debug, Clone)]
pub struct ScriptedCall {
    pub system: String,
    pub text: String,
    pub images: Vec<String>,
    pub options: CompletionOptions,
}

type Responder = Box<dyn Fn(&ScriptedCall) -> Result<String, ModelError> + Send + Sync>;

pub struct ScriptedModel {
    responder: Responder,
    calls: Mutex<Vec<ScriptedCall>>,
}

impl ScriptedModel {
    pub fn new(
        responder: impl Fn(&ScriptedCall) -> Result<String, ModelError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            responder: Box::new(responder),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn always(text: impl Into<String>) -> Self {
        let text = text.into();
        Self::new(move |_| Ok(text.clone()))
    }

    pub fn failing(error: ModelError) -> Self {
        Self::new(move |_| Err(error.clone()))
    }

    pub fn calls(&self) -> Vec<ScriptedCall> {
        self.calls.lock().expect("calls lock").clone()
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    async fn complete(
        &self,
        system: &str,
        content: &[ContentPart],
        options: &CompletionOptions,
    ) -> Result<String, ModelError> {
        let mut text = Vec::new();
        let mut images = Vec::new();
        for part in content {
            match part {
                ContentPart::Text { text: value } => text.push(value.clone()),
                ContentPart::Image { url } => images.push(url.clone()),
            }
        }
        let call = ScriptedCall {
            system: system.to_string(),
            text: text.join("\n"),
            images,
            options: options.clone(),
        };
        self.calls.lock().expect("calls lock").push(call.clone());
        (self.responder)(&call)
    }
}
