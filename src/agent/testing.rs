//! In-memory agent for tests.

use super::{Agent, AgentOutput, AgentRequest};
use anyhow::{Result, bail};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Mutex;

type Action = Box<dyn Fn(&Path) + Send + Sync>;

struct Step {
    output: AgentOutput,
    action: Option<Action>,
}

/// Replays queued responses in order. A step may carry an action that runs
/// against the request's working directory before the response is returned,
/// standing in for the edits a real agent makes.
#[derive(Default)]
pub struct ScriptedAgent {
    steps: Mutex<VecDeque<Step>>,
    requests: Mutex<Vec<AgentRequest>>,
}

impl ScriptedAgent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(self, text: impl Into<String>, exit_code: i32) -> Self {
        self.push(AgentOutput::new(text, exit_code), None)
    }

    pub fn respond_with(
        self,
        text: impl Into<String>,
        exit_code: i32,
        action: impl Fn(&Path) + Send + Sync + 'static,
    ) -> Self {
        self.push(AgentOutput::new(text, exit_code), Some(Box::new(action)))
    }

    fn push(self, output: AgentOutput, action: Option<Action>) -> Self {
        self.steps
            .lock()
            .unwrap()
            .push_back(Step { output, action });
        self
    }

    /// Requests received so far.
    pub fn requests(&self) -> Vec<AgentRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn remaining(&self) -> usize {
        self.steps.lock().unwrap().len()
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    async fn invoke(&self, request: &AgentRequest) -> Result<AgentOutput> {
        self.requests.lock().unwrap().push(request.clone());
        let step = self.steps.lock().unwrap().pop_front();
        let Some(step) = step else {
            bail!("ScriptedAgent has no response left for call {}", self.calls());
        };
        if let Some(action) = &step.action {
            action(&request.cwd);
        }
        Ok(step.output)
    }
}
