//! Scriptable in-memory tool used by unit tests

use super::{ToolAdapter, ToolError};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub(crate) struct Call {
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl Call {
    pub fn line(&self) -> String {
        self.args.join(" ")
    }
}

struct Rule {
    pattern: String,
    /// The last entry repeats once the queue is down to one
    outcomes: VecDeque<Result<String, String>>,
}

/// Answers calls whose joined argument line contains a pattern
///
/// Rules are checked in insertion order; unmatched calls succeed with empty
/// output.
pub(crate) struct FakeTool {
    name: String,
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<Call>>,
}

impl FakeTool {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            rules: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn respond(self, pattern: &str, stdout: &str) -> Self {
        self.script(pattern, vec![Ok(stdout)])
    }

    pub fn fail(self, pattern: &str, stderr: &str) -> Self {
        self.script(pattern, vec![Err(stderr)])
    }

    pub fn script(self, pattern: &str, outcomes: Vec<Result<&str, &str>>) -> Self {
        let outcomes = outcomes
            .into_iter()
            .map(|o| o.map(str::to_string).map_err(str::to_string))
            .collect();
        self.rules.lock().unwrap().push(Rule {
            pattern: pattern.to_string(),
            outcomes,
        });
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn lines(&self) -> Vec<String> {
        self.calls().iter().map(Call::line).collect()
    }

    pub fn count_matching(&self, pattern: &str) -> usize {
        self.lines().iter().filter(|l| l.contains(pattern)).count()
    }
}

#[async_trait]
impl ToolAdapter for FakeTool {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute_with_env(
        &self,
        cancel: &CancellationToken,
        args: Vec<String>,
        env: Vec<(String, String)>,
    ) -> Result<String, ToolError> {
        if cancel.is_cancelled() {
            return Err(ToolError::Cancelled {
                tool: self.name.clone(),
            });
        }

        let line = args.join(" ");
        self.calls.lock().unwrap().push(Call { args, env });

        let mut rules = self.rules.lock().unwrap();
        let Some(rule) = rules.iter_mut().find(|r| line.contains(&r.pattern)) else {
            return Ok(String::new());
        };

        let outcome = if rule.outcomes.len() > 1 {
            rule.outcomes.pop_front()
        } else {
            rule.outcomes.front().cloned()
        };

        match outcome {
            Some(Ok(stdout)) => Ok(stdout),
            Some(Err(stderr)) => Err(ToolError::Failed {
                tool: self.name.clone(),
                status: "exit status: 1".to_string(),
                stderr,
            }),
            None => Ok(String::new()),
        }
    }
}
