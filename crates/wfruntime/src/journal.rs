use crate::runtime::StartRequest;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use wfcore::{NodeError, NodeOutput};

/// Completed dispatch outcomes keyed by `<node_id>#<dispatch_seq>`.
///
/// Control flow is deterministic for a fixed plan, so a re-run from the
/// start asks for the same keys in the same order and gets the recorded
/// outcome back instead of invoking the executor again.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Journal {
    entries: BTreeMap<String, StepRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StepRecord {
    Completed { output: NodeOutput },
    Failed { error: String },
}

impl StepRecord {
    pub fn from_result(result: &Result<NodeOutput, NodeError>) -> Option<Self> {
        match result {
            Ok(output) => Some(StepRecord::Completed {
                output: output.clone(),
            }),
            // Interrupted steps run again on resume.
            Err(e) if e.is_interrupt() => None,
            Err(e) => Some(StepRecord::Failed {
                error: e.to_string(),
            }),
        }
    }

    pub fn into_result(self) -> Result<NodeOutput, NodeError> {
        match self {
            StepRecord::Completed { output } => Ok(output),
            StepRecord::Failed { error } => Err(NodeError::ExecutionFailed(error)),
        }
    }
}

impl Journal {
    pub fn key(node_id: &str, seq: u32) -> String {
        format!("{}#{}", node_id, seq)
    }

    pub fn get(&self, key: &str) -> Option<&StepRecord> {
        self.entries.get(key)
    }

    pub fn record(&mut self, key: String, record: StepRecord) {
        self.entries.insert(key, record);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// What the runtime persists to resume an execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub request: StartRequest,
    pub journal: Journal,
}
