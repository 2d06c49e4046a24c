//! Per-tool-name recovery recommendations attached to failed results.
//!
//! Every failure the model sees carries actionable hints; the defaults
//! here cover the common tool families, and embedders can extend the
//! table for their own tools.

use std::collections::HashMap;

use parking_lot::RwLock;

use quorum_core::tools::{ToolErrorType, ToolFailure};

/// Lookup table from tool name to recovery hints, split by error class.
pub struct RecommendationTable {
    by_tool: RwLock<HashMap<String, Vec<String>>>,
}

impl Default for RecommendationTable {
    fn default() -> Self {
        let mut by_tool = HashMap::new();
        by_tool.insert(
            "fs_read".to_string(),
            vec![
                "check that the path exists and is spelled correctly".to_string(),
                "list the parent directory to discover the actual file name".to_string(),
            ],
        );
        by_tool.insert(
            "fs_write".to_string(),
            vec![
                "verify the parent directory exists".to_string(),
                "read the file first if you expected existing content".to_string(),
            ],
        );
        by_tool.insert(
            "shell".to_string(),
            vec![
                "inspect stderr for the underlying cause".to_string(),
                "try a simpler form of the command".to_string(),
            ],
        );
        Self {
            by_tool: RwLock::new(by_tool),
        }
    }
}

impl RecommendationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, tool_name: &str, recommendations: Vec<String>) {
        self.by_tool
            .write()
            .insert(tool_name.to_string(), recommendations);
    }

    /// Fill in recommendations on a failure that has none.
    pub fn enrich(&self, tool_name: &str, failure: &mut ToolFailure) {
        if !failure.recommendations.is_empty() {
            return;
        }
        let by_tool = self.by_tool.read();
        if let Some(hints) = by_tool.get(tool_name) {
            failure.recommendations = hints.clone();
        } else {
            failure.recommendations = generic_hints(failure.error_type);
        }
    }
}

fn generic_hints(error_type: ToolErrorType) -> Vec<String> {
    match error_type {
        ToolErrorType::Validation => {
            vec!["re-read the tool's input schema and fix the arguments".to_string()]
        }
        ToolErrorType::Aborted => {
            vec!["the call was cancelled or timed out; retry only if still needed".to_string()]
        }
        ToolErrorType::Runtime | ToolErrorType::Logical | ToolErrorType::Exception => {
            vec!["inspect the error message and adjust the approach".to_string()]
        }
    }
}
