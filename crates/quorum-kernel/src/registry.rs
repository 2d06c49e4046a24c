use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use quorum_core::tools::{Tool, ToolManifestEntry};

/// Registry of available tools, keyed by name.
///
/// The manual hash lets observers (the context manager) notice when the
/// injected tool manual changed and emit `tool_manual_updated`.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn unregister(&mut self, name: &str) -> bool {
        self.tools.remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).map(Arc::clone)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn count(&self) -> usize {
        self.tools.len()
    }

    /// Manifest entries for the provider, sorted by name.
    pub fn manifest(&self) -> Vec<ToolManifestEntry> {
        let mut entries: Vec<ToolManifestEntry> = self
            .tools
            .values()
            .map(|t| t.to_manifest_entry())
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }

    /// The human-readable tool manual appended to the system prompt:
    /// name, description, and each tool's prompt contribution.
    pub fn manual(&self) -> String {
        let mut names = self.names();
        names.sort();
        let mut sections = Vec::with_capacity(names.len());
        for name in names {
            let tool = &self.tools[&name];
            let mut section = format!("## {}\n{}", tool.name(), tool.description());
            if let Some(extra) = tool.manual_entry() {
                section.push('\n');
                section.push_str(&extra);
            }
            sections.push(section);
        }
        sections.join("\n\n")
    }

    pub fn manual_hash(&self) -> String {
        let mut hasher = DefaultHasher::new();
        self.manual().hash(&mut hasher);
        format!("{:016x}", hasher.finish())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use quorum_core::tools::{ToolContext, ToolOutcome};

    struct DummyTool {
        name: String,
        extra: Option<String>,
    }

    impl DummyTool {
        fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                extra: None,
            }
        }
    }

    #[async_trait]
    impl Tool for DummyTool {
        fn name(&self) -> &str {
            &self.name
        }
        fn description(&self) -> &str {
            "A dummy tool for testing"
        }
        fn input_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }
        fn manual_entry(&self) -> Option<String> {
            self.extra.clone()
        }
        async fn execute(&self, _args: serde_json::Value, _ctx: &ToolContext) -> ToolOutcome {
            ToolOutcome::ok("ok")
        }
    }

    #[test]
    fn register_get_unregister() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(DummyTool::new("fs_read")));
        assert!(registry.contains("fs_read"));
        assert!(registry.get("fs_read").is_some());
        assert_eq!(registry.count(), 1);

        assert!(registry.unregister("fs_read"));
        assert!(!registry.contains("fs_read"));
        assert!(!registry.unregister("fs_read"));
    }

    #[test]
    fn manifest_sorted_by_name() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(DummyTool::new("shell")));
        registry.register(Arc::new(DummyTool::new("fs_read")));
        let manifest = registry.manifest();
        assert_eq!(manifest[0].name, "fs_read");
        assert_eq!(manifest[1].name, "shell");
    }

    #[test]
    fn manual_includes_contributions() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(DummyTool {
            name: "fs_read".into(),
            extra: Some("Prefer absolute paths.".into()),
        }));
        let manual = registry.manual();
        assert!(manual.contains("## fs_read"));
        assert!(manual.contains("Prefer absolute paths."));
    }

    #[test]
    fn manual_hash_tracks_registry_changes() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(DummyTool::new("fs_read")));
        let h1 = registry.manual_hash();
        let h1_again = registry.manual_hash();
        assert_eq!(h1, h1_again);

        registry.register(Arc::new(DummyTool::new("shell")));
        assert_ne!(h1, registry.manual_hash());
    }
}
