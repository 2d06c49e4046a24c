use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{oneshot, watch};
use tracing::info;

use quorum_core::config::{PermissionConfig, PermissionMode};
use quorum_core::events::KernelEvent;
use quorum_core::ids::ToolCallId;
use quorum_core::records::{ApprovalDecision, ToolCallRecord};
use quorum_core::tools::ToolAttributes;

use crate::bus::EventBus;
use crate::error::KernelError;

/// Result of evaluating policy for one tool call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PermissionOutcome {
    Allow,
    Deny(String),
    Ask,
}

/// An embedder-supplied named mode.
pub type CustomModeFn = Arc<dyn Fn(&str, &ToolAttributes) -> PermissionOutcome + Send + Sync>;

/// A resolved approval decision.
#[derive(Clone, Debug)]
pub struct Decision {
    pub decision: ApprovalDecision,
    pub note: Option<String>,
    pub decider: Option<String>,
}

/// Decides per-tool-call whether to allow, deny, or require approval,
/// and holds the pending approvals until `decide` resolves them.
///
/// Evaluation order: `deny_tools` → `allow_tools` →
/// `require_approval_tools` → mode rule.
pub struct PermissionManager {
    config: RwLock<PermissionConfig>,
    custom_modes: RwLock<HashMap<String, CustomModeFn>>,
    pending: Mutex<HashMap<ToolCallId, oneshot::Sender<Decision>>>,
    pending_tx: watch::Sender<Vec<ToolCallId>>,
    bus: Arc<EventBus>,
}

impl PermissionManager {
    pub fn new(config: PermissionConfig, bus: Arc<EventBus>) -> Self {
        let (pending_tx, _) = watch::channel(Vec::new());
        Self {
            config: RwLock::new(config),
            custom_modes: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            pending_tx,
            bus,
        }
    }

    pub fn register_mode(&self, name: &str, mode: CustomModeFn) {
        self.custom_modes.write().insert(name.to_string(), mode);
    }

    pub fn set_config(&self, config: PermissionConfig) {
        *self.config.write() = config;
    }

    pub fn evaluate(&self, tool_name: &str, attrs: &ToolAttributes) -> PermissionOutcome {
        let config = self.config.read();

        if config.deny_tools.iter().any(|t| t == tool_name) {
            return PermissionOutcome::Deny(format!("tool {tool_name} is deny-listed"));
        }
        if let Some(allow) = &config.allow_tools {
            if !allow.iter().any(|t| t == tool_name) {
                return PermissionOutcome::Deny(format!(
                    "tool {tool_name} is not on the allow list"
                ));
            }
        }
        if config.require_approval_tools.iter().any(|t| t == tool_name) {
            return PermissionOutcome::Ask;
        }

        match &config.mode {
            PermissionMode::Auto => PermissionOutcome::Allow,
            PermissionMode::Approval => PermissionOutcome::Ask,
            PermissionMode::Readonly => {
                if attrs.readonly {
                    PermissionOutcome::Allow
                } else {
                    PermissionOutcome::Ask
                }
            }
            PermissionMode::Custom(name) => {
                let modes = self.custom_modes.read();
                match modes.get(name) {
                    Some(mode) => mode(tool_name, attrs),
                    None => PermissionOutcome::Deny(format!("unknown permission mode {name}")),
                }
            }
        }
    }

    /// Record a pending approval and broadcast `permission_required`.
    /// The dispatcher suspends on the returned receiver.
    pub fn register_pending(&self, record: &ToolCallRecord) -> oneshot::Receiver<Decision> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(record.id.clone(), tx);
        self.publish_pending();
        self.bus.emit_or_log(KernelEvent::PermissionRequired {
            call: record.clone(),
        });
        rx
    }

    /// Resolve a pending approval. Exactly once per call id; a second
    /// decision fails with `NotPending`.
    pub fn decide(
        &self,
        call_id: &ToolCallId,
        decision: ApprovalDecision,
        note: Option<String>,
        decider: Option<String>,
    ) -> Result<(), KernelError> {
        let tx = self
            .pending
            .lock()
            .remove(call_id)
            .ok_or_else(|| KernelError::NotPending(call_id.clone()))?;
        self.publish_pending();

        info!(call = %call_id, ?decision, "permission decided");
        self.bus.emit_or_log(KernelEvent::PermissionDecided {
            call_id: call_id.clone(),
            decision,
            note: note.clone(),
        });

        // A dropped receiver means the waiting call was already torn
        // down (interrupt); the decision is still broadcast above.
        let _ = tx.send(Decision {
            decision,
            note,
            decider,
        });
        Ok(())
    }

    /// Drop a pending entry without a decision (interrupt path).
    pub fn cancel_pending(&self, call_id: &ToolCallId) {
        self.pending.lock().remove(call_id);
        self.publish_pending();
    }

    pub fn pending_ids(&self) -> Vec<ToolCallId> {
        let mut ids: Vec<ToolCallId> = self.pending.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Watch channel carrying the current pending set; `chat` uses this
    /// to report a paused turn.
    pub fn watch_pending(&self) -> watch::Receiver<Vec<ToolCallId>> {
        self.pending_tx.subscribe()
    }

    fn publish_pending(&self) {
        let ids = {
            let mut ids: Vec<ToolCallId> = self.pending.lock().keys().cloned().collect();
            ids.sort();
            ids
        };
        let _ = self.pending_tx.send(ids);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quorum_core::ids::AgentId;
    use quorum_store::{MemoryStore, Store};

    fn manager(config: PermissionConfig) -> PermissionManager {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let bus = Arc::new(EventBus::open(AgentId::new(), store).unwrap());
        PermissionManager::new(config, bus)
    }

    fn readonly_attrs() -> ToolAttributes {
        ToolAttributes {
            readonly: true,
            ..Default::default()
        }
    }

    #[test]
    fn auto_mode_allows() {
        let mgr = manager(PermissionConfig::default());
        assert_eq!(
            mgr.evaluate("fs_read", &ToolAttributes::default()),
            PermissionOutcome::Allow
        );
    }

    #[test]
    fn approval_mode_asks_for_everything() {
        let mgr = manager(PermissionConfig {
            mode: PermissionMode::Approval,
            ..Default::default()
        });
        assert_eq!(
            mgr.evaluate("fs_read", &readonly_attrs()),
            PermissionOutcome::Ask
        );
    }

    #[test]
    fn readonly_mode_splits_on_attribute() {
        let mgr = manager(PermissionConfig {
            mode: PermissionMode::Readonly,
            ..Default::default()
        });
        assert_eq!(
            mgr.evaluate("fs_read", &readonly_attrs()),
            PermissionOutcome::Allow
        );
        assert_eq!(
            mgr.evaluate("fs_write", &ToolAttributes::default()),
            PermissionOutcome::Ask
        );
    }

    #[test]
    fn deny_list_wins_over_everything() {
        let mgr = manager(PermissionConfig {
            mode: PermissionMode::Auto,
            deny_tools: vec!["shell".into()],
            allow_tools: Some(vec!["shell".into()]),
            ..Default::default()
        });
        assert!(matches!(
            mgr.evaluate("shell", &ToolAttributes::default()),
            PermissionOutcome::Deny(_)
        ));
    }

    #[test]
    fn allow_list_denies_unlisted() {
        let mgr = manager(PermissionConfig {
            allow_tools: Some(vec!["fs_read".into()]),
            ..Default::default()
        });
        assert_eq!(
            mgr.evaluate("fs_read", &ToolAttributes::default()),
            PermissionOutcome::Allow
        );
        assert!(matches!(
            mgr.evaluate("fs_write", &ToolAttributes::default()),
            PermissionOutcome::Deny(_)
        ));
    }

    #[test]
    fn require_approval_overrides_mode() {
        let mgr = manager(PermissionConfig {
            mode: PermissionMode::Auto,
            require_approval_tools: vec!["fs_write".into()],
            ..Default::default()
        });
        assert_eq!(
            mgr.evaluate("fs_write", &ToolAttributes::default()),
            PermissionOutcome::Ask
        );
    }

    #[test]
    fn custom_mode_dispatch() {
        let mgr = manager(PermissionConfig {
            mode: PermissionMode::Custom("cautious".into()),
            ..Default::default()
        });
        // Unknown mode denies.
        assert!(matches!(
            mgr.evaluate("fs_read", &ToolAttributes::default()),
            PermissionOutcome::Deny(_)
        ));

        mgr.register_mode(
            "cautious",
            Arc::new(|name, _attrs| {
                if name.starts_with("fs_") {
                    PermissionOutcome::Allow
                } else {
                    PermissionOutcome::Ask
                }
            }),
        );
        assert_eq!(
            mgr.evaluate("fs_read", &ToolAttributes::default()),
            PermissionOutcome::Allow
        );
        assert_eq!(
            mgr.evaluate("shell", &ToolAttributes::default()),
            PermissionOutcome::Ask
        );
    }

    #[tokio::test]
    async fn pending_resolves_through_decide() {
        let mgr = manager(PermissionConfig::default());
        let record = ToolCallRecord::new(ToolCallId::new(), "fs_write", serde_json::json!({}));
        let rx = mgr.register_pending(&record);
        assert_eq!(mgr.pending_ids(), vec![record.id.clone()]);

        mgr.decide(
            &record.id,
            ApprovalDecision::Deny,
            Some("nope".into()),
            Some("operator".into()),
        )
        .unwrap();

        let decision = rx.await.unwrap();
        assert_eq!(decision.decision, ApprovalDecision::Deny);
        assert_eq!(decision.note.as_deref(), Some("nope"));
        assert!(mgr.pending_ids().is_empty());
    }

    #[tokio::test]
    async fn double_decide_fails() {
        let mgr = manager(PermissionConfig::default());
        let record = ToolCallRecord::new(ToolCallId::new(), "fs_write", serde_json::json!({}));
        let _rx = mgr.register_pending(&record);

        mgr.decide(&record.id, ApprovalDecision::Allow, None, None)
            .unwrap();
        let err = mgr
            .decide(&record.id, ApprovalDecision::Allow, None, None)
            .unwrap_err();
        assert!(matches!(err, KernelError::NotPending(_)));
    }

    #[test]
    fn decide_without_request_fails() {
        let mgr = manager(PermissionConfig::default());
        let err = mgr
            .decide(&ToolCallId::new(), ApprovalDecision::Allow, None, None)
            .unwrap_err();
        assert!(matches!(err, KernelError::NotPending(_)));
    }

    #[tokio::test]
    async fn watch_pending_tracks_registrations() {
        let mgr = manager(PermissionConfig::default());
        let mut watch = mgr.watch_pending();
        assert!(watch.borrow().is_empty());

        let record = ToolCallRecord::new(ToolCallId::new(), "fs_write", serde_json::json!({}));
        let _rx = mgr.register_pending(&record);
        watch.changed().await.unwrap();
        assert_eq!(watch.borrow().len(), 1);

        mgr.decide(&record.id, ApprovalDecision::Allow, None, None)
            .unwrap();
        watch.changed().await.unwrap();
        assert!(watch.borrow().is_empty());
    }
}
