use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tracing::{error, info, warn};

use quorum_core::config::AgentConfig;
use quorum_core::events::RunState;
use quorum_core::ids::{AgentId, SnapshotId};
use quorum_core::info::AgentInfo;
use quorum_store::{PoolMeta, Store};

use crate::agent::{Agent, AgentDeps};
use crate::error::KernelError;

const DEFAULT_MAX_AGENTS: usize = 64;

#[derive(Clone, Debug)]
pub struct ShutdownOptions {
    pub timeout: Duration,
    pub force_interrupt: bool,
    pub save_running_list: bool,
}

impl Default for ShutdownOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            force_interrupt: true,
            save_running_list: true,
        }
    }
}

#[derive(Debug, Default)]
pub struct ShutdownReport {
    pub completed: Vec<AgentId>,
    pub interrupted: Vec<AgentId>,
    pub failed: Vec<AgentId>,
}

/// Lifecycle management for coexisting agents: create/resume/fork/
/// destroy, bounded concurrency, and save-and-resume of the running
/// list across shutdowns.
///
/// One live agent per id per process; the store's agent lock guards
/// cross-process ownership where the backend supports it.
pub struct AgentPool {
    store: Arc<dyn Store>,
    agents: DashMap<AgentId, Arc<Agent>>,
    max_agents: usize,
}

impl AgentPool {
    pub fn new(store: Arc<dyn Store>) -> Arc<Self> {
        Self::with_capacity(store, DEFAULT_MAX_AGENTS)
    }

    pub fn with_capacity(store: Arc<dyn Store>, max_agents: usize) -> Arc<Self> {
        Arc::new(Self {
            store,
            agents: DashMap::new(),
            max_agents: max_agents.max(1),
        })
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn get(&self, id: &AgentId) -> Option<Arc<Agent>> {
        self.agents.get(id).map(|entry| Arc::clone(&entry))
    }

    pub fn live_ids(&self) -> Vec<AgentId> {
        let mut ids: Vec<AgentId> = self.agents.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    fn admit(&self, id: &AgentId) -> Result<(), KernelError> {
        if self.agents.contains_key(id) {
            return Err(KernelError::AlreadyExists(id.clone()));
        }
        if self.agents.len() >= self.max_agents {
            return Err(KernelError::PoolFull(self.max_agents));
        }
        Ok(())
    }

    /// Create a new agent. Refuses an id that exists in the store or is
    /// already live.
    pub fn create(
        &self,
        id: AgentId,
        config: AgentConfig,
        deps: AgentDeps,
    ) -> Result<Arc<Agent>, KernelError> {
        self.admit(&id)?;
        let agent = Agent::create(id.clone(), config, deps)?;
        self.agents.insert(id, Arc::clone(&agent));
        Ok(agent)
    }

    /// Resume an agent from the store, applying crash recovery.
    pub fn resume(
        &self,
        id: AgentId,
        config: AgentConfig,
        deps: AgentDeps,
    ) -> Result<Arc<Agent>, KernelError> {
        self.admit(&id)?;
        let agent = Agent::resume(id.clone(), config, deps)?;
        self.agents.insert(id, Arc::clone(&agent));
        Ok(agent)
    }

    /// Resume using the config saved in agent metadata, with optional
    /// overrides.
    pub fn resume_from_store(
        &self,
        id: AgentId,
        deps: AgentDeps,
        overrides: Option<&dyn Fn(&mut AgentConfig)>,
    ) -> Result<Arc<Agent>, KernelError> {
        self.admit(&id)?;
        let agent = Agent::resume_from_store(id.clone(), deps, overrides)?;
        self.agents.insert(id, Arc::clone(&agent));
        Ok(agent)
    }

    /// Fork a new agent from a snapshot of `source`. Messages, todos,
    /// and the tool records referenced by the copied messages carry
    /// over; the event log starts fresh; lineage is extended.
    pub fn fork(
        &self,
        source: &AgentId,
        snapshot: Option<SnapshotId>,
        config: AgentConfig,
        deps: AgentDeps,
    ) -> Result<Arc<Agent>, KernelError> {
        let snapshot = match snapshot {
            Some(id) => self.store.load_snapshot(source, &id)?,
            None => {
                let live = self
                    .get(source)
                    .ok_or_else(|| KernelError::AgentNotFound(source.clone()))?;
                live.snapshot(None)?
            }
        };

        let source_info = self.store.load_info(source)?;
        let new_id = AgentId::new();

        // Records referenced by the copied messages only.
        let referenced: std::collections::HashSet<_> = snapshot
            .messages
            .iter()
            .flat_map(|m| m.tool_uses())
            .map(|(id, _, _)| id.clone())
            .collect();
        let records: Vec<_> = self
            .store
            .load_tool_records(source)?
            .into_iter()
            .filter(|r| referenced.contains(&r.id))
            .collect();
        let todos = self.store.load_todos(source)?;

        let mut agent_info = AgentInfo::new(
            new_id.clone(),
            &config.template_id,
            &config.template_version,
            &config.version_hash(),
        );
        agent_info.lineage = source_info.lineage.clone();
        agent_info.lineage.push(source.clone());
        agent_info.message_count = snapshot.messages.len();
        agent_info.last_sfp_index = snapshot.sfp_index;
        agent_info.saved_config = Some(config.clone());
        self.store.save_info(&agent_info)?;
        self.store.save_messages(&new_id, &snapshot.messages)?;
        self.store.save_tool_records(&new_id, &records)?;
        self.store.save_todos(&new_id, &todos)?;

        info!(source = %source, fork = %new_id, sfp = snapshot.sfp_index, "forked agent");
        self.resume(new_id, config, deps)
    }

    /// Interrupt, flush, and drop a live agent. Store state remains.
    pub async fn destroy(&self, id: &AgentId) -> Result<(), KernelError> {
        let (_, agent) = self
            .agents
            .remove(id)
            .ok_or_else(|| KernelError::AgentNotFound(id.clone()))?;
        agent.interrupt(Some("destroyed".into()));
        agent.wait_idle(Duration::from_secs(5)).await;
        agent.shutdown_worker();
        Ok(())
    }

    /// Drain the pool: wait for working agents, interrupt stragglers if
    /// asked, optionally persist the running list for the next process.
    pub async fn graceful_shutdown(&self, opts: ShutdownOptions) -> ShutdownReport {
        let mut report = ShutdownReport::default();
        let ids = self.live_ids();

        if opts.save_running_list {
            let meta = PoolMeta {
                running: ids.clone(),
                saved_at: Utc::now().to_rfc3339(),
            };
            if let Err(e) = self.store.save_pool_meta(&meta) {
                error!(error = %e, "failed to save running list");
            }
        }

        for id in ids {
            let Some(agent) = self.get(&id) else { continue };
            let working = agent.status().run_state == RunState::Working;
            if !working {
                report.completed.push(id.clone());
            } else if agent.wait_idle(opts.timeout).await {
                report.completed.push(id.clone());
            } else if opts.force_interrupt {
                warn!(agent = %id, "interrupting for shutdown");
                agent.interrupt(Some("graceful shutdown".into()));
                agent.wait_idle(Duration::from_secs(5)).await;
                report.interrupted.push(id.clone());
            } else {
                report.failed.push(id.clone());
            }
            agent.shutdown_worker();
            self.agents.remove(&id);
        }

        info!(
            completed = report.completed.len(),
            interrupted = report.interrupted.len(),
            failed = report.failed.len(),
            "pool shut down"
        );
        report
    }

    /// Resume every agent recorded by the previous shutdown, then clear
    /// the list.
    pub fn resume_from_shutdown(
        &self,
        factory: impl Fn(&AgentId) -> (AgentConfig, AgentDeps),
    ) -> Result<Vec<Arc<Agent>>, KernelError> {
        let Some(meta) = self.store.load_pool_meta()? else {
            return Ok(Vec::new());
        };
        let mut resumed = Vec::new();
        for id in &meta.running {
            let (config, deps) = factory(id);
            match self.resume(id.clone(), config, deps) {
                Ok(agent) => resumed.push(agent),
                Err(e) => error!(agent = %id, error = %e, "failed to resume from shutdown"),
            }
        }
        self.store.save_pool_meta(&PoolMeta {
            running: Vec::new(),
            saved_at: Utc::now().to_rfc3339(),
        })?;
        Ok(resumed)
    }

    /// Install SIGTERM/SIGINT handlers that drain the pool.
    pub fn register_shutdown_handlers(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            wait_for_shutdown_signal().await;
            info!("shutdown signal received; draining pool");
            pool.graceful_shutdown(ShutdownOptions::default()).await;
        })
    }
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            error!(error = %e, "failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
