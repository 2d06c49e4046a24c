use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use futures::Stream;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tracing::warn;

use quorum_core::events::{
    Bookmark, Channel, ErrorPhase, ErrorSeverity, EventEnvelope, KernelEvent,
};
use quorum_core::ids::AgentId;
use quorum_store::{Store, StoreError};

const DEFAULT_BUFFER: usize = 1024;

type ListenerFn = Arc<dyn Fn(&EventEnvelope) + Send + Sync>;

struct ListenerEntry {
    id: u64,
    event_type: String,
    handler: ListenerFn,
}

/// Per-agent event bus: assigns cursors, persists every envelope through
/// the store, and fans out to live subscribers and callback listeners.
///
/// The cursor lock is held across the store append and the broadcast
/// send, so subscribers observe envelopes in strict cursor order.
pub struct EventBus {
    agent_id: AgentId,
    store: Arc<dyn Store>,
    tx: broadcast::Sender<EventEnvelope>,
    cursor: Mutex<u64>,
    listeners: Arc<RwLock<Vec<ListenerEntry>>>,
    next_listener_id: AtomicU64,
}

/// Removes its listener when dropped (or explicitly unsubscribed).
/// Listener registrations are process-scoped; they are not persisted
/// and must be re-installed after a resume.
pub struct ListenerHandle {
    id: u64,
    listeners: std::sync::Weak<RwLock<Vec<ListenerEntry>>>,
}

impl ListenerHandle {
    pub fn unsubscribe(self) {}
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        if let Some(listeners) = self.listeners.upgrade() {
            listeners.write().retain(|l| l.id != self.id);
        }
    }
}

impl EventBus {
    /// Open the bus for an agent, continuing cursor numbering from the
    /// persisted log.
    pub fn open(agent_id: AgentId, store: Arc<dyn Store>) -> Result<Self, StoreError> {
        Self::open_with_buffer(agent_id, store, DEFAULT_BUFFER)
    }

    pub fn open_with_buffer(
        agent_id: AgentId,
        store: Arc<dyn Store>,
        buffer: usize,
    ) -> Result<Self, StoreError> {
        let last = store.last_cursor(&agent_id)?;
        let (tx, _) = broadcast::channel(buffer.max(1));
        Ok(Self {
            agent_id,
            store,
            tx,
            cursor: Mutex::new(last),
            listeners: Arc::new(RwLock::new(Vec::new())),
            next_listener_id: AtomicU64::new(1),
        })
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    /// Assign the next cursor, persist, and fan out.
    pub fn emit(&self, event: KernelEvent) -> Result<EventEnvelope, StoreError> {
        let envelope = {
            let mut cursor = self.cursor.lock();
            *cursor += 1;
            let envelope = EventEnvelope {
                agent_id: self.agent_id.clone(),
                cursor: *cursor,
                bookmark: Bookmark {
                    seq: *cursor,
                    ts_ms: Utc::now().timestamp_millis(),
                },
                channel: event.channel(),
                event,
            };
            self.store.append_event(&envelope)?;
            // No receivers is fine; durable log is the source of truth.
            let _ = self.tx.send(envelope.clone());
            envelope
        };

        let listeners = self.listeners.read();
        for listener in listeners.iter() {
            if listener.event_type == envelope.event.event_type() {
                (listener.handler)(&envelope);
            }
        }
        Ok(envelope)
    }

    /// Emit, logging instead of failing. For paths where an event is
    /// advisory and the caller has no error channel of its own.
    pub fn emit_or_log(&self, event: KernelEvent) {
        if let Err(e) = self.emit(event) {
            warn!(agent = %self.agent_id, error = %e, "event emission failed");
        }
    }

    /// Register a callback for one event type. The returned handle
    /// unsubscribes on drop.
    pub fn on(
        &self,
        event_type: &str,
        handler: impl Fn(&EventEnvelope) + Send + Sync + 'static,
    ) -> ListenerHandle {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.write().push(ListenerEntry {
            id,
            event_type: event_type.to_string(),
            handler: Arc::new(handler),
        });
        ListenerHandle {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    /// Replay-then-live subscription.
    ///
    /// With `since`, persisted events after the bookmark stream first;
    /// the watermark suppresses any live event at or below the last
    /// replayed cursor, so the handover has no gaps and no duplicates.
    /// A subscriber that falls behind the broadcast buffer is
    /// disconnected: the stream ends after a monitor `error` is emitted.
    /// Durable events are never lost; reconnect with `since` to catch up.
    pub fn subscribe(
        self: &Arc<Self>,
        channels: Vec<Channel>,
        since: Option<Bookmark>,
    ) -> Result<Pin<Box<dyn Stream<Item = EventEnvelope> + Send>>, StoreError> {
        // Subscribe before reading the replay so nothing falls between.
        let rx = self.tx.subscribe();
        let replay = match since {
            Some(bookmark) => {
                self.store
                    .read_events(&self.agent_id, Some(bookmark), Some(&channels))?
            }
            None => Vec::new(),
        };
        let watermark = replay
            .last()
            .map(|e| e.cursor)
            .or(since.map(|b| b.seq))
            .unwrap_or(0);

        struct SubState {
            replay: std::vec::IntoIter<EventEnvelope>,
            rx: broadcast::Receiver<EventEnvelope>,
            watermark: u64,
            channels: Vec<Channel>,
            bus: Arc<EventBus>,
        }

        let state = SubState {
            replay: replay.into_iter(),
            rx,
            watermark,
            channels,
            bus: Arc::clone(self),
        };

        Ok(Box::pin(futures::stream::unfold(
            state,
            |mut st| async move {
                if let Some(envelope) = st.replay.next() {
                    return Some((envelope, st));
                }
                loop {
                    match st.rx.recv().await {
                        Ok(envelope) => {
                            if envelope.cursor <= st.watermark {
                                continue;
                            }
                            if !st.channels.contains(&envelope.channel) {
                                continue;
                            }
                            return Some((envelope, st));
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            st.bus.emit_or_log(KernelEvent::Error {
                                severity: ErrorSeverity::Error,
                                phase: ErrorPhase::System,
                                message: format!(
                                    "subscriber lagged by {skipped} events; disconnected"
                                ),
                                detail: None,
                            });
                            return None;
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            },
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use quorum_core::events::DoneReason;
    use quorum_store::MemoryStore;
    use std::sync::atomic::AtomicUsize;

    fn bus() -> Arc<EventBus> {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        Arc::new(EventBus::open(AgentId::new(), store).unwrap())
    }

    fn chunk(n: u64) -> KernelEvent {
        KernelEvent::TextChunk {
            delta: format!("{n}"),
        }
    }

    #[test]
    fn cursors_strictly_increase() {
        let bus = bus();
        let mut last = 0;
        for i in 0..10 {
            let env = bus.emit(chunk(i)).unwrap();
            assert_eq!(env.cursor, last + 1);
            assert_eq!(env.bookmark.seq, env.cursor);
            last = env.cursor;
        }
    }

    #[test]
    fn cursor_continues_after_reopen() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let agent = AgentId::new();
        {
            let bus = EventBus::open(agent.clone(), Arc::clone(&store)).unwrap();
            for i in 0..5 {
                bus.emit(chunk(i)).unwrap();
            }
        }
        let bus = EventBus::open(agent, store).unwrap();
        let env = bus.emit(chunk(99)).unwrap();
        assert_eq!(env.cursor, 6);
    }

    #[test]
    fn events_persisted_through_store() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let agent = AgentId::new();
        let bus = EventBus::open(agent.clone(), Arc::clone(&store)).unwrap();
        bus.emit(chunk(1)).unwrap();
        bus.emit(KernelEvent::Done {
            reason: DoneReason::Completed,
        })
        .unwrap();
        let events = store.read_events(&agent, None, None).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].event.event_type(), "done");
    }

    #[test]
    fn listener_receives_matching_events_only() {
        let bus = bus();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let _handle = bus.on("done", move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(chunk(1)).unwrap();
        bus.emit(KernelEvent::Done {
            reason: DoneReason::Completed,
        })
        .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn listener_unsubscribes_on_drop() {
        let bus = bus();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let handle = bus.on("text_chunk", move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        bus.emit(chunk(1)).unwrap();
        handle.unsubscribe();
        bus.emit(chunk(2)).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn live_subscription_filters_channels() {
        let bus = bus();
        let mut stream = bus.subscribe(vec![Channel::Progress], None).unwrap();

        bus.emit(KernelEvent::StepComplete {
            step: 1,
            sfp_index: 0,
        })
        .unwrap();
        bus.emit(chunk(7)).unwrap();

        let got = stream.next().await.unwrap();
        assert_eq!(got.channel, Channel::Progress);
        assert_eq!(got.event.event_type(), "text_chunk");
    }

    #[tokio::test]
    async fn replay_then_live_without_gaps_or_duplicates() {
        let bus = bus();
        // Emit e1..e10.
        let mut bookmark_at_5 = None;
        for i in 1..=10 {
            let env = bus.emit(chunk(i)).unwrap();
            if i == 5 {
                bookmark_at_5 = Some(env.bookmark);
            }
        }

        let mut stream = bus
            .subscribe(vec![Channel::Progress], bookmark_at_5)
            .unwrap();

        // Live events after subscription.
        bus.emit(chunk(11)).unwrap();
        bus.emit(chunk(12)).unwrap();

        let mut cursors = Vec::new();
        for _ in 0..7 {
            let env = stream.next().await.unwrap();
            cursors.push(env.cursor);
        }
        assert_eq!(cursors, vec![6, 7, 8, 9, 10, 11, 12]);
    }

    #[tokio::test]
    async fn lagged_subscriber_is_disconnected() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let agent = AgentId::new();
        let bus = Arc::new(EventBus::open_with_buffer(agent, store, 2).unwrap());
        let mut stream = bus.subscribe(vec![Channel::Progress], None).unwrap();

        // Overrun the 2-slot buffer without polling.
        for i in 0..16 {
            bus.emit(chunk(i)).unwrap();
        }

        // Drain: the stream must terminate (lag disconnect), not hang.
        let mut ended = false;
        for _ in 0..20 {
            match tokio::time::timeout(std::time::Duration::from_millis(100), stream.next()).await
            {
                Ok(Some(_)) => continue,
                Ok(None) => {
                    ended = true;
                    break;
                }
                Err(_) => panic!("subscription hung instead of disconnecting"),
            }
        }
        assert!(ended, "lagged subscriber should be disconnected");
    }
}
