use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, Timelike, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use quorum_core::events::KernelEvent;
use quorum_core::ids::{AgentId, TriggerId};
use quorum_core::messages::{Message, ReminderOrigin};

use crate::bus::EventBus;
use crate::error::KernelError;

/// Callback invoked when a trigger fires. The payload is empty for
/// step/time triggers and the caller-supplied JSON for external ones.
/// Returning text injects a system reminder onto the agent's queue.
pub type TriggerCallback =
    Arc<dyn Fn(&serde_json::Value) -> Option<String> + Send + Sync>;

struct StepTrigger {
    id: TriggerId,
    every: u64,
    callback: TriggerCallback,
}

/// Registers step, time, and external triggers that inject system
/// messages. Callbacks run on the agent's loop as system messages, not
/// in arbitrary threads: a fire only enqueues.
pub struct Scheduler {
    agent_id: AgentId,
    bus: Arc<EventBus>,
    reminders: mpsc::Sender<Message>,
    step_triggers: Mutex<Vec<StepTrigger>>,
    external: Mutex<HashMap<TriggerId, TriggerCallback>>,
    cancel: CancellationToken,
}

impl Scheduler {
    pub fn new(
        agent_id: AgentId,
        bus: Arc<EventBus>,
        reminders: mpsc::Sender<Message>,
    ) -> Self {
        Self {
            agent_id,
            bus,
            reminders,
            step_triggers: Mutex::new(Vec::new()),
            external: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Fire every `n` completed steps.
    pub fn every_steps(&self, n: u64, callback: TriggerCallback) -> TriggerId {
        let id = TriggerId::new();
        self.step_triggers.lock().push(StepTrigger {
            id: id.clone(),
            every: n.max(1),
            callback,
        });
        id
    }

    /// Fire on a wall-clock interval.
    pub fn every_interval(self: &Arc<Self>, interval: Duration, callback: TriggerCallback) -> TriggerId {
        let id = TriggerId::new();
        let scheduler = Arc::clone(self);
        let trigger_id = id.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(10)));
            ticker.tick().await; // first tick is immediate
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        scheduler.fire(&trigger_id, "interval", &callback, &serde_json::Value::Null);
                    }
                }
            }
        });
        id
    }

    /// Fire on a five-field cron spec, checked once a minute.
    pub fn cron(
        self: &Arc<Self>,
        spec: &str,
        callback: TriggerCallback,
    ) -> Result<TriggerId, KernelError> {
        let cron = CronSpec::parse(spec)?;
        let id = TriggerId::new();
        let scheduler = Arc::clone(self);
        let trigger_id = id.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut last_fired: Option<(i64, u32, u32)> = None;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(20)) => {
                        let now = Utc::now();
                        let minute_key = (now.timestamp() / 86_400, now.hour(), now.minute());
                        if cron.matches(&now) && last_fired != Some(minute_key) {
                            last_fired = Some(minute_key);
                            scheduler.fire(&trigger_id, "cron", &callback, &serde_json::Value::Null);
                        }
                    }
                }
            }
        });
        Ok(id)
    }

    /// Register a trigger fired by `notify_external_trigger`.
    pub fn register_external(&self, callback: TriggerCallback) -> TriggerId {
        let id = TriggerId::new();
        self.external.lock().insert(id.clone(), callback);
        id
    }

    pub fn notify_external_trigger(
        &self,
        id: &TriggerId,
        payload: serde_json::Value,
    ) -> Result<(), KernelError> {
        let callback = self
            .external
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| KernelError::InvalidState(format!("no external trigger {id}")))?;
        self.fire(id, "external", &callback, &payload);
        Ok(())
    }

    /// Step ticker, driven by the agent loop.
    pub fn on_step(&self, step: u64) {
        let fired: Vec<(TriggerId, TriggerCallback)> = {
            let triggers = self.step_triggers.lock();
            triggers
                .iter()
                .filter(|t| step > 0 && step % t.every == 0)
                .map(|t| (t.id.clone(), Arc::clone(&t.callback)))
                .collect()
        };
        for (id, callback) in fired {
            self.fire(&id, "steps", &callback, &serde_json::Value::Null);
        }
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    fn fire(
        &self,
        id: &TriggerId,
        kind: &str,
        callback: &TriggerCallback,
        payload: &serde_json::Value,
    ) {
        debug!(agent = %self.agent_id, trigger = %id, kind, "scheduler trigger");
        self.bus.emit_or_log(KernelEvent::SchedulerTriggered {
            trigger_id: id.to_string(),
            kind: kind.to_string(),
        });
        if let Some(text) = callback(payload) {
            if self
                .reminders
                .try_send(Message::reminder(ReminderOrigin::Scheduler, text))
                .is_ok()
            {
                self.bus.emit_or_log(KernelEvent::ReminderSent {
                    origin: ReminderOrigin::Scheduler,
                });
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Five-field cron matcher: minute, hour, day-of-month, month,
/// day-of-week. Supports `*`, `*/n`, lists, ranges, and literals.
#[derive(Clone, Debug)]
pub struct CronSpec {
    minute: CronField,
    hour: CronField,
    day_of_month: CronField,
    month: CronField,
    day_of_week: CronField,
}

#[derive(Clone, Debug)]
enum CronField {
    Any,
    Values(Vec<u32>),
}

impl CronField {
    fn parse(field: &str, min: u32, max: u32) -> Result<Self, KernelError> {
        if field == "*" {
            return Ok(Self::Any);
        }
        let mut values = Vec::new();
        for part in field.split(',') {
            if let Some(step) = part.strip_prefix("*/") {
                let step: u32 = step
                    .parse()
                    .map_err(|_| bad_cron(field))
                    .and_then(|s: u32| if s == 0 { Err(bad_cron(field)) } else { Ok(s) })?;
                values.extend((min..=max).filter(|v| (v - min) % step == 0));
            } else if let Some((lo, hi)) = part.split_once('-') {
                let lo: u32 = lo.parse().map_err(|_| bad_cron(field))?;
                let hi: u32 = hi.parse().map_err(|_| bad_cron(field))?;
                if lo > hi || lo < min || hi > max {
                    return Err(bad_cron(field));
                }
                values.extend(lo..=hi);
            } else {
                let value: u32 = part.parse().map_err(|_| bad_cron(field))?;
                if value < min || value > max {
                    return Err(bad_cron(field));
                }
                values.push(value);
            }
        }
        values.sort_unstable();
        values.dedup();
        Ok(Self::Values(values))
    }

    fn matches(&self, value: u32) -> bool {
        match self {
            Self::Any => true,
            Self::Values(values) => values.contains(&value),
        }
    }
}

fn bad_cron(field: &str) -> KernelError {
    KernelError::InvalidState(format!("invalid cron field: {field}"))
}

impl CronSpec {
    pub fn parse(spec: &str) -> Result<Self, KernelError> {
        let fields: Vec<&str> = spec.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(KernelError::InvalidState(format!(
                "cron spec needs 5 fields, got {}",
                fields.len()
            )));
        }
        Ok(Self {
            minute: CronField::parse(fields[0], 0, 59)?,
            hour: CronField::parse(fields[1], 0, 23)?,
            day_of_month: CronField::parse(fields[2], 1, 31)?,
            month: CronField::parse(fields[3], 1, 12)?,
            day_of_week: CronField::parse(fields[4], 0, 6)?,
        })
    }

    pub fn matches(&self, at: &chrono::DateTime<Utc>) -> bool {
        self.minute.matches(at.minute())
            && self.hour.matches(at.hour())
            && self.day_of_month.matches(at.day())
            && self.month.matches(at.month())
            && self
                .day_of_week
                .matches(at.weekday().num_days_from_sunday())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use quorum_store::{MemoryStore, Store};

    fn setup() -> (
        Arc<dyn Store>,
        AgentId,
        Arc<Scheduler>,
        mpsc::Receiver<Message>,
    ) {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let agent = AgentId::new();
        let bus = Arc::new(EventBus::open(agent.clone(), Arc::clone(&store)).unwrap());
        let (tx, rx) = mpsc::channel(8);
        let scheduler = Arc::new(Scheduler::new(agent.clone(), bus, tx));
        (store, agent, scheduler, rx)
    }

    fn remind_with(text: &str) -> TriggerCallback {
        let text = text.to_string();
        Arc::new(move |_payload| Some(text.clone()))
    }

    #[test]
    fn step_trigger_fires_on_multiples() {
        let (store, agent, scheduler, mut rx) = setup();
        scheduler.every_steps(3, remind_with("three steps passed"));

        scheduler.on_step(1);
        scheduler.on_step(2);
        assert!(rx.try_recv().is_err());

        scheduler.on_step(3);
        let msg = rx.try_recv().unwrap();
        assert_eq!(msg.text_content(), "three steps passed");
        assert!(msg.is_reminder());

        let types: Vec<String> = store
            .read_events(&agent, None, None)
            .unwrap()
            .iter()
            .map(|e| e.event.event_type().to_string())
            .collect();
        assert!(types.contains(&"scheduler_triggered".to_string()));
        assert!(types.contains(&"reminder_sent".to_string()));
    }

    #[test]
    fn callback_returning_none_skips_reminder() {
        let (store, agent, scheduler, mut rx) = setup();
        scheduler.every_steps(1, Arc::new(|_| None));
        scheduler.on_step(1);
        assert!(rx.try_recv().is_err());
        // Triggered event still emitted.
        let events = store.read_events(&agent, None, None).unwrap();
        assert_eq!(events[0].event.event_type(), "scheduler_triggered");
    }

    #[test]
    fn external_trigger_receives_payload() {
        let (_, _, scheduler, mut rx) = setup();
        let id = scheduler.register_external(Arc::new(|payload| {
            Some(format!("deploy finished: {}", payload["status"]))
        }));
        scheduler
            .notify_external_trigger(&id, serde_json::json!({"status": "ok"}))
            .unwrap();
        let msg = rx.try_recv().unwrap();
        assert!(msg.text_content().contains(r#"deploy finished: "ok""#));

        let unknown = TriggerId::new();
        assert!(scheduler
            .notify_external_trigger(&unknown, serde_json::Value::Null)
            .is_err());
    }

    #[tokio::test]
    async fn interval_trigger_fires() {
        let (_, _, scheduler, mut rx) = setup();
        scheduler.every_interval(Duration::from_millis(20), remind_with("tick"));
        let msg = tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .expect("interval trigger did not fire")
            .unwrap();
        assert_eq!(msg.text_content(), "tick");
        scheduler.shutdown();
    }

    #[test]
    fn cron_parse_and_match() {
        let spec = CronSpec::parse("*/15 9-17 * * 1-5").unwrap();
        // Wednesday 2026-01-07 09:30 UTC.
        let hit = Utc.with_ymd_and_hms(2026, 1, 7, 9, 30, 0).unwrap();
        assert!(spec.matches(&hit));
        // 09:31 misses the minute field.
        let miss = Utc.with_ymd_and_hms(2026, 1, 7, 9, 31, 0).unwrap();
        assert!(!spec.matches(&miss));
        // Sunday misses the weekday range.
        let sunday = Utc.with_ymd_and_hms(2026, 1, 4, 9, 30, 0).unwrap();
        assert!(!spec.matches(&sunday));
    }

    #[test]
    fn cron_rejects_bad_specs() {
        assert!(CronSpec::parse("* * *").is_err());
        assert!(CronSpec::parse("61 * * * *").is_err());
        assert!(CronSpec::parse("*/0 * * * *").is_err());
        assert!(CronSpec::parse("5-2 * * * *").is_err());
    }

    #[test]
    fn cron_list_field() {
        let spec = CronSpec::parse("0,30 * * * *").unwrap();
        let at_30 = Utc.with_ymd_and_hms(2026, 3, 1, 12, 30, 0).unwrap();
        assert!(spec.matches(&at_30));
        let at_15 = Utc.with_ymd_and_hms(2026, 3, 1, 12, 15, 0).unwrap();
        assert!(!spec.matches(&at_15));
    }
}
