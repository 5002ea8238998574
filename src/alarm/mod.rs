//! Alarm Engine: periodic query evaluation, throttled and
//! grouped notification dispatch.

pub mod notifier;

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::GrepWiseResult;
use crate::record::now_millis;
use crate::search::SearchService;
use crate::sources::persist_json_atomic;
use notifier::{channel_for, dispatch_with_retry, NotificationChannelConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    CountGt,
    CountGe,
    CountLt,
    CountLe,
    CountEq,
}

impl Condition {
    fn evaluate(self, count: usize, threshold: i64) -> bool {
        let count = count as i64;
        match self {
            Condition::CountGt => count > threshold,
            Condition::CountGe => count >= threshold,
            Condition::CountLt => count < threshold,
            Condition::CountLe => count <= threshold,
            Condition::CountEq => count == threshold,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alarm {
    pub id: String,
    pub name: String,
    pub query: String,
    pub condition: Condition,
    pub threshold: i64,
    pub time_window_minutes: i64,
    pub enabled: bool,
    pub notification_channels: Vec<NotificationChannelConfig>,
    pub throttle_window_minutes: i64,
    pub max_notifications_per_window: Option<u32>,
    pub grouping_key: Option<String>,
    pub grouping_window_minutes: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlarmEventStatus {
    Triggered,
    Acknowledged,
    Resolved,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlarmEvent {
    pub id: String,
    pub alarm_id: String,
    pub alarm_name: String,
    pub timestamp: i64,
    pub status: AlarmEventStatus,
    pub match_count: usize,
    pub acknowledged_by: Option<String>,
    pub acknowledged_at: Option<i64>,
    pub resolved_by: Option<String>,
    pub resolved_at: Option<i64>,
    pub details: BTreeMap<String, String>,
}

#[derive(Default)]
struct ThrottleState {
    /// Notification timestamps per grouping bucket (or a single `""` bucket
    /// when the alarm has no `groupingKey`), used to enforce
    /// `maxNotificationsPerWindow` over a sliding `throttleWindowMinutes`.
    sent_at: HashMap<String, Vec<i64>>,
    /// The still-open event per grouping bucket, so repeated matches inside
    /// `groupingWindowMinutes` coalesce instead of opening a new event.
    open_event: HashMap<String, String>,
}

pub struct AlarmEngine {
    search: Arc<SearchService>,
    path: PathBuf,
    alarms: RwLock<HashMap<String, Alarm>>,
    events: RwLock<HashMap<String, AlarmEvent>>,
    throttles: RwLock<HashMap<String, ThrottleState>>,
}

impl AlarmEngine {
    pub fn load(path: PathBuf, search: Arc<SearchService>) -> Self {
        let alarms = fs::read_to_string(&path)
            .ok()
            .and_then(|s| serde_json::from_str::<Vec<Alarm>>(&s).ok())
            .unwrap_or_default()
            .into_iter()
            .map(|a| (a.id.clone(), a))
            .collect();
        Self {
            search,
            path,
            alarms: RwLock::new(alarms),
            events: RwLock::new(HashMap::new()),
            throttles: RwLock::new(HashMap::new()),
        }
    }

    pub fn upsert_alarm(&self, alarm: Alarm) -> GrepWiseResult<()> {
        self.alarms.write().unwrap().insert(alarm.id.clone(), alarm);
        self.persist()
    }

    pub fn delete_alarm(&self, id: &str) -> GrepWiseResult<()> {
        self.alarms.write().unwrap().remove(id);
        self.throttles.write().unwrap().remove(id);
        self.persist()
    }

    pub fn list_alarms(&self) -> Vec<Alarm> {
        self.alarms.read().unwrap().values().cloned().collect()
    }

    pub fn list_events(&self) -> Vec<AlarmEvent> {
        self.events.read().unwrap().values().cloned().collect()
    }

    fn persist(&self) -> GrepWiseResult<()> {
        let snapshot: Vec<Alarm> = self.alarms.read().unwrap().values().cloned().collect();
        persist_json_atomic(&self.path, &snapshot)
    }

    /// Steps 2-4 only: computes whether `alarm` would trigger right now,
    /// without persisting an event.
    pub fn evaluate(&self, alarm_id: &str, now: i64) -> GrepWiseResult<(bool, usize)> {
        let alarm = self
            .alarms
            .read()
            .unwrap()
            .get(alarm_id)
            .cloned()
            .ok_or_else(|| crate::error::GrepWiseError::not_found(format!("unknown alarm {alarm_id}")))?;
        let matches = self.run_query(&alarm, now)?;
        Ok((alarm.condition.evaluate(matches.len(), alarm.threshold), matches.len()))
    }

    fn run_query(&self, alarm: &Alarm, now: i64) -> GrepWiseResult<Vec<crate::record::LogRecord>> {
        let start = now - alarm.time_window_minutes * 60_000;
        let (query, is_regex) = match alarm.query.strip_prefix("regex:") {
            Some(pattern) => (pattern.to_string(), true),
            None => (alarm.query.clone(), false),
        };
        self.search.search(
            Some(&query),
            is_regex,
            Some("custom"),
            Some(start),
            Some(now),
            now,
        )
    }

    /// Performs a full evaluation tick for one alarm: runs the query,
    /// checks the condition, applies grouping/throttling, persists or
    /// coalesces an `AlarmEvent`, and dispatches notifications.
    pub async fn tick(&self, alarm_id: &str, now: i64) -> GrepWiseResult<()> {
        let alarm = {
            let alarms = self.alarms.read().unwrap();
            match alarms.get(alarm_id) {
                Some(a) if a.enabled => a.clone(),
                _ => return Ok(()),
            }
        };

        let matches = self.run_query(&alarm, now)?;
        if !alarm.condition.evaluate(matches.len(), alarm.threshold) {
            return Ok(());
        }

        let bucket = match &alarm.grouping_key {
            Some(key) => matches
                .first()
                .and_then(|r| r.metadata.get(key).cloned())
                .unwrap_or_default(),
            None => String::new(),
        };

        let event_id = self.coalesce_event(&alarm, &bucket, matches.len(), now);

        if !self.allow_notification(&alarm, &bucket, now) {
            return Ok(());
        }

        let event = self.events.read().unwrap().get(&event_id).cloned();
        let Some(event) = event else { return Ok(()) };

        for channel_config in &alarm.notification_channels {
            let channel = channel_for(channel_config.kind);
            if let Err(reason) =
                dispatch_with_retry(channel.as_ref(), &channel_config.destination, &event).await
            {
                self.mark_notify_failed(&event_id, &reason);
            }
        }
        Ok(())
    }

    fn coalesce_event(&self, alarm: &Alarm, bucket: &str, match_count: usize, now: i64) -> String {
        let mut throttles = self.throttles.write().unwrap();
        let state = throttles.entry(alarm.id.clone()).or_default();
        let grouping_window_ms = alarm.grouping_window_minutes * 60_000;

        if let Some(existing_id) = state.open_event.get(bucket) {
            let mut events = self.events.write().unwrap();
            if let Some(event) = events.get_mut(existing_id) {
                if now - event.timestamp <= grouping_window_ms
                    && event.status != AlarmEventStatus::Resolved
                {
                    event.match_count = match_count;
                    return existing_id.clone();
                }
            }
        }

        let id = Uuid::new_v4().to_string();
        self.events.write().unwrap().insert(
            id.clone(),
            AlarmEvent {
                id: id.clone(),
                alarm_id: alarm.id.clone(),
                alarm_name: alarm.name.clone(),
                timestamp: now,
                status: AlarmEventStatus::Triggered,
                match_count,
                acknowledged_by: None,
                acknowledged_at: None,
                resolved_by: None,
                resolved_at: None,
                details: BTreeMap::new(),
            },
        );
        state.open_event.insert(bucket.to_string(), id.clone());
        id
    }

    fn allow_notification(&self, alarm: &Alarm, bucket: &str, now: i64) -> bool {
        let Some(max_per_window) = alarm.max_notifications_per_window else { return true };
        let window_ms = alarm.throttle_window_minutes * 60_000;

        let mut throttles = self.throttles.write().unwrap();
        let state = throttles.entry(alarm.id.clone()).or_default();
        let sent = state.sent_at.entry(bucket.to_string()).or_default();
        sent.retain(|&t| now - t < window_ms);

        if sent.len() >= max_per_window as usize {
            return false;
        }
        sent.push(now);
        true
    }

    fn mark_notify_failed(&self, event_id: &str, reason: &str) {
        if let Some(event) = self.events.write().unwrap().get_mut(event_id) {
            event.details.insert("NOTIFY_FAILED".to_string(), reason.to_string());
        }
        tracing::error!(event_id, reason, "alarm notification exhausted retry budget");
    }

    pub fn acknowledge(&self, event_id: &str, by: &str, now: i64) -> GrepWiseResult<()> {
        let mut events = self.events.write().unwrap();
        let event = events
            .get_mut(event_id)
            .ok_or_else(|| crate::error::GrepWiseError::not_found(format!("unknown event {event_id}")))?;
        event.status = AlarmEventStatus::Acknowledged;
        event.acknowledged_by = Some(by.to_string());
        event.acknowledged_at = Some(now);
        Ok(())
    }

    pub fn resolve(&self, event_id: &str, by: &str, now: i64) -> GrepWiseResult<()> {
        let mut events = self.events.write().unwrap();
        let event = events
            .get_mut(event_id)
            .ok_or_else(|| crate::error::GrepWiseError::not_found(format!("unknown event {event_id}")))?;
        event.status = AlarmEventStatus::Resolved;
        event.resolved_by = Some(by.to_string());
        event.resolved_at = Some(now);
        Ok(())
    }

    /// Runs a tick for every enabled alarm; the caller (scheduler job)
    /// owns the `min(evalPeriod, 30s)` wakeup cadence per alarm.
    pub async fn tick_all(&self, now: i64) {
        let ids: Vec<String> = self.alarms.read().unwrap().keys().cloned().collect();
        for id in ids {
            if let Err(err) = self.tick(&id, now).await {
                tracing::error!(alarm = id, %err, "alarm evaluation failed");
            }
        }
    }
}

pub fn now() -> i64 {
    now_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheConfig, SearchCache};
    use crate::index::IndexEngine;
    use crate::record::LogRecordBuilder;
    use crate::redactor::Redactor;

    async fn harness() -> (tempfile::TempDir, AlarmEngine) {
        let dir = tempfile::tempdir().unwrap();
        let index = Arc::new(IndexEngine::open(dir.path().join("index")).unwrap());
        index
            .index(vec![
                LogRecordBuilder::new("app", "err 1").level("ERROR").build(1000, i64::MAX),
                LogRecordBuilder::new("app", "err 2").level("ERROR").build(2000, i64::MAX),
            ])
            .await
            .unwrap();
        let cache = Arc::new(SearchCache::new(CacheConfig::default()));
        let redactor = Arc::new(Redactor::new(Default::default()).unwrap());
        let search = Arc::new(SearchService::new(index, cache, redactor));
        let engine = AlarmEngine::load(dir.path().join("alarms.json"), search);
        (dir, engine)
    }

    fn sample_alarm() -> Alarm {
        Alarm {
            id: "a1".to_string(),
            name: "too many errors".to_string(),
            query: "err".to_string(),
            condition: Condition::CountGt,
            threshold: 1,
            time_window_minutes: 1_000_000,
            enabled: true,
            notification_channels: vec![],
            throttle_window_minutes: 15,
            max_notifications_per_window: Some(1),
            grouping_key: None,
            grouping_window_minutes: 15,
        }
    }

    #[tokio::test]
    async fn manual_evaluate_reports_trigger_without_persisting() {
        let (_dir, engine) = harness().await;
        engine.upsert_alarm(sample_alarm()).unwrap();

        let (would_trigger, count) = engine.evaluate("a1", 10_000_000).unwrap();
        assert!(would_trigger);
        assert_eq!(count, 2);
        assert!(engine.list_events().is_empty());
    }

    #[tokio::test]
    async fn tick_creates_event_and_throttles_second_notification() {
        let (_dir, engine) = harness().await;
        engine.upsert_alarm(sample_alarm()).unwrap();

        engine.tick("a1", 10_000_000).await.unwrap();
        assert_eq!(engine.list_events().len(), 1);

        engine.tick("a1", 10_000_001).await.unwrap();
        assert_eq!(engine.list_events().len(), 1);
    }

    #[tokio::test]
    async fn acknowledge_then_resolve_transitions_status() {
        let (_dir, engine) = harness().await;
        engine.upsert_alarm(sample_alarm()).unwrap();
        engine.tick("a1", 10_000_000).await.unwrap();

        let event_id = engine.list_events()[0].id.clone();
        engine.acknowledge(&event_id, "alice", 10_000_001).unwrap();
        assert_eq!(
            engine.events.read().unwrap().get(&event_id).unwrap().status,
            AlarmEventStatus::Acknowledged
        );

        engine.resolve(&event_id, "alice", 10_000_002).unwrap();
        assert_eq!(
            engine.events.read().unwrap().get(&event_id).unwrap().status,
            AlarmEventStatus::Resolved
        );
    }
}
