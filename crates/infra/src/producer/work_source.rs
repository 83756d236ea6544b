//! Sources of due work.
//!
//! A work source answers one question: which work items fell due in the
//! half-open window `(since, until]`? The producer turns every answer into
//! jobs. Sources must be deterministic for a given window, since a cycle
//! that loses the watermark race asks again.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use cadence_core::time::duration_millis;
use cadence_core::{DeliveryGuarantee, EpochMillis};

use crate::error::CollaboratorError;

/// Upper bound on fire times a single schedule may contribute to one window.
pub const MAX_FIRES_PER_WINDOW: usize = 10_000;

/// A unit of due work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    /// Natural key of the work (stable across windows).
    pub key: String,
    pub due_at: EpochMillis,
    pub payload: Vec<u8>,
    pub guarantee: DeliveryGuarantee,
}

impl WorkItem {
    pub fn new(key: impl Into<String>, due_at: EpochMillis, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            due_at,
            payload: payload.into(),
            guarantee: DeliveryGuarantee::AtLeastOnce,
        }
    }

    pub fn with_guarantee(mut self, guarantee: DeliveryGuarantee) -> Self {
        self.guarantee = guarantee;
        self
    }

    /// Whether the item falls inside `(since, until]`.
    pub fn is_due_within(&self, since: EpochMillis, until: EpochMillis) -> bool {
        self.due_at > since && self.due_at <= until
    }
}

/// Lists work due in `(since, until]`.
pub trait WorkSource: Send + Sync {
    fn list_due_work(
        &self,
        since: EpochMillis,
        until: EpochMillis,
    ) -> Result<Vec<WorkItem>, CollaboratorError>;
}

impl<F> WorkSource for F
where
    F: Fn(EpochMillis, EpochMillis) -> Result<Vec<WorkItem>, CollaboratorError> + Send + Sync,
{
    fn list_due_work(
        &self,
        since: EpochMillis,
        until: EpochMillis,
    ) -> Result<Vec<WorkItem>, CollaboratorError> {
        self(since, until)
    }
}

/// Fixed list of work items (dev/test).
#[derive(Debug, Clone, Default)]
pub struct StaticWorkSource {
    items: Vec<WorkItem>,
}

impl StaticWorkSource {
    pub fn new(items: Vec<WorkItem>) -> Self {
        Self { items }
    }
}

impl WorkSource for StaticWorkSource {
    fn list_due_work(
        &self,
        since: EpochMillis,
        until: EpochMillis,
    ) -> Result<Vec<WorkItem>, CollaboratorError> {
        Ok(self
            .items
            .iter()
            .filter(|item| item.is_due_within(since, until))
            .cloned()
            .collect())
    }
}

/// When a schedule fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Trigger {
    /// Fixed rate: `anchor + k * every` for every `k >= 0`.
    Every {
        #[serde(rename = "everyMs", with = "millis")]
        every: Duration,
    },
    /// Quartz-style cron expression with a seconds field, evaluated in UTC.
    Cron { cron: String },
}

/// A recurring schedule.
///
/// Never fires before `anchor`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schedule {
    pub key: String,
    #[serde(flatten)]
    pub trigger: Trigger,
    #[serde(default)]
    pub anchor: EpochMillis,
    #[serde(default)]
    pub guarantee: DeliveryGuarantee,
    /// JSON document handed to the executor as the job payload.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Schedule {
    /// Fixed-rate schedule starting at `anchor`.
    pub fn new(key: impl Into<String>, every: Duration, anchor: EpochMillis) -> Self {
        Self::with_trigger(key, Trigger::Every { every }, anchor)
    }

    /// Cron schedule, first eligible fire at or after `anchor`.
    pub fn cron(key: impl Into<String>, expression: impl Into<String>, anchor: EpochMillis) -> Self {
        Self::with_trigger(
            key,
            Trigger::Cron {
                cron: expression.into(),
            },
            anchor,
        )
    }

    fn with_trigger(key: impl Into<String>, trigger: Trigger, anchor: EpochMillis) -> Self {
        Self {
            key: key.into(),
            trigger,
            anchor,
            guarantee: DeliveryGuarantee::AtLeastOnce,
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_guarantee(mut self, guarantee: DeliveryGuarantee) -> Self {
        self.guarantee = guarantee;
        self
    }

    fn validate(&self) -> Result<(), CollaboratorError> {
        if self.key.trim().is_empty() {
            return Err(CollaboratorError::new("schedule key must not be empty"));
        }
        match &self.trigger {
            Trigger::Every { every } if duration_millis(*every) <= 0 => Err(CollaboratorError::new(
                format!("schedule '{}' must fire at least every millisecond", self.key),
            )),
            Trigger::Every { .. } => Ok(()),
            Trigger::Cron { cron } => parse_cron(&self.key, cron).map(|_| ()),
        }
    }

    /// Fire times inside `(since, until]`, ascending.
    pub fn fire_times(
        &self,
        since: EpochMillis,
        until: EpochMillis,
    ) -> Result<Vec<EpochMillis>, CollaboratorError> {
        if until < self.anchor || until <= since {
            return Ok(Vec::new());
        }
        match &self.trigger {
            Trigger::Every { every } => self.interval_fire_times(duration_millis(*every), since, until),
            Trigger::Cron { cron } => self.cron_fire_times(cron, since, until),
        }
    }

    fn interval_fire_times(
        &self,
        every: EpochMillis,
        since: EpochMillis,
        until: EpochMillis,
    ) -> Result<Vec<EpochMillis>, CollaboratorError> {
        if every <= 0 {
            return Err(CollaboratorError::new(format!(
                "schedule '{}' must fire at least every millisecond",
                self.key
            )));
        }

        let mut next = if since < self.anchor {
            self.anchor
        } else {
            // first k with anchor + k * every > since
            let k = (since - self.anchor) / every + 1;
            self.anchor.saturating_add(k.saturating_mul(every))
        };

        let mut fires = Vec::new();
        while next <= until {
            if fires.len() == MAX_FIRES_PER_WINDOW {
                return Err(self.runaway(since, until));
            }
            fires.push(next);
            next = match next.checked_add(every) {
                Some(n) => n,
                None => break,
            };
        }
        Ok(fires)
    }

    fn cron_fire_times(
        &self,
        expression: &str,
        since: EpochMillis,
        until: EpochMillis,
    ) -> Result<Vec<EpochMillis>, CollaboratorError> {
        let cron = parse_cron(&self.key, expression)?;
        // `after` is exclusive, so start just before the anchor to keep it eligible
        let start = since.max(self.anchor.saturating_sub(1));
        let start = DateTime::<Utc>::from_timestamp_millis(start).ok_or_else(|| {
            CollaboratorError::new(format!("schedule '{}': {start} is out of range", self.key))
        })?;

        let mut fires = Vec::new();
        for fire in cron.after(&start) {
            let at = fire.timestamp_millis();
            if at > until {
                break;
            }
            if fires.len() == MAX_FIRES_PER_WINDOW {
                return Err(self.runaway(since, until));
            }
            fires.push(at);
        }
        Ok(fires)
    }

    fn runaway(&self, since: EpochMillis, until: EpochMillis) -> CollaboratorError {
        CollaboratorError::new(format!(
            "schedule '{}' fires more than {MAX_FIRES_PER_WINDOW} times in ({since}, {until}]",
            self.key
        ))
    }
}

/// Parse a Quartz-style expression. `?` ("no specific value") reads as `*`.
fn parse_cron(key: &str, expression: &str) -> Result<cron::Schedule, CollaboratorError> {
    cron::Schedule::from_str(&expression.replace('?', "*")).map_err(|e| {
        CollaboratorError::new(format!("schedule '{key}': invalid cron '{expression}': {e}"))
    })
}

/// Expands recurring schedules into work items.
#[derive(Debug, Clone, Default)]
pub struct ScheduleWorkSource {
    schedules: Vec<Schedule>,
}

impl ScheduleWorkSource {
    pub fn new(schedules: Vec<Schedule>) -> Result<Self, CollaboratorError> {
        for schedule in &schedules {
            schedule.validate()?;
        }
        Ok(Self { schedules })
    }

    /// Parse a JSON array of schedules.
    pub fn from_json(json: &str) -> Result<Self, CollaboratorError> {
        let schedules: Vec<Schedule> = serde_json::from_str(json)
            .map_err(|e| CollaboratorError::new(format!("invalid schedule file: {e}")))?;
        Self::new(schedules)
    }

    /// Load a JSON schedule file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CollaboratorError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            CollaboratorError::new(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json(&json)
    }

    pub fn schedules(&self) -> &[Schedule] {
        &self.schedules
    }
}

impl WorkSource for ScheduleWorkSource {
    fn list_due_work(
        &self,
        since: EpochMillis,
        until: EpochMillis,
    ) -> Result<Vec<WorkItem>, CollaboratorError> {
        let mut items = Vec::new();
        for schedule in &self.schedules {
            let fires = schedule.fire_times(since, until)?;
            if fires.is_empty() {
                continue;
            }
            let payload = serde_json::to_vec(&schedule.payload)
                .map_err(|e| CollaboratorError::new(format!("payload of '{}': {e}", schedule.key)))?;
            items.extend(fires.into_iter().map(|due_at| {
                WorkItem::new(schedule.key.clone(), due_at, payload.clone())
                    .with_guarantee(schedule.guarantee)
            }));
        }
        items.sort_by(|a, b| a.due_at.cmp(&b.due_at).then_with(|| a.key.cmp(&b.key)));
        Ok(items)
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
