//! Trigger definitions and edits.

use crate::api::ApiConfig;
use crate::error::ValidationError;
use crate::schedule::ScheduleConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use trigger_relay_core::TriggerId;

/// Trigger category, fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    /// Fired by the scheduler at planned instants.
    Scheduled,
    /// Fired on demand; calls an external endpoint.
    Api,
}

impl TriggerType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Api => "api",
        }
    }
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriggerType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(Self::Scheduled),
            "api" => Ok(Self::Api),
            other => Err(format!("unknown trigger type '{other}'")),
        }
    }
}

/// Type-specific configuration. Carrying the config inside the variant keeps
/// the type and its config section from disagreeing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "trigger_type", rename_all = "snake_case")]
pub enum TriggerKind {
    Scheduled { schedule_config: ScheduleConfig },
    Api { api_config: ApiConfig },
}

impl TriggerKind {
    #[must_use]
    pub const fn trigger_type(&self) -> TriggerType {
        match self {
            Self::Scheduled { .. } => TriggerType::Scheduled,
            Self::Api { .. } => TriggerType::Api,
        }
    }

    /// Validates the type-specific config as of `now`.
    ///
    /// # Errors
    ///
    /// Returns the first violated rule.
    pub fn validate(&self, now: DateTime<Utc>) -> Result<(), ValidationError> {
        match self {
            Self::Scheduled { schedule_config } => schedule_config.validate(now),
            Self::Api { api_config } => api_config.validate(),
        }
    }
}

/// A registered trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub id: TriggerId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(flatten)]
    pub kind: TriggerKind,
    pub is_active: bool,
    #[serde(default)]
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_triggered_at: Option<DateTime<Utc>>,
    /// Planned next fire, for scheduled triggers that are armed.
    #[serde(default)]
    pub next_run_at: Option<DateTime<Utc>>,
}

impl Trigger {
    #[must_use]
    pub const fn trigger_type(&self) -> TriggerType {
        self.kind.trigger_type()
    }

    /// Schedule config, for scheduled triggers.
    #[must_use]
    pub const fn schedule(&self) -> Option<&ScheduleConfig> {
        match &self.kind {
            TriggerKind::Scheduled { schedule_config } => Some(schedule_config),
            TriggerKind::Api { .. } => None,
        }
    }

    /// API config, for API triggers.
    #[must_use]
    pub const fn api(&self) -> Option<&ApiConfig> {
        match &self.kind {
            TriggerKind::Api { api_config } => Some(api_config),
            TriggerKind::Scheduled { .. } => None,
        }
    }

    /// Active and not deleted: the only state in which a trigger may fire.
    #[must_use]
    pub const fn is_live(&self) -> bool {
        self.is_active && !self.is_deleted
    }
}

fn default_active() -> bool {
    true
}

/// A trigger definition as submitted for creation or testing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTrigger {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(flatten)]
    pub kind: TriggerKind,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

impl NewTrigger {
    /// Creates an active definition.
    #[must_use]
    pub fn new(name: impl Into<String>, kind: TriggerKind) -> Self {
        Self {
            name: name.into(),
            description: None,
            kind,
            is_active: true,
        }
    }

    /// Validates the definition as of `now`.
    ///
    /// # Errors
    ///
    /// Returns the first violated rule.
    pub fn validate(&self, now: DateTime<Utc>) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::EmptyName);
        }
        self.kind.validate(now)
    }

    /// Materializes the definition with a fresh id.
    #[must_use]
    pub fn into_trigger(self, now: DateTime<Utc>) -> Trigger {
        Trigger {
            id: TriggerId::new(),
            name: self.name.trim().to_string(),
            description: self.description,
            kind: self.kind,
            is_active: self.is_active,
            is_deleted: false,
            created_at: now,
            updated_at: now,
            deleted_at: None,
            last_triggered_at: None,
            next_run_at: None,
        }
    }
}

/// A partial update.
///
/// The user-editable fields deserialize from request bodies; the bookkeeping
/// fields are only set by the engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TriggerPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_config: Option<ScheduleConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_config: Option<ApiConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_active: Option<bool>,
    #[serde(skip)]
    pub last_triggered_at: Option<DateTime<Utc>>,
    /// `Some(None)` clears the planned fire.
    #[serde(skip)]
    pub next_run_at: Option<Option<DateTime<Utc>>>,
}

impl TriggerPatch {
    /// Patch that deactivates a trigger and clears its planned fire.
    #[must_use]
    pub fn deactivate() -> Self {
        Self {
            is_active: Some(false),
            next_run_at: Some(None),
            ..Self::default()
        }
    }

    /// Patch recording that the trigger fired at `at`.
    #[must_use]
    pub fn fired_at(at: DateTime<Utc>) -> Self {
        Self {
            last_triggered_at: Some(at),
            ..Self::default()
        }
    }

    /// Patch recording the planned next fire.
    #[must_use]
    pub fn next_run(at: Option<DateTime<Utc>>) -> Self {
        Self {
            next_run_at: Some(at),
            ..Self::default()
        }
    }

    /// Whether the patch changes anything a user can edit.
    #[must_use]
    pub const fn has_user_edits(&self) -> bool {
        self.name.is_some()
            || self.description.is_some()
            || self.schedule_config.is_some()
            || self.api_config.is_some()
            || self.is_active.is_some()
    }

    /// Whether the patch turns the trigger back on.
    #[must_use]
    pub fn reactivates(&self) -> bool {
        self.is_active == Some(true)
    }

    /// Validates the patch against the trigger it will be applied to.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] for an empty name, a config section that
    /// does not match the trigger's type, or an invalid config.
    pub fn validate_against(
        &self,
        trigger: &Trigger,
        now: DateTime<Utc>,
    ) -> Result<(), ValidationError> {
        if self.name.as_deref().is_some_and(|n| n.trim().is_empty()) {
            return Err(ValidationError::EmptyName);
        }

        let trigger_type = trigger.trigger_type();
        if let Some(schedule) = &self.schedule_config {
            if trigger_type != TriggerType::Scheduled {
                return Err(ValidationError::KindMismatch {
                    trigger_type,
                    section: "schedule_config",
                });
            }
            schedule.validate(now)?;
        }
        if let Some(api) = &self.api_config {
            if trigger_type != TriggerType::Api {
                return Err(ValidationError::KindMismatch {
                    trigger_type,
                    section: "api_config",
                });
            }
            api.validate()?;
        }
        Ok(())
    }

    /// Applies the patch in place.
    ///
    /// API headers are merged into the existing ones rather than replaced. A
    /// new schedule clears the planned fire so it is recomputed.
    /// `updated_at` only moves for user edits.
    pub fn apply(&self, trigger: &mut Trigger, now: DateTime<Utc>) {
        if let Some(name) = &self.name {
            trigger.name = name.trim().to_string();
        }
        if let Some(description) = &self.description {
            trigger.description = Some(description.clone());
        }
        if let (Some(schedule), TriggerKind::Scheduled { schedule_config }) =
            (&self.schedule_config, &mut trigger.kind)
        {
            *schedule_config = schedule.clone();
            trigger.next_run_at = None;
        }
        if let (Some(api), TriggerKind::Api { api_config }) = (&self.api_config, &mut trigger.kind)
        {
            let mut headers = std::mem::take(&mut api_config.headers);
            headers.extend(api.headers.clone());
            *api_config = ApiConfig {
                headers,
                ..api.clone()
            };
        }
        if let Some(active) = self.is_active {
            trigger.is_active = active;
        }
        if let Some(at) = self.last_triggered_at {
            trigger.last_triggered_at = Some(at);
        }
        if let Some(next) = self.next_run_at {
            trigger.next_run_at = next;
        }
        if self.has_user_edits() {
            trigger.updated_at = now;
        }
    }
}
