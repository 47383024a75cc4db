/*!
 * Automation rules engine.
 *
 * Each enabled rule is evaluated by its own loop on the controller's poll
 * interval. Rules are edge-triggered: a rule fires once when its triggers
 * become satisfied and not again until they have been unsatisfied for at
 * least one evaluation. If the conditions do not hold at the edge the rule
 * stays armed and fires on the first evaluation where they do, within the
 * same trigger episode.
 *
 * Event triggers are pulses: every matching event observed between two
 * evaluations arms one firing.
 */
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use chrono::{DateTime, Datelike, NaiveTime, Utc, Weekday};
use dashmap::DashMap;
use iotflow_core::config::ControllerConfig;
use iotflow_core::event::DeviceEvent;
use iotflow_core::logging::component_span;
use iotflow_core::types::new_id;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn, Instrument};

use crate::action::{Action, ActionResult};
use crate::condition::{all_hold, Condition};
use crate::context::AutomationContext;
use crate::error::{Error, Result};
use crate::trigger::Trigger;
use crate::types::{clock_time, weekdays, within_window};

/// Days and hours a rule is allowed to fire
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleSchedule {
    /// Allowed weekdays; empty means every day
    #[serde(default, with = "weekdays")]
    pub days: Vec<Weekday>,
    /// Earliest time of day
    #[serde(default, with = "clock_time::option", skip_serializing_if = "Option::is_none")]
    pub start: Option<NaiveTime>,
    /// Latest time of day; before `start` means the window spans midnight
    #[serde(default, with = "clock_time::option", skip_serializing_if = "Option::is_none")]
    pub end: Option<NaiveTime>,
}

impl RuleSchedule {
    /// Whether the rule may fire at `now`
    pub fn allows(&self, now: DateTime<Utc>) -> bool {
        (self.days.is_empty() || self.days.contains(&now.weekday()))
            && within_window(self.start, self.end, now.time())
    }
}

fn default_enabled() -> bool {
    true
}

/// A trigger → condition → action rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutomationRule {
    /// Assigned on add when empty
    #[serde(default)]
    pub id: String,
    #[allow(missing_docs)]
    pub name: String,
    #[allow(missing_docs)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[allow(missing_docs)]
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Any satisfied trigger starts the rule
    pub triggers: Vec<Trigger>,
    /// All must hold; empty always holds
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// Run in order when the rule fires
    pub actions: Vec<Action>,
    #[allow(missing_docs)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<RuleSchedule>,
    /// Times the rule fired
    #[serde(default)]
    pub trigger_count: u64,
    #[allow(missing_docs)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_triggered: Option<DateTime<Utc>>,
    #[allow(missing_docs)]
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl AutomationRule {
    /// Create an enabled rule with no triggers, conditions or actions
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            id: String::new(),
            name: name.into(),
            description: None,
            enabled: true,
            triggers: Vec::new(),
            conditions: Vec::new(),
            actions: Vec::new(),
            schedule: None,
            trigger_count: 0,
            last_triggered: None,
            created_at: Utc::now(),
        }
    }

    /// Set the rule ID
    pub fn with_id<S: Into<String>>(mut self, id: S) -> Self {
        self.id = id.into();
        self
    }

    /// Set the rule description
    pub fn with_description<S: Into<String>>(mut self, description: S) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Add a trigger
    pub fn with_trigger(mut self, trigger: Trigger) -> Self {
        self.triggers.push(trigger);
        self
    }

    /// Add a condition
    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    /// Add an action
    pub fn with_action(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }

    /// Restrict when the rule may fire
    pub fn with_schedule(mut self, schedule: RuleSchedule) -> Self {
        self.schedule = Some(schedule);
        self
    }

    /// Set whether the rule is enabled
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Check the rule is complete enough to run
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::validation("rule name must not be empty"));
        }
        if self.triggers.is_empty() {
            return Err(Error::validation(format!("rule '{}' has no triggers", self.name)));
        }
        if self.actions.is_empty() {
            return Err(Error::validation(format!("rule '{}' has no actions", self.name)));
        }
        for trigger in &self.triggers {
            if let Trigger::DeviceState(cmp) = trigger {
                if cmp.device_id.is_empty() || cmp.attribute.is_empty() {
                    return Err(Error::validation(format!(
                        "rule '{}' has a state trigger without device or attribute",
                        self.name
                    )));
                }
            }
        }
        for action in &self.actions {
            if let Action::Delay { seconds } = action {
                if !seconds.is_finite() || *seconds < 0.0 {
                    return Err(Error::validation(format!(
                        "rule '{}' has an invalid delay of {}",
                        self.name, seconds
                    )));
                }
            }
        }
        Ok(())
    }

    /// Whether one of the triggers watches `device_id`
    pub fn references_device(&self, device_id: &str) -> bool {
        self.triggers.iter().any(|t| t.device_id() == Some(device_id))
    }
}

/// Outcome of one evaluation of a rule
#[derive(Debug, Clone, PartialEq)]
pub enum RuleEvaluation {
    /// The rule is disabled
    Disabled,
    /// Outside the rule's schedule; the trigger latch is left untouched
    OutsideSchedule,
    /// No trigger is satisfied
    NotTriggered,
    /// Triggers are still satisfied from an episode that already fired
    AlreadyFired,
    /// Triggered, but a condition does not hold
    ConditionsNotMet,
    /// The rule fired
    Fired {
        /// One result per action, in order
        results: Vec<ActionResult>,
    },
}

/// Rule engine events
#[derive(Debug, Clone)]
pub enum RuleEngineEvent {
    /// Rule was triggered
    RuleTriggered {
        /// Rule ID
        rule_id: String,
        /// Rule name
        rule_name: String,
    },
    /// Every action of a fired rule succeeded
    RuleExecuted {
        /// Rule ID
        rule_id: String,
        /// Rule name
        rule_name: String,
        /// Action results
        results: Vec<ActionResult>,
    },
    /// At least one action of a fired rule failed
    RuleFailed {
        /// Rule ID
        rule_id: String,
        /// Rule name
        rule_name: String,
        /// First failure
        error: String,
    },
    /// Rule was added
    RuleAdded {
        /// Rule ID
        rule_id: String,
        /// Rule name
        rule_name: String,
    },
    /// Rule was removed
    RuleRemoved {
        /// Rule ID
        rule_id: String,
        /// Rule name
        rule_name: String,
    },
    /// Rule was enabled
    RuleEnabled {
        /// Rule ID
        rule_id: String,
        /// Rule name
        rule_name: String,
    },
    /// Rule was disabled
    RuleDisabled {
        /// Rule ID
        rule_id: String,
        /// Rule name
        rule_name: String,
    },
}

#[derive(Debug)]
struct RuleSlot {
    rule: AutomationRule,
    /// Triggers satisfied and already fired in this episode
    latched: bool,
    /// Matching events not yet consumed by an evaluation
    pending_events: u32,
}

impl RuleSlot {
    fn new(rule: AutomationRule) -> Self {
        Self {
            rule,
            latched: false,
            pending_events: 0,
        }
    }
}

/// Rules engine for executing rules
pub struct RuleEngine {
    poll_interval: Duration,
    time_tolerance: Duration,
    rules: DashMap<String, RuleSlot>,
    tasks: DashMap<String, JoinHandle<()>>,
    context: RwLock<Option<Weak<dyn AutomationContext>>>,
    running: AtomicBool,
    event_tx: broadcast::Sender<RuleEngineEvent>,
}

impl std::fmt::Debug for RuleEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleEngine")
            .field("poll_interval", &self.poll_interval)
            .field("rules", &self.rules.len())
            .field("running", &self.is_running())
            .finish()
    }
}

impl RuleEngine {
    /// Create a new rule engine
    pub fn new(config: &ControllerConfig) -> Self {
        let (event_tx, _) = broadcast::channel(100);

        Self {
            poll_interval: config.rule_poll_interval(),
            time_tolerance: Duration::from_secs(config.time_trigger_tolerance_secs),
            rules: DashMap::new(),
            tasks: DashMap::new(),
            context: RwLock::new(None),
            running: AtomicBool::new(false),
            event_tx,
        }
    }

    /// Subscribe to rule engine events
    pub fn subscribe(&self) -> broadcast::Receiver<RuleEngineEvent> {
        self.event_tx.subscribe()
    }

    /// Whether the rule loops are running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn emit(&self, event: RuleEngineEvent) {
        // No subscribers is fine
        let _ = self.event_tx.send(event);
    }

    /// Add a rule, assigning an id when it has none. Returns the id.
    pub fn add_rule(self: &Arc<Self>, mut rule: AutomationRule) -> Result<String> {
        rule.validate()?;
        if rule.id.is_empty() {
            rule.id = new_id();
        }
        let rule_id = rule.id.clone();
        let rule_name = rule.name.clone();
        let enabled = rule.enabled;

        match self.rules.entry(rule_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(iotflow_core::Error::conflict(format!(
                    "rule {} already exists",
                    rule_id
                ))
                .into());
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(RuleSlot::new(rule));
            }
        }

        info!(rule_id = %rule_id, rule = %rule_name, "rule added");
        self.emit(RuleEngineEvent::RuleAdded {
            rule_id: rule_id.clone(),
            rule_name,
        });
        if enabled {
            self.spawn_loop(&rule_id);
        }
        Ok(rule_id)
    }

    /// Replace a rule's definition, keeping its id, statistics and
    /// creation time
    pub fn update_rule(self: &Arc<Self>, rule_id: &str, rule: AutomationRule) -> Result<AutomationRule> {
        rule.validate()?;
        let updated = {
            let mut slot = self
                .rules
                .get_mut(rule_id)
                .ok_or_else(|| Error::not_found("rule", rule_id))?;
            let previous = &slot.rule;
            let updated = AutomationRule {
                id: previous.id.clone(),
                trigger_count: previous.trigger_count,
                last_triggered: previous.last_triggered,
                created_at: previous.created_at,
                ..rule
            };
            slot.rule = updated.clone();
            slot.latched = false;
            slot.pending_events = 0;
            updated
        };
        debug!(rule_id = %rule_id, "rule updated");
        if updated.enabled {
            self.spawn_loop(rule_id);
        }
        Ok(updated)
    }

    /// Remove a rule and stop its loop
    pub fn remove_rule(&self, rule_id: &str) -> Result<AutomationRule> {
        let (_, slot) = self
            .rules
            .remove(rule_id)
            .ok_or_else(|| Error::not_found("rule", rule_id))?;
        if let Some((_, handle)) = self.tasks.remove(rule_id) {
            handle.abort();
        }
        info!(rule_id = %rule_id, "rule removed");
        self.emit(RuleEngineEvent::RuleRemoved {
            rule_id: rule_id.to_string(),
            rule_name: slot.rule.name.clone(),
        });
        Ok(slot.rule)
    }

    /// Get a rule by ID
    pub fn get_rule(&self, rule_id: &str) -> Result<AutomationRule> {
        self.rules
            .get(rule_id)
            .map(|slot| slot.rule.clone())
            .ok_or_else(|| Error::not_found("rule", rule_id))
    }

    /// Get all rules, ordered by creation time
    pub fn list_rules(&self) -> Vec<AutomationRule> {
        let mut rules: Vec<_> = self.rules.iter().map(|slot| slot.rule.clone()).collect();
        rules.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        rules
    }

    /// Ids of the rules with a trigger watching `device_id`
    pub fn rules_for_device(&self, device_id: &str) -> Vec<String> {
        self.rules
            .iter()
            .filter(|slot| slot.rule.references_device(device_id))
            .map(|slot| slot.key().clone())
            .collect()
    }

    /// Enable a rule; its loop starts if the engine is running
    pub fn enable_rule(self: &Arc<Self>, rule_id: &str) -> Result<()> {
        let rule_name = {
            let mut slot = self
                .rules
                .get_mut(rule_id)
                .ok_or_else(|| Error::not_found("rule", rule_id))?;
            slot.rule.enabled = true;
            slot.latched = false;
            slot.rule.name.clone()
        };
        self.emit(RuleEngineEvent::RuleEnabled {
            rule_id: rule_id.to_string(),
            rule_name,
        });
        self.spawn_loop(rule_id);
        Ok(())
    }

    /// Disable a rule; its loop exits at the next poll boundary
    pub fn disable_rule(&self, rule_id: &str) -> Result<()> {
        let rule_name = {
            let mut slot = self
                .rules
                .get_mut(rule_id)
                .ok_or_else(|| Error::not_found("rule", rule_id))?;
            slot.rule.enabled = false;
            slot.pending_events = 0;
            slot.rule.name.clone()
        };
        self.emit(RuleEngineEvent::RuleDisabled {
            rule_id: rule_id.to_string(),
            rule_name,
        });
        Ok(())
    }

    /// Arm the event triggers that accept `event`
    pub fn observe_event(&self, event: &DeviceEvent) {
        for mut slot in self.rules.iter_mut() {
            if slot.rule.enabled && slot.rule.triggers.iter().any(|t| t.matches_event(event)) {
                slot.pending_events = slot.pending_events.saturating_add(1);
                debug!(rule_id = %slot.key(), event = %event.event_type, "event trigger armed");
            }
        }
    }

    /// Evaluate a rule once at `now` and run its actions if it fires
    pub async fn evaluate(
        &self,
        rule_id: &str,
        ctx: &dyn AutomationContext,
        now: DateTime<Utc>,
    ) -> Result<RuleEvaluation> {
        let rule = self.get_rule(rule_id)?;
        if !rule.enabled {
            return Ok(RuleEvaluation::Disabled);
        }
        if let Some(schedule) = &rule.schedule {
            if !schedule.allows(now) {
                return Ok(RuleEvaluation::OutsideSchedule);
            }
        }

        let mut level = false;
        for trigger in &rule.triggers {
            let satisfied = match trigger {
                Trigger::DeviceState(cmp) => ctx
                    .device_state(&cmp.device_id)
                    .await
                    .map_or(false, |state| cmp.matches(&state)),
                Trigger::Time { .. } => trigger.time_matches(now, self.time_tolerance),
                Trigger::Event { .. } => false,
            };
            if satisfied {
                level = true;
                break;
            }
        }

        let (latched, pulse) = {
            let mut slot = self
                .rules
                .get_mut(rule_id)
                .ok_or_else(|| Error::not_found("rule", rule_id))?;
            let pulse = std::mem::take(&mut slot.pending_events) > 0;
            if !level {
                slot.latched = false;
            }
            (slot.latched, pulse)
        };

        if !pulse && !(level && !latched) {
            return Ok(if level {
                RuleEvaluation::AlreadyFired
            } else {
                RuleEvaluation::NotTriggered
            });
        }

        if !all_hold(&rule.conditions, ctx, now).await {
            debug!(rule_id = %rule_id, "rule triggered but conditions not met");
            return Ok(RuleEvaluation::ConditionsNotMet);
        }

        if let Some(mut slot) = self.rules.get_mut(rule_id) {
            if level {
                slot.latched = true;
            }
            slot.rule.trigger_count += 1;
            slot.rule.last_triggered = Some(now);
        }

        info!(rule_id = %rule_id, rule = %rule.name, "rule triggered");
        self.emit(RuleEngineEvent::RuleTriggered {
            rule_id: rule.id.clone(),
            rule_name: rule.name.clone(),
        });

        let mut results = Vec::with_capacity(rule.actions.len());
        for action in &rule.actions {
            let result = action.execute(ctx, &rule.id, &rule.name).await;
            if let Some(error) = result.error() {
                warn!(rule_id = %rule_id, action = action.action_type(), error = %error, "rule action failed");
            }
            results.push(result);
        }

        match results.iter().find_map(|r| r.error()) {
            Some(error) => self.emit(RuleEngineEvent::RuleFailed {
                rule_id: rule.id.clone(),
                rule_name: rule.name.clone(),
                error: error.to_string(),
            }),
            None => self.emit(RuleEngineEvent::RuleExecuted {
                rule_id: rule.id.clone(),
                rule_name: rule.name.clone(),
                results: results.clone(),
            }),
        }

        Ok(RuleEvaluation::Fired { results })
    }

    /// Start a loop for every enabled rule, evaluating against `context`
    pub fn start(self: &Arc<Self>, context: Weak<dyn AutomationContext>) {
        if let Ok(mut slot) = self.context.write() {
            *slot = Some(context);
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let enabled: Vec<String> = self
            .rules
            .iter()
            .filter(|slot| slot.rule.enabled)
            .map(|slot| slot.key().clone())
            .collect();
        for rule_id in &enabled {
            self.spawn_loop(rule_id);
        }
        info!(rules = enabled.len(), "rule engine started");
    }

    /// Stop every rule loop
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let ids: Vec<String> = self.tasks.iter().map(|t| t.key().clone()).collect();
        for rule_id in ids {
            if let Some((_, handle)) = self.tasks.remove(&rule_id) {
                handle.abort();
            }
        }
        info!("rule engine stopped");
    }

    /// Number of rule loops still running
    pub fn active_loops(&self) -> usize {
        self.tasks.iter().filter(|t| !t.value().is_finished()).count()
    }

    fn spawn_loop(self: &Arc<Self>, rule_id: &str) {
        if !self.is_running() {
            return;
        }
        let context = match self.context.read().ok().and_then(|c| c.clone()) {
            Some(context) => context,
            None => return,
        };
        if let Some(handle) = self.tasks.get(rule_id) {
            if !handle.is_finished() {
                return;
            }
        }
        let span = component_span("rule", Some(rule_id));
        let handle = tokio::spawn(
            rule_loop(
                Arc::downgrade(self),
                context,
                rule_id.to_string(),
                self.poll_interval,
            )
            .instrument(span),
        );
        self.tasks.insert(rule_id.to_string(), handle);
    }
}

async fn rule_loop(
    engine: Weak<RuleEngine>,
    context: Weak<dyn AutomationContext>,
    rule_id: String,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    debug!("rule loop started");
    loop {
        ticker.tick().await;
        let (engine, context) = match (engine.upgrade(), context.upgrade()) {
            (Some(engine), Some(context)) => (engine, context),
            _ => break,
        };
        match engine.evaluate(&rule_id, context.as_ref(), Utc::now()).await {
            Ok(RuleEvaluation::Disabled) => break,
            Ok(RuleEvaluation::Fired { results }) => {
                debug!(actions = results.len(), "rule fired")
            }
            Ok(_) => {}
            Err(e) if e.is_not_found() => break,
            Err(e) => warn!(error = %e, "rule evaluation failed"),
        }
    }
    debug!("rule loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::{ComparisonOperator, StateComparison};
    use crate::testing::RecordingContext;
    use chrono::TimeZone;
    use iotflow_core::params;
    use serde_json::json;

    fn engine() -> Arc<RuleEngine> {
        Arc::new(RuleEngine::new(&ControllerConfig::default()))
    }

    fn hot_rule() -> AutomationRule {
        AutomationRule::new("too hot")
            .with_id("r1")
            .with_trigger(Trigger::DeviceState(StateComparison::new(
                "a",
                "temperature",
                ComparisonOperator::Gt,
                json!(30),
            )))
            .with_action(Action::DeviceCommand {
                device_id: "b".into(),
                command: "turn_off".into(),
                parameters: params!(),
            })
    }

    fn saturday_noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_rule_fires_once_per_episode() {
        let engine = engine();
        let ctx = RecordingContext::new();
        engine.add_rule(hot_rule()).unwrap();
        let now = saturday_noon();

        ctx.set_temperature("a", 25.0);
        assert_eq!(engine.evaluate("r1", &ctx, now).await.unwrap(), RuleEvaluation::NotTriggered);

        ctx.set_temperature("a", 31.0);
        assert!(matches!(
            engine.evaluate("r1", &ctx, now).await.unwrap(),
            RuleEvaluation::Fired { .. }
        ));
        assert_eq!(engine.evaluate("r1", &ctx, now).await.unwrap(), RuleEvaluation::AlreadyFired);
        assert_eq!(ctx.commands().len(), 1);

        ctx.set_temperature("a", 29.0);
        engine.evaluate("r1", &ctx, now).await.unwrap();
        ctx.set_temperature("a", 32.0);
        assert!(matches!(
            engine.evaluate("r1", &ctx, now).await.unwrap(),
            RuleEvaluation::Fired { .. }
        ));
        assert_eq!(ctx.commands().len(), 2);
        assert_eq!(engine.get_rule("r1").unwrap().trigger_count, 2);
    }

    #[tokio::test]
    async fn test_rule_waits_for_conditions_within_episode() {
        let engine = engine();
        let ctx = RecordingContext::new();
        let rule = hot_rule().with_condition(Condition::DeviceState(StateComparison::new(
            "door",
            "locked",
            ComparisonOperator::Eq,
            json!(true),
        )));
        engine.add_rule(rule).unwrap();
        let now = saturday_noon();

        ctx.set_temperature("a", 31.0);
        assert_eq!(
            engine.evaluate("r1", &ctx, now).await.unwrap(),
            RuleEvaluation::ConditionsNotMet
        );
        let mut door = iotflow_core::device::DeviceState::new();
        door.locked = Some(true);
        ctx.set_state("door", door);
        assert!(matches!(
            engine.evaluate("r1", &ctx, now).await.unwrap(),
            RuleEvaluation::Fired { .. }
        ));
        assert_eq!(engine.evaluate("r1", &ctx, now).await.unwrap(), RuleEvaluation::AlreadyFired);
    }

    #[tokio::test]
    async fn test_schedule_window_blocks_rule() {
        let engine = engine();
        let ctx = RecordingContext::new();
        let rule = hot_rule().with_schedule(RuleSchedule {
            days: vec![Weekday::Mon, Weekday::Tue],
            start: None,
            end: None,
        });
        engine.add_rule(rule).unwrap();
        ctx.set_temperature("a", 31.0);

        assert_eq!(
            engine.evaluate("r1", &ctx, saturday_noon()).await.unwrap(),
            RuleEvaluation::OutsideSchedule
        );
        let monday = Utc.with_ymd_and_hms(2024, 6, 3, 12, 0, 0).unwrap();
        assert!(matches!(
            engine.evaluate("r1", &ctx, monday).await.unwrap(),
            RuleEvaluation::Fired { .. }
        ));
    }

    #[tokio::test]
    async fn test_event_trigger_fires_per_event() {
        let engine = engine();
        let ctx = RecordingContext::new();
        let rule = AutomationRule::new("motion light")
            .with_id("m")
            .with_trigger(Trigger::Event {
                event_type: "motion".into(),
                device_id: Some("hall".into()),
            })
            .with_action(Action::DeviceCommand {
                device_id: "lamp".into(),
                command: "turn_on".into(),
                parameters: params!(),
            });
        engine.add_rule(rule).unwrap();
        let now = saturday_noon();

        assert_eq!(engine.evaluate("m", &ctx, now).await.unwrap(), RuleEvaluation::NotTriggered);
        engine.observe_event(&DeviceEvent::new("porch", "motion"));
        assert_eq!(engine.evaluate("m", &ctx, now).await.unwrap(), RuleEvaluation::NotTriggered);
        engine.observe_event(&DeviceEvent::new("hall", "motion"));
        assert!(matches!(
            engine.evaluate("m", &ctx, now).await.unwrap(),
            RuleEvaluation::Fired { .. }
        ));
        assert_eq!(engine.evaluate("m", &ctx, now).await.unwrap(), RuleEvaluation::NotTriggered);
    }

    #[tokio::test]
    async fn test_failed_action_does_not_stop_the_rest() {
        let engine = engine();
        let ctx = RecordingContext::new();
        ctx.reject("b");
        let rule = hot_rule().with_action(Action::DeviceCommand {
            device_id: "c".into(),
            command: "turn_on".into(),
            parameters: params!(),
        });
        engine.add_rule(rule).unwrap();
        let mut events = engine.subscribe();
        ctx.set_temperature("a", 40.0);

        match engine.evaluate("r1", &ctx, saturday_noon()).await.unwrap() {
            RuleEvaluation::Fired { results } => {
                assert!(results[0].is_failure());
                assert!(results[1].is_success());
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(events.recv().await.unwrap(), RuleEngineEvent::RuleTriggered { .. }));
        assert!(matches!(events.recv().await.unwrap(), RuleEngineEvent::RuleFailed { .. }));
    }

    #[test]
    fn test_rule_crud() {
        let engine = engine();
        let id = engine.add_rule(hot_rule().with_id("")).unwrap();
        assert!(!id.is_empty());
        assert!(engine.add_rule(hot_rule().with_id(id.clone())).is_err());
        assert!(engine.get_rule("nope").unwrap_err().is_not_found());
        assert_eq!(engine.rules_for_device("a"), vec![id.clone()]);
        assert!(engine.rules_for_device("b").is_empty());

        let renamed = engine.update_rule(&id, hot_rule().with_id("ignored").enabled(false)).unwrap();
        assert_eq!(renamed.id, id);
        assert!(!engine.get_rule(&id).unwrap().enabled);

        assert!(engine.add_rule(AutomationRule::new("empty")).is_err());
        engine.remove_rule(&id).unwrap();
        assert!(engine.list_rules().is_empty());
        assert!(engine.remove_rule(&id).unwrap_err().is_not_found());
    }

    #[test]
    fn test_rule_definition_wire_format() {
        let rule: AutomationRule = serde_json::from_value(json!({
            "name": "night lock",
            "triggers": [{"type": "time", "time": "23:00"}],
            "conditions": [{"type": "day_of_week", "days": ["friday", "saturday"]}],
            "actions": [{"type": "device_command", "device_id": "door", "command": "lock"}],
            "schedule": {"start": "22:00", "end": "06:00"}
        }))
        .unwrap();
        assert!(rule.enabled);
        assert!(rule.validate().is_ok());
        let window = rule.schedule.unwrap();
        assert!(window.allows(Utc.with_ymd_and_hms(2024, 6, 1, 23, 30, 0).unwrap()));
        assert!(!window.allows(saturday_noon()));
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_rule_loop_fires_once_and_stops_when_disabled() {
        let engine = engine();
        let ctx = Arc::new(RecordingContext::new());
        let dyn_ctx: Arc<dyn AutomationContext> = ctx.clone();
        engine.add_rule(hot_rule()).unwrap();
        engine.start(Arc::downgrade(&dyn_ctx));
        assert_eq!(engine.active_loops(), 1);

        ctx.set_temperature("a", 31.0);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(ctx.commands(), vec![("b".to_string(), "turn_off".to_string())]);

        engine.disable_rule("r1").unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(engine.active_loops(), 0);

        ctx.set_temperature("a", 20.0);
        engine.enable_rule("r1").unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        ctx.set_temperature("a", 35.0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(ctx.commands().len(), 2);

        engine.stop();
        assert_eq!(engine.active_loops(), 0);
    }
}
