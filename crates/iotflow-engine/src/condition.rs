/*!
 * Rule conditions.
 *
 * Conditions gate a triggered rule: every listed condition must hold, and
 * a rule without conditions always passes.
 */
use chrono::{DateTime, Datelike, NaiveTime, Utc, Weekday};
use iotflow_core::device::DeviceState;
use iotflow_core::types::{as_number, display_value, Value};
use serde::{Deserialize, Serialize};

use crate::context::AutomationContext;
use crate::types::{clock_time, weekdays, within_window};

/// Comparison operators used by state triggers and conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComparisonOperator {
    /// Equal to
    #[default]
    Eq,
    /// Not equal to
    Ne,
    /// Greater than
    Gt,
    /// Greater than or equal to
    Gte,
    /// Less than
    Lt,
    /// Less than or equal to
    Lte,
    /// Current value is a member of the target list, or a substring of
    /// the target string
    In,
    /// Current value, as text, contains the target
    Contains,
}

impl ComparisonOperator {
    /// Compare a current value against a target. Ordering operators need
    /// both sides to read as numbers and are false otherwise.
    pub fn compare(&self, current: &Value, target: &Value) -> bool {
        match self {
            ComparisonOperator::Eq => values_equal(current, target),
            ComparisonOperator::Ne => !values_equal(current, target),
            ComparisonOperator::Gt => compare_numbers(current, target, |a, b| a > b),
            ComparisonOperator::Gte => compare_numbers(current, target, |a, b| a >= b),
            ComparisonOperator::Lt => compare_numbers(current, target, |a, b| a < b),
            ComparisonOperator::Lte => compare_numbers(current, target, |a, b| a <= b),
            ComparisonOperator::In => match target {
                Value::Array(items) => items.iter().any(|item| values_equal(current, item)),
                Value::String(text) => text.contains(&display_value(current)),
                _ => false,
            },
            ComparisonOperator::Contains => {
                display_value(current).contains(&display_value(target))
            }
        }
    }
}

/// Numbers compare by value so `31` equals `31.0`
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn compare_numbers<F>(a: &Value, b: &Value, cmp: F) -> bool
where
    F: Fn(f64, f64) -> bool,
{
    match (as_number(a), as_number(b)) {
        (Some(a), Some(b)) => cmp(a, b),
        _ => false,
    }
}

/// Compare one attribute of a device's live state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateComparison {
    #[allow(missing_docs)]
    pub device_id: String,
    /// Named state field, state-bag key or sensor metric
    pub attribute: String,
    #[allow(missing_docs)]
    #[serde(default)]
    pub operator: ComparisonOperator,
    #[allow(missing_docs)]
    pub value: Value,
}

impl StateComparison {
    /// Build a comparison
    pub fn new<D: Into<String>, A: Into<String>>(
        device_id: D,
        attribute: A,
        operator: ComparisonOperator,
        value: Value,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            attribute: attribute.into(),
            operator,
            value,
        }
    }

    /// Whether the attribute is present and compares true
    pub fn matches(&self, state: &DeviceState) -> bool {
        state
            .attribute(&self.attribute)
            .map(|current| self.operator.compare(&current, &self.value))
            .unwrap_or(false)
    }
}

/// A condition that must hold for a triggered rule to run its actions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    /// Current UTC time of day within `[start, end]`
    TimeRange {
        #[allow(missing_docs)]
        #[serde(with = "clock_time")]
        start: NaiveTime,
        #[allow(missing_docs)]
        #[serde(with = "clock_time")]
        end: NaiveTime,
    },
    /// Current UTC weekday in the allow-list
    DayOfWeek {
        #[allow(missing_docs)]
        #[serde(with = "weekdays")]
        days: Vec<Weekday>,
    },
    /// A device state comparison
    DeviceState(StateComparison),
}

impl Condition {
    /// Device whose state this condition reads
    pub fn device_id(&self) -> Option<&str> {
        match self {
            Condition::DeviceState(cmp) => Some(&cmp.device_id),
            _ => None,
        }
    }

    /// Evaluate at `now`. A device without a known state fails the
    /// condition.
    pub async fn evaluate(&self, ctx: &dyn AutomationContext, now: DateTime<Utc>) -> bool {
        match self {
            Condition::TimeRange { start, end } => within_window(Some(*start), Some(*end), now.time()),
            Condition::DayOfWeek { days } => days.contains(&now.weekday()),
            Condition::DeviceState(cmp) => ctx
                .device_state(&cmp.device_id)
                .await
                .map(|state| cmp.matches(&state))
                .unwrap_or(false),
        }
    }
}

/// Whether every condition holds; an empty list always holds
pub async fn all_hold(
    conditions: &[Condition],
    ctx: &dyn AutomationContext,
    now: DateTime<Utc>,
) -> bool {
    for condition in conditions {
        if !condition.evaluate(ctx, now).await {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_operators() {
        use ComparisonOperator::*;
        assert!(Eq.compare(&json!(31), &json!(31.0)));
        assert!(Ne.compare(&json!("on"), &json!("off")));
        assert!(Gt.compare(&json!(31), &json!(30)));
        assert!(Gt.compare(&json!("31.5"), &json!(30)));
        assert!(!Gt.compare(&json!("warm"), &json!(30)));
        assert!(Gte.compare(&json!(30), &json!(30)));
        assert!(Lt.compare(&json!(29.9), &json!(30)));
        assert!(Lte.compare(&json!(true), &json!(1)));
        assert!(In.compare(&json!("heat"), &json!(["heat", "cool"])));
        assert!(In.compare(&json!("eco"), &json!("eco,comfort")));
        assert!(!In.compare(&json!("off"), &json!(42)));
        assert!(Contains.compare(&json!("front door open"), &json!("door")));
    }

    #[test]
    fn test_state_comparison_reads_named_fields_and_sensor_data() {
        let mut state = DeviceState::new();
        state.temperature = Some(31.0);
        state.record_metric("co2", 900.0);

        let hot = StateComparison::new("a", "temperature", ComparisonOperator::Gt, json!(30));
        let stuffy = StateComparison::new("a", "co2", ComparisonOperator::Gte, json!(800));
        let missing = StateComparison::new("a", "humidity", ComparisonOperator::Ne, json!(0));
        assert!(hot.matches(&state));
        assert!(stuffy.matches(&state));
        assert!(!missing.matches(&state));
    }

    #[test]
    fn test_condition_wire_format() {
        let conditions: Vec<Condition> = serde_json::from_value(json!([
            {"type": "time_range", "start": "08:00", "end": "18:30"},
            {"type": "day_of_week", "days": ["monday", "friday"]},
            {"type": "device_state", "device_id": "door", "attribute": "locked", "value": true}
        ]))
        .unwrap();
        assert_eq!(conditions.len(), 3);
        assert_eq!(conditions[2].device_id(), Some("door"));
        match &conditions[2] {
            Condition::DeviceState(cmp) => assert_eq!(cmp.operator, ComparisonOperator::Eq),
            other => panic!("unexpected {:?}", other),
        }
    }
}
