/*!
 * Topic names and wildcard filters.
 *
 * Filters follow the MQTT rules: `+` matches exactly one level, `#`
 * matches the remaining levels (including none) and must be last.
 */

/// `devices/{id}/telemetry`
pub fn telemetry(device_id: &str) -> String {
    format!("devices/{}/telemetry", device_id)
}

/// `devices/{id}/events`
pub fn events(device_id: &str) -> String {
    format!("devices/{}/events", device_id)
}

/// `devices/{id}/state`
pub fn state(device_id: &str) -> String {
    format!("devices/{}/state", device_id)
}

/// `devices/{id}/commands`
pub fn commands(device_id: &str) -> String {
    format!("devices/{}/commands", device_id)
}

/// `devices/{id}/commands/response`
pub fn command_responses(device_id: &str) -> String {
    format!("devices/{}/commands/response", device_id)
}

/// `devices/{id}/status`
pub fn status(device_id: &str) -> String {
    format!("devices/{}/status", device_id)
}

/// Whether `topic` matches `filter`
pub fn matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return filter_levels.next().is_none(),
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Whether `filter` is well formed
pub fn is_valid_filter(filter: &str) -> bool {
    if filter.is_empty() {
        return false;
    }
    let levels: Vec<&str> = filter.split('/').collect();
    levels.iter().enumerate().all(|(i, level)| match *level {
        "#" => i == levels.len() - 1,
        "+" => true,
        other => !other.contains('#') && !other.contains('+'),
    })
}
