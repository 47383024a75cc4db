/*!
 * Commonly used core types in one import.
 */

pub use crate::error::{Error, Result};

pub use crate::types::{as_number, new_id, DeviceId, Params, Value};

pub use crate::device::{
    Capability, CommandResponse, Credentials, Device, DeviceCommand, DeviceFilter, DeviceGroup,
    DeviceState, DeviceStatus, DeviceType, DeviceUpdate, Priority, Protocol, ResponseStatus,
    Scene,
};

pub use crate::event::{kinds, DeviceEvent, EventBus, Severity, SharedEventBus};

pub use crate::telemetry::{Resolution, TelemetryAggregation, TelemetryMetric};

pub use crate::store::{
    DeviceStore, EventStore, MemoryStore, SceneStore, SharedStore, Store, TelemetryStore,
};

pub use crate::config::{Config, ConfigBuilder, SharedConfig};

pub use crate::utils::{spawn_and_log, until, with_timeout, TaskSet};

pub use crate::params;
pub use tracing::{debug, error, info, trace, warn};
