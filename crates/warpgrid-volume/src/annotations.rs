//! Annotation keys read and written by the autoscaler.

pub const PREFIX: &str = "volscale.warpgrid.dev/";

/// Opt-in switch. Volumes without a truthy value are never touched.
pub const ENABLED: &str = "volscale.warpgrid.dev/enabled";
/// Usage percentage of granted capacity that triggers a resize.
pub const THRESHOLD: &str = "volscale.warpgrid.dev/threshold";
/// Maximum capacity (quantity) the volume may be grown to.
pub const CEILING: &str = "volscale.warpgrid.dev/ceiling";
/// Growth step as a percentage of the requested capacity.
pub const INCREASE: &str = "volscale.warpgrid.dev/increase";
/// Capacity observed right before the last resize (decimal bytes).
pub const PREVIOUS_CAPACITY: &str = "volscale.warpgrid.dev/previous-capacity";
/// JSON-encoded `AutoscalerStatus`.
pub const STATUS: &str = "volscale.warpgrid.dev/status";

pub const DEFAULT_THRESHOLD: &str = "80%";
pub const DEFAULT_INCREASE: &str = "20%";

/// Whether an enablement annotation value turns autoscaling on.
pub fn is_enabled_value(value: &str) -> bool {
    let value = value.trim();
    value.eq_ignore_ascii_case("true") || value.eq_ignore_ascii_case("enabled")
}
