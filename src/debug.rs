use crate::snapshot::{SceneSnapshot, SnapshotKind};
use std::env;
use std::sync::atomic::{AtomicBool, Ordering};

static DEBUG_MODE: AtomicBool = AtomicBool::new(false);
static TRACE_MODE: AtomicBool = AtomicBool::new(false);

/// Initialize debug mode from environment variables
///
/// - `ECS_REPLICA_DEBUG=1`: dump every snapshot as pretty JSON at `debug` level
/// - `ECS_REPLICA_TRACE=1`: human-readable summaries and codec timings at `trace` level
pub fn init_debug_mode() {
    let debug = env::var("ECS_REPLICA_DEBUG").is_ok();
    let trace = env::var("ECS_REPLICA_TRACE").is_ok();

    set_modes(debug, trace);

    if debug {
        log::info!("Debug mode enabled - snapshots will be logged as JSON");
    }

    if trace {
        log::info!("Trace mode enabled - human-readable operation logs");
    }
}

/// Override the environment, mainly for tests and embedding hosts.
pub fn set_modes(debug: bool, trace: bool) {
    DEBUG_MODE.store(debug, Ordering::Relaxed);
    TRACE_MODE.store(trace, Ordering::Relaxed);
}

pub fn is_debug_enabled() -> bool {
    DEBUG_MODE.load(Ordering::Relaxed)
}

pub fn is_trace_enabled() -> bool {
    TRACE_MODE.load(Ordering::Relaxed)
}

/// Log a scene snapshot in JSON format if debug mode is enabled
pub fn log_snapshot(label: &str, snapshot: &SceneSnapshot) {
    if !is_debug_enabled() {
        return;
    }

    match serde_json::to_string_pretty(snapshot) {
        Ok(json) => {
            log::debug!(
                "{} snapshot {} ({} entities):\n{}",
                label,
                snapshot.snapshot_id(),
                snapshot.entities.len(),
                json
            );
        }
        Err(e) => {
            log::warn!("Failed to serialize snapshot to JSON: {}", e);
        }
    }
}

/// Trace a scene snapshot in human-readable format if trace mode is enabled
pub fn trace_snapshot(snapshot: &SceneSnapshot) {
    if !is_trace_enabled() {
        return;
    }

    log::trace!("{}", snapshot_summary(snapshot));
}

/// Trace a serialization operation
pub fn trace_serialization(codec: &str, component_type: &str, size_bytes: usize, duration_micros: u128) {
    if !is_trace_enabled() {
        return;
    }

    log::trace!(
        "Serialized {} into {} using {} in {}µs",
        component_type,
        format_bytes(size_bytes),
        codec,
        duration_micros
    );
}

/// Trace a deserialization operation
pub fn trace_deserialization(codec: &str, component_type: &str, size_bytes: usize, duration_micros: u128) {
    if !is_trace_enabled() {
        return;
    }

    log::trace!(
        "Deserialized {} from {} using {} in {}µs",
        component_type,
        format_bytes(size_bytes),
        codec,
        duration_micros
    );
}

/// Format bytes in human-readable format (KB, MB, etc.)
pub fn format_bytes(bytes: usize) -> String {
    const KB: usize = 1024;
    const MB: usize = KB * 1024;
    const GB: usize = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}

/// One-line description of a snapshot.
pub fn snapshot_summary(snapshot: &SceneSnapshot) -> String {
    let mut summary = match snapshot.kind {
        SnapshotKind::Full => format!(
            "Full snapshot {} (v{}): {} entities, {} components, {}",
            snapshot.snapshot_id(),
            snapshot.version,
            snapshot.entities.len(),
            snapshot.component_count(),
            format_bytes(snapshot.payload_size())
        ),
        SnapshotKind::Incremental => format!(
            "Incremental snapshot {} (v{}, base {}): {} entities, {} components, {}",
            snapshot.snapshot_id(),
            snapshot.version,
            snapshot.base_snapshot_id.as_deref().unwrap_or("none"),
            snapshot.entities.len(),
            snapshot.component_count(),
            format_bytes(snapshot.payload_size())
        ),
    };

    if !snapshot.removed_entities.is_empty() {
        summary.push_str(&format!(", {} removed", snapshot.removed_entities.len()));
    }

    summary
}
