//! Metrics facade for layerdb.
//!
//! Provides a [`MetricsRecorder`] trait with domain-specific methods and
//! default no-op implementations. A global singleton recorder is accessed via
//! [`recorder()`], and convenience free functions delegate to it.
//!
//! # Usage
//!
//! Callers record metrics via free functions:
//! ```ignore
//! layerdb_metrics::record_clean_node_hit();
//! layerdb_metrics::record_buffer_flush(nodes, bytes, latency_secs);
//! ```
//!
//! At startup, install a backend with [`install`]. Without one, every call is
//! a no-op.

use std::sync::OnceLock;

// ═══════════════════════════════════════════════════════════════════════
// Trait
// ═══════════════════════════════════════════════════════════════════════

/// Domain-specific metrics recording trait.
///
/// All methods have default no-op implementations so backends only need
/// to override the metrics they care about.
#[allow(unused_variables)]
pub trait MetricsRecorder: Send + Sync + 'static {
    // ── Layer reads ──────────────────────────────────────────────────

    /// Record a read served by a diff layer, with the chain depth reached.
    fn record_diff_hit(&self, depth: usize) {}

    /// Record a read served by the dirty aggregation buffer.
    fn record_dirty_hit(&self) {}

    /// Record a clean node cache hit.
    fn record_clean_node_hit(&self) {}

    /// Record a clean node cache miss.
    fn record_clean_node_miss(&self) {}

    /// Record a clean state cache hit.
    fn record_clean_state_hit(&self) {}

    /// Record a clean state cache miss.
    fn record_clean_state_miss(&self) {}

    /// Record a read that fell through to the key-value store.
    fn record_disk_read(&self, latency_secs: f64) {}

    // ── Commit path ──────────────────────────────────────────────────

    /// Record a diff layer appended to the tree.
    fn record_layer_added(&self, nodes: usize, states: usize, size: u64) {}

    /// Record diff layers flattened into the disk layer.
    fn record_layers_flattened(&self, count: usize) {}

    /// Record a buffer flush: node count, batch bytes, latency.
    fn record_buffer_flush(&self, nodes: usize, bytes: u64, latency_secs: f64) {}

    /// Record a single-step state revert.
    fn record_revert(&self, latency_secs: f64) {}

    // ── History ──────────────────────────────────────────────────────

    /// Record a history entry written, with its encoded size.
    fn record_history_written(&self, bytes: u64, latency_secs: f64) {}

    /// Record history entries pruned from the tail.
    fn record_history_pruned(&self, count: u64) {}

    // ── Gauges ───────────────────────────────────────────────────────

    /// Set the number of live layers in the tree.
    fn set_layer_count(&self, count: usize) {}

    /// Set the aggregation buffer's current size in bytes.
    fn set_buffer_size(&self, bytes: u64) {}
}

// ═══════════════════════════════════════════════════════════════════════
// Global recorder
// ═══════════════════════════════════════════════════════════════════════

/// No-op recorder used until a backend is installed.
struct NoopRecorder;

impl MetricsRecorder for NoopRecorder {}

static RECORDER: OnceLock<Box<dyn MetricsRecorder>> = OnceLock::new();

/// Install a metrics backend. Only the first call wins; later calls are
/// ignored (the backend is process-global).
pub fn install(recorder: Box<dyn MetricsRecorder>) {
    let _ = RECORDER.set(recorder);
}

/// Access the installed recorder, or the no-op default.
pub fn recorder() -> &'static dyn MetricsRecorder {
    RECORDER
        .get()
        .map(|b| b.as_ref())
        .unwrap_or(&NoopRecorder)
}

// ═══════════════════════════════════════════════════════════════════════
// Free-function delegates
// ═══════════════════════════════════════════════════════════════════════

/// Record a read served by a diff layer, with the chain depth reached.
pub fn record_diff_hit(depth: usize) {
    recorder().record_diff_hit(depth);
}

/// Record a read served by the dirty aggregation buffer.
pub fn record_dirty_hit() {
    recorder().record_dirty_hit();
}

/// Record a clean node cache hit.
pub fn record_clean_node_hit() {
    recorder().record_clean_node_hit();
}

/// Record a clean node cache miss.
pub fn record_clean_node_miss() {
    recorder().record_clean_node_miss();
}

/// Record a clean state cache hit.
pub fn record_clean_state_hit() {
    recorder().record_clean_state_hit();
}

/// Record a clean state cache miss.
pub fn record_clean_state_miss() {
    recorder().record_clean_state_miss();
}

/// Record a read that fell through to the key-value store.
pub fn record_disk_read(latency_secs: f64) {
    recorder().record_disk_read(latency_secs);
}

/// Record a diff layer appended to the tree.
pub fn record_layer_added(nodes: usize, states: usize, size: u64) {
    recorder().record_layer_added(nodes, states, size);
}

/// Record diff layers flattened into the disk layer.
pub fn record_layers_flattened(count: usize) {
    recorder().record_layers_flattened(count);
}

/// Record a buffer flush: node count, batch bytes, latency.
pub fn record_buffer_flush(nodes: usize, bytes: u64, latency_secs: f64) {
    recorder().record_buffer_flush(nodes, bytes, latency_secs);
}

/// Record a single-step state revert.
pub fn record_revert(latency_secs: f64) {
    recorder().record_revert(latency_secs);
}

/// Record a history entry written, with its encoded size.
pub fn record_history_written(bytes: u64, latency_secs: f64) {
    recorder().record_history_written(bytes, latency_secs);
}

/// Record history entries pruned from the tail.
pub fn record_history_pruned(count: u64) {
    recorder().record_history_pruned(count);
}

/// Set the number of live layers in the tree.
pub fn set_layer_count(count: usize) {
    recorder().set_layer_count(count);
}

/// Set the aggregation buffer's current size in bytes.
pub fn set_buffer_size(bytes: u64) {
    recorder().set_buffer_size(bytes);
}
