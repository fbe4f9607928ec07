//! Snapshot generator handle.
//!
//! The flat state can be (re)built in the background by an external task that
//! walks the trie and fills in the `a`/`o` records. The store does not run
//! that task; it only shares a handle with it. The handle carries the
//! generation progress marker (flat-state reads beyond it answer
//! `NotCoveredYet`), a pause gate the flush path closes while it writes, and
//! the process shutdown signal that long operations honor between per-key
//! writes.

use std::sync::{Condvar, Mutex};

#[derive(Default)]
struct GenState {
    /// Highest flat-state key (prefix stripped) covered so far.
    marker: Vec<u8>,
    done: bool,
    paused: bool,
    aborted: bool,
}

/// Shared handle between the store and the external snapshot generator task.
#[derive(Default)]
pub struct Generator {
    state: Mutex<GenState>,
    resumed: Condvar,
}

impl Generator {
    /// A handle for a generation that starts from scratch.
    pub fn new() -> Self {
        Self::default()
    }

    /// A handle for an already completed generation.
    pub fn completed() -> Self {
        let gen = Self::default();
        gen.state.lock().unwrap().done = true;
        gen
    }

    /// Whether generation has finished.
    pub fn is_done(&self) -> bool {
        self.state.lock().unwrap().done
    }

    /// Whether the flat-state key `key` (without its one-byte family prefix)
    /// lies within the generated range.
    pub fn covers(&self, key: &[u8]) -> bool {
        let state = self.state.lock().unwrap();
        state.done || key <= state.marker.as_slice()
    }

    /// Advance the progress marker. Called by the generator task.
    pub fn advance(&self, marker: Vec<u8>) {
        let mut state = self.state.lock().unwrap();
        debug_assert!(marker.as_slice() >= state.marker.as_slice());
        state.marker = marker;
    }

    /// Mark generation as complete. Called by the generator task.
    pub fn finish(&self) {
        self.state.lock().unwrap().done = true;
    }

    /// Current progress marker, `None` once generation completed.
    pub fn marker(&self) -> Option<Vec<u8>> {
        let state = self.state.lock().unwrap();
        if state.done {
            None
        } else {
            Some(state.marker.clone())
        }
    }

    /// Close the pause gate. The flush path holds it closed while writing so
    /// the generator cannot race the batch.
    pub fn pause(&self) {
        self.state.lock().unwrap().paused = true;
    }

    /// Reopen the pause gate.
    pub fn resume(&self) {
        self.state.lock().unwrap().paused = false;
        self.resumed.notify_all();
    }

    /// Block while the gate is closed. Called by the generator task between
    /// writes; returns `false` if shutdown was signaled instead.
    pub fn wait_if_paused(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        while state.paused && !state.aborted {
            state = self.resumed.wait(state).unwrap();
        }
        !state.aborted
    }

    /// Signal shutdown. Long operations stop between per-key writes.
    pub fn abort(&self) {
        self.state.lock().unwrap().aborted = true;
        self.resumed.notify_all();
    }

    /// Whether shutdown was signaled.
    pub fn is_aborted(&self) -> bool {
        self.state.lock().unwrap().aborted
    }
}
