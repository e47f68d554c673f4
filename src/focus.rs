// =============================================================================
// Asset Focus Controller — single-instrument filter gate
// =============================================================================
//
// The controller owns the only copy of AssetFocusState; it is mutated solely
// through set_focus / release_focus and never by aggregation. Filtering
// happens between aggregation and the fan-out hub, so aggregation continues
// for filtered-out instruments and switching focus back resumes with
// continuous candle state.
// =============================================================================

use parking_lot::RwLock;
use serde::Serialize;
use tracing::info;

use crate::types::StreamEvent;

/// Current focus state. `instrument` is `Some` iff `focused`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AssetFocusState {
    pub focused: bool,
    pub instrument: Option<String>,
}

pub struct AssetFocusController {
    state: RwLock<AssetFocusState>,
}

impl AssetFocusController {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(AssetFocusState::default()),
        }
    }

    /// Focus on a single instrument. Idempotent when already focused on the
    /// same instrument. Returns true when the state actually changed, so the
    /// caller knows to publish `asset_focus_changed`.
    pub fn set_focus(&self, instrument: &str) -> bool {
        let mut state = self.state.write();
        if state.focused && state.instrument.as_deref() == Some(instrument) {
            return false;
        }
        state.focused = true;
        state.instrument = Some(instrument.to_string());
        info!(instrument = %instrument, "asset focus set");
        true
    }

    /// Return to pass-everything mode. Returns true when previously focused.
    pub fn release_focus(&self) -> bool {
        let mut state = self.state.write();
        if !state.focused {
            return false;
        }
        state.focused = false;
        state.instrument = None;
        info!("asset focus released");
        true
    }

    /// Whether an event may pass through to the fan-out hub.
    ///
    /// Control events (no instrument) always pass; instrument-scoped events
    /// pass when unfocused or when the instrument matches.
    pub fn allows(&self, event: &StreamEvent) -> bool {
        let Some(instrument) = event.instrument() else {
            return true;
        };
        let state = self.state.read();
        !state.focused || state.instrument.as_deref() == Some(instrument)
    }

    pub fn snapshot(&self) -> AssetFocusState {
        self.state.read().clone()
    }
}

impl Default for AssetFocusController {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
