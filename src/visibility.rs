//! Reference-counted pane visibility. Each mounted terminal view registers
//! its PTY here; the 0→1 and 1→0 transitions drive the emulator's
//! update gate so invisible PTYs stop computing deltas. Owned exclusively
//! by the UI task.

use std::collections::HashMap;

use crate::emulator::SharedEmulator;
use crate::types::PtyId;

#[derive(Default)]
pub struct VisibilityRegistry {
    visible_count: HashMap<PtyId, u32>,
}

impl VisibilityRegistry {
    pub fn new() -> Self {
        VisibilityRegistry::default()
    }

    pub fn count(&self, pty: PtyId) -> u32 {
        self.visible_count.get(&pty).copied().unwrap_or(0)
    }

    /// Bump the count; enables updates on the 0→1 transition.
    pub fn register_visible(&mut self, pty: PtyId, emulator: Option<&SharedEmulator>) {
        let count = self.visible_count.entry(pty).or_insert(0);
        *count += 1;
        if *count == 1 {
            if let Some(emu) = emulator {
                if let Ok(mut emu) = emu.lock() {
                    emu.set_update_enabled(true);
                }
            }
        }
    }

    /// Idempotent re-enable for an emulator that attached after the pane
    /// became visible (the initial fetch is deferred off the mount path).
    pub fn attach_visible_emulator(&mut self, pty: PtyId, emulator: Option<&SharedEmulator>) {
        if self.count(pty) == 0 {
            return;
        }
        if let Some(emu) = emulator {
            if let Ok(mut emu) = emu.lock() {
                emu.set_update_enabled(true);
            }
        }
    }

    /// Drop one reference; disables updates when the count reaches zero.
    pub fn unregister_visible(&mut self, pty: PtyId, emulator: Option<&SharedEmulator>) {
        let Some(count) = self.visible_count.get_mut(&pty) else {
            return;
        };
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.visible_count.remove(&pty);
            if let Some(emu) = emulator {
                if let Ok(mut emu) = emu.lock() {
                    emu.set_update_enabled(false);
                }
            }
        }
    }

    /// Forcibly drop the count on PTY destruction, without touching the
    /// emulator: a disable write must not race the teardown.
    pub fn clear_visible(&mut self, pty: PtyId) {
        self.visible_count.remove(&pty);
    }
}
