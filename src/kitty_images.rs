//! Kitty graphics renderer: reconciles per-PTY per-screen image and
//! placement state from the emulators into host display commands, with
//! viewport clipping, overlay exclusion zones, layered visibility and
//! scroll-aware positioning. All bytes leave through the transmit broker.

use std::collections::{HashMap, HashSet};

use crate::commands::{
    DisplayGeometry, delete_image_command, delete_placement_command, display_command,
    transmit_commands,
};
use crate::emulator::SharedEmulator;
use crate::geometry::{PixelRect, subtract_all};
use crate::kitty_broker::TransmitBroker;
use crate::types::*;

/// Geometry and wiring for one pane, refreshed by the UI task before each
/// flush.
pub struct PaneGeometry {
    pub pty: PtyId,
    pub emulator: SharedEmulator,
    /// Pane origin in host cells.
    pub offset_x: u16,
    pub offset_y: u16,
    pub cols: u16,
    pub rows: u16,
    pub viewport_offset: usize,
    pub scrollback_length: usize,
    pub layer: PaneLayer,
    pub hidden: bool,
}

struct PaneState {
    pty: PtyId,
    emulator: SharedEmulator,
    offset_x: u16,
    offset_y: u16,
    cols: u16,
    rows: u16,
    viewport_offset: usize,
    scrollback_length: usize,
    layer: PaneLayer,
    hidden: bool,
    is_alternate_screen: bool,
    /// Set while an alt/main flip is in progress this flush; allows
    /// placement reuse across the swap.
    screen_transition: bool,
    removed: bool,
}

#[derive(Default)]
struct ScreenState {
    guest_ids: Vec<u32>,
    placements: Vec<KittyPlacement>,
    initialized: bool,
}

struct ImageCache {
    host_id: u32,
    info: KittyImageInfo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct PlacementKey {
    image_id: u32,
    tag: PlacementTag,
    placement_id: u32,
    /// Clip fragments of one placement get consecutive indices; the order
    /// of `clip_rects` is fixed, so keys stay stable across frames.
    fragment: u16,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct PlacementRender {
    host_id: u32,
    host_placement: u32,
    geo: DisplayGeometry,
}

pub struct GraphicsRenderer {
    panes: HashMap<PaneId, PaneState>,
    screen_states: HashMap<(PtyId, ScreenKind), ScreenState>,
    image_registry: HashMap<PtyId, HashMap<u32, ImageCache>>,
    placements_by_pane: HashMap<PaneId, HashMap<PlacementKey, PlacementRender>>,
    pending_pty_deletes: Vec<PtyId>,
    clip_rects: Vec<PixelRect>,
    visible_layers: HashSet<PaneLayer>,
    next_host_placement: u32,
    cell_width: u32,
    cell_height: u32,
    quiet: bool,
}

impl GraphicsRenderer {
    pub fn new(quiet: bool) -> Self {
        let mut visible_layers = HashSet::new();
        visible_layers.insert(PaneLayer::Base);
        visible_layers.insert(PaneLayer::Overlay);
        GraphicsRenderer {
            panes: HashMap::new(),
            screen_states: HashMap::new(),
            image_registry: HashMap::new(),
            placements_by_pane: HashMap::new(),
            pending_pty_deletes: Vec::new(),
            clip_rects: Vec::new(),
            visible_layers,
            next_host_placement: 1,
            cell_width: 8,
            cell_height: 16,
            quiet,
        }
    }

    /// Cell metrics from the host resolution; placement scaling depends on
    /// them.
    pub fn set_metrics(&mut self, resolution_width: u32, resolution_height: u32, cols: u16, rows: u16) {
        if cols > 0 && rows > 0 {
            self.cell_width = (resolution_width / cols as u32).max(1);
            self.cell_height = (resolution_height / rows as u32).max(1);
        }
    }

    pub fn set_clip_rects(&mut self, rects: Vec<PixelRect>) {
        self.clip_rects = rects;
    }

    pub fn set_layer_visible(&mut self, layer: PaneLayer, visible: bool) {
        if visible {
            self.visible_layers.insert(layer);
        } else {
            self.visible_layers.remove(&layer);
        }
    }

    /// Register or refresh a pane before a flush.
    pub fn sync_pane(&mut self, pane: PaneId, geo: PaneGeometry) {
        let entry = self.panes.entry(pane).or_insert_with(|| PaneState {
            pty: geo.pty,
            emulator: geo.emulator.clone(),
            offset_x: geo.offset_x,
            offset_y: geo.offset_y,
            cols: geo.cols,
            rows: geo.rows,
            viewport_offset: geo.viewport_offset,
            scrollback_length: geo.scrollback_length,
            layer: geo.layer,
            hidden: geo.hidden,
            is_alternate_screen: false,
            screen_transition: false,
            removed: false,
        });
        entry.pty = geo.pty;
        entry.emulator = geo.emulator;
        entry.offset_x = geo.offset_x;
        entry.offset_y = geo.offset_y;
        entry.cols = geo.cols;
        entry.rows = geo.rows;
        entry.viewport_offset = geo.viewport_offset;
        entry.scrollback_length = geo.scrollback_length;
        entry.layer = geo.layer;
        entry.hidden = geo.hidden;
        entry.removed = false;
    }

    pub fn remove_pane(&mut self, pane: PaneId) {
        if let Some(state) = self.panes.get_mut(&pane) {
            state.removed = true;
        }
    }

    /// Queue full teardown of a PTY's host-side graphics state.
    pub fn queue_pty_delete(&mut self, pty: PtyId) {
        self.pending_pty_deletes.push(pty);
    }

    /// One frame of reconciliation. Bytes are queued on the broker; the
    /// caller decides when to drain them to the host.
    pub fn flush(&mut self, broker: &mut TransmitBroker) {
        self.detect_transitions();
        self.refresh_screen_states(broker);
        self.render_panes(broker);
        self.drop_removed_panes(broker);
        self.process_pty_deletes(broker);
    }

    fn detect_transitions(&mut self) {
        for state in self.panes.values_mut() {
            if state.removed {
                continue;
            }
            let (disposed, alt) = match state.emulator.lock() {
                Ok(emu) => (emu.is_disposed(), emu.is_alternate_screen()),
                Err(_) => (true, state.is_alternate_screen),
            };
            if disposed {
                state.removed = true;
                continue;
            }
            state.screen_transition = alt != state.is_alternate_screen;
            state.is_alternate_screen = alt;
        }
    }

    /// Query each active (pty, screen) once per flush; the first pane to
    /// visit it pays the cost. A clean, initialized screen with no
    /// transition in progress is skipped silently.
    fn refresh_screen_states(&mut self, broker: &mut TransmitBroker) {
        let mut visited: HashSet<(PtyId, ScreenKind)> = HashSet::new();
        let pane_keys: Vec<PaneId> = self.panes.keys().copied().collect();
        for key in pane_keys {
            let (pty, screen, emulator, transition) = {
                let Some(state) = self.panes.get(&key) else { continue };
                if state.removed || !self.pane_visible(state) {
                    continue;
                }
                let screen = screen_kind(state.is_alternate_screen);
                (state.pty, screen, state.emulator.clone(), state.screen_transition)
            };
            if !visited.insert((pty, screen)) {
                continue;
            }
            let (ids, placements, dirty) = {
                let Ok(mut emu) = emulator.lock() else { continue };
                let dirty = emu.get_kitty_images_dirty();
                let ids = emu.get_kitty_image_ids();
                let placements = emu.get_kitty_placements();
                emu.clear_kitty_images_dirty();
                (ids, placements, dirty)
            };
            {
                let entry = self.screen_states.entry((pty, screen)).or_default();
                if !dirty && entry.initialized && !transition {
                    continue;
                }
                // Alt/main flips may momentarily report no placements while
                // images persist; keep the prior ones so the swap back can
                // reuse them.
                if placements.is_empty() && !ids.is_empty() && transition {
                    entry.guest_ids = ids.clone();
                } else {
                    entry.guest_ids = ids.clone();
                    entry.placements = placements;
                }
                entry.initialized = true;
            }
            self.reconcile_images(pty, &emulator, &ids, broker);
        }
    }

    /// Guest-image reconciliation for one PTY: allocate or reuse host
    /// ids, transmit images the host has never seen, delete the unused.
    fn reconcile_images(
        &mut self,
        pty: PtyId,
        emulator: &SharedEmulator,
        reported: &[u32],
        broker: &mut TransmitBroker,
    ) {
        let registry = self.image_registry.entry(pty).or_default();
        for &guest_id in reported {
            let info = {
                let Ok(emu) = emulator.lock() else { continue };
                emu.get_kitty_image_info(guest_id)
            };
            let Some(info) = info else { continue };

            let broker_known = broker.resolve_host_id(pty, &info);
            let cached = registry.get(&guest_id);
            let cache_fresh = cached.map(|c| c.info.identity() == info.identity()).unwrap_or(false);
            let host_id = broker_known
                .or_else(|| if cache_fresh { cached.map(|c| c.host_id) } else { None })
                .unwrap_or_else(|| broker.assign_host_id(pty, &info));

            // The relay already shipped the bytes for anything with a
            // broker mapping; only renderer-discovered images are
            // transmitted here.
            if !cache_fresh && broker_known.is_none() {
                if let Some(stale) = cached {
                    if stale.host_id != host_id {
                        broker.send_host(pty, delete_image_command(stale.host_id, self.quiet));
                    }
                }
                let data = emulator.lock().ok().and_then(|emu| emu.get_kitty_image_data(guest_id));
                if let Some(data) = data {
                    for cmd in transmit_commands(host_id, &info, &data, self.quiet) {
                        broker.send_host(pty, cmd);
                    }
                }
            }
            registry.insert(guest_id, ImageCache { host_id, info });
        }

        // Images no longer reported on either screen leave the host.
        let mut live: HashSet<u32> = reported.iter().copied().collect();
        for screen in [ScreenKind::Main, ScreenKind::Alternate] {
            if let Some(st) = self.screen_states.get(&(pty, screen)) {
                live.extend(st.guest_ids.iter().copied());
            }
        }
        let dead: Vec<u32> = registry.keys().copied().filter(|id| !live.contains(id)).collect();
        for guest_id in dead {
            if let Some(cache) = registry.remove(&guest_id) {
                broker.send_host(pty, delete_image_command(cache.host_id, self.quiet));
                broker.drop_mapping(pty, &cache.info);
                // Same-flush cleanup of every placement referencing the
                // deleted image.
                for placements in self.placements_by_pane.values_mut() {
                    placements.retain(|key, _| key.image_id != guest_id);
                }
            }
        }
    }

    fn pane_visible(&self, state: &PaneState) -> bool {
        !state.hidden && self.visible_layers.contains(&state.layer)
    }

    fn render_panes(&mut self, broker: &mut TransmitBroker) {
        let pane_keys: Vec<PaneId> = self.panes.keys().copied().collect();
        for key in pane_keys {
            let Some(state) = self.panes.get(&key) else { continue };
            if state.removed {
                continue;
            }
            let visible = self.pane_visible(state);
            let pty = state.pty;
            let screen = screen_kind(state.is_alternate_screen);

            let mut next: HashMap<PlacementKey, PlacementRender> = HashMap::new();
            if visible {
                let placements = self
                    .screen_states
                    .get(&(pty, screen))
                    .map(|st| st.placements.clone())
                    .unwrap_or_default();
                let registry = self.image_registry.get(&pty);
                for placement in &placements {
                    let Some(cache) = registry.and_then(|r| r.get(&placement.image_id)) else {
                        continue;
                    };
                    let prev = self.placements_by_pane.get(&key);
                    for (pkey, geo) in self.placement_fragments(state, placement, &cache.info) {
                        let host_placement = prev
                            .and_then(|m| m.get(&pkey))
                            .map(|p| p.host_placement)
                            .unwrap_or(0);
                        next.insert(
                            pkey,
                            PlacementRender { host_id: cache.host_id, host_placement, geo },
                        );
                    }
                }
            }
            // Allocate host placement ids for newcomers.
            for render in next.values_mut() {
                if render.host_placement == 0 {
                    render.host_placement = self.next_host_placement;
                    self.next_host_placement += 1;
                }
            }

            let prev = self.placements_by_pane.entry(key).or_default();
            for (pkey, old) in prev.iter() {
                if !next.contains_key(pkey) {
                    broker.send_host(
                        pty,
                        delete_placement_command(old.host_id, old.host_placement, self.quiet),
                    );
                }
            }
            for (pkey, render) in &next {
                let unchanged = prev.get(pkey).map(|p| *p == *render).unwrap_or(false);
                if !unchanged {
                    broker.send_host(
                        pty,
                        display_command(render.host_id, render.host_placement, &render.geo, self.quiet),
                    );
                }
            }
            *prev = next;
        }
    }

    /// Compute the clipped display fragments for one placement on one
    /// pane. Returns nothing when the placement scrolled out of view.
    fn placement_fragments(
        &self,
        pane: &PaneState,
        placement: &KittyPlacement,
        info: &KittyImageInfo,
    ) -> Vec<(PlacementKey, DisplayGeometry)> {
        let cw = self.cell_width as i64;
        let ch = self.cell_height as i64;

        let viewport_row =
            placement.screen_y - (pane.scrollback_length as i64 - pane.viewport_offset as i64);
        let viewport_col = placement.screen_x as i64;

        let src_w = if placement.source_width > 0 {
            placement.source_width
        } else {
            info.width.saturating_sub(placement.source_x)
        } as i64;
        let src_h = if placement.source_height > 0 {
            placement.source_height
        } else {
            info.height.saturating_sub(placement.source_y)
        } as i64;
        if src_w <= 0 || src_h <= 0 {
            return Vec::new();
        }

        let (dest_w, dest_h) = match (placement.columns, placement.rows) {
            (0, 0) => (src_w, src_h),
            (c, 0) => {
                let w = c as i64 * cw;
                (w, (w * src_h) / src_w.max(1))
            }
            (0, r) => {
                let h = r as i64 * ch;
                ((h * src_w) / src_h.max(1), h)
            }
            (c, r) => (c as i64 * cw, r as i64 * ch),
        };
        if dest_w <= 0 || dest_h <= 0 {
            return Vec::new();
        }

        let dest = PixelRect::new(
            (pane.offset_x as i64 + viewport_col) * cw + placement.x_offset as i64,
            (pane.offset_y as i64 + viewport_row) * ch + placement.y_offset as i64,
            dest_w,
            dest_h,
        );
        let pane_rect = PixelRect::new(
            pane.offset_x as i64 * cw,
            pane.offset_y as i64 * ch,
            pane.cols as i64 * cw,
            pane.rows as i64 * ch,
        );
        let Some(visible) = dest.intersect(&pane_rect) else {
            return Vec::new();
        };

        subtract_all(visible, &self.clip_rects)
            .into_iter()
            .filter(|frag| !frag.is_empty())
            .enumerate()
            .map(|(idx, frag)| {
                // Scale the pixel crop back into source pixels.
                let sx = placement.source_x as i64 + (frag.x - dest.x) * src_w / dest_w;
                let sy = placement.source_y as i64 + (frag.y - dest.y) * src_h / dest_h;
                let sw = (frag.width * src_w / dest_w).max(1);
                let sh = (frag.height * src_h / dest_h).max(1);
                let geo = DisplayGeometry {
                    global_row: (frag.y / ch) as u32,
                    global_col: (frag.x / cw) as u32,
                    x_offset: (frag.x % cw) as u32,
                    y_offset: (frag.y % ch) as u32,
                    source_x: sx.max(0) as u32,
                    source_y: sy.max(0) as u32,
                    source_width: sw as u32,
                    source_height: sh as u32,
                    columns: ((frag.width + cw - 1) / cw) as u32,
                    rows: ((frag.height + ch - 1) / ch) as u32,
                    z: placement.z,
                };
                (
                    PlacementKey {
                        image_id: placement.image_id,
                        tag: placement.placement_tag,
                        placement_id: placement.placement_id,
                        fragment: idx as u16,
                    },
                    geo,
                )
            })
            .collect()
    }

    fn drop_removed_panes(&mut self, broker: &mut TransmitBroker) {
        let removed: Vec<PaneId> = self
            .panes
            .iter()
            .filter(|(_, s)| s.removed)
            .map(|(k, _)| *k)
            .collect();
        for key in removed {
            let pty = self.panes.remove(&key).map(|s| s.pty);
            if let (Some(pty), Some(placements)) = (pty, self.placements_by_pane.remove(&key)) {
                for render in placements.values() {
                    broker.send_host(
                        pty,
                        delete_placement_command(render.host_id, render.host_placement, self.quiet),
                    );
                }
            }
        }
    }

    fn process_pty_deletes(&mut self, broker: &mut TransmitBroker) {
        for pty in std::mem::take(&mut self.pending_pty_deletes) {
            if let Some(registry) = self.image_registry.remove(&pty) {
                for cache in registry.values() {
                    broker.send_host(pty, delete_image_command(cache.host_id, self.quiet));
                }
            }
            self.screen_states.remove(&(pty, ScreenKind::Main));
            self.screen_states.remove(&(pty, ScreenKind::Alternate));
            let dead_panes: Vec<PaneId> = self
                .panes
                .iter()
                .filter(|(_, s)| s.pty == pty)
                .map(|(k, _)| *k)
                .collect();
            for key in dead_panes {
                self.panes.remove(&key);
                self.placements_by_pane.remove(&key);
            }
            broker.clear_pty(pty);
        }
    }
}

fn screen_kind(alternate: bool) -> ScreenKind {
    if alternate {
        ScreenKind::Alternate
    } else {
        ScreenKind::Main
    }
}
