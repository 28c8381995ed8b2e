use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use model::{DirtyRegion, IntRect, RectF};
use render_protocol::{
    PainterId, PictureVersion, SurfaceId, TextureDriver, TileCompositor, TilePainter,
    TileRenderRequest, TileRenderer, TileSample, TransformMatrix4x4,
};

use crate::manager::TilesManager;
use crate::texture::{TileIdentity, TileTexture, TextureTileInfo};

/// Dirty bookkeeping is double buffered alongside the texture slots: one
/// area accumulates while the other is being painted.
pub const DIRTY_AREA_BUFFERS: usize = 2;

#[derive(Debug, Clone, Default)]
struct DirtyArea {
    region: DirtyRegion,
    full_repaint: bool,
}

struct TileState {
    // Weak: the painter is the tile set, which owns this tile.
    painter: Option<Weak<dyn TilePainter>>,
    x: i32,
    y: i32,
    scale: f32,
    texture: Option<Arc<TileTexture>>,
    dirty: bool,
    repaint_pending: bool,
    usable: bool,
    last_dirty_picture: PictureVersion,
    dirty_areas: [DirtyArea; DIRTY_AREA_BUFFERS],
    current_dirty_area: usize,
}

/// One cell of a surface's tiling grid.
///
/// Created on the GL thread by its owning tile set; `paint_bitmap` is the
/// only entry point that runs on the paint worker. The content mutex
/// serializes the state flags, the dirty-area ring, and the handoff between
/// a completed paint and the next frame's readiness check. The surface tag
/// and used level are atomics so the texture lock may be held while reading
/// them.
pub struct Tile {
    is_layer: bool,
    used_level: AtomicI32,
    surface: AtomicU64,
    state: Mutex<TileState>,
}

impl Tile {
    pub fn new(is_layer: bool) -> Self {
        Self {
            is_layer,
            used_level: AtomicI32::new(-1),
            surface: AtomicU64::new(0),
            state: Mutex::new(TileState {
                painter: None,
                x: -1,
                y: -1,
                scale: 0.0,
                texture: None,
                dirty: true,
                repaint_pending: false,
                usable: true,
                last_dirty_picture: PictureVersion::default(),
                dirty_areas: [
                    DirtyArea {
                        region: DirtyRegion::new(),
                        full_repaint: true,
                    },
                    DirtyArea {
                        region: DirtyRegion::new(),
                        full_repaint: true,
                    },
                ],
                current_dirty_area: 0,
            }),
        }
    }

    pub fn is_layer(&self) -> bool {
        self.is_layer
    }

    pub fn x(&self) -> i32 {
        self.state.lock().expect("tile state lock poisoned").x
    }

    pub fn y(&self) -> i32 {
        self.state.lock().expect("tile state lock poisoned").y
    }

    pub fn scale(&self) -> f32 {
        self.state.lock().expect("tile state lock poisoned").scale
    }

    pub fn painter_id(&self) -> Option<PainterId> {
        self.state
            .lock()
            .expect("tile state lock poisoned")
            .painter
            .as_ref()
            .and_then(Weak::upgrade)
            .map(|painter| painter.painter_id())
    }

    /// Surface tag readable without the content mutex; `None` until the tile
    /// is bound.
    pub fn surface_id(&self) -> Option<SurfaceId> {
        match self.surface.load(Ordering::Acquire) {
            0 => None,
            id => Some(SurfaceId(id)),
        }
    }

    pub fn texture(&self) -> Option<Arc<TileTexture>> {
        self.state
            .lock()
            .expect("tile state lock poisoned")
            .texture
            .clone()
    }

    /// True while the tile holds no texture.
    pub fn is_available(&self) -> bool {
        self.state
            .lock()
            .expect("tile state lock poisoned")
            .texture
            .is_none()
    }

    pub fn used_level(&self) -> i32 {
        self.used_level.load(Ordering::Relaxed)
    }

    pub fn set_used_level(&self, level: i32) {
        self.used_level.store(level, Ordering::Relaxed);
        let texture = self.texture();
        if let Some(texture) = texture {
            texture.set_used_level(level);
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.state.lock().expect("tile state lock poisoned").dirty
    }

    pub fn is_repaint_pending(&self) -> bool {
        self.state
            .lock()
            .expect("tile state lock poisoned")
            .repaint_pending
    }

    pub fn set_repaint_pending(&self, pending: bool) {
        self.state
            .lock()
            .expect("tile state lock poisoned")
            .repaint_pending = pending;
    }

    pub fn set_usable(&self, usable: bool) {
        self.state.lock().expect("tile state lock poisoned").usable = usable;
    }

    /// Binds the tile to a grid cell of a painter. Any identity change
    /// invalidates the whole tile.
    pub fn set_contents(&self, painter: &Arc<dyn TilePainter>, x: i32, y: i32, scale: f32) {
        let mut state = self.state.lock().expect("tile state lock poisoned");
        let painter_changed = state
            .painter
            .as_ref()
            .and_then(Weak::upgrade)
            .map_or(true, |current| current.painter_id() != painter.painter_id());
        if painter_changed || state.x != x || state.y != y || state.scale != scale {
            full_inval_locked(&mut state);
        }
        state.painter = Some(Arc::downgrade(painter));
        state.x = x;
        state.y = y;
        state.scale = scale;
        self.surface.store(painter.surface_id().0, Ordering::Release);
    }

    /// Asks the manager for a texture. Keeps the current one when the
    /// manager hands it back; leaves the tile textureless when the pool is
    /// exhausted this frame.
    pub fn reserve_texture(self: &Arc<Self>, manager: &TilesManager) {
        let reserved = manager.get_available_texture(self);
        let mut state = self.state.lock().expect("tile state lock poisoned");
        match reserved {
            Some(texture) => {
                let same = state
                    .texture
                    .as_ref()
                    .is_some_and(|current| Arc::ptr_eq(current, &texture));
                if !same {
                    state.texture = Some(texture);
                }
            }
            None => {
                log::debug!(
                    "no texture available for tile ({}, {}) this frame",
                    state.x,
                    state.y
                );
            }
        }
    }

    /// Records an invalidation from picture `picture` over `region`
    /// (tile-local pixels). The region is merged into every buffered dirty
    /// area.
    pub fn mark_dirty(&self, picture: PictureVersion, region: &DirtyRegion) {
        let mut state = self.state.lock().expect("tile state lock poisoned");
        if picture > state.last_dirty_picture {
            state.last_dirty_picture = picture;
        }
        for area in &mut state.dirty_areas {
            area.region.union(region);
        }
        state.dirty = true;
    }

    /// Collapses the dirty bookkeeping to a full-tile repaint.
    pub fn full_inval(&self) {
        let mut state = self.state.lock().expect("tile state lock poisoned");
        full_inval_locked(&mut state);
    }

    /// Called by a texture during an ownership steal. Refuses while a
    /// repaint is pending for that texture; otherwise forgets the texture
    /// and accepts.
    pub(crate) fn remove_texture(&self, texture: &TileTexture) -> bool {
        let mut state = self.state.lock().expect("tile state lock poisoned");
        let holds = state
            .texture
            .as_ref()
            .is_some_and(|current| std::ptr::eq(Arc::as_ptr(current), texture));
        if holds {
            if state.repaint_pending {
                return false;
            }
            state.texture = None;
        }
        true
    }

    /// Releases the held texture back to the pool, deferring if an upload
    /// is in flight.
    pub fn discard_texture(&self) {
        let texture = {
            let mut state = self.state.lock().expect("tile state lock poisoned");
            state.texture.take()
        };
        if let Some(texture) = texture {
            texture.release(self);
        }
    }

    /// Paints the tile's current contents into its texture. Runs on the
    /// paint worker; everything it needs is snapshotted under the content
    /// mutex, the rasterization itself runs unlocked.
    pub fn paint_bitmap(self: &Arc<Self>, renderer: &mut dyn TileRenderer, manager: &TilesManager) {
        let inverted = manager.inverted_screen();
        let snapshot = {
            let mut state = self.state.lock().expect("tile state lock poisoned");
            let (Some(texture), Some(painter)) = (
                state.texture.clone(),
                state.painter.as_ref().and_then(Weak::upgrade),
            ) else {
                state.repaint_pending = false;
                return;
            };
            let identity = TileIdentity {
                x: state.x,
                y: state.y,
                scale: state.scale,
                painter: Some(painter.painter_id()),
            };
            let needs_paint = state.dirty || !texture.ready_for(&identity, inverted);
            if !needs_paint {
                state.repaint_pending = false;
                return;
            }
            let area = &state.dirty_areas[state.current_dirty_area];
            let dirty_region = if state.dirty && !area.full_repaint {
                area.region.clone()
            } else {
                // Full repaint: an empty region tells the renderer to cover
                // the whole tile.
                DirtyRegion::new()
            };
            (texture, painter, identity, dirty_region)
        };
        let (texture, painter, identity, dirty_region) = snapshot;

        let lease = texture.producer_lock();
        if !texture.is_owned_by(self) {
            // The GL thread reassigned the texture after this paint was
            // scheduled.
            texture.producer_release(lease);
            self.set_repaint_pending(false);
            return;
        }

        painter.begin_paint();
        let rendered = renderer.render(&TileRenderRequest {
            x: identity.x,
            y: identity.y,
            scale: identity.scale,
            tile_width: texture.width(),
            tile_height: texture.height(),
            dirty: &dirty_region,
            painter: painter.as_ref(),
        });
        painter.end_paint();

        let uploaded = {
            let mut state = self.state.lock().expect("tile state lock poisoned");
            texture.stage_tile_info(
                &lease,
                TextureTileInfo {
                    x: identity.x,
                    y: identity.y,
                    scale: identity.scale,
                    painter: identity.painter,
                    picture: rendered.picture,
                    inverted,
                },
            );
            let uploaded = texture.producer_update(lease, &rendered.bitmap);
            let still_held = state
                .texture
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(current, &texture));
            if still_held && uploaded {
                let index = state.current_dirty_area;
                state.dirty_areas[index].full_repaint = false;
                state.dirty_areas[index].region.clear();
                state.current_dirty_area = (index + 1) % DIRTY_AREA_BUFFERS;
                // A newer invalidation may have arrived while rendering; the
                // tile stays dirty until a paint catches up to it.
                state.dirty = rendered.picture < state.last_dirty_picture;
                state.usable = true;
            }
            state.repaint_pending = false;
            uploaded
        };
        // The swap committed new contents; mirror them into GPU storage even
        // if the tile lost the texture meanwhile.
        if uploaded {
            manager.driver().upload(texture.gpu_id(), &rendered.bitmap);
        }
    }

    /// True iff the texture is present, still owned by this tile, its
    /// committed record matches the tile's identity, and no invalidation is
    /// outstanding.
    pub fn is_tile_ready(&self, inverted_screen: bool) -> bool {
        let state = self.state.lock().expect("tile state lock poisoned");
        let Some(texture) = &state.texture else {
            return false;
        };
        let Some(painter) = state.painter.as_ref().and_then(Weak::upgrade) else {
            return false;
        };
        if !texture.is_owned_by(self) {
            return false;
        }
        if state.dirty {
            return false;
        }
        texture.ready_for(
            &TileIdentity {
                x: state.x,
                y: state.y,
                scale: state.scale,
                painter: Some(painter.painter_id()),
            },
            inverted_screen,
        )
    }

    /// Composites the tile if it is usable and ready. Returns whether
    /// anything was drawn.
    pub fn draw(
        &self,
        compositor: &mut dyn TileCompositor,
        opacity: f32,
        rect: RectF,
        scale: f32,
        transform: Option<&TransformMatrix4x4>,
        inverted_screen: bool,
    ) -> bool {
        let (texture, identity) = {
            let state = self.state.lock().expect("tile state lock poisoned");
            if !state.usable || state.x < 0 || state.y < 0 || state.scale != scale || state.dirty {
                return false;
            }
            let (Some(texture), Some(painter)) = (
                state.texture.clone(),
                state.painter.as_ref().and_then(Weak::upgrade),
            ) else {
                return false;
            };
            let identity = TileIdentity {
                x: state.x,
                y: state.y,
                scale: state.scale,
                painter: Some(painter.painter_id()),
            };
            (texture, identity)
        };
        if !texture.is_owned_by(self) || !texture.ready_for(&identity, inverted_screen) {
            return false;
        }
        texture.consumer_sample(|bitmap, info| {
            compositor.draw_tile(
                &TileSample {
                    texture: texture.gpu_id(),
                    bitmap,
                    x: info.x,
                    y: info.y,
                    scale: info.scale,
                },
                rect,
                opacity,
                transform,
            );
        });
        true
    }

    /// Intersects a surface-space dirty rect with this tile's cell,
    /// returning the overlap in tile-local pixels.
    pub fn intersect_with_rect(
        &self,
        tile_width: u32,
        tile_height: u32,
        dirty: &IntRect,
    ) -> Option<IntRect> {
        let state = self.state.lock().expect("tile state lock poisoned");
        if state.x < 0 || state.y < 0 {
            return None;
        }
        let cell = IntRect::new(
            state.x * tile_width as i32,
            state.y * tile_height as i32,
            tile_width as i32,
            tile_height as i32,
        );
        let overlap = cell.intersection(dirty);
        if overlap.is_empty() {
            return None;
        }
        Some(overlap.translated(-cell.x, -cell.y))
    }
}

fn full_inval_locked(state: &mut TileState) {
    for area in &mut state.dirty_areas {
        area.full_repaint = true;
        area.region.clear();
    }
    state.dirty = true;
}
