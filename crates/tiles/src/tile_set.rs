use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use model::{DirtyRegion, IntRect, RectF, TileBitmap};
use render_protocol::{
    PainterId, PictureVersion, Surface, SurfaceId, TileCompositor, TilePainter,
};

use crate::manager::TilesManager;
use crate::paint_op::PaintTileOperation;
use crate::texture::TileTexture;
use crate::tile::Tile;

static NEXT_PAINTER_ID: AtomicU64 = AtomicU64::new(1);

struct GridState {
    tiles: Vec<Arc<Tile>>,
    area: IntRect,
    prev_tile_y: i32,
    prev_scale: f32,
}

/// The tile grid of one surface.
///
/// `prepare` and `draw` run on the GL thread per composite frame; the set
/// also acts as the painter recorded in texture metadata, forwarding paint
/// callbacks to its surface on the paint worker.
pub struct TileSet {
    painter_id: PainterId,
    surface: Arc<dyn Surface>,
    manager: Arc<TilesManager>,
    grid: Mutex<GridState>,
}

impl TileSet {
    pub fn new(manager: Arc<TilesManager>, surface: Arc<dyn Surface>) -> Arc<Self> {
        Arc::new(Self {
            painter_id: PainterId(NEXT_PAINTER_ID.fetch_add(1, Ordering::Relaxed)),
            surface,
            manager,
            grid: Mutex::new(GridState {
                tiles: Vec::new(),
                area: IntRect::zero(),
                prev_tile_y: 0,
                prev_scale: 1.0,
            }),
        })
    }

    pub fn surface(&self) -> &Arc<dyn Surface> {
        &self.surface
    }

    fn tile_dimensions(&self) -> (u32, u32) {
        if self.surface.is_layer() {
            (
                self.manager.layer_tile_width(),
                self.manager.layer_tile_height(),
            )
        } else {
            (self.manager.tile_width(), self.manager.tile_height())
        }
    }

    /// Grid rectangle in tile coordinates, as of the last `prepare`.
    pub fn area(&self) -> IntRect {
        self.grid.lock().expect("tile grid lock poisoned").area
    }

    /// Tile cells currently in the set, in creation order.
    pub fn tile_positions(&self) -> Vec<(i32, i32)> {
        self.grid
            .lock()
            .expect("tile grid lock poisoned")
            .tiles
            .iter()
            .map(|tile| (tile.x(), tile.y()))
            .collect()
    }

    pub fn tile_at(&self, x: i32, y: i32) -> Option<Arc<Tile>> {
        self.grid
            .lock()
            .expect("tile grid lock poisoned")
            .tiles
            .iter()
            .find(|tile| tile.x() == x && tile.y() == y)
            .cloned()
    }

    /// Whether any tile of this set holds `texture`.
    pub fn owns(&self, texture: &Arc<TileTexture>) -> bool {
        self.grid
            .lock()
            .expect("tile grid lock poisoned")
            .tiles
            .iter()
            .any(|tile| {
                tile.texture()
                    .is_some_and(|held| Arc::ptr_eq(&held, texture))
            })
    }

    /// Sizes the grid to the surface's visible area, reserves textures for
    /// the cells it covers, and schedules paints for every tile that is not
    /// ready. `repaint` forces a full invalidation of every prepared tile.
    pub fn prepare(self: &Arc<Self>, repaint: bool) {
        let scale = self.surface.scale();
        let visible = self.surface.visible_area();
        let mut grid = self.grid.lock().expect("tile grid lock poisoned");

        for tile in &grid.tiles {
            tile.set_used_level(-1);
        }

        let area = IntRect::new(
            (visible.x as f32 * scale) as i32,
            (visible.y as f32 * scale) as i32,
            (visible.width as f32 * scale).ceil() as i32,
            (visible.height as f32 * scale).ceil() as i32,
        );
        if area.width == 0 && area.height == 0 {
            grid.area = IntRect::zero();
            return;
        }

        let (tile_width, tile_height) = self.tile_dimensions();
        let grid_x = area.x / tile_width as i32;
        let grid_y = area.y / tile_height as i32;
        let right = (area.x + area.width) as f32 / tile_width as f32;
        let bottom = (area.y + area.height) as f32 / tile_height as f32;
        grid.area = IntRect::new(
            grid_x,
            grid_y,
            right.ceil() as i32 - grid_x,
            bottom.ceil() as i32 - grid_y,
        );

        let going_down = grid.prev_tile_y < grid.area.y;
        grid.prev_tile_y = grid.area.y;

        if scale != grid.prev_scale {
            let painter_id = self.painter_id;
            self.manager
                .cancel_paints_matching(|op| op.painter_id() == painter_id && op.scale() != scale);
        }
        grid.prev_scale = scale;

        let walk = grid.area;
        for i in 0..walk.width {
            if going_down {
                for j in 0..walk.height {
                    self.prepare_tile(&mut grid, repaint, walk.x + i, walk.y + j);
                }
            } else {
                for j in (0..walk.height).rev() {
                    self.prepare_tile(&mut grid, repaint, walk.x + i, walk.y + j);
                }
            }
        }
    }

    fn prepare_tile(self: &Arc<Self>, grid: &mut GridState, repaint: bool, x: i32, y: i32) {
        let tile = match grid
            .tiles
            .iter()
            .find(|tile| tile.x() == x && tile.y() == y)
        {
            Some(tile) => Arc::clone(tile),
            None => {
                let tile = Arc::new(Tile::new(self.surface.is_layer()));
                grid.tiles.push(Arc::clone(&tile));
                tile
            }
        };

        let painter: Arc<dyn TilePainter> = Arc::clone(self) as Arc<dyn TilePainter>;
        tile.set_contents(&painter, x, y, self.surface.scale());

        tile.reserve_texture(&self.manager);
        if tile.is_available() {
            // Pool exhausted this frame; draw will request a redraw.
            return;
        }
        tile.set_used_level(0);

        if repaint {
            tile.full_inval();
        }

        let inverted = self.manager.inverted_screen();
        let schedule = repaint || tile.is_dirty() || !tile.is_tile_ready(inverted);
        if schedule && !tile.is_repaint_pending() {
            let operation = PaintTileOperation::new(tile, painter, &self.manager);
            self.manager.schedule_paint(operation);
        }
    }

    /// Composites every ready tile inside the grid area. Returns whether a
    /// redraw should be requested because some tile was not ready.
    pub fn draw(&self, compositor: &mut dyn TileCompositor) -> bool {
        let grid = self.grid.lock().expect("tile grid lock poisoned");
        let mut redraw_needed = false;
        if grid.area.width == 0 || grid.area.height == 0 {
            return redraw_needed;
        }

        let scale = self.surface.scale();
        let inv_scale = 1.0 / scale;
        let (tile_width, tile_height) = self.tile_dimensions();
        let draw_width = tile_width as f32 * inv_scale;
        let draw_height = tile_height as f32 * inv_scale;
        let opacity = self.surface.opacity();
        let transform = self.surface.transform();
        let inverted = self.manager.inverted_screen();

        for tile in &grid.tiles {
            let x = tile.x();
            let y = tile.y();
            if x < grid.area.x
                || x >= grid.area.right()
                || y < grid.area.y
                || y >= grid.area.bottom()
            {
                continue;
            }
            let rect = RectF::new(
                x as f32 * draw_width,
                y as f32 * draw_height,
                (x as f32 + 1.0) * draw_width,
                (y as f32 + 1.0) * draw_height,
            );
            redraw_needed |= !tile.is_tile_ready(inverted);
            tile.draw(
                compositor,
                opacity,
                rect,
                scale,
                transform.as_ref(),
                inverted,
            );
        }
        redraw_needed
    }

    /// Marks every tile overlapping `content_rect` (content coordinates)
    /// dirty for `picture`.
    pub fn invalidate(&self, picture: PictureVersion, content_rect: IntRect) {
        let scale = self.surface.scale();
        let dirty = IntRect::new(
            (content_rect.x as f32 * scale) as i32,
            (content_rect.y as f32 * scale) as i32,
            (content_rect.width as f32 * scale).ceil() as i32,
            (content_rect.height as f32 * scale).ceil() as i32,
        );
        let (tile_width, tile_height) = self.tile_dimensions();
        let grid = self.grid.lock().expect("tile grid lock poisoned");
        for tile in &grid.tiles {
            if let Some(overlap) = tile.intersect_with_rect(tile_width, tile_height, &dirty) {
                tile.mark_dirty(picture, &DirtyRegion::from_rect(overlap));
            }
        }
    }

    /// Tears the grid down: cancels this painter's queued paints and
    /// releases every texture back to the pool.
    pub fn remove_tiles(&self) {
        let painter_id = self.painter_id;
        self.manager
            .cancel_paints_matching(|op| op.painter_id() == painter_id);
        let mut grid = self.grid.lock().expect("tile grid lock poisoned");
        for tile in &grid.tiles {
            tile.discard_texture();
        }
        grid.tiles.clear();
        grid.area = IntRect::zero();
    }
}

impl TilePainter for TileSet {
    fn painter_id(&self) -> PainterId {
        self.painter_id
    }

    fn surface_id(&self) -> SurfaceId {
        self.surface.surface_id()
    }

    fn begin_paint(&self) {
        self.surface.begin_paint();
    }

    fn end_paint(&self) {
        self.surface.end_paint();
    }

    fn paint(&self, x: i32, y: i32, scale: f32, canvas: &mut TileBitmap) -> Option<PictureVersion> {
        self.surface.paint(x, y, scale, canvas)
    }

    fn paint_extra(&self, canvas: &mut TileBitmap) {
        self.surface.paint_extra(canvas);
    }
}
