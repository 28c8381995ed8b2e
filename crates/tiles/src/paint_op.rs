use std::sync::{Arc, Weak};

use render_protocol::{PainterId, TilePainter, TileRenderer};

use crate::manager::TilesManager;
use crate::tile::Tile;

/// One queued paint of one tile.
///
/// Construction marks the tile repaint-pending; every way the operation can
/// end — run to completion, cancelled by a filter, discarded with the queue,
/// or orphaned by a torn-down manager — clears the flag again so the next
/// prepare can reschedule. The scale and painter recorded at enqueue time
/// drive cancellation filters.
pub struct PaintTileOperation {
    tile: Arc<Tile>,
    painter: Arc<dyn TilePainter>,
    manager: Weak<TilesManager>,
    scale: f32,
}

impl PaintTileOperation {
    pub fn new(tile: Arc<Tile>, painter: Arc<dyn TilePainter>, manager: &Arc<TilesManager>) -> Self {
        tile.set_repaint_pending(true);
        let scale = tile.scale();
        Self {
            tile,
            painter,
            manager: Arc::downgrade(manager),
            scale,
        }
    }

    /// Runs on the paint worker with the worker's renderer.
    pub fn run(&self, renderer: &mut dyn TileRenderer) {
        let Some(manager) = self.manager.upgrade() else {
            self.tile.set_repaint_pending(false);
            return;
        };
        self.tile.paint_bitmap(renderer, &manager);
    }

    /// The operation was removed from the queue before the worker reached
    /// it.
    pub fn cancelled(&self) {
        self.tile.set_repaint_pending(false);
    }

    pub fn painter_id(&self) -> PainterId {
        self.painter.painter_id()
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    pub fn tile(&self) -> &Arc<Tile> {
        &self.tile
    }
}
