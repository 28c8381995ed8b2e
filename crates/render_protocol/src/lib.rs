//! The contract between the tile core and its collaborators: the page/layer
//! model that supplies visible rectangles and paint callbacks, the rasterizer
//! that turns recorded pictures into pixels, the GL driver that owns texture
//! storage, and the compositor that blits ready tiles.

use std::fmt;

use model::{DirtyRegion, IntRect, RectF, TileBitmap};

pub type TransformMatrix4x4 = [f32; 16];

/// Identity of a registered drawable (the base page or one compositor layer).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SurfaceId(pub u64);

/// Identity of the painter a tile was last rasterized for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PainterId(pub u64);

/// Opaque GPU texture handle minted by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureId(pub u64);

/// Monotonically increasing identifier of a recorded drawing of the page.
/// Used to detect paints that raced with a newer invalidation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PictureVersion(pub u64);

/// A higher-level drawable that owns a tile grid. Supplies geometry on the
/// GL thread and pixels on the paint worker.
pub trait Surface: Send + Sync {
    fn surface_id(&self) -> SurfaceId;

    /// Visible area in content coordinates (unscaled).
    fn visible_area(&self) -> IntRect;

    fn scale(&self) -> f32;

    fn opacity(&self) -> f32 {
        1.0
    }

    fn is_layer(&self) -> bool {
        false
    }

    fn transform(&self) -> Option<TransformMatrix4x4> {
        None
    }

    fn begin_paint(&self) {}

    fn end_paint(&self) {}

    /// Rasterize one tile's content. Returns the picture version the pixels
    /// were produced from, or `None` when nothing was painted.
    fn paint(&self, x: i32, y: i32, scale: f32, canvas: &mut TileBitmap) -> Option<PictureVersion>;

    fn paint_extra(&self, _canvas: &mut TileBitmap) {}
}

/// The painter recorded in texture metadata. Implemented by the tile set,
/// which forwards to its surface; the paint worker only sees this trait.
pub trait TilePainter: Send + Sync {
    fn painter_id(&self) -> PainterId;

    fn surface_id(&self) -> SurfaceId;

    fn begin_paint(&self) {}

    fn end_paint(&self) {}

    fn paint(&self, x: i32, y: i32, scale: f32, canvas: &mut TileBitmap) -> Option<PictureVersion>;

    fn paint_extra(&self, _canvas: &mut TileBitmap) {}
}

/// One rasterization request handed to the renderer on the paint worker.
pub struct TileRenderRequest<'a> {
    pub x: i32,
    pub y: i32,
    pub scale: f32,
    pub tile_width: u32,
    pub tile_height: u32,
    /// Tile-local region to repaint; empty means the full tile.
    pub dirty: &'a DirtyRegion,
    pub painter: &'a dyn TilePainter,
}

/// Result of a rasterization: the pixels and the picture they came from.
pub struct RenderedTile {
    pub bitmap: TileBitmap,
    pub picture: PictureVersion,
}

/// The rasterizer driving a painter to fill one tile. One instance lives on
/// the paint worker thread.
pub trait TileRenderer: Send {
    fn render(&mut self, request: &TileRenderRequest<'_>) -> RenderedTile;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureCreateError {
    OutOfMemory,
    ContextLost,
}

impl fmt::Display for TextureCreateError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TextureCreateError::OutOfMemory => write!(formatter, "gpu texture allocation failed"),
            TextureCreateError::ContextLost => write!(formatter, "gpu context lost"),
        }
    }
}

impl std::error::Error for TextureCreateError {}

/// Owner of GPU texture storage. Creation happens on the GL thread; deletion
/// is deferred and must be drained on the GL thread that created the
/// textures. Uploads are driven by the paint worker after each committed
/// swap.
pub trait TextureDriver: Send + Sync {
    fn create_texture(&self, width: u32, height: u32) -> Result<TextureId, TextureCreateError>;

    /// Pushes a committed tile bitmap into the texture's GPU storage.
    fn upload(&self, id: TextureId, bitmap: &TileBitmap);

    fn defer_delete(&self, id: TextureId);

    /// Executes queued deletes. GL thread only.
    fn run_deferred_deletes(&self);
}

/// A consumer view of a texture's committed contents, valid for the duration
/// of one sample.
pub struct TileSample<'a> {
    pub texture: TextureId,
    pub bitmap: &'a TileBitmap,
    pub x: i32,
    pub y: i32,
    pub scale: f32,
}

/// Receives ready tiles during a composite pass. GL thread only.
pub trait TileCompositor {
    fn draw_tile(
        &mut self,
        sample: &TileSample<'_>,
        rect: RectF,
        opacity: f32,
        transform: Option<&TransformMatrix4x4>,
    );
}
