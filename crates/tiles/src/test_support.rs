use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use model::{IntRect, RectF, TileBitmap};
use paint_queue::ReadyLatch;
use render_protocol::{
    PainterId, PictureVersion, RenderedTile, Surface, SurfaceId, TextureCreateError,
    TextureDriver, TextureId, TileCompositor, TilePainter, TileRenderRequest, TileRenderer,
    TileSample, TransformMatrix4x4,
};

use crate::manager::{TilesConfig, TilesManager};
use crate::tile::Tile;

pub(crate) struct StubPainter {
    id: PainterId,
    surface: SurfaceId,
}

impl TilePainter for StubPainter {
    fn painter_id(&self) -> PainterId {
        self.id
    }

    fn surface_id(&self) -> SurfaceId {
        self.surface
    }

    fn paint(
        &self,
        _x: i32,
        _y: i32,
        _scale: f32,
        canvas: &mut TileBitmap,
    ) -> Option<PictureVersion> {
        canvas.fill([255, 255, 255, 255]);
        None
    }
}

pub(crate) fn stub_painter(id: u64, surface: u64) -> Arc<dyn TilePainter> {
    Arc::new(StubPainter {
        id: PainterId(id),
        surface: SurfaceId(surface),
    })
}

pub(crate) fn bind_tile(
    painter: &Arc<dyn TilePainter>,
    x: i32,
    y: i32,
    scale: f32,
) -> Arc<Tile> {
    let tile = Arc::new(Tile::new(false));
    tile.set_contents(painter, x, y, scale);
    tile
}

pub(crate) fn bind_layer_tile(
    painter: &Arc<dyn TilePainter>,
    x: i32,
    y: i32,
    scale: f32,
) -> Arc<Tile> {
    let tile = Arc::new(Tile::new(true));
    tile.set_contents(painter, x, y, scale);
    tile
}

pub(crate) struct StubDriver {
    next_id: AtomicU64,
    created: AtomicUsize,
    fail_after: Option<usize>,
    uploads: Mutex<Vec<TextureId>>,
    deferred: Mutex<Vec<TextureId>>,
    deleted: Mutex<Vec<TextureId>>,
}

impl StubDriver {
    pub(crate) fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            created: AtomicUsize::new(0),
            fail_after: None,
            uploads: Mutex::new(Vec::new()),
            deferred: Mutex::new(Vec::new()),
            deleted: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn failing_after(successes: usize) -> Self {
        Self {
            fail_after: Some(successes),
            ..Self::new()
        }
    }

    pub(crate) fn uploaded_count(&self) -> usize {
        self.uploads.lock().expect("stub driver lock poisoned").len()
    }

    pub(crate) fn deferred_count(&self) -> usize {
        self.deferred.lock().expect("stub driver lock poisoned").len()
    }

    pub(crate) fn deleted_count(&self) -> usize {
        self.deleted.lock().expect("stub driver lock poisoned").len()
    }
}

impl TextureDriver for StubDriver {
    fn create_texture(&self, _width: u32, _height: u32) -> Result<TextureId, TextureCreateError> {
        if let Some(limit) = self.fail_after {
            if self.created.load(Ordering::SeqCst) >= limit {
                return Err(TextureCreateError::OutOfMemory);
            }
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(TextureId(self.next_id.fetch_add(1, Ordering::SeqCst)))
    }

    fn upload(&self, id: TextureId, _bitmap: &TileBitmap) {
        self.uploads
            .lock()
            .expect("stub driver lock poisoned")
            .push(id);
    }

    fn defer_delete(&self, id: TextureId) {
        self.deferred
            .lock()
            .expect("stub driver lock poisoned")
            .push(id);
    }

    fn run_deferred_deletes(&self) {
        let drained: Vec<TextureId> = self
            .deferred
            .lock()
            .expect("stub driver lock poisoned")
            .drain(..)
            .collect();
        self.deleted
            .lock()
            .expect("stub driver lock poisoned")
            .extend(drained);
    }
}

/// Blocks the worker's first render until released, so tests can observe the
/// queue while an operation is in flight.
#[derive(Default)]
pub(crate) struct RenderGate {
    pub(crate) entered: ReadyLatch,
    pub(crate) release: ReadyLatch,
}

/// Shared knobs into every renderer the factory hands the worker.
#[derive(Clone)]
pub(crate) struct RendererControls {
    pub(crate) picture: Arc<AtomicU64>,
    pub(crate) render_empty: Arc<AtomicBool>,
    pub(crate) render_count: Arc<AtomicUsize>,
    pub(crate) gate: Arc<RenderGate>,
}

impl Default for RendererControls {
    fn default() -> Self {
        let gate = Arc::new(RenderGate::default());
        // An open gate by default; tests that want to hold the worker keep
        // it shut until they are ready.
        gate.release.set_ready();
        Self {
            picture: Arc::new(AtomicU64::new(1)),
            render_empty: Arc::new(AtomicBool::new(false)),
            render_count: Arc::new(AtomicUsize::new(0)),
            gate,
        }
    }
}

impl RendererControls {
    pub(crate) fn gated() -> Self {
        Self {
            gate: Arc::new(RenderGate::default()),
            ..Self::default()
        }
    }
}

pub(crate) struct TestRenderer {
    controls: RendererControls,
    pub(crate) on_render: Option<Box<dyn FnMut() + Send>>,
}

impl Default for TestRenderer {
    fn default() -> Self {
        Self {
            controls: RendererControls::default(),
            on_render: None,
        }
    }
}

impl TestRenderer {
    pub(crate) fn with_controls(controls: RendererControls) -> Self {
        Self {
            controls,
            on_render: None,
        }
    }

    pub(crate) fn controls(&self) -> &RendererControls {
        &self.controls
    }
}

impl TileRenderer for TestRenderer {
    fn render(&mut self, request: &TileRenderRequest<'_>) -> RenderedTile {
        self.controls.render_count.fetch_add(1, Ordering::SeqCst);
        self.controls.gate.entered.set_ready();
        self.controls.gate.release.wait_ready();
        if let Some(hook) = &mut self.on_render {
            hook();
        }
        let fallback = PictureVersion(self.controls.picture.load(Ordering::SeqCst));
        if self.controls.render_empty.load(Ordering::SeqCst) {
            return RenderedTile {
                bitmap: TileBitmap::empty(),
                picture: fallback,
            };
        }
        let mut bitmap = TileBitmap::new(request.tile_width, request.tile_height)
            .expect("test renderer bitmap layout");
        let painted = request
            .painter
            .paint(request.x, request.y, request.scale, &mut bitmap);
        RenderedTile {
            bitmap,
            picture: painted.unwrap_or(fallback),
        }
    }
}

pub(crate) struct StaticSurface {
    id: SurfaceId,
    layer: bool,
    visible: Mutex<IntRect>,
    scale: Mutex<f32>,
    pub(crate) picture: Arc<AtomicU64>,
}

impl StaticSurface {
    pub(crate) fn new(id: SurfaceId, layer: bool, visible: IntRect, scale: f32) -> Arc<Self> {
        Arc::new(Self {
            id,
            layer,
            visible: Mutex::new(visible),
            scale: Mutex::new(scale),
            picture: Arc::new(AtomicU64::new(1)),
        })
    }

    pub(crate) fn set_visible(&self, visible: IntRect) {
        *self.visible.lock().expect("surface lock poisoned") = visible;
    }

    pub(crate) fn set_scale(&self, scale: f32) {
        *self.scale.lock().expect("surface lock poisoned") = scale;
    }
}

impl Surface for StaticSurface {
    fn surface_id(&self) -> SurfaceId {
        self.id
    }

    fn visible_area(&self) -> IntRect {
        *self.visible.lock().expect("surface lock poisoned")
    }

    fn scale(&self) -> f32 {
        *self.scale.lock().expect("surface lock poisoned")
    }

    fn is_layer(&self) -> bool {
        self.layer
    }

    fn paint(
        &self,
        _x: i32,
        _y: i32,
        _scale: f32,
        canvas: &mut TileBitmap,
    ) -> Option<PictureVersion> {
        canvas.fill([7, 7, 7, 255]);
        Some(PictureVersion(self.picture.load(Ordering::SeqCst)))
    }
}

#[derive(Default)]
pub(crate) struct RecordingCompositor {
    pub(crate) draws: Vec<(i32, i32, RectF, f32)>,
}

impl TileCompositor for RecordingCompositor {
    fn draw_tile(
        &mut self,
        sample: &TileSample<'_>,
        rect: RectF,
        opacity: f32,
        _transform: Option<&TransformMatrix4x4>,
    ) {
        self.draws.push((sample.x, sample.y, rect, opacity));
    }
}

pub(crate) fn small_config() -> TilesConfig {
    TilesConfig {
        max_texture_allocation: 4,
        layer_tiles: 2,
        tile_width: 8,
        tile_height: 8,
        layer_tile_width: 8,
        layer_tile_height: 8,
        ..TilesConfig::default()
    }
}

pub(crate) fn test_manager(config: TilesConfig) -> Arc<TilesManager> {
    TilesManager::new(
        config,
        Arc::new(StubDriver::new()),
        Box::new(|| Box::new(TestRenderer::default())),
    )
}

pub(crate) fn test_manager_with_controls(
    config: TilesConfig,
    controls: RendererControls,
) -> Arc<TilesManager> {
    let factory_controls = controls;
    TilesManager::new(
        config,
        Arc::new(StubDriver::new()),
        Box::new(move || Box::new(TestRenderer::with_controls(factory_controls.clone()))),
    )
}
