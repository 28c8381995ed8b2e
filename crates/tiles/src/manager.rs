use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use paint_queue::{spawn_worker, OperationQueue, QueueClosed, ReadyLatch, WorkerHandle};
use render_protocol::{SurfaceId, TextureDriver, TileRenderer};

use crate::paint_op::PaintTileOperation;
use crate::texture::TileTexture;
use crate::tile::Tile;

/// Pool sizing and memory budgets. Defaults match the shipped renderer
/// configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TilesConfig {
    /// Hard cap on the base pool size.
    pub max_texture_allocation: usize,
    /// Layer pool size, allocated once.
    pub layer_tiles: usize,
    pub tile_width: u32,
    pub tile_height: u32,
    pub layer_tile_width: u32,
    pub layer_tile_height: u32,
    /// Total memory budget for layer contents, in bytes.
    pub max_layers_allocation: usize,
    /// Memory budget for a single layer, in bytes.
    pub max_layer_allocation: usize,
}

impl Default for TilesConfig {
    fn default() -> Self {
        Self {
            max_texture_allocation: 51,
            layer_tiles: 50,
            tile_width: model::TILE_WIDTH,
            tile_height: model::TILE_HEIGHT,
            layer_tile_width: model::LAYER_TILE_WIDTH,
            layer_tile_height: model::LAYER_TILE_HEIGHT,
            max_layers_allocation: 32 * 1024 * 1024,
            max_layer_allocation: 8 * 1024 * 1024,
        }
    }
}

pub type RendererFactory = Box<dyn Fn() -> Box<dyn TileRenderer> + Send + Sync>;

struct TexturePools {
    textures: Vec<Arc<TileTexture>>,
    layer_textures: Vec<Arc<TileTexture>>,
    available: Vec<Arc<TileTexture>>,
    available_layers: Vec<Arc<TileTexture>>,
    max_texture_count: usize,
}

struct SurfaceRegistry {
    draw_counts: HashMap<SurfaceId, u64>,
    draw_registration_count: u64,
    next_surface_id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerInstallError {
    AlreadyInstalled,
}

impl fmt::Display for ManagerInstallError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManagerInstallError::AlreadyInstalled => {
                write!(formatter, "tiles manager already installed")
            }
        }
    }
}

impl std::error::Error for ManagerInstallError {}

static INSTANCE: OnceLock<Arc<TilesManager>> = OnceLock::new();

/// Owner of the texture pools, the eviction policy, and the paint worker.
///
/// One manager serves the whole renderer. The embedder constructs it once
/// (the constructor waits for the paint worker to come up) and either passes
/// the handle around or installs it as the process-wide instance.
pub struct TilesManager {
    config: TilesConfig,
    driver: Arc<dyn TextureDriver>,
    pools: Mutex<TexturePools>,
    registry: Mutex<SurfaceRegistry>,
    inverted_screen: AtomicBool,
    layers_memory: AtomicUsize,
    queue: Arc<OperationQueue<PaintTileOperation>>,
    worker: Mutex<Option<WorkerHandle<PaintTileOperation>>>,
}

impl TilesManager {
    /// Builds the manager and spawns the paint worker, returning once the
    /// worker is ready to accept operations.
    pub fn new(
        config: TilesConfig,
        driver: Arc<dyn TextureDriver>,
        renderer_factory: RendererFactory,
    ) -> Arc<Self> {
        let queue = Arc::new(OperationQueue::new());
        let latch = Arc::new(ReadyLatch::new());
        let manager = Arc::new(Self {
            config,
            driver,
            pools: Mutex::new(TexturePools {
                textures: Vec::with_capacity(config.max_texture_allocation),
                layer_textures: Vec::with_capacity(config.layer_tiles),
                available: Vec::new(),
                available_layers: Vec::new(),
                max_texture_count: 0,
            }),
            registry: Mutex::new(SurfaceRegistry {
                draw_counts: HashMap::new(),
                draw_registration_count: 0,
                next_surface_id: 1,
            }),
            inverted_screen: AtomicBool::new(false),
            layers_memory: AtomicUsize::new(0),
            queue: Arc::clone(&queue),
            worker: Mutex::new(None),
        });

        let handle = spawn_worker("tile-paint-worker", queue, Arc::clone(&latch), {
            let mut renderer: Option<Box<dyn TileRenderer>> = None;
            move |operation: PaintTileOperation| {
                let renderer = renderer.get_or_insert_with(&renderer_factory);
                operation.run(renderer.as_mut());
            }
        });
        *manager
            .worker
            .lock()
            .expect("paint worker handle lock poisoned") = Some(handle);
        latch.wait_ready();
        manager
    }

    /// Installs the process-wide instance for embedders using the
    /// `instance()` accessor.
    pub fn install(manager: Arc<TilesManager>) -> Result<(), ManagerInstallError> {
        INSTANCE
            .set(manager)
            .map_err(|_| ManagerInstallError::AlreadyInstalled)
    }

    pub fn instance() -> Arc<TilesManager> {
        INSTANCE
            .get()
            .cloned()
            .expect("tiles manager not installed")
    }

    pub fn try_instance() -> Option<Arc<TilesManager>> {
        INSTANCE.get().cloned()
    }

    pub fn config(&self) -> &TilesConfig {
        &self.config
    }

    pub fn driver(&self) -> &Arc<dyn TextureDriver> {
        &self.driver
    }

    pub fn tile_width(&self) -> u32 {
        self.config.tile_width
    }

    pub fn tile_height(&self) -> u32 {
        self.config.tile_height
    }

    pub fn layer_tile_width(&self) -> u32 {
        self.config.layer_tile_width
    }

    pub fn layer_tile_height(&self) -> u32 {
        self.config.layer_tile_height
    }

    pub fn inverted_screen(&self) -> bool {
        self.inverted_screen.load(Ordering::Acquire)
    }

    /// Flipping the flag makes every committed upload mismatch its tile, so
    /// the next prepare repaints everything.
    pub fn set_inverted_screen(&self, inverted: bool) {
        self.inverted_screen.store(inverted, Ordering::Release);
    }

    pub fn max_texture_count(&self) -> usize {
        self.pools
            .lock()
            .expect("texture pools lock poisoned")
            .max_texture_count
    }

    pub fn base_pool_size(&self) -> usize {
        self.pools
            .lock()
            .expect("texture pools lock poisoned")
            .textures
            .len()
    }

    pub fn layer_pool_size(&self) -> usize {
        self.pools
            .lock()
            .expect("texture pools lock poisoned")
            .layer_textures
            .len()
    }

    /// Grows the base pool to `max` (clamped to the configured hard cap).
    /// The pool never shrinks. The layer pool is sized once. GL thread only:
    /// texture storage is created here.
    pub fn set_max_texture_count(&self, max: usize) {
        let clamped = max.min(self.config.max_texture_allocation);
        let mut pools = self.pools.lock().expect("texture pools lock poisoned");
        if pools.max_texture_count != 0 && clamped <= pools.max_texture_count {
            return;
        }
        pools.max_texture_count = clamped;
        self.allocate_tiles(&mut pools);
    }

    fn allocate_tiles(&self, pools: &mut TexturePools) {
        // Textures are fully constructed before they are pushed while the
        // pool mutex is held; any thread cloning an Arc out of the same
        // mutex observes the initialized texture.
        let base_needed = pools.max_texture_count.saturating_sub(pools.textures.len());
        let mut base_allocated = 0usize;
        for _ in 0..base_needed {
            match self
                .driver
                .create_texture(self.config.tile_width, self.config.tile_height)
            {
                Ok(id) => {
                    pools.textures.push(Arc::new(TileTexture::new(
                        id,
                        self.config.tile_width,
                        self.config.tile_height,
                    )));
                    base_allocated += 1;
                }
                Err(error) => {
                    log::error!(
                        "base tile texture allocation failed: {error}; capping pool at {}",
                        pools.textures.len()
                    );
                    pools.max_texture_count = pools.textures.len();
                    break;
                }
            }
        }

        let layer_needed = self
            .config
            .layer_tiles
            .saturating_sub(pools.layer_textures.len());
        let mut layers_allocated = 0usize;
        for _ in 0..layer_needed {
            match self
                .driver
                .create_texture(self.config.layer_tile_width, self.config.layer_tile_height)
            {
                Ok(id) => {
                    pools.layer_textures.push(Arc::new(TileTexture::new(
                        id,
                        self.config.layer_tile_width,
                        self.config.layer_tile_height,
                    )));
                    layers_allocated += 1;
                }
                Err(error) => {
                    log::error!(
                        "layer tile texture allocation failed: {error}; layer pool stays at {}",
                        pools.layer_textures.len()
                    );
                    break;
                }
            }
        }

        log::debug!(
            "allocated {base_allocated} base textures (total {}), {layers_allocated} layer textures (total {})",
            pools.textures.len(),
            pools.layer_textures.len()
        );
    }

    /// Snapshots the base pool into the availability list for this composite
    /// pass.
    pub fn gather_textures(&self) {
        let mut pools = self.pools.lock().expect("texture pools lock poisoned");
        pools.available = pools.textures.clone();
    }

    pub fn gather_layer_textures(&self) {
        let mut pools = self.pools.lock().expect("texture pools lock poisoned");
        pools.available_layers = pools.layer_textures.clone();
    }

    pub fn available_texture_count(&self) -> usize {
        self.pools
            .lock()
            .expect("texture pools lock poisoned")
            .available
            .len()
    }

    pub fn available_layer_texture_count(&self) -> usize {
        self.pools
            .lock()
            .expect("texture pools lock poisoned")
            .available_layers
            .len()
    }

    /// Picks a texture for `tile` from this pass's availability snapshot.
    ///
    /// Base tiles evict farthest-first: an unclaimed texture wins instantly,
    /// otherwise the highest `used_level` wins and ties go to the owner
    /// whose surface registered longest ago (then to the lowest pool
    /// index). Layer tiles scan for unowned, unclaimed-this-frame, or
    /// stale-scale textures, skipping owners with a paint in flight.
    /// Returns `None` when nothing can be had this frame; the caller treats
    /// that as a redraw request, not a failure.
    pub fn get_available_texture(&self, tile: &Arc<Tile>) -> Option<Arc<TileTexture>> {
        let mut pools = self.pools.lock().expect("texture pools lock poisoned");

        if let Some(current) = tile.texture() {
            if current.is_owned_by(tile) {
                current.set_used_level(0);
                let list = if tile.is_layer() {
                    &mut pools.available_layers
                } else {
                    &mut pools.available
                };
                remove_from_snapshot(list, &current);
                return Some(current);
            }
        }

        if tile.is_layer() {
            let mut selected = None;
            for texture in &pools.available_layers {
                if let Some(owner) = texture.owner() {
                    if owner.is_repaint_pending() {
                        continue;
                    }
                    if texture.used_level() != 0 && texture.acquire(tile, false) {
                        selected = Some(Arc::clone(texture));
                        break;
                    }
                    if texture.scale() != tile.scale() && texture.acquire(tile, false) {
                        selected = Some(Arc::clone(texture));
                        break;
                    }
                } else if texture.acquire(tile, false) {
                    selected = Some(Arc::clone(texture));
                    break;
                }
            }
            if let Some(texture) = &selected {
                texture.set_used_level(0);
                remove_from_snapshot(&mut pools.available_layers, texture);
            }
            return selected;
        }

        let mut farthest: Option<Arc<TileTexture>> = None;
        let mut farthest_level = 0;
        let mut lowest_draw_count = u64::MAX;
        for texture in &pools.available {
            let level = texture.used_level();
            if level == -1 {
                farthest = Some(Arc::clone(texture));
                break;
            }
            let Some(owner) = texture.owner() else {
                // No owner left behind the recorded level: as free as an
                // unclaimed texture.
                farthest = Some(Arc::clone(texture));
                break;
            };
            let draw_count = owner
                .surface_id()
                .and_then(|surface| self.surface_draw_count(surface))
                .unwrap_or(0);
            if farthest.is_none()
                || level > farthest_level
                || (level == farthest_level && draw_count < lowest_draw_count)
            {
                farthest = Some(Arc::clone(texture));
                farthest_level = level;
                lowest_draw_count = draw_count;
            }
        }

        if let Some(texture) = farthest {
            if texture.acquire(tile, false) {
                texture.set_used_level(0);
                remove_from_snapshot(&mut pools.available, &texture);
                return Some(texture);
            }
            log::debug!(
                "texture steal refused; tile ({}, {}) goes without this frame",
                tile.x(),
                tile.y()
            );
            return None;
        }

        log::debug!(
            "no available texture for tile ({}, {})",
            tile.x(),
            tile.y()
        );
        None
    }

    /// Registers a drawable and assigns its draw-order counter, used as the
    /// LRU tie-breaker during eviction.
    pub fn register_surface(&self) -> SurfaceId {
        let mut registry = self.registry.lock().expect("surface registry lock poisoned");
        let id = SurfaceId(registry.next_surface_id);
        registry.next_surface_id += 1;
        let count = registry.draw_registration_count;
        registry.draw_registration_count += 1;
        registry.draw_counts.insert(id, count);
        log::debug!("surface {id:?} registered with draw count {count}");
        id
    }

    /// GL context lost for this surface: the whole paint queue is discarded
    /// (uploads in flight cannot be recovered) and the registration dropped.
    pub fn unregister_surface(&self, surface: SurfaceId) {
        let discarded = self.queue.discard_all();
        for operation in &discarded {
            operation.cancelled();
        }
        let mut registry = self.registry.lock().expect("surface registry lock poisoned");
        registry.draw_counts.remove(&surface);
        log::debug!(
            "surface {surface:?} unregistered, {} queued paints discarded",
            discarded.len()
        );
    }

    pub fn surface_draw_count(&self, surface: SurfaceId) -> Option<u64> {
        self.registry
            .lock()
            .expect("surface registry lock poisoned")
            .draw_counts
            .get(&surface)
            .copied()
    }

    pub fn schedule_paint(&self, operation: PaintTileOperation) {
        if let Err(QueueClosed(operation)) = self.queue.schedule(operation) {
            log::warn!("paint queue closed; dropping scheduled paint");
            operation.cancelled();
        }
    }

    /// Removes queued paints matching the predicate before the worker picks
    /// them up, clearing their tiles' repaint-pending flags. Returns how
    /// many were cancelled. An operation the worker already started is not
    /// pre-empted.
    pub fn cancel_paints_matching(
        &self,
        predicate: impl FnMut(&PaintTileOperation) -> bool,
    ) -> usize {
        let removed = self.queue.cancel_matching(predicate);
        for operation in &removed {
            operation.cancelled();
        }
        removed.len()
    }

    pub fn pending_paint_count(&self) -> usize {
        self.queue.len()
    }

    pub fn max_layers_allocation(&self) -> usize {
        self.config.max_layers_allocation
    }

    pub fn max_layer_allocation(&self) -> usize {
        self.config.max_layer_allocation
    }

    pub fn layers_memory_usage(&self) -> usize {
        self.layers_memory.load(Ordering::Relaxed)
    }

    /// Reserves layer memory against the budgets. Fails when the request
    /// exceeds the per-layer cap or would push the total over the layers
    /// budget.
    pub fn track_layer_allocation(&self, bytes: usize) -> bool {
        if bytes > self.config.max_layer_allocation {
            return false;
        }
        let mut current = self.layers_memory.load(Ordering::Relaxed);
        loop {
            let Some(next) = current.checked_add(bytes) else {
                return false;
            };
            if next > self.config.max_layers_allocation {
                return false;
            }
            match self.layers_memory.compare_exchange(
                current,
                next,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    pub fn release_layer_allocation(&self, bytes: usize) {
        let mut current = self.layers_memory.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_sub(bytes);
            match self.layers_memory.compare_exchange(
                current,
                next,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    /// Renderer shutdown: drains and joins the paint worker, then schedules
    /// deferred GPU deletion of every pooled texture. The embedder runs the
    /// driver's deferred deletes on the GL thread afterwards.
    pub fn shutdown(&self) {
        let handle = self
            .worker
            .lock()
            .expect("paint worker handle lock poisoned")
            .take();
        if let Some(handle) = handle {
            handle.shutdown();
        }
        let pools = self.pools.lock().expect("texture pools lock poisoned");
        for texture in pools.textures.iter().chain(pools.layer_textures.iter()) {
            self.driver.defer_delete(texture.gpu_id());
        }
    }
}

fn remove_from_snapshot(list: &mut Vec<Arc<TileTexture>>, texture: &Arc<TileTexture>) {
    if let Some(index) = list.iter().position(|entry| Arc::ptr_eq(entry, texture)) {
        list.remove(index);
    }
}
