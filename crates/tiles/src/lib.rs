//! Tiled GPU texture cache and paint scheduling.
//!
//! A visible surface is decomposed into a grid of fixed-size tiles. A bounded
//! pool of GPU textures is recycled across those tiles under memory
//! pressure, repainted asynchronously by one background paint worker, and
//! composited by the foreground GL thread. Two threads cooperate on every
//! texture: the GL thread hands textures out and composites, the worker
//! acquires the producer side, rasterizes, and uploads. Ownership handoffs
//! that race with an in-progress upload are deferred until the upload
//! finishes rather than blocking either thread.

mod manager;
mod paint_op;
mod texture;
mod tile;
mod tile_set;

#[cfg(feature = "gpu-driver")]
mod gpu;

pub use manager::{ManagerInstallError, RendererFactory, TilesConfig, TilesManager};
pub use paint_op::PaintTileOperation;
pub use texture::{ProducerLease, TextureTileInfo, TileIdentity, TileTexture};
pub use tile::{Tile, DIRTY_AREA_BUFFERS};
pub use tile_set::TileSet;

#[cfg(feature = "gpu-driver")]
pub use gpu::WgpuTextureDriver;

#[cfg(test)]
pub(crate) mod test_support;
