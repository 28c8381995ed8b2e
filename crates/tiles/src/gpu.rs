//! wgpu-backed texture storage for the tile pools.
//!
//! Creation and deferred deletion run on the thread that owns the device
//! (the GL thread of the compositor); the paint worker pushes each committed
//! tile bitmap into its GPU texture through the driver's upload hook.

use std::collections::HashMap;
use std::sync::Mutex;

use model::{TileBitmap, BYTES_PER_PIXEL};
use render_protocol::{TextureCreateError, TextureDriver, TextureId};

struct DriverState {
    textures: HashMap<u64, wgpu::Texture>,
    deferred: Vec<u64>,
    next_id: u64,
}

pub struct WgpuTextureDriver {
    device: wgpu::Device,
    queue: wgpu::Queue,
    state: Mutex<DriverState>,
}

impl WgpuTextureDriver {
    pub fn new(device: wgpu::Device, queue: wgpu::Queue) -> Self {
        Self {
            device,
            queue,
            state: Mutex::new(DriverState {
                textures: HashMap::new(),
                deferred: Vec::new(),
                next_id: 1,
            }),
        }
    }

    /// The backing texture for a live id, for compositors that bind it.
    pub fn wgpu_texture(&self, id: TextureId) -> Option<wgpu::Texture> {
        self.state
            .lock()
            .expect("texture driver lock poisoned")
            .textures
            .get(&id.0)
            .cloned()
    }
}

impl TextureDriver for WgpuTextureDriver {
    fn create_texture(&self, width: u32, height: u32) -> Result<TextureId, TextureCreateError> {
        self.device
            .push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("tile texture"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8Unorm,
            usage: wgpu::TextureUsages::COPY_DST
                | wgpu::TextureUsages::COPY_SRC
                | wgpu::TextureUsages::TEXTURE_BINDING,
            view_formats: &[],
        });
        if pollster::block_on(self.device.pop_error_scope()).is_some() {
            return Err(TextureCreateError::OutOfMemory);
        }

        let mut state = self.state.lock().expect("texture driver lock poisoned");
        let id = state.next_id;
        state.next_id += 1;
        state.textures.insert(id, texture);
        Ok(TextureId(id))
    }

    fn upload(&self, id: TextureId, bitmap: &TileBitmap) {
        let state = self.state.lock().expect("texture driver lock poisoned");
        let Some(texture) = state.textures.get(&id.0) else {
            log::warn!("upload for unknown texture {id:?}");
            return;
        };
        if texture.width() != bitmap.width() || texture.height() != bitmap.height() {
            log::warn!(
                "upload skipped: {}x{} bitmap for a {}x{} texture",
                bitmap.width(),
                bitmap.height(),
                texture.width(),
                texture.height()
            );
            return;
        }
        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            bitmap.as_bytes(),
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(bitmap.width() * BYTES_PER_PIXEL),
                rows_per_image: Some(bitmap.height()),
            },
            wgpu::Extent3d {
                width: bitmap.width(),
                height: bitmap.height(),
                depth_or_array_layers: 1,
            },
        );
    }

    fn defer_delete(&self, id: TextureId) {
        self.state
            .lock()
            .expect("texture driver lock poisoned")
            .deferred
            .push(id.0);
    }

    fn run_deferred_deletes(&self) {
        let mut state = self.state.lock().expect("texture driver lock poisoned");
        let deferred: Vec<u64> = state.deferred.drain(..).collect();
        for id in deferred {
            state.textures.remove(&id);
        }
    }
}
