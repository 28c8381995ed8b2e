use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};

use model::TileBitmap;
use render_protocol::{PainterId, PictureVersion, TextureId};

use crate::tile::Tile;

/// What was last uploaded into a texture: the tile cell, scale, painter and
/// picture the pixels came from, and the screen inversion they were produced
/// under. A tile is ready only while this record matches its own identity.
#[derive(Debug, Clone, PartialEq)]
pub struct TextureTileInfo {
    pub x: i32,
    pub y: i32,
    pub scale: f32,
    pub painter: Option<PainterId>,
    pub picture: PictureVersion,
    pub inverted: bool,
}

impl Default for TextureTileInfo {
    fn default() -> Self {
        Self {
            x: -1,
            y: -1,
            scale: 0.0,
            painter: None,
            picture: PictureVersion::default(),
            inverted: false,
        }
    }
}

/// A tile's identity snapshot, taken under the tile mutex and compared
/// against the committed record without touching the tile again.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TileIdentity {
    pub x: i32,
    pub y: i32,
    pub scale: f32,
    pub painter: Option<PainterId>,
}

/// Token for a held producer side. Must be consumed by `producer_update`,
/// `producer_release` or `producer_release_and_swap`.
#[must_use]
pub struct ProducerLease {
    slot: usize,
}

struct TextureSync {
    busy: bool,
    delayed_release: bool,
    owner: Option<Weak<Tile>>,
    delayed_release_owner: Option<Weak<Tile>>,
    front: usize,
    sampling: [u32; 2],
    committed: TextureTileInfo,
}

struct TextureSlot {
    bitmap: TileBitmap,
    staged: TextureTileInfo,
}

/// A reusable GPU texture with a producer/consumer double buffer.
///
/// The paint worker writes the back slot between `producer_lock` and the
/// matching release; the GL thread samples the front slot. `busy` covers the
/// whole producer hold. An ownership release requested while busy is
/// deferred and consummated by the release path, so the worker can finish an
/// upload into a texture the GL thread has already reassigned away.
pub struct TileTexture {
    id: TextureId,
    width: u32,
    height: u32,
    used_level: AtomicI32,
    sync: Mutex<TextureSync>,
    busy_cond: Condvar,
    slots: [Mutex<TextureSlot>; 2],
}

impl TileTexture {
    pub fn new(id: TextureId, width: u32, height: u32) -> Self {
        let slot = || TextureSlot {
            bitmap: TileBitmap::new(width, height).expect("tile texture bitmap layout overflow"),
            staged: TextureTileInfo::default(),
        };
        Self {
            id,
            width,
            height,
            used_level: AtomicI32::new(-1),
            sync: Mutex::new(TextureSync {
                busy: false,
                delayed_release: false,
                owner: None,
                delayed_release_owner: None,
                front: 0,
                sampling: [0, 0],
                committed: TextureTileInfo::default(),
            }),
            busy_cond: Condvar::new(),
            slots: [Mutex::new(slot()), Mutex::new(slot())],
        }
    }

    pub fn gpu_id(&self) -> TextureId {
        self.id
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn used_level(&self) -> i32 {
        self.used_level.load(Ordering::Relaxed)
    }

    pub fn set_used_level(&self, level: i32) {
        self.used_level.store(level, Ordering::Relaxed);
    }

    /// Acquires the writable back slot for the paint worker. Marks the
    /// texture busy, then waits until the slot is no longer being sampled.
    pub fn producer_lock(&self) -> ProducerLease {
        let mut sync = self.sync.lock().expect("texture busy lock poisoned");
        sync.busy = true;
        let back = 1 - sync.front;
        while sync.sampling[back] > 0 {
            sync = self
                .busy_cond
                .wait(sync)
                .expect("texture busy lock poisoned");
        }
        ProducerLease { slot: back }
    }

    /// Writes the metadata that will describe the upload once it is swapped
    /// in.
    pub fn stage_tile_info(&self, lease: &ProducerLease, info: TextureTileInfo) {
        self.slots[lease.slot]
            .lock()
            .expect("texture slot lock poisoned")
            .staged = info;
    }

    /// The single upload point. A zero-area bitmap skips the upload and
    /// releases without a swap, leaving the old contents committed. Returns
    /// whether the slot was swapped in.
    pub fn producer_update(&self, lease: ProducerLease, bitmap: &TileBitmap) -> bool {
        if bitmap.is_empty() {
            self.producer_release(lease);
            return false;
        }
        {
            let mut slot = self.slots[lease.slot]
                .lock()
                .expect("texture slot lock poisoned");
            if slot.bitmap.copy_from(bitmap).is_err() {
                log::warn!(
                    "tile upload skipped: renderer produced {}x{} pixels for a {}x{} texture",
                    bitmap.width(),
                    bitmap.height(),
                    self.width,
                    self.height
                );
                drop(slot);
                self.producer_release(lease);
                return false;
            }
        }
        self.producer_release_and_swap(lease);
        true
    }

    pub fn producer_release(&self, lease: ProducerLease) {
        let _ = lease;
        let mut sync = self.sync.lock().expect("texture busy lock poisoned");
        self.set_not_busy(&mut sync);
    }

    /// Releases the producer hold and flips the slot pair so the next
    /// consumer sample sees the new contents.
    pub fn producer_release_and_swap(&self, lease: ProducerLease) {
        let staged = self.slots[lease.slot]
            .lock()
            .expect("texture slot lock poisoned")
            .staged
            .clone();
        let mut sync = self.sync.lock().expect("texture busy lock poisoned");
        sync.front = lease.slot;
        sync.committed = staged;
        self.set_not_busy(&mut sync);
    }

    fn set_not_busy(&self, sync: &mut TextureSync) {
        sync.busy = false;
        if sync.delayed_release {
            let still_owner = match (&sync.owner, &sync.delayed_release_owner) {
                (Some(owner), Some(pending)) => Weak::ptr_eq(owner, pending),
                _ => false,
            };
            if still_owner {
                sync.owner = None;
            }
            sync.delayed_release = false;
            sync.delayed_release_owner = None;
        }
        self.busy_cond.notify_all();
    }

    pub fn is_busy(&self) -> bool {
        self.sync.lock().expect("texture busy lock poisoned").busy
    }

    pub fn owner(&self) -> Option<Arc<Tile>> {
        self.sync
            .lock()
            .expect("texture busy lock poisoned")
            .owner
            .as_ref()
            .and_then(Weak::upgrade)
    }

    pub fn is_owned_by(&self, tile: &Tile) -> bool {
        self.sync
            .lock()
            .expect("texture busy lock poisoned")
            .owner
            .as_ref()
            .is_some_and(|owner| std::ptr::eq(owner.as_ptr(), tile))
    }

    /// Takes ownership for `candidate`. If the candidate already owns the
    /// texture, a pending delayed release is cancelled and the call
    /// succeeds.
    pub fn acquire(&self, candidate: &Arc<Tile>, force: bool) -> bool {
        {
            let mut sync = self.sync.lock().expect("texture busy lock poisoned");
            let already_owner = sync
                .owner
                .as_ref()
                .is_some_and(|owner| std::ptr::eq(owner.as_ptr(), Arc::as_ptr(candidate)));
            if already_owner {
                sync.delayed_release = false;
                sync.delayed_release_owner = None;
                return true;
            }
        }
        self.set_owner(candidate, force)
    }

    /// Steal path for textures belonging to other surfaces: succeeds only
    /// when the texture is idle and its current owner sits on a different
    /// surface than the candidate, so the surface being composited keeps its
    /// textures.
    pub fn try_acquire(&self, candidate: &Arc<Tile>) -> bool {
        {
            let sync = self.sync.lock().expect("texture busy lock poisoned");
            if sync.busy {
                return false;
            }
            let Some(owner) = sync.owner.as_ref().and_then(Weak::upgrade) else {
                return false;
            };
            if owner.surface_id() == candidate.surface_id() {
                return false;
            }
        }
        self.acquire(candidate, false)
    }

    /// With `force`, waits on the busy condition; without it, fails while
    /// busy. A differing prior owner is asked to give the texture up and may
    /// refuse.
    pub fn set_owner(&self, candidate: &Arc<Tile>, force: bool) -> bool {
        let prior = {
            let mut sync = self.sync.lock().expect("texture busy lock poisoned");
            if force {
                while sync.busy {
                    sync = self
                        .busy_cond
                        .wait(sync)
                        .expect("texture busy lock poisoned");
                }
            }
            if sync.busy {
                return false;
            }
            sync.owner.clone()
        };

        // The busy lock is dropped before consulting the prior owner: its
        // removal path takes the tile mutex and may call back into
        // release(). If the producer slips in meanwhile it re-checks the
        // owner after producer_lock and bails.
        let mut proceed = true;
        if let Some(prior) = prior.and_then(|owner| owner.upgrade()) {
            if !Arc::ptr_eq(&prior, candidate) {
                proceed = prior.remove_texture(self);
            }
        }
        if !proceed {
            log::debug!("texture steal refused by current owner");
            return false;
        }

        let mut sync = self.sync.lock().expect("texture busy lock poisoned");
        sync.owner = Some(Arc::downgrade(candidate));
        true
    }

    /// Gives the texture up on behalf of `owner`. While an upload is in
    /// flight the release is recorded and consummated by the producer
    /// release path, and only if the owner has not changed in between.
    pub fn release(&self, owner: &Tile) -> bool {
        let mut sync = self.sync.lock().expect("texture busy lock poisoned");
        let is_owner = sync
            .owner
            .as_ref()
            .is_some_and(|current| std::ptr::eq(current.as_ptr(), owner));
        if !is_owner {
            return false;
        }
        if !sync.busy {
            sync.owner = None;
        } else {
            sync.delayed_release = true;
            sync.delayed_release_owner = sync.owner.clone();
        }
        true
    }

    /// Scale recorded by the last committed upload.
    pub fn scale(&self) -> f32 {
        self.sync
            .lock()
            .expect("texture busy lock poisoned")
            .committed
            .scale
    }

    pub fn committed_info(&self) -> TextureTileInfo {
        self.sync
            .lock()
            .expect("texture busy lock poisoned")
            .committed
            .clone()
    }

    pub fn ready_for(&self, identity: &TileIdentity, inverted_screen: bool) -> bool {
        let sync = self.sync.lock().expect("texture busy lock poisoned");
        let info = &sync.committed;
        info.x == identity.x
            && info.y == identity.y
            && info.scale == identity.scale
            && info.painter == identity.painter
            && info.inverted == inverted_screen
    }

    /// Pins the front slot, runs `read` over its bitmap and committed
    /// record, then unpins and signals any producer waiting to reuse the
    /// slot.
    pub fn consumer_sample<R>(&self, read: impl FnOnce(&TileBitmap, &TextureTileInfo) -> R) -> R {
        let front = {
            let mut sync = self.sync.lock().expect("texture busy lock poisoned");
            let front = sync.front;
            sync.sampling[front] += 1;
            front
        };
        let result = {
            let slot = self.slots[front].lock().expect("texture slot lock poisoned");
            // The front slot's staged record is the committed one.
            read(&slot.bitmap, &slot.staged)
        };
        let mut sync = self.sync.lock().expect("texture busy lock poisoned");
        sync.sampling[front] -= 1;
        self.busy_cond.notify_all();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{bind_tile, stub_painter};
    use render_protocol::TilePainter;

    fn texture() -> TileTexture {
        TileTexture::new(TextureId(1), 8, 8)
    }

    fn filled_bitmap(rgba: [u8; 4]) -> TileBitmap {
        let mut bitmap = TileBitmap::new(8, 8).expect("create bitmap");
        bitmap.fill(rgba);
        bitmap
    }

    #[test]
    fn release_while_idle_clears_owner_immediately() {
        let texture = texture();
        let painter = stub_painter(1, 1);
        let tile = bind_tile(&painter, 0, 0, 1.0);
        assert!(texture.acquire(&tile, false));
        assert!(texture.is_owned_by(&tile));

        assert!(texture.release(&tile));
        assert!(texture.owner().is_none());
    }

    #[test]
    fn release_while_busy_defers_until_producer_release() {
        let texture = texture();
        let painter = stub_painter(1, 1);
        let tile = bind_tile(&painter, 0, 0, 1.0);
        assert!(texture.acquire(&tile, false));

        let lease = texture.producer_lock();
        assert!(texture.release(&tile));
        assert!(
            texture.is_owned_by(&tile),
            "owner must survive until the upload finishes"
        );

        texture.producer_release(lease);
        assert!(texture.owner().is_none());
        assert!(!texture.is_busy());
    }

    #[test]
    fn delayed_release_survives_swap_path() {
        let texture = texture();
        let painter = stub_painter(1, 1);
        let tile = bind_tile(&painter, 0, 0, 1.0);
        assert!(texture.acquire(&tile, false));

        let lease = texture.producer_lock();
        assert!(texture.release(&tile));
        texture.stage_tile_info(
            &lease,
            TextureTileInfo {
                x: 0,
                y: 0,
                scale: 1.0,
                painter: Some(painter.painter_id()),
                picture: PictureVersion(3),
                inverted: false,
            },
        );
        assert!(texture.producer_update(lease, &filled_bitmap([9, 9, 9, 9])));

        assert!(texture.owner().is_none());
        assert_eq!(texture.committed_info().picture, PictureVersion(3));
    }

    #[test]
    fn reacquire_by_owner_cancels_pending_delayed_release() {
        let texture = texture();
        let painter = stub_painter(1, 1);
        let tile = bind_tile(&painter, 0, 0, 1.0);
        assert!(texture.acquire(&tile, false));

        let lease = texture.producer_lock();
        assert!(texture.release(&tile));
        assert!(texture.acquire(&tile, false));
        texture.producer_release(lease);

        assert!(
            texture.is_owned_by(&tile),
            "cancelled delayed release must not clear the owner"
        );
    }

    #[test]
    fn release_by_non_owner_is_rejected() {
        let texture = texture();
        let painter = stub_painter(1, 1);
        let owner = bind_tile(&painter, 0, 0, 1.0);
        let other = bind_tile(&painter, 1, 0, 1.0);
        assert!(texture.acquire(&owner, false));

        assert!(!texture.release(&other));
        assert!(texture.is_owned_by(&owner));
    }

    #[test]
    fn set_owner_without_force_fails_while_busy() {
        let texture = texture();
        let painter = stub_painter(1, 1);
        let owner = bind_tile(&painter, 0, 0, 1.0);
        let thief = bind_tile(&painter, 1, 0, 1.0);
        assert!(texture.acquire(&owner, false));

        let lease = texture.producer_lock();
        assert!(!texture.acquire(&thief, false));
        assert!(texture.is_owned_by(&owner));
        texture.producer_release(lease);
    }

    #[test]
    fn try_acquire_refuses_same_surface_and_busy_textures() {
        let texture = texture();
        let painter_a = stub_painter(1, 7);
        let painter_b = stub_painter(2, 7);
        let painter_c = stub_painter(3, 8);
        let owner = bind_tile(&painter_a, 0, 0, 1.0);
        let same_surface = bind_tile(&painter_b, 1, 0, 1.0);
        let other_surface = bind_tile(&painter_c, 2, 0, 1.0);
        assert!(texture.acquire(&owner, false));

        assert!(
            !texture.try_acquire(&same_surface),
            "textures of the surface being composited must not be stolen"
        );

        let lease = texture.producer_lock();
        assert!(!texture.try_acquire(&other_surface));
        texture.producer_release(lease);

        assert!(texture.try_acquire(&other_surface));
        assert!(texture.is_owned_by(&other_surface));
    }

    #[test]
    fn try_acquire_ignores_unowned_textures() {
        let texture = texture();
        let painter = stub_painter(1, 1);
        let tile = bind_tile(&painter, 0, 0, 1.0);
        assert!(!texture.try_acquire(&tile));
    }

    #[test]
    fn empty_bitmap_releases_without_swap() {
        let texture = texture();
        let painter = stub_painter(1, 1);
        let tile = bind_tile(&painter, 0, 0, 1.0);
        assert!(texture.acquire(&tile, false));

        let lease = texture.producer_lock();
        texture.stage_tile_info(
            &lease,
            TextureTileInfo {
                x: 0,
                y: 0,
                scale: 1.0,
                painter: Some(painter.painter_id()),
                picture: PictureVersion(1),
                inverted: false,
            },
        );
        assert!(!texture.producer_update(lease, &TileBitmap::empty()));

        assert_eq!(texture.committed_info(), TextureTileInfo::default());
        assert!(!texture.is_busy());
    }

    #[test]
    fn swap_publishes_staged_metadata_and_pixels() {
        let texture = texture();
        let painter = stub_painter(4, 2);
        let tile = bind_tile(&painter, 3, 5, 2.0);
        assert!(texture.acquire(&tile, false));

        let lease = texture.producer_lock();
        let info = TextureTileInfo {
            x: 3,
            y: 5,
            scale: 2.0,
            painter: Some(painter.painter_id()),
            picture: PictureVersion(11),
            inverted: false,
        };
        texture.stage_tile_info(&lease, info.clone());
        assert!(texture.producer_update(lease, &filled_bitmap([1, 2, 3, 4])));

        assert_eq!(texture.committed_info(), info);
        let identity = TileIdentity {
            x: 3,
            y: 5,
            scale: 2.0,
            painter: Some(painter.painter_id()),
        };
        assert!(texture.ready_for(&identity, false));
        assert!(
            !texture.ready_for(&identity, true),
            "inversion mismatch must force a repaint"
        );
        texture.consumer_sample(|bitmap, committed| {
            assert_eq!(bitmap.pixel_at(0, 0), Some([1, 2, 3, 4]));
            assert_eq!(committed.picture, PictureVersion(11));
        });
    }

    #[test]
    fn producer_lock_waits_for_back_slot_samplers() {
        use std::sync::mpsc;
        use std::thread;
        use std::time::Duration;

        let texture = Arc::new(texture());
        let painter = stub_painter(1, 1);
        let tile = bind_tile(&painter, 0, 0, 1.0);
        assert!(texture.acquire(&tile, false));

        // Pin the front slot, then swap: the pinned slot becomes the back
        // buffer and the next producer_lock has to wait it out.
        let (sample_entered, sampling) = mpsc::channel();
        let (release_sample, release) = mpsc::channel();
        let sampler_texture = Arc::clone(&texture);
        let sampler = thread::spawn(move || {
            sampler_texture.consumer_sample(|_, _| {
                sample_entered.send(()).expect("report sample entry");
                release.recv().expect("hold the sample open");
            });
        });
        sampling.recv().expect("sampler entered");

        let lease = texture.producer_lock();
        texture.stage_tile_info(&lease, TextureTileInfo::default());
        assert!(texture.producer_update(lease, &filled_bitmap([5, 5, 5, 5])));

        let (locked, lock_done) = mpsc::channel();
        let producer_texture = Arc::clone(&texture);
        let producer = thread::spawn(move || {
            let lease = producer_texture.producer_lock();
            locked.send(()).expect("report producer lock");
            producer_texture.producer_release(lease);
        });

        assert!(
            lock_done
                .recv_timeout(Duration::from_millis(50))
                .is_err(),
            "producer must block while the back slot is sampled"
        );
        release_sample.send(()).expect("release the sample");
        lock_done
            .recv_timeout(Duration::from_secs(5))
            .expect("producer proceeds once the sample ends");
        sampler.join().expect("sampler thread");
        producer.join().expect("producer thread");
    }
}
