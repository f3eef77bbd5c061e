//! Compositor base: the parts every concrete compositor shares.
//!
//! A concrete system compositor (the real presentation back-end, the headless
//! null one, a windowed debug one) only supplies frame timing and the final
//! submission. Everything else lives here in [`CompositorBase`]: swapchain
//! property derivation, the per-frame layer-slot accumulator, frame-pacing
//! waits and the sync-object plumbing.

use std::{
    sync::{Arc, OnceLock},
    time::{Duration, Instant},
};

use parking_lot::Mutex;

use setsuna_ipc::protocol::{LayerEntry, MAX_LAYERS, MAX_LAYER_SWAPCHAINS};

use crate::{
    bundle::{BundleError, GraphicsBundle},
    garbage::SharedResources,
    pacing::PreciseSleeper,
    swapchain::{Swapchain, SwapchainCreateInfo, SwapchainError},
    sync::{CompositorSemaphore, ImportedFence},
};

pub mod null;

/// Monotonic nanoseconds since process start; the time base every prediction
/// and display-time value is expressed in.
pub fn now_ns() -> i64 {
    epoch().elapsed().as_nanos() as i64
}

/// Converts a time base value back into an [`Instant`].
pub fn instant_at(ns: i64) -> Instant {
    *epoch() + Duration::from_nanos(ns.max(0) as u64)
}

fn epoch() -> &'static Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now)
}

#[derive(Debug, Clone, Copy)]
pub struct FramePrediction {
    pub frame_id: i64,
    pub wake_time_ns: i64,
    pub display_time_ns: i64,
    pub period_ns: i64,
}

/// Milestones a frame passes through, reported back to the concrete
/// compositor so it can refine its timing model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramePoint {
    Woke,
    Begun,
    Discarded,
    Submitted,
}

#[derive(Debug, Clone)]
pub struct SystemCompositorInfo {
    pub name: String,
    pub view_width: u32,
    pub view_height: u32,
    pub refresh_rate_hz: f32,
    pub blend_modes: Vec<u32>,
}

/// The presentation back-end seam.
pub trait SystemCompositor: Send + Sync {
    fn info(&self) -> SystemCompositorInfo;

    /// Computes the next frame's timing.
    fn predict_frame(&self) -> FramePrediction;

    fn mark_frame(&self, frame_id: i64, point: FramePoint, when_ns: i64);

    /// Takes one committed slot for presentation. If the slot carries a sync
    /// point, the compositor must wait on it GPU-side before sampling any
    /// referenced image.
    fn submit_slot(&self, slot: &CommittedSlot) -> anyhow::Result<()>;

    fn set_client_state(&self, client_index: usize, visible: bool, focused: bool);

    fn set_client_z_order(&self, client_index: usize, z_order: i64);
}

/// One layer inside a committed slot: the flat wire entry plus strong
/// references to the swapchains it samples.
pub struct CommittedLayer {
    pub entry: LayerEntry,
    pub swapchains: Vec<Arc<Swapchain>>,
}

/// A fully committed frame handed from a session to the render thread. Holds
/// swapchain references (and in-use image marks) for as long as the frame is
/// in flight; dropping the slot retires them.
pub struct CommittedSlot {
    pub frame_id: i64,
    pub display_time_ns: i64,
    pub blend_mode: u32,
    pub one_projection_fast_path: bool,
    pub layers: Vec<CommittedLayer>,
    pub sync: Option<(Arc<CompositorSemaphore>, u64)>,
    in_use: Vec<(Arc<Swapchain>, u32)>,
}

impl CommittedSlot {
    /// Image indices currently pinned by this slot, for tests.
    pub fn pinned_images(&self) -> impl Iterator<Item = (&Arc<Swapchain>, u32)> {
        self.in_use.iter().map(|(chain, index)| (chain, *index))
    }
}

impl Drop for CommittedSlot {
    fn drop(&mut self) {
        for (chain, index) in self.in_use.drain(..) {
            chain.retire(index);
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SwapchainProperties {
    pub image_count: u32,
}

/// Default image count when the client did not ask for a static image.
pub const DEFAULT_IMAGE_COUNT: u32 = 3;

#[derive(Debug, thiserror::Error)]
pub enum LayerError {
    #[error("layer slot is full")]
    SlotFull,
    #[error("no frame between layer_begin and layer_commit")]
    NoFrameBegun,
    #[error("layer kind {0} is unknown")]
    UnknownKind(u32),
    #[error("layer references {got} swapchains, kind needs {expected}")]
    SwapchainCount { expected: u32, got: u32 },
    #[error("system compositor rejected the slot: {0}")]
    Rejected(String),
}

struct PendingSlot {
    frame_id: i64,
    display_time_ns: i64,
    blend_mode: u32,
    layers: Vec<CommittedLayer>,
}

/// Per-session compositor front-end.
pub struct CompositorBase {
    sys: Arc<dyn SystemCompositor>,
    bundle: Arc<dyn GraphicsBundle>,
    shared: Arc<SharedResources>,
    sleeper: PreciseSleeper,
    pending: Mutex<Option<PendingSlot>>,
}

impl CompositorBase {
    pub fn new(
        sys: Arc<dyn SystemCompositor>,
        bundle: Arc<dyn GraphicsBundle>,
        shared: Arc<SharedResources>,
    ) -> Self {
        Self {
            sys,
            bundle,
            shared,
            sleeper: PreciseSleeper::new(),
            pending: Mutex::new(None),
        }
    }

    pub fn system(&self) -> &Arc<dyn SystemCompositor> {
        &self.sys
    }

    pub fn bundle(&self) -> &Arc<dyn GraphicsBundle> {
        &self.bundle
    }

    pub fn shared_resources(&self) -> &Arc<SharedResources> {
        &self.shared
    }

    /// Derives creation prerequisites from the client's info. Static-image
    /// swapchains get a single image, everything else the default ring.
    pub fn swapchain_create_properties(&self, info: &SwapchainCreateInfo) -> SwapchainProperties {
        SwapchainProperties {
            image_count: if info.is_static() {
                1
            } else {
                DEFAULT_IMAGE_COUNT
            },
        }
    }

    pub fn create_swapchain(
        &self,
        info: SwapchainCreateInfo,
    ) -> Result<Arc<Swapchain>, SwapchainError> {
        let properties = self.swapchain_create_properties(&info);
        Swapchain::create(
            self.bundle.clone(),
            self.shared.clone(),
            info,
            properties.image_count,
        )
    }

    pub fn import_swapchain(
        &self,
        info: SwapchainCreateInfo,
        native_images: Vec<std::os::fd::OwnedFd>,
    ) -> Result<Arc<Swapchain>, SwapchainError> {
        Swapchain::import(self.bundle.clone(), self.shared.clone(), info, native_images)
    }

    pub fn create_semaphore(&self) -> Result<Arc<CompositorSemaphore>, BundleError> {
        CompositorSemaphore::create(self.bundle.clone())
    }

    pub fn import_fence(&self, native: std::os::fd::OwnedFd) -> Result<ImportedFence, BundleError> {
        ImportedFence::import(self.bundle.clone(), native)
    }

    /// Computes the next frame's timing without blocking.
    pub fn predict_frame(&self) -> FramePrediction {
        self.sys.predict_frame()
    }

    /// Sleeps precisely to the predicted wake-up time, then lets the timing
    /// model know the client woke.
    pub fn wait_woke(&self, prediction: &FramePrediction) {
        self.sleeper.sleep_until(instant_at(prediction.wake_time_ns));
        self.sys
            .mark_frame(prediction.frame_id, FramePoint::Woke, now_ns());
    }

    /// The blocking `wait_frame` of the compositor interface: predict, sleep,
    /// mark, return the prediction.
    pub fn wait_frame(&self) -> FramePrediction {
        let prediction = self.predict_frame();
        self.wait_woke(&prediction);
        prediction
    }

    /// Resets the in-flight slot for a new frame.
    pub fn layer_begin(&self, frame_id: i64, display_time_ns: i64, blend_mode: u32) {
        *self.pending.lock() = Some(PendingSlot {
            frame_id,
            display_time_ns,
            blend_mode,
            layers: Vec::new(),
        });
        self.sys.mark_frame(frame_id, FramePoint::Begun, now_ns());
    }

    /// Appends one layer to the in-flight slot.
    pub fn push_layer(
        &self,
        entry: LayerEntry,
        swapchains: Vec<Arc<Swapchain>>,
    ) -> Result<(), LayerError> {
        let expected = setsuna_ipc::protocol::layer_kind::swapchain_count(entry.kind)
            .ok_or(LayerError::UnknownKind(entry.kind))?;
        if swapchains.len() != expected as usize || expected > MAX_LAYER_SWAPCHAINS as u32 {
            return Err(LayerError::SwapchainCount {
                expected,
                got: swapchains.len() as u32,
            });
        }

        let mut pending = self.pending.lock();
        let slot = pending.as_mut().ok_or(LayerError::NoFrameBegun)?;
        if slot.layers.len() >= MAX_LAYERS {
            return Err(LayerError::SlotFull);
        }
        slot.layers.push(CommittedLayer { entry, swapchains });
        Ok(())
    }

    /// Drops the in-flight slot without presenting it.
    pub fn discard_frame(&self, frame_id: i64) {
        *self.pending.lock() = None;
        self.sys
            .mark_frame(frame_id, FramePoint::Discarded, now_ns());
    }

    /// Seals the in-flight slot and hands it to the system compositor. Every
    /// referenced swapchain's most recently released image is pinned until
    /// the returned slot is dropped.
    pub fn layer_commit(
        &self,
        frame_id: i64,
        sync: Option<(Arc<CompositorSemaphore>, u64)>,
    ) -> Result<Arc<CommittedSlot>, LayerError> {
        let slot = self.pending.lock().take().ok_or(LayerError::NoFrameBegun)?;
        if slot.frame_id != frame_id {
            log::debug!(
                "commit for frame {frame_id} but the slot was begun for {}",
                slot.frame_id
            );
        }

        let mut in_use = Vec::new();
        for layer in &slot.layers {
            for chain in &layer.swapchains {
                if let Some(index) = chain.latest_released() {
                    chain.mark_in_use(index);
                    in_use.push((chain.clone(), index));
                }
            }
        }

        let one_projection_fast_path = slot.layers.len() == 1
            && slot.layers[0].entry.kind == setsuna_ipc::protocol::layer_kind::PROJECTION;

        let committed = Arc::new(CommittedSlot {
            frame_id,
            display_time_ns: slot.display_time_ns,
            blend_mode: slot.blend_mode,
            one_projection_fast_path,
            layers: slot.layers,
            sync,
            in_use,
        });

        self.sys
            .submit_slot(&committed)
            .map_err(|err| LayerError::Rejected(format!("{err:#}")))?;
        self.sys
            .mark_frame(frame_id, FramePoint::Submitted, now_ns());
        Ok(committed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::ImageFormat;
    use crate::headless::HeadlessBundle;
    use super::null::NullCompositor;
    use setsuna_ipc::protocol::layer_kind;

    fn base() -> CompositorBase {
        let bundle = Arc::new(HeadlessBundle::new());
        let sys = Arc::new(NullCompositor::with_period(Duration::from_millis(5)));
        CompositorBase::new(sys, bundle, Arc::new(SharedResources::new()))
    }

    fn quad_entry() -> LayerEntry {
        LayerEntry {
            kind: layer_kind::QUAD,
            flags: 0,
            device_index: -1,
            swapchain_count: 1,
            swapchain_ids: [0; 4],
            data: [0.0; 32],
        }
    }

    fn chain(base: &CompositorBase) -> Arc<Swapchain> {
        base.create_swapchain(SwapchainCreateInfo {
            create_flags: 0,
            usage_flags: 0,
            format: ImageFormat::Rgba8Srgb,
            width: 4,
            height: 4,
            array_layer_count: 1,
            face_count: 1,
            mip_count: 1,
        })
        .unwrap()
    }

    #[test]
    fn static_swapchains_get_one_image() {
        let base = base();
        let mut info = SwapchainCreateInfo {
            create_flags: setsuna_ipc::protocol::swapchain_create_flags::STATIC_IMAGE,
            usage_flags: 0,
            format: ImageFormat::Rgba8Srgb,
            width: 4,
            height: 4,
            array_layer_count: 1,
            face_count: 1,
            mip_count: 1,
        };
        assert_eq!(base.swapchain_create_properties(&info).image_count, 1);
        info.create_flags = 0;
        assert_eq!(
            base.swapchain_create_properties(&info).image_count,
            DEFAULT_IMAGE_COUNT
        );
    }

    #[test]
    fn slot_accepts_max_layers_then_fails() {
        let base = base();
        let chain = chain(&base);
        base.layer_begin(1, 0, 0);
        for _ in 0..MAX_LAYERS {
            base.push_layer(quad_entry(), vec![chain.clone()]).unwrap();
        }
        assert!(matches!(
            base.push_layer(quad_entry(), vec![chain.clone()]),
            Err(LayerError::SlotFull)
        ));

        // The commit still succeeds with exactly MAX_LAYERS layers.
        let slot = base.layer_commit(1, None).unwrap();
        assert_eq!(slot.layers.len(), MAX_LAYERS);
    }

    #[test]
    fn commit_pins_latest_released_image_until_drop() {
        let base = base();
        let chain = chain(&base);

        let index = chain.acquire().unwrap();
        chain.release(index).unwrap();

        base.layer_begin(7, 0, 0);
        base.push_layer(quad_entry(), vec![chain.clone()]).unwrap();
        let slot = base.layer_commit(7, None).unwrap();

        // The app cannot write the image while the frame is in flight.
        assert!(chain.wait_image(index, 2_000_000).is_err());
        drop(slot);
        chain.wait_image(index, 2_000_000).unwrap();
    }

    #[test]
    fn projection_layer_swapchain_count_is_checked() {
        let base = base();
        let chain = chain(&base);
        base.layer_begin(1, 0, 0);
        let mut entry = quad_entry();
        entry.kind = layer_kind::PROJECTION;
        assert!(matches!(
            base.push_layer(entry, vec![chain.clone()]),
            Err(LayerError::SwapchainCount { expected: 2, .. })
        ));
    }

    #[test]
    fn wait_frame_sleeps_to_the_predicted_wake() {
        let base = base();
        let before = now_ns();
        let prediction = base.wait_frame();
        let after = now_ns();
        assert!(after >= prediction.wake_time_ns);
        assert!(prediction.display_time_ns > prediction.wake_time_ns);
        assert!(after - before >= prediction.period_ns / 2);
    }
}
