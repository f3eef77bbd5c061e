//! Deferred destruction of swapchain GPU objects.
//!
//! Dropping the last reference to a swapchain must not destroy views or
//! samplers the GPU could still be reading. Instead the swapchain's objects
//! are pushed onto a lock-free stack, and the render thread drains it exactly
//! once per frame, outside any submission critical section. Historically this
//! was called the "garbage collector"; it is just a work queue.

use crossbeam::queue::SegQueue;

use crate::bundle::{GraphicsBundle, ImageHandle, SamplerHandle, ViewHandle};

/// Everything one image slot owes back to the bundle.
pub struct PendingImage {
    pub handle: ImageHandle,
    pub views: Vec<ViewHandle>,
    pub samplers: Vec<SamplerHandle>,
}

pub struct PendingSwapchain {
    pub images: Vec<PendingImage>,
}

/// Shared across every swapchain of one compositor.
pub struct SharedResources {
    pending: SegQueue<PendingSwapchain>,
}

impl SharedResources {
    pub fn new() -> Self {
        Self {
            pending: SegQueue::new(),
        }
    }

    /// Called from `Swapchain::drop`, possibly on any thread.
    pub fn schedule(&self, swapchain: PendingSwapchain) {
        self.pending.push(swapchain);
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Drains the stack. Called once per frame by the render thread.
    pub fn garbage_collect(&self, bundle: &dyn GraphicsBundle) -> usize {
        let mut destroyed = 0;
        while let Some(swapchain) = self.pending.pop() {
            // No in-flight work may still reference these objects.
            bundle.wait_idle();
            for image in swapchain.images {
                for view in image.views {
                    bundle.destroy_view(view);
                }
                for sampler in image.samplers {
                    bundle.destroy_sampler(sampler);
                }
                bundle.destroy_image(image.handle);
            }
            destroyed += 1;
        }
        if destroyed > 0 {
            log::debug!("garbage collected {destroyed} swapchain(s)");
        }
        destroyed
    }
}

impl Default for SharedResources {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::ImageFormat;
    use crate::headless::HeadlessBundle;
    use crate::swapchain::{Swapchain, SwapchainCreateInfo};
    use std::sync::Arc;

    #[test]
    fn create_then_destroy_returns_bundle_to_prior_state() {
        let bundle = Arc::new(HeadlessBundle::new());
        let shared = Arc::new(SharedResources::new());
        let before = bundle.live_counts();

        let info = SwapchainCreateInfo {
            create_flags: 0,
            usage_flags: 0,
            format: ImageFormat::Rgba8Srgb,
            width: 4,
            height: 4,
            array_layer_count: 1,
            face_count: 1,
            mip_count: 1,
        };
        let chain = Swapchain::create(bundle.clone(), shared.clone(), info, 3).unwrap();
        assert_ne!(bundle.live_counts(), before);

        drop(chain);
        assert_eq!(shared.pending_len(), 1);

        // One garbage-collect pass restores the prior state.
        assert_eq!(shared.garbage_collect(bundle.as_ref()), 1);
        assert_eq!(bundle.live_counts(), before);
        assert_eq!(shared.pending_len(), 0);
    }

    #[test]
    fn destruction_waits_for_the_collect_pass() {
        let bundle = Arc::new(HeadlessBundle::new());
        let shared = Arc::new(SharedResources::new());
        let info = SwapchainCreateInfo {
            create_flags: 0,
            usage_flags: 0,
            format: ImageFormat::Rgba8Unorm,
            width: 4,
            height: 4,
            array_layer_count: 1,
            face_count: 1,
            mip_count: 1,
        };
        let chain = Swapchain::create(bundle.clone(), shared.clone(), info, 1).unwrap();
        drop(chain);

        // Nothing destroyed until the render thread runs the pass.
        let (images, _, _) = bundle.live_counts();
        assert_eq!(images, 1);
        shared.garbage_collect(bundle.as_ref());
        assert_eq!(bundle.live_counts().0, 0);
    }
}
