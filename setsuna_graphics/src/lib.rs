/*! Compositor and GPU layer of the setsuna runtime.
 *
 * The server core talks to the GPU exclusively through the [`bundle`] seam;
 * [`vulkan`] and [`headless`] provide the two in-tree back-ends. On top of
 * the seam sit the [`swapchain`] engine with its deferred-destruction
 * [`garbage`] stack, the refcounted [`sync`] objects, the frame [`pacing`]
 * sleeper and the [`compositor`] base shared by every concrete system
 * compositor.
 */

pub mod bundle;
pub mod compositor;
pub mod garbage;
pub mod headless;
pub mod pacing;
pub mod swapchain;
pub mod sync;
pub mod vulkan;

pub use bundle::{BundleError, GraphicsBundle};
pub use compositor::{
    CommittedLayer, CommittedSlot, CompositorBase, FramePoint, FramePrediction, LayerError,
    SwapchainProperties, SystemCompositor, SystemCompositorInfo,
};
pub use garbage::SharedResources;
pub use headless::HeadlessBundle;
pub use swapchain::{Swapchain, SwapchainCreateInfo, SwapchainError};
pub use sync::{CompositorSemaphore, ImportedFence, WaitOutcome};
