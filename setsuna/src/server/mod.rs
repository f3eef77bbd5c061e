//! Server core: global state, per-session state and the listener threads.
//!
//! One mutex guards the thread-slot table, the primary-client designations
//! and the shared-memory slot publication. It is held for O(MAX_CLIENTS)
//! work only, never across socket I/O or GPU submissions. Per-session flags
//! the arbiter and render thread read are atomics on an arena of
//! [`SessionShared`] entries; the slots never move, so the slot index is the
//! session's identity for the whole server lifetime.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering},
        Arc,
    },
    thread::JoinHandle,
    time::Duration,
};

use parking_lot::{Condvar, Mutex};

use setsuna_device::Device;
use setsuna_graphics::{
    CommittedSlot, CompositorBase, CompositorSemaphore, FramePrediction, GraphicsBundle,
    SharedResources, Swapchain, SystemCompositor,
};
use setsuna_ipc::{
    channel::MessageChannel,
    protocol::{MAX_CLIENTS, MAX_CLIENT_SEMAPHORES, MAX_CLIENT_SWAPCHAINS},
    shmem::SnapshotWriter,
};

pub mod arbiter;
pub mod client;
pub mod dispatch;
pub mod mainloop;
pub mod render;

/// Connection state machine of one thread slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Ready,
    Starting,
    Running,
    Stopping,
}

/// One entry of the thread-slot table. Protected by the global lock.
pub struct ClientSlot {
    /// `-1` while the slot is free.
    pub server_thread_index: i64,
    pub run_state: RunState,
    pub thread: Option<JoinHandle<()>>,
}

impl ClientSlot {
    fn new() -> Self {
        Self {
            server_thread_index: -1,
            run_state: RunState::Ready,
            thread: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.server_thread_index >= 0
    }
}

/// Everything the single global mutex protects.
pub struct GlobalState {
    pub slots: [ClientSlot; MAX_CLIENTS],
    /// Currently designated primary; `-1` = idle ("wallpaper").
    pub active_client_index: i64,
    pub last_active_client_index: i64,
    pub snapshot: SnapshotWriter,
}

/// Events queued for a session's `compositor_poll_events`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    StateChange { visible: bool, focused: bool },
    OverlayResync,
    Shutdown,
}

/// Cross-thread view of one session. The listener thread owns mutation of
/// the session's resources; these fields are what the arbiter and the render
/// thread are allowed to read.
pub struct SessionShared {
    pub index: usize,
    pub created: AtomicBool,
    pub begun: AtomicBool,
    /// True once the client called `predict_frame` since `session_begin`.
    pub active: AtomicBool,
    pub visible: AtomicBool,
    pub focused: AtomicBool,
    pub overlay: AtomicBool,
    pub io_active: AtomicBool,
    pub has_compositor: AtomicBool,
    pub z_order: AtomicI64,
    pub pid: AtomicU32,
    pub app_name: Mutex<String>,
    pub events: Mutex<VecDeque<SessionEvent>>,
    /// Most recently committed frame; read by the render thread.
    pub latest_slot: Mutex<Option<Arc<CommittedSlot>>>,
}

impl SessionShared {
    fn new(index: usize) -> Self {
        Self {
            index,
            created: AtomicBool::new(false),
            begun: AtomicBool::new(false),
            active: AtomicBool::new(false),
            visible: AtomicBool::new(false),
            focused: AtomicBool::new(false),
            overlay: AtomicBool::new(false),
            io_active: AtomicBool::new(false),
            has_compositor: AtomicBool::new(false),
            z_order: AtomicI64::new(0),
            pid: AtomicU32::new(0),
            app_name: Mutex::new(String::new()),
            events: Mutex::new(VecDeque::new()),
            latest_slot: Mutex::new(None),
        }
    }

    /// Zeroes every cross-thread field. Part of session cleanup.
    pub fn reset(&self) {
        self.created.store(false, Ordering::Relaxed);
        self.begun.store(false, Ordering::Relaxed);
        self.active.store(false, Ordering::Relaxed);
        self.visible.store(false, Ordering::Relaxed);
        self.focused.store(false, Ordering::Relaxed);
        self.overlay.store(false, Ordering::Relaxed);
        self.io_active.store(false, Ordering::Relaxed);
        self.has_compositor.store(false, Ordering::Relaxed);
        self.z_order.store(0, Ordering::Relaxed);
        self.pid.store(0, Ordering::Relaxed);
        self.app_name.lock().clear();
        self.events.lock().clear();
        *self.latest_slot.lock() = None;
    }

    pub fn push_event(&self, event: SessionEvent) {
        self.events.lock().push_back(event);
    }
}

/// The one server object. Shared by the acceptor, every listener thread and
/// the render thread.
pub struct Server {
    pub global: Mutex<GlobalState>,
    pub sessions: [Arc<SessionShared>; MAX_CLIENTS],
    pub devices: Vec<Arc<dyn Device>>,
    pub bundle: Arc<dyn GraphicsBundle>,
    pub shared_resources: Arc<SharedResources>,
    pub system_compositor: Arc<dyn SystemCompositor>,
    pub frame_period: Duration,
    pub exit_on_disconnect: bool,
    shutdown: AtomicBool,
    shutdown_cond: Condvar,
    shutdown_lock: Mutex<()>,
}

impl Server {
    pub fn new(
        snapshot: SnapshotWriter,
        devices: Vec<Arc<dyn Device>>,
        bundle: Arc<dyn GraphicsBundle>,
        system_compositor: Arc<dyn SystemCompositor>,
        frame_period: Duration,
        exit_on_disconnect: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            global: Mutex::new(GlobalState {
                slots: std::array::from_fn(|_| ClientSlot::new()),
                active_client_index: -1,
                last_active_client_index: -1,
                snapshot,
            }),
            sessions: std::array::from_fn(|index| Arc::new(SessionShared::new(index))),
            devices,
            bundle,
            shared_resources: Arc::new(SharedResources::new()),
            system_compositor,
            frame_period,
            exit_on_disconnect,
            shutdown: AtomicBool::new(false),
            shutdown_cond: Condvar::new(),
            shutdown_lock: Mutex::new(()),
        })
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub fn request_shutdown(&self) {
        if !self.shutdown.swap(true, Ordering::AcqRel) {
            log::info!("shutdown requested");
            for session in &self.sessions {
                session.push_event(SessionEvent::Shutdown);
            }
            self.shutdown_cond.notify_all();
        }
    }

    /// Blocks until shutdown is requested or `timeout` passes.
    pub fn wait_shutdown(&self, timeout: Duration) -> bool {
        if self.is_shutting_down() {
            return true;
        }
        let mut guard = self.shutdown_lock.lock();
        let _ = self.shutdown_cond.wait_for(&mut guard, timeout);
        self.is_shutting_down()
    }
}

/// Listener-thread-owned state of one connection: the channel plus every
/// resource the session owns. Dropping the arrays releases the resources
/// into their deferred-destruction paths.
pub struct Session {
    pub index: usize,
    pub channel: MessageChannel,
    pub shared: Arc<SessionShared>,
    pub compositor: Option<Arc<CompositorBase>>,
    pub swapchains: Vec<Option<Arc<Swapchain>>>,
    pub semaphores: Vec<Option<Arc<CompositorSemaphore>>>,
    pub last_prediction: Option<FramePrediction>,
}

impl Session {
    pub fn new(index: usize, channel: MessageChannel, shared: Arc<SessionShared>) -> Self {
        Self {
            index,
            channel,
            shared,
            compositor: None,
            swapchains: (0..MAX_CLIENT_SWAPCHAINS).map(|_| None).collect(),
            semaphores: (0..MAX_CLIENT_SEMAPHORES).map(|_| None).collect(),
            last_prediction: None,
        }
    }

    /// First free swapchain id, if the cap is not reached.
    pub fn free_swapchain_id(&self) -> Option<u32> {
        self.swapchains
            .iter()
            .position(|slot| slot.is_none())
            .map(|index| index as u32)
    }

    pub fn swapchain(&self, id: u32) -> Option<&Arc<Swapchain>> {
        self.swapchains.get(id as usize).and_then(Option::as_ref)
    }

    pub fn free_semaphore_id(&self) -> Option<u32> {
        self.semaphores
            .iter()
            .position(|slot| slot.is_none())
            .map(|index| index as u32)
    }

    pub fn semaphore(&self, id: u32) -> Option<&Arc<CompositorSemaphore>> {
        self.semaphores.get(id as usize).and_then(Option::as_ref)
    }
}
