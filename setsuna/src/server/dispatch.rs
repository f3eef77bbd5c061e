//! Request dispatch: one table entry per command, carrying the expected
//! request and reply sizes plus the handler function.
//!
//! The listener validates the record size against the table before the
//! handler runs; size mismatches and bounds-check failures are protocol
//! errors that terminate the connection. Handlers mutate only their own
//! session without a lock and take the global lock for anything shared.

use std::os::fd::OwnedFd;
use std::sync::atomic::Ordering;

use bytemuck::Pod;

use setsuna_device::{InputName, OutputName, OutputValue, RelationFlags, SpaceRelation};
use setsuna_graphics::{
    swapchain::SwapchainCreateInfo as EngineSwapchainInfo, BundleError, CompositorBase,
    LayerError, SwapchainError,
};
use setsuna_ipc::protocol::{self as proto, Command, Status};

use super::{arbiter, Server, Session, SessionEvent};

pub struct HandlerOutput {
    pub status: Status,
    pub reply: Vec<u8>,
    pub fds: Vec<OwnedFd>,
    /// Protocol errors tear the connection down after the reply.
    pub disconnect: bool,
}

impl HandlerOutput {
    fn ok<T: Pod>(reply: &T) -> Self {
        Self {
            status: Status::Success,
            reply: bytemuck::bytes_of(reply).to_vec(),
            fds: Vec::new(),
            disconnect: false,
        }
    }

    fn ok_with_fds<T: Pod>(reply: &T, fds: Vec<OwnedFd>) -> Self {
        Self {
            status: Status::Success,
            reply: bytemuck::bytes_of(reply).to_vec(),
            fds,
            disconnect: false,
        }
    }

    fn err(status: Status) -> Self {
        Self {
            status,
            reply: Vec::new(),
            fds: Vec::new(),
            disconnect: false,
        }
    }

    fn protocol_error() -> Self {
        Self {
            status: Status::IpcFailure,
            reply: Vec::new(),
            fds: Vec::new(),
            disconnect: true,
        }
    }
}

type Handler = fn(&Server, &mut Session, &[u8], Vec<OwnedFd>) -> HandlerOutput;

pub struct CommandEntry {
    pub command: Command,
    pub request_size: usize,
    pub reply_size: usize,
    pub handler: Handler,
}

macro_rules! entry {
    ($command:ident, $request:ty, $reply:ty, $handler:ident) => {
        CommandEntry {
            command: Command::$command,
            request_size: std::mem::size_of::<$request>(),
            reply_size: std::mem::size_of::<$reply>(),
            handler: $handler,
        }
    };
}

static TABLE: [CommandEntry; 35] = [
    entry!(GetShmHandle, proto::Empty, proto::GetShmHandleReply, get_shm_handle),
    entry!(SystemCompositorGetInfo, proto::Empty, proto::CompositorInfoReply, compositor_info),
    entry!(SessionCreate, proto::SessionCreateRequest, proto::Empty, session_create),
    entry!(SessionBegin, proto::Empty, proto::Empty, session_begin),
    entry!(SessionEnd, proto::Empty, proto::Empty, session_end),
    entry!(SessionDestroy, proto::Empty, proto::Empty, session_destroy),
    entry!(CompositorGetInfo, proto::Empty, proto::CompositorInfoReply, compositor_info),
    entry!(CompositorPredictFrame, proto::Empty, proto::PredictFrameReply, predict_frame),
    entry!(CompositorWaitWoke, proto::WaitWokeRequest, proto::Empty, wait_woke),
    entry!(CompositorBeginFrame, proto::BeginFrameRequest, proto::Empty, begin_frame),
    entry!(CompositorDiscardFrame, proto::DiscardFrameRequest, proto::Empty, discard_frame),
    entry!(CompositorLayerSync, proto::LayerSyncRequest, proto::LayerSyncReply, layer_sync),
    entry!(
        CompositorLayerSyncWithSemaphore,
        proto::LayerSyncWithSemaphoreRequest,
        proto::LayerSyncReply,
        layer_sync_with_semaphore
    ),
    entry!(CompositorPollEvents, proto::Empty, proto::PollEventsReply, poll_events),
    entry!(
        SwapchainGetProperties,
        proto::SwapchainCreateInfo,
        proto::SwapchainPropertiesReply,
        swapchain_get_properties
    ),
    entry!(SwapchainCreate, proto::SwapchainCreateInfo, proto::SwapchainCreateReply, swapchain_create),
    entry!(SwapchainImport, proto::SwapchainImportRequest, proto::SwapchainImportReply, swapchain_import),
    entry!(SwapchainWaitImage, proto::SwapchainWaitImageRequest, proto::Empty, swapchain_wait_image),
    entry!(
        SwapchainAcquireImage,
        proto::SwapchainIdRequest,
        proto::SwapchainAcquireReply,
        swapchain_acquire_image
    ),
    entry!(SwapchainReleaseImage, proto::SwapchainReleaseRequest, proto::Empty, swapchain_release_image),
    entry!(SwapchainDestroy, proto::SwapchainIdRequest, proto::Empty, swapchain_destroy),
    entry!(
        CompositorSemaphoreCreate,
        proto::Empty,
        proto::SemaphoreCreateReply,
        compositor_semaphore_create
    ),
    entry!(
        CompositorSemaphoreDestroy,
        proto::SemaphoreDestroyRequest,
        proto::Empty,
        compositor_semaphore_destroy
    ),
    entry!(DeviceUpdateInput, proto::DeviceIndexRequest, proto::Empty, device_update_input),
    entry!(
        DeviceGetTrackedPose,
        proto::GetTrackedPoseRequest,
        proto::GetTrackedPoseReply,
        device_get_tracked_pose
    ),
    entry!(
        DeviceGetHandTracking,
        proto::GetHandTrackingRequest,
        proto::GetHandTrackingReply,
        device_get_hand_tracking
    ),
    entry!(DeviceGetViewPoses, proto::GetViewPosesRequest, proto::GetViewPosesReply, device_get_view_poses),
    entry!(DeviceSetOutput, proto::SetOutputRequest, proto::Empty, device_set_output),
    entry!(SystemGetClientInfo, proto::ClientIndexRequest, proto::ClientInfoReply, system_get_client_info),
    entry!(SystemSetClientInfo, proto::SetClientInfoRequest, proto::Empty, system_set_client_info),
    entry!(SystemGetClients, proto::Empty, proto::GetClientsReply, system_get_clients),
    entry!(SystemSetPrimaryClient, proto::ClientIndexRequest, proto::Empty, system_set_primary_client),
    entry!(SystemSetFocusedClient, proto::ClientIndexRequest, proto::Empty, system_set_focused_client),
    entry!(SystemToggleIoClient, proto::ClientIndexRequest, proto::Empty, system_toggle_io_client),
    entry!(SystemToggleIoDevice, proto::DeviceIndexRequest, proto::Empty, system_toggle_io_device),
];

pub fn entry_for(command: Command) -> &'static CommandEntry {
    let entry = &TABLE[(command as u32 - 1) as usize];
    debug_assert_eq!(entry.command, command);
    entry
}

/// Validates the record against the table and runs the handler.
pub fn dispatch(
    server: &Server,
    session: &mut Session,
    command: Command,
    payload: &[u8],
    fds: Vec<OwnedFd>,
) -> HandlerOutput {
    let entry = entry_for(command);
    if payload.len() != entry.request_size {
        log::warn!(
            "client {}: {command:?} carried {} bytes, expected {}",
            session.index,
            payload.len(),
            entry.request_size
        );
        return HandlerOutput::protocol_error();
    }
    if !fds.is_empty() && command != Command::SwapchainImport {
        log::warn!("client {}: unexpected handles on {command:?}", session.index);
        return HandlerOutput::protocol_error();
    }

    let output = (entry.handler)(server, session, payload, fds);
    debug_assert!(
        output.status != Status::Success || output.reply.len() == entry.reply_size,
        "{command:?} reply size mismatch"
    );
    output
}

fn decode<T: Pod>(payload: &[u8]) -> T {
    bytemuck::pod_read_unaligned(payload)
}

fn swapchain_status(err: &SwapchainError) -> Status {
    match err {
        SwapchainError::NoImageAvailable | SwapchainError::FifoOverflow => {
            Status::NoImageAvailable
        }
        SwapchainError::InvalidIndex => Status::IpcFailure,
        SwapchainError::Timeout => Status::Timeout,
        SwapchainError::FlagUnsupported => Status::SwapchainFlagUnsupported,
        SwapchainError::FormatUnsupported => Status::SwapchainFormatUnsupported,
        SwapchainError::Gpu(BundleError::Allocation(_)) => Status::Allocation,
        SwapchainError::Gpu(BundleError::Timeout) => Status::Timeout,
        SwapchainError::Gpu(_) => Status::GpuError,
    }
}

fn require_compositor<'a>(session: &'a Session) -> Result<&'a CompositorBase, HandlerOutput> {
    session
        .compositor
        .as_deref()
        .ok_or_else(|| HandlerOutput::err(Status::SessionNotCreated))
}

// ---------------------------------------------------------------------------
// Instance / system handlers
// ---------------------------------------------------------------------------

fn get_shm_handle(
    server: &Server,
    session: &mut Session,
    _payload: &[u8],
    _fds: Vec<OwnedFd>,
) -> HandlerOutput {
    let global = server.global.lock();
    match global.snapshot.fd().try_clone_to_owned() {
        Ok(fd) => {
            log::debug!("client {}: attached snapshot", session.index);
            HandlerOutput::ok_with_fds(
                &proto::GetShmHandleReply {
                    size: setsuna_ipc::shmem::SNAPSHOT_SIZE as u64,
                },
                vec![fd],
            )
        }
        Err(err) => {
            log::error!("failed to dup snapshot fd: {err}");
            HandlerOutput::err(Status::IpcFailure)
        }
    }
}

fn compositor_info(
    server: &Server,
    _session: &mut Session,
    _payload: &[u8],
    _fds: Vec<OwnedFd>,
) -> HandlerOutput {
    let info = server.system_compositor.info();
    let mut blend_modes = [0u32; proto::MAX_BLEND_MODES];
    let count = info.blend_modes.len().min(proto::MAX_BLEND_MODES);
    blend_modes[..count].copy_from_slice(&info.blend_modes[..count]);
    HandlerOutput::ok(&proto::CompositorInfoReply {
        view_width: info.view_width,
        view_height: info.view_height,
        refresh_rate_hz: info.refresh_rate_hz,
        blend_mode_count: count as u32,
        blend_modes,
        _pad: 0,
    })
}

// ---------------------------------------------------------------------------
// Session lifecycle
// ---------------------------------------------------------------------------

fn session_create(
    server: &Server,
    session: &mut Session,
    payload: &[u8],
    _fds: Vec<OwnedFd>,
) -> HandlerOutput {
    let request: proto::SessionCreateRequest = decode(payload);
    if session.compositor.is_some() {
        return HandlerOutput::err(Status::SessionAlreadyCreated);
    }

    let compositor = CompositorBase::new(
        server.system_compositor.clone(),
        server.bundle.clone(),
        server.shared_resources.clone(),
    );
    session.compositor = Some(std::sync::Arc::new(compositor));

    let shared = &session.shared;
    shared.created.store(true, Ordering::Release);
    shared
        .overlay
        .store(request.overlay != 0, Ordering::Release);
    shared.z_order.store(request.z_order, Ordering::Release);
    shared.pid.store(request.pid, Ordering::Release);
    *shared.app_name.lock() = proto::decode_name(&request.app_name);
    shared.has_compositor.store(true, Ordering::Release);

    log::info!(
        "client {}: session created for {:?} (overlay: {}, z: {})",
        session.index,
        shared.app_name.lock(),
        request.overlay != 0,
        request.z_order
    );
    HandlerOutput::ok(&proto::Empty {})
}

fn session_begin(
    _server: &Server,
    session: &mut Session,
    _payload: &[u8],
    _fds: Vec<OwnedFd>,
) -> HandlerOutput {
    if !session.shared.created.load(Ordering::Acquire) {
        return HandlerOutput::err(Status::SessionNotCreated);
    }
    session.shared.begun.store(true, Ordering::Release);
    HandlerOutput::ok(&proto::Empty {})
}

fn session_end(
    server: &Server,
    session: &mut Session,
    _payload: &[u8],
    _fds: Vec<OwnedFd>,
) -> HandlerOutput {
    if !session.shared.created.load(Ordering::Acquire) {
        return HandlerOutput::err(Status::SessionNotCreated);
    }
    session.shared.begun.store(false, Ordering::Release);
    session.shared.active.store(false, Ordering::Release);
    arbiter::deactivate_session(server, session.index);
    HandlerOutput::ok(&proto::Empty {})
}

fn session_destroy(
    server: &Server,
    session: &mut Session,
    _payload: &[u8],
    _fds: Vec<OwnedFd>,
) -> HandlerOutput {
    if session.compositor.is_none() {
        return HandlerOutput::err(Status::SessionNotCreated);
    }
    for slot in session.swapchains.iter_mut() {
        *slot = None;
    }
    for slot in session.semaphores.iter_mut() {
        *slot = None;
    }
    *session.shared.latest_slot.lock() = None;
    session.compositor = None;
    session.last_prediction = None;

    let shared = &session.shared;
    shared.created.store(false, Ordering::Release);
    shared.begun.store(false, Ordering::Release);
    shared.active.store(false, Ordering::Release);
    shared.has_compositor.store(false, Ordering::Release);
    shared.overlay.store(false, Ordering::Release);

    arbiter::deactivate_session(server, session.index);
    log::info!("client {}: session destroyed", session.index);
    HandlerOutput::ok(&proto::Empty {})
}

// ---------------------------------------------------------------------------
// Frame lifecycle
// ---------------------------------------------------------------------------

fn predict_frame(
    server: &Server,
    session: &mut Session,
    _payload: &[u8],
    _fds: Vec<OwnedFd>,
) -> HandlerOutput {
    let compositor = match require_compositor(session) {
        Ok(compositor) => compositor,
        Err(output) => return output,
    };
    let prediction = compositor.predict_frame();
    session.last_prediction = Some(prediction);

    if session.shared.begun.load(Ordering::Acquire)
        && !session.shared.active.swap(true, Ordering::AcqRel)
    {
        arbiter::activate_session(server, session.index);
    }

    HandlerOutput::ok(&proto::PredictFrameReply {
        frame_id: prediction.frame_id,
        wake_time_ns: prediction.wake_time_ns,
        predicted_display_time_ns: prediction.display_time_ns,
        predicted_period_ns: prediction.period_ns,
    })
}

fn wait_woke(
    _server: &Server,
    session: &mut Session,
    payload: &[u8],
    _fds: Vec<OwnedFd>,
) -> HandlerOutput {
    let request: proto::WaitWokeRequest = decode(payload);
    let compositor = match require_compositor(session) {
        Ok(compositor) => compositor,
        Err(output) => return output,
    };
    let Some(prediction) = session.last_prediction else {
        return HandlerOutput::err(Status::IpcFailure);
    };
    if prediction.frame_id != request.frame_id {
        log::debug!(
            "client {}: wait_woke for frame {} but predicted {}",
            session.index,
            request.frame_id,
            prediction.frame_id
        );
    }
    compositor.wait_woke(&prediction);
    HandlerOutput::ok(&proto::Empty {})
}

fn begin_frame(
    _server: &Server,
    session: &mut Session,
    payload: &[u8],
    _fds: Vec<OwnedFd>,
) -> HandlerOutput {
    let request: proto::BeginFrameRequest = decode(payload);
    let compositor = match require_compositor(session) {
        Ok(compositor) => compositor,
        Err(output) => return output,
    };
    compositor.layer_begin(request.frame_id, 0, 0);
    HandlerOutput::ok(&proto::Empty {})
}

fn discard_frame(
    _server: &Server,
    session: &mut Session,
    payload: &[u8],
    _fds: Vec<OwnedFd>,
) -> HandlerOutput {
    let request: proto::DiscardFrameRequest = decode(payload);
    let compositor = match require_compositor(session) {
        Ok(compositor) => compositor,
        Err(output) => return output,
    };
    compositor.discard_frame(request.frame_id);
    HandlerOutput::ok(&proto::Empty {})
}

fn layer_sync(
    server: &Server,
    session: &mut Session,
    payload: &[u8],
    _fds: Vec<OwnedFd>,
) -> HandlerOutput {
    let request: proto::LayerSyncRequest = decode(payload);
    ingest_layers(server, session, &request, None)
}

fn layer_sync_with_semaphore(
    server: &Server,
    session: &mut Session,
    payload: &[u8],
    _fds: Vec<OwnedFd>,
) -> HandlerOutput {
    let request: proto::LayerSyncWithSemaphoreRequest = decode(payload);
    let Some(semaphore) = session.semaphore(request.semaphore_id).cloned() else {
        return HandlerOutput::protocol_error();
    };
    ingest_layers(
        server,
        session,
        &request.sync,
        Some((semaphore, request.semaphore_value)),
    )
}

fn ingest_layers(
    server: &Server,
    session: &mut Session,
    request: &proto::LayerSyncRequest,
    sync: Option<(
        std::sync::Arc<setsuna_graphics::CompositorSemaphore>,
        u64,
    )>,
) -> HandlerOutput {
    let Some(compositor) = session.compositor.clone() else {
        return HandlerOutput::err(Status::SessionNotCreated);
    };
    let count = request.header.layer_count as usize;
    if count > proto::MAX_LAYERS {
        return HandlerOutput::protocol_error();
    }

    compositor.layer_begin(
        request.header.frame_id,
        request.header.display_time_ns,
        request.header.blend_mode,
    );
    for entry in &request.layers[..count] {
        let Some(chain_count) = proto::layer_kind::swapchain_count(entry.kind) else {
            return HandlerOutput::protocol_error();
        };
        let mut chains = Vec::with_capacity(chain_count as usize);
        for &id in &entry.swapchain_ids[..chain_count as usize] {
            match session.swapchain(id) {
                Some(chain) => chains.push(chain.clone()),
                None => return HandlerOutput::protocol_error(),
            }
        }
        if let Err(err) = compositor.push_layer(*entry, chains) {
            log::warn!("client {}: layer rejected: {err}", session.index);
            return match err {
                LayerError::SlotFull => HandlerOutput::err(Status::IpcFailure),
                _ => HandlerOutput::protocol_error(),
            };
        }
    }

    let slot = match compositor.layer_commit(request.header.frame_id, sync) {
        Ok(slot) => slot,
        Err(err) => {
            log::warn!("client {}: commit failed: {err}", session.index);
            return HandlerOutput::err(Status::IpcFailure);
        }
    };
    *session.shared.latest_slot.lock() = Some(slot);

    // Mirror the slot into shared memory and publish it for readers.
    let mut global = server.global.lock();
    let slot_index = global
        .snapshot
        .write_next_slot(request.header, &request.layers[..count]);
    global.snapshot.publish_slot(slot_index);
    drop(global);

    HandlerOutput::ok(&proto::LayerSyncReply {
        slot_index,
        _pad: 0,
    })
}

fn poll_events(
    _server: &Server,
    session: &mut Session,
    _payload: &[u8],
    _fds: Vec<OwnedFd>,
) -> HandlerOutput {
    let event = session.shared.events.lock().pop_front();
    let reply = match event {
        None => proto::PollEventsReply {
            kind: proto::event_kind::NONE,
            visible: 0,
            focused: 0,
            _pad: 0,
        },
        Some(SessionEvent::StateChange { visible, focused }) => proto::PollEventsReply {
            kind: proto::event_kind::STATE_CHANGE,
            visible: visible as u32,
            focused: focused as u32,
            _pad: 0,
        },
        Some(SessionEvent::OverlayResync) => proto::PollEventsReply {
            kind: proto::event_kind::OVERLAY_RESYNC,
            visible: 1,
            focused: 1,
            _pad: 0,
        },
        Some(SessionEvent::Shutdown) => proto::PollEventsReply {
            kind: proto::event_kind::SHUTDOWN,
            visible: 0,
            focused: 0,
            _pad: 0,
        },
    };
    HandlerOutput::ok(&reply)
}

// ---------------------------------------------------------------------------
// Swapchains
// ---------------------------------------------------------------------------

fn swapchain_get_properties(
    _server: &Server,
    session: &mut Session,
    payload: &[u8],
    _fds: Vec<OwnedFd>,
) -> HandlerOutput {
    let wire: proto::SwapchainCreateInfo = decode(payload);
    let compositor = match require_compositor(session) {
        Ok(compositor) => compositor,
        Err(output) => return output,
    };
    let info = match EngineSwapchainInfo::from_wire(&wire) {
        Ok(info) => info,
        Err(err) => return HandlerOutput::err(swapchain_status(&err)),
    };
    let properties = compositor.swapchain_create_properties(&info);
    HandlerOutput::ok(&proto::SwapchainPropertiesReply {
        image_count: properties.image_count,
        _pad: 0,
    })
}

fn swapchain_create(
    _server: &Server,
    session: &mut Session,
    payload: &[u8],
    _fds: Vec<OwnedFd>,
) -> HandlerOutput {
    let wire: proto::SwapchainCreateInfo = decode(payload);
    let compositor = match require_compositor(session) {
        Ok(compositor) => compositor,
        Err(output) => return output,
    };
    let Some(id) = session.free_swapchain_id() else {
        log::warn!("client {}: swapchain cap reached", session.index);
        return HandlerOutput::err(Status::IpcFailure);
    };
    let info = match EngineSwapchainInfo::from_wire(&wire) {
        Ok(info) => info,
        Err(err) => return HandlerOutput::err(swapchain_status(&err)),
    };

    let chain = match compositor.create_swapchain(info) {
        Ok(chain) => chain,
        Err(err) => {
            log::warn!("client {}: swapchain create failed: {err}", session.index);
            return HandlerOutput::err(swapchain_status(&err));
        }
    };
    let handles = match chain.export_native_handles() {
        Ok(handles) => handles,
        Err(err) => return HandlerOutput::err(swapchain_status(&err)),
    };

    let mut image_sizes = [0u64; proto::MAX_SWAPCHAIN_IMAGES];
    let mut use_dedicated = 0;
    for (index, image) in chain.images().iter().enumerate() {
        image_sizes[index] = image.size;
        use_dedicated |= image.uses_dedicated_allocation as u32;
    }

    let reply = proto::SwapchainCreateReply {
        id,
        image_count: chain.image_count(),
        use_dedicated_allocation: use_dedicated,
        _pad: 0,
        image_sizes,
    };
    session.swapchains[id as usize] = Some(chain);
    log::debug!("client {}: swapchain {id} created", session.index);
    HandlerOutput::ok_with_fds(&reply, handles)
}

fn swapchain_import(
    _server: &Server,
    session: &mut Session,
    payload: &[u8],
    fds: Vec<OwnedFd>,
) -> HandlerOutput {
    let request: proto::SwapchainImportRequest = decode(payload);
    let compositor = match require_compositor(session) {
        Ok(compositor) => compositor,
        Err(output) => return output,
    };
    let count = request.image_count as usize;
    if count == 0 || count > proto::MAX_SWAPCHAIN_IMAGES || fds.len() != count {
        return HandlerOutput::protocol_error();
    }
    let Some(id) = session.free_swapchain_id() else {
        return HandlerOutput::err(Status::IpcFailure);
    };
    let info = match EngineSwapchainInfo::from_wire(&request.info) {
        Ok(info) => info,
        Err(err) => return HandlerOutput::err(swapchain_status(&err)),
    };

    let chain = match compositor.import_swapchain(info, fds) {
        Ok(chain) => chain,
        Err(err) => return HandlerOutput::err(swapchain_status(&err)),
    };
    let reply = proto::SwapchainImportReply {
        id,
        image_count: chain.image_count(),
    };
    session.swapchains[id as usize] = Some(chain);
    HandlerOutput::ok(&reply)
}

fn swapchain_wait_image(
    _server: &Server,
    session: &mut Session,
    payload: &[u8],
    _fds: Vec<OwnedFd>,
) -> HandlerOutput {
    let request: proto::SwapchainWaitImageRequest = decode(payload);
    let Some(chain) = session.swapchain(request.id) else {
        return HandlerOutput::protocol_error();
    };
    match chain.wait_image(request.index, request.timeout_ns) {
        Ok(()) => HandlerOutput::ok(&proto::Empty {}),
        Err(err) => HandlerOutput::err(swapchain_status(&err)),
    }
}

fn swapchain_acquire_image(
    _server: &Server,
    session: &mut Session,
    payload: &[u8],
    _fds: Vec<OwnedFd>,
) -> HandlerOutput {
    let request: proto::SwapchainIdRequest = decode(payload);
    let Some(chain) = session.swapchain(request.id) else {
        return HandlerOutput::protocol_error();
    };
    match chain.acquire() {
        Ok(index) => HandlerOutput::ok(&proto::SwapchainAcquireReply { index, _pad: 0 }),
        Err(err) => HandlerOutput::err(swapchain_status(&err)),
    }
}

fn swapchain_release_image(
    _server: &Server,
    session: &mut Session,
    payload: &[u8],
    _fds: Vec<OwnedFd>,
) -> HandlerOutput {
    let request: proto::SwapchainReleaseRequest = decode(payload);
    let Some(chain) = session.swapchain(request.id) else {
        return HandlerOutput::protocol_error();
    };
    match chain.release(request.index) {
        Ok(()) => HandlerOutput::ok(&proto::Empty {}),
        Err(err) => HandlerOutput::err(swapchain_status(&err)),
    }
}

fn swapchain_destroy(
    _server: &Server,
    session: &mut Session,
    payload: &[u8],
    _fds: Vec<OwnedFd>,
) -> HandlerOutput {
    let request: proto::SwapchainIdRequest = decode(payload);
    if request.id as usize >= session.swapchains.len()
        || session.swapchains[request.id as usize].is_none()
    {
        return HandlerOutput::protocol_error();
    }
    // Drops this session's reference; the engine defers actual destruction
    // until the render thread's next garbage-collect pass.
    session.swapchains[request.id as usize] = None;
    log::debug!("client {}: swapchain {} destroyed", session.index, request.id);
    HandlerOutput::ok(&proto::Empty {})
}

// ---------------------------------------------------------------------------
// Compositor semaphores
// ---------------------------------------------------------------------------

fn compositor_semaphore_create(
    _server: &Server,
    session: &mut Session,
    _payload: &[u8],
    _fds: Vec<OwnedFd>,
) -> HandlerOutput {
    let compositor = match require_compositor(session) {
        Ok(compositor) => compositor,
        Err(output) => return output,
    };
    let Some(id) = session.free_semaphore_id() else {
        return HandlerOutput::err(Status::IpcFailure);
    };
    let semaphore = match compositor.create_semaphore() {
        Ok(semaphore) => semaphore,
        Err(BundleError::Allocation(err)) => {
            log::warn!("semaphore allocation failed: {err}");
            return HandlerOutput::err(Status::Allocation);
        }
        Err(err) => {
            log::warn!("semaphore creation failed: {err}");
            return HandlerOutput::err(Status::GpuError);
        }
    };
    let native = match semaphore.export_native() {
        Ok(native) => native,
        Err(err) => {
            log::warn!("semaphore handle export failed: {err}");
            return HandlerOutput::err(Status::IpcFailure);
        }
    };
    session.semaphores[id as usize] = Some(semaphore);
    HandlerOutput::ok_with_fds(&proto::SemaphoreCreateReply { id, _pad: 0 }, vec![native])
}

fn compositor_semaphore_destroy(
    _server: &Server,
    session: &mut Session,
    payload: &[u8],
    _fds: Vec<OwnedFd>,
) -> HandlerOutput {
    let request: proto::SemaphoreDestroyRequest = decode(payload);
    if request.id as usize >= session.semaphores.len()
        || session.semaphores[request.id as usize].is_none()
    {
        return HandlerOutput::protocol_error();
    }
    session.semaphores[request.id as usize] = None;
    HandlerOutput::ok(&proto::Empty {})
}

// ---------------------------------------------------------------------------
// Devices
// ---------------------------------------------------------------------------

fn device_by_index<'a>(
    server: &'a Server,
    index: u32,
) -> Result<&'a std::sync::Arc<dyn setsuna_device::Device>, HandlerOutput> {
    server
        .devices
        .get(index as usize)
        .ok_or_else(HandlerOutput::protocol_error)
}

/// Input gating: a device is gated for this session when either the session's
/// own io flag or the device's global io bit is off.
fn io_gated(server: &Server, session: &Session, device_index: u32) -> bool {
    if !session.shared.io_active.load(Ordering::Acquire) {
        return true;
    }
    let global = server.global.lock();
    !global.snapshot.io_device_enabled(device_index as usize)
}

fn relation_to_wire(relation: &SpaceRelation) -> proto::WireRelation {
    let quat = relation.pose.orientation.quaternion();
    proto::WireRelation {
        pose: proto::WirePose {
            orientation: [quat.i, quat.j, quat.k, quat.w],
            position: [
                relation.pose.position.x,
                relation.pose.position.y,
                relation.pose.position.z,
            ],
            _pad: 0.0,
        },
        linear_velocity: relation.linear_velocity.into(),
        flags: relation.flags.bits(),
        angular_velocity: relation.angular_velocity.into(),
        _pad: 0,
    }
}

fn device_update_input(
    server: &Server,
    session: &mut Session,
    payload: &[u8],
    _fds: Vec<OwnedFd>,
) -> HandlerOutput {
    let request: proto::DeviceIndexRequest = decode(payload);
    let device = match device_by_index(server, request.device_index) {
        Ok(device) => device.clone(),
        Err(output) => return output,
    };
    if io_gated(server, session, request.device_index) {
        return HandlerOutput::ok(&proto::Empty {});
    }
    device.update_inputs();

    // Refresh the live input mirror in shared memory.
    let desc = device.describe();
    let mut global = server.global.lock();
    let snap = global.snapshot.snapshot_mut();
    let record = snap.devices[request.device_index as usize];
    for (offset, input) in desc.inputs.iter().enumerate() {
        if input.name.is_pose() || offset >= record.input_count as usize {
            continue;
        }
        let mirror = &mut snap.inputs[record.first_input_index as usize + offset];
        match device.input_state(input.name) {
            Ok(state) => {
                mirror.active = state.active as u32;
                mirror.timestamp_ns = state.timestamp_ns;
                mirror.value = state.value.lanes();
            }
            Err(_) => mirror.active = 0,
        }
    }
    HandlerOutput::ok(&proto::Empty {})
}

fn device_get_tracked_pose(
    server: &Server,
    session: &mut Session,
    payload: &[u8],
    _fds: Vec<OwnedFd>,
) -> HandlerOutput {
    let request: proto::GetTrackedPoseRequest = decode(payload);
    let device = match device_by_index(server, request.device_index) {
        Ok(device) => device.clone(),
        Err(output) => return output,
    };
    let Some(name) = InputName::from_u32(request.input_name) else {
        return HandlerOutput::protocol_error();
    };

    // Head pose is the one input exempt from io gating; the view must keep
    // tracking even when a client's inputs are muted.
    if name != InputName::HeadPose && io_gated(server, session, request.device_index) {
        return HandlerOutput::err(Status::PoseNotActive);
    }

    match device.tracked_pose(name, request.at_timestamp_ns) {
        Ok(relation) => {
            if relation.flags.is_empty() {
                return HandlerOutput::err(Status::PoseNotActive);
            }
            HandlerOutput::ok(&proto::GetTrackedPoseReply {
                relation: relation_to_wire(&relation),
            })
        }
        Err(setsuna_device::DeviceError::NotActive(_)) => {
            HandlerOutput::err(Status::PoseNotActive)
        }
        Err(_) => HandlerOutput::protocol_error(),
    }
}

fn device_get_hand_tracking(
    server: &Server,
    session: &mut Session,
    payload: &[u8],
    _fds: Vec<OwnedFd>,
) -> HandlerOutput {
    let request: proto::GetHandTrackingRequest = decode(payload);
    let device = match device_by_index(server, request.device_index) {
        Ok(device) => device.clone(),
        Err(output) => return output,
    };
    let Some(name) = InputName::from_u32(request.input_name) else {
        return HandlerOutput::protocol_error();
    };
    if io_gated(server, session, request.device_index) {
        return HandlerOutput::err(Status::PoseNotActive);
    }

    match device.hand_tracking(name, request.at_timestamp_ns) {
        Ok(set) => {
            let mut reply = proto::GetHandTrackingReply {
                active: set.active as u32,
                _pad: 0,
                timestamp_ns: set.timestamp_ns,
                joints: [bytemuck::Zeroable::zeroed(); proto::MAX_HAND_JOINTS],
            };
            for (slot, joint) in reply.joints.iter_mut().zip(set.joints.iter()) {
                slot.relation = relation_to_wire(&joint.relation);
                slot.radius = joint.radius;
            }
            HandlerOutput::ok(&reply)
        }
        Err(_) => HandlerOutput::protocol_error(),
    }
}

fn device_get_view_poses(
    server: &Server,
    _session: &mut Session,
    payload: &[u8],
    _fds: Vec<OwnedFd>,
) -> HandlerOutput {
    let request: proto::GetViewPosesRequest = decode(payload);

    let head_index = {
        let global = server.global.lock();
        global.snapshot.snapshot().header.roles.head
    };
    if head_index < 0 {
        return HandlerOutput::err(Status::PoseNotActive);
    }
    let device = match device_by_index(server, head_index as u32) {
        Ok(device) => device.clone(),
        Err(output) => return output,
    };

    let relation = match device.tracked_pose(InputName::HeadPose, request.at_timestamp_ns) {
        Ok(relation) => relation,
        Err(_) => return HandlerOutput::err(Status::PoseNotActive),
    };
    if !relation.flags.contains(RelationFlags::ORIENTATION_VALID) {
        return HandlerOutput::err(Status::PoseNotActive);
    }

    // Per-eye poses: the head pose shifted by half the interpupillary
    // distance; a symmetric 90 degree field of view.
    const HALF_IPD_M: f32 = 0.032;
    const HALF_FOV_RAD: f32 = std::f32::consts::FRAC_PI_4;
    let mut poses = [proto::WirePose::identity(); proto::MAX_VIEWS];
    for (eye, pose) in poses.iter_mut().enumerate() {
        let sign = if eye == 0 { -1.0 } else { 1.0 };
        let offset = relation
            .pose
            .orientation
            .transform_vector(&setsuna_device::nalgebra::Vector3::new(
                sign * HALF_IPD_M,
                0.0,
                0.0,
            ));
        let quat = relation.pose.orientation.quaternion();
        *pose = proto::WirePose {
            orientation: [quat.i, quat.j, quat.k, quat.w],
            position: [
                relation.pose.position.x + offset.x,
                relation.pose.position.y + offset.y,
                relation.pose.position.z + offset.z,
            ],
            _pad: 0.0,
        };
    }
    let fov = proto::WireFov {
        angle_left: -HALF_FOV_RAD,
        angle_right: HALF_FOV_RAD,
        angle_up: HALF_FOV_RAD,
        angle_down: -HALF_FOV_RAD,
    };

    HandlerOutput::ok(&proto::GetViewPosesReply {
        head_relation: relation_to_wire(&relation),
        poses,
        fovs: [fov; proto::MAX_VIEWS],
    })
}

fn device_set_output(
    server: &Server,
    session: &mut Session,
    payload: &[u8],
    _fds: Vec<OwnedFd>,
) -> HandlerOutput {
    let request: proto::SetOutputRequest = decode(payload);
    let device = match device_by_index(server, request.device_index) {
        Ok(device) => device.clone(),
        Err(output) => return output,
    };
    let Some(name) = OutputName::from_u32(request.output_name) else {
        return HandlerOutput::protocol_error();
    };
    if io_gated(server, session, request.device_index) {
        return HandlerOutput::ok(&proto::Empty {});
    }

    let value = OutputValue::Vibration {
        duration_ns: request.duration_ns,
        frequency: request.frequency,
        amplitude: request.amplitude,
    }
    .clamp_duration();
    match device.set_output(name, value) {
        Ok(()) => HandlerOutput::ok(&proto::Empty {}),
        Err(_) => HandlerOutput::protocol_error(),
    }
}

// ---------------------------------------------------------------------------
// System / admin surface
// ---------------------------------------------------------------------------

fn system_get_client_info(
    server: &Server,
    _session: &mut Session,
    payload: &[u8],
    _fds: Vec<OwnedFd>,
) -> HandlerOutput {
    let request: proto::ClientIndexRequest = decode(payload);
    if request.client_index as usize >= proto::MAX_CLIENTS {
        return HandlerOutput::protocol_error();
    }
    let shared = &server.sessions[request.client_index as usize];
    HandlerOutput::ok(&proto::ClientInfoReply {
        pid: shared.pid.load(Ordering::Acquire),
        created: shared.created.load(Ordering::Acquire) as u32,
        active: shared.active.load(Ordering::Acquire) as u32,
        visible: shared.visible.load(Ordering::Acquire) as u32,
        focused: shared.focused.load(Ordering::Acquire) as u32,
        overlay: shared.overlay.load(Ordering::Acquire) as u32,
        io_active: shared.io_active.load(Ordering::Acquire) as u32,
        _pad: 0,
        z_order: shared.z_order.load(Ordering::Acquire),
        app_name: proto::encode_name(&shared.app_name.lock()),
    })
}

fn system_set_client_info(
    _server: &Server,
    session: &mut Session,
    payload: &[u8],
    _fds: Vec<OwnedFd>,
) -> HandlerOutput {
    let request: proto::SetClientInfoRequest = decode(payload);
    session.shared.pid.store(request.pid, Ordering::Release);
    *session.shared.app_name.lock() = proto::decode_name(&request.app_name);
    HandlerOutput::ok(&proto::Empty {})
}

fn system_get_clients(
    server: &Server,
    _session: &mut Session,
    _payload: &[u8],
    _fds: Vec<OwnedFd>,
) -> HandlerOutput {
    let global = server.global.lock();
    let mut reply = proto::GetClientsReply {
        count: 0,
        _pad: 0,
        indices: [0; proto::MAX_CLIENTS],
    };
    for (index, slot) in global.slots.iter().enumerate() {
        if slot.is_connected() {
            reply.indices[reply.count as usize] = index as u32;
            reply.count += 1;
        }
    }
    HandlerOutput::ok(&reply)
}

fn system_set_primary_client(
    server: &Server,
    _session: &mut Session,
    payload: &[u8],
    _fds: Vec<OwnedFd>,
) -> HandlerOutput {
    let request: proto::ClientIndexRequest = decode(payload);
    if request.client_index as usize >= proto::MAX_CLIENTS {
        return HandlerOutput::protocol_error();
    }
    arbiter::set_primary(server, request.client_index as usize);
    HandlerOutput::ok(&proto::Empty {})
}

fn system_set_focused_client(
    _server: &Server,
    _session: &mut Session,
    payload: &[u8],
    _fds: Vec<OwnedFd>,
) -> HandlerOutput {
    let request: proto::ClientIndexRequest = decode(payload);
    if request.client_index as usize >= proto::MAX_CLIENTS {
        return HandlerOutput::protocol_error();
    }
    // Focus always follows the primary; the designation alone is recorded.
    log::debug!("set_focused_client({}) requested", request.client_index);
    HandlerOutput::ok(&proto::Empty {})
}

fn system_toggle_io_client(
    server: &Server,
    _session: &mut Session,
    payload: &[u8],
    _fds: Vec<OwnedFd>,
) -> HandlerOutput {
    let request: proto::ClientIndexRequest = decode(payload);
    if request.client_index as usize >= proto::MAX_CLIENTS {
        return HandlerOutput::protocol_error();
    }
    let shared = &server.sessions[request.client_index as usize];
    let now = shared.io_active.fetch_xor(true, Ordering::AcqRel);
    log::info!("client {} io toggled to {}", request.client_index, !now);
    HandlerOutput::ok(&proto::Empty {})
}

fn system_toggle_io_device(
    server: &Server,
    _session: &mut Session,
    payload: &[u8],
    _fds: Vec<OwnedFd>,
) -> HandlerOutput {
    let request: proto::DeviceIndexRequest = decode(payload);
    if request.device_index as usize >= server.devices.len() {
        return HandlerOutput::protocol_error();
    }
    let mut global = server.global.lock();
    let enabled = global.snapshot.toggle_io_device(request.device_index as usize);
    log::info!("device {} io toggled to {enabled}", request.device_index);
    HandlerOutput::ok(&proto::Empty {})
}
