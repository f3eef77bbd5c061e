//! Wire protocol definitions shared by the server and the client connector.
//!
//! Every request is a length-prefixed record `[u32 length][u32 command][payload]`,
//! every reply is `[u32 length][u32 status][payload]`, where `length` counts the
//! command/status word plus the payload. Native handles never travel inside a
//! payload; they are attached out-of-band on the socket message that carries the
//! record. All payloads are fixed-size `#[repr(C)]` plain-old-data so both sides
//! can cast them with `bytemuck` without a serialization step.

use bytemuck::{Pod, Zeroable};

/// Hard limits baked into the shared-memory layout and the per-session state.
/// These are part of the protocol; changing any of them changes the build id.
pub const MAX_CLIENTS: usize = 8;
pub const MAX_DEVICES: usize = 16;
pub const MAX_ORIGINS: usize = 8;
pub const MAX_INPUTS: usize = 128;
pub const MAX_OUTPUTS: usize = 32;
pub const MAX_PROFILES: usize = 16;
pub const MAX_PROFILE_PAIRS: usize = 128;
pub const MAX_LAYERS: usize = 16;
pub const MAX_SLOTS: usize = 3;
pub const MAX_CLIENT_SWAPCHAINS: usize = 32;
pub const MAX_CLIENT_SEMAPHORES: usize = 8;
pub const MAX_SWAPCHAIN_IMAGES: usize = 3;
pub const MAX_VIEWS: usize = 2;
pub const MAX_BLEND_MODES: usize = 3;
pub const MAX_LAYER_SWAPCHAINS: usize = 4;
pub const MAX_HAND_JOINTS: usize = 26;

pub const DEVICE_NAME_LEN: usize = 64;
pub const APP_NAME_LEN: usize = 64;
pub const BUILD_ID_LEN: usize = 32;

/// Z-order assigned to the primary session so it always draws first.
pub const PRIMARY_Z_ORDER: i64 = i64::MIN;

/// Catalog index value meaning "no device fills this role".
pub const NO_DEVICE: i32 = -1;

/// Status code carried at the head of every reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Status {
    Success = 0,
    Timeout = 1,
    NoImageAvailable = 2,
    PoseNotActive = 3,
    SessionNotCreated = 4,
    SessionAlreadyCreated = 5,
    SwapchainFlagUnsupported = 6,
    SwapchainFormatUnsupported = 7,
    IpcFailure = 8,
    GpuError = 9,
    Allocation = 10,
    ProberNotSupported = 11,
}

impl Status {
    pub fn from_u32(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => Self::Success,
            1 => Self::Timeout,
            2 => Self::NoImageAvailable,
            3 => Self::PoseNotActive,
            4 => Self::SessionNotCreated,
            5 => Self::SessionAlreadyCreated,
            6 => Self::SwapchainFlagUnsupported,
            7 => Self::SwapchainFormatUnsupported,
            8 => Self::IpcFailure,
            9 => Self::GpuError,
            10 => Self::Allocation,
            11 => Self::ProberNotSupported,
            _ => return None,
        })
    }
}

/// Command tag carried at the head of every request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Command {
    GetShmHandle = 1,
    SystemCompositorGetInfo = 2,
    SessionCreate = 3,
    SessionBegin = 4,
    SessionEnd = 5,
    SessionDestroy = 6,
    CompositorGetInfo = 7,
    CompositorPredictFrame = 8,
    CompositorWaitWoke = 9,
    CompositorBeginFrame = 10,
    CompositorDiscardFrame = 11,
    CompositorLayerSync = 12,
    CompositorLayerSyncWithSemaphore = 13,
    CompositorPollEvents = 14,
    SwapchainGetProperties = 15,
    SwapchainCreate = 16,
    SwapchainImport = 17,
    SwapchainWaitImage = 18,
    SwapchainAcquireImage = 19,
    SwapchainReleaseImage = 20,
    SwapchainDestroy = 21,
    CompositorSemaphoreCreate = 22,
    CompositorSemaphoreDestroy = 23,
    DeviceUpdateInput = 24,
    DeviceGetTrackedPose = 25,
    DeviceGetHandTracking = 26,
    DeviceGetViewPoses = 27,
    DeviceSetOutput = 28,
    SystemGetClientInfo = 29,
    SystemSetClientInfo = 30,
    SystemGetClients = 31,
    SystemSetPrimaryClient = 32,
    SystemSetFocusedClient = 33,
    SystemToggleIoClient = 34,
    SystemToggleIoDevice = 35,
}

impl Command {
    pub fn from_u32(raw: u32) -> Option<Self> {
        if (1..=35).contains(&raw) {
            // SAFETY: Command is repr(u32) with contiguous discriminants 1..=35.
            Some(unsafe { std::mem::transmute::<u32, Command>(raw) })
        } else {
            None
        }
    }
}

/// A pose on the wire: quaternion `(x, y, z, w)` plus a position.
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct WirePose {
    pub orientation: [f32; 4],
    pub position: [f32; 3],
    pub _pad: f32,
}

impl WirePose {
    pub fn identity() -> Self {
        Self {
            orientation: [0.0, 0.0, 0.0, 1.0],
            position: [0.0; 3],
            _pad: 0.0,
        }
    }
}

/// A tracked relation on the wire. `flags` mirrors the device crate's
/// relation flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct WireRelation {
    pub pose: WirePose,
    pub linear_velocity: [f32; 3],
    pub flags: u32,
    pub angular_velocity: [f32; 3],
    pub _pad: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct WireFov {
    pub angle_left: f32,
    pub angle_right: f32,
    pub angle_up: f32,
    pub angle_down: f32,
}

/// One composited layer as carried by `compositor_layer_sync`. The pose,
/// extent and UV description is opaque to the server core; it is stored
/// flat and forwarded to the system compositor untouched.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct LayerEntry {
    pub kind: u32,
    pub flags: u32,
    pub device_index: i32,
    pub swapchain_count: u32,
    pub swapchain_ids: [u32; MAX_LAYER_SWAPCHAINS],
    pub data: [f32; 32],
}

/// Per-frame header of a layer slot.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct SlotHeader {
    pub frame_id: i64,
    pub display_time_ns: i64,
    pub blend_mode: u32,
    pub one_projection_fast_path: u32,
    pub layer_count: u32,
    pub _pad: u32,
}

/// Layer kinds understood by the compositor.
pub mod layer_kind {
    pub const PROJECTION: u32 = 0;
    pub const PROJECTION_DEPTH: u32 = 1;
    pub const QUAD: u32 = 2;
    pub const CUBE: u32 = 3;
    pub const CYLINDER: u32 = 4;
    pub const EQUIRECT1: u32 = 5;
    pub const EQUIRECT2: u32 = 6;

    /// Swapchains referenced by a layer of the given kind.
    pub fn swapchain_count(kind: u32) -> Option<u32> {
        Some(match kind {
            PROJECTION => 2,
            PROJECTION_DEPTH => 4,
            QUAD | CUBE | CYLINDER | EQUIRECT1 | EQUIRECT2 => 1,
            _ => return None,
        })
    }
}

/// Events delivered through `compositor_poll_events`.
pub mod event_kind {
    pub const NONE: u32 = 0;
    pub const STATE_CHANGE: u32 = 1;
    pub const OVERLAY_RESYNC: u32 = 2;
    pub const SHUTDOWN: u32 = 3;
}

// ---------------------------------------------------------------------------
// Request/reply payloads, one pair per command. Commands without a payload in
// one direction use `Empty`.
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
#[repr(C)]
pub struct Empty {}

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct GetShmHandleReply {
    pub size: u64,
}

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct CompositorInfoReply {
    pub view_width: u32,
    pub view_height: u32,
    pub refresh_rate_hz: f32,
    pub blend_mode_count: u32,
    pub blend_modes: [u32; MAX_BLEND_MODES],
    pub _pad: u32,
}

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct SessionCreateRequest {
    pub overlay: u32,
    pub _pad: u32,
    pub z_order: i64,
    pub pid: u32,
    pub _pad2: u32,
    pub app_name: [u8; APP_NAME_LEN],
}

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct PredictFrameReply {
    pub frame_id: i64,
    pub wake_time_ns: i64,
    pub predicted_display_time_ns: i64,
    pub predicted_period_ns: i64,
}

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct WaitWokeRequest {
    pub frame_id: i64,
}

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct BeginFrameRequest {
    pub frame_id: i64,
}

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct DiscardFrameRequest {
    pub frame_id: i64,
}

/// Full layer submission for one frame.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct LayerSyncRequest {
    pub header: SlotHeader,
    pub layers: [LayerEntry; MAX_LAYERS],
}

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct LayerSyncWithSemaphoreRequest {
    pub sync: LayerSyncRequest,
    pub semaphore_id: u32,
    pub _pad: u32,
    pub semaphore_value: u64,
}

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct LayerSyncReply {
    pub slot_index: u32,
    pub _pad: u32,
}

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct PollEventsReply {
    pub kind: u32,
    pub visible: u32,
    pub focused: u32,
    pub _pad: u32,
}

/// Swapchain creation description. Mirrors the compositor's create-info.
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
#[repr(C)]
pub struct SwapchainCreateInfo {
    pub create_flags: u32,
    pub usage_flags: u32,
    pub format: u32,
    pub sample_count: u32,
    pub width: u32,
    pub height: u32,
    pub face_count: u32,
    pub array_layer_count: u32,
    pub mip_count: u32,
    pub _pad: u32,
}

pub mod swapchain_create_flags {
    pub const STATIC_IMAGE: u32 = 1 << 0;
    pub const PROTECTED_CONTENT: u32 = 1 << 1;
}

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct SwapchainPropertiesReply {
    pub image_count: u32,
    pub _pad: u32,
}

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct SwapchainCreateReply {
    pub id: u32,
    pub image_count: u32,
    pub use_dedicated_allocation: u32,
    pub _pad: u32,
    pub image_sizes: [u64; MAX_SWAPCHAIN_IMAGES],
}

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct SwapchainImportRequest {
    pub info: SwapchainCreateInfo,
    pub image_count: u32,
    pub _pad: u32,
    pub image_sizes: [u64; MAX_SWAPCHAIN_IMAGES],
}

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct SwapchainImportReply {
    pub id: u32,
    pub image_count: u32,
}

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct SwapchainWaitImageRequest {
    pub id: u32,
    pub index: u32,
    pub timeout_ns: i64,
}

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct SwapchainIdRequest {
    pub id: u32,
    pub _pad: u32,
}

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct SwapchainAcquireReply {
    pub index: u32,
    pub _pad: u32,
}

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct SwapchainReleaseRequest {
    pub id: u32,
    pub index: u32,
}

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct SemaphoreCreateReply {
    pub id: u32,
    pub _pad: u32,
}

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct SemaphoreDestroyRequest {
    pub id: u32,
    pub _pad: u32,
}

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct DeviceIndexRequest {
    pub device_index: u32,
    pub _pad: u32,
}

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct GetTrackedPoseRequest {
    pub device_index: u32,
    pub input_name: u32,
    pub at_timestamp_ns: i64,
}

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct GetTrackedPoseReply {
    pub relation: WireRelation,
}

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct GetHandTrackingRequest {
    pub device_index: u32,
    pub input_name: u32,
    pub at_timestamp_ns: i64,
}

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct WireHandJoint {
    pub relation: WireRelation,
    pub radius: f32,
    pub _pad: [f32; 3],
}

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct GetHandTrackingReply {
    pub active: u32,
    pub _pad: u32,
    pub timestamp_ns: i64,
    pub joints: [WireHandJoint; MAX_HAND_JOINTS],
}

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct GetViewPosesRequest {
    pub at_timestamp_ns: i64,
}

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct GetViewPosesReply {
    pub head_relation: WireRelation,
    pub poses: [WirePose; MAX_VIEWS],
    pub fovs: [WireFov; MAX_VIEWS],
}

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct SetOutputRequest {
    pub device_index: u32,
    pub output_name: u32,
    pub duration_ns: i64,
    pub frequency: f32,
    pub amplitude: f32,
}

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct ClientIndexRequest {
    pub client_index: u32,
    pub _pad: u32,
}

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct ClientInfoReply {
    pub pid: u32,
    pub created: u32,
    pub active: u32,
    pub visible: u32,
    pub focused: u32,
    pub overlay: u32,
    pub io_active: u32,
    pub _pad: u32,
    pub z_order: i64,
    pub app_name: [u8; APP_NAME_LEN],
}

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct SetClientInfoRequest {
    pub pid: u32,
    pub _pad: u32,
    pub app_name: [u8; APP_NAME_LEN],
}

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct GetClientsReply {
    pub count: u32,
    pub _pad: u32,
    pub indices: [u32; MAX_CLIENTS],
}

/// Encode a UTF-8 string into a fixed NUL-padded field, truncating at the cap.
pub fn encode_name<const N: usize>(name: &str) -> [u8; N] {
    let mut out = [0u8; N];
    let bytes = name.as_bytes();
    let len = bytes.len().min(N - 1);
    out[..len].copy_from_slice(&bytes[..len]);
    out
}

/// Decode a NUL-padded fixed field back into a string.
pub fn decode_name(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_tags_round_trip() {
        for raw in 1..=35 {
            let cmd = Command::from_u32(raw).unwrap();
            assert_eq!(cmd as u32, raw);
        }
        assert!(Command::from_u32(0).is_none());
        assert!(Command::from_u32(36).is_none());
    }

    #[test]
    fn status_codes_round_trip() {
        for raw in 0..=11 {
            let status = Status::from_u32(raw).unwrap();
            assert_eq!(status as u32, raw);
        }
        assert!(Status::from_u32(12).is_none());
    }

    #[test]
    fn layer_kinds_map_to_swapchain_counts() {
        assert_eq!(layer_kind::swapchain_count(layer_kind::PROJECTION), Some(2));
        assert_eq!(
            layer_kind::swapchain_count(layer_kind::PROJECTION_DEPTH),
            Some(4)
        );
        assert_eq!(layer_kind::swapchain_count(layer_kind::QUAD), Some(1));
        assert_eq!(layer_kind::swapchain_count(99), None);
    }

    #[test]
    fn name_fields_truncate_and_round_trip() {
        let field = encode_name::<8>("too long a name");
        assert_eq!(field[7], 0);
        let field = encode_name::<64>("setsuna-test");
        assert_eq!(decode_name(&field), "setsuna-test");
    }
}
