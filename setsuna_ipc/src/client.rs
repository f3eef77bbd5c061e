//! Client-side connector.
//!
//! Thin typed wrappers over the message channel, enough for an application
//! (or the integration suite) to drive every server command. The connector
//! performs the shared-memory handshake on connect and refuses servers whose
//! build id differs from this library's.

use std::{os::unix::net::UnixStream, path::Path};

use anyhow::{Context, Result};
use bytemuck::Zeroable;

use crate::{
    channel::{ChannelError, MessageChannel, MAX_RECORD_SIZE},
    protocol::*,
    shmem::SnapshotReader,
};

/// A connected client session.
pub struct Connection {
    channel: MessageChannel,
    snapshot: SnapshotReader,
}

impl Connection {
    /// Connects to the server socket and attaches the device snapshot.
    pub fn connect(socket_path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(socket_path)
            .with_context(|| format!("connecting to {}", socket_path.display()))?;
        let channel = MessageChannel::new(stream)?;

        let (reply, mut fds): (GetShmHandleReply, _) =
            call_with_fds(&channel, Command::GetShmHandle, &Empty {})?;
        let fd = fds
            .pop()
            .context("server did not attach a snapshot handle")?;
        anyhow::ensure!(reply.size as usize == crate::shmem::SNAPSHOT_SIZE);
        let snapshot = SnapshotReader::from_fd(fd)?;

        log::info!("connected to setsuna server at {}", socket_path.display());
        Ok(Self { channel, snapshot })
    }

    pub fn snapshot(&self) -> &SnapshotReader {
        &self.snapshot
    }

    pub fn system_compositor_info(&self) -> Result<CompositorInfoReply> {
        call(&self.channel, Command::SystemCompositorGetInfo, &Empty {})
    }

    pub fn create_session(&self, app_name: &str, overlay: bool, z_order: i64) -> Result<Status> {
        let request = SessionCreateRequest {
            overlay: overlay as u32,
            _pad: 0,
            z_order,
            pid: std::process::id(),
            _pad2: 0,
            app_name: encode_name(app_name),
        };
        call_status(&self.channel, Command::SessionCreate, &request)
    }

    pub fn begin_session(&self) -> Result<Status> {
        call_status(&self.channel, Command::SessionBegin, &Empty {})
    }

    pub fn end_session(&self) -> Result<Status> {
        call_status(&self.channel, Command::SessionEnd, &Empty {})
    }

    pub fn destroy_session(&self) -> Result<Status> {
        call_status(&self.channel, Command::SessionDestroy, &Empty {})
    }

    pub fn predict_frame(&self) -> Result<PredictFrameReply> {
        call(&self.channel, Command::CompositorPredictFrame, &Empty {})
    }

    pub fn wait_woke(&self, frame_id: i64) -> Result<Status> {
        call_status(
            &self.channel,
            Command::CompositorWaitWoke,
            &WaitWokeRequest { frame_id },
        )
    }

    pub fn begin_frame(&self, frame_id: i64) -> Result<Status> {
        call_status(
            &self.channel,
            Command::CompositorBeginFrame,
            &BeginFrameRequest { frame_id },
        )
    }

    pub fn discard_frame(&self, frame_id: i64) -> Result<Status> {
        call_status(
            &self.channel,
            Command::CompositorDiscardFrame,
            &DiscardFrameRequest { frame_id },
        )
    }

    pub fn layer_sync(&self, request: &LayerSyncRequest) -> Result<(Status, LayerSyncReply)> {
        let (status, reply) = call_full(&self.channel, Command::CompositorLayerSync, request)?;
        Ok((status, reply))
    }

    pub fn layer_sync_with_semaphore(
        &self,
        request: &LayerSyncWithSemaphoreRequest,
    ) -> Result<(Status, LayerSyncReply)> {
        call_full(
            &self.channel,
            Command::CompositorLayerSyncWithSemaphore,
            request,
        )
    }

    pub fn poll_event(&self) -> Result<PollEventsReply> {
        call(&self.channel, Command::CompositorPollEvents, &Empty {})
    }

    pub fn swapchain_properties(
        &self,
        info: &SwapchainCreateInfo,
    ) -> Result<SwapchainPropertiesReply> {
        call(&self.channel, Command::SwapchainGetProperties, info)
    }

    /// Creates a swapchain, returning the reply and the exported native
    /// buffer handles (one per image).
    pub fn create_swapchain(
        &self,
        info: &SwapchainCreateInfo,
    ) -> Result<(Status, SwapchainCreateReply, Vec<std::os::fd::OwnedFd>)> {
        self.channel
            .send_request(Command::SwapchainCreate, bytemuck::bytes_of(info))?;
        let mut buf = [0u8; MAX_RECORD_SIZE];
        let (status, len, fds) = receive_blocking(&self.channel, &mut buf)?;
        let reply = if len == std::mem::size_of::<SwapchainCreateReply>() {
            bytemuck::pod_read_unaligned(&buf[..len])
        } else {
            SwapchainCreateReply::zeroed()
        };
        Ok((status, reply, fds))
    }

    /// Imports caller-provided native images as a swapchain. The handles
    /// travel out-of-band with the request.
    pub fn import_swapchain(
        &self,
        request: &SwapchainImportRequest,
        handles: &[std::os::fd::BorrowedFd<'_>],
    ) -> Result<(Status, SwapchainImportReply)> {
        self.channel.send_request_with_fds(
            Command::SwapchainImport,
            bytemuck::bytes_of(request),
            handles,
        )?;
        let mut buf = [0u8; MAX_RECORD_SIZE];
        let (status, len, _) = receive_blocking(&self.channel, &mut buf)?;
        let reply = if len == std::mem::size_of::<SwapchainImportReply>() {
            bytemuck::pod_read_unaligned(&buf[..len])
        } else {
            SwapchainImportReply::zeroed()
        };
        Ok((status, reply))
    }

    pub fn acquire_image(&self, id: u32) -> Result<(Status, u32)> {
        let (status, reply): (Status, SwapchainAcquireReply) = call_full(
            &self.channel,
            Command::SwapchainAcquireImage,
            &SwapchainIdRequest { id, _pad: 0 },
        )?;
        Ok((status, reply.index))
    }

    pub fn release_image(&self, id: u32, index: u32) -> Result<Status> {
        call_status(
            &self.channel,
            Command::SwapchainReleaseImage,
            &SwapchainReleaseRequest { id, index },
        )
    }

    pub fn wait_image(&self, id: u32, index: u32, timeout_ns: i64) -> Result<Status> {
        call_status(
            &self.channel,
            Command::SwapchainWaitImage,
            &SwapchainWaitImageRequest {
                id,
                index,
                timeout_ns,
            },
        )
    }

    pub fn destroy_swapchain(&self, id: u32) -> Result<Status> {
        call_status(
            &self.channel,
            Command::SwapchainDestroy,
            &SwapchainIdRequest { id, _pad: 0 },
        )
    }

    pub fn create_semaphore(&self) -> Result<(Status, u32, Option<std::os::fd::OwnedFd>)> {
        self.channel
            .send_request(Command::CompositorSemaphoreCreate, &[])?;
        let mut buf = [0u8; MAX_RECORD_SIZE];
        let (status, len, mut fds) = receive_blocking(&self.channel, &mut buf)?;
        let id = if len == std::mem::size_of::<SemaphoreCreateReply>() {
            bytemuck::pod_read_unaligned::<SemaphoreCreateReply>(&buf[..len]).id
        } else {
            0
        };
        Ok((status, id, fds.pop()))
    }

    pub fn destroy_semaphore(&self, id: u32) -> Result<Status> {
        call_status(
            &self.channel,
            Command::CompositorSemaphoreDestroy,
            &SemaphoreDestroyRequest { id, _pad: 0 },
        )
    }

    pub fn update_input(&self, device_index: u32) -> Result<Status> {
        call_status(
            &self.channel,
            Command::DeviceUpdateInput,
            &DeviceIndexRequest {
                device_index,
                _pad: 0,
            },
        )
    }

    pub fn tracked_pose(
        &self,
        device_index: u32,
        input_name: u32,
        at_timestamp_ns: i64,
    ) -> Result<(Status, WireRelation)> {
        let (status, reply): (Status, GetTrackedPoseReply) = call_full(
            &self.channel,
            Command::DeviceGetTrackedPose,
            &GetTrackedPoseRequest {
                device_index,
                input_name,
                at_timestamp_ns,
            },
        )?;
        Ok((status, reply.relation))
    }

    pub fn view_poses(&self, at_timestamp_ns: i64) -> Result<(Status, GetViewPosesReply)> {
        call_full(
            &self.channel,
            Command::DeviceGetViewPoses,
            &GetViewPosesRequest { at_timestamp_ns },
        )
    }

    pub fn hand_tracking(
        &self,
        device_index: u32,
        input_name: u32,
        at_timestamp_ns: i64,
    ) -> Result<(Status, GetHandTrackingReply)> {
        call_full(
            &self.channel,
            Command::DeviceGetHandTracking,
            &GetHandTrackingRequest {
                device_index,
                input_name,
                at_timestamp_ns,
            },
        )
    }

    pub fn set_output(&self, request: &SetOutputRequest) -> Result<Status> {
        call_status(&self.channel, Command::DeviceSetOutput, request)
    }

    pub fn client_info(&self, client_index: u32) -> Result<(Status, ClientInfoReply)> {
        call_full(
            &self.channel,
            Command::SystemGetClientInfo,
            &ClientIndexRequest {
                client_index,
                _pad: 0,
            },
        )
    }

    pub fn set_client_info(&self, app_name: &str) -> Result<Status> {
        call_status(
            &self.channel,
            Command::SystemSetClientInfo,
            &SetClientInfoRequest {
                pid: std::process::id(),
                _pad: 0,
                app_name: encode_name(app_name),
            },
        )
    }

    pub fn clients(&self) -> Result<GetClientsReply> {
        call(&self.channel, Command::SystemGetClients, &Empty {})
    }

    pub fn set_primary_client(&self, client_index: u32) -> Result<Status> {
        call_status(
            &self.channel,
            Command::SystemSetPrimaryClient,
            &ClientIndexRequest {
                client_index,
                _pad: 0,
            },
        )
    }

    pub fn set_focused_client(&self, client_index: u32) -> Result<Status> {
        call_status(
            &self.channel,
            Command::SystemSetFocusedClient,
            &ClientIndexRequest {
                client_index,
                _pad: 0,
            },
        )
    }

    pub fn toggle_io_client(&self, client_index: u32) -> Result<Status> {
        call_status(
            &self.channel,
            Command::SystemToggleIoClient,
            &ClientIndexRequest {
                client_index,
                _pad: 0,
            },
        )
    }

    pub fn toggle_io_device(&self, device_index: u32) -> Result<Status> {
        call_status(
            &self.channel,
            Command::SystemToggleIoDevice,
            &DeviceIndexRequest {
                device_index,
                _pad: 0,
            },
        )
    }
}

/// Reads a reply, retrying through the channel's periodic read timeout.
/// Client calls are synchronous, so a timeout only means the server is busy.
fn receive_blocking(
    channel: &MessageChannel,
    buf: &mut [u8],
) -> Result<(Status, usize, Vec<std::os::fd::OwnedFd>)> {
    loop {
        match channel.receive_reply(buf) {
            Ok(reply) => return Ok(reply),
            Err(ChannelError::TimedOut) => continue,
            Err(err) => return Err(err.into()),
        }
    }
}

fn call_full<Req, Rep>(
    channel: &MessageChannel,
    command: Command,
    request: &Req,
) -> Result<(Status, Rep)>
where
    Req: bytemuck::Pod,
    Rep: bytemuck::Pod + Zeroable,
{
    channel.send_request(command, bytemuck::bytes_of(request))?;
    let mut buf = [0u8; MAX_RECORD_SIZE];
    let (status, len, _fds) = receive_blocking(channel, &mut buf)?;
    let reply = if len == std::mem::size_of::<Rep>() {
        bytemuck::pod_read_unaligned(&buf[..len])
    } else {
        Rep::zeroed()
    };
    Ok((status, reply))
}

/// Call for commands whose failure is unexpected; maps a non-success status
/// into an error.
fn call<Req, Rep>(channel: &MessageChannel, command: Command, request: &Req) -> Result<Rep>
where
    Req: bytemuck::Pod,
    Rep: bytemuck::Pod + Zeroable,
{
    let (status, reply) = call_full(channel, command, request)?;
    anyhow::ensure!(
        status == Status::Success,
        "{command:?} failed with {status:?}"
    );
    Ok(reply)
}

fn call_status<Req: bytemuck::Pod>(
    channel: &MessageChannel,
    command: Command,
    request: &Req,
) -> Result<Status> {
    channel.send_request(command, bytemuck::bytes_of(request))?;
    let mut buf = [0u8; MAX_RECORD_SIZE];
    let (status, _, _) = receive_blocking(channel, &mut buf)?;
    Ok(status)
}

fn call_with_fds<Req, Rep>(
    channel: &MessageChannel,
    command: Command,
    request: &Req,
) -> Result<(Rep, Vec<std::os::fd::OwnedFd>)>
where
    Req: bytemuck::Pod,
    Rep: bytemuck::Pod + Zeroable,
{
    channel.send_request(command, bytemuck::bytes_of(request))?;
    let mut buf = [0u8; MAX_RECORD_SIZE];
    let (status, len, fds) = receive_blocking(channel, &mut buf)?;
    anyhow::ensure!(
        status == Status::Success,
        "{command:?} failed with {status:?}"
    );
    let reply = if len == std::mem::size_of::<Rep>() {
        bytemuck::pod_read_unaligned(&buf[..len])
    } else {
        Rep::zeroed()
    };
    Ok((reply, fds))
}
