//! End-to-end scenarios over a live server: real unix socket, real listener
//! threads, headless graphics bundle, null system compositor.

use std::{
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use setsuna::instance::{Instance, InstanceConfig, RunningInstance};
use setsuna_graphics::{compositor::null::NullCompositor, HeadlessBundle};
use setsuna_ipc::{
    client::Connection,
    protocol::{
        event_kind, layer_kind, LayerEntry, LayerSyncRequest, LayerSyncWithSemaphoreRequest,
        SlotHeader, Status, SwapchainCreateInfo, MAX_LAYERS,
    },
};

struct TestInstance {
    running: Option<RunningInstance>,
    bundle: Arc<HeadlessBundle>,
    compositor: Arc<NullCompositor>,
    runtime_dir: PathBuf,
}

impl TestInstance {
    fn spawn(name: &str) -> Self {
        let runtime_dir =
            std::env::temp_dir().join(format!("setsuna-it-{}-{name}", std::process::id()));
        let _ = std::fs::remove_dir_all(&runtime_dir);

        let bundle = Arc::new(HeadlessBundle::new());
        let compositor = Arc::new(NullCompositor::with_period(Duration::from_millis(3)));
        let config = InstanceConfig {
            runtime_dir: runtime_dir.clone(),
            frame_period: Duration::from_millis(3),
            exit_on_disconnect: false,
            relax_permissions: false,
            watch_stdin: false,
            bundle: Some(bundle.clone()),
            system_compositor: Some(compositor.clone()),
            prober: None,
        };
        let running = Instance::spawn(config).expect("server failed to start");
        Self {
            running: Some(running),
            bundle,
            compositor,
            runtime_dir,
        }
    }

    fn connect(&self) -> Connection {
        Connection::connect(&self.running.as_ref().unwrap().socket_path).unwrap()
    }
}

impl Drop for TestInstance {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            let _ = running.shutdown();
        }
        let _ = std::fs::remove_dir_all(&self.runtime_dir);
    }
}

/// Polls until `check` passes or the deadline hits.
fn wait_until(what: &str, timeout: Duration, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    panic!("timed out waiting for {what}");
}

fn default_swapchain_info() -> SwapchainCreateInfo {
    SwapchainCreateInfo {
        width: 32,
        height: 32,
        array_layer_count: 1,
        face_count: 1,
        mip_count: 1,
        ..Default::default()
    }
}

fn quad_layer(swapchain_id: u32) -> LayerEntry {
    LayerEntry {
        kind: layer_kind::QUAD,
        flags: 0,
        device_index: -1,
        swapchain_count: 1,
        swapchain_ids: [swapchain_id, 0, 0, 0],
        data: [0.0; 32],
    }
}

fn layer_sync_request(frame_id: i64, layers: &[LayerEntry]) -> LayerSyncRequest {
    let mut request = LayerSyncRequest {
        header: SlotHeader {
            frame_id,
            display_time_ns: 0,
            blend_mode: 1,
            one_projection_fast_path: 0,
            layer_count: layers.len() as u32,
            _pad: 0,
        },
        layers: [quad_layer(0); MAX_LAYERS],
    };
    request.layers[..layers.len()].copy_from_slice(layers);
    request
}

#[test]
fn handshake_publishes_a_stable_catalog() {
    let instance = TestInstance::spawn("handshake");
    let client = instance.connect();

    let snap = client.snapshot().snapshot();
    assert_eq!(snap.header.device_count, 3);
    assert_eq!(snap.header.roles.head, 0);

    // A second attach observes the same catalog, byte for byte.
    let first: Vec<(u32, u32)> = (0..snap.header.device_count as usize)
        .map(|index| {
            let device = &snap.devices[index];
            (device.first_input_index, device.input_count)
        })
        .collect();

    let other = instance.connect();
    let other_snap = other.snapshot().snapshot();
    for (index, &(first_input, count)) in first.iter().enumerate() {
        assert_eq!(other_snap.devices[index].first_input_index, first_input);
        assert_eq!(other_snap.devices[index].input_count, count);
    }
}

#[test]
fn s1_two_client_primary_hand_off() {
    let instance = TestInstance::spawn("s1");

    let a = instance.connect();
    assert_eq!(a.create_session("client-a", false, 0).unwrap(), Status::Success);
    assert_eq!(a.begin_session().unwrap(), Status::Success);
    a.predict_frame().unwrap();

    wait_until("A to become primary", Duration::from_secs(1), || {
        let (_, info) = a.client_info(0).unwrap();
        info.focused == 1 && info.visible == 1
    });

    let b = instance.connect();
    assert_eq!(b.create_session("client-b", false, 0).unwrap(), Status::Success);
    assert_eq!(b.begin_session().unwrap(), Status::Success);
    b.predict_frame().unwrap();

    // B takes the primary, A loses focus and visibility.
    wait_until("B to take over", Duration::from_secs(1), || {
        let (_, info_a) = a.client_info(0).unwrap();
        let (_, info_b) = a.client_info(1).unwrap();
        info_b.focused == 1 && info_a.focused == 0 && info_a.visible == 0
    });

    // A hears about it through its event queue.
    wait_until("A state-change event", Duration::from_secs(1), || {
        let event = a.poll_event().unwrap();
        event.kind == event_kind::STATE_CHANGE && event.focused == 0
    });

    // Closing B hands the primary back to A.
    drop(b);
    wait_until("A to regain focus", Duration::from_secs(2), || {
        let (_, info_a) = a.client_info(0).unwrap();
        info_a.focused == 1 && info_a.visible == 1
    });
}

#[test]
fn s2_overlay_over_primary() {
    let instance = TestInstance::spawn("s2");

    let a = instance.connect();
    a.create_session("primary", false, 0).unwrap();
    a.begin_session().unwrap();
    a.predict_frame().unwrap();

    let overlay = instance.connect();
    overlay.create_session("overlay", true, 10).unwrap();
    overlay.begin_session().unwrap();
    overlay.predict_frame().unwrap();

    wait_until("overlay riding the primary", Duration::from_secs(1), || {
        let (_, info_a) = a.client_info(0).unwrap();
        let (_, info_o) = a.client_info(1).unwrap();
        info_a.focused == 1 && info_o.focused == 1 && info_o.z_order == 10
    });
    // The primary draws first.
    assert_eq!(instance.compositor.client_z_order(0), Some(i64::MIN));
    assert_eq!(instance.compositor.client_z_order(1), Some(10));

    // Primary gone: the overlay is forced off.
    drop(a);
    let probe = instance.connect();
    wait_until("overlay forced off", Duration::from_secs(2), || {
        let (_, info_o) = probe.client_info(1).unwrap();
        info_o.focused == 0 && info_o.visible == 0
    });

    // A new primary flips it back on.
    probe.create_session("primary-2", false, 0).unwrap();
    probe.begin_session().unwrap();
    probe.predict_frame().unwrap();
    wait_until("overlay re-enabled", Duration::from_secs(1), || {
        let (_, info_o) = probe.client_info(1).unwrap();
        info_o.focused == 1 && info_o.visible == 1
    });
}

#[test]
fn s3_swapchain_acquire_release_fifo() {
    let instance = TestInstance::spawn("s3");
    let client = instance.connect();
    client.create_session("fifo", false, 0).unwrap();

    let (status, reply, handles) = client.create_swapchain(&default_swapchain_info()).unwrap();
    assert_eq!(status, Status::Success);
    assert_eq!(reply.image_count, 3);
    assert_eq!(handles.len(), 3);
    let id = reply.id;

    assert_eq!(client.acquire_image(id).unwrap(), (Status::Success, 0));
    assert_eq!(client.acquire_image(id).unwrap(), (Status::Success, 1));
    assert_eq!(client.acquire_image(id).unwrap(), (Status::Success, 2));
    assert_eq!(client.acquire_image(id).unwrap().0, Status::NoImageAvailable);

    assert_eq!(client.release_image(id, 1).unwrap(), Status::Success);
    assert_eq!(client.acquire_image(id).unwrap(), (Status::Success, 1));

    client.release_image(id, 2).unwrap();
    client.release_image(id, 0).unwrap();
    client.release_image(id, 1).unwrap();
    // Oldest released wins.
    assert_eq!(client.acquire_image(id).unwrap(), (Status::Success, 2));

    // wait_image with a finite timeout has no side effects.
    assert_eq!(client.wait_image(id, 0, 1_000_000).unwrap(), Status::Success);
}

#[test]
fn s4_layer_slot_capacity() {
    let instance = TestInstance::spawn("s4");
    let client = instance.connect();
    client.create_session("layers", false, 0).unwrap();
    client.begin_session().unwrap();

    let (_, reply, _) = client.create_swapchain(&default_swapchain_info()).unwrap();
    let id = reply.id;
    let (_, index) = client.acquire_image(id).unwrap();
    client.release_image(id, index).unwrap();

    // A full slot commits fine and the renderer sees every layer.
    let layers = vec![quad_layer(id); MAX_LAYERS];
    let (status, _) = client.layer_sync(&layer_sync_request(1, &layers)).unwrap();
    assert_eq!(status, Status::Success);
    wait_until("renderer to see the slot", Duration::from_secs(1), || {
        instance
            .compositor
            .last_submitted()
            .map_or(false, |frame| frame.layer_count == MAX_LAYERS)
    });

    // One more than the cap is a protocol error.
    let excess = instance.connect();
    excess.create_session("excess", false, 0).unwrap();
    let mut request = layer_sync_request(2, &[]);
    request.header.layer_count = MAX_LAYERS as u32 + 1;
    let (status, _) = excess.layer_sync(&request).unwrap();
    assert_eq!(status, Status::IpcFailure);
}

#[test]
fn s5_sync_handle_commit() {
    let instance = TestInstance::spawn("s5");
    let client = instance.connect();
    client.create_session("sync", false, 0).unwrap();
    client.begin_session().unwrap();

    let (_, reply, _) = client.create_swapchain(&default_swapchain_info()).unwrap();
    let id = reply.id;
    let (_, index) = client.acquire_image(id).unwrap();
    client.release_image(id, index).unwrap();

    let (status, semaphore_id, native) = client.create_semaphore().unwrap();
    assert_eq!(status, Status::Success);
    assert!(native.is_some(), "no native sync handle exported");

    let request = LayerSyncWithSemaphoreRequest {
        sync: layer_sync_request(1, &[quad_layer(id)]),
        semaphore_id,
        _pad: 0,
        semaphore_value: 42,
    };
    let (status, _) = client.layer_sync_with_semaphore(&request).unwrap();
    assert_eq!(status, Status::Success);

    // The compositor's submission carries the wait value.
    wait_until("sync value in submission", Duration::from_secs(1), || {
        instance
            .compositor
            .last_submitted()
            .map_or(false, |frame| frame.sync_value == Some(42))
    });
}

#[test]
fn s6_disconnect_during_swapchain_use() {
    let instance = TestInstance::spawn("s6");
    let client = instance.connect();
    client.create_session("doomed", false, 0).unwrap();
    client.begin_session().unwrap();

    let mut ids = Vec::new();
    for _ in 0..5 {
        let (status, reply, _) = client.create_swapchain(&default_swapchain_info()).unwrap();
        assert_eq!(status, Status::Success);
        ids.push(reply.id);
    }
    assert_eq!(instance.bundle.live_counts().0, 15);

    // Commit one frame referencing swapchain 3, then die mid-frame.
    let (_, index) = client.acquire_image(ids[3]).unwrap();
    client.release_image(ids[3], index).unwrap();
    let (status, _) = client
        .layer_sync(&layer_sync_request(1, &[quad_layer(ids[3])]))
        .unwrap();
    assert_eq!(status, Status::Success);
    drop(client);

    // Within a few frames the garbage collector destroys all five.
    wait_until("all swapchains destroyed", Duration::from_secs(2), || {
        instance.bundle.live_counts() == (0, 0, 0)
    });
}

#[test]
fn io_gating_exempts_head_pose() {
    let instance = TestInstance::spawn("io-gating");
    let client = instance.connect();
    client.create_session("gated", false, 0).unwrap();

    let head = instance.connect();
    // Disable io for client 0 via the admin surface.
    assert_eq!(head.toggle_io_client(0).unwrap(), Status::Success);

    // Controller poses are gated off.
    let (status, _) = client
        .tracked_pose(1, setsuna_device::InputName::GripPose as u32, 0)
        .unwrap();
    assert_eq!(status, Status::PoseNotActive);

    // Head pose keeps tracking.
    let (status, relation) = client
        .tracked_pose(0, setsuna_device::InputName::HeadPose as u32, 0)
        .unwrap();
    assert_eq!(status, Status::Success);
    assert_ne!(relation.flags, 0);
}

#[test]
fn swapchain_import_wraps_existing_buffers() {
    let instance = TestInstance::spawn("import");
    let client = instance.connect();
    client.create_session("importer", false, 0).unwrap();

    // Export the buffers of one swapchain, wrap them in another.
    let info = default_swapchain_info();
    let (status, reply, handles) = client.create_swapchain(&info).unwrap();
    assert_eq!(status, Status::Success);

    let request = setsuna_ipc::protocol::SwapchainImportRequest {
        info,
        image_count: reply.image_count,
        _pad: 0,
        image_sizes: reply.image_sizes,
    };
    use std::os::fd::AsFd;
    let borrowed: Vec<_> = handles.iter().map(|fd| fd.as_fd()).collect();
    let (status, imported) = client.import_swapchain(&request, &borrowed).unwrap();
    assert_eq!(status, Status::Success);
    assert_eq!(imported.image_count, reply.image_count);
    assert_ne!(imported.id, reply.id);

    // The imported chain has its own primed FIFO.
    assert_eq!(client.acquire_image(imported.id).unwrap(), (Status::Success, 0));
}

#[test]
fn admin_and_device_surface() {
    let instance = TestInstance::spawn("admin");
    let client = instance.connect();
    client.create_session("admin-app", false, 0).unwrap();

    let info = client.system_compositor_info().unwrap();
    assert_eq!(info.view_width, 1280);
    assert!(info.refresh_rate_hz > 0.0);

    // Static swapchains get a single image.
    let mut static_info = default_swapchain_info();
    static_info.create_flags = setsuna_ipc::protocol::swapchain_create_flags::STATIC_IMAGE;
    assert_eq!(
        client.swapchain_properties(&static_info).unwrap().image_count,
        1
    );

    // Device surface: refresh inputs, read the view poses, buzz a controller.
    assert_eq!(client.update_input(1).unwrap(), Status::Success);
    let (status, views) = client.view_poses(0).unwrap();
    assert_eq!(status, Status::Success);
    // The two eyes are separated horizontally.
    assert!(views.poses[0].position[0] < views.poses[1].position[0]);

    let request = setsuna_ipc::protocol::SetOutputRequest {
        device_index: 2,
        output_name: setsuna_device::OutputName::Haptic as u32,
        duration_ns: -1,
        frequency: 160.0,
        amplitude: 0.8,
    };
    assert_eq!(client.set_output(&request).unwrap(), Status::Success);

    // Admin surface.
    client.set_client_info("renamed-app").unwrap();
    let (_, my_info) = client.client_info(0).unwrap();
    assert_eq!(
        setsuna_ipc::protocol::decode_name(&my_info.app_name),
        "renamed-app"
    );

    let clients = client.clients().unwrap();
    assert_eq!(clients.count, 1);
    assert_eq!(client.set_primary_client(0).unwrap(), Status::Success);
    assert_eq!(client.set_focused_client(0).unwrap(), Status::Success);

    // Device io toggling round-trips.
    assert_eq!(client.toggle_io_device(1).unwrap(), Status::Success);
    let (status, _) = client
        .tracked_pose(1, setsuna_device::InputName::GripPose as u32, 0)
        .unwrap();
    assert_eq!(status, Status::PoseNotActive);
    assert_eq!(client.toggle_io_device(1).unwrap(), Status::Success);
    let (status, _) = client
        .tracked_pose(1, setsuna_device::InputName::GripPose as u32, 0)
        .unwrap();
    assert_eq!(status, Status::Success);
}

#[test]
fn begin_and_discard_frame() {
    let instance = TestInstance::spawn("discard");
    let client = instance.connect();
    client.create_session("discarder", false, 0).unwrap();
    client.begin_session().unwrap();

    let prediction = client.predict_frame().unwrap();
    assert_eq!(client.begin_frame(prediction.frame_id).unwrap(), Status::Success);
    assert_eq!(
        client.discard_frame(prediction.frame_id).unwrap(),
        Status::Success
    );
}

#[test]
fn session_lifecycle_status_codes() {
    let instance = TestInstance::spawn("lifecycle");
    let client = instance.connect();

    // Compositor calls before session_create are rejected.
    assert!(client.predict_frame().is_err());
    assert_eq!(
        client.create_session("app", false, 0).unwrap(),
        Status::Success
    );
    assert_eq!(
        client.create_session("app", false, 0).unwrap(),
        Status::SessionAlreadyCreated
    );

    client.begin_session().unwrap();
    let prediction = client.predict_frame().unwrap();
    assert!(prediction.predicted_period_ns > 0);
    assert_eq!(client.wait_woke(prediction.frame_id).unwrap(), Status::Success);

    assert_eq!(client.end_session().unwrap(), Status::Success);
    assert_eq!(client.destroy_session().unwrap(), Status::Success);
    assert_eq!(client.destroy_session().unwrap(), Status::SessionNotCreated);
}
