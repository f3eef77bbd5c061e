//! Instance bootstrap and shutdown.
//!
//! Startup order: single-instance lockfile, device discovery, catalog
//! publication into shared memory, graphics bundle and system compositor,
//! render thread, accept loop. Every static snapshot field is written before
//! the listen socket exists, so no client can attach to a half-built
//! catalog. Shutdown is the reverse and drains every per-client thread.

use std::{
    fs::{File, OpenOptions},
    io::Write,
    os::fd::FromRawFd,
    os::unix::fs::PermissionsExt,
    os::unix::net::UnixListener,
    path::{Path, PathBuf},
    sync::Arc,
    thread::JoinHandle,
    time::Duration,
};

use anyhow::{Context, Result};
use nix::fcntl::{Flock, FlockArg};

use setsuna_device::{catalog::DeviceKind, Device, Prober};
use setsuna_graphics::{
    compositor::{now_ns, null::NullCompositor},
    GraphicsBundle, HeadlessBundle, SystemCompositor,
};
use setsuna_ipc::{
    protocol::{
        encode_name, MAX_DEVICES, MAX_INPUTS, MAX_ORIGINS, MAX_OUTPUTS, MAX_PROFILES,
        MAX_PROFILE_PAIRS,
    },
    shmem::SnapshotWriter,
};

use crate::server::{mainloop, render, Server};

const SOCKET_NAME: &str = "server.sock";
const LOCKFILE_NAME: &str = "setsuna.pid";

pub struct InstanceConfig {
    pub runtime_dir: PathBuf,
    pub frame_period: Duration,
    pub exit_on_disconnect: bool,
    pub relax_permissions: bool,
    pub watch_stdin: bool,
    /// Overrides for tests and embedders; `None` picks the defaults
    /// (Vulkan with a headless fallback, the null compositor).
    pub bundle: Option<Arc<dyn GraphicsBundle>>,
    pub system_compositor: Option<Arc<dyn SystemCompositor>>,
    pub prober: Option<Prober>,
}

impl InstanceConfig {
    /// The production configuration, driven by the environment toggles.
    pub fn from_env() -> Self {
        Self {
            runtime_dir: default_runtime_dir(),
            frame_period: Duration::from_nanos(11_111_111),
            exit_on_disconnect: env_flag("SETSUNA_EXIT_ON_DISCONNECT"),
            relax_permissions: env_flag("SETSUNA_RELAX_PERMS"),
            watch_stdin: true,
            bundle: None,
            system_compositor: None,
            prober: None,
        }
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name).map_or(false, |value| value == "1" || value == "true")
}

fn default_runtime_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("SETSUNA_RUNTIME_DIR") {
        return PathBuf::from(dir);
    }
    if let Ok(dir) = std::env::var("XDG_RUNTIME_DIR") {
        return Path::new(&dir).join("setsuna");
    }
    PathBuf::from(format!("/tmp/setsuna-{}", nix::unistd::getuid()))
}

/// Held for the server's lifetime; refuses a second instance.
struct PidLock {
    _lock: Flock<File>,
    path: PathBuf,
}

impl PidLock {
    fn acquire(runtime_dir: &Path) -> Result<Self> {
        let path = runtime_dir.join(LOCKFILE_NAME);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("opening lockfile {}", path.display()))?;

        let mut lock = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => lock,
            Err((_, _errno)) => {
                anyhow::bail!(
                    "another setsuna server is already running (lockfile {})",
                    path.display()
                );
            }
        };
        lock.set_len(0)?;
        writeln!(&mut *lock, "{}", std::process::id())?;
        Ok(Self { _lock: lock, path })
    }
}

impl Drop for PidLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

pub struct Instance {
    server: Arc<Server>,
    listener: UnixListener,
    socket_path: PathBuf,
    unlink_socket: bool,
    watch_stdin: bool,
    render_thread: Option<JoinHandle<()>>,
    _pid_lock: PidLock,
}

impl Instance {
    pub fn create(config: InstanceConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.runtime_dir)
            .with_context(|| format!("creating {}", config.runtime_dir.display()))?;
        let pid_lock = PidLock::acquire(&config.runtime_dir)?;

        let prober = config.prober.unwrap_or_default();
        let devices = prober.probe_all().context("device discovery")?;
        log::info!("discovered {} device(s)", devices.len());

        let mut snapshot = SnapshotWriter::create()?;
        build_catalog(&mut snapshot, &devices)?;

        let bundle = match config.bundle {
            Some(bundle) => bundle,
            None => default_bundle(),
        };
        let system_compositor: Arc<dyn SystemCompositor> = match config.system_compositor {
            Some(compositor) => compositor,
            None => Arc::new(NullCompositor::new()),
        };
        log::info!(
            "graphics bundle: {}, system compositor: {}",
            bundle.name(),
            system_compositor.info().name
        );

        let server = Server::new(
            snapshot,
            devices,
            bundle,
            system_compositor,
            config.frame_period,
            config.exit_on_disconnect,
        );

        let (listener, socket_path, unlink_socket) =
            bind_listener(&config.runtime_dir, config.relax_permissions)?;

        let render_thread = {
            let server = server.clone();
            std::thread::Builder::new()
                .name("setsuna-render".into())
                .spawn(move || render::run_render_loop(server))
                .context("spawning render thread")?
        };

        Ok(Self {
            server,
            listener,
            socket_path,
            unlink_socket,
            watch_stdin: config.watch_stdin,
            render_thread: Some(render_thread),
            _pid_lock: pid_lock,
        })
    }

    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Runs the accept loop on the calling thread until shutdown, then tears
    /// everything down in reverse startup order.
    pub fn run(mut self) -> Result<()> {
        let result = mainloop::run(&self.server, self.listener.try_clone()?, self.watch_stdin);

        self.server.request_shutdown();
        if let Some(thread) = self.render_thread.take() {
            if thread.join().is_err() {
                log::error!("render thread panicked");
            }
        }
        if self.unlink_socket {
            let _ = std::fs::remove_file(&self.socket_path);
        }
        log::info!("server stopped");
        result
    }

    /// Runs the instance on a background thread; for tests and embedders.
    pub fn spawn(config: InstanceConfig) -> Result<RunningInstance> {
        let instance = Self::create(config)?;
        let server = instance.server.clone();
        let socket_path = instance.socket_path.clone();
        let thread = std::thread::Builder::new()
            .name("setsuna-main".into())
            .spawn(move || instance.run())?;
        Ok(RunningInstance {
            server,
            socket_path,
            thread,
        })
    }
}

pub struct RunningInstance {
    pub server: Arc<Server>,
    pub socket_path: PathBuf,
    thread: JoinHandle<Result<()>>,
}

impl RunningInstance {
    pub fn shutdown(self) -> Result<()> {
        self.server.request_shutdown();
        match self.thread.join() {
            Ok(result) => result,
            Err(_) => anyhow::bail!("server thread panicked"),
        }
    }
}

fn default_bundle() -> Arc<dyn GraphicsBundle> {
    match setsuna_graphics::vulkan::VulkanBundle::new() {
        Ok(bundle) => Arc::new(bundle),
        Err(err) => {
            log::warn!("Vulkan unavailable ({err:#}), falling back to the headless bundle");
            Arc::new(HeadlessBundle::new())
        }
    }
}

/// Binds the listen socket, honoring systemd-style socket activation when
/// `LISTEN_FDS` hands us an already-bound fd.
fn bind_listener(runtime_dir: &Path, relax_permissions: bool) -> Result<(UnixListener, PathBuf, bool)> {
    let socket_path = runtime_dir.join(SOCKET_NAME);

    let activation = std::env::var("LISTEN_PID")
        .ok()
        .and_then(|pid| pid.parse::<u32>().ok())
        .filter(|&pid| pid == std::process::id())
        .and_then(|_| std::env::var("LISTEN_FDS").ok())
        .and_then(|count| count.parse::<u32>().ok())
        .filter(|&count| count >= 1);
    if activation.is_some() {
        // SAFETY: systemd passes the first activated socket as fd 3.
        let listener = unsafe { UnixListener::from_raw_fd(3) };
        log::info!("adopted activated listen socket");
        return Ok((listener, socket_path, false));
    }

    if socket_path.exists() {
        std::fs::remove_file(&socket_path)
            .with_context(|| format!("removing stale socket {}", socket_path.display()))?;
    }
    let listener = UnixListener::bind(&socket_path)
        .with_context(|| format!("binding {}", socket_path.display()))?;
    if relax_permissions {
        // Multi-user test setups talk to the server across uids.
        std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o777))?;
    }
    log::info!("listening on {}", socket_path.display());
    Ok((listener, socket_path, true))
}

/// Flattens the device descriptions into the snapshot: stable catalog
/// indices, deduplicated origins, input/output/profile slices and the role
/// table. Indices assigned here never change.
pub fn build_catalog(snapshot: &mut SnapshotWriter, devices: &[Arc<dyn Device>]) -> Result<()> {
    anyhow::ensure!(devices.len() <= MAX_DEVICES, "too many devices");

    let snap = snapshot.snapshot_mut();
    snap.header.startup_timestamp_ns = now_ns();

    let mut origin_keys: Vec<(String, u32)> = Vec::new();
    let mut input_cursor = 0usize;
    let mut output_cursor = 0usize;
    let mut profile_cursor = 0usize;
    let mut pair_cursor = 0usize;

    for (index, device) in devices.iter().enumerate() {
        let desc = device.describe();

        // Dedup tracking origins by name and kind.
        let key = (desc.origin.name.clone(), desc.origin.kind as u32);
        let origin_index = match origin_keys.iter().position(|existing| *existing == key) {
            Some(existing) => existing,
            None => {
                anyhow::ensure!(origin_keys.len() < MAX_ORIGINS, "too many tracking origins");
                let new_index = origin_keys.len();
                let record = &mut snap.origins[new_index];
                record.name = encode_name(&desc.origin.name);
                record.kind = desc.origin.kind as u32;
                let quat = desc.origin.offset.orientation.quaternion();
                record.offset.orientation = [quat.i, quat.j, quat.k, quat.w];
                record.offset.position = desc.origin.offset.position.into();
                origin_keys.push(key);
                new_index
            }
        };

        anyhow::ensure!(
            input_cursor + desc.inputs.len() <= MAX_INPUTS,
            "input table exhausted"
        );
        anyhow::ensure!(
            output_cursor + desc.outputs.len() <= MAX_OUTPUTS,
            "output table exhausted"
        );
        anyhow::ensure!(
            profile_cursor + desc.profiles.len() <= MAX_PROFILES,
            "profile table exhausted"
        );

        let record = &mut snap.devices[index];
        record.name = encode_name(&desc.name);
        record.kind = desc.kind as u32;
        record.caps = desc.caps.bits();
        record.origin_index = origin_index as u32;
        record.first_input_index = input_cursor as u32;
        record.input_count = desc.inputs.len() as u32;
        record.first_output_index = output_cursor as u32;
        record.output_count = desc.outputs.len() as u32;
        record.first_profile_index = profile_cursor as u32;
        record.profile_count = desc.profiles.len() as u32;

        for input in &desc.inputs {
            let mirror = &mut snap.inputs[input_cursor];
            mirror.name = input.name as u32;
            mirror.kind = input.kind as u32;
            mirror.active = 0;
            input_cursor += 1;
        }
        for output in &desc.outputs {
            let mirror = &mut snap.outputs[output_cursor];
            mirror.name = output.name as u32;
            mirror.kind = 0;
            output_cursor += 1;
        }
        for profile in &desc.profiles {
            let total_pairs = profile.input_pairs.len() + profile.output_pairs.len();
            anyhow::ensure!(
                pair_cursor + total_pairs <= MAX_PROFILE_PAIRS,
                "profile pair table exhausted"
            );
            let record = &mut snap.profiles[profile_cursor];
            record.name = encode_name(&profile.name);
            record.first_input_pair = pair_cursor as u32;
            record.input_pair_count = profile.input_pairs.len() as u32;
            for pair in &profile.input_pairs {
                snap.profile_pairs[pair_cursor].from = pair.from;
                snap.profile_pairs[pair_cursor].to = pair.to;
                pair_cursor += 1;
            }
            record.first_output_pair = pair_cursor as u32;
            record.output_pair_count = profile.output_pairs.len() as u32;
            for pair in &profile.output_pairs {
                snap.profile_pairs[pair_cursor].from = pair.from;
                snap.profile_pairs[pair_cursor].to = pair.to;
                pair_cursor += 1;
            }
            profile_cursor += 1;
        }

        // Role assignment: first device of each role wins.
        let roles = &mut snap.header.roles;
        match desc.kind {
            DeviceKind::Hmd if roles.head < 0 => roles.head = index as i32,
            DeviceKind::LeftController if roles.left < 0 => roles.left = index as i32,
            DeviceKind::RightController if roles.right < 0 => roles.right = index as i32,
            DeviceKind::Gamepad if roles.gamepad < 0 => roles.gamepad = index as i32,
            DeviceKind::HandTracker if roles.left_hand_tracker < 0 => {
                roles.left_hand_tracker = index as i32
            }
            DeviceKind::HandTracker if roles.right_hand_tracker < 0 => {
                roles.right_hand_tracker = index as i32
            }
            _ => {}
        }

        if let Some(hmd) = &desc.hmd {
            if snap.header.roles.head == index as i32 {
                let record = &mut snap.header.hmd;
                for (view, extent) in record.view_extents.iter_mut().zip(hmd.extents.iter()) {
                    view[0] = extent.width;
                    view[1] = extent.height;
                }
                let count = hmd.blend_modes.len().min(record.blend_modes.len());
                for (slot, mode) in record
                    .blend_modes
                    .iter_mut()
                    .zip(hmd.blend_modes.iter())
                    .take(count)
                {
                    *slot = *mode as u32;
                }
                record.blend_mode_count = count as u32;
            }
        }
    }

    snap.header.origin_count = origin_keys.len() as u32;
    snap.header.device_count = devices.len() as u32;
    snap.header.input_count = input_cursor as u32;
    snap.header.output_count = output_cursor as u32;
    snap.header.profile_count = profile_cursor as u32;
    snap.header.profile_pair_count = pair_cursor as u32;

    log::info!(
        "published catalog: {} device(s), {} origin(s), {} input(s)",
        devices.len(),
        origin_keys.len(),
        input_cursor
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use setsuna_device::Prober;

    #[test]
    fn catalog_indices_and_slices_are_consistent() {
        let devices = Prober::with_default_builders().probe_all().unwrap();
        let mut snapshot = SnapshotWriter::create().unwrap();
        build_catalog(&mut snapshot, &devices).unwrap();

        let snap = snapshot.snapshot();
        assert_eq!(snap.header.device_count, 3);
        // All three sample devices share the seated origin.
        assert_eq!(snap.header.origin_count, 1);

        // Roles point at the right catalog entries.
        assert_eq!(snap.header.roles.head, 0);
        assert_eq!(snap.header.roles.left, 1);
        assert_eq!(snap.header.roles.right, 2);
        assert_eq!(snap.header.roles.gamepad, -1);

        // Input slices tile the flat array without overlap.
        let mut cursor = 0;
        for index in 0..snap.header.device_count as usize {
            let device = &snap.devices[index];
            assert_eq!(device.first_input_index, cursor);
            cursor += device.input_count;
        }
        assert_eq!(cursor, snap.header.input_count);

        // The HMD record came from the sample HMD.
        assert_eq!(snap.header.hmd.view_extents[0], [1280, 1440]);
        assert_eq!(snap.header.hmd.blend_mode_count, 1);
    }

    #[test]
    fn second_instance_is_refused() {
        let dir = std::env::temp_dir().join(format!("setsuna-lock-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let first = PidLock::acquire(&dir).unwrap();
        assert!(PidLock::acquire(&dir).is_err());
        drop(first);
        let _second = PidLock::acquire(&dir).unwrap();
    }
}
