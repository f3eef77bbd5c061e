//! The process-shared device snapshot.
//!
//! A single fixed-layout region published by the server and mapped read-only
//! by every client. All static fields (catalog, origins, inputs, binding
//! profiles, roles, HMD record) are written before the listen socket accepts
//! anyone; afterwards the only mutated fields are the layer-slot ring, the
//! live input mirrors and the two atomically accessed words
//! (`current_slot_index`, `io_device_mask`).
//!
//! Readers must load `current_slot_index` first (acquire) and only then read
//! the slot it names; the writer fills a slot completely before publishing
//! its index (release). This is the only synchronization across the process
//! boundary.

use std::{
    fs::File,
    os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd},
    sync::atomic::{AtomicU32, Ordering},
};

use anyhow::{Context, Result};
use bytemuck::{Pod, Zeroable};
use memmap2::{Mmap, MmapMut};
use nix::sys::memfd::{memfd_create, MemFdCreateFlag};

use crate::protocol::{
    LayerEntry, SlotHeader, WirePose, BUILD_ID_LEN, DEVICE_NAME_LEN, MAX_DEVICES, MAX_INPUTS,
    MAX_LAYERS, MAX_ORIGINS, MAX_OUTPUTS, MAX_PROFILES, MAX_PROFILE_PAIRS, MAX_SLOTS, MAX_VIEWS,
    NO_DEVICE,
};

pub const SNAPSHOT_MAGIC: u32 = 0x5e75_0a01;
pub const SNAPSHOT_VERSION: u32 = 1;

/// Catalog indices of the devices currently filling each role; `-1` = none.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct RoleTable {
    pub head: i32,
    pub left: i32,
    pub right: i32,
    pub gamepad: i32,
    pub left_hand_tracker: i32,
    pub right_hand_tracker: i32,
}

impl RoleTable {
    pub fn empty() -> Self {
        Self {
            head: NO_DEVICE,
            left: NO_DEVICE,
            right: NO_DEVICE,
            gamepad: NO_DEVICE,
            left_hand_tracker: NO_DEVICE,
            right_hand_tracker: NO_DEVICE,
        }
    }
}

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct HmdRecord {
    /// Per-eye recommended pixel extents, `[width, height]` per view.
    pub view_extents: [[u32; 2]; MAX_VIEWS],
    pub blend_modes: [u32; 3],
    pub blend_mode_count: u32,
}

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct SnapshotHeader {
    pub magic: u32,
    pub version: u32,
    pub startup_timestamp_ns: i64,
    pub build_id: [u8; BUILD_ID_LEN],
    pub origin_count: u32,
    pub device_count: u32,
    pub input_count: u32,
    pub output_count: u32,
    pub profile_count: u32,
    pub profile_pair_count: u32,
    /// Atomically published; see module docs.
    pub current_slot_index: u32,
    /// Bit `i` set means device `i` has input/output gating disabled.
    /// Atomically accessed.
    pub io_device_mask: u32,
    pub roles: RoleTable,
    pub hmd: HmdRecord,
}

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct OriginRecord {
    pub name: [u8; DEVICE_NAME_LEN],
    pub kind: u32,
    pub _pad: u32,
    pub offset: WirePose,
}

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct DeviceRecord {
    pub name: [u8; DEVICE_NAME_LEN],
    pub kind: u32,
    pub caps: u32,
    pub origin_index: u32,
    pub first_input_index: u32,
    pub input_count: u32,
    pub first_output_index: u32,
    pub output_count: u32,
    pub first_profile_index: u32,
    pub profile_count: u32,
    pub _pad: u32,
}

/// Live mirror of one input endpoint. `value` holds up to four lanes of the
/// endpoint's current reading; pose-kind endpoints are queried over IPC
/// instead and leave it zeroed.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct InputRecord {
    pub name: u32,
    pub kind: u32,
    pub active: u32,
    pub _pad: u32,
    pub timestamp_ns: i64,
    pub value: [f32; 4],
}

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct OutputRecord {
    pub name: u32,
    pub kind: u32,
}

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct ProfileRecord {
    pub name: [u8; DEVICE_NAME_LEN],
    pub first_input_pair: u32,
    pub input_pair_count: u32,
    pub first_output_pair: u32,
    pub output_pair_count: u32,
}

/// One interaction-profile mapping: semantic name -> physical endpoint index.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct ProfilePairRecord {
    pub from: u32,
    pub to: u32,
}

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct LayerSlot {
    pub header: SlotHeader,
    pub layers: [LayerEntry; MAX_LAYERS],
}

/// The whole shared region. Fixed layout, fixed size; the build id guards
/// against any drift between server and client binaries.
#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct Snapshot {
    pub header: SnapshotHeader,
    pub origins: [OriginRecord; MAX_ORIGINS],
    pub devices: [DeviceRecord; MAX_DEVICES],
    pub inputs: [InputRecord; MAX_INPUTS],
    pub outputs: [OutputRecord; MAX_OUTPUTS],
    pub profiles: [ProfileRecord; MAX_PROFILES],
    pub profile_pairs: [ProfilePairRecord; MAX_PROFILE_PAIRS],
    pub slots: [LayerSlot; MAX_SLOTS],
}

pub const SNAPSHOT_SIZE: usize = std::mem::size_of::<Snapshot>();

/// The build identifier stamped into the header. Clients match it
/// byte-for-byte; there is no in-protocol versioning.
pub fn build_id() -> [u8; BUILD_ID_LEN] {
    crate::protocol::encode_name::<BUILD_ID_LEN>(concat!(
        "setsuna ",
        env!("CARGO_PKG_VERSION")
    ))
}

/// Server-side owner of the shared region.
pub struct SnapshotWriter {
    map: MmapMut,
    file: File,
}

impl SnapshotWriter {
    /// Allocates and zeroes the region on an anonymous memfd.
    pub fn create() -> Result<Self> {
        let fd: OwnedFd = memfd_create(c"setsuna-snapshot", MemFdCreateFlag::MFD_CLOEXEC)
            .context("memfd_create for device snapshot")?;
        let file = File::from(fd);
        file.set_len(SNAPSHOT_SIZE as u64)
            .context("sizing device snapshot")?;
        let map = unsafe { MmapMut::map_mut(&file).context("mapping device snapshot")? };

        let mut writer = Self { map, file };
        let snap = writer.snapshot_mut();
        snap.header.magic = SNAPSHOT_MAGIC;
        snap.header.version = SNAPSHOT_VERSION;
        snap.header.build_id = build_id();
        snap.header.roles = RoleTable::empty();
        Ok(writer)
    }

    pub fn fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }

    pub fn snapshot(&self) -> &Snapshot {
        bytemuck::from_bytes(&self.map[..SNAPSHOT_SIZE])
    }

    pub fn snapshot_mut(&mut self) -> &mut Snapshot {
        bytemuck::from_bytes_mut(&mut self.map[..SNAPSHOT_SIZE])
    }

    /// Fills the slot that will be published next and returns its index.
    /// The caller publishes it afterwards with [`SnapshotWriter::publish_slot`].
    pub fn write_next_slot(
        &mut self,
        header: SlotHeader,
        layers: &[LayerEntry],
    ) -> u32 {
        let snap = self.snapshot_mut();
        let next = (snap.header.current_slot_index + 1) % MAX_SLOTS as u32;
        let slot = &mut snap.slots[next as usize];
        slot.header = header;
        slot.header.layer_count = layers.len() as u32;
        slot.layers[..layers.len()].copy_from_slice(layers);
        next
    }

    /// Release-publishes `current_slot_index` so cross-process readers see a
    /// fully written slot.
    pub fn publish_slot(&mut self, index: u32) {
        let ptr: *mut u32 = &mut self.snapshot_mut().header.current_slot_index;
        unsafe { AtomicU32::from_ptr(ptr) }.store(index, Ordering::Release);
    }

    pub fn current_slot_index(&self) -> u32 {
        let ptr: *const u32 = &self.snapshot().header.current_slot_index;
        unsafe { AtomicU32::from_ptr(ptr.cast_mut()) }.load(Ordering::Acquire)
    }

    pub fn io_device_enabled(&self, device_index: usize) -> bool {
        let ptr: *const u32 = &self.snapshot().header.io_device_mask;
        let mask = unsafe { AtomicU32::from_ptr(ptr.cast_mut()) }.load(Ordering::Acquire);
        mask & (1 << device_index) == 0
    }

    /// Flips the gating bit for one device and returns the new enabled state.
    pub fn toggle_io_device(&mut self, device_index: usize) -> bool {
        let ptr: *mut u32 = &mut self.snapshot_mut().header.io_device_mask;
        let atomic = unsafe { AtomicU32::from_ptr(ptr) };
        let old = atomic.fetch_xor(1 << device_index, Ordering::AcqRel);
        old & (1 << device_index) != 0
    }
}

/// Client-side read-only view of the shared region.
pub struct SnapshotReader {
    map: Mmap,
    _file: File,
}

impl SnapshotReader {
    /// Maps the region from a handle received over IPC. Refuses regions whose
    /// magic or build id do not match this binary.
    pub fn from_fd(fd: OwnedFd) -> Result<Self> {
        let file = File::from(fd);
        let len = file.metadata().context("snapshot fd metadata")?.len() as usize;
        if len != SNAPSHOT_SIZE {
            anyhow::bail!(
                "snapshot region is {} bytes, expected {}",
                len,
                SNAPSHOT_SIZE
            );
        }
        let map = unsafe { Mmap::map(&file).context("mapping snapshot read-only")? };
        let reader = Self { map, _file: file };

        let header = &reader.snapshot().header;
        if header.magic != SNAPSHOT_MAGIC || header.version != SNAPSHOT_VERSION {
            anyhow::bail!("snapshot magic/version mismatch");
        }
        if header.build_id != build_id() {
            anyhow::bail!("snapshot build id does not match this client library");
        }
        log::debug!("attached snapshot, fd {}", reader._file.as_raw_fd());
        Ok(reader)
    }

    pub fn snapshot(&self) -> &Snapshot {
        bytemuck::from_bytes(&self.map[..SNAPSHOT_SIZE])
    }

    /// Acquire-loads the index of the most recently published layer slot.
    pub fn current_slot_index(&self) -> u32 {
        let ptr: *const u32 = &self.snapshot().header.current_slot_index;
        unsafe { AtomicU32::from_ptr(ptr.cast_mut()) }.load(Ordering::Acquire)
    }

    /// The slot the index currently points at. Callers must read the index
    /// first; see module docs.
    pub fn current_slot(&self) -> &LayerSlot {
        &self.snapshot().slots[self.current_slot_index() as usize]
    }

    pub fn device(&self, index: usize) -> Option<&DeviceRecord> {
        let snap = self.snapshot();
        (index < snap.header.device_count as usize).then(|| &snap.devices[index])
    }

    pub fn inputs_of(&self, device: &DeviceRecord) -> &[InputRecord] {
        let snap = self.snapshot();
        let first = device.first_input_index as usize;
        &snap.inputs[first..first + device.input_count as usize]
    }

    pub fn outputs_of(&self, device: &DeviceRecord) -> &[OutputRecord] {
        let snap = self.snapshot();
        let first = device.first_output_index as usize;
        &snap.outputs[first..first + device.output_count as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::layer_kind;

    fn dup_fd(writer: &SnapshotWriter) -> OwnedFd {
        writer.fd().try_clone_to_owned().unwrap()
    }

    #[test]
    fn create_and_attach_round_trip() {
        let mut writer = SnapshotWriter::create().unwrap();
        {
            let snap = writer.snapshot_mut();
            snap.header.device_count = 2;
            snap.devices[0].kind = 1;
            snap.devices[0].first_input_index = 0;
            snap.devices[0].input_count = 3;
            snap.devices[1].first_input_index = 3;
            snap.devices[1].input_count = 1;
        }

        let reader = SnapshotReader::from_fd(dup_fd(&writer)).unwrap();
        let dev = reader.device(0).unwrap();
        assert_eq!(dev.input_count, 3);
        assert_eq!(reader.inputs_of(dev).len(), 3);
        assert!(reader.device(2).is_none());
    }

    #[test]
    fn slot_publication_is_observed_in_order() {
        let mut writer = SnapshotWriter::create().unwrap();
        let reader = SnapshotReader::from_fd(dup_fd(&writer)).unwrap();
        assert_eq!(reader.current_slot_index(), 0);

        let mut header = SlotHeader::zeroed();
        for frame in 1..=5i64 {
            header.frame_id = frame;
            let entry = LayerEntry {
                kind: layer_kind::QUAD,
                flags: 0,
                device_index: -1,
                swapchain_count: 1,
                swapchain_ids: [7, 0, 0, 0],
                data: [0.0; 32],
            };
            let index = writer.write_next_slot(header, &[entry]);
            writer.publish_slot(index);

            // The slot named by the index is always fully written.
            let slot = reader.current_slot();
            assert_eq!(slot.header.frame_id, frame);
            assert_eq!(slot.header.layer_count, 1);
            assert_eq!(slot.layers[0].swapchain_ids[0], 7);
        }
        // Ring advanced modulo MAX_SLOTS.
        assert_eq!(reader.current_slot_index(), 5 % MAX_SLOTS as u32);
    }

    #[test]
    fn io_toggle_flips_device_gating() {
        let mut writer = SnapshotWriter::create().unwrap();
        assert!(writer.io_device_enabled(1));
        assert!(writer.toggle_io_device(1));
        assert!(!writer.io_device_enabled(1));
        assert!(!writer.toggle_io_device(1));
        assert!(writer.io_device_enabled(1));
    }

    #[test]
    fn mismatched_build_id_is_refused() {
        let mut writer = SnapshotWriter::create().unwrap();
        writer.snapshot_mut().header.build_id[0] ^= 0xff;
        assert!(SnapshotReader::from_fd(dup_fd(&writer)).is_err());
    }
}
