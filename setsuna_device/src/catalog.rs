//! Catalog description types.
//!
//! A driver describes itself once with these structures; the server assigns
//! catalog indices, deduplicates tracking origins and flattens everything
//! into the shared-memory snapshot. Indices are permanent for the server's
//! lifetime.

use crate::{InputName, OutputName, Pose, TrackingCaps, ValueKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DeviceKind {
    Hmd = 0,
    LeftController = 1,
    RightController = 2,
    GenericTracker = 3,
    HandTracker = 4,
    Gamepad = 5,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum OriginKind {
    Seated = 0,
    Standing = 1,
    Stage = 2,
}

/// A named reference frame. Devices sharing the same name and kind share one
/// published origin.
#[derive(Debug, Clone)]
pub struct TrackingOriginDesc {
    pub name: String,
    pub kind: OriginKind,
    pub offset: Pose,
}

impl PartialEq for TrackingOriginDesc {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.kind == other.kind
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ViewExtent {
    pub width: u32,
    pub height: u32,
}

/// Environmental blend modes an HMD supports, in preference order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum BlendMode {
    Opaque = 1,
    Additive = 2,
    AlphaBlend = 3,
}

#[derive(Debug, Clone)]
pub struct HmdViews {
    pub extents: [ViewExtent; 2],
    pub blend_modes: Vec<BlendMode>,
}

#[derive(Debug, Clone, Copy)]
pub struct InputDesc {
    pub name: InputName,
    pub kind: ValueKind,
}

impl InputDesc {
    pub fn new(name: InputName) -> Self {
        Self {
            name,
            kind: name.kind(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct OutputDesc {
    pub name: OutputName,
}

/// One interaction-profile mapping entry: the profile's semantic name bound
/// to a physical endpoint of this device.
#[derive(Debug, Clone, Copy)]
pub struct BindingPairDesc {
    pub from: u32,
    pub to: u32,
}

#[derive(Debug, Clone)]
pub struct BindingProfileDesc {
    pub name: String,
    pub input_pairs: Vec<BindingPairDesc>,
    pub output_pairs: Vec<BindingPairDesc>,
}

/// The complete static description of a device.
#[derive(Debug, Clone)]
pub struct DeviceDesc {
    pub name: String,
    pub kind: DeviceKind,
    pub caps: TrackingCaps,
    pub origin: TrackingOriginDesc,
    pub inputs: Vec<InputDesc>,
    pub outputs: Vec<OutputDesc>,
    pub profiles: Vec<BindingProfileDesc>,
    /// Present only on HMDs.
    pub hmd: Option<HmdViews>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origins_compare_by_name_and_kind() {
        let a = TrackingOriginDesc {
            name: "local".into(),
            kind: OriginKind::Seated,
            offset: Pose::identity(),
        };
        let mut b = a.clone();
        b.offset.position.y = 1.6;
        assert_eq!(a, b);

        let c = TrackingOriginDesc {
            name: "stage".into(),
            kind: OriginKind::Stage,
            offset: Pose::identity(),
        };
        assert_ne!(a, c);
    }
}
