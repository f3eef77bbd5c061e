/*! Abstract device layer of the setsuna runtime.
 *
 * The server multiplexes physical devices behind the object-safe [`Device`]
 * trait; concrete drivers (HID parsers, IMU ingesters, camera pipelines) live
 * out of tree and own their own I/O threads. This crate carries the trait,
 * the input/output value model, the catalog description types the server
 * publishes into shared memory, and the discovery prober with the built-in
 * sample drivers.
 */

use nalgebra::{UnitQuaternion, Vector3};

/// Re-exported for downstream pose math.
pub use nalgebra;

pub mod catalog;
pub mod prober;
pub mod sample;

pub use catalog::{
    BindingPairDesc, BindingProfileDesc, DeviceDesc, DeviceKind, HmdViews, InputDesc, OutputDesc,
    TrackingOriginDesc, ViewExtent,
};
pub use prober::{DeviceBuilder, Prober, ProberError};

/// Minimum vibration length substituted when a client requests the magic
/// duration of `-1`.
pub const MIN_VIBRATION_DURATION_NS: i64 = 100_000_000;

/// Request value for "shortest vibration the platform supports".
pub const VIBRATION_MIN_DURATION: i64 = -1;

/// A rigid transform: rotation then translation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    pub orientation: UnitQuaternion<f32>,
    pub position: Vector3<f32>,
}

impl Pose {
    pub fn identity() -> Self {
        Self {
            orientation: UnitQuaternion::identity(),
            position: Vector3::zeros(),
        }
    }
}

impl Default for Pose {
    fn default() -> Self {
        Self::identity()
    }
}

bitflags::bitflags! {
    /// Which parts of a [`SpaceRelation`] hold meaningful data.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RelationFlags: u32 {
        const ORIENTATION_VALID = 1 << 0;
        const ORIENTATION_TRACKED = 1 << 1;
        const POSITION_VALID = 1 << 2;
        const POSITION_TRACKED = 1 << 3;
        const LINEAR_VELOCITY_VALID = 1 << 4;
        const ANGULAR_VELOCITY_VALID = 1 << 5;
    }
}

/// A tracked pose with its derivatives, as reported by a device.
#[derive(Debug, Clone, Copy)]
pub struct SpaceRelation {
    pub pose: Pose,
    pub linear_velocity: Vector3<f32>,
    pub angular_velocity: Vector3<f32>,
    pub flags: RelationFlags,
}

impl SpaceRelation {
    /// A relation carrying no valid data at all.
    pub fn inactive() -> Self {
        Self {
            pose: Pose::identity(),
            linear_velocity: Vector3::zeros(),
            angular_velocity: Vector3::zeros(),
            flags: RelationFlags::empty(),
        }
    }
}

bitflags::bitflags! {
    /// Tracking capabilities advertised in the device catalog.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TrackingCaps: u32 {
        const ORIENTATION = 1 << 0;
        const POSITION = 1 << 1;
        const HAND_TRACKING = 1 << 2;
        const FORCE_FEEDBACK = 1 << 3;
    }
}

/// What kind of value an input endpoint produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ValueKind {
    Boolean = 0,
    /// Scalar in `[0, 1]`.
    Scalar01 = 1,
    /// Scalar in `[-1, 1]`.
    ScalarSymmetric = 2,
    Vec2 = 3,
    Vec3 = 4,
    Pose = 5,
    HandJointSet = 6,
}

/// Semantic identifiers of input endpoints. The numeric value is the wire
/// and shared-memory name of the endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum InputName {
    HeadPose = 1,
    TriggerClick = 2,
    TriggerValue = 3,
    SqueezeValue = 4,
    ThumbstickXy = 5,
    ThumbstickClick = 6,
    GripPose = 7,
    AimPose = 8,
    MenuClick = 9,
    HandJoints = 10,
}

impl InputName {
    pub fn from_u32(raw: u32) -> Option<Self> {
        Some(match raw {
            1 => Self::HeadPose,
            2 => Self::TriggerClick,
            3 => Self::TriggerValue,
            4 => Self::SqueezeValue,
            5 => Self::ThumbstickXy,
            6 => Self::ThumbstickClick,
            7 => Self::GripPose,
            8 => Self::AimPose,
            9 => Self::MenuClick,
            10 => Self::HandJoints,
            _ => return None,
        })
    }

    pub fn kind(self) -> ValueKind {
        match self {
            Self::HeadPose | Self::GripPose | Self::AimPose => ValueKind::Pose,
            Self::TriggerClick | Self::ThumbstickClick | Self::MenuClick => ValueKind::Boolean,
            Self::TriggerValue | Self::SqueezeValue => ValueKind::Scalar01,
            Self::ThumbstickXy => ValueKind::Vec2,
            Self::HandJoints => ValueKind::HandJointSet,
        }
    }

    /// Whether this endpoint reports a tracked pose.
    pub fn is_pose(self) -> bool {
        self.kind() == ValueKind::Pose
    }
}

/// Output endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum OutputName {
    Haptic = 1,
}

impl OutputName {
    pub fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Self::Haptic),
            _ => None,
        }
    }
}

/// A non-pose input reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InputValue {
    Boolean(bool),
    Scalar(f32),
    Vec2([f32; 2]),
    Vec3([f32; 3]),
}

impl InputValue {
    /// Flattens the reading into the four shared-memory value lanes.
    pub fn lanes(&self) -> [f32; 4] {
        match *self {
            InputValue::Boolean(b) => [if b { 1.0 } else { 0.0 }, 0.0, 0.0, 0.0],
            InputValue::Scalar(s) => [s, 0.0, 0.0, 0.0],
            InputValue::Vec2([x, y]) => [x, y, 0.0, 0.0],
            InputValue::Vec3([x, y, z]) => [x, y, z, 0.0],
        }
    }
}

/// A timestamped reading of one endpoint.
#[derive(Debug, Clone, Copy)]
pub struct InputState {
    pub active: bool,
    pub timestamp_ns: i64,
    pub value: InputValue,
}

/// Output requests the server forwards to a device.
#[derive(Debug, Clone, Copy)]
pub enum OutputValue {
    Vibration {
        duration_ns: i64,
        frequency: f32,
        amplitude: f32,
    },
}

impl OutputValue {
    /// Applies the `-1` = minimum-duration rule.
    pub fn clamp_duration(self) -> Self {
        match self {
            OutputValue::Vibration {
                duration_ns,
                frequency,
                amplitude,
            } => OutputValue::Vibration {
                duration_ns: if duration_ns == VIBRATION_MIN_DURATION {
                    MIN_VIBRATION_DURATION_NS
                } else {
                    duration_ns
                },
                frequency,
                amplitude,
            },
        }
    }
}

/// One tracked hand joint.
#[derive(Debug, Clone, Copy)]
pub struct HandJoint {
    pub relation: SpaceRelation,
    pub radius: f32,
}

pub const HAND_JOINT_COUNT: usize = 26;

/// A full set of hand joints plus the sample timestamp.
#[derive(Debug, Clone, Copy)]
pub struct HandJointSet {
    pub active: bool,
    pub timestamp_ns: i64,
    pub joints: [HandJoint; HAND_JOINT_COUNT],
}

impl HandJointSet {
    pub fn inactive() -> Self {
        Self {
            active: false,
            timestamp_ns: 0,
            joints: [HandJoint {
                relation: SpaceRelation::inactive(),
                radius: 0.0,
            }; HAND_JOINT_COUNT],
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("input {0:?} does not exist on this device")]
    UnknownInput(InputName),
    #[error("input {0:?} is not currently producing data")]
    NotActive(InputName),
    #[error("output {0:?} does not exist on this device")]
    UnknownOutput(OutputName),
}

/// The interface every driver implements. Destruction happens through `Drop`;
/// drivers join their I/O threads there.
pub trait Device: Send + Sync {
    /// Static catalog description; stable for the lifetime of the device.
    fn describe(&self) -> DeviceDesc;

    /// Refreshes the device's input mirror. Called from the server on a
    /// client's `device_update_input`.
    fn update_inputs(&self);

    /// Reads the current state of a non-pose endpoint.
    fn input_state(&self, name: InputName) -> Result<InputState, DeviceError>;

    /// Pose of a pose-kind endpoint at (or extrapolated to) `at_timestamp_ns`.
    fn tracked_pose(
        &self,
        name: InputName,
        at_timestamp_ns: i64,
    ) -> Result<SpaceRelation, DeviceError>;

    /// Hand-joint set at `at_timestamp_ns`; only meaningful for devices whose
    /// catalog entry advertises hand tracking.
    fn hand_tracking(
        &self,
        name: InputName,
        at_timestamp_ns: i64,
    ) -> Result<HandJointSet, DeviceError> {
        let _ = at_timestamp_ns;
        Err(DeviceError::UnknownInput(name))
    }

    /// Forwards an output request (vibration) to the hardware.
    fn set_output(&self, name: OutputName, value: OutputValue) -> Result<(), DeviceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_names_round_trip_and_carry_kinds() {
        for raw in 1..=10 {
            let name = InputName::from_u32(raw).unwrap();
            assert_eq!(name as u32, raw);
        }
        assert!(InputName::from_u32(0).is_none());
        assert!(InputName::HeadPose.is_pose());
        assert!(!InputName::TriggerValue.is_pose());
        assert_eq!(InputName::ThumbstickXy.kind(), ValueKind::Vec2);
    }

    #[test]
    fn vibration_minimum_duration_is_substituted() {
        let out = OutputValue::Vibration {
            duration_ns: VIBRATION_MIN_DURATION,
            frequency: 160.0,
            amplitude: 0.5,
        }
        .clamp_duration();
        match out {
            OutputValue::Vibration { duration_ns, .. } => {
                assert_eq!(duration_ns, MIN_VIBRATION_DURATION_NS)
            }
        }

        let out = OutputValue::Vibration {
            duration_ns: 5,
            frequency: 160.0,
            amplitude: 0.5,
        }
        .clamp_duration();
        match out {
            OutputValue::Vibration { duration_ns, .. } => assert_eq!(duration_ns, 5),
        }
    }

    #[test]
    fn value_lanes_flatten() {
        assert_eq!(
            InputValue::Boolean(true).lanes(),
            [1.0, 0.0, 0.0, 0.0]
        );
        assert_eq!(InputValue::Vec2([0.25, -0.5]).lanes(), [0.25, -0.5, 0.0, 0.0]);
    }
}
