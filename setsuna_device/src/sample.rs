//! Built-in sample driver set: a null HMD and a pair of sample controllers.
//!
//! These devices report plausible, deterministic data without touching any
//! hardware. Headless deployments and the test suite run on them.

use std::sync::{Arc, OnceLock};
use std::time::Instant;

use nalgebra::Vector3;
use parking_lot::Mutex;

use crate::{
    catalog::{
        BindingPairDesc, BindingProfileDesc, BlendMode, DeviceDesc, DeviceKind, HmdViews,
        InputDesc, OriginKind, OutputDesc, TrackingOriginDesc, ViewExtent,
    },
    Device, DeviceBuilder, DeviceError, HandJointSet, InputName, InputState, InputValue,
    OutputName, OutputValue, Pose, RelationFlags, SpaceRelation, TrackingCaps,
};

fn now_ns() -> i64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as i64
}

fn seated_origin() -> TrackingOriginDesc {
    TrackingOriginDesc {
        name: "sample seated origin".into(),
        kind: OriginKind::Seated,
        offset: Pose::identity(),
    }
}

/// Builder producing the whole sample rig.
#[derive(Default)]
pub struct SampleBuilder {}

impl DeviceBuilder for SampleBuilder {
    fn name(&self) -> &'static str {
        "sample"
    }

    fn probe(&self) -> anyhow::Result<Vec<Arc<dyn Device>>> {
        Ok(vec![
            Arc::new(SampleHmd::new()),
            Arc::new(SampleController::new(DeviceKind::LeftController)),
            Arc::new(SampleController::new(DeviceKind::RightController)),
        ])
    }
}

/// Null HMD: orientation-tracked, fixed eye height, opaque blend only.
pub struct SampleHmd {
    last_update_ns: Mutex<i64>,
}

impl SampleHmd {
    pub fn new() -> Self {
        Self {
            last_update_ns: Mutex::new(now_ns()),
        }
    }
}

impl Device for SampleHmd {
    fn describe(&self) -> DeviceDesc {
        DeviceDesc {
            name: "Sample HMD".into(),
            kind: DeviceKind::Hmd,
            caps: TrackingCaps::ORIENTATION,
            origin: seated_origin(),
            inputs: vec![InputDesc::new(InputName::HeadPose)],
            outputs: vec![],
            profiles: vec![],
            hmd: Some(HmdViews {
                extents: [
                    ViewExtent {
                        width: 1280,
                        height: 1440,
                    },
                    ViewExtent {
                        width: 1280,
                        height: 1440,
                    },
                ],
                blend_modes: vec![BlendMode::Opaque],
            }),
        }
    }

    fn update_inputs(&self) {
        *self.last_update_ns.lock() = now_ns();
    }

    fn input_state(&self, name: InputName) -> Result<InputState, DeviceError> {
        Err(DeviceError::UnknownInput(name))
    }

    fn tracked_pose(
        &self,
        name: InputName,
        at_timestamp_ns: i64,
    ) -> Result<SpaceRelation, DeviceError> {
        if name != InputName::HeadPose {
            return Err(DeviceError::UnknownInput(name));
        }
        let _ = at_timestamp_ns;
        let mut pose = Pose::identity();
        pose.position = Vector3::new(0.0, 1.6, 0.0);
        Ok(SpaceRelation {
            pose,
            linear_velocity: Vector3::zeros(),
            angular_velocity: Vector3::zeros(),
            flags: RelationFlags::ORIENTATION_VALID | RelationFlags::ORIENTATION_TRACKED,
        })
    }

    fn set_output(&self, name: OutputName, _value: OutputValue) -> Result<(), DeviceError> {
        Err(DeviceError::UnknownOutput(name))
    }
}

struct ControllerState {
    trigger: f32,
    trigger_clicked: bool,
    thumbstick: [f32; 2],
    timestamp_ns: i64,
}

/// Sample controller with a trigger, a thumbstick and a haptic output.
pub struct SampleController {
    kind: DeviceKind,
    state: Mutex<ControllerState>,
    last_vibration: Mutex<Option<OutputValue>>,
}

impl SampleController {
    pub fn new(kind: DeviceKind) -> Self {
        debug_assert!(matches!(
            kind,
            DeviceKind::LeftController | DeviceKind::RightController
        ));
        Self {
            kind,
            state: Mutex::new(ControllerState {
                trigger: 0.0,
                trigger_clicked: false,
                thumbstick: [0.0; 2],
                timestamp_ns: now_ns(),
            }),
            last_vibration: Mutex::new(None),
        }
    }

    fn side_sign(&self) -> f32 {
        if self.kind == DeviceKind::LeftController {
            -1.0
        } else {
            1.0
        }
    }

    /// The last vibration request, for tests and debugging.
    pub fn last_vibration(&self) -> Option<OutputValue> {
        *self.last_vibration.lock()
    }
}

impl Device for SampleController {
    fn describe(&self) -> DeviceDesc {
        let side = if self.kind == DeviceKind::LeftController {
            "Left"
        } else {
            "Right"
        };
        DeviceDesc {
            name: format!("Sample Controller ({side})"),
            kind: self.kind,
            caps: TrackingCaps::ORIENTATION | TrackingCaps::POSITION,
            origin: seated_origin(),
            inputs: vec![
                InputDesc::new(InputName::TriggerClick),
                InputDesc::new(InputName::TriggerValue),
                InputDesc::new(InputName::ThumbstickXy),
                InputDesc::new(InputName::GripPose),
                InputDesc::new(InputName::AimPose),
            ],
            outputs: vec![OutputDesc {
                name: OutputName::Haptic,
            }],
            profiles: vec![BindingProfileDesc {
                name: "sample_controller".into(),
                input_pairs: vec![
                    BindingPairDesc {
                        from: InputName::TriggerClick as u32,
                        to: 0,
                    },
                    BindingPairDesc {
                        from: InputName::TriggerValue as u32,
                        to: 1,
                    },
                    BindingPairDesc {
                        from: InputName::ThumbstickXy as u32,
                        to: 2,
                    },
                ],
                output_pairs: vec![BindingPairDesc {
                    from: OutputName::Haptic as u32,
                    to: 0,
                }],
            }],
            hmd: None,
        }
    }

    fn update_inputs(&self) {
        let mut state = self.state.lock();
        state.timestamp_ns = now_ns();
    }

    fn input_state(&self, name: InputName) -> Result<InputState, DeviceError> {
        let state = self.state.lock();
        let value = match name {
            InputName::TriggerClick => InputValue::Boolean(state.trigger_clicked),
            InputName::TriggerValue => InputValue::Scalar(state.trigger),
            InputName::ThumbstickXy => InputValue::Vec2(state.thumbstick),
            other => return Err(DeviceError::UnknownInput(other)),
        };
        Ok(InputState {
            active: true,
            timestamp_ns: state.timestamp_ns,
            value,
        })
    }

    fn tracked_pose(
        &self,
        name: InputName,
        at_timestamp_ns: i64,
    ) -> Result<SpaceRelation, DeviceError> {
        if !matches!(name, InputName::GripPose | InputName::AimPose) {
            return Err(DeviceError::UnknownInput(name));
        }
        let _ = at_timestamp_ns;
        let mut pose = Pose::identity();
        pose.position = Vector3::new(self.side_sign() * 0.2, 1.2, -0.3);
        Ok(SpaceRelation {
            pose,
            linear_velocity: Vector3::zeros(),
            angular_velocity: Vector3::zeros(),
            flags: RelationFlags::ORIENTATION_VALID
                | RelationFlags::ORIENTATION_TRACKED
                | RelationFlags::POSITION_VALID
                | RelationFlags::POSITION_TRACKED,
        })
    }

    fn hand_tracking(
        &self,
        name: InputName,
        _at_timestamp_ns: i64,
    ) -> Result<HandJointSet, DeviceError> {
        Err(DeviceError::UnknownInput(name))
    }

    fn set_output(&self, name: OutputName, value: OutputValue) -> Result<(), DeviceError> {
        if name != OutputName::Haptic {
            return Err(DeviceError::UnknownOutput(name));
        }
        let value = value.clamp_duration();
        log::trace!("sample controller vibration: {value:?}");
        *self.last_vibration.lock() = Some(value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MIN_VIBRATION_DURATION_NS;

    #[test]
    fn hmd_reports_head_pose_only() {
        let hmd = SampleHmd::new();
        let relation = hmd.tracked_pose(InputName::HeadPose, 0).unwrap();
        assert!(relation.flags.contains(RelationFlags::ORIENTATION_TRACKED));
        assert!(hmd.tracked_pose(InputName::GripPose, 0).is_err());
    }

    #[test]
    fn controller_vibration_clamps_magic_duration() {
        let ctrl = SampleController::new(DeviceKind::RightController);
        ctrl.set_output(
            OutputName::Haptic,
            OutputValue::Vibration {
                duration_ns: crate::VIBRATION_MIN_DURATION,
                frequency: 200.0,
                amplitude: 1.0,
            },
        )
        .unwrap();
        match ctrl.last_vibration().unwrap() {
            OutputValue::Vibration { duration_ns, .. } => {
                assert_eq!(duration_ns, MIN_VIBRATION_DURATION_NS)
            }
        }
    }

    #[test]
    fn controller_inputs_update_timestamps() {
        let ctrl = SampleController::new(DeviceKind::LeftController);
        let before = ctrl.input_state(InputName::TriggerValue).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        ctrl.update_inputs();
        let after = ctrl.input_state(InputName::TriggerValue).unwrap();
        assert!(after.timestamp_ns > before.timestamp_ns);
    }
}
