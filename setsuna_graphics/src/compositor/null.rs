//! The null system compositor.
//!
//! No presentation back-end at all: frames are "displayed" by recording
//! them. A fixed-period timing model stands in for vsync. Used by headless
//! deployments, and by the test suite to observe exactly what the core
//! submitted.

use std::{collections::HashMap, time::Duration};

use parking_lot::Mutex;

use super::{
    now_ns, CommittedSlot, FramePoint, FramePrediction, SystemCompositor, SystemCompositorInfo,
};

/// Compact record of one submitted slot, kept for inspection.
#[derive(Debug, Clone)]
pub struct SubmittedFrame {
    pub frame_id: i64,
    pub layer_count: usize,
    pub layer_kinds: Vec<u32>,
    pub one_projection_fast_path: bool,
    /// `(timeline value)` the compositor must wait for before sampling.
    pub sync_value: Option<u64>,
}

struct Timing {
    next_frame_id: i64,
    period_ns: i64,
}

#[derive(Default)]
struct ClientStates {
    visible_focused: HashMap<usize, (bool, bool)>,
    z_orders: HashMap<usize, i64>,
}

pub struct NullCompositor {
    info: SystemCompositorInfo,
    timing: Mutex<Timing>,
    submitted: Mutex<Vec<SubmittedFrame>>,
    marks: Mutex<Vec<(i64, FramePoint)>>,
    clients: Mutex<ClientStates>,
}

impl NullCompositor {
    pub fn new() -> Self {
        // 90 Hz, the common HMD refresh rate.
        Self::with_period(Duration::from_nanos(11_111_111))
    }

    pub fn with_period(period: Duration) -> Self {
        let period_ns = period.as_nanos() as i64;
        Self {
            info: SystemCompositorInfo {
                name: "null".into(),
                view_width: 1280,
                view_height: 1440,
                refresh_rate_hz: 1e9 / period_ns as f32,
                blend_modes: vec![1],
            },
            timing: Mutex::new(Timing {
                next_frame_id: 1,
                period_ns,
            }),
            submitted: Mutex::new(Vec::new()),
            marks: Mutex::new(Vec::new()),
            clients: Mutex::new(ClientStates::default()),
        }
    }

    pub fn submitted_frames(&self) -> Vec<SubmittedFrame> {
        self.submitted.lock().clone()
    }

    pub fn last_submitted(&self) -> Option<SubmittedFrame> {
        self.submitted.lock().last().cloned()
    }

    pub fn marks(&self) -> Vec<(i64, FramePoint)> {
        self.marks.lock().clone()
    }

    pub fn client_state(&self, client_index: usize) -> Option<(bool, bool)> {
        self.clients.lock().visible_focused.get(&client_index).copied()
    }

    pub fn client_z_order(&self, client_index: usize) -> Option<i64> {
        self.clients.lock().z_orders.get(&client_index).copied()
    }
}

impl Default for NullCompositor {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemCompositor for NullCompositor {
    fn info(&self) -> SystemCompositorInfo {
        self.info.clone()
    }

    fn predict_frame(&self) -> FramePrediction {
        let mut timing = self.timing.lock();
        let frame_id = timing.next_frame_id;
        timing.next_frame_id += 1;

        let now = now_ns();
        // Wake one period out, display one period after that.
        let wake_time_ns = now + timing.period_ns;
        FramePrediction {
            frame_id,
            wake_time_ns,
            display_time_ns: wake_time_ns + timing.period_ns,
            period_ns: timing.period_ns,
        }
    }

    fn mark_frame(&self, frame_id: i64, point: FramePoint, _when_ns: i64) {
        self.marks.lock().push((frame_id, point));
    }

    fn submit_slot(&self, slot: &CommittedSlot) -> anyhow::Result<()> {
        self.submitted.lock().push(SubmittedFrame {
            frame_id: slot.frame_id,
            layer_count: slot.layers.len(),
            layer_kinds: slot.layers.iter().map(|layer| layer.entry.kind).collect(),
            one_projection_fast_path: slot.one_projection_fast_path,
            sync_value: slot.sync.as_ref().map(|(_, value)| *value),
        });
        Ok(())
    }

    fn set_client_state(&self, client_index: usize, visible: bool, focused: bool) {
        log::trace!("null compositor: client {client_index} visible={visible} focused={focused}");
        self.clients
            .lock()
            .visible_focused
            .insert(client_index, (visible, focused));
    }

    fn set_client_z_order(&self, client_index: usize, z_order: i64) {
        self.clients.lock().z_orders.insert(client_index, z_order);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predictions_advance_frame_ids_and_times() {
        let sys = NullCompositor::with_period(Duration::from_millis(10));
        let a = sys.predict_frame();
        let b = sys.predict_frame();
        assert_eq!(b.frame_id, a.frame_id + 1);
        assert!(a.display_time_ns > a.wake_time_ns);
        assert_eq!(a.period_ns, 10_000_000);
    }

    #[test]
    fn client_state_is_recorded() {
        let sys = NullCompositor::new();
        sys.set_client_state(2, true, false);
        sys.set_client_z_order(2, 10);
        assert_eq!(sys.client_state(2), Some((true, false)));
        assert_eq!(sys.client_z_order(2), Some(10));
        assert_eq!(sys.client_state(0), None);
    }
}
