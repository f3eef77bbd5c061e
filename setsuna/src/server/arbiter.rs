//! Global arbitration: which session is the primary, and who is visible and
//! focused.
//!
//! Exactly one non-overlay session fills the frame at a time. Overlays ride
//! on top of it with their declared z-order and lose visibility whenever no
//! primary exists. Every entry point recomputes under the global lock; the
//! scan is O(MAX_CLIENTS) and deliberately uncached, since activation races
//! with disconnect.

use std::sync::atomic::Ordering;

use setsuna_ipc::protocol::{MAX_CLIENTS, PRIMARY_Z_ORDER};

use super::{GlobalState, Server, SessionEvent};

/// A session started producing frames (first `predict_frame` after begin).
/// A non-overlay activation designates the newcomer as the primary; the
/// recompute pass validates the designation.
pub fn activate_session(server: &Server, index: usize) {
    log::debug!("client {index} activated");
    let mut global = server.global.lock();
    if !server.sessions[index].overlay.load(Ordering::Acquire) {
        global.active_client_index = index as i64;
    }
    recompute(server, &mut global);
}

/// A session stopped (session_end, session_destroy or disconnect).
pub fn deactivate_session(server: &Server, index: usize) {
    log::debug!("client {index} deactivated");
    let mut global = server.global.lock();
    if global.active_client_index == index as i64 {
        global.active_client_index = -1;
    }
    recompute(server, &mut global);
}

/// Admin designation of the primary client.
pub fn set_primary(server: &Server, index: usize) {
    let mut global = server.global.lock();
    global.active_client_index = index as i64;
    recompute(server, &mut global);
}

fn is_valid_primary(server: &Server, global: &GlobalState, index: i64) -> bool {
    if !(0..MAX_CLIENTS as i64).contains(&index) {
        return false;
    }
    let session = &server.sessions[index as usize];
    global.slots[index as usize].is_connected()
        && !session.overlay.load(Ordering::Acquire)
        && session.active.load(Ordering::Acquire)
}

/// The arbitration pass. Caller holds the global lock.
///
/// The walk is always taken, even when the designation is unchanged: an
/// overlay activating or ending under a stable primary still needs its own
/// visibility recomputed, and the pass is idempotent.
pub fn recompute(server: &Server, global: &mut GlobalState) {
    let designated = global.active_client_index;

    // Fallback: the first connected, non-overlay, active session.
    let fallback = (0..MAX_CLIENTS).find(|&index| is_valid_primary(server, global, index as i64));

    let new_active = if is_valid_primary(server, global, designated) {
        designated
    } else {
        fallback.map(|index| index as i64).unwrap_or(-1)
    };
    global.active_client_index = new_active;

    let have_primary = new_active >= 0;
    for index in 0..MAX_CLIENTS {
        if !global.slots[index].is_connected() {
            continue;
        }
        let session = &server.sessions[index];
        let overlay = session.overlay.load(Ordering::Acquire);
        let active = session.active.load(Ordering::Acquire);

        let (visible, focused, z_order) = if !overlay && index as i64 == new_active {
            (true, true, PRIMARY_Z_ORDER)
        } else if overlay {
            // Overlays track the primary: no primary, nothing to overlay.
            let shown = have_primary && active;
            (shown, shown, session.z_order.load(Ordering::Acquire))
        } else {
            (false, false, session.z_order.load(Ordering::Acquire))
        };

        let was_visible = session.visible.swap(visible, Ordering::AcqRel);
        let was_focused = session.focused.swap(focused, Ordering::AcqRel);

        if session.has_compositor.load(Ordering::Acquire) {
            server
                .system_compositor
                .set_client_state(index, visible, focused);
            server.system_compositor.set_client_z_order(index, z_order);
            if was_visible != visible || was_focused != focused {
                session.push_event(SessionEvent::StateChange { visible, focused });
            }
        }
    }

    let previous = global.last_active_client_index;
    if previous != new_active && previous >= 0 && new_active >= 0 {
        // Primary handed off between two live clients: overlays must
        // re-synchronize, which they do on a visibility off/on flip.
        for index in 0..MAX_CLIENTS {
            let session = &server.sessions[index];
            if global.slots[index].is_connected()
                && session.overlay.load(Ordering::Acquire)
                && session.has_compositor.load(Ordering::Acquire)
            {
                server.system_compositor.set_client_state(index, false, false);
                server.system_compositor.set_client_state(index, true, true);
                session.push_event(SessionEvent::OverlayResync);
            }
        }
    }

    if previous != new_active {
        log::info!("primary client: {previous} -> {new_active}");
    }
    global.last_active_client_index = new_active;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_server;
    use std::sync::Arc;

    fn connect(server: &Arc<Server>, index: usize, overlay: bool, z_order: i64) {
        let mut global = server.global.lock();
        global.slots[index].server_thread_index = index as i64;
        global.slots[index].run_state = super::super::RunState::Running;
        drop(global);

        let session = &server.sessions[index];
        session.created.store(true, Ordering::Release);
        session.begun.store(true, Ordering::Release);
        session.has_compositor.store(true, Ordering::Release);
        session.overlay.store(overlay, Ordering::Release);
        session.z_order.store(z_order, Ordering::Release);
        session.io_active.store(true, Ordering::Release);
    }

    fn activate(server: &Arc<Server>, index: usize) {
        server.sessions[index]
            .active
            .store(true, Ordering::Release);
        activate_session(server, index);
    }

    fn disconnect(server: &Arc<Server>, index: usize) {
        {
            let mut global = server.global.lock();
            global.slots[index].server_thread_index = -1;
        }
        server.sessions[index].reset();
        deactivate_session(server, index);
    }

    fn focused_non_overlays(server: &Arc<Server>) -> Vec<usize> {
        (0..server.sessions.len())
            .filter(|&index| {
                let session = &server.sessions[index];
                session.focused.load(Ordering::Acquire)
                    && !session.overlay.load(Ordering::Acquire)
            })
            .collect()
    }

    #[test]
    fn two_client_primary_hand_off() {
        let server = test_server();

        connect(&server, 0, false, 0);
        activate(&server, 0);
        assert_eq!(server.global.lock().active_client_index, 0);
        assert!(server.sessions[0].focused.load(Ordering::Acquire));
        assert!(server.sessions[0].visible.load(Ordering::Acquire));

        // A newly activating non-overlay client takes the primary.
        connect(&server, 1, false, 0);
        activate(&server, 1);
        assert_eq!(server.global.lock().active_client_index, 1);
        assert!(server.sessions[1].focused.load(Ordering::Acquire));
        assert!(!server.sessions[0].focused.load(Ordering::Acquire));
        assert!(!server.sessions[0].visible.load(Ordering::Acquire));

        // Closing the primary falls back to the remaining active client.
        disconnect(&server, 1);
        assert_eq!(server.global.lock().active_client_index, 0);
        assert!(server.sessions[0].focused.load(Ordering::Acquire));

        // Closing the last one goes idle.
        disconnect(&server, 0);
        assert_eq!(server.global.lock().active_client_index, -1);
    }

    #[test]
    fn overlay_rides_on_the_primary() {
        let server = test_server();

        connect(&server, 0, false, 0);
        activate(&server, 0);
        connect(&server, 2, true, 10);
        activate(&server, 2);

        // The overlay did not steal the designation.
        assert_eq!(server.global.lock().active_client_index, 0);
        assert!(server.sessions[2].visible.load(Ordering::Acquire));
        assert!(server.sessions[2].focused.load(Ordering::Acquire));
        assert_eq!(server.sessions[2].z_order.load(Ordering::Acquire), 10);

        // No primary: the overlay is forced off.
        disconnect(&server, 0);
        assert!(!server.sessions[2].visible.load(Ordering::Acquire));
        assert!(!server.sessions[2].focused.load(Ordering::Acquire));

        // A new primary turns it back on.
        connect(&server, 0, false, 0);
        activate(&server, 0);
        assert!(server.sessions[2].visible.load(Ordering::Acquire));
        assert!(server.sessions[2].focused.load(Ordering::Acquire));
    }

    #[test]
    fn at_most_one_focused_non_overlay() {
        let server = test_server();
        for index in 0..3 {
            connect(&server, index, false, 0);
            activate(&server, index);
            assert_eq!(focused_non_overlays(&server), vec![index]);
        }
        disconnect(&server, 2);
        assert_eq!(focused_non_overlays(&server).len(), 1);
    }

    #[test]
    fn primary_hand_off_resyncs_overlays() {
        let server = test_server();
        connect(&server, 0, false, 0);
        activate(&server, 0);
        connect(&server, 3, true, 5);
        activate(&server, 3);
        server.sessions[3].events.lock().clear();

        // Hand off between two live primaries.
        connect(&server, 1, false, 0);
        activate(&server, 1);

        let events: Vec<_> = server.sessions[3].events.lock().iter().copied().collect();
        assert!(
            events.contains(&SessionEvent::OverlayResync),
            "overlay missed the resync: {events:?}"
        );
    }

    #[test]
    fn admin_designation_is_validated() {
        let server = test_server();
        connect(&server, 0, false, 0);
        activate(&server, 0);
        connect(&server, 1, false, 0);
        activate(&server, 1);
        assert_eq!(server.global.lock().active_client_index, 1);

        set_primary(&server, 0);
        assert_eq!(server.global.lock().active_client_index, 0);

        // Designating a dead slot falls back to a live one.
        set_primary(&server, 5);
        let active = server.global.lock().active_client_index;
        assert!(active == 0 || active == 1);
    }
}
