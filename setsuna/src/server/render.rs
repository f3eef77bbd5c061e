//! The render loop.
//!
//! Owned by the system compositor side of the server: once per period it
//! gathers the committed slots of every visible session in z-order, holds
//! their references for the duration of the frame, and runs exactly one
//! garbage-collect pass. Holding the references is what keeps a
//! disconnecting client's swapchains alive for the frame that still
//! samples them.

use std::sync::{atomic::Ordering, Arc};

use setsuna_graphics::{pacing::PreciseSleeper, CommittedSlot};

use super::Server;

pub fn run_render_loop(server: Arc<Server>) {
    log::info!("render loop running at {:?} per frame", server.frame_period);
    let sleeper = PreciseSleeper::new();
    let mut in_flight: Vec<Arc<CommittedSlot>> = Vec::new();

    while !server.is_shutting_down() {
        sleeper.sleep_for(server.frame_period);

        // Visible sessions in draw order; the primary's z is i64::MIN so it
        // always comes first.
        let mut order: Vec<(usize, i64)> = {
            let global = server.global.lock();
            (0..server.sessions.len())
                .filter(|&index| {
                    global.slots[index].is_connected()
                        && server.sessions[index].visible.load(Ordering::Acquire)
                })
                .map(|index| {
                    let session = &server.sessions[index];
                    let z = if session.overlay.load(Ordering::Acquire) {
                        session.z_order.load(Ordering::Acquire)
                    } else {
                        i64::MIN
                    };
                    (index, z)
                })
                .collect()
        };
        order.sort_by_key(|&(_, z)| z);

        let mut current = Vec::with_capacity(order.len());
        for (index, _) in order {
            if let Some(slot) = server.sessions[index].latest_slot.lock().clone() {
                log::trace!(
                    "frame {} of client {index}: {} layer(s)",
                    slot.frame_id,
                    slot.layers.len()
                );
                current.push(slot);
            }
        }

        // Dropping the previous frame's references retires its image pins;
        // anything that became unreferenced is collected right after.
        in_flight = current;
        server
            .shared_resources
            .garbage_collect(server.bundle.as_ref());
    }

    drop(in_flight);
    server
        .shared_resources
        .garbage_collect(server.bundle.as_ref());
    log::info!("render loop stopped");
}
