/*! The setsuna runtime server.
 *
 * A multi-client service that arbitrates access to head-mounted display and
 * controller devices, publishes a shared-memory device snapshot, brokers GPU
 * swapchain handles and composites per-frame layer submissions from
 * concurrent clients. The binary entry point is thin; everything lives in
 * [`instance`] (bootstrap/shutdown) and [`server`] (acceptor, sessions,
 * arbitration, dispatch, render loop).
 */

pub mod instance;
pub mod server;

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;
    use std::time::Duration;

    use setsuna_device::Prober;
    use setsuna_graphics::{compositor::null::NullCompositor, HeadlessBundle};
    use setsuna_ipc::shmem::SnapshotWriter;

    use crate::server::Server;

    /// A server over the sample devices, headless bundle and a fast null
    /// compositor; no sockets, no threads.
    pub fn test_server() -> Arc<Server> {
        let devices = Prober::with_default_builders().probe_all().unwrap();
        let mut snapshot = SnapshotWriter::create().unwrap();
        crate::instance::build_catalog(&mut snapshot, &devices).unwrap();
        Server::new(
            snapshot,
            devices,
            Arc::new(HeadlessBundle::new()),
            Arc::new(NullCompositor::with_period(Duration::from_millis(2))),
            Duration::from_millis(2),
            false,
        )
    }
}
