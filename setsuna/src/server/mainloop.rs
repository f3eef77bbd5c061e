//! The acceptor: a thin poll loop that hands new peers to listener threads.
//!
//! The poll never blocks longer than 50 ms so shutdown stays prompt. On
//! desktops the acceptor also watches standard input and triggers a graceful
//! shutdown on end-of-file or `q`.

use std::{
    io::Read,
    os::fd::AsFd,
    os::unix::net::{UnixListener, UnixStream},
    sync::Arc,
    thread,
};

use anyhow::{Context, Result};
use nix::poll::{poll, PollFd, PollFlags};

use super::{client, RunState, Server};

const POLL_INTERVAL_MS: u16 = 50;

/// Runs the accept loop until shutdown, then joins every listener thread.
pub fn run(server: &Arc<Server>, listener: UnixListener, watch_stdin: bool) -> Result<()> {
    listener
        .set_nonblocking(true)
        .context("acceptor set_nonblocking")?;

    let stdin = std::io::stdin();
    while !server.is_shutting_down() {
        let mut fds = Vec::with_capacity(2);
        fds.push(PollFd::new(listener.as_fd(), PollFlags::POLLIN));
        if watch_stdin {
            fds.push(PollFd::new(stdin.as_fd(), PollFlags::POLLIN));
        }

        match poll(&mut fds, POLL_INTERVAL_MS) {
            Ok(0) => continue,
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => continue,
            Err(errno) => return Err(errno).context("acceptor poll"),
        }

        let listener_ready = fds[0]
            .revents()
            .map_or(false, |revents| !revents.is_empty());
        let stdin_ready = watch_stdin
            && fds[1]
                .revents()
                .map_or(false, |revents| !revents.is_empty());
        drop(fds);

        if listener_ready {
            loop {
                match listener.accept() {
                    Ok((stream, _)) => handle_new_client(server, stream),
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(err) => {
                        log::warn!("accept failed: {err}");
                        break;
                    }
                }
            }
        }

        if stdin_ready && stdin_requests_shutdown() {
            server.request_shutdown();
        }
    }

    join_all(server);
    Ok(())
}

/// Installs a freshly accepted peer into the first free thread slot and
/// spawns its listener.
pub fn handle_new_client(server: &Arc<Server>, stream: UnixStream) {
    // Find a slot; take the previous thread handle if the slot was used
    // before, so it can be joined outside the lock.
    let (index, previous_thread) = {
        let mut global = server.global.lock();
        let Some(index) = global
            .slots
            .iter()
            .position(|slot| !slot.is_connected() && slot.thread_matches_state())
        else {
            drop(global);
            log::warn!("all client slots busy, dropping new connection");
            return;
        };
        let previous = if global.slots[index].run_state != RunState::Ready {
            global.slots[index].thread.take()
        } else {
            None
        };
        (index, previous)
    };

    if let Some(handle) = previous_thread {
        // The old listener finished its socket work but may still be in
        // cleanup; joining here cannot deadlock because the lock is free.
        if handle.join().is_err() {
            log::error!("previous listener of slot {index} panicked");
        }
        server.global.lock().slots[index].run_state = RunState::Ready;
    }

    let mut global = server.global.lock();
    global.slots[index].run_state = RunState::Starting;
    global.slots[index].server_thread_index = index as i64;
    server.sessions[index]
        .io_active
        .store(true, std::sync::atomic::Ordering::Release);

    let thread = {
        let server = server.clone();
        thread::Builder::new()
            .name(format!("setsuna-client-{index}"))
            .spawn(move || client::run_listener(server, index, stream))
    };
    match thread {
        Ok(handle) => {
            global.slots[index].thread = Some(handle);
            log::info!("accepted new client into slot {index}");
        }
        Err(err) => {
            log::error!("failed to spawn listener thread: {err}");
            global.slots[index].server_thread_index = -1;
            global.slots[index].run_state = RunState::Ready;
        }
    }
}

/// Joins every listener thread. Called after shutdown is requested.
pub fn join_all(server: &Server) {
    let handles: Vec<_> = {
        let mut global = server.global.lock();
        global
            .slots
            .iter_mut()
            .filter_map(|slot| slot.thread.take())
            .collect()
    };
    for handle in handles {
        if handle.join().is_err() {
            log::error!("listener thread panicked during shutdown");
        }
    }
    let mut global = server.global.lock();
    for slot in global.slots.iter_mut() {
        slot.run_state = RunState::Ready;
        slot.server_thread_index = -1;
    }
}

fn stdin_requests_shutdown() -> bool {
    let mut byte = [0u8; 1];
    match std::io::stdin().read(&mut byte) {
        // End of file, or an explicit quit.
        Ok(0) => true,
        Ok(_) => byte[0] == b'q' || byte[0] == b'Q',
        Err(_) => false,
    }
}

impl super::ClientSlot {
    /// A slot is reusable when it is free; a previous thread in `Stopping`
    /// is fine (it gets joined first), one in `Starting`/`Running` with a
    /// free index cannot happen.
    fn thread_matches_state(&self) -> bool {
        self.run_state == RunState::Ready || self.run_state == RunState::Stopping
    }
}
