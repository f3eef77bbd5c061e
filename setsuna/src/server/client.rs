//! Per-client listener thread.
//!
//! One thread per connection reads requests, dispatches them and writes the
//! replies back. Dispatch on a connection is strictly serial, so clients see
//! request/reply causal order. The read loop uses the channel's periodic
//! timeout to observe the server's shutdown flag.

use std::{
    os::fd::AsFd,
    os::unix::net::UnixStream,
    sync::{atomic::Ordering, Arc},
};

use setsuna_ipc::channel::{ChannelError, MessageChannel, MAX_RECORD_SIZE};

use super::{arbiter, dispatch, RunState, Server, Session};

/// Entry point of the listener thread for slot `index`.
pub fn run_listener(server: Arc<Server>, index: usize, stream: UnixStream) {
    let channel = match MessageChannel::new(stream) {
        Ok(channel) => channel,
        Err(err) => {
            log::warn!("client {index}: failed to set up channel: {err}");
            release_slot(&server, index);
            return;
        }
    };

    {
        let mut global = server.global.lock();
        global.slots[index].run_state = RunState::Running;
    }
    log::info!("client {index}: listener running");

    let mut session = Session::new(index, channel, server.sessions[index].clone());
    read_loop(&server, &mut session);
    cleanup(&server, session);

    if server.exit_on_disconnect {
        server.request_shutdown();
    }
}

fn read_loop(server: &Server, session: &mut Session) {
    let mut buf = [0u8; MAX_RECORD_SIZE];
    loop {
        if server.is_shutting_down() {
            log::debug!("client {}: server shutting down", session.index);
            return;
        }

        let (command, len, fds) = match session.channel.receive_request_with_fds(&mut buf) {
            Ok(record) => record,
            Err(ChannelError::TimedOut) => continue,
            Err(ChannelError::Disconnected) => {
                log::info!("client {}: disconnected", session.index);
                return;
            }
            Err(err) => {
                log::warn!("client {}: protocol failure: {err}", session.index);
                return;
            }
        };

        let output = dispatch::dispatch(server, session, command, &buf[..len], fds);
        let fd_refs: Vec<_> = output.fds.iter().map(|fd| fd.as_fd()).collect();
        if let Err(err) = session
            .channel
            .send_reply(output.status, &output.reply, &fd_refs)
        {
            log::warn!("client {}: reply failed: {err}", session.index);
            return;
        }
        if output.disconnect {
            log::warn!(
                "client {}: closing connection after protocol error",
                session.index
            );
            return;
        }
    }
}

/// The ordered teardown of one session.
fn cleanup(server: &Server, session: Session) {
    let index = session.index;
    let Session {
        channel,
        shared,
        compositor,
        mut swapchains,
        mut semaphores,
        ..
    } = session;

    // 1. Close the channel so the peer sees the disconnect immediately.
    drop(channel);

    // 2. Mark the slot stopping and zero the cross-thread client state.
    {
        let mut global = server.global.lock();
        global.slots[index].run_state = RunState::Stopping;
        global.slots[index].server_thread_index = -1;
        shared.reset();
    }

    // 3. Drop every owned swapchain; each enters its deferred-destruction
    //    path. The render thread may still hold this frame's references.
    for slot in swapchains.iter_mut() {
        *slot = None;
    }

    // 4. Drop the owned semaphores.
    for slot in semaphores.iter_mut() {
        *slot = None;
    }

    // 5. Drop the native compositor reference.
    drop(compositor);

    // 6. Recompute arbitration now that this session is gone.
    arbiter::deactivate_session(server, index);

    log::info!("client {index}: cleaned up");
}

fn release_slot(server: &Server, index: usize) {
    let mut global = server.global.lock();
    global.slots[index].server_thread_index = -1;
    global.slots[index].run_state = RunState::Stopping;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_server;
    use setsuna_ipc::protocol::{Command, Empty, Status};

    #[test]
    fn malformed_size_terminates_the_connection() {
        let server = test_server();
        let (client_stream, server_stream) = UnixStream::pair().unwrap();
        let client = MessageChannel::new(client_stream).unwrap();

        let handle = {
            let server = server.clone();
            // Install the connection in slot 0 by hand.
            {
                let mut global = server.global.lock();
                global.slots[0].server_thread_index = 0;
                global.slots[0].run_state = RunState::Starting;
            }
            server.sessions[0].io_active.store(true, Ordering::Release);
            std::thread::spawn(move || run_listener(server, 0, server_stream))
        };

        // session_begin with a bogus 3-byte payload: reply is IPC_FAILURE and
        // the server closes the connection.
        client
            .send_request(Command::SessionBegin, &[1, 2, 3])
            .unwrap();
        let mut buf = [0u8; 64];
        let (status, _, _) = client.receive_reply(&mut buf).unwrap();
        assert_eq!(status, Status::IpcFailure);

        // Next read observes the disconnect.
        loop {
            match client.receive_reply(&mut buf) {
                Err(ChannelError::Disconnected) => break,
                Err(ChannelError::TimedOut) => continue,
                other => panic!("expected disconnect, got {other:?}"),
            }
        }
        handle.join().unwrap();

        // The slot was released for reuse.
        let global = server.global.lock();
        assert_eq!(global.slots[0].server_thread_index, -1);
    }

    #[test]
    fn disconnect_cleans_up_and_releases_the_slot() {
        let server = test_server();
        let (client_stream, server_stream) = UnixStream::pair().unwrap();
        let client = MessageChannel::new(client_stream).unwrap();

        {
            let mut global = server.global.lock();
            global.slots[1].server_thread_index = 1;
            global.slots[1].run_state = RunState::Starting;
        }
        server.sessions[1].io_active.store(true, Ordering::Release);
        let handle = {
            let server = server.clone();
            std::thread::spawn(move || run_listener(server, 1, server_stream))
        };

        client
            .send_request(Command::SessionCreate, bytemuck::bytes_of(
                &setsuna_ipc::protocol::SessionCreateRequest {
                    overlay: 0,
                    _pad: 0,
                    z_order: 0,
                    pid: 42,
                    _pad2: 0,
                    app_name: setsuna_ipc::protocol::encode_name("cleanup-test"),
                },
            ))
            .unwrap();
        let mut buf = [0u8; 64];
        let (status, _, _) = client.receive_reply(&mut buf).unwrap();
        assert_eq!(status, Status::Success);
        assert!(server.sessions[1].created.load(Ordering::Acquire));

        client.send_request(Command::SessionBegin, bytemuck::bytes_of(&Empty {})).unwrap();
        let (status, _, _) = client.receive_reply(&mut buf).unwrap();
        assert_eq!(status, Status::Success);

        drop(client);
        handle.join().unwrap();

        assert!(!server.sessions[1].created.load(Ordering::Acquire));
        let global = server.global.lock();
        assert!(!global.slots[1].is_connected());
    }
}
