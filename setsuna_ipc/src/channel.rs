//! Typed request/reply transport over a local stream socket.
//!
//! Records are length-prefixed (`[u32 length][u32 tag-or-status][payload]`)
//! and always written with a single `sendmsg`, so any native handles that
//! accompany a record arrive attached to its first byte. Reads use a socket
//! timeout so listener threads can periodically observe the shutdown flag.

use std::{
    io::{IoSlice, IoSliceMut},
    os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd},
    os::unix::net::UnixStream,
    time::Duration,
};

use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};
use thiserror::Error;

use crate::protocol::{Command, Status};

/// Largest record either side will accept. Bounded by the layer-sync payload.
pub const MAX_RECORD_SIZE: usize = 4096;

/// How long a blocking read waits before surfacing [`ChannelError::TimedOut`]
/// so the caller can check its shutdown flag.
pub const READ_TIMEOUT: Duration = Duration::from_millis(500);

/// Handles that can ride along with a single record.
pub const MAX_RECORD_FDS: usize = 8;

const RECORD_HEADER_SIZE: usize = 8;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("peer disconnected")]
    Disconnected,
    #[error("read timed out")]
    TimedOut,
    #[error("malformed record: {0}")]
    Malformed(String),
    #[error("handle transport failed: {0}")]
    HandleTransport(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type ChannelResult<T> = Result<T, ChannelError>;

/// One end of the message channel. Both the server listener and the client
/// connector wrap the same type.
pub struct MessageChannel {
    stream: UnixStream,
}

impl MessageChannel {
    pub fn new(stream: UnixStream) -> ChannelResult<Self> {
        stream.set_read_timeout(Some(READ_TIMEOUT))?;
        Ok(Self { stream })
    }

    /// Connected socketpair, handy for tests.
    pub fn pair() -> ChannelResult<(Self, Self)> {
        let (a, b) = UnixStream::pair()?;
        Ok((Self::new(a)?, Self::new(b)?))
    }

    pub fn peer_fd(&self) -> BorrowedFd<'_> {
        self.stream.as_fd()
    }

    pub fn send_request(&self, command: Command, payload: &[u8]) -> ChannelResult<()> {
        self.send_record(command as u32, payload, &[])
    }

    pub fn send_request_with_fds(
        &self,
        command: Command,
        payload: &[u8],
        fds: &[BorrowedFd<'_>],
    ) -> ChannelResult<()> {
        self.send_record(command as u32, payload, fds)
    }

    pub fn send_reply(
        &self,
        status: Status,
        payload: &[u8],
        fds: &[BorrowedFd<'_>],
    ) -> ChannelResult<()> {
        self.send_record(status as u32, payload, fds)
    }

    /// Reads one request record. Returns the command and the payload slice
    /// length written into `payload`.
    pub fn receive_request(&self, payload: &mut [u8]) -> ChannelResult<(Command, usize)> {
        let (word, len, fds) = self.receive_record(payload)?;
        if !fds.is_empty() {
            // Requests carrying handles are only valid for swapchain import;
            // the dispatcher asks for them explicitly.
            return Err(ChannelError::Malformed(
                "unexpected handles on request".into(),
            ));
        }
        let command = Command::from_u32(word)
            .ok_or_else(|| ChannelError::Malformed(format!("unknown command tag {word}")))?;
        Ok((command, len))
    }

    /// Reads one request record that may carry native handles.
    pub fn receive_request_with_fds(
        &self,
        payload: &mut [u8],
    ) -> ChannelResult<(Command, usize, Vec<OwnedFd>)> {
        let (word, len, fds) = self.receive_record(payload)?;
        let command = Command::from_u32(word)
            .ok_or_else(|| ChannelError::Malformed(format!("unknown command tag {word}")))?;
        Ok((command, len, fds))
    }

    /// Reads one reply record, returning its status and any attached handles.
    pub fn receive_reply(&self, payload: &mut [u8]) -> ChannelResult<(Status, usize, Vec<OwnedFd>)> {
        let (word, len, fds) = self.receive_record(payload)?;
        let status = Status::from_u32(word)
            .ok_or_else(|| ChannelError::Malformed(format!("unknown status code {word}")))?;
        Ok((status, len, fds))
    }

    fn send_record(&self, word: u32, payload: &[u8], fds: &[BorrowedFd<'_>]) -> ChannelResult<()> {
        let record_len = RECORD_HEADER_SIZE + payload.len();
        if record_len > MAX_RECORD_SIZE {
            return Err(ChannelError::Malformed(format!(
                "record of {record_len} bytes exceeds the channel cap"
            )));
        }
        let mut record = Vec::with_capacity(record_len);
        record.extend_from_slice(&((payload.len() as u32 + 4).to_le_bytes()));
        record.extend_from_slice(&word.to_le_bytes());
        record.extend_from_slice(payload);

        let raw_fds: Vec<i32> = fds.iter().map(|fd| fd.as_raw_fd()).collect();
        let iov = [IoSlice::new(&record)];
        let cmsgs: &[ControlMessage] = if raw_fds.is_empty() {
            &[]
        } else {
            &[ControlMessage::ScmRights(&raw_fds)]
        };

        let sent = sendmsg::<()>(
            self.stream.as_raw_fd(),
            &iov,
            cmsgs,
            MsgFlags::empty(),
            None,
        )
        .map_err(|errno| ChannelError::Io(errno.into()))?;
        if sent != record.len() {
            return Err(ChannelError::HandleTransport(format!(
                "short send, {sent} of {} bytes",
                record.len()
            )));
        }
        Ok(())
    }

    /// Reads one full record. Native handles, if any, arrive with the leading
    /// segment of the record; stream reads loop until the record is complete.
    fn receive_record(&self, payload: &mut [u8]) -> ChannelResult<(u32, usize, Vec<OwnedFd>)> {
        let mut header = [0u8; RECORD_HEADER_SIZE];
        let mut fds = Vec::new();

        let got = self.recv_chunk(&mut header, &mut fds)?;
        if got == 0 {
            return Err(ChannelError::Disconnected);
        }
        let mut filled = got;
        while filled < RECORD_HEADER_SIZE {
            let got = self.recv_chunk(&mut header[filled..], &mut fds)?;
            if got == 0 {
                return Err(ChannelError::Disconnected);
            }
            filled += got;
        }

        let length = u32::from_le_bytes(header[0..4].try_into().unwrap()) as usize;
        let word = u32::from_le_bytes(header[4..8].try_into().unwrap());
        if length < 4 || length - 4 > MAX_RECORD_SIZE {
            return Err(ChannelError::Malformed(format!(
                "record length {length} out of bounds"
            )));
        }
        let payload_len = length - 4;
        if payload_len > payload.len() {
            return Err(ChannelError::Malformed(format!(
                "payload of {payload_len} bytes exceeds the caller's buffer"
            )));
        }

        let mut filled = 0;
        while filled < payload_len {
            let got = self.recv_chunk(&mut payload[filled..payload_len], &mut fds)?;
            if got == 0 {
                return Err(ChannelError::Disconnected);
            }
            filled += got;
        }
        Ok((word, payload_len, fds))
    }

    fn recv_chunk(&self, buf: &mut [u8], fds: &mut Vec<OwnedFd>) -> ChannelResult<usize> {
        let mut cmsg_buf = nix::cmsg_space!([std::os::fd::RawFd; MAX_RECORD_FDS]);
        let mut iov = [IoSliceMut::new(buf)];
        let msg = recvmsg::<()>(
            self.stream.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg_buf),
            MsgFlags::empty(),
        )
        .map_err(|errno| match errno {
            nix::errno::Errno::EAGAIN => ChannelError::TimedOut,
            other => ChannelError::Io(other.into()),
        })?;

        for cmsg in msg
            .cmsgs()
            .map_err(|e| ChannelError::HandleTransport(e.to_string()))?
        {
            if let ControlMessageOwned::ScmRights(received) = cmsg {
                for raw in received {
                    // SAFETY: the kernel just handed us ownership of this fd.
                    fds.push(unsafe { OwnedFd::from_raw_fd(raw) });
                }
            }
        }
        Ok(msg.bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Empty, SwapchainIdRequest};
    use std::io::{Read, Seek, SeekFrom, Write};

    #[test]
    fn request_reply_round_trip() {
        let (client, server) = MessageChannel::pair().unwrap();

        let req = SwapchainIdRequest { id: 3, _pad: 0 };
        client
            .send_request(Command::SwapchainAcquireImage, bytemuck::bytes_of(&req))
            .unwrap();

        let mut buf = [0u8; MAX_RECORD_SIZE];
        let (command, len) = server.receive_request(&mut buf).unwrap();
        assert_eq!(command, Command::SwapchainAcquireImage);
        let got: SwapchainIdRequest = bytemuck::pod_read_unaligned(&buf[..len]);
        assert_eq!(got.id, 3);

        server
            .send_reply(Status::NoImageAvailable, bytemuck::bytes_of(&Empty {}), &[])
            .unwrap();
        let (status, len, fds) = client.receive_reply(&mut buf).unwrap();
        assert_eq!(status, Status::NoImageAvailable);
        assert_eq!(len, 0);
        assert!(fds.is_empty());
    }

    #[test]
    fn reply_carries_native_handles() {
        let (client, server) = MessageChannel::pair().unwrap();

        let mut file = tempfile_like();
        file.write_all(b"snapshot").unwrap();
        file.flush().unwrap();

        server
            .send_reply(Status::Success, &[], &[file.as_fd()])
            .unwrap();

        let mut buf = [0u8; 64];
        let (status, _, mut fds) = client.receive_reply(&mut buf).unwrap();
        assert_eq!(status, Status::Success);
        assert_eq!(fds.len(), 1);

        // The received fd refers to the same open description.
        let mut received = std::fs::File::from(fds.pop().unwrap());
        received.seek(SeekFrom::Start(0)).unwrap();
        let mut contents = String::new();
        received.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "snapshot");
    }

    #[test]
    fn unknown_tag_is_malformed() {
        let (client, server) = MessageChannel::pair().unwrap();
        client.send_record(0xdead_beef, &[], &[]).unwrap();
        let mut buf = [0u8; 16];
        match server.receive_request(&mut buf) {
            Err(ChannelError::Malformed(_)) => {}
            other => panic!("expected malformed record, got {other:?}"),
        }
    }

    #[test]
    fn read_timeout_is_distinct_from_disconnect() {
        let (client, server) = MessageChannel::pair().unwrap();
        // Nothing sent: the read must time out, not report a disconnect.
        server.stream.set_read_timeout(Some(Duration::from_millis(20))).unwrap();
        let mut buf = [0u8; 16];
        match server.receive_request(&mut buf) {
            Err(ChannelError::TimedOut) => {}
            other => panic!("expected timeout, got {other:?}"),
        }

        drop(client);
        match server.receive_request(&mut buf) {
            Err(ChannelError::Disconnected) => {}
            other => panic!("expected disconnect, got {other:?}"),
        }
    }

    fn tempfile_like() -> std::fs::File {
        let fd = nix::sys::memfd::memfd_create(
            c"setsuna-chan-test",
            nix::sys::memfd::MemFdCreateFlag::empty(),
        )
        .unwrap();
        std::fs::File::from(fd)
    }
}
