//! # Sender
//!
//! One TCP connection to one peer, with a fixed-capacity residual buffer for
//! partially-sent or "required" payloads that could not be written
//! immediately. Grounded on `storage/forwarding/sender.c` of the original
//! collector: a raw, per-call choice between blocking and non-blocking
//! writes (via `MSG_DONTWAIT`), never killed by `SIGPIPE` (`MSG_NOSIGNAL`),
//! with at-most-once "required" delivery backed by the residual buffer.

use std::io::{self, IoSlice};
use std::net::ToSocketAddrs;
use std::os::unix::io::AsRawFd;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::{debug, warn};

/// Capacity of the residual buffer in bytes (2x the reference max packet
/// size of 256 KiB is more than sufficient headroom; the original collector
/// used a fixed 512 KiB regardless of configured packet size).
const BUFFER_SIZE: usize = 512 * 1024;

/// Mode of a single send operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendMode {
    /// Spin until the payload is fully accepted by the kernel.
    Blocking,
    /// Never block; report [`SendStatus::Busy`] instead.
    NonBlocking,
}

/// Outcome of a send operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// Arguments were invalid (e.g. not connected and caller didn't check).
    Invalid,
    /// All data was sent, or (for `required` calls) safely buffered.
    Ok,
    /// Nothing was sent; the operation would have blocked and delivery was
    /// not required. Never returned when `required` is true.
    Busy,
    /// The socket was closed because of an error or because the residual
    /// buffer could not hold a required payload. Call `connect()` again.
    Closed,
}

/// A single outbound connection plus its residual buffer.
pub struct Sender {
    address: String,
    port: String,
    socket: Option<Socket>,
    buffer: Vec<u8>,
}

impl Sender {
    /// Creates a sender for `address:port` without connecting yet.
    pub fn new(address: impl Into<String>, port: impl Into<String>) -> Self {
        Self { address: address.into(), port: port.into(), socket: None, buffer: Vec::new() }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn is_connected(&self) -> bool {
        self.socket.is_some()
    }

    fn close(&mut self) {
        if self.socket.take().is_some() {
            self.buffer.clear();
        }
    }

    /// (Re)connects to the destination: resolves the address with
    /// `AF_UNSPEC` semantics (both IPv4 and IPv6 candidates), tries each in
    /// turn, closes any prior socket on success. Blocking; confined to the
    /// reconnector per the concurrency model.
    pub fn connect(&mut self) -> Result<(), io::Error> {
        let target = format!("{}:{}", self.address, self.port);
        let addrs: Vec<_> = target.to_socket_addrs()?.collect();
        if addrs.is_empty() {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no addresses resolved"));
        }

        for addr in &addrs {
            let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
            let socket = match Socket::new(domain, Type::STREAM, Some(Protocol::TCP)) {
                Ok(s) => s,
                Err(_) => continue,
            };

            if socket.connect(&SockAddr::from(*addr)).is_ok() {
                self.close();
                self.socket = Some(socket);
                debug!(address = %self.address, port = %self.port, "sender connected");
                return Ok(());
            }
        }

        Err(io::Error::new(io::ErrorKind::ConnectionRefused, "failed to connect to any resolved address"))
    }

    fn prepare_buffer_slot(&mut self, size: usize) -> Option<std::ops::Range<usize>> {
        if self.buffer.len() + size > BUFFER_SIZE {
            return None;
        }
        let start = self.buffer.len();
        self.buffer.resize(start + size, 0);
        Some(start..start + size)
    }

    fn buffer_store(&mut self, data: &[u8]) -> Result<(), ()> {
        match self.prepare_buffer_slot(data.len()) {
            Some(range) => {
                self.buffer[range].copy_from_slice(data);
                Ok(())
            }
            None => Err(()),
        }
    }

    fn buffer_store_iov(&mut self, iov: &[IoSlice<'_>], offset: usize) -> Result<(), ()> {
        let total: usize = iov.iter().map(|s| s.len()).sum();
        if total <= offset {
            return Err(());
        }
        let needed = total - offset;
        let range = self.prepare_buffer_slot(needed).ok_or(())?;

        let mut consumed = 0usize;
        let mut write_at = range.start;
        for slice in iov {
            let len = slice.len();
            if consumed + len <= offset {
                consumed += len;
                continue;
            }
            let skip = offset.saturating_sub(consumed);
            let bytes = &slice[skip..];
            self.buffer[write_at..write_at + bytes.len()].copy_from_slice(bytes);
            write_at += bytes.len();
            consumed += len;
        }
        Ok(())
    }

    /// Flushes the residual buffer. Returns `true` if bytes remain buffered
    /// (socket busy or closed), `false` once the buffer is empty.
    fn flush_buffer(&mut self, mode: SendMode) -> bool {
        if self.socket.is_none() {
            return true;
        }
        if self.buffer.is_empty() {
            return false;
        }

        let mut sent_total = 0usize;
        loop {
            let remaining = &self.buffer[sent_total..];
            if remaining.is_empty() {
                break;
            }

            match self.raw_send(remaining, mode) {
                Ok(n) => {
                    sent_total += n;
                    continue;
                }
                Err(RawSendError::WouldBlock) => {
                    if mode == SendMode::Blocking {
                        continue;
                    }
                    if sent_total == 0 {
                        return true;
                    }
                    self.buffer.drain(0..sent_total);
                    return true;
                }
                Err(RawSendError::Fatal(e)) => {
                    warn!(address = %self.address, port = %self.port, error = %e, "connection closed while flushing residual buffer");
                    self.close();
                    return true;
                }
            }
        }

        self.buffer.clear();
        false
    }

    fn raw_send(&self, buf: &[u8], mode: SendMode) -> Result<usize, RawSendError> {
        let socket = self.socket.as_ref().expect("socket present");
        let mut flags = libc::MSG_NOSIGNAL;
        if mode == SendMode::NonBlocking {
            flags |= libc::MSG_DONTWAIT;
        }

        let ret = unsafe {
            libc::send(socket.as_raw_fd(), buf.as_ptr() as *const libc::c_void, buf.len(), flags)
        };

        if ret >= 0 {
            return Ok(ret as usize);
        }

        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK) => Err(RawSendError::WouldBlock),
            _ => Err(RawSendError::Fatal(err)),
        }
    }

    fn raw_sendmsg(&self, iov: &[IoSlice<'_>], mode: SendMode) -> Result<usize, RawSendError> {
        let socket = self.socket.as_ref().expect("socket present");
        let mut flags = libc::MSG_NOSIGNAL;
        if mode == SendMode::NonBlocking {
            flags |= libc::MSG_DONTWAIT;
        }

        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_iov = iov.as_ptr() as *mut libc::iovec;
        msg.msg_iovlen = iov.len() as _;

        let ret = unsafe { libc::sendmsg(socket.as_raw_fd(), &msg, flags) };
        if ret >= 0 {
            return Ok(ret as usize);
        }

        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK) => Err(RawSendError::WouldBlock),
            _ => Err(RawSendError::Fatal(err)),
        }
    }

    /// Sends `payload`. Flushes the residual buffer first.
    pub fn send(&mut self, payload: &[u8], mode: SendMode, required: bool) -> SendStatus {
        if self.flush_buffer(mode) {
            if self.socket.is_none() {
                return SendStatus::Closed;
            }
            if !required {
                return SendStatus::Busy;
            }
            return self.store_required(payload);
        }

        let mut sent = 0usize;
        loop {
            let remaining = &payload[sent..];
            if remaining.is_empty() {
                return SendStatus::Ok;
            }

            match self.raw_send(remaining, mode) {
                Ok(n) => {
                    sent += n;
                }
                Err(RawSendError::WouldBlock) => {
                    if mode == SendMode::Blocking {
                        continue;
                    }
                    if sent == 0 && !required {
                        return SendStatus::Busy;
                    }
                    return self.store_required(&payload[sent..]);
                }
                Err(RawSendError::Fatal(e)) => {
                    warn!(address = %self.address, port = %self.port, error = %e, "connection closed");
                    self.close();
                    return SendStatus::Closed;
                }
            }
        }
    }

    fn store_required(&mut self, remaining: &[u8]) -> SendStatus {
        if self.buffer_store(remaining).is_err() {
            warn!(
                address = %self.address, port = %self.port,
                "unable to buffer a required message, closing connection to avoid corrupt framing"
            );
            self.close();
            return SendStatus::Closed;
        }
        SendStatus::Ok
    }

    fn store_required_iov(&mut self, iov: &[IoSlice<'_>], offset: usize) -> SendStatus {
        if self.buffer_store_iov(iov, offset).is_err() {
            warn!(
                address = %self.address, port = %self.port,
                "unable to buffer a required vectored message, closing connection"
            );
            self.close();
            return SendStatus::Closed;
        }
        SendStatus::Ok
    }

    /// Sends a scatter/gather payload with `sendmsg`. On a partial write the
    /// remaining bytes are copied into the residual buffer as one
    /// contiguous block (no second `sendmsg` with adjusted iovecs).
    pub fn send_vectored(&mut self, iov: &[IoSlice<'_>], mode: SendMode, required: bool) -> SendStatus {
        if self.flush_buffer(mode) {
            if self.socket.is_none() {
                return SendStatus::Closed;
            }
            if !required {
                return SendStatus::Busy;
            }
            return self.store_required_iov(iov, 0);
        }

        let total: usize = iov.iter().map(|s| s.len()).sum();

        loop {
            match self.raw_sendmsg(iov, mode) {
                Ok(sent) => {
                    if sent == total {
                        return SendStatus::Ok;
                    }
                    debug!(sent, total, "packet partially sent");
                    return self.store_required_iov(iov, sent);
                }
                Err(RawSendError::WouldBlock) => {
                    if mode == SendMode::Blocking {
                        continue;
                    }
                    if !required {
                        return SendStatus::Busy;
                    }
                    return self.store_required_iov(iov, 0);
                }
                Err(RawSendError::Fatal(e)) => {
                    warn!(address = %self.address, port = %self.port, error = %e, "connection closed");
                    self.close();
                    return SendStatus::Closed;
                }
            }
        }
    }
}

enum RawSendError {
    WouldBlock,
    Fatal(io::Error),
}
