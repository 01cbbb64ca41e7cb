//! Producer-side connection to the capture broker.
//!
//! One connection per process. `QueuePresentKHR` calls `update()` every
//! frame; the pacer keeps the actual connect attempt and liveness probe to
//! roughly one in sixty presents so a disconnected broker costs nothing at
//! frame rate.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::{Mutex, MutexGuard};

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::socket::{connect, recv, socket, AddressFamily, MsgFlags, SockFlag, SockType, UnixAddr};
use once_cell::sync::Lazy;
use tracing::{info, warn};
use vkcast_wire::{send_client_info, send_texture_info, ApiKind, ClientInfo, TextureInfo, SOCKET_PATH};

const CONNECT_INTERVAL: u32 = 60;

/// Counts calls and fires once every `interval`.
struct Pacer {
    count: u32,
    interval: u32,
}

impl Pacer {
    fn new(interval: u32) -> Self {
        Self { count: 0, interval }
    }

    fn tick(&mut self) -> bool {
        self.count += 1;
        if self.count < self.interval {
            return false;
        }
        self.count = 0;
        true
    }
}

pub struct CaptureSocket {
    conn: Option<OwnedFd>,
    capturing: bool,
    pacer: Pacer,
}

static CAPTURE: Lazy<Mutex<CaptureSocket>> = Lazy::new(|| {
    Mutex::new(CaptureSocket {
        conn: None,
        capturing: false,
        pacer: Pacer::new(CONNECT_INTERVAL),
    })
});

fn lock() -> MutexGuard<'static, CaptureSocket> {
    CAPTURE.lock().unwrap()
}

impl CaptureSocket {
    fn try_connect(&mut self) -> bool {
        let fd = match socket(AddressFamily::Unix, SockType::Stream, SockFlag::SOCK_CLOEXEC, None) {
            Ok(fd) => fd,
            Err(_) => return false,
        };
        let addr = match UnixAddr::new(SOCKET_PATH) {
            Ok(addr) => addr,
            Err(_) => return false,
        };
        if connect(fd.as_raw_fd(), &addr).is_err() {
            return false;
        }
        if let Err(err) = set_nonblocking(fd.as_raw_fd()) {
            warn!("cannot make capture socket nonblocking: {err}");
            return false;
        }

        let hello = ClientInfo::for_current_process(ApiKind::Vulkan);
        if let Err(err) = send_client_info(fd.as_raw_fd(), &hello) {
            warn!("cannot send client info: {err}");
            return false;
        }

        info!("connected to capture broker at {SOCKET_PATH}");
        self.conn = Some(fd);
        true
    }

    fn update(&mut self) {
        if !self.pacer.tick() {
            return;
        }
        if self.conn.is_none() && !self.try_connect() {
            return;
        }
        let Some(conn) = &self.conn else { return };

        // The broker only ever writes the single-byte kick; any readable
        // byte is a wake, EOF or a hard error means the broker went away.
        let mut buf = [0u8; 1];
        match recv(conn.as_raw_fd(), &mut buf, MsgFlags::empty()) {
            Ok(0) => self.conn = None,
            Ok(_) => {}
            Err(Errno::EAGAIN) => {}
            Err(Errno::ECONNRESET) => self.conn = None,
            Err(err) => {
                warn!("capture socket recv error: {err}");
                self.conn = None;
            }
        }
    }
}

fn set_nonblocking(fd: RawFd) -> nix::Result<()> {
    let flags = OFlag::from_bits_retain(fcntl(fd, FcntlArg::F_GETFL)?);
    fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}

/// Paced connect attempt plus liveness probe; called once per present.
pub fn update() {
    lock().update();
}

/// Capturing, but the broker connection is gone: tear down.
pub fn should_stop() -> bool {
    let cap = lock();
    cap.capturing && cap.conn.is_none()
}

/// Connected but not yet exporting: set up the export image.
pub fn should_init() -> bool {
    let cap = lock();
    !cap.capturing && cap.conn.is_some()
}

pub fn ready() -> bool {
    lock().capturing
}

pub fn stop() {
    lock().capturing = false;
}

/// Deliver the export-image description plus its DMA-BUF fd. On success the
/// connection enters the capturing state; on failure it is dropped so the
/// caller unwinds the export image.
pub fn send_texture(info: &TextureInfo, fd: RawFd) -> bool {
    let mut cap = lock();
    let Some(conn) = &cap.conn else { return false };
    match send_texture_info(conn.as_raw_fd(), info, &[fd]) {
        Ok(_) => {
            cap.capturing = true;
            true
        }
        Err(err) => {
            warn!("cannot send texture info: {err}");
            cap.conn = None;
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pacer_fires_once_per_interval() {
        let mut pacer = Pacer::new(60);
        let fired: usize = (0..180).filter(|_| pacer.tick()).count();
        assert_eq!(fired, 3);
    }

    #[test]
    fn pacer_restarts_after_firing() {
        let mut pacer = Pacer::new(3);
        assert!(!pacer.tick());
        assert!(!pacer.tick());
        assert!(pacer.tick());
        assert!(!pacer.tick());
    }
}
