//! Rendezvous server.
//!
//! One background thread owns the listening socket and every client socket,
//! multiplexed with poll. Clients are producers running the capture layer;
//! each delivers its identity once and a texture description (plus DMA-BUF
//! fds) whenever its export image is (re)created. All client state sits
//! behind one mutex shared with the render-side source adapter.

use std::fs;
use std::io::IoSliceMut;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

use anyhow::Context;
use nix::cmsg_space;
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::socket::{
    accept4, bind, listen, recvmsg, socket, AddressFamily, Backlog, ControlMessageOwned, MsgFlags,
    SockFlag, SockType, UnixAddr,
};
use nix::unistd::close;
use tracing::{debug, error, info};
use vkcast_wire::{
    ClientInfo, TextureInfo, CLIENT_INFO_TYPE, MAX_PLANE_FDS, SOCKET_PATH, TEXTURE_INFO_TYPE,
};

pub(crate) struct ClientRecord {
    pub id: u64,
    pub stream: OwnedFd,
    pub cdata: Option<ClientInfo>,
    pub tdata: Option<TextureInfo>,
    pub buf_fds: [Option<OwnedFd>; MAX_PLANE_FDS],
    pub buf_id: u64,
}

impl ClientRecord {
    /// The raw descriptors of the current texture, one per plane.
    pub fn plane_fds(&self) -> Vec<RawFd> {
        self.buf_fds
            .iter()
            .flatten()
            .map(|fd| fd.as_raw_fd())
            .collect()
    }
}

#[derive(Default)]
pub(crate) struct ServerShared {
    pub clients: Vec<ClientRecord>,
    next_client_id: u64,
    next_buf_id: u64,
}

impl ServerShared {
    pub fn client_by_id(&self, id: u64) -> Option<&ClientRecord> {
        self.clients.iter().find(|c| c.id == id)
    }
}

/// The broker's server half. Dropping it stops the thread and removes the
/// socket file.
pub struct CaptureServer {
    shared: Arc<Mutex<ServerShared>>,
    quit: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    path: PathBuf,
}

impl CaptureServer {
    /// Bind the well-known rendezvous socket and start serving.
    pub fn spawn() -> anyhow::Result<Self> {
        Self::spawn_at(SOCKET_PATH)
    }

    /// Bind at a caller-chosen path. Any stale socket file is replaced.
    pub fn spawn_at(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let _ = fs::remove_file(&path);

        let listener = socket(
            AddressFamily::Unix,
            SockType::Stream,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
            None,
        )
        .context("create listen socket")?;
        let addr = UnixAddr::new(&path).context("socket address")?;
        bind(listener.as_raw_fd(), &addr)
            .with_context(|| format!("bind unix socket to {}", path.display()))?;
        listen(&listener, Backlog::new(1)?)
            .with_context(|| format!("listen on {}", path.display()))?;

        let shared = Arc::new(Mutex::new(ServerShared::default()));
        let quit = Arc::new(AtomicBool::new(false));
        let thread = {
            let shared = shared.clone();
            let quit = quit.clone();
            let path = path.clone();
            std::thread::Builder::new()
                .name("vkcast-server".into())
                .spawn(move || serve(listener, shared, quit, path))
                .context("spawn server thread")?
        };

        info!("capture server listening at {}", path.display());
        Ok(Self {
            shared,
            quit,
            thread: Some(thread),
            path,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.path
    }

    /// Ids of currently connected clients, in accept order.
    pub fn client_ids(&self) -> Vec<u64> {
        self.lock().clients.iter().map(|c| c.id).collect()
    }

    /// Identity a client reported about itself, if it has yet.
    pub fn client_description(&self, id: u64) -> Option<String> {
        let shared = self.lock();
        let cdata = shared.client_by_id(id)?.cdata.as_ref()?;
        Some(format!("{} (pid {})", cdata.exe_name(), cdata.pid))
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ServerShared> {
        self.shared.lock().unwrap()
    }
}

impl Drop for CaptureServer {
    fn drop(&mut self) {
        self.quit.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn serve(listener: OwnedFd, shared: Arc<Mutex<ServerShared>>, quit: Arc<AtomicBool>, path: PathBuf) {
    while !quit.load(Ordering::Relaxed) {
        // Client sockets are owned by `shared` and only removed on this
        // thread, so borrowing their raw fds across one poll is sound.
        let client_fds: Vec<RawFd> = shared
            .lock()
            .unwrap()
            .clients
            .iter()
            .map(|c| c.stream.as_raw_fd())
            .collect();

        let mut pfds = Vec::with_capacity(1 + client_fds.len());
        pfds.push(PollFd::new(listener.as_fd(), PollFlags::POLLIN));
        for &fd in &client_fds {
            pfds.push(PollFd::new(
                unsafe { BorrowedFd::borrow_raw(fd) },
                PollFlags::POLLIN,
            ));
        }

        match poll(&mut pfds, PollTimeout::from(1000u16)) {
            Ok(n) if n > 0 => {}
            Ok(_) => continue,
            Err(Errno::EINTR) => continue,
            Err(err) => {
                error!("poll failed: {err}");
                break;
            }
        }

        let listener_ready = pfds[0].revents().map_or(false, |r| !r.is_empty());
        let ready_clients: Vec<RawFd> = pfds[1..]
            .iter()
            .zip(&client_fds)
            .filter(|(pfd, _)| pfd.revents().map_or(false, |r| !r.is_empty()))
            .map(|(_, &fd)| fd)
            .collect();
        drop(pfds);

        if listener_ready {
            accept_client(&listener, &shared);
        }
        for fd in ready_clients {
            service_client(&shared, fd);
        }
    }

    shared.lock().unwrap().clients.clear();
    drop(listener);
    let _ = fs::remove_file(&path);
}

fn accept_client(listener: &OwnedFd, shared: &Arc<Mutex<ServerShared>>) {
    match accept4(
        listener.as_raw_fd(),
        SockFlag::SOCK_CLOEXEC | SockFlag::SOCK_NONBLOCK,
    ) {
        Ok(fd) => {
            let stream = unsafe { OwnedFd::from_raw_fd(fd) };
            let mut shared = shared.lock().unwrap();
            shared.next_client_id += 1;
            let id = shared.next_client_id;
            shared.clients.push(ClientRecord {
                id,
                stream,
                cdata: None,
                tdata: None,
                buf_fds: Default::default(),
                buf_id: 0,
            });
            info!("capture client {id} connected");
        }
        Err(Errno::EAGAIN | Errno::ECONNABORTED) => {}
        Err(err) => error!("cannot accept on unix socket: {err}"),
    }
}

/// Drain one client socket. Every protocol violation tears the client down,
/// closing any descriptors it just delivered.
fn service_client(shared: &Arc<Mutex<ServerShared>>, fd: RawFd) {
    loop {
        let mut buf = [0u8; TextureInfo::SIZE];
        let mut cmsg_buf = cmsg_space!([RawFd; MAX_PLANE_FDS]);

        let received = {
            let mut iov = [IoSliceMut::new(&mut buf)];
            recvmsg::<()>(fd, &mut iov, Some(&mut cmsg_buf), MsgFlags::empty()).map(|msg| {
                let fds: Vec<RawFd> = match msg.cmsgs() {
                    Ok(cmsgs) => cmsgs
                        .flat_map(|c| match c {
                            ControlMessageOwned::ScmRights(fds) => fds,
                            _ => Vec::new(),
                        })
                        .collect(),
                    Err(_) => Vec::new(),
                };
                (msg.bytes, fds)
            })
        };

        match received {
            Err(Errno::EAGAIN) => break,
            Err(Errno::ECONNRESET) => {
                cleanup_client(shared, fd);
                break;
            }
            Err(err) => {
                error!("socket recv error: {err}");
                cleanup_client(shared, fd);
                break;
            }
            Ok((0, fds)) => {
                close_all(fds);
                cleanup_client(shared, fd);
                break;
            }
            Ok((n, fds)) => match buf[0] {
                CLIENT_INFO_TYPE => {
                    if !fds.is_empty() {
                        close_all(fds);
                        cleanup_client(shared, fd);
                        break;
                    }
                    let Ok(cdata) = ClientInfo::decode(&buf[..n]) else {
                        cleanup_client(shared, fd);
                        break;
                    };
                    let mut shared = shared.lock().unwrap();
                    if let Some(client) = shared.clients.iter_mut().find(|c| c.stream.as_raw_fd() == fd) {
                        info!(
                            "client {}: {} (pid {}, {:?})",
                            client.id,
                            cdata.exe_name(),
                            cdata.pid,
                            cdata.api
                        );
                        client.cdata = Some(cdata);
                    }
                    // One message per wake.
                    break;
                }
                TEXTURE_INFO_TYPE => {
                    let Ok(tdata) = TextureInfo::decode(&buf[..n]) else {
                        close_all(fds);
                        cleanup_client(shared, fd);
                        break;
                    };
                    if fds.len() != tdata.nfd as usize {
                        error!(
                            "client sent {} fds for nfd={}, dropping it",
                            fds.len(),
                            tdata.nfd
                        );
                        close_all(fds);
                        cleanup_client(shared, fd);
                        break;
                    }

                    let mut shared = shared.lock().unwrap();
                    shared.next_buf_id += 1;
                    let buf_id = shared.next_buf_id;
                    if let Some(client) = shared.clients.iter_mut().find(|c| c.stream.as_raw_fd() == fd) {
                        for slot in client.buf_fds.iter_mut() {
                            *slot = None;
                        }
                        for (slot, raw) in client.buf_fds.iter_mut().zip(&fds) {
                            *slot = Some(unsafe { OwnedFd::from_raw_fd(*raw) });
                        }
                        client.tdata = Some(tdata);
                        client.buf_id = buf_id;
                        debug!(
                            "client {}: texture {}x{} buf {}",
                            client.id, tdata.width, tdata.height, buf_id
                        );
                    } else {
                        close_all(fds);
                    }
                }
                other => {
                    error!("unknown message discriminant {other}");
                    close_all(fds);
                    cleanup_client(shared, fd);
                    break;
                }
            },
        }
    }
}

fn cleanup_client(shared: &Arc<Mutex<ServerShared>>, fd: RawFd) {
    let mut shared = shared.lock().unwrap();
    if let Some(pos) = shared
        .clients
        .iter()
        .position(|c| c.stream.as_raw_fd() == fd)
    {
        let client = shared.clients.remove(pos);
        info!("capture client {} disconnected", client.id);
        // Dropping the record closes its socket and every buffer fd.
    }
}

fn close_all(fds: Vec<RawFd>) {
    for fd in fds {
        let _ = close(fd);
    }
}
