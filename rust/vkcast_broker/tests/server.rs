//! Server-loop tests against real sockets.

use std::io::Read;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use vkcast_broker::{CaptureServer, CaptureSource, DmabufImporter, SourceSettings};
use vkcast_wire::{send_client_info, send_texture_info, ApiKind, ClientInfo, TextureInfo};

fn sock_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("vkcast-test-{}-{}.sock", name, std::process::id()))
}

fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    false
}

/// Records import calls instead of touching a GPU.
#[derive(Clone, Default)]
struct RecordingImporter {
    calls: Arc<Mutex<Vec<(TextureInfo, usize)>>>,
}

impl DmabufImporter for RecordingImporter {
    type Texture = TextureInfo;

    fn import(
        &mut self,
        info: &TextureInfo,
        fds: &[std::os::fd::RawFd],
    ) -> anyhow::Result<TextureInfo> {
        self.calls.lock().unwrap().push((*info, fds.len()));
        Ok(*info)
    }
}

fn connect(server: &CaptureServer) -> UnixStream {
    let stream = UnixStream::connect(server.socket_path()).expect("connect to server");
    stream
        .set_read_timeout(Some(Duration::from_millis(500)))
        .unwrap();
    stream
}

fn read_kick(stream: &mut UnixStream) -> std::io::Result<usize> {
    let mut byte = [0u8; 1];
    stream.read(&mut byte)
}

fn dmabuf_stand_in() -> (OwnedFd, OwnedFd) {
    // Any fd transports over SCM_RIGHTS the same way a dmabuf does.
    nix::unistd::pipe().expect("pipe")
}

#[test]
fn client_info_is_metadata_only() {
    let server = CaptureServer::spawn_at(sock_path("cinfo")).unwrap();
    let mut stream = connect(&server);

    let info = ClientInfo::new(1234, "game", ApiKind::Vulkan);
    send_client_info(stream.as_raw_fd(), &info).unwrap();
    assert!(wait_for(|| server.client_ids().len() == 1));
    let id = server.client_ids()[0];
    assert!(wait_for(|| server.client_description(id).is_some()));
    assert_eq!(server.client_description(id).unwrap(), "game (pid 1234)");

    let importer = RecordingImporter::default();
    let calls = importer.calls.clone();
    let mut source = CaptureSource::new(importer, SourceSettings::default());
    source.video_tick(&server);

    // Selection kicked the client awake, but no texture surfaced.
    assert_eq!(read_kick(&mut stream).unwrap(), 1);
    assert!(source.texture().is_none());
    assert_eq!(source.width(), 0);
    assert!(calls.lock().unwrap().is_empty());
}

#[test]
fn texture_updates_rebuild_and_bump_buf_id() {
    let server = CaptureServer::spawn_at(sock_path("rebuild")).unwrap();
    let mut stream = connect(&server);
    send_client_info(stream.as_raw_fd(), &ClientInfo::new(1, "game", ApiKind::Vulkan)).unwrap();
    assert!(wait_for(|| server.client_ids().len() == 1));

    let importer = RecordingImporter::default();
    let calls = importer.calls.clone();
    let mut source = CaptureSource::new(importer, SourceSettings::default());
    source.video_tick(&server);
    assert_eq!(read_kick(&mut stream).unwrap(), 1);

    let info = TextureInfo::single_plane(1920, 1080, 7680, 0);
    let (_keep, fd) = dmabuf_stand_in();
    send_texture_info(stream.as_raw_fd(), &info, &[fd.as_raw_fd()]).unwrap();

    assert!(wait_for(|| {
        source.video_tick(&server);
        !calls.lock().unwrap().is_empty()
    }));
    assert_eq!(source.width(), 1920);
    assert_eq!(source.height(), 1080);
    assert!(source.texture().is_some());

    // The identical description again still forces a re-import: the broker
    // treats every TextureInfo as a fresh buffer generation.
    let (_keep2, fd2) = dmabuf_stand_in();
    send_texture_info(stream.as_raw_fd(), &info, &[fd2.as_raw_fd()]).unwrap();
    assert!(wait_for(|| {
        source.video_tick(&server);
        calls.lock().unwrap().len() >= 2
    }));

    let calls = calls.lock().unwrap();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].1, 1);
    assert_eq!(calls[1].1, 1);
}

#[test]
fn fd_count_mismatch_drops_the_client() {
    let server = CaptureServer::spawn_at(sock_path("nfd")).unwrap();
    let mut stream = connect(&server);
    send_client_info(stream.as_raw_fd(), &ClientInfo::new(2, "game", ApiKind::Vulkan)).unwrap();
    assert!(wait_for(|| server.client_ids().len() == 1));

    // Claim two planes but attach a single descriptor.
    let mut info = TextureInfo::single_plane(640, 480, 2560, 0);
    info.nfd = 2;
    let (_keep, fd) = dmabuf_stand_in();
    send_texture_info(stream.as_raw_fd(), &info, &[fd.as_raw_fd()]).unwrap();

    assert!(wait_for(|| server.client_ids().is_empty()));
    // The broker closed its end; the producer observes EOF.
    assert!(wait_for(|| matches!(read_kick(&mut stream), Ok(0))));
}

#[test]
fn unknown_discriminant_drops_the_client() {
    let server = CaptureServer::spawn_at(sock_path("disc")).unwrap();
    let stream = connect(&server);
    assert!(wait_for(|| server.client_ids().len() == 1));

    let garbage = [9u8; TextureInfo::SIZE];
    nix::unistd::write(&stream, &garbage).unwrap();

    assert!(wait_for(|| server.client_ids().is_empty()));
}

#[test]
fn selection_fails_over_to_the_next_producer() {
    let server = CaptureServer::spawn_at(sock_path("failover")).unwrap();
    let mut first = connect(&server);
    send_client_info(first.as_raw_fd(), &ClientInfo::new(10, "one", ApiKind::Vulkan)).unwrap();
    assert!(wait_for(|| server.client_ids().len() == 1));
    let mut second = connect(&server);
    send_client_info(second.as_raw_fd(), &ClientInfo::new(11, "two", ApiKind::OpenGl)).unwrap();
    assert!(wait_for(|| server.client_ids().len() == 2));

    let mut source = CaptureSource::new(RecordingImporter::default(), SourceSettings::default());
    source.video_tick(&server);
    let first_selected = source.client_id().unwrap();
    assert_eq!(read_kick(&mut first).unwrap(), 1);

    drop(first);
    assert!(wait_for(|| server.client_ids().len() == 1));

    assert!(wait_for(|| {
        source.video_tick(&server);
        source.client_id().is_some_and(|id| id != first_selected)
    }));
    assert_eq!(read_kick(&mut second).unwrap(), 1);
}

#[test]
fn reconnect_gets_a_fresh_client_id() {
    let server = CaptureServer::spawn_at(sock_path("reconnect")).unwrap();
    let stream = connect(&server);
    send_client_info(stream.as_raw_fd(), &ClientInfo::new(7, "game", ApiKind::Vulkan)).unwrap();
    assert!(wait_for(|| server.client_ids().len() == 1));
    let old_id = server.client_ids()[0];

    drop(stream);
    assert!(wait_for(|| server.client_ids().is_empty()));

    let stream = connect(&server);
    send_client_info(stream.as_raw_fd(), &ClientInfo::new(7, "game", ApiKind::Vulkan)).unwrap();
    assert!(wait_for(|| server.client_ids().len() == 1));
    assert!(server.client_ids()[0] > old_id);
}

#[test]
fn shutdown_removes_the_socket_file() {
    let path = sock_path("shutdown");
    let server = CaptureServer::spawn_at(&path).unwrap();
    assert!(path.exists());
    drop(server);
    assert!(!path.exists());
}
