//! Wire protocol shared by the capture layer and the broker.
//!
//! Two fixed-layout little-endian messages travel over a UNIX stream socket,
//! discriminated by their first byte. `TextureInfo` additionally carries the
//! DMA-BUF file descriptors as SCM_RIGHTS ancillary data.

use std::io::IoSlice;
use std::os::fd::RawFd;

use bytes::{Buf, BufMut, BytesMut};
use nix::sys::socket::{sendmsg, ControlMessage, MsgFlags};

/// Rendezvous point. The broker owns the socket file; producers connect.
pub const SOCKET_PATH: &str = "/tmp/obs-vkcapture.sock";

/// A texture is described by at most four memory planes.
pub const MAX_PLANE_FDS: usize = 4;

pub const CLIENT_INFO_TYPE: u8 = 1;
pub const TEXTURE_INFO_TYPE: u8 = 2;

/// DRM sentinel for "no explicit format modifier".
pub const DRM_FORMAT_MOD_INVALID: u64 = 0x00ff_ffff_ffff_ffff;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum WireError {
    #[error("bad message discriminant {0}")]
    BadDiscriminant(u8),
    #[error("message size mismatch (expected {expected}, got {got})")]
    SizeMismatch { expected: usize, got: usize },
    #[error("invalid plane fd count {0}")]
    BadPlaneCount(u8),
    #[error("invalid api kind {0}")]
    BadApiKind(u8),
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApiKind {
    Vulkan = 1,
    OpenGl = 2,
}

impl ApiKind {
    pub fn from_u8(v: u8) -> Result<Self, WireError> {
        match v {
            1 => Ok(ApiKind::Vulkan),
            2 => Ok(ApiKind::OpenGl),
            other => Err(WireError::BadApiKind(other)),
        }
    }
}

/// Producer identity, sent once after connecting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClientInfo {
    pub pid: u32,
    /// Executable basename, NUL-padded.
    pub exe: [u8; 32],
    pub api: ApiKind,
}

impl ClientInfo {
    pub const SIZE: usize = 1 + 4 + 32 + 1;

    pub fn new(pid: u32, exe_name: &str, api: ApiKind) -> Self {
        let mut exe = [0u8; 32];
        let bytes = exe_name.as_bytes();
        let n = bytes.len().min(exe.len() - 1);
        exe[..n].copy_from_slice(&bytes[..n]);
        Self { pid, exe, api }
    }

    /// Identity of the calling process, with the basename from
    /// `/proc/self/comm`.
    pub fn for_current_process(api: ApiKind) -> Self {
        let comm = std::fs::read_to_string("/proc/self/comm").unwrap_or_default();
        Self::new(std::process::id(), comm.trim_end(), api)
    }

    pub fn exe_name(&self) -> &str {
        let end = self.exe.iter().position(|&b| b == 0).unwrap_or(self.exe.len());
        std::str::from_utf8(&self.exe[..end]).unwrap_or("")
    }

    pub fn encode(&self, out: &mut BytesMut) {
        out.put_u8(CLIENT_INFO_TYPE);
        out.put_u32_le(self.pid);
        out.put_slice(&self.exe);
        out.put_u8(self.api as u8);
    }

    pub fn decode(mut bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() != Self::SIZE {
            return Err(WireError::SizeMismatch {
                expected: Self::SIZE,
                got: bytes.len(),
            });
        }
        let disc = bytes.get_u8();
        if disc != CLIENT_INFO_TYPE {
            return Err(WireError::BadDiscriminant(disc));
        }
        let pid = bytes.get_u32_le();
        let mut exe = [0u8; 32];
        bytes.copy_to_slice(&mut exe);
        let api = ApiKind::from_u8(bytes.get_u8())?;
        Ok(Self { pid, exe, api })
    }
}

/// Geometry and memory layout of the exported texture. Accompanied by `nfd`
/// descriptors in the same message's SCM_RIGHTS payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TextureInfo {
    pub width: u32,
    pub height: u32,
    /// DRM FourCC, or zero for "infer from context".
    pub format: u32,
    pub flip: bool,
    pub nfd: u8,
    pub strides: [u32; MAX_PLANE_FDS],
    pub offsets: [u32; MAX_PLANE_FDS],
    pub modifier: u64,
    /// X11 window id for cursor overlay, or zero.
    pub winid: u32,
}

impl TextureInfo {
    pub const SIZE: usize = 1 + 4 + 4 + 4 + 1 + 1 + 16 + 16 + 8 + 4;

    /// A single linear plane with no explicit modifier.
    pub fn single_plane(width: u32, height: u32, stride: u32, offset: u32) -> Self {
        let mut strides = [0u32; MAX_PLANE_FDS];
        let mut offsets = [0u32; MAX_PLANE_FDS];
        strides[0] = stride;
        offsets[0] = offset;
        Self {
            width,
            height,
            format: 0,
            flip: false,
            nfd: 1,
            strides,
            offsets,
            modifier: DRM_FORMAT_MOD_INVALID,
            winid: 0,
        }
    }

    pub fn encode(&self, out: &mut BytesMut) {
        out.put_u8(TEXTURE_INFO_TYPE);
        out.put_u32_le(self.width);
        out.put_u32_le(self.height);
        out.put_u32_le(self.format);
        out.put_u8(self.flip as u8);
        out.put_u8(self.nfd);
        for s in self.strides {
            out.put_u32_le(s);
        }
        for o in self.offsets {
            out.put_u32_le(o);
        }
        out.put_u64_le(self.modifier);
        out.put_u32_le(self.winid);
    }

    pub fn decode(mut bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() != Self::SIZE {
            return Err(WireError::SizeMismatch {
                expected: Self::SIZE,
                got: bytes.len(),
            });
        }
        let disc = bytes.get_u8();
        if disc != TEXTURE_INFO_TYPE {
            return Err(WireError::BadDiscriminant(disc));
        }
        let width = bytes.get_u32_le();
        let height = bytes.get_u32_le();
        let format = bytes.get_u32_le();
        let flip = bytes.get_u8() != 0;
        let nfd = bytes.get_u8();
        if nfd == 0 || nfd as usize > MAX_PLANE_FDS {
            return Err(WireError::BadPlaneCount(nfd));
        }
        let mut strides = [0u32; MAX_PLANE_FDS];
        for s in strides.iter_mut() {
            *s = bytes.get_u32_le();
        }
        let mut offsets = [0u32; MAX_PLANE_FDS];
        for o in offsets.iter_mut() {
            *o = bytes.get_u32_le();
        }
        let modifier = bytes.get_u64_le();
        let winid = bytes.get_u32_le();
        Ok(Self {
            width,
            height,
            format,
            flip,
            nfd,
            strides,
            offsets,
            modifier,
            winid,
        })
    }
}

/// Send a `ClientInfo` over a connected stream socket.
pub fn send_client_info(fd: RawFd, info: &ClientInfo) -> nix::Result<usize> {
    let mut buf = BytesMut::with_capacity(ClientInfo::SIZE);
    info.encode(&mut buf);
    let iov = [IoSlice::new(&buf)];
    sendmsg::<()>(fd, &iov, &[], MsgFlags::MSG_NOSIGNAL, None)
}

/// Send a `TextureInfo` plus its plane descriptors as one SCM_RIGHTS message.
pub fn send_texture_info(fd: RawFd, info: &TextureInfo, fds: &[RawFd]) -> nix::Result<usize> {
    let mut buf = BytesMut::with_capacity(TextureInfo::SIZE);
    info.encode(&mut buf);
    let iov = [IoSlice::new(&buf)];
    let cmsg = [ControlMessage::ScmRights(fds)];
    sendmsg::<()>(fd, &iov, &cmsg, MsgFlags::MSG_NOSIGNAL, None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mod_invalid_matches_drm_fourcc() {
        assert_eq!(
            DRM_FORMAT_MOD_INVALID,
            u64::from(drm_fourcc::DrmModifier::Invalid)
        );
    }

    #[test]
    fn client_info_layout() {
        let info = ClientInfo::new(4242, "vkcube", ApiKind::Vulkan);
        let mut buf = BytesMut::new();
        info.encode(&mut buf);
        assert_eq!(buf.len(), ClientInfo::SIZE);
        assert_eq!(buf[0], CLIENT_INFO_TYPE);

        let back = ClientInfo::decode(&buf).unwrap();
        assert_eq!(back.pid, 4242);
        assert_eq!(back.exe_name(), "vkcube");
        assert_eq!(back.api, ApiKind::Vulkan);
    }

    #[test]
    fn exe_name_truncates_to_31_bytes() {
        let long = "a".repeat(64);
        let info = ClientInfo::new(1, &long, ApiKind::OpenGl);
        assert_eq!(info.exe_name().len(), 31);
        assert_eq!(info.exe[31], 0);
    }

    #[test]
    fn texture_info_layout() {
        let info = TextureInfo::single_plane(1920, 1080, 7680, 0);
        let mut buf = BytesMut::new();
        info.encode(&mut buf);
        assert_eq!(buf.len(), TextureInfo::SIZE);
        assert_eq!(buf[0], TEXTURE_INFO_TYPE);

        let back = TextureInfo::decode(&buf).unwrap();
        assert_eq!(back, info);
        assert_eq!(back.modifier, DRM_FORMAT_MOD_INVALID);
    }

    #[test]
    fn decode_rejects_wrong_discriminant() {
        let mut buf = BytesMut::new();
        TextureInfo::single_plane(1, 1, 4, 0).encode(&mut buf);
        buf[0] = 9;
        assert_eq!(
            TextureInfo::decode(&buf),
            Err(WireError::BadDiscriminant(9))
        );
        // A texture message is not decodable as client info either.
        buf[0] = TEXTURE_INFO_TYPE;
        assert!(matches!(
            ClientInfo::decode(&buf),
            Err(WireError::SizeMismatch { .. })
        ));
    }

    #[test]
    fn decode_rejects_truncation() {
        let mut buf = BytesMut::new();
        TextureInfo::single_plane(1, 1, 4, 0).encode(&mut buf);
        assert!(matches!(
            TextureInfo::decode(&buf[..buf.len() - 1]),
            Err(WireError::SizeMismatch { .. })
        ));
    }

    #[test]
    fn decode_rejects_bad_plane_count() {
        let mut info = TextureInfo::single_plane(1, 1, 4, 0);
        info.nfd = 5;
        let mut buf = BytesMut::new();
        info.encode(&mut buf);
        assert_eq!(TextureInfo::decode(&buf), Err(WireError::BadPlaneCount(5)));

        info.nfd = 0;
        let mut buf = BytesMut::new();
        info.encode(&mut buf);
        assert_eq!(TextureInfo::decode(&buf), Err(WireError::BadPlaneCount(0)));
    }
}
