//! Source adapter: surfaces the selected producer's texture to the host's
//! render pipeline.

use std::os::fd::RawFd;

use tracing::{info, warn};
use vkcast_wire::TextureInfo;

use crate::server::CaptureServer;

/// Where the host's graphics stack plugs in: turn a texture description plus
/// its plane descriptors into a GPU texture. The descriptors stay owned by
/// the broker; implementations dup what they need to keep.
pub trait DmabufImporter {
    type Texture;

    fn import(&mut self, info: &TextureInfo, fds: &[RawFd]) -> anyhow::Result<Self::Texture>;
}

#[derive(Clone, Copy, Debug)]
pub struct SourceSettings {
    /// Only meaningful when the host composites a cursor (X11/EGL).
    pub show_cursor: bool,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self { show_cursor: true }
    }
}

/// One video-input source. Selects a single producer, keeps its most recent
/// texture imported, and follows `buf_id` bumps with re-imports.
pub struct CaptureSource<I: DmabufImporter> {
    // Declared before the importer so textures drop first.
    texture: Option<I::Texture>,
    importer: I,
    settings: SourceSettings,
    buf_id: u64,
    client_id: Option<u64>,
    tdata: Option<TextureInfo>,
}

impl<I: DmabufImporter> CaptureSource<I> {
    pub fn new(importer: I, settings: SourceSettings) -> Self {
        Self {
            texture: None,
            importer,
            settings,
            buf_id: 0,
            client_id: None,
            tdata: None,
        }
    }

    pub fn update_settings(&mut self, settings: SourceSettings) {
        self.settings = settings;
    }

    pub fn show_cursor(&self) -> bool {
        self.settings.show_cursor
    }

    pub fn texture(&self) -> Option<&I::Texture> {
        self.texture.as_ref()
    }

    pub fn client_id(&self) -> Option<u64> {
        self.client_id
    }

    pub fn width(&self) -> u32 {
        self.tdata.map_or(0, |t| t.width)
    }

    pub fn height(&self) -> u32 {
        self.tdata.map_or(0, |t| t.height)
    }

    /// Whether rendering should flip the texture vertically.
    pub fn flip(&self) -> bool {
        self.tdata.map_or(false, |t| t.flip)
    }

    /// Host video tick. Under the server mutex: drop state for a vanished
    /// producer, rebuild the texture when its `buf_id` advanced, and when
    /// nothing is selected pick the first producer and kick it awake.
    pub fn video_tick(&mut self, server: &CaptureServer) {
        let shared = server.lock();

        if let Some(client_id) = self.client_id {
            match shared.client_by_id(client_id) {
                None => {
                    self.client_id = None;
                    self.buf_id = 0;
                    self.tdata = None;
                    self.texture = None;
                }
                Some(client) if client.buf_id != self.buf_id => {
                    self.texture = None;
                    if let Some(tdata) = client.tdata {
                        info!(
                            "creating texture from dmabuf {}x{} modifier:{}",
                            tdata.width, tdata.height, tdata.modifier
                        );
                        self.tdata = Some(tdata);
                        let fds = client.plane_fds();
                        match self.importer.import(&tdata, &fds) {
                            Ok(texture) => self.texture = Some(texture),
                            Err(err) => {
                                warn!("could not create texture from dmabuf source: {err:#}");
                            }
                        }
                    }
                    self.buf_id = client.buf_id;
                }
                Some(_) => {}
            }
        }

        if self.client_id.is_none() {
            if let Some(client) = shared.clients.first() {
                // Edge-triggered wake; the byte's value carries no meaning.
                if let Err(err) = nix::unistd::write(&client.stream, b"1") {
                    warn!("socket write error: {err}");
                }
                self.client_id = Some(client.id);
            }
        }
    }
}
