use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use vkcast_broker::{CaptureServer, CaptureSource, DmabufImporter, SourceSettings, VulkanImporter};
use vkcast_wire::TextureInfo;

/// Headless capture broker for developing against real producers.
#[derive(Parser, Debug)]
#[command(name = "vkcast-broker", about = "DMA-BUF capture broker")]
struct Args {
    /// Tick period in milliseconds.
    #[arg(long, default_value_t = 16)]
    tick_ms: u64,

    /// Log incoming frames without importing them into Vulkan.
    #[arg(long, default_value_t = false)]
    headless: bool,
}

/// Importer that only records what it would have imported.
struct LogImporter;

impl DmabufImporter for LogImporter {
    type Texture = (u32, u32);

    fn import(&mut self, info: &TextureInfo, fds: &[std::os::fd::RawFd]) -> anyhow::Result<(u32, u32)> {
        info!(
            "frame {}x{} ({} plane fds, modifier {:#x})",
            info.width,
            info.height,
            fds.len(),
            info.modifier
        );
        Ok((info.width, info.height))
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    if !args.headless
        && std::env::var_os("WAYLAND_DISPLAY").is_none()
        && std::env::var_os("DISPLAY").is_none()
    {
        anyhow::bail!("dmabuf capture needs an X11 or Wayland session");
    }

    let server = CaptureServer::spawn()?;
    let period = Duration::from_millis(args.tick_ms.max(1));

    if args.headless {
        run(&server, CaptureSource::new(LogImporter, SourceSettings::default()), period)
    } else {
        let importer = VulkanImporter::new().context("set up dmabuf importer")?;
        run(&server, CaptureSource::new(importer, SourceSettings::default()), period)
    }
}

fn run<I: DmabufImporter>(
    server: &CaptureServer,
    mut source: CaptureSource<I>,
    period: Duration,
) -> anyhow::Result<()> {
    let mut last_client = None;
    let mut last_size = (0u32, 0u32);
    loop {
        source.video_tick(server);
        if source.client_id() != last_client {
            last_client = source.client_id();
            if let Some(desc) = last_client.and_then(|id| server.client_description(id)) {
                info!("capturing {desc}");
            }
        }
        let size = (source.width(), source.height());
        if size != last_size {
            info!("capture size changed to {}x{}", size.0, size.1);
            last_size = size;
        }
        std::thread::sleep(period);
    }
}
