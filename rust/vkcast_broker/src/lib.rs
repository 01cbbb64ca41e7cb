//! Consumer-side capture broker.
//!
//! Accepts connections from producers running the capture layer, receives
//! texture descriptions plus DMA-BUF descriptors over the rendezvous socket,
//! and surfaces the selected producer's most recent frame as a GPU texture.

mod server;
mod source;
mod vulkan_import;

pub use server::CaptureServer;
pub use source::{CaptureSource, DmabufImporter, SourceSettings};
pub use vulkan_import::{ImportedTexture, VulkanImporter};
