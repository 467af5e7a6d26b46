#![forbid(unsafe_code)]

pub mod codec;
pub mod container;
pub mod decoding;
pub mod dither;
pub mod framebuffer;
pub mod glyphs;
pub mod picture;
pub mod preview;
pub mod profile;
pub mod report;
pub mod scheduler;
pub mod subtitle;

pub use container::{ContainerSummary, ContainerWriter};
pub use decoding::{MediaInput, SoundFrame};
pub use dither::Ditherer;
pub use framebuffer::Framebuffer;
pub use picture::Picture;
pub use profile::EncodingProfile;
pub use scheduler::{Frame, FrameScheduler};
