use anyhow::{ensure, Context, Result};

use crate::codec::{frame_marker, CodecSpec};
use crate::decoding::{SoundFrame, SOUND_FRAME_BYTES};
use crate::dither::Ditherer;
use crate::framebuffer::Framebuffer;
use crate::picture::Picture;
use crate::subtitle::SubtitleBurner;

/// Tick index of source image `n` on the 60 Hz player clock.
pub fn ticks_from_frame(n: u64, fps: f64) -> u64 {
    (n as f64 / fps * 60.0 + 0.5) as u64
}

/// One container record, ready for the writer.
#[derive(Debug)]
pub struct Frame {
    /// Dithered target the codecs raced toward.
    pub source: Framebuffer,
    pub ticks: usize,
    /// Framed video: 4-byte marker then the winning payload.
    pub video: Vec<u8>,
    /// Exactly `ticks * 370` bytes, or empty for a silent movie.
    pub audio: Vec<u8>,
    /// Screen state after the player applies `video`.
    pub result: Framebuffer,
    pub codec_name: String,
}

/// Turns the 1-bit target stream into timed frame records. Owns the screen
/// state the player will reconstruct, so every budget decision here is
/// against what is actually on screen, not against the previous target.
pub struct FrameScheduler {
    ditherer: Ditherer,
    subtitles: SubtitleBurner,
    codecs: Vec<CodecSpec>,
    committed: Framebuffer,
    fps: f64,
    byterate: usize,
    group: bool,
    silent: bool,
    images_in: u64,
    current_tick: u64,
}

struct RaceWinner {
    payload: Vec<u8>,
    achieved: Framebuffer,
    signature: u8,
    name: String,
    proximity: f64,
}

impl FrameScheduler {
    pub fn new(
        ditherer: Ditherer,
        subtitles: SubtitleBurner,
        codecs: Vec<CodecSpec>,
        fps: f64,
        byterate: usize,
        group: bool,
        silent: bool,
    ) -> Result<Self> {
        ensure!(fps > 0.0, "frame rate {fps} is not positive");
        ensure!(byterate > 0, "byterate must be positive");
        ensure!(!codecs.is_empty(), "at least one codec is required");
        let (width, height) = ditherer.resolution();
        Ok(Self {
            ditherer,
            subtitles,
            codecs,
            committed: Framebuffer::new(width, height),
            fps,
            byterate,
            group,
            silent,
            images_in: 0,
            current_tick: 0,
        })
    }

    pub fn images_in(&self) -> u64 {
        self.images_in
    }

    pub fn current_tick(&self) -> u64 {
        self.current_tick
    }

    /// How many ticks the next image will cover. The driver pulls this many
    /// audio chunks before calling `process_image`, so audio is consumed
    /// strictly in stream order whether or not frames are grouped.
    pub fn ticks_until_next_frame(&self) -> u64 {
        ticks_from_frame(self.images_in + 1, self.fps) - self.current_tick
    }

    /// Encodes one source image into one or more frame records.
    ///
    /// Grouped profiles emit a single record spanning the whole tick gap;
    /// ungrouped profiles emit one record per tick, re-racing the codecs
    /// each time so later ticks refine what the budget cut short.
    pub fn process_image(&mut self, source: &Picture, audio: &[SoundFrame]) -> Result<Vec<Frame>> {
        let timestamp = self.images_in as f64 / self.fps;
        let mut picture = self.ditherer.dither(source);
        self.subtitles.burn_into(&mut picture, timestamp);
        let target = Framebuffer::from_picture(&picture);

        self.images_in += 1;
        let next_tick = ticks_from_frame(self.images_in, self.fps);
        ensure!(
            next_tick > self.current_tick,
            "image {} spans zero player ticks at {:.3} images/s (the player clock runs at 60 ticks/s)",
            self.images_in - 1,
            self.fps
        );
        let span = (next_tick - self.current_tick) as usize;

        let mut frames = Vec::new();
        let mut cursor = 0usize;
        if self.group {
            frames.push(self.emit_frame(&target, span, audio, &mut cursor)?);
        } else {
            for _ in 0..span {
                frames.push(self.emit_frame(&target, 1, audio, &mut cursor)?);
            }
        }
        self.current_tick = next_tick;
        Ok(frames)
    }

    fn emit_frame(
        &mut self,
        target: &Framebuffer,
        ticks: usize,
        audio: &[SoundFrame],
        cursor: &mut usize,
    ) -> Result<Frame> {
        let audio_bytes = if self.silent {
            Vec::new()
        } else {
            let mut bytes = Vec::with_capacity(ticks * SOUND_FRAME_BYTES);
            for _ in 0..ticks {
                match audio.get(*cursor) {
                    Some(chunk) => bytes.extend_from_slice(chunk.bytes()),
                    None => bytes.extend_from_slice(SoundFrame::silence().bytes()),
                }
                *cursor += 1;
            }
            bytes
        };

        let winner = self.run_race(target, self.byterate * ticks)?;
        let mut video = frame_marker(winner.signature).to_vec();
        video.extend_from_slice(&winner.payload);
        self.committed = winner.achieved.clone();

        Ok(Frame {
            source: target.clone(),
            ticks,
            video,
            audio: audio_bytes,
            result: winner.achieved,
            codec_name: winner.name,
        })
    }

    /// Runs every codec from the committed screen state and keeps the one
    /// that lands closest to the target. Ties go to the earlier codec in
    /// the profile list.
    fn run_race(&self, target: &Framebuffer, budget: usize) -> Result<RaceWinner> {
        let mut best: Option<RaceWinner> = None;
        for spec in &self.codecs {
            let mut work = self.committed.clone();
            let allowance = (budget as f64 * spec.penalty) as usize;
            let payload = spec.codec.encode(&mut work, target, allowance);
            let proximity = work.proximity(target);
            debug_assert!((0.0..=1.0).contains(&proximity));
            let better = match &best {
                Some(current) => proximity > current.proximity,
                None => true,
            };
            if better {
                best = Some(RaceWinner {
                    payload,
                    achieved: work,
                    signature: spec.signature,
                    name: spec.name.clone(),
                    proximity,
                });
            }
        }
        best.context("no codecs configured")
    }
}
