use std::fs::File;
use std::io::{BufReader, ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::sync::OnceLock;
use std::thread::{self, JoinHandle};

use anyhow::{anyhow, bail, ensure, Context, Result};
use regex::Regex;

use crate::picture::Picture;

/// Player audio is u8 mono at 22 200 Hz; one 60 Hz tick is 370 samples.
pub const SOUND_FRAME_BYTES: usize = 370;
pub const AUDIO_SAMPLE_RATE: u32 = 22_200;
pub const SILENCE: u8 = 0x80;

/// One tick worth of audio.
#[derive(Clone)]
pub struct SoundFrame([u8; SOUND_FRAME_BYTES]);

impl SoundFrame {
    pub fn silence() -> Self {
        Self([SILENCE; SOUND_FRAME_BYTES])
    }

    /// Builds a frame from up to 370 bytes; the remainder stays silent.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut data = [SILENCE; SOUND_FRAME_BYTES];
        let n = bytes.len().min(SOUND_FRAME_BYTES);
        data[..n].copy_from_slice(&bytes[..n]);
        Self(data)
    }

    pub fn bytes(&self) -> &[u8; SOUND_FRAME_BYTES] {
        &self.0
    }
}

impl Default for SoundFrame {
    fn default() -> Self {
        Self::silence()
    }
}

/// A source of grayscale images and tick-sized audio chunks. The two
/// streams advance independently; the driver pulls audio by tick count.
pub trait MediaInput {
    fn frame_rate(&self) -> f64;

    /// Next source image, or None at end of stream.
    fn next_image(&mut self) -> Result<Option<Picture>>;

    /// Next 370-byte audio chunk, or None once the track runs out (or the
    /// source never had one). Callers pad with silence.
    fn next_audio_chunk(&mut self) -> Result<Option<SoundFrame>>;

    fn finish(self: Box<Self>) -> Result<()>;
}

/// Which ffmpeg binary to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FfmpegMode {
    #[default]
    Auto,
    System,
    Sidecar,
}

impl FfmpegMode {
    pub fn from_keyword(value: &str) -> Result<Self> {
        match value {
            "auto" => Ok(Self::Auto),
            "system" => Ok(Self::System),
            "sidecar" => Ok(Self::Sidecar),
            other => bail!("unknown ffmpeg mode '{other}' (expected auto, system or sidecar)"),
        }
    }

    pub fn keyword(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::System => "system",
            Self::Sidecar => "sidecar",
        }
    }
}

/// Resolves (ffmpeg, ffprobe) paths for the requested mode. Sidecar mode
/// downloads ffmpeg on first use; ffprobe falls back to the system binary
/// when the sidecar directory carries none.
pub(crate) fn resolve_ffmpeg(mode: FfmpegMode) -> Result<(PathBuf, PathBuf)> {
    match mode {
        FfmpegMode::Auto | FfmpegMode::System => {
            Ok((PathBuf::from("ffmpeg"), PathBuf::from("ffprobe")))
        }
        FfmpegMode::Sidecar => {
            #[cfg(feature = "sidecar_ffmpeg")]
            {
                let ffmpeg = ffmpeg_sidecar::paths::ffmpeg_path();
                if !ffmpeg.exists() {
                    ffmpeg_sidecar::download::auto_download()
                        .context("failed to auto-download ffmpeg sidecar binary")?;
                }
                let sibling = ffmpeg.with_file_name("ffprobe");
                let ffprobe = if sibling.exists() {
                    sibling
                } else {
                    PathBuf::from("ffprobe")
                };
                Ok((ffmpeg, ffprobe))
            }
            #[cfg(not(feature = "sidecar_ffmpeg"))]
            {
                Err(anyhow!(
                    "ffmpeg sidecar mode requested but flimc was built without it. Rebuild with `--features sidecar_ffmpeg`."
                ))
            }
        }
    }
}

struct SourceProbe {
    width: usize,
    height: usize,
    fps: f64,
    has_audio: bool,
}

fn probe_source(ffprobe: &Path, input: &Path) -> Result<SourceProbe> {
    let output = Command::new(ffprobe)
        .args([
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream=width,height,r_frame_rate",
            "-of",
            "csv=p=0",
        ])
        .arg(input)
        .output()
        .map_err(|error| {
            if error.kind() == ErrorKind::NotFound {
                anyhow!(
                    "ffprobe executable not found ({}). Install ffmpeg or feed an image sequence instead.",
                    ffprobe.display()
                )
            } else {
                anyhow!("failed to run ffprobe on {}: {error}", input.display())
            }
        })?;
    if !output.status.success() {
        bail!(
            "ffprobe failed on {} ({}): {}",
            input.display(),
            output.status,
            last_n_chars(&String::from_utf8_lossy(&output.stderr), 500)
        );
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    let line = stdout
        .lines()
        .next()
        .ok_or_else(|| anyhow!("{} has no video stream", input.display()))?;
    let mut fields = line.trim().split(',');
    let width: usize = fields
        .next()
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| anyhow!("unreadable ffprobe width in '{line}'"))?;
    let height: usize = fields
        .next()
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| anyhow!("unreadable ffprobe height in '{line}'"))?;
    let fps = fields
        .next()
        .map(parse_frame_rate)
        .transpose()?
        .ok_or_else(|| anyhow!("unreadable ffprobe frame rate in '{line}'"))?;

    let audio = Command::new(ffprobe)
        .args([
            "-v",
            "error",
            "-select_streams",
            "a:0",
            "-show_entries",
            "stream=codec_type",
            "-of",
            "csv=p=0",
        ])
        .arg(input)
        .output()
        .with_context(|| format!("failed to probe audio of {}", input.display()))?;
    let has_audio = String::from_utf8_lossy(&audio.stdout).contains("audio");

    Ok(SourceProbe {
        width,
        height,
        fps,
        has_audio,
    })
}

// ffprobe reports rates as "30000/1001" or plain "25".
fn parse_frame_rate(text: &str) -> Result<f64> {
    let text = text.trim();
    let rate = match text.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.parse().with_context(|| format!("rate '{text}'"))?;
            let den: f64 = den.parse().with_context(|| format!("rate '{text}'"))?;
            ensure!(den != 0.0, "rate '{text}' divides by zero");
            num / den
        }
        None => text.parse().with_context(|| format!("rate '{text}'"))?,
    };
    ensure!(rate > 0.0, "rate '{text}' is not positive");
    Ok(rate)
}

/// Scales so the smaller source dimension fills the profile; the ditherer
/// crops or letterboxes from there.
fn cover_dimensions(
    src_width: usize,
    src_height: usize,
    target_width: usize,
    target_height: usize,
) -> (usize, usize) {
    let aspect = src_width as f64 / src_height as f64;
    let target_aspect = target_width as f64 / target_height as f64;
    if aspect > target_aspect {
        (
            ((target_height as f64 * aspect).round() as usize).max(1),
            target_height,
        )
    } else {
        (
            target_width,
            ((target_width as f64 / aspect).round() as usize).max(1),
        )
    }
}

/// Streaming ffmpeg decode: one child per stream, each drained by a named
/// reader thread into a small bounded channel so decode keeps pace with
/// the encoder instead of buffering the whole movie.
pub struct FfmpegInput {
    fps: f64,
    frame_width: usize,
    frame_height: usize,
    video: mpsc::Receiver<Vec<u8>>,
    audio: Option<mpsc::Receiver<SoundFrame>>,
    children: Vec<Child>,
    workers: Vec<JoinHandle<Result<()>>>,
}

impl FfmpegInput {
    pub fn spawn(
        input: &Path,
        target_width: usize,
        target_height: usize,
        from: Option<f64>,
        duration: Option<f64>,
        mode: FfmpegMode,
    ) -> Result<Self> {
        let (ffmpeg, ffprobe) = resolve_ffmpeg(mode)?;
        let probe = probe_source(&ffprobe, input)?;
        let (frame_width, frame_height) =
            cover_dimensions(probe.width, probe.height, target_width, target_height);

        let mut children = Vec::new();
        let mut workers = Vec::new();

        let mut video_command = Command::new(&ffmpeg);
        video_command.arg("-hide_banner").arg("-loglevel").arg("error");
        push_window_args(&mut video_command, from, duration);
        video_command
            .arg("-i")
            .arg(input)
            .arg("-f")
            .arg("rawvideo")
            .arg("-pix_fmt")
            .arg("gray")
            .arg("-s")
            .arg(format!("{frame_width}x{frame_height}"))
            .arg("-sws_flags")
            .arg("area")
            .arg("-an")
            .arg("-")
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        let mut child = spawn_ffmpeg(video_command, &ffmpeg, mode)?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("failed to capture ffmpeg video stdout"))?;
        children.push(child);

        let frame_size = frame_width * frame_height;
        let (video_sender, video) = mpsc::sync_channel::<Vec<u8>>(4);
        let worker = thread::Builder::new()
            .name("flimc-video-reader".to_owned())
            .spawn(move || {
                loop {
                    let mut buffer = vec![0u8; frame_size];
                    match stdout.read_exact(&mut buffer) {
                        Ok(()) => {
                            if video_sender.send(buffer).is_err() {
                                break;
                            }
                        }
                        Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
                        Err(e) => return Err(anyhow!("failed to read ffmpeg video: {e}")),
                    }
                }
                Ok(())
            })
            .context("failed to spawn video reader thread")?;
        workers.push(worker);

        let audio = if probe.has_audio {
            let mut audio_command = Command::new(&ffmpeg);
            audio_command.arg("-hide_banner").arg("-loglevel").arg("error");
            push_window_args(&mut audio_command, from, duration);
            audio_command
                .arg("-i")
                .arg(input)
                .arg("-vn")
                .arg("-f")
                .arg("u8")
                .arg("-ar")
                .arg(AUDIO_SAMPLE_RATE.to_string())
                .arg("-ac")
                .arg("1")
                .arg("-")
                .stdout(Stdio::piped())
                .stderr(Stdio::inherit());
            let mut child = spawn_ffmpeg(audio_command, &ffmpeg, mode)?;
            let mut stdout = child
                .stdout
                .take()
                .ok_or_else(|| anyhow!("failed to capture ffmpeg audio stdout"))?;
            children.push(child);

            let (audio_sender, audio_receiver) = mpsc::sync_channel::<SoundFrame>(16);
            let worker = thread::Builder::new()
                .name("flimc-audio-reader".to_owned())
                .spawn(move || {
                    loop {
                        let mut buffer = [SILENCE; SOUND_FRAME_BYTES];
                        match read_chunk(&mut stdout, &mut buffer)? {
                            0 => break,
                            _ => {
                                if audio_sender.send(SoundFrame(buffer)).is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Ok(())
                })
                .context("failed to spawn audio reader thread")?;
            workers.push(worker);
            Some(audio_receiver)
        } else {
            None
        };

        Ok(Self {
            fps: probe.fps,
            frame_width,
            frame_height,
            video,
            audio,
            children,
            workers,
        })
    }
}

fn push_window_args(command: &mut Command, from: Option<f64>, duration: Option<f64>) {
    if let Some(from) = from {
        command.arg("-ss").arg(from.to_string());
    }
    if let Some(duration) = duration {
        command.arg("-t").arg(duration.to_string());
    }
}

fn spawn_ffmpeg(mut command: Command, ffmpeg: &Path, mode: FfmpegMode) -> Result<Child> {
    command.spawn().map_err(|error| {
        if error.kind() == ErrorKind::NotFound {
            anyhow!(
                "ffmpeg executable not found (mode={}, resolved_path={}). Install ffmpeg or rebuild with `--features sidecar_ffmpeg`.",
                mode.keyword(),
                ffmpeg.display()
            )
        } else {
            anyhow!("failed to spawn ffmpeg decoder: {error}")
        }
    })
}

// Fills as much of `buffer` as the stream still has; the rest keeps its
// silence fill. Returns the byte count actually read.
fn read_chunk(reader: &mut impl Read, buffer: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        let n = reader
            .read(&mut buffer[filled..])
            .context("failed to read audio stream")?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

impl MediaInput for FfmpegInput {
    fn frame_rate(&self) -> f64 {
        self.fps
    }

    fn next_image(&mut self) -> Result<Option<Picture>> {
        match self.video.recv() {
            Ok(buffer) => Ok(Some(Picture::from_luma8(
                self.frame_width,
                self.frame_height,
                &buffer,
            ))),
            Err(_) => Ok(None),
        }
    }

    fn next_audio_chunk(&mut self) -> Result<Option<SoundFrame>> {
        match &self.audio {
            Some(receiver) => Ok(receiver.recv().ok()),
            None => Ok(None),
        }
    }

    fn finish(mut self: Box<Self>) -> Result<()> {
        for child in &mut self.children {
            let _ = child.kill();
            let _ = child.wait();
        }
        for worker in self.workers.drain(..) {
            match worker.join() {
                Ok(result) => result?,
                Err(_) => bail!("ffmpeg reader thread panicked"),
            }
        }
        Ok(())
    }
}

fn sequence_regex() -> &'static Regex {
    static SEQUENCE_RE: OnceLock<Regex> = OnceLock::new();
    SEQUENCE_RE
        .get_or_init(|| Regex::new(r"%(0?\d*)d").expect("sequence pattern regex should compile"))
}

/// Numbered still images (`frame-%06d.pgm` style, PGM or PNG) plus an
/// optional raw u8 22 200 Hz mono audio file. Numbering starts at 1; the
/// first missing file ends the stream.
pub struct PgmSequenceInput {
    prefix: String,
    suffix: String,
    pad: usize,
    fps: f64,
    next_index: usize,
    audio: Option<BufReader<File>>,
}

impl PgmSequenceInput {
    pub fn new(pattern: &str, fps: f64, audio_path: Option<&Path>) -> Result<Self> {
        ensure!(fps > 0.0, "frame rate {fps} is not positive");
        let m = sequence_regex()
            .find(pattern)
            .with_context(|| format!("pattern '{pattern}' has no %d-style frame number"))?;
        ensure!(
            sequence_regex().find_iter(pattern).count() == 1,
            "pattern '{pattern}' has more than one %d-style frame number"
        );
        let pad = pattern[m.start() + 1..m.end() - 1].parse().unwrap_or(0);
        let audio = match audio_path {
            Some(path) => Some(BufReader::new(File::open(path).with_context(|| {
                format!("failed to open audio track {}", path.display())
            })?)),
            None => None,
        };
        Ok(Self {
            prefix: pattern[..m.start()].to_owned(),
            suffix: pattern[m.end()..].to_owned(),
            pad,
            fps,
            next_index: 1,
            audio,
        })
    }

    fn path_for(&self, index: usize) -> PathBuf {
        PathBuf::from(format!(
            "{}{:0pad$}{}",
            self.prefix,
            index,
            self.suffix,
            pad = self.pad
        ))
    }
}

impl MediaInput for PgmSequenceInput {
    fn frame_rate(&self) -> f64 {
        self.fps
    }

    fn next_image(&mut self) -> Result<Option<Picture>> {
        let path = self.path_for(self.next_index);
        if !path.exists() {
            return Ok(None);
        }
        let img = image::open(&path)
            .with_context(|| format!("failed to decode {}", path.display()))?
            .to_luma8();
        self.next_index += 1;
        Ok(Some(Picture::from_luma8(
            img.width() as usize,
            img.height() as usize,
            img.as_raw(),
        )))
    }

    fn next_audio_chunk(&mut self) -> Result<Option<SoundFrame>> {
        let Some(reader) = &mut self.audio else {
            return Ok(None);
        };
        let mut buffer = [SILENCE; SOUND_FRAME_BYTES];
        if read_chunk(reader, &mut buffer)? == 0 {
            self.audio = None;
            return Ok(None);
        }
        Ok(Some(SoundFrame(buffer)))
    }

    fn finish(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

pub(crate) fn last_n_chars(s: &str, max_chars: usize) -> String {
    let mut chars = s.chars().collect::<Vec<_>>();
    if chars.len() > max_chars {
        chars = chars[chars.len().saturating_sub(max_chars)..].to_vec();
    }
    chars.into_iter().collect::<String>().trim().to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn sound_frame_pads_short_chunks_with_silence() {
        let frame = SoundFrame::from_bytes(&[1, 2, 3]);
        assert_eq!(&frame.bytes()[..3], &[1, 2, 3]);
        assert!(frame.bytes()[3..].iter().all(|&b| b == SILENCE));
        assert_eq!(SoundFrame::silence().bytes()[0], 0x80);
    }

    #[test]
    fn frame_rate_parser_handles_ratios() {
        assert_eq!(parse_frame_rate("25").expect("plain rate"), 25.0);
        let ntsc = parse_frame_rate("30000/1001").expect("ratio rate");
        assert!((ntsc - 29.97).abs() < 0.01);
        assert!(parse_frame_rate("0/1").is_err());
        assert!(parse_frame_rate("x").is_err());
    }

    #[test]
    fn cover_scaling_fills_the_smaller_dimension() {
        // 16:9 into the classic 512x342: height fills, width overshoots.
        let (w, h) = cover_dimensions(1920, 1080, 512, 342);
        assert_eq!(h, 342);
        assert!(w > 512);
        // A tall source fills the width instead.
        let (w, h) = cover_dimensions(480, 640, 512, 342);
        assert_eq!(w, 512);
        assert!(h > 342);
    }

    #[test]
    fn sequence_pattern_formats_indices() {
        let input = PgmSequenceInput::new("frames/shot-%04d.pgm", 12.0, None).expect("pattern");
        assert_eq!(input.path_for(7), PathBuf::from("frames/shot-0007.pgm"));
        let plain = PgmSequenceInput::new("f%d.png", 12.0, None).expect("plain %d");
        assert_eq!(plain.path_for(12), PathBuf::from("f12.png"));
    }

    #[test]
    fn sequence_pattern_must_have_exactly_one_slot() {
        assert!(PgmSequenceInput::new("plain.pgm", 12.0, None).is_err());
        assert!(PgmSequenceInput::new("a%03d-b%d.pgm", 12.0, None).is_err());
        assert!(PgmSequenceInput::new("ok-%d.pgm", 0.0, None).is_err());
    }

    #[test]
    fn sequence_input_reads_numbered_stills_and_audio() {
        let dir = tempfile::tempdir().expect("tempdir");
        for i in 1u8..=2 {
            let mut f =
                File::create(dir.path().join(format!("t-{i:03}.pgm"))).expect("create pgm");
            write!(f, "P5\n2 2\n255\n").expect("header");
            f.write_all(&[i * 10; 4]).expect("pixels");
        }
        let audio_path = dir.path().join("track.raw");
        std::fs::write(&audio_path, vec![0x40u8; SOUND_FRAME_BYTES + 10]).expect("audio");

        let pattern = dir.path().join("t-%03d.pgm");
        let mut input = PgmSequenceInput::new(&pattern.to_string_lossy(), 12.0, Some(&audio_path))
            .expect("input");
        assert_eq!(input.frame_rate(), 12.0);

        let first = input.next_image().expect("read").expect("frame 1");
        assert_eq!((first.width(), first.height()), (2, 2));
        assert!((first.get(0, 0) - 10.0 / 255.0).abs() < 1e-6);
        let second = input.next_image().expect("read").expect("frame 2");
        assert!((second.get(1, 1) - 20.0 / 255.0).abs() < 1e-6);
        assert!(input.next_image().expect("read").is_none(), "stream ends");

        let chunk = input.next_audio_chunk().expect("audio").expect("chunk 1");
        assert!(chunk.bytes().iter().all(|&b| b == 0x40));
        let tail = input.next_audio_chunk().expect("audio").expect("chunk 2");
        assert_eq!(&tail.bytes()[..10], &[0x40; 10]);
        assert!(tail.bytes()[10..].iter().all(|&b| b == SILENCE));
        assert!(input.next_audio_chunk().expect("audio").is_none());
    }
}
