use std::fs::{self, File};
use std::io::{BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use anyhow::{anyhow, Context, Result};

use crate::decoding::{last_n_chars, resolve_ffmpeg, FfmpegMode, SoundFrame, AUDIO_SAMPLE_RATE};
use crate::framebuffer::Framebuffer;
use crate::picture::Picture;
use crate::scheduler::Frame;

/// Human-viewable side artifacts, fed once per displayed tick with the
/// committed screen state. Previews are best-effort: the fan drops a
/// writer that errors and the encode carries on.
pub trait PreviewWriter {
    fn describe(&self) -> &'static str;

    fn write_frame(&mut self, image: &Picture, audio: &SoundFrame) -> Result<()>;

    fn finish(self: Box<Self>) -> Result<()>;
}

pub struct NullPreview;

impl PreviewWriter for NullPreview {
    fn describe(&self) -> &'static str {
        "null"
    }

    fn write_frame(&mut self, _image: &Picture, _audio: &SoundFrame) -> Result<()> {
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

pub fn save_picture_png(path: &Path, image: &Picture) -> Result<()> {
    let gray = image::GrayImage::from_raw(
        image.width() as u32,
        image.height() as u32,
        image.to_luma8(),
    )
    .ok_or_else(|| anyhow!("picture buffer does not match its dimensions"))?;
    gray.save(path)
        .with_context(|| format!("failed to write {}", path.display()))
}

pub fn save_framebuffer_png(path: &Path, fb: &Framebuffer) -> Result<()> {
    save_picture_png(path, &fb.to_picture())
}

/// Numbered PNGs of every third tick, roughly 20 images per second of
/// movie. Enough to eyeball pacing without drowning the directory.
pub struct PngSequencePreview {
    dir: PathBuf,
    ticks_seen: u64,
    written: u64,
}

impl PngSequencePreview {
    pub fn create(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create preview directory {}", dir.display()))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            ticks_seen: 0,
            written: 0,
        })
    }
}

impl PreviewWriter for PngSequencePreview {
    fn describe(&self) -> &'static str {
        "png sequence"
    }

    fn write_frame(&mut self, image: &Picture, _audio: &SoundFrame) -> Result<()> {
        if self.ticks_seen % 3 == 0 {
            let path = self.dir.join(format!("preview-{:06}.png", self.written));
            save_picture_png(&path, image)?;
            self.written += 1;
        }
        self.ticks_seen += 1;
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

/// A watchable media file: tick frames stream into an ffmpeg child at
/// 60 fps while audio spools raw next to the output, then a second ffmpeg
/// pass muxes the two. Silent movies skip the spool and the second pass.
pub struct FfmpegPreview {
    sender: Option<mpsc::SyncSender<Vec<u8>>>,
    worker: Option<JoinHandle<Result<()>>>,
    ffmpeg: PathBuf,
    out_path: PathBuf,
    video_path: PathBuf,
    audio_path: Option<PathBuf>,
    audio_spool: Option<BufWriter<File>>,
}

impl FfmpegPreview {
    pub fn spawn(
        out_path: &Path,
        width: usize,
        height: usize,
        silent: bool,
        mode: FfmpegMode,
    ) -> Result<Self> {
        let (ffmpeg, _) = resolve_ffmpeg(mode)?;
        let video_path = if silent {
            out_path.to_path_buf()
        } else {
            tmp_sibling(out_path, ".video.tmp")
        };
        let (audio_path, audio_spool) = if silent {
            (None, None)
        } else {
            let path = tmp_sibling(out_path, ".audio.tmp");
            let spool = BufWriter::new(File::create(&path).with_context(|| {
                format!("failed to create preview audio spool {}", path.display())
            })?);
            (Some(path), Some(spool))
        };

        let (sender, receiver) = mpsc::sync_channel::<Vec<u8>>(4);
        let worker_ffmpeg = ffmpeg.clone();
        let worker_out = video_path.clone();
        let size = format!("{width}x{height}");
        let worker = thread::Builder::new()
            .name("flimc-preview-encoder".to_owned())
            .spawn(move || encode_video_stream(&worker_ffmpeg, receiver, &size, &worker_out))
            .context("failed to spawn preview writer thread")?;

        Ok(Self {
            sender: Some(sender),
            worker: Some(worker),
            ffmpeg,
            out_path: out_path.to_path_buf(),
            video_path,
            audio_path,
            audio_spool,
        })
    }
}

fn tmp_sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(suffix);
    PathBuf::from(os)
}

fn encode_video_stream(
    ffmpeg: &Path,
    receiver: mpsc::Receiver<Vec<u8>>,
    size: &str,
    output: &Path,
) -> Result<()> {
    let args = vec![
        "-hide_banner".to_owned(),
        "-y".to_owned(),
        "-loglevel".to_owned(),
        "error".to_owned(),
        "-f".to_owned(),
        "rawvideo".to_owned(),
        "-pix_fmt".to_owned(),
        "gray".to_owned(),
        "-s".to_owned(),
        size.to_owned(),
        "-r".to_owned(),
        "60".to_owned(),
        "-i".to_owned(),
        "-".to_owned(),
        "-an".to_owned(),
        "-pix_fmt".to_owned(),
        "yuv420p".to_owned(),
        output.to_string_lossy().into_owned(),
    ];
    let mut child = Command::new(ffmpeg)
        .args(args.iter().map(String::as_str))
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|error| {
            if error.kind() == ErrorKind::NotFound {
                anyhow!(
                    "ffmpeg executable not found ({}). Install ffmpeg or rebuild with `--features sidecar_ffmpeg`.",
                    ffmpeg.display()
                )
            } else {
                anyhow!(
                    "failed to spawn preview encoder (args='{}'): {error}",
                    args.join(" ")
                )
            }
        })?;

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| anyhow!("failed to capture ffmpeg stdin"))?;
    let mut stderr_pipe = child.stderr.take();

    while let Ok(frame) = receiver.recv() {
        stdin
            .write_all(&frame)
            .context("failed to write frame to ffmpeg stdin")?;
    }

    stdin.flush().context("failed to flush ffmpeg stdin")?;
    drop(stdin);

    let status = child.wait().context("failed waiting for ffmpeg process")?;
    let stderr_tail = read_stderr_tail(&mut stderr_pipe)?;
    if !status.success() {
        return Err(anyhow!(
            "preview encoder failed with status {status} (args='{}', stderr_tail='{}')",
            args.join(" "),
            stderr_tail
        ));
    }

    Ok(())
}

fn read_stderr_tail(stderr: &mut Option<std::process::ChildStderr>) -> Result<String> {
    let Some(mut pipe) = stderr.take() else {
        return Ok(String::new());
    };
    let mut buf = Vec::new();
    pipe.read_to_end(&mut buf)
        .context("failed reading ffmpeg stderr")?;
    let text = String::from_utf8_lossy(&buf).to_string();
    Ok(last_n_chars(&text, 500))
}

impl PreviewWriter for FfmpegPreview {
    fn describe(&self) -> &'static str {
        "media"
    }

    fn write_frame(&mut self, image: &Picture, audio: &SoundFrame) -> Result<()> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| anyhow!("preview has already been finalized"))?;
        sender
            .send(image.to_luma8())
            .map_err(|_| anyhow!("failed to enqueue preview frame"))?;
        if let Some(spool) = &mut self.audio_spool {
            spool
                .write_all(audio.bytes())
                .context("failed to spool preview audio")?;
        }
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> Result<()> {
        drop(self.sender.take());
        let handle = self
            .worker
            .take()
            .ok_or_else(|| anyhow!("preview worker thread missing"))?;
        match handle.join() {
            Ok(result) => result?,
            Err(_) => return Err(anyhow!("preview worker thread panicked")),
        }

        if let Some(mut spool) = self.audio_spool.take() {
            spool.flush().context("failed to flush preview audio")?;
        }
        let Some(audio_path) = &self.audio_path else {
            return Ok(());
        };

        let output = Command::new(&self.ffmpeg)
            .args(["-hide_banner", "-y", "-loglevel", "error", "-i"])
            .arg(&self.video_path)
            .args(["-f", "u8", "-ar"])
            .arg(AUDIO_SAMPLE_RATE.to_string())
            .args(["-ac", "1", "-i"])
            .arg(audio_path)
            .args(["-map", "0:v", "-map", "1:a", "-c:v", "copy", "-c:a", "aac"])
            .arg(&self.out_path)
            .output()
            .context("failed to run the preview mux pass")?;
        if !output.status.success() {
            return Err(anyhow!(
                "preview mux failed with status {} (stderr_tail='{}')",
                output.status,
                last_n_chars(&String::from_utf8_lossy(&output.stderr), 500)
            ));
        }

        fs::remove_file(&self.video_path).with_context(|| {
            format!("failed to remove preview spool {}", self.video_path.display())
        })?;
        fs::remove_file(audio_path).with_context(|| {
            format!("failed to remove preview spool {}", audio_path.display())
        })?;
        Ok(())
    }
}

/// Fans each tick out to every configured preview. A writer that errors is
/// dropped with a warning; encodes never fail because a preview did.
pub struct PreviewFan {
    writers: Vec<Box<dyn PreviewWriter>>,
}

impl PreviewFan {
    pub fn new(writers: Vec<Box<dyn PreviewWriter>>) -> Self {
        Self { writers }
    }

    pub fn is_empty(&self) -> bool {
        self.writers.is_empty()
    }

    pub fn write_frame(&mut self, image: &Picture, audio: &SoundFrame) {
        let mut index = 0;
        while index < self.writers.len() {
            match self.writers[index].write_frame(image, audio) {
                Ok(()) => index += 1,
                Err(error) => {
                    let writer = self.writers.remove(index);
                    eprintln!("[flimc] {} preview disabled: {error:#}", writer.describe());
                }
            }
        }
    }

    pub fn finish(self) {
        for writer in self.writers {
            let label = writer.describe();
            if let Err(error) = writer.finish() {
                eprintln!("[flimc] {label} preview failed: {error:#}");
            }
        }
    }
}

/// XOR diagnostics written per emitted frame: `diff` shows where the budget
/// left the screen short of the target, `change` what each frame rewrote,
/// `target` the dithered goal itself. Black marks differing pixels.
pub struct DebugDumps {
    diff: Option<PathBuf>,
    change: Option<PathBuf>,
    target: Option<PathBuf>,
    previous: Option<Framebuffer>,
    index: u64,
}

impl DebugDumps {
    pub fn new(
        diff: Option<PathBuf>,
        change: Option<PathBuf>,
        target: Option<PathBuf>,
    ) -> Result<Self> {
        for dir in [&diff, &change, &target].into_iter().flatten() {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create dump directory {}", dir.display()))?;
        }
        Ok(Self {
            diff,
            change,
            target,
            previous: None,
            index: 0,
        })
    }

    pub fn is_active(&self) -> bool {
        self.diff.is_some() || self.change.is_some() || self.target.is_some()
    }

    pub fn record(&mut self, frame: &Frame) -> Result<()> {
        if !self.is_active() {
            return Ok(());
        }
        if let Some(dir) = &self.diff {
            let image = frame.result.xor(&frame.source).inverted();
            save_framebuffer_png(&dir.join(format!("diff-{:06}.png", self.index)), &image)?;
        }
        if let Some(dir) = &self.change {
            let image = match &self.previous {
                Some(previous) => frame.result.xor(previous).inverted(),
                None => frame.result.inverted(),
            };
            save_framebuffer_png(&dir.join(format!("change-{:06}.png", self.index)), &image)?;
        }
        if let Some(dir) = &self.target {
            save_framebuffer_png(&dir.join(format!("target-{:06}.png", self.index)), &frame.source)?;
        }
        self.previous = Some(frame.result.clone());
        self.index += 1;
        Ok(())
    }
}
