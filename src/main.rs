use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{ensure, Context, Result};
use chrono::Local;
use clap::{Args, Parser, Subcommand};

use flimc::container::{check_container, ContainerWriter};
use flimc::decoding::{
    FfmpegInput, FfmpegMode, MediaInput, PgmSequenceInput, SoundFrame, SOUND_FRAME_BYTES,
};
use flimc::dither::{poster_framebuffer, DitherMode, Ditherer};
use flimc::picture::Picture;
use flimc::preview::{
    save_framebuffer_png, DebugDumps, FfmpegPreview, PngSequencePreview, PreviewFan, PreviewWriter,
};
use flimc::profile::{self, EncodingProfile, ProfileOverrides, PROFILE_NAMES};
use flimc::report::{sha256_hex, EncodeReport, QualityHistogram};
use flimc::scheduler::FrameScheduler;
use flimc::subtitle::{parse_srt_file, SubtitleBurner};

fn long_version() -> String {
    match option_env!("FLIMC_GIT_HASH") {
        Some(hash) => format!("{} ({hash})", env!("CARGO_PKG_VERSION")),
        None => env!("CARGO_PKG_VERSION").to_owned(),
    }
}

#[derive(Debug, Parser)]
#[command(name = "flimc")]
#[command(about = "Encode movies into 1-bit flim animations for vintage Macintosh players")]
#[command(version = long_version())]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Encode a movie or image sequence into a .flim container.
    Encode(EncodeArgs),
    /// List the built-in encoding profiles.
    Profiles,
    /// Verify a .flim container and print its vitals.
    Check { file: PathBuf },
}

#[derive(Debug, Args)]
struct EncodeArgs {
    /// Movie file, or a printf-style pattern (frame-%04d.pgm) for image sequences.
    input: PathBuf,
    /// Output container. Defaults to the input path with a .flim extension.
    #[arg(short = 'o', long = "output")]
    output: Option<PathBuf>,

    /// Built-in profile to start from (see `flimc profiles`).
    #[arg(long)]
    profile: Option<String>,
    /// YAML or JSON file overriding profile fields.
    #[arg(long, value_name = "FILE")]
    profile_file: Option<PathBuf>,

    #[arg(long)]
    width: Option<usize>,
    #[arg(long)]
    height: Option<usize>,
    /// Video payload budget in bytes per tick.
    #[arg(long)]
    byterate: Option<usize>,
    /// Keep one source image out of every N.
    #[arg(long)]
    fps_ratio: Option<u32>,
    /// Merge each image's tick span into a single record.
    #[arg(long)]
    group: Option<bool>,
    /// Pad to the target aspect with black bars instead of cropping.
    #[arg(long)]
    bars: Option<bool>,
    /// Quantization mode: ordered or error.
    #[arg(long, value_parser = DitherMode::from_keyword)]
    dither: Option<DitherMode>,
    /// How strongly settled pixels resist flipping between frames (0..1).
    #[arg(long)]
    error_stability: Option<f32>,
    /// Diffusion kernel: floyd, jarvis or atkinson.
    #[arg(long)]
    error_algorithm: Option<String>,
    /// Fraction of the quantization error carried to neighbors (0..1).
    #[arg(long)]
    error_bleed: Option<f32>,
    /// Serpentine scanning for error diffusion.
    #[arg(long)]
    error_bidi: Option<bool>,
    /// Filter chain applied after resize, for example g1.6bsc.
    #[arg(long)]
    filters: Option<String>,
    /// Codec spec, repeatable. Replaces the profile's whole list.
    #[arg(long = "codec", value_name = "SPEC")]
    codec: Vec<String>,
    /// Drop the audio track.
    #[arg(long)]
    silent: Option<bool>,

    /// Source frame rate. Required for image sequences, overrides ffprobe otherwise.
    #[arg(long)]
    fps: Option<f64>,
    /// Raw unsigned 8-bit 22200 Hz mono track for image sequences.
    #[arg(long, value_name = "FILE")]
    audio: Option<PathBuf>,
    /// Start offset in seconds (ffmpeg inputs only).
    #[arg(long)]
    from: Option<f64>,
    /// Duration in seconds (ffmpeg inputs only).
    #[arg(long)]
    duration: Option<f64>,

    /// Timestamp in seconds of the source image used for the poster.
    #[arg(long, default_value_t = 0.0)]
    poster: f64,
    /// Comment stored in the container header.
    #[arg(long)]
    comment: Option<String>,
    /// Watermark text drawn in the bottom-right corner of every frame.
    #[arg(long, default_value = "")]
    watermark: String,
    /// Burn subtitles from a SubRip file.
    #[arg(long, value_name = "FILE")]
    srt: Option<PathBuf>,
    /// Dump committed frames FROM:TO (inclusive record indexes) as PNGs.
    #[arg(long, value_name = "FROM:TO")]
    cover: Option<String>,

    /// Write result-vs-target XOR images into a directory.
    #[arg(long, value_name = "DIR")]
    dump_diff: Option<PathBuf>,
    /// Write result-vs-previous XOR images into a directory.
    #[arg(long, value_name = "DIR")]
    dump_change: Option<PathBuf>,
    /// Write dithered target images into a directory.
    #[arg(long, value_name = "DIR")]
    dump_target: Option<PathBuf>,

    /// Encode a 60 fps media preview alongside the container.
    #[arg(long, value_name = "FILE")]
    preview: Option<PathBuf>,
    /// Write every third tick as a PNG into a directory.
    #[arg(long, value_name = "DIR")]
    preview_pgm: Option<PathBuf>,
    /// Write a JSON encode report.
    #[arg(long, value_name = "FILE")]
    report: Option<PathBuf>,
    /// Which ffmpeg to run: auto, system or sidecar.
    #[arg(long, value_parser = FfmpegMode::from_keyword, default_value = "auto")]
    ffmpeg: FfmpegMode,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Encode(args) => run_encode(args),
        Commands::Profiles => run_profiles(),
        Commands::Check { file } => run_check(&file),
    }
}

fn run_profiles() -> Result<()> {
    for name in PROFILE_NAMES {
        let profile = profile::named(name)?;
        println!("{name}");
        println!("  {}", profile.description());
    }
    Ok(())
}

fn run_check(path: &Path) -> Result<()> {
    let check = check_container(path)?;

    println!(
        "OK: {} ({}x{}, {} records, {} ticks = {:.1}s, byterate {}, {}, checksum 0x{:04x})",
        path.display(),
        check.width,
        check.height,
        check.frames,
        check.ticks,
        check.ticks as f64 / 60.0,
        check.byterate,
        if check.silent { "silent" } else { "sound" },
        check.checksum
    );
    if !check.comment.is_empty() {
        println!("Comment: {}", check.comment);
    }
    let codecs: Vec<String> = check
        .records_by_codec
        .iter()
        .map(|(name, count)| format!("{name}={count}"))
        .collect();
    println!("Codecs: {}", codecs.join(" "));
    Ok(())
}

fn cli_overrides(args: &EncodeArgs) -> ProfileOverrides {
    ProfileOverrides {
        width: args.width,
        height: args.height,
        byterate: args.byterate,
        fps_ratio: args.fps_ratio,
        group: args.group,
        filters: args.filters.clone(),
        bars: args.bars,
        dither: args.dither,
        stability: args.error_stability,
        error_algorithm: args.error_algorithm.clone(),
        error_bleed: args.error_bleed,
        error_bidi: args.error_bidi,
        silent: args.silent,
        codecs: if args.codec.is_empty() {
            None
        } else {
            Some(args.codec.clone())
        },
    }
}

fn parse_cover_range(spec: &str) -> Result<(u64, u64)> {
    let (from, to) = spec
        .split_once(':')
        .with_context(|| format!("cover range '{spec}' is not FROM:TO"))?;
    let from: u64 = from
        .trim()
        .parse()
        .with_context(|| format!("cover range start '{from}' is not a frame index"))?;
    let to: u64 = to
        .trim()
        .parse()
        .with_context(|| format!("cover range end '{to}' is not a frame index"))?;
    ensure!(from <= to, "cover range {from}:{to} is backwards");
    Ok((from, to))
}

fn default_comment() -> String {
    format!(
        "flim encoded by flimc {} on {}",
        env!("CARGO_PKG_VERSION"),
        Local::now().format("%Y-%m-%d")
    )
}

fn run_encode(args: EncodeArgs) -> Result<()> {
    let mut profile = match &args.profile {
        Some(name) => profile::named(name)?,
        None => EncodingProfile::default(),
    };
    if let Some(path) = &args.profile_file {
        ProfileOverrides::load(path)?.apply(&mut profile);
    }
    cli_overrides(&args).apply(&mut profile);
    profile.validate()?;

    let output = match &args.output {
        Some(path) => path.clone(),
        None => args.input.with_extension("flim"),
    };
    let cover = match &args.cover {
        Some(spec) => Some(parse_cover_range(spec)?),
        None => None,
    };
    let subtitles = match &args.srt {
        Some(path) => SubtitleBurner::new(parse_srt_file(path)?),
        None => SubtitleBurner::new(Vec::new()),
    };

    let pattern = args.input.to_string_lossy().into_owned();
    let mut input: Box<dyn MediaInput> = if pattern.contains('%') {
        ensure!(
            args.from.is_none() && args.duration.is_none(),
            "--from and --duration only apply to ffmpeg inputs"
        );
        let fps = args.fps.context("--fps is required for image sequences")?;
        Box::new(PgmSequenceInput::new(&pattern, fps, args.audio.as_deref())?)
    } else {
        ensure!(
            args.audio.is_none(),
            "--audio only applies to image sequences; ffmpeg inputs carry their own track"
        );
        Box::new(FfmpegInput::spawn(
            &args.input,
            profile.width,
            profile.height,
            args.from,
            args.duration,
            args.ffmpeg,
        )?)
    };

    let input_fps = args.fps.unwrap_or_else(|| input.frame_rate());
    let effective_fps = profile.effective_fps(input_fps);
    ensure!(
        effective_fps <= 60.0,
        "{effective_fps:.3} images/s beats the 60 ticks/s player clock; raise --fps-ratio"
    );

    eprintln!("[flimc] profile: {}", profile.description());
    eprintln!(
        "[flimc] {} at {input_fps:.3} images/s, encoding {effective_fps:.3} images/s",
        args.input.display()
    );

    let ditherer = Ditherer::new(&profile.dither_settings(&args.watermark))?;
    let codecs = profile.build_codecs()?;
    let mut scheduler = FrameScheduler::new(
        ditherer,
        subtitles,
        codecs,
        effective_fps,
        profile.byterate,
        profile.group,
        profile.silent,
    )?;

    let comment = match &args.comment {
        Some(text) => text.clone(),
        None => default_comment(),
    };
    let mut container = ContainerWriter::create(
        &output,
        &comment,
        profile.width,
        profile.height,
        profile.silent,
        profile.byterate,
    )?;

    let mut writers: Vec<Box<dyn PreviewWriter>> = Vec::new();
    if let Some(path) = &args.preview {
        match FfmpegPreview::spawn(path, profile.width, profile.height, profile.silent, args.ffmpeg)
        {
            Ok(preview) => writers.push(Box::new(preview)),
            Err(error) => eprintln!("[flimc] media preview disabled: {error:#}"),
        }
    }
    if let Some(dir) = &args.preview_pgm {
        match PngSequencePreview::create(dir) {
            Ok(preview) => writers.push(Box::new(preview)),
            Err(error) => eprintln!("[flimc] png sequence preview disabled: {error:#}"),
        }
    }
    let mut previews = PreviewFan::new(writers);
    let mut dumps = DebugDumps::new(
        args.dump_diff.clone(),
        args.dump_change.clone(),
        args.dump_target.clone(),
    )?;

    let poster_target = (args.poster * effective_fps).round() as u64;
    let mut poster_source: Option<Picture> = None;
    let mut histogram = QualityHistogram::new();
    let mut codec_wins: BTreeMap<String, u64> = BTreeMap::new();
    let ratio = u64::from(profile.fps_ratio);
    let mut source_index: u64 = 0;
    let mut record_index: u64 = 0;
    let mut last_second: u64 = 0;

    while let Some(image) = input.next_image()? {
        let keep = source_index % ratio == 0;
        source_index += 1;
        if !keep {
            continue;
        }

        if poster_source.is_none() || scheduler.images_in() <= poster_target {
            poster_source = Some(image.clone());
        }

        // Audio is pulled before the image so chunks line up with the ticks
        // this image will cover, whatever the grouping mode.
        let mut chunks = Vec::new();
        if !profile.silent {
            for _ in 0..scheduler.ticks_until_next_frame() {
                match input.next_audio_chunk()? {
                    Some(chunk) => chunks.push(chunk),
                    None => break,
                }
            }
        }

        for frame in scheduler.process_image(&image, &chunks)? {
            histogram.add(frame.result.proximity(&frame.source));
            *codec_wins.entry(frame.codec_name.clone()).or_insert(0) += 1;
            dumps.record(&frame)?;
            if let Some((from, to)) = cover {
                if (from..=to).contains(&record_index) {
                    let path = output.with_extension(format!("cover-{record_index:06}.png"));
                    save_framebuffer_png(&path, &frame.result)?;
                }
            }
            if !previews.is_empty() {
                let image = frame.result.to_picture();
                for tick in 0..frame.ticks {
                    let chunk = if frame.audio.is_empty() {
                        SoundFrame::silence()
                    } else {
                        let start = tick * SOUND_FRAME_BYTES;
                        SoundFrame::from_bytes(&frame.audio[start..start + SOUND_FRAME_BYTES])
                    };
                    previews.write_frame(&image, &chunk);
                }
            }
            container.write_frame(&frame)?;
            record_index += 1;
        }

        let second = scheduler.current_tick() / 60;
        if second > last_second {
            last_second = second;
            eprintln!(
                "[flimc] {second}s encoded | {} images in | {} records | {} ticks",
                scheduler.images_in(),
                container.frames(),
                scheduler.current_tick()
            );
        }
    }
    input.finish()?;

    let poster_source = poster_source.context("the input produced no images")?;
    let poster = poster_framebuffer(
        &poster_source,
        &profile.filters,
        profile.dither,
        &profile.error_algorithm,
        profile.error_bleed,
        profile.error_bidi,
    )?;
    let images_in = scheduler.images_in();
    let summary = container.finish(&poster)?;
    previews.finish();
    histogram.dump();

    println!(
        "Wrote {} ({} bytes, {} records, {} ticks, checksum 0x{:04x})",
        summary.path.display(),
        summary.file_len,
        summary.frames,
        summary.ticks,
        summary.checksum
    );

    if let Some(path) = &args.report {
        let report = EncodeReport {
            input: args.input.display().to_string(),
            output: summary.path.display().to_string(),
            width: profile.width,
            height: profile.height,
            input_fps,
            effective_fps,
            byterate: profile.byterate,
            silent: profile.silent,
            profile: profile.description(),
            images_in,
            records: summary.frames,
            ticks: summary.ticks,
            movie_bytes: summary.movie_len,
            toc_bytes: summary.toc_len,
            poster_bytes: summary.poster_len,
            file_bytes: summary.file_len,
            checksum: format!("0x{:04x}", summary.checksum),
            sha256: sha256_hex(&summary.path)?,
            codec_wins,
            quality: histogram.percentiles(),
            created: Local::now().to_rfc3339(),
        };
        report.write(path)?;
    }
    Ok(())
}
