use std::fs;
use std::path::Path;

use anyhow::Result;
use tempfile::tempdir;

use flimc::codec::make_codec;
use flimc::container::{check_container, ContainerSummary, ContainerWriter, POSTER_BYTES};
use flimc::dither::{poster_framebuffer, DitherMode, DitherSettings, Ditherer};
use flimc::picture::Picture;
use flimc::scheduler::FrameScheduler;
use flimc::subtitle::SubtitleBurner;

const WIDTH: usize = 32;
const HEIGHT: usize = 24;
const BYTERATE: usize = 64;
const IMAGES: usize = 5;

/// 20 images/s puts every image on a 3-tick span exactly.
const FPS: f64 = 20.0;

fn moving_gradient(frame: usize) -> Picture {
    let mut out = Picture::new(WIDTH, HEIGHT);
    for y in 0..HEIGHT {
        for x in 0..WIDTH {
            let value = ((x + frame * 3) % WIDTH) as f32 / WIDTH as f32;
            out.set(x, y, value);
        }
    }
    out
}

fn build_scheduler(silent: bool) -> Result<FrameScheduler> {
    let ditherer = Ditherer::new(&DitherSettings {
        width: WIDTH,
        height: HEIGHT,
        bars: false,
        filters: String::new(),
        mode: DitherMode::Ordered,
        kernel: "floyd".to_owned(),
        stability: 0.0,
        bleed: 1.0,
        bidi: false,
        watermark: String::new(),
    })?;
    let codecs = vec![
        make_codec("null", WIDTH, HEIGHT)?,
        make_codec("z16", WIDTH, HEIGHT)?,
        make_codec("z32", WIDTH, HEIGHT)?,
        make_codec("lines:count=8", WIDTH, HEIGHT)?,
        make_codec("invert", WIDTH, HEIGHT)?,
    ];
    FrameScheduler::new(
        ditherer,
        SubtitleBurner::new(Vec::new()),
        codecs,
        FPS,
        BYTERATE,
        true,
        silent,
    )
}

fn encode_clip(path: &Path, silent: bool, comment: &str) -> Result<ContainerSummary> {
    let mut scheduler = build_scheduler(silent)?;
    let mut writer = ContainerWriter::create(path, comment, WIDTH, HEIGHT, silent, BYTERATE)?;
    let mut poster_source = None;
    for index in 0..IMAGES {
        let image = moving_gradient(index);
        if poster_source.is_none() {
            poster_source = Some(image.clone());
        }
        for frame in scheduler.process_image(&image, &[])? {
            writer.write_frame(&frame)?;
        }
    }
    let poster = poster_framebuffer(
        &poster_source.expect("at least one image"),
        "",
        DitherMode::Ordered,
        "floyd",
        1.0,
        false,
    )?;
    writer.finish(&poster)
}

#[test]
fn encoded_container_passes_verification() {
    let dir = tempdir().expect("tempdir should create");
    let path = dir.path().join("clip.flim");
    let summary = encode_clip(&path, false, "roundtrip").expect("encode should succeed");

    let check = check_container(&path).expect("container should verify");
    assert_eq!(check.width as usize, WIDTH);
    assert_eq!(check.height as usize, HEIGHT);
    assert!(!check.silent);
    assert_eq!(check.comment, "roundtrip");
    assert_eq!(check.frames, summary.frames);
    assert_eq!(check.frames as usize, IMAGES, "grouped encode emits one record per image");
    assert_eq!(check.ticks, 3 * IMAGES as u64);
    assert_eq!(check.byterate as usize, BYTERATE);
    assert_eq!(check.checksum, summary.checksum);

    let wins: u64 = check.records_by_codec.values().sum();
    assert_eq!(wins, u64::from(check.frames), "every record has a codec");
}

#[test]
fn section_sizes_add_up_to_the_file() {
    let dir = tempdir().expect("tempdir should create");
    let path = dir.path().join("clip.flim");
    let summary = encode_clip(&path, false, "sizes").expect("encode should succeed");

    let on_disk = fs::metadata(&path).expect("metadata should read").len();
    assert_eq!(on_disk, summary.file_len);
    assert_eq!(
        summary.file_len,
        1068 + 16 + summary.movie_len + summary.toc_len + summary.poster_len,
        "comment+header, global, movie, toc, poster"
    );
    assert_eq!(summary.toc_len, u64::from(summary.frames) * 2);
    assert_eq!(summary.poster_len as usize, POSTER_BYTES);
}

#[test]
fn silent_clip_drops_exactly_the_audio_blocks() {
    let dir = tempdir().expect("tempdir should create");
    let sound_path = dir.path().join("sound.flim");
    let silent_path = dir.path().join("silent.flim");
    let sound = encode_clip(&sound_path, false, "x").expect("sound encode");
    let silent = encode_clip(&silent_path, true, "x").expect("silent encode");

    let check = check_container(&silent_path).expect("silent container should verify");
    assert!(check.silent);
    assert_eq!(check.frames, sound.frames);

    // A 3-tick sound block is 2+2+4+1110 bytes where the silent marker is 2.
    let per_record = (3 * 370 + 8 - 2) as u64;
    assert_eq!(
        sound.movie_len - silent.movie_len,
        u64::from(sound.frames) * per_record
    );
}

#[test]
fn encoding_is_deterministic() {
    let dir = tempdir().expect("tempdir should create");
    let first_path = dir.path().join("first.flim");
    let second_path = dir.path().join("second.flim");
    encode_clip(&first_path, false, "fixed comment").expect("first encode");
    encode_clip(&second_path, false, "fixed comment").expect("second encode");

    let first = fs::read(&first_path).expect("first should read");
    let second = fs::read(&second_path).expect("second should read");
    assert_eq!(first, second, "same input and comment should encode byte-identically");
}

#[test]
fn corruption_fails_verification() {
    let dir = tempdir().expect("tempdir should create");
    let path = dir.path().join("clip.flim");
    encode_clip(&path, false, "corrupt me").expect("encode should succeed");

    let mut bytes = fs::read(&path).expect("container should read");
    let last = bytes.len() - 1;
    bytes[last] ^= 0xff;
    fs::write(&path, bytes).expect("container should rewrite");

    let error = check_container(&path).expect_err("corruption should fail verification");
    assert!(
        format!("{error:#}").contains("checksum mismatch"),
        "unexpected error: {error:#}"
    );
}
