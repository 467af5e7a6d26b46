use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process;

const DEFAULT_DIR: &str = "target/fixtures";
const DEFAULT_FRAMES: usize = 48;
const DEFAULT_WIDTH: usize = 64;
const DEFAULT_HEIGHT: usize = 48;
const DEFAULT_FPS: usize = 24;
const SOUND_BYTES_PER_TICK: usize = 370;

fn main() {
    if let Err(error) = run() {
        eprintln!("xtask: {error}");
        process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let mut args = env::args().skip(1);
    let Some(command) = args.next() else {
        print_usage();
        return Ok(());
    };

    match command.as_str() {
        "gen-fixtures" => {
            let mut dir = PathBuf::from(DEFAULT_DIR);
            let mut frames = DEFAULT_FRAMES;
            let mut width = DEFAULT_WIDTH;
            let mut height = DEFAULT_HEIGHT;
            while let Some(arg) = args.next() {
                match arg.as_str() {
                    "--dir" => dir = PathBuf::from(take_value(&mut args, "--dir")?),
                    "--frames" => frames = parse_value(&mut args, "--frames")?,
                    "--width" => width = parse_value(&mut args, "--width")?,
                    "--height" => height = parse_value(&mut args, "--height")?,
                    "--help" | "-h" => {
                        print_gen_fixtures_help();
                        return Ok(());
                    }
                    other => {
                        return Err(format!(
                            "unknown argument '{other}' for 'gen-fixtures' (try: cargo xtask gen-fixtures --help)"
                        ));
                    }
                }
            }
            if frames == 0 || width == 0 || height == 0 {
                return Err("--frames, --width and --height must be positive".to_owned());
            }
            gen_fixtures(&dir, frames, width, height)
        }
        "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => Err(format!(
            "unknown xtask command '{other}' (try: cargo xtask --help)"
        )),
    }
}

fn take_value(args: &mut impl Iterator<Item = String>, flag: &str) -> Result<String, String> {
    args.next().ok_or_else(|| format!("{flag} needs a value"))
}

fn parse_value(args: &mut impl Iterator<Item = String>, flag: &str) -> Result<usize, String> {
    let value = take_value(args, flag)?;
    value
        .parse()
        .map_err(|_| format!("{flag} value '{value}' is not a number"))
}

/// A bright square sliding over a horizontal gradient, plus a sawtooth
/// audio track sized for the whole clip at the suggested frame rate.
fn gen_fixtures(dir: &Path, frames: usize, width: usize, height: usize) -> Result<(), String> {
    fs::create_dir_all(dir)
        .map_err(|error| format!("failed to create {}: {error}", dir.display()))?;

    let side = (height / 3).max(1);
    for index in 1..=frames {
        let mut pixels = vec![0u8; width * height];
        for y in 0..height {
            for x in 0..width {
                pixels[y * width + x] = (x * 255 / width) as u8;
            }
        }
        let left = (index * 2) % width.saturating_sub(side).max(1);
        let top = height / 3;
        for y in top..(top + side).min(height) {
            for x in left..(left + side).min(width) {
                pixels[y * width + x] = 255;
            }
        }
        let path = dir.join(format!("frame-{index:04}.pgm"));
        let mut pgm = format!("P5\n{width} {height}\n255\n").into_bytes();
        pgm.extend_from_slice(&pixels);
        fs::write(&path, pgm)
            .map_err(|error| format!("failed to write {}: {error}", path.display()))?;
    }

    let ticks = frames * 60 / DEFAULT_FPS + 2;
    let mut audio = Vec::with_capacity(ticks * SOUND_BYTES_PER_TICK);
    for sample in 0..ticks * SOUND_BYTES_PER_TICK {
        audio.push((78 + (sample % 50) * 2) as u8);
    }
    let audio_path = dir.join("track.u8");
    fs::write(&audio_path, audio)
        .map_err(|error| format!("failed to write {}: {error}", audio_path.display()))?;

    println!(
        "Wrote {frames} frames ({width}x{height}) and {} ticks of audio to {}",
        ticks,
        dir.display()
    );
    println!(
        "Try: cargo run -- encode '{}/frame-%04d.pgm' --fps {DEFAULT_FPS} --audio {} -o {}/fixture.flim",
        dir.display(),
        audio_path.display(),
        dir.display()
    );
    Ok(())
}

fn print_usage() {
    println!("Usage:");
    println!("  cargo xtask gen-fixtures [--dir DIR] [--frames N] [--width N] [--height N]");
}

fn print_gen_fixtures_help() {
    println!("Write a numbered PGM sequence and a raw u8 audio track for manual encoder runs.");
    println!();
    print_usage();
    println!();
    println!("Options:");
    println!("  --dir DIR     Output directory (default {DEFAULT_DIR})");
    println!("  --frames N    Number of images (default {DEFAULT_FRAMES})");
    println!("  --width N     Image width (default {DEFAULT_WIDTH})");
    println!("  --height N    Image height (default {DEFAULT_HEIGHT})");
}
