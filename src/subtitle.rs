use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;

use anyhow::{bail, Context, Result};
use regex::Regex;

use crate::glyphs;
use crate::picture::Picture;

/// One SubRip cue. Times are seconds from the start of the movie.
#[derive(Clone, Debug, PartialEq)]
pub struct SubtitleCue {
    pub start: f64,
    pub stop: f64,
    pub lines: Vec<String>,
}

fn timing_regex() -> &'static Regex {
    static TIMING_RE: OnceLock<Regex> = OnceLock::new();
    TIMING_RE.get_or_init(|| {
        Regex::new(
            r"^(\d{1,2}):(\d{2}):(\d{2})[,.](\d{1,3})\s*-->\s*(\d{1,2}):(\d{2}):(\d{2})[,.](\d{1,3})$",
        )
        .expect("subrip timing regex should compile")
    })
}

pub fn parse_srt_file(path: &Path) -> Result<Vec<SubtitleCue>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read subtitles from {}", path.display()))?;
    parse_srt(&text).with_context(|| format!("failed to parse {}", path.display()))
}

/// Parses SubRip text: cue index, `HH:MM:SS,mmm --> HH:MM:SS,mmm` timing
/// (comma or dot fraction), text lines until a blank line. CRLF endings
/// and a missing index line are tolerated.
pub fn parse_srt(text: &str) -> Result<Vec<SubtitleCue>> {
    let mut cues = Vec::new();
    let mut lines = text.lines().map(|l| l.trim_end_matches('\r')).enumerate();
    while let Some((number, line)) = lines.next() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let timing_line = if !line.contains("-->") && line.chars().all(|c| c.is_ascii_digit()) {
            match lines.next() {
                Some((_, next)) => next.trim(),
                None => bail!("line {}: cue index without a timing line", number + 1),
            }
        } else {
            line
        };
        let caps = timing_regex().captures(timing_line).ok_or_else(|| {
            anyhow::anyhow!("line {}: malformed timing '{timing_line}'", number + 1)
        })?;
        let start = timestamp(&caps, 1);
        let stop = timestamp(&caps, 5);
        let mut text_lines = Vec::new();
        for (_, text_line) in lines.by_ref() {
            let text_line = text_line.trim_end_matches('\r');
            if text_line.trim().is_empty() {
                break;
            }
            text_lines.push(text_line.to_owned());
        }
        cues.push(SubtitleCue {
            start,
            stop,
            lines: text_lines,
        });
    }
    Ok(cues)
}

// The fraction reads as decimal digits: ",5" is half a second, ",500" too.
fn timestamp(caps: &regex::Captures<'_>, first_group: usize) -> f64 {
    let field = |i: usize| -> f64 {
        caps.get(first_group + i)
            .map(|m| m.as_str().parse::<f64>().unwrap_or(0.0))
            .unwrap_or(0.0)
    };
    let frac_digits = caps
        .get(first_group + 3)
        .map(|m| m.as_str().len() as i32)
        .unwrap_or(3);
    field(0) * 3600.0 + field(1) * 60.0 + field(2) + field(3) / 10f64.powi(frac_digits)
}

/// Burns the live cue into dithered frames. Cues must come in
/// non-decreasing start order; once a cue's stop time has passed it is
/// discarded for good, so seeking backwards is not supported.
pub struct SubtitleBurner {
    cues: VecDeque<SubtitleCue>,
}

impl SubtitleBurner {
    pub fn new(cues: Vec<SubtitleCue>) -> Self {
        Self {
            cues: VecDeque::from(cues),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.cues.is_empty()
    }

    /// Overlays the first line of the earliest remaining cue whose window
    /// contains `time`, bottom-centered in outlined terminal glyphs.
    pub fn burn_into(&mut self, image: &mut Picture, time: f64) {
        while let Some(front) = self.cues.front() {
            if time >= front.stop {
                self.cues.pop_front();
                continue;
            }
            if time >= front.start {
                if let Some(line) = front.lines.first() {
                    let x = (image.width() as isize - glyphs::text_width(line) as isize) / 2;
                    let y = image.height() as isize - glyphs::GLYPH_HEIGHT as isize - 10;
                    glyphs::draw_text_outlined(image, x, y, line);
                }
            }
            break;
        }
    }
}
