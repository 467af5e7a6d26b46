use std::fs;
use std::path::Path;

use anyhow::{anyhow, bail, ensure, Context, Result};
use serde::Deserialize;

use crate::codec::{make_codec, CodecSpec};
use crate::dither::{diffusion_kernel, DitherMode, DitherSettings};
use crate::picture::parse_filter_chain;

pub const PROFILE_NAMES: [&str; 9] = [
    "default", "128k", "512k", "xl", "plus", "portable", "se", "se30", "perfect",
];

/// Every tunable of one encode. Presets are built in code, a profile file
/// overrides them, CLI flags override both.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodingProfile {
    pub width: usize,
    pub height: usize,
    pub byterate: usize,
    pub fps_ratio: u32,
    pub group: bool,
    pub filters: String,
    pub bars: bool,
    pub dither: DitherMode,
    pub stability: f32,
    pub error_algorithm: String,
    pub error_bleed: f32,
    pub error_bidi: bool,
    pub silent: bool,
    pub codecs: Vec<String>,
}

impl Default for EncodingProfile {
    fn default() -> Self {
        Self {
            width: 512,
            height: 342,
            byterate: 2000,
            fps_ratio: 1,
            group: true,
            filters: "c".to_owned(),
            bars: true,
            dither: DitherMode::ErrorDiffusion,
            stability: 0.3,
            error_algorithm: "floyd".to_owned(),
            error_bleed: 1.0,
            error_bidi: false,
            silent: false,
            codecs: vec![
                "null".to_owned(),
                "z32".to_owned(),
                "lines:count=50".to_owned(),
                "invert".to_owned(),
            ],
        }
    }
}

/// Built-in presets tuned per target machine. The low-memory machines trade
/// frame rate and audio for byterate; the 68030 class keeps everything.
pub fn named(name: &str) -> Result<EncodingProfile> {
    let mut profile = EncodingProfile::default();
    match name {
        "default" => {}
        "128k" => {
            profile.byterate = 380;
            profile.filters = "g1.6bbscz".to_owned();
            profile.fps_ratio = 4;
            profile.group = false;
            profile.stability = 0.5;
            profile.dither = DitherMode::Ordered;
            profile.error_bidi = true;
            profile.error_bleed = 0.95;
            profile.codecs = codec_list("lines:count=10");
            profile.silent = true;
        }
        "512k" => {
            profile = named("128k")?;
            profile.byterate = 480;
        }
        "xl" => {
            profile = named("512k")?;
            profile.byterate = 580;
            profile.filters = "g1.6bbsc".to_owned();
            profile.group = true;
        }
        "plus" => {
            profile.byterate = 1500;
            profile.filters = "g1.6bbscz".to_owned();
            profile.fps_ratio = 2;
            profile.group = false;
            profile.stability = 0.5;
            profile.dither = DitherMode::Ordered;
            profile.error_bidi = true;
            profile.error_bleed = 0.95;
            profile.codecs = codec_list("lines:count=30");
        }
        "portable" | "se" => {
            profile.byterate = 2500;
            profile.filters = "g1.6bsc".to_owned();
            profile.fps_ratio = 2;
            profile.group = false;
            profile.stability = 0.5;
            profile.error_bidi = true;
            profile.error_bleed = 0.98;
            profile.codecs = codec_list("lines:count=50");
        }
        "se30" => {
            profile.byterate = 6000;
            profile.filters = "g1.6sc".to_owned();
            profile.bars = false;
            profile.error_bidi = true;
            profile.error_bleed = 0.99;
            profile.codecs = codec_list("lines:count=70");
        }
        "perfect" => {
            profile = named("se30")?;
            profile.byterate = 32000;
            profile.error_bleed = 1.0;
            profile.codecs = codec_list("lines:count=342");
        }
        other => bail!(
            "unknown profile '{other}' (expected one of {})",
            PROFILE_NAMES.join(", ")
        ),
    }
    Ok(profile)
}

fn codec_list(lines: &str) -> Vec<String> {
    vec![
        "null".to_owned(),
        "z32".to_owned(),
        lines.to_owned(),
        "invert".to_owned(),
    ]
}

impl EncodingProfile {
    /// Source frames are decimated by `fps_ratio` before any scheduling.
    pub fn effective_fps(&self, input_fps: f64) -> f64 {
        input_fps / self.fps_ratio as f64
    }

    pub fn build_codecs(&self) -> Result<Vec<CodecSpec>> {
        self.codecs
            .iter()
            .map(|spec| make_codec(spec, self.width, self.height))
            .collect()
    }

    pub fn dither_settings(&self, watermark: &str) -> DitherSettings {
        DitherSettings {
            width: self.width,
            height: self.height,
            bars: self.bars,
            filters: self.filters.clone(),
            mode: self.dither,
            kernel: self.error_algorithm.clone(),
            stability: self.stability,
            bleed: self.error_bleed,
            bidi: self.error_bidi,
            watermark: watermark.to_owned(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.width > 0 && self.height > 0,
            "resolution must be positive, got {}x{}",
            self.width,
            self.height
        );
        ensure!(
            self.width <= u16::MAX as usize && self.height <= u16::MAX as usize,
            "resolution {}x{} does not fit the container header",
            self.width,
            self.height
        );
        ensure!(
            self.byterate >= 1 && self.byterate <= u16::MAX as usize,
            "byterate must be within 1..=65535, got {}",
            self.byterate
        );
        ensure!(self.fps_ratio >= 1, "fps ratio must be at least 1");
        ensure!(
            (0.0..=1.0).contains(&self.stability),
            "error stability must be within 0..=1, got {}",
            self.stability
        );
        ensure!(
            (0.0..=1.0).contains(&self.error_bleed),
            "error bleed must be within 0..=1, got {}",
            self.error_bleed
        );
        parse_filter_chain(&self.filters)?;
        if self.dither == DitherMode::ErrorDiffusion {
            diffusion_kernel(&self.error_algorithm)?;
        }
        ensure!(!self.codecs.is_empty(), "at least one codec is required");
        self.build_codecs()?;
        Ok(())
    }

    /// The flag string that would reproduce this profile, for logs and the
    /// encode report. Error-diffusion knobs only show when they apply.
    pub fn description(&self) -> String {
        let mut parts = vec![
            format!("--byterate {}", self.byterate),
            format!("--fps-ratio {}", self.fps_ratio),
            format!("--group {}", self.group),
            format!("--bars {}", self.bars),
            format!("--dither {}", self.dither.keyword()),
        ];
        if self.dither == DitherMode::ErrorDiffusion {
            parts.push(format!("--error-stability {}", self.stability));
            parts.push(format!("--error-algorithm {}", self.error_algorithm));
            parts.push(format!("--error-bidi {}", self.error_bidi));
            parts.push(format!("--error-bleed {}", self.error_bleed));
        }
        parts.push(format!("--filters {}", self.filters));
        for codec in &self.codecs {
            parts.push(format!("--codec {codec}"));
        }
        parts.push(format!("--silent {}", self.silent));
        parts.join(" ")
    }
}

/// A profile file: any subset of the profile fields, YAML or JSON by
/// extension. Unknown keys are configuration errors, not typo traps.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProfileOverrides {
    pub width: Option<usize>,
    pub height: Option<usize>,
    pub byterate: Option<usize>,
    pub fps_ratio: Option<u32>,
    pub group: Option<bool>,
    pub filters: Option<String>,
    pub bars: Option<bool>,
    pub dither: Option<DitherMode>,
    pub stability: Option<f32>,
    pub error_algorithm: Option<String>,
    pub error_bleed: Option<f32>,
    pub error_bidi: Option<bool>,
    pub silent: Option<bool>,
    pub codecs: Option<Vec<String>>,
}

impl ProfileOverrides {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read profile {}", path.display()))?;
        let is_json = path
            .extension()
            .map(|e| e.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        if is_json {
            serde_json::from_str(&contents)
                .with_context(|| format!("failed to parse json profile {}", path.display()))
        } else {
            serde_yaml::from_str(&contents).map_err(|error| {
                let location = error
                    .location()
                    .map(|location| {
                        format!("line {}, column {}", location.line(), location.column())
                    })
                    .unwrap_or_else(|| "unknown location".to_owned());
                anyhow!(
                    "failed to parse yaml in {} at {}: {}",
                    path.display(),
                    location,
                    error
                )
            })
        }
    }

    pub fn apply(&self, profile: &mut EncodingProfile) {
        if let Some(width) = self.width {
            profile.width = width;
        }
        if let Some(height) = self.height {
            profile.height = height;
        }
        if let Some(byterate) = self.byterate {
            profile.byterate = byterate;
        }
        if let Some(fps_ratio) = self.fps_ratio {
            profile.fps_ratio = fps_ratio;
        }
        if let Some(group) = self.group {
            profile.group = group;
        }
        if let Some(filters) = &self.filters {
            profile.filters = filters.clone();
        }
        if let Some(bars) = self.bars {
            profile.bars = bars;
        }
        if let Some(dither) = self.dither {
            profile.dither = dither;
        }
        if let Some(stability) = self.stability {
            profile.stability = stability;
        }
        if let Some(error_algorithm) = &self.error_algorithm {
            profile.error_algorithm = error_algorithm.clone();
        }
        if let Some(error_bleed) = self.error_bleed {
            profile.error_bleed = error_bleed;
        }
        if let Some(error_bidi) = self.error_bidi {
            profile.error_bidi = error_bidi;
        }
        if let Some(silent) = self.silent {
            profile.silent = silent;
        }
        if let Some(codecs) = &self.codecs {
            profile.codecs = codecs.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_preset_builds_and_validates() {
        for name in PROFILE_NAMES {
            let profile = named(name).expect(name);
            profile.validate().expect(name);
        }
        assert!(named("quadra").is_err());
    }

    #[test]
    fn preset_values_match_their_machines() {
        let p128k = named("128k").expect("128k");
        assert_eq!(p128k.byterate, 380);
        assert_eq!(p128k.fps_ratio, 4);
        assert!(p128k.silent);
        assert_eq!(p128k.dither, DitherMode::Ordered);
        assert!(p128k.codecs.contains(&"lines:count=10".to_owned()));

        let xl = named("xl").expect("xl");
        assert_eq!(xl.byterate, 580);
        assert!(xl.group);
        assert!(xl.silent, "xl inherits the silent 128k base");

        assert_eq!(named("se").expect("se"), named("portable").expect("portable"));

        let perfect = named("perfect").expect("perfect");
        assert_eq!(perfect.byterate, 32000);
        assert_eq!(perfect.error_bleed, 1.0);
        assert!(!perfect.bars);
        assert!(perfect.codecs.contains(&"lines:count=342".to_owned()));
    }

    #[test]
    fn effective_fps_divides_by_the_ratio() {
        let mut profile = EncodingProfile::default();
        profile.fps_ratio = 4;
        assert_eq!(profile.effective_fps(24.0), 6.0);
    }

    #[test]
    fn description_is_a_reproducible_flag_string() {
        let profile = EncodingProfile::default();
        assert_eq!(
            profile.description(),
            "--byterate 2000 --fps-ratio 1 --group true --bars true --dither error \
             --error-stability 0.3 --error-algorithm floyd --error-bidi false --error-bleed 1 \
             --filters c --codec null --codec z32 --codec lines:count=50 --codec invert \
             --silent false"
        );
        let ordered = named("128k").expect("128k");
        assert!(!ordered.description().contains("--error-stability"));
    }

    #[test]
    fn overrides_layer_on_top_of_presets() {
        let overrides = ProfileOverrides {
            byterate: Some(999),
            codecs: Some(vec!["null".to_owned()]),
            ..ProfileOverrides::default()
        };
        let mut profile = named("se30").expect("se30");
        overrides.apply(&mut profile);
        assert_eq!(profile.byterate, 999);
        assert_eq!(profile.codecs, vec!["null".to_owned()]);
        assert_eq!(profile.filters, "g1.6sc", "untouched fields keep preset values");
    }

    #[test]
    fn profile_files_parse_by_extension() {
        let dir = tempfile::tempdir().expect("tempdir");
        let yaml = dir.path().join("mine.yaml");
        fs::write(&yaml, "byterate: 700\ndither: ordered\n").expect("write yaml");
        let loaded = ProfileOverrides::load(&yaml).expect("yaml");
        assert_eq!(loaded.byterate, Some(700));
        assert_eq!(loaded.dither, Some(DitherMode::Ordered));

        let json = dir.path().join("mine.json");
        fs::write(&json, "{\"silent\": true}").expect("write json");
        let loaded = ProfileOverrides::load(&json).expect("json");
        assert_eq!(loaded.silent, Some(true));

        let bad = dir.path().join("bad.yaml");
        fs::write(&bad, "no_such_knob: 1\n").expect("write bad");
        assert!(ProfileOverrides::load(&bad).is_err());
    }

    #[test]
    fn validation_rejects_misconfiguration() {
        let mut profile = EncodingProfile::default();
        profile.width = 500;
        // z32 needs the width to be a multiple of 32.
        assert!(profile.validate().is_err());

        let mut profile = EncodingProfile::default();
        profile.byterate = 0;
        assert!(profile.validate().is_err());

        let mut profile = EncodingProfile::default();
        profile.filters = "q".to_owned();
        assert!(profile.validate().is_err());

        let mut profile = EncodingProfile::default();
        profile.error_algorithm = "stucki".to_owned();
        assert!(profile.validate().is_err());

        let mut profile = EncodingProfile::default();
        profile.codecs.clear();
        assert!(profile.validate().is_err());
    }
}
