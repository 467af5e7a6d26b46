use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::container::{POSTER_HEIGHT, POSTER_WIDTH};
use crate::framebuffer::Framebuffer;
use crate::glyphs;
use crate::picture::{parse_filter_chain, Filter, Picture};

/// How grayscale collapses to 1-bit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DitherMode {
    #[serde(rename = "ordered")]
    Ordered,
    #[serde(rename = "error")]
    ErrorDiffusion,
}

impl DitherMode {
    pub fn from_keyword(value: &str) -> Result<Self> {
        match value {
            "ordered" => Ok(Self::Ordered),
            "error" => Ok(Self::ErrorDiffusion),
            other => bail!("unknown dithering mode '{other}' (expected 'ordered' or 'error')"),
        }
    }

    pub fn keyword(self) -> &'static str {
        match self {
            Self::Ordered => "ordered",
            Self::ErrorDiffusion => "error",
        }
    }
}

/// Error diffusion taps: (dx, dy, weight). dx mirrors on right-to-left rows.
#[derive(Debug)]
pub struct DiffusionKernel {
    pub name: &'static str,
    taps: &'static [(i8, i8, u8)],
    denominator: f32,
}

pub const KERNEL_NAMES: [&str; 3] = ["floyd", "jarvis", "atkinson"];

static FLOYD: DiffusionKernel = DiffusionKernel {
    name: "floyd",
    taps: &[(1, 0, 7), (-1, 1, 3), (0, 1, 5), (1, 1, 1)],
    denominator: 16.0,
};

static JARVIS: DiffusionKernel = DiffusionKernel {
    name: "jarvis",
    taps: &[
        (1, 0, 7),
        (2, 0, 5),
        (-2, 1, 3),
        (-1, 1, 5),
        (0, 1, 7),
        (1, 1, 5),
        (2, 1, 3),
        (-2, 2, 1),
        (-1, 2, 3),
        (0, 2, 5),
        (1, 2, 3),
        (2, 2, 1),
    ],
    denominator: 48.0,
};

static ATKINSON: DiffusionKernel = DiffusionKernel {
    name: "atkinson",
    taps: &[(1, 0, 1), (2, 0, 1), (-1, 1, 1), (0, 1, 1), (1, 1, 1), (0, 2, 1)],
    denominator: 8.0,
};

pub fn diffusion_kernel(name: &str) -> Result<&'static DiffusionKernel> {
    match name {
        "floyd" => Ok(&FLOYD),
        "jarvis" => Ok(&JARVIS),
        "atkinson" => Ok(&ATKINSON),
        other => bail!(
            "unknown error diffusion kernel '{other}' (expected one of: {})",
            KERNEL_NAMES.join(", ")
        ),
    }
}

// Classic 4x4 Bayer matrix; thresholds are (m + 0.5) / 16.
const BAYER_4X4: [[u8; 4]; 4] = [
    [0, 8, 2, 10],
    [12, 4, 14, 6],
    [3, 11, 1, 9],
    [15, 7, 13, 5],
];

/// Everything the Ditherer needs, in plain config form. The profile layer
/// assembles one of these; `Ditherer::new` resolves names into tables.
#[derive(Clone, Debug)]
pub struct DitherSettings {
    pub width: usize,
    pub height: usize,
    pub bars: bool,
    pub filters: String,
    pub mode: DitherMode,
    pub kernel: String,
    pub stability: f32,
    pub bleed: f32,
    pub bidi: bool,
    pub watermark: String,
}

/// Stateful grayscale-to-1-bit stage. Holds the previous output so the
/// stability blend can damp temporal shimmer between frames.
pub struct Ditherer {
    width: usize,
    height: usize,
    bars: bool,
    chain: Vec<Filter>,
    mode: DitherMode,
    kernel: &'static DiffusionKernel,
    stability: f32,
    bleed: f32,
    bidi: bool,
    watermark: String,
    previous: Picture,
}

impl Ditherer {
    pub fn new(settings: &DitherSettings) -> Result<Self> {
        let chain = parse_filter_chain(&settings.filters)?;
        let kernel = match settings.mode {
            DitherMode::ErrorDiffusion => diffusion_kernel(&settings.kernel)?,
            DitherMode::Ordered => &FLOYD,
        };
        Ok(Self {
            width: settings.width,
            height: settings.height,
            bars: settings.bars,
            chain,
            mode: settings.mode,
            kernel,
            stability: settings.stability,
            bleed: settings.bleed,
            bidi: settings.bidi,
            watermark: settings.watermark.clone(),
            previous: Picture::new(settings.width, settings.height),
        })
    }

    pub fn resolution(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    pub fn previous(&self) -> &Picture {
        &self.previous
    }

    /// Full per-frame pipeline: resize, filter, quantize, round the bezel
    /// corners, stamp the watermark. The returned picture is all 0/1
    /// samples and becomes the stability reference for the next call.
    pub fn dither(&mut self, source: &Picture) -> Picture {
        let mut work = source.resized(self.width, self.height, self.bars);
        work.apply_filter_chain(&self.chain);
        let mut out = match self.mode {
            DitherMode::Ordered => ordered_dither(&work),
            DitherMode::ErrorDiffusion => error_diffusion(
                &work,
                &self.previous,
                self.kernel,
                self.stability,
                self.bleed,
                self.bidi,
            ),
        };
        out.round_corners();
        if !self.watermark.is_empty() {
            let x = self.width as isize - glyphs::text_width(&self.watermark) as isize - 4;
            let y = self.height as isize - glyphs::GLYPH_HEIGHT as isize - 4;
            glyphs::draw_text_outlined(&mut out, x, y, &self.watermark);
        }
        self.previous = out.clone();
        out
    }
}

/// Position-dependent thresholding against the Bayer matrix. Stateless.
pub fn ordered_dither(source: &Picture) -> Picture {
    let (width, height) = (source.width(), source.height());
    let mut out = Picture::new(width, height);
    for y in 0..height {
        for x in 0..width {
            let threshold = (BAYER_4X4[y % 4][x % 4] as f32 + 0.5) / 16.0;
            if source.get(x, y) >= threshold {
                out.set(x, y, 1.0);
            }
        }
    }
    out
}

/// Error diffusion with temporal stability. Each sample is first blended
/// with the previous output (`stability` of it; 0 = none), quantized at
/// 0.5, and the scaled residual (`bleed`) is pushed onto unvisited
/// neighbors. `bidi` scans odd rows right-to-left with the kernel
/// mirrored.
pub fn error_diffusion(
    source: &Picture,
    previous: &Picture,
    kernel: &DiffusionKernel,
    stability: f32,
    bleed: f32,
    bidi: bool,
) -> Picture {
    let (width, height) = (source.width(), source.height());
    debug_assert_eq!((previous.width(), previous.height()), (width, height));
    let mut out = Picture::new(width, height);
    let mut error = vec![0.0f32; width * height];
    for y in 0..height {
        let reversed = bidi && y % 2 == 1;
        for step in 0..width {
            let x = if reversed { width - 1 - step } else { step };
            let blended =
                source.get(x, y) * (1.0 - stability) + previous.get(x, y) * stability;
            let value = blended + error[y * width + x];
            let on = value >= 0.5;
            if on {
                out.set(x, y, 1.0);
            }
            let residual = (value - if on { 1.0 } else { 0.0 }) * bleed;
            for &(dx, dy, weight) in kernel.taps {
                let dx = if reversed { -(dx as i32) } else { dx as i32 };
                let nx = x as i32 + dx;
                let ny = y as i32 + dy as i32;
                if nx >= 0 && (nx as usize) < width && (ny as usize) < height {
                    error[ny as usize * width + nx as usize] +=
                        residual * weight as f32 / kernel.denominator;
                }
            }
        }
    }
    out
}

/// Builds the 128x86 poster thumbnail: profile filters, center-crop fit
/// (never bars), one-shot quantization with no temporal carry-over, no
/// bezel mask and no watermark.
pub fn poster_framebuffer(
    source: &Picture,
    filters: &str,
    mode: DitherMode,
    kernel: &str,
    bleed: f32,
    bidi: bool,
) -> Result<Framebuffer> {
    let mut work = source.clone();
    work.apply_filters(filters)?;
    let small = work.resized(POSTER_WIDTH, POSTER_HEIGHT, false);
    let out = match mode {
        DitherMode::Ordered => ordered_dither(&small),
        DitherMode::ErrorDiffusion => {
            let black = Picture::new(POSTER_WIDTH, POSTER_HEIGHT);
            error_diffusion(&small, &black, diffusion_kernel(kernel)?, 0.0, bleed, bidi)
        }
    };
    Ok(Framebuffer::from_picture(&out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::POSTER_BYTES;

    fn flat(width: usize, height: usize, value: f32) -> Picture {
        let mut p = Picture::new(width, height);
        for y in 0..height {
            for x in 0..width {
                p.set(x, y, value);
            }
        }
        p
    }

    fn settings(mode: DitherMode) -> DitherSettings {
        DitherSettings {
            width: 64,
            height: 48,
            bars: true,
            filters: String::new(),
            mode,
            kernel: "floyd".to_owned(),
            stability: 0.0,
            bleed: 1.0,
            bidi: false,
            watermark: String::new(),
        }
    }

    #[test]
    fn kernel_lookup_rejects_unknown_names() {
        let err = diffusion_kernel("bayer").expect_err("unknown kernel");
        assert!(err.to_string().contains("atkinson"));
        for name in KERNEL_NAMES {
            diffusion_kernel(name).expect(name);
        }
    }

    #[test]
    fn ordered_dither_of_midgray_is_half_on() {
        let out = ordered_dither(&flat(8, 8, 0.5));
        let on: usize = out.samples().iter().filter(|&&v| v == 1.0).count();
        assert_eq!(on, 32, "a 0.5 field keys exactly half the Bayer cells");
    }

    #[test]
    fn error_diffusion_of_midgray_is_roughly_half_on() {
        let black = flat(32, 32, 0.0);
        let out = error_diffusion(&flat(32, 32, 0.5), &black, &FLOYD, 0.0, 1.0, false);
        let on: usize = out.samples().iter().filter(|&&v| v == 1.0).count();
        assert!((448..=576).contains(&on), "{on} of 1024 pixels on");
    }

    #[test]
    fn zero_bleed_reduces_to_plain_thresholding() {
        let black = flat(16, 16, 0.0);
        let out = error_diffusion(&flat(16, 16, 0.4), &black, &FLOYD, 0.0, 0.0, false);
        assert!(out.samples().iter().all(|&v| v == 0.0));
        let out = error_diffusion(&flat(16, 16, 0.6), &black, &FLOYD, 0.0, 0.0, false);
        assert!(out.samples().iter().all(|&v| v == 1.0));
    }

    #[test]
    fn full_stability_freezes_the_previous_output() {
        let previous = flat(16, 16, 0.0);
        let out = error_diffusion(&flat(16, 16, 1.0), &previous, &FLOYD, 1.0, 1.0, false);
        assert!(
            out.samples().iter().all(|&v| v == 0.0),
            "stability 1.0 ignores the source entirely"
        );
    }

    #[test]
    fn serpentine_scan_changes_the_pattern() {
        let mut src = Picture::new(2, 2);
        src.set(0, 0, 0.6);
        src.set(1, 0, 0.0);
        src.set(0, 1, 0.49);
        src.set(1, 1, 0.49);
        let black = Picture::new(2, 2);
        let uni = error_diffusion(&src, &black, &FLOYD, 0.0, 1.0, false);
        let serp = error_diffusion(&src, &black, &FLOYD, 0.0, 1.0, true);
        assert_eq!(uni.get(0, 0), 1.0);
        assert_eq!(uni.get(0, 1), 0.0);
        assert_eq!(uni.get(1, 1), 1.0);
        assert_eq!(serp.get(0, 1), 1.0, "mirrored carry lands on the left");
        assert_eq!(serp.get(1, 1), 0.0);
    }

    #[test]
    fn ditherer_keeps_its_previous_frame() {
        let mut d = Ditherer::new(&settings(DitherMode::ErrorDiffusion)).expect("settings");
        assert!(d.previous().samples().iter().all(|&v| v == 0.0));
        let out = d.dither(&flat(64, 48, 1.0));
        assert_eq!(d.previous(), &out);
        assert!(out.samples().iter().any(|&v| v == 1.0));
    }

    #[test]
    fn ditherer_output_is_strictly_binary() {
        let mut d = Ditherer::new(&settings(DitherMode::Ordered)).expect("settings");
        let mut src = Picture::new(100, 30);
        for y in 0..30 {
            for x in 0..100 {
                src.set(x, y, x as f32 / 100.0);
            }
        }
        let out = d.dither(&src);
        assert_eq!(out.width(), 64);
        assert_eq!(out.height(), 48);
        assert!(out.samples().iter().all(|&v| v == 0.0 || v == 1.0));
    }

    #[test]
    fn watermark_is_stamped_into_the_output() {
        let plain = settings(DitherMode::Ordered);
        let mut marked = plain.clone();
        marked.watermark = "DEMO".to_owned();
        let src = flat(64, 48, 0.5);
        let a = Ditherer::new(&plain).expect("plain").dither(&src);
        let b = Ditherer::new(&marked).expect("marked").dither(&src);
        assert_ne!(a, b, "the stamp must alter pixels");
    }

    #[test]
    fn poster_has_the_fixed_thumbnail_shape() {
        let src = flat(640, 480, 0.7);
        let cases = [DitherMode::Ordered, DitherMode::ErrorDiffusion];
        for mode in cases {
            let poster = poster_framebuffer(&src, "c", mode, "floyd", 1.0, false)
                .expect("poster");
            assert_eq!(poster.width(), POSTER_WIDTH);
            assert_eq!(poster.height(), POSTER_HEIGHT);
            assert_eq!(poster.packed_bits().len(), POSTER_BYTES);
        }
    }

    #[test]
    fn poster_rejects_bad_filters() {
        let src = flat(64, 48, 0.5);
        assert!(poster_framebuffer(&src, "q", DitherMode::Ordered, "floyd", 1.0, false).is_err());
    }
}
