use anyhow::{bail, Result};

// Corner mask radius for the classic bezel, in pixels at any resolution.
const CORNER_RADIUS: usize = 8;

/// One step of a filter chain, parsed from its one-letter spec.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Filter {
    Gamma(f32),
    BoxBlur,
    Sharpen,
    Contrast,
    Crush,
}

/// Parses a filter chain spec such as "g1.6bbsc". Letters run left to
/// right: g<gamma>, b (box blur), s (sharpen), c (contrast stretch),
/// z (crush extremes). Unknown letters are a configuration error.
pub fn parse_filter_chain(spec: &str) -> Result<Vec<Filter>> {
    let mut chain = Vec::new();
    let mut chars = spec.chars().peekable();
    while let Some(letter) = chars.next() {
        match letter {
            'g' => {
                let mut num = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_digit() || c == '.' {
                        num.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let gamma: f32 = num.parse().ok().filter(|g| *g > 0.0).ok_or_else(|| {
                    anyhow::anyhow!("filter 'g' needs a positive number in \"{spec}\"")
                })?;
                chain.push(Filter::Gamma(gamma));
            }
            'b' => chain.push(Filter::BoxBlur),
            's' => chain.push(Filter::Sharpen),
            'c' => chain.push(Filter::Contrast),
            'z' => chain.push(Filter::Crush),
            other => bail!(
                "unknown filter letter '{other}' in \"{spec}\" (expected g<gamma>, b, s, c, z)"
            ),
        }
    }
    Ok(chain)
}

/// Grayscale raster, samples in 0..=1, row-major.
#[derive(Clone, Debug, PartialEq)]
pub struct Picture {
    width: usize,
    height: usize,
    samples: Vec<f32>,
}

impl Picture {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            samples: vec![0.0; width * height],
        }
    }

    pub fn from_luma8(width: usize, height: usize, luma: &[u8]) -> Self {
        assert_eq!(luma.len(), width * height, "luma buffer size mismatch");
        Self {
            width,
            height,
            samples: luma.iter().map(|&v| v as f32 / 255.0).collect(),
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    #[inline]
    fn index(&self, x: usize, y: usize) -> usize {
        debug_assert!(x < self.width && y < self.height);
        y * self.width + x
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize) -> f32 {
        self.samples[self.index(x, y)]
    }

    #[inline]
    pub fn set(&mut self, x: usize, y: usize, value: f32) {
        let i = self.index(x, y);
        self.samples[i] = value;
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn to_luma8(&self) -> Vec<u8> {
        self.samples
            .iter()
            .map(|&v| (v.clamp(0.0, 1.0) * 255.0 + 0.5) as u8)
            .collect()
    }

    /// Aspect-preserving rescale into a new width x height raster.
    /// `bars` letterboxes the leftover area with black; without it the
    /// overflow is center-cropped away.
    pub fn resized(&self, width: usize, height: usize, bars: bool) -> Picture {
        let mut out = Picture::new(width, height);
        if self.width == 0 || self.height == 0 || width == 0 || height == 0 {
            return out;
        }
        let sx = width as f64 / self.width as f64;
        let sy = height as f64 / self.height as f64;
        let scale = if bars { sx.min(sy) } else { sx.max(sy) };
        let off_x = (width as f64 - self.width as f64 * scale) / 2.0;
        let off_y = (height as f64 - self.height as f64 * scale) / 2.0;
        for y in 0..height {
            let sy0 = (y as f64 - off_y) / scale;
            let sy1 = (y as f64 + 1.0 - off_y) / scale;
            for x in 0..width {
                let sx0 = (x as f64 - off_x) / scale;
                let sx1 = (x as f64 + 1.0 - off_x) / scale;
                out.samples[y * width + x] = self.box_average(sx0, sy0, sx1, sy1);
            }
        }
        out
    }

    // Area average of the source rectangle, fractional edges weighted.
    // Parts of the rectangle outside the raster contribute nothing.
    fn box_average(&self, x0: f64, y0: f64, x1: f64, y1: f64) -> f32 {
        let x0 = x0.max(0.0);
        let y0 = y0.max(0.0);
        let x1 = x1.min(self.width as f64);
        let y1 = y1.min(self.height as f64);
        if x1 <= x0 || y1 <= y0 {
            return 0.0;
        }
        let mut acc = 0.0f64;
        let mut area = 0.0f64;
        let iy1 = (y1.ceil() as usize).min(self.height);
        let ix1 = (x1.ceil() as usize).min(self.width);
        for iy in y0.floor() as usize..iy1 {
            let cy = ((iy as f64 + 1.0).min(y1) - (iy as f64).max(y0)).max(0.0);
            if cy == 0.0 {
                continue;
            }
            for ix in x0.floor() as usize..ix1 {
                let cx = ((ix as f64 + 1.0).min(x1) - (ix as f64).max(x0)).max(0.0);
                if cx == 0.0 {
                    continue;
                }
                acc += self.samples[iy * self.width + ix] as f64 * cx * cy;
                area += cx * cy;
            }
        }
        if area > 0.0 {
            (acc / area) as f32
        } else {
            0.0
        }
    }

    /// Parses and applies a filter chain spec. See [`parse_filter_chain`].
    pub fn apply_filters(&mut self, spec: &str) -> Result<()> {
        let chain = parse_filter_chain(spec)?;
        self.apply_filter_chain(&chain);
        Ok(())
    }

    pub fn apply_filter_chain(&mut self, chain: &[Filter]) {
        for filter in chain {
            match *filter {
                Filter::Gamma(g) => self.gamma(g),
                Filter::BoxBlur => self.box_blur(),
                Filter::Sharpen => self.sharpen(),
                Filter::Contrast => self.contrast_stretch(0.0, 1.0),
                Filter::Crush => self.contrast_stretch(0.1, 0.9),
            }
        }
    }

    fn gamma(&mut self, gamma: f32) {
        let exp = 1.0 / gamma;
        for v in &mut self.samples {
            *v = v.clamp(0.0, 1.0).powf(exp);
        }
    }

    fn box_blur(&mut self) {
        let (w, h) = (self.width, self.height);
        if w == 0 || h == 0 {
            return;
        }
        let src = self.samples.clone();
        for y in 0..h {
            for x in 0..w {
                let mut acc = 0.0f32;
                let mut n = 0.0f32;
                for dy in -1i32..=1 {
                    for dx in -1i32..=1 {
                        let nx = x as i32 + dx;
                        let ny = y as i32 + dy;
                        if nx >= 0 && ny >= 0 && (nx as usize) < w && (ny as usize) < h {
                            acc += src[ny as usize * w + nx as usize];
                            n += 1.0;
                        }
                    }
                }
                self.samples[y * w + x] = acc / n;
            }
        }
    }

    fn sharpen(&mut self) {
        let original = self.samples.clone();
        self.box_blur();
        for (v, &o) in self.samples.iter_mut().zip(original.iter()) {
            *v = (2.0 * o - *v).clamp(0.0, 1.0);
        }
    }

    // Stretches the [lo, hi] quantile band of the value range to 0..1.
    // lo=0, hi=1 is a plain min/max contrast stretch.
    fn contrast_stretch(&mut self, lo: f32, hi: f32) {
        let mut min = f32::MAX;
        let mut max = f32::MIN;
        for &v in &self.samples {
            min = min.min(v);
            max = max.max(v);
        }
        if max <= min {
            return;
        }
        let span = max - min;
        let low = min + span * lo;
        let high = min + span * hi;
        let denom = high - low;
        for v in &mut self.samples {
            *v = ((*v - low) / denom).clamp(0.0, 1.0);
        }
    }

    /// Masks the four corners with the classic bezel quarter-circles.
    pub fn round_corners(&mut self) {
        let r = CORNER_RADIUS;
        if self.width < 2 * r || self.height < 2 * r {
            return;
        }
        let rf = r as f32;
        for dy in 0..r {
            for dx in 0..r {
                let cx = dx as f32 + 0.5 - rf;
                let cy = dy as f32 + 0.5 - rf;
                if cx * cx + cy * cy > rf * rf {
                    let (w, h) = (self.width, self.height);
                    self.set(dx, dy, 0.0);
                    self.set(w - 1 - dx, dy, 0.0);
                    self.set(dx, h - 1 - dy, 0.0);
                    self.set(w - 1 - dx, h - 1 - dy, 0.0);
                }
            }
        }
    }
}
