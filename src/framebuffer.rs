use crate::picture::Picture;

/// Packed 1-bit bitmap, row-major, MSB-first, rows padded to a byte
/// boundary. Padding bits are always zero; every mutation below preserves
/// that so proximity can popcount whole bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Framebuffer {
    width: usize,
    height: usize,
    bits: Vec<u8>,
}

impl Framebuffer {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            bits: vec![0; ((width + 7) / 8) * height],
        }
    }

    /// Thresholds a grayscale picture at 0.5. Set bits are white.
    pub fn from_picture(picture: &Picture) -> Self {
        let mut fb = Self::new(picture.width(), picture.height());
        for y in 0..fb.height {
            for x in 0..fb.width {
                if picture.get(x, y) >= 0.5 {
                    fb.set(x, y, true);
                }
            }
        }
        fb
    }

    pub fn to_picture(&self) -> Picture {
        let mut p = Picture::new(self.width, self.height);
        for y in 0..self.height {
            for x in 0..self.width {
                if self.get(x, y) {
                    p.set(x, y, 1.0);
                }
            }
        }
        p
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn row_bytes(&self) -> usize {
        (self.width + 7) / 8
    }

    pub fn packed_bits(&self) -> &[u8] {
        &self.bits
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize) -> bool {
        debug_assert!(x < self.width && y < self.height);
        let byte = self.bits[y * self.row_bytes() + x / 8];
        (byte >> (7 - x % 8)) & 1 == 1
    }

    #[inline]
    pub fn set(&mut self, x: usize, y: usize, on: bool) {
        debug_assert!(x < self.width && y < self.height);
        let i = y * self.row_bytes() + x / 8;
        let mask = 1u8 << (7 - x % 8);
        if on {
            self.bits[i] |= mask;
        } else {
            self.bits[i] &= !mask;
        }
    }

    fn assert_same_shape(&self, other: &Framebuffer) {
        assert!(
            self.width == other.width && self.height == other.height,
            "framebuffer shape mismatch: {}x{} vs {}x{}",
            self.width,
            self.height,
            other.width,
            other.height
        );
    }

    pub fn xor(&self, other: &Framebuffer) -> Framebuffer {
        self.assert_same_shape(other);
        let bits = self
            .bits
            .iter()
            .zip(other.bits.iter())
            .map(|(a, b)| a ^ b)
            .collect();
        Framebuffer {
            width: self.width,
            height: self.height,
            bits,
        }
    }

    pub fn inverted(&self) -> Framebuffer {
        let mut out = Framebuffer {
            width: self.width,
            height: self.height,
            bits: self.bits.iter().map(|b| !b).collect(),
        };
        out.clear_row_padding();
        out
    }

    // Zeroes the padding bits of the trailing byte of every row.
    fn clear_row_padding(&mut self) {
        let tail = self.width % 8;
        if tail == 0 {
            return;
        }
        let rb = self.row_bytes();
        let mask = 0xFFu8 << (8 - tail);
        for y in 0..self.height {
            self.bits[y * rb + rb - 1] &= mask;
        }
    }

    /// Fraction of matching pixels in 0..=1; 1.0 means identical.
    pub fn proximity(&self, other: &Framebuffer) -> f64 {
        self.assert_same_shape(other);
        let total = self.width * self.height;
        if total == 0 {
            return 1.0;
        }
        let differing: u32 = self
            .bits
            .iter()
            .zip(other.bits.iter())
            .map(|(a, b)| (a ^ b).count_ones())
            .sum();
        (total as f64 - differing as f64) / total as f64
    }

    /// Count of pixels in `row` that differ from `other`'s row.
    pub fn row_difference(&self, other: &Framebuffer, row: usize) -> u32 {
        self.assert_same_shape(other);
        let rb = self.row_bytes();
        let a = &self.bits[row * rb..(row + 1) * rb];
        let b = &other.bits[row * rb..(row + 1) * rb];
        a.iter().zip(b.iter()).map(|(x, y)| (x ^ y).count_ones()).sum()
    }

    pub fn row(&self, row: usize) -> &[u8] {
        let rb = self.row_bytes();
        &self.bits[row * rb..(row + 1) * rb]
    }

    pub fn copy_row_from(&mut self, other: &Framebuffer, row: usize) {
        self.assert_same_shape(other);
        let rb = self.row_bytes();
        self.bits[row * rb..(row + 1) * rb].copy_from_slice(other.row(row));
    }

    /// Replaces `row` with raw packed bytes. Padding bits in the trailing
    /// byte are masked off, whatever the caller supplied.
    pub fn write_row(&mut self, row: usize, bytes: &[u8]) {
        let rb = self.row_bytes();
        assert_eq!(bytes.len(), rb, "row byte count mismatch");
        self.bits[row * rb..(row + 1) * rb].copy_from_slice(bytes);
        let tail = self.width % 8;
        if tail != 0 {
            self.bits[row * rb + rb - 1] &= 0xFFu8 << (8 - tail);
        }
    }

    // Big-endian word views used by the vertical codecs. Callers guarantee
    // the width divides evenly; the registry enforces that at setup.

    pub fn get_word16(&self, col: usize, row: usize) -> u16 {
        let i = row * self.row_bytes() + col * 2;
        u16::from_be_bytes([self.bits[i], self.bits[i + 1]])
    }

    pub fn set_word16(&mut self, col: usize, row: usize, word: u16) {
        let i = row * self.row_bytes() + col * 2;
        self.bits[i..i + 2].copy_from_slice(&word.to_be_bytes());
    }

    pub fn get_word32(&self, col: usize, row: usize) -> u32 {
        let i = row * self.row_bytes() + col * 4;
        u32::from_be_bytes([
            self.bits[i],
            self.bits[i + 1],
            self.bits[i + 2],
            self.bits[i + 3],
        ])
    }

    pub fn set_word32(&mut self, col: usize, row: usize, word: u32) {
        let i = row * self.row_bytes() + col * 4;
        self.bits[i..i + 4].copy_from_slice(&word.to_be_bytes());
    }
}
