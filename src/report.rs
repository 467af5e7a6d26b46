use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};

pub const HISTOGRAM_BUCKETS: usize = 1000;

/// Per-frame quality distribution. Quality is the proximity of the frame
/// the player will show to the frame the ditherer wanted, so 1.0 means the
/// byterate lost nothing.
pub struct QualityHistogram {
    buckets: Vec<u64>,
    total: u64,
}

impl QualityHistogram {
    pub fn new() -> Self {
        Self {
            // One extra bucket so a perfect 1.0 is not lumped with 0.999.
            buckets: vec![0; HISTOGRAM_BUCKETS + 1],
            total: 0,
        }
    }

    pub fn add(&mut self, quality: f64) {
        debug_assert!((0.0..=1.0).contains(&quality));
        let bucket = ((quality * HISTOGRAM_BUCKETS as f64) as usize).min(HISTOGRAM_BUCKETS);
        self.buckets[bucket] += 1;
        self.total += 1;
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Worst quality that all but the named fraction of frames beat. Walks
    /// from the bad end and reports the first bucket past the fraction.
    fn bound(&self, fraction: f64) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        let mut cumulative = 0u64;
        for (i, &count) in self.buckets.iter().enumerate() {
            cumulative += count;
            if cumulative as f64 / self.total as f64 > fraction {
                return i as f64 / HISTOGRAM_BUCKETS as f64;
            }
        }
        1.0
    }

    pub fn percentiles(&self) -> QualityPercentiles {
        QualityPercentiles {
            p99: self.bound(0.01),
            p98: self.bound(0.02),
            p95: self.bound(0.05),
        }
    }

    /// End-of-run table on stderr, nonzero buckets only.
    pub fn dump(&self) {
        if self.total == 0 {
            return;
        }
        eprintln!("[flimc] {:>8} {:>8} {:>7} {:>7}", "quality", "frames", "perc.", "cumul.");
        let mut cumulative = 0u64;
        for (i, &count) in self.buckets.iter().enumerate() {
            cumulative += count;
            if count == 0 {
                continue;
            }
            eprintln!(
                "[flimc] {:>8.3} {:>8} {:>6.2}% {:>6.2}%",
                i as f64 / HISTOGRAM_BUCKETS as f64,
                count,
                count as f64 * 100.0 / self.total as f64,
                cumulative as f64 * 100.0 / self.total as f64
            );
        }
        let percentiles = self.percentiles();
        for (share, bound) in [
            ("99%", percentiles.p99),
            ("98%", percentiles.p98),
            ("95%", percentiles.p95),
        ] {
            eprintln!(
                "[flimc] {share} of the frames are within {:.1}% of the target pixels",
                (1.0 - bound) * 100.0
            );
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct QualityPercentiles {
    pub p99: f64,
    pub p98: f64,
    pub p95: f64,
}

/// Machine-readable summary of one encode, written as pretty JSON when
/// `--report` asks for it.
#[derive(Debug, Serialize)]
pub struct EncodeReport {
    pub input: String,
    pub output: String,
    pub width: usize,
    pub height: usize,
    pub input_fps: f64,
    pub effective_fps: f64,
    pub byterate: usize,
    pub silent: bool,
    pub profile: String,
    pub images_in: u64,
    pub records: u32,
    pub ticks: u64,
    pub movie_bytes: u64,
    pub toc_bytes: u64,
    pub poster_bytes: u64,
    pub file_bytes: u64,
    pub checksum: String,
    pub sha256: String,
    pub codec_wins: BTreeMap<String, u64>,
    pub quality: QualityPercentiles,
    pub created: String,
}

impl EncodeReport {
    pub fn write(&self, path: &Path) -> Result<()> {
        let json =
            serde_json::to_string_pretty(self).context("failed to serialize the encode report")?;
        fs::write(path, json)
            .with_context(|| format!("failed to write report {}", path.display()))
    }
}

/// Streaming SHA-256 of a finished file.
pub fn sha256_hex(path: &Path) -> Result<String> {
    let mut file =
        File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let n = file
            .read(&mut buffer)
            .with_context(|| format!("failed to hash {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn histogram_buckets_and_percentiles() {
        let mut histogram = QualityHistogram::new();
        assert!(histogram.is_empty());
        // 3 frames at 0.5 put the cumulative share past 1% and 2% right
        // at that bucket, while 5% is only crossed at the perfect bucket.
        for _ in 0..97 {
            histogram.add(1.0);
        }
        for _ in 0..3 {
            histogram.add(0.5);
        }
        let percentiles = histogram.percentiles();
        assert_eq!(percentiles.p99, 0.5);
        assert_eq!(percentiles.p98, 0.5);
        assert_eq!(percentiles.p95, 1.0);
    }

    #[test]
    fn all_perfect_frames_bound_at_one() {
        let mut histogram = QualityHistogram::new();
        for _ in 0..10 {
            histogram.add(1.0);
        }
        let percentiles = histogram.percentiles();
        assert_eq!(percentiles.p99, 1.0);
        assert_eq!(percentiles.p95, 1.0);
    }

    #[test]
    fn empty_histogram_reports_zero() {
        let histogram = QualityHistogram::new();
        assert_eq!(histogram.percentiles().p99, 0.0);
        histogram.dump();
    }

    #[test]
    fn sha256_matches_a_known_vector() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("abc.bin");
        fs::write(&path, b"abc").expect("write");
        assert_eq!(
            sha256_hex(&path).expect("hash"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn report_serializes_to_json() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("report.json");
        let report = EncodeReport {
            input: "in.mov".to_owned(),
            output: "out.flim".to_owned(),
            width: 512,
            height: 342,
            input_fps: 24.0,
            effective_fps: 12.0,
            byterate: 2000,
            silent: false,
            profile: "--byterate 2000".to_owned(),
            images_in: 10,
            records: 25,
            ticks: 25,
            movie_bytes: 1000,
            toc_bytes: 50,
            poster_bytes: 1376,
            file_bytes: 3510,
            checksum: "0x1234".to_owned(),
            sha256: "00".repeat(32),
            codec_wins: BTreeMap::from([("z32".to_owned(), 25u64)]),
            quality: QualityPercentiles {
                p99: 0.97,
                p98: 0.98,
                p95: 0.99,
            },
            created: "2024-05-01T00:00:00+00:00".to_owned(),
        };
        report.write(&path).expect("write");
        let text = fs::read_to_string(&path).expect("read");
        let parsed: serde_json::Value = serde_json::from_str(&text).expect("parse");
        assert_eq!(parsed["records"], 25);
        assert_eq!(parsed["codec_wins"]["z32"], 25);
        assert_eq!(parsed["quality"]["p99"], 0.97);
    }
}
