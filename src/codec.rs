use anyhow::{anyhow, bail, ensure, Context, Result};

use crate::framebuffer::Framebuffer;

pub const SIG_NULL: u8 = 0x00;
pub const SIG_Z16: u8 = 0x01;
pub const SIG_Z32: u8 = 0x02;
pub const SIG_INVERT: u8 = 0x03;
pub const SIG_LINES: u8 = 0x04;

pub const CODEC_NAMES: [&str; 5] = ["null", "z16", "z32", "invert", "lines"];

/// Every video payload is framed with `00 00 00 <signature>`. Codecs charge
/// those four bytes against their budget so the framed video stays within
/// `byterate * ticks * penalty`.
pub const MARKER_LEN: usize = 4;

pub fn frame_marker(signature: u8) -> [u8; MARKER_LEN] {
    [0, 0, 0, signature]
}

/// A delta encoder racing for the next frame record.
///
/// `encode` advances `work` toward `target` as far as `budget` allows and
/// returns the raw payload, marker excluded. It must degrade gracefully:
/// when the budget is short it updates fewer pixels and never fails. At
/// starvation budgets the payload decays to a bare terminator, which is the
/// one case where the framed size can exceed the budget.
pub trait Codec {
    fn encode(&self, work: &mut Framebuffer, target: &Framebuffer, budget: usize) -> Vec<u8>;

    fn set_parameter(&mut self, name: &str, value: &str) -> Result<()>;

    /// Canonical spec string, parameters included.
    fn describe(&self) -> String;
}

/// A codec plus the registry facts the scheduler and container need.
pub struct CodecSpec {
    pub name: String,
    pub signature: u8,
    pub penalty: f64,
    pub codec: Box<dyn Codec>,
}

impl std::fmt::Debug for CodecSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecSpec")
            .field("name", &self.name)
            .field("signature", &self.signature)
            .field("penalty", &self.penalty)
            .field("codec", &self.codec.describe())
            .finish()
    }
}

/// Builds a codec from a spec string `name[:param=value[,param=value...]]`.
/// Unknown names and parameters are configuration errors.
pub fn make_codec(spec: &str, width: usize, height: usize) -> Result<CodecSpec> {
    let (name, params) = match spec.split_once(':') {
        Some((name, params)) => (name, Some(params)),
        None => (spec, None),
    };
    let (signature, penalty, mut codec): (u8, f64, Box<dyn Codec>) = match name {
        "null" => (SIG_NULL, 1.0, Box::new(NullCodec)),
        "z16" => {
            ensure!(
                width % 16 == 0,
                "codec z16 needs a width divisible by 16, not {width}"
            );
            (SIG_Z16, 0.45, Box::new(VerticalCodec::<u16>::new(width, height)))
        }
        "z32" => {
            ensure!(
                width % 32 == 0,
                "codec z32 needs a width divisible by 32, not {width}"
            );
            (SIG_Z32, 1.0, Box::new(VerticalCodec::<u32>::new(width, height)))
        }
        "invert" => (SIG_INVERT, 1.0, Box::new(InvertCodec)),
        "lines" => (SIG_LINES, 1.0, Box::new(LinesCodec::new(height))),
        other => bail!(
            "unknown codec '{other}' in \"{spec}\" (expected one of: {})",
            CODEC_NAMES.join(", ")
        ),
    };
    if let Some(params) = params {
        for param in params.split(',') {
            let (pname, pvalue) = param.split_once('=').ok_or_else(|| {
                anyhow!("malformed codec parameter '{param}' in \"{spec}\" (expected name=value)")
            })?;
            codec
                .set_parameter(pname, pvalue)
                .with_context(|| format!("configuring codec \"{spec}\""))?;
        }
    }
    Ok(CodecSpec {
        name: name.to_owned(),
        signature,
        penalty,
        codec,
    })
}

/// Replays a framed payload onto `fb`, exactly as the player would.
/// Truncated or overrunning payloads are corruption errors.
pub fn apply_payload(fb: &mut Framebuffer, signature: u8, payload: &[u8]) -> Result<()> {
    match signature {
        SIG_NULL => {
            ensure!(payload.is_empty(), "null codec carries no payload");
            Ok(())
        }
        SIG_INVERT => {
            ensure!(payload.is_empty(), "invert codec carries no payload");
            *fb = fb.inverted();
            Ok(())
        }
        SIG_Z16 => apply_vertical::<u16>(fb, payload),
        SIG_Z32 => apply_vertical::<u32>(fb, payload),
        SIG_LINES => apply_lines(fb, payload),
        other => bail!("unknown codec signature 0x{other:02x}"),
    }
}

/// The identity codec. Leaves the screen alone; penalty 1.0 keeps it honest
/// in the race, where it wins exactly when nothing changed.
struct NullCodec;

impl Codec for NullCodec {
    fn encode(&self, _work: &mut Framebuffer, _target: &Framebuffer, _budget: usize) -> Vec<u8> {
        Vec::new()
    }

    fn set_parameter(&mut self, name: &str, _value: &str) -> Result<()> {
        bail!("unknown parameter '{name}' for codec 'null' (it takes none)")
    }

    fn describe(&self) -> String {
        "null".to_owned()
    }
}

/// Flips every pixel. The payload is empty; the signature alone instructs
/// the player. Wins on hard cuts to a near-negative of the current screen.
struct InvertCodec;

impl Codec for InvertCodec {
    fn encode(&self, work: &mut Framebuffer, _target: &Framebuffer, _budget: usize) -> Vec<u8> {
        *work = work.inverted();
        Vec::new()
    }

    fn set_parameter(&mut self, name: &str, _value: &str) -> Result<()> {
        bail!("unknown parameter '{name}' for codec 'invert' (it takes none)")
    }

    fn describe(&self) -> String {
        "invert".to_owned()
    }
}

/// Word access for the vertical codecs, big-endian on the wire.
trait CodecWord: Copy + PartialEq {
    const BYTES: usize;
    const NAME: &'static str;
    fn read(fb: &Framebuffer, col: usize, row: usize) -> Self;
    fn write(fb: &mut Framebuffer, col: usize, row: usize, word: Self);
    fn push_be(self, out: &mut Vec<u8>);
    fn read_be(bytes: &[u8]) -> Self;
}

impl CodecWord for u16 {
    const BYTES: usize = 2;
    const NAME: &'static str = "z16";

    fn read(fb: &Framebuffer, col: usize, row: usize) -> Self {
        fb.get_word16(col, row)
    }

    fn write(fb: &mut Framebuffer, col: usize, row: usize, word: Self) {
        fb.set_word16(col, row, word);
    }

    fn push_be(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_be_bytes());
    }

    fn read_be(bytes: &[u8]) -> Self {
        u16::from_be_bytes([bytes[0], bytes[1]])
    }
}

impl CodecWord for u32 {
    const BYTES: usize = 4;
    const NAME: &'static str = "z32";

    fn read(fb: &Framebuffer, col: usize, row: usize) -> Self {
        fb.get_word32(col, row)
    }

    fn write(fb: &mut Framebuffer, col: usize, row: usize, word: Self) {
        fb.set_word32(col, row, word);
    }

    fn push_be(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_be_bytes());
    }

    fn read_be(bytes: &[u8]) -> Self {
        u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }
}

/// Column-major skip/copy delta over word slots. Slot k is column k/height,
/// row k%height, so updates run down each word column before moving right,
/// matching how the player walks its screen memory. Ops are (skip: u8,
/// copy: u8) followed by `copy` big-endian words; (0,0) terminates; runs
/// longer than 255 are split.
struct VerticalCodec<W> {
    cols: usize,
    height: usize,
    _word: std::marker::PhantomData<W>,
}

impl<W: CodecWord> VerticalCodec<W> {
    fn new(width: usize, height: usize) -> Self {
        Self {
            cols: width / (W::BYTES * 8),
            height,
            _word: std::marker::PhantomData,
        }
    }

    #[inline]
    fn slot(&self, index: usize) -> (usize, usize) {
        (index / self.height, index % self.height)
    }
}

impl<W: CodecWord> Codec for VerticalCodec<W> {
    fn encode(&self, work: &mut Framebuffer, target: &Framebuffer, budget: usize) -> Vec<u8> {
        let total = self.cols * self.height;
        let usable = budget.saturating_sub(MARKER_LEN);
        let mut payload = Vec::new();
        let mut pending_skip = 0usize;
        let mut index = 0usize;
        'scan: while index < total {
            let (col, row) = self.slot(index);
            if W::read(work, col, row) == W::read(target, col, row) {
                pending_skip += 1;
                index += 1;
                continue;
            }
            let start = index;
            while index < total {
                let (col, row) = self.slot(index);
                if W::read(work, col, row) == W::read(target, col, row) {
                    break;
                }
                index += 1;
            }
            let mut copied = start;
            while copied < index {
                // Oversized gaps are bridged with (255, 0) ops.
                while pending_skip > 255 {
                    if payload.len() + 2 + 2 > usable {
                        break 'scan;
                    }
                    payload.extend_from_slice(&[255, 0]);
                    pending_skip -= 255;
                }
                // Op header plus at least one word plus the terminator
                // must still fit, or we stop here.
                let affordable = usable.saturating_sub(payload.len() + 2 + 2) / W::BYTES;
                if affordable == 0 {
                    break 'scan;
                }
                let take = (index - copied).min(255).min(affordable);
                payload.push(pending_skip as u8);
                payload.push(take as u8);
                pending_skip = 0;
                for s in copied..copied + take {
                    let (col, row) = self.slot(s);
                    let word = W::read(target, col, row);
                    W::write(work, col, row, word);
                    word.push_be(&mut payload);
                }
                copied += take;
                if copied < index && take < 255 {
                    // Budget ran dry mid-run.
                    break 'scan;
                }
            }
        }
        payload.extend_from_slice(&[0, 0]);
        payload
    }

    fn set_parameter(&mut self, name: &str, _value: &str) -> Result<()> {
        bail!(
            "unknown parameter '{name}' for codec '{}' (it takes none)",
            W::NAME
        )
    }

    fn describe(&self) -> String {
        W::NAME.to_owned()
    }
}

fn apply_vertical<W: CodecWord>(fb: &mut Framebuffer, payload: &[u8]) -> Result<()> {
    let word_width = W::BYTES * 8;
    ensure!(
        fb.width() % word_width == 0,
        "{} payload on a width of {} (not divisible by {word_width})",
        W::NAME,
        fb.width()
    );
    let total = (fb.width() / word_width) * fb.height();
    let height = fb.height();
    let mut pos = 0usize;
    let mut slot = 0usize;
    loop {
        ensure!(pos + 2 <= payload.len(), "{} payload truncated", W::NAME);
        let skip = payload[pos] as usize;
        let copy = payload[pos + 1] as usize;
        pos += 2;
        if skip == 0 && copy == 0 {
            break;
        }
        slot += skip;
        ensure!(
            slot + copy <= total,
            "{} payload overruns the framebuffer",
            W::NAME
        );
        ensure!(
            pos + copy * W::BYTES <= payload.len(),
            "{} payload truncated mid-copy",
            W::NAME
        );
        for _ in 0..copy {
            let word = W::read_be(&payload[pos..pos + W::BYTES]);
            W::write(fb, slot / height, slot % height, word);
            pos += W::BYTES;
            slot += 1;
        }
    }
    ensure!(
        pos == payload.len(),
        "trailing bytes after {} terminator",
        W::NAME
    );
    Ok(())
}

/// Whole-row replacement. Payload is repeated (row: u16 BE, packed row
/// bytes), terminated by row 0xFFFF. Rows are picked most-different-first,
/// ties to the lower index, capped by `count` and the budget, and emitted
/// in ascending order.
struct LinesCodec {
    count: usize,
}

impl LinesCodec {
    fn new(height: usize) -> Self {
        Self { count: height }
    }
}

const LINES_TERMINATOR: u16 = 0xFFFF;

impl Codec for LinesCodec {
    fn encode(&self, work: &mut Framebuffer, target: &Framebuffer, budget: usize) -> Vec<u8> {
        let usable = budget.saturating_sub(MARKER_LEN);
        let row_cost = 2 + work.row_bytes();
        let mut candidates: Vec<(u32, usize)> = (0..work.height())
            .filter_map(|row| {
                let diff = work.row_difference(target, row);
                (diff > 0).then_some((diff, row))
            })
            .collect();
        candidates.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        let affordable = usable.saturating_sub(2) / row_cost;
        let take = candidates.len().min(self.count).min(affordable);
        let mut rows: Vec<usize> = candidates[..take].iter().map(|&(_, row)| row).collect();
        rows.sort_unstable();
        let mut payload = Vec::with_capacity(take * row_cost + 2);
        for row in rows {
            payload.extend_from_slice(&(row as u16).to_be_bytes());
            payload.extend_from_slice(target.row(row));
            work.copy_row_from(target, row);
        }
        payload.extend_from_slice(&LINES_TERMINATOR.to_be_bytes());
        payload
    }

    fn set_parameter(&mut self, name: &str, value: &str) -> Result<()> {
        match name {
            "count" => {
                self.count = value
                    .parse()
                    .with_context(|| format!("parameter count={value} is not a number"))?;
                Ok(())
            }
            other => bail!("unknown parameter '{other}' for codec 'lines' (expected count)"),
        }
    }

    fn describe(&self) -> String {
        format!("lines:count={}", self.count)
    }
}

fn apply_lines(fb: &mut Framebuffer, payload: &[u8]) -> Result<()> {
    let row_bytes = fb.row_bytes();
    let mut pos = 0usize;
    loop {
        ensure!(pos + 2 <= payload.len(), "lines payload truncated");
        let row = u16::from_be_bytes([payload[pos], payload[pos + 1]]);
        pos += 2;
        if row == LINES_TERMINATOR {
            break;
        }
        let row = row as usize;
        ensure!(
            row < fb.height(),
            "lines payload names row {row} of {}",
            fb.height()
        );
        ensure!(
            pos + row_bytes <= payload.len(),
            "lines payload truncated mid-row"
        );
        fb.write_row(row, &payload[pos..pos + row_bytes]);
        pos += row_bytes;
    }
    ensure!(pos == payload.len(), "trailing bytes after lines terminator");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noise(width: usize, height: usize, seed: u64) -> Framebuffer {
        // Tiny xorshift so tests stay deterministic without a rand dep.
        let mut state = seed | 1;
        let mut fb = Framebuffer::new(width, height);
        for y in 0..height {
            for x in 0..width {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                fb.set(x, y, state & 1 == 1);
            }
        }
        fb
    }

    #[test]
    fn registry_rejects_unknown_names() {
        let err = make_codec("zebra", 512, 342).expect_err("unknown codec");
        assert!(err.to_string().contains("zebra"));
        assert!(err.to_string().contains("lines"), "lists the alternatives");
    }

    #[test]
    fn registry_rejects_unknown_and_malformed_parameters() {
        let cases = ["lines:count", "lines:rows=3", "null:count=3", "z16:x=1"];
        for spec in cases {
            assert!(make_codec(spec, 512, 342).is_err(), "{spec} should fail");
        }
    }

    #[test]
    fn registry_enforces_word_width_divisibility() {
        assert!(make_codec("z16", 520, 342).is_err());
        assert!(make_codec("z32", 528, 342).is_err());
        assert!(make_codec("z16", 528, 342).is_ok());
        assert!(make_codec("z32", 512, 342).is_ok());
    }

    #[test]
    fn registry_signatures_and_penalties() {
        let cases = [
            ("null", SIG_NULL, 1.0),
            ("z16", SIG_Z16, 0.45),
            ("z32", SIG_Z32, 1.0),
            ("invert", SIG_INVERT, 1.0),
            ("lines:count=50", SIG_LINES, 1.0),
        ];
        for (spec, signature, penalty) in cases {
            let c = make_codec(spec, 512, 342).expect(spec);
            assert_eq!(c.signature, signature, "{spec}");
            assert_eq!(c.penalty, penalty, "{spec}");
            assert_eq!(c.codec.describe(), spec, "{spec}");
        }
    }

    #[test]
    fn null_codec_is_a_true_no_op() {
        let spec = make_codec("null", 64, 16).expect("null");
        let mut work = noise(64, 16, 7);
        let before = work.clone();
        let target = noise(64, 16, 99);
        let payload = spec.codec.encode(&mut work, &target, 0);
        assert!(payload.is_empty());
        assert_eq!(work, before);
        assert_eq!(work.proximity(&before), 1.0);
    }

    #[test]
    fn invert_codec_flips_everything() {
        let spec = make_codec("invert", 64, 16).expect("invert");
        let mut work = noise(64, 16, 7);
        let expected = work.inverted();
        let payload = spec.codec.encode(&mut work, &expected, 100);
        assert!(payload.is_empty());
        assert_eq!(work, expected);
        let mut replay = noise(64, 16, 7);
        apply_payload(&mut replay, SIG_INVERT, &payload).expect("replay");
        assert_eq!(replay, expected);
    }

    #[test]
    fn z32_reaches_target_given_room() {
        let spec = make_codec("z32", 64, 32).expect("z32");
        let mut work = Framebuffer::new(64, 32);
        let target = noise(64, 32, 3);
        let payload = spec.codec.encode(&mut work, &target, 1 << 16);
        assert_eq!(work, target);
        let mut replay = Framebuffer::new(64, 32);
        apply_payload(&mut replay, SIG_Z32, &payload).expect("replay");
        assert_eq!(replay, target);
    }

    #[test]
    fn z16_round_trips_through_apply() {
        let spec = make_codec("z16", 48, 20).expect("z16");
        let mut work = noise(48, 20, 11);
        let start = work.clone();
        let target = noise(48, 20, 22);
        let payload = spec.codec.encode(&mut work, &target, 1 << 16);
        assert_eq!(work, target);
        let mut replay = start;
        apply_payload(&mut replay, SIG_Z16, &payload).expect("replay");
        assert_eq!(replay, target);
    }

    #[test]
    fn z32_respects_the_budget_and_still_helps() {
        let spec = make_codec("z32", 64, 32).expect("z32");
        let mut work = Framebuffer::new(64, 32);
        let start = work.clone();
        let target = noise(64, 32, 5);
        let budget = 100;
        let payload = spec.codec.encode(&mut work, &target, budget);
        assert!(payload.len() + MARKER_LEN <= budget, "framed size fits");
        assert!(
            work.proximity(&target) > start.proximity(&target),
            "partial update should still close the gap"
        );
        // The truncated payload replays to exactly the achieved screen.
        let mut replay = start;
        apply_payload(&mut replay, SIG_Z32, &payload).expect("replay");
        assert_eq!(replay, work);
    }

    #[test]
    fn vertical_runs_longer_than_255_slots_split() {
        // One word column, 300 rows: a full-screen change is a 300-slot run.
        let spec = make_codec("z16", 16, 300).expect("z16");
        let mut work = Framebuffer::new(16, 300);
        let target = work.inverted();
        let payload = spec.codec.encode(&mut work, &target, 1 << 16);
        assert_eq!(work, target);
        // (0,255) + 255 words, (0,45) + 45 words, terminator.
        assert_eq!(payload.len(), 2 + 255 * 2 + 2 + 45 * 2 + 2);
        let mut replay = Framebuffer::new(16, 300);
        apply_payload(&mut replay, SIG_Z16, &payload).expect("replay");
        assert_eq!(replay, target);
    }

    #[test]
    fn vertical_skips_bridge_long_gaps() {
        // Flip one pixel near the bottom of the last column so the skip
        // distance exceeds 255 slots.
        let spec = make_codec("z16", 32, 200).expect("z16");
        let mut work = Framebuffer::new(32, 200);
        let mut target = Framebuffer::new(32, 200);
        target.set(16, 199, true);
        let payload = spec.codec.encode(&mut work, &target, 1 << 16);
        assert_eq!(work, target);
        assert_eq!(&payload[..2], &[255, 0], "first op bridges the gap");
        let mut replay = Framebuffer::new(32, 200);
        apply_payload(&mut replay, SIG_Z16, &payload).expect("replay");
        assert_eq!(replay, target);
    }

    #[test]
    fn lines_prefers_the_most_different_rows() {
        let mut codec = LinesCodec::new(8);
        codec
            .set_parameter("count", "1")
            .expect("count is a valid parameter");
        let mut work = Framebuffer::new(16, 8);
        let mut target = Framebuffer::new(16, 8);
        target.set(0, 2, true); // 1 pixel off on row 2
        for x in 0..8 {
            target.set(x, 5, true); // 8 pixels off on row 5
        }
        let payload = codec.encode(&mut work, &target, 1 << 16);
        assert_eq!(work.row_difference(&target, 5), 0, "row 5 wins the slot");
        assert_ne!(work.row_difference(&target, 2), 0, "row 2 left behind");
        assert_eq!(u16::from_be_bytes([payload[0], payload[1]]), 5);
    }

    #[test]
    fn lines_breaks_ties_toward_the_lower_row() {
        let mut codec = LinesCodec::new(8);
        codec.set_parameter("count", "1").expect("count");
        let mut work = Framebuffer::new(16, 8);
        let mut target = Framebuffer::new(16, 8);
        target.set(0, 3, true);
        target.set(0, 6, true);
        codec.encode(&mut work, &target, 1 << 16);
        assert_eq!(work.row_difference(&target, 3), 0);
        assert_eq!(work.row_difference(&target, 6), 1);
    }

    #[test]
    fn lines_emits_rows_in_ascending_order() {
        let codec = LinesCodec::new(8);
        let mut work = Framebuffer::new(16, 8);
        let mut target = Framebuffer::new(16, 8);
        // Row 6 is the most different but must still come after row 1.
        for x in 0..10 {
            target.set(x, 6, true);
        }
        target.set(0, 1, true);
        let payload = codec.encode(&mut work, &target, 1 << 16);
        assert_eq!(work, target);
        assert_eq!(u16::from_be_bytes([payload[0], payload[1]]), 1);
        let second = 2 + work.row_bytes();
        assert_eq!(
            u16::from_be_bytes([payload[second], payload[second + 1]]),
            6
        );
    }

    #[test]
    fn lines_budget_caps_the_row_count() {
        let codec = LinesCodec::new(100);
        let mut work = Framebuffer::new(16, 100);
        let target = work.inverted();
        // Room for marker + terminator + exactly three 4-byte rows.
        let budget = MARKER_LEN + 2 + 3 * (2 + 2);
        let payload = codec.encode(&mut work, &target, budget);
        assert!(payload.len() + MARKER_LEN <= budget);
        assert_eq!(payload.len(), 3 * 4 + 2);
    }

    #[test]
    fn apply_rejects_corrupt_payloads() {
        let mut fb = Framebuffer::new(32, 8);
        // Truncated before the terminator.
        assert!(apply_vertical::<u16>(&mut fb, &[0, 1, 0xAB]).is_err());
        // Copy overruns the slot count.
        assert!(apply_vertical::<u32>(&mut fb, &[7, 9, 0, 0]).is_err());
        // Row index out of range.
        let bad = [0x00, 0x63, 0, 0, 0, 0, 0xFF, 0xFF];
        assert!(apply_lines(&mut fb, &bad).is_err());
        // Trailing garbage after the terminator.
        assert!(apply_lines(&mut fb, &[0xFF, 0xFF, 0x00]).is_err());
        // Unknown signature.
        assert!(apply_payload(&mut fb, 0x09, &[]).is_err());
    }
}
