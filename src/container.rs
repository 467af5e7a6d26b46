use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, ensure, Context, Result};

use crate::codec::{self, CODEC_NAMES, MARKER_LEN};
use crate::decoding::SOUND_FRAME_BYTES;
use crate::framebuffer::Framebuffer;
use crate::scheduler::Frame;

pub const COMMENT_LEN: usize = 1022;
pub const FORMAT_VERSION: u16 = 1;
pub const ENTRY_COUNT: u16 = 4;

pub const TAG_INFO: u16 = 0x00;
pub const TAG_MOVIE: u16 = 0x01;
pub const TAG_TOC: u16 = 0x02;
pub const TAG_POSTER: u16 = 0x03;

pub const POSTER_WIDTH: usize = 128;
pub const POSTER_HEIGHT: usize = 86;
pub const POSTER_BYTES: usize = POSTER_WIDTH / 8 * POSTER_HEIGHT;

/// Audio block length field for a record with no audio: just the field
/// itself. Length fields in a record count their own two bytes.
const SILENT_MARKER: u16 = 2;
const AUDIO_MODE: u16 = 0;
const AUDIO_RATE: u32 = 65536;

const HEADER_OFFSET: usize = 1024;
const HEADER_LEN: usize = 44;
const GLOBAL_START: usize = HEADER_OFFSET + HEADER_LEN;
const GLOBAL_LEN: usize = 16;

/// The on-disk checksum: one 16-bit accumulator over big-endian words,
/// folded modulo 65535. Word pairing restarts at each section boundary
/// and an odd-length section contributes a final `hi << 8` word, which
/// is how the player pads an odd movie section. Not a real Fletcher sum,
/// but the player expects these exact bytes.
pub struct RollingChecksum {
    sum: u32,
    pending: Option<u8>,
}

impl RollingChecksum {
    pub fn new() -> Self {
        Self {
            sum: 0,
            pending: None,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        for &b in bytes {
            match self.pending.take() {
                None => self.pending = Some(b),
                Some(hi) => self.sum = (self.sum + ((hi as u32) << 8) + b as u32) % 65535,
            }
        }
    }

    /// Folds a dangling odd byte as the high half of a zero-padded word.
    pub fn end_section(&mut self) {
        if let Some(hi) = self.pending.take() {
            self.sum = (self.sum + ((hi as u32) << 8)) % 65535;
        }
    }

    pub fn value(&self) -> u32 {
        self.sum
    }
}

fn checksum_words(bytes: &[u8]) -> u32 {
    let mut sum = RollingChecksum::new();
    sum.push(bytes);
    sum.end_section();
    sum.value()
}

fn push_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_be_bytes());
}

fn push_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_be_bytes());
}

/// What `finish` reports back about the file it wrote.
#[derive(Debug)]
pub struct ContainerSummary {
    pub path: PathBuf,
    pub checksum: u16,
    pub frames: u32,
    pub ticks: u64,
    pub movie_len: u64,
    pub toc_len: u64,
    pub poster_len: u64,
    pub file_len: u64,
}

/// Streams frame records to a spool file next to the output, then stitches
/// comment, header, global info, movie, TOC and poster together in `finish`.
/// Spooling keeps memory flat however long the movie runs; the header needs
/// totals that only exist once the last record is in.
pub struct ContainerWriter {
    out_path: PathBuf,
    spool_path: PathBuf,
    spool: Option<BufWriter<File>>,
    toc: Vec<u8>,
    movie_len: u64,
    movie_sum: RollingChecksum,
    frames: u32,
    ticks: u64,
    comment: String,
    width: u16,
    height: u16,
    silent: bool,
    byterate: u16,
    finished: bool,
}

impl ContainerWriter {
    pub fn create(
        path: &Path,
        comment: &str,
        width: usize,
        height: usize,
        silent: bool,
        byterate: usize,
    ) -> Result<Self> {
        let width = u16::try_from(width).context("width does not fit the container header")?;
        let height = u16::try_from(height).context("height does not fit the container header")?;
        ensure!(width > 0 && height > 0, "resolution must be positive");
        let byterate =
            u16::try_from(byterate).context("byterate does not fit the container header")?;
        ensure!(byterate > 0, "byterate must be positive");

        let mut spool_os = path.as_os_str().to_owned();
        spool_os.push(".movie.tmp");
        let spool_path = PathBuf::from(spool_os);
        let spool = BufWriter::new(File::create(&spool_path).with_context(|| {
            format!("failed to create movie spool {}", spool_path.display())
        })?);

        Ok(Self {
            out_path: path.to_path_buf(),
            spool_path,
            spool: Some(spool),
            toc: Vec::new(),
            movie_len: 0,
            movie_sum: RollingChecksum::new(),
            frames: 0,
            ticks: 0,
            comment: comment.to_owned(),
            width,
            height,
            silent,
            byterate,
            finished: false,
        })
    }

    pub fn frames(&self) -> u32 {
        self.frames
    }

    pub fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        let record = encode_record(frame, self.silent)?;
        let spool = self
            .spool
            .as_mut()
            .context("container writer already finished")?;
        spool
            .write_all(&record)
            .with_context(|| format!("failed to spool frame {}", self.frames))?;
        push_u16(&mut self.toc, record.len() as u16);
        self.movie_sum.push(&record);
        self.movie_len += record.len() as u64;
        self.frames += 1;
        self.ticks += frame.ticks as u64;
        Ok(())
    }

    /// Assembles the final file and removes the spool. Consumes the writer;
    /// the container is only valid once this returns.
    pub fn finish(mut self, poster: &Framebuffer) -> Result<ContainerSummary> {
        ensure!(
            poster.width() == POSTER_WIDTH && poster.height() == POSTER_HEIGHT,
            "poster is {}x{}, the container stores {}x{}",
            poster.width(),
            poster.height(),
            POSTER_WIDTH,
            POSTER_HEIGHT
        );
        ensure!(self.frames > 0, "no frames were written");
        let ticks =
            u32::try_from(self.ticks).context("total tick count does not fit the header")?;

        let mut spool = self
            .spool
            .take()
            .context("container writer already finished")?;
        spool.flush().context("failed to flush movie spool")?;
        drop(spool);

        self.movie_sum.end_section();

        let mut global = Vec::with_capacity(GLOBAL_LEN);
        push_u16(&mut global, self.width);
        push_u16(&mut global, self.height);
        push_u16(&mut global, self.silent as u16);
        push_u32(&mut global, self.frames);
        push_u32(&mut global, ticks);
        push_u16(&mut global, self.byterate);

        let toc_offset = GLOBAL_LEN as u64 + self.movie_len;
        let poster_offset = toc_offset + self.toc.len() as u64;
        let mut header = Vec::with_capacity(HEADER_LEN);
        push_u16(&mut header, FORMAT_VERSION);
        push_u16(&mut header, ENTRY_COUNT);
        for (tag, offset, length) in [
            (TAG_INFO, 0u64, GLOBAL_LEN as u64),
            (TAG_MOVIE, GLOBAL_LEN as u64, self.movie_len),
            (TAG_TOC, toc_offset, self.toc.len() as u64),
            (TAG_POSTER, poster_offset, POSTER_BYTES as u64),
        ] {
            push_u16(&mut header, tag);
            push_u32(
                &mut header,
                u32::try_from(offset).context("section offset does not fit the header")?,
            );
            push_u32(
                &mut header,
                u32::try_from(length).context("section length does not fit the header")?,
            );
        }

        let poster_bits = poster.packed_bits();
        let checksum = ((checksum_words(&header)
            + checksum_words(&global)
            + self.movie_sum.value()
            + checksum_words(&self.toc)
            + checksum_words(poster_bits))
            % 65535) as u16;

        let mut out = BufWriter::new(File::create(&self.out_path).with_context(|| {
            format!("failed to create {}", self.out_path.display())
        })?);
        let mut comment = [0u8; COMMENT_LEN];
        let text = self.comment.as_bytes();
        let n = text.len().min(COMMENT_LEN);
        comment[..n].copy_from_slice(&text[..n]);
        out.write_all(&comment)?;
        out.write_all(&checksum.to_be_bytes())?;
        out.write_all(&header)?;
        out.write_all(&global)?;
        let mut movie = File::open(&self.spool_path).with_context(|| {
            format!("failed to reopen movie spool {}", self.spool_path.display())
        })?;
        io::copy(&mut movie, &mut out).context("failed to copy the movie section")?;
        out.write_all(&self.toc)?;
        out.write_all(poster_bits)?;
        out.flush()
            .with_context(|| format!("failed to write {}", self.out_path.display()))?;
        drop(out);

        fs::remove_file(&self.spool_path).with_context(|| {
            format!("failed to remove movie spool {}", self.spool_path.display())
        })?;
        self.finished = true;

        let toc_len = self.toc.len() as u64;
        let file_len = (GLOBAL_START + GLOBAL_LEN) as u64
            + self.movie_len
            + toc_len
            + POSTER_BYTES as u64;
        Ok(ContainerSummary {
            path: self.out_path.clone(),
            checksum,
            frames: self.frames,
            ticks: self.ticks,
            movie_len: self.movie_len,
            toc_len,
            poster_len: POSTER_BYTES as u64,
            file_len,
        })
    }
}

impl Drop for ContainerWriter {
    fn drop(&mut self) {
        if !self.finished {
            let _ = fs::remove_file(&self.spool_path);
        }
    }
}

fn encode_record(frame: &Frame, silent: bool) -> Result<Vec<u8>> {
    ensure!(frame.ticks >= 1, "frame spans zero ticks");
    ensure!(
        frame.video.len() >= MARKER_LEN && frame.video[..3] == [0, 0, 0],
        "video payload is missing its signature marker"
    );
    let mut record = Vec::new();
    push_u16(
        &mut record,
        u16::try_from(frame.ticks).context("tick span does not fit a record")?,
    );
    if silent {
        ensure!(
            frame.audio.is_empty(),
            "silent movie record carries {} audio bytes",
            frame.audio.len()
        );
        push_u16(&mut record, SILENT_MARKER);
    } else {
        ensure!(
            frame.audio.len() == frame.ticks * SOUND_FRAME_BYTES,
            "record has {} audio bytes, expected {} for {} ticks",
            frame.audio.len(),
            frame.ticks * SOUND_FRAME_BYTES,
            frame.ticks
        );
        push_u16(
            &mut record,
            u16::try_from(frame.audio.len() + 8).context("audio block does not fit a record")?,
        );
        push_u16(&mut record, AUDIO_MODE);
        push_u32(&mut record, AUDIO_RATE);
        record.extend_from_slice(&frame.audio);
    }
    push_u16(
        &mut record,
        u16::try_from(frame.video.len() + 2).context("video block does not fit a record")?,
    );
    record.extend_from_slice(&frame.video);
    ensure!(
        record.len() <= u16::MAX as usize,
        "frame record is {} bytes, past the 64k record limit",
        record.len()
    );
    Ok(record)
}

/// What `check_container` learned from a file that passed.
#[derive(Debug)]
pub struct ContainerCheck {
    pub comment: String,
    pub width: u16,
    pub height: u16,
    pub silent: bool,
    pub frames: u32,
    pub ticks: u64,
    pub byterate: u16,
    pub checksum: u16,
    pub movie_len: u64,
    pub file_len: u64,
    pub records_by_codec: BTreeMap<String, u64>,
}

struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        ensure!(
            self.pos + n <= self.data.len(),
            "truncated at byte {} (wanted {} more)",
            self.pos,
            n
        );
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }
}

/// Full structural verification of a container: section table, record
/// walk against the TOC, payload replay through the codecs, checksum.
/// Anything a vintage player would trip over is an error here.
pub fn check_container(path: &Path) -> Result<ContainerCheck> {
    let data =
        fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    ensure!(
        data.len() >= GLOBAL_START + GLOBAL_LEN,
        "file is {} bytes, too short for a container header",
        data.len()
    );

    let comment_end = data[..COMMENT_LEN]
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(COMMENT_LEN);
    let comment = String::from_utf8_lossy(&data[..comment_end]).into_owned();
    let stored = u16::from_be_bytes([data[COMMENT_LEN], data[COMMENT_LEN + 1]]);

    let mut header = ByteReader::new(&data[HEADER_OFFSET..GLOBAL_START]);
    let version = header.u16()?;
    ensure!(version == FORMAT_VERSION, "unknown format version {version}");
    let entries = header.u16()?;
    ensure!(entries == ENTRY_COUNT, "expected 4 section entries, found {entries}");
    let mut sections = [(0u16, 0u64, 0u64); ENTRY_COUNT as usize];
    for (i, section) in sections.iter_mut().enumerate() {
        let tag = header.u16()?;
        ensure!(tag == i as u16, "section {i} has tag {tag:#04x}, expected {i:#04x}");
        *section = (tag, header.u32()? as u64, header.u32()? as u64);
    }
    let (_, info_off, info_len) = sections[TAG_INFO as usize];
    let (_, movie_off, movie_len) = sections[TAG_MOVIE as usize];
    let (_, toc_off, toc_len) = sections[TAG_TOC as usize];
    let (_, poster_off, poster_len) = sections[TAG_POSTER as usize];
    ensure!(info_off == 0 && info_len == GLOBAL_LEN as u64, "malformed INFO entry");
    ensure!(movie_off == GLOBAL_LEN as u64, "MOVIE section does not follow INFO");
    ensure!(toc_off == movie_off + movie_len, "TOC section does not follow MOVIE");
    ensure!(poster_off == toc_off + toc_len, "POSTER section does not follow TOC");
    ensure!(
        poster_len == POSTER_BYTES as u64,
        "poster is {poster_len} bytes, expected {POSTER_BYTES}"
    );
    let expected_len = GLOBAL_START as u64 + poster_off + poster_len;
    ensure!(
        data.len() as u64 == expected_len,
        "file is {} bytes, the section table says {expected_len}",
        data.len()
    );

    let section = |off: u64, len: u64| {
        let start = GLOBAL_START + off as usize;
        &data[start..start + len as usize]
    };
    let global = section(info_off, info_len);
    let movie = section(movie_off, movie_len);
    let toc = section(toc_off, toc_len);
    let poster = section(poster_off, poster_len);

    let mut info = ByteReader::new(global);
    let width = info.u16()?;
    let height = info.u16()?;
    let silent_flag = info.u16()?;
    ensure!(silent_flag <= 1, "silent flag is {silent_flag}, expected 0 or 1");
    let silent = silent_flag == 1;
    let frames = info.u32()?;
    let tick_count = info.u32()?;
    let byterate = info.u16()?;
    ensure!(width > 0 && height > 0, "container has a zero dimension");
    ensure!(
        toc_len == frames as u64 * 2,
        "TOC is {toc_len} bytes for {frames} frames"
    );

    let mut toc_reader = ByteReader::new(toc);
    let mut reader = ByteReader::new(movie);
    let mut screen = Framebuffer::new(width as usize, height as usize);
    let mut ticks = 0u64;
    let mut records_by_codec: BTreeMap<String, u64> = BTreeMap::new();
    for index in 0..frames {
        let length = toc_reader.u16()? as usize;
        let start = reader.pos;
        let record_ticks = reader.u16()? as u64;
        ensure!(record_ticks >= 1, "record {index} spans zero ticks");
        let audio_block = reader.u16()? as usize;
        if silent {
            ensure!(
                audio_block == SILENT_MARKER as usize,
                "record {index} of a silent movie has audio block {audio_block}"
            );
        } else {
            ensure!(
                audio_block == record_ticks as usize * SOUND_FRAME_BYTES + 8,
                "record {index} has audio block {audio_block} for {record_ticks} ticks"
            );
            let mode = reader.u16()?;
            let rate = reader.u32()?;
            ensure!(
                mode == AUDIO_MODE && rate == AUDIO_RATE,
                "record {index} has audio mode {mode}, rate {rate}"
            );
            reader.take(record_ticks as usize * SOUND_FRAME_BYTES)?;
        }
        let video_block = reader.u16()? as usize;
        ensure!(
            video_block >= 2 + MARKER_LEN,
            "record {index} video block is {video_block} bytes"
        );
        let video = reader.take(video_block - 2)?;
        ensure!(
            video[..3] == [0, 0, 0],
            "record {index} has a malformed video marker"
        );
        let signature = video[3];
        codec::apply_payload(&mut screen, signature, &video[MARKER_LEN..])
            .with_context(|| format!("record {index} video payload"))?;
        let name = CODEC_NAMES
            .get(signature as usize)
            .copied()
            .unwrap_or("unknown");
        *records_by_codec.entry(name.to_owned()).or_insert(0) += 1;
        ticks += record_ticks;
        let consumed = reader.pos - start;
        ensure!(
            consumed == length,
            "record {index} is {consumed} bytes but the TOC says {length}"
        );
    }
    ensure!(
        reader.remaining() == 0,
        "movie section has {} bytes past the last record",
        reader.remaining()
    );
    ensure!(
        ticks == tick_count as u64,
        "records cover {ticks} ticks, the header says {tick_count}"
    );

    let header_bytes = &data[HEADER_OFFSET..GLOBAL_START];
    let computed = ((checksum_words(header_bytes)
        + checksum_words(global)
        + checksum_words(movie)
        + checksum_words(toc)
        + checksum_words(poster))
        % 65535) as u16;
    if computed != stored {
        bail!("checksum mismatch: stored {stored:#06x}, computed {computed:#06x}");
    }

    Ok(ContainerCheck {
        comment,
        width,
        height,
        silent,
        frames,
        ticks,
        byterate,
        checksum: stored,
        movie_len,
        file_len: data.len() as u64,
        records_by_codec,
    })
}
