//! Codec benchmarks over a synthetic noisy frame.
//! Run: cargo bench

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use flimc::codec::make_codec;
use flimc::dither::Ditherer;
use flimc::framebuffer::Framebuffer;
use flimc::picture::Picture;
use flimc::profile::EncodingProfile;
use flimc::scheduler::FrameScheduler;
use flimc::subtitle::SubtitleBurner;

/// Deterministic xorshift noise so runs stay comparable.
fn noise_picture(width: usize, height: usize) -> Picture {
    let mut state: u32 = 0x2545_f491;
    let mut out = Picture::new(width, height);
    for y in 0..height {
        for x in 0..width {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            out.set(x, y, (state & 0xff) as f32 / 255.0);
        }
    }
    out
}

fn bench_codecs(c: &mut Criterion) {
    let source = noise_picture(512, 342);
    let target = Framebuffer::from_picture(&source);

    let mut group = c.benchmark_group("encode_frame");
    group.sample_size(50);

    group.bench_function("z32_full_delta", |b| {
        let spec = make_codec("z32", 512, 342).expect("codec");
        b.iter(|| {
            let mut work = Framebuffer::new(512, 342);
            black_box(spec.codec.encode(&mut work, &target, black_box(8_000)))
        });
    });

    group.bench_function("lines_50_rows", |b| {
        let spec = make_codec("lines:count=50", 512, 342).expect("codec");
        b.iter(|| {
            let mut work = Framebuffer::new(512, 342);
            black_box(spec.codec.encode(&mut work, &target, black_box(8_000)))
        });
    });

    group.bench_function("default_profile_race", |b| {
        let profile = EncodingProfile::default();
        b.iter(|| {
            let ditherer = Ditherer::new(&profile.dither_settings("")).expect("ditherer");
            let codecs = profile.build_codecs().expect("codecs");
            let mut scheduler = FrameScheduler::new(
                ditherer,
                SubtitleBurner::new(Vec::new()),
                codecs,
                12.0,
                profile.byterate,
                profile.group,
                true,
            )
            .expect("scheduler");
            black_box(scheduler.process_image(&source, &[]).expect("frames"))
        });
    });

    group.finish();
}

criterion_group!(benches, bench_codecs);
criterion_main!(benches);
