use bluemix::audio::{MixBuffer, SampleFormat};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

const PERIOD: usize = 960;

fn bench_mix_period(c: &mut Criterion) {
    let mut group = c.benchmark_group("mix_period");
    for clients in [1usize, 4, 16] {
        group.bench_with_input(BenchmarkId::from_parameter(clients), &clients, |b, &clients| {
            let mut mix = MixBuffer::new(SampleFormat::S16Le, 2, 16 * PERIOD, PERIOD).unwrap();
            let input: Vec<u8> = (0..PERIOD * 4).map(|i| (i % 251) as u8).collect();
            let mut out = vec![0u8; PERIOD * 4];
            let mut cursors = vec![-1i64; clients];
            let scale = [0.5, 0.5];

            b.iter(|| {
                for cursor in cursors.iter_mut() {
                    mix.add(cursor, black_box(&input));
                }
                black_box(mix.read(&mut out, PERIOD, &scale));
            });
        });
    }
    group.finish();
}

fn bench_formats(c: &mut Criterion) {
    let mut group = c.benchmark_group("read_format");
    for format in [SampleFormat::U8, SampleFormat::S16Le, SampleFormat::S32Le] {
        let name = format!("{:?}", format);
        group.bench_function(name, |b| {
            let mut mix = MixBuffer::new(format, 2, 16 * PERIOD, PERIOD).unwrap();
            let frame = format.bytes() * 2;
            let input = vec![0x40u8; PERIOD * frame];
            let mut out = vec![0u8; PERIOD * frame];
            let mut cursor = -1i64;

            b.iter(|| {
                mix.add(&mut cursor, &input);
                black_box(mix.read(&mut out, PERIOD, &[0.7, 0.7]));
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_mix_period, bench_formats);
criterion_main!(benches);
