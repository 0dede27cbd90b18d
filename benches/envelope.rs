use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use slquery::messages::unix_now;
use slquery::{ContentTypeToClient, Envelope, InboundMessage, SessionKey};

fn bench_seal_open(c: &mut Criterion) {
    let envelope = Envelope::new(&SessionKey::from_passphrase("bench"));
    let mut group = c.benchmark_group("envelope");

    for size in [64usize, 1024, 16 * 1024] {
        let plaintext = vec![0x5au8; size];
        let mut sealed = Vec::with_capacity(Envelope::sealed_len(size));
        let mut opened = Vec::with_capacity(size);
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::new("seal", size), &plaintext, |b, plain| {
            b.iter(|| envelope.seal_into(black_box(plain), &mut sealed))
        });

        envelope
            .seal_into(&plaintext, &mut sealed)
            .expect("seal");
        group.bench_with_input(BenchmarkId::new("open", size), &sealed, |b, sealed| {
            b.iter(|| envelope.open_into(black_box(sealed), &mut opened))
        });
    }
    group.finish();
}

fn bench_message_codec(c: &mut Criterion) {
    let message = InboundMessage::with_timestamp(
        42,
        unix_now(),
        ContentTypeToClient::ConsoleString,
        vec![b'x'; 512],
    );
    let encoded = message.encode();
    let mut out = Vec::with_capacity(encoded.len());

    c.bench_function("message_encode_512", |b| {
        b.iter(|| {
            out.clear();
            black_box(&message).encode_into(&mut out);
        })
    });
    c.bench_function("message_decode_512", |b| {
        b.iter(|| InboundMessage::decode(black_box(&encoded)))
    });
}

criterion_group!(benches, bench_seal_open, bench_message_codec);
criterion_main!(benches);
