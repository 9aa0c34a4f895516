//! Micro-benches for the two hot paths: a yield round-trip through the
//! scheduler and an unbuffered channel rendezvous between two fibers.

use criterion::{criterion_group, criterion_main, Criterion};
use strand::{go, gocancel, yield_now, Chan};

fn bench_yield(c: &mut Criterion) {
    // A second fiber guarantees every yield performs two context
    // switches instead of falling through the empty-queue fast path.
    let h = go(|| loop {
        if yield_now().is_err() {
            return;
        }
    })
    .unwrap();

    c.bench_function("yield_round_trip", |b| {
        b.iter(|| yield_now().unwrap());
    });

    gocancel(&[h], 0).unwrap();
}

fn bench_rendezvous(c: &mut Criterion) {
    let req: Chan<u64> = Chan::new(0).unwrap();
    let rsp: Chan<u64> = Chan::new(0).unwrap();

    let rq = req.dup().unwrap();
    let rs = rsp.dup().unwrap();
    let h = go(move || {
        loop {
            let v = match rq.recv(-1) {
                Ok(v) => v,
                Err(_) => break,
            };
            if rs.send(v + 1, -1).is_err() {
                break;
            }
        }
        rq.close().unwrap();
        rs.close().unwrap();
    })
    .unwrap();

    c.bench_function("unbuffered_rendezvous", |b| {
        b.iter(|| {
            req.send(1, -1).unwrap();
            rsp.recv(-1).unwrap();
        });
    });

    gocancel(&[h], 0).unwrap();
    req.close().unwrap();
    rsp.close().unwrap();
}

criterion_group!(benches, bench_yield, bench_rendezvous);
criterion_main!(benches);
