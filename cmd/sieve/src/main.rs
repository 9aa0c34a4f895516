//! Prime sieve as a fiber pipeline
//!
//! A generator fiber feeds 2, 3, 4, ... into a channel; for every prime
//! the main fiber appends a filter fiber that strains out its multiples.
//!
//! Usage: sieve [count]

use strand::{go, gocancel, now, Chan};

fn main() {
    let count: usize = std::env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(20);

    let mut handles = Vec::new();
    let mut cur: Chan<i64> = Chan::new(0).expect("channel");

    let gen_tx = cur.dup().expect("dup");
    handles.push(
        go(move || {
            let mut i = 2i64;
            while gen_tx.send(i, -1).is_ok() {
                i += 1;
            }
            gen_tx.close().expect("close");
        })
        .expect("spawn"),
    );

    for _ in 0..count {
        let p = cur.recv(-1).expect("recv");
        println!("{}", p);

        let next: Chan<i64> = Chan::new(0).expect("channel");
        let next_tx = next.dup().expect("dup");
        let prev = cur;
        cur = next;
        handles.push(
            go(move || {
                loop {
                    let v = match prev.recv(-1) {
                        Ok(v) => v,
                        Err(_) => break,
                    };
                    if v % p != 0 && next_tx.send(v, -1).is_err() {
                        break;
                    }
                }
                prev.close().expect("close");
                next_tx.close().expect("close");
            })
            .expect("spawn"),
        );
    }

    gocancel(&handles, now() + 100).expect("cancel");
    cur.close().expect("close");
}
