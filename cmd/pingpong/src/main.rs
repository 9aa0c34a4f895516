//! Unbuffered rendezvous demo: two fibers lob a counter back and forth.
//!
//! Usage: pingpong [rounds]

use strand::{go, gocancel, now, Chan};

fn main() {
    let rounds: u64 = std::env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(10);

    let ping: Chan<u64> = Chan::new(0).expect("channel");
    let pong: Chan<u64> = Chan::new(0).expect("channel");

    let (ping_rx, pong_tx) = (ping.dup().expect("dup"), pong.dup().expect("dup"));
    let h = go(move || {
        loop {
            let v = match ping_rx.recv(-1) {
                Ok(v) => v,
                Err(_) => break,
            };
            println!("pong fiber got {}", v);
            if pong_tx.send(v + 1, -1).is_err() {
                break;
            }
        }
        ping_rx.close().expect("close");
        pong_tx.close().expect("close");
    })
    .expect("spawn");

    let start = now();
    let mut v = 0;
    for _ in 0..rounds {
        ping.send(v, -1).expect("send");
        v = pong.recv(-1).expect("recv");
    }
    println!("{} round trips in {}ms, final value {}", rounds, now() - start, v);

    gocancel(&[h], 0).expect("cancel");
    ping.close().expect("close");
    pong.close().expect("close");
}
