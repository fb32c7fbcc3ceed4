use std::thread::{sleep, spawn};
use std::time::Duration;

fn main() {
    let count: usize = std::env::args()
        .nth(1)
        .and_then(|arg| arg.parse().ok())
        .unwrap_or(2);

    let threads: Vec<_> = (0..count)
        .map(|i| spawn(move || sleep(Duration::from_millis(20 * (i as u64 + 1)))))
        .collect();

    for thread in threads {
        thread.join().unwrap();
    }
}
