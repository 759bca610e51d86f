//! Demonstrates the wider configuration surface: seeking to the end of an
//! existing file, surviving rotation, rate limiting, and a clean shutdown.
//!
//! Run with: `cargo run --example follow_rotation -- /var/log/syslog`

use std::env;
use std::io::SeekFrom;
use std::process;
use std::time::Duration;

use tailstream::ratelimiter::LeakyBucket;
use tailstream::{tail_file, Config};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() != 2 {
        eprintln!("Usage: {} <file_path>", args[0]);
        process::exit(1);
    }

    let config = Config {
        // Only new data: start at the end of whatever is already there.
        location: Some(SeekFrom::End(0)),
        follow: true,
        re_open: true,
        max_line_size: 16 * 1024,
        // At most 100 records per second, announced in-band when exceeded.
        rate_limiter: Some(LeakyBucket::new(100, Duration::from_millis(10))),
        ..Default::default()
    };

    let mut tail = match tail_file(&args[1], config).await {
        Ok(tail) => tail,
        Err(err) => {
            eprintln!("Error starting tail: {}", err);
            process::exit(1);
        }
    };

    let mut seen = 0u64;
    while let Some(line) = tail.recv().await {
        if line.err.is_some() {
            eprintln!("[notice] {}", line.text);
            continue;
        }

        println!("{:>6} @{:<8} {}", line.num, line.offset, line.text);

        seen += 1;
        if seen >= 1000 {
            println!("Seen {} lines, stopping at EOF.", seen);
            tail.stop_at_eof();
        }
    }

    if let Err(err) = tail.wait().await {
        eprintln!("Tail ended with error: {}", err);
        process::exit(1);
    }
}
