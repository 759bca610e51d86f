//! Minimal follow-mode tailing: `cargo run --example simple_usage -- app.log`

use std::env;
use std::process;

use tailstream::{tail_file, Config};

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() != 2 {
        eprintln!("Usage: {} <file_path>", args[0]);
        process::exit(1);
    }

    let config = Config {
        follow: true,
        re_open: true,
        ..Default::default()
    };

    match tail_file(&args[1], config).await {
        Ok(mut tail) => {
            println!("Tailing {}", args[1]);
            while let Some(line) = tail.recv().await {
                match line.err {
                    None => println!("{}", line.text),
                    Some(err) => eprintln!("{}", err),
                }
            }
        }
        Err(err) => {
            eprintln!("Error starting tail: {}", err);
            process::exit(1);
        }
    }
}
