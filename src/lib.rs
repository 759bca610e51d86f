//! A follow-mode file tailing library.
//!
//! Reads a text file line by line, optionally continues to emit new lines as
//! the file grows, and transparently handles log rotation: truncation,
//! rename, and delete-and-recreate. Consumers receive an ordered stream of
//! [`Line`] records annotated with byte offsets, line numbers and
//! timestamps.
//!
//! # Example
//!
//! ```rust,no_run
//! use tailstream::{tail_file, Config};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config {
//!         follow: true,
//!         re_open: true,
//!         ..Default::default()
//!     };
//!     let mut tail = tail_file("app.log", config).await?;
//!
//!     while let Some(line) = tail.recv().await {
//!         println!("{:>4} {}", line.num, line.text);
//!     }
//!     Ok(())
//! }
//! ```

mod config;
mod error;
mod line;
mod reader;
mod tail;
mod watcher;

pub mod ratelimiter;
pub mod util;

#[cfg(test)]
mod test_helpers;

pub use config::{Config, POLL_DURATION};
pub use error::{Error, Result};
pub use line::Line;
pub use tail::{tail_file, Tail};
