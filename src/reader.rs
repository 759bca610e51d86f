//! Incremental line assembly over an open file handle.

use std::io;

use memchr::memchr;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};

/// One chunk produced by [`LineReader::read_line`]: a whole line, or a
/// fragment of one when the size cap cut it short.
#[derive(Debug, PartialEq)]
pub(crate) struct Chunk {
    pub bytes: Vec<u8>,
    /// False when the chunk ended at the cap or at EOF rather than at `\n`.
    pub ended_with_newline: bool,
}

impl Chunk {
    /// Bytes consumed from the file, including the newline when present.
    pub fn consumed(&self) -> u64 {
        self.bytes.len() as u64 + u64::from(self.ended_with_newline)
    }
}

/// Buffered line reader with an optional byte cap per returned chunk.
///
/// The newline character is `\n`; a preceding `\r` is retained in the chunk.
pub(crate) struct LineReader {
    reader: BufReader<File>,
    max_line_size: usize,
}

impl LineReader {
    pub fn new(file: File, max_line_size: usize) -> Self {
        LineReader {
            reader: BufReader::new(file),
            max_line_size,
        }
    }

    /// Reads up to and including the next newline, or up to `max_line_size`
    /// bytes, whichever comes first. Returns `None` at EOF with no pending
    /// bytes.
    ///
    /// The cap never splits a multi-byte UTF-8 character: the cut backs off
    /// to the previous character boundary, and a single character wider than
    /// the cap is taken whole. Concatenating a capped line's fragments
    /// therefore reproduces its text exactly.
    pub async fn read_line(&mut self) -> io::Result<Option<Chunk>> {
        let mut bytes = Vec::new();

        loop {
            let available = self.reader.fill_buf().await?;
            if available.is_empty() {
                if bytes.is_empty() {
                    return Ok(None);
                }
                return Ok(Some(Chunk {
                    bytes,
                    ended_with_newline: false,
                }));
            }

            let room = if self.max_line_size > 0 {
                self.max_line_size.saturating_sub(bytes.len())
            } else {
                usize::MAX
            };

            let capped = room < available.len();
            let cut = if capped {
                let cut = floor_char_boundary(available, room);
                if cut == 0 && bytes.is_empty() {
                    leading_char_end(available)
                } else {
                    cut
                }
            } else {
                available.len()
            };
            let window = &available[..cut];

            match memchr(b'\n', window) {
                Some(at) => {
                    bytes.extend_from_slice(&window[..at]);
                    self.reader.consume(at + 1);
                    return Ok(Some(Chunk {
                        bytes,
                        ended_with_newline: true,
                    }));
                }
                None => {
                    bytes.extend_from_slice(window);
                    self.reader.consume(cut);

                    if capped && !bytes.is_empty() {
                        // A newline sitting right at the cap belongs to this
                        // chunk, so a line of exactly the cap is one record.
                        let next = self.reader.fill_buf().await?;
                        let ended = next.first() == Some(&b'\n');
                        if ended {
                            self.reader.consume(1);
                        }
                        return Ok(Some(Chunk {
                            bytes,
                            ended_with_newline: ended,
                        }));
                    }
                }
            }
        }
    }

    /// Seeks back to the start of the file, discarding buffered data.
    pub async fn rewind(&mut self) -> io::Result<()> {
        self.reader.seek(io::SeekFrom::Start(0)).await?;
        Ok(())
    }
}

fn is_utf8_continuation(byte: u8) -> bool {
    byte & 0xC0 == 0x80
}

/// Largest cut at or below `limit` that does not split a UTF-8 character.
/// Gives up after three continuation bytes so arbitrary binary data is still
/// cut at `limit`.
fn floor_char_boundary(buf: &[u8], limit: usize) -> usize {
    if limit >= buf.len() {
        return buf.len();
    }

    let floor = limit.saturating_sub(3);
    let mut cut = limit;
    while cut > floor && is_utf8_continuation(buf[cut]) {
        cut -= 1;
    }
    if is_utf8_continuation(buf[cut]) {
        limit
    } else {
        cut
    }
}

/// End of the character the buffer starts with, capped at four bytes; the
/// whole buffer when the character runs past its end.
fn leading_char_end(buf: &[u8]) -> usize {
    let mut end = 1;
    while end < buf.len().min(4) && is_utf8_continuation(buf[end]) {
        end += 1;
    }
    end
}
