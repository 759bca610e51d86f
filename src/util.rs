//! Small string helpers.

/// Splits `s` into chunks of at most `chunk_size` characters.
///
/// Every chunk except possibly the last has exactly `chunk_size` characters,
/// and concatenating the chunks yields `s` again. The empty string partitions
/// to a single empty chunk.
///
/// # Panics
///
/// Panics if `chunk_size` is zero.
pub fn partition_string(s: &str, chunk_size: usize) -> Vec<String> {
    assert!(chunk_size > 0, "chunk_size must be positive");

    if s.is_empty() {
        return vec![String::new()];
    }

    let mut chunks = Vec::with_capacity(s.len() / chunk_size + 1);
    let mut chunk = String::with_capacity(chunk_size);
    let mut count = 0;

    for c in s.chars() {
        chunk.push(c);
        count += 1;
        if count == chunk_size {
            chunks.push(std::mem::take(&mut chunk));
            count = 0;
        }
    }
    if !chunk.is_empty() {
        chunks.push(chunk);
    }

    chunks
}
