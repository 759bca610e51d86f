//! Test utilities for creating and mutating temporary log files.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

pub struct TempLogFile {
    path: PathBuf,
    _temp_dir: tempfile::TempDir,
}

impl TempLogFile {
    /// Creates an empty log file inside a fresh temporary directory.
    pub fn new() -> std::io::Result<Self> {
        let temp_dir = tempfile::tempdir()?;
        let path = temp_dir.path().join("test.log");
        File::create(&path)?;

        Ok(Self {
            path,
            _temp_dir: temp_dir,
        })
    }

    /// Creates a log file with exactly `content` as its bytes.
    pub fn with_content(content: &str) -> std::io::Result<Self> {
        let temp_file = Self::new()?;
        std::fs::write(&temp_file.path, content)?;
        Ok(temp_file)
    }

    /// Appends raw content; no newline is added.
    pub fn append(&self, content: &str) -> std::io::Result<()> {
        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        file.write_all(content.as_bytes())?;
        file.flush()
    }

    /// Truncates the file and rewrites it with `content`.
    pub fn truncate(&self, content: &str) -> std::io::Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        file.write_all(content.as_bytes())?;
        file.flush()
    }

    /// Renames the file within its directory, as a log rotator would.
    pub fn rename(&self, new_name: &str) -> std::io::Result<()> {
        std::fs::rename(&self.path, self.path.with_file_name(new_name))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_an_empty_file() {
        let temp = TempLogFile::new().unwrap();
        assert!(temp.path().exists());
        assert_eq!(std::fs::read_to_string(temp.path()).unwrap(), "");
    }

    #[test]
    fn content_is_written_verbatim() {
        let temp = TempLogFile::with_content("line 1\npartial").unwrap();
        assert_eq!(
            std::fs::read_to_string(temp.path()).unwrap(),
            "line 1\npartial"
        );
    }

    #[test]
    fn append_does_not_add_newlines() {
        let temp = TempLogFile::with_content("a").unwrap();
        temp.append("b").unwrap();
        assert_eq!(std::fs::read_to_string(temp.path()).unwrap(), "ab");
    }

    #[test]
    fn truncate_replaces_content() {
        let temp = TempLogFile::with_content("initial content\n").unwrap();
        temp.truncate("short\n").unwrap();
        assert_eq!(std::fs::read_to_string(temp.path()).unwrap(), "short\n");
    }

    #[test]
    fn rename_moves_within_directory() {
        let temp = TempLogFile::with_content("data\n").unwrap();
        temp.rename("rotated.log").unwrap();

        assert!(!temp.path().exists());
        assert!(temp.path().with_file_name("rotated.log").exists());
    }
}
