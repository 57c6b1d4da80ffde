use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Append-only log of failed image comparisons.
///
/// Each failure is a three-line block readable by the reftest analyzer:
///
/// ```text
/// REFTEST TEST-UNEXPECTED-FAIL | firefox-tracemonkey-page3 | image comparison (==)
/// REFTEST   IMAGE 1 (TEST): test_snapshots/linux/firefox/tracemonkey/3.png
/// REFTEST   IMAGE 2 (REFERENCE): test_snapshots/linux/firefox/tracemonkey/3_ref.png
/// ```
///
/// The file is only created once the first failure is recorded.
#[derive(Debug)]
pub struct EqLog {
    path: Option<PathBuf>,
    file: Option<File>,
    entries: usize,
}

impl EqLog {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path: Some(path),
            file: None,
            entries: 0,
        }
    }

    /// A log that counts entries but writes nothing.
    #[cfg(test)]
    pub fn disabled() -> Self {
        Self {
            path: None,
            file: None,
            entries: 0,
        }
    }

    pub fn entries(&self) -> usize {
        self.entries
    }

    pub fn record(
        &mut self,
        browser: &str,
        task_id: &str,
        page: u32,
        test_image: &Path,
        ref_image: &Path,
    ) -> Result<()> {
        self.entries += 1;
        let block = format!(
            "REFTEST TEST-UNEXPECTED-FAIL | {browser}-{task_id}-page{page} | image comparison (==)\n\
             REFTEST   IMAGE 1 (TEST): {}\n\
             REFTEST   IMAGE 2 (REFERENCE): {}\n",
            test_image.display(),
            ref_image.display()
        );
        let Some(file) = self.file()? else {
            return Ok(());
        };
        file.write_all(block.as_bytes()).context("write eq log")?;
        Ok(())
    }

    fn file(&mut self) -> Result<Option<&mut File>> {
        let Some(path) = &self.path else {
            return Ok(None);
        };
        if self.file.is_none() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("open eq log {}", path.display()))?;
            self.file = Some(file);
        }
        Ok(self.file.as_mut())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn writes_reftest_blocks_lazily() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("eq.log");
        let mut log = EqLog::new(path.clone());
        assert!(!path.exists());

        log.record(
            "firefox",
            "doc1",
            2,
            Path::new("snaps/2.png"),
            Path::new("snaps/2_ref.png"),
        )
        .unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            text,
            "REFTEST TEST-UNEXPECTED-FAIL | firefox-doc1-page2 | image comparison (==)\n\
             REFTEST   IMAGE 1 (TEST): snaps/2.png\n\
             REFTEST   IMAGE 2 (REFERENCE): snaps/2_ref.png\n"
        );
        assert_eq!(log.entries(), 1);
    }
}
