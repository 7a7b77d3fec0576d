//! Image storage layout
//!
//! Images are addressed by test path, image name and kind:
//! - report files: `<report_dir>/<kind>/<story>[/<test>]/<browser>/<image>-<actual|expect|diff>-<retry>.png`
//! - baselines:    `<screen_dir>/<kind>/<story>[/<test>]/<browser>/<image>.png`
//!
//! Approving an attempt copies its actual image into the baseline slot.

use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Which slot an image occupies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    Actual,
    Expect,
    Diff,
}

impl std::fmt::Display for ImageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImageKind::Actual => write!(f, "actual"),
            ImageKind::Expect => write!(f, "expect"),
            ImageKind::Diff => write!(f, "diff"),
        }
    }
}

/// File-system store for baselines and run images
#[derive(Debug, Clone)]
pub struct ImageStore {
    screen_dir: PathBuf,
    report_dir: PathBuf,
}

impl ImageStore {
    pub fn new(screen_dir: impl Into<PathBuf>, report_dir: impl Into<PathBuf>) -> Self {
        Self {
            screen_dir: screen_dir.into(),
            report_dir: report_dir.into(),
        }
    }

    pub fn screen_dir(&self) -> &Path {
        &self.screen_dir
    }

    pub fn report_dir(&self) -> &Path {
        &self.report_dir
    }

    /// Name of a report file for one attempt
    pub fn file_name(image: &str, kind: ImageKind, retry: u32) -> String {
        format!("{}-{}-{}.png", image, kind, retry)
    }

    pub fn baseline_path(&self, image_dir: &Path, image: &str) -> PathBuf {
        self.screen_dir.join(image_dir).join(format!("{}.png", image))
    }

    pub fn report_path(&self, image_dir: &Path, file_name: &str) -> PathBuf {
        self.report_dir.join(image_dir).join(file_name)
    }

    /// Approved baseline, if one exists
    pub async fn read_baseline(&self, image_dir: &Path, image: &str) -> Result<Option<Vec<u8>>> {
        let path = self.baseline_path(image_dir, image);
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write one report image and return its file name
    pub async fn write_report(
        &self,
        image_dir: &Path,
        image: &str,
        kind: ImageKind,
        retry: u32,
        bytes: &[u8],
    ) -> Result<String> {
        let file_name = Self::file_name(image, kind, retry);
        let path = self.report_path(image_dir, &file_name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, bytes).await?;
        debug!("Wrote {}", path.display());
        Ok(file_name)
    }

    /// Copy the actual image of an attempt into the baseline slot.
    ///
    /// Blocking; callers hold the status lock while approving.
    pub fn approve(&self, image_dir: &Path, image: &str, retry: u32) -> Result<PathBuf> {
        let actual = self.report_path(image_dir, &Self::file_name(image, ImageKind::Actual, retry));
        if !actual.exists() {
            return Err(Error::NotFound(format!(
                "actual image {}",
                actual.display()
            )));
        }

        let baseline = self.baseline_path(image_dir, image);
        if let Some(parent) = baseline.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(&actual, &baseline)?;
        info!("Updated baseline {}", baseline.display());
        Ok(baseline)
    }
}
