//! Embedding the prompt into saved images via an external tagging tool.

use std::path::PathBuf;

use tokio::process::Command;

/// Writes a caption into the embedded description of each file.
///
/// Tagging is best effort: implementations log failures and never return
/// them, so a missing or broken tool cannot fail a record.
#[async_trait::async_trait]
pub trait CaptionTagger: Send + Sync {
    async fn tag(&self, paths: &[PathBuf], caption: &str);
}

/// Runs `exiftool -overwrite_original -XMP-dc:Description=<caption> <files>`.
#[derive(Debug, Clone)]
pub struct ExifTool {
    program: PathBuf,
}

impl ExifTool {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn command(&self, paths: &[PathBuf], caption: &str) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("-overwrite_original")
            .arg(format!("-XMP-dc:Description={}", caption))
            .args(paths)
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait::async_trait]
impl CaptionTagger for ExifTool {
    async fn tag(&self, paths: &[PathBuf], caption: &str) {
        if paths.is_empty() {
            return;
        }
        tracing::info!("Captioning {} images with \"{}\"", paths.len(), caption);

        match self.command(paths, caption).output().await {
            Ok(output) if output.status.success() => {
                tracing::debug!("{} tagged {} files", self.program.display(), paths.len());
            }
            Ok(output) => {
                tracing::warn!(
                    "{} exited with {}: {}",
                    self.program.display(),
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                );
            }
            Err(e) => {
                tracing::warn!("Could not run {}: {}", self.program.display(), e);
            }
        }
    }
}

/// Tagger used with `--no-caption`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCaption;

#[async_trait::async_trait]
impl CaptionTagger for NoCaption {
    async fn tag(&self, paths: &[PathBuf], _caption: &str) {
        tracing::debug!("Captioning disabled, leaving {} files untagged", paths.len());
    }
}
