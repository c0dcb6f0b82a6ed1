//! Download and persist generated artifacts.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use atelier_comfyui::api::{ComfyUIApiError, EngineApi};
use atelier_core::job::ResultRef;

/// Errors from fetching one artifact.
#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    /// The engine answered with a non-success status.
    #[error("Download failed with status {status}")]
    Download { status: u16 },

    /// The engine could not be reached.
    #[error("Download transport error: {0}")]
    Transport(String),

    /// The payload is not a decodable image.
    #[error("Could not decode image: {0}")]
    Decode(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ComfyUIApiError> for ArtifactError {
    fn from(err: ComfyUIApiError) -> Self {
        match err {
            ComfyUIApiError::ApiError { status, .. } => Self::Download { status },
            other => Self::Transport(other.to_string()),
        }
    }
}

/// Downloads result references and writes them as PNG files into the
/// output directory under generated timestamped names.
pub struct ArtifactFetcher {
    api: Arc<dyn EngineApi>,
    output_dir: PathBuf,
}

impl ArtifactFetcher {
    pub fn new(api: Arc<dyn EngineApi>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            api,
            output_dir: output_dir.into(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Fetch one artifact of `job_id`; `index` disambiguates multiple
    /// outputs of the same job.
    pub async fn fetch(
        &self,
        job_id: &str,
        index: usize,
        result: &ResultRef,
    ) -> Result<PathBuf, ArtifactError> {
        let bytes = self.api.view(result).await?;
        tracing::debug!(
            job_id,
            filename = %result.filename,
            bytes = bytes.len(),
            "Downloaded artifact",
        );

        let path = self.output_dir.join(artifact_name(job_id, index));
        let dir = self.output_dir.clone();
        let target = path.clone();

        tokio::task::spawn_blocking(move || decode_and_save(&bytes, &dir, &target))
            .await
            .map_err(std::io::Error::other)??;

        tracing::info!(job_id, path = %path.display(), "Saved artifact");
        Ok(path)
    }
}

/// `image_<utc timestamp>_<job prefix>_<index>.png`
fn artifact_name(job_id: &str, index: usize) -> String {
    let stamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
    let short: String = job_id
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .take(8)
        .collect();
    format!("image_{stamp}_{short}_{index}.png")
}

fn decode_and_save(bytes: &[u8], dir: &Path, target: &Path) -> Result<(), ArtifactError> {
    let image = image::load_from_memory(bytes).map_err(|e| ArtifactError::Decode(e.to_string()))?;
    std::fs::create_dir_all(dir)?;
    image
        .save_with_format(target, image::ImageFormat::Png)
        .map_err(|e| match e {
            image::ImageError::IoError(io) => ArtifactError::Io(io),
            other => ArtifactError::Decode(other.to_string()),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use atelier_comfyui::api::{QueueState, SubmitResponse};
    use serde_json::Value;
    use std::io::Cursor;

    /// Serves a fixed `view` response.
    struct FixedView(Result<Vec<u8>, u16>);

    #[async_trait]
    impl EngineApi for FixedView {
        async fn submit(&self, _: &Value, _: &str) -> Result<SubmitResponse, ComfyUIApiError> {
            unreachable!()
        }
        async fn queue_state(&self) -> Result<QueueState, ComfyUIApiError> {
            unreachable!()
        }
        async fn history(&self, _: &str) -> Result<Option<Vec<ResultRef>>, ComfyUIApiError> {
            unreachable!()
        }
        async fn view(&self, _: &ResultRef) -> Result<Vec<u8>, ComfyUIApiError> {
            match &self.0 {
                Ok(bytes) => Ok(bytes.clone()),
                Err(status) => Err(ComfyUIApiError::ApiError {
                    status: *status,
                    body: "not found".into(),
                }),
            }
        }
    }

    fn png_bytes() -> Vec<u8> {
        let img = image::RgbImage::from_pixel(2, 2, image::Rgb([200, 10, 10]));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, image::ImageFormat::Png).unwrap();
        out.into_inner()
    }

    #[tokio::test]
    async fn saves_decoded_png_and_creates_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let out_dir = tmp.path().join("nested/output");
        let fetcher = ArtifactFetcher::new(Arc::new(FixedView(Ok(png_bytes()))), &out_dir);

        let path = fetcher
            .fetch("J1-abc", 0, &ResultRef::output("x.png", ""))
            .await
            .unwrap();

        assert!(path.starts_with(&out_dir));
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("image_"));
        assert!(name.ends_with("_J1abc_0.png"));
        let reread = image::open(&path).unwrap();
        assert_eq!((reread.width(), reread.height()), (2, 2));
    }

    #[tokio::test]
    async fn garbage_bytes_are_a_decode_error() {
        let tmp = tempfile::tempdir().unwrap();
        let fetcher = ArtifactFetcher::new(Arc::new(FixedView(Ok(b"not an image".to_vec()))), tmp.path());

        assert_matches!(
            fetcher.fetch("J1", 0, &ResultRef::output("x.png", "")).await,
            Err(ArtifactError::Decode(_))
        );
    }

    #[tokio::test]
    async fn non_success_status_is_a_download_error() {
        let tmp = tempfile::tempdir().unwrap();
        let fetcher = ArtifactFetcher::new(Arc::new(FixedView(Err(404))), tmp.path());

        assert_matches!(
            fetcher.fetch("J1", 0, &ResultRef::output("x.png", "")).await,
            Err(ArtifactError::Download { status: 404 })
        );
    }

    #[test]
    fn indices_keep_names_apart() {
        assert_ne!(artifact_name("J1", 0), artifact_name("J1", 1));
    }
}
