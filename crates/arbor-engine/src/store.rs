use std::io::Cursor;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use arbor_contracts::errors::StudioError;
use image::ImageFormat;
use reqwest::blocking::Client as HttpClient;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};

use crate::{push_unique_warning, truncate_text};

pub const THUMBNAIL_MAX_DIM: u32 = 300;

const UPLOAD_TIMEOUT_SECS: u64 = 60;

pub trait BlobBackend: Send + Sync {
    fn name(&self) -> &str;
    /// Persists the blob under `key` and returns an addressable locator
    /// (filesystem path or public URL), opaque to callers.
    fn put(&self, key: &str, bytes: &[u8]) -> Result<String>;
}

pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl BlobBackend for LocalBackend {
    fn name(&self) -> &str {
        "local"
    }

    fn put(&self, key: &str, bytes: &[u8]) -> Result<String> {
        let path = self.root.join(key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed creating {}", parent.display()))?;
        }
        std::fs::write(&path, bytes)
            .with_context(|| format!("failed writing {}", path.display()))?;
        Ok(path.to_string_lossy().to_string())
    }
}

/// Remote object store exposing put-by-key with a public URL, in the shape
/// of a Supabase-style storage API. Base URL, bucket and key are pure
/// configuration.
pub struct RemoteBackend {
    http: HttpClient,
    base_url: String,
    bucket: String,
    api_key: String,
}

impl RemoteBackend {
    pub fn new(
        base_url: impl Into<String>,
        bucket: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            http: HttpClient::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            bucket: bucket.into(),
            api_key: api_key.into(),
        }
    }
}

impl BlobBackend for RemoteBackend {
    fn name(&self) -> &str {
        "remote"
    }

    fn put(&self, key: &str, bytes: &[u8]) -> Result<String> {
        let upload_url = format!(
            "{}/storage/v1/object/{}/{key}",
            self.base_url, self.bucket
        );
        let response = self
            .http
            .post(&upload_url)
            .header(AUTHORIZATION, format!("Bearer {}", self.api_key))
            .header(CONTENT_TYPE, "image/png")
            .header("x-upsert", "true")
            .timeout(Duration::from_secs(UPLOAD_TIMEOUT_SECS))
            .body(bytes.to_vec())
            .send()
            .with_context(|| format!("remote upload request failed ({upload_url})"))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            bail!(
                "remote upload failed ({}): {}",
                status.as_u16(),
                truncate_text(&body, 512)
            );
        }
        Ok(format!(
            "{}/storage/v1/object/public/{}/{key}",
            self.base_url, self.bucket
        ))
    }
}

/// Two-strategy blob persistence policy: the configured primary backend,
/// then at most one attempt against the fallback before surfacing
/// `StorageFailed`. Also owns thumbnail derivation, so a completed
/// generation always carries both locators.
pub struct ArtifactStore {
    primary: Box<dyn BlobBackend>,
    fallback: Option<Box<dyn BlobBackend>>,
}

impl ArtifactStore {
    pub fn new(primary: Box<dyn BlobBackend>, fallback: Option<Box<dyn BlobBackend>>) -> Self {
        Self { primary, fallback }
    }

    pub fn store(
        &self,
        generation_id: &str,
        image_bytes: &[u8],
        warnings: &mut Vec<String>,
    ) -> Result<(String, String), StudioError> {
        let thumbnail = derive_thumbnail(image_bytes).map_err(|err| StudioError::StorageFailed {
            cause: format!("thumbnail derivation failed: {err:#}"),
        })?;

        let image_key = format!("images/{generation_id}.png");
        let thumb_key = format!("thumbnails/{generation_id}_thumb.png");
        let image_locator = self.put_with_fallback(&image_key, image_bytes, warnings)?;
        let thumb_locator = self.put_with_fallback(&thumb_key, &thumbnail, warnings)?;
        Ok((image_locator, thumb_locator))
    }

    fn put_with_fallback(
        &self,
        key: &str,
        bytes: &[u8],
        warnings: &mut Vec<String>,
    ) -> Result<String, StudioError> {
        let primary_err = match self.primary.put(key, bytes) {
            Ok(locator) => return Ok(locator),
            Err(err) => err,
        };

        let Some(fallback) = &self.fallback else {
            return Err(StudioError::StorageFailed {
                cause: format!(
                    "{} backend failed for {key}: {primary_err:#}",
                    self.primary.name()
                ),
            });
        };

        push_unique_warning(
            warnings,
            format!(
                "{} backend failed for {key} ({primary_err:#}); falling back to {}",
                self.primary.name(),
                fallback.name()
            ),
        );
        fallback
            .put(key, bytes)
            .map_err(|fallback_err| StudioError::StorageFailed {
                cause: format!(
                    "{} and {} backends failed for {key}: {primary_err:#}; {fallback_err:#}",
                    self.primary.name(),
                    fallback.name()
                ),
            })
    }
}

/// Scales the image down to fit 300px on the longest edge, preserving the
/// aspect ratio, and re-encodes it as PNG.
pub fn derive_thumbnail(image_bytes: &[u8]) -> Result<Vec<u8>> {
    let decoded = image::load_from_memory(image_bytes).context("image decode failed")?;
    // `DynamicImage::thumbnail` scales up to fill the bounds; small images
    // stay as they are.
    let thumbnail = if decoded.width() <= THUMBNAIL_MAX_DIM && decoded.height() <= THUMBNAIL_MAX_DIM
    {
        decoded
    } else {
        decoded.thumbnail(THUMBNAIL_MAX_DIM, THUMBNAIL_MAX_DIM)
    };
    let mut bytes = Vec::new();
    thumbnail
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .context("thumbnail encode failed")?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use anyhow::{bail, Result};
    use arbor_contracts::errors::StudioError;
    use image::{ImageFormat, RgbImage};

    use super::{derive_thumbnail, ArtifactStore, BlobBackend, LocalBackend, THUMBNAIL_MAX_DIM};

    struct FailingBackend;

    impl BlobBackend for FailingBackend {
        fn name(&self) -> &str {
            "failing"
        }

        fn put(&self, _key: &str, _bytes: &[u8]) -> Result<String> {
            bail!("backend offline")
        }
    }

    fn sample_png(width: u32, height: u32) -> Vec<u8> {
        let canvas = RgbImage::new(width, height);
        let mut bytes = Vec::new();
        image::DynamicImage::ImageRgb8(canvas)
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }

    #[test]
    fn stores_image_and_thumbnail_under_generation_id() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let store = ArtifactStore::new(Box::new(LocalBackend::new(temp.path())), None);
        let mut warnings = Vec::new();

        let (image_locator, thumb_locator) =
            store.store("gen-1", &sample_png(64, 64), &mut warnings)?;
        assert!(image_locator.ends_with("images/gen-1.png"));
        assert!(thumb_locator.ends_with("thumbnails/gen-1_thumb.png"));
        assert!(std::path::Path::new(&image_locator).exists());
        assert!(std::path::Path::new(&thumb_locator).exists());
        assert!(warnings.is_empty());
        Ok(())
    }

    #[test]
    fn thumbnail_is_bounded_and_keeps_aspect_ratio() -> Result<()> {
        let thumbnail = derive_thumbnail(&sample_png(800, 400))?;
        let decoded = image::load_from_memory(&thumbnail)?;
        assert_eq!(decoded.width(), THUMBNAIL_MAX_DIM);
        assert_eq!(decoded.height(), THUMBNAIL_MAX_DIM / 2);
        Ok(())
    }

    #[test]
    fn small_images_are_not_upscaled() -> Result<()> {
        let thumbnail = derive_thumbnail(&sample_png(120, 80))?;
        let decoded = image::load_from_memory(&thumbnail)?;
        assert_eq!((decoded.width(), decoded.height()), (120, 80));
        Ok(())
    }

    #[test]
    fn primary_failure_falls_back_with_warning() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let store = ArtifactStore::new(
            Box::new(FailingBackend),
            Some(Box::new(LocalBackend::new(temp.path()))),
        );
        let mut warnings = Vec::new();

        let (image_locator, _) = store.store("gen-2", &sample_png(32, 32), &mut warnings)?;
        assert!(std::path::Path::new(&image_locator).exists());
        assert!(warnings.iter().any(|warning| warning.contains("falling back to local")));
        Ok(())
    }

    #[test]
    fn both_backends_failing_surfaces_storage_failed() {
        let store = ArtifactStore::new(Box::new(FailingBackend), Some(Box::new(FailingBackend)));
        let mut warnings = Vec::new();
        let err = store
            .store("gen-3", &sample_png(32, 32), &mut warnings)
            .unwrap_err();
        match err {
            StudioError::StorageFailed { cause } => {
                assert!(cause.contains("backend offline"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn no_fallback_configured_fails_directly() {
        let store = ArtifactStore::new(Box::new(FailingBackend), None);
        let mut warnings = Vec::new();
        let err = store
            .store("gen-4", &sample_png(32, 32), &mut warnings)
            .unwrap_err();
        assert!(matches!(err, StudioError::StorageFailed { .. }));
        assert!(warnings.is_empty());
    }

    #[test]
    fn undecodable_bytes_surface_storage_failed() {
        let temp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(Box::new(LocalBackend::new(temp.path())), None);
        let mut warnings = Vec::new();
        let err = store
            .store("gen-5", b"definitely not a png", &mut warnings)
            .unwrap_err();
        match err {
            StudioError::StorageFailed { cause } => assert!(cause.contains("decode")),
            other => panic!("unexpected error: {other}"),
        }
    }
}
