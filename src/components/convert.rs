//! Conversion of downloaded binaries into the canonical catalogue format.
//!
//! The contract the rest of the pipeline relies on: given an input file,
//! produce the output at the caller-derived sharded path and expose the
//! canonical extension. Encoding goes through an external `magick`
//! subprocess; quality and lossless switches come from config.

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use once_cell::sync::OnceCell;
use tokio::process::Command;
use tracing::{debug, info};

use crate::application::{Application, Component, RegistryError, ServiceHandle};
use crate::infrastructure::config::ImageConvertConfig;

pub const COMPONENT_ID: &str = "image-convert";
pub const SERVICE_ID: &str = "image-convert";

const OUTPUT_EXTENSION: &str = "heic";
const CONVERTER_BIN: &str = "magick";

pub struct ImageConvert {
    config: OnceCell<ImageConvertConfig>,
}

impl ImageConvert {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { config: OnceCell::new() })
    }

    /// Extension of every produced artifact, without the dot.
    pub fn extension(&self) -> &'static str {
        OUTPUT_EXTENSION
    }

    /// Convert `input` into `output`. An already-existing output is treated
    /// as done: the download pipeline may retry a partially committed row.
    pub async fn convert(&self, input: &Path, output: &Path) -> Result<()> {
        let config = self.config.get().context("image converter not loaded")?;
        if let Some(dir) = output.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("create output dir {}", dir.display()))?;
        }
        if tokio::fs::try_exists(output).await.unwrap_or(false) {
            debug!(output = %output.display(), "output already exists, skipping conversion");
            return Ok(());
        }
        let args = converter_args(input, output, config);
        let result = Command::new(CONVERTER_BIN)
            .args(&args)
            .output()
            .await
            .with_context(|| format!("spawn {CONVERTER_BIN}"))?;
        if !result.status.success() {
            bail!(
                "{CONVERTER_BIN} failed for {}: {}",
                input.display(),
                String::from_utf8_lossy(&result.stderr).trim()
            );
        }
        Ok(())
    }
}

fn converter_args(input: &Path, output: &Path, config: &ImageConvertConfig) -> Vec<String> {
    let mut args = vec![input.display().to_string()];
    if config.lossless_mode_enabled {
        args.push("-define".to_string());
        args.push("heic:lossless=true".to_string());
    } else {
        args.push("-quality".to_string());
        args.push(config.quality.to_string());
    }
    args.push(output.display().to_string());
    args
}

#[async_trait]
impl Component for ImageConvert {
    fn id(&self) -> &'static str {
        COMPONENT_ID
    }

    fn name(&self) -> &'static str {
        "image converter"
    }

    async fn load(self: Arc<Self>, app: &Arc<Application>) -> anyhow::Result<()> {
        let image_dir = &app.config().image_dir;
        tokio::fs::create_dir_all(image_dir)
            .await
            .with_context(|| format!("create image dir {}", image_dir.display()))?;
        self.config
            .set(app.config().image_converter.clone())
            .map_err(|_| anyhow::anyhow!("image converter already loaded"))?;
        info!(quality = app.config().image_converter.quality, "image converter ready");
        Ok(())
    }

    async fn unload(self: Arc<Self>) {}

    fn service(self: Arc<Self>, service_id: &str) -> Result<ServiceHandle, RegistryError> {
        if service_id == SERVICE_ID {
            Ok(self)
        } else {
            Err(RegistryError::UnknownService {
                component: COMPONENT_ID.to_string(),
                service: service_id.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn lossy_args_carry_quality() {
        let config = ImageConvertConfig { quality: 75, lossless_mode_enabled: false };
        let args = converter_args(
            &PathBuf::from("/tmp/in.png"),
            &PathBuf::from("/tmp/out.heic"),
            &config,
        );
        assert_eq!(args, vec!["/tmp/in.png", "-quality", "75", "/tmp/out.heic"]);
    }

    #[test]
    fn lossless_args_skip_quality() {
        let config = ImageConvertConfig { quality: 75, lossless_mode_enabled: true };
        let args = converter_args(
            &PathBuf::from("/tmp/in.png"),
            &PathBuf::from("/tmp/out.heic"),
            &config,
        );
        assert_eq!(
            args,
            vec!["/tmp/in.png", "-define", "heic:lossless=true", "/tmp/out.heic"]
        );
    }

    #[tokio::test]
    async fn existing_output_short_circuits() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("ab/cd/ef/x.heic");
        tokio::fs::create_dir_all(output.parent().unwrap()).await.unwrap();
        tokio::fs::write(&output, b"already converted").await.unwrap();

        let convert = ImageConvert::new();
        convert
            .config
            .set(ImageConvertConfig { quality: 80, lossless_mode_enabled: false })
            .unwrap();
        // Input does not exist; only the short-circuit makes this succeed.
        convert
            .convert(&dir.path().join("missing.png"), &output)
            .await
            .unwrap();
    }
}
