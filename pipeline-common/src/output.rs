use {
    std::{fs, path::{Path, PathBuf}},
    tracing::info,
    image::RgbImage,
    anyhow::{Context, Result},
};

/// Directory that receives the PNG files of a run.
pub struct OutputDir {
    root: PathBuf,
}

impl OutputDir {
    pub fn create(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.exists() {
            fs::create_dir_all(&root)
                .with_context(|| format!("failed to create output directory {}", root.display()))?;
        }

        Ok(Self {
            root,
        })
    }

    pub fn path(&self, file_name: &str) -> PathBuf {
        self.root.join(file_name)
    }

    pub fn save(&self, image: &RgbImage, file_name: &str) -> Result<PathBuf> {
        let path = self.path(file_name);
        image.save(&path)
            .with_context(|| format!("failed to save image to {}", path.display()))?;
        info!("saved {} ({}x{})", path.display(), image.width(), image.height());
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use {
        image::Rgb,
        tempfile::tempdir,
        tracing_test::traced_test,
        super::*,
    };

    #[test]
    #[traced_test]
    fn save_creates_directory_and_png() {
        let dir = tempdir().unwrap();
        let output = OutputDir::create(dir.path().join("bulk_outputs")).unwrap();

        let image = RgbImage::from_pixel(4, 3, Rgb([10, 20, 30]));
        let path = output.save(&image, "01_base_image_1.png").unwrap();

        assert!(path.exists());
        let decoded = image::open(&path).unwrap().to_rgb8();
        assert_eq!(decoded.dimensions(), (4, 3));
        assert_eq!(decoded.get_pixel(2, 1), &Rgb([10, 20, 30]));
        assert!(logs_contain("01_base_image_1.png"));
    }

    #[test]
    fn existing_directory_is_reused() {
        let dir = tempdir().unwrap();
        let output = OutputDir::create(dir.path()).unwrap();
        assert_eq!(output.path("a.png"), dir.path().join("a.png"));
    }
}
