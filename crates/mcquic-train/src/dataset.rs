//! Image sources for training and validation

use std::fs;
use std::path::{Path, PathBuf};

use mcquic_core::ImageTensor;
use mcquic_neural::load_image;

use crate::error::{Result, TrainError};

/// File extensions `ImageFolder` picks up, lowercase.
pub const IMAGE_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "bmp"];

/// Indexed collection of RGB images
pub trait Dataset: Send + Sync {
    /// Number of images
    fn len(&self) -> usize;

    /// True when there are no images
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Display name of an image, used for reports and reconstructions
    fn name(&self, index: usize) -> String;

    /// Load an image with samples in `[0, 1]`
    fn load(&self, index: usize) -> mcquic_core::Result<ImageTensor>;
}

/// Images in one directory, sorted by file name
#[derive(Debug, Clone)]
pub struct ImageFolder {
    root: PathBuf,
    paths: Vec<PathBuf>,
}

impl ImageFolder {
    /// Scan `root` (non-recursively) for images.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let mut paths = Vec::new();
        for entry in fs::read_dir(&root)? {
            let path = entry?.path();
            let is_image = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
                .unwrap_or(false);
            if is_image && path.is_file() {
                paths.push(path);
            }
        }
        if paths.is_empty() {
            return Err(TrainError::Data(format!("no images in {}", root.display())));
        }
        paths.sort();
        Ok(Self { root, paths })
    }

    /// Directory scanned.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Image paths.
    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }
}

impl Dataset for ImageFolder {
    fn len(&self) -> usize {
        self.paths.len()
    }

    fn name(&self, index: usize) -> String {
        self.paths
            .get(index)
            .and_then(|p| p.file_stem())
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("{:06}", index))
    }

    fn load(&self, index: usize) -> mcquic_core::Result<ImageTensor> {
        let path = self.paths.get(index).ok_or_else(|| {
            mcquic_core::Error::shape(format!("index < {}", self.paths.len()), index)
        })?;
        load_image(path)
    }
}

/// Images held in memory
#[derive(Debug, Clone, Default)]
pub struct InMemory {
    images: Vec<ImageTensor>,
}

impl InMemory {
    /// Wrap decoded images.
    pub fn new(images: Vec<ImageTensor>) -> Self {
        Self { images }
    }
}

impl Dataset for InMemory {
    fn len(&self) -> usize {
        self.images.len()
    }

    fn name(&self, index: usize) -> String {
        format!("{:06}", index)
    }

    fn load(&self, index: usize) -> mcquic_core::Result<ImageTensor> {
        self.images.get(index).cloned().ok_or_else(|| {
            mcquic_core::Error::shape(format!("index < {}", self.images.len()), index)
        })
    }
}
