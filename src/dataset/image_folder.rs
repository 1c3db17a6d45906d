use std::fs;
use std::path::{Path, PathBuf};

use image::imageops::FilterType;
use tracing::{debug, info};

use super::{encode_label, ClassificationDataset, Dataset, ImageSpec, Sample};
use crate::error::{Error, Result};
use crate::ml::Tensor;

const EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "bmp"];

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
}

/// Decodes one image file, resizes it to `spec` and returns a normalized
/// `[C, H, W]` tensor.
pub fn load_image(path: &Path, spec: &ImageSpec) -> Result<Tensor> {
    let img = image::open(path).map_err(|source| Error::Image {
        path: path.to_path_buf(),
        source,
    })?;
    let img = img.resize_exact(spec.width as u32, spec.height as u32, FilterType::Triangle);

    // interleaved HWC bytes
    let hwc: Vec<u8> = match spec.channels {
        1 => img.to_luma8().into_raw(),
        _ => img.to_rgb8().into_raw(),
    };

    let area = spec.height * spec.width;
    let mut chw = vec![0.0; spec.pixels()];
    for (p, px) in hwc.chunks(spec.channels).enumerate() {
        for (c, &v) in px.iter().enumerate() {
            chw[c * area + p] = v as f32;
        }
    }
    spec.normalize(&mut chw);

    Ok(Tensor::new(chw, spec.shape()))
}

/// Images stored as `root/<class>/<file>`. Classes are the sorted
/// sub-directory names and every image is decoded up front.
pub struct ImageFolder {
    root: PathBuf,
    classes: Vec<String>,
    samples: Vec<(Tensor, usize)>,
}

impl ImageFolder {
    pub fn open(root: &Path, spec: &ImageSpec) -> Result<Self> {
        let mut class_dirs: Vec<(String, PathBuf)> = fs::read_dir(root)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_dir())
            .filter_map(|path| {
                let name = path.file_name()?.to_str()?.to_string();
                Some((name, path))
            })
            .collect();
        class_dirs.sort();

        if class_dirs.is_empty() {
            return Err(Error::Dataset(format!(
                "{} has no class sub-directories",
                root.display()
            )));
        }

        let mut samples = Vec::new();
        for (label, (name, dir)) in class_dirs.iter().enumerate() {
            let mut files: Vec<PathBuf> = fs::read_dir(dir)?
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.path())
                .filter(|path| path.is_file() && is_image(path))
                .collect();
            files.sort();
            debug!(class = %name, images = files.len(), "reading class directory");

            for file in files {
                samples.push((load_image(&file, spec)?, label));
            }
        }

        if samples.is_empty() {
            return Err(Error::Dataset(format!("{} contains no images", root.display())));
        }

        let classes: Vec<String> = class_dirs.into_iter().map(|(name, _)| name).collect();
        info!(
            root = %root.display(),
            classes = classes.len(),
            images = samples.len(),
            "loaded image folder"
        );

        Ok(Self {
            root: root.to_path_buf(),
            classes,
            samples,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl Dataset for ImageFolder {
    type Item = Sample;

    fn len(&self) -> usize {
        self.samples.len()
    }

    fn get(&self, index: usize) -> Sample {
        let (image, label) = &self.samples[index];
        Sample {
            image: image.clone(),
            label: encode_label(*label, self.classes.len()),
        }
    }
}

impl ClassificationDataset for ImageFolder {
    fn classes(&self) -> &[String] {
        &self.classes
    }
}
