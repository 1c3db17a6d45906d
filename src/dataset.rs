use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::ml::Tensor;

/// Class-per-directory image datasets.
pub mod image_folder;
/// Text datasets of raw pixel rows.
pub mod pixel_csv;

pub use image_folder::ImageFolder;
pub use pixel_csv::PixelCsv;

pub trait Stackable: Sized {
    type Output;
    fn stack(batch: Vec<Self>) -> Self::Output;
}

impl Stackable for Tensor {
    type Output = Tensor;
    fn stack(batch: Vec<Self>) -> Self::Output {
        assert!(!batch.is_empty(), "batch length is 0");

        for bs in batch.windows(2) {
            assert_eq!(
                bs[0].shape, bs[1].shape,
                "data shape is different, bs[0].shape={:?}, bs[1].shape={:?}",
                bs[0].shape, bs[1].shape
            );
        }

        let mut shape = vec![batch.len()];
        shape.extend_from_slice(&batch[0].shape);

        let mut data = Vec::with_capacity(batch.len() * batch[0].len());
        for b in batch {
            data.extend(b.data);
        }

        Tensor::new(data, shape)
    }
}

pub trait Dataset {
    type Item: Stackable;

    fn len(&self) -> usize;
    fn get(&self, index: usize) -> Self::Item;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A dataset of labeled images with a fixed, ordered class list.
pub trait ClassificationDataset: Dataset<Item = Sample> {
    fn classes(&self) -> &[String];

    fn num_classes(&self) -> usize {
        self.classes().len()
    }
}

/// One labeled image. After batching, `image` is `[N, C, H, W]` and
/// `label` is `[N, classes]` (one-hot) or `[N, 1]` for binary tasks.
#[derive(Clone, Debug, Stackable)]
pub struct Sample {
    pub image: Tensor,
    pub label: Tensor,
}

/// Encodes a class index as the training target: one-hot over
/// `num_classes` when there are more than two classes, otherwise a single
/// 0/1 value for a one-logit binary head.
pub fn encode_label(index: usize, num_classes: usize) -> Tensor {
    if num_classes > 2 {
        let mut one_hot = vec![0.0; num_classes];
        one_hot[index] = 1.0;
        Tensor::new(one_hot, vec![num_classes])
    } else {
        Tensor::new(vec![index as f32], vec![1])
    }
}

/// Input geometry and per-channel normalization applied to every image.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImageSpec {
    pub channels: usize,
    pub height: usize,
    pub width: usize,
    pub mean: Vec<f32>,
    pub std: Vec<f32>,
}

impl ImageSpec {
    /// Square images with the usual normalization for the channel count:
    /// ImageNet statistics for RGB, 0.5/0.5 for grayscale.
    pub fn square(channels: usize, size: usize) -> Result<Self> {
        let (mean, std) = match channels {
            1 => (vec![0.5], vec![0.5]),
            3 => (vec![0.485, 0.456, 0.406], vec![0.229, 0.224, 0.225]),
            other => {
                return Err(Error::Config(format!(
                    "images must have 1 or 3 channels, got {other}"
                )))
            }
        };
        if size == 0 {
            return Err(Error::Config("image size must be positive".into()));
        }
        Ok(Self {
            channels,
            height: size,
            width: size,
            mean,
            std,
        })
    }

    /// Checks that the geometry is non-empty and every channel has a mean
    /// and a positive std.
    pub fn validate(&self) -> Result<()> {
        if self.channels == 0 || self.height == 0 || self.width == 0 {
            return Err(Error::Config(format!(
                "image shape {:?} must not be empty",
                self.shape()
            )));
        }
        if self.mean.len() != self.channels || self.std.len() != self.channels {
            return Err(Error::Config(format!(
                "{} channels need as many means and stds, got {} and {}",
                self.channels,
                self.mean.len(),
                self.std.len()
            )));
        }
        if self.std.iter().any(|s| !(*s > 0.0)) {
            return Err(Error::Config(format!("std {:?} must be positive", self.std)));
        }
        Ok(())
    }

    /// `[C, H, W]`
    pub fn shape(&self) -> Vec<usize> {
        vec![self.channels, self.height, self.width]
    }

    pub fn pixels(&self) -> usize {
        self.channels * self.height * self.width
    }

    /// Scales CHW bytes to [0, 1] and normalizes each channel in place.
    pub fn normalize(&self, chw: &mut [f32]) {
        let area = self.height * self.width;
        for (c, plane) in chw.chunks_mut(area).enumerate() {
            for v in plane.iter_mut() {
                *v = (*v / 255.0 - self.mean[c]) / self.std[c];
            }
        }
    }
}

/// Either on-disk dataset layout, chosen by [`open_dataset`].
pub enum LabeledImages {
    Folder(ImageFolder),
    Csv(PixelCsv),
}

impl Dataset for LabeledImages {
    type Item = Sample;

    fn len(&self) -> usize {
        match self {
            LabeledImages::Folder(d) => d.len(),
            LabeledImages::Csv(d) => d.len(),
        }
    }

    fn get(&self, index: usize) -> Sample {
        match self {
            LabeledImages::Folder(d) => d.get(index),
            LabeledImages::Csv(d) => d.get(index),
        }
    }
}

impl ClassificationDataset for LabeledImages {
    fn classes(&self) -> &[String] {
        match self {
            LabeledImages::Folder(d) => d.classes(),
            LabeledImages::Csv(d) => d.classes(),
        }
    }
}

/// Opens a directory as an [`ImageFolder`] and a file as a [`PixelCsv`].
/// `num_classes` declares the class count of a pixel CSV; folders take their
/// classes from their subdirectories.
pub fn open_dataset(
    path: &Path,
    spec: &ImageSpec,
    num_classes: Option<usize>,
) -> Result<LabeledImages> {
    if path.is_dir() {
        Ok(LabeledImages::Folder(ImageFolder::open(path, spec)?))
    } else if path.is_file() {
        Ok(LabeledImages::Csv(PixelCsv::open(path, spec, num_classes)?))
    } else {
        Err(Error::Dataset(format!("{} does not exist", path.display())))
    }
}

/// Opens `root/train` and `root/test` (either layout) and checks that both
/// splits share the same class list. A pixel CSV test split is read with the
/// class count of the training split.
pub fn open_splits(
    root: &Path,
    spec: &ImageSpec,
    num_classes: Option<usize>,
) -> Result<(LabeledImages, LabeledImages)> {
    let train = open_split(root, "train", spec, num_classes)?;
    let test = open_split(root, "test", spec, Some(train.num_classes()))?;
    if train.classes() != test.classes() {
        return Err(Error::Dataset(format!(
            "train classes {:?} differ from test classes {:?}",
            train.classes(),
            test.classes()
        )));
    }
    Ok((train, test))
}

fn open_split(
    root: &Path,
    split: &str,
    spec: &ImageSpec,
    num_classes: Option<usize>,
) -> Result<LabeledImages> {
    let dir = root.join(split);
    if dir.is_dir() {
        return open_dataset(&dir, spec, num_classes);
    }
    for ext in ["csv", "txt"] {
        let file = root.join(format!("{split}.{ext}"));
        if file.is_file() {
            return open_dataset(&file, spec, num_classes);
        }
    }
    Err(Error::Dataset(format!(
        "no {split} split under {} (expected {split}/ or {split}.csv)",
        root.display()
    )))
}

pub struct Dataloader<D>
where
    D: Dataset,
{
    dataset: D,
    batch_size: usize,
    drop_last: bool,
    shuffle: bool,
}

impl<D: Dataset> Dataloader<D> {
    pub fn new(dataset: D, batch_size: usize, drop_last: bool, shuffle: bool) -> Self {
        assert!(batch_size > 0, "batch size must be positive");
        Self {
            dataset,
            batch_size,
            drop_last,
            shuffle,
        }
    }

    pub fn iter_batch(&self) -> BatchIterator<'_, D> {
        let dataset_size = self.dataset.len();
        // popped from the back, so reverse to keep dataset order unshuffled
        let mut indices: Vec<usize> = (0..dataset_size).rev().collect();

        if self.shuffle {
            use crate::utills::rand::RngCore;
            crate::utills::rand::rng().shuffle(&mut indices);
        }

        BatchIterator {
            dataloader: self,
            drop_last: self.drop_last,
            batch_size: self.batch_size,
            indices,
        }
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.dataset.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dataset.len() == 0
    }

    /// Number of batches one pass yields.
    pub fn num_batches(&self) -> usize {
        let n = self.dataset.len();
        if self.drop_last {
            n / self.batch_size
        } else {
            n.div_ceil(self.batch_size)
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn dataset(&self) -> &D {
        &self.dataset
    }
}

pub struct BatchIterator<'a, D: Dataset> {
    dataloader: &'a Dataloader<D>,
    drop_last: bool,
    batch_size: usize,
    indices: Vec<usize>,
}

impl<'a, D: Dataset> Iterator for BatchIterator<'a, D> {
    type Item = <D::Item as Stackable>::Output;

    fn next(&mut self) -> Option<Self::Item> {
        let mut v = Vec::with_capacity(self.batch_size);
        for i in 0..self.batch_size {
            if let Some(index) = self.indices.pop() {
                let entry = self.dataloader.dataset.get(index);
                v.push(entry);
            } else {
                if i == 0 || self.drop_last {
                    return None;
                }
                break;
            }
        }

        Some(D::Item::stack(v))
    }
}

// Re-export the derive macro from stackable_derive
pub use stackable_derive::Stackable;
