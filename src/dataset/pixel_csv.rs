use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use tracing::info;

use super::{encode_label, ClassificationDataset, Dataset, ImageSpec, Sample};
use crate::error::{Error, Result};
use crate::ml::Tensor;

/// Images stored one per line as `label,p0,p1,...` with pixel values in
/// 0..=255 laid out CHW (the MNIST-as-text convention). Classes are named
/// `"0"` to `"n-1"`, where `n` is the declared class count or, without one,
/// the largest label seen plus one.
pub struct PixelCsv {
    classes: Vec<String>,
    images: Vec<f32>,
    labels: Vec<usize>,
    shape: Vec<usize>,
}

impl PixelCsv {
    pub fn open(path: &Path, spec: &ImageSpec, num_classes: Option<usize>) -> Result<Self> {
        let file = File::open(path)?;
        Self::from_reader(BufReader::new(file), spec, num_classes)
            .map_err(|e| match e {
                Error::Dataset(msg) => Error::Dataset(format!("{}: {msg}", path.display())),
                other => other,
            })
    }

    pub fn from_reader<R: BufRead>(
        reader: R,
        spec: &ImageSpec,
        num_classes: Option<usize>,
    ) -> Result<Self> {
        let pixels = spec.pixels();
        let mut images = Vec::new();
        let mut labels = Vec::new();

        for (line_no, line) in reader.lines().enumerate() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let mut parts = line.split(',');
            let label = parts
                .next()
                .and_then(|s| s.trim().parse::<usize>().ok())
                .ok_or_else(|| Error::Dataset(format!("line {}: bad label", line_no + 1)))?;
            if let Some(n) = num_classes.filter(|&n| label >= n) {
                return Err(Error::Dataset(format!(
                    "line {}: label {label} out of range for {n} classes",
                    line_no + 1
                )));
            }

            let mut row = Vec::with_capacity(pixels);
            for px in parts {
                let v: f32 = px.trim().parse().map_err(|_| {
                    Error::Dataset(format!("line {}: bad pixel value {px:?}", line_no + 1))
                })?;
                row.push(v);
            }
            if row.len() != pixels {
                return Err(Error::Dataset(format!(
                    "line {}: expected {pixels} pixels for shape {:?}, found {}",
                    line_no + 1,
                    spec.shape(),
                    row.len()
                )));
            }
            spec.normalize(&mut row);
            images.extend(row);
            labels.push(label);
        }

        let num_classes = match (num_classes, labels.iter().max()) {
            (_, None) => return Err(Error::Dataset("no samples".into())),
            (Some(n), Some(_)) => n,
            (None, Some(max)) => max + 1,
        };
        if num_classes < 2 {
            return Err(Error::Dataset("need at least two classes".into()));
        }
        info!(samples = labels.len(), classes = num_classes, "loaded pixel rows");

        Ok(Self {
            classes: (0..num_classes).map(|c| c.to_string()).collect(),
            images,
            labels,
            shape: spec.shape(),
        })
    }
}

impl Dataset for PixelCsv {
    type Item = Sample;

    fn len(&self) -> usize {
        self.labels.len()
    }

    fn get(&self, index: usize) -> Sample {
        let size: usize = self.shape.iter().product();
        let image = Tensor::new(
            self.images[index * size..(index + 1) * size].to_vec(),
            self.shape.clone(),
        );
        Sample {
            image,
            label: encode_label(self.labels[index], self.classes.len()),
        }
    }
}

impl ClassificationDataset for PixelCsv {
    fn classes(&self) -> &[String] {
        &self.classes
    }
}
