use std::path::PathBuf;

use ndarray::{Array1, Array3, ArrayView2, Axis};

use crate::error::{Error, Result};

pub mod download;
pub mod mnist;

pub const IMAGE_HEIGHT: usize = 28;
pub const IMAGE_WIDTH: usize = 28;
pub const NUM_CLASSES: usize = 10;

/// A labelled split held in memory.
/// Images are stored as raw pixels, normalization happens in the pipeline.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub images: Array3<u8>,
    pub labels: Array1<u8>,
}

impl Dataset {
    /// Build a dataset, checking that counts agree and every label is a valid class.
    pub fn new(images: Array3<u8>, labels: Array1<u8>) -> Result<Dataset> {
        if images.len_of(Axis(0)) != labels.len() {
            return Err(Error::LengthMismatch {
                images: images.len_of(Axis(0)),
                labels: labels.len(),
            });
        }
        if let Some(&label) = labels.iter().find(|&&l| l as usize >= NUM_CLASSES) {
            return Err(Error::InvalidLabel {
                label: label as usize,
                num_classes: NUM_CLASSES,
            });
        }

        Ok(Dataset { images, labels })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn image(&self, idx: usize) -> ArrayView2<u8> {
        self.images.index_axis(Axis(0), idx)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Split {
    Train,
    Test,
}

impl std::fmt::Display for Split {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Split::Train => write!(f, "train"),
            Split::Test => write!(f, "test"),
        }
    }
}

/// Public datasets this trainer knows how to locate.
#[derive(clap::ValueEnum, serde::Serialize, serde::Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum DatasetName {
    Mnist,
}

/// Where the raw split files live on disk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DataSource {
    /// A directory with the four standard IDX files (optionally gzipped)
    Idx { dir: PathBuf },
    /// Kaggle-style CSV files, one per split
    Csv { train: PathBuf, test: PathBuf },
}

/// Load one split from the given source
pub fn load(source: &DataSource, split: Split) -> Result<Dataset> {
    let dataset = match source {
        DataSource::Idx { dir } => {
            let (images, labels) = mnist::idx_file_names(split);
            mnist::parse_idx(&dir.join(images), &dir.join(labels))?
        }
        DataSource::Csv { train, test } => match split {
            Split::Train => mnist::parse_csv(train)?,
            Split::Test => mnist::parse_csv(test)?,
        },
    };

    tracing::info!("Loaded {} split: {} examples", split, dataset.len());

    Ok(dataset)
}
