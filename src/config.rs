//! Training configuration.
//!
//! Values come from the built-in defaults, optionally overlaid by a TOML file
//! and finally by command-line flags. Every section is `#[serde(default)]`,
//! so a file only needs the keys it changes.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::optim::AdamConfig;
use crate::model::ModelConfig;
use crate::parsing::{DataSource, DatasetName};
use crate::pipeline::augment::AugmentConfig;
use crate::pipeline::PipelineConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
    pub name: DatasetName,
    /// Directory holding the IDX files
    pub data_dir: PathBuf,
    /// Fetch missing IDX files before loading
    pub download: bool,
    pub train_csv: Option<PathBuf>,
    pub test_csv: Option<PathBuf>,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        DatasetConfig {
            name: DatasetName::Mnist,
            data_dir: PathBuf::from("data/mnist"),
            download: false,
            train_csv: None,
            test_csv: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitConfig {
    pub epochs: usize,
}

impl Default for FitConfig {
    fn default() -> Self {
        FitConfig { epochs: 30 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    pub model_dir: PathBuf,
    /// Per-epoch loss and accuracy, written as plain text
    pub history_path: Option<PathBuf>,
}

impl Default for ExportConfig {
    fn default() -> Self {
        ExportConfig {
            model_dir: PathBuf::from("model"),
            history_path: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub dataset: DatasetConfig,
    pub pipeline: PipelineConfig,
    pub augment: AugmentConfig,
    pub model: ModelConfig,
    pub optimizer: AdamConfig,
    pub training: FitConfig,
    pub export: ExportConfig,
}

impl TrainConfig {
    pub fn from_file(path: &Path) -> Result<TrainConfig> {
        let contents = fs::read_to_string(path).map_err(|err| Error::io(path, err))?;
        toml::from_str(&contents).map_err(|source| Error::Config {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<()> {
        self.pipeline.validate()?;
        self.augment.validate()?;
        self.model.validate()?;
        if self.optimizer.learning_rate <= 0.0 {
            return Err(Error::InvalidConfig("learning_rate must be positive".to_string()));
        }
        if self.training.epochs == 0 {
            return Err(Error::InvalidConfig("epochs must be positive".to_string()));
        }
        self.data_source().map(|_| ())
    }

    /// CSV files take precedence over the IDX directory, but only as a pair
    pub fn data_source(&self) -> Result<DataSource> {
        match (&self.dataset.train_csv, &self.dataset.test_csv) {
            (Some(train), Some(test)) => Ok(DataSource::Csv {
                train: train.clone(),
                test: test.clone(),
            }),
            (None, None) => Ok(DataSource::Idx {
                dir: self.dataset.data_dir.clone(),
            }),
            _ => Err(Error::InvalidConfig(
                "train_csv and test_csv must be given together".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_hyperparameters() {
        let config = TrainConfig::default();

        assert_eq!(config.pipeline.batch_size, 32);
        assert_eq!(config.training.epochs, 30);
        assert_eq!(config.optimizer.learning_rate, 1e-4);
        assert_eq!(config.augment.max_rotation_degrees, 25.0);
        assert_eq!(config.model.conv_filters, vec![32, 64, 128]);
        assert_eq!(config.export.model_dir, PathBuf::from("model"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.toml");
        fs::write(
            &path,
            "[pipeline]\nbatch_size = 64\n\n[augment]\ncontrast_upper = 2.0\n\n[model]\ninitialization = \"he-uniform\"\n",
        )
        .unwrap();

        let config = TrainConfig::from_file(&path).unwrap();

        assert_eq!(config.pipeline.batch_size, 64);
        assert_eq!(config.pipeline.prefetch, 2);
        assert_eq!(config.augment.contrast_upper, 2.0);
        assert_eq!(config.augment.contrast_lower, 0.5);
        assert_eq!(config.model.initialization, crate::model::InitMethod::HeUniform);
    }

    #[test]
    fn malformed_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        fs::write(&path, "[pipeline]\nbatch_size = \"many\"\n").unwrap();

        assert!(matches!(
            TrainConfig::from_file(&path),
            Err(Error::Config { path: p, .. }) if p == path
        ));
    }

    #[test]
    fn half_a_csv_pair_is_rejected() {
        let mut config = TrainConfig::default();
        config.dataset.train_csv = Some(PathBuf::from("train.csv"));

        assert!(config.data_source().is_err());

        config.dataset.test_csv = Some(PathBuf::from("test.csv"));
        assert!(matches!(config.data_source(), Ok(DataSource::Csv { .. })));
    }
}
