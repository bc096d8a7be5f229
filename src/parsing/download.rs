//! Fetch the MNIST IDX files when they are not already on disk.

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

use flate2::read::GzDecoder;

use super::mnist::{gz_path, TEST_IMAGES, TEST_LABELS, TRAIN_IMAGES, TRAIN_LABELS};
use crate::error::{Error, Result};

// CVDF mirror of http://yann.lecun.com/exdb/mnist/
const URL: &str = "https://storage.googleapis.com/cvdf-datasets/mnist/";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const READ_TIMEOUT: Duration = Duration::from_secs(60);

fn agent() -> &'static ureq::Agent {
    static AGENT: OnceLock<ureq::Agent> = OnceLock::new();
    AGENT.get_or_init(|| {
        ureq::AgentBuilder::new()
            .timeout_connect(CONNECT_TIMEOUT)
            .timeout_read(READ_TIMEOUT)
            .build()
    })
}

/// Download every split file missing from `dir`, storing it decompressed.
/// Files already present (plain or gzipped) are left alone.
pub fn download(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).map_err(|err| Error::io(dir, err))?;

    for name in [TRAIN_IMAGES, TRAIN_LABELS, TEST_IMAGES, TEST_LABELS] {
        let dest = dir.join(name);
        if dest.exists() || gz_path(&dest).exists() {
            tracing::debug!("{} already present", dest.display());
            continue;
        }

        download_file(name, &dest)?;
    }

    Ok(())
}

fn download_file(name: &str, dest: &Path) -> Result<()> {
    let url = format!("{URL}{name}.gz");
    tracing::info!("Downloading {url}");

    let response = agent().get(&url).call().map_err(|err| Error::Download {
        url: url.clone(),
        reason: err.to_string(),
    })?;

    store_gunzipped(response.into_reader(), &url, dest)
}

/// Decompress `reader` into `dest`. Partial downloads never carry the final name.
fn store_gunzipped<R: Read>(reader: R, url: &str, dest: &Path) -> Result<()> {
    let partial = dest.with_extension("part");
    let mut output = File::create(&partial).map_err(|err| Error::io(&partial, err))?;

    if let Err(err) = io::copy(&mut GzDecoder::new(reader), &mut output) {
        drop(output);
        if let Err(remove_err) = fs::remove_file(&partial) {
            tracing::warn!("Failed to remove {}: {remove_err}", partial.display());
        }
        return Err(Error::Download {
            url: url.to_string(),
            reason: err.to_string(),
        });
    }

    fs::rename(&partial, dest).map_err(|err| Error::io(dest, err))?;

    Ok(())
}
