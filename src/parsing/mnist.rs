use super::{Dataset, Split, IMAGE_HEIGHT, IMAGE_WIDTH, NUM_CLASSES};
use crate::error::{Error, Result};
use csv::StringRecord;
use flate2::read::GzDecoder;
use ndarray::{Array1, Array3};
use std::fs::{self, File};
use std::io::{self, BufReader, ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::str::FromStr;

const NUM_FEATURES: usize = IMAGE_HEIGHT * IMAGE_WIDTH;
const LINE_SIZE: usize = NUM_FEATURES + 1;

const IMAGES_MAGIC: u32 = 0x0000_0803;
const LABELS_MAGIC: u32 = 0x0000_0801;
const IMAGES_HEADER_LEN: usize = 16;
const LABELS_HEADER_LEN: usize = 8;

pub const TRAIN_IMAGES: &str = "train-images-idx3-ubyte";
pub const TRAIN_LABELS: &str = "train-labels-idx1-ubyte";
pub const TEST_IMAGES: &str = "t10k-images-idx3-ubyte";
pub const TEST_LABELS: &str = "t10k-labels-idx1-ubyte";

/// File names of the (images, labels) pair for a split
pub fn idx_file_names(split: Split) -> (&'static str, &'static str) {
    match split {
        Split::Train => (TRAIN_IMAGES, TRAIN_LABELS),
        Split::Test => (TEST_IMAGES, TEST_LABELS),
    }
}

/// Parse an IDX image file and its matching label file.
/// Either file may be stored gzipped next to the expected name (`<name>.gz`).
pub fn parse_idx(images_path: &Path, labels_path: &Path) -> Result<Dataset> {
    let image_bytes = read_maybe_gz(images_path)?;
    let label_bytes = read_maybe_gz(labels_path)?;

    let images = decode_images(&image_bytes).map_err(|reason| Error::Idx {
        path: images_path.to_path_buf(),
        reason,
    })?;
    let labels = decode_labels(&label_bytes).map_err(|reason| Error::Idx {
        path: labels_path.to_path_buf(),
        reason,
    })?;

    Dataset::new(images, labels)
}

pub(crate) fn gz_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".gz");
    PathBuf::from(name)
}

fn read_maybe_gz(path: &Path) -> Result<Vec<u8>> {
    if path.exists() {
        return fs::read(path).map_err(|err| Error::io(path, err));
    }

    let gz = gz_path(path);
    let file = File::open(&gz).map_err(|err| match err.kind() {
        ErrorKind::NotFound => Error::io(
            path,
            io::Error::new(ErrorKind::NotFound, "file not found (nor gzipped)"),
        ),
        _ => Error::io(&gz, err),
    })?;
    let mut bytes = Vec::new();
    GzDecoder::new(BufReader::new(file))
        .read_to_end(&mut bytes)
        .map_err(|err| Error::io(&gz, err))?;

    Ok(bytes)
}

/// Read the `idx`-th big-endian u32 of the header
fn header_field(bytes: &[u8], idx: usize) -> std::result::Result<usize, String> {
    bytes
        .get(idx * 4..idx * 4 + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]) as usize)
        .ok_or_else(|| "truncated header".to_string())
}

fn check_magic(bytes: &[u8], expected: u32) -> std::result::Result<(), String> {
    let magic = header_field(bytes, 0)?;
    if magic != expected as usize {
        return Err(format!(
            "bad magic number {magic:#010x}, expected {expected:#010x}"
        ));
    }
    Ok(())
}

fn decode_images(bytes: &[u8]) -> std::result::Result<Array3<u8>, String> {
    check_magic(bytes, IMAGES_MAGIC)?;
    let count = header_field(bytes, 1)?;
    let rows = header_field(bytes, 2)?;
    let cols = header_field(bytes, 3)?;

    if (rows, cols) != (IMAGE_HEIGHT, IMAGE_WIDTH) {
        return Err(format!(
            "images are {rows}x{cols}, expected {IMAGE_HEIGHT}x{IMAGE_WIDTH}"
        ));
    }

    let payload = &bytes[IMAGES_HEADER_LEN..];
    let expected = count * rows * cols;
    if payload.len() != expected {
        return Err(format!(
            "expected {expected} bytes of pixel data, found {}",
            payload.len()
        ));
    }

    Array3::from_shape_vec((count, rows, cols), payload.to_vec()).map_err(|err| err.to_string())
}

fn decode_labels(bytes: &[u8]) -> std::result::Result<Array1<u8>, String> {
    check_magic(bytes, LABELS_MAGIC)?;
    let count = header_field(bytes, 1)?;

    let payload = &bytes[LABELS_HEADER_LEN..];
    if payload.len() != count {
        return Err(format!(
            "expected {count} labels, found {}",
            payload.len()
        ));
    }

    Ok(Array1::from(payload.to_vec()))
}

/// Parse a record (e.g. CSV record) of the form <x1>,<x2>,...
/// Returns a vector of the xi's if the function was succesful
/// and None otherwise
fn parse_record<T: FromStr>(record: &StringRecord) -> Option<Vec<T>> {
    record.iter().map(|x| T::from_str(x.trim()).ok()).collect()
}

/// Parse a line in the dataset. Return the pixels and the label
/// Line is stored in the format: <label>,<pixel0x0>,<pixel0x1>,...
/// The dataset is taken from here https://www.kaggle.com/datasets/oddrationale/mnist-in-csv
fn parse_dataset_line(record: &StringRecord) -> std::result::Result<(Vec<u8>, u8), String> {
    if record.len() != LINE_SIZE {
        return Err(format!(
            "expected {LINE_SIZE} fields, found {}",
            record.len()
        ));
    }

    match parse_record::<u8>(record) {
        Some(v) if (v[0] as usize) < NUM_CLASSES => Ok((v[1..].to_vec(), v[0])),
        Some(v) => Err(format!("label {} is out of range for {NUM_CLASSES} classes", v[0])),
        None => Err("fields must be integers in 0..=255".to_string()),
    }
}

/// Return the dataset stored in a CSV file with a header row
pub fn parse_csv(path: &Path) -> Result<Dataset> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)?;
    let mut pixels = Vec::new();
    let mut labels = Vec::new();

    for (idx, record) in reader.records().enumerate() {
        let record = record?;
        let (row, label) = parse_dataset_line(&record).map_err(|reason| Error::Record {
            path: path.to_path_buf(),
            record: idx + 1,
            reason,
        })?;

        pixels.extend(row);
        labels.push(label);
    }

    let images = Array3::from_shape_vec((labels.len(), IMAGE_HEIGHT, IMAGE_WIDTH), pixels)?;

    Dataset::new(images, Array1::from(labels))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use flate2::{write::GzEncoder, Compression};
    use std::io::Write;

    pub(crate) fn idx_images(count: usize, fill: impl Fn(usize, usize) -> u8) -> Vec<u8> {
        let mut bytes = Vec::new();
        for field in [IMAGES_MAGIC, count as u32, IMAGE_HEIGHT as u32, IMAGE_WIDTH as u32] {
            bytes.extend(field.to_be_bytes());
        }
        for n in 0..count {
            for p in 0..NUM_FEATURES {
                bytes.push(fill(n, p));
            }
        }
        bytes
    }

    pub(crate) fn idx_labels(labels: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend(LABELS_MAGIC.to_be_bytes());
        bytes.extend((labels.len() as u32).to_be_bytes());
        bytes.extend_from_slice(labels);
        bytes
    }

    #[test]
    fn parses_idx_pair() {
        let dir = tempfile::tempdir().unwrap();
        let images = dir.path().join(TRAIN_IMAGES);
        let labels = dir.path().join(TRAIN_LABELS);
        fs::write(&images, idx_images(3, |n, p| (n * 10 + p % 7) as u8)).unwrap();
        fs::write(&labels, idx_labels(&[4, 0, 9])).unwrap();

        let dataset = parse_idx(&images, &labels).unwrap();

        assert_eq!(dataset.len(), 3);
        assert_eq!(dataset.labels.to_vec(), vec![4, 0, 9]);
        assert_eq!(dataset.images[[2, 0, 3]], 23);
        assert_eq!(dataset.images[[1, 1, 0]], 10 + (28 % 7) as u8);
    }

    #[test]
    fn reads_gzipped_files() {
        let dir = tempfile::tempdir().unwrap();
        let images = dir.path().join(TEST_IMAGES);
        let labels = dir.path().join(TEST_LABELS);

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&idx_images(2, |_, _| 255)).unwrap();
        fs::write(gz_path(&images), encoder.finish().unwrap()).unwrap();
        fs::write(&labels, idx_labels(&[1, 2])).unwrap();

        let dataset = parse_idx(&images, &labels).unwrap();

        assert_eq!(dataset.len(), 2);
        assert!(dataset.images.iter().all(|&p| p == 255));
    }

    #[test]
    fn rejects_bad_magic() {
        let dir = tempfile::tempdir().unwrap();
        let images = dir.path().join(TRAIN_IMAGES);
        let labels = dir.path().join(TRAIN_LABELS);
        fs::write(&images, idx_labels(&[1])).unwrap();
        fs::write(&labels, idx_labels(&[1])).unwrap();

        let err = parse_idx(&images, &labels).unwrap_err();
        assert!(matches!(err, Error::Idx { ref path, .. } if path == &images));
    }

    #[test]
    fn rejects_truncated_payload() {
        let dir = tempfile::tempdir().unwrap();
        let images = dir.path().join(TRAIN_IMAGES);
        let labels = dir.path().join(TRAIN_LABELS);
        let mut bytes = idx_images(2, |_, _| 0);
        bytes.truncate(bytes.len() - 5);
        fs::write(&images, bytes).unwrap();
        fs::write(&labels, idx_labels(&[1, 2])).unwrap();

        assert!(matches!(
            parse_idx(&images, &labels),
            Err(Error::Idx { .. })
        ));
    }

    #[test]
    fn rejects_wrong_image_size() {
        let dir = tempfile::tempdir().unwrap();
        let images = dir.path().join(TRAIN_IMAGES);
        let labels = dir.path().join(TRAIN_LABELS);
        let mut bytes = Vec::new();
        for field in [IMAGES_MAGIC, 1, 27, 28] {
            bytes.extend(field.to_be_bytes());
        }
        bytes.extend(vec![0u8; 27 * 28]);
        fs::write(&images, bytes).unwrap();
        fs::write(&labels, idx_labels(&[1])).unwrap();

        let err = parse_idx(&images, &labels).unwrap_err();
        assert!(matches!(err, Error::Idx { ref reason, .. } if reason.contains("27x28")));
    }

    #[test]
    fn rejects_truncated_header() {
        let dir = tempfile::tempdir().unwrap();
        let images = dir.path().join(TRAIN_IMAGES);
        let labels = dir.path().join(TRAIN_LABELS);
        fs::write(&images, idx_images(1, |_, _| 0)).unwrap();
        fs::write(&labels, LABELS_MAGIC.to_be_bytes()).unwrap();

        let err = parse_idx(&images, &labels).unwrap_err();
        assert!(matches!(
            err,
            Error::Idx { ref path, ref reason } if path == &labels && reason == "truncated header"
        ));
    }

    #[test]
    fn missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let images = dir.path().join("nope");
        let err = parse_idx(&images, &dir.path().join("nope2")).unwrap_err();
        assert!(matches!(err, Error::Io { ref path, .. } if path == &images));
    }

    #[test]
    fn unreadable_gz_reports_the_gz_path() {
        let dir = tempfile::tempdir().unwrap();
        let not_a_dir = dir.path().join("plain");
        fs::write(&not_a_dir, b"x").unwrap();
        let images = not_a_dir.join(TRAIN_IMAGES);

        let err = parse_idx(&images, &dir.path().join(TRAIN_LABELS)).unwrap_err();
        assert!(matches!(
            err,
            Error::Io { ref path, ref source } if path == &gz_path(&images)
                && source.kind() != ErrorKind::NotFound
        ));
    }

    fn csv_line(label: u8, pixel: u8) -> String {
        let mut fields = vec![label.to_string()];
        fields.extend((0..NUM_FEATURES).map(|_| pixel.to_string()));
        fields.join(",")
    }

    #[test]
    fn parses_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mnist_train.csv");
        let header: Vec<String> = std::iter::once("label".to_string())
            .chain((0..NUM_FEATURES).map(|i| format!("p{i}")))
            .collect();
        let contents = format!(
            "{}\n{}\n{}\n",
            header.join(","),
            csv_line(7, 12),
            csv_line(2, 200)
        );
        fs::write(&path, contents).unwrap();

        let dataset = parse_csv(&path).unwrap();

        assert_eq!(dataset.labels.to_vec(), vec![7, 2]);
        assert_eq!(dataset.images[[0, 27, 27]], 12);
        assert_eq!(dataset.images[[1, 0, 0]], 200);
    }

    #[test]
    fn csv_short_record_reports_position() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.csv");
        fs::write(&path, format!("header\n{}\n1,2,3\n", csv_line(1, 0))).unwrap();

        let err = parse_csv(&path).unwrap_err();
        assert!(matches!(err, Error::Record { record: 2, .. }));
    }

    #[test]
    fn csv_out_of_range_label_reports_position() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad_label.csv");
        fs::write(&path, format!("header\n{}\n", csv_line(12, 0))).unwrap();

        let err = parse_csv(&path).unwrap_err();
        assert!(matches!(
            err,
            Error::Record { record: 1, ref reason, .. } if reason.contains("label 12")
        ));
    }
}
