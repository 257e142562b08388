//! Recorded training runs on disk, read-only.
//!
//! A model directory holds `training_losses.csv` (one row per epoch, training
//! loss in the first column) and a sparser set of weight snapshots named
//! `weights_history_<epoch>.npz`, either in a `weights_history/` folder or
//! next to the loss file. An `.npz` snapshot holds the `W1` and `W2` layer
//! arrays; they are flattened in that order. Plain `.csv` snapshots are read
//! when a directory has no `.npz` ones.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use ndarray::ArrayD;
use ndarray_npy::NpzReader;
use tracing::info;

use crate::domain::error::{SupervisorError, SupervisorResult};

pub const LOSS_FILE: &str = "training_losses.csv";
pub const SNAPSHOT_DIR: &str = "weights_history";
const SNAPSHOT_PREFIX: &str = "weights_history_";
const NPZ_EXTENSION: &str = "npz";
const CSV_EXTENSION: &str = "csv";
const NPZ_ARRAYS: [&str; 2] = ["W1", "W2"];

/// One recorded frame: the epoch it was captured at and the flattened
/// weight scalars. Its loss is looked up in the loss series, not stored.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightSnapshot {
    pub epoch: u64,
    pub weights: Vec<f64>,
}

impl WeightSnapshot {
    pub fn new(epoch: u64, weights: Vec<f64>) -> Self {
        Self { epoch, weights }
    }
}

/// Snapshots plus the dense per-epoch loss series they were sampled from.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Recording {
    pub snapshots: Vec<WeightSnapshot>,
    pub losses: Vec<f64>,
    pub sampling_interval: usize,
}

/// Reads a recording from `model_dir`. Without an explicit
/// `sampling_interval` the gap between the first two snapshot epochs is used,
/// then `default_interval`.
pub fn load_recording(
    model_dir: &Path,
    sampling_interval: Option<usize>,
    default_interval: usize,
) -> SupervisorResult<Recording> {
    let losses = read_loss_series(&model_dir.join(LOSS_FILE))?;
    let snapshots = read_snapshots(model_dir)?;
    let sampling_interval = sampling_interval
        .or_else(|| infer_sampling_interval(&snapshots))
        .unwrap_or(default_interval)
        .max(1);

    info!(
        dir = %model_dir.display(),
        frames = snapshots.len(),
        losses = losses.len(),
        sampling_interval,
        "loaded recording"
    );
    Ok(Recording {
        snapshots,
        losses,
        sampling_interval,
    })
}

pub fn infer_sampling_interval(snapshots: &[WeightSnapshot]) -> Option<usize> {
    match snapshots {
        [first, second, ..] if second.epoch > first.epoch => {
            usize::try_from(second.epoch - first.epoch).ok()
        }
        _ => None,
    }
}

pub fn read_loss_series(path: &Path) -> SupervisorResult<Vec<f64>> {
    let content = fs::read_to_string(path)
        .map_err(|error| SupervisorError::load(path, format!("cannot read loss file: {error}")))?;
    let mut losses = Vec::new();
    for (line_no, line) in content.lines().enumerate() {
        let mut fields = split_fields(line);
        let Some(first) = fields.next() else {
            continue;
        };
        let loss = first.parse::<f64>().map_err(|_| {
            SupervisorError::load(
                path,
                format!("line {}: '{first}' is not a number", line_no + 1),
            )
        })?;
        losses.push(loss);
    }
    Ok(losses)
}

pub fn read_snapshots(model_dir: &Path) -> SupervisorResult<Vec<WeightSnapshot>> {
    let nested = model_dir.join(SNAPSHOT_DIR);
    let search_dir = if nested.is_dir() { nested } else { model_dir.to_path_buf() };
    let files = snapshot_files(&search_dir)?;
    if files.is_empty() {
        return Err(SupervisorError::load(
            &search_dir,
            "no weights_history_*.npz or weights_history_*.csv snapshots found",
        ));
    }

    files
        .iter()
        .enumerate()
        .map(|(index, path)| {
            let weights = read_weights(path)?;
            let epoch = snapshot_epoch(path).unwrap_or(index as u64);
            Ok(WeightSnapshot::new(epoch, weights))
        })
        .collect()
}

fn snapshot_files(dir: &Path) -> SupervisorResult<Vec<PathBuf>> {
    let entries = fs::read_dir(dir)
        .map_err(|error| SupervisorError::load(dir, format!("cannot list snapshots: {error}")))?;
    let candidates: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .filter(|path| path.is_file() && file_name(path).starts_with(SNAPSHOT_PREFIX))
        .collect();
    let with_extension = |wanted: &str| -> Vec<PathBuf> {
        candidates
            .iter()
            .filter(|path| has_extension(path, wanted))
            .cloned()
            .collect()
    };
    let mut files = with_extension(NPZ_EXTENSION);
    if files.is_empty() {
        files = with_extension(CSV_EXTENSION);
    }
    files.sort_by_key(|path| natural_key(&file_name(path)));
    Ok(files)
}

fn has_extension(path: &Path, wanted: &str) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case(wanted))
        .unwrap_or(false)
}

fn snapshot_epoch(path: &Path) -> Option<u64> {
    let stem = path.file_stem()?.to_str()?;
    let digits: String = stem
        .strip_prefix(SNAPSHOT_PREFIX)?
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    digits.parse().ok()
}

fn read_weights(path: &Path) -> SupervisorResult<Vec<f64>> {
    let weights = if has_extension(path, NPZ_EXTENSION) {
        read_npz_weights(path)?
    } else {
        read_csv_weights(path)?
    };
    if weights.len() < 2 {
        return Err(SupervisorError::load(
            path,
            format!("expected at least 2 weights, found {}", weights.len()),
        ));
    }
    Ok(weights)
}

fn read_csv_weights(path: &Path) -> SupervisorResult<Vec<f64>> {
    let content = fs::read_to_string(path)
        .map_err(|error| SupervisorError::load(path, format!("cannot read snapshot: {error}")))?;
    content
        .lines()
        .flat_map(split_fields)
        .map(|field| {
            field
                .parse::<f64>()
                .map_err(|_| SupervisorError::load(path, format!("'{field}' is not a number")))
        })
        .collect()
}

/// `W1` then `W2`, each in row-major order. Arrays saved as `float32` are
/// widened.
fn read_npz_weights(path: &Path) -> SupervisorResult<Vec<f64>> {
    let file = File::open(path)
        .map_err(|error| SupervisorError::load(path, format!("cannot read snapshot: {error}")))?;
    let mut npz = NpzReader::new(file)
        .map_err(|error| SupervisorError::load(path, format!("not an npz archive: {error}")))?;
    let names = npz
        .names()
        .map_err(|error| SupervisorError::load(path, format!("cannot list arrays: {error}")))?;

    let mut weights = Vec::new();
    for array in NPZ_ARRAYS {
        let Some(name) = names
            .iter()
            .find(|name| name.strip_suffix(".npy").unwrap_or(name.as_str()) == array)
        else {
            return Err(SupervisorError::load(path, format!("array '{array}' is missing")));
        };
        let values: ArrayD<f64> = match npz.by_name(name) {
            Ok(values) => values,
            Err(_) => {
                let narrow: ArrayD<f32> = npz.by_name(name).map_err(|error| {
                    SupervisorError::load(path, format!("array '{array}': {error}"))
                })?;
                narrow.mapv(f64::from)
            }
        };
        weights.extend(values.iter().copied());
    }
    Ok(weights)
}

fn split_fields(line: &str) -> impl Iterator<Item = &str> {
    line.split(|ch: char| ch == ',' || ch.is_whitespace())
        .filter(|field| !field.is_empty())
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Sort key that orders embedded numbers by value: `_9` before `_10`.
fn natural_key(s: &str) -> Vec<(String, u64)> {
    let mut parts = Vec::new();
    let mut current_alpha = String::new();
    let mut current_num = String::new();

    for ch in s.chars() {
        if ch.is_ascii_digit() {
            if !current_alpha.is_empty() {
                parts.push((std::mem::take(&mut current_alpha), 0));
            }
            current_num.push(ch);
        } else {
            if !current_num.is_empty() {
                parts.push((String::new(), current_num.parse().unwrap_or(u64::MAX)));
                current_num.clear();
            }
            current_alpha.push(ch);
        }
    }
    if !current_alpha.is_empty() {
        parts.push((current_alpha, 0));
    }
    if !current_num.is_empty() {
        parts.push((String::new(), current_num.parse().unwrap_or(u64::MAX)));
    }
    parts
}
