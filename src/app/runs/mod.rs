use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use color_eyre::eyre::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::app::metrics::{LossSample, WeightSample};

/// Increment this when the stored JSON schema changes.
pub const RUN_FILE_VERSION: u32 = 1;

fn default_run_version() -> u32 {
    0
}

/// A finished training run with its telemetry and captured output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedRun {
    #[serde(default = "default_run_version")]
    pub version: u32,
    pub id: String,
    pub job: String,
    pub timestamp: u64,
    pub duration_seconds: f64,
    #[serde(default)]
    pub exit_code: Option<i32>,
    pub losses: Vec<LossSample>,
    #[serde(default)]
    pub weights: Vec<WeightSample>,
    #[serde(default)]
    pub training_output: Vec<String>,
}

impl SavedRun {
    pub fn new(job: impl Into<String>, timestamp: u64, duration_seconds: f64) -> Self {
        Self {
            version: RUN_FILE_VERSION,
            id: format!("run_{timestamp}"),
            job: job.into(),
            timestamp,
            duration_seconds,
            exit_code: None,
            losses: Vec::new(),
            weights: Vec::new(),
            training_output: Vec::new(),
        }
    }

    pub fn file_name(&self) -> String {
        format!("{}.json", self.id)
    }

    pub fn final_loss(&self) -> Option<f64> {
        self.losses.last().map(|sample| sample.loss)
    }

    pub fn best_loss(&self) -> Option<f64> {
        self.losses
            .iter()
            .map(|sample| sample.loss)
            .filter(|loss| loss.is_finite())
            .min_by(f64::total_cmp)
    }

    pub fn summary(&self) -> String {
        let fmt_loss = |loss: Option<f64>| match loss {
            Some(loss) => format!("{loss:.6}"),
            None => "n/a".to_string(),
        };
        let exit = match self.exit_code {
            Some(code) => code.to_string(),
            None => "signal".to_string(),
        };
        format!(
            "{} [{}] {:.1}s, exit {}, {} loss samples (final {}, best {}), {} weight samples",
            self.id,
            self.job,
            self.duration_seconds,
            exit,
            self.losses.len(),
            fmt_loss(self.final_loss()),
            fmt_loss(self.best_loss()),
            self.weights.len()
        )
    }
}

pub fn load_saved_run(path: &Path) -> Result<SavedRun> {
    let data = fs::read_to_string(path)
        .wrap_err_with(|| format!("failed to read run file {}", path.display()))?;
    deserialize_saved_run(&data)
        .wrap_err_with(|| format!("failed to parse run file {}", path.display()))
}

pub fn deserialize_saved_run(data: &str) -> Result<SavedRun> {
    serde_json::from_str(data).wrap_err("failed to deserialize saved run contents")
}

/// Writes `run` into `dir`, creating it if needed, and returns the file path.
/// An existing file is never replaced: a second run with the same id gets a
/// `_2`, `_3`, ... suffix.
pub fn save_saved_run(dir: &Path, run: &SavedRun) -> Result<PathBuf> {
    fs::create_dir_all(dir)
        .wrap_err_with(|| format!("failed to create runs directory {}", dir.display()))?;
    let json = serde_json::to_string_pretty(run).wrap_err("failed to serialize saved run")?;

    let mut attempt = 1u32;
    loop {
        let path = match attempt {
            1 => dir.join(run.file_name()),
            n => dir.join(format!("{}_{n}.json", run.id)),
        };
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                file.write_all(json.as_bytes())
                    .wrap_err_with(|| format!("failed to write saved run to {}", path.display()))?;
                return Ok(path);
            }
            Err(error) if error.kind() == ErrorKind::AlreadyExists => attempt += 1,
            Err(error) => {
                return Err(error)
                    .wrap_err_with(|| format!("failed to create {}", path.display()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn saved_run_survives_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut run = SavedRun::new("Training", 1_700_000_000, 12.5);
        run.exit_code = Some(0);
        run.losses = vec![LossSample::new(0, 1.0), LossSample::new(1, 0.25)];
        run.weights = vec![WeightSample {
            epoch: 1,
            w1: 0.5,
            w2: -0.5,
        }];
        run.training_output = vec!["starting".into(), "! warning".into()];

        let path = save_saved_run(&dir.path().join("runs"), &run).unwrap();
        assert!(path.ends_with("run_1700000000.json"));
        assert_eq!(load_saved_run(&path).unwrap(), run);
    }

    #[test]
    fn older_files_without_optional_fields_still_load() {
        let run = deserialize_saved_run(
            r#"{ "id": "r", "job": "Training", "timestamp": 1, "duration_seconds": 0.5,
                 "losses": [{ "epoch": 0, "loss": 2.0 }] }"#,
        )
        .unwrap();
        assert_eq!(run.version, 0);
        assert!(run.weights.is_empty());
        assert_eq!(run.final_loss(), Some(2.0));
    }

    #[test]
    fn summary_reports_best_and_final_loss() {
        let mut run = SavedRun::new("Training", 5, 3.0);
        run.losses = vec![
            LossSample::new(0, 0.9),
            LossSample::new(1, 0.1),
            LossSample::new(2, 0.3),
        ];
        let summary = run.summary();
        assert!(summary.contains("final 0.300000"));
        assert!(summary.contains("best 0.100000"));
        assert!(summary.contains("exit signal"));
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(deserialize_saved_run("not json").is_err());
    }

    #[test]
    fn runs_in_the_same_second_keep_separate_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut first = SavedRun::new("Training", 1_700_000_000, 1.0);
        first.losses = vec![LossSample::new(0, 1.0)];
        let mut second = SavedRun::new("Training", 1_700_000_000, 2.0);
        second.losses = vec![LossSample::new(0, 0.5)];

        let first_path = save_saved_run(dir.path(), &first).unwrap();
        let second_path = save_saved_run(dir.path(), &second).unwrap();
        assert_ne!(first_path, second_path);
        assert!(second_path.ends_with("run_1700000000_2.json"));
        assert_eq!(load_saved_run(&first_path).unwrap(), first);
        assert_eq!(load_saved_run(&second_path).unwrap(), second);
    }
}
