use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use color_eyre::eyre::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::domain::scripts::DEFAULT_KNOWN_SUBDIR;

const PYTHON_ENV: &str = "TRAINSCOPE_PYTHON";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Train,
    Predict,
    Visualize,
    ViewResults,
}

pub const JOB_KIND_LIST: [JobKind; 4] = [
    JobKind::Train,
    JobKind::Predict,
    JobKind::Visualize,
    JobKind::ViewResults,
];

impl JobKind {
    pub fn label(self) -> &'static str {
        match self {
            JobKind::Train => "Training",
            JobKind::Predict => "Prediction",
            JobKind::Visualize => "3D Visualization",
            JobKind::ViewResults => "Results Viewer",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::Train => "train",
            JobKind::Predict => "predict",
            JobKind::Visualize => "visualize",
            JobKind::ViewResults => "view",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "train" | "training" => Some(JobKind::Train),
            "predict" | "prediction" => Some(JobKind::Predict),
            "visualize" | "visualization" | "3d" => Some(JobKind::Visualize),
            "view" | "view_results" | "results" => Some(JobKind::ViewResults),
            _ => None,
        }
    }
}

/// Script file names per job kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptNames {
    pub train: String,
    pub predict: String,
    pub visualize: String,
    pub view_results: String,
    /// Its folder becomes the working directory of every job.
    pub sentinel: String,
}

impl Default for ScriptNames {
    fn default() -> Self {
        Self {
            train: "stock_net.py".to_string(),
            predict: "predict.py".to_string(),
            visualize: "gradient_descent_3d.py".to_string(),
            view_results: "view_results.py".to_string(),
            sentinel: "stock_gui.py".to_string(),
        }
    }
}

impl ScriptNames {
    pub fn for_job(&self, kind: JobKind) -> &str {
        match kind {
            JobKind::Train => &self.train,
            JobKind::Predict => &self.predict,
            JobKind::Visualize => &self.visualize,
            JobKind::ViewResults => &self.view_results,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Interpreter for `.py` jobs. Empty means "detect".
    pub interpreter: String,
    pub scripts: ScriptNames,
    pub known_subdir: String,
    pub sync_timeout_secs: u64,
    pub visualize_timeout_secs: u64,
    pub playback_interval_ms: u64,
    pub default_sampling_interval: usize,
    /// Saved runs land here; relative paths resolve against the working
    /// directory of launched jobs.
    pub runs_dir: PathBuf,
    /// Training job started from the TUI.
    pub training: Option<TrainingJob>,
    /// Recording replayed from the TUI.
    pub model_dir: Option<PathBuf>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            interpreter: String::new(),
            scripts: ScriptNames::default(),
            known_subdir: DEFAULT_KNOWN_SUBDIR.to_string(),
            sync_timeout_secs: 30,
            visualize_timeout_secs: 120,
            playback_interval_ms: 50,
            default_sampling_interval: 10,
            runs_dir: PathBuf::from("runs"),
            training: None,
            model_dir: None,
        }
    }
}

impl SupervisorConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)
            .wrap_err_with(|| format!("failed to read config file {}", path.display()))?;
        serde_json::from_str(&data)
            .wrap_err_with(|| format!("failed to parse config file {}", path.display()))
    }

    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).wrap_err("failed to serialize config")?;
        fs::write(path, json)
            .wrap_err_with(|| format!("failed to write config to {}", path.display()))
    }

    /// `TRAINSCOPE_PYTHON`, then the configured interpreter, then
    /// `PYTHON`/`PYTHON3`, then `python3`.
    pub fn interpreter(&self) -> String {
        if let Ok(cmd) = std::env::var(PYTHON_ENV) {
            if !cmd.trim().is_empty() {
                return cmd;
            }
        }
        if !self.interpreter.trim().is_empty() {
            return self.interpreter.clone();
        }
        std::env::var("PYTHON")
            .or_else(|_| std::env::var("PYTHON3"))
            .unwrap_or_else(|_| "python3".to_string())
    }

    pub fn sync_timeout(&self, kind: JobKind) -> Duration {
        match kind {
            JobKind::Visualize => Duration::from_secs(self.visualize_timeout_secs),
            _ => Duration::from_secs(self.sync_timeout_secs),
        }
    }

    pub fn playback_interval(&self) -> Duration {
        Duration::from_millis(self.playback_interval_ms.max(1))
    }

    pub fn runs_dir(&self, working_dir: &Path) -> PathBuf {
        if self.runs_dir.is_absolute() {
            self.runs_dir.clone()
        } else {
            working_dir.join(&self.runs_dir)
        }
    }

    pub fn script_names(&self) -> impl Iterator<Item = &str> {
        JOB_KIND_LIST
            .iter()
            .map(move |kind| self.scripts.for_job(*kind))
    }
}

/// Argument vector for the training script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingJob {
    pub data_file: PathBuf,
    pub x_features: Vec<String>,
    pub y_feature: String,
    pub hidden_size: u32,
    pub learning_rate: f64,
    pub batch_size: u32,
}

impl TrainingJob {
    pub fn args(&self) -> Vec<String> {
        vec![
            "--data_file".to_string(),
            self.data_file.to_string_lossy().into_owned(),
            "--x_features".to_string(),
            self.x_features.join(","),
            "--y_feature".to_string(),
            self.y_feature.clone(),
            "--hidden_size".to_string(),
            self.hidden_size.to_string(),
            "--learning_rate".to_string(),
            self.learning_rate.to_string(),
            "--batch_size".to_string(),
            self.batch_size.to_string(),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionJob {
    pub input_file: PathBuf,
    pub model_dir: PathBuf,
    /// Defaults to the model directory.
    pub output_dir: Option<PathBuf>,
    pub x_features: Vec<String>,
    pub y_feature: String,
}

impl PredictionJob {
    pub fn args(&self) -> Vec<String> {
        let output_dir = self.output_dir.as_ref().unwrap_or(&self.model_dir);
        vec![
            self.input_file.to_string_lossy().into_owned(),
            "--model_dir".to_string(),
            self.model_dir.to_string_lossy().into_owned(),
            "--output_dir".to_string(),
            output_dir.to_string_lossy().into_owned(),
            "--x_features".to_string(),
            self.x_features.join(","),
            "--y_feature".to_string(),
            self.y_feature.clone(),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VisualizationJob {
    pub model_dir: PathBuf,
    pub color: String,
    pub point_size: u32,
    pub line_width: u32,
    pub surface_alpha: f64,
    pub w1_range: (f64, f64),
    pub w2_range: (f64, f64),
    pub n_points: u32,
    pub view_elev: f64,
    pub view_azim: f64,
    pub fps: u32,
    pub w1_index: usize,
    pub w2_index: usize,
    pub output_resolution: (u32, u32),
    pub save_png: bool,
    pub save_mpeg: bool,
}

impl Default for VisualizationJob {
    fn default() -> Self {
        Self {
            model_dir: PathBuf::new(),
            color: "viridis".to_string(),
            point_size: 8,
            line_width: 3,
            surface_alpha: 0.6,
            w1_range: (-2.0, 2.0),
            w2_range: (-2.0, 2.0),
            n_points: 30,
            view_elev: 30.0,
            view_azim: 45.0,
            fps: 30,
            w1_index: 0,
            w2_index: 0,
            output_resolution: (1200, 800),
            save_png: false,
            save_mpeg: false,
        }
    }
}

impl VisualizationJob {
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            "--model_dir".to_string(),
            self.model_dir.to_string_lossy().into_owned(),
            "--color".to_string(),
            self.color.clone(),
            "--point_size".to_string(),
            self.point_size.to_string(),
            "--line_width".to_string(),
            self.line_width.to_string(),
            "--surface_alpha".to_string(),
            self.surface_alpha.to_string(),
            "--w1_range".to_string(),
            self.w1_range.0.to_string(),
            self.w1_range.1.to_string(),
            "--w2_range".to_string(),
            self.w2_range.0.to_string(),
            self.w2_range.1.to_string(),
            "--n_points".to_string(),
            self.n_points.to_string(),
            "--view_elev".to_string(),
            self.view_elev.to_string(),
            "--view_azim".to_string(),
            self.view_azim.to_string(),
            "--fps".to_string(),
            self.fps.to_string(),
            "--w1_index".to_string(),
            self.w1_index.to_string(),
            "--w2_index".to_string(),
            self.w2_index.to_string(),
            "--output_resolution".to_string(),
            self.output_resolution.0.to_string(),
            self.output_resolution.1.to_string(),
        ];
        if self.save_png {
            args.push("--save_png".to_string());
        }
        if self.save_mpeg {
            args.push("--save_mpeg".to_string());
        }
        args
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewResultsJob {
    pub model_dir: PathBuf,
    pub plot_type: String,
    pub save_plot: bool,
}

impl ViewResultsJob {
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            "--model_dir".to_string(),
            self.model_dir.to_string_lossy().into_owned(),
            "--plot_type".to_string(),
            self.plot_type.clone(),
        ];
        if self.save_plot {
            args.push("--save_plot".to_string());
        }
        args
    }
}
