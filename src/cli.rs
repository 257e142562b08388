use std::fs::{self, File};
use std::io::Write;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use chrono::Local;
use clap::{Parser, Subcommand};
use color_eyre::eyre::{eyre, Context, Result};
use crossterm::style::Stylize;

use trainscope::app::config::{PredictionJob, ViewResultsJob, VisualizationJob};
use trainscope::app::telemetry::{self, LiveSeries, TelemetryEvent};
use trainscope::app::{
    App, FrameView, JobKind, LossSample, PlaybackEngine, RenderSink, Sample, SupervisorConfig,
    TrainingJob,
};
use trainscope::domain::process::{exit_diagnosis, ProcessLauncher};
use trainscope::ui::loss_label;

const DRAIN_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Parser)]
#[command(name = "trainscope")]
#[command(about = "Launch and watch neural-network training jobs", long_about = None)]
pub struct Cli {
    /// JSON config file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Write logs to this file
    #[arg(long, global = true)]
    pub log: Option<PathBuf>,

    /// Open a saved run in the TUI
    #[arg(long)]
    pub run: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the training job and stream its progress
    Train {
        /// Training data CSV (falls back to the configured job)
        #[arg(long)]
        data_file: Option<PathBuf>,

        /// Comma separated input columns
        #[arg(long, value_delimiter = ',')]
        x_features: Vec<String>,

        /// Target column
        #[arg(long, default_value = "close")]
        y_feature: String,

        #[arg(long, default_value = "4")]
        hidden_size: u32,

        #[arg(long, default_value = "0.001")]
        learning_rate: f64,

        #[arg(long, default_value = "32")]
        batch_size: u32,
    },
    /// Run predictions with a trained model
    Predict {
        /// Input CSV
        input_file: PathBuf,

        #[arg(long)]
        model_dir: PathBuf,

        /// Defaults to the model directory
        #[arg(long)]
        output_dir: Option<PathBuf>,

        #[arg(long, value_delimiter = ',')]
        x_features: Vec<String>,

        #[arg(long, default_value = "close")]
        y_feature: String,
    },
    /// Render the 3D gradient-descent visualization
    Visualize {
        #[arg(long)]
        model_dir: PathBuf,

        /// Color map
        #[arg(long, default_value = "viridis")]
        color: String,

        #[arg(long, default_value = "30")]
        fps: u32,

        #[arg(long)]
        save_png: bool,

        #[arg(long)]
        save_mpeg: bool,
    },
    /// Open the results viewer for a model
    View {
        #[arg(long)]
        model_dir: PathBuf,

        #[arg(long, default_value = "all")]
        plot_type: String,

        #[arg(long)]
        save_plot: bool,
    },
    /// Replay recorded weight snapshots frame by frame
    Replay {
        /// Directory holding training_losses.csv and weights_history
        model_dir: PathBuf,

        /// Epochs between snapshots (inferred when omitted)
        #[arg(long)]
        interval: Option<usize>,

        /// Speed multiplier
        #[arg(long, default_value = "1.0")]
        speed: f64,

        /// Wait for each tick instead of printing immediately
        #[arg(long)]
        realtime: bool,
    },
    /// Print the summary of a saved run
    Runs {
        /// Saved run JSON files
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

pub fn handle_cli(cli: Cli, config: SupervisorConfig) -> Result<()> {
    match cli.command {
        Some(Commands::Train {
            data_file,
            x_features,
            y_feature,
            hidden_size,
            learning_rate,
            batch_size,
        }) => {
            let job = match data_file {
                Some(data_file) => TrainingJob {
                    data_file,
                    x_features,
                    y_feature,
                    hidden_size,
                    learning_rate,
                    batch_size,
                },
                None => config
                    .training
                    .clone()
                    .ok_or_else(|| eyre!("no --data-file given and no training job configured"))?,
            };
            run_training(config, job)
        }
        Some(Commands::Predict {
            input_file,
            model_dir,
            output_dir,
            x_features,
            y_feature,
        }) => {
            let job = PredictionJob {
                input_file,
                model_dir,
                output_dir,
                x_features,
                y_feature,
            };
            run_sync_job(config, JobKind::Predict, job.args())
        }
        Some(Commands::Visualize {
            model_dir,
            color,
            fps,
            save_png,
            save_mpeg,
        }) => {
            let job = VisualizationJob {
                model_dir,
                color,
                fps,
                save_png,
                save_mpeg,
                ..VisualizationJob::default()
            };
            run_sync_job(config, JobKind::Visualize, job.args())
        }
        Some(Commands::View {
            model_dir,
            plot_type,
            save_plot,
        }) => {
            let job = ViewResultsJob {
                model_dir,
                plot_type,
                save_plot,
            };
            run_sync_job(config, JobKind::ViewResults, job.args())
        }
        Some(Commands::Replay {
            model_dir,
            interval,
            speed,
            realtime,
        }) => run_replay(config, model_dir, interval, speed, realtime),
        Some(Commands::Runs { files }) => {
            for path in files {
                let run = trainscope::app::runs::load_saved_run(&path)?;
                println!("{}", run.summary());
            }
            Ok(())
        }
        None => Ok(()),
    }
}

/// Streams the training job to the terminal and a timestamped log file.
fn run_training(config: SupervisorConfig, job: TrainingJob) -> Result<()> {
    let app = App::new(config);
    let spec = app.launch_spec(JobKind::Train, job.args())?;

    let timestamp = Local::now().format("%Y-%m-%d_%H-%M-%S");
    let log_dir = app.working_dir().join("logs");
    fs::create_dir_all(&log_dir)
        .wrap_err_with(|| format!("failed to create {}", log_dir.display()))?;
    let log_path = log_dir.join(format!("train_{timestamp}.log"));
    let mut log_file = File::create(&log_path)
        .wrap_err_with(|| format!("failed to create {}", log_path.display()))?;
    println!("{} Logging to {}", "📝".green(), log_path.display());
    println!("{} {}", "$".dark_grey(), spec.command_line());

    let launcher = ProcessLauncher::new();
    let handle = launcher.run_streaming(&spec)?;
    let (sender, mut receiver) = telemetry::telemetry_channel();
    let reader = telemetry::spawn_reader(handle, sender);
    let series = LiveSeries::new();

    let mut exit_code = None;
    'drain: loop {
        for event in receiver.drain() {
            match event {
                TelemetryEvent::Sample(Sample::Loss(sample)) => {
                    writeln!(log_file, "LOSS:{},{}", sample.epoch, sample.loss)?;
                    print_loss(&sample);
                    series.append(sample);
                }
                TelemetryEvent::Sample(Sample::Weights(sample)) => {
                    writeln!(log_file, "WEIGHTS:{},{},{}", sample.epoch, sample.w1, sample.w2)?;
                }
                TelemetryEvent::Output(line) => {
                    writeln!(log_file, "{}", line.display())?;
                    if line.display().starts_with("! ") {
                        eprintln!("{}", line.text().red());
                    } else {
                        println!("{}", line.text());
                    }
                }
                TelemetryEvent::Error(message) => eprintln!("{}", message.red()),
                TelemetryEvent::Finished(code) => {
                    exit_code = code;
                    break 'drain;
                }
            }
        }
        if receiver.is_disconnected() {
            break;
        }
        thread::sleep(DRAIN_INTERVAL);
    }
    if reader.join().is_err() {
        return Err(eyre!("telemetry reader panicked"));
    }

    println!(
        "{} {} loss samples recorded",
        "✓".green(),
        series.len()
    );
    finish(JobKind::Train, exit_code)
}

fn print_loss(sample: &LossSample) {
    match sample.progress_percent() {
        Some(percent) => println!(
            "{} epoch {} loss {:.6} ({percent:.0}%)",
            "▸".cyan(),
            sample.epoch,
            sample.loss
        ),
        None => println!("{} epoch {} loss {:.6}", "▸".cyan(), sample.epoch, sample.loss),
    }
}

fn run_sync_job(config: SupervisorConfig, kind: JobKind, args: Vec<String>) -> Result<()> {
    let app = App::new(config);
    let report = app.run_job(kind, args)?;
    if !report.stdout.is_empty() {
        print!("{}", report.stdout);
    }
    if !report.stderr.is_empty() {
        eprint!("{}", report.stderr.as_str().red());
    }
    finish(kind, report.code)
}

fn finish(kind: JobKind, code: Option<i32>) -> Result<()> {
    match code {
        Some(0) => {
            println!("{} {} completed successfully", "✓".green(), kind.label());
            Ok(())
        }
        code => {
            if let Some(diagnosis) = exit_diagnosis(code) {
                eprintln!("{}", diagnosis.yellow());
            }
            let detail = match code {
                Some(code) => format!("exit code {code}"),
                None => "a signal".to_string(),
            };
            Err(eyre!("{} ended with {detail}", kind.label()))
        }
    }
}

/// Prints every frame it is handed.
struct PrintSink;

impl RenderSink for PrintSink {
    fn render_loss(&mut self, series: &[LossSample]) {
        println!("{} loss series with {} epochs", "▸".cyan(), series.len());
    }

    fn render_frame(&mut self, frame: &FrameView<'_>) {
        let shown: Vec<String> = frame
            .weights
            .iter()
            .take(4)
            .map(|weight| format!("{weight:.4}"))
            .collect();
        let more = frame.weights.len().saturating_sub(shown.len());
        let weights = if more > 0 {
            format!("[{}, … +{more}]", shown.join(", "))
        } else {
            format!("[{}]", shown.join(", "))
        };
        println!(
            "frame {:>4}/{} epoch {:>6} weights {} loss {}",
            frame.frame + 1,
            frame.frame_count,
            frame.epoch,
            weights,
            loss_label(frame.loss)
        );
    }
}

/// Plays every frame once. Without `realtime` the engine's clock is driven
/// straight to each deadline.
fn run_replay(
    config: SupervisorConfig,
    model_dir: PathBuf,
    interval: Option<usize>,
    speed: f64,
    realtime: bool,
) -> Result<()> {
    let mut engine = PlaybackEngine::new(config.playback_interval());
    engine.bind_sink(Box::new(PrintSink));
    engine
        .load_dir(&model_dir, interval, config.default_sampling_interval)
        .wrap_err_with(|| format!("cannot replay {}", model_dir.display()))?;
    engine.set_speed(speed)?;
    println!(
        "{} {} frames, one every {} epochs",
        "▸".cyan(),
        engine.frame_count(),
        engine.sampling_interval()
    );

    engine.play(Instant::now())?;
    let mut rendered = 0;
    while rendered < engine.frame_count() {
        let Some(deadline) = engine.next_deadline() else {
            break;
        };
        let now = if realtime {
            thread::sleep(deadline.saturating_duration_since(Instant::now()));
            Instant::now()
        } else {
            deadline
        };
        if engine.poll(now) {
            rendered += 1;
        }
    }
    engine.pause();
    Ok(())
}
