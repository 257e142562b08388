use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use color_eyre::eyre::{Context, Result};
use tracing::{info, warn};

use crate::app::config::{JobKind, SupervisorConfig};
use crate::app::metrics::Sample;
use crate::app::playback::{PlaybackEngine, PlaybackState};
use crate::app::runs::{self, SavedRun};
use crate::app::sink::RenderSink;
use crate::app::telemetry::{self, LiveSeries, TelemetryEvent, TelemetryReceiver, WeightTrail};
use crate::domain::error::{SupervisorError, SupervisorResult};
use crate::domain::process::{exit_diagnosis, ExitReport, LaunchSpec, ProcessController, ProcessLauncher};
use crate::domain::scripts::ScriptLocator;

const TRAINING_OUTPUT_LIMIT: usize = 2_000;
const SPEED_STEPS: [f64; 7] = [0.25, 0.5, 1.0, 2.0, 4.0, 8.0, 16.0];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusKind {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone)]
pub struct StatusMessage {
    pub text: String,
    pub kind: StatusKind,
}

/// The streaming run currently owned by the supervisor.
struct ActiveRun {
    label: &'static str,
    telemetry: TelemetryReceiver,
    controller: ProcessController,
    reader: Option<JoinHandle<()>>,
    started_at: SystemTime,
}

/// Ties the launcher, telemetry, live series and playback together. Lives on
/// the UI thread; the only other thread is the reader of the active run.
pub struct App {
    config: SupervisorConfig,
    locator: &'static ScriptLocator,
    launcher: ProcessLauncher,
    active: Option<ActiveRun>,
    live_losses: LiveSeries,
    weight_trail: WeightTrail,
    live_sink: Option<Box<dyn RenderSink>>,
    rendered_losses: Option<usize>,
    progress: Option<f64>,
    training_output: Vec<String>,
    status: Option<StatusMessage>,
    playback: PlaybackEngine,
    viewed_run: Option<SavedRun>,
    last_saved_run: Option<PathBuf>,
    should_quit: bool,
}

impl App {
    pub fn new(config: SupervisorConfig) -> Self {
        let locator = ScriptLocator::global(&config.known_subdir);
        Self::with_locator(config, locator)
    }

    pub fn with_locator(config: SupervisorConfig, locator: &'static ScriptLocator) -> Self {
        let playback = PlaybackEngine::new(config.playback_interval());
        Self {
            config,
            locator,
            launcher: ProcessLauncher::new(),
            active: None,
            live_losses: LiveSeries::new(),
            weight_trail: WeightTrail::new(),
            live_sink: None,
            rendered_losses: None,
            progress: None,
            training_output: Vec::new(),
            status: None,
            playback,
            viewed_run: None,
            last_saved_run: None,
            should_quit: false,
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn status(&self) -> Option<&StatusMessage> {
        self.status.as_ref()
    }

    pub fn set_status<S: Into<String>>(&mut self, text: S, kind: StatusKind) {
        self.status = Some(StatusMessage {
            text: text.into(),
            kind,
        });
    }

    pub fn clear_status(&mut self) {
        self.status = None;
    }

    pub fn training_output(&self) -> &[String] {
        &self.training_output
    }

    pub fn live_losses(&self) -> &LiveSeries {
        &self.live_losses
    }

    pub fn weight_trail(&self) -> &WeightTrail {
        &self.weight_trail
    }

    /// Percent complete, known only when the job prints `Epoch X/Y`.
    pub fn progress(&self) -> Option<f64> {
        self.progress
    }

    pub fn is_training_running(&self) -> bool {
        self.active.is_some()
    }

    pub fn active_pid(&self) -> Option<u32> {
        self.active.as_ref().map(|run| run.controller.pid())
    }

    pub fn playback(&self) -> &PlaybackEngine {
        &self.playback
    }

    pub fn playback_mut(&mut self) -> &mut PlaybackEngine {
        &mut self.playback
    }

    pub fn viewed_run(&self) -> Option<&SavedRun> {
        self.viewed_run.as_ref()
    }

    pub fn last_saved_run(&self) -> Option<&Path> {
        self.last_saved_run.as_deref()
    }

    pub fn should_quit(&self) -> bool {
        self.should_quit
    }

    pub fn request_quit(&mut self) {
        self.should_quit = true;
    }

    /// Renderer for the live loss curve. The current series is pushed on the
    /// next background tick.
    pub fn bind_live_sink(&mut self, sink: Box<dyn RenderSink>) {
        self.live_sink = Some(sink);
        self.rendered_losses = None;
    }

    pub fn bind_playback_sink(&mut self, sink: Box<dyn RenderSink>) {
        self.playback.bind_sink(sink);
    }

    pub fn working_dir(&self) -> PathBuf {
        self.launcher
            .working_dir(self.locator, &self.config.scripts.sentinel)
            .to_path_buf()
    }

    /// Warns about configured scripts that cannot be found. Returns the
    /// missing names.
    pub fn check_scripts(&mut self) -> Vec<String> {
        let missing = self.locator.missing(self.config.script_names());
        if missing.is_empty() {
            info!("all job scripts found");
        } else {
            warn!(?missing, "job scripts not found");
            self.set_status(
                format!("Scripts not found: {}", missing.join(", ")),
                StatusKind::Warning,
            );
        }
        missing
    }

    /// Builds the launch for `kind`: the resolved script with `args`, run
    /// from the shared working directory.
    pub fn launch_spec(&self, kind: JobKind, args: Vec<String>) -> SupervisorResult<LaunchSpec> {
        let script = self.locator.resolve(self.config.scripts.for_job(kind))?;
        Ok(LaunchSpec::for_script(&script, &self.config.interpreter())
            .args(args)
            .working_dir(self.working_dir()))
    }

    pub fn start_training(&mut self) -> Result<()> {
        let Some(job) = self.config.training.clone() else {
            self.set_status(
                "No training job configured. Add a \"training\" section to the config file.",
                StatusKind::Warning,
            );
            return Ok(());
        };
        let spec = match self.launch_spec(JobKind::Train, job.args()) {
            Ok(spec) => spec,
            Err(error) => {
                self.set_status(error.to_string(), StatusKind::Error);
                return Ok(());
            }
        };
        match self.start_stream(&spec, JobKind::Train.label()) {
            Ok(()) | Err(SupervisorError::Busy) => Ok(()),
            Err(error) => {
                self.append_training_line(format!("! {error}"));
                Ok(())
            }
        }
    }

    /// Launches `spec` as the streaming run. The live series are reset after
    /// the child is accepted and before its reader starts, so a rejected
    /// launch leaves the current run's data alone.
    pub fn start_stream(&mut self, spec: &LaunchSpec, label: &'static str) -> SupervisorResult<()> {
        let handle = match self.launcher.run_streaming(spec) {
            Ok(handle) => handle,
            Err(SupervisorError::Busy) => {
                self.set_status(
                    "A job is already streaming; cancel it or wait for it to exit",
                    StatusKind::Warning,
                );
                return Err(SupervisorError::Busy);
            }
            Err(error) => {
                warn!(%error, "failed to start streaming job");
                self.set_status(error.to_string(), StatusKind::Error);
                return Err(error);
            }
        };

        self.live_losses.reset();
        self.weight_trail.reset();
        self.rendered_losses = None;
        self.progress = None;
        self.viewed_run = None;
        self.training_output.clear();
        self.append_training_line(format!("$ {}", spec.command_line()));

        let (sender, receiver) = telemetry::telemetry_channel();
        let controller = handle.controller();
        let reader = telemetry::spawn_reader(handle, sender);
        self.active = Some(ActiveRun {
            label,
            telemetry: receiver,
            controller,
            reader: Some(reader),
            started_at: SystemTime::now(),
        });
        self.set_status(format!("Starting {label}..."), StatusKind::Info);
        Ok(())
    }

    /// Asks the running job to stop. Output already buffered keeps flowing
    /// until the reader sees the end of both streams.
    pub fn cancel_training(&mut self) {
        let Some(run) = self.active.as_ref() else {
            self.set_status("Nothing is running", StatusKind::Info);
            return;
        };
        match run.controller.interrupt() {
            Ok(()) => {
                info!(pid = run.controller.pid(), "cancellation requested");
                self.append_training_line("! Cancellation requested, interrupting child");
                self.set_status("Interrupting job", StatusKind::Info);
            }
            Err(error) => {
                self.set_status(format!("Failed to stop training: {error}"), StatusKind::Error);
            }
        }
    }

    pub fn kill_training(&mut self) {
        if let Some(run) = self.active.as_ref() {
            if let Err(error) = run.controller.kill() {
                warn!(%error, "failed to kill streaming job");
            }
        }
    }

    /// Drains telemetry from the reader and feeds the live series. Never
    /// blocks.
    pub fn process_background_tasks(&mut self) {
        let mut finished = None;
        let mut disconnected = false;
        let events = match self.active.as_mut() {
            Some(run) => {
                let events = run.telemetry.drain();
                disconnected = run.telemetry.is_disconnected();
                events
            }
            None => Vec::new(),
        };

        for event in events {
            match event {
                TelemetryEvent::Sample(Sample::Loss(sample)) => {
                    if let Some(percent) = sample.progress_percent() {
                        self.progress = Some(percent);
                    }
                    self.live_losses.append(sample);
                }
                TelemetryEvent::Sample(Sample::Weights(sample)) => {
                    self.weight_trail.append(sample);
                }
                TelemetryEvent::Output(line) => self.append_training_line(line.display()),
                TelemetryEvent::Error(message) => {
                    self.append_training_line(format!("! {message}"));
                    self.set_status(message, StatusKind::Error);
                }
                TelemetryEvent::Finished(code) => finished = Some(code),
            }
        }

        if let Some(code) = finished {
            self.finish_run(code);
        } else if disconnected {
            self.active = None;
            self.set_status("Training task disconnected unexpectedly.", StatusKind::Warning);
        }
        self.render_live_losses();
    }

    fn finish_run(&mut self, code: Option<i32>) {
        let Some(mut run) = self.active.take() else {
            return;
        };
        if let Some(reader) = run.reader.take() {
            if reader.join().is_err() {
                warn!("telemetry reader panicked");
            }
        }

        let label = run.label;
        let (message, kind) = match code {
            Some(0) => (format!("{label} completed successfully."), StatusKind::Success),
            Some(code) => (format!("{label} finished with exit code {code}."), StatusKind::Error),
            None => (format!("{label} stopped by signal."), StatusKind::Warning),
        };
        info!(?code, "{}", message);
        self.append_training_line(message.clone());
        if let Some(diagnosis) = exit_diagnosis(code) {
            for line in diagnosis.lines() {
                self.append_training_line(format!("! {line}"));
            }
        }
        self.set_status(message, kind);
        self.persist_completed_run(&run, code);
    }

    fn persist_completed_run(&mut self, run: &ActiveRun, code: Option<i32>) {
        let losses = self.live_losses.snapshot();
        if losses.is_empty() {
            return;
        }
        let timestamp = run
            .started_at
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let duration_seconds = SystemTime::now()
            .duration_since(run.started_at)
            .map(|elapsed| elapsed.as_secs_f64())
            .unwrap_or(0.0);

        let mut saved = SavedRun::new(run.label, timestamp, duration_seconds);
        saved.exit_code = code;
        saved.losses = losses.to_vec();
        saved.weights = self.weight_trail.snapshot().to_vec();
        saved.training_output = self.training_output.clone();

        let dir = self.config.runs_dir(&self.working_dir());
        match runs::save_saved_run(&dir, &saved) {
            Ok(path) => {
                info!(path = %path.display(), "saved run");
                self.last_saved_run = Some(path);
            }
            Err(error) => {
                warn!(error = %error, "failed to save run");
                self.append_training_line(format!("! Failed to save run: {error}"));
            }
        }
    }

    fn render_live_losses(&mut self) {
        let Some(sink) = self.live_sink.as_mut() else {
            return;
        };
        let series = match self.viewed_run.as_ref() {
            Some(run) => Arc::new(run.losses.clone()),
            None => self.live_losses.snapshot(),
        };
        if self.rendered_losses == Some(series.len()) {
            return;
        }
        sink.render_loss(&series);
        self.rendered_losses = Some(series.len());
    }

    /// Runs a non-streaming job to completion, bounded by its configured
    /// timeout.
    pub fn run_job(&self, kind: JobKind, args: Vec<String>) -> Result<ExitReport> {
        let spec = self
            .launch_spec(kind, args)
            .wrap_err_with(|| format!("cannot launch {}", kind.label()))?
            .timeout(self.config.sync_timeout(kind));
        info!(job = kind.as_str(), command = %spec.command_line(), "running job");
        let report = self
            .launcher
            .run_sync(&spec)
            .wrap_err_with(|| format!("{} failed", kind.label()))?;
        Ok(report)
    }

    /// Shows a saved run's curves instead of the live series until the next
    /// run starts.
    pub fn view_saved_run(&mut self, path: &Path) {
        match runs::load_saved_run(path) {
            Ok(run) => {
                self.set_status(format!("Viewing {}", run.summary()), StatusKind::Info);
                self.viewed_run = Some(run);
                self.rendered_losses = None;
            }
            Err(error) => self.set_status(format!("{error:#}"), StatusKind::Error),
        }
    }

    pub fn return_to_live(&mut self) {
        if self.viewed_run.take().is_some() {
            self.rendered_losses = None;
            self.set_status("Showing the live run", StatusKind::Info);
        }
    }

    /// Loads `dir` (or the configured model directory) into the playback
    /// engine, stopping any current playback first.
    pub fn load_recording(&mut self, dir: Option<&Path>) {
        let Some(dir) = dir
            .map(Path::to_path_buf)
            .or_else(|| self.config.model_dir.clone())
        else {
            self.set_status("No model directory configured", StatusKind::Warning);
            return;
        };
        let dir = if dir.is_absolute() {
            dir
        } else {
            self.working_dir().join(dir)
        };
        self.playback.stop();
        match self
            .playback
            .load_dir(&dir, None, self.config.default_sampling_interval)
        {
            Ok(()) => {
                self.playback.stop();
                self.set_status(
                    format!(
                        "Loaded {} frames (every {} epochs) from {}",
                        self.playback.frame_count(),
                        self.playback.sampling_interval(),
                        dir.display()
                    ),
                    StatusKind::Success,
                );
            }
            Err(error) => self.set_status(error.to_string(), StatusKind::Error),
        }
    }

    pub fn toggle_playback(&mut self, now: Instant) {
        if self.playback.state() == PlaybackState::Playing {
            self.playback.pause();
            return;
        }
        if let Err(error) = self.playback.play(now) {
            self.set_status(error.to_string(), StatusKind::Warning);
        }
    }

    pub fn stop_playback(&mut self) {
        self.playback.stop();
    }

    pub fn scrub(&mut self, delta: isize) {
        if let Err(error) = self.playback.step(delta) {
            self.set_status(error.to_string(), StatusKind::Warning);
        }
    }

    /// Moves to the next or previous step of the fixed speed ladder.
    pub fn change_speed(&mut self, faster: bool) {
        let current = self.playback.speed();
        let next = if faster {
            SPEED_STEPS.iter().copied().find(|step| *step > current)
        } else {
            SPEED_STEPS.iter().rev().copied().find(|step| *step < current)
        };
        let Some(next) = next else {
            return;
        };
        match self.playback.set_speed(next) {
            Ok(()) => self.set_status(format!("Playback speed {next}x"), StatusKind::Info),
            Err(error) => self.set_status(error.to_string(), StatusKind::Error),
        }
    }

    pub fn poll_playback(&mut self, now: Instant) -> bool {
        self.playback.poll(now)
    }

    /// Kills a still-running job and detaches every renderer.
    pub fn shutdown(&mut self) {
        if let Some(run) = self.active.take() {
            if let Err(error) = run.controller.kill() {
                warn!(%error, "failed to kill job on shutdown");
            }
        }
        self.playback.unbind_sink();
        self.live_sink = None;
    }

    fn append_training_line(&mut self, line: impl Into<String>) {
        self.training_output.push(line.into());
        if self.training_output.len() > TRAINING_OUTPUT_LIMIT {
            let excess = self.training_output.len() - TRAINING_OUTPUT_LIMIT;
            self.training_output.drain(0..excess);
        }
    }
}
