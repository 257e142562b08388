//! Transport-controlled replay of a recorded training run.
//!
//! The engine never sleeps or spawns anything. The UI loop asks it for its
//! next deadline and calls [`PlaybackEngine::poll`] when that time arrives;
//! each scheduled tick carries a [`CancelToken`] that is checked right
//! before rendering.

use std::cell::Cell;
use std::fmt;
use std::path::Path;
use std::rc::Rc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::app::metrics::LossSample;
use crate::app::recording::{self, Recording, WeightSnapshot};
use crate::app::sink::{FrameView, RenderSink};
use crate::domain::error::{SupervisorError, SupervisorResult};

pub const DEFAULT_BASE_INTERVAL: Duration = Duration::from_millis(50);
/// Longest gap between two ticks, however slow the speed.
pub const MAX_TICK_INTERVAL: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Stopped,
    Playing,
    Paused,
}

impl PlaybackState {
    pub fn label(self) -> &'static str {
        match self {
            PlaybackState::Stopped => "stopped",
            PlaybackState::Playing => "playing",
            PlaybackState::Paused => "paused",
        }
    }
}

impl fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Shared cancellation flag for a scheduled tick. Cancelling twice is fine.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Rc<Cell<bool>>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.set(true);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.get()
    }
}

#[derive(Debug)]
struct PendingTick {
    due: Instant,
    token: CancelToken,
}

pub struct PlaybackEngine {
    state: PlaybackState,
    frame: usize,
    speed: f64,
    base_interval: Duration,
    recording: Recording,
    pending: Option<PendingTick>,
    sink: Option<Box<dyn RenderSink>>,
}

impl fmt::Debug for PlaybackEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlaybackEngine")
            .field("state", &self.state)
            .field("frame", &self.frame)
            .field("frame_count", &self.frame_count())
            .field("speed", &self.speed)
            .field("pending", &self.pending)
            .field("sink_bound", &self.sink.is_some())
            .finish()
    }
}

impl Default for PlaybackEngine {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_INTERVAL)
    }
}

impl PlaybackEngine {
    pub fn new(base_interval: Duration) -> Self {
        Self {
            state: PlaybackState::Stopped,
            frame: 0,
            speed: 1.0,
            base_interval,
            recording: Recording::default(),
            pending: None,
            sink: None,
        }
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn frame(&self) -> usize {
        self.frame
    }

    pub fn frame_count(&self) -> usize {
        self.recording.snapshots.len()
    }

    pub fn speed(&self) -> f64 {
        self.speed
    }

    pub fn sampling_interval(&self) -> usize {
        self.recording.sampling_interval
    }

    pub fn recording(&self) -> &Recording {
        &self.recording
    }

    /// Attaches the renderer, replacing any previous one.
    pub fn bind_sink(&mut self, sink: Box<dyn RenderSink>) {
        self.sink = Some(sink);
    }

    /// Detaches the renderer. Any scheduled tick is cancelled so nothing can
    /// reach a torn-down render target.
    pub fn unbind_sink(&mut self) -> Option<Box<dyn RenderSink>> {
        self.cancel_pending();
        if self.state == PlaybackState::Playing {
            self.state = PlaybackState::Paused;
        }
        self.sink.take()
    }

    pub fn has_sink(&self) -> bool {
        self.sink.is_some()
    }

    /// Installs a new recording. Only allowed while stopped; the frame index
    /// goes back to 0 and the engine stays stopped.
    pub fn load(
        &mut self,
        snapshots: Vec<WeightSnapshot>,
        losses: Vec<f64>,
        sampling_interval: usize,
    ) -> SupervisorResult<()> {
        self.load_recording(Recording {
            snapshots,
            losses,
            sampling_interval,
        })
    }

    pub fn load_recording(&mut self, mut recording: Recording) -> SupervisorResult<()> {
        if self.state != PlaybackState::Stopped {
            return Err(SupervisorError::NotStopped(self.state.label()));
        }
        recording.sampling_interval = recording.sampling_interval.max(1);
        info!(
            frames = recording.snapshots.len(),
            losses = recording.losses.len(),
            sampling_interval = recording.sampling_interval,
            "playback recording loaded"
        );
        self.recording = recording;
        self.frame = 0;
        self.render_losses();
        Ok(())
    }

    /// Reads a recording from disk. On failure the engine is left stopped and
    /// empty rather than holding a previous or partial recording.
    pub fn load_dir(
        &mut self,
        model_dir: &Path,
        sampling_interval: Option<usize>,
        default_interval: usize,
    ) -> SupervisorResult<()> {
        if self.state != PlaybackState::Stopped {
            return Err(SupervisorError::NotStopped(self.state.label()));
        }
        match recording::load_recording(model_dir, sampling_interval, default_interval) {
            Ok(recording) => self.load_recording(recording),
            Err(error) => {
                warn!(%error, "failed to load recording");
                self.recording = Recording::default();
                self.frame = 0;
                Err(error)
            }
        }
    }

    /// Starts or resumes playback; the first tick is due immediately.
    pub fn play(&mut self, now: Instant) -> SupervisorResult<()> {
        if self.frame_count() == 0 {
            return Err(SupervisorError::EmptyPlayback);
        }
        if self.state == PlaybackState::Playing {
            return Ok(());
        }
        self.state = PlaybackState::Playing;
        self.schedule_at(now);
        Ok(())
    }

    pub fn pause(&mut self) {
        if self.state == PlaybackState::Playing {
            self.cancel_pending();
            self.state = PlaybackState::Paused;
        }
    }

    /// Stops from any state, rewinds to frame 0 and shows it.
    pub fn stop(&mut self) {
        self.cancel_pending();
        self.state = PlaybackState::Stopped;
        self.frame = 0;
        if self.frame_count() > 0 {
            self.render_current();
        }
    }

    /// Jumps to `frame` (clamped) and renders it once. The transport state
    /// is unchanged.
    pub fn seek(&mut self, frame: usize) -> SupervisorResult<()> {
        let count = self.frame_count();
        if count == 0 {
            return Err(SupervisorError::EmptyPlayback);
        }
        self.frame = frame.min(count - 1);
        self.render_current();
        Ok(())
    }

    /// Relative scrub, clamped at both ends.
    pub fn step(&mut self, delta: isize) -> SupervisorResult<()> {
        let target = self.frame.saturating_add_signed(delta);
        self.seek(target)
    }

    /// Applies from the next scheduled tick on; an already scheduled tick
    /// keeps its due time.
    pub fn set_speed(&mut self, multiplier: f64) -> SupervisorResult<()> {
        if !(multiplier.is_finite() && multiplier > 0.0) {
            return Err(SupervisorError::InvalidSpeed(multiplier));
        }
        self.speed = multiplier;
        Ok(())
    }

    /// `base_interval / speed`, capped at [`MAX_TICK_INTERVAL`].
    pub fn tick_interval(&self) -> Duration {
        Duration::try_from_secs_f64(self.base_interval.as_secs_f64() / self.speed)
            .map_or(MAX_TICK_INTERVAL, |interval| interval.min(MAX_TICK_INTERVAL))
    }

    /// When the UI loop should call [`poll`](Self::poll) next.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending
            .as_ref()
            .filter(|pending| !pending.token.is_cancelled())
            .map(|pending| pending.due)
    }

    /// Runs the scheduled tick if it is due. Returns whether a frame was
    /// rendered.
    pub fn poll(&mut self, now: Instant) -> bool {
        let due = matches!(&self.pending, Some(pending) if now >= pending.due);
        if !due {
            return false;
        }
        let Some(pending) = self.pending.take() else {
            return false;
        };
        if pending.token.is_cancelled() || self.state != PlaybackState::Playing {
            debug!("dropping cancelled playback tick");
            return false;
        }

        self.render_current();
        self.frame = (self.frame + 1) % self.frame_count();
        match now.checked_add(self.tick_interval()) {
            Some(due) => self.schedule_at(due),
            None => {
                warn!("next playback tick is out of clock range, pausing");
                self.state = PlaybackState::Paused;
            }
        }
        true
    }

    /// Index into the loss series for `frame`, clamped to the last sample.
    pub fn loss_index(&self, frame: usize) -> Option<usize> {
        let len = self.recording.losses.len();
        if len == 0 {
            return None;
        }
        Some(
            frame
                .saturating_mul(self.recording.sampling_interval)
                .min(len - 1),
        )
    }

    pub fn frame_view(&self, frame: usize) -> Option<FrameView<'_>> {
        let snapshot = self.recording.snapshots.get(frame)?;
        Some(FrameView {
            frame,
            frame_count: self.frame_count(),
            epoch: snapshot.epoch,
            weights: &snapshot.weights,
            loss: self
                .loss_index(frame)
                .map(|index| self.recording.losses[index]),
        })
    }

    fn schedule_at(&mut self, due: Instant) {
        self.cancel_pending();
        self.pending = Some(PendingTick {
            due,
            token: CancelToken::default(),
        });
    }

    fn cancel_pending(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.token.cancel();
        }
    }

    fn render_losses(&mut self) {
        let Some(sink) = self.sink.as_mut() else {
            return;
        };
        let series: Vec<LossSample> = self
            .recording
            .losses
            .iter()
            .enumerate()
            .map(|(epoch, loss)| LossSample::new(epoch as u64, *loss))
            .collect();
        sink.render_loss(&series);
    }

    fn render_current(&mut self) {
        let frame = self.frame;
        let count = self.frame_count();
        debug_assert!(frame < count, "frame {frame} outside 0..{count}");
        let loss = self
            .loss_index(frame)
            .map(|index| self.recording.losses[index]);
        let Some(snapshot) = self.recording.snapshots.get(frame) else {
            return;
        };
        let Some(sink) = self.sink.as_mut() else {
            return;
        };
        sink.render_frame(&FrameView {
            frame,
            frame_count: count,
            epoch: snapshot.epoch,
            weights: &snapshot.weights,
            loss,
        });
    }
}

impl Drop for PlaybackEngine {
    fn drop(&mut self) {
        self.cancel_pending();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[derive(Debug, Clone, PartialEq)]
    struct Rendered {
        frame: usize,
        frame_count: usize,
        loss: Option<f64>,
    }

    #[derive(Clone, Default)]
    struct RecordingSink(Rc<RefCell<Vec<Rendered>>>);

    impl RecordingSink {
        fn frames(&self) -> Vec<usize> {
            self.0.borrow().iter().map(|r| r.frame).collect()
        }

        fn count(&self) -> usize {
            self.0.borrow().len()
        }
    }

    impl RenderSink for RecordingSink {
        fn render_loss(&mut self, _series: &[LossSample]) {}

        fn render_frame(&mut self, frame: &FrameView<'_>) {
            self.0.borrow_mut().push(Rendered {
                frame: frame.frame,
                frame_count: frame.frame_count,
                loss: frame.loss,
            });
        }
    }

    fn snapshots(count: usize) -> Vec<WeightSnapshot> {
        (0..count)
            .map(|i| WeightSnapshot::new(i as u64 * 50, vec![i as f64, -(i as f64)]))
            .collect()
    }

    fn losses(len: usize) -> Vec<f64> {
        (0..len).map(|i| i as f64).collect()
    }

    fn engine_with(count: usize, loss_len: usize, interval: usize) -> (PlaybackEngine, RecordingSink) {
        let sink = RecordingSink::default();
        let mut engine = PlaybackEngine::new(Duration::from_millis(100));
        engine.bind_sink(Box::new(sink.clone()));
        engine.load(snapshots(count), losses(loss_len), interval).unwrap();
        (engine, sink)
    }

    #[test]
    fn loss_index_maps_sparse_frames_onto_dense_series() {
        let (engine, _) = engine_with(5, 210, 50);
        assert_eq!(engine.loss_index(4), Some(200));
        assert_eq!(engine.frame_view(4).unwrap().loss, Some(200.0));
    }

    #[test]
    fn loss_index_clamps_for_truncated_series() {
        let (engine, _) = engine_with(5, 100, 50);
        assert_eq!(engine.loss_index(4), Some(99));
    }

    #[test]
    fn empty_loss_series_renders_without_loss() {
        let (mut engine, sink) = engine_with(3, 0, 50);
        assert_eq!(engine.loss_index(2), None);
        engine.seek(2).unwrap();
        assert_eq!(
            sink.0.borrow().last(),
            Some(&Rendered {
                frame: 2,
                frame_count: 3,
                loss: None
            })
        );
    }

    #[test]
    fn play_without_frames_is_refused() {
        let mut engine = PlaybackEngine::default();
        let err = engine.play(Instant::now()).unwrap_err();
        assert!(matches!(err, SupervisorError::EmptyPlayback));
        assert_eq!(engine.state(), PlaybackState::Stopped);
        assert_eq!(engine.next_deadline(), None);
    }

    #[test]
    fn ticks_render_advance_and_wrap() {
        let (mut engine, sink) = engine_with(3, 10, 1);
        let start = Instant::now();
        engine.play(start).unwrap();
        assert_eq!(engine.next_deadline(), Some(start));

        let mut now = start;
        for _ in 0..5 {
            assert!(engine.poll(now));
            now += engine.tick_interval();
        }
        assert_eq!(sink.frames(), vec![0, 1, 2, 0, 1]);
        assert_eq!(engine.frame(), 2);
        assert_eq!(engine.state(), PlaybackState::Playing);
    }

    #[test]
    fn poll_before_deadline_does_nothing() {
        let (mut engine, sink) = engine_with(3, 10, 1);
        let start = Instant::now();
        engine.play(start).unwrap();
        assert!(engine.poll(start));
        assert!(!engine.poll(start + Duration::from_millis(99)));
        assert_eq!(sink.count(), 1);
    }

    #[test]
    fn play_while_playing_is_a_no_op() {
        let (mut engine, _) = engine_with(3, 10, 1);
        let start = Instant::now();
        engine.play(start).unwrap();
        engine.poll(start);
        let deadline = engine.next_deadline();
        engine.play(start + Duration::from_millis(10)).unwrap();
        assert_eq!(engine.next_deadline(), deadline);
    }

    #[test]
    fn stop_cancels_pending_tick_and_rewinds() {
        let (mut engine, sink) = engine_with(4, 10, 1);
        let start = Instant::now();
        engine.play(start).unwrap();
        engine.poll(start);
        engine.poll(start + Duration::from_millis(100));
        assert_eq!(engine.frame(), 2);

        engine.stop();
        assert_eq!(engine.state(), PlaybackState::Stopped);
        assert_eq!(engine.frame(), 0);
        assert_eq!(engine.next_deadline(), None);
        let rendered = sink.count();

        assert!(!engine.poll(start + Duration::from_secs(10)));
        assert_eq!(sink.count(), rendered);
    }

    #[test]
    fn stop_from_paused_and_stopped() {
        let (mut engine, _) = engine_with(4, 10, 1);
        engine.seek(3).unwrap();
        engine.stop();
        assert_eq!(engine.frame(), 0);

        let start = Instant::now();
        engine.play(start).unwrap();
        engine.poll(start);
        engine.pause();
        engine.stop();
        assert_eq!(engine.state(), PlaybackState::Stopped);
        assert_eq!(engine.frame(), 0);
    }

    #[test]
    fn pause_cancels_and_resume_continues_from_current_frame() {
        let (mut engine, sink) = engine_with(4, 10, 1);
        let start = Instant::now();
        engine.play(start).unwrap();
        engine.poll(start);
        engine.pause();
        assert_eq!(engine.state(), PlaybackState::Paused);
        assert!(!engine.poll(start + Duration::from_secs(1)));

        let resume = start + Duration::from_secs(2);
        engine.play(resume).unwrap();
        assert!(engine.poll(resume));
        assert_eq!(sink.frames(), vec![0, 1]);
    }

    #[test]
    fn pause_when_not_playing_is_a_no_op() {
        let (mut engine, _) = engine_with(2, 10, 1);
        engine.pause();
        assert_eq!(engine.state(), PlaybackState::Stopped);
    }

    #[test]
    fn seek_clamps_and_keeps_state() {
        let (mut engine, sink) = engine_with(5, 10, 1);
        engine.seek(42).unwrap();
        assert_eq!(engine.frame(), 4);
        assert_eq!(engine.state(), PlaybackState::Stopped);
        engine.step(-10).unwrap();
        assert_eq!(engine.frame(), 0);
        assert_eq!(sink.frames(), vec![4, 0]);
    }

    #[test]
    fn speed_applies_from_next_tick() {
        let (mut engine, _) = engine_with(3, 10, 1);
        let start = Instant::now();
        engine.play(start).unwrap();
        engine.poll(start);
        let scheduled = engine.next_deadline().unwrap();
        assert_eq!(scheduled, start + Duration::from_millis(100));

        engine.set_speed(4.0).unwrap();
        assert_eq!(engine.next_deadline(), Some(scheduled));
        engine.poll(scheduled);
        assert_eq!(
            engine.next_deadline(),
            Some(scheduled + Duration::from_millis(25))
        );
    }

    #[test]
    fn tiny_speed_saturates_the_interval() {
        let (mut engine, sink) = engine_with(3, 10, 1);
        engine.set_speed(1e-300).unwrap();
        assert_eq!(engine.tick_interval(), MAX_TICK_INTERVAL);

        let start = Instant::now();
        engine.play(start).unwrap();
        assert!(engine.poll(start));
        assert_eq!(engine.next_deadline(), Some(start + MAX_TICK_INTERVAL));
        assert!(!engine.poll(start + Duration::from_secs(60)));
        assert_eq!(sink.count(), 1);
    }

    #[test]
    fn invalid_speed_is_rejected() {
        let mut engine = PlaybackEngine::default();
        for bad in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            assert!(matches!(
                engine.set_speed(bad),
                Err(SupervisorError::InvalidSpeed(_))
            ));
        }
        assert_eq!(engine.speed(), 1.0);
    }

    #[test]
    fn load_requires_stopped_engine() {
        let (mut engine, _) = engine_with(3, 10, 1);
        engine.play(Instant::now()).unwrap();
        let err = engine.load(snapshots(1), losses(1), 1).unwrap_err();
        assert!(matches!(err, SupervisorError::NotStopped("playing")));
        assert_eq!(engine.frame_count(), 3);
    }

    #[test]
    fn failed_directory_load_leaves_engine_empty() {
        let (mut engine, _) = engine_with(3, 10, 1);
        let dir = tempfile::tempdir().unwrap();
        let err = engine.load_dir(dir.path(), None, 10).unwrap_err();
        assert!(matches!(err, SupervisorError::Load { .. }));
        assert_eq!(engine.frame_count(), 0);
        assert_eq!(engine.state(), PlaybackState::Stopped);
        assert!(engine.play(Instant::now()).is_err());
    }

    #[test]
    fn unbinding_sink_cancels_pending_tick() {
        let (mut engine, sink) = engine_with(3, 10, 1);
        let start = Instant::now();
        engine.play(start).unwrap();
        let detached = engine.unbind_sink();
        assert!(detached.is_some());
        assert!(!engine.poll(start + Duration::from_secs(1)));
        assert_eq!(sink.count(), 0);
        assert_eq!(engine.state(), PlaybackState::Paused);
    }

    #[test]
    fn ticks_without_sink_still_advance() {
        let mut engine = PlaybackEngine::new(Duration::from_millis(10));
        engine.load(snapshots(2), losses(2), 1).unwrap();
        let start = Instant::now();
        engine.play(start).unwrap();
        assert!(engine.poll(start));
        assert_eq!(engine.frame(), 1);
    }

    #[test]
    fn cancel_token_is_idempotent() {
        let token = CancelToken::default();
        let shared = token.clone();
        token.cancel();
        token.cancel();
        assert!(shared.is_cancelled());
    }
}
