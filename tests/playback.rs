use std::fs::{self, File};
use std::path::Path;
use std::time::{Duration, Instant};

use ndarray::array;
use ndarray_npy::NpzWriter;

use trainscope::app::{PlaybackEngine, PlaybackState};
use trainscope::domain::SupervisorError;
use trainscope::ui::{ChartSink, NO_LOSS_LABEL};

fn write_recording(dir: &Path, losses: usize, epochs: &[u64]) {
    let history = dir.join("weights_history");
    fs::create_dir_all(&history).unwrap();
    let loss_rows: String = (0..losses)
        .map(|epoch| format!("{},{}\n", 1.0 / (epoch + 1) as f64, 2.0))
        .collect();
    fs::write(dir.join("training_losses.csv"), loss_rows).unwrap();
    for (index, epoch) in epochs.iter().enumerate() {
        fs::write(
            history.join(format!("weights_history_{epoch}.csv")),
            format!("{}, {}\n0.0\n", index as f64 * 0.1, -(index as f64) * 0.1),
        )
        .unwrap();
    }
}

#[test]
fn recorded_run_plays_through_chart_sink() {
    let dir = tempfile::tempdir().unwrap();
    write_recording(dir.path(), 210, &[0, 50, 100, 150, 200]);

    let sink = ChartSink::new();
    let model = sink.model();
    let mut engine = PlaybackEngine::new(Duration::from_millis(20));
    engine.bind_sink(Box::new(sink));
    engine.load_dir(dir.path(), None, 10).unwrap();

    assert_eq!(engine.frame_count(), 5);
    assert_eq!(engine.sampling_interval(), 50);
    assert_eq!(model.borrow().loss.len(), 210);
    assert_eq!(engine.recording().snapshots[1].weights, vec![0.1, -0.1, 0.0]);

    let mut now = Instant::now();
    engine.play(now).unwrap();
    for _ in 0..5 {
        assert!(engine.poll(now));
        now += engine.tick_interval();
    }
    let readout = model.borrow().readout.clone().unwrap();
    assert_eq!(readout.frame, 4);
    assert_eq!(readout.epoch, 200);
    assert_eq!(readout.loss, Some(1.0 / 201.0));
    assert_eq!(model.borrow().trail.len(), 5);
    assert_eq!(engine.frame(), 0);

    engine.stop();
    assert_eq!(engine.state(), PlaybackState::Stopped);
    assert_eq!(engine.next_deadline(), None);
    assert!(!engine.poll(now + Duration::from_secs(1)));
    assert_eq!(model.borrow().readout.as_ref().map(|r| r.frame), Some(0));
}

#[test]
fn truncated_loss_series_is_clamped() {
    let dir = tempfile::tempdir().unwrap();
    write_recording(dir.path(), 100, &[0, 50, 100, 150, 200]);
    let mut engine = PlaybackEngine::default();
    engine.load_dir(dir.path(), Some(50), 10).unwrap();
    assert_eq!(engine.loss_index(4), Some(99));
    assert_eq!(engine.frame_view(4).unwrap().loss, Some(0.01));
}

#[test]
fn empty_loss_file_shows_sentinel() {
    let dir = tempfile::tempdir().unwrap();
    write_recording(dir.path(), 0, &[0, 10]);
    let sink = ChartSink::new();
    let model = sink.model();
    let mut engine = PlaybackEngine::default();
    engine.bind_sink(Box::new(sink));
    engine.load_dir(dir.path(), None, 10).unwrap();
    engine.seek(1).unwrap();
    let readout = model.borrow().readout.clone().unwrap();
    assert_eq!(readout.loss_label(), NO_LOSS_LABEL);
}

#[test]
fn broken_recording_leaves_engine_empty() {
    let dir = tempfile::tempdir().unwrap();
    write_recording(dir.path(), 10, &[0, 10]);
    let mut engine = PlaybackEngine::default();
    engine.load_dir(dir.path(), None, 10).unwrap();
    assert_eq!(engine.frame_count(), 2);

    fs::write(
        dir.path().join("weights_history").join("weights_history_20.csv"),
        "not,numbers",
    )
    .unwrap();
    let err = engine.load_dir(dir.path(), None, 10).unwrap_err();
    assert!(matches!(err, SupervisorError::Load { .. }));
    assert_eq!(engine.frame_count(), 0);
    assert!(matches!(
        engine.play(Instant::now()),
        Err(SupervisorError::EmptyPlayback)
    ));
    assert_eq!(engine.state(), PlaybackState::Stopped);
}

#[test]
fn unbinding_mid_playback_stops_rendering() {
    let dir = tempfile::tempdir().unwrap();
    write_recording(dir.path(), 30, &[0, 10, 20]);
    let sink = ChartSink::new();
    let model = sink.model();
    let mut engine = PlaybackEngine::default();
    engine.bind_sink(Box::new(sink));
    engine.load_dir(dir.path(), None, 10).unwrap();

    let now = Instant::now();
    engine.play(now).unwrap();
    assert!(engine.poll(now));
    drop(engine.unbind_sink());
    assert_eq!(engine.state(), PlaybackState::Paused);
    assert!(!engine.poll(now + Duration::from_secs(5)));
    assert_eq!(model.borrow().trail.len(), 1);
}

#[test]
fn training_job_npz_history_replays() {
    let dir = tempfile::tempdir().unwrap();
    let history = dir.path().join("weights_history");
    fs::create_dir_all(&history).unwrap();
    fs::write(
        dir.path().join("training_losses.csv"),
        "2.500000000000000000e-01,3.000000000000000000e-01\n1.250000000000000000e-01,2.000000000000000000e-01\n",
    )
    .unwrap();
    for (epoch, scale) in [(0, 1.0), (1, 2.0)] {
        let mut npz = NpzWriter::new(
            File::create(history.join(format!("weights_history_{epoch:04}.npz"))).unwrap(),
        );
        npz.add_array("W1", &(array![[0.5, -0.5]] * scale)).unwrap();
        npz.add_array("W2", &array![[1.0], [2.0]]).unwrap();
        npz.finish().unwrap();
    }

    let sink = ChartSink::new();
    let model = sink.model();
    let mut engine = PlaybackEngine::default();
    engine.bind_sink(Box::new(sink));
    engine.load_dir(dir.path(), None, 10).unwrap();
    assert_eq!(engine.frame_count(), 2);
    assert_eq!(engine.sampling_interval(), 1);

    engine.seek(1).unwrap();
    let readout = model.borrow().readout.clone().unwrap();
    assert_eq!((readout.epoch, readout.w1, readout.w2), (1, 1.0, -1.0));
    assert_eq!(readout.loss, Some(0.125));
    assert_eq!(engine.recording().snapshots[1].weights, vec![1.0, -1.0, 1.0, 2.0]);
}
