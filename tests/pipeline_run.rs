mod common;

use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use common::{init_logger, survey, FlakyArchive, EXPOSURES_PER_NIGHT, MOVERS};
use daomop::output::{CsvTrackWriter, TrackSink};
use daomop::pipeline::{Pipeline, PipelineConfig};
use daomop::tracks::{ClosureReason, TrackState};
use daomop::{DaomopError, ErrorClass};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_pipeline_recovers_every_mover() {
    init_logger();
    let survey = survey(3, 150, 42);
    let archive = Arc::new(FlakyArchive::new(&survey.catalogs()));

    let output = Pipeline::new(PipelineConfig::default())
        .run(archive, &survey.ids(), CancellationToken::new())
        .await
        .unwrap();

    let summary = &output.summary;
    assert_eq!(summary.requested, 9);
    assert_eq!(summary.loaded, 9);
    assert!(summary.skipped.is_empty());
    assert_eq!(summary.detections, 9 * survey.detections_per_exposure());
    assert_eq!(summary.stationary, 9 * survey.stars);
    assert_eq!(summary.nights, 3);
    assert_eq!(summary.nights_matched, 3);
    assert_eq!(summary.tracklets, 3 * MOVERS.len());
    assert!(!summary.cancelled);

    assert_eq!(output.tracks.len(), MOVERS.len());
    for (k, ranked) in output.tracks.iter().enumerate() {
        assert_eq!(ranked.rank, k + 1);
        let track = &ranked.track;
        assert_eq!(track.tracklets().len(), 3);
        assert_eq!(track.detection_count(), 3 * EXPOSURES_PER_NIGHT);
        assert_eq!(track.state(), TrackState::Closed(ClosureReason::EndOfRun));

        // All detections of a track come from the same object.
        let mags: Vec<f64> = track
            .detections()
            .map(|id| output.store.detection(id).mag)
            .collect();
        assert!(mags.iter().all(|m| (m - mags[0]).abs() < 1e-9));
    }
    for window in output.tracks.windows(2) {
        assert!(window[0].score >= window[1].score);
    }
}

#[tokio::test]
async fn test_pipeline_is_independent_of_exposure_order() {
    init_logger();
    let survey = survey(2, 80, 7);
    let archive = Arc::new(FlakyArchive::new(&survey.catalogs()));
    let pipeline = Pipeline::new(PipelineConfig::builder().fetch_workers(2).build().unwrap());

    let ids = survey.ids();
    let mut reversed = ids.clone();
    reversed.reverse();

    let first = pipeline
        .run(Arc::clone(&archive), &ids, CancellationToken::new())
        .await
        .unwrap();
    let second = pipeline
        .run(archive, &reversed, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(first.tracks, second.tracks);
    assert_eq!(first.tracks.len(), MOVERS.len());
}

#[tokio::test]
async fn test_skipped_exposures_are_reported() {
    init_logger();
    let survey = survey(2, 40, 3);
    let mut catalogs = survey.catalogs();
    catalogs.push(("broken", "ra,dec,mjd,mag\n10.0,95.0,57000.4,21.0\n"));
    catalogs.push(("empty", "ra,dec,mjd,mag\n"));
    let archive = Arc::new(FlakyArchive::new(&catalogs));

    let mut ids = survey.ids();
    ids.extend(["broken", "empty", "missing", "../escape"].map(String::from));

    let output = Pipeline::new(PipelineConfig::default())
        .run(archive, &ids, CancellationToken::new())
        .await
        .unwrap();

    let summary = &output.summary;
    assert_eq!(summary.loaded, survey.exposures.len());
    assert_eq!(summary.skipped.len(), 4);
    let by_class = summary.skipped_by_class();
    assert_eq!(by_class.get(&ErrorClass::NotFound), Some(&1));
    assert_eq!(by_class.get(&ErrorClass::Data), Some(&3));
    assert_eq!(output.tracks.len(), MOVERS.len());
}

#[tokio::test]
async fn test_run_without_any_detection() {
    init_logger();
    let archive = Arc::new(FlakyArchive::new(&[("empty", "ra,dec,mjd,mag\n")]));
    let ids = vec!["empty".to_string(), "missing".to_string()];

    let result = Pipeline::new(PipelineConfig::default())
        .run(archive, &ids, CancellationToken::new())
        .await;
    assert_eq!(result.unwrap_err(), DaomopError::NoDetections(2));
}

#[tokio::test]
async fn test_cancellation_stops_slow_fetches() {
    init_logger();
    let survey = survey(2, 20, 11);
    let archive =
        Arc::new(FlakyArchive::new(&survey.catalogs()).with_latency(Duration::from_secs(30)));

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let started = tokio::time::Instant::now();
    let output = Pipeline::new(PipelineConfig::default())
        .run(archive, &survey.ids(), cancel)
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(output.summary.cancelled);
    assert!(!output.summary.timed_out);
    assert!(output.tracks.is_empty());
    assert_eq!(output.summary.skipped.len(), survey.exposures.len());
    assert!(output
        .summary
        .skipped
        .iter()
        .all(|s| s.error == DaomopError::Cancelled));
}

#[tokio::test]
async fn test_run_timeout() {
    init_logger();
    let survey = survey(2, 20, 12);
    let archive =
        Arc::new(FlakyArchive::new(&survey.catalogs()).with_latency(Duration::from_secs(30)));
    let config = PipelineConfig::builder()
        .run_timeout(Some(Duration::from_millis(50)))
        .build()
        .unwrap();

    let output = Pipeline::new(config)
        .run(archive, &survey.ids(), CancellationToken::new())
        .await
        .unwrap();
    assert!(output.summary.cancelled);
    assert!(output.summary.timed_out);
    assert!(output.tracks.is_empty());
}

#[tokio::test]
async fn test_ranked_tracks_to_csv() {
    init_logger();
    let survey = survey(2, 30, 5);
    let archive = Arc::new(FlakyArchive::new(&survey.catalogs()));
    let output = Pipeline::new(PipelineConfig::default())
        .run(archive, &survey.ids(), CancellationToken::new())
        .await
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = Utf8PathBuf::from_path_buf(dir.path().join("candidates.csv")).unwrap();
    let mut writer = CsvTrackWriter::create(&path).unwrap();
    let rows = writer.write_tracks(&output.tracks, &output.store).unwrap();
    assert_eq!(rows, MOVERS.len() * 2 * EXPOSURES_PER_NIGHT);
    drop(writer);

    let text = std::fs::read_to_string(&path).unwrap();
    assert_eq!(text.lines().count(), rows + 1);
    assert!(text.starts_with("rank,score,track,night,tracklet,exposure,mjd,date,ra,dec,mag"));
}
