//! Recording lifecycle through the sink and through `CaptureService`.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyscreen_capture::FrameSource;
use anyscreen_core::{EncoderError, RecordingConfig, RecordingError, SessionError, SessionKind};
use anyscreen_pipeline::{CaptureService, RecorderPhase, RecordingSink, SessionState, Sink};
use common::CountingEncoder;
use tracing::Span;

fn config(frame_rate: u32) -> RecordingConfig {
    RecordingConfig {
        width: 64,
        height: 36,
        frame_rate,
        output_path: "captures/test.mp4".into(),
        ..RecordingConfig::default()
    }
}

fn service(encoder: Arc<CountingEncoder>) -> CaptureService {
    CaptureService::new(common::pattern(64, 36), encoder, Span::none())
}

#[tokio::test]
async fn start_before_configure_is_rejected() {
    let encoder = Arc::new(CountingEncoder::default());
    let sink = RecordingSink::new("rec", encoder.clone(), Duration::from_secs(1), Span::none());
    assert_eq!(sink.start().await, Err(RecordingError::EncoderNotConfigured));
    assert_eq!(encoder.opens.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn deliver_before_start_never_touches_the_encoder() {
    let encoder = Arc::new(CountingEncoder::default());
    let sink = RecordingSink::new("rec", encoder.clone(), Duration::from_secs(1), Span::none());
    let frame = common::pattern(64, 36).capture(0).unwrap();

    sink.configure(config(30)).unwrap();
    sink.deliver(&frame).await.unwrap();
    assert_eq!(encoder.writes(), 0);

    sink.start().await.unwrap();
    sink.deliver(&frame).await.unwrap();
    assert_eq!(encoder.writes(), 1);
    assert_eq!(sink.phase(), RecorderPhase::Running);
}

#[tokio::test]
async fn stop_twice_releases_the_encoder_once() {
    let encoder = Arc::new(CountingEncoder::default());
    let svc = service(encoder.clone());
    svc.start_recording(config(30)).await.unwrap();
    assert!(svc.is_recording());
    tokio::time::sleep(Duration::from_millis(120)).await;

    let summary = svc.stop_recording().await.unwrap().expect("was recording");
    assert_eq!(svc.stop_recording().await, Ok(None));
    assert_eq!(encoder.closes(), 1);
    assert!(summary.frames_written > 0);
    assert_eq!(summary.frames_written, u64::from(encoder.writes()));
    assert!(!svc.is_recording());
}

#[tokio::test]
async fn encoder_failure_stops_the_session_and_reaches_the_waiter() {
    let encoder = Arc::new(CountingEncoder::failing_from(4));
    let svc = service(encoder.clone());
    svc.start_recording(config(60)).await.unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(2), svc.wait_recording())
        .await
        .expect("session ends")
        .expect("a recording was started");
    let err = outcome.unwrap_err();
    assert!(matches!(err, RecordingError::Encoder(EncoderError::EncodingFailed { .. })));
    assert!(err.to_string().starts_with("Recording failed"));

    assert!(!svc.is_recording());
    assert_eq!(svc.recording_state(), SessionState::Idle);
    assert_eq!(encoder.writes(), 4);
    assert_eq!(encoder.closes(), 1);

    // The failed session no longer blocks a new one.
    assert_eq!(svc.stop_recording().await, Ok(None));
    svc.start_recording(config(30)).await.unwrap();
    svc.shutdown().await.unwrap();
}

#[tokio::test]
async fn concurrent_starts_admit_exactly_one() {
    let svc = Arc::new(service(Arc::new(CountingEncoder::default())));
    let (a, b) = tokio::join!(svc.start_recording(config(30)), svc.start_recording(config(30)));
    let results = [a, b];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results.iter().any(|r| matches!(
        r,
        Err(SessionError::AlreadyInProgress { kind: SessionKind::Recording, display_index: 0 })
    )));
    svc.shutdown().await.unwrap();
}
