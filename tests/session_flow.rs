//! End-to-end session: calibrate on a resting pulse, then react to a raised
//! pulse with pressed lips, then persist and reload the session and its
//! review timeline.

use pretty_assertions::assert_eq;
use std::f64::consts::TAU;
use tellwatch::types::FACE_LANDMARK_COUNT_WITH_IRIS;
use tellwatch::{
    CalibrationPolicy, Detector, DetectorConfig, FaceLandmarks, FrameInput, IndicatorKind,
    Landmark, ReviewSession, SessionMemory,
};
use tellwatch::review::MomentReason;

const FPS: f64 = 30.0;
const CALIBRATION_FRAMES: usize = 300;

fn face(pressed_lips: bool) -> FaceLandmarks {
    let mut points = vec![Landmark::new(0.5, 0.5); FACE_LANDMARK_COUNT_WITH_IRIS];
    let set = |points: &mut Vec<Landmark>, i: usize, x: f64, y: f64| {
        points[i] = Landmark::new(x, y);
    };
    // eyes: top, bottom, inner, outer
    set(&mut points, 159, 0.40, 0.44);
    set(&mut points, 145, 0.40, 0.46);
    set(&mut points, 133, 0.44, 0.45);
    set(&mut points, 33, 0.36, 0.45);
    set(&mut points, 386, 0.60, 0.44);
    set(&mut points, 374, 0.60, 0.46);
    set(&mut points, 362, 0.56, 0.45);
    set(&mut points, 263, 0.64, 0.45);
    // irises
    set(&mut points, 471, 0.39, 0.45);
    set(&mut points, 469, 0.41, 0.45);
    set(&mut points, 476, 0.59, 0.45);
    set(&mut points, 474, 0.61, 0.45);
    // mouth
    set(&mut points, 0, 0.50, 0.60);
    set(&mut points, 17, 0.50, if pressed_lips { 0.62 } else { 0.64 });
    set(&mut points, 61, 0.45, 0.62);
    set(&mut points, 291, 0.55, 0.62);
    FaceLandmarks { points }
}

/// A cheek color trace pulsing at `bpm`
fn pulse(frame: usize, bpm: f64) -> f64 {
    let t = frame as f64 / FPS;
    120.0 + 2.0 * (TAU * bpm / 60.0 * t).sin()
}

fn frame(i: usize, bpm: f64, pressed_lips: bool) -> FrameInput {
    let mut input = FrameInput::new(i as f64 / FPS);
    input.fps = FPS;
    input.face = Some(face(pressed_lips));
    input.cheek_signal = Some(pulse(i, bpm));
    input
}

fn detector() -> Detector {
    let mut config = DetectorConfig::default();
    config.calibration.policy = CalibrationPolicy::FrameCount {
        frames: CALIBRATION_FRAMES as u32,
    };
    Detector::new(config)
}

#[test]
fn test_raised_pulse_and_pressed_lips_raise_an_alert() {
    let mut detector = detector();

    for i in 0..CALIBRATION_FRAMES {
        let out = detector.process_frame(&frame(i, 75.0, false));
        assert!(out.alert.is_none());
    }
    assert!(!detector.is_calibrating());
    let baseline = detector.baseline().clone();
    assert!(baseline.calibrated);
    assert!((baseline.bpm - 75.0).abs() < 3.0, "baseline {}", baseline.bpm);
    assert!((baseline.lip_ratio - 0.4).abs() < 1e-9);

    let mut alert = None;
    for i in CALIBRATION_FRAMES..CALIBRATION_FRAMES + 300 {
        let out = detector.process_frame(&frame(i, 110.0, true));
        assert!(out.tells.contains_key(&IndicatorKind::AvgBpmDisplay));
        if let Some(a) = out.alert.filter(|a| a.indicators.contains(&IndicatorKind::BpmChange)) {
            alert = Some(a);
            break;
        }
    }

    let alert = alert.expect("raised pulse never alerted");
    assert!(alert.indicators.contains(&IndicatorKind::Lips));
    assert!(alert.confidence >= 0.7);
    assert!(alert.details.contains_key("stress_level"));

    // The accepted alert made the detector more sensitive to heart-rate change
    assert!(detector.thresholds().threshold(IndicatorKind::BpmChange) < 30.0);
    let session = detector.session().unwrap();
    assert!(!session.detection_events.is_empty());
    assert!(session.baseline_metrics.calibrated);
}

#[test]
fn test_lost_face_keeps_display_tell() {
    let mut detector = detector();
    for i in 0..CALIBRATION_FRAMES {
        detector.process_frame(&frame(i, 75.0, false));
    }

    let out = detector.process_frame(&FrameInput::new(CALIBRATION_FRAMES as f64 / FPS));
    assert_eq!(out.tells.len(), 1);
    assert_eq!(
        out.tells[&IndicatorKind::AvgBpmDisplay].text,
        "BPM: No face detected"
    );
    assert!(out.alert.is_none());
    assert!(out.bpm.is_none());
}

#[test]
fn test_frames_replay_from_json() {
    let mut detector = detector();
    let line = serde_json::to_string(&frame(0, 75.0, false)).unwrap();
    let input: FrameInput = serde_json::from_str(&line).unwrap();
    let out = detector.process_frame(&input);
    assert!(out.calibrating);

    let minimal: FrameInput = serde_json::from_str(r#"{"timestamp": 0.5}"#).unwrap();
    assert_eq!(minimal.fps, 30.0);
    assert!(minimal.calibrated);
    assert!(minimal.face.is_none());
}

#[test]
fn test_saved_session_reloads() {
    let mut detector = detector();
    for i in 0..CALIBRATION_FRAMES + 10 {
        detector.process_frame(&frame(i, 75.0, false));
    }
    let live = detector.session().unwrap().clone();

    let dir = std::env::temp_dir().join(format!("tellwatch-flow-{}", uuid::Uuid::new_v4()));
    let path = detector.save_session(&dir).unwrap();
    assert!(detector.session().is_none());

    let loaded = SessionMemory::load(&path).unwrap();
    assert_eq!(loaded.session_id, live.session_id);
    assert!(loaded.baseline_metrics.calibrated);
    assert!((loaded.baseline_metrics.bpm - live.baseline_metrics.bpm).abs() < 1e-9);
    assert_eq!(loaded.detection_events.len(), live.detection_events.len());
    std::fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn test_review_timeline_follows_the_session() {
    let mut detector = detector();
    let mut review = ReviewSession::new("flow");

    for i in 0..CALIBRATION_FRAMES {
        let out = detector.process_frame(&frame(i, 75.0, false));
        review.record(&out, detector.baseline());
    }
    let calibration_end = review.calibration_end.expect("calibration never ended");
    assert!((calibration_end - (CALIBRATION_FRAMES - 1) as f64 / FPS).abs() < 1e-9);
    assert!(review.events.is_empty());

    for i in CALIBRATION_FRAMES..CALIBRATION_FRAMES + 300 {
        let out = detector.process_frame(&frame(i, 110.0, true));
        review.record(&out, detector.baseline());
        if out.alert.is_some() {
            break;
        }
    }
    review.add_marker("pulse raised");

    assert!(review.events.iter().any(|e| e.kind == IndicatorKind::Lips));
    let reasons: Vec<_> = review.key_moments.iter().map(|m| m.reason).collect();
    assert!(reasons.contains(&MomentReason::AlertCluster));
    assert_eq!(reasons.last(), Some(&MomentReason::Manual));

    let stats = review.stats();
    assert_eq!(stats.total_frames, review.frames.len() as u64);
    assert!(stats.total_alerts >= 1);
    assert!((stats.baseline_bpm - detector.baseline().bpm).abs() < 1e-9);

    let dir = std::env::temp_dir().join(format!("tellwatch-review-{}", uuid::Uuid::new_v4()));
    let path = review.save_to_dir(&dir).unwrap();
    assert!(path.ends_with("flow_review.json"));
    let loaded = ReviewSession::load(&path).unwrap();
    let reloaded = loaded.stats();
    assert_eq!(reloaded.total_tells, stats.total_tells);
    assert_eq!(reloaded.total_alerts, stats.total_alerts);
    assert_eq!(reloaded.key_moments_count, stats.key_moments_count);
    assert!((reloaded.duration - stats.duration).abs() < 1e-9);
    std::fs::remove_dir_all(&dir).unwrap();
}
