//! The per-frame detection pipeline
//!
//! [`Detector`] owns every piece of mutable pipeline state (calibration,
//! heart-rate history, rolling indicator windows, alert history, adaptive
//! thresholds and the session record) and advances it one frame at a time:
//! landmarks in, tells and an optional alert out.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::alert::{stress_level, AlertManager};
use crate::calibration::{BaselineCalibrator, CalibrationSample};
use crate::config::DetectorConfig;
use crate::error::TellError;
use crate::landmarks;
use crate::mood::{EmotionClassifier, MoodTracker, MoodWorker};
use crate::rppg::HeartRateEstimator;
use crate::session::{SessionMemory, SessionSummary};
use crate::tells::{FrameMeasurements, HeartRateStatus, TellGenerator};
use crate::thresholds::AdaptiveThresholdManager;
use crate::types::{Baseline, FaceLandmarks, FrameInput, FrameOutput};

pub struct Detector {
    config: DetectorConfig,
    calibrator: BaselineCalibrator,
    heart_rate: HeartRateEstimator,
    tells: TellGenerator,
    alerts: AlertManager,
    thresholds: AdaptiveThresholdManager,
    mood: MoodTracker,
    mood_worker: Option<MoodWorker>,
    frames_since_mood: u32,
    session: Option<SessionMemory>,
    last_timestamp: f64,
}

impl Default for Detector {
    fn default() -> Self {
        Self::new(DetectorConfig::default())
    }
}

impl Detector {
    pub fn new(config: DetectorConfig) -> Self {
        Self {
            calibrator: BaselineCalibrator::new(config.calibration.clone()),
            heart_rate: HeartRateEstimator::new(config.heart_rate.clone()),
            tells: TellGenerator::new(config.tells.clone()),
            alerts: AlertManager::new(config.alerts.clone()),
            thresholds: AdaptiveThresholdManager::new(config.thresholds.clone()),
            mood: MoodTracker::new(config.mood.clone()),
            mood_worker: None,
            frames_since_mood: 0,
            session: None,
            last_timestamp: 0.0,
            config,
        }
    }

    /// A detector that classifies mood in the background from frame images
    pub fn with_classifier(config: DetectorConfig, classifier: Arc<dyn EmotionClassifier>) -> Self {
        let mut detector = Self::new(config);
        detector.mood_worker = Some(MoodWorker::new(classifier));
        detector
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    pub fn baseline(&self) -> &Baseline {
        self.calibrator.baseline()
    }

    pub fn is_calibrating(&self) -> bool {
        !self.calibrator.is_ready()
    }

    pub fn thresholds(&self) -> &AdaptiveThresholdManager {
        &self.thresholds
    }

    pub fn alerts(&self) -> &AlertManager {
        &self.alerts
    }

    pub fn mood(&self) -> Option<&str> {
        self.mood.current()
    }

    pub fn session(&self) -> Option<&SessionMemory> {
        self.session.as_ref()
    }

    /// Process one frame
    pub fn process_frame(&mut self, input: &FrameInput) -> FrameOutput {
        let now = input.timestamp;
        self.last_timestamp = now;
        self.ensure_session(now);
        self.poll_mood();

        let face = input.face.as_ref().filter(|face| match face.validate() {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "skipping malformed face landmarks");
                false
            }
        });

        let measurements = face.map(|face| self.measure(input, face));

        if let (Some(m), false) = (&measurements, self.calibrator.is_ready()) {
            let completed = self.calibrator.observe(CalibrationSample {
                timestamp: now,
                blink: m.eyes_closed,
                hand_contact: m.hand_contact,
                gaze: m.gaze,
                lip_ratio: m.lip_ratio,
                bpm: m.heart_rate.bpm(),
                emotion: self.mood.current().map(str::to_string),
            });
            if completed {
                self.store_baseline();
            }
        }

        let calibrating = !self.calibrator.is_ready();
        let detecting = !calibrating && input.calibrated;

        let tells = self
            .tells
            .process(
                measurements.as_ref(),
                self.calibrator.baseline(),
                &self.thresholds,
                detecting,
            )
            .clone();
        let stress = stress_level(&tells);

        let alert = if detecting {
            self.alerts.process(&tells, stress, now)
        } else {
            None
        };

        if let Some(alert) = &alert {
            let thresholds_at_time = self.thresholds.snapshot();
            let adapted =
                self.thresholds
                    .record_detection(&alert.indicators, alert.confidence, now);
            if let Some(session) = self.session.as_mut() {
                session.record(
                    &alert.indicators,
                    alert.confidence,
                    now,
                    thresholds_at_time,
                    adapted,
                );
                session.set_thresholds(self.thresholds.snapshot());
            }
        }

        FrameOutput {
            timestamp: now,
            tells,
            alert,
            bpm: measurements.as_ref().and_then(|m| m.heart_rate.bpm()),
            calibrating,
            calibration_progress: self.calibrator.progress(now),
            mood: self.mood.current().map(str::to_string),
            stress_level: stress,
        }
    }

    fn measure(&mut self, input: &FrameInput, face: &FaceLandmarks) -> FrameMeasurements {
        let cheek = input.cheek_signal.or_else(|| {
            input
                .image
                .as_ref()
                .and_then(|image| landmarks::cheek_signal(image, face))
        });
        match cheek {
            Some(sample) => self.heart_rate.push(sample),
            None => debug!("no cheek sample this frame"),
        }

        let heart_rate = if !self.heart_rate.is_ready() {
            HeartRateStatus::Collecting {
                samples: self.heart_rate.sample_count(),
                required: self.config.heart_rate.min_samples,
            }
        } else {
            match self.heart_rate.estimate(input.fps) {
                Some(bpm) => HeartRateStatus::Estimate(bpm),
                None => HeartRateStatus::Calculating,
            }
        };

        self.dispatch_mood(input);

        FrameMeasurements {
            timestamp: input.timestamp,
            fps: input.fps,
            eyes_closed: landmarks::eye_aspect_ratio(face)
                .is_some_and(|ear| ear < self.config.tells.eye_closed_ratio),
            hand_contact: landmarks::hand_on_face(face, &input.hands),
            gaze: landmarks::gaze(face),
            lip_ratio: landmarks::lip_ratio(face),
            heart_rate,
        }
    }

    fn dispatch_mood(&mut self, input: &FrameInput) {
        let (Some(worker), Some(image)) = (&self.mood_worker, &input.image) else {
            return;
        };
        self.frames_since_mood += 1;
        if self.frames_since_mood < self.config.mood.dispatch_every {
            return;
        }
        match worker.dispatch(image.clone()) {
            Ok(true) => self.frames_since_mood = 0,
            Ok(false) => {}
            Err(e) => warn!(error = %e, "failed to start mood classification"),
        }
    }

    fn poll_mood(&mut self) {
        let Some(result) = self.mood_worker.as_ref().and_then(MoodWorker::poll) else {
            return;
        };
        match result {
            Ok(Some(emotion)) => {
                self.mood.observe(&emotion);
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "mood classification failed, keeping previous mood"),
        }
    }

    fn ensure_session(&mut self, now: f64) {
        if self.session.is_none() {
            self.thresholds = AdaptiveThresholdManager::new(self.config.thresholds.clone());
            self.session = Some(SessionMemory::start(now, self.thresholds.snapshot()));
            if self.calibrator.is_ready() {
                self.store_baseline();
            }
        }
    }

    fn store_baseline(&mut self) {
        let baseline = self.calibrator.baseline().clone();
        if let Some(session) = self.session.as_mut() {
            session.set_baseline(baseline);
        }
    }

    /// Complete calibration now with whatever has been collected
    pub fn finish_calibration(&mut self) -> &Baseline {
        if !self.calibrator.is_ready() {
            self.calibrator.finalize();
            self.store_baseline();
        }
        self.calibrator.baseline()
    }

    /// Drop the baseline and all live detection state, and start collecting again
    pub fn recalibrate(&mut self) {
        self.calibrator.reset();
        self.tells.reset();
        self.alerts.clear_history();
        if let Some(session) = self.session.as_mut() {
            session.set_baseline(Baseline::default());
        }
    }

    pub fn summary(&self) -> Result<SessionSummary, TellError> {
        self.session
            .as_ref()
            .map(|session| session.summary(self.last_timestamp))
            .ok_or(TellError::NoActiveSession)
    }

    /// Close the current session. The next frame starts a fresh one with
    /// default thresholds.
    pub fn end_session(&mut self) -> Result<SessionMemory, TellError> {
        let mut session = self.session.take().ok_or(TellError::NoActiveSession)?;
        session.set_thresholds(self.thresholds.snapshot());
        self.thresholds = AdaptiveThresholdManager::new(self.config.thresholds.clone());
        Ok(session)
    }

    /// End the session and write it under `dir`
    pub fn save_session(&mut self, dir: &Path) -> Result<PathBuf, TellError> {
        let session = self.end_session()?;
        session.save_to_dir(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CalibrationPolicy;
    use crate::fixtures;
    use crate::mood::EmotionScore;
    use crate::types::{Frame, IndicatorKind, Landmark};
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    fn frame_count(frames: u32) -> DetectorConfig {
        let mut config = DetectorConfig::default();
        config.calibration.policy = CalibrationPolicy::FrameCount { frames };
        config
    }

    fn input(i: usize, face: Option<FaceLandmarks>) -> FrameInput {
        let mut input = FrameInput::new(i as f64 / 30.0);
        input.face = face;
        input
    }

    /// Run `frames` relaxed frames starting at frame `start`
    fn run_relaxed(detector: &mut Detector, start: usize, frames: usize) {
        for i in start..start + frames {
            detector.process_frame(&input(i, Some(fixtures::face())));
        }
    }

    #[test]
    fn test_calibration_then_alert() {
        let mut detector = Detector::new(frame_count(100));
        run_relaxed(&mut detector, 0, 99);
        assert!(detector.is_calibrating());

        let out = detector.process_frame(&input(99, Some(fixtures::face())));
        assert!(!out.calibrating);
        assert_eq!(out.calibration_progress, 1.0);
        assert!(detector.baseline().calibrated);
        assert_eq!(detector.baseline().sample_count, 100);
        assert_eq!(detector.baseline().bpm, 0.0);

        // Lips were last evaluated at frame 99; 116 is past the 0.5 s throttle
        let mut tense = input(116, Some(fixtures::face_with(|f| fixtures::press_lips(f))));
        tense.hands = vec![fixtures::hand_on_face()];
        let out = detector.process_frame(&tense);

        assert!(out.tells.contains_key(&IndicatorKind::Hand));
        assert!(out.tells.contains_key(&IndicatorKind::Lips));
        assert_eq!(out.stress_level, 2);
        let alert = out.alert.unwrap();
        assert!((alert.confidence - 0.7).abs() < 1e-9);
        assert_eq!(alert.priority, 20 + 15 + 20);

        assert!((detector.thresholds().threshold(IndicatorKind::Hand) - 19.8).abs() < 1e-9);
        let session = detector.session().unwrap();
        assert_eq!(session.detection_events.len(), 1);
        assert_eq!(session.deception_count, 1);
        assert_eq!(
            session.detection_events[0].thresholds_at_time[&IndicatorKind::Hand],
            20.0
        );
        assert!(session.baseline_metrics.calibrated);
    }

    #[test]
    fn test_lips_throttled_right_after_calibration() {
        let mut detector = Detector::new(frame_count(100));
        run_relaxed(&mut detector, 0, 100);
        assert!(!detector.is_calibrating());

        let pressed = || Some(fixtures::face_with(|f| fixtures::press_lips(f)));
        let out = detector.process_frame(&input(100, pressed()));
        assert!(!out.tells.contains_key(&IndicatorKind::Lips));

        let out = detector.process_frame(&input(115, pressed()));
        assert!(out.tells.contains_key(&IndicatorKind::Lips));
    }

    #[test]
    fn test_recalibrate_forgets_alert_history() {
        let mut detector = Detector::new(frame_count(100));
        run_relaxed(&mut detector, 0, 100);
        let mut tense = input(116, Some(fixtures::face_with(|f| fixtures::press_lips(f))));
        tense.hands = vec![fixtures::hand_on_face()];
        assert!(detector.process_frame(&tense).alert.is_some());
        assert!(detector.alerts().last_accepted().is_some());

        detector.recalibrate();
        assert_eq!(detector.alerts().last_accepted(), None);
        assert_eq!(detector.alerts().recorded(), 1);
    }

    #[test]
    fn test_calibrating_output_has_only_display() {
        let mut detector = Detector::default();
        let mut tense = input(0, Some(fixtures::face_with(|f| fixtures::press_lips(f))));
        tense.hands = vec![fixtures::hand_on_face()];
        let out = detector.process_frame(&tense);
        assert!(out.calibrating);
        assert_eq!(out.tells.len(), 1);
        assert_eq!(
            out.tells[&IndicatorKind::AvgBpmDisplay].text,
            "BPM: Collecting... (0/60)"
        );
        assert!(out.alert.is_none());
    }

    #[test]
    fn test_caller_gate_suppresses_detection() {
        let mut detector = Detector::new(frame_count(1));
        run_relaxed(&mut detector, 0, 1);
        let mut gated = input(1, Some(fixtures::face_with(|f| fixtures::press_lips(f))));
        gated.calibrated = false;
        let out = detector.process_frame(&gated);
        assert!(!out.tells.contains_key(&IndicatorKind::Lips));
    }

    #[test]
    fn test_missing_and_malformed_face() {
        let mut detector = Detector::new(frame_count(1));
        run_relaxed(&mut detector, 0, 1);

        let out = detector.process_frame(&input(1, None));
        assert_eq!(
            out.tells[&IndicatorKind::AvgBpmDisplay].text,
            "BPM: No face detected"
        );

        let broken = FaceLandmarks {
            points: vec![Landmark::new(0.5, 0.5); 12],
        };
        let out = detector.process_frame(&input(2, Some(broken)));
        assert_eq!(
            out.tells[&IndicatorKind::AvgBpmDisplay].text,
            "BPM: No face detected"
        );
        assert!(out.bpm.is_none());
    }

    #[test]
    fn test_cheek_signal_from_image() {
        let mut detector = Detector::default();
        let mut frame = input(0, Some(fixtures::face()));
        frame.image = Some(fixtures::frame(64, 64, 120));
        detector.process_frame(&frame);
        let out = detector.process_frame(&frame);
        assert_eq!(
            out.tells[&IndicatorKind::AvgBpmDisplay].text,
            "BPM: Collecting... (2/60)"
        );
    }

    #[test]
    fn test_manual_finish_and_recalibrate() {
        let mut config = DetectorConfig::default();
        config.calibration.policy = CalibrationPolicy::Manual;
        let mut detector = Detector::new(config);
        run_relaxed(&mut detector, 0, 30);
        assert!(detector.is_calibrating());

        let baseline = detector.finish_calibration().clone();
        assert!(baseline.calibrated);
        assert_eq!(baseline.sample_count, 30);
        assert!(!detector.is_calibrating());

        detector.recalibrate();
        assert!(detector.is_calibrating());
        assert!(!detector.baseline().calibrated);
        assert!(!detector.session().unwrap().baseline_metrics.calibrated);
    }

    #[test]
    fn test_end_session() {
        let mut detector = Detector::default();
        assert!(matches!(detector.end_session(), Err(TellError::NoActiveSession)));
        assert!(detector.summary().is_err());

        run_relaxed(&mut detector, 0, 10);
        let summary = detector.summary().unwrap();
        assert_eq!(summary.total_detections, 0);
        assert!((summary.duration - 0.3).abs() < 1e-9);

        let session = detector.end_session().unwrap();
        assert_eq!(session.started_at, 0.0);
        assert!(detector.session().is_none());

        // The next frame opens a new session
        run_relaxed(&mut detector, 10, 1);
        assert_ne!(detector.session().unwrap().session_id, "");
    }

    struct Happy;

    impl EmotionClassifier for Happy {
        fn top_emotion(&self, _frame: &Frame) -> Result<Option<EmotionScore>, TellError> {
            Ok(Some(EmotionScore::new("happy", 0.9)))
        }
    }

    /// Happy for the first `good` calls, then failing
    struct FailsAfter {
        good: usize,
        calls: AtomicUsize,
    }

    impl EmotionClassifier for FailsAfter {
        fn top_emotion(&self, _frame: &Frame) -> Result<Option<EmotionScore>, TellError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.good {
                Ok(Some(EmotionScore::new("happy", 0.9)))
            } else {
                Err(TellError::Classifier("model unavailable".to_string()))
            }
        }
    }

    #[test]
    fn test_classifier_failure_keeps_mood() {
        let classifier = Arc::new(FailsAfter {
            good: 3,
            calls: AtomicUsize::new(0),
        });
        let mut detector = Detector::with_classifier(
            DetectorConfig::default(),
            Arc::clone(&classifier) as Arc<dyn EmotionClassifier>,
        );
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut i = 0;
        let mut step = |detector: &mut Detector| {
            let mut frame = input(i, Some(fixtures::face()));
            frame.image = Some(fixtures::frame(8, 8, 100));
            i += 1;
            std::thread::sleep(Duration::from_millis(2));
            detector.process_frame(&frame).mood
        };

        let mut mood = None;
        while mood.is_none() && Instant::now() < deadline {
            mood = step(&mut detector);
        }
        assert_eq!(mood.as_deref(), Some("happy"));

        while classifier.calls.load(Ordering::SeqCst) < 6 && Instant::now() < deadline {
            assert_eq!(step(&mut detector).as_deref(), Some("happy"));
        }
        assert!(classifier.calls.load(Ordering::SeqCst) >= 6);
        for _ in 0..20 {
            assert_eq!(step(&mut detector).as_deref(), Some("happy"));
        }
        assert_eq!(detector.mood(), Some("happy"));
    }

    #[test]
    fn test_background_mood() {
        let mut detector = Detector::with_classifier(DetectorConfig::default(), Arc::new(Happy));
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut i = 0;
        let mut mood = None;
        while mood.is_none() && Instant::now() < deadline {
            let mut frame = input(i, Some(fixtures::face()));
            frame.image = Some(fixtures::frame(8, 8, 100));
            mood = detector.process_frame(&frame).mood;
            i += 1;
            std::thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(mood.as_deref(), Some("happy"));
    }
}
