//! Threshold-based activity classifier running on raw IMU samples.
//!
//! Each acceleration peak that rises above the step threshold and falls back
//! below the release threshold counts once, binned by its height into a
//! step, a run or a dash. Thresholds are expressed relative to the gravity
//! magnitude measured during calibration.

use tracker_core::drivers::{ActivityClassifier, CalibrationProgress, Classification, Sample};

/// Accelerometer counts per g at the configured ±8 g range.
pub const COUNTS_PER_G: i64 = 4_096;
/// Samples averaged to measure gravity.
pub const CALIBRATION_SAMPLES: u16 = 64;

// Percent of one g.
const STEP_PERCENT: u64 = 130;
const RUN_PERCENT: u64 = 200;
const DASH_PERCENT: u64 = 300;
const RELEASE_PERCENT: u64 = 110;

/// Minimum spacing between two counted peaks, in sample timestamp units (ms).
const MIN_PEAK_GAP: u32 = 250;
/// Yaw rate that counts as a lateral wake gesture.
const LATERAL_WAKE_RATE: i16 = 8_000;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Peak {
    Idle,
    Rising { max: u64 },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
struct Thresholds {
    step: u64,
    run: u64,
    dash: u64,
    release: u64,
}

impl Thresholds {
    fn for_gravity(gravity_sq: u64) -> Self {
        let scale = |percent: u64| gravity_sq.saturating_mul(percent * percent) / 10_000;
        Self {
            step: scale(STEP_PERCENT),
            run: scale(RUN_PERCENT),
            dash: scale(DASH_PERCENT),
            release: scale(RELEASE_PERCENT),
        }
    }
}

pub struct StepClassifier {
    thresholds: Thresholds,
    peak: Peak,
    last_peak: Option<u32>,
    calibration_sum: [i64; 3],
    calibration_count: u16,
}

impl StepClassifier {
    pub fn new() -> Self {
        let one_g = u64::try_from(COUNTS_PER_G * COUNTS_PER_G).unwrap_or(u64::MAX);
        Self {
            thresholds: Thresholds::for_gravity(one_g),
            peak: Peak::Idle,
            last_peak: None,
            calibration_sum: [0; 3],
            calibration_count: 0,
        }
    }

    fn magnitude_sq(accel: [i16; 3]) -> u64 {
        accel
            .iter()
            .map(|axis| {
                let axis = i64::from(*axis);
                u64::try_from(axis * axis).unwrap_or(0)
            })
            .sum()
    }

    fn bin(&self, max: u64) -> Classification {
        let mut out = Classification::default();
        if max >= self.thresholds.dash {
            out.dashes = 1;
        } else if max >= self.thresholds.run {
            out.runs = 1;
        } else {
            out.steps = 1;
        }
        out
    }

    fn spaced(&self, timestamp: u32) -> bool {
        self.last_peak
            .is_none_or(|last| timestamp.wrapping_sub(last) >= MIN_PEAK_GAP)
    }
}

impl Default for StepClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityClassifier for StepClassifier {
    fn process(&mut self, sample: &Sample) -> Classification {
        let magnitude = Self::magnitude_sq(sample.accel);
        let mut out = Classification {
            lateral_wake: sample.gyro[2].saturating_abs() >= LATERAL_WAKE_RATE,
            ..Classification::default()
        };

        match self.peak {
            Peak::Idle if magnitude >= self.thresholds.step => {
                self.peak = Peak::Rising { max: magnitude };
            }
            Peak::Idle => {}
            Peak::Rising { max } if magnitude < self.thresholds.release => {
                self.peak = Peak::Idle;
                if self.spaced(sample.timestamp) {
                    self.last_peak = Some(sample.timestamp);
                    let counted = self.bin(max);
                    out.steps = counted.steps;
                    out.runs = counted.runs;
                    out.dashes = counted.dashes;
                }
            }
            Peak::Rising { max } => {
                self.peak = Peak::Rising {
                    max: max.max(magnitude),
                };
            }
        }
        out
    }

    fn calibrate(&mut self, sample: &Sample) -> CalibrationProgress {
        for (sum, axis) in self.calibration_sum.iter_mut().zip(sample.accel) {
            *sum += i64::from(axis);
        }
        self.calibration_count += 1;
        if self.calibration_count < CALIBRATION_SAMPLES {
            let percent = u32::from(self.calibration_count) * 100 / u32::from(CALIBRATION_SAMPLES);
            return CalibrationProgress::InProgress(u8::try_from(percent).unwrap_or(99));
        }

        let count = i64::from(self.calibration_count);
        let gravity_sq: u64 = self
            .calibration_sum
            .iter()
            .map(|sum| {
                let mean = sum / count;
                u64::try_from(mean * mean).unwrap_or(0)
            })
            .sum();
        // A free-falling or unplugged sensor keeps the previous thresholds.
        if gravity_sq > 0 {
            self.thresholds = Thresholds::for_gravity(gravity_sq);
        }
        self.calibration_sum = [0; 3];
        self.calibration_count = 0;
        CalibrationProgress::Complete
    }

    fn reset(&mut self) {
        self.peak = Peak::Idle;
        self.last_peak = None;
        self.calibration_sum = [0; 3];
        self.calibration_count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(timestamp: u32, z_in_g_percent: i64) -> Sample {
        let z = i16::try_from(COUNTS_PER_G * z_in_g_percent / 100).unwrap();
        Sample {
            timestamp,
            accel: [0, 0, z],
            ..Sample::default()
        }
    }

    fn run(classifier: &mut StepClassifier, profile: &[(u32, i64)]) -> Classification {
        let mut total = Classification::default();
        for (timestamp, level) in profile {
            let out = classifier.process(&sample(*timestamp, *level));
            total.steps += out.steps;
            total.runs += out.runs;
            total.dashes += out.dashes;
        }
        total
    }

    #[test]
    fn peaks_are_binned_by_height() {
        let mut classifier = StepClassifier::new();
        let total = run(
            &mut classifier,
            &[
                (0, 100),
                (10, 150),
                (20, 100),
                (300, 250),
                (310, 100),
                (600, 320),
                (610, 100),
            ],
        );
        assert_eq!((total.steps, total.runs, total.dashes), (1, 1, 1));
    }

    #[test]
    fn peaks_closer_than_the_gap_count_once() {
        let mut classifier = StepClassifier::new();
        let total = run(&mut classifier, &[(0, 150), (10, 100), (50, 150), (60, 100)]);
        assert_eq!(total.steps, 1);
    }

    #[test]
    fn yaw_rate_flags_lateral_wake() {
        let mut classifier = StepClassifier::new();
        let mut twist = sample(0, 100);
        twist.gyro[2] = -LATERAL_WAKE_RATE;
        assert!(classifier.process(&twist).lateral_wake);
        assert!(!classifier.process(&sample(1, 100)).lateral_wake);
    }

    #[test]
    fn calibration_rescales_thresholds() {
        let mut classifier = StepClassifier::new();
        let mut progress = CalibrationProgress::InProgress(0);
        for t in 0..u32::from(CALIBRATION_SAMPLES) {
            progress = classifier.calibrate(&sample(t, 50));
            if t == 31 {
                assert_eq!(progress, CalibrationProgress::InProgress(50));
            }
        }
        assert_eq!(progress, CalibrationProgress::Complete);

        // With gravity measured at half a g, 0.7 g already counts as a step.
        let total = run(&mut classifier, &[(0, 70), (10, 50)]);
        assert_eq!(total.steps, 1);
    }

    #[test]
    fn reset_drops_a_peak_in_progress() {
        let mut classifier = StepClassifier::new();
        classifier.process(&sample(0, 150));
        classifier.reset();
        assert_eq!(classifier.process(&sample(10, 100)), Classification::default());
    }
}
