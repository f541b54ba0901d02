//! Post-calibration sanity checks. Issues are advisory and never change the
//! calibration result.

use super::data::CalibrationData;
use crate::error::{GuideError, GuideResult};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantThresholds {
    /// Largest acceptable deviation from perpendicular axes (radians)
    pub max_orthogonality_error: f64,
    /// Largest acceptable ratio between the two axis rates
    pub max_aspect_ratio: f64,
    /// Smallest acceptable return-leg travel as a fraction of the plus leg
    pub min_return_ratio: f64,
    /// Fewest steps per axis before the measurement is considered coarse
    pub min_steps: u32,
}

impl Default for AssistantThresholds {
    fn default() -> Self {
        Self {
            max_orthogonality_error: 0.1,
            max_aspect_ratio: 1.5,
            min_return_ratio: 0.25,
            min_steps: 4,
        }
    }
}

impl AssistantThresholds {
    pub fn validate(&self) -> GuideResult<()> {
        if !(self.max_orthogonality_error > 0.0) || !(self.max_aspect_ratio >= 1.0) {
            return Err(GuideError::InvalidConfig(format!(
                "assistant thresholds out of range: orthogonality {}, aspect ratio {}",
                self.max_orthogonality_error, self.max_aspect_ratio
            )));
        }
        if !(0.0..=1.0).contains(&self.min_return_ratio) {
            return Err(GuideError::InvalidConfig(format!(
                "min_return_ratio must be within 0..=1, got {}",
                self.min_return_ratio
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Severity {
    Info,
    Warning,
    Alert,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum IssueKind {
    Orthogonality,
    AspectRatio,
    AxisReturnShort,
    RateMismatch,
    FewSteps,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CalibrationIssue {
    pub kind: IssueKind,
    pub severity: Severity,
    pub message: String,
}

impl fmt::Display for CalibrationIssue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{:?}] {:?}: {}", self.severity, self.kind, self.message)
    }
}

#[derive(Debug, Clone, Default)]
pub struct CalibrationAssistant {
    thresholds: AssistantThresholds,
}

impl CalibrationAssistant {
    pub fn new(thresholds: AssistantThresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> &AssistantThresholds {
        &self.thresholds
    }

    /// Inspect a finished calibration. `label` names the device in messages.
    pub fn review(&self, data: &CalibrationData, label: &str) -> Vec<CalibrationIssue> {
        let t = &self.thresholds;
        let mut issues = Vec::new();

        if data.ra_rate <= 0.0 || data.dec_rate <= 0.0 {
            issues.push(CalibrationIssue {
                kind: IssueKind::RateMismatch,
                severity: Severity::Alert,
                message: format!(
                    "{label} reported a zero rate (axis 1 {:.4}, axis 2 {:.4})",
                    data.ra_rate, data.dec_rate
                ),
            });
        } else {
            let ratio = data.aspect_ratio();
            if ratio > t.max_aspect_ratio {
                issues.push(CalibrationIssue {
                    kind: IssueKind::AspectRatio,
                    severity: Severity::Warning,
                    message: format!(
                        "{label} axis rates differ by a factor of {ratio:.2} (limit {:.2})",
                        t.max_aspect_ratio
                    ),
                });
            }
        }

        if data.orthogonality_error > t.max_orthogonality_error {
            let severity = if data.orthogonality_error > 2.0 * t.max_orthogonality_error {
                Severity::Alert
            } else {
                Severity::Warning
            };
            issues.push(CalibrationIssue {
                kind: IssueKind::Orthogonality,
                severity,
                message: format!(
                    "{label} axes are {:.1} deg from perpendicular",
                    data.orthogonality_error.to_degrees()
                ),
            });
        }

        for (axis, plus, back) in [
            ("axis 1", data.ra_distance, data.ra_return_distance),
            ("axis 2", data.dec_distance, data.dec_return_distance),
        ] {
            if plus > 0.0 && back < t.min_return_ratio * plus {
                issues.push(CalibrationIssue {
                    kind: IssueKind::AxisReturnShort,
                    severity: Severity::Warning,
                    message: format!(
                        "{label} {axis} returned {back:.1} px after moving {plus:.1} px, \
                         possible backlash or a stuck axis"
                    ),
                });
            }
        }

        let steps = [data.ra_steps, data.dec_steps];
        let measured: Vec<u32> = steps.into_iter().filter(|&s| s > 0).collect();
        if measured.iter().any(|&s| s < t.min_steps) {
            issues.push(CalibrationIssue {
                kind: IssueKind::FewSteps,
                severity: Severity::Info,
                message: format!(
                    "{label} calibrated with only {} / {} steps, consider a shorter step size",
                    data.ra_steps, data.dec_steps
                ),
            });
        }

        for issue in &issues {
            match issue.severity {
                Severity::Info => log::info!("Calibration advisory: {issue}"),
                Severity::Warning | Severity::Alert => log::warn!("Calibration advisory: {issue}"),
            }
        }
        issues
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::data::{orthogonality_error, MoveUnits};
    use std::f64::consts::FRAC_PI_2;

    fn good() -> CalibrationData {
        CalibrationData {
            ra_angle: 0.0,
            dec_angle: FRAC_PI_2,
            ra_rate: 0.01,
            dec_rate: 0.009,
            valid: true,
            step_size: 750,
            ra_steps: 12,
            dec_steps: 11,
            ra_distance: 25.0,
            dec_distance: 25.0,
            ra_return_distance: 26.0,
            dec_return_distance: 24.0,
            ..CalibrationData::invalid(MoveUnits::Milliseconds)
        }
    }

    fn kinds(issues: &[CalibrationIssue]) -> Vec<IssueKind> {
        issues.iter().map(|i| i.kind).collect()
    }

    #[test]
    fn test_clean_calibration_has_no_issues() {
        let assistant = CalibrationAssistant::default();
        assert!(assistant.review(&good(), "mount").is_empty());
    }

    #[test]
    fn test_flags_skewed_axes() {
        let mut data = good();
        data.dec_angle = FRAC_PI_2 + 0.15;
        data.orthogonality_error = orthogonality_error(data.ra_angle, data.dec_angle);
        let issues = CalibrationAssistant::default().review(&data, "mount");
        assert_eq!(kinds(&issues), vec![IssueKind::Orthogonality]);
        assert_eq!(issues[0].severity, Severity::Warning);
    }

    #[test]
    fn test_flags_aspect_ratio() {
        let mut data = good();
        data.dec_rate = 0.004;
        let issues = CalibrationAssistant::default().review(&data, "mount");
        assert_eq!(kinds(&issues), vec![IssueKind::AspectRatio]);
    }

    #[test]
    fn test_flags_short_return_and_zero_rate() {
        let mut data = good();
        data.dec_return_distance = 2.0;
        data.ra_rate = 0.0;
        let issues = CalibrationAssistant::default().review(&data, "AO");
        let found = kinds(&issues);
        assert!(found.contains(&IssueKind::RateMismatch));
        assert!(found.contains(&IssueKind::AxisReturnShort));
        assert!(issues.iter().any(|i| i.severity == Severity::Alert));
    }

    #[test]
    fn test_flags_few_steps() {
        let mut data = good();
        data.dec_steps = 2;
        let issues = CalibrationAssistant::default().review(&data, "mount");
        assert_eq!(kinds(&issues), vec![IssueKind::FewSteps]);
    }
}
