use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Check {
    pub name: String,
    pub passed: bool,
    pub detail: String,
}

impl Check {
    pub fn new(name: impl Into<String>, passed: bool, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerificationReport {
    pub checks: Vec<Check>,
    pub readiness_score: f64,
    pub blockers: Vec<String>,
    /// Steps left applied but not self-verified.
    pub external_verification: Vec<String>,
}

impl VerificationReport {
    pub fn from_checks(checks: Vec<Check>) -> Self {
        let readiness_score = readiness_score(&checks);
        let blockers = checks
            .iter()
            .filter(|check| !check.passed)
            .map(|check| format!("{}: {}", check.name, check.detail))
            .collect();
        Self {
            checks,
            readiness_score,
            blockers,
            external_verification: Vec::new(),
        }
    }

    pub fn passed(&self) -> usize {
        self.checks.iter().filter(|check| check.passed).count()
    }

    pub fn is_ready(&self) -> bool {
        self.blockers.is_empty()
    }
}

/// Percentage of passing checks, one decimal place. No checks counts as ready.
pub fn readiness_score(checks: &[Check]) -> f64 {
    if checks.is_empty() {
        return 100.0;
    }
    let passed = checks.iter().filter(|check| check.passed).count();
    if passed == checks.len() {
        return 100.0;
    }
    let raw = passed as f64 / checks.len() as f64 * 100.0;
    // Rounding must not lift a partial pass to 100.0.
    ((raw * 10.0).round() / 10.0).min(99.9)
}
