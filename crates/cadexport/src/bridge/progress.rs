//! Time-based progress estimation for the export tool.
//!
//! The tool reports nothing while it works, so progress is inferred from
//! elapsed time: a fixed sequence of phases, each covering a band of the
//! percentage range, followed by a tail that creeps toward the ceiling
//! with a logarithmically decaying increment.

use std::time::Duration;

use serde::Serialize;

/// Relative cost of an export format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatClass {
    Standard,
    /// Formats whose export takes several times longer, such as `dwg`.
    Heavy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolPhase {
    Launching,
    ToolReady,
    OpeningDocument,
    ExportStarting,
    ExportAwaited,
    /// Past the expected duration; progress only creeps.
    Overrun,
}

#[derive(Debug, Clone, Copy)]
struct PhaseStep {
    phase: ToolPhase,
    ends_at: Duration,
    reaches: u8,
}

const fn step(phase: ToolPhase, secs: u64, reaches: u8) -> PhaseStep {
    PhaseStep {
        phase,
        ends_at: Duration::from_secs(secs),
        reaches,
    }
}

const STANDARD_STEPS: [PhaseStep; 5] = [
    step(ToolPhase::Launching, 2, 5),
    step(ToolPhase::ToolReady, 6, 15),
    step(ToolPhase::OpeningDocument, 20, 35),
    step(ToolPhase::ExportStarting, 30, 50),
    step(ToolPhase::ExportAwaited, 90, 80),
];

const HEAVY_STEPS: [PhaseStep; 5] = [
    step(ToolPhase::Launching, 3, 3),
    step(ToolPhase::ToolReady, 12, 10),
    step(ToolPhase::OpeningDocument, 45, 25),
    step(ToolPhase::ExportStarting, 75, 40),
    step(ToolPhase::ExportAwaited, 300, 75),
];

#[derive(Debug, Clone)]
pub struct ProgressModel {
    steps: Vec<PhaseStep>,
    ceiling: u8,
    tail_scale: Duration,
}

impl ProgressModel {
    /// Builds the phase table for `class`. `ceiling` is clamped to 1..=99.
    pub fn for_class(class: FormatClass, ceiling: u8) -> Self {
        let ceiling = ceiling.clamp(1, 99);
        let (table, tail_scale) = match class {
            FormatClass::Standard => (&STANDARD_STEPS, Duration::from_secs(30)),
            FormatClass::Heavy => (&HEAVY_STEPS, Duration::from_secs(120)),
        };
        let steps = table
            .iter()
            .map(|s| PhaseStep {
                reaches: s.reaches.min(ceiling - 1),
                ..*s
            })
            .collect();
        Self {
            steps,
            ceiling,
            tail_scale,
        }
    }

    pub fn ceiling(&self) -> u8 {
        self.ceiling
    }

    pub fn phase_at(&self, elapsed: Duration) -> ToolPhase {
        self.steps
            .iter()
            .find(|s| elapsed < s.ends_at)
            .map(|s| s.phase)
            .unwrap_or(ToolPhase::Overrun)
    }

    /// Estimated percentage after `elapsed`; always below the ceiling.
    pub fn estimate(&self, elapsed: Duration) -> u8 {
        let mut start_at = Duration::ZERO;
        let mut start_pct = 0u8;

        for s in &self.steps {
            if elapsed < s.ends_at {
                let span = (s.ends_at - start_at).as_secs_f64();
                let into = (elapsed - start_at).as_secs_f64();
                let frac = if span > 0.0 { into / span } else { 1.0 };
                let pct = f64::from(start_pct) + f64::from(s.reaches - start_pct) * frac;
                return pct.floor() as u8;
            }
            start_at = s.ends_at;
            start_pct = s.reaches;
        }

        let over = (elapsed - start_at).as_secs_f64() / self.tail_scale.as_secs_f64();
        let frac = 1.0 - 1.0 / (1.0 + (1.0 + over).ln());
        let pct = f64::from(start_pct) + f64::from(self.ceiling - start_pct) * frac;
        (pct.floor() as u8).min(self.ceiling - 1)
    }
}

/// Turns elapsed time into a non-decreasing sequence of estimates.
#[derive(Debug, Clone)]
pub struct ProgressEstimator {
    model: ProgressModel,
    last: u8,
}

impl ProgressEstimator {
    pub fn new(model: ProgressModel) -> Self {
        Self { model, last: 0 }
    }

    pub fn observe(&mut self, elapsed: Duration) -> u8 {
        self.last = self.last.max(self.model.estimate(elapsed));
        self.last
    }

    pub fn phase(&self, elapsed: Duration) -> ToolPhase {
        self.model.phase_at(elapsed)
    }
}
