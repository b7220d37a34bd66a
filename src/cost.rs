//! Cost accounting for a build's LLM usage.
//!
//! One entry per LLM call, priced from the published per-model rate table.
//! Before each turn the orchestrator asks whether the projected spend
//! (running total plus a conservative next-turn estimate) clears the user's
//! cap and the server ceiling.

use serde::Serialize;

/// USD per million tokens, (input, output).
type Rate = (f64, f64);

/// Floor for the next-turn estimate when there is no history yet.
const MIN_TURN_ESTIMATE_USD: f64 = 0.02;
/// Warning threshold as a fraction of the effective cap.
const WARN_FRACTION: f64 = 0.8;

/// Published rates. Unknown models price at the most expensive known rate so
/// the cap errs on the safe side.
fn rate_for_model(model: &str) -> Rate {
    match model {
        m if m.starts_with("claude-opus") => (15.0, 75.0),
        m if m.starts_with("claude-sonnet") => (3.0, 15.0),
        m if m.starts_with("claude-haiku") => (0.80, 4.0),
        m if m.starts_with("gpt-4o-mini") => (0.15, 0.60),
        m if m.starts_with("gpt-4o") => (2.50, 10.0),
        m if m.starts_with("gpt-4.1") => (2.0, 8.0),
        _ => (15.0, 75.0),
    }
}

pub fn estimate_usd(model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
    let (input_rate, output_rate) = rate_for_model(model);
    (input_tokens as f64 * input_rate + output_tokens as f64 * output_rate) / 1_000_000.0
}

#[derive(Debug, Clone, Serialize)]
pub struct CostEntry {
    pub phase: String,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub usd: f64,
}

/// Answer to the pre-turn cap check.
#[derive(Debug, Clone, PartialEq)]
pub enum CapCheck {
    Proceed,
    /// Crossed the 80 % line; emit a warning event but keep going.
    Warn { spent: f64, cap: f64 },
    /// Projected spend clears the cap; pause with a cost_cap gate.
    Exceeded { projected: f64, cap: f64 },
}

#[derive(Debug)]
pub struct CostAccountant {
    entries: Vec<CostEntry>,
    spend_cap_usd: f64,
    server_cap_usd: f64,
    warned: bool,
}

impl CostAccountant {
    pub fn new(spend_cap_usd: f64, server_cap_usd: f64) -> Self {
        Self {
            entries: Vec::new(),
            spend_cap_usd,
            server_cap_usd,
            warned: false,
        }
    }

    /// The binding cap: the tighter of the user's and the server's.
    pub fn effective_cap(&self) -> f64 {
        self.spend_cap_usd.min(self.server_cap_usd)
    }

    /// Record one call and return the priced entry for persistence.
    pub fn record(
        &mut self,
        phase: &str,
        model: &str,
        input_tokens: u64,
        output_tokens: u64,
    ) -> CostEntry {
        let entry = CostEntry {
            phase: phase.to_string(),
            model: model.to_string(),
            input_tokens,
            output_tokens,
            usd: estimate_usd(model, input_tokens, output_tokens),
        };
        self.entries.push(entry.clone());
        entry
    }

    pub fn total_usd(&self) -> f64 {
        self.entries.iter().map(|e| e.usd).sum()
    }

    pub fn total_tokens(&self) -> (u64, u64) {
        self.entries.iter().fold((0, 0), |(i, o), e| {
            (i + e.input_tokens, o + e.output_tokens)
        })
    }

    pub fn entries(&self) -> &[CostEntry] {
        &self.entries
    }

    /// Conservative next-turn estimate: the larger of the last turn's cost
    /// and the running mean, floored so a fresh build still projects ahead.
    pub fn next_turn_estimate(&self) -> f64 {
        let last = self.entries.last().map(|e| e.usd).unwrap_or(0.0);
        let mean = if self.entries.is_empty() {
            0.0
        } else {
            self.total_usd() / self.entries.len() as f64
        };
        last.max(mean).max(MIN_TURN_ESTIMATE_USD)
    }

    /// Run the pre-turn check. The warning fires at most once per build.
    pub fn check_before_turn(&mut self) -> CapCheck {
        let cap = self.effective_cap();
        let spent = self.total_usd();
        let projected = spent + self.next_turn_estimate();

        if projected >= cap {
            return CapCheck::Exceeded { projected, cap };
        }
        if !self.warned && spent >= cap * WARN_FRACTION {
            self.warned = true;
            return CapCheck::Warn { spent, cap };
        }
        CapCheck::Proceed
    }
}
