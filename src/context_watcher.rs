//! `ContextWatcher`: tracks an agent's estimated context-window usage
//! across turns and fires a one-shot warning each time it crosses a
//! threshold, forcing a handoff once the top of the ladder is reached.
//!
//! Accumulates token counts per agent and decides when to hand off,
//! retargeted from the reference codebase's `ContextTracker`/
//! `CompactionManager` pair (a single compaction trigger at one ratio) to
//! a per-agent ladder of threshold crossings, each carrying its own
//! operator-facing message.

use std::collections::HashSet;

use crate::config::AutonomaConfig;
use crate::model::TokenUsage;

/// Conservative estimate of an agent's usable context window, in tokens.
/// Real context windows vary by model; Autonoma treats this as a single
/// configurable ceiling rather than per-model metadata, since the agent
/// binary is an opaque external dependency.
pub const ASSUMED_CONTEXT_WINDOW: u64 = 200_000;

/// Outcome of recording one turn's usage against an agent's running total.
#[derive(Debug, Clone, PartialEq)]
pub enum ContextSignal {
    /// No new threshold crossed.
    Nominal,
    /// Crossed a new threshold for the first time this agent's lifetime;
    /// carries the percentage crossed for logging/notification.
    ThresholdCrossed(u8),
    /// Crossed the highest configured threshold — the agent must hand off
    /// before its next turn.
    HandoffRequired,
}

/// The canned message stamped onto an agent's next prompt when, in
/// indefinite mode, it crosses `threshold`. Below the top of the ladder
/// this is an early warning; at the top it doubles as the handoff notice.
pub fn canned_message(threshold: u8) -> String {
    format!(
        "Context budget notice: you have used roughly {threshold}% of your available context \
         window. Wrap up your current train of thought efficiently; avoid starting new broad \
         exploration."
    )
}

/// Per-agent context accounting. One instance lives for the lifetime of a
/// single agent generation; a handoff's successor gets a fresh one.
pub struct ContextWatcher {
    thresholds: Vec<u8>,
    cumulative_tokens: u64,
    fired: HashSet<u8>,
    pending_message: Option<String>,
}

impl ContextWatcher {
    pub fn new(config: &AutonomaConfig) -> Self {
        Self {
            thresholds: config.context_thresholds.clone(),
            cumulative_tokens: 0,
            fired: HashSet::new(),
            pending_message: None,
        }
    }

    /// Records one turn's usage and returns every signal it produced, in
    /// ascending threshold order. Each threshold only ever fires once per
    /// watcher (the one-shot-latch invariant) — a turn that jumps past
    /// several thresholds at once (e.g. 0% straight to 70%) still fires
    /// each of them in order rather than only the highest, so
    /// `thresholdReached` observers always see a clean prefix of the
    /// configured ladder.
    ///
    /// In indefinite mode the orchestrator stamps the agent's *next*
    /// prompt with the canned message for the highest threshold crossed
    /// this call; [`Self::take_pending_message`] exposes that message and
    /// clears it so it's delivered exactly once.
    pub fn record(&mut self, usage: &TokenUsage) -> Vec<ContextSignal> {
        self.cumulative_tokens += usage.total();
        let pct = self.percent_used();
        let highest_threshold = *self.thresholds.iter().max().unwrap_or(&100);

        let mut newly_crossed: Vec<u8> = self
            .thresholds
            .iter()
            .copied()
            .filter(|&t| pct >= t as u64 && !self.fired.contains(&t))
            .collect();
        newly_crossed.sort_unstable();

        let mut signals = Vec::with_capacity(newly_crossed.len().max(1));
        for t in &newly_crossed {
            self.fired.insert(*t);
            self.pending_message = Some(canned_message(*t));
            if *t >= highest_threshold {
                signals.push(ContextSignal::HandoffRequired);
            } else {
                signals.push(ContextSignal::ThresholdCrossed(*t));
            }
        }

        if signals.is_empty() {
            signals.push(ContextSignal::Nominal);
        }
        signals
    }

    pub fn percent_used(&self) -> u64 {
        (self.cumulative_tokens * 100) / ASSUMED_CONTEXT_WINDOW
    }

    pub fn cumulative_tokens(&self) -> u64 {
        self.cumulative_tokens
    }

    /// True once the highest configured threshold has ever fired for this
    /// agent — sticky for the rest of the agent's lifetime, since once an
    /// agent is told to hand off it stays told until it actually does.
    pub fn must_handoff(&self) -> bool {
        let highest = *self.thresholds.iter().max().unwrap_or(&100);
        self.fired.contains(&highest)
    }

    /// Takes the canned message for the most recent newly-crossed
    /// threshold, if any, clearing it so it is only ever delivered once.
    /// The caller (a phase runner, only in indefinite mode) stamps this
    /// onto the agent's next prompt.
    pub fn take_pending_message(&mut self) -> Option<String> {
        self.pending_message.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(total: u64) -> TokenUsage {
        TokenUsage {
            input_tokens: total,
            output_tokens: 0,
            cost_usd: 0.0,
        }
    }

    #[test]
    fn nominal_below_first_threshold() {
        let config = AutonomaConfig::default();
        let mut watcher = ContextWatcher::new(&config);
        let signals = watcher.record(&usage(10_000));
        assert_eq!(signals, vec![ContextSignal::Nominal]);
        assert!(watcher.take_pending_message().is_none());
    }

    #[test]
    fn crossing_40_percent_fires_once() {
        let config = AutonomaConfig::default();
        let mut watcher = ContextWatcher::new(&config);
        let signals = watcher.record(&usage(80_000));
        assert_eq!(signals, vec![ContextSignal::ThresholdCrossed(40)]);
        assert!(watcher.take_pending_message().is_some());

        // staying above 40% without crossing 50% should not refire
        let signals = watcher.record(&usage(1));
        assert_eq!(signals, vec![ContextSignal::Nominal]);
    }

    #[test]
    fn crossing_highest_threshold_requires_handoff() {
        let config = AutonomaConfig::default();
        let mut watcher = ContextWatcher::new(&config);
        let signals = watcher.record(&usage(150_000));
        assert_eq!(signals, vec![ContextSignal::HandoffRequired]);
    }

    #[test]
    fn skipping_multiple_thresholds_in_one_turn_fires_every_one_in_order() {
        let config = AutonomaConfig::default();
        let mut watcher = ContextWatcher::new(&config);
        // single huge turn jumps straight past 40/50/60 to 70%
        let signals = watcher.record(&usage(140_000));
        assert_eq!(
            signals,
            vec![
                ContextSignal::ThresholdCrossed(40),
                ContextSignal::ThresholdCrossed(50),
                ContextSignal::ThresholdCrossed(60),
                ContextSignal::ThresholdCrossed(70),
            ]
        );
        // each of 40/50/60/70 is now latched; none refires
        let signals = watcher.record(&usage(1));
        assert_eq!(signals, vec![ContextSignal::Nominal]);
    }

    #[test]
    fn take_pending_message_returns_the_highest_crossed_threshold_once() {
        let config = AutonomaConfig::default();
        let mut watcher = ContextWatcher::new(&config);
        watcher.record(&usage(140_000));
        let message = watcher.take_pending_message().unwrap();
        assert!(message.contains("70%"));
        assert!(watcher.take_pending_message().is_none());
    }

    #[test]
    fn must_handoff_is_sticky_once_top_threshold_fires() {
        let config = AutonomaConfig::default();
        let mut watcher = ContextWatcher::new(&config);
        assert!(!watcher.must_handoff());
        watcher.record(&usage(150_000));
        assert!(watcher.must_handoff());
        watcher.record(&usage(1));
        assert!(watcher.must_handoff());
    }
}
