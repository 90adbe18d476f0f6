//! Per-attribute evaluation: runs every enabled strategy against a new value,
//! folds their verdicts into one classification and raises alerts.

use tracing::{debug, info, warn};

use super::{StrategyConfig, StrategyState};
use crate::model::{AttributeKey, Classification};
use crate::ports::{AlertSink, HistoryStore};

const DEFAULT_TEMPLATE: &str = "Anomalous value detected on %ENTITY_ID% attribute %ATTRIBUTE_NAME%";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Pass,
    Fail,
    /// Not enough history to build a baseline.
    Insufficient,
    /// The strategy could not interpret this event.
    Skipped,
}

#[derive(Debug, Clone)]
struct StrategySlot {
    config: StrategyConfig,
    state: Option<StrategyState>,
}

impl StrategySlot {
    fn check(
        &mut self,
        key: &AttributeKey,
        value: &serde_json::Value,
        timestamp: i64,
        history: &dyn HistoryStore,
    ) -> Verdict {
        let timespan = self.config.timespan_ms();
        let stale = self
            .state
            .as_ref()
            .map_or(true, |state| state.is_stale(timestamp, timespan));

        if stale {
            let from = timestamp.saturating_sub(timespan);
            let window = match history.window(key, from, timestamp) {
                Ok(window) => window,
                Err(e) => {
                    warn!(%key, strategy = %self.config.kind, error = %e, "history read failed");
                    return Verdict::Insufficient;
                }
            };
            match StrategyState::recompute(&self.config, &window) {
                Ok(state) => {
                    debug!(%key, strategy = %self.config.kind, points = window.len(), "baseline recomputed");
                    self.state = Some(state);
                }
                Err(e) => {
                    debug!(%key, strategy = %self.config.kind, reason = %e, "baseline unavailable");
                    return Verdict::Insufficient;
                }
            }
        }

        let Some(state) = self.state.as_mut() else {
            return Verdict::Insufficient;
        };
        match state.validate(value, timestamp, self.config.deviation_fraction()) {
            Ok(true) => Verdict::Pass,
            Ok(false) => Verdict::Fail,
            Err(e) => {
                debug!(%key, strategy = %self.config.kind, reason = %e, "strategy skipped");
                Verdict::Skipped
            }
        }
    }
}

/// Owns the strategy states of one watched attribute.
#[derive(Debug, Clone)]
pub struct AttributeEvaluator {
    key: AttributeKey,
    slots: Vec<StrategySlot>,
}

impl AttributeEvaluator {
    /// Only enabled strategies get a slot. State is built lazily on the first
    /// evaluation.
    pub fn new(key: AttributeKey, configs: &[StrategyConfig]) -> Self {
        let slots = configs
            .iter()
            .filter(|c| c.enabled)
            .map(|c| StrategySlot { config: c.clone(), state: None })
            .collect();
        Self { key, slots }
    }

    pub fn key(&self) -> &AttributeKey {
        &self.key
    }

    pub fn strategy_count(&self) -> usize {
        self.slots.len()
    }

    pub fn state(&self, index: usize) -> Option<&StrategyState> {
        self.slots.get(index).and_then(|slot| slot.state.as_ref())
    }

    /// Classify a value observed at `timestamp`.
    ///
    /// A single failing strategy yields its own outlier class, more than one
    /// yields `Multiple`. Without any failure the result is `Unchecked` if
    /// any strategy lacked history or none could check the value at all.
    pub fn evaluate(
        &mut self,
        value: Option<&serde_json::Value>,
        timestamp: i64,
        history: &dyn HistoryStore,
        alerts: &dyn AlertSink,
    ) -> Classification {
        let Some(value) = value else {
            debug!(key = %self.key, "update carries no value");
            return Classification::Unchecked;
        };

        let Self { key, slots } = self;
        let mut anomalies = 0usize;
        let mut outcome = Classification::Valid;
        let mut checked = false;
        let mut insufficient = false;

        for slot in slots.iter_mut() {
            match slot.check(key, value, timestamp, history) {
                Verdict::Pass => checked = true,
                Verdict::Fail => {
                    checked = true;
                    anomalies += 1;
                    outcome = slot.config.kind.outlier();
                    raise_alert(key, &slot.config, alerts);
                }
                Verdict::Insufficient => insufficient = true,
                Verdict::Skipped => {}
            }
        }

        match anomalies {
            0 if insufficient || !checked => Classification::Unchecked,
            0 | 1 => outcome,
            _ => Classification::Multiple,
        }
    }
}

/// Substitute the reserved placeholders in an alert template.
pub fn render_message(template: &str, key: &AttributeKey) -> String {
    template
        .replace("%ENTITY_ID%", &key.entity_id)
        .replace("%ATTRIBUTE_NAME%", &key.attribute_name)
}

/// Failures are logged and never affect the classification.
fn raise_alert(key: &AttributeKey, config: &StrategyConfig, alerts: &dyn AlertSink) {
    if !config.alert_enabled {
        return;
    }
    let Some(severity) = config.alert_severity else {
        return;
    };
    let template = config.alert_message_template.as_deref().unwrap_or(DEFAULT_TEMPLATE);
    let message = render_message(template, key);

    let id = match alerts.create_alert(&config.title(), &message, severity) {
        Ok(id) => id,
        Err(e) => {
            warn!(%key, strategy = %config.kind, error = %e, "failed to create alert");
            return;
        }
    };
    info!(%key, strategy = %config.kind, alert_id = %id, severity = severity.as_str(), "alert raised");

    if let Some(assignee) = &config.alert_assignee {
        if let Err(e) = alerts.assign_alert(id, assignee) {
            warn!(%key, alert_id = %id, %assignee, error = %e, "failed to assign alert");
        }
    }
}
