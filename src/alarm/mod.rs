//! Threshold alarms over metric samples.
//!
//! Rules are evaluated by the [`ThresholdEvaluator`] against persisted
//! [`AlarmState`]s. Every state change yields one [`AlarmEvent`], which the
//! [`Notifier`] delivers to subscribers and appends to the alarm history.

pub mod evaluator;
pub mod event;
pub mod notifier;
pub mod rules;
pub mod state;

pub use evaluator::{AlarmStateStore, ThresholdEvaluator};
pub use event::AlarmEvent;
pub use notifier::{AlarmHistory, Notifier, NotifyTarget};
pub use rules::AlarmRule;
pub use state::{AlarmState, StateValue};
