//! # Cronwatch
//!
//! Watches one directory during the time windows described by a cron
//! expression and reports, when each window closes, which files were
//! added, changed and deleted while it was open.
//!
//! ## Features
//!
//! - **Cron Windows**: Consecutive minute occurrences form a watch window;
//!   isolated occurrences never open one
//! - **Change Reconciliation**: Create/delete/rename sequences collapse to
//!   what actually happened
//! - **Hot Reload**: Configuration changes restart the watch, debounced
//! - **Drift Tolerance**: The activation timer re-reads the clock on every
//!   fire
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Cronwatch                                │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  WatchConfig ──► WatchController ──► EventRouter ──► Summary    │
//! │       │                │                  │                     │
//! │       ▼                ▼                  ▼                     │
//! │  ConfigWatcher   ActivationTimer   ChangeAggregator             │
//! │                        │                                        │
//! │                        ▼                                        │
//! │                 ScheduleEvaluator                               │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod aggregator;
pub mod config;
pub mod controller;
pub mod error;
pub mod event;
pub mod schedule;
pub mod timer;
pub mod validation;

pub use aggregator::{ChangeAggregator, ChangeSet, Summary};
pub use config::{ConfigWatcher, ControllerOptions, ReloadSignal, WatchConfig};
pub use controller::{EventRouter, ReloadOutcome, WatchController};
pub use error::{Result, ScheduleError, ValidationError, WatcherError};
pub use event::{FileEvent, FileEventKind};
pub use schedule::{CronSchedule, Occurrence, OffsetSource, ScheduleEvaluator};
pub use timer::{
    ActivationState, ActivationTimer, Clock, SystemClock, Transition, TransitionSink,
};
pub use validation::{ValidationResult, validate};
