//! Configuration validation.

use std::path::Path;

use chrono::Local;

use crate::config::WatchConfig;
use crate::error::{Result, ScheduleError, ValidationError, WatcherError};
use crate::schedule::CronSchedule;

/// Outcome of validating a [`WatchConfig`]. Every problem is reported, not
/// just the first one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationResult {
    /// The watched directory exists.
    pub path_valid: bool,

    /// The cron expression parses and fires at least once.
    pub cron_valid: bool,

    /// Reasons for rejection, empty when valid.
    pub errors: Vec<ValidationError>,
}

impl ValidationResult {
    /// Check if the configuration can be used.
    pub fn is_valid(&self) -> bool {
        self.path_valid && self.cron_valid
    }

    /// Convert into a `Result`, carrying every error on failure.
    pub fn into_result(self) -> Result<()> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(WatcherError::Validation(self.errors))
        }
    }
}

/// Validate `config`, resolving a relative path against `base_dir`.
pub fn validate(config: &WatchConfig, base_dir: &Path) -> ValidationResult {
    let mut errors = Vec::new();

    let path = config.resolve_path(base_dir);
    let path_valid = path.is_dir();
    if !path_valid {
        errors.push(ValidationError::PathNotFound(path));
    }

    let schedule = CronSchedule::parse(&config.cron).and_then(|schedule| {
        match schedule.next_from(Local::now().naive_local()) {
            Some(_) => Ok(schedule),
            None => Err(ScheduleError::NoOccurrence(schedule.to_string())),
        }
    });
    let cron_valid = match schedule {
        Ok(_) => true,
        Err(e) => {
            errors.push(ValidationError::InvalidSchedule {
                expression: config.cron.clone(),
                reason: e.to_string(),
            });
            false
        }
    };

    ValidationResult {
        path_valid,
        cron_valid,
        errors,
    }
}
