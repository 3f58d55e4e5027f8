// Config validation
// Rejects configs that would make every confined call fail or hang.

use crate::config::types::{Result, SandboxConfig, SandboxError};
use std::time::Duration;

/// Smallest address-space cap accepted for a worker (16 MiB)
pub const MIN_MAX_MEMORY: u64 = 16 * 1024 * 1024;

/// Validation result with detailed errors
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn add_error(&mut self, error: String) {
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Check a config before a coordinator accepts it
pub fn validate_config(config: &SandboxConfig) -> Result<ValidationResult> {
    let mut result = ValidationResult::default();

    validate_durations(config, &mut result);
    validate_memory(config, &mut result);
    validate_policies(config, &mut result);

    for warning in &result.warnings {
        log::warn!("config: {}", warning);
    }

    if !result.is_valid() {
        return Err(SandboxError::Config(format!(
            "invalid sandbox config:\n{}",
            result.errors.join("\n")
        )));
    }

    Ok(result)
}

fn validate_durations(config: &SandboxConfig, result: &mut ValidationResult) {
    if config.timeout.is_zero() {
        result.add_error("timeout must be greater than zero".to_string());
    }
    if config.worker_poll_interval.is_zero() {
        result.add_error("worker_poll_interval must be greater than zero".to_string());
    }
    if config.reap_timeout.is_zero() {
        result.add_error("reap_timeout must be greater than zero".to_string());
    }
    if !config.use_subprocess && config.persistent_worker {
        result.add_warning(
            "persistent_worker has no effect when use_subprocess is false".to_string(),
        );
    }
    if config.worker_poll_interval > Duration::from_secs(60) {
        result.add_warning(format!(
            "worker_poll_interval of {:?} delays orphan cleanup",
            config.worker_poll_interval
        ));
    }
}

fn validate_memory(config: &SandboxConfig, result: &mut ValidationResult) {
    match config.max_memory {
        Some(bytes) if bytes < MIN_MAX_MEMORY => result.add_error(format!(
            "max_memory of {} bytes is below the minimum of {} bytes",
            bytes, MIN_MAX_MEMORY
        )),
        None if config.use_subprocess => result.add_warning(
            "max_memory is unset; worker address space is not capped".to_string(),
        ),
        _ => {}
    }
}

fn validate_policies(config: &SandboxConfig, result: &mut ValidationResult) {
    let names = config.policy_names();
    for (index, name) in names.iter().enumerate() {
        if name.is_empty() {
            result.add_error(format!("policy #{} has an empty name", index));
        } else if names[..index].contains(name) {
            result.add_warning(format!("policy '{}' is configured more than once", name));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let result = validate_config(&SandboxConfig::default()).unwrap();
        assert!(result.is_valid());
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let config = SandboxConfig::default().with_timeout(Duration::ZERO);
        let err = validate_config(&config).unwrap_err();
        assert!(matches!(err, SandboxError::Config(msg) if msg.contains("timeout")));
    }

    #[test]
    fn tiny_memory_cap_is_rejected() {
        let config = SandboxConfig::default().with_max_memory(Some(4096));
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn uncapped_worker_only_warns() {
        let config = SandboxConfig::default().with_max_memory(None);
        let result = validate_config(&config).unwrap();
        assert!(result.is_valid());
        assert_eq!(result.warnings.len(), 1);
    }
}
