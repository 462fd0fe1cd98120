//! Controller configuration read from the environment
//!
//! | Variable                           | Default                         |
//! |------------------------------------|---------------------------------|
//! | `KANARI_SELECTOR_LABELS`           | `app,name,app.kubernetes.io/name` |
//! | `KANARI_INCLUDE_LABEL_PREFIX`      | empty (no labels copied)        |
//! | `KANARI_ENABLE_CONFIG_TRACKING`    | `true`                          |
//! | `KANARI_PROGRESS_DEADLINE_SECONDS` | `600`                           |

use crate::crd::canary::DEFAULT_PROGRESS_DEADLINE_SECONDS;
use tracing::warn;

pub const DEFAULT_SELECTOR_LABELS: [&str; 3] = ["app", "name", "app.kubernetes.io/name"];

/// Settings shared by every workload controller
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CoreConfig {
    /// Candidate selector label keys, in order of preference
    pub selector_labels: Vec<String>,

    /// Label key prefixes copied from target objects onto primaries.
    /// `*` copies every label.
    pub include_label_prefix: Vec<String>,

    /// Track ConfigMaps and Secrets referenced by the target
    pub enable_config_tracking: bool,

    /// Deadline used when a Canary does not set `progressDeadlineSeconds`
    pub progress_deadline_seconds: i32,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            selector_labels: DEFAULT_SELECTOR_LABELS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            include_label_prefix: Vec::new(),
            enable_config_tracking: true,
            progress_deadline_seconds: DEFAULT_PROGRESS_DEADLINE_SECONDS,
        }
    }
}

impl CoreConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key/value source; unset or invalid values use defaults
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(labels) = lookup("KANARI_SELECTOR_LABELS") {
            let labels = split_list(&labels);
            if labels.is_empty() {
                warn!("KANARI_SELECTOR_LABELS is empty, using defaults");
            } else {
                config.selector_labels = labels;
            }
        }

        if let Some(prefixes) = lookup("KANARI_INCLUDE_LABEL_PREFIX") {
            config.include_label_prefix = split_list(&prefixes);
        }

        if let Some(value) = lookup("KANARI_ENABLE_CONFIG_TRACKING") {
            match value.trim().parse::<bool>() {
                Ok(enabled) => config.enable_config_tracking = enabled,
                Err(_) => warn!(
                    value = %value,
                    "Invalid KANARI_ENABLE_CONFIG_TRACKING, keeping config tracking enabled"
                ),
            }
        }

        if let Some(value) = lookup("KANARI_PROGRESS_DEADLINE_SECONDS") {
            match value.trim().parse::<i32>() {
                Ok(seconds) if seconds > 0 => config.progress_deadline_seconds = seconds,
                _ => warn!(
                    value = %value,
                    default = DEFAULT_PROGRESS_DEADLINE_SECONDS,
                    "Invalid KANARI_PROGRESS_DEADLINE_SECONDS, using default"
                ),
            }
        }

        config
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
