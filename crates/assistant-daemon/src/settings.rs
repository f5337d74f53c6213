//! Live inference settings.
//!
//! Settings are swapped atomically and every generation takes a snapshot
//! when it starts, so a change never affects a generation already in flight.

use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::Serialize;

use crate::inference::prompt::supports_reasoning;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InferenceSettings {
    pub model: String,
    pub reasoning_enabled: bool,
}

impl InferenceSettings {
    /// Reasoning is only requested from models known to support it.
    pub fn reasoning_active(&self) -> bool {
        self.reasoning_enabled && supports_reasoning(&self.model)
    }
}

pub struct SettingsHandle {
    current: ArcSwap<InferenceSettings>,
}

impl SettingsHandle {
    pub fn new(initial: InferenceSettings) -> Self {
        Self {
            current: ArcSwap::from_pointee(initial),
        }
    }

    pub fn snapshot(&self) -> Arc<InferenceSettings> {
        self.current.load_full()
    }

    pub fn set_reasoning_enabled(&self, enabled: bool) {
        self.current.rcu(|current| InferenceSettings {
            reasoning_enabled: enabled,
            ..(**current).clone()
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_is_isolated_from_later_changes() {
        let handle = SettingsHandle::new(InferenceSettings {
            model: "deepseek-r1:8b".into(),
            reasoning_enabled: false,
        });
        let before = handle.snapshot();

        handle.set_reasoning_enabled(true);

        assert!(!before.reasoning_enabled);
        let after = handle.snapshot();
        assert!(after.reasoning_enabled);
        assert_eq!(after.model, "deepseek-r1:8b");
    }

    #[test]
    fn test_reasoning_requires_capable_model() {
        let plain = InferenceSettings {
            model: "llama3.2".into(),
            reasoning_enabled: true,
        };
        assert!(!plain.reasoning_active());

        let capable = InferenceSettings {
            model: "ollama://library/deepseek-r1:latest".into(),
            reasoning_enabled: true,
        };
        assert!(capable.reasoning_active());
    }
}
