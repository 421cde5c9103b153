//! User setting state
//!
//! Settings are changed from the host side; the change marshals through the
//! event loop as deferred work, which updates this state, notifies the
//! affected managers, and broadcasts a setting-changed event to registered
//! nanoapps. Reads are loop-thread only.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Setting {
    BleAvailable,
    WifiAvailable,
    LocationEnabled,
}

pub const SETTING_COUNT: usize = 3;

#[derive(Debug, Clone)]
pub struct SettingManager {
    enabled: [bool; SETTING_COUNT],
}

impl Default for SettingManager {
    // All settings start enabled until the host says otherwise.
    fn default() -> Self {
        Self {
            enabled: [true; SETTING_COUNT],
        }
    }
}

impl SettingManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_setting_enabled(&self, setting: Setting) -> bool {
        self.enabled[setting as usize]
    }

    /// Applies a host-reported change; returns whether the value changed.
    pub fn apply_change(&mut self, setting: Setting, enabled: bool) -> bool {
        let slot = &mut self.enabled[setting as usize];
        let changed = *slot != enabled;
        *slot = enabled;
        if changed {
            tracing::info!("setting {:?} -> {}", setting, enabled);
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_default_enabled() {
        let mgr = SettingManager::new();
        assert!(mgr.get_setting_enabled(Setting::BleAvailable));
        assert!(mgr.get_setting_enabled(Setting::WifiAvailable));
    }

    #[test]
    fn apply_change_reports_transitions_only() {
        let mut mgr = SettingManager::new();
        assert!(mgr.apply_change(Setting::BleAvailable, false));
        assert!(!mgr.apply_change(Setting::BleAvailable, false));
        assert!(!mgr.get_setting_enabled(Setting::BleAvailable));
        assert!(mgr.apply_change(Setting::BleAvailable, true));
    }
}
