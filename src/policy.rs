use std::collections::HashMap;
use std::time::Duration;
use crate::feature::{Feature, PolicyManager};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Timeouts {
    pub handshake: Duration,
    pub connection_idle: Duration,
    pub uplink_only: Duration,
    pub downlink_only: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            handshake: Duration::from_secs(4),
            connection_idle: Duration::from_secs(300),
            uplink_only: Duration::from_secs(2),
            downlink_only: Duration::from_secs(5),
        }
    }
}

/// Per-user-level bundle governing handshake, idle and half-close timing.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Policy {
    pub timeouts: Timeouts,
}

#[derive(Clone, Debug, Default)]
pub struct PolicyConfig {
    pub levels: HashMap<u32, Policy>,
}

/// Static level table; unknown levels fall back to the default policy.
pub struct LevelPolicyManager {
    levels: HashMap<u32, Policy>,
}

impl LevelPolicyManager {
    pub fn new(config: PolicyConfig) -> Self {
        Self { levels: config.levels }
    }
}

#[async_trait::async_trait]
impl Feature for LevelPolicyManager {
    async fn start(&self) -> crate::Result<()> {
        Ok(())
    }

    async fn close(&self) -> crate::Result<()> {
        Ok(())
    }
}

impl PolicyManager for LevelPolicyManager {
    fn for_level(&self, level: u32) -> Policy {
        self.levels.get(&level).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_level_falls_back_to_default() {
        let mut levels = HashMap::new();
        levels.insert(
            1,
            Policy {
                timeouts: Timeouts {
                    connection_idle: Duration::from_secs(30),
                    ..Timeouts::default()
                },
            },
        );
        let manager = LevelPolicyManager::new(PolicyConfig { levels });

        assert_eq!(
            manager.for_level(1).timeouts.connection_idle,
            Duration::from_secs(30)
        );
        assert_eq!(manager.for_level(7), Policy::default());
    }
}
