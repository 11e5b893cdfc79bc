use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::flags::FeatureFlag;

/// 单个功能开关的规则：全局开启，或只对列出的租户开启
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FlagRule {
    pub enabled: bool,
    pub tenants: Vec<String>,
}

/// 功能开关配置，键为开关名（如 `revalidate_whitelisted_workers`）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureFlagsConfig {
    pub flags: BTreeMap<String, FlagRule>,
}

impl FeatureFlagsConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        for name in self.flags.keys() {
            if FeatureFlag::parse(name).is_none() {
                return Err(anyhow::anyhow!("未知的功能开关: {}", name));
            }
        }
        Ok(())
    }
}
