//! 能力注册表
//!
//! 启动时按意图类型注册能力，之后只读；Dispatcher 在每个分支里查表，查不到即「无法处理」。

use std::collections::HashMap;
use std::sync::Arc;

use crate::capabilities::Capability;
use crate::orchestration::IntentKind;

#[derive(Default, Clone)]
pub struct CapabilityRegistry {
    table: HashMap<IntentKind, Arc<dyn Capability>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 为某个意图类型注册能力；同一类型重复注册时后者覆盖前者
    pub fn register(mut self, kind: IntentKind, capability: Arc<dyn Capability>) -> Self {
        if let IntentKind::Unknown(name) = &kind {
            tracing::warn!("Registering capability for unknown intent kind '{}'", name);
        }
        self.table.insert(kind, capability);
        self
    }

    pub fn resolve(&self, kind: &IntentKind) -> Option<Arc<dyn Capability>> {
        self.table.get(kind).cloned()
    }

    /// 已注册的意图类型
    pub fn kinds(&self) -> Vec<IntentKind> {
        IntentKind::KNOWN
            .into_iter()
            .filter(|k| self.table.contains_key(k))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}
