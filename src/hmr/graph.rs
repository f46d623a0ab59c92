//! Affected-module walk
//!
//! Starting from a changed module, climb the parent edges until every path
//! ends in a module that accepts the change. Hitting a decline or an entry
//! module on the way means the change cannot be applied in place.

use indexmap::IndexMap;
use std::rc::Rc;

use crate::modules::{ModuleId, ModuleRecord, ModuleRegistry};

use super::hot::HotState;

/// What replacing one module would do to the running graph
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateEffect {
    /// The module, or one on the way up, declined itself
    SelfDeclined {
        module_id: ModuleId,
        chain: Vec<ModuleId>,
    },
    /// `parent_id` declined the replacement of `module_id`
    Declined {
        module_id: ModuleId,
        parent_id: ModuleId,
        chain: Vec<ModuleId>,
    },
    /// The walk reached an entry module nobody accepts
    Unaccepted {
        module_id: ModuleId,
        chain: Vec<ModuleId>,
    },
    Accepted {
        module_id: ModuleId,
        outdated_modules: Vec<ModuleId>,
        /// Accepting parent -> the dependencies it will be told about
        outdated_dependencies: IndexMap<ModuleId, Vec<ModuleId>>,
    },
    /// Removed by the update, with no replacement
    Disposed { module_id: ModuleId },
}

impl UpdateEffect {
    pub fn module_id(&self) -> &ModuleId {
        match self {
            UpdateEffect::SelfDeclined { module_id, .. }
            | UpdateEffect::Declined { module_id, .. }
            | UpdateEffect::Unaccepted { module_id, .. }
            | UpdateEffect::Accepted { module_id, .. }
            | UpdateEffect::Disposed { module_id } => module_id,
        }
    }

    pub fn chain(&self) -> &[ModuleId] {
        match self {
            UpdateEffect::SelfDeclined { chain, .. }
            | UpdateEffect::Declined { chain, .. }
            | UpdateEffect::Unaccepted { chain, .. } => chain,
            _ => &[],
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, UpdateEffect::Accepted { .. })
    }
}

struct QueueItem {
    id: ModuleId,
    chain: Vec<ModuleId>,
}

fn hot_state(record: &ModuleRecord) -> Rc<HotState> {
    record
        .hot()
        .unwrap_or_else(|| Rc::new(HotState::new(false, None)))
}

/// Walk the parent edges of `update_id` and classify the update
pub fn affected_modules(modules: &ModuleRegistry, update_id: &ModuleId) -> UpdateEffect {
    let mut outdated_modules = vec![update_id.clone()];
    let mut outdated_dependencies: IndexMap<ModuleId, Vec<ModuleId>> = IndexMap::new();
    let mut queue = vec![QueueItem {
        id: update_id.clone(),
        chain: vec![update_id.clone()],
    }];

    while let Some(QueueItem { id, chain }) = queue.pop() {
        let Some(record) = modules.cached(id.as_str()) else {
            continue;
        };
        let hot = hot_state(&record);
        if hot.is_self_accepted() && !hot.is_self_invalidated() {
            continue;
        }
        if hot.is_self_declined() {
            return UpdateEffect::SelfDeclined { module_id: id, chain };
        }
        if hot.is_entry() {
            return UpdateEffect::Unaccepted { module_id: id, chain };
        }

        for parent_id in record.parents() {
            let Some(parent) = modules.cached(parent_id.as_str()) else {
                continue;
            };
            let parent_hot = hot_state(&parent);
            if parent_hot.declines(&id) {
                let mut chain = chain.clone();
                chain.push(parent_id.clone());
                return UpdateEffect::Declined {
                    module_id: id,
                    parent_id,
                    chain,
                };
            }
            if outdated_modules.contains(&parent_id) {
                continue;
            }
            if parent_hot.accepts(&id) {
                let deps = outdated_dependencies.entry(parent_id).or_default();
                if !deps.contains(&id) {
                    deps.push(id.clone());
                }
                continue;
            }
            outdated_dependencies.shift_remove(&parent_id);
            outdated_modules.push(parent_id.clone());
            let mut next_chain = chain.clone();
            next_chain.push(parent_id.clone());
            queue.push(QueueItem {
                id: parent_id,
                chain: next_chain,
            });
        }
    }

    UpdateEffect::Accepted {
        module_id: update_id.clone(),
        outdated_modules,
        outdated_dependencies,
    }
}
