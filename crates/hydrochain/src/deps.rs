//! Collaborators shared by every machine.

use crate::collaborators::{ChainingService, FlexService, ReservoirRuleService};
use crate::config::Settings;
use crate::queue::QueueAdapter;
use crate::store::Store;
use crate::strategy::StrategyFactory;
use std::fmt;
use std::sync::Arc;

/// Everything the machines need from the outside world, resolved once at
/// startup. Cheap to clone.
#[derive(Clone)]
pub struct Deps {
    pub settings: Arc<Settings>,
    pub store: Arc<dyn Store>,
    pub queue: Arc<dyn QueueAdapter>,
    pub chaining: Arc<dyn ChainingService>,
    pub flex: Arc<dyn FlexService>,
    pub reservoir: Arc<dyn ReservoirRuleService>,
    pub strategies: Arc<dyn StrategyFactory>,
}

impl fmt::Debug for Deps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deps")
            .field("study_name", &self.settings.study_name)
            .field("base_path", &self.settings.base_path)
            .finish_non_exhaustive()
    }
}
