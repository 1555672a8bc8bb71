use std::sync::Arc;

use crate::application::admin::AdminCacheService;
use crate::cache::GateEvaluator;

#[derive(Clone)]
pub struct AdminState {
    pub cache: Arc<AdminCacheService>,
    /// Decides who counts as an operator on the admin surface.
    pub gate: Arc<dyn GateEvaluator>,
}
