use std::sync::Arc;

use crate::pipeline::config::{ConfigResolver, InvocationContext};
use crate::pipeline::Pipeline;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Pipeline,
    /// Object names are re-resolved per request so environment changes apply
    /// without a restart.
    pub resolver: Arc<ConfigResolver>,
    pub context: InvocationContext,
}

impl AppState {
    pub fn new(pipeline: Pipeline, resolver: ConfigResolver) -> Self {
        Self {
            pipeline,
            resolver: Arc::new(resolver),
            context: InvocationContext::Webserver,
        }
    }
}
