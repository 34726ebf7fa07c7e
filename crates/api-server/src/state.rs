//! Shared application state for the HTTP layer.

use std::path::PathBuf;
use std::sync::Arc;

use agent_runner::Runner;
use foreman_core::Store;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub runner: Arc<Runner>,
    pub workspaces: Arc<Vec<PathBuf>>,
}

impl AppState {
    pub fn new(store: Arc<Store>, runner: Arc<Runner>, workspaces: Vec<PathBuf>) -> Self {
        Self {
            store,
            runner,
            workspaces: Arc::new(workspaces),
        }
    }
}
