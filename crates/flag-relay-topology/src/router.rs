//! Dispatches autoconfig messages to the right project manager.
//!
//! Environment ids and filter ids are globally unique, so deletes arrive
//! without a project key: the router broadcasts them to every manager and
//! expects exactly one to claim the id. Managers are created lazily on the
//! first add for an unseen project.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{error, info};

use flag_relay_core::environment::{
    EnvironmentId, EnvironmentParams, FilterId, FilterParams, ProjectKey,
};

use crate::manager::EnvironmentManager;
use crate::messages::{ConfigUpdateHandler, EnvironmentActionHandler};

/// Routes autoconfig messages across all managed projects.
pub struct ProjectRouter {
    managers: Mutex<HashMap<ProjectKey, EnvironmentManager>>,
    handler: Arc<dyn EnvironmentActionHandler>,
}

impl ProjectRouter {
    pub fn new(handler: Arc<dyn EnvironmentActionHandler>) -> Self {
        Self {
            managers: Mutex::new(HashMap::new()),
            handler,
        }
    }

    /// Snapshot of the project keys currently under management, sorted.
    pub fn projects(&self) -> Vec<ProjectKey> {
        let managers = self.managers.lock().expect("manager map lock poisoned");
        let mut keys: Vec<ProjectKey> = managers.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Snapshot of every logical environment id across all projects, sorted.
    pub fn environments(&self) -> Vec<String> {
        let managers = self.managers.lock().expect("manager map lock poisoned");
        let mut ids: Vec<String> = managers
            .values()
            .flat_map(|manager| manager.environments())
            .collect();
        ids.sort();
        ids
    }
}

impl ConfigUpdateHandler for ProjectRouter {
    fn add_environment(&self, params: EnvironmentParams) {
        let mut managers = self.managers.lock().expect("manager map lock poisoned");
        let project_key = params.project_key.clone();
        managers
            .entry(project_key.clone())
            .or_insert_with(|| {
                info!(project = %project_key, "creating environment manager");
                EnvironmentManager::new(project_key.clone(), Arc::clone(&self.handler))
            })
            .add_environment(params);
    }

    fn update_environment(&self, params: EnvironmentParams) {
        let mut managers = self.managers.lock().expect("manager map lock poisoned");
        match managers.get_mut(&params.project_key) {
            Some(manager) => manager.update_environment(params),
            None => {
                error!(
                    project = %params.project_key,
                    env = %params.env_id,
                    "precondition violation: update for a project that was never added"
                );
            }
        }
    }

    fn delete_environment(&self, env_id: &EnvironmentId) {
        let mut managers = self.managers.lock().expect("manager map lock poisoned");
        let claims = managers
            .values_mut()
            .map(|manager| manager.delete_environment(env_id))
            .filter(|deleted| *deleted)
            .count();
        match claims {
            1 => {}
            0 => error!(env = %env_id, "deleted environment is not under management"),
            _ => error!(env = %env_id, "environment is associated with more than one project"),
        }
    }

    fn add_filter(&self, params: FilterParams) {
        let mut managers = self.managers.lock().expect("manager map lock poisoned");
        let project_key = params.project_key.clone();
        managers
            .entry(project_key.clone())
            .or_insert_with(|| {
                info!(project = %project_key, "creating environment manager");
                EnvironmentManager::new(project_key.clone(), Arc::clone(&self.handler))
            })
            .add_filter(params);
    }

    fn delete_filter(&self, filter_id: &FilterId) {
        let mut managers = self.managers.lock().expect("manager map lock poisoned");
        let claims = managers
            .values_mut()
            .map(|manager| manager.delete_filter(filter_id))
            .filter(|deleted| *deleted)
            .count();
        match claims {
            1 => {}
            0 => error!(filter = %filter_id, "deleted filter is not under management"),
            _ => error!(filter = %filter_id, "filter is associated with more than one project"),
        }
    }

    fn received_all_environments(&self) {
        self.handler.received_all_environments();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::tests::{env, filter, Action, RecordingHandler};
    use flag_relay_core::environment::FilterKey;

    fn env_in(project: &str, id: &str) -> EnvironmentParams {
        let mut params = env(id);
        params.project_key = ProjectKey::new(project);
        params
    }

    fn filter_in(project: &str, id: &str, key: &str) -> FilterParams {
        let mut params = filter(id, key);
        params.project_key = ProjectKey::new(project);
        params
    }

    #[test]
    fn managers_are_created_lazily() {
        let handler = Arc::new(RecordingHandler::default());
        let router = ProjectRouter::new(handler.clone());
        assert!(router.projects().is_empty());

        router.add_environment(env_in("p1", "a"));
        router.add_filter(filter_in("p2", "f1", "foo"));

        assert_eq!(
            router.projects(),
            vec![ProjectKey::new("p1"), ProjectKey::new("p2")]
        );
    }

    #[test]
    fn delete_is_broadcast_and_claimed_once() {
        let handler = Arc::new(RecordingHandler::default());
        let router = ProjectRouter::new(handler.clone());

        router.add_environment(env_in("p1", "a"));
        router.add_environment(env_in("p2", "b"));
        handler.take();

        router.delete_environment(&EnvironmentId::new("a"));
        assert_eq!(handler.take(), vec![Action::Delete("a".into())]);
        assert_eq!(router.environments(), vec!["b"]);

        // Unknown id: no manager claims it, nothing is emitted.
        router.delete_environment(&EnvironmentId::new("ghost"));
        assert!(handler.take().is_empty());
    }

    #[test]
    fn filter_deletes_are_broadcast_too() {
        let handler = Arc::new(RecordingHandler::default());
        let router = ProjectRouter::new(handler.clone());

        router.add_environment(env_in("p1", "a"));
        router.add_filter(filter_in("p1", "f1", "foo"));
        handler.take();

        router.delete_filter(&FilterId::new("f1"));
        assert_eq!(handler.take(), vec![Action::Delete("a/foo".into())]);
        assert_eq!(router.environments(), vec!["a"]);

        router.delete_filter(&FilterId::new("f1"));
        assert!(handler.take().is_empty());
    }

    #[test]
    fn update_for_unknown_project_is_dropped() {
        let handler = Arc::new(RecordingHandler::default());
        let router = ProjectRouter::new(handler.clone());

        router.update_environment(env_in("ghost", "a"));
        assert!(handler.take().is_empty());
        assert!(router.projects().is_empty());
    }

    #[test]
    fn received_all_environments_is_forwarded() {
        let handler = Arc::new(RecordingHandler::default());
        let router = ProjectRouter::new(handler.clone());

        router.received_all_environments();
        assert_eq!(handler.take(), vec![Action::ReceivedAll]);
    }

    #[test]
    fn cross_project_environments_snapshot() {
        let handler = Arc::new(RecordingHandler::default());
        let router = ProjectRouter::new(handler.clone());

        router.add_environment(env_in("p1", "a"));
        router.add_environment(env_in("p2", "b"));
        router.add_filter(filter_in("p1", "f1", "foo"));

        assert_eq!(router.environments(), vec!["a", "a/foo", "b"]);
    }
}
