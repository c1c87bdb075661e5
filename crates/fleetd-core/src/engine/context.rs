//! Typed resource lookups for manifold start functions.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use crate::worker::WorkerError;

/// An opaque resource published by a running manifold.
pub type Resource = Arc<dyn Any + Send + Sync>;

/// Snapshot of the resources available to a manifold when it starts: one
/// entry per declared input that published an output.
///
/// Lookups only ever succeed for inputs that were running when the start
/// was scheduled, which is what keeps producers live while their outputs
/// are in use.
#[derive(Clone, Default)]
pub struct Context {
    resources: HashMap<String, Resource>,
}

impl Context {
    pub(super) fn new(resources: HashMap<String, Resource>) -> Self {
        Self { resources }
    }

    /// Look up the named input's resource as a `T`.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::Unmet`] if the producer published nothing
    /// (or is not an input of this manifold), and [`WorkerError::Config`]
    /// if the published resource is not a `T`; the latter is a wiring bug
    /// in the graph, not a transient condition.
    pub fn get<T: Clone + Send + Sync + 'static>(&self, name: &str) -> Result<T, WorkerError> {
        let resource = self.resources.get(name).ok_or(WorkerError::Unmet)?;
        resource.downcast_ref::<T>().cloned().ok_or_else(|| {
            WorkerError::Config(format!(
                "resource {name:?} does not provide the requested type"
            ))
        })
    }

    /// Returns `true` if the named input published a resource.
    #[must_use]
    pub fn has(&self, name: &str) -> bool {
        self.resources.contains_key(name)
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("resources", &self.resources.keys())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_typed_resource() {
        let mut resources = HashMap::new();
        resources.insert("count".to_string(), Arc::new(7u32) as Resource);
        let ctx = Context::new(resources);

        assert_eq!(ctx.get::<u32>("count"), Ok(7));
        assert!(ctx.has("count"));
    }

    #[test]
    fn test_missing_resource_is_unmet() {
        let ctx = Context::default();
        assert_eq!(ctx.get::<u32>("count"), Err(WorkerError::Unmet));
        assert!(!ctx.has("count"));
    }

    #[test]
    fn test_wrong_type_is_config_error() {
        let mut resources = HashMap::new();
        resources.insert("count".to_string(), Arc::new(7u32) as Resource);
        let ctx = Context::new(resources);

        assert!(matches!(
            ctx.get::<String>("count"),
            Err(WorkerError::Config(_))
        ));
    }
}
