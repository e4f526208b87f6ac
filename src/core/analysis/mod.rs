//! Static discovery of raised error types.
//!
//! The walker traverses routine bodies in source order, tracking local
//! bindings and recursing into resolvable callees; the resolver turns
//! discovered references into concrete error types; the schema module
//! turns those into documented response shapes.

mod bindings;
mod walker;
mod resolver;
mod schema;

pub use bindings::Bindings;
pub use walker::{AnalysisCache, RaiseSite, RoutineId, RoutineRef, Walker};
pub use resolver::{Callable, ResolvedErrorType, Resolution, TypeResolver, resolve_callable};
pub use schema::{Body, ResponseShape, describe};

/// Module prefixes the analysis is allowed to descend into.
///
/// The application's own package is always searched; configuration can
/// widen the set to cover dependency-injected helpers from elsewhere.
#[derive(Debug, Clone)]
pub struct TargetModules {
    prefixes: Vec<String>,
}

impl TargetModules {
    pub fn new(app_module: &str, extra: &[String]) -> Self {
        let mut prefixes = Vec::new();
        if let Some(root) = app_module.split('.').next() {
            prefixes.push(root.to_string());
        }
        for module in extra {
            if !prefixes.contains(module) {
                prefixes.push(module.clone());
            }
        }
        Self { prefixes }
    }

    pub fn contains(&self, module: &str) -> bool {
        self.prefixes.iter().any(|prefix| {
            module == prefix || module.starts_with(&format!("{}.", prefix))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_module_prefix_matching() {
        let targets = TargetModules::new("app.main", &["helpers".to_string()]);
        assert!(targets.contains("app"));
        assert!(targets.contains("app.api.users"));
        assert!(targets.contains("helpers.auth"));
        assert!(!targets.contains("fastapi"));
        assert!(!targets.contains("helpers_extra"));
    }
}
