use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use tree_sitter::Node;

use crate::core::python::{self, PyExpr};
use crate::core::source::{ModuleSource, SourceIndex};
use super::bindings::Bindings;
use super::resolver::{resolve_callable, Callable};
use super::TargetModules;

/// Stable identity for one callable body, interned per compile run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RoutineId(u32);

/// Reference to a routine by module and qualified name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoutineRef {
    pub module: String,
    pub qualname: String,
}

impl RoutineRef {
    pub fn new(module: impl Into<String>, qualname: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            qualname: qualname.into(),
        }
    }

    pub fn display_name(&self) -> String {
        format!("{}.{}", self.module, self.qualname)
    }
}

/// A point in analyzed code where a typed error is raised
#[derive(Debug, Clone)]
pub struct RaiseSite {
    pub routine: RoutineId,
    /// Reference expression naming the error type, already resolved
    /// through local bindings
    pub type_ref: PyExpr,
    pub args: Vec<PyExpr>,
    pub kwargs: Vec<(String, PyExpr)>,
    /// Module the raise occurs in; type references resolve against it
    pub module: String,
    pub line: usize,
}

enum CacheEntry {
    /// Walk in flight; a recursive edge back here contributes nothing
    InProgress,
    Done(Arc<Vec<RaiseSite>>),
}

/// Per-compile memoization of walked routines.
///
/// Instantiated fresh for each compile invocation and passed explicitly
/// through the call graph; shared dependencies are walked once per run.
#[derive(Default)]
pub struct AnalysisCache {
    ids: HashMap<(String, String), RoutineId>,
    entries: HashMap<RoutineId, CacheEntry>,
    walks: usize,
}

impl AnalysisCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern a routine reference, assigning ids in encounter order
    pub fn intern(&mut self, routine: &RoutineRef) -> RoutineId {
        let key = (routine.module.clone(), routine.qualname.clone());
        let next = RoutineId(self.ids.len() as u32);
        *self.ids.entry(key).or_insert(next)
    }

    /// Number of routine bodies actually traversed so far
    pub fn walks(&self) -> usize {
        self.walks
    }
}

/// Walks routine bodies collecting every reachable raise site
pub struct Walker<'a> {
    index: &'a SourceIndex,
    targets: TargetModules,
    max_depth: usize,
}

impl<'a> Walker<'a> {
    pub fn new(index: &'a SourceIndex, targets: TargetModules, max_depth: usize) -> Self {
        Self {
            index,
            targets,
            max_depth,
        }
    }

    /// Collect the raise sites reachable from a routine.
    ///
    /// Results are memoized by routine identity; a routine already
    /// being walked (a cycle) returns no sites for that edge.
    pub fn walk(&self, routine: &RoutineRef, cache: &mut AnalysisCache) -> Arc<Vec<RaiseSite>> {
        self.walk_inner(routine, cache, 0)
    }

    fn walk_inner(
        &self,
        routine: &RoutineRef,
        cache: &mut AnalysisCache,
        depth: usize,
    ) -> Arc<Vec<RaiseSite>> {
        let id = cache.intern(routine);

        match cache.entries.get(&id) {
            Some(CacheEntry::Done(sites)) => return Arc::clone(sites),
            Some(CacheEntry::InProgress) => return Arc::new(Vec::new()),
            None => {}
        }

        let Some((source, decl)) = self.index.function(&routine.module, &routine.qualname) else {
            let empty = Arc::new(Vec::new());
            cache.entries.insert(id, CacheEntry::Done(Arc::clone(&empty)));
            return empty;
        };
        let byte_range = decl.byte_range;
        let class_name = decl.class_name.clone();

        let Some(node) = source.node_at(byte_range) else {
            let empty = Arc::new(Vec::new());
            cache.entries.insert(id, CacheEntry::Done(Arc::clone(&empty)));
            return empty;
        };

        cache.entries.insert(id, CacheEntry::InProgress);
        cache.walks += 1;
        debug!("Walking routine {}", routine.display_name());

        let mut sites = Vec::new();
        let mut bindings = Bindings::new(&source.env);

        if let Some(body) = node.child_by_field_name("body") {
            self.visit(
                body,
                source,
                id,
                class_name.as_deref(),
                &mut bindings,
                &mut sites,
                cache,
                depth,
            );
        }

        let sites = Arc::new(sites);
        cache.entries.insert(id, CacheEntry::Done(Arc::clone(&sites)));
        sites
    }

    #[allow(clippy::too_many_arguments)]
    fn visit(
        &self,
        node: Node,
        source: &ModuleSource,
        id: RoutineId,
        class_name: Option<&str>,
        bindings: &mut Bindings,
        sites: &mut Vec<RaiseSite>,
        cache: &mut AnalysisCache,
        depth: usize,
    ) {
        match node.kind() {
            "assignment" | "augmented_assignment" => {
                let left = node.child_by_field_name("left");
                let right = node.child_by_field_name("right");
                if let (Some(left), Some(right)) = (left, right) {
                    if left.kind() == "identifier" && node.kind() == "assignment" {
                        bindings.record(
                            &python::node_text(left, &source.content),
                            python::lower_expr(right, &source.content),
                        );
                    }
                    // Calls on the right-hand side still get walked
                    self.visit(right, source, id, class_name, bindings, sites, cache, depth);
                }
                return;
            }
            "raise_statement" => {
                self.visit_raise(node, source, id, bindings, sites);
                // Fall through to children: constructor arguments may
                // contain calls of their own
            }
            "call" => {
                if let Some(func) = node.child_by_field_name("function") {
                    let func_expr = python::lower_expr(func, &source.content);
                    for target in self.call_targets(source, bindings, class_name, &func_expr) {
                        if depth < self.max_depth {
                            let callee_sites = self.walk_inner(&target, cache, depth + 1);
                            sites.extend(callee_sites.iter().cloned());
                        } else {
                            debug!(
                                "Max walk depth reached at {} -> {}",
                                source.module,
                                target.display_name()
                            );
                        }
                    }
                }
            }
            _ => {}
        }

        let mut cursor = node.walk();
        let children: Vec<Node> = node.named_children(&mut cursor).collect();
        for child in children {
            self.visit(child, source, id, class_name, bindings, sites, cache, depth);
        }
    }

    fn visit_raise(
        &self,
        node: Node,
        source: &ModuleSource,
        id: RoutineId,
        bindings: &Bindings,
        sites: &mut Vec<RaiseSite>,
    ) {
        // A bare `raise` re-raises something we cannot name
        let Some(exc_node) = node.named_child(0) else {
            debug!(
                "Bare raise at {}:{}",
                source.module,
                node.start_position().row + 1
            );
            return;
        };

        let lowered = python::lower_expr(exc_node, &source.content);
        let resolved = bindings.resolve_expr(&lowered);
        let line = node.start_position().row + 1;

        match resolved {
            PyExpr::Call { func, args, kwargs }
                if matches!(*func, PyExpr::Name(_) | PyExpr::Attribute(_)) =>
            {
                sites.push(RaiseSite {
                    routine: id,
                    type_ref: *func,
                    args,
                    kwargs,
                    module: source.module.clone(),
                    line,
                });
            }
            PyExpr::Name(_) | PyExpr::Attribute(_) => {
                sites.push(RaiseSite {
                    routine: id,
                    type_ref: resolved,
                    args: Vec::new(),
                    kwargs: Vec::new(),
                    module: source.module.clone(),
                    line,
                });
            }
            other => {
                debug!(
                    "Unsupported raise expression at {}:{}: {:?}",
                    source.module, line, other
                );
            }
        }
    }

    /// Resolve a call's target expression to the routines it names
    fn call_targets(
        &self,
        source: &ModuleSource,
        bindings: &Bindings,
        class_name: Option<&str>,
        func_expr: &PyExpr,
    ) -> Vec<RoutineRef> {
        let resolved = bindings.resolve_expr(func_expr);

        // Instance-shaped references: `self.fail()` and `svc.fail()`
        // where svc was bound to a constructor call
        if let PyExpr::Attribute(path) = &resolved {
            if path.len() == 2 {
                if path[0] == "self" {
                    if let Some(class) = class_name {
                        let qualname = format!("{}.{}", class, path[1]);
                        if source.env.functions.contains_key(&qualname) {
                            return vec![RoutineRef::new(source.module.clone(), qualname)];
                        }
                    }
                    return Vec::new();
                }
                if let Some(PyExpr::Call { func, .. }) = bindings.resolve(&path[0]) {
                    let constructor = func.as_ref().clone();
                    if let Some(Callable::Class { module, name }) =
                        resolve_callable(self.index, &source.module, &constructor)
                    {
                        return self.method_target(&module, &name, &path[1]);
                    }
                }
            }
        }

        match resolve_callable(self.index, &source.module, &resolved) {
            Some(Callable::Function { module, qualname }) => {
                if self.targets.contains(&module) {
                    vec![RoutineRef::new(module, qualname)]
                } else {
                    Vec::new()
                }
            }
            Some(Callable::Class { module, name }) => {
                // Constructing a class runs its __init__
                self.method_target(&module, &name, "__init__")
            }
            None => Vec::new(),
        }
    }

    fn method_target(&self, module: &str, class: &str, method: &str) -> Vec<RoutineRef> {
        if !self.targets.contains(module) {
            return Vec::new();
        }
        let qualname = format!("{}.{}", class, method);
        match self.index.get(module) {
            Some(source) if source.env.functions.contains_key(&qualname) => {
                vec![RoutineRef::new(module.to_string(), qualname)]
            }
            _ => Vec::new(),
        }
    }
}
