use std::collections::{HashMap, HashSet};
use tracing::debug;
use tree_sitter::Node;

use crate::error::{FaultlineError, Result};
use super::analysis::{resolve_callable, Callable, RoutineRef};
use super::python::{self, PyExpr};
use super::source::{FunctionDecl, ModuleSource, SourceIndex};

const APP_CONSTRUCTORS: &[&str] = &["fastapi.FastAPI", "fastapi.applications.FastAPI"];
const ROUTER_CONSTRUCTORS: &[&str] = &["fastapi.APIRouter", "fastapi.routing.APIRouter"];
const ROUTE_METHODS: &[&str] = &[
    "get", "post", "put", "delete", "patch", "head", "options", "trace",
];

/// Reference to the application object, `module.path:attribute`
#[derive(Debug, Clone)]
pub struct AppRef {
    pub module: String,
    pub attribute: String,
}

impl AppRef {
    pub fn parse(reference: &str) -> Result<Self> {
        let (module, attribute) = reference
            .split_once(':')
            .ok_or_else(|| FaultlineError::InvalidAppRef(reference.to_string()))?;
        if module.is_empty() || attribute.is_empty() || attribute.contains('.') {
            return Err(FaultlineError::InvalidAppRef(reference.to_string()));
        }
        Ok(Self {
            module: module.to_string(),
            attribute: attribute.to_string(),
        })
    }
}

/// One registered route: its path, methods, and the ordered routines
/// reachable through its dependency chain (handler first)
#[derive(Debug, Clone)]
pub struct RouteDescriptor {
    pub path: String,
    pub methods: Vec<String>,
    pub handler: RoutineRef,
    pub chain: Vec<RoutineRef>,
}

/// Key of a router object: the module it lives in and its local name
type RouterKey = (String, String);

/// Enumerate the application's routes by reading route decorators and
/// `include_router` wiring from the indexed source
pub fn discover(index: &SourceIndex, app_ref: &AppRef) -> Result<Vec<RouteDescriptor>> {
    let app_module = index.get(&app_ref.module).ok_or_else(|| FaultlineError::AppNotFound {
        module: app_ref.module.clone(),
        attribute: app_ref.attribute.clone(),
    })?;

    if !is_constructor_call(index, app_module, &app_ref.attribute, APP_CONSTRUCTORS) {
        return Err(FaultlineError::AppNotFound {
            module: app_ref.module.clone(),
            attribute: app_ref.attribute.clone(),
        });
    }

    let routers = collect_routers(index);
    let prefixes = router_prefixes(index, app_ref, &routers);

    let mut routes = Vec::new();

    let mut modules: Vec<&ModuleSource> = index.modules().collect();
    modules.sort_by(|a, b| a.module.cmp(&b.module));

    for module in modules {
        let mut decls: Vec<&FunctionDecl> = module
            .env
            .functions
            .values()
            .filter(|decl| decl.class_name.is_none())
            .collect();
        decls.sort_by_key(|decl| decl.line);

        for decl in decls {
            for decorator in &decl.decorators {
                let Some(route) = route_from_decorator(
                    index,
                    module,
                    decl,
                    decorator,
                    app_ref,
                    &prefixes,
                ) else {
                    continue;
                };
                routes.push(route);
            }
        }
    }

    routes.sort_by(|a, b| (&a.path, &a.methods).cmp(&(&b.path, &b.methods)));
    Ok(routes)
}

/// Title declared on the application constructor, falling back to the
/// framework default
pub fn app_title(index: &SourceIndex, app_ref: &AppRef) -> String {
    index
        .get(&app_ref.module)
        .and_then(|module| module.env.assigns.get(&app_ref.attribute))
        .and_then(|expr| match expr {
            PyExpr::Call { kwargs, .. } => kwargs
                .iter()
                .find(|(name, _)| name == "title")
                .and_then(|(_, value)| match value {
                    PyExpr::Str(title) => Some(title.clone()),
                    _ => None,
                }),
            _ => None,
        })
        .unwrap_or_else(|| "FastAPI".to_string())
}

/// Whether a module-level name is assigned a call to one of the given
/// framework constructors
fn is_constructor_call(
    index: &SourceIndex,
    module: &ModuleSource,
    name: &str,
    constructors: &[&str],
) -> bool {
    let Some(PyExpr::Call { func, .. }) = module.env.assigns.get(name) else {
        return false;
    };
    let dotted = match func.as_ref() {
        PyExpr::Name(n) => index.qualify(&module.module, n),
        PyExpr::Attribute(path) => index
            .qualify(&module.module, &path[0])
            .map(|head| format!("{}.{}", head, path[1..].join("."))),
        _ => None,
    };
    dotted.map_or(false, |d| constructors.contains(&d.as_str()))
}

/// Router variables and the prefix declared on their constructor
fn collect_routers(index: &SourceIndex) -> HashMap<RouterKey, String> {
    let mut routers = HashMap::new();
    for module in index.modules() {
        for (name, expr) in &module.env.assigns {
            let PyExpr::Call { func, kwargs, .. } = expr else {
                continue;
            };
            let dotted = match func.as_ref() {
                PyExpr::Name(n) => index.qualify(&module.module, n),
                PyExpr::Attribute(path) => index
                    .qualify(&module.module, &path[0])
                    .map(|head| format!("{}.{}", head, path[1..].join("."))),
                _ => None,
            };
            if dotted.map_or(false, |d| ROUTER_CONSTRUCTORS.contains(&d.as_str())) {
                let own_prefix = kwargs
                    .iter()
                    .find(|(k, _)| k == "prefix")
                    .and_then(|(_, v)| match v {
                        PyExpr::Str(s) => Some(s.clone()),
                        _ => None,
                    })
                    .unwrap_or_default();
                routers.insert((module.module.clone(), name.clone()), own_prefix);
            }
        }
    }
    routers
}

/// Effective path prefix for every router reachable from the app,
/// following `include_router` wiring breadth-first
fn router_prefixes(
    index: &SourceIndex,
    app_ref: &AppRef,
    routers: &HashMap<RouterKey, String>,
) -> HashMap<RouterKey, String> {
    // owner -> (child router, include prefix); the app owner is None
    let mut edges: Vec<(Option<RouterKey>, RouterKey, String)> = Vec::new();

    for module in index.modules() {
        let root = module.tree.root_node();
        let mut cursor = root.walk();
        for stmt in root.named_children(&mut cursor) {
            if stmt.kind() != "expression_statement" {
                continue;
            }
            let Some(call) = stmt.named_child(0) else { continue };
            if call.kind() != "call" {
                continue;
            }
            let Some((owner, child, prefix)) =
                include_router_call(index, module, call, app_ref, routers)
            else {
                continue;
            };
            edges.push((owner, child, prefix));
        }
    }

    let mut prefixes: HashMap<RouterKey, String> = HashMap::new();
    let mut queue: Vec<(Option<RouterKey>, String)> = vec![(None, String::new())];
    let mut seen: HashSet<Option<RouterKey>> = HashSet::new();

    while let Some((owner, base)) = queue.pop() {
        if !seen.insert(owner.clone()) {
            continue;
        }
        for (edge_owner, child, include_prefix) in &edges {
            if *edge_owner != owner {
                continue;
            }
            let own = routers.get(child).cloned().unwrap_or_default();
            let effective = format!("{}{}{}", base, include_prefix, own);
            prefixes.insert(child.clone(), effective.clone());
            queue.push((Some(child.clone()), effective));
        }
    }

    prefixes
}

/// Decode an `owner.include_router(target, prefix=...)` call
fn include_router_call(
    index: &SourceIndex,
    module: &ModuleSource,
    call: Node,
    app_ref: &AppRef,
    routers: &HashMap<RouterKey, String>,
) -> Option<(Option<RouterKey>, RouterKey, String)> {
    let lowered = python::lower_expr(call, &module.content);
    let PyExpr::Call { func, args, kwargs } = lowered else {
        return None;
    };
    let PyExpr::Attribute(path) = func.as_ref() else {
        return None;
    };
    if path.len() != 2 || path[1] != "include_router" {
        return None;
    }

    let owner = if module.module == app_ref.module && path[0] == app_ref.attribute {
        None
    } else {
        let key = (module.module.clone(), path[0].clone());
        if !routers.contains_key(&key) {
            return None;
        }
        Some(key)
    };

    let target = args.first()?;
    let child = match target {
        PyExpr::Name(name) => {
            let local = (module.module.clone(), name.clone());
            if routers.contains_key(&local) {
                local
            } else {
                let dotted = index.qualify(&module.module, name)?;
                let (target_module, rest) = index.split_symbol(&dotted)?;
                if rest.len() != 1 {
                    return None;
                }
                (target_module.module.clone(), rest[0].clone())
            }
        }
        PyExpr::Attribute(path) if path.len() == 2 => {
            let dotted = index.qualify(&module.module, &path[0])?;
            let (target_module, rest) = index.split_symbol(&format!("{}.{}", dotted, path[1]))?;
            if rest.len() != 1 {
                return None;
            }
            (target_module.module.clone(), rest[0].clone())
        }
        _ => return None,
    };

    let prefix = kwargs
        .iter()
        .find(|(k, _)| k == "prefix")
        .and_then(|(_, v)| match v {
            PyExpr::Str(s) => Some(s.clone()),
            _ => None,
        })
        .unwrap_or_default();

    Some((owner, child, prefix))
}

/// Build a route descriptor from a single decorator, when it is a
/// route registration on the app or a reachable router
fn route_from_decorator(
    index: &SourceIndex,
    module: &ModuleSource,
    decl: &FunctionDecl,
    decorator: &PyExpr,
    app_ref: &AppRef,
    prefixes: &HashMap<RouterKey, String>,
) -> Option<RouteDescriptor> {
    let PyExpr::Call { func, args, kwargs } = decorator else {
        return None;
    };
    let PyExpr::Attribute(path) = func.as_ref() else {
        return None;
    };
    if path.len() != 2 {
        return None;
    }
    let (owner, verb) = (&path[0], &path[1]);

    let methods: Vec<String> = if ROUTE_METHODS.contains(&verb.as_str()) {
        vec![verb.clone()]
    } else if verb == "api_route" || verb == "route" {
        let listed = kwargs.iter().find(|(k, _)| k == "methods")?;
        match &listed.1 {
            PyExpr::List(items) => items
                .iter()
                .filter_map(|item| match item {
                    PyExpr::Str(s) => Some(s.to_lowercase()),
                    _ => None,
                })
                .collect(),
            _ => return None,
        }
    } else {
        return None;
    };
    if methods.is_empty() {
        return None;
    }

    let prefix = if module.module == app_ref.module && owner == &app_ref.attribute {
        String::new()
    } else {
        prefixes.get(&(module.module.clone(), owner.clone()))?.clone()
    };

    if kwargs
        .iter()
        .any(|(k, v)| k == "include_in_schema" && *v == PyExpr::Bool(false))
    {
        return None;
    }

    let raw_path = args.iter().find_map(|arg| match arg {
        PyExpr::Str(s) => Some(s.clone()),
        _ => None,
    })?;

    let handler = RoutineRef::new(module.module.clone(), decl.qualname.clone());
    let chain = dependency_chain(index, module, decl);

    Some(RouteDescriptor {
        path: format!("{}{}", prefix, raw_path),
        methods,
        handler,
        chain,
    })
}

/// The ordered routines a route reaches: the handler, then each
/// dependency in declaration order followed by its own dependencies
fn dependency_chain(
    index: &SourceIndex,
    module: &ModuleSource,
    decl: &FunctionDecl,
) -> Vec<RoutineRef> {
    let handler = RoutineRef::new(module.module.clone(), decl.qualname.clone());
    let mut chain = vec![handler.clone()];
    let mut visited: HashSet<RoutineRef> = HashSet::new();
    visited.insert(handler);
    push_dependencies(index, &module.module, decl, &mut chain, &mut visited);
    chain
}

fn push_dependencies(
    index: &SourceIndex,
    module: &str,
    decl: &FunctionDecl,
    chain: &mut Vec<RoutineRef>,
    visited: &mut HashSet<RoutineRef>,
) {
    for param in &decl.params {
        let Some(dependency) = &param.depends else { continue };
        match resolve_callable(index, module, dependency) {
            Some(Callable::Function { module, qualname }) => {
                push_routine(index, &module, &qualname, chain, visited);
            }
            Some(Callable::Class { module, name }) => {
                // Dependency-injected callables run construction and call
                for method in ["__init__", "__call__"] {
                    let qualname = format!("{}.{}", name, method);
                    push_routine(index, &module, &qualname, chain, visited);
                }
            }
            None => {
                debug!(
                    "Could not resolve dependency {:?} of {}.{}",
                    dependency, module, decl.qualname
                );
            }
        }
    }
}

fn push_routine(
    index: &SourceIndex,
    module: &str,
    qualname: &str,
    chain: &mut Vec<RoutineRef>,
    visited: &mut HashSet<RoutineRef>,
) {
    let Some((_, decl)) = index.function(module, qualname) else {
        return;
    };
    let routine = RoutineRef::new(module.to_string(), qualname.to_string());
    if !visited.insert(routine.clone()) {
        return;
    }
    chain.push(routine);
    push_dependencies(index, module, decl, chain, visited);
}
