use std::sync::OnceLock;

use regex::Regex;
use serde_json::{json, Value};
use tracing::debug;

use crate::core::python::PyExpr;
use crate::core::source::{ClassDecl, FieldDecl, SourceIndex};

/// Framework error bases every documented error type must descend from
const HTTP_ERROR_BASES: &[&str] = &[
    "fastapi.HTTPException",
    "fastapi.exceptions.HTTPException",
    "starlette.exceptions.HTTPException",
];

/// Class attribute that opts a type into supplying its own schema
const SELF_SCHEMA_ATTR: &str = "openapi_schema";

fn status_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^HTTP_(\d{3})(?:_|$)").unwrap())
}

/// A callable reference resolved to a concrete declaration
#[derive(Debug, Clone, PartialEq)]
pub enum Callable {
    Function { module: String, qualname: String },
    Class { module: String, name: String },
}

/// Outcome of resolving a reference expression to an error type
#[derive(Debug, Clone)]
pub enum Resolution {
    Resolved(ResolvedErrorType),
    Unresolved,
}

/// An error type resolved to its declaration, with the defaults and
/// declared fields needed to derive a response shape
#[derive(Debug, Clone)]
pub struct ResolvedErrorType {
    pub module: String,
    pub name: String,
    /// Default status declared on the class body, `__init__` defaults,
    /// or an ancestor
    pub status_code: Option<u16>,
    /// Default detail text, same lookup order as the status
    pub detail: Option<String>,
    pub fields: Vec<FieldDecl>,
    /// Schema declared verbatim by a self-describing type
    pub self_schema: Option<Value>,
    pub docstring: Option<String>,
}

/// Resolve a module-level callable reference through imports and
/// module aliases to the function or class it names
pub fn resolve_callable(index: &SourceIndex, module: &str, expr: &PyExpr) -> Option<Callable> {
    resolve_callable_inner(index, module, expr, 8)
}

fn resolve_callable_inner(
    index: &SourceIndex,
    module: &str,
    expr: &PyExpr,
    fuel: usize,
) -> Option<Callable> {
    if fuel == 0 {
        return None;
    }

    let dotted = match expr {
        PyExpr::Name(name) => {
            // Module-level alias, e.g. `handler = real_handler`
            if let Some(source) = index.get(module) {
                if let Some(alias) = source.env.assigns.get(name) {
                    if matches!(alias, PyExpr::Name(_) | PyExpr::Attribute(_)) && alias != expr {
                        if let Some(found) =
                            resolve_callable_inner(index, module, &alias.clone(), fuel - 1)
                        {
                            return Some(found);
                        }
                    }
                }
            }
            index.qualify(module, name)?
        }
        PyExpr::Attribute(path) => {
            let head = index.qualify(module, &path[0])?;
            format!("{}.{}", head, path[1..].join("."))
        }
        PyExpr::Call { func, .. } => {
            return resolve_callable_inner(index, module, func, fuel - 1);
        }
        _ => return None,
    };

    let (target, rest) = index.split_symbol(&dotted)?;
    match rest.len() {
        1 => {
            let symbol = &rest[0];
            if target.env.functions.contains_key(symbol) {
                Some(Callable::Function {
                    module: target.module.clone(),
                    qualname: symbol.clone(),
                })
            } else if target.env.classes.contains_key(symbol) {
                Some(Callable::Class {
                    module: target.module.clone(),
                    name: symbol.clone(),
                })
            } else if let Some(alias) = target.env.assigns.get(symbol) {
                // Re-exported alias in another module
                let next = target.module.clone();
                resolve_callable_inner(index, &next, &alias.clone(), fuel - 1)
            } else {
                None
            }
        }
        2 => {
            let qualname = rest.join(".");
            if target.env.functions.contains_key(&qualname) {
                Some(Callable::Function {
                    module: target.module.clone(),
                    qualname,
                })
            } else {
                None
            }
        }
        _ => None,
    }
}

/// Resolves reference expressions to concrete error types, with a
/// bounded constant-folding evaluator standing in for runtime
/// evaluation
pub struct TypeResolver<'a> {
    index: &'a SourceIndex,
    fold_budget: usize,
}

impl<'a> TypeResolver<'a> {
    pub fn new(index: &'a SourceIndex, fold_budget: usize) -> Self {
        Self { index, fold_budget }
    }

    /// Resolve a raise-site reference expression to an error type.
    ///
    /// Tries the direct declaration first, then module-level alias
    /// chains. Anything depending on runtime-only inputs stays
    /// `Unresolved` and is dropped by the caller.
    pub fn resolve(&self, module: &str, expr: &PyExpr) -> Resolution {
        let reference = match expr {
            PyExpr::Name(_) | PyExpr::Attribute(_) => expr.clone(),
            PyExpr::Call { func, .. } => (**func).clone(),
            _ => return Resolution::Unresolved,
        };

        // The plain framework exception needs no declaration on disk
        if let Some(dotted) = self.qualify_reference(module, &reference) {
            if HTTP_ERROR_BASES.contains(&dotted.as_str()) {
                return Resolution::Resolved(ResolvedErrorType {
                    module: "fastapi".to_string(),
                    name: "HTTPException".to_string(),
                    status_code: None,
                    detail: None,
                    fields: vec![],
                    self_schema: None,
                    docstring: None,
                });
            }
        }

        match resolve_callable(self.index, module, &reference) {
            Some(Callable::Class { module, name }) => {
                match self.resolve_class(&module, &name) {
                    Some(resolved) => Resolution::Resolved(resolved),
                    None => Resolution::Unresolved,
                }
            }
            _ => {
                debug!("Could not resolve error reference {:?} in {}", reference, module);
                Resolution::Unresolved
            }
        }
    }

    fn qualify_reference(&self, module: &str, expr: &PyExpr) -> Option<String> {
        match expr {
            PyExpr::Name(name) => self.index.qualify(module, name),
            PyExpr::Attribute(path) => {
                let head = self.index.qualify(module, &path[0])?;
                Some(format!("{}.{}", head, path[1..].join(".")))
            }
            _ => None,
        }
    }

    /// Build a `ResolvedErrorType` for an indexed class, provided its
    /// base chain reaches the framework exception
    fn resolve_class(&self, module: &str, name: &str) -> Option<ResolvedErrorType> {
        let (_, decl) = self.index.class_decl(module, name)?;
        if !self.is_http_error(module, decl, 8) {
            return None;
        }

        Some(ResolvedErrorType {
            module: module.to_string(),
            name: name.to_string(),
            status_code: self.declared_status(module, decl, 8),
            detail: self.declared_detail(module, decl, 8),
            fields: decl.fields.clone(),
            self_schema: decl
                .class_attrs
                .get(SELF_SCHEMA_ATTR)
                .and_then(|expr| self.fold(module, expr)),
            docstring: decl.docstring.clone(),
        })
    }

    fn is_http_error(&self, module: &str, decl: &ClassDecl, fuel: usize) -> bool {
        if fuel == 0 {
            return false;
        }
        for base in &decl.bases {
            if let Some(dotted) = self.qualify_reference(module, base) {
                if HTTP_ERROR_BASES.contains(&dotted.as_str()) {
                    return true;
                }
                if let Some((parent_module, rest)) = self.index.split_symbol(&dotted) {
                    if rest.len() == 1 {
                        if let Some(parent) = parent_module.env.classes.get(&rest[0]) {
                            if self.is_http_error(&parent_module.module, parent, fuel - 1) {
                                return true;
                            }
                        }
                    }
                }
            }
        }
        false
    }

    fn declared_status(&self, module: &str, decl: &ClassDecl, fuel: usize) -> Option<u16> {
        if let Some(expr) = decl.class_attrs.get("status_code") {
            if let Some(status) = self.status_code(module, expr) {
                return Some(status);
            }
        }
        if let Some(expr) = self.init_default(module, decl, "status_code") {
            if let Some(status) = self.status_code(module, &expr) {
                return Some(status);
            }
        }
        self.lookup_in_bases(module, decl, fuel, &|module, parent, fuel| {
            self.declared_status(module, parent, fuel)
        })
    }

    fn declared_detail(&self, module: &str, decl: &ClassDecl, fuel: usize) -> Option<String> {
        if let Some(expr) = decl.class_attrs.get("detail") {
            if let Some(Value::String(detail)) = self.fold(module, expr) {
                return Some(detail);
            }
        }
        if let Some(PyExpr::Str(detail)) = self.init_default(module, decl, "detail") {
            return Some(detail);
        }
        self.lookup_in_bases(module, decl, fuel, &|module, parent, fuel| {
            self.declared_detail(module, parent, fuel)
        })
    }

    fn lookup_in_bases<T>(
        &self,
        module: &str,
        decl: &ClassDecl,
        fuel: usize,
        lookup: &dyn Fn(&str, &ClassDecl, usize) -> Option<T>,
    ) -> Option<T> {
        if fuel == 0 {
            return None;
        }
        for base in &decl.bases {
            let Some(dotted) = self.qualify_reference(module, base) else {
                continue;
            };
            let Some((parent_module, rest)) = self.index.split_symbol(&dotted) else {
                continue;
            };
            if rest.len() != 1 {
                continue;
            }
            if let Some(parent) = parent_module.env.classes.get(&rest[0]) {
                if let Some(found) = lookup(&parent_module.module, parent, fuel - 1) {
                    return Some(found);
                }
            }
        }
        None
    }

    /// Default value of an `__init__` keyword parameter, when declared
    fn init_default(&self, module: &str, decl: &ClassDecl, param: &str) -> Option<PyExpr> {
        let qualname = format!("{}.__init__", decl.name);
        let (_, init) = self.index.function(module, &qualname)?;
        init.params
            .iter()
            .find(|p| p.name == param)
            .and_then(|p| p.default.clone())
    }

    /// Resolve a status expression: folded integers in the status
    /// range, or a `HTTP_404_NOT_FOUND`-style constant name
    pub fn status_code(&self, module: &str, expr: &PyExpr) -> Option<u16> {
        if let Some(Value::Number(n)) = self.fold(module, expr) {
            if let Some(code) = n.as_i64() {
                if (100..=599).contains(&code) {
                    return Some(code as u16);
                }
            }
            return None;
        }
        expr.tail_name()
            .and_then(|name| status_name_regex().captures(name))
            .and_then(|caps| caps[1].parse::<u16>().ok())
    }

    /// Constant-fold an expression against module-level bindings.
    ///
    /// Covers literals, container literals, simple arithmetic and
    /// concatenation, and alias chains through indexed modules. The
    /// step budget bounds the walk; anything needing real execution
    /// returns `None`.
    pub fn fold(&self, module: &str, expr: &PyExpr) -> Option<Value> {
        let mut steps = self.fold_budget;
        self.fold_inner(module, expr, &mut steps)
    }

    fn fold_inner(&self, module: &str, expr: &PyExpr, steps: &mut usize) -> Option<Value> {
        if *steps == 0 {
            return None;
        }
        *steps -= 1;

        match expr {
            PyExpr::Str(s) => Some(Value::String(s.clone())),
            PyExpr::Int(n) => Some(json!(n)),
            PyExpr::Float(f) => Some(json!(f)),
            PyExpr::Bool(b) => Some(Value::Bool(*b)),
            PyExpr::NoneLit => Some(Value::Null),
            PyExpr::Name(name) => {
                let source = self.index.get(module)?;
                if let Some(bound) = source.env.assigns.get(name) {
                    if bound == expr {
                        return None;
                    }
                    return self.fold_inner(module, &bound.clone(), steps);
                }
                // Constant imported from another indexed module
                let dotted = source.env.imports.get(name)?.clone();
                let (target, rest) = self.index.split_symbol(&dotted)?;
                if rest.len() != 1 {
                    return None;
                }
                let bound = target.env.assigns.get(&rest[0])?.clone();
                let target_module = target.module.clone();
                self.fold_inner(&target_module, &bound, steps)
            }
            PyExpr::Attribute(path) => {
                let head = self.index.qualify(module, &path[0])?;
                let dotted = format!("{}.{}", head, path[1..].join("."));
                let (target, rest) = self.index.split_symbol(&dotted)?;
                if rest.len() != 1 {
                    return None;
                }
                let bound = target.env.assigns.get(&rest[0])?.clone();
                let target_module = target.module.clone();
                self.fold_inner(&target_module, &bound, steps)
            }
            PyExpr::BinOp { left, op, right } => {
                let left = self.fold_inner(module, left, steps)?;
                let right = self.fold_inner(module, right, steps)?;
                fold_binop(&left, op, &right)
            }
            PyExpr::List(items) => {
                let mut folded = Vec::with_capacity(items.len());
                for item in items {
                    folded.push(self.fold_inner(module, item, steps)?);
                }
                Some(Value::Array(folded))
            }
            PyExpr::Dict(pairs) => {
                let mut map = serde_json::Map::new();
                for (key, value) in pairs {
                    let Some(Value::String(key)) = self.fold_inner(module, key, steps) else {
                        return None;
                    };
                    map.insert(key, self.fold_inner(module, value, steps)?);
                }
                Some(Value::Object(map))
            }
            PyExpr::Call { .. } | PyExpr::Unsupported => None,
        }
    }
}

fn fold_binop(left: &Value, op: &str, right: &Value) -> Option<Value> {
    match (left, right) {
        (Value::Number(l), Value::Number(r)) => {
            let (l, r) = (l.as_i64()?, r.as_i64()?);
            match op {
                "+" => Some(json!(l + r)),
                "-" => Some(json!(l - r)),
                "*" => Some(json!(l * r)),
                "//" => (r != 0).then(|| json!(l / r)),
                _ => None,
            }
        }
        (Value::String(l), Value::String(r)) if op == "+" => Some(json!(format!("{}{}", l, r))),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AnalysisConfig;
    use crate::core::source::SourceIndex;

    fn index_single(content: &str) -> SourceIndex {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("svc.py"), content).unwrap();
        let config = AnalysisConfig {
            target_modules: vec![],
            max_walk_depth: 32,
            max_fold_steps: 64,
            max_file_size: 1024 * 1024,
        };
        SourceIndex::load(dir.path(), &config).unwrap()
    }

    #[test]
    fn test_resolve_direct_subclass() {
        let index = index_single(
            "from fastapi import HTTPException\n\
             \n\
             class NotFound(HTTPException):\n    \
             status_code = 404\n    \
             detail = \"missing\"\n",
        );
        let resolver = TypeResolver::new(&index, 64);
        match resolver.resolve("svc", &PyExpr::Name("NotFound".to_string())) {
            Resolution::Resolved(t) => {
                assert_eq!(t.name, "NotFound");
                assert_eq!(t.status_code, Some(404));
                assert_eq!(t.detail, Some("missing".to_string()));
            }
            Resolution::Unresolved => panic!("expected resolution"),
        }
    }

    #[test]
    fn test_non_error_class_is_unresolved() {
        let index = index_single("class Plain:\n    status_code = 404\n");
        let resolver = TypeResolver::new(&index, 64);
        assert!(matches!(
            resolver.resolve("svc", &PyExpr::Name("Plain".to_string())),
            Resolution::Unresolved
        ));
    }

    #[test]
    fn test_init_defaults_feed_status_and_detail() {
        let index = index_single(
            "from fastapi import HTTPException\n\
             \n\
             class NoParens(HTTPException):\n    \
             def __init__(self, status_code=407, detail=\"WOW\"):\n        \
             super().__init__(status_code=status_code, detail=detail)\n",
        );
        let resolver = TypeResolver::new(&index, 64);
        match resolver.resolve("svc", &PyExpr::Name("NoParens".to_string())) {
            Resolution::Resolved(t) => {
                assert_eq!(t.status_code, Some(407));
                assert_eq!(t.detail, Some("WOW".to_string()));
            }
            Resolution::Unresolved => panic!("expected resolution"),
        }
    }

    #[test]
    fn test_status_inherited_through_base_chain() {
        let index = index_single(
            "from fastapi import HTTPException\n\
             \n\
             class Base(HTTPException):\n    \
             status_code = 422\n\
             \n\
             class Child(Base):\n    \
             pass\n",
        );
        let resolver = TypeResolver::new(&index, 64);
        match resolver.resolve("svc", &PyExpr::Name("Child".to_string())) {
            Resolution::Resolved(t) => assert_eq!(t.status_code, Some(422)),
            Resolution::Unresolved => panic!("expected resolution"),
        }
    }

    #[test]
    fn test_status_constant_name_recovery() {
        let index = index_single("from starlette.status import HTTP_404_NOT_FOUND\n");
        let resolver = TypeResolver::new(&index, 64);
        assert_eq!(
            resolver.status_code("svc", &PyExpr::Name("HTTP_404_NOT_FOUND".to_string())),
            Some(404)
        );
        assert_eq!(
            resolver.status_code(
                "svc",
                &PyExpr::Attribute(vec![
                    "status".to_string(),
                    "HTTP_406_NOT_ACCEPTABLE".to_string()
                ])
            ),
            Some(406)
        );
    }

    #[test]
    fn test_fold_module_constant_chain() {
        let index = index_single("BASE = 400\nCONFLICT = BASE + 9\n");
        let resolver = TypeResolver::new(&index, 64);
        assert_eq!(
            resolver.status_code("svc", &PyExpr::Name("CONFLICT".to_string())),
            Some(409)
        );
    }

    #[test]
    fn test_fold_follows_imported_constants() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.py"), "DEFAULT_STATUS = 422\n").unwrap();
        std::fs::write(
            dir.path().join("api.py"),
            "from config import DEFAULT_STATUS\n",
        )
        .unwrap();
        let config = AnalysisConfig {
            target_modules: vec![],
            max_walk_depth: 32,
            max_fold_steps: 64,
            max_file_size: 1024 * 1024,
        };
        let index = SourceIndex::load(dir.path(), &config).unwrap();
        let resolver = TypeResolver::new(&index, 64);
        assert_eq!(
            resolver.status_code("api", &PyExpr::Name("DEFAULT_STATUS".to_string())),
            Some(422)
        );
    }

    #[test]
    fn test_fold_rejects_runtime_inputs() {
        let index = index_single("def pick_one():\n    return 1\n");
        let resolver = TypeResolver::new(&index, 64);
        let call = PyExpr::Call {
            func: Box::new(PyExpr::Name("pick_one".to_string())),
            args: vec![],
            kwargs: vec![],
        };
        assert_eq!(resolver.fold("svc", &call), None);
    }

    #[test]
    fn test_self_schema_folding() {
        let index = index_single(
            "from fastapi import HTTPException\n\
             \n\
             class Teapot(HTTPException):\n    \
             status_code = 418\n    \
             openapi_schema = {\"type\": \"object\", \"properties\": {\"kind\": {\"type\": \"string\"}}}\n",
        );
        let resolver = TypeResolver::new(&index, 64);
        match resolver.resolve("svc", &PyExpr::Name("Teapot".to_string())) {
            Resolution::Resolved(t) => {
                let schema = t.self_schema.expect("schema folded");
                assert_eq!(schema["type"], "object");
            }
            Resolution::Unresolved => panic!("expected resolution"),
        }
    }

    #[test]
    fn test_resolve_callable_across_modules() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("deps.py"),
            "def get_user():\n    return 1\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("api.py"), "from deps import get_user\n").unwrap();
        let config = AnalysisConfig {
            target_modules: vec![],
            max_walk_depth: 32,
            max_fold_steps: 64,
            max_file_size: 1024 * 1024,
        };
        let index = SourceIndex::load(dir.path(), &config).unwrap();

        assert_eq!(
            resolve_callable(&index, "api", &PyExpr::Name("get_user".to_string())),
            Some(Callable::Function {
                module: "deps".to_string(),
                qualname: "get_user".to_string(),
            })
        );
    }
}
