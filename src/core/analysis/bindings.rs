use std::collections::HashMap;

use crate::core::python::PyExpr;
use crate::core::source::ModuleEnv;

/// Per-walk binding tracker.
///
/// Maps a local name to the most recent expression assigned to it, with
/// the owning module's top-level assignments as the enclosing scope.
/// Last assignment wins; the tracker lives exactly as long as one
/// routine walk.
pub struct Bindings<'a> {
    locals: HashMap<String, PyExpr>,
    module: &'a ModuleEnv,
}

impl<'a> Bindings<'a> {
    pub fn new(module: &'a ModuleEnv) -> Self {
        Self {
            locals: HashMap::new(),
            module,
        }
    }

    /// Record an assignment, overwriting any prior binding of the name
    pub fn record(&mut self, name: &str, expr: PyExpr) {
        if expr != PyExpr::Unsupported {
            self.locals.insert(name.to_string(), expr);
        }
    }

    /// Most recent binding for a name, innermost scope first
    pub fn resolve(&self, name: &str) -> Option<&PyExpr> {
        self.locals
            .get(name)
            .or_else(|| self.module.assigns.get(name))
    }

    /// Substitute bound names inside a reference expression.
    ///
    /// `v` bound to `ErrorX` rewrites `v` to `ErrorX`; `svc` bound to
    /// `Service` re-roots `svc.fail` to `Service.fail`. Chains are
    /// followed with bounded fuel so `a = b; b = a` terminates.
    pub fn resolve_expr(&self, expr: &PyExpr) -> PyExpr {
        self.resolve_expr_inner(expr, 8)
    }

    fn resolve_expr_inner(&self, expr: &PyExpr, fuel: usize) -> PyExpr {
        if fuel == 0 {
            return expr.clone();
        }
        match expr {
            PyExpr::Name(name) => match self.resolve(name) {
                Some(bound) if bound != expr => self.resolve_expr_inner(&bound.clone(), fuel - 1),
                _ => expr.clone(),
            },
            PyExpr::Attribute(path) => {
                let head = &path[0];
                match self.resolve(head) {
                    Some(PyExpr::Name(target)) if target != head => {
                        let mut rerooted = vec![target.clone()];
                        rerooted.extend(path[1..].iter().cloned());
                        self.resolve_expr_inner(&PyExpr::Attribute(rerooted), fuel - 1)
                    }
                    Some(PyExpr::Attribute(target)) => {
                        let mut rerooted = target.clone();
                        rerooted.extend(path[1..].iter().cloned());
                        PyExpr::Attribute(rerooted)
                    }
                    _ => expr.clone(),
                }
            }
            PyExpr::Call { func, args, kwargs } => PyExpr::Call {
                func: Box::new(self.resolve_expr_inner(func, fuel - 1)),
                args: args.clone(),
                kwargs: kwargs.clone(),
            },
            _ => expr.clone(),
        }
    }
}
