use std::collections::HashMap;
use std::path::{Path, PathBuf};
use sha2::{Digest, Sha256};
use ignore::WalkBuilder;
use tracing::{debug, warn};
use tree_sitter::{Node, Tree};

use crate::config::AnalysisConfig;
use crate::error::{FaultlineError, Result};
use super::python::{self, PyExpr, PythonParser};

/// A parameter of an analyzed routine
#[derive(Debug, Clone)]
pub struct ParamDecl {
    pub name: String,
    /// Raw annotation text, when present
    pub annotation: Option<String>,
    /// Lowered default expression, when present
    pub default: Option<PyExpr>,
    /// Target of a `Depends(...)`/`Security(...)` marker found in the
    /// default or the annotation
    pub depends: Option<PyExpr>,
}

/// A function or method found in an analyzed module
#[derive(Debug, Clone)]
pub struct FunctionDecl {
    pub name: String,
    /// `name` for free functions, `Class.name` for methods
    pub qualname: String,
    pub class_name: Option<String>,
    pub params: Vec<ParamDecl>,
    pub decorators: Vec<PyExpr>,
    /// Byte range of the `function_definition` node, used to find the
    /// body again when the routine is walked
    pub byte_range: (usize, usize),
    pub line: usize,
}

/// An annotated field declared in a class body (dataclass style)
#[derive(Debug, Clone)]
pub struct FieldDecl {
    pub name: String,
    pub annotation: String,
    pub default: Option<PyExpr>,
}

/// A class found in an analyzed module
#[derive(Debug, Clone)]
pub struct ClassDecl {
    pub name: String,
    pub bases: Vec<PyExpr>,
    /// Plain class-body assignments, e.g. `status_code = 405`
    pub class_attrs: HashMap<String, PyExpr>,
    /// Annotated, non-ClassVar body fields, e.g. `user_id: int`
    pub fields: Vec<FieldDecl>,
    pub docstring: Option<String>,
}

/// Module-level environment consulted during resolution
#[derive(Debug, Default)]
pub struct ModuleEnv {
    /// Local name -> fully qualified dotted target
    pub imports: HashMap<String, String>,
    /// Module-level assignments
    pub assigns: HashMap<String, PyExpr>,
    pub classes: HashMap<String, ClassDecl>,
    /// Qualified name (`f` or `Class.f`) -> declaration
    pub functions: HashMap<String, FunctionDecl>,
}

/// One parsed module of the analyzed service
pub struct ModuleSource {
    pub module: String,
    pub path: PathBuf,
    pub content: String,
    pub content_hash: String,
    pub is_package: bool,
    pub tree: Tree,
    pub env: ModuleEnv,
}

impl ModuleSource {
    /// Re-find the syntax node a declaration was extracted from
    pub fn node_at(&self, byte_range: (usize, usize)) -> Option<Node<'_>> {
        self.tree
            .root_node()
            .descendant_for_byte_range(byte_range.0, byte_range.1)
    }
}

/// Index over every Python module under the source root
pub struct SourceIndex {
    modules: HashMap<String, ModuleSource>,
}

impl SourceIndex {
    /// Walk the source root and parse every Python file into the index
    pub fn load<P: AsRef<Path>>(root: P, config: &AnalysisConfig) -> Result<Self> {
        let root = root.as_ref();
        let mut parser = PythonParser::new()?;
        let mut modules = HashMap::new();

        let walker = WalkBuilder::new(root)
            .hidden(false)
            .git_ignore(true)
            .build();

        for entry in walker {
            let entry = entry.map_err(|e| FaultlineError::FileSystem(e.to_string()))?;
            let path = entry.path();
            if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some("py") {
                continue;
            }

            let content = std::fs::read_to_string(path)?;
            if content.len() > config.max_file_size {
                warn!("Skipping {}: exceeds maximum size limit", path.display());
                continue;
            }

            let Some((module, is_package)) = module_path(root, path) else {
                continue;
            };

            let tree = match parser.parse(&content) {
                Ok(tree) => tree,
                Err(e) => {
                    warn!("Skipping {}: {}", path.display(), e);
                    continue;
                }
            };

            let env = build_env(&tree, &content, &module, is_package);
            debug!(
                "Indexed {} ({} functions, {} classes)",
                module,
                env.functions.len(),
                env.classes.len()
            );

            modules.insert(
                module.clone(),
                ModuleSource {
                    module,
                    path: path.to_path_buf(),
                    content_hash: calculate_hash(&content),
                    content,
                    is_package,
                    tree,
                    env,
                },
            );
        }

        Ok(Self { modules })
    }

    pub fn get(&self, module: &str) -> Option<&ModuleSource> {
        self.modules.get(module)
    }

    pub fn modules(&self) -> impl Iterator<Item = &ModuleSource> {
        self.modules.values()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Split a fully qualified dotted path into its longest indexed
    /// module prefix and the symbol path inside that module
    pub fn split_symbol<'a>(&'a self, dotted: &str) -> Option<(&'a ModuleSource, Vec<String>)> {
        let parts: Vec<&str> = dotted.split('.').collect();
        for cut in (1..=parts.len()).rev() {
            let candidate = parts[..cut].join(".");
            if let Some(module) = self.modules.get(&candidate) {
                let rest = parts[cut..].iter().map(|s| s.to_string()).collect();
                return Some((module, rest));
            }
        }
        None
    }

    /// Look up a function declaration by module and qualified name
    pub fn function(&self, module: &str, qualname: &str) -> Option<(&ModuleSource, &FunctionDecl)> {
        let source = self.modules.get(module)?;
        let decl = source.env.functions.get(qualname)?;
        Some((source, decl))
    }

    /// Look up a class declaration by module and name
    pub fn class_decl(&self, module: &str, name: &str) -> Option<(&ModuleSource, &ClassDecl)> {
        let source = self.modules.get(module)?;
        let decl = source.env.classes.get(name)?;
        Some((source, decl))
    }

    /// Resolve a local name in a module to its fully qualified dotted
    /// path, following the module's import table
    pub fn qualify(&self, module: &str, name: &str) -> Option<String> {
        let source = self.modules.get(module)?;
        if let Some(target) = source.env.imports.get(name) {
            return Some(target.clone());
        }
        if source.env.classes.contains_key(name) || source.env.functions.contains_key(name) {
            return Some(format!("{}.{}", module, name));
        }
        None
    }
}

/// Derive the dotted module path for a file under the source root
fn module_path(root: &Path, path: &Path) -> Option<(String, bool)> {
    let relative = path.strip_prefix(root).ok()?;
    let mut parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect();

    let file = parts.pop()?;
    let stem = file.strip_suffix(".py")?;

    let is_package = stem == "__init__";
    if !is_package {
        parts.push(stem.to_string());
    }

    if parts.is_empty() {
        return None;
    }
    Some((parts.join("."), is_package))
}

fn calculate_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Build the module-level environment from the parse tree
fn build_env(tree: &Tree, source: &str, module: &str, is_package: bool) -> ModuleEnv {
    let mut env = ModuleEnv::default();
    let root = tree.root_node();
    let mut cursor = root.walk();

    for child in root.named_children(&mut cursor) {
        collect_top_level(child, source, module, is_package, &mut env);
    }

    env
}

fn collect_top_level(node: Node, source: &str, module: &str, is_package: bool, env: &mut ModuleEnv) {
    match node.kind() {
        "import_statement" => collect_plain_import(node, source, env),
        "import_from_statement" => collect_from_import(node, source, module, is_package, env),
        "expression_statement" => {
            if let Some(inner) = node.named_child(0) {
                if inner.kind() == "assignment" {
                    collect_assignment(inner, source, env);
                }
            }
        }
        "function_definition" => {
            let decl = parse_function(node, source, None, &[]);
            if let Some(decl) = decl {
                env.functions.insert(decl.qualname.clone(), decl);
            }
        }
        "class_definition" => collect_class(node, source, &[], env),
        "decorated_definition" => {
            let decorators = parse_decorators(node, source);
            if let Some(definition) = node.child_by_field_name("definition") {
                match definition.kind() {
                    "function_definition" => {
                        if let Some(decl) = parse_function(definition, source, None, &decorators) {
                            env.functions.insert(decl.qualname.clone(), decl);
                        }
                    }
                    "class_definition" => collect_class(definition, source, &decorators, env),
                    _ => {}
                }
            }
        }
        _ => {}
    }
}

fn collect_plain_import(node: Node, source: &str, env: &mut ModuleEnv) {
    let mut cursor = node.walk();
    for child in node.named_children(&mut cursor) {
        match child.kind() {
            "dotted_name" => {
                let dotted = python::node_text(child, source);
                // `import a.b` binds the root package name
                let head = dotted.split('.').next().unwrap_or(&dotted).to_string();
                env.imports.insert(head.clone(), head);
            }
            "aliased_import" => {
                let name = child.child_by_field_name("name");
                let alias = child.child_by_field_name("alias");
                if let (Some(name), Some(alias)) = (name, alias) {
                    env.imports.insert(
                        python::node_text(alias, source),
                        python::node_text(name, source),
                    );
                }
            }
            _ => {}
        }
    }
}

fn collect_from_import(node: Node, source: &str, module: &str, is_package: bool, env: &mut ModuleEnv) {
    let Some(module_node) = node.child_by_field_name("module_name") else {
        return;
    };

    let base = match module_node.kind() {
        "dotted_name" => python::node_text(module_node, source),
        "relative_import" => {
            let text = python::node_text(module_node, source);
            let dots = text.chars().take_while(|c| *c == '.').count();
            let suffix = &text[dots..];
            let mut parts: Vec<&str> = module.split('.').collect();
            // The first dot refers to the enclosing package; a plain
            // module must drop its own name first
            let pops = if is_package { dots - 1 } else { dots };
            for _ in 0..pops {
                if parts.pop().is_none() {
                    return;
                }
            }
            if suffix.is_empty() {
                parts.join(".")
            } else if parts.is_empty() {
                suffix.to_string()
            } else {
                format!("{}.{}", parts.join("."), suffix)
            }
        }
        _ => return,
    };

    let mut cursor = node.walk();
    for child in node.named_children(&mut cursor) {
        if child.id() == module_node.id() {
            continue;
        }
        match child.kind() {
            "dotted_name" => {
                let name = python::node_text(child, source);
                env.imports.insert(name.clone(), format!("{}.{}", base, name));
            }
            "aliased_import" => {
                let name = child.child_by_field_name("name");
                let alias = child.child_by_field_name("alias");
                if let (Some(name), Some(alias)) = (name, alias) {
                    env.imports.insert(
                        python::node_text(alias, source),
                        format!("{}.{}", base, python::node_text(name, source)),
                    );
                }
            }
            _ => {}
        }
    }
}

fn collect_assignment(node: Node, source: &str, env: &mut ModuleEnv) {
    let left = node.child_by_field_name("left");
    let right = node.child_by_field_name("right");
    if let (Some(left), Some(right)) = (left, right) {
        if left.kind() == "identifier" {
            env.assigns.insert(
                python::node_text(left, source),
                python::lower_expr(right, source),
            );
        }
    }
}

fn parse_decorators(node: Node, source: &str) -> Vec<PyExpr> {
    let mut decorators = Vec::new();
    let mut cursor = node.walk();
    for child in node.named_children(&mut cursor) {
        if child.kind() == "decorator" {
            if let Some(expr) = child.named_child(0) {
                decorators.push(python::lower_expr(expr, source));
            }
        }
    }
    decorators
}

fn parse_function(
    node: Node,
    source: &str,
    class_name: Option<&str>,
    decorators: &[PyExpr],
) -> Option<FunctionDecl> {
    let name_node = node.child_by_field_name("name")?;
    let name = python::node_text(name_node, source);

    let qualname = match class_name {
        Some(class) => format!("{}.{}", class, name),
        None => name.clone(),
    };

    let mut params = Vec::new();
    if let Some(param_list) = node.child_by_field_name("parameters") {
        let mut cursor = param_list.walk();
        for child in param_list.named_children(&mut cursor) {
            if let Some(param) = parse_param(child, source) {
                params.push(param);
            }
        }
    }

    Some(FunctionDecl {
        name,
        qualname,
        class_name: class_name.map(|s| s.to_string()),
        params,
        decorators: decorators.to_vec(),
        byte_range: (node.start_byte(), node.end_byte()),
        line: node.start_position().row + 1,
    })
}

fn parse_param(node: Node, source: &str) -> Option<ParamDecl> {
    match node.kind() {
        "identifier" => Some(ParamDecl {
            name: python::node_text(node, source),
            annotation: None,
            default: None,
            depends: None,
        }),
        "typed_parameter" => {
            let name = node.named_child(0)?;
            if name.kind() != "identifier" {
                return None;
            }
            let annotation = node.child_by_field_name("type");
            Some(ParamDecl {
                name: python::node_text(name, source),
                annotation: annotation.map(|a| python::node_text(a, source)),
                default: None,
                depends: annotation.and_then(|a| find_dependency_marker(a, source)),
            })
        }
        "default_parameter" | "typed_default_parameter" => {
            let name = node.child_by_field_name("name")?;
            if name.kind() != "identifier" {
                return None;
            }
            let annotation = node.child_by_field_name("type");
            let value = node.child_by_field_name("value");
            let depends = value
                .and_then(|v| find_dependency_marker(v, source))
                .or_else(|| annotation.and_then(|a| find_dependency_marker(a, source)));
            Some(ParamDecl {
                name: python::node_text(name, source),
                annotation: annotation.map(|a| python::node_text(a, source)),
                default: value.map(|v| python::lower_expr(v, source)),
                depends,
            })
        }
        _ => None,
    }
}

/// Find a `Depends(target)` or `Security(target)` call anywhere inside a
/// default value or an `Annotated[...]` annotation, returning the target
fn find_dependency_marker(node: Node, source: &str) -> Option<PyExpr> {
    if node.kind() == "call" {
        if let Some(func) = node.child_by_field_name("function") {
            let func_name = python::node_text(func, source);
            let tail = func_name.rsplit('.').next().unwrap_or(&func_name);
            if tail == "Depends" || tail == "Security" {
                if let Some(args) = node.child_by_field_name("arguments") {
                    let mut cursor = args.walk();
                    for arg in args.named_children(&mut cursor) {
                        if arg.kind() != "keyword_argument" && arg.kind() != "comment" {
                            return Some(python::lower_expr(arg, source));
                        }
                    }
                }
                return None;
            }
        }
    }

    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        if let Some(found) = find_dependency_marker(child, source) {
            return Some(found);
        }
    }
    None
}

fn collect_class(node: Node, source: &str, _decorators: &[PyExpr], env: &mut ModuleEnv) {
    let Some(name_node) = node.child_by_field_name("name") else {
        return;
    };
    let class_name = python::node_text(name_node, source);

    let mut bases = Vec::new();
    if let Some(superclasses) = node.child_by_field_name("superclasses") {
        let mut cursor = superclasses.walk();
        for child in superclasses.named_children(&mut cursor) {
            if child.kind() != "keyword_argument" && child.kind() != "comment" {
                bases.push(python::lower_expr(child, source));
            }
        }
    }

    let mut class_attrs = HashMap::new();
    let mut fields = Vec::new();

    if let Some(body) = node.child_by_field_name("body") {
        let mut cursor = body.walk();
        for stmt in body.named_children(&mut cursor) {
            match stmt.kind() {
                "expression_statement" => {
                    if let Some(inner) = stmt.named_child(0) {
                        if inner.kind() == "assignment" {
                            collect_class_member(inner, source, &mut class_attrs, &mut fields);
                        }
                    }
                }
                "function_definition" => {
                    if let Some(decl) = parse_function(stmt, source, Some(&class_name), &[]) {
                        env.functions.insert(decl.qualname.clone(), decl);
                    }
                }
                "decorated_definition" => {
                    let decorators = parse_decorators(stmt, source);
                    if let Some(definition) = stmt.child_by_field_name("definition") {
                        if definition.kind() == "function_definition" {
                            if let Some(decl) =
                                parse_function(definition, source, Some(&class_name), &decorators)
                            {
                                env.functions.insert(decl.qualname.clone(), decl);
                            }
                        }
                    }
                }
                _ => {}
            }
        }
    }

    env.classes.insert(
        class_name.clone(),
        ClassDecl {
            name: class_name,
            bases,
            class_attrs,
            fields,
            docstring: python::docstring(node, source),
        },
    );
}

fn collect_class_member(
    node: Node,
    source: &str,
    class_attrs: &mut HashMap<String, PyExpr>,
    fields: &mut Vec<FieldDecl>,
) {
    let Some(left) = node.child_by_field_name("left") else {
        return;
    };
    if left.kind() != "identifier" {
        return;
    }
    let name = python::node_text(left, source);
    let annotation = node.child_by_field_name("type").map(|t| python::node_text(t, source));
    let value = node.child_by_field_name("right").map(|r| python::lower_expr(r, source));

    match annotation {
        Some(annotation) if !annotation.contains("ClassVar") => {
            // Declared response fields; status and detail are response
            // metadata, not body fields
            if name != "status_code" && name != "detail" {
                fields.push(FieldDecl {
                    name,
                    annotation,
                    default: value,
                });
            } else if let Some(value) = value {
                class_attrs.insert(name, value);
            }
        }
        _ => {
            if let Some(value) = value {
                class_attrs.insert(name, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AnalysisConfig;

    fn test_config() -> AnalysisConfig {
        AnalysisConfig {
            target_modules: vec![],
            max_walk_depth: 32,
            max_fold_steps: 64,
            max_file_size: 1024 * 1024,
        }
    }

    fn index_single(content: &str) -> SourceIndex {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("svc.py"), content).unwrap();
        SourceIndex::load(dir.path(), &test_config()).unwrap()
    }

    #[test]
    fn test_module_path_derivation() {
        let root = Path::new("/app");
        assert_eq!(
            module_path(root, Path::new("/app/pkg/mod.py")),
            Some(("pkg.mod".to_string(), false))
        );
        assert_eq!(
            module_path(root, Path::new("/app/pkg/__init__.py")),
            Some(("pkg".to_string(), true))
        );
        assert_eq!(module_path(root, Path::new("/app/__init__.py")), None);
    }

    #[test]
    fn test_imports_collected() {
        let index = index_single(
            "import json\n\
             import os.path as osp\n\
             from fastapi import HTTPException\n\
             from fastapi import Depends as Dep\n",
        );
        let env = &index.get("svc").unwrap().env;
        assert_eq!(env.imports.get("json"), Some(&"json".to_string()));
        assert_eq!(env.imports.get("osp"), Some(&"os.path".to_string()));
        assert_eq!(
            env.imports.get("HTTPException"),
            Some(&"fastapi.HTTPException".to_string())
        );
        assert_eq!(env.imports.get("Dep"), Some(&"fastapi.Depends".to_string()));
    }

    #[test]
    fn test_class_and_function_declarations() {
        let index = index_single(
            "from fastapi import HTTPException\n\
             \n\
             class NotFound(HTTPException):\n    \
             status_code = 404\n    \
             detail = \"missing\"\n\
             \n\
             class Balance(HTTPException):\n    \
             user_id: int\n    \
             amount: float = 0.0\n\
             \n\
             def helper(a, b=1):\n    \
             return a\n",
        );
        let env = &index.get("svc").unwrap().env;

        let not_found = env.classes.get("NotFound").unwrap();
        assert_eq!(
            not_found.class_attrs.get("status_code"),
            Some(&PyExpr::Int(404))
        );
        assert!(not_found.fields.is_empty());

        let balance = env.classes.get("Balance").unwrap();
        assert_eq!(balance.fields.len(), 2);
        assert_eq!(balance.fields[0].name, "user_id");
        assert_eq!(balance.fields[0].annotation, "int");
        assert_eq!(balance.fields[1].default, Some(PyExpr::Float(0.0)));

        let helper = env.functions.get("helper").unwrap();
        assert_eq!(helper.params.len(), 2);
        assert_eq!(helper.params[1].default, Some(PyExpr::Int(1)));
    }

    #[test]
    fn test_depends_marker_extraction() {
        let index = index_single(
            "from fastapi import Depends\n\
             from typing import Annotated\n\
             \n\
             def handler(user: str = Depends(get_user), token: Annotated[str, Depends(get_token)] = None):\n\
                 return user\n",
        );
        let env = &index.get("svc").unwrap().env;
        let handler = env.functions.get("handler").unwrap();
        assert_eq!(
            handler.params[0].depends,
            Some(PyExpr::Name("get_user".to_string()))
        );
        assert_eq!(
            handler.params[1].depends,
            Some(PyExpr::Name("get_token".to_string()))
        );
    }

    #[test]
    fn test_relative_import_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let pkg = dir.path().join("pkg");
        std::fs::create_dir_all(&pkg).unwrap();
        std::fs::write(pkg.join("__init__.py"), "").unwrap();
        std::fs::write(pkg.join("errors.py"), "class Boom:\n    pass\n").unwrap();
        std::fs::write(pkg.join("api.py"), "from .errors import Boom\n").unwrap();

        let index = SourceIndex::load(dir.path(), &test_config()).unwrap();
        let env = &index.get("pkg.api").unwrap().env;
        assert_eq!(env.imports.get("Boom"), Some(&"pkg.errors.Boom".to_string()));
    }

    #[test]
    fn test_split_symbol_longest_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let pkg = dir.path().join("pkg");
        std::fs::create_dir_all(&pkg).unwrap();
        std::fs::write(pkg.join("__init__.py"), "").unwrap();
        std::fs::write(pkg.join("errors.py"), "class Boom:\n    pass\n").unwrap();

        let index = SourceIndex::load(dir.path(), &test_config()).unwrap();
        let (module, rest) = index.split_symbol("pkg.errors.Boom").unwrap();
        assert_eq!(module.module, "pkg.errors");
        assert_eq!(rest, vec!["Boom".to_string()]);
    }
}
