use tree_sitter::{Node, Parser, Tree};

use crate::error::{FaultlineError, Result};

/// Python source parser backed by Tree-sitter
pub struct PythonParser {
    parser: Parser,
}

impl PythonParser {
    pub fn new() -> Result<Self> {
        let mut parser = Parser::new();
        let python_language = tree_sitter_python::language();
        parser.set_language(&python_language)
            .map_err(|e| FaultlineError::Parser(format!("Failed to set Python language: {}", e)))?;

        Ok(Self { parser })
    }

    pub fn parse(&mut self, content: &str) -> Result<Tree> {
        self.parser.parse(content, None)
            .ok_or_else(|| FaultlineError::Parser("Failed to parse Python code".to_string()))
    }
}

/// Lowered Python expression.
///
/// Raise sites, assignments and call targets are modelled through this
/// union instead of raw syntax nodes so every resolution site has an
/// explicit terminal case. Anything the analysis does not model lowers
/// to `Unsupported` and is skipped downstream.
#[derive(Debug, Clone, PartialEq)]
pub enum PyExpr {
    Name(String),
    /// Dotted reference, e.g. `status.HTTP_404_NOT_FOUND` -> ["status", "HTTP_404_NOT_FOUND"]
    Attribute(Vec<String>),
    Call {
        func: Box<PyExpr>,
        args: Vec<PyExpr>,
        kwargs: Vec<(String, PyExpr)>,
    },
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    NoneLit,
    List(Vec<PyExpr>),
    Dict(Vec<(PyExpr, PyExpr)>),
    BinOp {
        left: Box<PyExpr>,
        op: String,
        right: Box<PyExpr>,
    },
    Unsupported,
}

impl PyExpr {
    /// The trailing identifier of a reference, if this is one.
    pub fn tail_name(&self) -> Option<&str> {
        match self {
            PyExpr::Name(n) => Some(n),
            PyExpr::Attribute(path) => path.last().map(|s| s.as_str()),
            _ => None,
        }
    }

    pub fn is_literal(&self) -> bool {
        matches!(
            self,
            PyExpr::Str(_) | PyExpr::Int(_) | PyExpr::Float(_) | PyExpr::Bool(_) | PyExpr::NoneLit
        )
    }
}

/// Extract the text content of a node
pub fn node_text(node: Node, source: &str) -> String {
    source[node.byte_range()].to_string()
}

/// Lower a Tree-sitter expression node into a `PyExpr`
pub fn lower_expr(node: Node, source: &str) -> PyExpr {
    match node.kind() {
        "identifier" => PyExpr::Name(node_text(node, source)),
        "attribute" => lower_attribute(node, source),
        "call" => lower_call(node, source),
        "string" => lower_string(node, source),
        "integer" => parse_int(&node_text(node, source))
            .map(PyExpr::Int)
            .unwrap_or(PyExpr::Unsupported),
        "float" => node_text(node, source)
            .replace('_', "")
            .parse::<f64>()
            .map(PyExpr::Float)
            .unwrap_or(PyExpr::Unsupported),
        "true" => PyExpr::Bool(true),
        "false" => PyExpr::Bool(false),
        "none" => PyExpr::NoneLit,
        "await" => node
            .named_child(0)
            .map(|inner| lower_expr(inner, source))
            .unwrap_or(PyExpr::Unsupported),
        "parenthesized_expression" => node
            .named_child(0)
            .map(|inner| lower_expr(inner, source))
            .unwrap_or(PyExpr::Unsupported),
        "unary_operator" => lower_unary(node, source),
        "binary_operator" => {
            let left = node.child_by_field_name("left");
            let op = node.child_by_field_name("operator");
            let right = node.child_by_field_name("right");
            match (left, op, right) {
                (Some(l), Some(o), Some(r)) => PyExpr::BinOp {
                    left: Box::new(lower_expr(l, source)),
                    op: node_text(o, source),
                    right: Box::new(lower_expr(r, source)),
                },
                _ => PyExpr::Unsupported,
            }
        }
        "list" | "tuple" => {
            let mut cursor = node.walk();
            let items = node
                .named_children(&mut cursor)
                .map(|c| lower_expr(c, source))
                .collect();
            PyExpr::List(items)
        }
        "dictionary" => {
            let mut cursor = node.walk();
            let mut pairs = Vec::new();
            for child in node.named_children(&mut cursor) {
                if child.kind() == "pair" {
                    let key = child.child_by_field_name("key");
                    let value = child.child_by_field_name("value");
                    if let (Some(k), Some(v)) = (key, value) {
                        pairs.push((lower_expr(k, source), lower_expr(v, source)));
                    }
                }
            }
            PyExpr::Dict(pairs)
        }
        _ => PyExpr::Unsupported,
    }
}

/// Reconstruct a dotted reference from an attribute node, drilling
/// through intermediate calls the way `svc.get().fail` reads.
fn lower_attribute(node: Node, source: &str) -> PyExpr {
    let mut names: Vec<String> = Vec::new();
    if collect_attribute_path(node, source, &mut names) && !names.is_empty() {
        if names.len() == 1 {
            PyExpr::Name(names.remove(0))
        } else {
            PyExpr::Attribute(names)
        }
    } else {
        PyExpr::Unsupported
    }
}

fn collect_attribute_path(node: Node, source: &str, names: &mut Vec<String>) -> bool {
    match node.kind() {
        "identifier" => {
            names.push(node_text(node, source));
            true
        }
        "attribute" => {
            let object = node.child_by_field_name("object");
            let attr = node.child_by_field_name("attribute");
            match (object, attr) {
                (Some(obj), Some(attr)) => {
                    if !collect_attribute_path(obj, source, names) {
                        return false;
                    }
                    names.push(node_text(attr, source));
                    true
                }
                _ => false,
            }
        }
        "call" => node
            .child_by_field_name("function")
            .map(|f| collect_attribute_path(f, source, names))
            .unwrap_or(false),
        _ => false,
    }
}

fn lower_call(node: Node, source: &str) -> PyExpr {
    let func = match node.child_by_field_name("function") {
        Some(f) => lower_expr(f, source),
        None => return PyExpr::Unsupported,
    };

    let mut args = Vec::new();
    let mut kwargs = Vec::new();

    if let Some(arg_list) = node.child_by_field_name("arguments") {
        let mut cursor = arg_list.walk();
        for child in arg_list.named_children(&mut cursor) {
            if child.kind() == "keyword_argument" {
                let name = child.child_by_field_name("name");
                let value = child.child_by_field_name("value");
                if let (Some(n), Some(v)) = (name, value) {
                    kwargs.push((node_text(n, source), lower_expr(v, source)));
                }
            } else if child.kind() != "comment" {
                args.push(lower_expr(child, source));
            }
        }
    }

    PyExpr::Call {
        func: Box::new(func),
        args,
        kwargs,
    }
}

fn lower_unary(node: Node, source: &str) -> PyExpr {
    let op = node
        .child_by_field_name("operator")
        .map(|o| node_text(o, source));
    let argument = node
        .child_by_field_name("argument")
        .map(|a| lower_expr(a, source));

    match (op.as_deref(), argument) {
        (Some("-"), Some(PyExpr::Int(n))) => PyExpr::Int(-n),
        (Some("-"), Some(PyExpr::Float(f))) => PyExpr::Float(-f),
        _ => PyExpr::Unsupported,
    }
}

fn lower_string(node: Node, source: &str) -> PyExpr {
    let text = node_text(node, source);

    // f-strings carry interpolations; they are not literals
    let prefix_len = text.find(['"', '\'']).unwrap_or(0);
    let prefix = text[..prefix_len].to_lowercase();
    if prefix.contains('f') {
        return PyExpr::Unsupported;
    }

    PyExpr::Str(strip_string_quotes(&text[prefix_len..]))
}

fn strip_string_quotes(text: &str) -> String {
    for delim in ["\"\"\"", "'''", "\"", "'"] {
        if text.starts_with(delim) && text.ends_with(delim) && text.len() >= delim.len() * 2 {
            return text[delim.len()..text.len() - delim.len()].to_string();
        }
    }
    text.to_string()
}

fn parse_int(text: &str) -> Option<i64> {
    let cleaned = text.replace('_', "");
    let lower = cleaned.to_lowercase();
    if let Some(hex) = lower.strip_prefix("0x") {
        i64::from_str_radix(hex, 16).ok()
    } else if let Some(oct) = lower.strip_prefix("0o") {
        i64::from_str_radix(oct, 8).ok()
    } else if let Some(bin) = lower.strip_prefix("0b") {
        i64::from_str_radix(bin, 2).ok()
    } else {
        cleaned.parse::<i64>().ok()
    }
}

/// Extract a docstring from the first statement of a definition body
pub fn docstring(node: Node, source: &str) -> Option<String> {
    let body = node.child_by_field_name("body")?;
    let first = body.named_child(0)?;
    if first.kind() != "expression_statement" {
        return None;
    }
    let expr = first.named_child(0)?;
    if expr.kind() != "string" {
        return None;
    }
    match lower_string(expr, source) {
        PyExpr::Str(s) => {
            let cleaned = s.trim().to_string();
            if cleaned.is_empty() {
                None
            } else {
                Some(cleaned)
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lower_first(source: &str) -> PyExpr {
        let mut parser = PythonParser::new().unwrap();
        let tree = parser.parse(source).unwrap();
        let root = tree.root_node();
        let stmt = root.named_child(0).unwrap();
        let expr = stmt.named_child(0).unwrap();
        lower_expr(expr, source)
    }

    #[test]
    fn test_lower_name_and_attribute() {
        assert_eq!(lower_first("foo"), PyExpr::Name("foo".to_string()));
        assert_eq!(
            lower_first("status.HTTP_404_NOT_FOUND"),
            PyExpr::Attribute(vec![
                "status".to_string(),
                "HTTP_404_NOT_FOUND".to_string()
            ])
        );
    }

    #[test]
    fn test_lower_call_with_kwargs() {
        let expr = lower_first("HTTPException(status_code=404, detail=\"missing\")");
        match expr {
            PyExpr::Call { func, args, kwargs } => {
                assert_eq!(*func, PyExpr::Name("HTTPException".to_string()));
                assert!(args.is_empty());
                assert_eq!(kwargs.len(), 2);
                assert_eq!(kwargs[0].0, "status_code");
                assert_eq!(kwargs[0].1, PyExpr::Int(404));
                assert_eq!(kwargs[1].1, PyExpr::Str("missing".to_string()));
            }
            other => panic!("expected call, got {:?}", other),
        }
    }

    #[test]
    fn test_lower_literals() {
        assert_eq!(lower_first("404"), PyExpr::Int(404));
        assert_eq!(lower_first("-3"), PyExpr::Int(-3));
        assert_eq!(lower_first("'hi'"), PyExpr::Str("hi".to_string()));
        assert_eq!(lower_first("None"), PyExpr::NoneLit);
        assert_eq!(lower_first("True"), PyExpr::Bool(true));
    }

    #[test]
    fn test_fstring_is_not_a_literal() {
        assert_eq!(lower_first("f\"user {uid}\""), PyExpr::Unsupported);
    }

    #[test]
    fn test_attribute_through_call() {
        // svc.get().fail reads as the dotted chain svc.get.fail
        assert_eq!(
            lower_first("svc.get().fail"),
            PyExpr::Attribute(vec![
                "svc".to_string(),
                "get".to_string(),
                "fail".to_string()
            ])
        );
    }

    #[test]
    fn test_dict_literal() {
        let expr = lower_first("{\"type\": \"object\"}");
        match expr {
            PyExpr::Dict(pairs) => {
                assert_eq!(pairs.len(), 1);
                assert_eq!(pairs[0].0, PyExpr::Str("type".to_string()));
            }
            other => panic!("expected dict, got {:?}", other),
        }
    }
}
