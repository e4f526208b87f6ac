use serde_json::{json, Map, Value};

use crate::core::python::PyExpr;
use crate::core::source::FieldDecl;
use super::resolver::{ResolvedErrorType, TypeResolver};
use super::walker::RaiseSite;

const NO_DESCRIPTION: &str = "No description provided";

/// Documented body of a response shape
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    /// Structured JSON schema
    Schema(Value),
    /// The error carries no structured fields; callers receive
    /// unstructured text
    OpaqueString,
}

/// A documented response destined for the API description
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseShape {
    pub status_code: u16,
    pub description: String,
    pub schema_name: String,
    pub body: Body,
}

impl ResponseShape {
    /// Render the body as a JSON schema fragment
    pub fn body_schema(&self) -> Value {
        match &self.body {
            Body::Schema(schema) => schema.clone(),
            Body::OpaqueString => json!({
                "title": self.schema_name,
                "type": "object",
                "properties": {
                    "detail": {"title": "Detail", "type": "string"}
                },
                "required": ["detail"]
            }),
        }
    }
}

/// Derive a documented response shape for a resolved error type and the
/// arguments at its raise site.
///
/// Self-described schemas win over field derivation; a type with
/// neither fields nor a literal detail documents an opaque string body.
/// Returns `None` when no status can be determined, and the caller
/// drops the site.
pub fn describe(
    resolved: &ResolvedErrorType,
    site: &RaiseSite,
    resolver: &TypeResolver,
) -> Option<ResponseShape> {
    let status = site_status(resolved, site, resolver);

    if let Some(schema) = &resolved.self_schema {
        return Some(ResponseShape {
            status_code: status?,
            description: resolved
                .docstring
                .clone()
                .unwrap_or_else(|| NO_DESCRIPTION.to_string()),
            schema_name: format!("{}Schema", resolved.name),
            body: Body::Schema(schema.clone()),
        });
    }

    let status = status?;

    if !resolved.fields.is_empty() {
        let name = format!("{}Schema", resolved.name);
        let schema = field_schema(&name, &resolved.fields, site, resolver);
        return Some(ResponseShape {
            status_code: status,
            description: resolved
                .docstring
                .clone()
                .or_else(|| resolved.detail.clone())
                .unwrap_or_else(|| NO_DESCRIPTION.to_string()),
            schema_name: name,
            body: Body::Schema(schema),
        });
    }

    match site_detail(resolved, site, resolver) {
        Some(detail) => {
            let name = schema_name_from_detail(&detail)
                .unwrap_or_else(|| format!("{}ErrorSchema", resolved.name));
            Some(ResponseShape {
                status_code: status,
                description: detail.clone(),
                schema_name: name.clone(),
                body: Body::Schema(json!({
                    "title": name,
                    "type": "object",
                    "properties": {
                        "detail": {"title": "Detail", "type": "string", "const": detail}
                    },
                    "required": ["detail"]
                })),
            })
        }
        None => Some(ResponseShape {
            status_code: status,
            description: NO_DESCRIPTION.to_string(),
            schema_name: format!("{}ErrorSchema", resolved.name),
            body: Body::OpaqueString,
        }),
    }
}

/// Status for the site: keyword argument, any positional status-shaped
/// argument, then the type's declared default
fn site_status(
    resolved: &ResolvedErrorType,
    site: &RaiseSite,
    resolver: &TypeResolver,
) -> Option<u16> {
    for (name, value) in &site.kwargs {
        if name == "status_code" {
            if let Some(status) = resolver.status_code(&site.module, value) {
                return Some(status);
            }
        }
    }
    for arg in &site.args {
        if let Some(status) = resolver.status_code(&site.module, arg) {
            return Some(status);
        }
    }
    resolved.status_code
}

/// Detail text for the site: keyword argument, first positional string,
/// then the type's declared default
fn site_detail(
    resolved: &ResolvedErrorType,
    site: &RaiseSite,
    resolver: &TypeResolver,
) -> Option<String> {
    for (name, value) in &site.kwargs {
        if name == "detail" {
            if let Some(Value::String(detail)) = resolver.fold(&site.module, value) {
                return Some(detail);
            }
            return resolved.detail.clone();
        }
    }
    for arg in &site.args {
        if let Some(Value::String(detail)) = resolver.fold(&site.module, arg) {
            return Some(detail);
        }
    }
    resolved.detail.clone()
}

/// Bind declared fields to raise-site arguments and emit an object
/// schema; literal arguments become const values, the rest keep their
/// annotated type. Arguments matching no declared field are ignored.
fn field_schema(
    name: &str,
    fields: &[FieldDecl],
    site: &RaiseSite,
    resolver: &TypeResolver,
) -> Value {
    let mut properties = Map::new();
    let mut required = Vec::new();

    for (position, field) in fields.iter().enumerate() {
        let argument = site
            .kwargs
            .iter()
            .find(|(name, _)| *name == field.name)
            .map(|(_, value)| value)
            .or_else(|| site.args.get(position));

        let mut property = annotation_schema(&field.annotation);
        if let Some(object) = property.as_object_mut() {
            object.insert("title".to_string(), json!(title_case(&field.name)));
            if let Some(argument) = argument {
                if argument.is_literal() {
                    if let Some(value) = resolver.fold(&site.module, argument) {
                        object.insert("const".to_string(), value);
                    }
                }
            }
        }
        properties.insert(field.name.clone(), property);

        if field.default.is_none() {
            required.push(json!(field.name));
        }
    }

    json!({
        "title": name,
        "type": "object",
        "properties": properties,
        "required": required
    })
}

/// Map a Python type annotation to its JSON schema type
fn annotation_schema(annotation: &str) -> Value {
    let trimmed = annotation
        .trim()
        .trim_start_matches("Optional[")
        .trim_end_matches(']');
    match trimmed {
        "int" => json!({"type": "integer"}),
        "float" => json!({"type": "number"}),
        "str" => json!({"type": "string"}),
        "bool" => json!({"type": "boolean"}),
        "dict" => json!({"type": "object"}),
        "list" => json!({"type": "array"}),
        _ => json!({}),
    }
}

/// Camel-case a literal detail into a schema name, the way
/// "User not found" becomes "UserNotFoundSchema"
fn schema_name_from_detail(detail: &str) -> Option<String> {
    let mut name = String::new();
    for word in detail.split([' ', '_', '-']) {
        let word: String = word.chars().filter(|c| c.is_ascii_alphanumeric()).collect();
        if word.is_empty() {
            continue;
        }
        if name.is_empty() {
            name.push_str(&word);
        } else {
            let mut chars = word.chars();
            if let Some(first) = chars.next() {
                name.push(first.to_ascii_uppercase());
                name.push_str(chars.as_str());
            }
        }
    }
    if name.is_empty() {
        None
    } else {
        Some(format!("{}Schema", name))
    }
}

fn title_case(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => format!("{}{}", first.to_ascii_uppercase(), chars.as_str()),
        None => name.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AnalysisConfig;
    use crate::core::analysis::{AnalysisCache, Resolution, RoutineRef, TargetModules, Walker};
    use crate::core::source::SourceIndex;

    fn load(content: &str) -> SourceIndex {
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

    fn shape_for(index: &SourceIndex, routine: &str) -> Option<ResponseShape> {
        let walker = Walker::new(index, TargetModules::new("svc", &[]), 32);
        let resolver = TypeResolver::new(index, 64);
        let mut cache = AnalysisCache::new();
        let sites = walker.walk(&RoutineRef::new("svc", routine), &mut cache);
        let site = sites.first()?;
        match resolver.resolve(&site.module, &site.type_ref) {
            Resolution::Resolved(resolved) => describe(&resolved, site, &resolver),
            Resolution::Unresolved => None,
        }
    }

    #[test]
    fn test_literal_detail_becomes_const() {
        let index = load(
            "from fastapi import HTTPException\n\
             \n\
             def handler():\n    \
             raise HTTPException(status_code=404, detail=\"User not found\")\n",
        );
        let shape = shape_for(&index, "handler").unwrap();
        assert_eq!(shape.status_code, 404);
        assert_eq!(shape.schema_name, "UserNotFoundSchema");
        match &shape.body {
            Body::Schema(schema) => {
                assert_eq!(schema["properties"]["detail"]["const"], "User not found");
            }
            Body::OpaqueString => panic!("expected structured body"),
        }
    }

    #[test]
    fn test_bare_error_type_is_opaque() {
        let index = load(
            "from fastapi import HTTPException\n\
             \n\
             class Bare(HTTPException):\n    \
             status_code = 418\n\
             \n\
             def handler():\n    \
             raise Bare()\n",
        );
        let shape = shape_for(&index, "handler").unwrap();
        assert_eq!(shape.status_code, 418);
        assert_eq!(shape.body, Body::OpaqueString);
        // The opaque marker still documents unstructured text
        let rendered = shape.body_schema();
        assert_eq!(rendered["properties"]["detail"]["type"], "string");
        assert!(rendered["properties"]["detail"].get("const").is_none());
    }

    #[test]
    fn test_declared_fields_bound_by_keyword_and_position() {
        let index = load(
            "from fastapi import HTTPException\n\
             \n\
             class NotEnoughBalance(HTTPException):\n    \
             \"\"\"Raised when the wallet runs dry\"\"\"\n    \
             status_code = 409\n    \
             user_id: int\n    \
             balance: float\n\
             \n\
             def handler():\n    \
             raise NotEnoughBalance(user_id=1, balance=0.5)\n",
        );
        let shape = shape_for(&index, "handler").unwrap();
        assert_eq!(shape.status_code, 409);
        assert_eq!(shape.schema_name, "NotEnoughBalanceSchema");
        assert_eq!(shape.description, "Raised when the wallet runs dry");
        match &shape.body {
            Body::Schema(schema) => {
                assert_eq!(schema["properties"]["user_id"]["type"], "integer");
                assert_eq!(schema["properties"]["user_id"]["const"], 1);
                assert_eq!(schema["properties"]["balance"]["type"], "number");
                assert_eq!(schema["required"], json!(["user_id", "balance"]));
            }
            Body::OpaqueString => panic!("expected structured body"),
        }
    }

    #[test]
    fn test_self_describing_schema_takes_precedence() {
        let index = load(
            "from fastapi import HTTPException\n\
             \n\
             class Teapot(HTTPException):\n    \
             status_code = 418\n    \
             kind: str\n    \
             openapi_schema = {\"type\": \"object\", \"properties\": {\"brew\": {\"type\": \"string\"}}}\n\
             \n\
             def handler():\n    \
             raise Teapot(kind=\"green\")\n",
        );
        let shape = shape_for(&index, "handler").unwrap();
        match &shape.body {
            Body::Schema(schema) => {
                // Declared verbatim, not derived from the kind field
                assert!(schema["properties"].get("brew").is_some());
                assert!(schema["properties"].get("kind").is_none());
            }
            Body::OpaqueString => panic!("expected structured body"),
        }
    }

    #[test]
    fn test_extra_arguments_are_ignored() {
        let index = load(
            "from fastapi import HTTPException\n\
             \n\
             class Narrow(HTTPException):\n    \
             status_code = 400\n    \
             code: int\n\
             \n\
             def handler():\n    \
             raise Narrow(code=7, mystery=\"ignored\")\n",
        );
        let shape = shape_for(&index, "handler").unwrap();
        match &shape.body {
            Body::Schema(schema) => {
                assert!(schema["properties"].get("mystery").is_none());
                assert_eq!(schema["properties"]["code"]["const"], 7);
            }
            Body::OpaqueString => panic!("expected structured body"),
        }
    }

    #[test]
    fn test_unresolvable_status_drops_the_shape() {
        let index = load(
            "from fastapi import HTTPException\n\
             \n\
             def handler(code):\n    \
             raise HTTPException(status_code=code, detail=\"dynamic\")\n",
        );
        assert!(shape_for(&index, "handler").is_none());
    }
}
