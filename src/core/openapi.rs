use std::collections::HashSet;
use std::path::Path;
use serde_json::{json, Value};
use tracing::debug;

use crate::config::AnalysisConfig;
use crate::error::Result;
use super::analysis::{
    describe, AnalysisCache, Resolution, ResponseShape, TargetModules, TypeResolver, Walker,
};
use super::routes::RouteDescriptor;
use super::source::SourceIndex;

/// The response catalogue compiled for one route
#[derive(Debug, Clone)]
pub struct RouteResponses {
    pub path: String,
    pub methods: Vec<String>,
    pub shapes: Vec<ResponseShape>,
}

/// Compiles per-route response catalogues by walking every routine in
/// each route's dependency chain
pub struct Aggregator<'a> {
    walker: Walker<'a>,
    resolver: TypeResolver<'a>,
}

impl<'a> Aggregator<'a> {
    pub fn new(index: &'a SourceIndex, targets: TargetModules, config: &AnalysisConfig) -> Self {
        Self {
            walker: Walker::new(index, targets, config.max_walk_depth),
            resolver: TypeResolver::new(index, config.max_fold_steps),
        }
    }

    /// Compile all routes with a cache shared across the run, so a
    /// dependency used by many routes is walked exactly once
    pub fn compile(&self, routes: &[RouteDescriptor]) -> Vec<RouteResponses> {
        let mut cache = AnalysisCache::new();
        self.compile_with_cache(routes, &mut cache)
    }

    pub fn compile_with_cache(
        &self,
        routes: &[RouteDescriptor],
        cache: &mut AnalysisCache,
    ) -> Vec<RouteResponses> {
        routes
            .iter()
            .map(|route| self.compile_route(route, cache))
            .collect()
    }

    /// Walk one route's chain in order, resolve each raise site, and
    /// keep the first shape seen per status code
    fn compile_route(&self, route: &RouteDescriptor, cache: &mut AnalysisCache) -> RouteResponses {
        let mut shapes: Vec<ResponseShape> = Vec::new();
        let mut seen_statuses: HashSet<u16> = HashSet::new();

        for routine in &route.chain {
            let sites = self.walker.walk(routine, cache);
            for site in sites.iter() {
                let resolved = match self.resolver.resolve(&site.module, &site.type_ref) {
                    Resolution::Resolved(resolved) => resolved,
                    Resolution::Unresolved => {
                        debug!(
                            "Dropping unresolved raise at {}:{}",
                            site.module, site.line
                        );
                        continue;
                    }
                };
                let Some(shape) = describe(&resolved, site, &self.resolver) else {
                    debug!(
                        "No shape derivable for {} raised at {}:{}",
                        resolved.name, site.module, site.line
                    );
                    continue;
                };
                if seen_statuses.insert(shape.status_code) {
                    shapes.push(shape);
                }
            }
        }

        RouteResponses {
            path: route.path.clone(),
            methods: route.methods.clone(),
            shapes,
        }
    }
}

/// Synthesize a minimal OpenAPI baseline from the discovered routes,
/// standing in for the description the framework would generate
pub fn baseline(title: &str, routes: &[RouteDescriptor]) -> Value {
    let mut paths = serde_json::Map::new();
    for route in routes {
        let entry = paths
            .entry(route.path.clone())
            .or_insert_with(|| json!({}));
        if let Some(item) = entry.as_object_mut() {
            for method in &route.methods {
                item.insert(
                    method.clone(),
                    json!({
                        "responses": {
                            "200": {"description": "Successful Response"}
                        }
                    }),
                );
            }
        }
    }

    json!({
        "openapi": "3.1.0",
        "info": {"title": title, "version": "0.1.0"},
        "paths": paths
    })
}

/// Fold compiled response catalogues into an existing API description.
///
/// Strictly additive: declared responses are never replaced, routes
/// absent from the description are never invented, and re-merging an
/// already merged document changes nothing.
pub fn merge(description: &mut Value, compiled: &[RouteResponses]) {
    // Plan first: mutating components and paths in one pass would
    // fight the borrow on the paths table
    let mut planned: Vec<(String, String, &ResponseShape)> = Vec::new();

    for route in compiled {
        let Some(paths) = description.get("paths") else { continue };
        let Some(item) = paths.get(&route.path) else { continue };
        for method in &route.methods {
            if item.get(method).is_none() {
                continue;
            }
            for shape in &route.shapes {
                planned.push((route.path.clone(), method.clone(), shape));
            }
        }
    }

    for (_, _, shape) in &planned {
        register_component(description, shape);
    }

    for (path, method, shape) in planned {
        let Some(operation) = description
            .get_mut("paths")
            .and_then(|paths| paths.get_mut(&path))
            .and_then(|item| item.get_mut(&method))
            .and_then(|op| op.as_object_mut())
        else {
            continue;
        };

        let responses = operation
            .entry("responses".to_string())
            .or_insert_with(|| json!({}));
        let Some(responses) = responses.as_object_mut() else { continue };

        let status = shape.status_code.to_string();
        let reference = json!({"$ref": format!("#/components/schemas/{}", shape.schema_name)});

        match responses.get_mut(&status) {
            None => {
                responses.insert(
                    status,
                    json!({
                        "description": shape.description,
                        "content": {
                            "application/json": {"schema": reference}
                        }
                    }),
                );
            }
            Some(existing) => {
                // Extend the declared response with a union instead of
                // replacing it; skip references already present
                let Some(slot) = existing
                    .get_mut("content")
                    .and_then(|c| c.get_mut("application/json"))
                    .and_then(|media| media.get_mut("schema"))
                else {
                    continue;
                };
                if slot == &reference {
                    continue;
                }
                match slot.get_mut("anyOf").and_then(|a| a.as_array_mut()) {
                    Some(union) => {
                        if !union.iter().any(|entry| entry == &reference) {
                            union.push(reference);
                        }
                    }
                    None => {
                        let current = slot.clone();
                        *slot = json!({"anyOf": [current, reference]});
                    }
                }
            }
        }
    }
}

/// Insert a shape's schema into the component registry unless a schema
/// of that name is already declared
fn register_component(description: &mut Value, shape: &ResponseShape) {
    let Some(root) = description.as_object_mut() else { return };
    let components = root
        .entry("components".to_string())
        .or_insert_with(|| json!({}));
    let Some(components) = components.as_object_mut() else { return };
    let schemas = components
        .entry("schemas".to_string())
        .or_insert_with(|| json!({}));
    let Some(schemas) = schemas.as_object_mut() else { return };
    if !schemas.contains_key(&shape.schema_name) {
        schemas.insert(shape.schema_name.clone(), shape.body_schema());
    }
}

/// Serialize the augmented description to its artifact file.
///
/// Output is deterministic: object keys are ordered, so compiling the
/// same sources twice produces identical bytes.
pub fn write_artifact<P: AsRef<Path>>(path: P, description: &Value, pretty: bool) -> Result<()> {
    let rendered = if pretty {
        serde_json::to_string_pretty(description)?
    } else {
        serde_json::to_string(description)?
    };
    std::fs::write(path, rendered + "\n")?;
    Ok(())
}

/// Read a previously compiled artifact; serving processes substitute
/// this for the framework's own description generation
pub fn load_artifact<P: AsRef<Path>>(path: P) -> Result<Value> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::analysis::Body;
    use crate::core::routes::{discover, AppRef};

    fn config() -> AnalysisConfig {
        AnalysisConfig {
            target_modules: vec![],
            max_walk_depth: 32,
            max_fold_steps: 64,
            max_file_size: 1024 * 1024,
        }
    }

    fn compile_app(content: &str) -> (Vec<RouteDescriptor>, Vec<RouteResponses>) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("main.py"), content).unwrap();
        let index = SourceIndex::load(dir.path(), &config()).unwrap();
        let app_ref = AppRef::parse("main:app").unwrap();
        let routes = discover(&index, &app_ref).unwrap();
        let aggregator = Aggregator::new(&index, TargetModules::new("main", &[]), &config());
        let compiled = aggregator.compile(&routes);
        (routes, compiled)
    }

    #[test]
    fn test_statuses_deduplicated_first_wins() {
        let (_, compiled) = compile_app(
            "from fastapi import FastAPI, HTTPException\n\
             \n\
             app = FastAPI()\n\
             \n\
             @app.get(\"/items\")\n\
             def read_items(flag: int):\n    \
             if flag == 1:\n        \
             raise HTTPException(status_code=400, detail=\"first shape\")\n    \
             raise HTTPException(status_code=400, detail=\"second shape\")\n",
        );
        assert_eq!(compiled.len(), 1);
        assert_eq!(compiled[0].shapes.len(), 1);
        assert_eq!(compiled[0].shapes[0].description, "first shape");
    }

    #[test]
    fn test_handler_shape_wins_over_dependency() {
        let (_, compiled) = compile_app(
            "from fastapi import Depends, FastAPI, HTTPException\n\
             \n\
             app = FastAPI()\n\
             \n\
             def guard():\n    \
             raise HTTPException(status_code=400, detail=\"from dependency\")\n\
             \n\
             @app.get(\"/items\")\n\
             def read_items(user=Depends(guard)):\n    \
             raise HTTPException(status_code=400, detail=\"from handler\")\n",
        );
        assert_eq!(compiled[0].shapes.len(), 1);
        assert_eq!(compiled[0].shapes[0].description, "from handler");
    }

    #[test]
    fn test_dependency_statuses_reach_the_route() {
        let (_, compiled) = compile_app(
            "from fastapi import Depends, FastAPI, HTTPException\n\
             \n\
             app = FastAPI()\n\
             \n\
             def get_session():\n\
                 raise HTTPException(status_code=401, detail=\"no session\")\n\
             \n\
             def get_user(session=Depends(get_session)):\n\
                 raise HTTPException(status_code=403, detail=\"no access\")\n\
             \n\
             @app.get(\"/me\")\n\
             def read_me(user=Depends(get_user)):\n\
                 raise HTTPException(status_code=404, detail=\"no user\")\n",
        );
        let mut statuses: Vec<u16> = compiled[0].shapes.iter().map(|s| s.status_code).collect();
        statuses.sort_unstable();
        assert_eq!(statuses, vec![401, 403, 404]);
    }

    #[test]
    fn test_merge_is_additive_and_idempotent() {
        let (routes, compiled) = compile_app(
            "from fastapi import FastAPI, HTTPException\n\
             \n\
             app = FastAPI()\n\
             \n\
             @app.get(\"/items\")\n\
             def read_items():\n\
                 raise HTTPException(status_code=404, detail=\"Item not found\")\n",
        );

        let mut description = baseline("test", &routes);
        merge(&mut description, &compiled);

        let responses = &description["paths"]["/items"]["get"]["responses"];
        assert_eq!(responses["200"]["description"], "Successful Response");
        assert_eq!(
            responses["404"]["content"]["application/json"]["schema"]["$ref"],
            "#/components/schemas/ItemNotFoundSchema"
        );
        assert_eq!(
            description["components"]["schemas"]["ItemNotFoundSchema"]["properties"]["detail"]
                ["const"],
            "Item not found"
        );

        // Merging again must not change a byte
        let first = serde_json::to_string_pretty(&description).unwrap();
        merge(&mut description, &compiled);
        let second = serde_json::to_string_pretty(&description).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_merge_never_invents_routes() {
        let (_, compiled) = compile_app(
            "from fastapi import FastAPI, HTTPException\n\
             \n\
             app = FastAPI()\n\
             \n\
             @app.get(\"/items\")\n\
             def read_items():\n\
                 raise HTTPException(status_code=404, detail=\"missing\")\n",
        );

        let mut description = json!({
            "openapi": "3.1.0",
            "info": {"title": "existing", "version": "1.0"},
            "paths": {}
        });
        merge(&mut description, &compiled);
        assert!(description["paths"].as_object().unwrap().is_empty());
        assert!(description.get("components").is_none());
    }

    #[test]
    fn test_merge_unions_with_declared_response() {
        let (routes, compiled) = compile_app(
            "from fastapi import FastAPI, HTTPException\n\
             \n\
             app = FastAPI()\n\
             \n\
             @app.get(\"/items\")\n\
             def read_items():\n\
                 raise HTTPException(status_code=404, detail=\"Item not found\")\n",
        );

        let mut description = baseline("test", &routes);
        description["paths"]["/items"]["get"]["responses"]["404"] = json!({
            "description": "declared by hand",
            "content": {"application/json": {"schema": {"$ref": "#/components/schemas/Handwritten"}}}
        });

        merge(&mut description, &compiled);
        let schema =
            &description["paths"]["/items"]["get"]["responses"]["404"]["content"]["application/json"]["schema"];
        let union = schema["anyOf"].as_array().unwrap();
        assert_eq!(union.len(), 2);
        assert_eq!(union[0]["$ref"], "#/components/schemas/Handwritten");
        assert_eq!(union[1]["$ref"], "#/components/schemas/ItemNotFoundSchema");
        // The declared description text is untouched
        assert_eq!(
            description["paths"]["/items"]["get"]["responses"]["404"]["description"],
            "declared by hand"
        );
    }

    #[test]
    fn test_shared_dependency_walked_once_across_routes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("main.py"),
            "from fastapi import Depends, FastAPI, HTTPException\n\
             \n\
             app = FastAPI()\n\
             \n\
             def shared_guard():\n\
                 raise HTTPException(status_code=401, detail=\"auth required\")\n\
             \n\
             @app.get(\"/a\")\n\
             def read_a(dep=Depends(shared_guard)):\n\
                 return {}\n\
             \n\
             @app.get(\"/b\")\n\
             def read_b(dep=Depends(shared_guard)):\n\
                 return {}\n",
        )
        .unwrap();
        let index = SourceIndex::load(dir.path(), &config()).unwrap();
        let app_ref = AppRef::parse("main:app").unwrap();
        let routes = discover(&index, &app_ref).unwrap();
        let aggregator = Aggregator::new(&index, TargetModules::new("main", &[]), &config());

        let mut cache = AnalysisCache::new();
        let compiled = aggregator.compile_with_cache(&routes, &mut cache);

        assert_eq!(compiled.len(), 2);
        assert_eq!(compiled[0].shapes[0].status_code, 401);
        assert_eq!(compiled[1].shapes[0].status_code, 401);
        // read_a, read_b, shared_guard: three walks, not four
        assert_eq!(cache.walks(), 3);
    }

    #[test]
    fn test_runtime_only_raise_is_omitted() {
        let (_, compiled) = compile_app(
            "import random\n\
             from fastapi import FastAPI, HTTPException\n\
             \n\
             app = FastAPI()\n\
             \n\
             def pick_one():\n\
                 return RuntimeError(\"?\")\n\
             \n\
             @app.get(\"/maybe\")\n\
             def maybe():\n\
                 v = pick_one()\n\
                 raise v\n",
        );
        assert!(compiled[0].shapes.is_empty());
    }

    #[test]
    fn test_opaque_body_renders_as_unstructured_text() {
        let (routes, compiled) = compile_app(
            "from fastapi import FastAPI, HTTPException\n\
             \n\
             app = FastAPI()\n\
             \n\
             class Bare(HTTPException):\n\
                 status_code = 418\n\
             \n\
             @app.get(\"/tea\")\n\
             def brew():\n\
                 raise Bare()\n",
        );
        assert_eq!(compiled[0].shapes[0].body, Body::OpaqueString);

        let mut description = baseline("test", &routes);
        merge(&mut description, &compiled);
        assert_eq!(
            description["components"]["schemas"]["BareErrorSchema"]["properties"]["detail"]
                ["type"],
            "string"
        );
    }
}
