mod engine;
mod python;
mod source;
mod routes;
mod openapi;

// Static analysis of routine bodies
mod analysis;

pub use python::{PyExpr, PythonParser};
pub use source::{ClassDecl, FieldDecl, FunctionDecl, ModuleSource, ParamDecl, SourceIndex};
pub use routes::{app_title, discover, AppRef, RouteDescriptor};
pub use openapi::{baseline, load_artifact, merge, write_artifact, Aggregator, RouteResponses};

pub use analysis::{
    AnalysisCache, Bindings, Body, Callable, RaiseSite, Resolution, ResolvedErrorType,
    ResponseShape, RoutineId, RoutineRef, TargetModules, TypeResolver, Walker,
};

// Export the main engine
pub use engine::Engine;
