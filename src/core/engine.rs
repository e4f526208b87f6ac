use std::path::{Path, PathBuf};
use anyhow::Result;
use tracing::{debug, info};

use crate::config::Config;
use super::analysis::TargetModules;
use super::openapi::{self, Aggregator, RouteResponses};
use super::routes::{self, AppRef, RouteDescriptor};
use super::source::SourceIndex;

/// Main orchestration engine: indexes the service's sources, discovers
/// its routes, compiles the per-route response catalogue, and folds it
/// into the API description
pub struct Engine {
    config: Config,
}

impl Engine {
    pub fn new(config_path: Option<&Path>) -> Result<Self> {
        let config = Config::load_or_default(config_path)?;
        debug!("Loaded configuration: {:?}", config);
        Ok(Self { config })
    }

    /// Compile the augmented OpenAPI artifact
    pub async fn compile(
        &mut self,
        app_reference: &str,
        target: Option<PathBuf>,
        source: Option<PathBuf>,
        openapi_path: Option<PathBuf>,
        extra_modules: Vec<String>,
    ) -> Result<()> {
        let (app_ref, route_table, compiled, title) =
            self.analyze(app_reference, source, extra_modules)?;

        let mut description = match openapi_path {
            Some(path) => {
                info!("Augmenting existing description {}", path.display());
                openapi::load_artifact(&path)?
            }
            None => openapi::baseline(&title, &route_table),
        };

        openapi::merge(&mut description, &compiled);

        let target = target.unwrap_or_else(|| self.config.output.artifact_path.clone());
        openapi::write_artifact(&target, &description, self.config.output.pretty)?;

        let documented: usize = compiled.iter().map(|route| route.shapes.len()).sum();
        info!(
            "Compiled {} routes from {}:{}, {} documented error responses",
            route_table.len(),
            app_ref.module,
            app_ref.attribute,
            documented
        );
        info!("Artifact written to {}", target.display());
        Ok(())
    }

    /// List discovered routes and their resolved responses without
    /// writing anything
    pub async fn routes(
        &mut self,
        app_reference: &str,
        source: Option<PathBuf>,
        extra_modules: Vec<String>,
    ) -> Result<()> {
        let (_, route_table, compiled, _) = self.analyze(app_reference, source, extra_modules)?;

        for (route, responses) in route_table.iter().zip(compiled.iter()) {
            let methods = route.methods.join(",").to_uppercase();
            println!("{} {}", methods, route.path);
            for routine in &route.chain {
                println!("    <- {}", routine.display_name());
            }
            for shape in &responses.shapes {
                println!("    {} {}", shape.status_code, shape.description);
            }
        }
        Ok(())
    }

    fn analyze(
        &self,
        app_reference: &str,
        source: Option<PathBuf>,
        extra_modules: Vec<String>,
    ) -> Result<(AppRef, Vec<RouteDescriptor>, Vec<RouteResponses>, String)> {
        let app_ref = AppRef::parse(app_reference)?;
        let source_dir = source.unwrap_or_else(|| self.config.project.source_dir.clone());

        info!("Indexing sources under {}", source_dir.display());
        let index = SourceIndex::load(&source_dir, &self.config.analysis)?;
        info!("Indexed {} modules", index.len());

        let route_table = routes::discover(&index, &app_ref)?;
        info!("Discovered {} routes", route_table.len());

        let mut module_prefixes = self.config.analysis.target_modules.clone();
        module_prefixes.extend(extra_modules);
        let targets = TargetModules::new(&app_ref.module, &module_prefixes);

        let aggregator = Aggregator::new(&index, targets, &self.config.analysis);
        let compiled = aggregator.compile(&route_table);

        let title = routes::app_title(&index, &app_ref);
        Ok((app_ref, route_table, compiled, title))
    }
}
