use std::path::Path;

use serde::Serialize;
use tracing::debug;

use crate::manifest::{Manifest, Pipeline};

/// Outcome of one executor invocation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RenderStatus {
    pub mutated: bool,
    pub functions_run: usize,
}

impl RenderStatus {
    fn merge(self, other: RenderStatus) -> RenderStatus {
        RenderStatus {
            mutated: self.mutated || other.mutated,
            functions_run: self.functions_run + other.functions_run,
        }
    }
}

/// The function-evaluation collaborator. The engine never interprets
/// function images or exec lines; it only hands the declared pipeline and
/// the package directory to an executor and trusts it to mutate in place.
#[cfg_attr(test, mockall::automock)]
pub trait PipelineExecutor {
    fn execute(&self, pipeline: &Pipeline, pkg_dir: &Path) -> anyhow::Result<RenderStatus>;
}

/// Executor for contexts with no function runtime: runs nothing, reports
/// nothing mutated.
pub struct NoopExecutor;

impl PipelineExecutor for NoopExecutor {
    fn execute(&self, pipeline: &Pipeline, pkg_dir: &Path) -> anyhow::Result<RenderStatus> {
        debug!(
            package = %pkg_dir.display(),
            mutators = pipeline.mutators.len(),
            validators = pipeline.validators.len(),
            "no function runtime configured, skipping pipeline"
        );
        Ok(RenderStatus::default())
    }
}

/// Runs the manifest's pipeline through `executor` in declared order, with
/// all mutators completing before any validator runs.
pub fn render(
    executor: &dyn PipelineExecutor,
    manifest: &Manifest,
    pkg_dir: &Path,
) -> anyhow::Result<RenderStatus> {
    let Some(pipeline) = manifest.pipeline() else {
        return Ok(RenderStatus::default());
    };
    let mutators = Pipeline {
        mutators: pipeline.mutators.clone(),
        validators: Vec::new(),
    };
    let validators = Pipeline {
        mutators: Vec::new(),
        validators: pipeline.validators.clone(),
    };
    let mut status = RenderStatus::default();
    if !mutators.is_empty() {
        status = status.merge(executor.execute(&mutators, pkg_dir)?);
    }
    if !validators.is_empty() {
        status = status.merge(executor.execute(&validators, pkg_dir)?);
    }
    Ok(status)
}

#[cfg(test)]
mod tests {
    use mockall::Sequence;

    use super::*;
    use crate::manifest::Function;

    fn manifest_with_pipeline() -> Manifest {
        let mut manifest = Manifest::new("pkg");
        manifest.pipeline = Some(Pipeline {
            mutators: vec![Function {
                image: Some("gcr.io/fn/set-labels:v0.1".to_string()),
                ..Default::default()
            }],
            validators: vec![Function {
                image: Some("gcr.io/fn/kubeval:v0.3".to_string()),
                ..Default::default()
            }],
        });
        manifest
    }

    #[test]
    fn test_render_runs_mutators_before_validators() {
        let manifest = manifest_with_pipeline();
        let mut executor = MockPipelineExecutor::new();
        let mut order = Sequence::new();
        executor
            .expect_execute()
            .withf(|pipeline, _| pipeline.validators.is_empty() && pipeline.mutators.len() == 1)
            .times(1)
            .in_sequence(&mut order)
            .returning(|_, _| {
                Ok(RenderStatus {
                    mutated: true,
                    functions_run: 1,
                })
            });
        executor
            .expect_execute()
            .withf(|pipeline, _| pipeline.mutators.is_empty() && pipeline.validators.len() == 1)
            .times(1)
            .in_sequence(&mut order)
            .returning(|_, _| {
                Ok(RenderStatus {
                    mutated: false,
                    functions_run: 1,
                })
            });

        let status = render(&executor, &manifest, Path::new(".")).unwrap();
        assert_eq!(
            status,
            RenderStatus {
                mutated: true,
                functions_run: 2,
            }
        );
    }

    #[test]
    fn test_render_without_pipeline_is_a_noop() {
        let executor = MockPipelineExecutor::new();
        let status = render(&executor, &Manifest::new("pkg"), Path::new(".")).unwrap();
        assert_eq!(status, RenderStatus::default());
    }
}
