use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Context;
use tracing::{info, info_span};

use crate::backend::annotations::CompilerAnnotations;
use crate::backend::error::CompileError;
use crate::backend::fusion::FusionRegistry;
use crate::backend::module::Module;
use crate::backend::passes::{
    ClusteringConfig, DeadCodeElimination, GradientAccumulationFuser, HostComputeBarrierInserter,
    MultiUpdateCombiner, OffloadConfig, OutlineRemoteBuffers, RemoteParameterParallelCombiner,
    ResourceUpdateElementwiseClustering, ResourceUpdateVariablesOffload, SingleOpFusion,
};

/// A whole-module rewrite. Returns whether the module changed.
pub trait ModulePass: Send + Sync {
    fn name(&self) -> &'static str;

    fn run(
        &self,
        module: &mut Module,
        annotations: &mut CompilerAnnotations,
    ) -> Result<bool, CompileError>;
}

pub enum Step {
    Pass(Arc<dyn ModulePass>),
    FixedPoint { max_iters: usize, steps: Vec<Step> },
}

pub struct PipelineBuilder {
    steps: Vec<Step>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self { steps: Vec::new() }
    }

    pub fn pass(&mut self, pass: Arc<dyn ModulePass>) {
        self.steps.push(Step::Pass(pass));
    }

    pub fn fixed_point<F>(&mut self, max_iters: usize, build: F)
    where
        F: FnOnce(&mut PipelineBuilder),
    {
        let mut inner = PipelineBuilder::new();
        build(&mut inner);
        self.steps.push(Step::FixedPoint {
            max_iters: max_iters.max(1),
            steps: inner.steps,
        });
    }

    pub fn finish(self) -> PassPipeline {
        PassPipeline {
            steps: self.steps,
            log_stats: crate::env::pass_stats_enabled(),
            verify: crate::env::verify_passes_enabled(),
        }
    }
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassStats {
    pub runs: usize,
    pub changed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub passes: BTreeMap<&'static str, PassStats>,
    /// Iterations run by all fixed-point groups together.
    pub fixed_point_iterations: usize,
}

impl PipelineStats {
    fn record(&mut self, name: &'static str, changed: bool) {
        let entry = self.passes.entry(name).or_default();
        entry.runs += 1;
        entry.changed += usize::from(changed);
    }

    pub fn pass(&self, name: &str) -> Option<PassStats> {
        self.passes.get(name).copied()
    }

    pub fn changed(&self) -> bool {
        self.passes.values().any(|s| s.changed > 0)
    }
}

pub struct PassPipeline {
    steps: Vec<Step>,
    log_stats: bool,
    verify: bool,
}

impl PassPipeline {
    /// Forces module verification after every pass, whatever the environment says.
    pub fn with_verification(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    /// Pass names in execution order, each fixed-point group listed once.
    pub fn pass_names(&self) -> Vec<&'static str> {
        fn collect(steps: &[Step], out: &mut Vec<&'static str>) {
            for step in steps {
                match step {
                    Step::Pass(pass) => out.push(pass.name()),
                    Step::FixedPoint { steps, .. } => collect(steps, out),
                }
            }
        }
        let mut out = Vec::new();
        collect(&self.steps, &mut out);
        out
    }

    /// Runs every step in order and stops at the first failing pass.
    pub fn run(
        &self,
        module: &mut Module,
        annotations: &mut CompilerAnnotations,
    ) -> anyhow::Result<PipelineStats> {
        let _span = info_span!("pass_pipeline", module = module.name()).entered();
        let mut stats = PipelineStats::default();
        self.run_steps(&self.steps, module, annotations, &mut stats)?;
        Ok(stats)
    }

    fn run_steps(
        &self,
        steps: &[Step],
        module: &mut Module,
        annotations: &mut CompilerAnnotations,
        stats: &mut PipelineStats,
    ) -> anyhow::Result<bool> {
        let mut changed_any = false;
        for step in steps {
            match step {
                Step::Pass(pass) => {
                    let changed = pass
                        .run(module, annotations)
                        .with_context(|| format!("pass `{}` failed", pass.name()))?;
                    if self.verify {
                        module
                            .verify()
                            .with_context(|| format!("module invalid after `{}`", pass.name()))?;
                    }
                    stats.record(pass.name(), changed);
                    if self.log_stats {
                        info!(pass = pass.name(), changed, "pass finished");
                    }
                    changed_any |= changed;
                }
                Step::FixedPoint { max_iters, steps } => {
                    let mut iter = 0usize;
                    loop {
                        if iter >= *max_iters {
                            break;
                        }
                        iter += 1;
                        stats.fixed_point_iterations += 1;
                        let changed = self.run_steps(steps, module, annotations, stats)?;
                        changed_any |= changed;
                        if !changed {
                            break;
                        }
                    }
                }
            }
        }
        Ok(changed_any)
    }
}

/// Options of [`default_pipeline`].
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub offload: OffloadConfig,
    pub clustering: ClusteringConfig,
    pub fusions: FusionRegistry,
    /// Overrides `XPURS_PASS_MAX_ITERS` for the matcher group.
    pub max_iters: Option<usize>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::replicated(1)
    }
}

impl PipelineConfig {
    /// Builtin fusions, with offload and clustering sharing one replication factor.
    pub fn replicated(replication_factor: usize) -> Self {
        Self {
            offload: OffloadConfig {
                replication_factor,
                ..OffloadConfig::default()
            },
            clustering: ClusteringConfig {
                replication_factor,
                ..ClusteringConfig::default()
            },
            fusions: FusionRegistry::with_builtin_fusions(),
            max_iters: None,
        }
    }
}

/// The compile order: instruction combining, variable offload, clustering, remote
/// buffer outlining, load/store combining and scheduling, barriers, cleanup.
pub fn default_pipeline(config: &PipelineConfig) -> PassPipeline {
    let mut builder = PipelineBuilder::new();
    let max_iters = config.max_iters.unwrap_or_else(crate::env::pass_max_iters);

    builder.fixed_point(max_iters, |p| {
        p.pass(Arc::new(GradientAccumulationFuser::default()));
        p.pass(Arc::new(MultiUpdateCombiner::default()));
        p.pass(Arc::new(SingleOpFusion::new(&config.fusions)));
    });
    builder.pass(Arc::new(ResourceUpdateVariablesOffload::new(config.offload)));
    builder.pass(Arc::new(ResourceUpdateElementwiseClustering::new(
        config.clustering,
    )));
    builder.pass(Arc::new(OutlineRemoteBuffers::new()));
    builder.pass(Arc::new(RemoteParameterParallelCombiner::new()));
    builder.pass(Arc::new(HostComputeBarrierInserter::new()));
    builder.pass(Arc::new(DeadCodeElimination::new()));
    builder.finish()
}
