//! Execution engine
//!
//! [`ComputeRunner`] runs one compiled kernel against one bound resource
//! graph. The passes are strictly ordered:
//!
//! 1. allocate device memory for every eligible value
//! 2. patch every pointer slot with the final device addresses
//! 3. upload host bytes
//! 4. launch a single thread block and synchronize
//! 5. read back output entries
//! 6. release every allocation, then the stream, module and context
//!
//! Step 6 runs whether or not the earlier steps succeeded.

mod allocate;
mod driver;
mod patch;

use crate::backend::{ComputeBackend, ComputeContext};
use crate::config::{ExecutionConfig, StreamMode};
use crate::error::{ComputeError, Result};
use crate::graph::{DeviceTargets, ResourceGraph};
use crate::layout::{BindRoot, BoundEntry, BoundResources, CompiledProgram, ResourceLayout};
use crate::reflection::{EntryPointReflection, ProgramReflection};

/// Counters for one execution
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionStats {
    pub allocations: usize,
    pub patched_slots: usize,
    pub uploads: usize,
    pub downloads: usize,
}

/// Result of a successful execution
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    /// The graph with device results copied into its output values
    pub graph: ResourceGraph,
    pub entries: Vec<BoundEntry>,
    pub stats: ExecutionStats,
}

impl ExecutionOutcome {
    /// Host bytes of the value produced by input entry `index`
    pub fn entry_bytes(&self, index: usize) -> Option<&[u8]> {
        let id = self.entries.get(index)?.value?;
        self.graph.data(id)
    }
}

/// Runs compiled kernels on a [`ComputeBackend`]
pub struct ComputeRunner<B: ComputeBackend> {
    backend: B,
    config: ExecutionConfig,
}

impl<B: ComputeBackend> ComputeRunner<B> {
    pub fn new(backend: B, config: ExecutionConfig) -> Self {
        Self { backend, config }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    /// Whether the backend can create a context at all
    pub fn can_create_device(&self) -> bool {
        self.backend.can_create_device()
    }

    /// Bind `layout` and run the compute kernel of `program` against it
    pub fn execute(
        &self,
        program: &CompiledProgram,
        layout: &ResourceLayout,
    ) -> Result<ExecutionOutcome> {
        let Some(kernel) = program.compute_kernel() else {
            log::error!("Compiled program has no compute kernel");
            return Err(ComputeError::MissingComputeKernel);
        };
        driver::single_entry_point(&layout.reflection)?;

        let bound = BindRoot::new(&layout.reflection)?.bind(&layout.entries)?;
        self.run(&kernel.code, &layout.reflection, bound)
    }

    /// Run a kernel image against an already bound graph
    pub fn run(
        &self,
        kernel: &[u8],
        reflection: &ProgramReflection,
        bound: BoundResources,
    ) -> Result<ExecutionOutcome> {
        let entry_point = driver::single_entry_point(reflection)?;
        let BoundResources { mut graph, entries } = bound;

        let context = self.backend.acquire(self.config.device)?;
        log::info!(
            "Running '{}' on {} device {}",
            entry_point.name,
            self.backend.name(),
            context.device_ordinal()
        );

        let module = context.load_module(kernel)?;
        let function = context.get_function(&module, &entry_point.name)?;
        let stream = match self.config.stream {
            StreamMode::Dedicated => Some(context.create_stream()?),
            StreamMode::Default => None,
        };

        let mut targets = DeviceTargets::new(graph.len());
        let result = self.dispatch(
            &context,
            &function,
            stream.as_ref(),
            entry_point,
            &mut graph,
            &mut targets,
            &entries,
        );

        let released = targets.release_all();
        log::debug!("Released {} device allocation(s)", released);
        drop(stream);
        drop(function);
        drop(module);
        drop(context);

        let stats = result?;
        Ok(ExecutionOutcome {
            graph,
            entries,
            stats,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn dispatch<C: ComputeContext>(
        &self,
        context: &C,
        function: &C::Function,
        stream: Option<&C::Stream>,
        entry_point: &EntryPointReflection,
        graph: &mut ResourceGraph,
        targets: &mut DeviceTargets<C::Allocation>,
        entries: &[BoundEntry],
    ) -> Result<ExecutionStats> {
        let mut stats = ExecutionStats {
            allocations: allocate::allocate_all(
                context,
                graph,
                targets,
                self.config.strict_resources,
            )?,
            ..Default::default()
        };
        stats.patched_slots = patch::patch_all(graph, targets)?;
        stats.uploads = driver::upload_all(context, graph, targets)?;

        let args = driver::kernel_args::<C>(graph, targets);
        driver::launch(context, function, entry_point, args, stream)?;
        context.synchronize(stream)?;

        stats.downloads = driver::download_outputs(context, graph, targets, entries)?;
        Ok(stats)
    }
}
