//! Graph arena and the push-based pass drivers.
//!
//! The graph owns every module; peers are addressed by
//! `(module, slot)` pairs ([`InputRef`], [`OutputRef`]) instead of
//! pointers, so modules never dangle and never need to move. Handles
//! returned by [`Graph::add`] are typed ([`ModuleRef<M>`]) and carry the
//! axis-named port accessors of the concrete module.
//!
//! Both passes are cooperative and single-threaded. A port operation
//! reports which modules became ready; the driver drains a FIFO
//! worklist until the wave dies out:
//!
//! - forward: a module fires exactly once, when the last of its inputs
//!   arrives; each output then feeds its consumers in registration
//!   order.
//! - reverse: adjoints sum into each output's accumulator; a module
//!   fires once every one of its output ports has heard from all of its
//!   consumers. Outputs without consumers are trivially ready, which is
//!   what lets unconsumed terminal ports coexist with the protocol.
//!
//! The worklist realisation is observably identical to a recursive one
//! because fan-in accumulation is an elementwise sum.

mod module;
mod port;

pub use module::{BackpropPorts, Module, PortValues};
pub(crate) use port::{InPort, OutPort};

use std::any::Any;
use std::collections::VecDeque;
use std::marker::PhantomData;

use crate::error::GraphError;
use crate::matrix::Matrix;

/// Identifier of a module inside a [`Graph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleId(pub(crate) usize);

impl ModuleId {
    /// Arena index of the module.
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Address of one input port: an owning module and a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InputRef {
    pub(crate) module: ModuleId,
    pub(crate) slot: usize,
}

/// Address of one output port: an owning module and a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OutputRef {
    pub(crate) module: ModuleId,
    pub(crate) slot: usize,
}

/// Typed handle to a module added to a graph.
///
/// The handle is `Copy` and stays valid for the graph's lifetime.
/// Concrete module types attach their named port accessors to it
/// (`x_in()`, `s_out()`, ...).
#[derive(Debug)]
pub struct ModuleRef<M> {
    id: ModuleId,
    _marker: PhantomData<fn() -> M>,
}

impl<M> Clone for ModuleRef<M> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<M> Copy for ModuleRef<M> {}

impl<M> ModuleRef<M> {
    /// Untyped module identifier.
    pub fn id(&self) -> ModuleId {
        self.id
    }

    /// Input port at a raw slot index.
    pub fn nth_input(&self, slot: usize) -> InputRef {
        InputRef {
            module: self.id,
            slot,
        }
    }

    /// Output port at a raw slot index.
    pub fn nth_output(&self, slot: usize) -> OutputRef {
        OutputRef {
            module: self.id,
            slot,
        }
    }
}

struct Entry {
    module: Box<dyn Module>,
    inputs: Vec<InPort>,
    outputs: Vec<OutPort>,
}

enum Invalidation {
    Module(ModuleId),
    In(InputRef),
    Out(OutputRef),
}

/// Arena of modules plus the dataflow protocol between their ports.
#[derive(Default)]
pub struct Graph {
    entries: Vec<Entry>,
}

impl Graph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of modules in the graph.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the graph holds no modules.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Add a module, allocating its declared ports.
    pub fn add<M: Module>(&mut self, module: M) -> ModuleRef<M> {
        let id = ModuleId(self.entries.len());
        let inputs = (0..module.input_count()).map(|_| InPort::default()).collect();
        let outputs = (0..module.output_count())
            .map(|_| OutPort::default())
            .collect();
        self.entries.push(Entry {
            module: Box::new(module),
            inputs,
            outputs,
        });
        ModuleRef {
            id,
            _marker: PhantomData,
        }
    }

    /// Borrow the concrete module behind a handle.
    pub fn module<M: Module>(&self, handle: ModuleRef<M>) -> &M {
        let module: &dyn Module = self.entries[handle.id.0].module.as_ref();
        let any: &dyn Any = module;
        any.downcast_ref::<M>()
            .expect("module type does not match handle")
    }

    /// Reconfigure a module and invalidate it, so stale cached values
    /// cannot leak into the next pass.
    pub fn configure<M: Module, R>(
        &mut self,
        handle: ModuleRef<M>,
        f: impl FnOnce(&mut M) -> R,
    ) -> R {
        let out = {
            let module: &mut dyn Module = self.entries[handle.id.0].module.as_mut();
            let any: &mut dyn Any = module;
            f(any
                .downcast_mut::<M>()
                .expect("module type does not match handle"))
        };
        self.invalidate(handle.id);
        out
    }

    /// Grow one extra input slot on a dynamic-arity module.
    pub fn grow_input(&mut self, module: ModuleId) -> InputRef {
        let entry = &mut self.entries[module.0];
        let slot = entry.inputs.len();
        entry.inputs.push(InPort::default());
        InputRef { module, slot }
    }

    /// Grow an input slot and link it to a source in one step.
    pub fn attach_source(&mut self, module: ModuleId, from: OutputRef) -> InputRef {
        let input = self.grow_input(module);
        self.link(from, input);
        input
    }

    /// Link an output port to an input port, registering both peers.
    ///
    /// An input has at most one source; a previous link on the input is
    /// detached first.
    pub fn link(&mut self, from: OutputRef, to: InputRef) {
        if let Some(old) = self.entries[to.module.0].inputs[to.slot].source {
            let consumers = &mut self.entries[old.module.0].outputs[old.slot].consumers;
            if let Some(at) = consumers.iter().position(|c| *c == to) {
                consumers.remove(at);
            }
        }
        self.entries[to.module.0].inputs[to.slot].source = Some(from);
        self.entries[from.module.0].outputs[from.slot].consumers.push(to);
    }

    /// Remove the link between an output and an input, unregistering
    /// both peers.
    pub fn unlink(&mut self, from: OutputRef, to: InputRef) -> Result<(), GraphError> {
        let input = &mut self.entries[to.module.0].inputs[to.slot];
        if input.source != Some(from) {
            return Err(GraphError::UnregisterMissing);
        }
        input.source = None;

        let consumers = &mut self.entries[from.module.0].outputs[from.slot].consumers;
        let at = consumers
            .iter()
            .position(|c| *c == to)
            .ok_or(GraphError::UnregisterMissing)?;
        consumers.remove(at);
        Ok(())
    }

    /// The cached forward value of an input port.
    pub fn input_value(&self, port: InputRef) -> Result<&Matrix, GraphError> {
        self.entries[port.module.0].inputs[port.slot]
            .value
            .as_ref()
            .ok_or(GraphError::UseOfInvalid)
    }

    /// The cached forward value of an output port.
    pub fn output_value(&self, port: OutputRef) -> Result<&Matrix, GraphError> {
        self.entries[port.module.0].outputs[port.slot]
            .value
            .as_ref()
            .ok_or(GraphError::UseOfInvalid)
    }

    /// The adjoint accumulator of an output port, if any adjoint
    /// arrived during the current reverse pass.
    pub fn accumulator(&self, port: OutputRef) -> Option<&Matrix> {
        self.entries[port.module.0].outputs[port.slot]
            .accumulator
            .as_ref()
    }

    /// Whether an input port holds a forward value.
    pub fn input_valid(&self, port: InputRef) -> bool {
        self.entries[port.module.0].inputs[port.slot].valid()
    }

    /// Whether an output port holds a forward value.
    pub fn output_valid(&self, port: OutputRef) -> bool {
        self.entries[port.module.0].outputs[port.slot].valid()
    }

    /// Number of consumers registered on an output port.
    pub fn num_consumers(&self, port: OutputRef) -> usize {
        self.entries[port.module.0].outputs[port.slot].consumers.len()
    }

    /// Whether an output port has heard from every consumer.
    pub fn backprop_ready(&self, port: OutputRef) -> bool {
        self.entries[port.module.0].outputs[port.slot].backprop_ready()
    }

    /// Whether every input port of a module is valid.
    pub fn fully_valid(&self, module: ModuleId) -> bool {
        self.entries[module.0].inputs.iter().all(InPort::valid)
    }

    /// Whether every port of a module is invalid.
    pub fn fully_invalid(&self, module: ModuleId) -> bool {
        let entry = &self.entries[module.0];
        entry.inputs.iter().all(|p| !p.valid()) && entry.outputs.iter().all(|p| !p.valid())
    }

    /// Fire a module's forward computation and push the wave as far as
    /// it reaches. Used on source modules; everything downstream runs
    /// automatically as its last input arrives.
    pub fn foreprop(&mut self, module: ModuleId) -> Result<(), GraphError> {
        let mut ready = VecDeque::new();
        ready.push_back(module);
        self.drive_foreprop(ready)
    }

    /// Push one adjoint into an input port and drive the reverse wave
    /// to completion. With no source on the port the adjoint is
    /// discarded.
    pub fn backprop_input(&mut self, port: InputRef, dodx: Matrix) -> Result<(), GraphError> {
        let mut ready = VecDeque::new();
        let Some(source) = self.entries[port.module.0].inputs[port.slot].source else {
            return Ok(());
        };
        self.accumulate_at(source, dodx, &mut ready)?;
        self.drive_backprop(ready)
    }

    /// Invalidate every port reachable from a module, clearing cached
    /// values and adjoint accumulators. Idempotent.
    pub fn invalidate(&mut self, module: ModuleId) {
        let mut work = vec![Invalidation::Module(module)];
        while let Some(item) = work.pop() {
            match item {
                Invalidation::Module(id) => {
                    if self.fully_invalid(id) {
                        continue;
                    }
                    let entry = &self.entries[id.0];
                    for slot in 0..entry.inputs.len() {
                        work.push(Invalidation::In(InputRef { module: id, slot }));
                    }
                    for slot in 0..entry.outputs.len() {
                        work.push(Invalidation::Out(OutputRef { module: id, slot }));
                    }
                }
                Invalidation::In(port) => {
                    let state = &mut self.entries[port.module.0].inputs[port.slot];
                    if !state.valid() {
                        continue;
                    }
                    state.value = None;
                    let source = state.source;
                    work.push(Invalidation::Module(port.module));
                    if let Some(source) = source {
                        work.push(Invalidation::Out(source));
                    }
                }
                Invalidation::Out(port) => {
                    let state = &mut self.entries[port.module.0].outputs[port.slot];
                    if !state.valid() {
                        continue;
                    }
                    state.reset();
                    let consumers = state.consumers.clone();
                    work.push(Invalidation::Module(port.module));
                    for consumer in consumers {
                        work.push(Invalidation::In(consumer));
                    }
                }
            }
        }
    }

    fn drive_foreprop(&mut self, mut ready: VecDeque<ModuleId>) -> Result<(), GraphError> {
        while let Some(id) = ready.pop_front() {
            log::trace!("foreprop fires module {}", id.0);
            let values = {
                let entry = &mut self.entries[id.0];
                let ports = PortValues::new(&entry.inputs);
                entry.module.foreprop(ports)?
            };
            assert_eq!(
                values.len(),
                self.entries[id.0].outputs.len(),
                "module produced a value count different from its output ports"
            );
            for (slot, value) in values.into_iter().enumerate() {
                self.deliver(OutputRef { module: id, slot }, value, &mut ready)?;
            }
        }
        Ok(())
    }

    fn deliver(
        &mut self,
        from: OutputRef,
        value: Matrix,
        ready: &mut VecDeque<ModuleId>,
    ) -> Result<(), GraphError> {
        let consumers = {
            let port = &mut self.entries[from.module.0].outputs[from.slot];
            port.value = Some(value.clone());
            port.consumers.clone()
        };
        for consumer in consumers {
            let entry = &mut self.entries[consumer.module.0];
            let port = &mut entry.inputs[consumer.slot];
            if port.valid() {
                return Err(GraphError::DoubleForeprop);
            }
            port.value = Some(value.clone());
            if entry.inputs.iter().all(InPort::valid) {
                ready.push_back(consumer.module);
            }
        }
        Ok(())
    }

    fn drive_backprop(&mut self, mut ready: VecDeque<ModuleId>) -> Result<(), GraphError> {
        while let Some(id) = ready.pop_front() {
            log::trace!("backprop fires module {}", id.0);
            let adjoints = {
                let entry = &mut self.entries[id.0];
                let ports = BackpropPorts::new(&entry.inputs, &entry.outputs);
                entry.module.backprop(ports)?
            };
            let entry = &self.entries[id.0];
            assert_eq!(
                adjoints.len(),
                entry.inputs.len(),
                "module produced an adjoint count different from its input ports"
            );
            let sources: Vec<Option<OutputRef>> =
                entry.inputs.iter().map(|p| p.source).collect();
            for (source, dodx) in sources.into_iter().zip(adjoints) {
                if let Some(source) = source {
                    self.accumulate_at(source, dodx, &mut ready)?;
                }
            }
        }
        Ok(())
    }

    fn accumulate_at(
        &mut self,
        port: OutputRef,
        dodx: Matrix,
        ready: &mut VecDeque<ModuleId>,
    ) -> Result<(), GraphError> {
        let entry = &mut self.entries[port.module.0];
        entry.outputs[port.slot].accumulate(dodx)?;
        if entry.outputs[port.slot].backprop_ready()
            && entry.outputs.iter().all(OutPort::backprop_ready)
        {
            ready.push_back(port.module);
        }
        Ok(())
    }
}
