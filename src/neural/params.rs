// src/neural/params.rs
// Named parameter tensors and the gradients that flow back into them.

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

/// What a parameter does inside its layer. Only `Weight` is projected onto Q1.7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParamRole {
    /// Convolution or dense kernel
    Weight,
    /// Additive bias (including the spiking `D_i` term)
    Bias,
    /// Normalization scale or shift
    Affine,
}

impl ParamRole {
    /// Whether the quantization projector rewrites this parameter
    pub fn is_weight_like(self) -> bool {
        matches!(self, ParamRole::Weight)
    }
}

/// Position of a parameter inside a [`ParamStore`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParamId(usize);

impl ParamId {
    /// Index into the store and into any parallel [`Gradients`]
    pub fn index(self) -> usize {
        self.0
    }
}

/// A named tensor with its role
#[derive(Debug, Clone)]
pub struct Parameter {
    name: String,
    role: ParamRole,
    trainable: bool,
    value: DMatrix<f32>,
}

impl Parameter {
    /// Fully qualified parameter name, e.g. `dense_1.kernel`
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Role assigned at construction
    pub fn role(&self) -> ParamRole {
        self.role
    }

    /// Whether the optimizer and projector may touch this parameter
    pub fn is_trainable(&self) -> bool {
        self.trainable
    }

    /// Freeze or unfreeze
    pub fn set_trainable(&mut self, trainable: bool) {
        self.trainable = trainable;
    }

    /// Current value
    pub fn value(&self) -> &DMatrix<f32> {
        &self.value
    }

    /// Mutable value
    pub fn value_mut(&mut self) -> &mut DMatrix<f32> {
        &mut self.value
    }

    /// `(rows, cols)` of the tensor
    pub fn shape(&self) -> (usize, usize) {
        self.value.shape()
    }
}

/// Ordered collection of every parameter of a model
#[derive(Debug, Clone, Default)]
pub struct ParamStore {
    params: Vec<Parameter>,
}

impl ParamStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a trainable parameter and return its id
    pub fn register(&mut self, name: impl Into<String>, role: ParamRole, value: DMatrix<f32>) -> ParamId {
        let id = ParamId(self.params.len());
        self.params.push(Parameter { name: name.into(), role, trainable: true, value });
        id
    }

    /// Number of parameter tensors
    pub fn len(&self) -> usize {
        self.params.len()
    }

    /// True when nothing is registered
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Parameter by id
    pub fn get(&self, id: ParamId) -> &Parameter {
        &self.params[id.0]
    }

    /// Mutable parameter by id
    pub fn get_mut(&mut self, id: ParamId) -> &mut Parameter {
        &mut self.params[id.0]
    }

    /// Value of a parameter by id
    pub fn value(&self, id: ParamId) -> &DMatrix<f32> {
        &self.params[id.0].value
    }

    /// Look a parameter up by name
    pub fn find(&self, name: &str) -> Option<ParamId> {
        self.params.iter().position(|p| p.name == name).map(ParamId)
    }

    /// Iterate in registration order
    pub fn iter(&self) -> impl Iterator<Item = &Parameter> {
        self.params.iter()
    }

    /// Iterate mutably in registration order
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Parameter> {
        self.params.iter_mut()
    }
}

/// Gradients laid out parallel to a [`ParamStore`]; `None` means no gradient reached it.
#[derive(Debug, Clone)]
pub struct Gradients {
    grads: Vec<Option<DMatrix<f32>>>,
}

impl Gradients {
    /// No gradients for any parameter of `store`
    pub fn empty_for(store: &ParamStore) -> Self {
        Gradients { grads: vec![None; store.len()] }
    }

    /// Add `grad` into the slot for `id`
    pub fn accumulate(&mut self, id: ParamId, grad: DMatrix<f32>) {
        let slot = &mut self.grads[id.0];
        match slot {
            Some(existing) => *existing += grad,
            None => *slot = Some(grad),
        }
    }

    /// Gradient for `id`, if any
    pub fn get(&self, id: ParamId) -> Option<&DMatrix<f32>> {
        self.grads[id.0].as_ref()
    }

    /// Slots in store order
    pub fn iter(&self) -> impl Iterator<Item = Option<&DMatrix<f32>>> {
        self.grads.iter().map(Option::as_ref)
    }

    /// Number of slots
    pub fn len(&self) -> usize {
        self.grads.len()
    }

    /// True when the store had no parameters
    pub fn is_empty(&self) -> bool {
        self.grads.is_empty()
    }

    /// L2 norm over every gradient element
    pub fn global_norm(&self) -> f32 {
        self.grads
            .iter()
            .flatten()
            .map(|g| g.iter().map(|v| v * v).sum::<f32>())
            .sum::<f32>()
            .sqrt()
    }

    /// Multiply every gradient by `factor`
    pub fn scale(&mut self, factor: f32) {
        for grad in self.grads.iter_mut().flatten() {
            *grad *= factor;
        }
    }
}
