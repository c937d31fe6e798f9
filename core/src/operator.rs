//! Operator: one graph node bound to its selected kernel.
use std::fmt;
use std::sync::Arc;

use anyhow::Context;
use kestrel_data::prelude::*;

use crate::errors::{KestrelError, KestrelResult};
use crate::kernel::Kernel;
use crate::model::TypedFact;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperatorState {
    Unbound,
    Validated,
    Executed,
}

/// A node instance: kernel, validated input and output facts, and where
/// it stands in the current execution pass.
///
/// ```text
/// Unbound --validate--> Validated --execute--> Executed
///                          ^                      |
///                          +-------rearm----------+
/// ```
#[derive(Clone)]
pub struct Operator {
    node: usize,
    name: String,
    kernel: Arc<dyn Kernel>,
    state: OperatorState,
    input_facts: TVec<TypedFact>,
    output_facts: TVec<TypedFact>,
    validations: usize,
}

impl Operator {
    pub fn new(node: usize, name: impl Into<String>, kernel: Arc<dyn Kernel>) -> Operator {
        Operator {
            node,
            name: name.into(),
            kernel,
            state: OperatorState::Unbound,
            input_facts: tvec!(),
            output_facts: tvec!(),
            validations: 0,
        }
    }

    pub fn node(&self) -> usize {
        self.node
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kernel(&self) -> &Arc<dyn Kernel> {
        &self.kernel
    }

    pub fn state(&self) -> OperatorState {
        self.state
    }

    pub fn input_facts(&self) -> &[TypedFact] {
        &self.input_facts
    }

    pub fn output_facts(&self) -> &[TypedFact] {
        &self.output_facts
    }

    /// How many times the kernel predicate ran.
    pub fn validations(&self) -> usize {
        self.validations
    }

    /// Run the kernel compatibility predicate against `inputs` and record
    /// the inferred outputs. A failure leaves the operator unbound.
    pub fn validate(&mut self, inputs: &[&TypedFact]) -> KestrelResult<&[TypedFact]> {
        self.state = OperatorState::Unbound;
        self.validations += 1;
        let outputs = self
            .kernel
            .output_facts(inputs)
            .with_context(|| format!("Validating {self:?} against {inputs:?}"))?;
        self.input_facts = inputs.iter().map(|f| (*f).clone()).collect();
        self.output_facts = outputs;
        self.state = OperatorState::Validated;
        Ok(&self.output_facts)
    }

    /// Prepare for a new execution pass. Validation is skipped when the
    /// inputs have the facts already validated. Returns true if the kernel
    /// predicate had to run.
    pub fn rearm(&mut self, inputs: &[&TypedFact]) -> KestrelResult<bool> {
        if self.state != OperatorState::Unbound
            && inputs.len() == self.input_facts.len()
            && inputs.iter().zip(self.input_facts.iter()).all(|(a, b)| *a == b)
        {
            self.state = OperatorState::Validated;
            Ok(false)
        } else {
            self.validate(inputs)?;
            Ok(true)
        }
    }

    /// Invoke the kernel. Only allowed once per pass, after validation, with
    /// values matching the validated facts.
    pub fn execute(&mut self, inputs: &[Value], outputs: &mut [Value]) -> KestrelResult<()> {
        if self.state != OperatorState::Validated {
            anyhow::bail!(KestrelError::InvalidTensorState(format!(
                "{self:?} can not execute from state {:?}",
                self.state
            )))
        }
        ensure_shape!(
            inputs.len() == self.input_facts.len()
                && inputs.iter().zip(self.input_facts.iter()).all(|(v, f)| v.fact() == *f),
            "{:?} validated for {:?}, got {:?}",
            self,
            self.input_facts,
            inputs
        );
        ensure_shape!(
            outputs.len() == self.output_facts.len()
                && outputs.iter().zip(self.output_facts.iter()).all(|(v, f)| v.fact() == *f),
            "{:?} outputs should be {:?}, got {:?}",
            self,
            self.output_facts,
            outputs
        );
        log::trace!("Executing {:?}", self);
        self.kernel.execute(inputs, outputs).with_context(|| format!("Executing {self:?}"))?;
        self.state = OperatorState::Executed;
        Ok(())
    }
}

impl fmt::Debug for Operator {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{} \"{}\" ({})", self.node, self.name, self.kernel.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::reference::ReferenceKernels;
    use crate::prelude::*;

    fn relu_operator() -> Operator {
        let registry = RegistryBuilder::new().with_provider(&ReferenceKernels).unwrap().build();
        let kernel = registry
            .instantiate(Backend::CpuReference, DatumKind::F32, &ActivationType::Relu.into())
            .unwrap();
        Operator::new(0, "relu", kernel.into())
    }

    #[test]
    fn lifecycle() {
        let mut op = relu_operator();
        assert_eq!(op.state(), OperatorState::Unbound);
        let fact = TypedFact::dt_shape::<f32>(&[3]);
        assert_eq!(op.validate(&[&fact]).unwrap(), &[fact.clone()]);
        assert_eq!(op.state(), OperatorState::Validated);

        let input = Value::from(tensor1(&[-1f32, 0., 2.]));
        let mut outputs = [Value::from(Tensor::zero::<f32>(&[3]))];
        op.execute(&[input.clone()], &mut outputs).unwrap();
        assert_eq!(op.state(), OperatorState::Executed);
        assert_eq!(*outputs[0].as_host().unwrap(), tensor1(&[0f32, 0., 2.]));

        let err = op.execute(&[input], &mut outputs).unwrap_err();
        assert!(matches!(KestrelError::of(&err), Some(KestrelError::InvalidTensorState(_))));
    }

    #[test]
    fn execute_requires_validation() {
        let mut op = relu_operator();
        let mut outputs = [Value::from(Tensor::zero::<f32>(&[1]))];
        let err = op.execute(&[Value::from(tensor1(&[1f32]))], &mut outputs).unwrap_err();
        assert!(matches!(KestrelError::of(&err), Some(KestrelError::InvalidTensorState(_))));
    }

    #[test]
    fn rearm_skips_validation_for_same_facts() {
        let mut op = relu_operator();
        let fact = TypedFact::dt_shape::<f32>(&[3]);
        op.validate(&[&fact]).unwrap();
        assert!(!op.rearm(&[&fact]).unwrap());
        assert_eq!(op.validations(), 1);
        let bigger = TypedFact::dt_shape::<f32>(&[5]);
        assert!(op.rearm(&[&bigger]).unwrap());
        assert_eq!(op.output_facts(), &[bigger]);
        assert_eq!(op.validations(), 2);
    }

    #[test]
    fn type_mismatch_leaves_unbound() {
        let mut op = relu_operator();
        let err = op.validate(&[&TypedFact::dt_shape::<i32>(&[3])]).unwrap_err();
        assert!(matches!(KestrelError::of(&err), Some(KestrelError::TypeMismatch(_))));
        assert_eq!(op.state(), OperatorState::Unbound);
    }

    #[test]
    fn execute_checks_values_against_facts() {
        let mut op = relu_operator();
        op.validate(&[&TypedFact::dt_shape::<f32>(&[3])]).unwrap();
        let mut outputs = [Value::from(Tensor::zero::<f32>(&[2]))];
        let err = op.execute(&[Value::from(tensor1(&[1f32, 2.]))], &mut outputs).unwrap_err();
        assert!(matches!(KestrelError::of(&err), Some(KestrelError::ShapeMismatch(_))));
    }
}
