use crate::GCResult;
use crate::error::GCError;
use crate::handle::Tensor;
use crate::traversal::{Module, ModuleBase};

/// Runs child modules in order, feeding each one's output to the next.
pub struct Sequential {
    base: ModuleBase,
    modules: Vec<Box<dyn Module>>,
}

impl Sequential {
    pub fn new(modules: Vec<Box<dyn Module>>) -> Self {
        let mut seq = Self {
            base: ModuleBase::new(),
            modules,
        };
        seq.bind_root();
        seq
    }

    pub fn push(&mut self, module: Box<dyn Module>) {
        self.modules.push(module);
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&dyn Module> {
        self.modules.get(index).map(|m| m.as_ref())
    }
}

impl Module for Sequential {
    fn base(&self) -> &ModuleBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ModuleBase {
        &mut self.base
    }

    fn forward(&self, input: &Tensor) -> GCResult<Tensor> {
        let (first, rest) = self.modules.split_first().ok_or(GCError::EmptySequential)?;
        let mut x = first.forward(input)?;
        for module in rest {
            x = module.forward(&x)?;
        }
        Ok(x)
    }

    crate::module_fields!(modules modules);
}
