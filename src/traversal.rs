//! Discovery of parameter and buffer tensors in a module tree.
//!
//! Modules describe their own fields through [`Module::fields`] and
//! [`Module::fields_mut`], usually generated with [`module_fields!`]. The walk
//! follows declaration order, names every tensor by its dotted path from the
//! root, and refuses to return anything when a node hides a child module.
//!
//! [`module_fields!`]: crate::module_fields

use crate::GCResult;
use crate::error::GCError;
use crate::handle::Tensor;
use std::collections::{BTreeMap, HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TensorKind {
    /// Trainable; handed to optimizers. Untagged tensor fields are parameters.
    #[default]
    Parameter,
    /// Not trainable, e.g. running statistics.
    Buffer,
}

impl TensorKind {
    fn wanted(self, want_parameters: bool, want_buffers: bool) -> bool {
        match self {
            TensorKind::Parameter => want_parameters,
            TensorKind::Buffer => want_buffers,
        }
    }
}

/// State every module carries: the root name set by
/// [`Module::bind_root`] and the training flag.
#[derive(Debug, Clone)]
pub struct ModuleBase {
    name: Option<String>,
    training: bool,
}

impl ModuleBase {
    pub fn new() -> Self {
        Self {
            name: None,
            training: true,
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn is_training(&self) -> bool {
        self.training
    }
}

impl Default for ModuleBase {
    fn default() -> Self {
        Self::new()
    }
}

pub enum Field<'a> {
    Tensor {
        name: &'static str,
        kind: TensorKind,
        tensor: Option<&'a Tensor>,
    },
    Tensors {
        name: &'static str,
        kind: TensorKind,
        tensors: &'a [Tensor],
    },
    Module {
        name: &'static str,
        module: Option<&'a dyn Module>,
    },
    Modules {
        name: &'static str,
        modules: &'a [Box<dyn Module>],
    },
    /// A child module the node does not expose. Fatal to every walk.
    Sealed { name: &'static str },
}

pub enum FieldMut<'a> {
    Tensor {
        name: &'static str,
        kind: TensorKind,
        slot: &'a mut Option<Tensor>,
    },
    Tensors {
        name: &'static str,
        kind: TensorKind,
        tensors: &'a mut Vec<Tensor>,
    },
    Module {
        name: &'static str,
        module: Option<&'a mut dyn Module>,
    },
    Modules {
        name: &'static str,
        modules: &'a mut [Box<dyn Module>],
    },
    Sealed { name: &'static str },
}

/// A node of the parameter/buffer ownership tree.
pub trait Module: Send {
    fn base(&self) -> &ModuleBase;

    fn base_mut(&mut self) -> &mut ModuleBase;

    fn forward(&self, input: &Tensor) -> GCResult<Tensor>;

    /// Fields in declaration order. Ordinary data is left out.
    fn fields(&self) -> Vec<Field<'_>>;

    fn fields_mut(&mut self) -> Vec<FieldMut<'_>>;

    /// Short type name, e.g. `Linear` for `my_crate::nn::Linear<f32>`.
    fn type_name(&self) -> &'static str {
        short_type_name(std::any::type_name::<Self>())
    }

    /// Records this node's type name as the first segment of every path
    /// discovered from it. Call once, right after construction.
    fn bind_root(&mut self) {
        if self.base().name.is_some() {
            return;
        }
        let name = self.type_name().to_string();
        self.base_mut().name = Some(name);
    }

    fn is_training(&self) -> bool {
        self.base().is_training()
    }
}

pub(crate) fn short_type_name(full: &'static str) -> &'static str {
    let path = full.split('<').next().unwrap_or(full);
    path.rsplit("::").next().unwrap_or(path)
}

fn root_name(root: &dyn Module) -> GCResult<String> {
    root.base()
        .name()
        .map(str::to_string)
        .ok_or_else(|| GCError::UnboundModule(root.type_name().to_string()))
}

fn insert<'a>(
    out: &mut BTreeMap<String, &'a Tensor>,
    path: String,
    tensor: &'a Tensor,
) -> GCResult<()> {
    if out.contains_key(&path) {
        return Err(GCError::DuplicatePath(path));
    }
    out.insert(path, tensor);
    Ok(())
}

fn walk<'a>(
    module: &'a dyn Module,
    prefix: &str,
    want_parameters: bool,
    want_buffers: bool,
    out: &mut BTreeMap<String, &'a Tensor>,
) -> GCResult<()> {
    for field in module.fields() {
        match field {
            Field::Tensor { name, kind, tensor } => {
                if !kind.wanted(want_parameters, want_buffers) {
                    continue;
                }
                // An unallocated slot, e.g. a disabled bias.
                if let Some(tensor) = tensor {
                    insert(out, format!("{prefix}.{name}"), tensor)?;
                }
            }
            Field::Tensors {
                name,
                kind,
                tensors,
            } => {
                if !kind.wanted(want_parameters, want_buffers) {
                    continue;
                }
                for (i, tensor) in tensors.iter().enumerate() {
                    insert(out, format!("{prefix}.{name}[{i}]"), tensor)?;
                }
            }
            Field::Module { name, module } => {
                if let Some(child) = module {
                    walk(
                        child,
                        &format!("{prefix}.{name}"),
                        want_parameters,
                        want_buffers,
                        out,
                    )?;
                }
            }
            Field::Modules { name, modules } => {
                for (i, child) in modules.iter().enumerate() {
                    walk(
                        child.as_ref(),
                        &format!("{prefix}.{name}[{i}]"),
                        want_parameters,
                        want_buffers,
                        out,
                    )?;
                }
            }
            Field::Sealed { name } => {
                return Err(GCError::InaccessibleField {
                    module: prefix.to_string(),
                    field: name.to_string(),
                });
            }
        }
    }
    Ok(())
}

/// Every non-empty tensor field of the requested kind(s), keyed by dotted
/// path from the root.
///
/// Fails as a whole when the root is unbound, a node hides a child module or
/// two fields produce the same path.
pub fn discover_tensors(
    root: &dyn Module,
    want_parameters: bool,
    want_buffers: bool,
) -> GCResult<BTreeMap<String, &Tensor>> {
    let prefix = root_name(root)?;
    let mut out = BTreeMap::new();
    walk(root, &prefix, want_parameters, want_buffers, &mut out)?;
    Ok(out)
}

pub fn named_parameters(root: &dyn Module) -> GCResult<BTreeMap<String, &Tensor>> {
    discover_tensors(root, true, false)
}

pub fn named_buffers(root: &dyn Module) -> GCResult<BTreeMap<String, &Tensor>> {
    discover_tensors(root, false, true)
}

pub fn state_dict(root: &dyn Module) -> GCResult<BTreeMap<String, &Tensor>> {
    discover_tensors(root, true, true)
}

/// Parameters ordered by path, the shape optimizers take them in.
pub fn parameters(root: &dyn Module) -> GCResult<Vec<&Tensor>> {
    Ok(named_parameters(root)?.into_values().collect())
}

pub fn buffers(root: &dyn Module) -> GCResult<Vec<&Tensor>> {
    Ok(named_buffers(root)?.into_values().collect())
}

fn visit_mut(
    module: &mut dyn Module,
    prefix: &str,
    visit: &mut dyn FnMut(&str, &mut dyn Module),
) -> GCResult<()> {
    visit(prefix, &mut *module);
    for field in module.fields_mut() {
        match field {
            FieldMut::Module {
                name,
                module: Some(child),
            } => visit_mut(child, &format!("{prefix}.{name}"), visit)?,
            FieldMut::Modules { name, modules } => {
                for (i, child) in modules.iter_mut().enumerate() {
                    visit_mut(child.as_mut(), &format!("{prefix}.{name}[{i}]"), visit)?;
                }
            }
            FieldMut::Sealed { name } => {
                return Err(GCError::InaccessibleField {
                    module: prefix.to_string(),
                    field: name.to_string(),
                });
            }
            _ => {}
        }
    }
    Ok(())
}

/// Calls `f` on every node, root first, with the node's path.
pub fn apply<F>(root: &mut dyn Module, mut f: F) -> GCResult<()>
where
    F: FnMut(&str, &mut dyn Module),
{
    let prefix = root_name(root)?;
    // Validate first so a hidden child cannot leave the tree half-visited.
    discover_tensors(root, true, true)?;
    visit_mut(root, &prefix, &mut f)
}

/// Switches training mode on every node of the tree.
pub fn set_training(root: &mut dyn Module, on: bool) -> GCResult<()> {
    apply(root, |_, m| m.base_mut().training = on)
}

fn take_all(module: &mut dyn Module, out: &mut Vec<Tensor>) {
    for field in module.fields_mut() {
        match field {
            FieldMut::Tensor { slot, .. } => out.extend(slot.take()),
            FieldMut::Tensors { tensors, .. } => out.append(tensors),
            FieldMut::Module {
                module: Some(child),
                ..
            } => take_all(child, out),
            FieldMut::Modules { modules, .. } => {
                for child in modules.iter_mut() {
                    take_all(child.as_mut(), out);
                }
            }
            _ => {}
        }
    }
}

/// Releases every parameter and buffer of the tree right away, leaving the
/// slots empty. Returns how many tensors were released.
///
/// This is the only path that reclaims parameters and buffers; it does not
/// go through the epoch barrier. A second call finds nothing to release.
/// Native failures do not stop the teardown; the first one is returned after
/// every tensor has been handled.
pub fn release_all(root: &mut dyn Module) -> GCResult<usize> {
    let expected = discover_tensors(root, true, true)?.len();

    let mut tensors = Vec::with_capacity(expected);
    take_all(root, &mut tensors);
    debug_assert_eq!(tensors.len(), expected);

    let count = tensors.len();
    let mut first_err = None;
    for tensor in tensors {
        if let Err(err) = tensor.release() {
            first_err.get_or_insert(err);
        }
    }
    log::debug!("released {count} module tensor(s)");

    match first_err {
        Some(err) => Err(err),
        None => Ok(count),
    }
}

fn assign(
    module: &mut dyn Module,
    prefix: &str,
    src: &mut HashMap<String, Tensor>,
) {
    for field in module.fields_mut() {
        match field {
            FieldMut::Tensor { name, slot, .. } => {
                if slot.is_some() {
                    if let Some(t) = src.remove(&format!("{prefix}.{name}")) {
                        *slot = Some(t);
                    }
                }
            }
            FieldMut::Tensors { name, tensors, .. } => {
                for (i, slot) in tensors.iter_mut().enumerate() {
                    if let Some(t) = src.remove(&format!("{prefix}.{name}[{i}]")) {
                        *slot = t;
                    }
                }
            }
            FieldMut::Module {
                name,
                module: Some(child),
            } => assign(child, &format!("{prefix}.{name}"), src),
            FieldMut::Modules { name, modules } => {
                for (i, child) in modules.iter_mut().enumerate() {
                    assign(child.as_mut(), &format!("{prefix}.{name}[{i}]"), src);
                }
            }
            _ => {}
        }
    }
}

/// Replaces every parameter and buffer with the entry of the same path.
///
/// Every non-empty field must have an entry and every entry must be used;
/// both are checked before any field changes. Replaced tensors are dropped
/// and left to the collector.
pub fn load_state_dict(root: &mut dyn Module, mut src: HashMap<String, Tensor>) -> GCResult<()> {
    let paths: HashSet<String> = state_dict(root)?.into_keys().collect();

    if let Some(missing) = paths.iter().find(|p| !src.contains_key(*p)) {
        return Err(GCError::MissingStateEntry(missing.clone()));
    }
    if let Some(unused) = src.keys().find(|k| !paths.contains(*k)) {
        return Err(GCError::UnusedStateEntry(unused.clone()));
    }

    let prefix = root_name(root)?;
    assign(root, &prefix, &mut src);
    debug_assert!(src.is_empty());
    Ok(())
}

/// Implements [`Module::fields`] and [`Module::fields_mut`] from a field list.
///
/// Each entry is `kind field` with an optional `=> "Alias"` display name:
///
/// | kind       | field type                |
/// |------------|---------------------------|
/// | `tensor`   | `Option<Tensor>`, kind [`TensorKind::default`] |
/// | `tensors`  | `Vec<Tensor>`, kind [`TensorKind::default`] |
/// | `param`    | `Option<Tensor>`          |
/// | `buffer`   | `Option<Tensor>`          |
/// | `params`   | `Vec<Tensor>`             |
/// | `buffers`  | `Vec<Tensor>`             |
/// | `module`   | any `T: Module`           |
/// | `optional` | `Option<T>`, `T: Module`  |
/// | `modules`  | `Vec<Box<dyn Module>>`    |
/// | `sealed`   | a child that is not walked, which makes every walk fail |
///
/// ```ignore
/// impl Module for Linear {
///     // base, base_mut, forward ...
///     tensor_gc::module_fields!(param weight => "Weight", param bias);
/// }
/// ```
#[macro_export]
macro_rules! module_fields {
    (@name $field:ident) => { stringify!($field) };
    (@name $field:ident $alias:literal) => { $alias };

    (@ref $s:ident tensor $f:ident $name:expr) => {
        $crate::traversal::Field::Tensor {
            name: $name,
            kind: <$crate::traversal::TensorKind as ::std::default::Default>::default(),
            tensor: $s.$f.as_ref(),
        }
    };
    (@ref $s:ident tensors $f:ident $name:expr) => {
        $crate::traversal::Field::Tensors {
            name: $name,
            kind: <$crate::traversal::TensorKind as ::std::default::Default>::default(),
            tensors: &$s.$f,
        }
    };
    (@ref $s:ident param $f:ident $name:expr) => {
        $crate::traversal::Field::Tensor {
            name: $name,
            kind: $crate::traversal::TensorKind::Parameter,
            tensor: $s.$f.as_ref(),
        }
    };
    (@ref $s:ident buffer $f:ident $name:expr) => {
        $crate::traversal::Field::Tensor {
            name: $name,
            kind: $crate::traversal::TensorKind::Buffer,
            tensor: $s.$f.as_ref(),
        }
    };
    (@ref $s:ident params $f:ident $name:expr) => {
        $crate::traversal::Field::Tensors {
            name: $name,
            kind: $crate::traversal::TensorKind::Parameter,
            tensors: &$s.$f,
        }
    };
    (@ref $s:ident buffers $f:ident $name:expr) => {
        $crate::traversal::Field::Tensors {
            name: $name,
            kind: $crate::traversal::TensorKind::Buffer,
            tensors: &$s.$f,
        }
    };
    (@ref $s:ident module $f:ident $name:expr) => {
        $crate::traversal::Field::Module {
            name: $name,
            module: Some(&$s.$f),
        }
    };
    (@ref $s:ident optional $f:ident $name:expr) => {
        $crate::traversal::Field::Module {
            name: $name,
            module: $s
                .$f
                .as_ref()
                .map(|m| m as &dyn $crate::traversal::Module),
        }
    };
    (@ref $s:ident modules $f:ident $name:expr) => {
        $crate::traversal::Field::Modules {
            name: $name,
            modules: &$s.$f,
        }
    };
    (@ref $s:ident sealed $f:ident $name:expr) => {
        $crate::traversal::Field::Sealed { name: $name }
    };

    (@mut $s:ident tensor $f:ident $name:expr) => {
        $crate::traversal::FieldMut::Tensor {
            name: $name,
            kind: <$crate::traversal::TensorKind as ::std::default::Default>::default(),
            slot: &mut $s.$f,
        }
    };
    (@mut $s:ident tensors $f:ident $name:expr) => {
        $crate::traversal::FieldMut::Tensors {
            name: $name,
            kind: <$crate::traversal::TensorKind as ::std::default::Default>::default(),
            tensors: &mut $s.$f,
        }
    };
    (@mut $s:ident param $f:ident $name:expr) => {
        $crate::traversal::FieldMut::Tensor {
            name: $name,
            kind: $crate::traversal::TensorKind::Parameter,
            slot: &mut $s.$f,
        }
    };
    (@mut $s:ident buffer $f:ident $name:expr) => {
        $crate::traversal::FieldMut::Tensor {
            name: $name,
            kind: $crate::traversal::TensorKind::Buffer,
            slot: &mut $s.$f,
        }
    };
    (@mut $s:ident params $f:ident $name:expr) => {
        $crate::traversal::FieldMut::Tensors {
            name: $name,
            kind: $crate::traversal::TensorKind::Parameter,
            tensors: &mut $s.$f,
        }
    };
    (@mut $s:ident buffers $f:ident $name:expr) => {
        $crate::traversal::FieldMut::Tensors {
            name: $name,
            kind: $crate::traversal::TensorKind::Buffer,
            tensors: &mut $s.$f,
        }
    };
    (@mut $s:ident module $f:ident $name:expr) => {
        $crate::traversal::FieldMut::Module {
            name: $name,
            module: Some(&mut $s.$f),
        }
    };
    (@mut $s:ident optional $f:ident $name:expr) => {
        $crate::traversal::FieldMut::Module {
            name: $name,
            module: $s
                .$f
                .as_mut()
                .map(|m| m as &mut dyn $crate::traversal::Module),
        }
    };
    (@mut $s:ident modules $f:ident $name:expr) => {
        $crate::traversal::FieldMut::Modules {
            name: $name,
            modules: &mut $s.$f,
        }
    };
    (@mut $s:ident sealed $f:ident $name:expr) => {
        $crate::traversal::FieldMut::Sealed { name: $name }
    };

    ($($kind:ident $field:ident $(=> $alias:literal)?),* $(,)?) => {
        fn fields(&self) -> ::std::vec::Vec<$crate::traversal::Field<'_>> {
            ::std::vec![$(
                $crate::module_fields!(@ref self $kind $field
                    $crate::module_fields!(@name $field $($alias)?))
            ),*]
        }

        fn fields_mut(&mut self) -> ::std::vec::Vec<$crate::traversal::FieldMut<'_>> {
            ::std::vec![$(
                $crate::module_fields!(@mut self $kind $field
                    $crate::module_fields!(@name $field $($alias)?))
            ),*]
        }
    };
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::arena::ArenaRuntime;
    use crate::gc::TensorGc;
    use crate::module_fields;
    use std::sync::Arc;

    pub(crate) struct Linear {
        pub base: ModuleBase,
        pub weight: Option<Tensor>,
        pub bias: Option<Tensor>,
    }

    impl Linear {
        pub fn new(gc: &TensorGc, input: usize, output: usize, bias: bool) -> Self {
            let mut l = Self {
                base: ModuleBase::new(),
                weight: Some(gc.empty(&[output, input]).unwrap()),
                bias: if bias {
                    Some(gc.empty(&[output, 1]).unwrap())
                } else {
                    None
                },
            };
            l.bind_root();
            l
        }
    }

    impl Module for Linear {
        fn base(&self) -> &ModuleBase {
            &self.base
        }

        fn base_mut(&mut self) -> &mut ModuleBase {
            &mut self.base
        }

        fn forward(&self, input: &Tensor) -> GCResult<Tensor> {
            let mut others = Vec::new();
            others.extend(self.weight.as_ref());
            others.extend(self.bias.as_ref());
            input.invoke("linear", &others)
        }

        module_fields!(param weight => "Weight", param bias => "Bias");
    }

    pub(crate) struct BatchNorm {
        base: ModuleBase,
        weight: Option<Tensor>,
        bias: Option<Tensor>,
        running_mean: Option<Tensor>,
        running_var: Option<Tensor>,
    }

    impl BatchNorm {
        pub fn new(gc: &TensorGc, features: usize) -> Self {
            let mut b = Self {
                base: ModuleBase::new(),
                weight: Some(gc.empty(&[features]).unwrap()),
                bias: Some(gc.empty(&[features]).unwrap()),
                running_mean: Some(gc.empty(&[features]).unwrap()),
                running_var: Some(gc.empty(&[features]).unwrap()),
            };
            b.bind_root();
            b
        }
    }

    impl Module for BatchNorm {
        fn base(&self) -> &ModuleBase {
            &self.base
        }

        fn base_mut(&mut self) -> &mut ModuleBase {
            &mut self.base
        }

        fn forward(&self, input: &Tensor) -> GCResult<Tensor> {
            input.invoke("batch_norm", &[])
        }

        module_fields!(
            param weight,
            param bias,
            buffer running_mean,
            buffer running_var,
        );
    }

    pub(crate) struct Net {
        base: ModuleBase,
        l1: Linear,
        l2: Linear,
    }

    impl Net {
        pub fn new(gc: &TensorGc) -> Self {
            let mut n = Self {
                base: ModuleBase::new(),
                l1: Linear::new(gc, 4, 8, false),
                l2: Linear::new(gc, 8, 2, false),
            };
            n.bind_root();
            n
        }
    }

    impl Module for Net {
        fn base(&self) -> &ModuleBase {
            &self.base
        }

        fn base_mut(&mut self) -> &mut ModuleBase {
            &mut self.base
        }

        fn forward(&self, input: &Tensor) -> GCResult<Tensor> {
            let hidden = self.l1.forward(input)?;
            self.l2.forward(&hidden)
        }

        module_fields!(module l1 => "L1", module l2 => "L2");
    }

    struct Block {
        base: ModuleBase,
        norm: Option<BatchNorm>,
        stages: Vec<Box<dyn Module>>,
        scales: Vec<Tensor>,
    }

    impl Module for Block {
        fn base(&self) -> &ModuleBase {
            &self.base
        }

        fn base_mut(&mut self) -> &mut ModuleBase {
            &mut self.base
        }

        fn forward(&self, input: &Tensor) -> GCResult<Tensor> {
            input.invoke("identity", &[])
        }

        module_fields!(optional norm, modules stages, params scales);
    }

    struct Hidden {
        base: ModuleBase,
        inner: Linear,
        visible: Linear,
    }

    impl Module for Hidden {
        fn base(&self) -> &ModuleBase {
            &self.base
        }

        fn base_mut(&mut self) -> &mut ModuleBase {
            &mut self.base
        }

        fn forward(&self, input: &Tensor) -> GCResult<Tensor> {
            self.inner.forward(input)
        }

        module_fields!(module visible, sealed inner);
    }

    fn setup() -> (Arc<ArenaRuntime>, TensorGc) {
        let _ = env_logger::builder().is_test(true).try_init();
        let rt = Arc::new(ArenaRuntime::new());
        let gc = TensorGc::new(rt.clone()).unwrap();
        (rt, gc)
    }

    fn keys(map: &BTreeMap<String, &Tensor>) -> Vec<String> {
        map.keys().cloned().collect()
    }

    #[test]
    fn test_short_type_name() {
        assert_eq!(short_type_name("a::b::Linear"), "Linear");
        assert_eq!(short_type_name("a::Wrapper<b::Inner>"), "Wrapper");
        assert_eq!(short_type_name("Plain"), "Plain");
    }

    #[test]
    fn test_two_layer_parameters() {
        let (_rt, gc) = setup();
        let net = Net::new(&gc);

        let params = named_parameters(&net).unwrap();
        assert_eq!(keys(&params), vec!["Net.L1.Weight", "Net.L2.Weight"]);
        assert_eq!(params["Net.L1.Weight"].id(), net.l1.weight.as_ref().unwrap().id());
    }

    #[test]
    fn test_skips_unallocated_fields() {
        let (_rt, gc) = setup();
        let with_bias = Linear::new(&gc, 2, 2, true);
        let without_bias = Linear::new(&gc, 2, 2, false);

        assert_eq!(
            keys(&named_parameters(&with_bias).unwrap()),
            vec!["Linear.Bias", "Linear.Weight"]
        );
        assert_eq!(
            keys(&named_parameters(&without_bias).unwrap()),
            vec!["Linear.Weight"]
        );
    }

    #[test]
    fn test_parameters_and_buffers_split() {
        let (_rt, gc) = setup();
        let bn = BatchNorm::new(&gc, 3);

        assert_eq!(
            keys(&named_parameters(&bn).unwrap()),
            vec!["BatchNorm.bias", "BatchNorm.weight"]
        );
        assert_eq!(
            keys(&named_buffers(&bn).unwrap()),
            vec!["BatchNorm.running_mean", "BatchNorm.running_var"]
        );
        assert_eq!(state_dict(&bn).unwrap().len(), 4);
        assert!(discover_tensors(&bn, false, false).unwrap().is_empty());
    }

    #[test]
    fn test_untagged_tensors_are_parameters() {
        struct Embedding {
            base: ModuleBase,
            table: Option<Tensor>,
            extra: Vec<Tensor>,
            count: Option<Tensor>,
        }

        impl Module for Embedding {
            fn base(&self) -> &ModuleBase {
                &self.base
            }

            fn base_mut(&mut self) -> &mut ModuleBase {
                &mut self.base
            }

            fn forward(&self, input: &Tensor) -> GCResult<Tensor> {
                input.invoke("gather", &[])
            }

            module_fields!(tensor table, tensors extra, buffer count);
        }

        let (_rt, gc) = setup();
        let mut emb = Embedding {
            base: ModuleBase::new(),
            table: Some(gc.empty(&[4, 2]).unwrap()),
            extra: vec![gc.empty(&[2]).unwrap()],
            count: Some(gc.empty(&[1]).unwrap()),
        };
        emb.bind_root();

        assert_eq!(
            keys(&named_parameters(&emb).unwrap()),
            vec!["Embedding.extra[0]", "Embedding.table"]
        );
        assert_eq!(keys(&named_buffers(&emb).unwrap()), vec!["Embedding.count"]);
        assert_eq!(release_all(&mut emb).unwrap(), 3);
    }

    #[test]
    fn test_discovery_is_deterministic() {
        let (_rt, gc) = setup();
        let a = Net::new(&gc);
        let b = Net::new(&gc);

        let first = keys(&state_dict(&a).unwrap());
        assert_eq!(first, keys(&state_dict(&a).unwrap()));
        assert_eq!(first, keys(&state_dict(&b).unwrap()));
    }

    #[test]
    fn test_lists_and_optional_children() {
        let (_rt, gc) = setup();
        let mut block = Block {
            base: ModuleBase::new(),
            norm: Some(BatchNorm::new(&gc, 2)),
            stages: vec![
                Box::new(Linear::new(&gc, 2, 2, true)),
                Box::new(Linear::new(&gc, 2, 2, false)),
            ],
            scales: vec![gc.empty(&[1]).unwrap(), gc.empty(&[1]).unwrap()],
        };
        block.bind_root();

        assert_eq!(
            keys(&named_parameters(&block).unwrap()),
            vec![
                "Block.norm.bias",
                "Block.norm.weight",
                "Block.scales[0]",
                "Block.scales[1]",
                "Block.stages[0].Bias",
                "Block.stages[0].Weight",
                "Block.stages[1].Weight",
            ]
        );

        block.norm = None;
        assert!(named_buffers(&block).unwrap().is_empty());
    }

    #[test]
    fn test_sealed_field_aborts_discovery() {
        let (_rt, gc) = setup();
        let mut hidden = Hidden {
            base: ModuleBase::new(),
            inner: Linear::new(&gc, 1, 1, true),
            visible: Linear::new(&gc, 1, 1, true),
        };
        hidden.bind_root();

        match discover_tensors(&hidden, true, true) {
            Err(GCError::InaccessibleField { module, field }) => {
                assert_eq!(module, "Hidden");
                assert_eq!(field, "inner");
            }
            other => panic!("expected InaccessibleField, got {:?}", other.map(|m| m.len())),
        }

        // Teardown refuses too, and leaves every tensor in place.
        assert!(release_all(&mut hidden).is_err());
        assert!(hidden.visible.weight.is_some());
    }

    #[test]
    fn test_unbound_root_is_rejected() {
        let (_rt, gc) = setup();
        let net = Net {
            base: ModuleBase::new(),
            l1: Linear::new(&gc, 1, 1, false),
            l2: Linear::new(&gc, 1, 1, false),
        };

        assert!(matches!(
            named_parameters(&net),
            Err(GCError::UnboundModule(name)) if name == "Net"
        ));
    }

    #[test]
    fn test_duplicate_path_is_rejected() {
        struct Twice {
            base: ModuleBase,
            weight: Option<Tensor>,
            other: Option<Tensor>,
        }

        impl Module for Twice {
            fn base(&self) -> &ModuleBase {
                &self.base
            }

            fn base_mut(&mut self) -> &mut ModuleBase {
                &mut self.base
            }

            fn forward(&self, input: &Tensor) -> GCResult<Tensor> {
                input.invoke("identity", &[])
            }

            module_fields!(param weight, param other => "weight");
        }

        let (_rt, gc) = setup();
        let mut twice = Twice {
            base: ModuleBase::new(),
            weight: Some(gc.empty(&[1]).unwrap()),
            other: Some(gc.empty(&[1]).unwrap()),
        };
        twice.bind_root();

        assert!(matches!(
            state_dict(&twice),
            Err(GCError::DuplicatePath(p)) if p == "Twice.weight"
        ));
    }

    #[test]
    fn test_release_all_twice() {
        let (rt, gc) = setup();
        let mut net = Net::new(&gc);
        let ids: Vec<_> = parameters(&net).unwrap().iter().map(|t| t.id()).collect();

        assert_eq!(release_all(&mut net).unwrap(), 2);
        assert!(named_parameters(&net).unwrap().is_empty());
        assert_eq!(release_all(&mut net).unwrap(), 0);

        for id in ids {
            assert_eq!(rt.release_count(id), 1);
        }
        assert_eq!(rt.live_count(), 0);
        assert_eq!(gc.stats().released, 2);
    }

    #[test]
    fn test_release_all_reports_native_failure() {
        let (rt, gc) = setup();
        let mut bn = BatchNorm::new(&gc, 2);

        rt.set_fail_releases(true);
        assert!(matches!(release_all(&mut bn), Err(GCError::Native(_))));
        assert!(state_dict(&bn).unwrap().is_empty());
        assert_eq!(rt.live_count(), 0);
        assert_eq!(rt.max_release_count(), 1);
    }

    #[test]
    fn test_set_training_reaches_every_node() {
        let (_rt, gc) = setup();
        let mut net = Net::new(&gc);

        set_training(&mut net, false).unwrap();
        assert!(!net.is_training());
        assert!(!net.l1.is_training());
        assert!(!net.l2.is_training());

        let mut visited = Vec::new();
        apply(&mut net, |path, _| visited.push(path.to_string())).unwrap();
        assert_eq!(visited, vec!["Net", "Net.L1", "Net.L2"]);
    }

    #[test]
    fn test_load_state_dict() {
        let (rt, gc) = setup();
        let mut net = Net::new(&gc);
        let old: Vec<_> = parameters(&net).unwrap().iter().map(|t| t.id()).collect();

        let mut sd = HashMap::new();
        sd.insert("Net.L1.Weight".to_string(), gc.empty(&[8, 4]).unwrap());
        let missing = load_state_dict(&mut net, sd);
        assert!(matches!(missing, Err(GCError::MissingStateEntry(p)) if p == "Net.L2.Weight"));

        let mut sd = HashMap::new();
        sd.insert("Net.L1.Weight".to_string(), gc.empty(&[8, 4]).unwrap());
        sd.insert("Net.L2.Weight".to_string(), gc.empty(&[2, 8]).unwrap());
        sd.insert("Net.L3.Weight".to_string(), gc.empty(&[1]).unwrap());
        let unused = load_state_dict(&mut net, sd);
        assert!(matches!(unused, Err(GCError::UnusedStateEntry(p)) if p == "Net.L3.Weight"));
        assert_eq!(parameters(&net).unwrap()[0].id(), old[0]);

        let mut sd = HashMap::new();
        let w1 = gc.empty(&[8, 4]).unwrap();
        let new_id = w1.id();
        sd.insert("Net.L1.Weight".to_string(), w1);
        sd.insert("Net.L2.Weight".to_string(), gc.empty(&[2, 8]).unwrap());
        load_state_dict(&mut net, sd).unwrap();

        assert_eq!(named_parameters(&net).unwrap()["Net.L1.Weight"].id(), new_id);
        // The replaced weights are left to the collector.
        gc.collect();
        for _ in 0..200 {
            if old.iter().all(|id| !rt.is_live(*id)) {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert!(old.iter().all(|id| !rt.is_live(*id)));
    }

    #[test]
    fn test_forward_allocates_through_context() {
        let (rt, gc) = setup();
        let net = Net::new(&gc);
        let x = gc.empty(&[4]).unwrap();

        let before = rt.allocations();
        let y = net.forward(&x).unwrap();
        assert_eq!(rt.allocations(), before + 2);
        assert!(y.is_managed());
    }
}
