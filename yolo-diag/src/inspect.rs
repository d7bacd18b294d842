//! Per-module parameter and gradient statistics.
//!
//! Traversal only relies on the [`ParamNode`] capability trait; [`ModuleTree`] adapts a flat
//! list of named variables into the ordered module hierarchy implied by their dotted names.
use std::cmp::Ordering;
use std::collections::HashMap;
use std::io::Write;

use candle::backprop::GradStore;
use candle::{DType, Device, Result, Tensor, Var};
use serde::{Deserialize, Serialize};

use crate::model::YoloV8;

const RULE: &str = "--------------------------------------------------";

/// Suffixes of the batch-norm statistics stored next to the learnable parameters.
const BUFFER_SUFFIXES: [&str; 3] = ["running_mean", "running_var", "num_batches_tracked"];

/// A named unit of a model that may own parameters.
pub trait ParamNode {
    fn name(&self) -> &str;

    fn parameters(&self) -> Vec<&Tensor>;

    /// Whether any parameter has a gradient that is present and does not sum to zero.
    fn has_gradient(&self) -> Result<bool>;

    fn num_parameters(&self) -> usize {
        self.parameters().iter().map(|p| p.elem_count()).sum()
    }
}

/// Which modules a parameter is attributed to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamScope {
    /// Only the module that owns the parameter.
    #[default]
    Direct,
    /// The owning module and all its ancestors.
    Recursive,
}

#[derive(Debug, Clone)]
struct Parameter {
    value: Tensor,
    grad: Option<Tensor>,
}

#[derive(Debug, Clone)]
pub struct ModuleNode {
    name: String,
    params: Vec<Parameter>,
}

impl ParamNode for ModuleNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn parameters(&self) -> Vec<&Tensor> {
        self.params.iter().map(|p| &p.value).collect()
    }

    fn has_gradient(&self) -> Result<bool> {
        for p in self.params.iter() {
            if let Some(grad) = &p.grad {
                let sum = grad.sum_all()?.to_dtype(DType::F64)?.to_scalar::<f64>()?;
                if sum != 0. {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }
}

pub fn is_buffer(name: &str) -> bool {
    let last = name.rsplit('.').next().unwrap_or(name);
    BUFFER_SUFFIXES.contains(&last)
}

// Dotted paths compare segment-wise, numeric segments by value so that `b.10` follows `b.2`.
fn cmp_paths(a: &str, b: &str) -> Ordering {
    let mut a = a.split('.');
    let mut b = b.split('.');
    loop {
        match (a.next(), b.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => {
                let ord = match (x.parse::<usize>(), y.parse::<usize>()) {
                    (Ok(x), Ok(y)) => x.cmp(&y),
                    _ => x.cmp(y),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}

/// Ordered list of named modules, the root (`""`) first, then a depth-first pre-order walk.
#[derive(Debug, Clone)]
pub struct ModuleTree {
    nodes: Vec<ModuleNode>,
}

impl ModuleTree {
    pub fn from_vars<'a, I>(vars: I, grads: Option<&GradStore>, scope: ParamScope) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a Var)>,
    {
        let mut params = vars
            .into_iter()
            .filter(|(name, _)| !is_buffer(name))
            .collect::<Vec<_>>();
        params.sort_by(|(a, _), (b, _)| cmp_paths(a, b));

        let mut nodes = vec![ModuleNode {
            name: String::new(),
            params: vec![],
        }];
        let mut index = HashMap::new();
        for (name, var) in params {
            let segments = name.split('.').collect::<Vec<_>>();
            let owner_depth = segments.len() - 1;
            // Index of the node for every ancestor, root included.
            let mut chain = vec![0];
            for depth in 1..=owner_depth {
                let path = segments[..depth].join(".");
                let idx = *index.entry(path.clone()).or_insert_with(|| {
                    nodes.push(ModuleNode {
                        name: path,
                        params: vec![],
                    });
                    nodes.len() - 1
                });
                chain.push(idx);
            }
            let param = Parameter {
                value: var.as_tensor().clone(),
                grad: grads.and_then(|g| g.get(var.as_tensor())).cloned(),
            };
            match scope {
                ParamScope::Direct => nodes[chain[owner_depth]].params.push(param),
                ParamScope::Recursive => {
                    for &idx in chain.iter() {
                        nodes[idx].params.push(param.clone())
                    }
                }
            }
        }
        Self { nodes }
    }

    pub fn nodes(&self) -> &[ModuleNode] {
        &self.nodes
    }
}

/// Backpropagates the sum of the predictions for a standard-normal input of shape
/// `(1, c, h, w)`, populating gradients for the variables the model was built from.
pub fn synthetic_gradients(
    model: &YoloV8,
    (c, h, w): (usize, usize, usize),
    device: &Device,
) -> Result<GradStore> {
    let xs = Tensor::randn(0f32, 1., (1, c, h, w), device)?;
    let loss = model.forward_with(&xs, None)?.sum_all()?;
    loss.backward()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerStat {
    pub index: usize,
    pub name: String,
    pub num_params: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerStats {
    pub layers: Vec<LayerStat>,
    pub total: usize,
}

/// Parameter counts of the modules owning at least one parameter, indexed by their position
/// among all modules.
///
/// Modules are recovered from the parameter names, so modules without parameters
/// (activations, upsampling, concatenation) are absent and do not take an index.
pub fn layer_stats<N: ParamNode>(nodes: &[N]) -> LayerStats {
    let layers = nodes
        .iter()
        .enumerate()
        .filter_map(|(index, node)| {
            if node.parameters().is_empty() {
                return None;
            }
            Some(LayerStat {
                index,
                name: node.name().to_string(),
                num_params: node.num_parameters(),
            })
        })
        .collect::<Vec<_>>();
    let total = layers.iter().map(|l| l.num_params).sum();
    LayerStats { layers, total }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GradientStatus {
    pub index: usize,
    pub name: String,
    pub has_gradient: bool,
}

pub fn gradient_status<N: ParamNode>(nodes: &[N]) -> Result<Vec<GradientStatus>> {
    let mut statuses = vec![];
    for (index, node) in nodes.iter().enumerate() {
        if node.parameters().is_empty() {
            continue;
        }
        statuses.push(GradientStatus {
            index,
            name: node.name().to_string(),
            has_gradient: node.has_gradient()?,
        })
    }
    Ok(statuses)
}

/// Formats an integer with comma thousands separators.
pub fn with_commas(n: usize) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

pub fn write_header<W: Write>(w: &mut W, title: &str) -> std::io::Result<()> {
    writeln!(w, "\n{RULE}")?;
    writeln!(w, "{title}")?;
    writeln!(w, "{RULE}")
}

pub fn write_rule<W: Write>(w: &mut W) -> std::io::Result<()> {
    writeln!(w, "{RULE}")
}

pub fn write_layer_stats<W: Write>(w: &mut W, stats: &LayerStats) -> std::io::Result<()> {
    write_header(w, "Layer-wise Parameter Statistics")?;
    for layer in stats.layers.iter() {
        writeln!(
            w,
            "Layer {:3} | {:<40} | Params: {:.4} M",
            layer.index,
            layer.name,
            layer.num_params as f64 / 1e6
        )?;
    }
    write_rule(w)?;
    writeln!(
        w,
        "Total Params: {:.2} M ({} params)",
        stats.total as f64 / 1e6,
        with_commas(stats.total)
    )?;
    write_rule(w)
}

pub fn write_gradient_status<W: Write>(
    w: &mut W,
    statuses: &[GradientStatus],
) -> std::io::Result<()> {
    write_header(w, "Layer-wise Gradient Status")?;
    for status in statuses.iter() {
        let msg = if status.has_gradient {
            "Gradient exists"
        } else {
            "No gradient/Zero gradient"
        };
        writeln!(w, "Layer {:3} | {:<40} | {msg}", status.index, status.name)?;
    }
    if !statuses.iter().any(|s| s.has_gradient) {
        writeln!(
            w,
            "\nNote: No valid gradients found (Model not trained on sample data yet)"
        )?;
    }
    write_rule(w)
}
