//! Run-scoped state shared by every operator strategy.
//!
//! The context owns the rewritten node sequence, the new initializers and the
//! quantized-value map (original tensor name → its quantized identity). A
//! tensor moves `Float → PendingQuantize → Quantized` at most once per run;
//! later requests reuse the recorded identity.
//!
//! Strategies work in two steps. `plan_*` methods only read state and return
//! `None` when a parameter is missing, so a strategy can give up without side
//! effects. `commit_*`, `register_output` and `enqueue_output` then mutate.

use std::collections::{HashMap, HashSet};
use std::mem;

use tracing::debug;

use crate::calibration::TensorRangeTable;
use crate::config::{QuantFormat, QuantizationConfig};
use crate::errors::{QuantizeError, Result};
use crate::graph::{Graph, GraphIndex, Initializer, Node, TensorData, MS_DOMAIN};
use crate::onnx_utils::graph_builder::implicit_inputs;
use crate::onnx_utils::quantization_nodes::{
    build_bias_tensor, build_dequantize_linear_node, build_param_tensors, build_quantize_linear_node,
    build_quantized_tensor, build_scale_tensor, build_zero_point_tensor, quantized_name, scale_name,
    zero_point_name, QdqNames,
};
use crate::quantization::{quantize_bias, quantize_per_channel, QuantParams, QuantType};

// ===========================================================================
// Public types
// ===========================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    /// Activation quantized at its consumer; the float tensor still exists.
    Input,
    /// Constant folded into a quantized initializer.
    Initializer,
    /// Produced in quantized form by a rewritten node.
    Output,
}

/// Quantized identity of one original tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizedValue {
    pub original_name: String,
    pub quantized_name: String,
    pub scale_name: String,
    pub zero_point_name: String,
    pub kind: ValueKind,
    /// Per-channel axis, `None` for per-tensor parameters.
    pub axis: Option<i64>,
    pub scales: Vec<f32>,
    /// QDQ: output of the shared DequantizeLinear, once emitted.
    pub dequantized_name: Option<String>,
}

/// How an input is quantized when it has no identity yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputRole {
    /// Activation parameters from calibration; constants are fitted to their data.
    Activation,
    /// Weight type, fitted to the data, optionally per-channel along `axis`.
    Weight { axis: Option<i64> },
}

/// A tensor the rewritten node should read, with its parameter tensors.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizedInput {
    pub original: String,
    /// QOperator: the quantized tensor. QDQ: the dequantized tensor.
    pub name: String,
    pub scale_name: String,
    pub zero_point_name: String,
    pub scales: Vec<f32>,
    pub axis: Option<i64>,
}

#[derive(Debug, Clone)]
struct ConstantPlan {
    qtype: QuantType,
    dims: Vec<i64>,
    codes: Vec<i32>,
    zero_points: Vec<i32>,
    axis: Option<i64>,
}

#[derive(Debug, Clone)]
enum PlanSource {
    Existing,
    Activation(QuantParams),
    Constant(ConstantPlan),
    /// Parameters computed at run time by a DynamicQuantizeLinear.
    Dynamic,
}

/// Parameters an input will get, computed without touching the context.
#[derive(Debug, Clone)]
pub struct InputPlan {
    pub tensor: String,
    pub scales: Vec<f32>,
    /// Node that reads the input.
    consumer: String,
    source: PlanSource,
}

impl InputPlan {
    /// Names of the scale and zero-point tensors this input will use.
    fn param_names(&self, values: &HashMap<String, QuantizedValue>) -> (String, String) {
        match values.get(&self.tensor) {
            Some(v) => (v.scale_name.clone(), v.zero_point_name.clone()),
            None => (scale_name(&self.tensor), zero_point_name(&self.tensor)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BiasPlan {
    tensor: String,
    quantized: Option<(Vec<i64>, Vec<f32>, Vec<i32>)>,
}

/// Where an output's parameters come from.
#[derive(Debug, Clone, Copy)]
pub enum OutputSource<'p> {
    /// Its own calibrated range.
    Own,
    /// The parameters of a (planned) input.
    SharedWith(&'p InputPlan),
}

#[derive(Debug, Clone)]
enum OutputParams {
    Own(QuantParams),
    Shared {
        scale_name: String,
        zero_point_name: String,
        scales: Vec<f32>,
    },
}

#[derive(Debug, Clone)]
pub struct OutputPlan {
    pub tensor: String,
    params: OutputParams,
}

/// What the finished run needs to know about the context.
#[derive(Debug, Clone, Default)]
pub struct RewriteSummary {
    pub nodes: Vec<Node>,
    pub initializers: Vec<Initializer>,
    pub quantized_values: usize,
    pub custom_domain_used: bool,
    pub per_channel_emitted: bool,
}

// ===========================================================================
// Context
// ===========================================================================

pub struct QuantizationContext<'a> {
    config: &'a QuantizationConfig,
    index: GraphIndex<'a>,
    ranges: &'a TensorRangeTable,
    format: QuantFormat,
    values: HashMap<String, QuantizedValue>,
    nodes: Vec<Node>,
    initializers: Vec<Initializer>,
    initializer_names: HashSet<String>,
    pending: Vec<OutputPlan>,
    /// QOperator: fused-away float tensors brought back by a DequantizeLinear.
    restored: HashSet<String>,
    /// QDQ: dedicated pairs emitted so far per tensor.
    dedicated_pairs: HashMap<String, usize>,
    /// QDQ: dedicated pair output per (tensor, consumer node).
    dedicated_wired: HashMap<(String, String), String>,
    custom_domain_used: bool,
    per_channel_emitted: bool,
}

impl std::fmt::Debug for QuantizationContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuantizationContext")
            .field("format", &self.format)
            .field("values", &self.values.len())
            .field("nodes", &self.nodes.len())
            .field("initializers", &self.initializers.len())
            .finish()
    }
}

impl<'a> QuantizationContext<'a> {
    pub fn new(config: &'a QuantizationConfig, graph: &'a Graph, ranges: &'a TensorRangeTable) -> Self {
        let existing = graph.initializers.iter().map(|i| i.name.clone()).collect();
        Self {
            config,
            index: GraphIndex::new(graph),
            ranges,
            format: config.quant_format,
            values: HashMap::new(),
            nodes: Vec::with_capacity(graph.nodes.len() * 2),
            initializers: Vec::new(),
            initializer_names: existing,
            pending: Vec::new(),
            restored: HashSet::new(),
            dedicated_pairs: HashMap::new(),
            dedicated_wired: HashMap::new(),
            custom_domain_used: false,
            per_channel_emitted: false,
        }
    }

    pub fn config(&self) -> &'a QuantizationConfig {
        self.config
    }

    pub fn index(&self) -> &GraphIndex<'a> {
        &self.index
    }

    pub fn format(&self) -> QuantFormat {
        self.format
    }

    pub fn value(&self, name: &str) -> Option<&QuantizedValue> {
        self.values.get(name)
    }

    pub fn is_quantized(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn activation_symmetric(&self) -> bool {
        self.config.extra_options.activation_symmetric
    }

    /// Activation parameters from the calibrated range of `name`.
    pub fn activation_params(&self, name: &str) -> Option<QuantParams> {
        let range = self.ranges.get(name)?;
        Some(QuantParams::from_range(
            range.min,
            range.max,
            self.config.activation_type,
            self.config.extra_options.activation_symmetric,
            false,
        ))
    }

    // -----------------------------------------------------------------------
    // Inputs
    // -----------------------------------------------------------------------

    /// Plan the quantization of input `index` of `node`. `Ok(None)` when the
    /// slot is empty or no parameters can be derived.
    pub fn plan_input(&self, node: &Node, index: usize, role: InputRole) -> Result<Option<InputPlan>> {
        let Some(tensor) = node.input(index) else {
            return Ok(None);
        };

        if let Some(v) = self.values.get(tensor) {
            return Ok(Some(InputPlan {
                tensor: tensor.to_string(),
                scales: v.scales.clone(),
                consumer: consumer_key(node),
                source: PlanSource::Existing,
            }));
        }

        if let Some(init) = self.index.float_initializer(tensor) {
            if init.element_count() == 0 {
                return Ok(None);
            }
            return self.plan_constant(node, init, role).map(Some);
        }
        if self.index.is_initializer(tensor) {
            return Ok(None);
        }

        Ok(self.activation_params(tensor).map(|p| InputPlan {
            tensor: tensor.to_string(),
            scales: vec![p.scale],
            consumer: consumer_key(node),
            source: PlanSource::Activation(p),
        }))
    }

    fn plan_constant(&self, node: &Node, init: &Initializer, role: InputRole) -> Result<InputPlan> {
        let cfg = self.config;
        let extra = &cfg.extra_options;
        let (qtype, symmetric, reduce_range, axis) = match role {
            InputRole::Weight { axis } => (cfg.weight_type, extra.weight_symmetric, cfg.reduce_range, axis),
            // QDQ folds every constant with the weight type.
            InputRole::Activation if self.format == QuantFormat::QDQ => {
                (cfg.weight_type, extra.weight_symmetric, false, None)
            }
            InputRole::Activation => (cfg.activation_type, extra.activation_symmetric, false, None),
        };

        let array = init.to_f32_array()?;
        let rank = array.ndim() as i64;
        let axis = axis
            .map(|a| if a < 0 { a + rank } else { a })
            .filter(|a| {
                let ok = (0..rank).contains(a);
                if !ok {
                    debug!(tensor = %init.name, axis = a, rank, "per-channel axis out of range, using per-tensor");
                }
                ok
            });

        let (scales, zero_points, codes) = match axis {
            Some(a) => {
                let (params, codes) = quantize_per_channel(&array, a as usize, qtype, symmetric, reduce_range)?;
                (params.scales, params.zero_points, codes)
            }
            None => {
                let data: Vec<f32> = array.iter().copied().collect();
                let params = QuantParams::from_data(&data, qtype, symmetric, reduce_range);
                let codes = data.iter().map(|&v| params.quantize(v)).collect();
                (vec![params.scale], vec![params.zero_point], codes)
            }
        };

        Ok(InputPlan {
            tensor: init.name.clone(),
            scales,
            consumer: consumer_key(node),
            source: PlanSource::Constant(ConstantPlan {
                qtype,
                dims: init.dims.clone(),
                codes,
                zero_points,
                axis,
            }),
        })
    }

    /// Plan a run-time quantization of activation `index`. `None` for empty
    /// slots, initializers and non-float tensors.
    pub fn plan_dynamic_input(&self, node: &Node, index: usize) -> Option<InputPlan> {
        let tensor = node.input(index)?;
        let source = if self.values.contains_key(tensor) {
            PlanSource::Existing
        } else if self.index.is_initializer(tensor) {
            return None;
        } else {
            PlanSource::Dynamic
        };
        if self.index.elem_type(tensor).is_some_and(|t| !t.is_float()) {
            return None;
        }
        Some(InputPlan {
            tensor: tensor.to_string(),
            scales: self.values.get(tensor).map(|v| v.scales.clone()).unwrap_or_default(),
            consumer: consumer_key(node),
            source,
        })
    }

    /// Plan several inputs at once; `None` if any of them cannot be quantized.
    pub fn plan_inputs(&self, node: &Node, roles: &[(usize, InputRole)]) -> Result<Option<Vec<InputPlan>>> {
        let mut plans = Vec::with_capacity(roles.len());
        for &(index, role) in roles {
            match self.plan_input(node, index, role)? {
                Some(plan) => plans.push(plan),
                None => {
                    debug!(node = %node.name, op = %node.op_type, input = index, "no quantization parameters");
                    return Ok(None);
                }
            }
        }
        Ok(Some(plans))
    }

    pub fn commit_inputs(&mut self, plans: Vec<InputPlan>) -> Result<Vec<QuantizedInput>> {
        plans.into_iter().map(|p| self.commit_input(p)).collect()
    }

    /// Give the planned input its quantized identity (if it has none yet) and
    /// return what the consumer should read.
    pub fn commit_input(&mut self, plan: InputPlan) -> Result<QuantizedInput> {
        if !self.values.contains_key(&plan.tensor) {
            match plan.source {
                PlanSource::Existing => {
                    return Err(QuantizeError::GraphTransform {
                        reason: format!("stale plan for '{}'", plan.tensor),
                    })
                }
                PlanSource::Activation(params) => self.add_activation(&plan.tensor, params),
                PlanSource::Constant(constant) => self.add_constant(&plan.tensor, plan.scales, constant),
                PlanSource::Dynamic => self.add_dynamic(&plan.tensor),
            }
        }
        self.wire(&plan.tensor, Some(&plan.consumer))
    }

    /// Quantize the inputs at `indices`: constants with the weight type when
    /// `use_weight_type`, otherwise everything with activation parameters.
    /// Returns index-aligned inputs, or `None` without side effects when any
    /// parameter is missing.
    pub fn quantize_inputs(
        &mut self,
        node: &Node,
        indices: &[usize],
        use_weight_type: bool,
    ) -> Result<Option<Vec<QuantizedInput>>> {
        let role = if use_weight_type {
            InputRole::Weight { axis: None }
        } else {
            InputRole::Activation
        };
        let roles: Vec<(usize, InputRole)> = indices.iter().map(|&i| (i, role)).collect();
        match self.plan_inputs(node, &roles)? {
            Some(plans) => self.commit_inputs(plans).map(Some),
            None => Ok(None),
        }
    }

    fn add_activation(&mut self, tensor: &str, params: QuantParams) {
        let scale = scale_name(tensor);
        let zero_point = zero_point_name(tensor);
        for init in build_param_tensors(&scale, &zero_point, &params) {
            self.add_initializer(init);
        }

        let names = QdqNames::new(tensor, None);
        let quantized = match self.format {
            QuantFormat::QOperator => {
                let q = quantized_name(tensor);
                self.nodes.push(build_quantize_linear_node(
                    &names.quantize_node,
                    tensor,
                    &scale,
                    &zero_point,
                    &q,
                    None,
                ));
                q
            }
            QuantFormat::QDQ => names.quantize_output,
        };

        debug!(tensor, scale = params.scale, zero_point = params.zero_point, "activation quantized");
        self.values.insert(
            tensor.to_string(),
            QuantizedValue {
                original_name: tensor.to_string(),
                quantized_name: quantized,
                scale_name: scale,
                zero_point_name: zero_point,
                kind: ValueKind::Input,
                axis: None,
                scales: vec![params.scale],
                dequantized_name: None,
            },
        );
    }

    /// `DynamicQuantizeLinear` producing the quantized tensor and both
    /// parameters from the float tensor.
    fn add_dynamic(&mut self, tensor: &str) {
        let quantized = quantized_name(tensor);
        let scale = scale_name(tensor);
        let zero_point = zero_point_name(tensor);
        let names = QdqNames::new(tensor, None);
        self.nodes.push(Node::new(
            "DynamicQuantizeLinear",
            names.quantize_node,
            vec![tensor.to_string()],
            vec![quantized.clone(), scale.clone(), zero_point.clone()],
        ));

        debug!(tensor, "activation quantized at run time");
        self.values.insert(
            tensor.to_string(),
            QuantizedValue {
                original_name: tensor.to_string(),
                quantized_name: quantized,
                scale_name: scale,
                zero_point_name: zero_point,
                kind: ValueKind::Input,
                axis: None,
                scales: Vec::new(),
                dequantized_name: None,
            },
        );
    }

    fn add_constant(&mut self, tensor: &str, scales: Vec<f32>, constant: ConstantPlan) {
        let scale = scale_name(tensor);
        let zero_point = zero_point_name(tensor);
        let per_channel = constant.axis.is_some();
        self.add_initializer(build_scale_tensor(&scale, &scales, per_channel));
        self.add_initializer(build_zero_point_tensor(
            &zero_point,
            &constant.zero_points,
            constant.qtype,
            per_channel,
        ));

        let names = QdqNames::new(tensor, None);
        let (quantized, dequantized) = match self.format {
            QuantFormat::QDQ if self.config.extra_options.add_qdq_pair_to_weight => {
                self.nodes.push(build_quantize_linear_node(
                    &names.quantize_node,
                    tensor,
                    &scale,
                    &zero_point,
                    &names.quantize_output,
                    constant.axis,
                ));
                self.nodes.push(build_dequantize_linear_node(
                    &names.dequantize_node,
                    &names.quantize_output,
                    &scale,
                    &zero_point,
                    &names.dequantize_output,
                    constant.axis,
                ));
                (names.quantize_output, Some(names.dequantize_output))
            }
            QuantFormat::QDQ => {
                let q = quantized_name(tensor);
                self.add_initializer(build_quantized_tensor(&q, &constant.codes, &constant.dims, constant.qtype));
                self.nodes.push(build_dequantize_linear_node(
                    &names.dequantize_node,
                    &q,
                    &scale,
                    &zero_point,
                    &names.dequantize_output,
                    constant.axis,
                ));
                (q, Some(names.dequantize_output))
            }
            QuantFormat::QOperator => {
                let q = quantized_name(tensor);
                self.add_initializer(build_quantized_tensor(&q, &constant.codes, &constant.dims, constant.qtype));
                (q, None)
            }
        };

        if self.format == QuantFormat::QDQ && per_channel {
            self.per_channel_emitted = true;
        }

        debug!(tensor, channels = scales.len(), qtype = %constant.qtype, "constant quantized");
        self.values.insert(
            tensor.to_string(),
            QuantizedValue {
                original_name: tensor.to_string(),
                quantized_name: quantized,
                scale_name: scale,
                zero_point_name: zero_point,
                kind: ValueKind::Initializer,
                axis: constant.axis,
                scales,
                dequantized_name: dequantized,
            },
        );
    }

    fn dedicated(&self, tensor: &str) -> bool {
        self.config.extra_options.dedicated_qdq_pair && self.index.consumers(tensor).len() > 1
    }

    /// Q/DQ pair reading the float tensor; returns the DequantizeLinear output.
    fn emit_pair(&mut self, value: &QuantizedValue, pair: Option<usize>) -> String {
        let names = QdqNames::new(&value.original_name, pair);
        self.nodes.push(build_quantize_linear_node(
            &names.quantize_node,
            &value.original_name,
            &value.scale_name,
            &value.zero_point_name,
            &names.quantize_output,
            value.axis,
        ));
        self.nodes.push(build_dequantize_linear_node(
            &names.dequantize_node,
            &names.quantize_output,
            &value.scale_name,
            &value.zero_point_name,
            &names.dequantize_output,
            value.axis,
        ));
        names.dequantize_output
    }

    /// Name a consumer should read for an already-quantized tensor. A node
    /// reading the same tensor twice gets one dedicated pair.
    fn wire(&mut self, tensor: &str, consumer: Option<&str>) -> Result<QuantizedInput> {
        let value = self
            .values
            .get(tensor)
            .cloned()
            .ok_or_else(|| QuantizeError::UnresolvedParams {
                tensor: tensor.to_string(),
            })?;

        let name = match (self.format, value.kind) {
            (QuantFormat::QOperator, _) => value.quantized_name.clone(),
            (QuantFormat::QDQ, ValueKind::Initializer) => value
                .dequantized_name
                .clone()
                .unwrap_or_else(|| value.quantized_name.clone()),
            (QuantFormat::QDQ, _) if self.dedicated(tensor) => {
                let key = consumer.map(|c| (tensor.to_string(), c.to_string()));
                match key.as_ref().and_then(|k| self.dedicated_wired.get(k)) {
                    Some(dq) => dq.clone(),
                    None => {
                        let count = self.dedicated_pairs.entry(tensor.to_string()).or_insert(0);
                        *count += 1;
                        let k = *count;
                        let dq = self.emit_pair(&value, Some(k));
                        if let Some(key) = key {
                            self.dedicated_wired.insert(key, dq.clone());
                        }
                        dq
                    }
                }
            }
            (QuantFormat::QDQ, _) => match &value.dequantized_name {
                Some(dq) => dq.clone(),
                None => {
                    let dq = self.emit_pair(&value, None);
                    if let Some(v) = self.values.get_mut(tensor) {
                        v.dequantized_name = Some(dq.clone());
                    }
                    dq
                }
            },
        };

        Ok(QuantizedInput {
            original: value.original_name,
            name,
            scale_name: value.scale_name,
            zero_point_name: value.zero_point_name,
            scales: value.scales,
            axis: value.axis,
        })
    }

    // -----------------------------------------------------------------------
    // Bias
    // -----------------------------------------------------------------------

    /// Plan an int32 bias with `scale = input_scale × weight_scale`. The bias
    /// must be a float initializer.
    pub fn plan_bias(
        &self,
        node: &Node,
        index: usize,
        input: &InputPlan,
        weight: &InputPlan,
    ) -> Result<Option<BiasPlan>> {
        let Some(tensor) = node.input(index) else {
            return Ok(None);
        };
        if self.values.contains_key(tensor) {
            return Ok(Some(BiasPlan {
                tensor: tensor.to_string(),
                quantized: None,
            }));
        }

        let Some(init) = self.index.float_initializer(tensor) else {
            return Ok(None);
        };
        let Some(&input_scale) = input.scales.first() else {
            return Ok(None);
        };

        let data: Vec<f32> = init.to_f32_array()?.iter().copied().collect();
        let (scales, codes) = quantize_bias(&data, input_scale, &weight.scales)?;
        Ok(Some(BiasPlan {
            tensor: tensor.to_string(),
            quantized: Some((init.dims.clone(), scales, codes)),
        }))
    }

    pub fn commit_bias(&mut self, plan: BiasPlan) -> Result<QuantizedInput> {
        let Some((dims, scales, codes)) = plan.quantized else {
            return self.wire(&plan.tensor, None);
        };
        if self.values.contains_key(&plan.tensor) {
            return self.wire(&plan.tensor, None);
        }

        let tensor = plan.tensor.as_str();
        let q = quantized_name(tensor);
        let scale = scale_name(&q);
        let zero_point = zero_point_name(&q);
        let per_channel = scales.len() > 1;
        let axis = per_channel.then_some(0);
        let zp_dims = if per_channel { vec![scales.len() as i64] } else { Vec::new() };

        self.add_initializer(build_bias_tensor(&q, codes, &dims));
        self.add_initializer(build_scale_tensor(&scale, &scales, per_channel));
        self.add_initializer(Initializer::new(
            zero_point.clone(),
            zp_dims,
            TensorData::Int32(vec![0; scales.len()]),
        ));

        let dequantized = match self.format {
            QuantFormat::QOperator => None,
            QuantFormat::QDQ => {
                let names = QdqNames::new(tensor, None);
                self.nodes.push(build_dequantize_linear_node(
                    &names.dequantize_node,
                    &q,
                    &scale,
                    &zero_point,
                    &names.dequantize_output,
                    axis,
                ));
                self.per_channel_emitted |= per_channel;
                Some(names.dequantize_output)
            }
        };

        debug!(tensor, "bias quantized to int32");
        self.values.insert(
            tensor.to_string(),
            QuantizedValue {
                original_name: tensor.to_string(),
                quantized_name: q,
                scale_name: scale,
                zero_point_name: zero_point,
                kind: ValueKind::Initializer,
                axis,
                scales,
                dequantized_name: dequantized,
            },
        );
        self.wire(tensor, None)
    }

    // -----------------------------------------------------------------------
    // Outputs
    // -----------------------------------------------------------------------

    /// Plan parameters for output `index` of `node`.
    pub fn plan_output(&self, node: &Node, index: usize, source: OutputSource<'_>) -> Option<OutputPlan> {
        let tensor = node.outputs.get(index).filter(|n| !n.is_empty())?;
        if self.values.contains_key(tensor) {
            return None;
        }
        let params = match source {
            OutputSource::Own => OutputParams::Own(self.activation_params(tensor)?),
            OutputSource::SharedWith(input) => {
                let (scale_name, zero_point_name) = input.param_names(&self.values);
                if input.scales.len() != 1 {
                    return None;
                }
                OutputParams::Shared {
                    scale_name,
                    zero_point_name,
                    scales: input.scales.clone(),
                }
            }
        };
        Some(OutputPlan {
            tensor: tensor.clone(),
            params,
        })
    }

    fn materialize(&mut self, plan: &OutputPlan) -> (String, String, Vec<f32>) {
        match &plan.params {
            OutputParams::Own(params) => {
                let scale = scale_name(&plan.tensor);
                let zero_point = zero_point_name(&plan.tensor);
                for init in build_param_tensors(&scale, &zero_point, params) {
                    self.add_initializer(init);
                }
                (scale, zero_point, vec![params.scale])
            }
            OutputParams::Shared {
                scale_name,
                zero_point_name,
                scales,
            } => (scale_name.clone(), zero_point_name.clone(), scales.clone()),
        }
    }

    /// QOperator: record that a rewritten node produces `<tensor>_quantized`.
    pub fn register_output(&mut self, plan: OutputPlan) -> QuantizedInput {
        let (scale, zero_point, scales) = self.materialize(&plan);
        let value = QuantizedValue {
            original_name: plan.tensor.clone(),
            quantized_name: quantized_name(&plan.tensor),
            scale_name: scale,
            zero_point_name: zero_point,
            kind: ValueKind::Output,
            axis: None,
            scales,
            dequantized_name: None,
        };
        let out = QuantizedInput {
            original: value.original_name.clone(),
            name: value.quantized_name.clone(),
            scale_name: value.scale_name.clone(),
            zero_point_name: value.zero_point_name.clone(),
            scales: value.scales.clone(),
            axis: None,
        };
        self.values.insert(plan.tensor, value);
        out
    }

    /// QDQ: mark an output for quantization once its producer is emitted.
    pub fn enqueue_output(&mut self, plan: OutputPlan) {
        self.pending.push(plan);
    }

    /// QDQ: insert the Q/DQ pairs of every enqueued output. Called after the
    /// producing node has been pushed.
    ///
    /// A graph output keeps its name: the producer is renamed to
    /// `<t>_QuantizeLinear_Input` and the DequantizeLinear writes `<t>`.
    /// Tensors with dedicated pairs get them at each consumer instead.
    pub fn flush_pending_outputs(&mut self) {
        for plan in mem::take(&mut self.pending) {
            let (scale, zero_point, scales) = self.materialize(&plan);
            let tensor = plan.tensor;
            let names = QdqNames::new(&tensor, None);
            let mut value = QuantizedValue {
                original_name: tensor.clone(),
                quantized_name: names.quantize_output.clone(),
                scale_name: scale,
                zero_point_name: zero_point,
                kind: ValueKind::Output,
                axis: None,
                scales,
                dequantized_name: None,
            };

            if !self.dedicated(&tensor) {
                if self.index.is_graph_output(&tensor) {
                    let q_input = format!("{tensor}_QuantizeLinear_Input");
                    self.rename_produced(&tensor, &q_input);
                    self.nodes.push(build_quantize_linear_node(
                        &names.quantize_node,
                        &q_input,
                        &value.scale_name,
                        &value.zero_point_name,
                        &names.quantize_output,
                        None,
                    ));
                    self.nodes.push(build_dequantize_linear_node(
                        &names.dequantize_node,
                        &names.quantize_output,
                        &value.scale_name,
                        &value.zero_point_name,
                        &tensor,
                        None,
                    ));
                    value.dequantized_name = Some(tensor.clone());
                } else {
                    value.dequantized_name = Some(self.emit_pair(&value, None));
                }
            }

            debug!(tensor = %tensor, "output quantized");
            self.values.insert(tensor, value);
        }
    }

    fn rename_produced(&mut self, tensor: &str, new_name: &str) {
        if let Some(out) = self
            .nodes
            .iter_mut()
            .rev()
            .flat_map(|n| n.outputs.iter_mut())
            .find(|o| o.as_str() == tensor)
        {
            *out = new_name.to_string();
        }
    }

    /// QOperator: `output` becomes another name for the quantized `input`
    /// (the node between them is dropped). Returns `false` if `input` is not
    /// quantized.
    pub fn alias_output(&mut self, output: &str, input: &str) -> bool {
        let Some(value) = self.values.get(input).cloned() else {
            return false;
        };
        let alias = QuantizedValue {
            original_name: output.to_string(),
            kind: ValueKind::Output,
            dequantized_name: None,
            ..value
        };
        self.values.insert(output.to_string(), alias);
        true
    }

    // -----------------------------------------------------------------------
    // Emission
    // -----------------------------------------------------------------------

    pub fn push_node(&mut self, node: Node) {
        if node.domain == MS_DOMAIN {
            self.custom_domain_used = true;
        }
        self.nodes.push(node);
    }

    /// Add an initializer unless one with the same name exists.
    pub fn add_initializer(&mut self, init: Initializer) {
        if self.initializer_names.insert(init.name.clone()) {
            self.initializers.push(init);
        }
    }

    /// Copy `node` verbatim. In QOperator mode any input whose float producer
    /// was fused away is first restored by a DequantizeLinear.
    pub fn emit_unchanged(&mut self, node: &Node) {
        if self.format == QuantFormat::QOperator {
            let mut reads: Vec<String> = node.inputs.iter().filter(|i| !i.is_empty()).cloned().collect();
            reads.extend(implicit_inputs(node));
            for tensor in reads {
                self.restore_float(&tensor);
            }
        }
        self.nodes.push(node.clone());
    }

    fn restore_float(&mut self, tensor: &str) {
        let Some(value) = self.values.get(tensor) else {
            return;
        };
        if value.kind != ValueKind::Output || self.restored.contains(tensor) {
            return;
        }
        let names = QdqNames::new(tensor, None);
        let node = build_dequantize_linear_node(
            &names.dequantize_node,
            &value.quantized_name,
            &value.scale_name,
            &value.zero_point_name,
            tensor,
            value.axis,
        );
        self.restored.insert(tensor.to_string());
        self.nodes.push(node);
    }

    /// QOperator: restore every graph output that now only exists quantized.
    pub fn restore_graph_outputs(&mut self) {
        let outputs: Vec<String> = self.index.graph().outputs.iter().map(|o| o.name.clone()).collect();
        for name in outputs {
            self.restore_float(&name);
        }
    }

    pub fn finish(self) -> RewriteSummary {
        RewriteSummary {
            nodes: self.nodes,
            initializers: self.initializers,
            quantized_values: self.values.len(),
            custom_domain_used: self.custom_domain_used,
            per_channel_emitted: self.per_channel_emitted,
        }
    }
}

/// Identity of a consumer node; unnamed nodes fall back to their outputs.
fn consumer_key(node: &Node) -> String {
    if node.name.is_empty() {
        node.outputs.join(",")
    } else {
        node.name.clone()
    }
}
