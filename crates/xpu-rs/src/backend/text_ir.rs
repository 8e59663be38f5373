use std::collections::HashMap;
use std::fmt::Write as _;

use thiserror::Error;

use crate::backend::backend_config::BackendConfig;
use crate::backend::computation::Computation;
use crate::backend::module::Module;
use crate::backend::spec::{
    BinaryOp, CompId, ComparisonDirection, CustomOp, DType, InstId, Instruction, NewInstruction,
    OpMetadata, Opcode, Shape, Sharding, UnaryOp,
};

/// Errors raised while parsing the HLO-like text format used by tests and dumps.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TextIrError {
    #[error("line {line}: {message}")]
    Syntax { line: usize, message: String },
    #[error("{0}")]
    Message(String),
}

impl TextIrError {
    fn new(msg: impl Into<String>) -> Self {
        TextIrError::Message(msg.into())
    }

    fn at(line: usize, err: TextIrError) -> Self {
        match err {
            TextIrError::Message(message) => TextIrError::Syntax { line, message },
            other => other,
        }
    }
}

/// Parses a module written in the HLO-like text syntax.
///
/// # Example
/// ```
/// use xpu_rs::backend::text_ir::parse_module;
///
/// let module = parse_module(r#"
/// HloModule double
///
/// ENTRY %main {
///   %x = f32[4] parameter(0)
///   ROOT %sum = f32[4] add(%x, %x)
/// }
/// "#).expect("valid module");
/// assert_eq!(module.entry_computation().instruction_count(), 2);
/// ```
pub fn parse_module(src: &str) -> Result<Module, TextIrError> {
    let mut module_name = String::from("module");
    let mut computations: Vec<Computation> = Vec::new();
    let mut comp_ids: HashMap<String, CompId> = HashMap::new();
    let mut entry: Option<usize> = None;
    let mut current: Option<(Computation, HashMap<String, InstId>)> = None;

    for (line_no, raw) in src.lines().enumerate() {
        let line_no = line_no + 1;
        let line = raw.trim();
        if line.is_empty() || line.starts_with("//") {
            continue;
        }
        if let Some(name) = line.strip_prefix("HloModule") {
            module_name = name.trim().trim_end_matches(',').to_string();
            continue;
        }
        if line == "}" {
            let (comp, _) = current
                .take()
                .ok_or_else(|| TextIrError::Syntax {
                    line: line_no,
                    message: "unmatched `}`".to_string(),
                })?;
            comp.verify()
                .map_err(|e| TextIrError::at(line_no, TextIrError::new(e.to_string())))?;
            comp_ids.insert(comp.name().to_string(), CompId(computations.len() as u32));
            computations.push(comp);
            continue;
        }
        if let Some(header) = line.strip_suffix('{') {
            if current.is_some() {
                return Err(TextIrError::Syntax {
                    line: line_no,
                    message: "nested computation".to_string(),
                });
            }
            let header = header.trim();
            let (is_entry, name) = match header.strip_prefix("ENTRY") {
                Some(rest) => (true, rest.trim()),
                None => (false, header),
            };
            let name = normalize_name(name);
            if name.is_empty() {
                return Err(TextIrError::Syntax {
                    line: line_no,
                    message: "computation name is missing".to_string(),
                });
            }
            if is_entry {
                entry = Some(computations.len());
            }
            current = Some((Computation::new(name), HashMap::new()));
            continue;
        }
        let Some((comp, names)) = current.as_mut() else {
            return Err(TextIrError::Syntax {
                line: line_no,
                message: format!("statement outside of a computation: `{line}`"),
            });
        };
        parse_instruction(line, comp, names, &comp_ids).map_err(|e| TextIrError::at(line_no, e))?;
    }

    if current.is_some() {
        return Err(TextIrError::new("missing `}` at end of input"));
    }
    let entry_index = entry.unwrap_or(computations.len().saturating_sub(1));
    let mut iter = computations.into_iter();
    let first = iter
        .next()
        .ok_or_else(|| TextIrError::new("module has no computations"))?;
    let mut module = Module::new(module_name, first);
    for comp in iter {
        module.add_computation(comp);
    }
    module
        .set_entry(CompId(entry_index as u32))
        .map_err(|e| TextIrError::new(e.to_string()))?;
    Ok(module)
}

fn parse_instruction(
    line: &str,
    comp: &mut Computation,
    names: &mut HashMap<String, InstId>,
    comp_ids: &HashMap<String, CompId>,
) -> Result<(), TextIrError> {
    let (is_root, line) = match line.strip_prefix("ROOT ") {
        Some(rest) => (true, rest.trim()),
        None => (false, line),
    };
    let (lhs, rhs) = line
        .split_once('=')
        .ok_or_else(|| TextIrError::new("expected `%name = shape opcode(...)`"))?;
    let name = normalize_name(lhs.trim());
    let rhs = rhs.trim();

    let shape_end = if rhs.starts_with('(') {
        find_matching(rhs, 0, '(', ')')
    } else {
        rhs.find(']')
    }
    .ok_or_else(|| TextIrError::new(format!("malformed shape in `{rhs}`")))?;
    let shape = parse_shape(&rhs[..=shape_end])?;
    let rest = rhs[shape_end + 1..].trim();

    let open = rest
        .find('(')
        .ok_or_else(|| TextIrError::new(format!("missing operand list in `{rest}`")))?;
    let mnemonic = rest[..open].trim();
    let close = find_matching(rest, open, '(', ')')
        .ok_or_else(|| TextIrError::new("unbalanced operand list"))?;
    let operand_text = rest[open + 1..close].trim();
    let attr_text = rest[close + 1..].trim().trim_start_matches(',');

    let mut attrs: HashMap<&str, &str> = HashMap::new();
    for piece in split_top_level(attr_text, ',') {
        let (key, value) = piece
            .split_once('=')
            .ok_or_else(|| TextIrError::new(format!("malformed attribute `{piece}`")))?;
        attrs.insert(key.trim(), value.trim());
    }

    let lookup = |operand: &str| -> Result<InstId, TextIrError> {
        let key = normalize_name(operand);
        names
            .get(&key)
            .copied()
            .ok_or_else(|| TextIrError::new(format!("unknown operand `%{key}`")))
    };

    let mut operands = Vec::new();
    let opcode = match mnemonic {
        "parameter" => Opcode::Parameter {
            number: parse_usize(operand_text)?,
        },
        "constant" => Opcode::Constant {
            value: operand_text
                .parse::<f64>()
                .map_err(|_| TextIrError::new(format!("invalid constant `{operand_text}`")))?,
        },
        _ => {
            for operand in split_top_level(operand_text, ',') {
                operands.push(lookup(operand)?);
            }
            parse_opcode(mnemonic, &attrs, comp_ids)?
        }
    };

    let mut new = NewInstruction::new(opcode, shape, operands).named(name.clone());
    if let Some(value) = attrs.get("sharding") {
        new = new.with_sharding(Some(parse_sharding(value)?));
    }
    if let Some(value) = attrs.get("backend_config") {
        let config = BackendConfig::from_json(value)
            .map_err(|e| TextIrError::new(format!("invalid backend_config: {e}")))?;
        new = new.with_backend_config(config);
    }
    if let Some(value) = attrs.get("metadata") {
        new = new.with_metadata(Some(parse_metadata(value)));
    }
    let id = comp
        .add_instruction(new)
        .map_err(|e| TextIrError::new(e.to_string()))?;
    if let Some(value) = attrs.get("control-predecessors") {
        let inner = strip_braces(value);
        for pred in split_top_level(inner, ',') {
            let pred = lookup(pred)?;
            comp.add_control_dependency(pred, id)
                .map_err(|e| TextIrError::new(e.to_string()))?;
        }
    }
    if comp[id].name() != name {
        return Err(TextIrError::new(format!("duplicate instruction name `%{name}`")));
    }
    names.insert(name, id);
    if is_root {
        comp.set_root(id)
            .map_err(|e| TextIrError::new(e.to_string()))?;
    }
    Ok(())
}

fn parse_opcode(
    mnemonic: &str,
    attrs: &HashMap<&str, &str>,
    comp_ids: &HashMap<String, CompId>,
) -> Result<Opcode, TextIrError> {
    let attr = |key: &str| required_attr(attrs, mnemonic, key);
    let callee = |key: &str| -> Result<CompId, TextIrError> {
        let name = normalize_name(required_attr(attrs, mnemonic, key)?);
        comp_ids
            .get(&name)
            .copied()
            .ok_or_else(|| TextIrError::new(format!("unknown computation `%{name}`")))
    };
    let opcode = match mnemonic {
        "tuple" => Opcode::Tuple,
        "get-tuple-element" => Opcode::GetTupleElement {
            index: parse_usize(attr("index")?)?,
        },
        "negate" => Opcode::Unary(UnaryOp::Negate),
        "abs" => Opcode::Unary(UnaryOp::Abs),
        "exponential" => Opcode::Unary(UnaryOp::Exp),
        "log" => Opcode::Unary(UnaryOp::Log),
        "sqrt" => Opcode::Unary(UnaryOp::Sqrt),
        "rsqrt" => Opcode::Unary(UnaryOp::Rsqrt),
        "tanh" => Opcode::Unary(UnaryOp::Tanh),
        "add" => Opcode::Binary(BinaryOp::Add),
        "subtract" => Opcode::Binary(BinaryOp::Subtract),
        "multiply" => Opcode::Binary(BinaryOp::Multiply),
        "divide" => Opcode::Binary(BinaryOp::Divide),
        "maximum" => Opcode::Binary(BinaryOp::Maximum),
        "minimum" => Opcode::Binary(BinaryOp::Minimum),
        "power" => Opcode::Binary(BinaryOp::Power),
        "compare" => {
            let direction = attr("direction")?;
            Opcode::Compare(ComparisonDirection::parse(direction).ok_or_else(|| {
                TextIrError::new(format!("unknown comparison direction `{direction}`"))
            })?)
        }
        "select" => Opcode::Select,
        "convert" => Opcode::Convert,
        "broadcast" => Opcode::Broadcast {
            dims: parse_usize_list(attrs.get("dimensions").copied().unwrap_or("{}"))?,
        },
        "reshape" => Opcode::Reshape,
        "slice" => Opcode::Slice {
            starts: parse_usize_list(attr("starts")?)?,
            limits: parse_usize_list(attr("limits")?)?,
        },
        "pad" => Opcode::Pad {
            low: parse_usize_list(attr("low")?)?,
            high: parse_usize_list(attr("high")?)?,
        },
        "dynamic-slice" => Opcode::DynamicSlice {
            sizes: parse_usize_list(attr("dynamic_slice_sizes")?)?,
        },
        "dynamic-update-slice" => Opcode::DynamicUpdateSlice,
        "concatenate" => {
            let dims = parse_usize_list(attr("dimensions")?)?;
            let [dim] = dims.as_slice() else {
                return Err(TextIrError::new("concatenate takes exactly one dimension"));
            };
            Opcode::Concatenate { dim: *dim }
        }
        "call" => Opcode::Call {
            computation: callee("to_apply")?,
        },
        "fusion" => Opcode::Fusion {
            computation: callee("calls")?,
        },
        "all-reduce" => Opcode::AllReduce,
        other => Opcode::Custom(parse_custom_op(other, attrs)?),
    };
    Ok(opcode)
}

fn required_attr<'a>(
    attrs: &HashMap<&str, &'a str>,
    mnemonic: &str,
    key: &str,
) -> Result<&'a str, TextIrError> {
    attrs
        .get(key)
        .copied()
        .ok_or_else(|| TextIrError::new(format!("`{mnemonic}` requires `{key}=`")))
}

fn parse_custom_op(mnemonic: &str, attrs: &HashMap<&str, &str>) -> Result<CustomOp, TextIrError> {
    let factors = || -> Result<Vec<usize>, TextIrError> {
        let value = attrs.get("replication_factors").ok_or_else(|| {
            TextIrError::new(format!("`{mnemonic}` requires `replication_factors=`"))
        })?;
        parse_usize_list(value)
    };
    let group = || -> Result<usize, TextIrError> {
        let value = attrs.get("replica_group_size").ok_or_else(|| {
            TextIrError::new(format!("`{mnemonic}` requires `replica_group_size=`"))
        })?;
        parse_usize(value)
    };
    let op = match mnemonic {
        "remote-parameter-load" => CustomOp::RemoteParameterLoad {
            replication_factors: factors()?,
        },
        "remote-parameter-store" => CustomOp::RemoteParameterStore {
            replication_factors: factors()?,
        },
        "buffer-load-slice" => CustomOp::BufferLoadSlice {
            replication_factors: factors()?,
        },
        "buffer-store-slice" => CustomOp::BufferStoreSlice {
            replication_factors: factors()?,
        },
        "all-gather" => CustomOp::AllGather {
            replica_group_size: group()?,
        },
        "reduce-scatter" => CustomOp::ReduceScatter {
            replica_group_size: group()?,
        },
        "replication-index" => CustomOp::ReplicationIndex,
        "multi-update" => CustomOp::MultiUpdate,
        "multi-update-add" => CustomOp::MultiUpdateAdd,
        "gradient-accumulator-create" => CustomOp::GradientAccumulatorCreate,
        "gradient-accumulator-add" => CustomOp::GradientAccumulatorAdd,
        "send-to-host" => CustomOp::SendToHost,
        "recv-from-host" => CustomOp::RecvFromHost,
        "send-recv-barrier" => CustomOp::SendRecvBarrier,
        other => return Err(TextIrError::new(format!("unknown opcode `{other}`"))),
    };
    Ok(op)
}

/// Parses `f32[2,3]`, `f32[]` or a parenthesised tuple of shapes.
pub fn parse_shape(src: &str) -> Result<Shape, TextIrError> {
    let trimmed = src.trim();
    if let Some(body) = trimmed.strip_prefix('(').and_then(|s| s.strip_suffix(')')) {
        let elements = split_top_level(body, ',')
            .into_iter()
            .map(parse_shape)
            .collect::<Result<Vec<_>, _>>()?;
        return Ok(Shape::tuple(elements));
    }
    let open = trimmed
        .find('[')
        .ok_or_else(|| TextIrError::new(format!("malformed shape `{trimmed}`")))?;
    let dtype = DType::parse(&trimmed[..open])
        .ok_or_else(|| TextIrError::new(format!("unsupported dtype in `{trimmed}`")))?;
    let dims_text = trimmed[open + 1..]
        .strip_suffix(']')
        .ok_or_else(|| TextIrError::new(format!("malformed shape `{trimmed}`")))?;
    Ok(Shape::array(dtype, parse_usize_list(dims_text)?))
}

fn parse_sharding(src: &str) -> Result<Sharding, TextIrError> {
    let inner = strip_braces(src);
    if inner.starts_with('{') {
        let elements = split_top_level(inner, ',')
            .into_iter()
            .map(parse_sharding)
            .collect::<Result<Vec<_>, _>>()?;
        return Ok(Sharding::Tuple(elements));
    }
    if inner == "replicated" {
        return Ok(Sharding::Replicated);
    }
    if let Some(device) = inner.strip_prefix("maximal device=") {
        return Ok(Sharding::Maximal {
            device: parse_usize(device)? as u32,
        });
    }
    Err(TextIrError::new(format!("unsupported sharding `{src}`")))
}

fn parse_metadata(src: &str) -> OpMetadata {
    let field = |key: &str| -> String {
        let needle = format!("{key}=\"");
        src.find(&needle)
            .and_then(|start| {
                let rest = &src[start + needle.len()..];
                rest.find('"').map(|end| rest[..end].to_string())
            })
            .unwrap_or_default()
    };
    OpMetadata {
        op_type: field("op_type"),
        op_name: field("op_name"),
    }
}

fn normalize_name(name: &str) -> String {
    name.trim().trim_start_matches('%').to_string()
}

fn strip_braces(src: &str) -> &str {
    let trimmed = src.trim();
    trimmed
        .strip_prefix('{')
        .and_then(|s| s.strip_suffix('}'))
        .unwrap_or(trimmed)
        .trim()
}

fn parse_usize(src: &str) -> Result<usize, TextIrError> {
    let tok = src.trim();
    tok.parse::<usize>()
        .map_err(|_| TextIrError::new(format!("invalid integer `{tok}`")))
}

fn parse_usize_list(value: &str) -> Result<Vec<usize>, TextIrError> {
    let inner = value
        .trim()
        .trim_start_matches(['[', '{'])
        .trim_end_matches([']', '}']);
    if inner.trim().is_empty() {
        return Ok(Vec::new());
    }
    inner.split(',').map(parse_usize).collect()
}

fn find_matching(src: &str, start: usize, open: char, close: char) -> Option<usize> {
    let mut depth = 0isize;
    for (idx, ch) in src[start..].char_indices() {
        if ch == open {
            depth += 1;
        } else if ch == close {
            depth -= 1;
            if depth == 0 {
                return Some(start + idx);
            }
        }
    }
    None
}

/// Splits on `delimiter` outside of brackets, braces, parentheses and string literals.
fn split_top_level(input: &str, delimiter: char) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut start = 0usize;
    for (idx, ch) in input.char_indices() {
        match ch {
            '"' => in_string = !in_string,
            '(' | '[' | '{' if !in_string => depth += 1,
            ')' | ']' | '}' if !in_string => depth = depth.saturating_sub(1),
            c if c == delimiter && depth == 0 && !in_string => {
                let piece = input[start..idx].trim();
                if !piece.is_empty() {
                    pieces.push(piece);
                }
                start = idx + c.len_utf8();
            }
            _ => {}
        }
    }
    let tail = input[start..].trim();
    if !tail.is_empty() {
        pieces.push(tail);
    }
    pieces
}

/// Renders a module; the output parses back with [`parse_module`].
pub fn print_module(module: &Module) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "HloModule {}", module.name());
    let mut order = module.computations_post_order();
    for id in module.computation_ids() {
        if !order.contains(&id) {
            order.insert(0, id);
        }
    }
    for id in order {
        out.push('\n');
        out.push_str(&print_computation(module, id));
    }
    out
}

pub fn print_computation(module: &Module, id: CompId) -> String {
    let comp = &module[id];
    let mut out = String::new();
    let prefix = if id == module.entry() { "ENTRY " } else { "" };
    let _ = writeln!(out, "{prefix}%{} {{", comp.name());
    for inst_id in comp.post_order() {
        let _ = writeln!(out, "  {}", print_instruction(module, comp, inst_id));
    }
    out.push_str("}\n");
    out
}

pub fn print_instruction(module: &Module, comp: &Computation, id: InstId) -> String {
    let inst = &comp[id];
    let mut out = String::new();
    if comp.is_root(id) {
        out.push_str("ROOT ");
    }
    let _ = write!(out, "%{} = {} {}(", inst.name(), inst.shape(), inst.opcode().mnemonic());
    match inst.opcode() {
        Opcode::Parameter { number } => {
            let _ = write!(out, "{number}");
        }
        Opcode::Constant { value } => {
            let _ = write!(out, "{value}");
        }
        _ => {
            let names: Vec<String> = inst
                .operands()
                .iter()
                .map(|op| format!("%{}", comp[*op].name()))
                .collect();
            out.push_str(&names.join(", "));
        }
    }
    out.push(')');
    push_opcode_attrs(&mut out, module, inst);
    if let Some(sharding) = inst.sharding() {
        let _ = write!(out, ", sharding={sharding}");
    }
    if !inst.control_predecessors().is_empty() {
        let mut preds: Vec<InstId> = inst.control_predecessors().to_vec();
        preds.sort();
        let names: Vec<String> = preds
            .iter()
            .map(|p| format!("%{}", comp[*p].name()))
            .collect();
        let _ = write!(out, ", control-predecessors={{{}}}", names.join(", "));
    }
    if let Some(metadata) = inst.metadata() {
        let _ = write!(
            out,
            ", metadata={{op_type=\"{}\" op_name=\"{}\"}}",
            metadata.op_type, metadata.op_name
        );
    }
    if !inst.backend_config().is_empty() {
        if let Ok(json) = inst.backend_config().to_json() {
            let _ = write!(out, ", backend_config={json}");
        }
    }
    out
}

fn push_opcode_attrs(out: &mut String, module: &Module, inst: &Instruction) {
    let list = |values: &[usize]| -> String {
        let parts: Vec<String> = values.iter().map(|v| v.to_string()).collect();
        format!("{{{}}}", parts.join(","))
    };
    let callee_name = |id: CompId| -> String {
        module
            .computation(id)
            .map(|c| c.name().to_string())
            .unwrap_or_else(|_| format!("missing.{}", id.0))
    };
    match inst.opcode() {
        Opcode::GetTupleElement { index } => {
            let _ = write!(out, ", index={index}");
        }
        Opcode::Compare(direction) => {
            let _ = write!(out, ", direction={}", direction.name());
        }
        Opcode::Broadcast { dims } => {
            let _ = write!(out, ", dimensions={}", list(dims));
        }
        Opcode::Slice { starts, limits } => {
            let _ = write!(out, ", starts={}, limits={}", list(starts), list(limits));
        }
        Opcode::Pad { low, high } => {
            let _ = write!(out, ", low={}, high={}", list(low), list(high));
        }
        Opcode::DynamicSlice { sizes } => {
            let _ = write!(out, ", dynamic_slice_sizes={}", list(sizes));
        }
        Opcode::Concatenate { dim } => {
            let _ = write!(out, ", dimensions={{{dim}}}");
        }
        Opcode::Call { computation } => {
            let _ = write!(out, ", to_apply=%{}", callee_name(*computation));
        }
        Opcode::Fusion { computation } => {
            let _ = write!(out, ", calls=%{}", callee_name(*computation));
        }
        Opcode::Custom(op) => {
            if let Some(factors) = op.replication_factors() {
                let _ = write!(out, ", replication_factors={}", list(factors));
            }
            if let CustomOp::AllGather { replica_group_size }
            | CustomOp::ReduceScatter { replica_group_size } = op
            {
                let _ = write!(out, ", replica_group_size={replica_group_size}");
            }
        }
        _ => {}
    }
}

/// Parses a module from text, panicking with the parse error. Intended for tests.
#[macro_export]
macro_rules! hlo_module {
    ($src:expr) => {{
        $crate::backend::text_ir::parse_module($src).expect("failed to parse HLO text module")
    }};
}
