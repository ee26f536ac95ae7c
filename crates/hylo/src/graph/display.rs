use std::fmt;

use super::{Graph, GraphInput, Node, Operation};

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_line(f, 0, &format!("graph @{} {{", self.name))?;
        if !self.inputs.is_empty() {
            write_line(f, 1, "inputs:")?;
            for input in &self.inputs {
                write_line(f, 2, &format_input(input))?;
            }
        }
        if !self.nodes.is_empty() {
            write_line(f, 1, "body:")?;
            for node in &self.nodes {
                fmt_node(node, 2, f)?;
            }
        }
        if !self.outputs.is_empty() {
            let outputs = join_values(self.outputs.iter().map(|value| value.to_string()));
            write_line(f, 1, &format!("outputs: [{outputs}]"))?;
        }
        write_line(f, 0, "}")
    }
}

fn format_input(input: &GraphInput) -> String {
    let dtype = input
        .dtype
        .map(|dtype| dtype.to_string())
        .unwrap_or_else(|| "?".to_string());
    let shape = input
        .shape
        .as_ref()
        .map(|shape| shape.to_string())
        .unwrap_or_else(|| "?".to_string());
    format!("{} \"{}\" : tensor<{dtype} x {shape}>", input.value, input.name)
}

fn fmt_node(node: &Node, indent: usize, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let results = join_values(node.outputs.iter().map(|value| value.to_string()));
    let operands = join_values(node.inputs.iter().map(|value| value.to_string()));
    let line = format!(
        "{} {results} = {}({operands})",
        node.id,
        format_operation(&node.op)
    );
    write_line(f, indent, &line)
}

fn format_operation(op: &Operation) -> String {
    match op {
        Operation::Constant(literal) => format!("constant<{}>", literal.spec),
        Operation::Unary(kind) => format!("{kind:?}").to_ascii_lowercase(),
        Operation::Binary(kind) => format!("{kind:?}").to_ascii_lowercase(),
        Operation::Custom(spec) => format!("custom<{}>", spec.target),
        Operation::EngineCall(spec) => format!(
            "engine_call<segment={}, runtime={}, layers={}>",
            spec.segment, spec.artifact.manifest.runtime, spec.artifact.manifest.layer_count
        ),
        Operation::MatMul | Operation::Identity | Operation::PlaceholderConst => {
            op.kind().name().to_string()
        }
        other => format!("{}{}", other.kind().name(), format_attrs(other)),
    }
}

fn format_attrs(op: &Operation) -> String {
    let raw = format!("{op:?}");
    match raw.find('(') {
        Some(start) => format!("<{}>", raw[start + 1..raw.len() - 1].trim()),
        None => String::new(),
    }
}

fn join_values(values: impl Iterator<Item = String>) -> String {
    values.collect::<Vec<_>>().join(", ")
}

fn write_line(f: &mut fmt::Formatter<'_>, indent: usize, line: &str) -> fmt::Result {
    for _ in 0..indent {
        f.write_str("  ")?;
    }
    writeln!(f, "{line}")
}
