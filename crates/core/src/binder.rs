//! Translation between a [`ParameterRecord`] and node fields of a
//! [`WorkflowGraph`].
//!
//! A binding table lists, per parameter, the node/field addresses it is
//! written to and the default reported when reading it back from a
//! template that lacks the node. [`bind`] and [`extract`] read the same
//! table, so the addresses always agree.

use serde_json::Value;

use crate::params::{ParamValue, ParameterRecord};
use crate::workflow::{Node, WorkflowGraph};

/// One node/field location inside a graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldAddr {
    pub node: &'static str,
    pub field: &'static str,
}

/// Default value reported by [`extract`] when the address is absent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DefaultValue {
    Int(i64),
    Float(f64),
    Text(&'static str),
}

impl DefaultValue {
    pub fn to_param(self) -> ParamValue {
        match self {
            Self::Int(i) => ParamValue::Int(i),
            Self::Float(f) => ParamValue::Float(f),
            Self::Text(s) => ParamValue::Text(s.to_string()),
        }
    }

    /// Convert `value` to this default's kind, if it is representable.
    pub fn coerce(self, value: &ParamValue) -> Option<ParamValue> {
        match self {
            Self::Int(_) => value.as_i64().map(ParamValue::Int),
            Self::Float(_) => value.as_f64().map(ParamValue::Float),
            Self::Text(_) => match value {
                ParamValue::Bool(_) => None,
                other => Some(ParamValue::Text(other.to_text())),
            },
        }
    }
}

/// How a parameter is stored in the node field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// Stored as the JSON scalar itself.
    Plain,
    /// Stored as a string (e.g. a "String" primitive node feeding a
    /// float input). The binding's default fixes the value's kind: values
    /// are coerced to it on bind and parsed back as it on extract.
    Stringified,
}

/// A parameter and every address it is written to.
#[derive(Debug, Clone, Copy)]
pub struct Binding {
    pub param: &'static str,
    /// Written in order on bind; the first present one is read on extract.
    pub targets: &'static [FieldAddr],
    pub default: DefaultValue,
    pub encoding: Encoding,
    /// Node type to create when the target node is missing. `None` means
    /// a missing node is skipped.
    pub auto_create: Option<&'static str>,
}

impl Binding {
    pub const fn plain(
        param: &'static str,
        targets: &'static [FieldAddr],
        default: DefaultValue,
    ) -> Self {
        Self {
            param,
            targets,
            default,
            encoding: Encoding::Plain,
            auto_create: None,
        }
    }

    pub const fn stringified(mut self) -> Self {
        self.encoding = Encoding::Stringified;
        self
    }

    pub const fn auto_create(mut self, kind: &'static str) -> Self {
        self.auto_create = Some(kind);
        self
    }

    /// Field value for `value`; `None` when a string-typed binding
    /// cannot represent it.
    fn encode(&self, value: &ParamValue) -> Option<Value> {
        match self.encoding {
            Encoding::Plain => Some(value.to_json()),
            Encoding::Stringified => {
                let text = match self.default.coerce(value)? {
                    // Debug keeps the decimal point, so 1.0 is written as "1.0".
                    ParamValue::Float(f) => format!("{f:?}"),
                    other => other.to_text(),
                };
                Some(Value::String(text))
            }
        }
    }

    fn decode(&self, value: &Value) -> Option<ParamValue> {
        let raw = ParamValue::from_json(value)?;
        match self.encoding {
            Encoding::Plain => Some(raw),
            Encoding::Stringified => self.default.coerce(&raw),
        }
    }
}

/// Return a copy of `graph` with every bound parameter of `params`
/// written to its addresses.
///
/// Parameters without a binding are ignored. Addresses whose node is
/// missing are skipped unless the binding auto-creates the node. The
/// input graph is never modified.
pub fn bind(graph: &WorkflowGraph, params: &ParameterRecord, table: &[Binding]) -> WorkflowGraph {
    let mut out = graph.clone();

    for binding in table {
        let Some(value) = params.get(binding.param) else {
            continue;
        };
        let Some(encoded) = binding.encode(value) else {
            tracing::warn!(
                param = binding.param,
                value = ?value,
                "Parameter value does not fit its field; leaving template value",
            );
            continue;
        };

        for target in binding.targets {
            if out.set_field(target.node, target.field, encoded.clone()) {
                continue;
            }
            match binding.auto_create {
                Some(kind) => {
                    tracing::debug!(
                        node = target.node,
                        kind,
                        param = binding.param,
                        "Creating missing workflow node",
                    );
                    out.insert_node(
                        target.node,
                        Node::new(kind).with_field(target.field, encoded.clone()),
                    );
                }
                None => {
                    tracing::trace!(
                        node = target.node,
                        param = binding.param,
                        "Skipping parameter for absent node",
                    );
                }
            }
        }
    }

    for (name, _) in params.iter() {
        if !table.iter().any(|b| b.param == name) {
            tracing::trace!(param = %name, "Parameter has no binding");
        }
    }

    out
}

/// Read every bound parameter from `graph`, substituting the binding's
/// default where the node or field is absent.
pub fn extract(graph: &WorkflowGraph, table: &[Binding]) -> ParameterRecord {
    let mut record = ParameterRecord::new();

    for binding in table {
        let value = binding
            .targets
            .iter()
            .find_map(|t| graph.field(t.node, t.field))
            .and_then(|v| binding.decode(v))
            .unwrap_or_else(|| binding.default.to_param());
        record.insert(binding.param, value);
    }

    record
}
