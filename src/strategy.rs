//! Selection of the code-generation strategy, per invoke and for the whole
//! machine.\
//! Nearly everything stays on the static track; the interpreter wrapper is
//! the escape hatch for documents whose structure is not resolvable at
//! compile time.

use std::collections::HashSet;

use crate::model::{Invoke, InvokeStrategy, Model, SCXML_INVOKE_TYPES};

/// Classification of the whole machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MachineStrategy {
    /// Generate the static unit (script-engine hybrid allowed).
    Static,
    /// Emit a thin stub delegating to the runtime interpreter.
    InterpreterWrapper { reason: String },
}

/// Per-invoke strategy.
///
/// A compile-time known child (src file or inline `<scxml>`) under an SCXML
/// family type is PureStatic. A runtime expression (`srcexpr`/`contentexpr`)
/// makes the invoke StaticHybrid: the parent stays static, only the child is
/// interpreted. `srcexpr` is uniformly StaticHybrid; it needs the script
/// engine for the path, not a full wrapper. Everything else falls back to the
/// interpreter.
pub fn classify_invoke(invoke: &Invoke) -> InvokeStrategy {
    let scxml_family = SCXML_INVOKE_TYPES.contains(&invoke.type_uri.as_str());
    let has_static_child = !invoke.src.is_empty() || invoke.has_inline_scxml;
    let has_runtime_expr = !invoke.src_expr.is_empty() || !invoke.content_expr.is_empty();

    if scxml_family && has_runtime_expr {
        InvokeStrategy::StaticHybrid
    } else if scxml_family && has_static_child {
        InvokeStrategy::PureStatic
    } else {
        InvokeStrategy::InterpreterFallback
    }
}

/// Decides whether the machine can be generated statically.
///
/// Only two conditions force the wrapper: an unresolved initial
/// configuration, and datamodel variable names declared more than once
/// (scoped datamodels need runtime scoping the static unit does not model).
/// Parallel, history, hybrid invokes and `_event` access all stay static.
pub fn classify_machine(model: &Model) -> MachineStrategy {
    if model.initial.is_empty() {
        return MachineStrategy::InterpreterWrapper {
            reason: "no initial state".to_string(),
        };
    }

    let missing: Vec<&str> = model
        .initial
        .split_whitespace()
        .filter(|t| !model.states.contains_key(*t))
        .collect();
    if !missing.is_empty() {
        return MachineStrategy::InterpreterWrapper {
            reason: format!("initial state(s) '{}' not found", missing.join(", ")),
        };
    }

    let mut seen: HashSet<&str> = HashSet::new();
    let mut duplicates: Vec<&str> = Vec::new();
    let all_vars = model.variables.iter().map(|v| v.id.as_str()).chain(
        model
            .states
            .values()
            .flat_map(|s| s.datamodel.iter().map(|v| v.id.as_str())),
    );
    for id in all_vars {
        if !seen.insert(id) && !duplicates.contains(&id) {
            duplicates.push(id);
        }
    }
    if !duplicates.is_empty() {
        duplicates.sort_unstable();
        return MachineStrategy::InterpreterWrapper {
            reason: format!(
                "scoped datamodel (duplicate variables: {})",
                duplicates.join(", ")
            ),
        };
    }

    MachineStrategy::Static
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Invoke;
    use crate::normalize::normalize;
    use crate::scxml_reader::parse_from_xml;

    fn invoke(type_uri: &str, src: &str, src_expr: &str, content_expr: &str, inline: bool) -> Invoke {
        Invoke {
            type_uri: type_uri.to_string(),
            src: src.to_string(),
            src_expr: src_expr.to_string(),
            content_expr: content_expr.to_string(),
            has_inline_scxml: inline,
            ..Default::default()
        }
    }

    #[test]
    fn static_child_is_pure_static() {
        assert_eq!(
            classify_invoke(&invoke("", "child.scxml", "", "", false)),
            InvokeStrategy::PureStatic
        );
        assert_eq!(
            classify_invoke(&invoke("scxml", "", "", "", true)),
            InvokeStrategy::PureStatic
        );
        assert_eq!(
            classify_invoke(&invoke("http://www.w3.org/TR/scxml/", "child.scxml", "", "", false)),
            InvokeStrategy::PureStatic
        );
    }

    #[test]
    fn runtime_expressions_are_hybrid() {
        assert_eq!(
            classify_invoke(&invoke("", "", "pathVar", "", false)),
            InvokeStrategy::StaticHybrid
        );
        assert_eq!(
            classify_invoke(&invoke("scxml", "", "", "scxmlVar", false)),
            InvokeStrategy::StaticHybrid
        );
    }

    #[test]
    fn unsupported_type_or_no_child_falls_back() {
        assert_eq!(
            classify_invoke(&invoke("http://example.com/vm", "x.bin", "", "", false)),
            InvokeStrategy::InterpreterFallback
        );
        assert_eq!(
            classify_invoke(&invoke("scxml", "", "", "", false)),
            InvokeStrategy::InterpreterFallback
        );
    }

    fn machine(xml: &str) -> Model {
        let mut model = parse_from_xml(xml).unwrap();
        normalize(&mut model).unwrap();
        model
    }

    #[test]
    fn empty_document_needs_wrapper() {
        let model = machine("<scxml xmlns='http://www.w3.org/2005/07/scxml'></scxml>");
        assert!(matches!(
            classify_machine(&model),
            MachineStrategy::InterpreterWrapper { .. }
        ));
    }

    #[test]
    fn unknown_initial_needs_wrapper() {
        let model = machine(
            "<scxml xmlns='http://www.w3.org/2005/07/scxml' initial='ghost'>\
             <state id='a'/></scxml>",
        );
        match classify_machine(&model) {
            MachineStrategy::InterpreterWrapper { reason } => {
                assert!(reason.contains("ghost"));
            }
            other => panic!("expected wrapper, got {:?}", other),
        }
    }

    #[test]
    fn duplicate_variables_need_wrapper() {
        let model = machine(
            "<scxml xmlns='http://www.w3.org/2005/07/scxml' initial='a'>\
             <datamodel><data id='Var1' expr='0'/></datamodel>\
             <state id='a'><datamodel><data id='Var1' expr='1'/></datamodel></state></scxml>",
        );
        match classify_machine(&model) {
            MachineStrategy::InterpreterWrapper { reason } => {
                assert!(reason.contains("Var1"));
            }
            other => panic!("expected wrapper, got {:?}", other),
        }
    }

    #[test]
    fn parallel_history_and_hybrid_stay_static() {
        let model = machine(
            "<scxml xmlns='http://www.w3.org/2005/07/scxml' initial='p'>\
             <parallel id='p'>\
             <state id='r1'><history id='h'><transition target='r1a'/></history>\
             <state id='r1a'/></state>\
             <state id='r2'><invoke srcexpr='Var1'/><state id='r2a'/></state>\
             </parallel></scxml>",
        );
        assert_eq!(classify_machine(&model), MachineStrategy::Static);
    }
}
