//! Classification of guard- and value-expressions without executing them.\
//! Expressions are partitioned into a small closed taxonomy; the tractable
//! cases get statically-typed dispatches, the remainder is delegated to the
//! script engine. Classification never fails, unclassifiable expressions
//! default to [CondKind::RequiresEngine].

use lazy_static::lazy_static;
use regex::Regex;

use crate::model::{Action, CondKind, Model};

/// *W3C says*:
/// The SCXML Processor MUST provide the set of system variables below to the
/// data model: `_event`, `_sessionid`, `_name`, `_ioprocessors`, `_x`.
/// Access to any `_event` field forces evaluation through the script engine.
pub const EVENT_METADATA_FIELDS: [&str; 7] = [
    "_event.name",
    "_event.data",
    "_event.type",
    "_event.sendid",
    "_event.origin",
    "_event.origintype",
    "_event.invokeid",
];

/// ECMAScript feature substrings that always force the script engine.
const JS_FEATURES: [&str; 6] = ["typeof", "_event.", "function", "var ", "let ", "const "];

/// ECMAScript comparison and logical operators.
const ECMASCRIPT_OPERATORS: [&str; 10] = ["==", "!=", "===", "!==", "&&", "||", "<=", ">=", "<", ">"];

/// ECMAScript keywords that disqualify an expression as a pure In() predicate.
const ECMA_KEYWORDS: [&str; 7] = [
    "typeof", "_event", "function", "var", "let", "const", "return",
];

/// Reserved words of the target language. Expressions headed by one of these
/// would break direct embedding and must go through the script engine so that
/// `error.execution` is raised per W3C instead of a compile error.
const TARGET_RESERVED: [&str; 33] = [
    "return", "break", "continue", "goto", "switch", "case", "default", "if", "else", "while",
    "do", "for", "class", "struct", "typedef", "using", "namespace", "template", "typename",
    "static", "extern", "inline", "virtual", "operator", "new", "delete", "this", "throw", "try",
    "catch", "public", "private", "protected",
];

lazy_static! {
    /// Only `In('…')` atoms joined by `&&`, `||`, parentheses and whitespace.
    static ref PURE_IN: Regex =
        Regex::new(r"^[\s()&|]*(?:In\('[^']+'\)[\s()&|]*)+$").unwrap();
    static ref IN_ATOM: Regex = Regex::new(r"In\('([^']+)'\)").unwrap();
    /// System-reserved identifiers starting with an underscore.
    static ref UNDERSCORE_IDENT: Regex = Regex::new(r"\b_[a-zA-Z]\w*\b").unwrap();
    static ref SINGLE_QUOTED: Regex = Regex::new(r"^'([^'\\]*)'$").unwrap();
    static ref DOUBLE_QUOTED: Regex = Regex::new(r#"^"([^"\\]*)"$"#).unwrap();
}

/// Normalizes XML-escaped operators. Attribute values usually arrive already
/// unescaped, doubly-escaped documents still occur in the wild.
fn normalize_operators(expr: &str) -> String {
    expr.replace("&amp;&amp;", "&&").replace("&amp;|", "||")
}

/// True if the expression contains only `In('id')` predicates combined with
/// `&&`, `||` and parentheses.
///
/// `In(variable)`, `In("id")` and anything mixing In() with ECMAScript is
/// rejected.
pub fn is_pure_in_predicate(expr: &str) -> bool {
    if expr.is_empty() || !expr.contains("In(") {
        return false;
    }
    let clean = normalize_operators(expr);
    let clean = clean.trim();
    if !PURE_IN.is_match(clean) {
        return false;
    }
    for keyword in ECMA_KEYWORDS {
        if clean.contains(keyword) {
            return false;
        }
    }
    true
}

/// Rewrites a pure In() predicate into the native active-state check.
///
/// `In('s1') && In('s2')` becomes
/// `this->isStateActive("s1") && this->isStateActive("s2")`.
pub fn to_native_predicate(expr: &str) -> String {
    let native = normalize_operators(expr);
    IN_ATOM
        .replace_all(&native, "this->isStateActive(\"$1\")")
        .into_owned()
}

/// Classifies a guard condition. Pure In() predicates stay static, anything
/// else evaluates through the script engine to preserve ECMAScript truthiness
/// (a bare string literal guard like `'test'` is truthy and still needs the
/// engine).
pub fn classify_guard(cond: &str) -> (CondKind, String) {
    if cond.is_empty() {
        (CondKind::None, String::new())
    } else if is_pure_in_predicate(cond) {
        (CondKind::PureIn, to_native_predicate(cond))
    } else {
        (CondKind::RequiresEngine, String::new())
    }
}

/// True for a simple quoted string without escapes or interpolation.
/// Such `<param>` expressions can be embedded at compile time.
pub fn is_static_string_literal(expr: &str) -> bool {
    let trimmed = expr.trim();
    !trimmed.is_empty() && (SINGLE_QUOTED.is_match(trimmed) || DOUBLE_QUOTED.is_match(trimmed))
}

/// Extracts the value of a static string literal, without the quotes.
pub fn static_string_value(expr: &str) -> String {
    let trimmed = expr.trim();
    if let Some(c) = SINGLE_QUOTED.captures(trimmed) {
        return c[1].to_string();
    }
    if let Some(c) = DOUBLE_QUOTED.captures(trimmed) {
        return c[1].to_string();
    }
    trimmed.to_string()
}

/// Detects whether a value expression requires script-engine evaluation.
///
/// Pure In() predicates return false, they are implemented natively. String
/// and number literals return true: ECMAScript boolean coercion ('' is false,
/// '0' is true) must be preserved.
pub fn requires_engine(expr: &str) -> bool {
    if expr.is_empty() {
        return false;
    }

    if expr.contains("In(") {
        return !is_pure_in_predicate(expr);
    }

    for feature in JS_FEATURES {
        if expr.contains(feature) {
            return true;
        }
    }

    if UNDERSCORE_IDENT.is_match(expr) {
        return true;
    }

    for op in ECMASCRIPT_OPERATORS {
        if expr.contains(op) {
            return true;
        }
    }

    if expr.contains('\'') || expr.contains('"') {
        return true;
    }

    for field in EVENT_METADATA_FIELDS {
        if expr.contains(field) {
            return true;
        }
    }

    // A reserved word of the target language heading the expression would be
    // embedded verbatim otherwise and break the generated unit.
    let stripped = expr.trim();
    for keyword in TARGET_RESERVED {
        if stripped == keyword {
            return true;
        }
        if let Some(rest) = stripped.strip_prefix(keyword) {
            if let Some(c) = rest.chars().next() {
                if !c.is_alphanumeric() && c != '_' {
                    return true;
                }
            }
        }
    }

    false
}

/// Wildcard descriptors matched by the runtime helper, never part of the
/// compile-time event enumeration.
pub fn is_wildcard_token(token: &str) -> bool {
    matches!(token, "*" | ".*" | "_*")
}

/// Computes the prefix-match closure for every transition (W3C §3.12.1).
///
/// Must run after the feature flagger so `model.events` is complete: for a
/// descriptor `D` the closure is every known event equal to `D` or starting
/// with `D` followed by a dot. Multi-token descriptors contribute the union
/// of their per-token closures.
pub fn build_prefix_matches(model: &mut Model) {
    let events: Vec<String> = model.events.iter().cloned().collect();

    for state in model.states.values_mut() {
        for transition in state.transitions.iter_mut() {
            transition.prefix_matches.clear();
            if transition.event.is_empty() || is_wildcard_token(transition.event.as_str()) {
                continue;
            }
            for token in transition.event.split_whitespace() {
                if is_wildcard_token(token) || token.ends_with(".*") {
                    continue;
                }
                let dotted = format!("{}.", token);
                for event in &events {
                    if (event == token || event.starts_with(&dotted))
                        && !transition.prefix_matches.contains(event)
                    {
                        transition.prefix_matches.push(event.clone());
                    }
                }
            }
        }
    }
}

/// Lowers a `<finalize>` block to a single ECMAScript string, executed by the
/// script engine when a child session returns events.
/// Supported content: assign, script, log, if/elseif/else.
pub fn actions_to_ecmascript(actions: &[Action]) -> String {
    let mut lines: Vec<String> = Vec::new();

    for action in actions {
        match action {
            Action::Assign(assign) => {
                if !assign.location.is_empty() && !assign.expr.is_empty() {
                    lines.push(format!("{} = {};", assign.location, assign.expr));
                }
            }
            Action::Script(script) => {
                if !script.content.is_empty() {
                    lines.push(script.content.clone());
                }
            }
            Action::Log(log) => {
                if !log.expr.is_empty() {
                    if log.label.is_empty() {
                        lines.push(format!("console.log({});", log.expr));
                    } else {
                        lines.push(format!("console.log(\"{}: \" + {});", log.label, log.expr));
                    }
                }
            }
            Action::If(eif) => {
                if eif.cond.is_empty() {
                    continue;
                }
                lines.push(format!("if ({}) {{", eif.cond));
                let then_js = actions_to_ecmascript(&eif.then_actions);
                if !then_js.is_empty() {
                    lines.push(format!("  {}", then_js));
                }
                lines.push("}".to_string());
                for branch in &eif.elseif_branches {
                    if branch.cond.is_empty() {
                        continue;
                    }
                    lines.push(format!("else if ({}) {{", branch.cond));
                    let branch_js = actions_to_ecmascript(&branch.actions);
                    if !branch_js.is_empty() {
                        lines.push(format!("  {}", branch_js));
                    }
                    lines.push("}".to_string());
                }
                if !eif.else_actions.is_empty() {
                    lines.push("else {".to_string());
                    let else_js = actions_to_ecmascript(&eif.else_actions);
                    if !else_js.is_empty() {
                        lines.push(format!("  {}", else_js));
                    }
                    lines.push("}".to_string());
                }
            }
            _ => {}
        }
    }

    lines.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{StateNode, StateKind, Transition};

    #[test]
    fn pure_in_single() {
        assert!(is_pure_in_predicate("In('s1')"));
    }

    #[test]
    fn pure_in_conjunction_with_escapes() {
        let (kind, native) = classify_guard("In('s1') &amp;&amp; In('s2')");
        assert_eq!(kind, CondKind::PureIn);
        assert_eq!(
            native,
            "this->isStateActive(\"s1\") && this->isStateActive(\"s2\")"
        );
    }

    #[test]
    fn pure_in_disjunction() {
        let (kind, native) = classify_guard("In('a') || In('b')");
        assert_eq!(kind, CondKind::PureIn);
        assert_eq!(
            native,
            "this->isStateActive(\"a\") || this->isStateActive(\"b\")"
        );
    }

    #[test]
    fn in_with_variable_is_not_pure() {
        assert!(!is_pure_in_predicate("In(stateName)"));
        assert!(!is_pure_in_predicate("In(\"s1\")"));
    }

    #[test]
    fn in_mixed_with_ecmascript_requires_engine() {
        let (kind, _) = classify_guard("In('s1') && typeof x !== 'undefined'");
        assert_eq!(kind, CondKind::RequiresEngine);
        assert!(requires_engine("In('s1') && typeof x !== 'undefined'"));
    }

    #[test]
    fn guard_literal_requires_engine() {
        // ECMAScript truthiness of plain literals must be preserved.
        let (kind, _) = classify_guard("'test'");
        assert_eq!(kind, CondKind::RequiresEngine);
        assert!(requires_engine("'test'"));
    }

    #[test]
    fn static_string_literals() {
        assert!(is_static_string_literal("'test'"));
        assert!(is_static_string_literal("\"test\""));
        assert_eq!(static_string_value("'test'"), "test");
        assert!(!is_static_string_literal("'a' + 'b'"));
        assert!(!is_static_string_literal("'a\\n'"));
        assert!(!is_static_string_literal("2"));
    }

    #[test]
    fn engine_triggers() {
        assert!(requires_engine("_event.name == 'foo'"));
        assert!(requires_engine("Var1 == 2"));
        assert!(requires_engine("_sessionid"));
        assert!(requires_engine("return"));
        assert!(requires_engine("return 1"));
        assert!(!requires_engine(""));
        assert!(!requires_engine("In('s1')"));
        // A bare identifier carries none of the engine markers.
        assert!(!requires_engine("somevar"));
        // 'returning' only starts with a reserved word, it is not one.
        assert!(!requires_engine("returning"));
    }

    #[test]
    fn prefix_match_closure() {
        let mut model = Model::new("t");
        model.events.insert("error".to_string());
        model.events.insert("error.execution".to_string());
        model.events.insert("foo".to_string());

        let mut s = StateNode::new("s0", StateKind::Atomic, None, 0);
        let mut t = Transition::default();
        t.event = "error".to_string();
        s.transitions.push(t);
        model.states.insert("s0".to_string(), s);

        build_prefix_matches(&mut model);

        let matches = &model.states["s0"].transitions[0].prefix_matches;
        assert_eq!(matches.len(), 2);
        assert!(matches.contains(&"error".to_string()));
        assert!(matches.contains(&"error.execution".to_string()));
        assert!(!matches.contains(&"foo".to_string()));
    }

    #[test]
    fn prefix_match_skips_wildcards() {
        let mut model = Model::new("t");
        model.events.insert("error.execution".to_string());

        let mut s = StateNode::new("s0", StateKind::Atomic, None, 0);
        let mut wildcard = Transition::default();
        wildcard.event = "*".to_string();
        s.transitions.push(wildcard);
        let mut suffixed = Transition::default();
        suffixed.event = "error.*".to_string();
        s.transitions.push(suffixed);
        model.states.insert("s0".to_string(), s);

        build_prefix_matches(&mut model);

        assert!(model.states["s0"].transitions[0].prefix_matches.is_empty());
        assert!(model.states["s0"].transitions[1].prefix_matches.is_empty());
    }

    #[test]
    fn finalize_lowering() {
        use crate::model::{Assign, Log};
        let actions = vec![
            Action::Assign(Assign {
                location: "Var1".to_string(),
                expr: "_event.data.aParam".to_string(),
            }),
            Action::Log(Log {
                label: "fin".to_string(),
                expr: "Var1".to_string(),
            }),
        ];
        assert_eq!(
            actions_to_ecmascript(&actions),
            "Var1 = _event.data.aParam; console.log(\"fin: \" + Var1);"
        );
    }
}
