//! Normalization of the freshly built model: default initials, deep initial
//! chains, parallel-initial overrides, history defaults, invoke resolution,
//! done-event synthesis and the child→parent event closure.\
//! The phases run in a fixed order; each phase sees the output of the prior
//! one. All derived data lives on the model being normalized.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use lazy_static::lazy_static;
use regex::Regex;

use crate::classifier::actions_to_ecmascript;
use crate::common::warn;
use crate::error::{GenError, GenResult};
use crate::model::{
    Action, HybridInvokeInfo, Invoke, InvokeStrategy, Model, StateKind, StaticInvokeInfo,
    SCXML_NAMESPACE,
};
use crate::scxml_reader::TARGET_PARENT_SESSION;
use crate::strategy::classify_invoke;

/// Hop limit of the initial/history leaf chase. Exceeding it means the
/// document contains an initial cycle.
const MAX_RESOLVE_DEPTH: usize = 20;

lazy_static! {
    /// `name` attribute within the start tag of an inline `<scxml>` child.
    static ref INLINE_NAME: Regex =
        Regex::new(r#"<scxml\b[^>]*?\bname\s*=\s*["']([^"']+)["']"#).unwrap();
}

/// Referenced children are analyzed at most once, keyed on the child base
/// name. `None` records a failed analysis so it is not retried.
type ChildCache = HashMap<String, Option<Model>>;

/// Runs all normalization phases on the model, in order.
pub fn normalize(model: &mut Model) -> GenResult<()> {
    let mut cache = ChildCache::new();

    fill_default_initials(model);
    resolve_static_invokes(model, &mut cache)?;
    resolve_deep_initial(model)?;
    resolve_history_targets(model)?;
    recompute_initial_leaf(model)?;
    compute_parallel_regions(model)?;
    scan_transition_actions(model);
    add_done_state_events(model);
    set_invoke_done_specificity(model);
    collect_child_to_parent_events(model, &cache);
    validate_initial_children(model)?;
    build_invoke_info(model);
    Ok(())
}

/// W3C: if not specified, the default initial state is the first child state
/// in document order. History children are never entry targets.
fn fill_default_initials(model: &mut Model) {
    if model.initial.is_empty() {
        let first = model.root_states().first().map(|s| s.id.clone());
        if let Some(id) = first {
            model.initial = id;
        }
    }

    let mut defaults: Vec<(String, String)> = Vec::new();
    for state in model.states.values() {
        if state.kind == StateKind::Compound && state.initial.is_empty() {
            if let Some(first) = model.children_of(&state.id).first() {
                defaults.push((state.id.clone(), first.id.clone()));
            }
        }
    }
    for (id, initial) in defaults {
        if let Some(state) = model.states.get_mut(&id) {
            state.initial = initial;
        }
    }
}

/// Directory the input file lives in; children are materialized and resolved
/// there.
fn input_dir(model: &Model) -> PathBuf {
    model
        .source_path
        .as_ref()
        .and_then(|p| p.parent().map(|d| d.to_path_buf()))
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Classifies every invoke and materializes the compile-time known children.
///
/// Inline `<content><scxml>` children are written to
/// `{parent}_{child}.scxml` next to the input, because the downstream build
/// system treats each generated machine as a compilation unit. The extracted
/// name embeds the parent's name, child names are not unique across the W3C
/// corpus.
fn resolve_static_invokes(model: &mut Model, cache: &mut ChildCache) -> GenResult<()> {
    let parent_dir = input_dir(model);
    let parent_name = model.name.clone();
    let doc_path = model.display_path();
    let mut inline_child_count = 0u32;

    let state_ids: Vec<String> = model
        .states_in_document_order()
        .iter()
        .map(|s| s.id.to_string())
        .collect();

    for state_id in state_ids {
        let invoke_count = model.states[&state_id].invokes.len();
        for idx in 0..invoke_count {
            let mut invoke = model.states.get_mut(&state_id).unwrap().invokes[idx].clone();
            invoke.strategy = classify_invoke(&invoke);

            match invoke.strategy {
                InvokeStrategy::PureStatic => {
                    if invoke.has_inline_scxml {
                        let child_name = match INLINE_NAME.captures(&invoke.content) {
                            Some(c) => format!("{}_{}", parent_name, &c[1]),
                            None => {
                                let n = format!("{}_child{}", parent_name, inline_child_count);
                                inline_child_count += 1;
                                n
                            }
                        };
                        let child_path = parent_dir.join(format!("{}.scxml", child_name));
                        write_inline_child(&doc_path, &child_path, &invoke.content)?;
                        invoke.src = format!("{}.scxml", child_name);
                        invoke.child_name = child_name;
                        analyze_child(&doc_path, &parent_dir, &mut invoke, cache);
                    } else {
                        let mut src = invoke.src.clone();
                        if let Some(rest) = src.strip_prefix("file:") {
                            src = rest.to_string();
                        }
                        let child_path = parent_dir.join(&src);
                        invoke.child_name = child_path
                            .file_stem()
                            .and_then(|s| s.to_str())
                            .unwrap_or("")
                            .to_string();
                        if child_path.exists() {
                            analyze_child(&doc_path, &parent_dir, &mut invoke, cache);
                        } else {
                            warn!(
                                "{}: invoke '{}': child '{}' not found, falling back to the interpreter",
                                doc_path,
                                invoke.id,
                                child_path.display()
                            );
                            invoke.strategy = InvokeStrategy::InterpreterFallback;
                        }
                    }
                }
                InvokeStrategy::StaticHybrid => {
                    // Nothing to materialize; the child is produced at runtime.
                }
                InvokeStrategy::InterpreterFallback => {
                    if invoke.has_inline_scxml {
                        // The document demands a static child under a type the
                        // generator can not compile.
                        let err = GenError::UnsupportedInvokeType {
                            path: doc_path.clone(),
                            id: invoke.id.clone(),
                            type_uri: invoke.type_uri.clone(),
                        };
                        warn!("{}", err);
                    }
                }
            }

            model.states.get_mut(&state_id).unwrap().invokes[idx] = invoke;
        }
    }
    Ok(())
}

/// Writes an extracted inline child. Inline children inherit the parent's
/// default namespace; the extracted unit re-declares it.
fn write_inline_child(doc_path: &str, child_path: &std::path::Path, content: &str) -> GenResult<()> {
    let mut body = content.to_string();
    let head_end = body.find('>').unwrap_or(body.len());
    if !body[..head_end].contains("xmlns") {
        body = body.replacen("<scxml", &format!("<scxml xmlns=\"{}\"", SCXML_NAMESPACE), 1);
    }
    let unit = format!("<?xml version=\"1.0\"?>\n\n{}\n", body);
    fs::write(child_path, unit).map_err(|e| GenError::EmitterFailure {
        path: doc_path.to_string(),
        reason: format!("cannot extract child '{}': {}", child_path.display(), e),
    })
}

/// Analyzes a referenced child (once per child name) and records whether it
/// needs the script engine and which datamodel variables it declares.
/// A broken child must not block generation of a correct parent, so failures
/// degrade to a warning and the conservative engine assumption.
fn analyze_child(doc_path: &str, parent_dir: &std::path::Path, invoke: &mut Invoke, cache: &mut ChildCache) {
    let child_model = cache
        .entry(invoke.child_name.clone())
        .or_insert_with(|| {
            let child_path = parent_dir.join(format!("{}.scxml", invoke.child_name));
            match crate::analyze_file(&child_path) {
                Ok(m) => Some(m),
                Err(e) => {
                    warn!("{}: failed to analyze child '{}': {}", doc_path, invoke.child_name, e);
                    None
                }
            }
        });

    match child_model {
        Some(child) => {
            invoke.child_needs_script_engine = child.flags.needs_script_engine;
            invoke.child_datamodel_vars = child.variables.iter().map(|v| v.id.clone()).collect();
        }
        None => {
            invoke.child_needs_script_engine = true;
            invoke.child_datamodel_vars = Vec::new();
        }
    }
}

/// Chases initial links until a leaf is reached. History pseudo-states are
/// never followed; they are resolved separately.
fn resolve_to_leaf(model: &Model, start: &str) -> Result<String, ()> {
    let mut current = start.to_string();
    for _ in 0..MAX_RESOLVE_DEPTH {
        match model.states.get(&current) {
            None => return Ok(current),
            Some(state) => match model.states.get(&state.initial) {
                Some(next) if !next.kind.is_history() => {
                    current = state.initial.clone();
                }
                _ => return Ok(current),
            },
        }
    }
    Err(())
}

/// Resolves the document initial to its leaf, or applies parallel-initial
/// overrides when it is a space-separated set of existing states.
fn resolve_deep_initial(model: &mut Model) -> GenResult<()> {
    if model.initial.is_empty() {
        return Ok(());
    }

    let tokens: Vec<String> = model.initial.split_whitespace().map(|t| t.to_string()).collect();
    if tokens.len() > 1 && tokens.iter().all(|t| model.states.contains_key(t)) {
        // Parallel entry: each named leaf overrides its parent's initial, the
        // regions then enter their overridden defaults.
        for token in &tokens {
            if let Some(parent_id) = model.states[token].parent.clone() {
                if let Some(parent) = model.states.get_mut(&parent_id) {
                    parent.initial = token.clone();
                }
            }
        }
        model.initial = tokens[0].clone();
        return Ok(());
    }

    if !model.states.contains_key(&model.initial) {
        // Unknown initial; machine classification decides what to do with it.
        return Ok(());
    }

    match resolve_to_leaf(model, &model.initial.clone()) {
        Ok(leaf) => {
            model.initial = leaf;
            Ok(())
        }
        Err(()) => Err(GenError::InitialCycle {
            path: model.display_path(),
            id: model.initial.clone(),
        }),
    }
}

/// Resolves history defaults to leaves and annotates everything that targets
/// a history state. Restoration itself happens at runtime; transitions retain
/// their original target plus a `historyTarget` marker, and states whose
/// `initial` names a history fall back to the resolved default so the entry
/// chain stays computable when history is empty.
fn resolve_history_targets(model: &mut Model) -> GenResult<()> {
    if model.history_defaults.is_empty() {
        return Ok(());
    }

    let history_ids: Vec<String> = model.history_info.keys().cloned().collect();
    for id in history_ids {
        let default_target = model.history_info[&id].default_target.clone();
        let leaf = resolve_to_leaf(model, &default_target).map_err(|_| GenError::HistoryCycle {
            path: model.display_path(),
            id: id.clone(),
        })?;
        model.history_info.get_mut(&id).unwrap().leaf_target = leaf;
    }

    for state in model.states.values_mut() {
        for transition in state.transitions.iter_mut() {
            if model.history_defaults.contains_key(&transition.target) {
                transition.history_target = transition.target.clone();
            }
        }
    }

    let state_ids: Vec<String> = model.states.keys().cloned().collect();
    for id in state_ids {
        let initial = model.states[&id].initial.clone();
        if let Some(info) = model.history_info.get(&initial) {
            let leaf = info.leaf_target.clone();
            let actions = info.default_actions.clone();
            let state = model.states.get_mut(&id).unwrap();
            state.initial_history_id = initial;
            state.initial_history_default_target = leaf.clone();
            state.initial_history_default_actions = actions;
            state.initial = leaf;
        }
    }
    Ok(())
}

fn recompute_initial_leaf(model: &mut Model) -> GenResult<()> {
    if model.initial.is_empty() {
        return Ok(());
    }
    match resolve_to_leaf(model, &model.initial.clone()) {
        Ok(leaf) => {
            model.initial_leaf = leaf;
            Ok(())
        }
        Err(()) => Err(GenError::InitialCycle {
            path: model.display_path(),
            id: model.initial.clone(),
        }),
    }
}

/// Records the direct regions of every parallel state, in document order.
fn compute_parallel_regions(model: &mut Model) -> GenResult<()> {
    let mut regions: HashMap<String, Vec<String>> = HashMap::new();
    for state in model.states.values() {
        if state.kind == StateKind::Parallel {
            let children: Vec<String> = model
                .children_of(&state.id)
                .iter()
                .map(|c| c.id.clone())
                .collect();
            if children.is_empty() {
                return Err(GenError::malformed(
                    &model.display_path(),
                    format!("parallel state '{}' has no regions", state.id),
                ));
            }
            regions.insert(state.id.clone(), children);
        }
    }
    model.parallel_regions = regions;
    Ok(())
}

fn scan_transition_actions(model: &mut Model) {
    model.flags.has_transition_actions = model
        .states
        .values()
        .any(|s| s.transitions.iter().any(|t| !t.actions.is_empty()));
}

/// W3C: entering a final child generates `done.state.{parent}`. These events
/// must exist in the compile-time enumeration.
fn add_done_state_events(model: &mut Model) {
    let mut done_events = Vec::new();
    for state in model.states.values() {
        if state.kind == StateKind::Parallel {
            continue;
        }
        let has_final_child = model
            .states
            .values()
            .any(|c| c.parent.as_deref() == Some(state.id.as_str()) && c.kind == StateKind::Final);
        if has_final_child {
            done_events.push(format!("done.state.{}", state.id));
        }
    }
    for event in done_events {
        model.events.insert(event);
    }
}

/// An invoke gets its specific `done.invoke.{id}` event only if some
/// transition actually waits for it; otherwise the generic token is used,
/// matching the interpreter.
fn set_invoke_done_specificity(model: &mut Model) {
    let mut used: Vec<String> = Vec::new();
    for state in model.states.values() {
        for transition in &state.transitions {
            for token in transition.event.split_whitespace() {
                if token.starts_with("done.invoke.") {
                    used.push(token.to_string());
                }
            }
        }
    }
    for state in model.states.values_mut() {
        for invoke in state.invokes.iter_mut() {
            let specific = format!("done.invoke.{}", invoke.id);
            invoke.use_specific_done_event = used.contains(&specific);
        }
    }
}

fn collect_parent_sends(actions: &[Action], events: &mut Vec<String>) {
    for action in actions {
        match action {
            Action::Send(send) => {
                if send.target == TARGET_PARENT_SESSION && !send.event.is_empty() {
                    events.push(send.event.clone());
                }
            }
            Action::If(eif) => {
                collect_parent_sends(&eif.then_actions, events);
                for branch in &eif.elseif_branches {
                    collect_parent_sends(&branch.actions, events);
                }
                collect_parent_sends(&eif.else_actions, events);
            }
            Action::ForEach(fe) => collect_parent_sends(&fe.actions, events),
            _ => {}
        }
    }
}

/// Every event a static child sends to `#_parent` enters the parent's event
/// set, so the compile-time enumeration also covers events the parent only
/// catches with wildcards.
fn collect_child_to_parent_events(model: &mut Model, cache: &ChildCache) {
    let mut events: Vec<String> = Vec::new();
    for child in cache.values().flatten() {
        for state in child.states.values() {
            collect_parent_sends(&state.on_entry, &mut events);
            collect_parent_sends(&state.on_exit, &mut events);
            collect_parent_sends(&state.initial_transition_actions, &mut events);
            for transition in &state.transitions {
                collect_parent_sends(&transition.actions, &mut events);
            }
        }
    }
    for event in events {
        model.events.insert(event);
    }
}

/// Splits every `initial` into its id list and verifies each id. The raw
/// attribute survived all prior phases, unknown ids abort generation here.
fn validate_initial_children(model: &mut Model) -> GenResult<()> {
    let state_ids: Vec<String> = model.states.keys().cloned().collect();
    for id in state_ids {
        let initial = model.states[&id].initial.clone();
        let children: Vec<String> = initial.split_whitespace().map(|t| t.to_string()).collect();
        for child_id in &children {
            // A history id surviving to this point had no default transition
            // to resolve through and is no legal entry target.
            match model.states.get(child_id) {
                Some(child) if !child.kind.is_history() => {}
                _ => {
                    return Err(GenError::InvalidInitialTarget {
                        path: model.display_path(),
                        state: id.clone(),
                        target: child_id.clone(),
                    });
                }
            }
        }
        model.states.get_mut(&id).unwrap().initial_children = children;
    }
    Ok(())
}

/// Flattens the classified invokes into the per-strategy lists the emitter
/// and the children manifest consume, in document order.
fn build_invoke_info(model: &mut Model) {
    let mut static_invokes = Vec::new();
    let mut hybrid_invokes = Vec::new();

    for state in model.states_in_document_order() {
        for invoke in &state.invokes {
            match invoke.strategy {
                InvokeStrategy::PureStatic => {
                    static_invokes.push(StaticInvokeInfo {
                        invoke_id: invoke.id.clone(),
                        child_name: invoke.child_name.clone(),
                        state_id: invoke.state_id.clone(),
                        autoforward: invoke.autoforward,
                        finalize_script: actions_to_ecmascript(&invoke.finalize),
                        src: invoke.src.clone(),
                        params: invoke.params.clone(),
                        id_location: invoke.id_location.clone(),
                        namelist: invoke.namelist.clone(),
                        child_needs_script_engine: invoke.child_needs_script_engine,
                        child_datamodel_vars: invoke.child_datamodel_vars.clone(),
                        use_specific_done_event: invoke.use_specific_done_event,
                    });
                }
                InvokeStrategy::StaticHybrid => {
                    hybrid_invokes.push(HybridInvokeInfo {
                        invoke_id: invoke.id.clone(),
                        state_id: invoke.state_id.clone(),
                        src_expr: invoke.src_expr.clone(),
                        content_expr: invoke.content_expr.clone(),
                        autoforward: invoke.autoforward,
                        params: invoke.params.clone(),
                        id_location: invoke.id_location.clone(),
                        use_specific_done_event: invoke.use_specific_done_event,
                    });
                }
                InvokeStrategy::InterpreterFallback => {}
            }
        }
    }

    model.static_invokes = static_invokes;
    model.hybrid_invokes = hybrid_invokes;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scxml_reader::parse_from_xml;

    fn normalized(xml: &str) -> Model {
        let mut model = parse_from_xml(xml).unwrap();
        normalize(&mut model).unwrap();
        model
    }

    fn doc(attrs: &str, body: &str) -> String {
        format!(
            "<scxml xmlns='http://www.w3.org/2005/07/scxml' {} version='1.0'>{}</scxml>",
            attrs, body
        )
    }

    #[test]
    fn default_initial_is_first_child_in_document_order() {
        let model = normalized(&doc(
            "",
            "<state id='s0'><state id='s01'/><state id='s02'/></state>",
        ));
        assert_eq!(model.initial_leaf, "s01");
        assert_eq!(model.states["s0"].initial_children, vec!["s01".to_string()]);
    }

    #[test]
    fn default_initial_skips_history_children() {
        let model = normalized(&doc(
            "initial='s0'",
            "<state id='s0'><history id='h'><transition target='s02'/></history>\
             <state id='s01'/><state id='s02'/></state>",
        ));
        assert_eq!(model.states["s0"].initial_children, vec!["s01".to_string()]);
    }

    #[test]
    fn deep_initial_resolves_to_leaf() {
        let model = normalized(&doc(
            "initial='s0'",
            "<state id='s0' initial='s01'><state id='s01' initial='s01a'>\
             <state id='s01a'/></state></state>",
        ));
        assert_eq!(model.initial, "s01a");
        assert_eq!(model.initial_leaf, "s01a");
    }

    #[test]
    fn initial_cycle_detected() {
        // a and b point at each other through their initial attributes.
        let mut model = parse_from_xml(&doc(
            "initial='a'",
            "<state id='a' initial='b'><state id='b' initial='a'/></state>",
        ))
        .unwrap();
        let r = normalize(&mut model);
        assert!(matches!(r, Err(GenError::InitialCycle { .. })));
    }

    #[test]
    fn parallel_initial_override() {
        let model = normalized(&doc(
            "initial='s2p112 s2p122'",
            "<parallel id='s2p1'>\
             <state id='s2p11' initial='s2p111'><state id='s2p111'/><state id='s2p112'/></state>\
             <state id='s2p12' initial='s2p121'><state id='s2p121'/><state id='s2p122'/></state>\
             </parallel>",
        ));
        assert_eq!(model.states["s2p11"].initial, "s2p112");
        assert_eq!(model.states["s2p12"].initial, "s2p122");
        assert_eq!(
            model.parallel_regions["s2p1"],
            vec!["s2p11".to_string(), "s2p12".to_string()]
        );
        assert_eq!(model.initial, "s2p112");
    }

    #[test]
    fn history_initial_annotated_with_fallback() {
        let model = normalized(&doc(
            "initial='s1'",
            "<state id='s1' initial='h1'>\
             <history id='h1' type='deep'><transition target='s11a'/></history>\
             <state id='s11'><state id='s11a'/></state>\
             <state id='s12'/></state>",
        ));
        let s1 = &model.states["s1"];
        assert_eq!(s1.initial_history_id, "h1");
        assert_eq!(s1.initial_history_default_target, "s11a");
        assert_eq!(s1.initial, "s11a");
        assert_eq!(model.history_info["h1"].leaf_target, "s11a");
        assert_eq!(model.initial_leaf, "s11a");
    }

    #[test]
    fn transition_to_history_keeps_target_and_gains_marker() {
        let model = normalized(&doc(
            "initial='s1'",
            "<state id='s1'>\
             <history id='h1'><transition target='s11'/></history>\
             <state id='s11'/>\
             <state id='s12'><transition event='back' target='h1'/></state>\
             </state>",
        ));
        let t = &model.states["s12"].transitions[0];
        assert_eq!(t.target, "h1");
        assert_eq!(t.history_target, "h1");
    }

    #[test]
    fn done_state_event_synthesized() {
        let model = normalized(&doc(
            "initial='s0'",
            "<state id='s0'><state id='s01'/><final id='s0end'/></state>",
        ));
        assert!(model.events.contains("done.state.s0"));
    }

    #[test]
    fn no_done_state_event_for_parallel() {
        let model = normalized(&doc(
            "initial='p'",
            "<parallel id='p'><state id='r1'><state id='r1a'/></state>\
             <state id='r2'><state id='r2a'/></state></parallel>",
        ));
        assert!(!model.events.iter().any(|e| e == "done.state.p"));
    }

    #[test]
    fn invalid_initial_target_aborts() {
        let mut model = parse_from_xml(&doc(
            "initial='s0'",
            "<state id='s0' initial='nosuch'><state id='s01'/></state>",
        ))
        .unwrap();
        let r = normalize(&mut model);
        assert!(matches!(r, Err(GenError::InvalidInitialTarget { .. })));
    }

    #[test]
    fn parallel_without_regions_is_malformed() {
        let mut model = parse_from_xml(&doc("initial='p'", "<parallel id='p'/>")).unwrap();
        let r = normalize(&mut model);
        assert!(matches!(r, Err(GenError::DocumentMalformed { .. })));
    }

    #[test]
    fn transition_actions_flag() {
        let model = normalized(&doc(
            "initial='a'",
            "<state id='a'><transition event='e' target='b'><log expr='1'/></transition></state>\
             <state id='b'/>",
        ));
        assert!(model.flags.has_transition_actions);

        let model = normalized(&doc(
            "initial='a'",
            "<state id='a'><transition event='e' target='b'/></state><state id='b'/>",
        ));
        assert!(!model.flags.has_transition_actions);
    }

    #[test]
    fn done_invoke_specificity() {
        let model = normalized(&doc(
            "initial='a'",
            "<state id='a'><invoke id='foo' srcexpr='Var1'/>\
             <transition event='done.invoke.foo' target='b'/></state><state id='b'/>",
        ));
        assert!(model.states["a"].invokes[0].use_specific_done_event);
        assert!(model.hybrid_invokes[0].use_specific_done_event);

        let model = normalized(&doc(
            "initial='a'",
            "<state id='a'><invoke id='foo' srcexpr='Var1'/>\
             <transition event='done.invoke' target='b'/></state><state id='b'/>",
        ));
        assert!(!model.states["a"].invokes[0].use_specific_done_event);
    }

    #[test]
    fn hybrid_invoke_flattened() {
        let model = normalized(&doc(
            "initial='a'",
            "<state id='a'><invoke srcexpr='pathVar' autoforward='true'/></state>",
        ));
        assert_eq!(model.hybrid_invokes.len(), 1);
        assert_eq!(model.hybrid_invokes[0].src_expr, "pathVar");
        assert!(model.hybrid_invokes[0].autoforward);
        assert!(model.static_invokes.is_empty());
    }
}
