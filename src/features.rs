//! The feature flagger: one recursive scan over the normalized model that
//! decides which runtime helpers the emitted unit must include, classifies
//! datamodel variables and completes the event set.

use crate::model::{Action, CondKind, FeatureFlags, InvokeStrategy, Model, Param, VarKind};

pub const SCXML_EVENT_PROCESSOR: &str = "http://www.w3.org/TR/scxml/#SCXMLEventProcessor";

const EVENT_ERROR_EXECUTION: &str = "error.execution";
const EVENT_DONE_INVOKE: &str = "done.invoke";
const EVENT_CANCEL_INVOKE: &str = "cancel.invoke";

/// Scratch collected during the scan. Expression text is accumulated so the
/// `_event.*` field detection sees every expression of the document.
#[derive(Default)]
struct Scan {
    flags: FeatureFlags,
    events: Vec<String>,
    expressions: String,
}

impl Scan {
    fn expr(&mut self, text: &str) {
        if !text.is_empty() {
            self.expressions.push_str(text);
            self.expressions.push('\n');
        }
    }

    fn guard(&mut self, cond: &str, kind: CondKind) {
        if cond.is_empty() {
            return;
        }
        self.flags.needs_guard_helper = true;
        if cond.contains("In(") {
            self.flags.uses_in_predicate = true;
        }
        if kind == CondKind::RequiresEngine {
            self.flags.needs_script_engine = true;
        }
        self.expr(cond);
    }

    fn param(&mut self, param: &Param) {
        if !param.expr.is_empty() && !param.is_static_literal {
            self.flags.needs_script_engine = true;
        }
        self.expr(&param.expr);
    }

    fn actions(&mut self, actions: &[Action]) {
        for action in actions {
            match action {
                Action::Raise(_) => {}
                Action::Send(send) => {
                    self.flags.needs_send_helper = true;
                    self.events.push(EVENT_ERROR_EXECUTION.to_string());
                    if !send.params.is_empty() {
                        self.flags.needs_event_data_helper = true;
                    }
                    for param in &send.params {
                        self.param(param);
                    }
                    if !send.delay.is_empty() || !send.delay_expr.is_empty() {
                        self.flags.needs_event_scheduler = true;
                    }
                    if !send.event_expr.is_empty()
                        || !send.target_expr.is_empty()
                        || !send.delay_expr.is_empty()
                    {
                        self.flags.needs_script_engine = true;
                    }
                    if !send.namelist.is_empty() {
                        // Namelist needs runtime existence checks even for
                        // static variable names.
                        self.flags.needs_script_engine = true;
                    }
                    if send.send_type == SCXML_EVENT_PROCESSOR {
                        self.flags.needs_external_flag = true;
                    }
                    self.expr(&send.event_expr);
                    self.expr(&send.target_expr);
                    self.expr(&send.delay_expr);
                    self.expr(&send.type_expr);
                    self.expr(&send.content_expr);
                }
                Action::Assign(assign) => {
                    self.flags.needs_assign_helper = true;
                    self.flags.needs_script_engine = true;
                    self.expr(&assign.expr);
                }
                Action::If(eif) => {
                    self.guard(&eif.cond, eif.cond_kind);
                    self.actions(&eif.then_actions);
                    for branch in &eif.elseif_branches {
                        self.guard(&branch.cond, branch.cond_kind);
                        self.actions(&branch.actions);
                    }
                    self.actions(&eif.else_actions);
                }
                Action::ForEach(fe) => {
                    self.flags.needs_foreach = true;
                    self.flags.needs_script_engine = true;
                    self.expr(&fe.array);
                    self.actions(&fe.actions);
                }
                Action::Log(log) => {
                    if !log.expr.is_empty() {
                        // The logged value is an ECMAScript expression.
                        self.flags.needs_script_engine = true;
                        self.expr(&log.expr);
                    }
                }
                Action::Script(script) => {
                    self.flags.needs_script_engine = true;
                    self.expr(&script.content);
                }
                Action::Cancel(cancel) => {
                    self.flags.needs_event_scheduler = true;
                    self.expr(&cancel.send_id_expr);
                }
            }
        }
    }
}

/// Detects the static type of a variable from its init expression.
fn classify_variable(expr: &str, content: &str) -> VarKind {
    if expr.is_empty() && content.is_empty() {
        VarKind::Runtime
    } else if !expr.is_empty() && expr.chars().all(|c| c.is_ascii_digit()) {
        VarKind::Int
    } else if expr.len() >= 2 && expr.starts_with('"') && expr.ends_with('"') {
        VarKind::Str
    } else if expr == "true" || expr == "false" {
        VarKind::Bool
    } else {
        VarKind::Runtime
    }
}

/// Runs the feature scan and freezes the flag set on the model.
pub fn analyze(model: &mut Model) {
    let mut scan = Scan {
        flags: model.flags.clone(),
        ..Default::default()
    };
    scan.flags.needs_transition_helper = true;

    // Datamodel variables. Any declared variable forces the script engine;
    // the static kinds only decide how the variable is materialized.
    for var in model.variables.iter_mut() {
        var.kind = classify_variable(&var.expr, &var.content);
        scan.flags.needs_script_engine = true;
        scan.expr(&var.expr);
    }
    for state in model.states.values_mut() {
        for var in state.datamodel.iter_mut() {
            var.kind = classify_variable(&var.expr, &var.content);
            scan.flags.needs_script_engine = true;
            scan.expr(&var.expr);
        }
    }

    if !model.global_scripts.is_empty() {
        scan.flags.needs_script_engine = true;
        for script in &model.global_scripts {
            scan.expr(&script.content);
        }
    }

    let mut has_static_invoke = false;
    for state in model.states.values() {
        for transition in &state.transitions {
            scan.guard(&transition.cond, transition.cond_kind);
            scan.actions(&transition.actions);
            for token in transition.event.split_whitespace() {
                if token == "*" || token == ".*" {
                    scan.flags.has_wildcard = true;
                }
            }
        }
        scan.actions(&state.on_entry);
        scan.actions(&state.on_exit);
        scan.actions(&state.initial_transition_actions);
        scan.actions(&state.initial_history_default_actions);

        if let Some(donedata) = &state.donedata {
            scan.flags.needs_donedata_helper = true;
            scan.events.push(EVENT_ERROR_EXECUTION.to_string());
            if !donedata.params.is_empty() || !donedata.content_expr.is_empty() {
                scan.flags.needs_script_engine = true;
            }
            for param in &donedata.params {
                scan.expr(&param.expr);
            }
            scan.expr(&donedata.content_expr);
        }

        for invoke in &state.invokes {
            match invoke.strategy {
                InvokeStrategy::PureStatic => has_static_invoke = true,
                InvokeStrategy::StaticHybrid => {
                    scan.flags.has_hybrid_invoke = true;
                    scan.flags.needs_script_engine = true;
                }
                InvokeStrategy::InterpreterFallback => {}
            }
            if !invoke.namelist.is_empty() {
                scan.flags.needs_script_engine = true;
            }
            for param in &invoke.params {
                scan.param(param);
            }
            scan.actions(&invoke.finalize);
            scan.expr(&invoke.src_expr);
            scan.expr(&invoke.content_expr);
        }
    }

    for info in model.history_info.values() {
        scan.actions(&info.default_actions);
    }

    if has_static_invoke {
        scan.events.push(EVENT_DONE_INVOKE.to_string());
        scan.events.push(EVENT_CANCEL_INVOKE.to_string());
        scan.events.push(EVENT_ERROR_EXECUTION.to_string());
    }

    // Event metadata access, observed over every collected expression.
    let text = scan.expressions.as_str();
    if text.contains("_event.") {
        scan.flags.has_event_metadata = true;
    }
    scan.flags.needs_event_name |= text.contains("_event.name");
    scan.flags.needs_event_data |= text.contains("_event.data");
    scan.flags.needs_event_type |= text.contains("_event.type");
    scan.flags.needs_event_sendid |= text.contains("_event.sendid");
    scan.flags.needs_event_origintype |= text.contains("_event.origintype");
    scan.flags.needs_event_origin |= text
        .replace("_event.origintype", "")
        .contains("_event.origin");
    scan.flags.needs_event_invokeid |= text.contains("_event.invokeid");

    // The engine's current-event injection is all-or-nothing: once the script
    // engine is in, every metadata field is populated and runtime evaluation
    // failures surface as error.execution.
    if scan.flags.needs_script_engine {
        scan.flags.needs_event_name = true;
        scan.flags.needs_event_data = true;
        scan.flags.needs_event_type = true;
        scan.flags.needs_event_sendid = true;
        scan.flags.needs_event_origin = true;
        scan.flags.needs_event_origintype = true;
        scan.flags.needs_event_invokeid = true;
        scan.flags.needs_external_flag = true;
        scan.flags.needs_event_type_helper = true;
        scan.flags.needs_assign_helper = true;
        scan.flags.needs_foreach = true;
        scan.flags.needs_guard_helper = true;
        scan.events.push(EVENT_ERROR_EXECUTION.to_string());
    }

    for event in scan.events {
        model.events.insert(event);
    }
    model.flags = scan.flags;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::normalize;
    use crate::scxml_reader::parse_from_xml;

    fn analyzed(body: &str) -> Model {
        let xml = format!(
            "<scxml xmlns='http://www.w3.org/2005/07/scxml' initial='a' version='1.0'>{}</scxml>",
            body
        );
        let mut model = parse_from_xml(&xml).unwrap();
        normalize(&mut model).unwrap();
        analyze(&mut model);
        model
    }

    #[test]
    fn variable_kinds() {
        assert_eq!(classify_variable("0", ""), VarKind::Int);
        assert_eq!(classify_variable("123", ""), VarKind::Int);
        assert_eq!(classify_variable("\"hello\"", ""), VarKind::Str);
        assert_eq!(classify_variable("true", ""), VarKind::Bool);
        assert_eq!(classify_variable("", ""), VarKind::Runtime);
        assert_eq!(classify_variable("Var2 + 1", ""), VarKind::Runtime);
        assert_eq!(classify_variable("-5", ""), VarKind::Runtime);
    }

    #[test]
    fn bare_document_needs_no_engine() {
        let model = analyzed("<state id='a'><transition event='e' target='b'/></state><state id='b'/>");
        assert!(!model.flags.needs_script_engine);
        assert!(model.flags.needs_transition_helper);
        assert!(!model.flags.needs_event_name);
    }

    #[test]
    fn datamodel_variable_forces_engine() {
        let model = analyzed(
            "<datamodel><data id='Var1' expr='0'/></datamodel><state id='a'/>",
        );
        assert!(model.flags.needs_script_engine);
        assert_eq!(model.variables[0].kind, VarKind::Int);
        // Engine implies the full metadata injection and error.execution.
        assert!(model.flags.needs_event_name);
        assert!(model.flags.needs_event_invokeid);
        assert!(model.events.contains("error.execution"));
    }

    #[test]
    fn assign_and_foreach_force_engine() {
        let model = analyzed(
            "<state id='a'><onentry><assign location='x' expr='1'/></onentry></state>",
        );
        assert!(model.flags.needs_script_engine);
        assert!(model.flags.needs_assign_helper);

        let model = analyzed(
            "<state id='a'><onentry><foreach array='arr' item='i'><log expr='i'/></foreach>\
             </onentry></state>",
        );
        assert!(model.flags.needs_script_engine);
        assert!(model.flags.needs_foreach);
    }

    #[test]
    fn pure_in_guard_alone_keeps_engine_off() {
        let model = analyzed(
            "<state id='a'><transition event='e' cond=\"In('b')\" target='b'/></state>\
             <state id='b'/>",
        );
        assert!(!model.flags.needs_script_engine);
        assert!(model.flags.uses_in_predicate);
        assert!(model.flags.needs_guard_helper);
    }

    #[test]
    fn engine_guard_sets_engine() {
        let model = analyzed(
            "<state id='a'><transition event='e' cond='Var1 == 1' target='b'/></state>\
             <state id='b'/>",
        );
        assert!(model.flags.needs_script_engine);
    }

    #[test]
    fn static_literal_param_keeps_engine_off() {
        let model = analyzed(
            "<state id='a'><onentry><send event='e'><param name='p' expr=\"'v'\"/></send>\
             </onentry></state>",
        );
        assert!(!model.flags.needs_script_engine);
        assert!(model.flags.needs_send_helper);
        assert!(model.flags.needs_event_data_helper);
        assert!(model.events.contains("error.execution"));
    }

    #[test]
    fn dynamic_param_forces_engine() {
        let model = analyzed(
            "<state id='a'><onentry><send event='e'><param name='p' expr='2'/></send>\
             </onentry></state>",
        );
        assert!(model.flags.needs_script_engine);
    }

    #[test]
    fn delay_and_cancel_need_scheduler() {
        let model = analyzed(
            "<state id='a'><onentry><send event='e' delay='1s'/></onentry></state>",
        );
        assert!(model.flags.needs_event_scheduler);
        assert!(!model.flags.needs_script_engine);

        let model = analyzed(
            "<state id='a'><onexit><cancel sendid='x'/></onexit></state>",
        );
        assert!(model.flags.needs_event_scheduler);
    }

    #[test]
    fn metadata_fields_detected_individually() {
        let model = analyzed(
            "<state id='a'><transition event='e' cond=\"_event.origintype == 'x'\" target='b'/>\
             </state><state id='b'/>",
        );
        assert!(model.flags.has_event_metadata);
        assert!(model.flags.needs_event_origintype);
        // needs_event_origin is still set, the engine injection is
        // all-or-nothing once the guard required it.
        assert!(model.flags.needs_script_engine);
    }

    #[test]
    fn wildcard_flag() {
        let model = analyzed(
            "<state id='a'><transition event='*' target='b'/></state><state id='b'/>",
        );
        assert!(model.flags.has_wildcard);
        assert!(!model.events.contains("*"));
    }

    #[test]
    fn donedata_adds_error_execution() {
        let model = analyzed(
            "<state id='a'/><final id='end'><donedata><content>done</content></donedata></final>",
        );
        assert!(model.flags.needs_donedata_helper);
        assert!(model.events.contains("error.execution"));
        // Literal content alone does not need the engine.
        assert!(!model.flags.needs_script_engine);
    }

    #[test]
    fn namelist_forces_engine() {
        let model = analyzed(
            "<state id='a'><onentry><send event='e' namelist='Var1'/></onentry></state>",
        );
        assert!(model.flags.needs_script_engine);
    }
}
