//! The normalized document model produced by the reader and refined by the
//! normalization phases.\
//! State kinds, executable content and invoke strategies are closed variants,
//! never class hierarchies. The model is grown by explicit phase functions and
//! frozen before emission.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::str::FromStr;

pub const SCXML_NAMESPACE: &str = "http://www.w3.org/2005/07/scxml";

pub const ECMA_SCRIPT_LC: &str = "ecmascript";

/// Invoke type URIs of the SCXML family. An empty type defaults to SCXML.
pub const SCXML_INVOKE_TYPES: [&str; 4] = [
    "",
    "scxml",
    "http://www.w3.org/TR/scxml",
    "http://www.w3.org/TR/scxml/",
];

/// *W3C says*:
/// The \<scxml\> attribute __binding__: "early" or "late", default is "early".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BindingType {
    #[default]
    Early,
    Late,
}

impl FromStr for BindingType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "early" | "" => Ok(BindingType::Early),
            "late" => Ok(BindingType::Late),
            _ => Err(format!("unknown binding '{}'", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryKind {
    Shallow,
    Deep,
}

pub fn map_history_type(ts: &str) -> Result<HistoryKind, String> {
    match ts.to_lowercase().as_str() {
        "shallow" | "" => Ok(HistoryKind::Shallow),
        "deep" => Ok(HistoryKind::Deep),
        _ => Err(format!("unknown history type '{}'", ts)),
    }
}

/// Variant tag of a state node. Atomic states are upgraded to Compound when
/// the first child attaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateKind {
    Atomic,
    Compound,
    Parallel,
    Final,
    History(HistoryKind),
}

impl StateKind {
    pub fn is_history(&self) -> bool {
        matches!(self, StateKind::History(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransitionKind {
    Internal,
    #[default]
    External,
}

pub fn map_transition_type(ts: &str) -> Result<TransitionKind, String> {
    match ts.to_lowercase().as_str() {
        "internal" => Ok(TransitionKind::Internal),
        "external" | "" => Ok(TransitionKind::External),
        _ => Err(format!("unknown transition type '{}'", ts)),
    }
}

/// Classification of a guard expression, decided at build time without
/// executing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CondKind {
    /// No condition given.
    #[default]
    None,
    /// Only `In('id')` atoms joined by `&&`, `||` and parentheses. Emitted as
    /// direct active-state checks, no script engine.
    PureIn,
    /// Everything else. Evaluated through the script engine so ECMAScript
    /// semantics (including `error.execution` on failure) are preserved.
    RequiresEngine,
}

/// A `<param>` of send, invoke or donedata.
#[derive(Debug, Clone, Default)]
pub struct Param {
    pub name: String,
    pub expr: String,
    pub location: String,
    /// True if `expr` is a plain quoted string without escapes, embeddable at
    /// compile time.
    pub is_static_literal: bool,
    pub static_value: String,
}

/// Holds all parameters of a \<send\> call.
#[derive(Debug, Clone, Default)]
pub struct Send {
    pub event: String,
    pub event_expr: String,
    pub target: String,
    pub target_expr: String,
    pub send_type: String,
    pub type_expr: String,
    pub id: String,
    pub id_location: String,
    pub delay: String,
    pub delay_expr: String,
    pub namelist: Vec<String>,
    pub params: Vec<Param>,
    pub content: String,
    pub content_expr: String,
}

#[derive(Debug, Clone, Default)]
pub struct Raise {
    pub event: String,
}

#[derive(Debug, Clone, Default)]
pub struct Assign {
    pub location: String,
    pub expr: String,
}

#[derive(Debug, Clone, Default)]
pub struct Log {
    pub label: String,
    pub expr: String,
}

#[derive(Debug, Clone, Default)]
pub struct Script {
    pub src: String,
    pub content: String,
}

#[derive(Debug, Clone, Default)]
pub struct Cancel {
    pub send_id: String,
    pub send_id_expr: String,
}

/// One `<elseif>` arm of an `<if>`.
#[derive(Debug, Clone, Default)]
pub struct IfBranch {
    pub cond: String,
    pub cond_kind: CondKind,
    pub cond_native: String,
    pub actions: Vec<Action>,
}

#[derive(Debug, Clone, Default)]
pub struct If {
    pub cond: String,
    pub cond_kind: CondKind,
    pub cond_native: String,
    pub then_actions: Vec<Action>,
    pub elseif_branches: Vec<IfBranch>,
    pub else_actions: Vec<Action>,
}

#[derive(Debug, Clone, Default)]
pub struct ForEach {
    pub array: String,
    pub item: String,
    pub index: String,
    pub actions: Vec<Action>,
}

/// Executable content. See W3C "Executable Content".
#[derive(Debug, Clone)]
pub enum Action {
    Raise(Raise),
    Send(Box<Send>),
    Assign(Assign),
    If(Box<If>),
    ForEach(Box<ForEach>),
    Log(Log),
    Script(Script),
    Cancel(Cancel),
}

/// Static type of a datamodel variable, detected from its init expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VarKind {
    Int,
    Str,
    Bool,
    /// Needs the script engine to evaluate.
    #[default]
    Runtime,
}

#[derive(Debug, Clone, Default)]
pub struct DataVariable {
    pub id: String,
    pub expr: String,
    pub src: String,
    pub content: String,
    pub kind: VarKind,
}

/// A document-level `<script>`, executed once at load time.
#[derive(Debug, Clone, Default)]
pub struct GlobalScript {
    pub src: String,
    pub content: String,
}

#[derive(Debug, Clone, Default)]
pub struct DoneData {
    pub params: Vec<Param>,
    pub content: String,
    pub content_expr: String,
}

/// Code-generation strategy of a single `<invoke>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InvokeStrategy {
    /// Child known at compile time (src file or inline `<scxml>`).
    PureStatic,
    /// `srcexpr`/`contentexpr`: static parent, runtime-interpreted child.
    StaticHybrid,
    /// Unsupported type URI or no materializable child.
    #[default]
    InterpreterFallback,
}

#[derive(Debug, Clone, Default)]
pub struct Invoke {
    pub type_uri: String,
    pub src: String,
    pub src_expr: String,
    pub id: String,
    pub id_location: String,
    pub autoforward: bool,
    pub namelist: Vec<String>,
    pub params: Vec<Param>,
    pub finalize: Vec<Action>,
    pub content: String,
    pub content_expr: String,
    /// True if `content` holds an inline `<scxml>` document.
    pub has_inline_scxml: bool,
    /// Id of the state carrying this invoke.
    pub state_id: String,
    pub strategy: InvokeStrategy,
    /// Filesystem-safe base name of the materialized child.
    pub child_name: String,
    pub child_needs_script_engine: bool,
    pub child_datamodel_vars: Vec<String>,
    /// True if some transition waits for `done.invoke.{id}` specifically.
    pub use_specific_done_event: bool,
}

/// Flattened information about one PureStatic invoke, for the emitter and the
/// children manifest.
#[derive(Debug, Clone, Default)]
pub struct StaticInvokeInfo {
    pub invoke_id: String,
    pub child_name: String,
    pub state_id: String,
    pub autoforward: bool,
    /// `<finalize>` block lowered to a single ECMAScript string.
    pub finalize_script: String,
    pub src: String,
    pub params: Vec<Param>,
    pub id_location: String,
    pub namelist: Vec<String>,
    pub child_needs_script_engine: bool,
    pub child_datamodel_vars: Vec<String>,
    pub use_specific_done_event: bool,
}

/// Flattened information about one StaticHybrid invoke.
#[derive(Debug, Clone, Default)]
pub struct HybridInvokeInfo {
    pub invoke_id: String,
    pub state_id: String,
    pub src_expr: String,
    pub content_expr: String,
    pub autoforward: bool,
    pub params: Vec<Param>,
    pub id_location: String,
    pub use_specific_done_event: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Transition {
    /// Raw event descriptor, possibly several whitespace-separated tokens.
    /// Empty for eventless transitions.
    pub event: String,
    /// Raw target attribute. Empty for target-less transitions.
    pub target: String,
    pub cond: String,
    pub cond_kind: CondKind,
    /// Native predicate when `cond_kind` is PureIn.
    pub cond_native: String,
    pub kind: TransitionKind,
    pub actions: Vec<Action>,
    /// Set when `target` names a history state; the emitter generates
    /// restore-or-default logic from it.
    pub history_target: String,
    /// All known event names matched by this transition's descriptors under
    /// W3C prefix matching.
    pub prefix_matches: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct StateNode {
    pub id: String,
    pub kind: StateKind,
    pub parent: Option<String>,
    /// Monotonic pre-order position in the document, assigned during build
    /// and never revised.
    pub document_order: u32,
    /// Raw `initial` attribute or `<initial>` target, possibly
    /// space-separated. Resolved into `initial_children` by normalization.
    pub initial: String,
    pub initial_children: Vec<String>,
    pub transitions: Vec<Transition>,
    pub on_entry: Vec<Action>,
    pub on_exit: Vec<Action>,
    /// Local `<datamodel>` declarations (scoped variables).
    pub datamodel: Vec<DataVariable>,
    pub invokes: Vec<Invoke>,
    /// Only on Final states.
    pub donedata: Option<DoneData>,
    /// Executable content of the `<initial>` transition. Runs after parent
    /// onentry, before child entry.
    pub initial_transition_actions: Vec<Action>,
    /// Set when `initial` targets a history state.
    pub initial_history_id: String,
    pub initial_history_default_target: String,
    pub initial_history_default_actions: Vec<Action>,
}

impl StateNode {
    pub fn new(id: &str, kind: StateKind, parent: Option<String>, document_order: u32) -> StateNode {
        StateNode {
            id: id.to_string(),
            kind,
            parent,
            document_order,
            initial: String::new(),
            initial_children: Vec::new(),
            transitions: Vec::new(),
            on_entry: Vec::new(),
            on_exit: Vec::new(),
            datamodel: Vec::new(),
            invokes: Vec::new(),
            donedata: None,
            initial_transition_actions: Vec::new(),
            initial_history_id: String::new(),
            initial_history_default_target: String::new(),
            initial_history_default_actions: Vec::new(),
        }
    }
}

/// Resolved information about one history pseudo-state.
#[derive(Debug, Clone)]
pub struct HistoryInfo {
    pub parent: String,
    pub kind: HistoryKind,
    pub default_target: String,
    pub default_actions: Vec<Action>,
    /// `default_target` chased to its leaf. Filled by normalization.
    pub leaf_target: String,
}

/// Flags controlling which runtime helpers the emitter must include.
#[derive(Debug, Clone, Default)]
pub struct FeatureFlags {
    pub needs_script_engine: bool,
    pub uses_in_predicate: bool,
    pub has_parallel_states: bool,
    pub has_history_states: bool,
    pub has_invoke: bool,
    pub has_hybrid_invoke: bool,
    pub has_event_metadata: bool,
    pub has_parent_communication: bool,
    pub has_child_communication: bool,
    pub has_transition_actions: bool,
    pub has_scoped_datamodel: bool,
    pub has_wildcard: bool,

    pub needs_event_scheduler: bool,
    pub needs_transition_helper: bool,
    pub needs_event_type_helper: bool,
    pub needs_assign_helper: bool,
    pub needs_foreach: bool,
    pub needs_guard_helper: bool,
    pub needs_send_helper: bool,
    pub needs_event_data_helper: bool,
    pub needs_donedata_helper: bool,
    pub needs_external_flag: bool,

    pub needs_event_name: bool,
    pub needs_event_data: bool,
    pub needs_event_type: bool,
    pub needs_event_sendid: bool,
    pub needs_event_origin: bool,
    pub needs_event_origintype: bool,
    pub needs_event_invokeid: bool,
}

/// The normalized model of one SCXML document.
///
/// Built once per input, mutated only by the normalization phases in a fixed
/// order, then frozen and handed to the emitter.
#[derive(Debug, Clone, Default)]
pub struct Model {
    /// Derived from the input file stem, not the document's `name` attribute.
    /// The W3C corpus reuses `name` across tests, the file stem is unique.
    pub name: String,
    pub initial: String,
    /// `initial` chased through initial-links to its leaf.
    pub initial_leaf: String,
    pub binding: BindingType,
    pub datamodel_kind: String,
    pub version: String,

    pub states: HashMap<String, StateNode>,
    pub events: BTreeSet<String>,
    pub history_defaults: HashMap<String, String>,
    pub history_info: HashMap<String, HistoryInfo>,
    pub parallel_regions: HashMap<String, Vec<String>>,

    pub variables: Vec<DataVariable>,
    pub global_scripts: Vec<GlobalScript>,
    pub static_invokes: Vec<StaticInvokeInfo>,
    pub hybrid_invokes: Vec<HybridInvokeInfo>,
    pub flags: FeatureFlags,

    /// Where the document was read from; buffer parses have no path.
    pub source_path: Option<PathBuf>,
}

impl Model {
    pub fn new(name: &str) -> Model {
        Model {
            name: name.to_string(),
            datamodel_kind: ECMA_SCRIPT_LC.to_string(),
            ..Default::default()
        }
    }

    /// Path used in diagnostics.
    pub fn display_path(&self) -> String {
        match &self.source_path {
            Some(p) => p.display().to_string(),
            None => "buffer".to_string(),
        }
    }

    /// Ids of all direct children of `id`, history excluded, document order.
    pub fn children_of(&self, id: &str) -> Vec<&StateNode> {
        let mut children: Vec<&StateNode> = self
            .states
            .values()
            .filter(|s| s.parent.as_deref() == Some(id) && !s.kind.is_history())
            .collect();
        children.sort_by_key(|s| s.document_order);
        children
    }

    /// Root-level states (no parent), history excluded, document order.
    pub fn root_states(&self) -> Vec<&StateNode> {
        let mut roots: Vec<&StateNode> = self
            .states
            .values()
            .filter(|s| s.parent.is_none() && !s.kind.is_history())
            .collect();
        roots.sort_by_key(|s| s.document_order);
        roots
    }

    /// All states sorted by document order.
    pub fn states_in_document_order(&self) -> Vec<&StateNode> {
        let mut all: Vec<&StateNode> = self.states.values().collect();
        all.sort_by_key(|s| s.document_order);
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binding_from_str() {
        assert_eq!(BindingType::from_str("early").unwrap(), BindingType::Early);
        assert_eq!(BindingType::from_str("LATE").unwrap(), BindingType::Late);
        assert!(BindingType::from_str("middle").is_err());
    }

    #[test]
    fn history_type_mapping() {
        assert_eq!(map_history_type("deep").unwrap(), HistoryKind::Deep);
        assert_eq!(map_history_type("").unwrap(), HistoryKind::Shallow);
        assert!(map_history_type("bla").is_err());
    }

    #[test]
    fn children_sorted_by_document_order() {
        let mut m = Model::new("t");
        m.states.insert(
            "p".to_string(),
            StateNode::new("p", StateKind::Compound, None, 0),
        );
        m.states.insert(
            "b".to_string(),
            StateNode::new("b", StateKind::Atomic, Some("p".to_string()), 2),
        );
        m.states.insert(
            "a".to_string(),
            StateNode::new("a", StateKind::Atomic, Some("p".to_string()), 1),
        );
        let ids: Vec<&str> = m.children_of("p").iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }
}
