//! Implements a SAX parser for SCXML documents according to the W3C recommendation,
//! building the normalized model used by the code generator.\
//! See [W3C:SCXML Overview](https://www.w3.org/TR/scxml/#overview).

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str;
use std::str::FromStr;

#[cfg(feature = "Debug_Reader")]
use crate::common::debug;
use quick_xml::events::attributes::Attributes;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::classifier::{classify_guard, is_static_string_literal, is_wildcard_token, static_string_value};
use crate::error::{GenError, GenResult};
use crate::model::{
    map_history_type, map_transition_type, Action, Assign, BindingType, Cancel, DataVariable,
    DoneData, ForEach, GlobalScript, If, IfBranch, Invoke, Log, Model, Param, Raise, Script, Send,
    StateKind, StateNode, Transition, SCXML_NAMESPACE,
};

pub type AttributeMap = HashMap<String, String>;
pub type XReader<'a> = Reader<&'a [u8]>;

/// *W3C says*:
/// The top-level wrapper element, which carries version information. The actual state machine consists of its children.\
/// *Attributes:*
/// + __initial__ A legal state specification. If not specified, the default initial state is the first child state in document order.
/// + __name__ Any valid NMTOKEN. The name of this state machine. It is for purely informational purposes.
/// + __xmlns__ The value MUST be "http://www.w3.org/2005/07/scxml".
/// + __version__ Decimal, The value MUST be "1.0".
/// + __datamodel__ NMTOKEN, "null", "ecmascript", "xpath" or other platform-defined values.
/// + __binding__ "early" or "late", default is "early".
pub const TAG_SCXML: &str = "scxml";
pub const ATTR_NAME: &str = "name";
pub const ATTR_BINDING: &str = "binding";
pub const ATTR_DATAMODEL: &str = "datamodel";
pub const ATTR_VERSION: &str = "version";
pub const ATTR_XMLNS: &str = "xmlns";

pub const TAG_DATAMODEL: &str = "datamodel";
pub const TAG_DATA: &str = "data";
pub const TAG_INITIAL: &str = "initial";
pub const ATTR_ID: &str = "id";

/// *W3C says*:
/// Holds the representation of a state.
///
/// *Attributes*:
/// + __id__ The identifier for this state.
/// + __initial__ The id of the default initial state (or states) for this state. MUST NOT be
///   specified in conjunction with the \<initial\> element. MUST NOT occur in atomic states.
///
/// [__Definition__: An atomic state is a state that has no state, parallel or final children.]\
/// [__Definition__: A compound state is a state that has state, parallel, or final children
/// (or a combination of these).]\
/// [__Definition__: The default initial state(s) of a compound state are those specified by the
/// 'initial' attribute or \<initial\> element, if either is present. Otherwise it is the state's
/// first child state in document order.]
pub const TAG_STATE: &str = "state";
pub const ATTR_INITIAL: &str = "initial";
pub const TAG_HISTORY: &str = "history";
pub const TAG_PARALLEL: &str = "parallel";
pub const TAG_FINAL: &str = "final";
pub const TAG_TRANSITION: &str = "transition";
pub const ATTR_COND: &str = "cond";
pub const ATTR_EVENT: &str = "event";
pub const ATTR_TYPE: &str = "type";
pub const ATTR_TARGET: &str = "target";
pub const TAG_ON_ENTRY: &str = "onentry";
pub const TAG_ON_EXIT: &str = "onexit";

/// *W3C says*:
/// \<invoke\> is used to create an instance of an external service.\
/// *Attributes:*
/// + __type__ URI specifying the type of the external service.
/// + __src__ A URI to be passed to the external service. Must not occur with the 'srcexpr'
///   attribute or the \<content\> element.
/// + __srcexpr__ A dynamic alternative to 'src'.
/// + __id__ / __idlocation__ Identifier of this invocation, literal or data model location.
/// + __namelist__ A space-separated list of zero or more data model locations to be passed
///   to the invoked service.
/// + __autoforward__ A flag indicating whether to forward events to the invoked process.
pub const TAG_INVOKE: &str = "invoke";
pub const ATTR_SRCEXPR: &str = "srcexpr";
pub const ATTR_AUTOFORWARD: &str = "autoforward";

pub const TAG_FINALIZE: &str = "finalize";
pub const TAG_DONEDATA: &str = "donedata";

/// Executable content
pub const TAG_RAISE: &str = "raise";

/// *W3C says*:
/// __\<send\>__ is used to send events and data to external systems, including external SCXML
/// Interpreters, or to raise events in the current SCXML session.
///
/// A conformant SCXML document must specify exactly one of 'event', 'eventexpr' and \<content\>.
/// A conformant document must not specify "namelist" or \<param\> with \<content\>.\
/// The attribute pairs event/eventexpr, target/targetexpr, type/typeexpr, id/idlocation and
/// delay/delayexpr are mutually exclusive.
pub const TAG_SEND: &str = "send";
pub const ATTR_EVENTEXPR: &str = "eventexpr";
pub const ATTR_TARGETEXPR: &str = "targetexpr";
pub const ATTR_TYPEEXPR: &str = "typeexpr";
pub const ATTR_IDLOCATION: &str = "idlocation";
pub const ATTR_DELAY: &str = "delay";
pub const ATTR_DELAYEXPR: &str = "delayexpr";
pub const ATTR_NAMELIST: &str = "namelist";
pub const TAG_PARAM: &str = "param";
pub const TAG_CONTENT: &str = "content";

pub const TAG_LOG: &str = "log";
pub const TAG_SCRIPT: &str = "script";
pub const ATTR_SRC: &str = "src";
pub const TAG_ASSIGN: &str = "assign";
pub const ATTR_LOCATION: &str = "location";

pub const TAG_IF: &str = "if";
pub const TAG_FOR_EACH: &str = "foreach";
pub const ATTR_ARRAY: &str = "array";
pub const ATTR_ITEM: &str = "item";
pub const ATTR_INDEX: &str = "index";

pub const TAG_CANCEL: &str = "cancel";
pub const ATTR_SENDIDEXPR: &str = "sendidexpr";
pub const ATTR_SENDID: &str = "sendid";

pub const TAG_ELSE: &str = "else";
pub const TAG_ELSEIF: &str = "elseif";

pub const ATTR_LABEL: &str = "label";
pub const ATTR_EXPR: &str = "expr";

pub const TARGET_PARENT_SESSION: &str = "#_parent";
pub const TARGET_CHILD_SESSION: &str = "#_child";

const EVENT_ERROR_COMMUNICATION: &str = "error.communication";

enum IfMode {
    Then,
    ElseIf,
    Else,
}

/// One open region of executable content. Regions nest under \<if\> and
/// \<foreach\>, a stack keeps them in sync with the element stack.
enum Frame {
    Block {
        tag: &'static str,
        actions: Vec<Action>,
    },
    If {
        eif: If,
        mode: IfMode,
    },
    ForEach {
        array: String,
        item: String,
        index: String,
        actions: Vec<Action>,
    },
}

impl Frame {
    fn actions_mut(&mut self) -> &mut Vec<Action> {
        match self {
            Frame::Block { actions, .. } => actions,
            Frame::ForEach { actions, .. } => actions,
            Frame::If { eif, mode } => match mode {
                IfMode::Then => &mut eif.then_actions,
                IfMode::ElseIf => {
                    &mut eif
                        .elseif_branches
                        .last_mut()
                        .unwrap_or_else(|| panic!("Internal error: <elseif> branch missing"))
                        .actions
                }
                IfMode::Else => &mut eif.else_actions,
            },
        }
    }
}

struct ReaderState {
    // True if reader is inside an scxml element
    in_scxml: bool,
    id_count: u32,
    invoke_count: u32,
    document_order: u32,
    file: Option<PathBuf>,
    content: String,

    // The resulting model
    model: Model,

    // Open element tags, innermost last.
    tag_stack: Vec<String>,
    // Ids of the open state elements, innermost last.
    state_stack: Vec<String>,
    frames: Vec<Frame>,
    current_transition: Option<Transition>,
}

impl ReaderState {
    fn new(name: &str) -> ReaderState {
        ReaderState {
            in_scxml: false,
            id_count: 0,
            invoke_count: 0,
            document_order: 0,
            file: None,
            content: String::new(),
            model: Model::new(name),
            tag_stack: Vec::new(),
            state_stack: Vec::new(),
            frames: Vec::new(),
            current_transition: None,
        }
    }

    fn path(&self) -> String {
        self.model.display_path()
    }

    fn malformed(&self, reason: impl Into<String>) -> GenError {
        GenError::malformed(&self.path(), reason)
    }

    /// Process all events from the current content.
    fn process(&mut self) -> GenResult<()> {
        #[cfg(feature = "Debug_Reader")]
        debug!(">>> Reading {}", self.path());

        // The reader borrows the buffer; user content is sliced from the
        // original by byte span.
        let ct = self.content.clone();
        let mut reader = Reader::from_str(ct.as_str());
        reader.config_mut().trim_text(true);

        loop {
            match reader.read_event() {
                Err(e) => {
                    return Err(self.malformed(format!(
                        "error at position {}: {:?}",
                        reader.buffer_position(),
                        e
                    )));
                }
                Ok(Event::Eof) => break,
                Ok(Event::Start(e)) => {
                    self.start_element(&mut reader, &e, true)?;
                }
                Ok(Event::End(e)) => {
                    let name = local_name(&self.path(), e.local_name().as_ref())?;
                    self.end_element(&name)?;
                }
                Ok(Event::Empty(e)) => {
                    // Element without content.
                    self.start_element(&mut reader, &e, false)?;
                    let name = local_name(&self.path(), e.local_name().as_ref())?;
                    self.end_element(&name)?;
                }
                // Text is consumed by the content readers, everything else is
                // irrelevant for the model.
                Ok(_e) => {
                    #[cfg(feature = "Debug_Reader")]
                    debug!("Ignored SAX Event {:?}", _e)
                }
            }
        }
        #[cfg(feature = "Debug_Reader")]
        debug!("<<< {}", self.path());
        Ok(())
    }

    fn generate_state_id(&mut self) -> String {
        self.id_count += 1;
        format!("__id{}", self.id_count)
    }

    fn parent_tag(&self) -> &str {
        if self.tag_stack.len() >= 2 {
            self.tag_stack[self.tag_stack.len() - 2].as_str()
        } else {
            ""
        }
    }

    fn verify_parent_tag(&self, name: &str, allowed_parents: &[&str]) -> GenResult<String> {
        let parent_tag = self.parent_tag();
        if !allowed_parents.contains(&parent_tag) {
            let mut allowed_parents_s = String::new();
            let len = allowed_parents.len();
            for (i, ai) in allowed_parents.iter().enumerate() {
                allowed_parents_s += format!(
                    "{}<{}>",
                    if i > 0 {
                        if i < (len - 1) {
                            ", "
                        } else {
                            " or "
                        }
                    } else {
                        ""
                    },
                    ai
                )
                .as_str();
            }
            return Err(self.malformed(format!(
                "<{}> inside <{}>. Only allowed inside {}",
                name, parent_tag, allowed_parents_s
            )));
        }
        Ok(parent_tag.to_string())
    }

    fn current_state_id(&self) -> GenResult<String> {
        match self.state_stack.last() {
            Some(id) => Ok(id.clone()),
            None => Err(self.malformed("element outside of any state")),
        }
    }

    fn current_state_mut(&mut self) -> GenResult<&mut StateNode> {
        let id = self.current_state_id()?;
        match self.model.states.get_mut(&id) {
            Some(s) => Ok(s),
            None => panic!("Internal error: current state '{}' unknown", id),
        }
    }

    fn get_required_attr(&self, tag: &str, attribute: &str, attr: &AttributeMap) -> GenResult<String> {
        match attr.get(attribute) {
            Some(v) => Ok(v.clone()),
            None => Err(self.malformed(format!("<{}> requires attribute {}", tag, attribute))),
        }
    }

    fn parse_boolean(&self, value: Option<&String>, default: bool) -> bool {
        match value {
            Some(val) => val.eq_ignore_ascii_case("true"),
            None => default,
        }
    }

    fn parse_location_expressions(&self, location_expr: &str) -> Vec<String> {
        location_expr
            .split_ascii_whitespace()
            .map(|location| location.to_string())
            .collect()
    }

    /// Adds content to the innermost open executable content region.
    fn add_action(&mut self, action: Action) -> GenResult<()> {
        match self.frames.last_mut() {
            Some(frame) => {
                frame.actions_mut().push(action);
                Ok(())
            }
            None => Err(self.malformed("executable content in unsupported document part")),
        }
    }

    /// Last \<send\> of the innermost region, for attaching params and content.
    fn last_send_mut(&mut self) -> GenResult<&mut Send> {
        let err = self.malformed("<param> or <content> without enclosing <send>");
        match self.frames.last_mut().and_then(|f| f.actions_mut().last_mut()) {
            Some(Action::Send(send)) => Ok(send),
            _ => Err(err),
        }
    }

    fn last_invoke_mut(&mut self) -> GenResult<&mut Invoke> {
        let state = self.current_state_mut()?;
        match state.invokes.last_mut() {
            Some(invoke) => Ok(invoke),
            None => panic!("Internal error: invoke missing on state"),
        }
    }

    /// Reads the raw content until the matching end-tag. The end-tag is
    /// consumed here, the main loop never sees it.
    fn read_content(&mut self, tag: &str, reader: &mut XReader) -> GenResult<String> {
        let start = BytesStart::new(tag.to_string());
        let end = start.to_end().into_owned();

        let mut buf = Vec::new();
        let content = match reader.read_to_end_into(end.name(), &mut buf) {
            Ok(span) => self.content[(span.start as usize)..(span.end as usize)]
                .trim()
                .to_string(),
            Err(e) => {
                return Err(self.malformed(format!("XML invalid: {}", e)));
            }
        };
        // The end-tag was consumed, remove the element from the stack.
        self.tag_stack.pop();
        Ok(content)
    }

    /// Resolves and loads an external script. The path is restricted to the
    /// directory of the input document (W3C §5.8: a document whose script can
    /// not be loaded MUST be rejected).
    fn load_external_script(&self, src: &str) -> GenResult<String> {
        let unavailable = |reason: String| GenError::ExternalScriptUnavailable {
            path: self.path(),
            src: src.to_string(),
            reason,
        };

        let mut normalized = src;
        if let Some(rest) = normalized.strip_prefix("file://") {
            normalized = rest;
        } else if let Some(rest) = normalized.strip_prefix("file:") {
            normalized = rest;
        }

        let input_dir = match self.file.as_ref().and_then(|f| f.parent()) {
            Some(dir) => dir.to_path_buf(),
            None => {
                return Err(unavailable(
                    "document has no directory to resolve against".to_string(),
                ));
            }
        };

        let input_dir = input_dir
            .canonicalize()
            .map_err(|e| unavailable(format!("cannot resolve input directory: {}", e)))?;
        let resolved = input_dir
            .join(normalized)
            .canonicalize()
            .map_err(|e| unavailable(format!("not found: {}", e)))?;

        if !resolved.starts_with(&input_dir) {
            return Err(unavailable(format!(
                "resolves outside the input directory: {}",
                resolved.display()
            )));
        }

        fs::read_to_string(&resolved).map_err(|e| unavailable(format!("unreadable: {}", e)))
    }

    /// Registers a new state node under the current parent. An atomic parent
    /// becomes compound with its first child.
    fn add_state_node(&mut self, attr: &AttributeMap, kind: StateKind) -> GenResult<()> {
        let id = match attr.get(ATTR_ID) {
            Some(id) => id.clone(),
            None => self.generate_state_id(),
        };
        if self.model.states.contains_key(&id) {
            return Err(self.malformed(format!("duplicate state id '{}'", id)));
        }

        let parent = if kind.is_history() {
            // A history is registered with its parent but is no entry target.
            Some(self.current_state_id()?)
        } else {
            self.state_stack.last().cloned()
        };

        let mut node = StateNode::new(&id, kind, parent.clone(), self.document_order);
        self.document_order += 1;

        if matches!(kind, StateKind::Atomic | StateKind::Compound) {
            if let Some(initial) = attr.get(ATTR_INITIAL) {
                node.initial.clone_from(initial);
            }
        }

        #[cfg(feature = "Debug_Reader")]
        debug!(
            " state #{} {:?} '{}' parent {:?}",
            node.document_order, kind, id, parent
        );

        if let Some(parent_id) = &parent {
            if !kind.is_history() {
                let parent_state = self
                    .model
                    .states
                    .get_mut(parent_id)
                    .unwrap_or_else(|| panic!("Internal error: parent state '{}' unknown", parent_id));
                if parent_state.kind == StateKind::Atomic {
                    parent_state.kind = StateKind::Compound;
                }
            }
        }

        self.model.states.insert(id.clone(), node);
        self.state_stack.push(id);
        Ok(())
    }

    fn start_scxml(&mut self, attr: &AttributeMap) -> GenResult<()> {
        if self.in_scxml {
            return Err(self.malformed(format!("only one <{}> allowed", TAG_SCXML)));
        }
        self.in_scxml = true;

        match attr.get(ATTR_XMLNS) {
            Some(ns) if ns == SCXML_NAMESPACE => {}
            _ => {
                return Err(GenError::NamespaceMismatch { path: self.path() });
            }
        }

        if let Some(initial) = attr.get(ATTR_INITIAL) {
            self.model.initial.clone_from(initial);
        }
        if let Some(datamodel) = attr.get(ATTR_DATAMODEL) {
            #[cfg(feature = "Debug_Reader")]
            debug!(" scxml.datamodel = {}", datamodel);
            self.model.datamodel_kind = datamodel.to_lowercase();
        }
        if let Some(binding) = attr.get(ATTR_BINDING) {
            self.model.binding = BindingType::from_str(binding)
                .map_err(|e| self.malformed(format!("{}: {}", ATTR_BINDING, e)))?;
        }
        if let Some(version) = attr.get(ATTR_VERSION) {
            self.model.version.clone_from(version);
        }
        // The name attribute is purely informational; the model keeps the
        // file stem, which is unique across the W3C corpus.
        let _ = attr.get(ATTR_NAME);
        Ok(())
    }

    fn start_state(&mut self, attr: &AttributeMap) -> GenResult<()> {
        self.verify_parent_tag(TAG_STATE, &[TAG_SCXML, TAG_STATE, TAG_PARALLEL])?;
        self.add_state_node(attr, StateKind::Atomic)
    }

    fn start_parallel(&mut self, attr: &AttributeMap) -> GenResult<()> {
        self.verify_parent_tag(TAG_PARALLEL, &[TAG_SCXML, TAG_STATE, TAG_PARALLEL])?;
        self.model.flags.has_parallel_states = true;
        self.add_state_node(attr, StateKind::Parallel)
    }

    fn start_final(&mut self, attr: &AttributeMap) -> GenResult<()> {
        self.verify_parent_tag(TAG_FINAL, &[TAG_SCXML, TAG_STATE])?;
        self.add_state_node(attr, StateKind::Final)
    }

    fn start_history(&mut self, attr: &AttributeMap) -> GenResult<()> {
        self.verify_parent_tag(TAG_HISTORY, &[TAG_STATE, TAG_PARALLEL])?;
        let kind = match attr.get(ATTR_TYPE) {
            None => crate::model::HistoryKind::Shallow,
            Some(type_name) => {
                map_history_type(type_name).map_err(|e| self.malformed(e))?
            }
        };
        self.model.flags.has_history_states = true;
        self.add_state_node(attr, StateKind::History(kind))
    }

    fn start_donedata(&mut self) -> GenResult<()> {
        self.verify_parent_tag(TAG_DONEDATA, &[TAG_FINAL])?;
        self.current_state_mut()?.donedata = Some(DoneData::default());
        Ok(())
    }

    /// A "initial" element started (the element, not the attribute).
    fn start_initial(&mut self) -> GenResult<()> {
        self.verify_parent_tag(TAG_INITIAL, &[TAG_STATE, TAG_PARALLEL])?;
        if !self.current_state_mut()?.initial.is_empty() {
            return Err(self.malformed(format!(
                "<{}> must not be specified if {}-attribute was given",
                TAG_INITIAL, ATTR_INITIAL
            )));
        }
        Ok(())
    }

    // A "datamodel" element started (the element, not the attribute).
    fn start_datamodel(&mut self) -> GenResult<()> {
        self.verify_parent_tag(TAG_DATAMODEL, &[TAG_SCXML, TAG_STATE, TAG_PARALLEL])?;
        Ok(())
    }

    fn start_data(
        &mut self,
        attr: &AttributeMap,
        reader: &mut XReader,
        has_content: bool,
    ) -> GenResult<()> {
        self.verify_parent_tag(TAG_DATA, &[TAG_DATAMODEL])?;

        let id = self.get_required_attr(TAG_DATA, ATTR_ID, attr)?;
        let src = attr.get(ATTR_SRC).cloned().unwrap_or_default();
        let expr = attr.get(ATTR_EXPR).cloned().unwrap_or_default();

        let content = if has_content {
            self.read_content(TAG_DATA, reader)?
        } else {
            String::new()
        };

        // W3C: 'src', 'expr' and children are mutually exclusive in <data>.
        let given = [!src.is_empty(), !expr.is_empty(), !content.is_empty()]
            .iter()
            .filter(|b| **b)
            .count();
        if given > 1 {
            return Err(self.malformed(format!(
                "<{}> shall have only {}, {} or children, but not some combination of it",
                TAG_DATA, ATTR_SRC, ATTR_EXPR
            )));
        }

        let variable = DataVariable {
            id,
            expr,
            src,
            content,
            ..Default::default()
        };

        // Only datamodel blocks directly below the root bind to the document;
        // nested blocks bind to their enclosing state.
        let scope_tag = self.tag_stack[self.tag_stack.len() - 3].clone();
        if scope_tag == TAG_SCXML {
            self.model.variables.push(variable);
        } else {
            self.model.flags.has_scoped_datamodel = true;
            self.current_state_mut()?.datamodel.push(variable);
        }
        Ok(())
    }

    fn start_transition(&mut self, attr: &AttributeMap) -> GenResult<()> {
        self.verify_parent_tag(
            TAG_TRANSITION,
            &[TAG_HISTORY, TAG_INITIAL, TAG_STATE, TAG_PARALLEL],
        )?;

        let mut t = Transition::default();

        if let Some(event) = attr.get(ATTR_EVENT) {
            t.event.clone_from(event);
            // Non-wildcard tokens enter the compile-time event enumeration;
            // wildcards are matched by the runtime helper.
            for token in event.split_whitespace() {
                if !is_wildcard_token(token) && !token.ends_with(".*") {
                    self.model.events.insert(token.to_string());
                }
            }
        }

        // The guard may be given as 'cond' or (legacy) 'expr'.
        let cond = attr
            .get(ATTR_COND)
            .or_else(|| attr.get(ATTR_EXPR))
            .cloned()
            .unwrap_or_default();
        let (cond_kind, cond_native) = classify_guard(&cond);
        t.cond = cond;
        t.cond_kind = cond_kind;
        t.cond_native = cond_native;

        if let Some(target) = attr.get(ATTR_TARGET) {
            t.target.clone_from(target);
        }
        if let Some(trans_type) = attr.get(ATTR_TYPE) {
            t.kind = map_transition_type(trans_type).map_err(|e| self.malformed(e))?;
        }

        self.frames.push(Frame::Block {
            tag: TAG_TRANSITION,
            actions: Vec::new(),
        });
        self.current_transition = Some(t);
        Ok(())
    }

    fn end_transition(&mut self) -> GenResult<()> {
        let actions = match self.frames.pop() {
            Some(Frame::Block { actions, .. }) => actions,
            _ => panic!("Internal error: transition region missing"),
        };
        let mut t = self
            .current_transition
            .take()
            .unwrap_or_else(|| panic!("Internal error: current transition unknown"));
        t.actions = actions;

        let parent_tag = self.parent_tag().to_string();
        match parent_tag.as_str() {
            TAG_INITIAL => {
                let target = t.target.clone();
                let actions = t.actions;
                let state = self.current_state_mut()?;
                if !state.initial.is_empty() {
                    return Err(self.malformed(
                        "<initial> must not be specified if initial-attribute was given",
                    ));
                }
                state.initial = target;
                state.initial_transition_actions = actions;
            }
            TAG_HISTORY => {
                // The first targeted transition is the history default.
                let history_id = self.current_state_id()?;
                if !t.target.is_empty() && !self.model.history_defaults.contains_key(&history_id) {
                    let node = &self.model.states[&history_id];
                    let kind = match node.kind {
                        StateKind::History(k) => k,
                        _ => panic!("Internal error: history node expected"),
                    };
                    let parent = node
                        .parent
                        .clone()
                        .unwrap_or_else(|| panic!("Internal error: history without parent"));
                    self.model
                        .history_defaults
                        .insert(history_id.clone(), t.target.clone());
                    self.model.history_info.insert(
                        history_id,
                        crate::model::HistoryInfo {
                            parent,
                            kind,
                            default_target: t.target.clone(),
                            default_actions: t.actions,
                            leaf_target: String::new(),
                        },
                    );
                }
            }
            _ => {
                self.current_state_mut()?.transitions.push(t);
            }
        }
        Ok(())
    }

    fn start_on_entry(&mut self) -> GenResult<()> {
        self.verify_parent_tag(TAG_ON_ENTRY, &[TAG_STATE, TAG_PARALLEL, TAG_FINAL])?;
        self.frames.push(Frame::Block {
            tag: TAG_ON_ENTRY,
            actions: Vec::new(),
        });
        Ok(())
    }

    fn end_on_entry(&mut self) -> GenResult<()> {
        match self.frames.pop() {
            Some(Frame::Block { actions, .. }) => {
                self.current_state_mut()?.on_entry.extend(actions);
                Ok(())
            }
            _ => panic!("Internal error: onentry region missing"),
        }
    }

    fn start_on_exit(&mut self) -> GenResult<()> {
        self.verify_parent_tag(TAG_ON_EXIT, &[TAG_STATE, TAG_PARALLEL, TAG_FINAL])?;
        self.frames.push(Frame::Block {
            tag: TAG_ON_EXIT,
            actions: Vec::new(),
        });
        Ok(())
    }

    fn end_on_exit(&mut self) -> GenResult<()> {
        match self.frames.pop() {
            Some(Frame::Block { actions, .. }) => {
                self.current_state_mut()?.on_exit.extend(actions);
                Ok(())
            }
            _ => panic!("Internal error: onexit region missing"),
        }
    }

    fn start_raise(&mut self, attr: &AttributeMap) -> GenResult<()> {
        self.verify_parent_tag(
            TAG_RAISE,
            &[TAG_TRANSITION, TAG_ON_EXIT, TAG_ON_ENTRY, TAG_IF, TAG_FOR_EACH],
        )?;
        let event = self.get_required_attr(TAG_RAISE, ATTR_EVENT, attr)?;
        self.model.events.insert(event.clone());
        self.add_action(Action::Raise(Raise { event }))
    }

    fn exclusive(&self, tag: &str, a: (&str, Option<&String>), b: (&str, Option<&String>)) -> GenResult<()> {
        if a.1.is_some() && b.1.is_some() {
            return Err(self.malformed(format!(
                "{}: attributes {} and {} must not occur both",
                tag, a.0, b.0
            )));
        }
        Ok(())
    }

    fn start_send(&mut self, attr: &AttributeMap) -> GenResult<()> {
        self.verify_parent_tag(
            TAG_SEND,
            &[TAG_TRANSITION, TAG_ON_EXIT, TAG_ON_ENTRY, TAG_IF, TAG_FOR_EACH],
        )?;

        self.exclusive(TAG_SEND, (ATTR_EVENT, attr.get(ATTR_EVENT)), (ATTR_EVENTEXPR, attr.get(ATTR_EVENTEXPR)))?;
        self.exclusive(TAG_SEND, (ATTR_TARGET, attr.get(ATTR_TARGET)), (ATTR_TARGETEXPR, attr.get(ATTR_TARGETEXPR)))?;
        self.exclusive(TAG_SEND, (ATTR_TYPE, attr.get(ATTR_TYPE)), (ATTR_TYPEEXPR, attr.get(ATTR_TYPEEXPR)))?;
        self.exclusive(TAG_SEND, (ATTR_ID, attr.get(ATTR_ID)), (ATTR_IDLOCATION, attr.get(ATTR_IDLOCATION)))?;
        self.exclusive(TAG_SEND, (ATTR_DELAY, attr.get(ATTR_DELAY)), (ATTR_DELAYEXPR, attr.get(ATTR_DELAYEXPR)))?;

        let mut send = Send::default();
        let get = |name: &str| attr.get(name).cloned().unwrap_or_default();
        send.event = get(ATTR_EVENT);
        send.event_expr = get(ATTR_EVENTEXPR);
        send.target = get(ATTR_TARGET);
        send.target_expr = get(ATTR_TARGETEXPR);
        send.send_type = get(ATTR_TYPE);
        send.type_expr = get(ATTR_TYPEEXPR);
        send.id = get(ATTR_ID);
        send.id_location = get(ATTR_IDLOCATION);
        send.delay = get(ATTR_DELAY);
        send.delay_expr = get(ATTR_DELAYEXPR);
        if let Some(name_list) = attr.get(ATTR_NAMELIST) {
            send.namelist = self.parse_location_expressions(name_list);
        }

        if send.target == TARGET_PARENT_SESSION {
            self.model.flags.has_parent_communication = true;
        } else if send.target == TARGET_CHILD_SESSION {
            self.model.flags.has_child_communication = true;
        }

        if !send.event.is_empty() {
            self.model.events.insert(send.event.clone());
        }
        if !send.target_expr.is_empty() {
            // The target may turn out unreachable at runtime.
            self.model
                .events
                .insert(EVENT_ERROR_COMMUNICATION.to_string());
        }

        self.add_action(Action::Send(Box::new(send)))
    }

    fn start_param(&mut self, attr: &AttributeMap) -> GenResult<()> {
        let parent_tag = self.verify_parent_tag(TAG_PARAM, &[TAG_SEND, TAG_INVOKE, TAG_DONEDATA])?;

        let name = self.get_required_attr(TAG_PARAM, ATTR_NAME, attr)?;
        let expr = attr.get(ATTR_EXPR).cloned().unwrap_or_default();
        let location = match attr.get(ATTR_LOCATION) {
            Some(location) => {
                if !expr.is_empty() {
                    return Err(self.malformed(format!(
                        "<{}> shall have only {} or {}, but not both",
                        TAG_PARAM, ATTR_LOCATION, ATTR_EXPR
                    )));
                }
                location.clone()
            }
            None => String::new(),
        };

        let is_static_literal = is_static_string_literal(&expr);
        let static_value = if is_static_literal {
            static_string_value(&expr)
        } else {
            String::new()
        };
        let param = Param {
            name,
            expr,
            location,
            is_static_literal,
            static_value,
        };

        match parent_tag.as_str() {
            TAG_SEND => self.last_send_mut()?.params.push(param),
            TAG_INVOKE => self.last_invoke_mut()?.params.push(param),
            TAG_DONEDATA => match self.current_state_mut()?.donedata.as_mut() {
                Some(dd) => dd.params.push(param),
                None => panic!("Internal error: donedata not initialized"),
            },
            _ => unreachable!(),
        }
        Ok(())
    }

    fn start_content(
        &mut self,
        attr: &AttributeMap,
        reader: &mut XReader,
        has_content: bool,
    ) -> GenResult<()> {
        let parent_tag = self.verify_parent_tag(TAG_CONTENT, &[TAG_SEND, TAG_INVOKE, TAG_DONEDATA])?;

        let expr = attr.get(ATTR_EXPR).cloned().unwrap_or_default();
        let content = if has_content {
            self.read_content(TAG_CONTENT, reader)?
        } else {
            String::new()
        };

        // W3C: a conformant document must not specify both the 'expr'
        // attribute and child content.
        if !expr.is_empty() && !content.is_empty() {
            return Err(self.malformed(format!(
                "<{}> shall have only {} or children, but not both",
                TAG_CONTENT, ATTR_EXPR
            )));
        }

        match parent_tag.as_str() {
            TAG_SEND => {
                let needs_empty_event = {
                    let send = self.last_send_mut()?;
                    send.content = content;
                    send.content_expr = expr;
                    // Content-only sends raise an event without a name.
                    send.event.is_empty() && send.event_expr.is_empty() && !send.content.is_empty()
                };
                if needs_empty_event {
                    self.model.events.insert(String::new());
                }
            }
            TAG_INVOKE => {
                let invoke = self.last_invoke_mut()?;
                invoke.has_inline_scxml = content.starts_with("<scxml");
                invoke.content = content;
                invoke.content_expr = expr;
            }
            TAG_DONEDATA => match self.current_state_mut()?.donedata.as_mut() {
                Some(dd) => {
                    dd.content = content;
                    dd.content_expr = expr;
                }
                None => panic!("Internal error: donedata not initialized"),
            },
            _ => unreachable!(),
        }
        Ok(())
    }

    fn start_invoke(&mut self, attr: &AttributeMap) -> GenResult<()> {
        self.verify_parent_tag(TAG_INVOKE, &[TAG_STATE, TAG_PARALLEL])?;

        let mut invoke = Invoke::default();
        let get = |name: &str| attr.get(name).cloned().unwrap_or_default();
        invoke.type_uri = get(ATTR_TYPE);
        invoke.src = get(ATTR_SRC);
        invoke.src_expr = get(ATTR_SRCEXPR);
        invoke.id = get(ATTR_ID);
        invoke.id_location = get(ATTR_IDLOCATION);
        if invoke.id.is_empty() {
            // W3C requires a generated id when none is given.
            invoke.id = format!("_invoke_{}", self.invoke_count);
            self.invoke_count += 1;
        }
        if let Some(name_list) = attr.get(ATTR_NAMELIST) {
            invoke.namelist = self.parse_location_expressions(name_list);
        }
        invoke.autoforward = self.parse_boolean(attr.get(ATTR_AUTOFORWARD), false);
        invoke.state_id = self.current_state_id()?;

        self.model.flags.has_invoke = true;
        self.current_state_mut()?.invokes.push(invoke);
        Ok(())
    }

    fn start_finalize(&mut self) -> GenResult<()> {
        self.verify_parent_tag(TAG_FINALIZE, &[TAG_INVOKE])?;
        self.frames.push(Frame::Block {
            tag: TAG_FINALIZE,
            actions: Vec::new(),
        });
        Ok(())
    }

    fn end_finalize(&mut self) -> GenResult<()> {
        match self.frames.pop() {
            Some(Frame::Block { actions, .. }) => {
                self.last_invoke_mut()?.finalize = actions;
                Ok(())
            }
            _ => panic!("Internal error: finalize region missing"),
        }
    }

    fn start_script(
        &mut self,
        attr: &AttributeMap,
        reader: &mut XReader,
        has_content: bool,
    ) -> GenResult<()> {
        let parent_tag = self.verify_parent_tag(
            TAG_SCRIPT,
            &[
                TAG_SCXML,
                TAG_TRANSITION,
                TAG_ON_EXIT,
                TAG_ON_ENTRY,
                TAG_IF,
                TAG_FOR_EACH,
                TAG_FINALIZE,
            ],
        )?;

        let src = attr.get(ATTR_SRC).cloned().unwrap_or_default();
        let inline = if has_content {
            self.read_content(TAG_SCRIPT, reader)?
        } else {
            String::new()
        };

        if !src.is_empty() && !inline.is_empty() {
            return Err(self.malformed("<script> with 'src' attribute shall not have content"));
        }

        if parent_tag == TAG_SCXML {
            // Global script, executed at document load time. External sources
            // are loaded now; a failure rejects the whole document.
            let content = if src.is_empty() {
                inline
            } else {
                self.load_external_script(&src)?
            };
            self.model.global_scripts.push(GlobalScript { src, content });
            Ok(())
        } else {
            self.add_action(Action::Script(Script { src, content: inline }))
        }
    }

    fn start_assign(
        &mut self,
        attr: &AttributeMap,
        reader: &mut XReader,
        has_content: bool,
    ) -> GenResult<()> {
        self.verify_parent_tag(
            TAG_ASSIGN,
            &[TAG_TRANSITION, TAG_ON_EXIT, TAG_ON_ENTRY, TAG_IF, TAG_FOR_EACH, TAG_FINALIZE],
        )?;

        let location = self.get_required_attr(TAG_ASSIGN, ATTR_LOCATION, attr)?;
        let mut expr = attr.get(ATTR_EXPR).cloned().unwrap_or_default();

        let assign_text = if has_content {
            self.read_content(TAG_ASSIGN, reader)?
        } else {
            String::new()
        };
        if !assign_text.is_empty() {
            if !expr.is_empty() {
                return Err(self.malformed("<assign> with 'expr' attribute shall not have content"));
            }
            // Inline children become the assigned expression, as one line.
            expr = assign_text.split_whitespace().collect::<Vec<_>>().join(" ");
        }

        self.add_action(Action::Assign(Assign { location, expr }))
    }

    fn start_log(&mut self, attr: &AttributeMap) -> GenResult<()> {
        self.verify_parent_tag(
            TAG_LOG,
            &[TAG_TRANSITION, TAG_ON_EXIT, TAG_ON_ENTRY, TAG_IF, TAG_FOR_EACH, TAG_FINALIZE],
        )?;
        let label = attr.get(ATTR_LABEL).cloned().unwrap_or_default();
        let expr = attr.get(ATTR_EXPR).cloned().unwrap_or_default();
        self.add_action(Action::Log(Log { label, expr }))
    }

    fn start_cancel(&mut self, attr: &AttributeMap) -> GenResult<()> {
        self.verify_parent_tag(
            TAG_CANCEL,
            &[TAG_TRANSITION, TAG_ON_EXIT, TAG_ON_ENTRY, TAG_IF, TAG_FOR_EACH],
        )?;

        let sendid = attr.get(ATTR_SENDID);
        let sendidexpr = attr.get(ATTR_SENDIDEXPR);
        self.exclusive(TAG_CANCEL, (ATTR_SENDID, sendid), (ATTR_SENDIDEXPR, sendidexpr))?;

        let mut cancel = Cancel::default();
        if let Some(sendid_value) = sendid {
            cancel.send_id.clone_from(sendid_value);
        } else if let Some(sendidexpr_value) = sendidexpr {
            cancel.send_id_expr.clone_from(sendidexpr_value);
        } else {
            return Err(self.malformed(format!(
                "{}: attribute {} or {} must be given",
                TAG_CANCEL, ATTR_SENDID, ATTR_SENDIDEXPR
            )));
        }
        self.add_action(Action::Cancel(cancel))
    }

    fn start_for_each(&mut self, attr: &AttributeMap) -> GenResult<()> {
        self.verify_parent_tag(
            TAG_FOR_EACH,
            &[TAG_ON_ENTRY, TAG_ON_EXIT, TAG_TRANSITION, TAG_FOR_EACH, TAG_IF, TAG_FINALIZE],
        )?;

        let array = self.get_required_attr(TAG_FOR_EACH, ATTR_ARRAY, attr)?;
        let item = self.get_required_attr(TAG_FOR_EACH, ATTR_ITEM, attr)?;
        let index = attr.get(ATTR_INDEX).cloned().unwrap_or_default();
        self.frames.push(Frame::ForEach {
            array,
            item,
            index,
            actions: Vec::new(),
        });
        Ok(())
    }

    fn end_for_each(&mut self) -> GenResult<()> {
        match self.frames.pop() {
            Some(Frame::ForEach {
                array,
                item,
                index,
                actions,
            }) => self.add_action(Action::ForEach(Box::new(ForEach {
                array,
                item,
                index,
                actions,
            }))),
            _ => panic!("Internal error: foreach region missing"),
        }
    }

    fn start_if(&mut self, attr: &AttributeMap) -> GenResult<()> {
        self.verify_parent_tag(
            TAG_IF,
            &[TAG_ON_ENTRY, TAG_ON_EXIT, TAG_TRANSITION, TAG_FOR_EACH, TAG_IF, TAG_FINALIZE],
        )?;

        let cond = self.get_required_attr(TAG_IF, ATTR_COND, attr)?;
        let (cond_kind, cond_native) = classify_guard(&cond);
        let eif = If {
            cond,
            cond_kind,
            cond_native,
            ..Default::default()
        };
        self.frames.push(Frame::If {
            eif,
            mode: IfMode::Then,
        });
        Ok(())
    }

    fn end_if(&mut self) -> GenResult<()> {
        match self.frames.pop() {
            Some(Frame::If { eif, .. }) => self.add_action(Action::If(Box::new(eif))),
            _ => panic!("Internal error: if region missing"),
        }
    }

    fn start_else_if(&mut self, attr: &AttributeMap) -> GenResult<()> {
        self.verify_parent_tag(TAG_ELSEIF, &[TAG_IF])?;
        let cond = self.get_required_attr(TAG_IF, ATTR_COND, attr)?;
        let (cond_kind, cond_native) = classify_guard(&cond);
        match self.frames.last_mut() {
            Some(Frame::If { eif, mode }) => {
                eif.elseif_branches.push(IfBranch {
                    cond,
                    cond_kind,
                    cond_native,
                    actions: Vec::new(),
                });
                *mode = IfMode::ElseIf;
                Ok(())
            }
            _ => panic!("Internal error: <elseif> without open <if>"),
        }
    }

    fn start_else(&mut self) -> GenResult<()> {
        self.verify_parent_tag(TAG_ELSE, &[TAG_IF])?;
        match self.frames.last_mut() {
            Some(Frame::If { mode, .. }) => {
                *mode = IfMode::Else;
                Ok(())
            }
            _ => panic!("Internal error: <else> without open <if>"),
        }
    }

    fn start_element(
        &mut self,
        reader: &mut XReader,
        e: &BytesStart,
        has_content: bool,
    ) -> GenResult<()> {
        let n = e.local_name();
        let name = local_name(&self.path(), n.as_ref())?;

        if !self.in_scxml && name != TAG_SCXML {
            return Err(self.malformed(format!("unexpected root element <{}>", name)));
        }

        self.tag_stack.push(name.clone());

        #[cfg(feature = "Debug_Reader")]
        debug!("Start Element {}", name);

        let attr = &decode_attributes(&self.path(), reader, &mut e.attributes())?;

        match name.as_str() {
            TAG_SCXML => self.start_scxml(attr),
            TAG_DATAMODEL => self.start_datamodel(),
            TAG_DATA => self.start_data(attr, reader, has_content),
            TAG_STATE => self.start_state(attr),
            TAG_PARALLEL => self.start_parallel(attr),
            TAG_FINAL => self.start_final(attr),
            TAG_DONEDATA => self.start_donedata(),
            TAG_HISTORY => self.start_history(attr),
            TAG_INITIAL => self.start_initial(),
            TAG_INVOKE => self.start_invoke(attr),
            TAG_TRANSITION => self.start_transition(attr),
            TAG_FINALIZE => self.start_finalize(),
            TAG_ON_ENTRY => self.start_on_entry(),
            TAG_ON_EXIT => self.start_on_exit(),
            TAG_SCRIPT => self.start_script(attr, reader, has_content),
            TAG_RAISE => self.start_raise(attr),
            TAG_SEND => self.start_send(attr),
            TAG_PARAM => self.start_param(attr),
            TAG_CONTENT => self.start_content(attr, reader, has_content),
            TAG_LOG => self.start_log(attr),
            TAG_ASSIGN => self.start_assign(attr, reader, has_content),
            TAG_FOR_EACH => self.start_for_each(attr),
            TAG_CANCEL => self.start_cancel(attr),
            TAG_IF => self.start_if(attr),
            TAG_ELSE => self.start_else(),
            TAG_ELSEIF => self.start_else_if(attr),
            _ => {
                #[cfg(feature = "Debug_Reader")]
                debug!("Ignored tag {}", name);
                Ok(())
            }
        }
    }

    /// Called from the SAX handler if some end-tag was read.
    fn end_element(&mut self, name: &str) -> GenResult<()> {
        match self.tag_stack.last() {
            Some(current) if current.as_str() == name => {}
            Some(current) => {
                return Err(self.malformed(format!(
                    "illegal end-tag '{}', expected '{}'",
                    name, current
                )));
            }
            None => {
                return Err(self.malformed(format!("unexpected end-tag '{}'", name)));
            }
        }
        #[cfg(feature = "Debug_Reader")]
        debug!("End Element {}", name);

        match name {
            TAG_TRANSITION => self.end_transition()?,
            TAG_ON_ENTRY => self.end_on_entry()?,
            TAG_ON_EXIT => self.end_on_exit()?,
            TAG_IF => self.end_if()?,
            TAG_FOR_EACH => self.end_for_each()?,
            TAG_FINALIZE => self.end_finalize()?,
            TAG_STATE | TAG_PARALLEL | TAG_FINAL | TAG_HISTORY => {
                self.state_stack.pop();
            }
            _ => {}
        }
        self.tag_stack.pop();
        Ok(())
    }
}

fn local_name(path: &str, raw: &[u8]) -> GenResult<String> {
    match str::from_utf8(raw) {
        Ok(name) => Ok(name.to_string()),
        Err(e) => Err(GenError::malformed(
            path,
            format!("element name is not valid UTF-8: {}", e),
        )),
    }
}

/// Decodes attributes into a hash-map.
fn decode_attributes(
    path: &str,
    reader: &XReader,
    attr: &mut Attributes,
) -> GenResult<AttributeMap> {
    let mut map = AttributeMap::new();
    for attr_result in attr {
        let a = attr_result
            .map_err(|e| GenError::malformed(path, format!("unable to read attribute: {}", e)))?;
        let key = reader
            .decoder()
            .decode(a.key.as_ref())
            .map_err(|e| GenError::malformed(path, format!("attribute name: {}", e)))?;
        let value = a
            .decode_and_unescape_value(reader.decoder())
            .map_err(|e| GenError::malformed(path, format!("attribute value: {}", e)))?;
        map.insert(key.to_string(), value.to_string());
    }
    Ok(map)
}

/// Read and parse the model from an XML file. The model name is the file stem.
pub fn parse_from_file(file: &Path) -> GenResult<Model> {
    let display = file.display().to_string();
    let content = fs::read_to_string(file)
        .map_err(|e| GenError::malformed(&display, format!("failed to read: {}", e)))?;
    let stem = file
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("buffer")
        .to_string();
    let mut rs = ReaderState::new(&stem);
    rs.file = Some(file.to_path_buf());
    rs.model.source_path = Some(file.to_path_buf());
    rs.content = content;
    rs.process()?;
    Ok(rs.model)
}

/// Reads the model from an XML string. Buffer parses are named "buffer" and
/// can not resolve external scripts.
pub fn parse_from_xml(xml: &str) -> GenResult<Model> {
    let mut rs = ReaderState::new("buffer");
    rs.content = xml.to_string();
    rs.process()?;
    Ok(rs.model)
}
