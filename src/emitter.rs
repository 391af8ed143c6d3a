//! Binds the frozen model to a template renderer and writes the output units.\
//! The textual templating itself is an external collaborator behind
//! [TemplateRenderer]; the crate ships a compact reference renderer for C++.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{GenError, GenResult};
use crate::model::Model;
use crate::strategy::MachineStrategy;

/// Renderer contract. `capitalize` and `escape_cpp` below are the only
/// filters the core guarantees to a template implementation.
pub trait TemplateRenderer {
    fn render_machine(&self, model: &Model, base_path: &str) -> GenResult<String>;
    fn render_interpreter_wrapper(&self, model: &Model, reason: &str) -> GenResult<String>;
    fn output_extension(&self) -> &'static str;
}

/// Capitalizes state and event names for target-language enums.
/// The empty name (content-only sends) becomes `Empty`.
pub fn capitalize(name: &str) -> String {
    if name.is_empty() {
        return "Empty".to_string();
    }
    if name.eq_ignore_ascii_case("pass") {
        return "Pass".to_string();
    }
    if name.eq_ignore_ascii_case("fail") {
        return "Fail".to_string();
    }
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

/// Escapes a string for embedding into a C++ string literal.
pub fn escape_cpp(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            '\t' => escaped.push_str("\\t"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// Enum member for a state or event name. Event names contain dots.
fn enum_ident(name: &str) -> String {
    let mangled: String = name
        .chars()
        .map(|c| if c == '.' || c == '-' || c == ':' { '_' } else { c })
        .collect();
    capitalize(&mangled)
}

/// The reference renderer: emits one self-contained C++17 header per machine.
pub struct CppRenderer {
    template_dir: Option<PathBuf>,
}

impl CppRenderer {
    pub fn new(template_dir: Option<PathBuf>) -> CppRenderer {
        CppRenderer { template_dir }
    }

    fn check_template_dir(&self, model: &Model) -> GenResult<()> {
        if let Some(dir) = &self.template_dir {
            if !dir.is_dir() {
                return Err(GenError::EmitterFailure {
                    path: model.display_path(),
                    reason: format!("template directory '{}' not found", dir.display()),
                });
            }
        }
        Ok(())
    }
}

impl TemplateRenderer for CppRenderer {
    fn render_machine(&self, model: &Model, base_path: &str) -> GenResult<String> {
        self.check_template_dir(model)?;
        let mut out = String::new();
        let f = &model.flags;

        let _ = writeln!(out, "#pragma once");
        let _ = writeln!(out, "#include <cstdint>");
        let _ = writeln!(out);
        let _ = writeln!(out, "// Generated state machine for '{}'.", model.name);
        let _ = writeln!(out, "namespace RSM::Generated::{} {{", model.name);
        let _ = writeln!(out);

        let _ = writeln!(out, "enum class State : std::uint16_t {{");
        for state in model.states_in_document_order() {
            let _ = writeln!(out, "    {},", enum_ident(&state.id));
        }
        let _ = writeln!(out, "}};");
        let _ = writeln!(out);

        let _ = writeln!(out, "enum class Event : std::uint16_t {{");
        for event in &model.events {
            let _ = writeln!(out, "    {},  // \"{}\"", enum_ident(event), escape_cpp(event));
        }
        if f.has_wildcard {
            let _ = writeln!(out, "    Wildcard,");
        }
        let _ = writeln!(out, "}};");
        let _ = writeln!(out);

        let _ = writeln!(out, "inline constexpr const char* kInitial = \"{}\";", escape_cpp(&model.initial));
        let _ = writeln!(out, "inline constexpr const char* kInitialLeaf = \"{}\";", escape_cpp(&model.initial_leaf));
        let _ = writeln!(out, "inline constexpr const char* kBasePath = \"{}\";", escape_cpp(base_path));
        let _ = writeln!(out);

        let bools: [(&str, bool); 12] = [
            ("kNeedsScriptEngine", f.needs_script_engine),
            ("kUsesInPredicate", f.uses_in_predicate),
            ("kHasParallel", f.has_parallel_states),
            ("kHasHistory", f.has_history_states),
            ("kHasInvoke", f.has_invoke),
            ("kHasHybridInvoke", f.has_hybrid_invoke),
            ("kHasTransitionActions", f.has_transition_actions),
            ("kHasParentCommunication", f.has_parent_communication),
            ("kHasChildCommunication", f.has_child_communication),
            ("kNeedsEventScheduler", f.needs_event_scheduler),
            ("kNeedsDonedata", f.needs_donedata_helper),
            ("kNeedsSend", f.needs_send_helper),
        ];
        for (name, value) in bools {
            let _ = writeln!(out, "inline constexpr bool {} = {};", name, value);
        }
        let _ = writeln!(out);

        if !model.global_scripts.is_empty() {
            for (i, script) in model.global_scripts.iter().enumerate() {
                let _ = writeln!(
                    out,
                    "inline constexpr const char* kGlobalScript{} = \"{}\";",
                    i,
                    escape_cpp(&script.content)
                );
            }
            let _ = writeln!(out);
        }

        if !model.static_invokes.is_empty() {
            let _ = writeln!(out, "inline constexpr const char* kStaticChildren[] = {{");
            for info in &model.static_invokes {
                let _ = writeln!(out, "    \"{}\",", escape_cpp(&info.child_name));
            }
            let _ = writeln!(out, "}};");
            let _ = writeln!(out);
        }

        let _ = writeln!(out, "}} // namespace RSM::Generated::{}", model.name);
        Ok(out)
    }

    /// Thin stub delegating to the runtime interpreter; used for machines the
    /// static track can not express.
    fn render_interpreter_wrapper(&self, model: &Model, reason: &str) -> GenResult<String> {
        self.check_template_dir(model)?;
        let mut out = String::new();
        let _ = writeln!(out, "#pragma once");
        let _ = writeln!(out, "#include <memory>");
        let _ = writeln!(out, "#include \"runtime/StateMachine.h\"");
        let _ = writeln!(out);
        let _ = writeln!(out, "namespace RSM::Generated::{} {{", model.name);
        let _ = writeln!(out);
        let _ = writeln!(out, "// Interpreter wrapper for {}.", model.name);
        let _ = writeln!(out, "// Reason: {}", reason);
        let _ = writeln!(out, "class {} {{", model.name);
        let _ = writeln!(out, "public:");
        let _ = writeln!(
            out,
            "    {}() : machine_(RSM::Runtime::StateMachine::fromFile(\"{}.scxml\")) {{}}",
            model.name, model.name
        );
        let _ = writeln!(out);
        let _ = writeln!(out, "    void run() {{ machine_->run(); }}");
        let _ = writeln!(out);
        let _ = writeln!(out, "private:");
        let _ = writeln!(out, "    std::unique_ptr<RSM::Runtime::StateMachine> machine_;");
        let _ = writeln!(out, "}};");
        let _ = writeln!(out);
        let _ = writeln!(out, "}} // namespace RSM::Generated::{}", model.name);
        Ok(out)
    }

    fn output_extension(&self) -> &'static str {
        "h"
    }
}

/// Paths of the artifacts of one successful run.
#[derive(Debug, Clone)]
pub struct EmitOutcome {
    pub unit_path: PathBuf,
    pub manifest_path: Option<PathBuf>,
}

/// Drives one emission: renders the unit, writes it, and writes the children
/// manifest when static children exist. Never inspects filesystem state
/// beyond creating the output directory and writing its artifacts.
pub struct EmitterDriver<'a> {
    renderer: &'a dyn TemplateRenderer,
    output_dir: PathBuf,
}

impl<'a> EmitterDriver<'a> {
    pub fn new(renderer: &'a dyn TemplateRenderer, output_dir: &Path) -> EmitterDriver<'a> {
        EmitterDriver {
            renderer,
            output_dir: output_dir.to_path_buf(),
        }
    }

    fn write(&self, model: &Model, path: &Path, content: &str) -> GenResult<()> {
        fs::write(path, content).map_err(|e| GenError::EmitterFailure {
            path: model.display_path(),
            reason: format!("cannot write '{}': {}", path.display(), e),
        })
    }

    pub fn emit(&self, model: &Model, strategy: &MachineStrategy) -> GenResult<EmitOutcome> {
        fs::create_dir_all(&self.output_dir).map_err(|e| GenError::EmitterFailure {
            path: model.display_path(),
            reason: format!("cannot create '{}': {}", self.output_dir.display(), e),
        })?;

        // The runtime resolves the base path against the executable location;
        // only the directory name is embedded.
        let base_path = self
            .output_dir
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("")
            .to_string();

        let unit_path = self.output_dir.join(format!(
            "{}_sm.{}",
            model.name,
            self.renderer.output_extension()
        ));

        let rendered = match strategy {
            MachineStrategy::Static => self.renderer.render_machine(model, &base_path)?,
            MachineStrategy::InterpreterWrapper { reason } => {
                self.renderer.render_interpreter_wrapper(model, reason)?
            }
        };
        self.write(model, &unit_path, &rendered)?;

        // The manifest drives recursive child generation in the build system.
        let manifest_path = if matches!(strategy, MachineStrategy::Static)
            && !model.static_invokes.is_empty()
        {
            let path = self.output_dir.join(format!("{}_children.txt", model.name));
            let mut manifest = String::new();
            for info in &model.static_invokes {
                if !info.child_name.is_empty() {
                    manifest.push_str(&info.child_name);
                    manifest.push('\n');
                }
            }
            self.write(model, &path, &manifest)?;
            Some(path)
        } else {
            None
        };

        Ok(EmitOutcome {
            unit_path,
            manifest_path,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StaticInvokeInfo;

    #[test]
    fn capitalize_contract() {
        assert_eq!(capitalize(""), "Empty");
        assert_eq!(capitalize("pass"), "Pass");
        assert_eq!(capitalize("fail"), "Fail");
        assert_eq!(capitalize("s0"), "S0");
        assert_eq!(capitalize("alreadyUpper"), "AlreadyUpper");
    }

    #[test]
    fn escape_cpp_contract() {
        assert_eq!(escape_cpp("a\\b"), "a\\\\b");
        assert_eq!(escape_cpp("say \"hi\""), "say \\\"hi\\\"");
        assert_eq!(escape_cpp("line1\nline2\r\tend"), "line1\\nline2\\r\\tend");
        assert_eq!(escape_cpp(""), "");
    }

    #[test]
    fn enum_idents() {
        assert_eq!(enum_ident("done.state.s0"), "Done_state_s0");
        assert_eq!(enum_ident(""), "Empty");
    }

    fn sample_model() -> Model {
        let mut model = Model::new("sample");
        model.initial = "a".to_string();
        model.initial_leaf = "a".to_string();
        model.states.insert(
            "a".to_string(),
            crate::model::StateNode::new("a", crate::model::StateKind::Atomic, None, 0),
        );
        model.events.insert("go".to_string());
        model
    }

    #[test]
    fn emits_unit_without_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = CppRenderer::new(None);
        let driver = EmitterDriver::new(&renderer, dir.path());
        let outcome = driver.emit(&sample_model(), &MachineStrategy::Static).unwrap();

        assert!(outcome.unit_path.ends_with("sample_sm.h"));
        assert!(outcome.manifest_path.is_none());
        let unit = std::fs::read_to_string(&outcome.unit_path).unwrap();
        assert!(unit.contains("namespace RSM::Generated::sample"));
        assert!(unit.contains("Go,"));
    }

    #[test]
    fn emits_children_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let mut model = sample_model();
        model.static_invokes.push(StaticInvokeInfo {
            invoke_id: "i0".to_string(),
            child_name: "sample_child0".to_string(),
            ..Default::default()
        });

        let renderer = CppRenderer::new(None);
        let driver = EmitterDriver::new(&renderer, dir.path());
        let outcome = driver.emit(&model, &MachineStrategy::Static).unwrap();

        let manifest_path = outcome.manifest_path.unwrap();
        assert!(manifest_path.ends_with("sample_children.txt"));
        let manifest = std::fs::read_to_string(manifest_path).unwrap();
        assert_eq!(manifest, "sample_child0\n");
    }

    #[test]
    fn wrapper_path_mentions_reason() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = CppRenderer::new(None);
        let driver = EmitterDriver::new(&renderer, dir.path());
        let outcome = driver
            .emit(
                &sample_model(),
                &MachineStrategy::InterpreterWrapper {
                    reason: "no initial state".to_string(),
                },
            )
            .unwrap();
        let unit = std::fs::read_to_string(&outcome.unit_path).unwrap();
        assert!(unit.contains("Interpreter wrapper"));
        assert!(unit.contains("no initial state"));
    }

    #[test]
    fn missing_template_dir_fails() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = CppRenderer::new(Some(PathBuf::from("/no/such/dir")));
        let driver = EmitterDriver::new(&renderer, dir.path());
        let r = driver.emit(&sample_model(), &MachineStrategy::Static);
        assert!(matches!(r, Err(GenError::EmitterFailure { .. })));
    }
}
