//! A static ahead-of-time code generator for State Chart XML (SCXML).\
//! \
//! According to W3C Recommendations, reading SCXML and emitting deterministic
//! state-machine source for a target systems language. Transitions, hierarchy,
//! history restoration and invoked-child interaction are resolved at compile
//! time wherever possible; a runtime script-evaluation engine is only brought
//! in where SCXML demands dynamic expression evaluation.

pub mod classifier;
pub mod common;
pub mod emitter;
pub mod error;
pub mod features;
pub mod model;
pub mod normalize;
pub mod scxml_reader;
pub mod strategy;

use std::path::Path;

use emitter::{CppRenderer, EmitOutcome, EmitterDriver};
use error::GenResult;
use model::Model;
use strategy::MachineStrategy;

fn finish_analysis(model: &mut Model) -> GenResult<()> {
    normalize::normalize(model)?;
    features::analyze(model);
    classifier::build_prefix_matches(model);
    Ok(())
}

/// Parses and fully analyzes one document: model build, normalization,
/// feature scan and prefix-match closure. The result is ready for emission.
pub fn analyze_file(path: &Path) -> GenResult<Model> {
    let mut model = scxml_reader::parse_from_file(path)?;
    finish_analysis(&mut model)?;
    Ok(model)
}

/// Same pipeline over an in-memory document. Used by tests and tooling;
/// buffer documents can not reference external scripts or children.
pub fn analyze_xml(xml: &str) -> GenResult<Model> {
    let mut model = scxml_reader::parse_from_xml(xml)?;
    finish_analysis(&mut model)?;
    Ok(model)
}

/// One full generator run over an input file.
pub fn generate(
    scxml_file: &Path,
    output_dir: &Path,
    template_dir: Option<&Path>,
    as_child: bool,
) -> GenResult<(Model, MachineStrategy, EmitOutcome)> {
    let mut model = analyze_file(scxml_file)?;
    if as_child {
        // Invoked children always speak to their parent session.
        model.flags.has_parent_communication = true;
    }

    let machine = strategy::classify_machine(&model);
    let renderer = CppRenderer::new(template_dir.map(|d| d.to_path_buf()));
    let driver = EmitterDriver::new(&renderer, output_dir);
    let outcome = driver.emit(&model, &machine)?;
    Ok((model, machine, outcome))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const CHILD: &str = "<scxml xmlns='http://www.w3.org/2005/07/scxml' initial='c0' version='1.0'>\
        <state id='c0'>\
        <onentry><send target='#_parent' event='failure'/></onentry>\
        </state></scxml>";

    #[test]
    fn child_to_parent_event_closure() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("c.scxml"), CHILD).unwrap();
        let parent_path = dir.path().join("parent.scxml");
        fs::write(
            &parent_path,
            "<scxml xmlns='http://www.w3.org/2005/07/scxml' initial='a' version='1.0'>\
             <state id='a'><invoke src='c.scxml'/>\
             <transition event='*' target='fail'/></state>\
             <state id='fail'/></scxml>",
        )
        .unwrap();

        let model = analyze_file(&parent_path).unwrap();
        assert!(model.events.contains("failure"));
        assert_eq!(model.static_invokes.len(), 1);
        assert_eq!(model.static_invokes[0].child_name, "c");
    }

    #[test]
    fn inline_child_extracted_and_listed() {
        let dir = tempfile::tempdir().unwrap();
        let parent_path = dir.path().join("parent.scxml");
        fs::write(
            &parent_path,
            "<scxml xmlns='http://www.w3.org/2005/07/scxml' initial='a' version='1.0'>\
             <state id='a'><invoke type='scxml'><content>\
             <scxml xmlns='http://www.w3.org/2005/07/scxml' name='mc' initial='c0'>\
             <state id='c0'><onentry><send target='#_parent' event='childReady'/></onentry>\
             </state></scxml>\
             </content></invoke></state></scxml>",
        )
        .unwrap();

        let out_dir = dir.path().join("gen");
        let (model, machine, outcome) =
            generate(&parent_path, &out_dir, None, false).unwrap();

        // The child is materialized next to the parent, name-prefixed.
        let extracted = dir.path().join("parent_mc.scxml");
        assert!(extracted.exists());
        let extracted_content = fs::read_to_string(&extracted).unwrap();
        assert!(extracted_content.starts_with("<?xml version=\"1.0\"?>"));

        assert!(matches!(machine, MachineStrategy::Static));
        assert!(model.events.contains("childReady"));

        let manifest = fs::read_to_string(outcome.manifest_path.unwrap()).unwrap();
        assert_eq!(manifest, "parent_mc\n");
        assert!(outcome.unit_path.exists());
    }

    #[test]
    fn anonymous_inline_child_is_numbered_and_namespaced() {
        let dir = tempfile::tempdir().unwrap();
        let parent_path = dir.path().join("p2.scxml");
        // The inline child inherits the parent's default namespace and does
        // not declare its own.
        fs::write(
            &parent_path,
            "<scxml xmlns='http://www.w3.org/2005/07/scxml' initial='a' version='1.0'>\
             <state id='a'><invoke><content>\
             <scxml initial='c0'><state id='c0'/></scxml>\
             </content></invoke></state></scxml>",
        )
        .unwrap();

        let model = analyze_file(&parent_path).unwrap();
        assert_eq!(model.static_invokes[0].child_name, "p2_child0");
        let extracted = fs::read_to_string(dir.path().join("p2_child0.scxml")).unwrap();
        assert!(extracted.contains("xmlns=\"http://www.w3.org/2005/07/scxml\""));
        // The re-declared namespace makes the extracted unit analyzable.
        assert!(!model.static_invokes[0].child_needs_script_engine);
    }

    #[test]
    fn inline_child_engine_need_detected() {
        let dir = tempfile::tempdir().unwrap();
        let parent_path = dir.path().join("p3.scxml");
        fs::write(
            &parent_path,
            "<scxml xmlns='http://www.w3.org/2005/07/scxml' initial='a' version='1.0'>\
             <state id='a'><invoke><content>\
             <scxml xmlns='http://www.w3.org/2005/07/scxml' initial='c0'>\
             <datamodel><data id='cv' expr='1'/></datamodel>\
             <state id='c0'/></scxml>\
             </content></invoke></state></scxml>",
        )
        .unwrap();

        let model = analyze_file(&parent_path).unwrap();
        let info = &model.static_invokes[0];
        assert!(info.child_needs_script_engine);
        assert_eq!(info.child_datamodel_vars, vec!["cv".to_string()]);
        // The parent itself has no engine trigger.
        assert!(!model.flags.needs_script_engine);
    }

    #[test]
    fn global_script_loaded_with_traversal_guard() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("init.js"), "var x = 1;").unwrap();
        let doc_path = dir.path().join("m.scxml");
        fs::write(
            &doc_path,
            "<scxml xmlns='http://www.w3.org/2005/07/scxml' initial='a' version='1.0'>\
             <script src='init.js'/><state id='a'/></scxml>",
        )
        .unwrap();

        let model = analyze_file(&doc_path).unwrap();
        assert_eq!(model.global_scripts[0].content, "var x = 1;");
        assert!(model.flags.needs_script_engine);

        // Outside the input directory: the document must be rejected.
        fs::write(
            &doc_path,
            "<scxml xmlns='http://www.w3.org/2005/07/scxml' initial='a' version='1.0'>\
             <script src='../outside.js'/><state id='a'/></scxml>",
        )
        .unwrap();
        let r = analyze_file(&doc_path);
        assert!(matches!(
            r,
            Err(error::GenError::ExternalScriptUnavailable { .. })
        ));
    }

    #[test]
    fn missing_global_script_rejects_document() {
        let dir = tempfile::tempdir().unwrap();
        let doc_path = dir.path().join("m.scxml");
        fs::write(
            &doc_path,
            "<scxml xmlns='http://www.w3.org/2005/07/scxml' initial='a' version='1.0'>\
             <script src='gone.js'/><state id='a'/></scxml>",
        )
        .unwrap();
        let r = analyze_file(&doc_path);
        assert!(matches!(
            r,
            Err(error::GenError::ExternalScriptUnavailable { .. })
        ));
    }

    #[test]
    fn broken_child_does_not_block_parent() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("bad.scxml"), "<scxml this is not xml").unwrap();
        let parent_path = dir.path().join("parent.scxml");
        fs::write(
            &parent_path,
            "<scxml xmlns='http://www.w3.org/2005/07/scxml' initial='a' version='1.0'>\
             <state id='a'><invoke src='bad.scxml'/></state></scxml>",
        )
        .unwrap();

        let model = analyze_file(&parent_path).unwrap();
        // Conservative assumption for the unparseable child.
        assert!(model.static_invokes[0].child_needs_script_engine);
    }

    #[test]
    fn wrapper_emitted_for_unresolved_initial() {
        let dir = tempfile::tempdir().unwrap();
        let doc_path = dir.path().join("w.scxml");
        fs::write(
            &doc_path,
            "<scxml xmlns='http://www.w3.org/2005/07/scxml' initial='ghost' version='1.0'>\
             <state id='a'/></scxml>",
        )
        .unwrap();

        let out_dir = dir.path().join("gen");
        let (_, machine, outcome) = generate(&doc_path, &out_dir, None, false).unwrap();
        assert!(matches!(machine, MachineStrategy::InterpreterWrapper { .. }));
        let unit = fs::read_to_string(outcome.unit_path).unwrap();
        assert!(unit.contains("Interpreter wrapper"));
    }

    #[test]
    fn as_child_forces_parent_communication() {
        let dir = tempfile::tempdir().unwrap();
        let doc_path = dir.path().join("c.scxml");
        fs::write(
            &doc_path,
            "<scxml xmlns='http://www.w3.org/2005/07/scxml' initial='a' version='1.0'>\
             <state id='a'/></scxml>",
        )
        .unwrap();
        let (model, _, _) =
            generate(&doc_path, &dir.path().join("gen"), None, true).unwrap();
        assert!(model.flags.has_parent_communication);
    }
}
