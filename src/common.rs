//! Common functions.
//!

#[cfg(all(not(test), feature = "EnvLog"))]
pub use log::{debug, error, info, warn};

#[cfg(any(test, not(feature = "EnvLog")))]
pub use std::{eprintln as error, eprintln as warn, println as debug, println as info};

#[cfg(feature = "EnvLog")]
use chrono::Local;
#[cfg(feature = "EnvLog")]
use std::io::Write;

pub const USAGE: &str =
    "Usage: scgen [--output-dir DIR] [--template-dir DIR] [--as-child] <scxml-file>";

/// Options of one generator run.
#[derive(Debug, Default)]
pub struct CliOptions {
    /// The input document.
    pub scxml_file: String,
    /// Where the generated unit and the children manifest go. Defaults to the
    /// working directory.
    pub output_dir: Option<String>,
    /// Renderer template directory. Defaults to the bundled templates.
    pub template_dir: Option<String>,
    /// This run generates an invoked child; the parent-communication path is
    /// forced on.
    pub as_child: bool,
}

fn flag_value(flag: &str, value: Option<&String>) -> Result<String, String> {
    match value {
        Some(v) => Ok(v.clone()),
        None => Err(format!("{} needs a directory", flag)),
    }
}

/// Parses the generator command line: three flags and exactly one input
/// document.
pub fn parse_cli(args: &[String]) -> Result<CliOptions, String> {
    let mut options = CliOptions::default();
    let mut input: Option<String> = None;
    let mut remaining = args.iter();

    while let Some(arg) = remaining.next() {
        match arg.as_str() {
            "--output-dir" => {
                options.output_dir = Some(flag_value(arg, remaining.next())?);
            }
            "--template-dir" => {
                options.template_dir = Some(flag_value(arg, remaining.next())?);
            }
            "--as-child" => {
                options.as_child = true;
            }
            flag if flag.starts_with('-') => {
                return Err(format!("unknown option '{}'", flag));
            }
            file => {
                if input.replace(file.to_string()).is_some() {
                    return Err("more than one input document given".to_string());
                }
            }
        }
    }

    match input {
        Some(scxml_file) => {
            options.scxml_file = scxml_file;
            Ok(options)
        }
        None => Err("missing input document".to_string()),
    }
}

pub fn init_logging() {
    #[cfg(feature = "EnvLog")]
    {
        // Single-shot run: a timestamp and the level are enough, diagnostics
        // carry the document path themselves.
        let _ = env_logger::builder()
            .format(|buf, record| {
                writeln!(
                    buf,
                    "{} {:5} scgen: {}",
                    Local::now().format("%H:%M:%S%.3f"),
                    record.level(),
                    record.args()
                )
            })
            .try_init();
    }
}

/// Get active project features.
pub fn get_features() -> Vec<&'static str> {
    vec![
        #[cfg(feature = "Debug_Reader")]
        "Debug_Reader",
        #[cfg(feature = "EnvLog")]
        "EnvLog",
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|a| a.to_string()).collect()
    }

    #[test]
    fn flags_and_input() {
        let options = parse_cli(&args(&[
            "--output-dir",
            "gen",
            "--as-child",
            "machine.scxml",
        ]))
        .unwrap();
        assert_eq!(options.output_dir.as_deref(), Some("gen"));
        assert!(options.template_dir.is_none());
        assert!(options.as_child);
        assert_eq!(options.scxml_file, "machine.scxml");
    }

    #[test]
    fn input_may_precede_flags() {
        let options = parse_cli(&args(&["machine.scxml", "--template-dir", "tpl"])).unwrap();
        assert_eq!(options.scxml_file, "machine.scxml");
        assert_eq!(options.template_dir.as_deref(), Some("tpl"));
    }

    #[test]
    fn unknown_option_is_rejected() {
        let r = parse_cli(&args(&["--bogus", "machine.scxml"]));
        assert!(r.unwrap_err().contains("--bogus"));
    }

    #[test]
    fn missing_flag_value_is_rejected() {
        let r = parse_cli(&args(&["machine.scxml", "--output-dir"]));
        assert!(r.unwrap_err().contains("--output-dir"));
    }

    #[test]
    fn missing_input_is_rejected() {
        let r = parse_cli(&args(&["--as-child"]));
        assert!(r.is_err());
    }

    #[test]
    fn second_input_is_rejected() {
        let r = parse_cli(&args(&["a.scxml", "b.scxml"]));
        assert!(r.is_err());
    }
}
