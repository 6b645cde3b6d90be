//! The interactive line reader
//!
//! One VM lives for the whole session, so globals, interned strings, and
//! `final` registrations accumulate across lines. History persists to
//! `${HOME}/.cslo_history`, one entry per line.

use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use slo_runtime::Vm;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::debug;

const PROMPT: &str = ">> ";

fn history_file_path() -> Option<PathBuf> {
    home::home_dir().map(|dir| dir.join(".cslo_history"))
}

pub fn run(vm: &mut Vm) -> ExitCode {
    let mut editor = match DefaultEditor::new() {
        Ok(editor) => editor,
        Err(e) => {
            eprintln!("Could not start line editor: {e}");
            return ExitCode::FAILURE;
        }
    };
    let history = history_file_path();
    if let Some(path) = &history {
        // Missing history is normal on first run.
        if editor.load_history(path).is_err() {
            debug!(path = %path.display(), "no history file yet");
        }
    }

    loop {
        match editor.readline(PROMPT) {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if line == "exit" {
                    break;
                }
                let _ = editor.add_history_entry(line);
                if let Err(err) = vm.interpret(line, "repl") {
                    eprintln!("{}", err.render());
                }
            }
            Err(ReadlineError::Interrupted) => continue,
            Err(ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("Read error: {e}");
                break;
            }
        }
    }

    if let Some(path) = &history
        && let Err(e) = editor.save_history(path)
    {
        eprintln!("Warning: could not save history: {e}");
    }
    ExitCode::SUCCESS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_path_is_under_home() {
        if let Some(path) = history_file_path() {
            assert!(path.ends_with(".cslo_history"));
        }
    }
}
