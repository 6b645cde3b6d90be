//! slo compiler: scanner plus single-pass Pratt parser emitting bytecode
//!
//! There is no AST: the parser drives bytecode emission directly into the
//! chunk of the function under construction. `compile` returns a handle to
//! the top-level script function, ready to be wrapped in a closure and run.

pub mod parser;
pub mod scanner;

pub use parser::compile;
pub use scanner::{Scanner, Token, TokenKind};

use std::collections::HashSet;

/// Compilation state that outlives a single `compile` call. In the REPL each
/// line is its own compile, but `final` registrations must persist so a later
/// line can neither reassign nor shadow an earlier `final` binding.
#[derive(Debug, Default)]
pub struct Session {
    pub final_globals: HashSet<String>,
}
