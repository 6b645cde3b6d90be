//! slo runtime: the virtual machine, native functions, and built-in modules
//!
//! The public surface is small: build a [`Vm`], feed it source through
//! [`Vm::interpret`], and map the returned [`InterpretError`] to an exit
//! code. Everything else (natives, built-in classes, the module loader)
//! hangs off the VM internally.

pub mod modules;
pub mod natives;
pub mod unescape;
pub mod vm;

pub use slo_core::error::{ExceptionKind, SloError};
pub use vm::{FRAMES_MAX, STACK_MAX, Vm};

use std::cell::RefCell;
use std::fmt;
use std::io;
use std::rc::Rc;

/// Why an `interpret` call failed. Compile errors accumulate through the
/// parser's panic-mode recovery and are reported together; a runtime error
/// is always singular and terminal.
#[derive(Debug)]
pub enum InterpretError {
    Compile(Vec<SloError>),
    Runtime(SloError),
}

impl InterpretError {
    /// Render every report in the standard format, newline-separated.
    pub fn render(&self) -> String {
        match self {
            InterpretError::Compile(errors) => errors
                .iter()
                .map(SloError::render)
                .collect::<Vec<_>>()
                .join("\n"),
            InterpretError::Runtime(error) => error.render(),
        }
    }
}

impl fmt::Display for InterpretError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

impl std::error::Error for InterpretError {}

/// Cloneable byte sink for capturing interpreter output, mainly in tests:
/// hand one clone to [`Vm::with_output`] and read the other afterwards.
#[derive(Debug, Clone, Default)]
pub struct SharedWriter(Rc<RefCell<Vec<u8>>>);

impl SharedWriter {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.borrow()).into_owned()
    }
}

impl io::Write for SharedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
