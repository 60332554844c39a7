//! # GCodeStream G-Code
//!
//! Modal state tracking and program stream readers.

pub mod parser;
pub mod stream;

pub use parser::{strip_comment, tokenize, GcodeParser, GcodeState, Word};
pub use stream::{FileStreamReader, StringStreamReader};
