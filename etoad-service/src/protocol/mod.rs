// Protocol Module
// Protocol model, load errors and the JSON/YAML loader

pub mod error;
pub mod loader;
pub mod models;

pub use error::{ParseError, ParseErrorKind, ParseResult};
pub use loader::{load_file, parse_str, FileProtocolLoader, ProtocolFormat, ProtocolLoader};
pub use models::*;
