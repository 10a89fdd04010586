pub mod parser;
pub mod types;

pub use parser::{extract_thought, parse_action};
pub use types::{ActionKind, ParsedAction, Point, ScrollDirection, SelectTarget};
