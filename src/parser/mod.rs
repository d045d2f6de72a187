mod analyzer;
mod classifier;
mod placeholder;

pub use analyzer::{AnalyzerError, QueryAnalysis, ShardKeyValue, SqlAnalyzer, StatementType};
pub use classifier::{begin_options, classify, CommandKind};
pub use placeholder::{escape_placeholders, placeholder_positions, unescape_placeholders};
