pub mod dump;
pub mod packet;
pub mod reader;

/// Line terminating a statement: its trimmed form ends with `;`.
///
/// Semicolons inside string literals or procedure bodies are not understood;
/// dumps written by this crate keep one statement per line.
pub fn ends_statement(line: &str) -> bool {
    line.trim_end().ends_with(';')
}

/// Comment or blank line, skipped by the reader.
pub fn is_skippable(line: &str) -> bool {
    let t = line.trim();
    t.is_empty() || t.starts_with("--") || t.starts_with('#') || (t.starts_with("/*") && t.ends_with("*/"))
}
