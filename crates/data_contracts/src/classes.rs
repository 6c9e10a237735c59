use std::io;
use std::path::Path;

/// Read a class-name file: one name per line, surrounding whitespace trimmed,
/// blank lines dropped. The line order defines the class ids.
pub fn load_classes(path: impl AsRef<Path>) -> io::Result<Vec<String>> {
    let raw = std::fs::read_to_string(path)?;
    Ok(parse_classes(&raw))
}

pub fn parse_classes(raw: &str) -> Vec<String> {
    raw.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}
