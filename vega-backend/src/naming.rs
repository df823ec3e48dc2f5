//! Label mangling
//!
//! Maps a function's lexical nesting path to a flat, NASM-legal code label.
//! Labels are built as `fun$outer$inner`, characters outside the NASM
//! allow-list are transliterated where a known substitution exists (with a
//! `#` marker appended to keep mangled names readable and unambiguous), and
//! runtime-reserved labels can never be produced. Any collision means the
//! naming convention broke upstream, which is a fatal internal error.

use std::collections::BTreeSet;
use thiserror::Error;

/// Prefix of every generated function label.
pub const FUNCTION_PREFIX: &str = "fun";

/// Separator between nesting levels.
pub const LEVEL_SEPARATOR: char = '$';

/// Appended after a transliterated character.
pub const TRANSLITERATION_MARKER: char = '#';

/// Labels reserved for the runtime; user functions must never shadow them.
pub const RESERVED_LABELS: [&str; 3] = ["globals", "display", "main"];

#[derive(Error, Debug, Clone, PartialEq)]
pub enum NamingError {
    #[error("character {0:?} is not allowed in assembler labels and has no known transliteration")]
    IllegalCharacter(char),

    #[error("two identical labels were generated: {0}; the naming convention is inconsistent")]
    DuplicateLabel(String),

    #[error("label {0} is reserved for the runtime")]
    ReservedLabel(String),
}

fn is_allowed(character: char) -> bool {
    character.is_ascii_alphanumeric() || matches!(character, '_' | '$' | '#' | '@' | '~' | '.' | '?')
}

fn transliterate(character: char) -> Option<char> {
    // Known substitutions for letters NASM cannot carry.
    match character {
        'ą' => Some('a'),
        'ć' => Some('c'),
        'ę' => Some('e'),
        'ł' => Some('l'),
        'ó' => Some('o'),
        'ś' => Some('s'),
        'ź' => Some('x'),
        'ż' => Some('z'),
        'Ą' => Some('A'),
        'Ć' => Some('C'),
        'Ę' => Some('E'),
        'Ł' => Some('L'),
        'Ó' => Some('O'),
        'Ś' => Some('S'),
        'Ź' => Some('X'),
        'Ż' => Some('Z'),
        _ => None,
    }
}

/// Produces unique code labels; one factory per compilation.
#[derive(Debug, Default)]
pub struct LabelFactory {
    known: BTreeSet<String>,
}

impl LabelFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the label `prefix$name`, where `prefix` is the enclosing
    /// function's label (or the bare function prefix at top level).
    pub fn make_label(&mut self, prefix: Option<&str>, name: &str) -> Result<String, NamingError> {
        let mut label = String::from(prefix.unwrap_or(FUNCTION_PREFIX));
        label.push(LEVEL_SEPARATOR);
        for character in name.chars() {
            if is_allowed(character) {
                label.push(character);
            } else if let Some(substitute) = transliterate(character) {
                label.push(substitute);
                label.push(TRANSLITERATION_MARKER);
            } else {
                return Err(NamingError::IllegalCharacter(character));
            }
        }
        if RESERVED_LABELS.contains(&label.as_str()) {
            return Err(NamingError::ReservedLabel(label));
        }
        if !self.known.insert(label.clone()) {
            return Err(NamingError::DuplicateLabel(label));
        }
        Ok(label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_top_level_and_nested_labels() {
        let mut factory = LabelFactory::new();
        let outer = factory.make_label(None, "outer").unwrap();
        assert_eq!(outer, "fun$outer");
        let inner = factory.make_label(Some(&outer), "inner").unwrap();
        assert_eq!(inner, "fun$outer$inner");
    }

    #[test]
    fn test_transliteration() {
        let mut factory = LabelFactory::new();
        let label = factory.make_label(None, "żółw").unwrap();
        assert_eq!(label, "fun$z#o#l#w");
    }

    #[test]
    fn test_illegal_character_is_rejected() {
        let mut factory = LabelFactory::new();
        assert_eq!(
            factory.make_label(None, "naïve"),
            Err(NamingError::IllegalCharacter('ï'))
        );
    }

    #[test]
    fn test_duplicate_label_is_rejected() {
        let mut factory = LabelFactory::new();
        factory.make_label(None, "f").unwrap();
        assert_eq!(
            factory.make_label(None, "f"),
            Err(NamingError::DuplicateLabel("fun$f".to_string()))
        );
        // Same name under different prefixes is fine.
        assert!(factory.make_label(Some("fun$g"), "f").is_ok());
    }

    #[test]
    fn test_labels_never_collide_with_reserved_names() {
        // The `fun$` prefix keeps user functions out of the reserved
        // namespace even when they borrow a reserved name.
        let mut factory = LabelFactory::new();
        let label = factory.make_label(None, "globals").unwrap();
        assert_eq!(label, "fun$globals");
        assert!(!RESERVED_LABELS.contains(&label.as_str()));
    }
}
