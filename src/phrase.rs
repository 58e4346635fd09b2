//! Trigger-phrase substitution: spoken command phrases become keystrokes.
//! Each rule rewrites its phrase to a one-character stand-in before the
//! text is diffed; the sender later maps stand-ins to their key action.
//! Because a stand-in occupies exactly one character of diff space and one
//! keystroke on the remote side, backspace counts stay aligned and the
//! diff convergence invariant survives the substitution.

use regex::{Regex, RegexBuilder};

/// Keystroke emitted in place of a matched phrase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAction {
    /// Ctrl plus an ASCII key.
    Combo(u8),
    Enter,
}

struct PhraseRule {
    pattern: Regex,
    stand_in: char,
    action: KeyAction,
}

/// Piece of an insert run after stand-in expansion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment<'a> {
    Text(&'a str),
    Key(KeyAction),
}

#[derive(Debug)]
pub enum PhraseError {
    Pattern(regex::Error),
    /// Stand-in characters must be unique across rules.
    DuplicateStandIn(char),
}

impl std::fmt::Display for PhraseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PhraseError::Pattern(e) => write!(f, "phrase pattern error: {e}"),
            PhraseError::DuplicateStandIn(ch) => {
                write!(f, "stand-in {ch:?} already claimed by another rule")
            }
        }
    }
}

impl From<regex::Error> for PhraseError {
    fn from(e: regex::Error) -> Self {
        PhraseError::Pattern(e)
    }
}

/// Configurable trigger-phrase → keystroke map, applied to every snapshot
/// before diffing.
pub struct PhraseMap {
    rules: Vec<PhraseRule>,
}

impl PhraseMap {
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// The reference map: saying "new line" types Ctrl+J.
    pub fn with_defaults() -> Self {
        let mut map = Self::empty();
        map.add_rule(r"\s?\bnew ?line\b\s?", '\n', KeyAction::Combo(b'j'))
            .unwrap();
        map
    }

    /// Register a rule. Patterns match case-insensitively; the stand-in
    /// must not collide with an existing rule's.
    pub fn add_rule(
        &mut self,
        pattern: &str,
        stand_in: char,
        action: KeyAction,
    ) -> Result<(), PhraseError> {
        if self.rules.iter().any(|r| r.stand_in == stand_in) {
            return Err(PhraseError::DuplicateStandIn(stand_in));
        }
        let pattern = RegexBuilder::new(pattern).case_insensitive(true).build()?;
        self.rules.push(PhraseRule {
            pattern,
            stand_in,
            action,
        });
        Ok(())
    }

    /// Rewrite every matched phrase to its rule's stand-in character.
    pub fn apply(&self, text: &str) -> String {
        let mut out = text.to_string();
        for rule in &self.rules {
            let stand_in = rule.stand_in.to_string();
            out = rule
                .pattern
                .replace_all(&out, stand_in.as_str())
                .into_owned();
        }
        out
    }

    /// Key action claimed for a stand-in character, if any.
    pub fn action_for(&self, ch: char) -> Option<KeyAction> {
        self.rules
            .iter()
            .find(|r| r.stand_in == ch)
            .map(|r| r.action)
    }

    /// Split an insert run into text pieces and the keystrokes standing in
    /// between them, in order.
    pub fn segments<'a>(&self, text: &'a str) -> Vec<Segment<'a>> {
        let mut out = Vec::new();
        let mut start = 0;
        for (idx, ch) in text.char_indices() {
            if let Some(action) = self.action_for(ch) {
                if idx > start {
                    out.push(Segment::Text(&text[start..idx]));
                }
                out.push(Segment::Key(action));
                start = idx + ch.len_utf8();
            }
        }
        if start < text.len() {
            out.push(Segment::Text(&text[start..]));
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl Default for PhraseMap {
    fn default() -> Self {
        Self::with_defaults()
    }
}
