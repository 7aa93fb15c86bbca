//! Subject parsing and pattern matching
//!
//! Every message in a stream is addressed by a *subject*: a dot-delimited
//! hierarchical key such as `mydb.public.users.42`. Consumers filter by
//! *patterns* over the same token grammar, where `*` matches exactly one
//! token and a trailing `>` matches one or more remaining tokens.
//!
//! ## Example
//!
//! ```rust
//! use riffle::subject::{Subject, SubjectPattern};
//!
//! let subject = Subject::parse("mydb.public.users.42").unwrap();
//! assert_eq!(subject.token_count(), 4);
//!
//! let pattern = SubjectPattern::parse("mydb.public.*.42").unwrap();
//! assert!(pattern.matches(&subject));
//!
//! let pattern = SubjectPattern::parse("mydb.>").unwrap();
//! assert!(pattern.matches(&subject));
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum number of tokens in a subject or pattern.
///
/// Enforced at parse time; subjects are stored as an ordered token list,
/// so the cap is a validation rule rather than a property of the type.
pub const MAX_TOKENS: usize = 16;

/// Error type for subject and pattern parsing
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubjectError {
    #[error("Empty subject")]
    Empty,
    #[error("Empty token at position {0}")]
    EmptyToken(usize),
    #[error("Too many tokens: {0} (max {MAX_TOKENS})")]
    TooManyTokens(usize),
    #[error("Reserved character {0:?} in token {1:?}")]
    ReservedChar(char, String),
    #[error("Whitespace in token {0:?}")]
    Whitespace(String),
    #[error("'>' must be the final pattern token")]
    MisplacedRest,
}

/// A parsed, validated subject.
///
/// Tokens are stored in order; re-parsing the same string is
/// deterministic, and `Display` re-joins the tokens with `.` so a valid
/// subject round-trips exactly.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Subject {
    tokens: Vec<String>,
}

impl Subject {
    /// Parse and validate a subject string.
    ///
    /// Rejects empty tokens, more than [`MAX_TOKENS`] tokens, and tokens
    /// containing `*`, `>`, or whitespace.
    pub fn parse(raw: &str) -> Result<Self, SubjectError> {
        if raw.is_empty() {
            return Err(SubjectError::Empty);
        }

        let mut tokens = Vec::new();
        for (i, token) in raw.split('.').enumerate() {
            if token.is_empty() {
                return Err(SubjectError::EmptyToken(i));
            }
            validate_token(token)?;
            tokens.push(token.to_string());
        }

        if tokens.len() > MAX_TOKENS {
            return Err(SubjectError::TooManyTokens(tokens.len()));
        }

        Ok(Self { tokens })
    }

    /// Number of tokens in this subject.
    pub fn token_count(&self) -> usize {
        self.tokens.len()
    }

    /// Token at a position, if present.
    pub fn token(&self, index: usize) -> Option<&str> {
        self.tokens.get(index).map(String::as_str)
    }

    /// Iterate over the tokens in order.
    pub fn tokens(&self) -> impl Iterator<Item = &str> {
        self.tokens.iter().map(String::as_str)
    }
}

impl std::fmt::Display for Subject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.tokens.join("."))
    }
}

impl TryFrom<String> for Subject {
    type Error = SubjectError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Subject::parse(&value)
    }
}

impl From<Subject> for String {
    fn from(subject: Subject) -> Self {
        subject.to_string()
    }
}

impl std::str::FromStr for Subject {
    type Err = SubjectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Subject::parse(s)
    }
}

fn validate_token(token: &str) -> Result<(), SubjectError> {
    for c in token.chars() {
        match c {
            '*' | '>' => return Err(SubjectError::ReservedChar(c, token.to_string())),
            c if c.is_whitespace() => return Err(SubjectError::Whitespace(token.to_string())),
            _ => {}
        }
    }
    Ok(())
}

/// One element of a parsed pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
enum PatternToken {
    /// Exact string match at this position
    Literal(String),
    /// `*`: exactly one token, any value
    AnyOne,
    /// `>`: one or more remaining tokens; only valid in final position
    Rest,
}

/// A compiled subject pattern.
///
/// Matching is positional: a literal token requires equality, `*`
/// consumes exactly one token, and a trailing `>` consumes one or more
/// remaining tokens. A pattern without a trailing `>` additionally
/// requires the subject to have exactly as many tokens as the pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectPattern {
    raw: String,
    tokens: Vec<PatternToken>,
}

impl SubjectPattern {
    /// Parse and validate a pattern string.
    pub fn parse(raw: &str) -> Result<Self, SubjectError> {
        if raw.is_empty() {
            return Err(SubjectError::Empty);
        }

        let parts: Vec<&str> = raw.split('.').collect();
        if parts.len() > MAX_TOKENS {
            return Err(SubjectError::TooManyTokens(parts.len()));
        }

        let last = parts.len() - 1;
        let mut tokens = Vec::with_capacity(parts.len());
        for (i, part) in parts.iter().enumerate() {
            let token = match *part {
                "" => return Err(SubjectError::EmptyToken(i)),
                "*" => PatternToken::AnyOne,
                ">" => {
                    if i != last {
                        return Err(SubjectError::MisplacedRest);
                    }
                    PatternToken::Rest
                }
                literal => {
                    validate_token(literal)?;
                    PatternToken::Literal(literal.to_string())
                }
            };
            tokens.push(token);
        }

        Ok(Self {
            raw: raw.to_string(),
            tokens,
        })
    }

    /// Evaluate this pattern against a subject.
    pub fn matches(&self, subject: &Subject) -> bool {
        let mut pos = 0;
        for token in &self.tokens {
            match token {
                PatternToken::Literal(expected) => match subject.token(pos) {
                    Some(actual) if actual == expected => pos += 1,
                    _ => return false,
                },
                PatternToken::AnyOne => {
                    if subject.token(pos).is_none() {
                        return false;
                    }
                    pos += 1;
                }
                // Final token by construction: at least one token must remain.
                PatternToken::Rest => return subject.token_count() > pos,
            }
        }

        // No trailing '>': the subject must not have extra tokens.
        subject.token_count() == pos
    }

    /// Whether this pattern ends in `>`.
    pub fn has_rest(&self) -> bool {
        matches!(self.tokens.last(), Some(PatternToken::Rest))
    }

    /// The original pattern string.
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl std::fmt::Display for SubjectPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

impl std::str::FromStr for SubjectPattern {
    type Err = SubjectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SubjectPattern::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_subject() {
        let subject = Subject::parse("mydb.public.users.1").unwrap();
        assert_eq!(subject.token_count(), 4);
        assert_eq!(subject.token(0), Some("mydb"));
        assert_eq!(subject.token(3), Some("1"));
        assert_eq!(subject.token(4), None);
    }

    #[test]
    fn test_parse_single_token() {
        let subject = Subject::parse("events").unwrap();
        assert_eq!(subject.token_count(), 1);
    }

    #[test]
    fn test_roundtrip() {
        for raw in ["a", "a.b", "mydb.public.users.42", "x.y-z.w_1"] {
            let subject = Subject::parse(raw).unwrap();
            assert_eq!(subject.to_string(), raw);
        }
    }

    #[test]
    fn test_reject_empty_tokens() {
        assert!(matches!(
            Subject::parse("a..b"),
            Err(SubjectError::EmptyToken(1))
        ));
        assert!(matches!(
            Subject::parse(".a"),
            Err(SubjectError::EmptyToken(0))
        ));
        assert!(matches!(
            Subject::parse("a."),
            Err(SubjectError::EmptyToken(1))
        ));
        assert!(matches!(Subject::parse(""), Err(SubjectError::Empty)));
    }

    #[test]
    fn test_reject_reserved_chars() {
        assert!(matches!(
            Subject::parse("a.*.b"),
            Err(SubjectError::ReservedChar('*', _))
        ));
        assert!(matches!(
            Subject::parse("a.>"),
            Err(SubjectError::ReservedChar('>', _))
        ));
        assert!(matches!(
            Subject::parse("a. b"),
            Err(SubjectError::Whitespace(_))
        ));
    }

    #[test]
    fn test_reject_too_many_tokens() {
        let raw = vec!["t"; MAX_TOKENS].join(".");
        assert!(Subject::parse(&raw).is_ok());

        let raw = vec!["t"; MAX_TOKENS + 1].join(".");
        assert!(matches!(
            Subject::parse(&raw),
            Err(SubjectError::TooManyTokens(17))
        ));
    }

    #[test]
    fn test_literal_pattern_exact_arity() {
        let pattern = SubjectPattern::parse("a.b.c").unwrap();
        assert!(pattern.matches(&Subject::parse("a.b.c").unwrap()));
        assert!(!pattern.matches(&Subject::parse("a.b").unwrap()));
        assert!(!pattern.matches(&Subject::parse("a.b.c.d").unwrap()));
        assert!(!pattern.matches(&Subject::parse("a.b.x").unwrap()));
    }

    #[test]
    fn test_star_matches_exactly_one_token() {
        let pattern = SubjectPattern::parse("a.*.c").unwrap();
        assert!(pattern.matches(&Subject::parse("a.b.c").unwrap()));
        assert!(pattern.matches(&Subject::parse("a.x.c").unwrap()));
        assert!(!pattern.matches(&Subject::parse("a.b.c.d").unwrap()));
        assert!(!pattern.matches(&Subject::parse("a.c").unwrap()));
    }

    #[test]
    fn test_rest_matches_one_or_more() {
        let pattern = SubjectPattern::parse("a.>").unwrap();
        assert!(pattern.matches(&Subject::parse("a.b").unwrap()));
        assert!(pattern.matches(&Subject::parse("a.b.c").unwrap()));
        assert!(pattern.matches(&Subject::parse("a.b.c.d.e").unwrap()));
        // '>' requires at least one remaining token
        assert!(!pattern.matches(&Subject::parse("a").unwrap()));
        assert!(!pattern.matches(&Subject::parse("b.c").unwrap()));
    }

    #[test]
    fn test_rest_after_star() {
        let pattern = SubjectPattern::parse("*.public.>").unwrap();
        assert!(pattern.matches(&Subject::parse("mydb.public.users.1").unwrap()));
        assert!(!pattern.matches(&Subject::parse("mydb.private.users.1").unwrap()));
        assert!(!pattern.matches(&Subject::parse("mydb.public").unwrap()));
    }

    #[test]
    fn test_misplaced_rest_rejected() {
        assert!(matches!(
            SubjectPattern::parse("a.>.b"),
            Err(SubjectError::MisplacedRest)
        ));
        assert!(matches!(
            SubjectPattern::parse(">.a"),
            Err(SubjectError::MisplacedRest)
        ));
    }

    #[test]
    fn test_pattern_parse_errors() {
        assert!(SubjectPattern::parse("").is_err());
        assert!(SubjectPattern::parse("a..b").is_err());
        let raw = vec!["*"; MAX_TOKENS + 1].join(".");
        assert!(SubjectPattern::parse(&raw).is_err());
    }

    #[test]
    fn test_bare_wildcards() {
        let star = SubjectPattern::parse("*").unwrap();
        assert!(star.matches(&Subject::parse("anything").unwrap()));
        assert!(!star.matches(&Subject::parse("a.b").unwrap()));

        let rest = SubjectPattern::parse(">").unwrap();
        assert!(rest.matches(&Subject::parse("a").unwrap()));
        assert!(rest.matches(&Subject::parse("a.b.c").unwrap()));
    }

    #[test]
    fn test_serde_roundtrip() {
        let subject = Subject::parse("mydb.public.users.1").unwrap();
        let json = serde_json::to_string(&subject).unwrap();
        assert_eq!(json, "\"mydb.public.users.1\"");
        let parsed: Subject = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, subject);

        assert!(serde_json::from_str::<Subject>("\"a..b\"").is_err());
    }
}
