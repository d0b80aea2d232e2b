//! # Subjects
//!
//! Dotted routing keys for events:
//!
//! ```text
//! events.aggregate.<aggregate_type>.<aggregate_id>
//! events.collaboration.<context>.<topic>
//! ```
//!
//! Patterns add two wildcards: `*` matches exactly one token and `>`
//! matches one or more trailing tokens (only as the last token).

use crate::event::EventEnvelope;
use crate::{AggregateId, EvographError};
use std::fmt;
use std::str::FromStr;

const ROOT: &str = "events";
const AGGREGATE: &str = "aggregate";
const COLLABORATION: &str = "collaboration";

/// Validate a single subject token.
pub fn validate_token(token: &str) -> Result<(), EvographError> {
    if token.is_empty() {
        return Err(EvographError::InvalidSubject("empty token".to_string()));
    }
    if token
        .chars()
        .any(|c| c.is_whitespace() || matches!(c, '.' | '*' | '>'))
    {
        return Err(EvographError::InvalidSubject(format!(
            "token '{}' contains whitespace or a reserved character",
            token
        )));
    }
    Ok(())
}

/// A concrete subject.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Subject {
    Aggregate {
        aggregate_type: String,
        aggregate_id: AggregateId,
    },
    Collaboration {
        context: String,
        topic: String,
    },
}

impl Subject {
    pub fn aggregate(
        aggregate_type: impl Into<String>,
        aggregate_id: AggregateId,
    ) -> Result<Self, EvographError> {
        let aggregate_type = aggregate_type.into();
        validate_token(&aggregate_type)?;
        Ok(Self::Aggregate {
            aggregate_type,
            aggregate_id,
        })
    }

    pub fn collaboration(
        context: impl Into<String>,
        topic: impl Into<String>,
    ) -> Result<Self, EvographError> {
        let (context, topic) = (context.into(), topic.into());
        validate_token(&context)?;
        validate_token(&topic)?;
        Ok(Self::Collaboration { context, topic })
    }

    /// The subject a stored event is published under.
    pub fn for_event(event: &EventEnvelope) -> Result<Self, EvographError> {
        Self::aggregate(event.aggregate_type.clone(), event.aggregate_id)
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Aggregate {
                aggregate_type,
                aggregate_id,
            } => write!(f, "{ROOT}.{AGGREGATE}.{aggregate_type}.{aggregate_id}"),
            Self::Collaboration { context, topic } => {
                write!(f, "{ROOT}.{COLLABORATION}.{context}.{topic}")
            }
        }
    }
}

impl FromStr for Subject {
    type Err = EvographError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tokens: Vec<&str> = s.split('.').collect();
        for token in &tokens {
            validate_token(token)?;
        }
        match tokens.as_slice() {
            [ROOT, AGGREGATE, aggregate_type, id] => {
                let aggregate_id = id
                    .parse()
                    .map_err(|_| EvographError::InvalidSubject(format!("bad aggregate id in '{}'", s)))?;
                Self::aggregate(*aggregate_type, aggregate_id)
            }
            [ROOT, COLLABORATION, context, topic] => Self::collaboration(*context, *topic),
            _ => Err(EvographError::InvalidSubject(s.to_string())),
        }
    }
}

// =============================================================================
// PATTERNS
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum PatternToken {
    Literal(String),
    One,
    Rest,
}

/// A subject pattern with `*` and `>` wildcards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectPattern {
    raw: String,
    tokens: Vec<PatternToken>,
}

impl SubjectPattern {
    pub fn parse(pattern: &str) -> Result<Self, EvographError> {
        let parts: Vec<&str> = pattern.split('.').collect();
        let last = parts.len() - 1;
        let tokens = parts
            .iter()
            .enumerate()
            .map(|(i, part)| match *part {
                "*" => Ok(PatternToken::One),
                ">" if i == last => Ok(PatternToken::Rest),
                ">" => Err(EvographError::InvalidSubject(format!(
                    "'>' must be the last token in '{}'",
                    pattern
                ))),
                literal => validate_token(literal).map(|()| PatternToken::Literal(literal.to_string())),
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            raw: pattern.to_string(),
            tokens,
        })
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Whether a dotted subject string matches.
    #[must_use]
    pub fn matches(&self, subject: &str) -> bool {
        let parts: Vec<&str> = subject.split('.').collect();
        let mut i = 0;
        for token in &self.tokens {
            match token {
                PatternToken::Rest => return parts.len() > i,
                PatternToken::One => {
                    if i >= parts.len() {
                        return false;
                    }
                }
                PatternToken::Literal(lit) => {
                    if parts.get(i) != Some(&lit.as_str()) {
                        return false;
                    }
                }
            }
            i += 1;
        }
        i == parts.len()
    }

    #[must_use]
    pub fn matches_subject(&self, subject: &Subject) -> bool {
        self.matches(&subject.to_string())
    }
}

impl fmt::Display for SubjectPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for SubjectPattern {
    type Err = EvographError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// =============================================================================
// ROUTER
// =============================================================================

/// Maps patterns to handlers.
#[derive(Debug, Clone)]
pub struct SubjectRouter<H> {
    routes: Vec<(SubjectPattern, H)>,
}

impl<H> Default for SubjectRouter<H> {
    fn default() -> Self {
        Self { routes: Vec::new() }
    }
}

impl<H> SubjectRouter<H> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, pattern: &str, handler: H) -> Result<(), EvographError> {
        let pattern = SubjectPattern::parse(pattern)?;
        tracing::debug!(pattern = %pattern, "subject route registered");
        self.routes.push((pattern, handler));
        Ok(())
    }

    /// Every handler whose pattern matches, in registration order.
    pub fn route<'a>(&'a self, subject: &'a str) -> impl Iterator<Item = &'a H> + 'a {
        self.routes
            .iter()
            .filter(move |(pattern, _)| pattern.matches(subject))
            .map(|(_, handler)| handler)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
