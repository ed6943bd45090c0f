//! Prepared statements, fingerprints and cacheability
//!
//! A [`PreparedStatement`] carries its structural identity (normalized SQL
//! text, computed once at prepare time) and the current parameter bindings.
//! Its [`Fingerprint`] is the result-cache key: two executions of the same
//! statement with unchanged bindings produce equal fingerprints, regardless
//! of which `PreparedStatement` value they came from.
//!
//! A statement that references any non-deterministic construct is not
//! cacheable. Function names are recognised here with a token scan; the
//! planner flags anything else (correlated subqueries) with
//! [`PreparedStatement::with_construct`]. Comments are dropped by the scan.
//! A statement whose quote or block comment never closes is never cacheable.

use std::fmt;
use std::sync::Arc;

use crate::value::Value;

/// Constructs whose value can change between two evaluations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NonDeterministic {
    /// CURRENT_TIMESTAMP, NOW() and friends
    CurrentTime,
    /// RAND(), RANDOM_UUID() ...
    Random,
    /// NEXT VALUE FOR / NEXTVAL()
    SequenceNextValue,
    /// A correlated subquery over a non-deterministic expression
    CorrelatedSubquery,
}

const CURRENT_TIME_FUNCTIONS: &[&str] = &[
    "CURRENT_TIMESTAMP", "CURRENT_TIME", "CURRENT_DATE", "NOW", "SYSDATE",
    "SYSTIME", "SYSTIMESTAMP", "LOCALTIME", "LOCALTIMESTAMP", "TODAY",
];
const RANDOM_FUNCTIONS: &[&str] = &["RAND", "RANDOM", "RANDOM_UUID", "SECURE_RAND", "UUID"];
const SEQUENCE_FUNCTIONS: &[&str] = &["NEXTVAL"];

/// Cache key: structural identity plus bound parameter values.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    statement: Arc<str>,
    params: Vec<Value>,
}

impl Fingerprint {
    /// Normalized statement text.
    pub fn statement(&self) -> &str {
        &self.statement
    }

    /// Bound values at fingerprint time.
    pub fn params(&self) -> &[Value] {
        &self.params
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.statement)?;
        if !self.params.is_empty() {
            write!(f, " {{")?;
            for (i, p) in self.params.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}: {}", i + 1, p)?;
            }
            write!(f, "}}")?;
        }
        Ok(())
    }
}

/// A compiled statement with its parameter bindings.
#[derive(Debug, Clone)]
pub struct PreparedStatement {
    text: Arc<str>,
    constructs: Vec<NonDeterministic>,
    params: Vec<Value>,
    /// False if a literal or block comment runs to the end of the text
    complete: bool,
}

impl PreparedStatement {
    /// Prepare `sql`: normalize it, count `?` parameters (bound to NULL),
    /// and detect non-deterministic function calls.
    pub fn prepare(sql: &str) -> Self {
        let scan = scan(sql);
        let mut constructs = Vec::new();
        for token in &scan.identifiers {
            if let Some(construct) = classify(token) {
                if !constructs.contains(&construct) {
                    constructs.push(construct);
                }
            }
        }
        if contains_sequence(&scan.identifiers)
            && !constructs.contains(&NonDeterministic::SequenceNextValue)
        {
            constructs.push(NonDeterministic::SequenceNextValue);
        }

        Self {
            text: Arc::from(scan.normalized),
            constructs,
            params: vec![Value::Null; scan.param_count],
            complete: scan.complete,
        }
    }

    /// Flag a construct the token scan cannot see.
    pub fn with_construct(mut self, construct: NonDeterministic) -> Self {
        if !self.constructs.contains(&construct) {
            self.constructs.push(construct);
        }
        self
    }

    /// Normalized statement text.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Non-deterministic constructs referenced by the statement.
    pub fn constructs(&self) -> &[NonDeterministic] {
        &self.constructs
    }

    /// False if any non-deterministic construct is referenced, or if the
    /// text could not be tokenized to the end.
    pub fn is_cacheable(&self) -> bool {
        self.complete && self.constructs.is_empty()
    }

    /// Bind parameter `index` (1-based, like `?` positions). Binding past the
    /// last `?` extends the parameter list.
    pub fn bind(&mut self, index: usize, value: impl Into<Value>) {
        let slot = index.saturating_sub(1);
        if slot >= self.params.len() {
            self.params.resize(slot + 1, Value::Null);
        }
        self.params[slot] = value.into();
    }

    /// Reset every parameter to NULL.
    pub fn clear_bindings(&mut self) {
        self.params.iter_mut().for_each(|p| *p = Value::Null);
    }

    /// Current bindings.
    pub fn params(&self) -> &[Value] {
        &self.params
    }

    /// Cache key for the current bindings.
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint {
            statement: Arc::clone(&self.text),
            params: self.params.clone(),
        }
    }
}

struct Scan {
    normalized: String,
    identifiers: Vec<String>,
    param_count: usize,
    complete: bool,
}

/// Collapse whitespace outside quotes, drop comments, uppercase identifiers
/// for classification, count `?` placeholders.
fn scan(sql: &str) -> Scan {
    let mut normalized = String::with_capacity(sql.len());
    let mut identifiers = Vec::new();
    let mut param_count = 0;
    let mut complete = true;
    let mut chars = sql.trim().chars().peekable();
    let mut pending_space = false;

    while let Some(c) = chars.next() {
        if c.is_whitespace() {
            pending_space = true;
            continue;
        }
        if c == '-' && chars.peek() == Some(&'-') {
            // Line comment
            for n in chars.by_ref() {
                if n == '\n' {
                    break;
                }
            }
            pending_space = true;
            continue;
        }
        if c == '/' && chars.peek() == Some(&'*') {
            chars.next();
            let mut closed = false;
            let mut prev = '\0';
            for n in chars.by_ref() {
                if prev == '*' && n == '/' {
                    closed = true;
                    break;
                }
                prev = n;
            }
            complete &= closed;
            pending_space = true;
            continue;
        }
        if pending_space && !normalized.is_empty() {
            normalized.push(' ');
        }
        pending_space = false;
        match c {
            '\'' | '"' => {
                // Quoted literal or identifier; '' and "" escape the quote
                normalized.push(c);
                let mut closed = false;
                while let Some(q) = chars.next() {
                    normalized.push(q);
                    if q == c {
                        if chars.peek() == Some(&c) {
                            normalized.push(c);
                            chars.next();
                        } else {
                            closed = true;
                            break;
                        }
                    }
                }
                complete &= closed;
            }
            '?' => {
                param_count += 1;
                normalized.push(c);
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut ident = String::new();
                ident.push(c);
                while let Some(&n) = chars.peek() {
                    if n.is_ascii_alphanumeric() || n == '_' {
                        ident.push(n);
                        chars.next();
                    } else {
                        break;
                    }
                }
                normalized.push_str(&ident);
                identifiers.push(ident.to_ascii_uppercase());
            }
            c => normalized.push(c),
        }
    }

    Scan {
        normalized,
        identifiers,
        param_count,
        complete,
    }
}

fn classify(identifier: &str) -> Option<NonDeterministic> {
    if CURRENT_TIME_FUNCTIONS.contains(&identifier) {
        Some(NonDeterministic::CurrentTime)
    } else if RANDOM_FUNCTIONS.contains(&identifier) {
        Some(NonDeterministic::Random)
    } else if SEQUENCE_FUNCTIONS.contains(&identifier) {
        Some(NonDeterministic::SequenceNextValue)
    } else {
        None
    }
}

/// `NEXT VALUE FOR seq`
fn contains_sequence(identifiers: &[String]) -> bool {
    identifiers.windows(3).any(|w| w[0] == "NEXT" && w[1] == "VALUE" && w[2] == "FOR")
}
