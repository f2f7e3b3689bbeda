//! Server-reported errors.
//!
//! An ErrorResponse carries a map of single-letter field codes to values.
//! Reference: https://www.postgresql.org/docs/current/protocol-error-fields.html

use std::collections::HashMap;
use std::fmt;

/// An error reported by the server (ErrorResponse).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PgError {
    fields: HashMap<u8, String>,
}

impl PgError {
    pub fn new(fields: HashMap<u8, String>) -> Self {
        Self { fields }
    }

    /// Raw field lookup by code, e.g. `b'S'` for severity or `b'n'` for
    /// the constraint name. Missing fields read as the empty string.
    pub fn field(&self, code: u8) -> &str {
        self.fields.get(&code).map(String::as_str).unwrap_or("")
    }

    pub fn fields(&self) -> &HashMap<u8, String> {
        &self.fields
    }

    /// Severity, non-localized when the server sends it (`V`), else `S`.
    pub fn severity(&self) -> &str {
        match self.fields.get(&b'V') {
            Some(v) => v,
            None => self.field(b'S'),
        }
    }

    /// SQLSTATE code.
    pub fn code(&self) -> &str {
        self.field(b'C')
    }

    /// Two-character SQLSTATE class.
    pub fn class(&self) -> &str {
        let code = self.code();
        code.get(..2).unwrap_or(code)
    }

    pub fn message(&self) -> &str {
        self.field(b'M')
    }

    pub fn detail(&self) -> Option<&str> {
        self.fields.get(&b'D').map(String::as_str)
    }

    pub fn hint(&self) -> Option<&str> {
        self.fields.get(&b'H').map(String::as_str)
    }

    pub fn constraint(&self) -> Option<&str> {
        self.fields.get(&b'n').map(String::as_str)
    }

    /// Class 23: not-null, foreign key, unique or check violation.
    pub fn integrity_violation(&self) -> bool {
        self.class() == "23"
    }

    pub fn unique_violation(&self) -> bool {
        self.code() == "23505"
    }

    pub fn serialization_failure(&self) -> bool {
        self.code() == "40001"
    }

    pub fn deadlock_detected(&self) -> bool {
        self.code() == "40P01"
    }

    /// `57014`, raised when a CancelRequest interrupts a statement.
    pub fn query_canceled(&self) -> bool {
        self.code() == "57014"
    }

    /// The prepared statement on the server no longer matches our cache.
    pub(crate) fn stale_statement(&self) -> bool {
        // 26000: invalid_sql_statement_name
        // 0A000: "cached plan must not change result type"
        self.code() == "26000" || self.code() == "0A000"
    }

    /// The session cannot continue after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self.severity(), "FATAL" | "PANIC") || self.class() == "08" || self.code() == "57P01"
    }
}

impl fmt::Display for PgError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} #{} {}", self.severity(), self.code(), self.message())?;
        if let Some(d) = self.detail() {
            write!(f, "\nDetail: {}", d)?;
        }
        if let Some(h) = self.hint() {
            write!(f, "\nHint: {}", h)?;
        }
        Ok(())
    }
}

impl std::error::Error for PgError {}
