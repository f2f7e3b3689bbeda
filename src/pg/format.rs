//! Client-side placeholder rewriting.
//!
//! Queries are written with `?` placeholders and rewritten into the server's
//! `$n` form before being sent with the extended protocol:
//!
//! - `?` takes the next positional argument
//! - `?N` takes positional argument `N` (zero-based)
//! - `?name` takes a named argument
//! - `\?` is a literal question mark
//!
//! String literals, quoted identifiers, dollar-quoted bodies and comments are
//! copied through untouched.
//!
//! Arguments are always sent as server-side parameters, never spliced into
//! the text. Utility statements such as `NOTIFY`, `LISTEN` and `SET` accept
//! no parameters, so `NOTIFY chan, ?` fails with a syntax error. Use
//! `SELECT pg_notify(?, ?)` (or [`Db::notify`](crate::Db::notify)) and
//! `SELECT set_config(?, ?, false)` instead.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;

use super::connection::{PgConnection, QueryResult};
use super::types::PgValue;
use crate::error::{Error, Result};

/// Source of values for `?name` placeholders.
///
/// Query futures hold the arguments across awaits, so sources must be
/// `Send + Sync` for those futures to be spawnable.
pub trait NamedArgs: Send + Sync {
    fn named_arg(&self, name: &str) -> Option<PgValue>;
}

impl<V: Into<PgValue> + Clone + Send + Sync> NamedArgs for HashMap<String, V> {
    fn named_arg(&self, name: &str) -> Option<PgValue> {
        self.get(name).cloned().map(Into::into)
    }
}

impl<V: Into<PgValue> + Clone + Send + Sync> NamedArgs for BTreeMap<String, V> {
    fn named_arg(&self, name: &str) -> Option<PgValue> {
        self.get(name).cloned().map(Into::into)
    }
}

impl NamedArgs for serde_json::Map<String, serde_json::Value> {
    fn named_arg(&self, name: &str) -> Option<PgValue> {
        self.get(name).map(json_to_value)
    }
}

fn json_to_value(v: &serde_json::Value) -> PgValue {
    use serde_json::Value;
    match v {
        Value::Null => PgValue::Null,
        Value::Bool(b) => PgValue::Bool(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => PgValue::Int8(i),
            None => n
                .as_f64()
                .map(PgValue::Float8)
                .unwrap_or_else(|| PgValue::Numeric(n.to_string())),
        },
        Value::String(s) => PgValue::Text(s.clone()),
        Value::Array(_) | Value::Object(_) => PgValue::Json(v.to_string()),
    }
}

/// Wraps a [`NamedArgs`] source so it can be passed where arguments are expected.
pub struct Named<M>(pub M);

impl Named<serde_json::Map<String, serde_json::Value>> {
    /// Use the fields of any serializable struct as named arguments.
    pub fn from_serialize<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        match serde_json::to_value(value) {
            Ok(serde_json::Value::Object(map)) => Ok(Named(map)),
            Ok(other) => Err(Error::Argument(format!(
                "named arguments must serialize to an object, got {}",
                other
            ))),
            Err(e) => Err(Error::Argument(e.to_string())),
        }
    }
}

/// Query arguments as seen by the formatter.
pub enum Args<'a> {
    None,
    Positional(&'a [PgValue]),
    Named(&'a dyn NamedArgs),
}

impl Args<'_> {
    pub fn is_empty(&self) -> bool {
        match self {
            Args::None => true,
            Args::Positional(p) => p.is_empty(),
            Args::Named(_) => false,
        }
    }
}

/// Anything that can be passed as query arguments: `&()`, slices, arrays and
/// vectors of [`PgValue`], or [`Named`].
pub trait ToArgs {
    fn to_args(&self) -> Args<'_>;
}

impl ToArgs for () {
    fn to_args(&self) -> Args<'_> {
        Args::None
    }
}

impl ToArgs for [PgValue] {
    fn to_args(&self) -> Args<'_> {
        Args::Positional(self)
    }
}

impl<const N: usize> ToArgs for [PgValue; N] {
    fn to_args(&self) -> Args<'_> {
        Args::Positional(self)
    }
}

impl ToArgs for Vec<PgValue> {
    fn to_args(&self) -> Args<'_> {
        Args::Positional(self)
    }
}

impl<M: NamedArgs> ToArgs for Named<M> {
    fn to_args(&self) -> Args<'_> {
        Args::Named(&self.0)
    }
}

/// A query rewritten into `$n` form with its argument vector.
#[derive(Debug, Clone, PartialEq)]
pub struct FormattedQuery {
    pub sql: String,
    pub params: Vec<PgValue>,
}

/// Rewrite `sql` against `args`.
///
/// Without arguments the query is returned verbatim; it will go over the
/// simple-query protocol where `?` has no meaning.
pub fn format_query(sql: &str, args: &Args<'_>) -> Result<FormattedQuery> {
    if args.is_empty() {
        return Ok(FormattedQuery {
            sql: sql.to_string(),
            params: Vec::new(),
        });
    }

    let mut f = Formatter {
        args,
        out: String::with_capacity(sql.len() + 8),
        params: Vec::new(),
        next_positional: 0,
        positional_slots: HashMap::new(),
        named_slots: HashMap::new(),
    };
    f.run(sql)?;

    if let Args::Positional(values) = args {
        if let Some(unused) = (0..values.len()).find(|i| !f.positional_slots.contains_key(i)) {
            return Err(Error::Argument(format!(
                "{} argument(s) given but argument {} is never referenced",
                values.len(),
                unused
            )));
        }
    }

    Ok(FormattedQuery {
        sql: f.out,
        params: f.params,
    })
}

struct Formatter<'q, 'a> {
    args: &'q Args<'a>,
    out: String,
    params: Vec<PgValue>,
    next_positional: usize,
    /// Argument index -> `$n`
    positional_slots: HashMap<usize, usize>,
    named_slots: HashMap<String, usize>,
}

impl Formatter<'_, '_> {
    fn run(&mut self, sql: &str) -> Result<()> {
        let bytes = sql.as_bytes();
        let mut i = 0;
        let mut copied = 0;

        while i < bytes.len() {
            let skip_to = match bytes[i] {
                b'\'' => {
                    let escapes = i > 0 && matches!(bytes[i - 1], b'E' | b'e');
                    Some(skip_quoted(bytes, i, b'\'', escapes))
                }
                b'"' => Some(skip_quoted(bytes, i, b'"', false)),
                b'-' if bytes.get(i + 1) == Some(&b'-') => Some(
                    bytes[i..]
                        .iter()
                        .position(|&b| b == b'\n')
                        .map_or(bytes.len(), |p| i + p + 1),
                ),
                b'/' if bytes.get(i + 1) == Some(&b'*') => Some(skip_block_comment(bytes, i)),
                b'$' => dollar_tag(bytes, i).map(|tag| skip_dollar_quoted(bytes, i, tag)),
                b'\\' if bytes.get(i + 1) == Some(&b'?') => {
                    self.out.push_str(&sql[copied..i]);
                    self.out.push('?');
                    i += 2;
                    copied = i;
                    continue;
                }
                b'?' => {
                    self.out.push_str(&sql[copied..i]);
                    i = self.placeholder(sql, i + 1)?;
                    copied = i;
                    continue;
                }
                _ => None,
            };

            i = match skip_to {
                Some(end) => end,
                None => i + 1,
            };
        }

        self.out.push_str(&sql[copied..]);
        Ok(())
    }

    /// Handle the placeholder whose body starts at `start`; returns the
    /// offset just past it.
    fn placeholder(&mut self, sql: &str, start: usize) -> Result<usize> {
        let bytes = sql.as_bytes();
        let end = start
            + bytes[start..]
                .iter()
                .take_while(|b| b.is_ascii_alphanumeric() || **b == b'_')
                .count();
        let token = &sql[start..end];

        let slot = if token.is_empty() {
            let idx = self.next_positional;
            self.next_positional += 1;
            self.positional(idx)?
        } else if token.bytes().all(|b| b.is_ascii_digit()) {
            let idx: usize = token
                .parse()
                .map_err(|_| Error::Argument(format!("invalid placeholder ?{}", token)))?;
            self.positional(idx)?
        } else if token.as_bytes()[0].is_ascii_digit() {
            // "?1abc" is neither an index nor a name
            return Err(Error::Argument(format!("invalid placeholder ?{}", token)));
        } else {
            self.named(token)?
        };

        self.out.push('$');
        self.out.push_str(&slot.to_string());
        Ok(end)
    }

    fn positional(&mut self, idx: usize) -> Result<usize> {
        let values = match self.args {
            Args::Positional(values) => *values,
            _ => {
                return Err(Error::Argument(
                    "positional placeholder used with named arguments".to_string(),
                ))
            }
        };
        if let Some(slot) = self.positional_slots.get(&idx) {
            return Ok(*slot);
        }
        let value = values.get(idx).ok_or_else(|| {
            Error::Argument(format!(
                "placeholder refers to argument {} but only {} given",
                idx,
                values.len()
            ))
        })?;
        self.params.push(value.clone());
        let slot = self.params.len();
        self.positional_slots.insert(idx, slot);
        Ok(slot)
    }

    fn named(&mut self, name: &str) -> Result<usize> {
        let source = match self.args {
            Args::Named(source) => *source,
            _ => {
                return Err(Error::Argument(format!(
                    "named placeholder ?{} used without named arguments",
                    name
                )))
            }
        };
        if let Some(slot) = self.named_slots.get(name) {
            return Ok(*slot);
        }
        let value = source
            .named_arg(name)
            .ok_or_else(|| Error::Argument(format!("no value for ?{}", name)))?;
        self.params.push(value);
        let slot = self.params.len();
        self.named_slots.insert(name.to_string(), slot);
        Ok(slot)
    }
}

/// End offset of a quoted run opened at `start`. A doubled quote stays inside;
/// with `escapes` a backslash also escapes the next byte.
fn skip_quoted(bytes: &[u8], start: usize, quote: u8, escapes: bool) -> usize {
    let mut i = start + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' if escapes => i += 2,
            b if b == quote => {
                if bytes.get(i + 1) == Some(&quote) {
                    i += 2;
                } else {
                    return i + 1;
                }
            }
            _ => i += 1,
        }
    }
    bytes.len()
}

fn skip_block_comment(bytes: &[u8], start: usize) -> usize {
    let mut depth = 0usize;
    let mut i = start;
    while i + 1 < bytes.len() {
        match (bytes[i], bytes[i + 1]) {
            (b'/', b'*') => {
                depth += 1;
                i += 2;
            }
            (b'*', b'/') => {
                depth -= 1;
                i += 2;
                if depth == 0 {
                    return i;
                }
            }
            _ => i += 1,
        }
    }
    bytes.len()
}

/// If a dollar-quote opener (`$$` or `$tag$`) starts at `start`, return the
/// whole opener. `$1` is a parameter, not a quote.
fn dollar_tag(bytes: &[u8], start: usize) -> Option<&[u8]> {
    let mut i = start + 1;
    if bytes.get(i).is_some_and(|b| b.is_ascii_digit()) {
        return None;
    }
    while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
        i += 1;
    }
    (bytes.get(i) == Some(&b'$')).then(|| &bytes[start..=i])
}

fn skip_dollar_quoted(bytes: &[u8], start: usize, tag: &[u8]) -> usize {
    let body = start + tag.len();
    bytes[body..]
        .windows(tag.len())
        .position(|w| w == tag)
        .map_or(bytes.len(), |p| body + p + tag.len())
}

// ============================================================================
// Connection helpers
// ============================================================================

impl PgConnection {
    /// Run a query written with `?` placeholders and collect its rows.
    pub async fn query_with(&mut self, sql: &str, args: &Args<'_>) -> Result<QueryResult> {
        let q = format_query(sql, args)?;
        self.query(&q.sql, &q.params).await
    }

    /// Run a statement written with `?` placeholders; returns rows affected.
    pub async fn execute_with(&mut self, sql: &str, args: &Args<'_>) -> Result<i64> {
        let q = format_query(sql, args)?;
        self.execute(&q.sql, &q.params).await
    }
}
