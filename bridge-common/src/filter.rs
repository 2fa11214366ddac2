use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::message::Message;

/// Errors that prevent a filter from being evaluated at all. Unlike a message that fails to decode,
/// these abort the whole batch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FilterError {
    #[error("invalid filter expression `{expression}`: {reason}")]
    InvalidExpression { expression: String, reason: String },
    #[error("{0} is not a valid filter data source")]
    InvalidDataSource(String),
    #[error("a filter expression is required when filtering on {0}")]
    MissingExpression(FilterDataSource),
    #[error("filter could not be evaluated: {0}")]
    Evaluation(String),
}

/// The partition of a batch into messages to deliver and messages to skip.
/// Both sequences keep the relative order the messages had in the batch.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FilteredMessages {
    valid: Vec<Message>,
    invalid: Vec<Message>,
}

impl FilteredMessages {
    pub fn add_to_valid(&mut self, message: Message) {
        self.valid.push(message);
    }

    pub fn add_to_invalid(&mut self, message: Message) {
        self.invalid.push(message);
    }

    pub fn valid(&self) -> &[Message] {
        &self.valid
    }

    pub fn invalid(&self) -> &[Message] {
        &self.invalid
    }

    pub fn len(&self) -> usize {
        self.valid.len() + self.invalid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_parts(self) -> (Vec<Message>, Vec<Message>) {
        (self.valid, self.invalid)
    }
}

pub trait Filter: Send + Sync {
    /// Classify every message of the batch as valid or invalid.
    fn apply(&self, messages: Vec<Message>) -> Result<FilteredMessages, FilterError>;
}

/// Lets every message through.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpFilter;

impl Filter for NoOpFilter {
    fn apply(&self, messages: Vec<Message>) -> Result<FilteredMessages, FilterError> {
        Ok(FilteredMessages {
            valid: messages,
            invalid: Vec::new(),
        })
    }
}

/// Which part of a message the filter decodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterDataSource {
    None,
    Key,
    Value,
}

impl FromStr for FilterDataSource {
    type Err = FilterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Ok(FilterDataSource::None),
            "key" => Ok(FilterDataSource::Key),
            "value" | "message" => Ok(FilterDataSource::Value),
            invalid => Err(FilterError::InvalidDataSource(invalid.to_owned())),
        }
    }
}

impl fmt::Display for FilterDataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FilterDataSource::None => "none",
            FilterDataSource::Key => "key",
            FilterDataSource::Value => "value",
        };
        f.write_str(name)
    }
}

/// Build the filter for a data source. `FilterDataSource::None` ignores the expression.
pub fn build_filter(
    data_source: FilterDataSource,
    expression: Option<&str>,
) -> Result<Box<dyn Filter>, FilterError> {
    match (data_source, expression) {
        (FilterDataSource::None, _) => Ok(Box::new(NoOpFilter)),
        (source, Some(expression)) => Ok(Box::new(JsonFilter::new(source, expression)?)),
        (source, None) => Err(FilterError::MissingExpression(source)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operator {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl Operator {
    fn parse(token: &str) -> Option<Self> {
        match token {
            "==" => Some(Operator::Eq),
            "!=" => Some(Operator::Ne),
            ">" => Some(Operator::Gt),
            ">=" => Some(Operator::Ge),
            "<" => Some(Operator::Lt),
            "<=" => Some(Operator::Le),
            _ => None,
        }
    }

    fn is_ordering(self) -> bool {
        !matches!(self, Operator::Eq | Operator::Ne)
    }

    fn accepts(self, ordering: Ordering) -> bool {
        match self {
            Operator::Eq => ordering == Ordering::Equal,
            Operator::Ne => ordering != Ordering::Equal,
            Operator::Gt => ordering == Ordering::Greater,
            Operator::Ge => ordering != Ordering::Less,
            Operator::Lt => ordering == Ordering::Less,
            Operator::Le => ordering != Ordering::Greater,
        }
    }
}

/// A comparison of the JSON field at `pointer` against a scalar literal, e.g.
/// `/order/status == "COMPLETED"` or `/amount >= 100`.
#[derive(Debug, Clone, PartialEq)]
struct Expression {
    pointer: String,
    operator: Operator,
    literal: Value,
}

impl FromStr for Expression {
    type Err = FilterError;

    fn from_str(expression: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| FilterError::InvalidExpression {
            expression: expression.to_owned(),
            reason: reason.to_owned(),
        };

        let (pointer, rest) = expression
            .trim()
            .split_once(char::is_whitespace)
            .ok_or_else(|| invalid("expected `<field> <operator> <literal>`"))?;
        let (operator, literal) = rest
            .trim_start()
            .split_once(char::is_whitespace)
            .ok_or_else(|| invalid("expected `<field> <operator> <literal>`"))?;
        let literal = literal.trim();

        if !pointer.starts_with('/') {
            return Err(invalid("field must be a JSON pointer starting with '/'"));
        }
        let operator = Operator::parse(operator)
            .ok_or_else(|| invalid("operator must be one of ==, !=, >, >=, <, <="))?;
        let literal: Value =
            serde_json::from_str(literal).map_err(|_| invalid("literal must be a JSON scalar"))?;

        match &literal {
            Value::Array(_) | Value::Object(_) => {
                return Err(invalid("literal must be a JSON scalar"));
            }
            Value::Bool(_) | Value::Null if operator.is_ordering() => {
                return Err(invalid("ordering operators need a number or string literal"));
            }
            _ => {}
        }

        Ok(Expression {
            pointer: pointer.to_owned(),
            operator,
            literal,
        })
    }
}

impl Expression {
    fn matches(&self, field: &Value) -> bool {
        match compare(field, &self.literal) {
            Some(ordering) => self.operator.accepts(ordering),
            // Values of different kinds are only ever "not equal".
            None => self.operator == Operator::Ne,
        }
    }
}

fn compare(field: &Value, literal: &Value) -> Option<Ordering> {
    match (field, literal) {
        (Value::Number(left), Value::Number(right)) => left.as_f64()?.partial_cmp(&right.as_f64()?),
        (Value::String(left), Value::String(right)) => Some(left.cmp(right)),
        (Value::Bool(left), Value::Bool(right)) => Some(left.cmp(right)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

/// Decodes the key or value of each message as JSON and keeps the messages whose field satisfies
/// the configured expression. Messages that cannot be decoded are invalid, not errors.
#[derive(Debug, Clone)]
pub struct JsonFilter {
    data_source: FilterDataSource,
    expression: Expression,
}

impl JsonFilter {
    pub fn new(data_source: FilterDataSource, expression: &str) -> Result<Self, FilterError> {
        if data_source == FilterDataSource::None {
            return Err(FilterError::InvalidDataSource(data_source.to_string()));
        }

        Ok(Self {
            data_source,
            expression: expression.parse()?,
        })
    }

    fn is_valid(&self, message: &Message) -> bool {
        let payload = match self.data_source {
            FilterDataSource::Key => message.key(),
            _ => message.value(),
        };

        let decoded: Value = match serde_json::from_slice(payload) {
            Ok(decoded) => decoded,
            Err(e) => {
                debug!(message = %message, "could not decode message for filtering: {e}");
                return false;
            }
        };

        decoded
            .pointer(&self.expression.pointer)
            .map(|field| self.expression.matches(field))
            .unwrap_or(false)
    }
}

impl Filter for JsonFilter {
    fn apply(&self, messages: Vec<Message>) -> Result<FilteredMessages, FilterError> {
        let mut filtered = FilteredMessages::default();
        for message in messages {
            if self.is_valid(&message) {
                filtered.add_to_valid(message);
            } else {
                filtered.add_to_invalid(message);
            }
        }
        Ok(filtered)
    }
}
