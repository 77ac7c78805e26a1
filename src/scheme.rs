//! Reader: source text to pair-list data.
//!
//! Produces the same [`Value`] representation the evaluator consumes:
//! compound forms are chains of pairs ending in [`Value::Empty`], `'x` is
//! read as `(quote x)`, and `(a . b)` reads as a single pair.

use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::{tag, take_till, take_while},
    character::complete::{char, digit0, multispace0, multispace1, one_of, satisfy},
    combinator::{opt, recognize, value},
    error::ErrorKind,
    multi::many0_count,
    sequence::{pair, preceded},
};

use crate::ast::{NumberType, Value};
use crate::{Error, MAX_PARSE_DEPTH, ParseError, ParseErrorKind};

/// Reader settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseConfig {
    /// Treat `;` as the start of a comment running to the end of the line
    pub handle_comments: bool,
}

impl Default for ParseConfig {
    fn default() -> Self {
        ParseConfig {
            handle_comments: true,
        }
    }
}

/// What went wrong, independent of where
#[derive(Debug, Clone, PartialEq)]
enum Problem {
    Nom(ErrorKind),
    InvalidNumber,
    IntegerOutOfRange,
    InvalidSymbol,
    InvalidBoolean,
    InvalidToken,
    InvalidEscape,
    UnterminatedString,
    MissingDelimiter,
    UnexpectedEof,
    NotEnoughClose,
    TooManyClose,
    MismatchedClose { expected: char },
    MisplacedDot,
    BadDottedTail,
    TrailingContent,
    TooDeep,
}

#[derive(Debug, Clone, PartialEq)]
struct ReadError<'a> {
    input: &'a str,
    problem: Problem,
}

impl<'a> nom::error::ParseError<&'a str> for ReadError<'a> {
    fn from_error_kind(input: &'a str, kind: ErrorKind) -> Self {
        ReadError {
            input,
            problem: Problem::Nom(kind),
        }
    }

    fn append(_input: &'a str, _kind: ErrorKind, other: Self) -> Self {
        other
    }
}

type ReadResult<'a, T> = IResult<&'a str, T, ReadError<'a>>;

/// Abort the whole read; `alt` does not try further branches after this
fn fail<T>(input: &str, problem: Problem) -> ReadResult<'_, T> {
    Err(nom::Err::Failure(ReadError { input, problem }))
}

fn is_delimiter(c: char) -> bool {
    c.is_whitespace() || matches!(c, '(' | ')' | '[' | ']' | ';' | '"' | '\'')
}

fn at_delimiter(input: &str) -> bool {
    input.chars().next().is_none_or(is_delimiter)
}

fn is_initial(c: char) -> bool {
    c.is_ascii_alphabetic() || "!$%&*/:<=>?~_^".contains(c)
}

fn is_subsequent(c: char) -> bool {
    is_initial(c) || c.is_ascii_digit() || matches!(c, '.' | '+' | '-')
}

/// A lone `.` separating the tail of a dotted list
fn is_dot(input: &str) -> bool {
    input.strip_prefix('.').is_some_and(at_delimiter)
}

fn starts_number(input: &str) -> bool {
    let mut chars = input.chars();
    match chars.next() {
        Some(c) if c.is_ascii_digit() => true,
        Some('+' | '-') => !at_delimiter(chars.as_str()),
        Some('.') => !at_delimiter(chars.as_str()) && !input.starts_with("..."),
        _ => false,
    }
}

fn line_comment(input: &str) -> ReadResult<'_, &str> {
    recognize(pair(char(';'), take_till(|c: char| c == '\n'))).parse(input)
}

/// Skip whitespace and, when enabled, comments
fn atmosphere<'a>(input: &'a str, config: &ParseConfig) -> ReadResult<'a, ()> {
    if config.handle_comments {
        value((), many0_count(alt((multispace1, line_comment)))).parse(input)
    } else {
        value((), multispace0).parse(input)
    }
}

/// Parse an integer (`42`, `-7`, `+3`) or a double (`1.5`, `-.5`, `2.`)
fn parse_number(input: &str) -> ReadResult<'_, Value> {
    let parsed: ReadResult<'_, &str> = recognize((
        opt(one_of("+-")),
        digit0,
        opt(pair(char('.'), digit0)),
    ))
    .parse(input);
    let (rest, text) = parsed?;

    if !at_delimiter(rest) || !text.bytes().any(|b| b.is_ascii_digit()) {
        return fail(input, Problem::InvalidNumber);
    }

    if text.contains('.') {
        match text.parse::<f64>() {
            Ok(d) => Ok((rest, Value::Double(d))),
            Err(_) => fail(input, Problem::InvalidNumber),
        }
    } else {
        match text.parse::<NumberType>() {
            Ok(n) => Ok((rest, Value::Integer(n))),
            Err(_) => fail(input, Problem::IntegerOutOfRange),
        }
    }
}

/// Parse a boolean (#t or #f)
fn parse_bool(input: &str) -> ReadResult<'_, Value> {
    let parsed: ReadResult<'_, bool> = preceded(
        char('#'),
        alt((value(true, char('t')), value(false, char('f')))),
    )
    .parse(input);

    match parsed {
        Ok((rest, b)) if at_delimiter(rest) => Ok((rest, Value::Bool(b))),
        _ => fail(input, Problem::InvalidBoolean),
    }
}

/// Parse a symbol (identifier)
fn parse_symbol(input: &str) -> ReadResult<'_, Value> {
    let parsed: ReadResult<'_, &str> = alt((
        recognize(pair(satisfy(is_initial), take_while(is_subsequent))),
        tag("..."),
        tag("+"),
        tag("-"),
    ))
    .parse(input);
    let (rest, name) = parsed?;

    if !at_delimiter(rest) {
        return fail(input, Problem::InvalidSymbol);
    }
    Ok((rest, Value::Symbol(name.to_owned())))
}

/// Parse a string literal
fn parse_string(input: &str) -> ReadResult<'_, Value> {
    let parsed: ReadResult<'_, char> = char('"').parse(input);
    let (mut remaining, _) = parsed?;
    let mut chars = String::new();

    loop {
        let mut char_iter = remaining.chars();
        match char_iter.next() {
            Some('"') => {
                let rest = char_iter.as_str();
                if !at_delimiter(rest) {
                    return fail(rest, Problem::MissingDelimiter);
                }
                return Ok((rest, Value::String(chars)));
            }
            Some('\\') => {
                match char_iter.next() {
                    Some('n') => chars.push('\n'),
                    Some('t') => chars.push('\t'),
                    Some('r') => chars.push('\r'),
                    Some('\\') => chars.push('\\'),
                    Some('"') => chars.push('"'),
                    Some(_) => return fail(remaining, Problem::InvalidEscape),
                    None => return fail(remaining, Problem::UnterminatedString),
                }
                remaining = char_iter.as_str();
            }
            Some(ch) => {
                chars.push(ch);
                remaining = char_iter.as_str();
            }
            None => return fail(remaining, Problem::UnterminatedString),
        }
    }
}

/// Parse the elements of a list after its opening bracket
fn parse_list<'a>(
    input: &'a str,
    open: char,
    config: &ParseConfig,
    depth: usize,
) -> ReadResult<'a, Value> {
    let close = if open == '[' { ']' } else { ')' };
    let mut items = Vec::new();
    let mut input = input;

    loop {
        let (rest, ()) = atmosphere(input, config)?;
        input = rest;
        match input.chars().next() {
            None => return fail(input, Problem::NotEnoughClose),
            Some(c) if c == close => return Ok((&input[1..], Value::list(items))),
            Some(')' | ']') => {
                return fail(input, Problem::MismatchedClose { expected: close });
            }
            Some('.') if is_dot(input) => {
                if items.is_empty() {
                    return fail(input, Problem::MisplacedDot);
                }
                let (rest, tail) = parse_datum(&input[1..], config, depth + 1)?;
                let (rest, ()) = atmosphere(rest, config)?;
                return match rest.chars().next() {
                    Some(c) if c == close => Ok((&rest[1..], Value::list_with_tail(items, tail))),
                    None => fail(rest, Problem::NotEnoughClose),
                    Some(_) => fail(rest, Problem::BadDottedTail),
                };
            }
            Some(_) => {
                let (rest, item) = parse_datum(input, config, depth + 1)?;
                items.push(item);
                input = rest;
            }
        }
    }
}

/// Parse one datum, skipping leading whitespace and comments
fn parse_datum<'a>(input: &'a str, config: &ParseConfig, depth: usize) -> ReadResult<'a, Value> {
    if depth >= MAX_PARSE_DEPTH {
        return fail(input, Problem::TooDeep);
    }
    let (input, ()) = atmosphere(input, config)?;

    match input.chars().next() {
        None => fail(input, Problem::UnexpectedEof),
        Some(open @ ('(' | '[')) => parse_list(&input[1..], open, config, depth),
        Some(')' | ']') => fail(input, Problem::TooManyClose),
        Some('\'') => {
            // 'expr -> (quote expr)
            let (rest, datum) = parse_datum(&input[1..], config, depth + 1)?;
            Ok((rest, Value::list([Value::Symbol("quote".into()), datum])))
        }
        Some('"') => parse_string(input),
        Some('#') => parse_bool(input),
        Some('.') if is_dot(input) => fail(input, Problem::MisplacedDot),
        Some(_) if starts_number(input) => parse_number(input),
        Some(_) => match parse_symbol(input) {
            Err(nom::Err::Error(_)) => fail(input, Problem::InvalidToken),
            other => other,
        },
    }
}

/// The token starting at `input`, for error reports
fn token_at(input: &str) -> Option<String> {
    let token: String = input.chars().take_while(|&c| !is_delimiter(c)).collect();
    if token.is_empty() {
        input.chars().next().map(String::from)
    } else {
        Some(token)
    }
}

/// Convert reader failures to user-facing parse errors
fn to_parse_error(source: &str, error: nom::Err<ReadError<'_>>) -> Error {
    let (rest, problem) = match error {
        nom::Err::Error(e) | nom::Err::Failure(e) => (e.input, e.problem),
        nom::Err::Incomplete(_) => ("", Problem::UnexpectedEof),
    };

    let (kind, message) = match &problem {
        Problem::Nom(code) => (
            ParseErrorKind::InvalidSyntax,
            format!("invalid syntax ({code:?})"),
        ),
        Problem::InvalidNumber => (ParseErrorKind::InvalidSyntax, "invalid number".into()),
        Problem::IntegerOutOfRange => (
            ParseErrorKind::ImplementationLimit,
            "integer literal out of range".into(),
        ),
        Problem::InvalidSymbol => (ParseErrorKind::InvalidSyntax, "invalid symbol".into()),
        Problem::InvalidBoolean => (
            ParseErrorKind::InvalidSyntax,
            "invalid boolean syntax".into(),
        ),
        Problem::InvalidToken => (ParseErrorKind::InvalidSyntax, "invalid token".into()),
        Problem::InvalidEscape => (
            ParseErrorKind::InvalidSyntax,
            "invalid escape sequence in string".into(),
        ),
        Problem::UnterminatedString => (
            ParseErrorKind::Incomplete,
            "unexpected end of input while reading string".into(),
        ),
        Problem::MissingDelimiter => (
            ParseErrorKind::InvalidSyntax,
            "no delimiter after string".into(),
        ),
        Problem::UnexpectedEof => (
            ParseErrorKind::Incomplete,
            "unexpected end of input".into(),
        ),
        Problem::NotEnoughClose => (
            ParseErrorKind::Incomplete,
            "not enough close parentheses".into(),
        ),
        Problem::TooManyClose => (
            ParseErrorKind::InvalidSyntax,
            "too many close parentheses".into(),
        ),
        Problem::MismatchedClose { expected } => (
            ParseErrorKind::InvalidSyntax,
            format!("mismatched close bracket, expected '{expected}'"),
        ),
        Problem::MisplacedDot => (ParseErrorKind::InvalidSyntax, "unexpected '.'".into()),
        Problem::BadDottedTail => (
            ParseErrorKind::InvalidSyntax,
            "expected exactly one datum after '.'".into(),
        ),
        Problem::TrailingContent => (
            ParseErrorKind::TrailingContent,
            "unexpected content after expression".into(),
        ),
        Problem::TooDeep => (
            ParseErrorKind::TooDeeplyNested,
            format!("expression too deeply nested (max depth: {MAX_PARSE_DEPTH})"),
        ),
    };

    let found = match problem {
        Problem::UnexpectedEof | Problem::NotEnoughClose | Problem::UnterminatedString => None,
        _ => token_at(rest),
    };
    let consumed = source.len().saturating_sub(rest.len());
    let offset = source
        .get(..consumed)
        .map_or(0, |prefix| prefix.chars().count());

    Error::ParseError(ParseError::with_context_and_found(
        kind, message, source, offset, found,
    ))
}

/// Parse exactly one datum from input.
pub fn parse_scheme(input: &str) -> Result<Value, Error> {
    parse_scheme_with_config(input, &ParseConfig::default())
}

/// Parse exactly one datum from input with explicit reader settings.
pub fn parse_scheme_with_config(input: &str, config: &ParseConfig) -> Result<Value, Error> {
    let (rest, datum) = parse_datum(input, config, 0).map_err(|e| to_parse_error(input, e))?;
    let (rest, ()) = atmosphere(rest, config).map_err(|e| to_parse_error(input, e))?;

    if rest.is_empty() {
        return Ok(datum);
    }
    let problem = if rest.starts_with([')', ']']) {
        Problem::TooManyClose
    } else {
        Problem::TrailingContent
    };
    Err(to_parse_error(
        input,
        nom::Err::Failure(ReadError {
            input: rest,
            problem,
        }),
    ))
}

/// Parse a whole program: zero or more top-level data.
pub fn parse_program(input: &str) -> Result<Vec<Value>, Error> {
    parse_program_with_config(input, &ParseConfig::default())
}

/// Parse a whole program with explicit reader settings.
pub fn parse_program_with_config(input: &str, config: &ParseConfig) -> Result<Vec<Value>, Error> {
    let mut forms = Vec::new();
    let mut rest = input;

    loop {
        let (after, ()) = atmosphere(rest, config).map_err(|e| to_parse_error(input, e))?;
        if after.is_empty() {
            return Ok(forms);
        }
        let (after, form) = parse_datum(after, config, 0).map_err(|e| to_parse_error(input, e))?;
        forms.push(form);
        rest = after;
    }
}
