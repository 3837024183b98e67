//! The configuration-language lexer/parser (§4.5).
//!
//! A hand-written, single-character-lookahead, recursive-descent parser
//! reading from a pluggable [`CharSource`]. `nesting_depth` is threaded
//! through every read so a shell-backed source can print a continuation
//! prompt while inside an open `[`/`{`.
//!
//! Partial lists and values built up before a parse error are ordinary
//! owned `Vec`/`String`/`Value` data; when a sub-parse returns `Err` via
//! `?`, whatever it had already allocated is dropped in the usual way. No
//! separate destroy pass is needed.

use alloc::string::String;
use alloc::vec::Vec;

use crate::error::ParseError;
use crate::value::{Command, CommandList, Value};

/// Supplies one character at a time to the parser. `nesting_depth` is the
/// parser's current `[`/`{` depth, exposed so an interactive source can
/// switch between a primary and a continuation prompt.
pub trait CharSource {
    fn next_char(&mut self, nesting_depth: u32) -> Option<char>;
}

/// A [`CharSource`] over an in-memory string, for tests and for loading a
/// configuration file already read fully into memory.
pub struct StrSource<'a> {
    chars: core::str::Chars<'a>,
}

impl<'a> StrSource<'a> {
    #[must_use]
    pub fn new(text: &'a str) -> Self {
        Self {
            chars: text.chars(),
        }
    }
}

impl CharSource for StrSource<'_> {
    fn next_char(&mut self, _nesting_depth: u32) -> Option<char> {
        self.chars.next()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Terminator {
    /// `commandList := (command NL)* END` at the top of a file.
    TopLevel,
    /// The body of a `{ ... }` value.
    Brace,
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Parses a configuration script from `source` into a top-level
/// [`CommandList`]. This is the only entry point callers need; the
/// `Parser` type below is internal scaffolding.
pub fn parse<S: CharSource>(source: S) -> Result<CommandList, ParseError> {
    let mut parser = Parser::new(source);
    parser.parse_command_list(Terminator::TopLevel)
}

struct Parser<S> {
    source: S,
    line: u32,
    column: u32,
    /// Position of the last character returned by `bump`, used to restore
    /// `line`/`column` when that character is pushed back via `unread`.
    last_pos: (u32, u32),
    nesting_depth: u32,
    unget: Option<char>,
    /// Set while lexing inside a quoted string: `#` stops being a comment
    /// marker.
    ignore_comments: bool,
}

impl<S: CharSource> Parser<S> {
    fn new(source: S) -> Self {
        Self {
            source,
            line: 1,
            column: 0,
            last_pos: (1, 0),
            nesting_depth: 0,
            unget: None,
            ignore_comments: false,
        }
    }

    fn advance_position(&mut self, c: char) {
        match c {
            '\n' => {
                self.line += 1;
                self.column = 0;
            }
            '\t' => {
                self.column = (self.column / 8 + 1) * 8;
            }
            _ => {
                self.column += 1;
            }
        }
    }

    fn bump(&mut self) -> Option<char> {
        let c = if let Some(c) = self.unget.take() {
            c
        } else {
            self.source.next_char(self.nesting_depth)?
        };
        self.last_pos = (self.line, self.column);
        self.advance_position(c);
        Some(c)
    }

    fn unread(&mut self, c: char) {
        self.unget = Some(c);
        self.line = self.last_pos.0;
        self.column = self.last_pos.1;
    }

    fn peek(&mut self) -> Option<char> {
        let c = self.bump()?;
        self.unread(c);
        Some(c)
    }

    fn err_unexpected(&mut self) -> ParseError {
        match self.peek() {
            Some(found) => ParseError::UnexpectedChar {
                line: self.line,
                column: self.column,
                found,
            },
            None => ParseError::UnexpectedEof {
                line: self.line,
                column: self.column,
            },
        }
    }

    /// Skips spaces, tabs, and `#` line comments. Skips newlines too when
    /// `allow_newline` (true between top-level/brace commands and inside a
    /// `[ ... ]` value list, false between a command name and its first
    /// argument). Returns whether anything was actually skipped.
    fn skip_ws(&mut self, allow_newline: bool) -> bool {
        let mut skipped = false;
        loop {
            match self.peek() {
                Some(' ' | '\t') => {
                    self.bump();
                    skipped = true;
                }
                Some('\n') if allow_newline => {
                    self.bump();
                    skipped = true;
                }
                Some('#') if !self.ignore_comments => {
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.bump();
                    }
                    skipped = true;
                }
                _ => break,
            }
        }
        skipped
    }

    fn parse_ident(&mut self) -> Result<String, ParseError> {
        let mut s = String::new();
        match self.peek() {
            Some(c) if is_ident_start(c) => {
                s.push(c);
                self.bump();
            }
            _ => return Err(self.err_unexpected()),
        }
        while let Some(c) = self.peek() {
            if !is_ident_char(c) {
                break;
            }
            s.push(c);
            self.bump();
        }
        Ok(s)
    }

    fn parse_integer(&mut self) -> Result<u64, ParseError> {
        let first = self.bump().expect("caller already peeked a digit");
        if first == '0' {
            match self.peek() {
                Some('x' | 'X') => {
                    self.bump();
                    let mut value: u64 = 0;
                    let mut any = false;
                    while let Some(c) = self.peek() {
                        let Some(d) = c.to_digit(16) else { break };
                        value = value.wrapping_mul(16).wrapping_add(u64::from(d));
                        any = true;
                        self.bump();
                    }
                    if !any {
                        return Err(self.err_unexpected());
                    }
                    return Ok(value);
                }
                Some('0'..='7') => {
                    let mut value: u64 = 0;
                    while let Some(c) = self.peek() {
                        let Some(d) = c.to_digit(8) else { break };
                        value = value.wrapping_mul(8).wrapping_add(u64::from(d));
                        self.bump();
                    }
                    return Ok(value);
                }
                _ => return Ok(0),
            }
        }

        let mut value = u64::from(first.to_digit(10).expect("caller already peeked a digit"));
        while let Some(c) = self.peek() {
            let Some(d) = c.to_digit(10) else { break };
            value = value.wrapping_mul(10).wrapping_add(u64::from(d));
            self.bump();
        }
        Ok(value)
    }

    fn parse_string(&mut self) -> Result<String, ParseError> {
        self.bump(); // opening '"'
        self.ignore_comments = true;
        let mut s = String::new();
        loop {
            match self.bump() {
                None => {
                    self.ignore_comments = false;
                    return Err(ParseError::UnexpectedEof {
                        line: self.line,
                        column: self.column,
                    });
                }
                Some('"') => break,
                Some('\\') => match self.bump() {
                    Some(escaped) => s.push(escaped),
                    None => {
                        self.ignore_comments = false;
                        return Err(ParseError::InvalidEscape {
                            line: self.line,
                            column: self.column,
                        });
                    }
                },
                Some(c) => s.push(c),
            }
        }
        self.ignore_comments = false;
        Ok(s)
    }

    fn parse_value(&mut self) -> Result<Value, ParseError> {
        match self.peek() {
            Some(c) if c.is_ascii_digit() => Ok(Value::Integer(self.parse_integer()?)),
            Some('"') => Ok(Value::String(self.parse_string()?)),
            Some('$') => {
                self.bump();
                let name = self.parse_ident()?;
                Ok(Value::Reference(name))
            }
            Some('[') => {
                self.bump();
                self.nesting_depth += 1;
                let items = self.parse_value_list_bracketed()?;
                self.nesting_depth -= 1;
                match self.peek() {
                    Some(']') => {
                        self.bump();
                        Ok(Value::ValueList(items))
                    }
                    _ => Err(self.err_unexpected()),
                }
            }
            Some('{') => {
                self.bump();
                self.nesting_depth += 1;
                let cmds = self.parse_command_list(Terminator::Brace)?;
                self.nesting_depth -= 1;
                Ok(Value::CommandList(cmds))
            }
            Some(c) if c.is_ascii_alphabetic() || c == '_' => {
                // Maximal-munch the whole word, then compare: `true`/`false`
                // must match in full (a prefix like `tru` never partially
                // matches and falls through), anything else is a bareword
                // string (`set x 42` names the variable `x` unquoted).
                let word = self.parse_ident()?;
                match word.as_str() {
                    "true" => Ok(Value::Boolean(true)),
                    "false" => Ok(Value::Boolean(false)),
                    _ => Ok(Value::String(word)),
                }
            }
            _ => Err(self.err_unexpected()),
        }
    }

    /// Values inside `[ ... ]`: whitespace (including newlines, so a list
    /// may span lines) is required between consecutive values.
    fn parse_value_list_bracketed(&mut self) -> Result<Vec<Value>, ParseError> {
        let mut out = Vec::new();
        loop {
            let skipped = self.skip_ws(true);
            match self.peek() {
                Some(']') | None => break,
                _ => {
                    if !out.is_empty() && !skipped {
                        return Err(self.err_unexpected());
                    }
                    out.push(self.parse_value()?);
                }
            }
        }
        Ok(out)
    }

    /// A command's argument list: terminates at newline, EOF, or a `}`
    /// closing the enclosing block (so `{ cmd arg }` may fit on one line).
    fn parse_value_list_args(&mut self) -> Result<Vec<Value>, ParseError> {
        let mut out = Vec::new();
        loop {
            let skipped = self.skip_ws(false);
            match self.peek() {
                Some('\n') | Some('}') | None => break,
                _ => {
                    if !out.is_empty() && !skipped {
                        return Err(self.err_unexpected());
                    }
                    out.push(self.parse_value()?);
                }
            }
        }
        Ok(out)
    }

    fn parse_command(&mut self) -> Result<Command, ParseError> {
        self.skip_ws(false);
        let name = self.parse_ident()?;
        let args = self.parse_value_list_args()?;
        Ok(Command { name, args })
    }

    fn parse_command_list(&mut self, terminator: Terminator) -> Result<CommandList, ParseError> {
        let mut list = CommandList::new();
        loop {
            self.skip_ws(true);
            match self.peek() {
                None => break,
                Some('}') => {
                    if terminator == Terminator::Brace {
                        self.bump();
                        break;
                    }
                    return Err(self.err_unexpected());
                }
                _ => list.push(self.parse_command()?),
            }
        }
        Ok(list)
    }
}

/// Parses a single shell line from `source`: at most one [`Command`],
/// possibly spanning several physical lines if it opens a `{`/`[` block
/// (§4.9). Distinguishes true end of input from an ordinary blank or
/// comment-only line so the REPL knows when to stop:
///
/// - `Ok(None)`: no characters remain at all (the console closed).
/// - `Ok(Some(list))`: `list` is empty for a blank/comment-only line,
///   otherwise holds the one parsed command.
pub fn parse_line<S: CharSource>(source: S) -> Result<Option<CommandList>, ParseError> {
    let mut parser = Parser::new(source);
    parser.skip_ws(false);
    match parser.peek() {
        None => Ok(None),
        Some('\n') => {
            parser.bump();
            Ok(Some(CommandList::new()))
        }
        _ => {
            let cmd = parser.parse_command()?;
            match parser.peek() {
                Some('\n') => {
                    parser.bump();
                }
                None => {}
                _ => return Err(parser.err_unexpected()),
            }
            let mut list = CommandList::new();
            list.push(cmd);
            Ok(Some(list))
        }
    }
}

/// Renders a [`ParseError`] in the `"%s:%d:%d: Unexpected <char|EOF>"` form
/// described in §4.5, for the error-handler hook to display.
#[must_use]
pub fn format_error(path: &str, err: &ParseError) -> String {
    use alloc::format;
    match *err {
        ParseError::UnexpectedChar { line, column, found } => {
            format!("{path}:{line}:{column}: Unexpected '{found}'")
        }
        ParseError::UnexpectedEof { line, column } => {
            format!("{path}:{line}:{column}: Unexpected EOF")
        }
        ParseError::InvalidKeyword { line, column } => {
            format!("{path}:{line}:{column}: Unexpected keyword")
        }
        ParseError::InvalidEscape { line, column } => {
            format!("{path}:{line}:{column}: Unexpected EOF in escape")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    fn parse_str(s: &str) -> Result<CommandList, ParseError> {
        parse(StrSource::new(s))
    }

    #[test]
    fn parses_simple_command() {
        let cmds = parse_str("set x 42\n").unwrap();
        assert_eq!(cmds.len(), 1);
        assert_eq!(cmds[0].name, "set");
        assert_eq!(cmds[0].args, vec![Value::String("x".into()), Value::Integer(42)]);
    }

    #[test]
    fn requires_whitespace_between_values() {
        // "12" is one integer, not "1" followed by "2".
        let cmds = parse_str("set x 12\n").unwrap();
        assert_eq!(cmds[0].args[1], Value::Integer(12));
    }

    #[test]
    fn parses_hex_and_octal() {
        let cmds = parse_str("set x 0x1F\n").unwrap();
        assert_eq!(cmds[0].args[1], Value::Integer(0x1F));
        let cmds = parse_str("set x 017\n").unwrap();
        assert_eq!(cmds[0].args[1], Value::Integer(15));
        let cmds = parse_str("set x 0\n").unwrap();
        assert_eq!(cmds[0].args[1], Value::Integer(0));
    }

    #[test]
    fn parses_booleans() {
        let cmds = parse_str("set x true\n").unwrap();
        assert_eq!(cmds[0].args[1], Value::Boolean(true));
    }

    #[test]
    fn bareword_that_is_not_true_or_false_is_a_string() {
        // `tru` doesn't exactly match the `true` keyword, so it falls
        // through to being a bareword string rather than a syntax error.
        let cmds = parse_str("set x tru\n").unwrap();
        assert_eq!(cmds[0].args[1], Value::String("tru".into()));
    }

    /// S1 from §8, exactly as written: an unquoted variable name.
    #[test]
    fn scenario_s1_bareword_name_and_interpolated_string() {
        let cmds = parse_str("set x 42\nset y \"hello ${x}\"\n").unwrap();
        assert_eq!(cmds[0].args, vec![Value::String("x".into()), Value::Integer(42)]);
        assert_eq!(
            cmds[1].args,
            vec![Value::String("y".into()), Value::String("hello ${x}".into())]
        );
    }

    #[test]
    fn parses_string_with_escape() {
        let cmds = parse_str("set x \"a\\\"b\"\n").unwrap();
        assert_eq!(cmds[0].args[1], Value::String("a\"b".into()));
    }

    #[test]
    fn comment_is_ignored_outside_string() {
        let cmds = parse_str("set x 1 # trailing comment\nset y 2\n").unwrap();
        assert_eq!(cmds.len(), 2);
    }

    #[test]
    fn hash_is_literal_inside_string() {
        let cmds = parse_str("set x \"a#b\"\n").unwrap();
        assert_eq!(cmds[0].args[1], Value::String("a#b".into()));
    }

    #[test]
    fn bracketed_list_spans_lines() {
        let cmds = parse_str("set x [\n  1\n  2\n]\n").unwrap();
        assert_eq!(
            cmds[0].args[1],
            Value::ValueList(vec![Value::Integer(1), Value::Integer(2)])
        );
    }

    #[test]
    fn reference_value() {
        let cmds = parse_str("set x $y\n").unwrap();
        assert_eq!(cmds[0].args[1], Value::Reference("y".into()));
    }

    #[test]
    fn nested_command_block() {
        let cmds = parse_str("kboot {\n  set x 1\n}\n").unwrap();
        match &cmds[0].args[0] {
            Value::CommandList(inner) => {
                assert_eq!(inner.len(), 1);
                assert_eq!(inner[0].name, "set");
            }
            other => panic!("expected a command list, got {other:?}"),
        }
    }

    #[test]
    fn unterminated_string_is_an_error() {
        let err = parse_str("set x \"abc\n").unwrap_err();
        assert!(matches!(err, ParseError::UnexpectedEof { .. }));
    }

    #[test]
    fn parse_line_returns_none_at_true_eof() {
        let result = parse_line(StrSource::new("")).unwrap();
        assert_eq!(result, None);
    }

    #[test]
    fn parse_line_returns_empty_list_on_blank_line() {
        let result = parse_line(StrSource::new("\nset x 1\n")).unwrap();
        assert_eq!(result, Some(Vec::new()));
    }

    #[test]
    fn parse_line_returns_empty_list_on_comment_only_line() {
        let result = parse_line(StrSource::new("# just a comment\n")).unwrap();
        assert_eq!(result, Some(Vec::new()));
    }

    #[test]
    fn parse_line_parses_one_command() {
        let result = parse_line(StrSource::new("set x 42\n")).unwrap().unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].name, "set");
    }

    #[test]
    fn parse_line_allows_missing_trailing_newline_at_eof() {
        let result = parse_line(StrSource::new("set x 42")).unwrap().unwrap();
        assert_eq!(result.len(), 1);
    }

    #[test]
    fn parse_line_spans_nested_block_across_physical_lines() {
        let result = parse_line(StrSource::new("kboot {\n  set x 1\n}\n")).unwrap().unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].name, "kboot");
    }
}
