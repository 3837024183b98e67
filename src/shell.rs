//! The interactive REPL (§4.9), built on the same parser and executor the
//! configuration-file path uses.
//!
//! A [`Console`] is the only external dependency: reading keys and writing
//! prompt/output text is left to the firmware-specific front end (stdio for
//! `kboot-repl`, a VGA/UEFI text console for a real boot). The REPL itself
//! only knows how to turn a stream of `char`s into parsed command lists and
//! feed them to an [`Environment`].

use alloc::string::String;

use crate::environ::Environment;
use crate::error::ExecError;
use crate::parser::{self, CharSource};

/// Where the shell reads keys from and writes prompts/output to.
pub trait Console {
    fn read_char(&mut self) -> Option<char>;
    fn write_str(&mut self, s: &str);
}

const PROMPT_PRIMARY: &str = "kboot> ";
const PROMPT_CONTINUATION: &str = "...> ";

/// Feeds a [`Console`] to the parser as a [`CharSource`], printing a primary
/// or continuation prompt each time the parser is about to ask for the
/// first character of a new line (§4.9 "displays a primary prompt at
/// nesting depth 0 and a continuation prompt otherwise").
struct ConsoleSource<'a> {
    console: &'a mut dyn Console,
    at_line_start: bool,
}

impl CharSource for ConsoleSource<'_> {
    fn next_char(&mut self, nesting_depth: u32) -> Option<char> {
        if self.at_line_start {
            let prompt = if nesting_depth == 0 { PROMPT_PRIMARY } else { PROMPT_CONTINUATION };
            self.console.write_str(prompt);
            self.at_line_start = false;
        }
        let c = self.console.read_char()?;
        if c == '\n' {
            self.at_line_start = true;
        }
        Some(c)
    }
}

/// Formats an [`ExecError`] the way a command failure is reported at the
/// prompt (§7 "stderr-print-and-return" shell path).
#[must_use]
pub fn format_exec_error(err: &ExecError) -> String {
    use alloc::format;
    match err {
        ExecError::UnknownCommand => "unknown command".into(),
        ExecError::InvalidArguments => "invalid arguments".into(),
        ExecError::ReservedName => "that name is reserved".into(),
        ExecError::LoaderAlreadySet => "a loader command already ran".into(),
        ExecError::Variable(e) => format!("{e:?}"),
        ExecError::Io(e) => format!("{e:?}"),
        ExecError::Parse(e) => parser::format_error("<shell>", e),
    }
}

/// Runs the shell over `console` against `env` until a loader command
/// freezes it or the console runs out of input (Ctrl-D/EOF).
///
/// Each line is parsed as a standalone command: a parse error or an empty
/// line (blank, or comment-only) doesn't stop the loop, it just
/// re-displays the prompt (§4.9). Once `env.loader()` is set by a command
/// (`reboot`, `exit`, `config`, `kboot`, `linux`), the shell returns so the
/// caller can act on it.
pub fn run(env: &mut Environment, console: &mut dyn Console) {
    loop {
        if env.loader().is_some() {
            return;
        }

        let source = ConsoleSource { console: &mut *console, at_line_start: true };
        match parser::parse_line(source) {
            Ok(None) => return,
            Ok(Some(list)) => {
                if list.is_empty() {
                    continue;
                }
                if let Err(err) = env.command_list_exec(&list) {
                    console.write_str(&format_exec_error(&err));
                    console.write_str("\n");
                }
            }
            Err(err) => {
                console.write_str(&parser::format_error("<shell>", &err));
                console.write_str("\n");
                // The failed line may be only partially consumed (the
                // parser stops at the first bad character). Drain the
                // rest of it so the next prompt starts on a fresh line
                // instead of re-parsing the tail of a bad command.
                while let Some(c) = console.read_char() {
                    if c == '\n' {
                        break;
                    }
                }
            }
        }
    }
}
