//! Parse error types

use core::fmt;
use thiserror::Error;

/// Result alias for parse-stage fallible operations.
pub type Result<T, E = ParseError> = core::result::Result<T, E>;

/// A single diagnostic produced while reading a CPU description.
///
/// Errors are collected rather than aborting on the first failure so a
/// whole file can be reported in one pass. No code is emitted while any
/// of these are present.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// An indented line appeared before any section or definition header.
    #[error("line {line}: orphan statement outside of any definition")]
    OrphanLine {
        /// 1-based source line.
        line: usize,
    },
    /// `end` appeared with no open `switch`, `if` or `loop`.
    #[error("line {line}: end is only allowed inside a switch, if or loop block")]
    StrayEnd {
        /// 1-based source line.
        line: usize,
    },
    /// A quoted token was never closed before the end of the line.
    #[error("line {line}: unclosed quote")]
    UnclosedQuote {
        /// 1-based source line.
        line: usize,
    },
    /// An instruction header had more than `table bitpattern name` tokens.
    #[error("line {line}: malformed instruction header")]
    MalformedHeader {
        /// 1-based source line.
        line: usize,
    },
    /// A bit pattern contained a character that is neither a literal bit
    /// nor a field letter.
    #[error("line {line}: invalid bit pattern character {found:?}")]
    BadPatternChar {
        /// 1-based source line.
        line: usize,
        /// The offending character.
        found: char,
    },
    /// A field letter re-appeared after other bits interrupted its run.
    #[error("line {line}: field {field:?} is not contiguous")]
    NonContiguousField {
        /// 1-based source line.
        line: usize,
        /// The offending field letter.
        field: char,
    },
    /// A statement keyword was given too few or unparsable operands.
    #[error("line {line}: malformed {what} statement")]
    MalformedStatement {
        /// 1-based source line.
        line: usize,
        /// The statement keyword.
        what: &'static str,
    },
    /// A numeric token could not be parsed as `0x…`, `0b…` or decimal.
    #[error("line {line}: invalid numeric literal {token:?}")]
    BadNumber {
        /// 1-based source line.
        line: usize,
        /// The offending token.
        token: String,
    },
    /// `case` or `default` outside of a `switch` body.
    #[error("line {line}: {what} is only allowed inside a switch block")]
    MisplacedArm {
        /// 1-based source line.
        line: usize,
        /// `case` or `default`.
        what: &'static str,
    },
    /// A statement appeared inside a `switch` before the first `case`.
    #[error("line {line}: statement before the first case of a switch")]
    OrphanSwitchStatement {
        /// 1-based source line.
        line: usize,
    },
    /// `else` outside of an `if` body.
    #[error("line {line}: else outside of an if block")]
    MisplacedElse {
        /// 1-based source line.
        line: usize,
    },
    /// `arg` outside of a subroutine body.
    #[error("line {line}: arg is only allowed inside a subroutine")]
    MisplacedArg {
        /// 1-based source line.
        line: usize,
    },
    /// `invalid`/`nospecialize` outside of an instruction body.
    #[error("line {line}: {what} is only allowed inside an instruction")]
    MisplacedInstructionMeta {
        /// 1-based source line.
        line: usize,
        /// The statement keyword.
        what: &'static str,
    },
    /// A `switch`, `if` or `loop` was still open when its container ended.
    #[error("line {line}: unclosed {what} block")]
    UnclosedBlock {
        /// 1-based line where the block was opened.
        line: usize,
        /// The block keyword.
        what: &'static str,
    },
    /// A subroutine was declared but its body contained no statements.
    #[error("subroutine {name} has no body")]
    EmptySubroutine {
        /// The subroutine name.
        name: String,
    },
    /// A malformed flag declaration line in the `flags` section.
    #[error("line {line}: malformed flag declaration")]
    MalformedFlag {
        /// 1-based source line.
        line: usize,
    },
    /// An unknown flag calculation kind in the `flags` section.
    #[error("line {line}: unknown flag calc kind {found:?}")]
    UnknownFlagCalc {
        /// 1-based source line.
        line: usize,
        /// The offending token.
        found: String,
    },
    /// A malformed register declaration line in the `regs` section.
    #[error("line {line}: malformed register declaration")]
    MalformedRegister {
        /// 1-based source line.
        line: usize,
    },
    /// A register name already taken by another declaration kind.
    #[error("line {line}: register name {name} is already declared")]
    DuplicateRegister {
        /// 1-based source line.
        line: usize,
        /// The colliding name.
        name: String,
    },
}

/// Every diagnostic collected over one source file.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub struct ParseErrors(pub Vec<ParseError>);

impl fmt::Display for ParseErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}

/// A malformed `update_flags` control string.
///
/// Raised while generating code, not while parsing, because the string is
/// only interpreted once an `update_flags` op is reached.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FlagStringError {
    /// A digit did not immediately follow a flag letter.
    #[error("digit must follow a flag letter in update_flags")]
    DanglingDigit,
    /// An explicit flag value other than 0 or 1.
    #[error("{0} is not a valid digit for update_flags")]
    BadDigit(char),
}
