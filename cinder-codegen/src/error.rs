//! Generation error types
//!
//! Unlike the parse stage, which collects diagnostics, misuse of the
//! language at generation time is fatal: the generator aborts with a
//! diagnostic naming the offending operation and instruction and no
//! output is produced.

use thiserror::Error;

/// Result alias for generation-stage fallible operations.
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// A fatal code generation error.
#[derive(Debug, Error)]
pub enum Error {
    /// An `update_flags` string referenced a flag that was never declared.
    #[error("update_flags references undefined flag {0}")]
    UndefinedFlag(char),
    /// An op that consumes the carry bit ran without a carry flag.
    #[error("{0} requires a defined carry flag")]
    MissingCarryFlag(&'static str),
    /// An op was given fewer parameters than its slots require.
    #[error("insufficient params for {op} ({params})")]
    InsufficientParams {
        /// The op mnemonic.
        op: String,
        /// The raw parameter list, for the diagnostic.
        params: String,
    },
    /// A pure evaluator had no destination slot left to fold into.
    #[error("insufficient args for {op} ({params})")]
    InsufficientArgs {
        /// The op mnemonic.
        op: String,
        /// The raw parameter list, for the diagnostic.
        params: String,
    },
    /// `sext` was given a non-constant target width.
    #[error("first param to sext must resolve to an integer")]
    SextNonConstWidth,
    /// `sext` was given a target width other than 16 or 32.
    #[error("first param to sext must be 16 or 32")]
    SextBadWidth,
    /// `nospecialize` needs a single opcode source to extract from.
    #[error("nospecialize requires exactly 1 field used for main table dispatch")]
    NoSpecializeDispatch,
    /// A `nospecialize` line named a field the pattern does not have.
    #[error("nospecialize references unknown field {0}")]
    UnknownField(String),
    /// A subroutine was called with the wrong number of arguments.
    #[error("{sub} expects {expected} arguments, but was called with {got}")]
    ArgCount {
        /// The subroutine name.
        sub: String,
        /// Declared argument count.
        expected: usize,
        /// Call-site argument count.
        got: usize,
    },
    /// A comparator that needs a preceding `cmp` ran without one.
    #[error("{0} requires a preceding cmp")]
    CmpContext(&'static str),
    /// `xchg` was handed a literal operand.
    #[error("xchg operands must be registers or locals")]
    XchgConstOperand,
    /// `update_sync` ran with no `sync_cycle` subroutine configured.
    #[error("update_sync requires a sync_cycle info entry")]
    MissingSyncCycle,
    /// The requested dispatch strategy is not implemented.
    #[error("unsupported dispatch type {0}")]
    UnsupportedDispatch(String),
    /// A flag refers to a packed bit beyond the status register width.
    #[error("flag {flag} bit {bit} does not fit the {width}-bit flag register")]
    FlagBitOutOfRange {
        /// The flag letter.
        flag: char,
        /// The out-of-range bit.
        bit: u32,
        /// The packed register width.
        width: u32,
    },
    /// A malformed `update_flags` control string.
    #[error(transparent)]
    FlagString(#[from] cinder_dsl::FlagStringError),
    /// Failure writing the companion header.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// Context wrapper naming the instruction being generated.
    #[error("in instruction {name}: {source}")]
    Instruction {
        /// The instruction name.
        name: String,
        /// The underlying failure.
        source: Box<Error>,
    },
}
