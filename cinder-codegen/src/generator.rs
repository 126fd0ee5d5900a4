//! Generator context
//!
//! All state shared across one emission pass lives in one explicit
//! [`Generator`] value threaded through every emit function:
//! textual aliases (`meta`), the per-size temporary pool, the scope frame
//! stack, the record of the just-emitted arithmetic op used by flag
//! synthesis, and the coalesce/disperse bookkeeping. Everything here is
//! scratch that resets at the top of each generated function; the parsed
//! [`Program`] itself is read-only.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

use cinder_dsl::program::Program;
use cinder_dsl::regs::Width;

use crate::error::{Error, Result};
use crate::scope::Frame;

/// Dispatch strategy for the emitted interpreter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// One `static` function per specialization, dispatched through a
    /// function pointer table.
    Call,
    /// Accepted on the command line but not implemented.
    Switch,
    /// Labeled blocks dispatched through `goto *` label addresses.
    Goto,
}

impl FromStr for Dispatch {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "call" => Ok(Dispatch::Call),
            "switch" => Ok(Dispatch::Switch),
            "goto" => Ok(Dispatch::Goto),
            other => Err(Error::UnsupportedDispatch(other.to_owned())),
        }
    }
}

impl fmt::Display for Dispatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dispatch::Call => write!(f, "call"),
            Dispatch::Switch => write!(f, "switch"),
            Dispatch::Goto => write!(f, "goto"),
        }
    }
}

/// A resolved operation parameter: either a known constant or a C
/// expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Param {
    /// A compile-time constant.
    Int(i64),
    /// A C lvalue or expression.
    Expr(String),
}

impl Param {
    /// The constant value, if this parameter folded.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Param::Int(v) => Some(*v),
            Param::Expr(_) => None,
        }
    }

    /// True for folded constants.
    pub fn is_int(&self) -> bool {
        matches!(self, Param::Int(_))
    }
}

impl fmt::Display for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Param::Int(v) => write!(f, "{v}"),
            Param::Expr(e) => write!(f, "{e}"),
        }
    }
}

/// Field values (or inlined subroutine arguments) bound in the current
/// generation context.
pub type FieldVals = HashMap<String, Param>;

/// Record of the op that flag synthesis may need to inspect.
#[derive(Debug, Clone, Default)]
pub(crate) struct LastOp {
    pub op: String,
    pub params: Vec<String>,
}

/// The code generator for one parsed program.
pub struct Generator<'p> {
    pub(crate) prog: &'p Program,
    /// Selected dispatch strategy.
    pub dispatch: Dispatch,
    pub(crate) booleans: HashMap<String, bool>,

    // Target options extracted from the info section.
    pub(crate) prefix: String,
    pub(crate) opsize: u32,
    pub(crate) context_type: String,
    pub(crate) extra_tables: Vec<String>,
    pub(crate) body: Option<String>,
    pub(crate) interrupt: Option<String>,
    pub(crate) sync_cycle: Option<String>,
    pub(crate) includes: Vec<String>,
    pub(crate) pc_reg: Option<String>,
    pub(crate) pc_offset: u32,

    // Scratch state, reset per generated function.
    pub(crate) meta: HashMap<String, String>,
    pub(crate) temp: BTreeMap<u32, String>,
    pub(crate) scopes: Vec<Frame>,
    pub(crate) reg_values: HashMap<String, i64>,
    pub(crate) last_op: Option<LastOp>,
    pub(crate) last_dst: Option<String>,
    pub(crate) last_size: Option<u32>,
    pub(crate) last_a: Option<Param>,
    pub(crate) last_b: Option<Param>,
    pub(crate) last_b_flow: Option<Param>,
    pub(crate) last_b_unmasked: Option<Param>,
    pub(crate) carry_flow_dst: Option<String>,
    pub(crate) size_adjust: Option<u32>,
    pub(crate) conditional: bool,
    pub(crate) need_flag_coalesce: bool,
    pub(crate) need_flag_disperse: bool,
    pub(crate) main_dispatch: BTreeSet<String>,
}

impl<'p> Generator<'p> {
    /// Build a generator for `prog` with the configured booleans
    /// (`dynarec` defaults false, `interp` true) and dispatch strategy.
    pub fn new(
        prog: &'p Program,
        dispatch: Dispatch,
        defines: &[(String, bool)],
    ) -> Result<Self> {
        let mut booleans = HashMap::new();
        booleans.insert("dynarec".to_owned(), false);
        booleans.insert("interp".to_owned(), true);
        for (name, value) in defines {
            booleans.insert(name.clone(), *value);
        }
        let prefix = prog.info.first("prefix").unwrap_or("").to_owned();
        let opsize = prog
            .info
            .first("opcode_size")
            .and_then(|tok| tok.parse::<u32>().ok())
            .unwrap_or(8);
        let context_type = format!("{prefix}context");
        let extra_tables = prog
            .info
            .get("extra_tables")
            .map(<[String]>::to_vec)
            .unwrap_or_default();
        let includes = prog
            .info
            .get("include")
            .map(<[String]>::to_vec)
            .unwrap_or_default();
        let pc_offset = prog
            .info
            .first("pc_offset")
            .and_then(|tok| tok.parse::<u32>().ok())
            .unwrap_or(0);

        let generator = Generator {
            prog,
            dispatch,
            booleans,
            prefix,
            opsize,
            context_type,
            extra_tables,
            body: prog.info.first("body").map(str::to_owned),
            interrupt: prog.info.first("interrupt").map(str::to_owned),
            sync_cycle: prog.info.first("sync_cycle").map(str::to_owned),
            includes,
            pc_reg: prog.info.first("pc_reg").map(str::to_owned),
            pc_offset,
            meta: HashMap::new(),
            temp: BTreeMap::new(),
            scopes: Vec::new(),
            reg_values: HashMap::new(),
            last_op: None,
            last_dst: None,
            last_size: None,
            last_a: None,
            last_b: None,
            last_b_flow: None,
            last_b_unmasked: None,
            carry_flow_dst: None,
            size_adjust: None,
            conditional: false,
            need_flag_coalesce: false,
            need_flag_disperse: false,
            main_dispatch: BTreeSet::new(),
        };
        generator.check_flag_bits()?;
        Ok(generator)
    }

    /// Every packed bit must fit inside the declared flag register.
    fn check_flag_bits(&self) -> Result<()> {
        let Some(flag_reg) = &self.prog.flags.flag_reg else {
            return Ok(());
        };
        let Some(Width::Bits(width)) = self.prog.registers.scalar_width(flag_reg) else {
            return Ok(());
        };
        for flag in self.prog.flags.order() {
            let top = match flag.bits {
                cinder_dsl::flags::FlagBits::Single(bit) => bit,
                cinder_dsl::flags::FlagBits::Range(_, top) => top,
            };
            if top >= *width {
                return Err(Error::FlagBitOutOfRange {
                    flag: flag.name,
                    bit: top,
                    width: *width,
                });
            }
        }
        Ok(())
    }

    /// The boolean configuration value for `name`, if defined.
    pub(crate) fn boolean(&self, name: &str) -> Option<bool> {
        self.booleans.get(name).copied()
    }

    /// Clear everything that must not leak between generated functions.
    pub(crate) fn reset_scratch(&mut self) {
        self.meta.clear();
        self.temp.clear();
        self.scopes.clear();
        self.reg_values.clear();
        self.last_op = None;
        self.last_dst = None;
        self.last_size = None;
        self.last_a = None;
        self.last_b = None;
        self.last_b_flow = None;
        self.last_b_unmasked = None;
        self.carry_flow_dst = None;
        self.size_adjust = None;
        self.conditional = false;
        self.need_flag_coalesce = false;
        self.need_flag_disperse = false;
    }

    /// The operation size the next flag update should observe.
    pub(crate) fn effective_size(&self) -> u32 {
        if let Some(size) = self.last_size {
            return size;
        }
        self.last_dst
            .as_deref()
            .map(|dst| self.param_size(dst))
            .unwrap_or(32)
    }
}

/// An all-ones mask of `bits` width.
pub(crate) fn bit_mask(bits: u32) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}
