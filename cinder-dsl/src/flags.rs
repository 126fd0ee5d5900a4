//! Flag model
//!
//! The `flags` section names the packed status register the guest sees and
//! declares each flag's packed-bit position, calculation kind and storage
//! location:
//!
//! ```text
//! flags
//! 	register f
//! 	S 7 sign f.7
//! 	Z 6 zero zflag
//! 	H 4 half-carry f.4
//! 	C 0 carry cflag
//! ```
//!
//! Storage may be a dedicated scalar register or a bit inside a shared
//! register; flags sharing a storage byte are grouped so coalesce and
//! disperse glue can stitch them in wide moves.

use std::collections::HashMap;
use std::fmt;

use crate::error::{FlagStringError, ParseError};
use crate::lex;

/// Position of a flag inside the packed status register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagBits {
    /// A single bit.
    Single(u32),
    /// A `bot-top` inclusive bit range.
    Range(u32, u32),
}

/// How a flag value is derived from the last arithmetic result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagCalc {
    /// A fixed result bit, offset by the operation size for sub-word ops.
    Bit(u32),
    /// The sign bit of the result.
    Sign,
    /// Result equals zero.
    Zero,
    /// Carry out of the operation.
    Carry,
    /// Carry out of the low nibble.
    HalfCarry,
    /// Signed overflow.
    Overflow,
    /// Even parity of the result byte.
    Parity,
}

impl FlagCalc {
    fn parse(token: &str, line: usize) -> Result<Self, ParseError> {
        if let Some(bit) = token.strip_prefix("bit-") {
            return Ok(FlagCalc::Bit(lex::parse_uint(bit, line)?));
        }
        match token {
            "sign" => Ok(FlagCalc::Sign),
            "zero" => Ok(FlagCalc::Zero),
            "carry" => Ok(FlagCalc::Carry),
            "half-carry" => Ok(FlagCalc::HalfCarry),
            "overflow" => Ok(FlagCalc::Overflow),
            "parity" => Ok(FlagCalc::Parity),
            _ => Err(ParseError::UnknownFlagCalc {
                line,
                found: token.to_owned(),
            }),
        }
    }
}

impl fmt::Display for FlagCalc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlagCalc::Bit(n) => write!(f, "bit-{n}"),
            FlagCalc::Sign => write!(f, "sign"),
            FlagCalc::Zero => write!(f, "zero"),
            FlagCalc::Carry => write!(f, "carry"),
            FlagCalc::HalfCarry => write!(f, "half-carry"),
            FlagCalc::Overflow => write!(f, "overflow"),
            FlagCalc::Parity => write!(f, "parity"),
        }
    }
}

/// Where a flag lives between instructions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlagStorage {
    /// A whole scalar register of its own.
    Reg(String),
    /// A bit inside a shared register.
    Bit(String, u32),
}

impl FlagStorage {
    /// The storage register name.
    pub fn reg(&self) -> &str {
        match self {
            FlagStorage::Reg(reg) | FlagStorage::Bit(reg, _) => reg,
        }
    }
}

impl fmt::Display for FlagStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlagStorage::Reg(reg) => write!(f, "{reg}"),
            FlagStorage::Bit(reg, bit) => write!(f, "{reg}.{bit}"),
        }
    }
}

/// One declared flag.
#[derive(Debug, Clone, PartialEq)]
pub struct Flag {
    /// Single-letter flag name used in `update_flags` strings.
    pub name: char,
    /// Packed-register position.
    pub bits: FlagBits,
    /// Calculation kind.
    pub calc: FlagCalc,
    /// Storage location.
    pub storage: FlagStorage,
}

/// The whole flag model of the described CPU.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Flags {
    /// Flags in declaration order.
    order: Vec<Flag>,
    by_name: HashMap<char, usize>,
    storage_to_flags: HashMap<String, Vec<(Option<u32>, char)>>,
    /// The packed status register the guest observes.
    pub flag_reg: Option<String>,
    /// Highest packed bit referenced by any flag.
    pub max_bit: Option<u32>,
}

/// An `update_flags` control string split into its two categories.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FlagUpdate {
    /// Flags recomputed from the last operation, in declaration order.
    pub auto: Vec<char>,
    /// Flags written to a literal 0 or 1, in appearance order.
    pub explicit: Vec<(char, u8)>,
}

impl FlagUpdate {
    /// Record (or overwrite) an explicit write.
    pub fn set_explicit(&mut self, flag: char, value: u8) {
        if let Some(entry) = self.explicit.iter_mut().find(|(name, _)| *name == flag) {
            entry.1 = value;
        } else {
            self.explicit.push((flag, value));
        }
    }
}

impl Flags {
    /// Process one body line of the `flags` section.
    pub fn process_line(&mut self, parts: &[String], line: usize) -> Result<(), ParseError> {
        if parts.first().map(String::as_str) == Some("register") {
            let reg = parts.get(1).ok_or(ParseError::MalformedFlag { line })?;
            self.flag_reg = Some(reg.clone());
            return Ok(());
        }
        let [name, bits, calc, storage] = parts else {
            return Err(ParseError::MalformedFlag { line });
        };
        let mut chars = name.chars();
        let (Some(name), None) = (chars.next(), chars.next()) else {
            return Err(ParseError::MalformedFlag { line });
        };
        let bits = match bits.split_once('-') {
            Some((bot, top)) => {
                FlagBits::Range(lex::parse_uint(bot, line)?, lex::parse_uint(top, line)?)
            }
            None => FlagBits::Single(lex::parse_uint(bits, line)?),
        };
        let top = match bits {
            FlagBits::Single(bit) => bit,
            FlagBits::Range(_, top) => top,
        };
        if self.max_bit.map_or(true, |max| top > max) {
            self.max_bit = Some(top);
        }
        let calc = FlagCalc::parse(calc, line)?;
        let storage = match storage.split_once('.') {
            Some((reg, bit)) => FlagStorage::Bit(reg.to_owned(), lex::parse_uint(bit, line)?),
            None => FlagStorage::Reg(storage.clone()),
        };
        let store_bit = match &storage {
            FlagStorage::Reg(_) => None,
            FlagStorage::Bit(_, bit) => Some(*bit),
        };
        self.storage_to_flags
            .entry(storage.reg().to_owned())
            .or_default()
            .push((store_bit, name));
        self.by_name.insert(name, self.order.len());
        self.order.push(Flag {
            name,
            bits,
            calc,
            storage,
        });
        Ok(())
    }

    /// Flags in declaration order.
    pub fn order(&self) -> &[Flag] {
        &self.order
    }

    /// Look up a flag by letter.
    pub fn get(&self, name: char) -> Option<&Flag> {
        self.by_name.get(&name).map(|idx| &self.order[*idx])
    }

    /// The first declared flag with `carry` calculation, if any.
    pub fn carry_flag(&self) -> Option<&Flag> {
        self.order.iter().find(|flag| flag.calc == FlagCalc::Carry)
    }

    /// How many flags share the given storage register.
    pub fn storage_population(&self, reg: &str) -> usize {
        self.storage_to_flags.get(reg).map_or(0, Vec::len)
    }

    /// Split an `update_flags` string into auto-updates (ordered by flag
    /// declaration) and explicit 0/1 writes (in appearance order).
    pub fn parse_update(&self, spec: &str) -> Result<FlagUpdate, FlagStringError> {
        let mut update = FlagUpdate::default();
        let mut seen = Vec::new();
        let mut last: Option<char> = None;
        for c in spec.chars() {
            if c.is_ascii_digit() {
                let Some(flag) = last.take().filter(|f| f.is_alphabetic()) else {
                    return Err(FlagStringError::DanglingDigit);
                };
                let value = c as u8 - b'0';
                if value > 1 {
                    return Err(FlagStringError::BadDigit(c));
                }
                update.set_explicit(flag, value);
            } else {
                if let Some(flag) = last.filter(|f| f.is_alphabetic()) {
                    seen.push(flag);
                }
                last = Some(c);
            }
        }
        if let Some(flag) = last.filter(|f| f.is_alphabetic()) {
            seen.push(flag);
        }
        update.auto = self
            .order
            .iter()
            .map(|flag| flag.name)
            .filter(|name| seen.contains(name))
            .collect();
        // Letters for flags that were never declared still surface so the
        // generator can report them instead of silently dropping updates.
        for name in seen {
            if self.get(name).is_none() && !update.auto.contains(&name) {
                update.auto.push(name);
            }
        }
        Ok(update)
    }
}

impl fmt::Display for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(reg) = &self.flag_reg {
            writeln!(f, "\tregister {reg}")?;
        }
        for flag in &self.order {
            let bits = match flag.bits {
                FlagBits::Single(bit) => bit.to_string(),
                FlagBits::Range(bot, top) => format!("{bot}-{top}"),
            };
            writeln!(f, "\t{} {} {} {}", flag.name, bits, flag.calc, flag.storage)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flags(lines: &[&str]) -> Flags {
        let mut model = Flags::default();
        for (no, text) in lines.iter().enumerate() {
            let parts: Vec<String> = text.split_whitespace().map(str::to_owned).collect();
            model.process_line(&parts, no + 1).unwrap();
        }
        model
    }

    #[test]
    fn declarations_parse() {
        let model = flags(&[
            "register f",
            "S 7 sign f.7",
            "Z 6 zero zflag",
            "C 0 carry cflag",
        ]);
        assert_eq!(model.flag_reg.as_deref(), Some("f"));
        assert_eq!(model.max_bit, Some(7));
        assert_eq!(model.get('Z').unwrap().calc, FlagCalc::Zero);
        assert_eq!(
            model.get('S').unwrap().storage,
            FlagStorage::Bit("f".into(), 7)
        );
        assert_eq!(model.carry_flag().unwrap().name, 'C');
        assert_eq!(model.storage_population("f"), 1);
    }

    #[test]
    fn bit_ranges() {
        let model = flags(&["register ccr", "I 8-10 bit-0 int_mask"]);
        assert_eq!(model.get('I').unwrap().bits, FlagBits::Range(8, 10));
        assert_eq!(model.max_bit, Some(10));
    }

    #[test]
    fn update_strings_split() {
        let model = flags(&[
            "register f",
            "S 7 sign f.7",
            "Z 6 zero f.6",
            "H 4 half-carry f.4",
            "C 0 carry f.0",
        ]);
        let update = model.parse_update("ZH0C").unwrap();
        assert_eq!(update.auto, vec!['Z', 'C']);
        assert_eq!(update.explicit, vec![('H', 0)]);
    }

    #[test]
    fn auto_updates_follow_declaration_order() {
        let model = flags(&[
            "register f",
            "S 7 sign f.7",
            "Z 6 zero f.6",
            "C 0 carry f.0",
        ]);
        let update = model.parse_update("CZS").unwrap();
        assert_eq!(update.auto, vec!['S', 'Z', 'C']);
    }

    #[test]
    fn digits_need_a_flag() {
        let model = flags(&["register f", "Z 6 zero f.6"]);
        assert_eq!(
            model.parse_update("0Z"),
            Err(FlagStringError::DanglingDigit)
        );
        assert_eq!(model.parse_update("Z2"), Err(FlagStringError::BadDigit('2')));
    }

    #[test]
    fn unknown_calc_is_reported() {
        let mut model = Flags::default();
        let parts: Vec<String> = ["X", "3", "weird", "f.3"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(
            model.process_line(&parts, 7),
            Err(ParseError::UnknownFlagCalc {
                line: 7,
                found: "weird".into()
            })
        );
    }
}
