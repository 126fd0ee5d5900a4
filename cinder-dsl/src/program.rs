//! Top-level program model
//!
//! A parsed CPU description: the register file, the flag model, helper
//! subroutines, instructions grouped into named dispatch tables (the
//! implicit table is `main`), the free-form `info` key/value section and
//! the verbatim `declare` lines forwarded to the emitted header.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use itertools::Itertools;

use crate::error::ParseError;
use crate::flags::Flags;
use crate::ir::Stmt;
use crate::regs::Registers;

/// A contiguous run of identically-named bits in an instruction pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    /// Bit position of the field's least significant bit.
    pub shift: u32,
    /// Field width in bits.
    pub width: u32,
}

/// One instruction of the emulated CPU.
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    /// Instruction name; specialization names derive from it.
    pub name: String,
    /// The bit pattern as written in the source.
    pub pattern: String,
    /// Fixed bits of the pattern.
    pub value: u32,
    /// Fields in first-appearance (MSB) order.
    pub fields: Vec<(String, Field)>,
    /// Total width of all fields.
    pub varying_bits: u32,
    /// Locals declared in the body, in source order.
    pub locals: Vec<(String, u32)>,
    /// Body statements.
    pub implementation: Vec<Stmt>,
    /// Forbidden values per field, in appearance order.
    pub invalid_values: Vec<(String, Vec<u32>)>,
    /// Field-value combinations that are only illegal together.
    pub invalid_combos: Vec<Vec<(String, u32)>>,
    /// Fields extracted at runtime instead of being specialized.
    pub no_specialize: BTreeSet<String>,
}

impl Instruction {
    /// Parse a `bitpattern` header token into an otherwise-empty
    /// instruction.
    pub fn from_pattern(pattern: &str, name: &str, line: usize) -> Result<Self, ParseError> {
        let mut value = 0u32;
        let mut fields: Vec<(String, Field)> = Vec::new();
        let mut curbit = pattern.chars().count() as i64 - 1;
        for ch in pattern.chars() {
            value <<= 1;
            match ch {
                '0' => {}
                '1' => value |= 1,
                c if c.is_ascii_alphanumeric() => {
                    let key = c.to_string();
                    if let Some((_, field)) = fields.iter_mut().find(|(name, _)| *name == key) {
                        if field.shift as i64 != curbit + 1 {
                            return Err(ParseError::NonContiguousField { line, field: c });
                        }
                        field.shift = curbit as u32;
                        field.width += 1;
                    } else {
                        fields.push((
                            key,
                            Field {
                                shift: curbit as u32,
                                width: 1,
                            },
                        ));
                    }
                }
                c => return Err(ParseError::BadPatternChar { line, found: c }),
            }
            curbit -= 1;
        }
        let varying_bits = fields.iter().map(|(_, f)| f.width).sum();
        Ok(Instruction {
            name: name.to_owned(),
            pattern: pattern.to_owned(),
            value,
            fields,
            varying_bits,
            locals: Vec::new(),
            implementation: Vec::new(),
            invalid_values: Vec::new(),
            invalid_combos: Vec::new(),
            no_specialize: BTreeSet::new(),
        })
    }

    /// Look up a field by name.
    pub fn field(&self, name: &str) -> Option<Field> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, f)| *f)
    }

    /// Record a forbidden value for one field.
    pub fn add_invalid_value(&mut self, field: &str, value: u32) {
        if let Some((_, values)) = self
            .invalid_values
            .iter_mut()
            .find(|(name, _)| name == field)
        {
            if !values.contains(&value) {
                values.push(value);
            }
        } else {
            self.invalid_values.push((field.to_owned(), vec![value]));
        }
    }

    /// Every legal opcode value this instruction occupies, ascending by
    /// the enumeration index.
    pub fn all_values(&self) -> Vec<u32> {
        let mut values = Vec::new();
        for i in 0..(1u64 << self.varying_bits) {
            let mut word = self.value;
            let mut rem = i;
            let mut legal = true;
            let mut combos: Vec<HashMap<&str, u32>> = self
                .invalid_combos
                .iter()
                .map(|combo| {
                    combo
                        .iter()
                        .map(|(field, value)| (field.as_str(), *value))
                        .collect()
                })
                .collect();
            for (field, f) in &self.fields {
                let val = (rem & ((1u64 << f.width) - 1)) as u32;
                if self
                    .invalid_values
                    .iter()
                    .any(|(name, vals)| name == field && vals.contains(&val))
                {
                    legal = false;
                    break;
                }
                let mut next = Vec::with_capacity(combos.len());
                for mut combo in combos {
                    match combo.get(field.as_str()) {
                        Some(&want) if want == val => {
                            combo.remove(field.as_str());
                            if combo.is_empty() {
                                legal = false;
                                break;
                            }
                            next.push(combo);
                        }
                        // A mismatched pin means this combination can no
                        // longer trigger for the current value.
                        Some(_) => {}
                        None => next.push(combo),
                    }
                }
                combos = next;
                if !legal {
                    break;
                }
                rem >>= f.width;
                word |= val << f.shift;
            }
            if legal {
                values.push(word);
            }
        }
        values
    }

    /// Extract every field's value from a concrete opcode.
    pub fn field_vals(&self, value: u32) -> Vec<(String, u32, u32)> {
        self.fields
            .iter()
            .map(|(name, f)| {
                let val = (value >> f.shift) & ((1u32 << f.width) - 1);
                (name.clone(), val, f.width)
            })
            .collect()
    }

    /// The specialization name for one concrete opcode: the instruction
    /// name followed by `_field_bits` for every specialized field, fields
    /// in lexicographic order.
    pub fn spec_name(&self, value: u32) -> String {
        let mut name = self.name.clone();
        for (field, val, width) in self
            .field_vals(value)
            .into_iter()
            .filter(|(field, _, _)| !self.no_specialize.contains(field))
            .sorted_by(|a, b| a.0.cmp(&b.0))
        {
            name.push_str(&format!("_{field}_{val:0width$b}", width = width as usize));
        }
        name
    }
}

/// A helper subroutine, inlined at each call site.
#[derive(Debug, Clone, PartialEq)]
pub struct SubRoutine {
    /// Subroutine name; also the call mnemonic.
    pub name: String,
    /// Declared arguments in order.
    pub args: Vec<(String, u32)>,
    /// Locals, emitted with a `<name>_` qualifier.
    pub locals: Vec<(String, u32)>,
    /// Body statements.
    pub implementation: Vec<Stmt>,
}

impl SubRoutine {
    /// An empty subroutine shell.
    pub fn new(name: &str) -> Self {
        SubRoutine {
            name: name.to_owned(),
            args: Vec::new(),
            locals: Vec::new(),
            implementation: Vec::new(),
        }
    }

    /// Width of an argument, if declared.
    pub fn arg_width(&self, name: &str) -> Option<u32> {
        self.args
            .iter()
            .find(|(arg, _)| arg == name)
            .map(|(_, width)| *width)
    }
}

/// The `info` section: a key to list-of-tokens map, last write wins.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Info {
    /// Raw entries in source order.
    pub entries: Vec<(String, Vec<String>)>,
}

impl Info {
    /// Record one `key value…` line.
    pub fn add(&mut self, key: &str, values: Vec<String>) {
        self.entries.push((key.to_owned(), values));
    }

    /// The token list of the latest entry for `key`.
    pub fn get(&self, key: &str) -> Option<&[String]> {
        self.entries
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_slice())
    }

    /// The first token of the latest entry for `key`.
    pub fn first(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|v| v.first()).map(String::as_str)
    }
}

/// One named dispatch table and the instructions grouped into it.
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    /// Table name (`main` unless the header named one).
    pub name: String,
    /// Instructions in source order.
    pub instructions: Vec<Instruction>,
}

/// A fully parsed CPU description.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Program {
    /// The register file.
    pub registers: Registers,
    /// The flag model.
    pub flags: Flags,
    /// Dispatch tables in first-appearance order.
    pub tables: Vec<Table>,
    /// Subroutines in source order.
    pub subroutines: Vec<SubRoutine>,
    /// The `info` section.
    pub info: Info,
    /// Verbatim `declare` lines for the header.
    pub declares: Vec<String>,
}

impl Program {
    /// Look up a subroutine by name; a re-declaration shadows earlier ones.
    pub fn subroutine(&self, name: &str) -> Option<&SubRoutine> {
        self.subroutines.iter().rev().find(|sub| sub.name == name)
    }

    /// Look up a dispatch table by name.
    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.iter().find(|table| table.name == name)
    }

    /// The table to append to, creating it on first use.
    pub fn table_mut(&mut self, name: &str) -> &mut Table {
        if let Some(idx) = self.tables.iter().position(|table| table.name == name) {
            return &mut self.tables[idx];
        }
        self.tables.push(Table {
            name: name.to_owned(),
            instructions: Vec::new(),
        });
        self.tables.last_mut().expect("just pushed")
    }
}

fn write_sub(f: &mut fmt::Formatter<'_>, sub: &SubRoutine) -> fmt::Result {
    writeln!(f, "{}", sub.name)?;
    for (name, width) in &sub.args {
        writeln!(f, "\targ {name} {width}")?;
    }
    for (name, width) in &sub.locals {
        writeln!(f, "\tlocal {name} {width}")?;
    }
    for stmt in &sub.implementation {
        write!(f, "{stmt}")?;
    }
    Ok(())
}

fn write_instruction(f: &mut fmt::Formatter<'_>, table: &str, inst: &Instruction) -> fmt::Result {
    if table == "main" {
        writeln!(f, "{} {}", inst.pattern, inst.name)?;
    } else {
        writeln!(f, "{table} {} {}", inst.pattern, inst.name)?;
    }
    for (name, width) in &inst.locals {
        writeln!(f, "\tlocal {name} {width}")?;
    }
    for (field, values) in &inst.invalid_values {
        for value in values {
            writeln!(f, "\tinvalid {field} {value}")?;
        }
    }
    for combo in &inst.invalid_combos {
        let pairs = combo
            .iter()
            .map(|(field, value)| format!("{field} {value}"))
            .join(" ");
        writeln!(f, "\tinvalid {pairs}")?;
    }
    if !inst.no_specialize.is_empty() {
        writeln!(f, "\tnospecialize {}", inst.no_specialize.iter().join(" "))?;
    }
    for stmt in &inst.implementation {
        write!(f, "{stmt}")?;
    }
    Ok(())
}

impl fmt::Display for Program {
    /// Canonical DSL text; parsing it back yields a structurally equal
    /// program.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.info.entries.is_empty() {
            writeln!(f, "info")?;
            for (key, values) in &self.info.entries {
                writeln!(f, "\t{key} {}", values.join(" "))?;
            }
        }
        writeln!(f, "regs")?;
        write!(f, "{}", self.registers)?;
        if self.flags.flag_reg.is_some() || !self.flags.order().is_empty() {
            writeln!(f, "flags")?;
            write!(f, "{}", self.flags)?;
        }
        if !self.declares.is_empty() {
            writeln!(f, "declare")?;
            for line in &self.declares {
                writeln!(f, "\t{line}")?;
            }
        }
        for sub in &self.subroutines {
            write_sub(f, sub)?;
        }
        for table in &self.tables {
            for inst in &table.instructions {
                write_instruction(f, &table.name, inst)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_fields_extend_downward() {
        let inst = Instruction::from_pattern("0010ddd", "nop_d", 1).unwrap();
        assert_eq!(inst.value, 0b0010000);
        assert_eq!(inst.varying_bits, 3);
        assert_eq!(inst.field("d"), Some(Field { shift: 0, width: 3 }));
    }

    #[test]
    fn pattern_rejects_gaps() {
        assert_eq!(
            Instruction::from_pattern("d0d", "bad", 4),
            Err(ParseError::NonContiguousField { line: 4, field: 'd' })
        );
    }

    #[test]
    fn pattern_rejects_punctuation() {
        assert_eq!(
            Instruction::from_pattern("00?0", "bad", 2),
            Err(ParseError::BadPatternChar { line: 2, found: '?' })
        );
    }

    #[test]
    fn enumeration_is_complete() {
        let inst = Instruction::from_pattern("10aabb00", "mix", 1).unwrap();
        let values = inst.all_values();
        assert_eq!(values.len(), 1 << inst.varying_bits);
        let unique: BTreeSet<u32> = values.iter().copied().collect();
        assert_eq!(unique.len(), values.len());
        for value in values {
            assert_eq!(value & 0b1100_0011, 0b1000_0000);
        }
    }

    #[test]
    fn invalid_value_filters_field() {
        let mut inst = Instruction::from_pattern("0010ddd", "nop_d", 1).unwrap();
        inst.add_invalid_value("d", 3);
        let values = inst.all_values();
        assert_eq!(values.len(), 7);
        assert!(!values.contains(&0b0010011));
    }

    #[test]
    fn invalid_combo_requires_all_pins() {
        let mut inst = Instruction::from_pattern("00fffggg", "combo", 1).unwrap();
        inst.invalid_combos
            .push(vec![("f".into(), 3), ("g".into(), 7)]);
        let values = inst.all_values();
        assert_eq!(values.len(), 63);
        assert!(!values.contains(&0b00011111));
        // Either pin alone stays legal.
        assert!(values.contains(&0b00011000));
        assert!(values.contains(&0b00000111));
    }

    #[test]
    fn spec_names_sort_fields() {
        let inst = Instruction::from_pattern("1ba0", "op", 1).unwrap();
        // Fields appear b-first in the pattern but sort a-first in names.
        assert_eq!(inst.spec_name(0b1110), "op_a_1_b_1");
        assert_eq!(inst.spec_name(0b1000), "op_a_0_b_0");
    }

    #[test]
    fn spec_names_pad_field_width() {
        let inst = Instruction::from_pattern("0010ddd", "nop_d", 1).unwrap();
        assert_eq!(inst.spec_name(0b0010000), "nop_d_d_000");
        assert_eq!(inst.spec_name(0b0010110), "nop_d_d_110");
    }

    #[test]
    fn info_last_write_wins() {
        let mut info = Info::default();
        info.add("prefix", vec!["a_".into()]);
        info.add("prefix", vec!["b_".into()]);
        assert_eq!(info.first("prefix"), Some("b_"));
    }
}
