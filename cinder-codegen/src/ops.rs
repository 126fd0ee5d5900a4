//! The operation table and per-op C emitters
//!
//! Every DSL mnemonic has one [`OpSpec`] entry pairing an optional pure
//! evaluator (driving constant folding) with the indices of its output
//! parameters; emission itself dispatches on [`OpKind`]. The table is the
//! single source of truth for arity and destination slots.
//!
//! Arithmetic emitters share a staging discipline: when the following
//! `update_flags` needs carry, half-carry or overflow, or when the
//! requested size is narrower than the destination, the result lands in a
//! widened shared temporary (`gen_tmp<size>__`) and the flag engine
//! commits it back after reading the interesting bits.

use std::str::FromStr;

use bitflags::bitflags;
use itertools::Itertools;

use cinder_dsl::flags::{FlagCalc, FlagUpdate};
use cinder_dsl::ir::NormalOp;

use crate::error::{Error, Result};
use crate::generator::{bit_mask, FieldVals, Generator, LastOp, Param};
use crate::scope::Frame;

/// Canonical operation mnemonics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::EnumString, strum::Display, strum::EnumIter)]
#[allow(missing_docs)]
pub enum OpKind {
    #[strum(serialize = "mov")]
    Mov,
    #[strum(serialize = "not")]
    Not,
    #[strum(serialize = "lnot")]
    Lnot,
    #[strum(serialize = "neg")]
    Neg,
    #[strum(serialize = "add")]
    Add,
    #[strum(serialize = "adc")]
    Adc,
    #[strum(serialize = "sub")]
    Sub,
    #[strum(serialize = "sbc")]
    Sbc,
    #[strum(serialize = "lsl")]
    Lsl,
    #[strum(serialize = "lsr")]
    Lsr,
    #[strum(serialize = "asr")]
    Asr,
    #[strum(serialize = "rol")]
    Rol,
    #[strum(serialize = "rlc")]
    Rlc,
    #[strum(serialize = "ror")]
    Ror,
    #[strum(serialize = "rrc")]
    Rrc,
    #[strum(serialize = "mulu")]
    Mulu,
    #[strum(serialize = "muls")]
    Muls,
    #[strum(serialize = "and")]
    And,
    #[strum(serialize = "or")]
    Or,
    #[strum(serialize = "xor")]
    Xor,
    #[strum(serialize = "abs")]
    Abs,
    #[strum(serialize = "cmp")]
    Cmp,
    #[strum(serialize = "sext")]
    Sext,
    #[strum(serialize = "ocall")]
    Ocall,
    #[strum(serialize = "ccall")]
    Ccall,
    #[strum(serialize = "pcall")]
    Pcall,
    #[strum(serialize = "cycles")]
    Cycles,
    #[strum(serialize = "addsize")]
    AddSize,
    #[strum(serialize = "decsize")]
    DecSize,
    #[strum(serialize = "xchg")]
    Xchg,
    #[strum(serialize = "dispatch")]
    Dispatch,
    #[strum(serialize = "update_flags")]
    UpdateFlags,
    #[strum(serialize = "update_sync")]
    UpdateSync,
    #[strum(serialize = "break")]
    Break,
}

/// A pure evaluator over folded operands.
#[derive(Clone, Copy)]
pub struct Eval {
    /// How many leading parameters the evaluator consumes.
    pub arity: usize,
    /// The evaluation function.
    pub apply: fn(&[i64]) -> i64,
}

/// Table entry for one operation.
#[derive(Clone, Copy)]
pub struct OpSpec {
    /// Indices of output parameters.
    pub out_op: &'static [usize],
    /// Pure evaluator, when the op can fold.
    pub eval: Option<Eval>,
}

impl OpSpec {
    /// Minimum parameter count implied by the table entry.
    pub fn num_params(&self) -> usize {
        let outs = self.out_op.iter().copied().max().map_or(0, |m| m + 1);
        let args = self.eval.map_or(0, |e| e.arity);
        outs.max(args)
    }
}

const OUT_NONE: &[usize] = &[];
const OUT_1: &[usize] = &[1];
const OUT_2: &[usize] = &[2];
const OUT_BOTH: &[usize] = &[0, 1];

fn ev_mov(p: &[i64]) -> i64 {
    p[0]
}
fn ev_not(p: &[i64]) -> i64 {
    !p[0]
}
fn ev_lnot(p: &[i64]) -> i64 {
    i64::from(p[0] == 0)
}
fn ev_neg(p: &[i64]) -> i64 {
    p[0].wrapping_neg()
}
fn ev_add(p: &[i64]) -> i64 {
    p[0].wrapping_add(p[1])
}
fn ev_sub(p: &[i64]) -> i64 {
    // The table defines subtraction as `b - a`.
    p[1].wrapping_sub(p[0])
}
fn ev_lsl(p: &[i64]) -> i64 {
    p[0].wrapping_shl(p[1] as u32)
}
fn ev_shr(p: &[i64]) -> i64 {
    p[0].wrapping_shr(p[1] as u32)
}
fn ev_mulu(p: &[i64]) -> i64 {
    p[0].wrapping_mul(p[1])
}
fn ev_and(p: &[i64]) -> i64 {
    p[0] & p[1]
}
fn ev_or(p: &[i64]) -> i64 {
    p[0] | p[1]
}
fn ev_xor(p: &[i64]) -> i64 {
    p[0] ^ p[1]
}
fn ev_abs(p: &[i64]) -> i64 {
    p[0].wrapping_abs()
}
fn ev_sext(p: &[i64]) -> i64 {
    let (size, src) = (p[0], p[1]);
    if size == 16 {
        if src & 0x80 != 0 {
            src | 0xFF00
        } else {
            src & 0x7F
        }
    } else if src & 0x8000 != 0 {
        src | 0xFFFF_0000
    } else {
        src & 0x7FFF
    }
}
fn ev_addsize(p: &[i64]) -> i64 {
    p[1] + if p[0] != 0 { 2 * p[0] } else { 1 }
}
fn ev_decsize(p: &[i64]) -> i64 {
    p[1] - if p[0] != 0 { 2 * p[0] } else { 1 }
}

/// The table entry for `kind`.
pub fn op_spec(kind: OpKind) -> OpSpec {
    let eval1 = |apply| Some(Eval { arity: 1, apply });
    let eval2 = |apply| Some(Eval { arity: 2, apply });
    match kind {
        OpKind::Mov => OpSpec {
            out_op: OUT_1,
            eval: eval1(ev_mov),
        },
        OpKind::Not => OpSpec {
            out_op: OUT_1,
            eval: eval1(ev_not),
        },
        OpKind::Lnot => OpSpec {
            out_op: OUT_1,
            eval: eval1(ev_lnot),
        },
        OpKind::Neg => OpSpec {
            out_op: OUT_1,
            eval: eval1(ev_neg),
        },
        OpKind::Abs => OpSpec {
            out_op: OUT_1,
            eval: eval1(ev_abs),
        },
        OpKind::Add => OpSpec {
            out_op: OUT_2,
            eval: eval2(ev_add),
        },
        OpKind::Sub => OpSpec {
            out_op: OUT_2,
            eval: eval2(ev_sub),
        },
        OpKind::Lsl => OpSpec {
            out_op: OUT_2,
            eval: eval2(ev_lsl),
        },
        OpKind::Lsr | OpKind::Asr => OpSpec {
            out_op: OUT_2,
            eval: eval2(ev_shr),
        },
        OpKind::Mulu => OpSpec {
            out_op: OUT_2,
            eval: eval2(ev_mulu),
        },
        OpKind::And => OpSpec {
            out_op: OUT_2,
            eval: eval2(ev_and),
        },
        OpKind::Or => OpSpec {
            out_op: OUT_2,
            eval: eval2(ev_or),
        },
        OpKind::Xor => OpSpec {
            out_op: OUT_2,
            eval: eval2(ev_xor),
        },
        OpKind::Sext => OpSpec {
            out_op: OUT_2,
            eval: eval2(ev_sext),
        },
        OpKind::AddSize => OpSpec {
            out_op: OUT_2,
            eval: eval2(ev_addsize),
        },
        OpKind::DecSize => OpSpec {
            out_op: OUT_2,
            eval: eval2(ev_decsize),
        },
        OpKind::Adc
        | OpKind::Sbc
        | OpKind::Rol
        | OpKind::Rlc
        | OpKind::Ror
        | OpKind::Rrc
        | OpKind::Muls => OpSpec {
            out_op: OUT_2,
            eval: None,
        },
        OpKind::Xchg => OpSpec {
            out_op: OUT_BOTH,
            eval: None,
        },
        OpKind::Cmp
        | OpKind::Ocall
        | OpKind::Ccall
        | OpKind::Pcall
        | OpKind::Cycles
        | OpKind::Dispatch
        | OpKind::UpdateFlags
        | OpKind::UpdateSync
        | OpKind::Break => OpSpec {
            out_op: OUT_NONE,
            eval: None,
        },
    }
}

bitflags! {
    /// Which expensive flag calculations the next `update_flags` needs.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct Needs: u8 {
        const CARRY = 1;
        const HALF = 1 << 1;
        const OVERFLOW = 1 << 2;
    }
}

fn size_code(param: &Param) -> u32 {
    match param {
        Param::Int(0) => 8,
        Param::Int(1) => 16,
        _ => 32,
    }
}

fn masked_param(param: &Param, param_size: u32, size: u32) -> Param {
    if param_size <= size {
        return param.clone();
    }
    let mask = bit_mask(size);
    match param {
        Param::Int(value) => Param::Int(value & mask as i64),
        Param::Expr(expr) => Param::Expr(format!("({expr} & {mask})")),
    }
}

fn insufficient(op: &str, raw: &[String]) -> Error {
    Error::InsufficientParams {
        op: op.to_owned(),
        params: raw.join(", "),
    }
}

impl<'p> Generator<'p> {
    pub(crate) fn needs_of(&self, updates: Option<&FlagUpdate>) -> Result<Needs> {
        let mut needs = Needs::empty();
        let Some(update) = updates else {
            return Ok(needs);
        };
        for &flag in &update.auto {
            let calc = self
                .prog
                .flags
                .get(flag)
                .ok_or(Error::UndefinedFlag(flag))?
                .calc;
            match calc {
                FlagCalc::Carry => needs |= Needs::CARRY,
                FlagCalc::HalfCarry => needs |= Needs::HALF,
                FlagCalc::Overflow => needs |= Needs::OVERFLOW,
                _ => {}
            }
        }
        Ok(needs)
    }

    fn sized(&mut self, dest_size: u32, size_param: Option<&Param>) -> (u32, bool) {
        self.size_adjust = None;
        match size_param {
            Some(param) => {
                let size = size_code(param);
                (size, dest_size > size)
            }
            None => (dest_size, false),
        }
    }

    fn emit_binary(
        &mut self,
        cop: &str,
        proc: &[Param],
        raw: &[String],
        updates: Option<&FlagUpdate>,
    ) -> Result<String> {
        let (a_param, b_param) = if cop == "-" {
            (&proc[1], &proc[0])
        } else {
            (&proc[0], &proc[1])
        };
        let mut a = a_param.to_string();
        let mut b = b_param.to_string();
        let dest_size = self.param_size(&raw[2]);
        let (size, adjust) = self.sized(dest_size, proc.get(3));
        self.last_size = Some(size);
        let needs = self.needs_of(updates)?;
        let dst;
        if !needs.is_empty() || (updates.is_some() && adjust) {
            let mut tmp_size = size;
            if needs.contains(Needs::CARRY) && cop != ">>" {
                tmp_size *= 2;
            }
            let name = self.get_temp(tmp_size);
            self.carry_flow_dst = Some(name.clone());
            self.size_adjust = adjust.then_some(size);
            self.last_a = Some(a_param.clone());
            self.last_b = Some(b_param.clone());
            if tmp_size == 64 {
                a = format!("((uint64_t){a})");
                b = format!("((uint64_t){b})");
            }
            self.last_b_flow = Some(if cop == "-" {
                Param::Expr(b.clone())
            } else {
                Param::Expr(format!("(~{b})"))
            });
            dst = name;
        } else if adjust {
            let name = self.get_temp(size);
            let real = proc[2].to_string();
            let mask = bit_mask(size);
            return Ok(format!(
                "\n\t{name} = ({a} & {mask}) {cop} ({b} & {mask});\n\t{real} = ({real} & ~{mask}) | {name};"
            ));
        } else {
            dst = proc[2].to_string();
        }
        if adjust {
            let mask = bit_mask(size);
            Ok(format!("\n\t{dst} = ({a} & {mask}) {cop} ({b} & {mask});"))
        } else {
            Ok(format!("\n\t{dst} = {a} {cop} {b};"))
        }
    }

    fn emit_unary(
        &mut self,
        cop: &str,
        proc: &[Param],
        raw: &[String],
        updates: Option<&FlagUpdate>,
    ) -> Result<String> {
        let a = proc[0].to_string();
        let mut dst = proc[1].to_string();
        let dest_size = self.param_size(&raw[1]);
        let (size, adjust) = self.sized(dest_size, proc.get(2));
        self.last_size = Some(size);
        if cop == "-" {
            let needs = self.needs_of(updates)?;
            if !needs.is_empty() || (updates.is_some() && adjust) {
                let name = self.get_temp(size);
                self.carry_flow_dst = Some(name.clone());
                self.size_adjust = adjust.then_some(size);
                self.last_a = Some(Param::Int(0));
                self.last_b = Some(proc[0].clone());
                self.last_b_flow = Some(proc[0].clone());
                if adjust {
                    let mask = bit_mask(size);
                    return Ok(format!("\n\t{name} = {cop}({a} & {mask});"));
                }
                dst = name;
            }
        }
        if adjust {
            let mask = bit_mask(size);
            Ok(format!(
                "\n\t{dst} = ({dst} & ~{mask}) | (({cop}{a}) & {mask});"
            ))
        } else {
            Ok(format!("\n\t{dst} = {cop}{a};"))
        }
    }

    /// The C expression reading the declared carry flag's storage.
    pub(crate) fn carry_check(&mut self, op: &'static str) -> Result<String> {
        let flag = self
            .prog
            .flags
            .carry_flag()
            .cloned()
            .ok_or(Error::MissingCarryFlag(op))?;
        let empty = FieldVals::new();
        Ok(match &flag.storage {
            cinder_dsl::flags::FlagStorage::Bit(reg, bit) => {
                let reg = self.resolve_reg(reg, &empty, false, false);
                format!("({reg} & 1 << {bit})")
            }
            cinder_dsl::flags::FlagStorage::Reg(reg) => {
                self.resolve_reg(reg, &empty, false, false)
            }
        })
    }

    fn emit_adc_sbc(
        &mut self,
        is_sbc: bool,
        proc: &[Param],
        raw: &[String],
        updates: Option<&FlagUpdate>,
    ) -> Result<String> {
        let dest_size = self.param_size(&raw[2]);
        let (size, adjust) = self.sized(dest_size, proc.get(3));
        self.last_size = Some(size);
        let needs = self.needs_of(updates)?;
        let carry = self.carry_check(if is_sbc { "sbc" } else { "adc" })?;
        let opc = if is_sbc { '-' } else { '+' };
        let mask = bit_mask(size);
        let (src_a, src_b, raw_a, raw_b) = if is_sbc {
            (&proc[1], &proc[0], &raw[1], &raw[0])
        } else {
            (&proc[0], &proc[1], &raw[0], &raw[1])
        };
        let a_param = masked_param(src_a, self.param_size(raw_a), size);
        let b_param = masked_param(src_b, self.param_size(raw_b), size);
        let mut a = a_param.to_string();
        let mut b = b_param.to_string();
        let mut vals = "1 : 0".to_owned();
        let dst;
        if !needs.is_empty() || (updates.is_some() && adjust) {
            let mut tmp_size = size;
            if needs.contains(Needs::CARRY) {
                tmp_size *= 2;
            }
            let name = self.get_temp(tmp_size);
            self.carry_flow_dst = Some(name.clone());
            self.size_adjust = adjust.then_some(size);
            self.last_a = Some(a_param.clone());
            self.last_b = Some(b_param.clone());
            self.last_b_flow = Some(if is_sbc {
                b_param.clone()
            } else {
                Param::Expr(format!("(~{b})"))
            });
            if tmp_size == 64 {
                a = format!("((uint64_t){a})");
                b = format!("((uint64_t){b})");
                vals = "((uint64_t)1) : ((uint64_t)0)".to_owned();
            }
            dst = name;
        } else if adjust {
            let name = self.get_temp(size);
            let real = proc[2].to_string();
            return Ok(format!(
                "\n\t{name} = {a} {opc} {b} {opc} ({carry} ? 1 : 0);\n\t{real} = ({real} & ~{mask}) | {name};"
            ));
        } else {
            dst = proc[2].to_string();
        }
        Ok(format!("\n\t{dst} = {a} {opc} {b} {opc} ({carry} ? {vals});"))
    }

    fn emit_asr(
        &mut self,
        proc: &[Param],
        raw: &[String],
        updates: Option<&FlagUpdate>,
    ) -> Result<String> {
        let needs_carry = self.needs_of(updates)?.contains(Needs::CARRY);
        let dest_size = self.param_size(&raw[2]);
        let (size, adjust) = self.sized(dest_size, proc.get(3));
        self.last_size = Some(size);
        let sign = 1u64 << (size - 1);
        let a = proc[0].to_string();
        let b = proc[1].to_string();
        if needs_carry {
            let name = self.get_temp(size);
            self.carry_flow_dst = Some(name.clone());
            self.size_adjust = adjust.then_some(size);
            self.last_a = Some(proc[0].clone());
            self.last_b = Some(proc[1].clone());
            if adjust {
                let size_mask = bit_mask(size);
                return Ok(format!(
                    "\n\t{name} = (({a} & {size_mask}) >> ({b} & {size_mask})) | (({a} & {sign}) && {b} ? 0xFFFFFFFFU << ({size} - ({b} & {size_mask})) : 0);"
                ));
            }
            return Ok(format!(
                "\n\t{name} = ({a} >> {b}) | (({a} & {sign}) && {b} ? 0xFFFFFFFFU << ({size} - {b}) : 0);"
            ));
        }
        if adjust {
            let name = self.get_temp(size);
            let size_mask = bit_mask(size);
            let dst = proc[2].to_string();
            return Ok(format!(
                "\n\t{name} = (({a} & {size_mask}) >> ({b} & {size_mask})) | (({a} & {sign}) && {b} ? 0xFFFFFFFFU << ({size} - ({b} & {size_mask})) : 0);\n\t{dst} = ({dst} & ~{size_mask}) | {name};"
            ));
        }
        let dst = proc[2].to_string();
        Ok(format!(
            "\n\t{dst} = ({a} >> {b}) | (({a} & {sign}) && {b} ? 0xFFFFFFFFU << ({size} - {b}) : 0);"
        ))
    }

    fn emit_rot(
        &mut self,
        is_ror: bool,
        proc: &[Param],
        raw: &[String],
        updates: Option<&FlagUpdate>,
    ) -> Result<String> {
        let needs_carry = self.needs_of(updates)?.contains(Needs::CARRY);
        let dest_size = self.param_size(&raw[2]);
        let (size, adjust) = self.sized(dest_size, proc.get(3));
        self.last_size = Some(size);
        let rot_mask = size - 1;
        let mut out = String::new();
        let b = match &proc[1] {
            Param::Int(value) => Param::Int(value & rot_mask as i64),
            Param::Expr(_) => {
                let amount_size = self.param_size(&raw[1]);
                let masked = self.get_temp(amount_size);
                out.push_str(&format!("\n\t{masked} = {} & {rot_mask};", proc[1]));
                Param::Expr(masked)
            }
        };
        self.last_b = Some(b.clone());
        self.last_b_unmasked = Some(proc[1].clone());
        let a = if self.param_size(&raw[0]) > size {
            format!("({} & {})", proc[0], bit_mask(size))
        } else {
            proc[0].to_string()
        };
        let dst = if adjust {
            let name = self.get_temp(size);
            self.carry_flow_dst = Some(name.clone());
            if needs_carry {
                self.size_adjust = Some(size);
            }
            name
        } else {
            proc[2].to_string()
        };
        if is_ror {
            out.push_str(&format!("\n\t{dst} = {a} >> {b} | {a} << ({size} - {b});"));
        } else {
            out.push_str(&format!("\n\t{dst} = {a} << {b} | {a} >> ({size} - {b});"));
        }
        if adjust && !needs_carry {
            let mask = bit_mask(size);
            let real = proc[2].to_string();
            out.push_str(&format!("\n\t{real} = ({real} & ~{mask}) | ({dst} & {mask});"));
        }
        Ok(out)
    }

    fn emit_rot_carry(
        &mut self,
        is_rrc: bool,
        proc: &[Param],
        raw: &[String],
        updates: Option<&FlagUpdate>,
    ) -> Result<String> {
        let needs_carry = self.needs_of(updates)?.contains(Needs::CARRY);
        let dest_size = self.param_size(&raw[2]);
        let (size, adjust) = self.sized(dest_size, proc.get(3));
        self.last_size = Some(size);
        let carry = self.carry_check(if is_rrc { "rrc" } else { "rlc" })?;
        let a_param = if self.param_size(&raw[0]) > size {
            Param::Expr(format!("({} & {})", proc[0], bit_mask(size)))
        } else {
            proc[0].clone()
        };
        let mut a = a_param.to_string();
        let dst = if needs_carry || adjust {
            let name = self.get_temp(size);
            self.carry_flow_dst = Some(name.clone());
            if needs_carry && adjust {
                self.size_adjust = Some(size);
            }
            self.last_a = Some(a_param.clone());
            self.last_b = Some(proc[1].clone());
            name
        } else {
            proc[2].to_string()
        };
        // A full-word rotate through carry may shift by the whole word.
        if size == 32 && proc[1].as_int().map_or(true, |v| v <= 1) {
            a = format!("((uint64_t){a})");
        }
        let b = proc[1].to_string();
        let mut out = if is_rrc {
            format!(
                "\n\t{dst} = {a} >> {b} | {a} << ({size} + 1 - {b}) | ({carry} ? 1 : 0) << ({size}-{b});"
            )
        } else {
            format!(
                "\n\t{dst} = {a} << {b} | {a} >> ({size} + 1 - {b}) | ({carry} ? 1 : 0) << ({b} - 1);"
            )
        };
        if adjust && !needs_carry {
            let mask = bit_mask(size);
            let real = proc[2].to_string();
            out.push_str(&format!("\n\t{real} = ({real} & ~{mask}) | ({dst} & {mask});"));
        }
        Ok(out)
    }

    fn emit_cmp(
        &mut self,
        proc: &[Param],
        raw: &[String],
        updates: Option<&FlagUpdate>,
    ) -> Result<String> {
        if proc.len() < 2 {
            return Err(insufficient("cmp", raw));
        }
        let b_size = self.param_size(&raw[1]);
        let mut size = b_size;
        let needs_carry = self.needs_of(updates)?.contains(Needs::CARRY);
        if let Some(code) = proc.get(2) {
            size = size_code(code);
        }
        self.last_size = Some(size);
        self.size_adjust = None;
        let full = if needs_carry { size * 2 } else { size };
        let tmpvar = format!("cmp_tmp{full}__");
        if updates.is_some() {
            self.carry_flow_dst = Some(tmpvar.clone());
            self.last_a = Some(proc[1].clone());
            self.last_b = Some(proc[0].clone());
            self.last_b_flow = Some(proc[0].clone());
        }
        if !self.root_has_local(&tmpvar) {
            self.add_root_local(&tmpvar, full);
        }
        self.last_dst = Some(raw[1].clone());
        let mut a = proc[0].to_string();
        let mut b = proc[1].to_string();
        let a_size = self.param_size(&raw[0]);
        if size != a_size {
            a = format!("(({a}) & {})", bit_mask(size));
        }
        if size != b_size {
            b = format!("(({b}) & {})", bit_mask(size));
        }
        if full == 64 {
            a = format!("((uint64_t){a})");
            b = format!("((uint64_t){b})");
        }
        Ok(format!("\n\t{tmpvar} = {b} - {a};"))
    }

    fn emit_sext(&mut self, proc: &[Param], raw: &[String]) -> Result<String> {
        let to = proc[0].as_int().ok_or(Error::SextNonConstWidth)?;
        if to != 16 && to != 32 {
            return Err(Error::SextBadWidth);
        }
        let to = to as u32;
        let from = to >> 1;
        let src_mask = bit_mask(from);
        let dst_mask = bit_mask(to);
        let src = if self.param_size(&raw[1]) > from {
            match &proc[1] {
                Param::Int(value) => (value & src_mask as i64).to_string(),
                Param::Expr(expr) => format!("({expr} & {src_mask})"),
            }
        } else {
            proc[1].to_string()
        };
        let sign_bit = 1u64 << (from - 1);
        let extend = (0xFFFF_FFFFu64 << from) & dst_mask;
        self.last_size = Some(to);
        let dst = proc[2].to_string();
        if self.param_size(&raw[2]) > to {
            Ok(format!(
                "\n\t{dst} = ({dst} & ~{dst_mask}) | ({src} & {sign_bit} ? {src} | {extend} : {src});"
            ))
        } else {
            Ok(format!(
                "\n\t{dst} = {src} & {sign_bit} ? {src} | {extend} : {src};"
            ))
        }
    }

    fn emit_mul(&mut self, signed: bool, proc: &[Param], raw: &[String]) -> Result<String> {
        let mut p0_size = self.param_size(&raw[0]);
        let mut p1_size = self.param_size(&raw[1]);
        let dest_size = self.param_size(&raw[2]);
        let size = match proc.get(3) {
            Some(code) => size_code(code),
            None => dest_size,
        };
        self.last_size = Some(size);
        if p0_size >= size {
            p0_size = size / 2;
        }
        if p1_size >= size {
            p1_size = size / 2;
        }
        let dst = proc[2].to_string();
        if signed {
            Ok(format!(
                "\n\t{dst} = (int{size}_t)(((int{p0_size}_t){}) * ((int{p1_size}_t){}));",
                proc[0], proc[1]
            ))
        } else {
            let m0 = bit_mask(p0_size);
            let m1 = bit_mask(p1_size);
            Ok(format!(
                "\n\t{dst} = ((uint{size}_t)({} & {m0})) * ((uint{size}_t)({} & {m1}));",
                proc[0], proc[1]
            ))
        }
    }

    fn emit_dispatch(&mut self, proc: &[Param], raw: &[String]) -> Result<String> {
        if proc.is_empty() {
            return Err(insufficient("dispatch", raw));
        }
        let table = proc
            .get(1)
            .map(ToString::to_string)
            .unwrap_or_else(|| "main".to_owned());
        match self.dispatch {
            crate::generator::Dispatch::Call => Ok(format!(
                "\n\timpl_{table}[{}](context, target_cycle);",
                proc[0]
            )),
            crate::generator::Dispatch::Goto => {
                Ok(format!("\n\tgoto *impl_{table}[{}];", proc[0]))
            }
            crate::generator::Dispatch::Switch => {
                Err(Error::UnsupportedDispatch("switch".to_owned()))
            }
        }
    }

    /// Emit one operation. `proc` are the resolved parameters, `raw` the
    /// source tokens, `updates` the peeked flag-update set.
    pub(crate) fn emit_op(
        &mut self,
        kind: OpKind,
        proc: &[Param],
        raw: &[String],
        updates: Option<&FlagUpdate>,
    ) -> Result<String> {
        match kind {
            OpKind::Mov => self.emit_unary("", proc, raw, updates),
            OpKind::Not => self.emit_unary("~", proc, raw, updates),
            OpKind::Lnot => self.emit_unary("!", proc, raw, updates),
            OpKind::Neg => self.emit_unary("-", proc, raw, updates),
            OpKind::Add => self.emit_binary("+", proc, raw, updates),
            OpKind::Sub => self.emit_binary("-", proc, raw, updates),
            OpKind::And => self.emit_binary("&", proc, raw, updates),
            OpKind::Or => self.emit_binary("|", proc, raw, updates),
            OpKind::Xor => self.emit_binary("^", proc, raw, updates),
            OpKind::Lsl => self.emit_binary("<<", proc, raw, updates),
            OpKind::Lsr => self.emit_binary(">>", proc, raw, updates),
            OpKind::Adc => self.emit_adc_sbc(false, proc, raw, updates),
            OpKind::Sbc => self.emit_adc_sbc(true, proc, raw, updates),
            OpKind::Asr => self.emit_asr(proc, raw, updates),
            OpKind::Rol => self.emit_rot(false, proc, raw, updates),
            OpKind::Ror => self.emit_rot(true, proc, raw, updates),
            OpKind::Rlc => self.emit_rot_carry(false, proc, raw, updates),
            OpKind::Rrc => self.emit_rot_carry(true, proc, raw, updates),
            OpKind::Mulu => self.emit_mul(false, proc, raw),
            OpKind::Muls => self.emit_mul(true, proc, raw),
            OpKind::Abs => Ok(format!("\n\t{} = abs({});", proc[1], proc[0])),
            OpKind::Cmp => self.emit_cmp(proc, raw, updates),
            OpKind::Sext => self.emit_sext(proc, raw),
            OpKind::Ocall => {
                if proc.is_empty() {
                    return Err(insufficient("ocall", raw));
                }
                let args = std::iter::once("context".to_owned())
                    .chain(proc[1..].iter().map(ToString::to_string))
                    .join(", ");
                Ok(format!("\n\t{}{}({args});", self.prefix, proc[0]))
            }
            OpKind::Ccall => {
                if proc.is_empty() {
                    return Err(insufficient("ccall", raw));
                }
                let args = proc[1..].iter().map(ToString::to_string).join(", ");
                Ok(format!("\n\t{}({args});", proc[0]))
            }
            OpKind::Pcall => {
                if proc.len() < 2 {
                    return Err(insufficient("pcall", raw));
                }
                let args = proc[2..].iter().map(ToString::to_string).join(", ");
                Ok(format!("\n\t(({}){})({args});", proc[1], proc[0]))
            }
            OpKind::Cycles => {
                if proc.is_empty() {
                    return Err(insufficient("cycles", raw));
                }
                Ok(format!(
                    "\n\tcontext->cycles += context->opts->gen.clock_divider * {};",
                    proc[0]
                ))
            }
            OpKind::AddSize => Ok(format!(
                "\n\t{} = {} + ({sz} ? {sz} * 2 : 1);",
                proc[2],
                proc[1],
                sz = proc[0]
            )),
            OpKind::DecSize => Ok(format!(
                "\n\t{} = {} - ({sz} ? {sz} * 2 : 1);",
                proc[2],
                proc[1],
                sz = proc[0]
            )),
            OpKind::Xchg => {
                let size = self.param_size(&raw[0]);
                let tmp = self.get_temp(size);
                Ok(format!(
                    "\n\t{tmp} = {a};\n\t{a} = {b};\n\t{b} = {tmp};",
                    a = proc[0],
                    b = proc[1]
                ))
            }
            OpKind::Dispatch => self.emit_dispatch(proc, raw),
            OpKind::UpdateFlags => {
                let spec = proc.first().ok_or_else(|| insufficient("update_flags", raw))?;
                let spec = spec.to_string();
                self.emit_update_flags(&spec)
            }
            OpKind::UpdateSync => {
                let sync = self.sync_cycle.clone().ok_or(Error::MissingSyncCycle)?;
                Ok(format!("\n\t{sync}(context, target_cycle);"))
            }
            OpKind::Break => Ok("\n\tbreak;".to_owned()),
        }
    }

    /// Generate one plain operation: resolve parameters, fold when every
    /// evaluator input is constant, otherwise emit and evict the
    /// destinations from the fold map.
    pub(crate) fn gen_normal(
        &mut self,
        op: &NormalOp,
        field_vals: &FieldVals,
        out: &mut Vec<String>,
        updates: Option<&FlagUpdate>,
    ) -> Result<()> {
        let kind = OpKind::from_str(&op.op).ok();
        if kind == Some(OpKind::Xchg) {
            return self.gen_xchg(op, field_vals, out);
        }
        let is_sub = self.prog.subroutine(&op.op).is_some();
        let mut all_const = updates.is_none() && !self.conditional;
        let mut proc: Vec<Param> = Vec::with_capacity(op.params.len());
        for (idx, param) in op.params.iter().enumerate() {
            let is_dst = kind.map_or(false, |k| op_spec(k).out_op.contains(&idx));
            let allow_const = (is_sub || !is_dst) && self.reg_values.contains_key(param.as_str());
            let resolved = self.resolve_param(param, field_vals, true, allow_const, is_dst);
            if !resolved.is_int() && idx != op.params.len() - 1 {
                all_const = false;
            }
            proc.push(resolved);
        }
        if self.need_flag_coalesce {
            let prelude = self.coalesce_flags();
            out.push(prelude);
            self.need_flag_coalesce = false;
        }

        if op.op == "meta" {
            self.gen_meta(op, field_vals)?;
        } else if let Some(kind) = kind {
            let spec = op_spec(kind);
            if spec.num_params() > proc.len() {
                return Err(insufficient(&op.op, &op.params));
            }
            let folded = spec.eval.and_then(|eval| {
                if !all_const {
                    return None;
                }
                if eval.arity >= proc.len() {
                    return Some(Err(Error::InsufficientArgs {
                        op: op.op.clone(),
                        params: op.params.join(", "),
                    }));
                }
                let args: Option<Vec<i64>> =
                    proc[..eval.arity].iter().map(Param::as_int).collect();
                args.map(|args| Ok(((eval.apply)(&args), eval.arity)))
            });
            match folded {
                Some(Err(err)) => return Err(err),
                Some(Ok((result, arity))) => {
                    let mut dst = op.params[arity].clone();
                    while let Some(alias) = self.meta.get(&dst) {
                        dst = alias.clone();
                    }
                    if let Some(local) = self.resolve_local(&dst) {
                        dst = local;
                    }
                    self.reg_values.insert(dst.clone(), result);
                    if self.is_reg(&dst) {
                        let resolved_dst = proc.last().cloned().ok_or_else(|| {
                            insufficient(&op.op, &op.params)
                        })?;
                        let raw_last = op.params.last().cloned().unwrap_or_default();
                        let text = self.emit_unary(
                            "",
                            &[Param::Int(result), resolved_dst],
                            &[result.to_string(), raw_last],
                            None,
                        )?;
                        out.push(text);
                    }
                }
                None => {
                    let text = self.emit_op(kind, &proc, &op.params, updates)?;
                    out.push(text);
                    for &dst_idx in spec.out_op {
                        let Some(dst) = op.params.get(dst_idx) else {
                            continue;
                        };
                        let mut dst = dst.clone();
                        while let Some(alias) = self.meta.get(&dst) {
                            dst = alias.clone();
                        }
                        if let Some(local) = self.resolve_local(&dst) {
                            self.reg_values.remove(&local);
                        }
                        self.reg_values.remove(&dst);
                    }
                    if matches!(kind, OpKind::Ocall | OpKind::Ccall | OpKind::Pcall) {
                        let clobbered: Vec<String> = self
                            .reg_values
                            .keys()
                            .filter(|name| self.is_reg(name))
                            .cloned()
                            .collect();
                        for name in clobbered {
                            self.reg_values.remove(&name);
                        }
                    }
                }
            }
        } else if is_sub {
            let prog = self.prog;
            if let Some(sub) = prog.subroutine(&op.op) {
                let call_params = self.sub_call_params(&op.params, field_vals);
                self.inline_sub(sub, &call_params, out)?;
            }
        } else {
            let args = proc.iter().map(ToString::to_string).join(", ");
            out.push(format!("\n\t{}({args});", op.op));
        }
        self.last_op = Some(LastOp {
            op: op.op.clone(),
            params: op.params.clone(),
        });
        Ok(())
    }

    fn gen_meta(&mut self, op: &NormalOp, field_vals: &FieldVals) -> Result<()> {
        if op.params.len() < 2 {
            return Err(insufficient("meta", &op.params));
        }
        let target = &op.params[1];
        let value = if let Some((begin, index)) = target.split_once('.') {
            let mut index = self
                .resolve_local(index)
                .unwrap_or_else(|| index.to_owned());
            if let Some(bound) = field_vals.get(&index) {
                index = bound.to_string();
            }
            format!("{begin}.{index}")
        } else {
            let name = self
                .resolve_local(target)
                .unwrap_or_else(|| target.clone());
            match field_vals.get(&name) {
                Some(bound) => bound.to_string(),
                None => name,
            }
        };
        self.meta.insert(op.params[0].clone(), value);
        Ok(())
    }

    /// Exchange folds completely when both sides are known, partially when
    /// one is, and falls back to a three-move swap through a temporary.
    fn gen_xchg(
        &mut self,
        op: &NormalOp,
        field_vals: &FieldVals,
        out: &mut Vec<String>,
    ) -> Result<()> {
        if op.params.len() < 2 {
            return Err(insufficient("xchg", &op.params));
        }
        let a = self.resolve_param(&op.params[0], field_vals, true, true, false);
        let b = self.resolve_param(&op.params[1], field_vals, true, true, false);
        let dst_a = self.resolve_param(&op.params[0], field_vals, true, false, true);
        let dst_b = self.resolve_param(&op.params[1], field_vals, true, false, true);
        let (Param::Expr(dst_a), Param::Expr(dst_b)) = (&dst_a, &dst_b) else {
            return Err(Error::XchgConstOperand);
        };
        let key_a = dst_a.strip_prefix("context->").unwrap_or(dst_a).to_owned();
        let key_b = dst_b.strip_prefix("context->").unwrap_or(dst_b).to_owned();
        let mov = |gen: &mut Self, value: &Param, dst: &str, raw_src: &str, raw_dst: &str| {
            gen.emit_unary(
                "",
                &[value.clone(), Param::Expr(dst.to_owned())],
                &[raw_src.to_owned(), raw_dst.to_owned()],
                None,
            )
        };
        match (&a, &b) {
            (Param::Int(va), Param::Int(vb)) => {
                self.reg_values.insert(key_a.clone(), *vb);
                self.reg_values.insert(key_b.clone(), *va);
                if self.is_reg(&key_a) {
                    let text = mov(self, &b, dst_a, &op.params[1], &op.params[0])?;
                    out.push(text);
                }
                if self.is_reg(&key_b) {
                    let text = mov(self, &a, dst_b, &op.params[0], &op.params[1])?;
                    out.push(text);
                }
            }
            (Param::Int(va), Param::Expr(_)) => {
                self.reg_values.insert(key_b.clone(), *va);
                self.reg_values.remove(&key_a);
                let text = mov(self, &b, dst_a, &op.params[1], &op.params[0])?;
                out.push(text);
                if self.is_reg(&key_b) {
                    let text = mov(self, &a, dst_b, &op.params[0], &op.params[1])?;
                    out.push(text);
                }
            }
            (Param::Expr(_), Param::Int(vb)) => {
                self.reg_values.insert(key_a.clone(), *vb);
                self.reg_values.remove(&key_b);
                let text = mov(self, &a, dst_b, &op.params[0], &op.params[1])?;
                out.push(text);
                if self.is_reg(&key_a) {
                    let text = mov(self, &b, dst_a, &op.params[1], &op.params[0])?;
                    out.push(text);
                }
            }
            (Param::Expr(_), Param::Expr(_)) => {
                let proc = [Param::Expr(dst_a.clone()), Param::Expr(dst_b.clone())];
                let text = self.emit_op(OpKind::Xchg, &proc, &op.params, None)?;
                out.push(text);
                self.reg_values.remove(&key_a);
                self.reg_values.remove(&key_b);
                self.reg_values.remove(&op.params[0]);
                self.reg_values.remove(&op.params[1]);
            }
        }
        self.last_op = Some(LastOp {
            op: op.op.clone(),
            params: op.params.clone(),
        });
        Ok(())
    }

    fn sub_call_params(&mut self, params: &[String], field_vals: &FieldVals) -> Vec<Param> {
        let mut call_params = Vec::with_capacity(params.len());
        for param in params {
            if let Some((begin, end)) = param.split_once('.') {
                if let Some(bound) = field_vals.get(end) {
                    call_params.push(Param::Expr(format!("{begin}.{bound}")));
                } else {
                    call_params.push(Param::Expr(param.clone()));
                }
            } else if let Some(bound) = field_vals.get(param) {
                call_params.push(bound.clone());
            } else {
                let folded = self
                    .resolve_local(param)
                    .and_then(|local| self.reg_values.get(&local).copied());
                match folded {
                    Some(value) => call_params.push(Param::Int(value)),
                    None => call_params.push(Param::Expr(param.clone())),
                }
            }
        }
        call_params
    }

    /// Inline a subroutine body at the call site, binding arguments into
    /// the field-value map and qualifying its locals.
    pub(crate) fn inline_sub(
        &mut self,
        sub: &cinder_dsl::program::SubRoutine,
        params: &[Param],
        out: &mut Vec<String>,
    ) -> Result<()> {
        if params.len() != sub.args.len() {
            return Err(Error::ArgCount {
                sub: sub.name.clone(),
                expected: sub.args.len(),
                got: params.len(),
            });
        }
        let mut arg_values = FieldVals::new();
        for ((name, _), value) in sub.args.iter().zip(params) {
            arg_values.insert(name.clone(), value.clone());
        }
        self.push_frame(Frame::sub_root(sub));
        for (name, size) in &sub.locals {
            out.push(format!("\n\tuint{size}_t {}_{name};", sub.name));
        }
        let result = self.process_ops(&sub.implementation, &arg_values, out);
        self.pop_frame();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn mnemonics_round_trip() {
        for kind in OpKind::iter() {
            let name = kind.to_string();
            assert_eq!(OpKind::from_str(&name).unwrap(), kind);
        }
    }

    #[test]
    fn table_arities() {
        assert_eq!(op_spec(OpKind::Mov).num_params(), 2);
        assert_eq!(op_spec(OpKind::Add).num_params(), 3);
        assert_eq!(op_spec(OpKind::Xchg).num_params(), 2);
        assert_eq!(op_spec(OpKind::Cmp).num_params(), 0);
        assert!(op_spec(OpKind::Adc).eval.is_none());
    }

    #[test]
    fn sub_eval_is_reversed() {
        // `a = b - c` resolves as (c, b, a): the evaluator computes b - c.
        let eval = op_spec(OpKind::Sub).eval.unwrap();
        assert_eq!((eval.apply)(&[3, 10]), 7);
    }

    #[test]
    fn sext_eval_matches_reference() {
        let eval = op_spec(OpKind::Sext).eval.unwrap();
        assert_eq!((eval.apply)(&[16, 0x80]), 0xFF80);
        assert_eq!((eval.apply)(&[16, 0x7F]), 0x7F);
        assert_eq!((eval.apply)(&[32, 0x8000]), 0xFFFF_8000);
        assert_eq!((eval.apply)(&[32, 0x7FFF]), 0x7FFF);
    }
}
