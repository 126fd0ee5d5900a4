//! Flag synthesis, coalesce and disperse
//!
//! `update_flags "SZh0C"` names flags to recompute from the last op (a
//! bare letter) and flags to force to a literal (letter followed by 0/1).
//! Each auto flag's calc kind drives the synthesized expression; flags
//! whose storage bit coincides with the result bit are direct-copied in
//! grouped masked assignments. When the last result was staged into a
//! widened temporary, the flag pass commits it back to the real
//! destination afterwards (except for `cmp`, which has no destination).
//!
//! Because flags may live in per-bit scalars while the guest observes one
//! packed status register, a coalesce prelude materializes the packed view
//! before it is read and a disperse postlude scatters it back after it is
//! written.

use cinder_dsl::flags::{Flag, FlagBits, FlagCalc, FlagStorage};

use crate::error::{Error, Result};
use crate::generator::{bit_mask, FieldVals, Generator, Param};

enum ResultBit {
    Num(i64),
    Expr(String),
}

fn set_explicit(explicit: &mut Vec<(char, u8)>, flag: char, value: u8) {
    if let Some(entry) = explicit.iter_mut().find(|(name, _)| *name == flag) {
        entry.1 = value;
    } else {
        explicit.push((flag, value));
    }
}

fn push_direct(direct: &mut Vec<((String, String), Vec<i64>)>, key: (String, String), bit: i64) {
    if let Some((_, bits)) = direct.iter_mut().find(|(k, _)| *k == key) {
        bits.push(bit);
    } else {
        direct.push((key, vec![bit]));
    }
}

fn display(param: &Option<Param>) -> String {
    param
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_else(|| "0".to_owned())
}

impl Generator<'_> {
    fn last_op_name(&self) -> String {
        self.last_op
            .as_ref()
            .map(|last| last.op.clone())
            .unwrap_or_default()
    }

    /// Write a literal 0/1 into a flag's storage.
    pub(crate) fn add_explicit_flag(&mut self, out: &mut Vec<String>, flag: &Flag, value: u8) {
        match &flag.storage {
            FlagStorage::Bit(reg, bit) => {
                let reg = self.resolve_expr(reg);
                let bit_val = 1u64 << bit;
                if value != 0 {
                    out.push(format!("\n\t{reg} |= {bit_val};"));
                } else {
                    out.push(format!("\n\t{reg} &= ~{bit_val};"));
                }
            }
            FlagStorage::Reg(reg) => {
                let reg = self.resolve_expr(reg);
                out.push(format!("\n\t{reg} = {value};"));
            }
        }
    }

    /// Generate the body of an `update_flags` op.
    pub(crate) fn emit_update_flags(&mut self, spec: &str) -> Result<String> {
        let update = self.prog.flags.parse_update(spec)?;
        let mut explicit = update.explicit.clone();
        let mut out: Vec<String> = Vec::new();
        let mut direct: Vec<((String, String), Vec<i64>)> = Vec::new();
        let mut parity: Option<FlagStorage> = None;
        let mut parity_size = 0u32;
        let mut parity_src = String::new();
        let mut parity_dst = String::new();

        let last_dst = match &self.carry_flow_dst {
            Some(staged) => staged.clone(),
            None => {
                let raw = self.last_dst.clone().unwrap_or_default();
                let empty = FieldVals::new();
                self.resolve_param(&raw, &empty, true, true, false).to_string()
            }
        };

        let mut flags = Vec::with_capacity(update.auto.len());
        for &name in &update.auto {
            flags.push(
                self.prog
                    .flags
                    .get(name)
                    .cloned()
                    .ok_or(Error::UndefinedFlag(name))?,
            );
        }

        'flags: for flag in flags {
            let size = self.effective_size() as i64;
            match flag.calc {
                FlagCalc::Zero => {
                    let mut res = last_dst.clone();
                    if size as u32 != self.param_size(&res) {
                        res = format!("({res} & {})", bit_mask(size as u32));
                    }
                    match &flag.storage {
                        FlagStorage::Bit(reg, bit) => {
                            let reg = self.resolve_expr(reg);
                            let bit_val = 1u64 << bit;
                            out.push(format!(
                                "\n\t{reg} = {res} ? ({reg} & ~{bit_val}U) : ({reg} | {bit_val}U);"
                            ));
                        }
                        FlagStorage::Reg(reg) => {
                            let reg = self.resolve_expr(reg);
                            out.push(format!("\n\t{reg} = {res} == 0;"));
                        }
                    }
                }
                FlagCalc::Parity => {
                    parity = Some(flag.storage.clone());
                    parity_size = size as u32;
                    match &self.carry_flow_dst {
                        Some(staged) => {
                            parity_src = staged.clone();
                            parity_dst = staged.clone();
                        }
                        None => {
                            parity_src = last_dst.clone();
                            parity_dst = self.get_temp(parity_size);
                        }
                    }
                }
                _ => {
                    let mut my_res = last_dst.clone();
                    let mut after = String::new();
                    let result_bit: ResultBit;
                    match flag.calc {
                        FlagCalc::Sign => result_bit = ResultBit::Num(size - 1),
                        FlagCalc::HalfCarry => {
                            result_bit = ResultBit::Num(size - 4);
                            my_res = format!(
                                "({} ^ {} ^ {last_dst})",
                                display(&self.last_a),
                                display(&self.last_b)
                            );
                        }
                        FlagCalc::Overflow => {
                            result_bit = ResultBit::Num(size - 1);
                            let a = display(&self.last_a);
                            my_res = if self.last_op_name() == "lsl" {
                                format!("({a} ^ {last_dst})")
                            } else {
                                format!(
                                    "((({a} ^ {})) & ({a} ^ {last_dst}))",
                                    display(&self.last_b_flow)
                                )
                            };
                        }
                        FlagCalc::Bit(n) => result_bit = ResultBit::Num(n as i64 + size - 8),
                        FlagCalc::Carry => {
                            let last_op = self.last_op_name();
                            match last_op.as_str() {
                                "asr" | "lsr" | "rrc" | "rlc" => {
                                    let is_rlc = last_op == "rlc";
                                    match self.last_b.clone() {
                                        Some(Param::Int(amount)) => {
                                            if amount == 0 {
                                                set_explicit(&mut explicit, flag.name, 0);
                                                continue 'flags;
                                            }
                                            result_bit = if is_rlc {
                                                ResultBit::Num(size - amount)
                                            } else {
                                                ResultBit::Num(amount - 1)
                                            };
                                        }
                                        Some(Param::Expr(amount)) => {
                                            out.push(format!("\n\tif (!{amount}) {{"));
                                            self.add_explicit_flag(&mut out, &flag, 0);
                                            out.push("\n\t} else {".to_owned());
                                            after = "\n\t}".to_owned();
                                            result_bit = if is_rlc {
                                                ResultBit::Expr(format!("({size} - {amount})"))
                                            } else {
                                                ResultBit::Expr(format!("({amount} - 1)"))
                                            };
                                        }
                                        None => result_bit = ResultBit::Num(size),
                                    }
                                    my_res = display(&self.last_a);
                                }
                                "rol" | "ror" => {
                                    match self.last_b_unmasked.clone() {
                                        Some(Param::Int(0)) => {
                                            set_explicit(&mut explicit, flag.name, 0);
                                            continue 'flags;
                                        }
                                        Some(Param::Expr(amount)) => {
                                            out.push(format!("\n\tif (!{amount}) {{"));
                                            self.add_explicit_flag(&mut out, &flag, 0);
                                            out.push("\n\t} else {".to_owned());
                                            after = "\n\t}".to_owned();
                                        }
                                        _ => {}
                                    }
                                    result_bit = if last_op == "ror" {
                                        ResultBit::Num(size - 1)
                                    } else {
                                        ResultBit::Num(0)
                                    };
                                }
                                "neg" => {
                                    let mut res = last_dst.clone();
                                    if let Some(staged) = &self.carry_flow_dst {
                                        let real = self.effective_size();
                                        if real != self.param_size(staged) {
                                            res = format!("({res} & {})", bit_mask(real));
                                        }
                                    }
                                    match &flag.storage {
                                        FlagStorage::Bit(reg, bit) => {
                                            let reg = self.resolve_expr(reg);
                                            let bit_val = 1u64 << bit;
                                            out.push(format!(
                                                "\n\t{reg} = {res} ? ({reg} | {bit_val}U) : ({reg} & ~{bit_val}U);"
                                            ));
                                        }
                                        FlagStorage::Reg(reg) => {
                                            let reg = self.resolve_expr(reg);
                                            out.push(format!("\n\t{reg} = {res} != 0;"));
                                        }
                                    }
                                    continue 'flags;
                                }
                                _ => {
                                    if last_op == "lsl" {
                                        match self.last_b.clone() {
                                            Some(Param::Int(0)) => {
                                                set_explicit(&mut explicit, flag.name, 0);
                                                continue 'flags;
                                            }
                                            Some(Param::Expr(amount)) => {
                                                out.push(format!("\n\tif (!{amount}) {{"));
                                                self.add_explicit_flag(&mut out, &flag, 0);
                                                out.push("\n\t} else {".to_owned());
                                                after = "\n\t}".to_owned();
                                            }
                                            _ => {}
                                        }
                                    }
                                    result_bit = ResultBit::Num(size);
                                }
                            }
                        }
                        // Handled by the outer match arms.
                        FlagCalc::Zero | FlagCalc::Parity => continue 'flags,
                    }
                    match &flag.storage {
                        FlagStorage::Bit(reg, storage_bit) => {
                            let sb = *storage_bit as i64;
                            match &result_bit {
                                ResultBit::Num(rb) if *rb == sb => {
                                    push_direct(&mut direct, (reg.clone(), my_res.clone()), *rb);
                                }
                                ResultBit::Num(rb) => {
                                    let reg = self.resolve_expr(reg);
                                    let mask = 1u64 << storage_bit;
                                    let (op, shift) = if *rb > sb {
                                        (">>", rb - sb)
                                    } else {
                                        ("<<", sb - rb)
                                    };
                                    out.push(format!(
                                        "\n\t{reg} = ({reg} & ~{mask}U) | ({my_res} {op} {shift}U & {mask}U);"
                                    ));
                                }
                                ResultBit::Expr(rb) => {
                                    let reg = self.resolve_expr(reg);
                                    let mask = 1u64 << storage_bit;
                                    out.push(format!(
                                        "\n\t{reg} = ({my_res} & (1 << {rb})) ? ({reg} | {mask}U) : ({reg} & ~{mask}U);"
                                    ));
                                }
                            }
                        }
                        FlagStorage::Reg(reg_name) => {
                            let reg = self.resolve_expr(reg_name);
                            let max_bit = self.param_size(reg_name) as i64 - 1;
                            match &result_bit {
                                ResultBit::Expr(rb) => {
                                    out.push(format!("\n\t{reg} = !!({my_res} & (1 << {rb}));"));
                                }
                                ResultBit::Num(rb) if *rb > max_bit => {
                                    let mask = 1u64 << max_bit;
                                    out.push(format!(
                                        "\n\t{reg} = {my_res} >> {} & {mask}U;",
                                        rb - max_bit
                                    ));
                                }
                                ResultBit::Num(rb) => {
                                    let mask = 1u64 << rb;
                                    out.push(format!("\n\t{reg} = {my_res} & {mask}U;"));
                                }
                            }
                        }
                    }
                    if !after.is_empty() {
                        out.push(after);
                    }
                }
            }
        }

        for ((reg, my_res), bits) in &direct {
            let resolved = self.resolve_expr(reg);
            if bits.len() == self.prog.flags.storage_population(reg) {
                out.push(format!("\n\t{resolved} = {my_res};"));
            } else {
                let mask = bits.iter().fold(0u64, |m, b| m | (1u64 << *b as u32));
                out.push(format!(
                    "\n\t{resolved} = ({resolved} & ~{mask}U) | ({my_res} & {mask}U);"
                ));
            }
        }

        if let Some(staged) = self.carry_flow_dst.clone() {
            let is_cmp = self.last_op_name() == "cmp";
            if !is_cmp {
                let raw = self.last_dst.clone().unwrap_or_default();
                let empty = FieldVals::new();
                let dst = self
                    .resolve_param(&raw, &empty, true, true, false)
                    .to_string();
                if let Some(adjust) = self.size_adjust.take() {
                    let mask = bit_mask(adjust);
                    out.push(format!(
                        "\n\t{dst} = ({dst} & ~{mask}) | ({staged} & {mask});"
                    ));
                } else {
                    out.push(format!("\n\t{dst} = {staged};"));
                }
            }
            self.carry_flow_dst = None;
        }

        if let Some(storage) = parity {
            let mut src = parity_src;
            let dst = parity_dst;
            if parity_size > 8 {
                if parity_size > 16 {
                    out.push(format!("\n\t{dst} = {src} ^ ({src} >> 16);"));
                    src = dst.clone();
                }
                out.push(format!("\n\t{dst} = {src} ^ ({src} >> 8);"));
                src = dst.clone();
            }
            out.push(format!("\n\t{dst} = ({src} ^ ({src} >> 4)) & 0xF;"));
            match storage {
                FlagStorage::Bit(reg, bit) => {
                    let reg = self.resolve_expr(&reg);
                    let mask = 1u64 << bit;
                    out.push(format!(
                        "\n\t{reg} = ({reg} & ~{mask}U) | ((0x6996 >> {dst}) << {bit} & {mask}U);"
                    ));
                }
                FlagStorage::Reg(reg) => {
                    let reg = self.resolve_expr(&reg);
                    out.push(format!("\n\t{reg} = 0x9669 >> {dst} & 1;"));
                }
            }
        }

        for (name, value) in explicit {
            let flag = self
                .prog
                .flags
                .get(name)
                .cloned()
                .ok_or(Error::UndefinedFlag(name))?;
            self.add_explicit_flag(&mut out, &flag, value);
        }
        Ok(out.concat())
    }

    /// Materialize the packed status register from per-flag storage.
    pub(crate) fn coalesce_flags(&mut self) -> String {
        let Some(flag_reg) = self.prog.flags.flag_reg.clone() else {
            return String::new();
        };
        let dst = self.resolve_expr(&flag_reg);
        let mut out = vec![format!("\n\t{dst} = 0;")];
        let max_bit = self.prog.flags.max_bit.unwrap_or(0) as usize;
        let flags: Vec<Flag> = self.prog.flags.order().to_vec();
        let mut bit_to_flag: Vec<Option<&Flag>> = vec![None; max_bit + 1];
        for flag in &flags {
            match flag.bits {
                FlagBits::Range(bot, _) => {
                    let src = self.resolve_expr(flag.storage.reg());
                    if bot != 0 {
                        out.push(format!("\n\t{dst} |= {src} << {bot};"));
                    } else {
                        out.push(format!("\n\t{dst} |= {src};"));
                    }
                }
                FlagBits::Single(bit) => bit_to_flag[bit as usize] = Some(flag),
            }
        }
        let mut multi: Vec<(String, Vec<(u32, u32)>)> = Vec::new();
        for bit in (0..=max_bit).rev() {
            let Some(flag) = bit_to_flag[bit] else { continue };
            match &flag.storage {
                FlagStorage::Bit(reg, src_bit) => {
                    if let Some((_, pairs)) = multi.iter_mut().find(|(r, _)| r == reg) {
                        pairs.push((*src_bit, bit as u32));
                    } else {
                        multi.push((reg.clone(), vec![(*src_bit, bit as u32)]));
                    }
                }
                FlagStorage::Reg(reg) => {
                    let src = self.resolve_expr(reg);
                    out.push(format!(
                        "\n\tif ({src}) {{\n\t\t{dst} |= 1 << {bit};\n\t}}"
                    ));
                }
            }
        }
        for (reg, pairs) in &multi {
            let src = self.resolve_expr(reg);
            let mut direct = 0u64;
            for (src_bit, dst_bit) in pairs {
                if src_bit == dst_bit {
                    direct |= 1u64 << src_bit;
                } else {
                    out.push(format!(
                        "\n\tif ({src} & (1 << {src_bit})) {{\n\t\t{dst} |= 1 << {dst_bit};\n\t}}"
                    ));
                }
            }
            if direct != 0 {
                out.push(format!("\n\t{dst} |= {src} & {direct};"));
            }
        }
        out.concat()
    }

    /// Scatter the packed status register back into per-flag storage.
    pub(crate) fn disperse_flags(&mut self) -> String {
        let Some(flag_reg) = self.prog.flags.flag_reg.clone() else {
            return String::new();
        };
        let src = self.resolve_expr(&flag_reg);
        let mut out: Vec<String> = Vec::new();
        let max_bit = self.prog.flags.max_bit.unwrap_or(0) as usize;
        let flags: Vec<Flag> = self.prog.flags.order().to_vec();
        let mut bit_to_flag: Vec<Option<&Flag>> = vec![None; max_bit + 1];
        for flag in &flags {
            match flag.bits {
                FlagBits::Range(bot, top) => {
                    let base_mask = bit_mask(top + 1 - bot);
                    let dst = self.resolve_expr(flag.storage.reg());
                    if bot != 0 {
                        out.push(format!("\n\t{dst} = {src} >> {bot} & {base_mask};"));
                    } else {
                        out.push(format!("\n\t{dst} = {src} & {base_mask};"));
                    }
                }
                FlagBits::Single(bit) => bit_to_flag[bit as usize] = Some(flag),
            }
        }
        let mut multi: Vec<(String, Vec<(u32, u32)>)> = Vec::new();
        for bit in (0..=max_bit).rev() {
            let Some(flag) = bit_to_flag[bit] else { continue };
            match &flag.storage {
                FlagStorage::Bit(reg, dst_bit) => {
                    if let Some((_, pairs)) = multi.iter_mut().find(|(r, _)| r == reg) {
                        pairs.push((*dst_bit, bit as u32));
                    } else {
                        multi.push((reg.clone(), vec![(*dst_bit, bit as u32)]));
                    }
                }
                FlagStorage::Reg(reg) => {
                    let dst = self.resolve_expr(reg);
                    out.push(format!("\n\t{dst} = {src} & {};", 1u64 << bit));
                }
            }
        }
        for (reg, pairs) in &multi {
            let dst = self.resolve_expr(reg);
            let mut did_clear = false;
            let mut direct: Vec<u32> = Vec::new();
            for (dst_bit, bit) in pairs {
                if dst_bit == bit {
                    direct.push(*bit);
                } else {
                    if !did_clear {
                        out.push(format!("\n\t{dst} = 0;"));
                        did_clear = true;
                    }
                    let (shift_op, diff) = if dst_bit > bit {
                        ("<<", dst_bit - bit)
                    } else {
                        (">>", bit - dst_bit)
                    };
                    out.push(format!(
                        "\n\t{dst} |= {src} {shift_op} {diff} & {};",
                        1u64 << dst_bit
                    ));
                }
            }
            if !direct.is_empty() {
                if direct.len() == pairs.len() {
                    out.push(format!("\n\t{dst} = {src};"));
                } else {
                    let mask = direct.iter().fold(0u64, |m, b| m | (1u64 << b));
                    out.push(format!("\n\t{dst} = {src} & {mask};"));
                }
            }
        }
        out.concat()
    }
}
