//! Control-flow block generation
//!
//! A `switch` with a constant discriminator inlines only the matching arm;
//! a runtime discriminator produces a C `switch` whose arms each run
//! against a snapshot of the fold map so folding cannot leak between
//! siblings. `if` folds on configuration booleans and on comparisons whose
//! operands are both known; `loop` pre-evicts every destination written in
//! its body, flushing folded locals into their backing variables first.

use std::str::FromStr;

use cinder_dsl::flags::FlagUpdate;
use cinder_dsl::ir::{If, Loop, Stmt, Switch};

use crate::error::{Error, Result};
use crate::generator::{FieldVals, Generator, Param};
use crate::ops::{op_spec, OpKind};
use crate::scope::Frame;

const COMPARE_OPS: [&str; 3] = [">=U", "=", "!="];

impl Generator<'_> {
    /// Generate a statement list, peeking one ahead so an arithmetic op
    /// sees the flag set an immediately-following `update_flags` needs.
    pub(crate) fn process_ops(
        &mut self,
        stmts: &[Stmt],
        field_vals: &FieldVals,
        out: &mut Vec<String>,
    ) -> Result<()> {
        for (idx, stmt) in stmts.iter().enumerate() {
            let updates: Option<FlagUpdate> = match stmts.get(idx + 1) {
                Some(Stmt::Op(next)) if next.op == "update_flags" => {
                    let spec = next.params.first().ok_or_else(|| {
                        Error::InsufficientParams {
                            op: "update_flags".to_owned(),
                            params: String::new(),
                        }
                    })?;
                    Some(self.prog.flags.parse_update(spec)?)
                }
                _ => None,
            };
            match stmt {
                Stmt::Op(op) => self.gen_normal(op, field_vals, out, updates.as_ref())?,
                Stmt::Switch(block) => self.gen_switch(block, field_vals, out)?,
                Stmt::If(block) => self.gen_if(block, field_vals, out)?,
                Stmt::Loop(block) => self.gen_loop(block, field_vals, out)?,
            }
        }
        Ok(())
    }

    /// Flush folded constants of destinations written by `stmts` into
    /// their backing locals and evict them, so later reads go through the
    /// real variable.
    fn flush_written(&mut self, stmts: &[Stmt], out: &mut Vec<String>) {
        for stmt in stmts {
            let Stmt::Op(op) = stmt else {
                continue;
            };
            let Ok(kind) = OpKind::from_str(&op.op) else {
                continue;
            };
            for &idx in op_spec(kind).out_op {
                let Some(dst) = op.params.get(idx) else {
                    continue;
                };
                let mut dst = dst.clone();
                while let Some(alias) = self.meta.get(&dst) {
                    dst = alias.clone();
                }
                let key = if self.reg_values.contains_key(&dst) {
                    Some(dst.clone())
                } else {
                    self.resolve_local(&dst)
                        .filter(|local| self.reg_values.contains_key(local))
                };
                let Some(key) = key else { continue };
                if let Some(local) = self.resolve_local(&dst) {
                    let value = self.reg_values[&key];
                    out.push(format!("\n\t{local} = {value};"));
                }
                self.reg_values.remove(&key);
            }
        }
    }

    fn gen_switch(
        &mut self,
        block: &Switch,
        field_vals: &FieldVals,
        out: &mut Vec<String>,
    ) -> Result<()> {
        self.push_frame(Frame::block(&[]));
        let discriminator = self.resolve_param(&block.param, field_vals, true, true, false);
        let result = match discriminator {
            Param::Int(value) => {
                let arm = block
                    .cases
                    .iter()
                    .find(|(case, _)| *case == value)
                    .map(|(_, arm)| arm)
                    .or(block.default.as_ref());
                if let Some(arm) = arm {
                    self.set_top_locals(&arm.locals);
                    out.push("\n\t{".to_owned());
                    for (name, size) in &arm.locals {
                        out.push(format!("\n\tuint{size}_t {name};"));
                    }
                    let result = self.process_ops(&arm.body, field_vals, out);
                    out.push("\n\t}".to_owned());
                    result
                } else {
                    Ok(())
                }
            }
            Param::Expr(expr) => {
                let was_conditional = self.conditional;
                self.conditional = true;
                for (_, arm) in &block.cases {
                    self.flush_written(&arm.body, out);
                }
                if let Some(arm) = &block.default {
                    self.flush_written(&arm.body, out);
                }
                out.push(format!("\n\tswitch({expr})"));
                out.push("\n\t{".to_owned());
                let snapshot = self.reg_values.clone();
                let mut result = Ok(());
                for (case, arm) in &block.cases {
                    self.set_top_locals(&arm.locals);
                    self.reg_values = snapshot.clone();
                    out.push(format!("\n\tcase {case}U: {{"));
                    for (name, size) in &arm.locals {
                        out.push(format!("\n\tuint{size}_t {name};"));
                    }
                    result = self.process_ops(&arm.body, field_vals, out);
                    if result.is_err() {
                        break;
                    }
                    out.push("\n\tbreak;".to_owned());
                    out.push("\n\t}".to_owned());
                }
                if result.is_ok() {
                    if let Some(arm) = &block.default {
                        self.set_top_locals(&arm.locals);
                        self.reg_values = snapshot.clone();
                        out.push("\n\tdefault: {".to_owned());
                        for (name, size) in &arm.locals {
                            out.push(format!("\n\tuint{size}_t {name};"));
                        }
                        result = self.process_ops(&arm.body, field_vals, out);
                        if result.is_ok() {
                            out.push("\n\t}".to_owned());
                        }
                    }
                }
                out.push("\n\t}".to_owned());
                self.reg_values = snapshot;
                self.conditional = was_conditional;
                result
            }
        };
        self.pop_frame();
        result
    }

    fn gen_if(&mut self, block: &If, field_vals: &FieldVals, out: &mut Vec<String>) -> Result<()> {
        if let Some(value) = self.boolean(&block.cond) {
            return self.gen_if_arm(value, block, field_vals, out);
        }
        if COMPARE_OPS.contains(&block.cond.as_str()) {
            let last_cmp = self
                .last_op
                .as_ref()
                .filter(|last| last.op == "cmp" && last.params.len() >= 2)
                .map(|last| last.params.clone());
            if let Some(cmp_params) = &last_cmp {
                let a = self.resolve_param(&cmp_params[0], field_vals, true, true, false);
                let b = self.resolve_param(&cmp_params[1], field_vals, true, true, false);
                if let (Param::Int(a), Param::Int(b)) = (&a, &b) {
                    out.pop();
                    let taken = match block.cond.as_str() {
                        ">=U" => b >= a,
                        "=" => b == a,
                        _ => b != a,
                    };
                    return self.gen_if_arm(taken, block, field_vals, out);
                }
            }
            let was_conditional = self.conditional;
            self.conditional = true;
            let header = match block.cond.as_str() {
                ">=U" => {
                    let Some(cmp_params) = &last_cmp else {
                        return Err(Error::CmpContext(">=U"));
                    };
                    let a = self.resolve_param(&cmp_params[0], field_vals, true, true, false);
                    let b = self.resolve_param(&cmp_params[1], field_vals, true, true, false);
                    out.pop();
                    format!("\n\tif ({b} >= {a}) {{")
                }
                "=" => {
                    if let Some(cmp_params) = &last_cmp {
                        let a = self.resolve_param(&cmp_params[0], field_vals, true, true, false);
                        let b = self.resolve_param(&cmp_params[1], field_vals, true, true, false);
                        out.pop();
                        format!("\n\tif ({b} == {a}) {{")
                    } else {
                        let raw = self.last_dst.clone().unwrap_or_default();
                        let empty = FieldVals::new();
                        let last = self.resolve_param(&raw, &empty, false, true, false);
                        format!("\n\tif (!{last}) {{")
                    }
                }
                _ => {
                    let raw = self.last_dst.clone().unwrap_or_default();
                    let empty = FieldVals::new();
                    let last = self.resolve_param(&raw, &empty, false, true, false);
                    format!("\n\tif ({last}) {{")
                }
            };
            out.push(header);
            self.gen_branch(&block.locals, &block.body, field_vals, out)?;
            if !block.else_body.is_empty() {
                out.push("\n\t} else {".to_owned());
                self.gen_branch(&block.else_locals, &block.else_body, field_vals, out)?;
            }
            out.push("\n\t}".to_owned());
            self.conditional = was_conditional;
            return Ok(());
        }
        let cond = self.resolve_param(&block.cond, field_vals, true, true, false);
        match cond {
            Param::Int(value) => self.gen_if_arm(value != 0, block, field_vals, out),
            Param::Expr(expr) => {
                out.push(format!("\n\tif ({expr}) {{"));
                let was_conditional = self.conditional;
                self.conditional = true;
                self.gen_branch(&block.locals, &block.body, field_vals, out)?;
                if !block.else_body.is_empty() {
                    out.push("\n\t} else {".to_owned());
                    self.gen_branch(&block.else_locals, &block.else_body, field_vals, out)?;
                }
                out.push("\n\t}".to_owned());
                self.conditional = was_conditional;
                Ok(())
            }
        }
    }

    fn gen_if_arm(
        &mut self,
        taken: bool,
        block: &If,
        field_vals: &FieldVals,
        out: &mut Vec<String>,
    ) -> Result<()> {
        if taken {
            self.gen_branch(&block.locals, &block.body, field_vals, out)
        } else {
            self.gen_branch(&block.else_locals, &block.else_body, field_vals, out)
        }
    }

    fn gen_branch(
        &mut self,
        locals: &[(String, u32)],
        body: &[Stmt],
        field_vals: &FieldVals,
        out: &mut Vec<String>,
    ) -> Result<()> {
        self.push_frame(Frame::block(locals));
        for (name, size) in locals {
            out.push(format!("\n\tuint{size}_t {name};"));
        }
        let result = self.process_ops(body, field_vals, out);
        self.pop_frame();
        result
    }

    fn gen_loop(
        &mut self,
        block: &Loop,
        field_vals: &FieldVals,
        out: &mut Vec<String>,
    ) -> Result<()> {
        self.flush_written(&block.body, out);
        match &block.count {
            Some(count) => {
                let count = self.resolve_param(count, field_vals, true, true, false);
                out.push(format!(
                    "\n\tfor (uint32_t loop_counter__ = 0; loop_counter__ < {count}; loop_counter__++) {{"
                ));
            }
            None => out.push("\n\tfor (;;) {".to_owned()),
        }
        self.gen_branch(&block.locals, &block.body, field_vals, out)?;
        out.push("\n\t}".to_owned());
        Ok(())
    }
}
