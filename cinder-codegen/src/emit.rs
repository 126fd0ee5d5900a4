//! Specialization and module emission
//!
//! Every instruction is expanded over all legal opcode values; each unique
//! specialization name gets exactly one function (call dispatch) or
//! labeled block (goto dispatch). Tables are populated ascending by base
//! opcode value with ties broken by varying-bit count, first writer wins,
//! and unoccupied slots fall through to an `unimplemented` handler.

use std::collections::{BTreeSet, HashMap};

use cinder_dsl::ir::Stmt;
use cinder_dsl::program::Instruction;

use crate::error::{Error, Result};
use crate::generator::{Dispatch, FieldVals, Generator, Param};
use crate::scope::Frame;

fn collect_dispatch(stmts: &[Stmt], into: &mut BTreeSet<String>) {
    for stmt in stmts {
        match stmt {
            Stmt::Op(op) => {
                if op.op == "dispatch"
                    && !op.params.is_empty()
                    && (op.params.len() == 1 || op.params[1] == "main")
                {
                    into.insert(op.params[0].clone());
                }
            }
            Stmt::Switch(block) => {
                for (_, arm) in &block.cases {
                    collect_dispatch(&arm.body, into);
                }
                if let Some(arm) = &block.default {
                    collect_dispatch(&arm.body, into);
                }
            }
            Stmt::If(block) => {
                collect_dispatch(&block.body, into);
                collect_dispatch(&block.else_body, into);
            }
            Stmt::Loop(block) => collect_dispatch(&block.body, into),
        }
    }
}

impl<'p> Generator<'p> {
    /// Record every expression dispatched through the `main` table; the
    /// unimplemented handler and `nospecialize` extraction key off it.
    fn process_dispatch(&mut self) {
        let prog = self.prog;
        let mut found = BTreeSet::new();
        for table in &prog.tables {
            for inst in &table.instructions {
                collect_dispatch(&inst.implementation, &mut found);
            }
        }
        for sub in &prog.subroutines {
            collect_dispatch(&sub.implementation, &mut found);
        }
        self.main_dispatch = found;
    }

    /// Generate the body of one specialization.
    fn generate_body(&mut self, inst: &Instruction, value: u32) -> Result<String> {
        self.reset_scratch();
        self.push_frame(Frame::root(&inst.locals));
        let mut out: Vec<String> = Vec::new();
        for (name, size) in &inst.locals {
            out.push(format!("\n\tuint{size}_t {name};"));
        }
        let mut field_vals = FieldVals::new();
        for (field, val, _) in inst.field_vals(value) {
            if !inst.no_specialize.contains(&field) {
                field_vals.insert(field, Param::Int(val as i64));
            }
        }
        for field in &inst.no_specialize {
            if self.main_dispatch.len() != 1 {
                return Err(Error::NoSpecializeDispatch);
            }
            let layout = inst
                .field(field)
                .ok_or_else(|| Error::UnknownField(field.clone()))?;
            if let Some(root) = self.scopes.first_mut() {
                root.locals.insert(field.clone(), self.opsize);
            }
            let mask = (1u64 << layout.width) - 1;
            let opsize = self.opsize;
            let opfield = self
                .main_dispatch
                .iter()
                .next()
                .cloned()
                .unwrap_or_default();
            if layout.shift != 0 {
                out.push(format!(
                    "\n\tuint{opsize}_t {field} = context->{opfield} >> {} & {mask};",
                    layout.shift
                ));
            } else {
                out.push(format!(
                    "\n\tuint{opsize}_t {field} = context->{opfield} & {mask};"
                ));
            }
        }
        self.process_ops(&inst.implementation, &field_vals, &mut out)?;
        let name = inst.spec_name(value);
        let mut begin = match self.dispatch {
            Dispatch::Call => format!(
                "\nstatic void {name}({} *context, uint32_t target_cycle)\n{{",
                self.context_type
            ),
            Dispatch::Goto => format!("\n{name}: {{"),
            Dispatch::Switch => {
                return Err(Error::UnsupportedDispatch("switch".to_owned()));
            }
        };
        if self.need_flag_coalesce {
            begin.push_str(&self.coalesce_flags());
        }
        if self.need_flag_disperse {
            let postlude = self.disperse_flags();
            out.push(postlude);
        }
        let new_locals = self
            .scopes
            .first()
            .map(|frame| frame.new_locals.clone())
            .unwrap_or_default();
        for (local, size) in new_locals {
            begin.push_str(&format!("\n\tuint{size}_t {local};"));
        }
        for (size, temp) in &self.temp {
            begin.push_str(&format!("\n\tuint{size}_t {temp};"));
        }
        self.pop_frame();
        if self.dispatch == Dispatch::Goto {
            let next = self.next_instruction()?;
            out.extend(next);
        }
        Ok(format!("{begin}{}\n}}", out.concat()))
    }

    /// Expand one dispatch table: generate every reachable specialization
    /// and lay out the table entries.
    fn build_table(
        &mut self,
        table_name: &str,
        body: &mut Vec<String>,
        late: &mut Vec<String>,
    ) -> Result<()> {
        let size = 1usize << self.opsize;
        let mut opmap: Vec<Option<String>> = vec![None; size];
        let mut bodymap: HashMap<String, String> = HashMap::new();
        let prog = self.prog;
        if let Some(table) = prog.table(table_name) {
            let mut instructions: Vec<&Instruction> = table.instructions.iter().collect();
            instructions.sort_by_key(|inst| (inst.value, inst.varying_bits));
            for inst in instructions {
                for value in inst.all_values() {
                    let slot = value as usize;
                    if slot >= size || opmap[slot].is_some() {
                        continue;
                    }
                    let name = inst.spec_name(value);
                    if !bodymap.contains_key(&name) {
                        let text = self.generate_body(inst, value).map_err(|err| {
                            Error::Instruction {
                                name: inst.name.clone(),
                                source: Box::new(err),
                            }
                        })?;
                        bodymap.insert(name.clone(), text);
                    }
                    opmap[slot] = Some(name);
                }
            }
        }
        let mut appended: BTreeSet<String> = BTreeSet::new();
        match self.dispatch {
            Dispatch::Call => {
                late.push(format!(
                    "\nstatic impl_fun impl_{table_name}[{size}] = {{"
                ));
                for slot in &opmap {
                    match slot {
                        None => late.push("\n\t&unimplemented,".to_owned()),
                        Some(name) => {
                            late.push(format!("\n\t&{name},"));
                            if appended.insert(name.clone()) {
                                body.push(bodymap[name].clone());
                            }
                        }
                    }
                }
                late.push("\n};".to_owned());
            }
            Dispatch::Goto => {
                body.push(format!(
                    "\n\tstatic void *impl_{table_name}[{size}] = {{"
                ));
                for slot in &opmap {
                    match slot {
                        None => body.push("\n\t\t&&unimplemented,".to_owned()),
                        Some(name) => {
                            body.push(format!("\n\t\t&&{name},"));
                            if appended.insert(name.clone()) {
                                late.push(bodymap[name].clone());
                            }
                        }
                    }
                }
                body.push("\n\t};".to_owned());
            }
            Dispatch::Switch => {
                return Err(Error::UnsupportedDispatch("switch".to_owned()));
            }
        }
        Ok(())
    }

    /// The goto-mode trailer threading control to the next instruction:
    /// interrupt window check, target-cycle check, then the inlined fetch
    /// and dispatch body.
    fn next_instruction(&mut self) -> Result<Vec<String>> {
        let mut out: Vec<String> = Vec::new();
        let prog = self.prog;
        let interrupt = self
            .interrupt
            .clone()
            .and_then(|name| prog.subroutine(&name));
        if interrupt.is_some() {
            out.push("\n\tif (context->cycles >= context->sync_cycle) {".to_owned());
        }
        out.push("\n\tif (context->cycles >= target_cycle) { return; }".to_owned());
        if let Some(sub) = interrupt {
            self.meta.clear();
            self.temp.clear();
            self.reg_values.clear();
            self.inline_sub(sub, &[], &mut out)?;
            out.push("\n\t}".to_owned());
        }
        if let Some(sub) = self.body.clone().and_then(|name| prog.subroutine(&name)) {
            self.meta.clear();
            self.temp.clear();
            self.reg_values.clear();
            self.inline_sub(sub, &[], &mut out)?;
        }
        Ok(out)
    }

    /// The call-mode `execute` entry point: sync, optional breakpoint
    /// consultation keyed on the PC register, interrupt window, then the
    /// inlined fetch-and-dispatch body in a cycle-bounded loop.
    fn emit_execute(&mut self, pieces: &mut Vec<String>) -> Result<()> {
        let prog = self.prog;
        let Some(body_sub) = self.body.clone().and_then(|name| prog.subroutine(&name)) else {
            return Ok(());
        };
        let interrupt = self
            .interrupt
            .clone()
            .and_then(|name| prog.subroutine(&name));
        let sync = self.sync_cycle.clone();
        pieces.push(format!(
            "\nvoid {}execute({} *context, uint32_t target_cycle)",
            self.prefix, self.context_type
        ));
        pieces.push("\n{".to_owned());
        if let Some(sync) = &sync {
            pieces.push(format!("\n\t{sync}(context, target_cycle);"));
        }
        if let Some(pc_reg) = self.pc_reg.clone() {
            pieces.push("\n\tif (context->breakpoints) {".to_owned());
            pieces.push("\n\t\twhile (context->cycles < target_cycle)".to_owned());
            pieces.push("\n\t\t{".to_owned());
            if let Some(sub) = interrupt {
                pieces.push("\n\t\t\tif (context->cycles >= context->sync_cycle) {".to_owned());
                if let Some(sync) = &sync {
                    pieces.push(format!("\n\t\t\t\t{sync}(context, target_cycle);"));
                }
                pieces.push("\n\t\t\t}".to_owned());
                self.meta.clear();
                self.temp.clear();
                self.reg_values.clear();
                let mut interrupt_body: Vec<String> = Vec::new();
                self.inline_sub(sub, &[], &mut interrupt_body)?;
                for (size, temp) in &self.temp {
                    pieces.push(format!("\n\t\t\tuint{size}_t {temp};"));
                }
                pieces.extend(interrupt_body);
            }
            let pc = if self.pc_offset != 0 {
                pieces.push(format!(
                    "\n\t\t\tuint32_t debug_pc = context->{pc_reg} - {};",
                    self.pc_offset
                ));
                "debug_pc".to_owned()
            } else {
                format!("context->{pc_reg}")
            };
            pieces.push("\n\t\t\tchar key_buf[6];".to_owned());
            pieces.push(format!(
                "\n\t\t\tdebug_handler handler = tern_find_ptr(context->breakpoints, tern_int_key({pc}, key_buf));"
            ));
            pieces.push("\n\t\t\tif (handler) {".to_owned());
            pieces.push(format!("\n\t\t\t\thandler(context, {pc});"));
            pieces.push("\n\t\t\t}".to_owned());
            self.meta.clear();
            self.temp.clear();
            self.reg_values.clear();
            self.inline_sub(body_sub, &[], pieces)?;
            pieces.push("\n\t}".to_owned());
            pieces.push("\n\t} else {".to_owned());
        }
        pieces.push("\n\twhile (context->cycles < target_cycle)".to_owned());
        pieces.push("\n\t{".to_owned());
        let interrupt = self
            .interrupt
            .clone()
            .and_then(|name| prog.subroutine(&name));
        if let Some(sub) = interrupt {
            pieces.push("\n\t\tif (context->cycles >= context->sync_cycle) {".to_owned());
            if let Some(sync) = &sync {
                pieces.push(format!("\n\t\t\t{sync}(context, target_cycle);"));
            }
            pieces.push("\n\t\t}".to_owned());
            self.meta.clear();
            self.temp.clear();
            self.reg_values.clear();
            let mut interrupt_body: Vec<String> = Vec::new();
            self.inline_sub(sub, &[], &mut interrupt_body)?;
            for (size, temp) in &self.temp {
                pieces.push(format!("\n\tuint{size}_t {temp};"));
            }
            pieces.extend(interrupt_body);
        }
        self.meta.clear();
        self.temp.clear();
        self.reg_values.clear();
        self.inline_sub(body_sub, &[], pieces)?;
        pieces.push("\n\t}".to_owned());
        if self.pc_reg.is_some() {
            pieces.push("\n\t}".to_owned());
        }
        pieces.push("\n}".to_owned());
        Ok(())
    }

    /// Generate the whole C module.
    pub fn build(&mut self) -> Result<String> {
        if self.dispatch == Dispatch::Switch {
            return Err(Error::UnsupportedDispatch("switch".to_owned()));
        }
        let size = 1usize << self.opsize;
        let mut body: Vec<String> = Vec::new();
        let mut pieces: Vec<String> = Vec::new();
        for include in &self.includes {
            body.push(format!("#include \"{include}\"\n"));
        }
        match self.dispatch {
            Dispatch::Call => {
                body.push(format!(
                    "\ntypedef void (*impl_fun)({}context *context, uint32_t target_cycle);",
                    self.prefix
                ));
                for table in &self.extra_tables {
                    body.push(format!("\nstatic impl_fun impl_{table}[{size}];"));
                }
                body.push(format!("\nstatic impl_fun impl_main[{size}];"));
            }
            Dispatch::Goto => {
                body.push(format!(
                    "\nvoid {}execute({} *context, uint32_t target_cycle)",
                    self.prefix, self.context_type
                ));
                body.push("\n{".to_owned());
            }
            Dispatch::Switch => {}
        }
        self.process_dispatch();
        for table in self.extra_tables.clone() {
            self.build_table(&table, &mut body, &mut pieces)?;
        }
        self.build_table("main", &mut body, &mut pieces)?;
        match self.dispatch {
            Dispatch::Call => {
                self.emit_execute(&mut pieces)?;
                body.push(format!(
                    "\nstatic void unimplemented({}context *context, uint32_t target_cycle)",
                    self.prefix
                ));
                body.push("\n{".to_owned());
                if self.main_dispatch.len() == 1 {
                    let expr = self
                        .main_dispatch
                        .iter()
                        .next()
                        .cloned()
                        .unwrap_or_default();
                    let resolved = self.resolve_expr(&expr);
                    body.push(format!(
                        "\n\tfatal_error(\"Unimplemented instruction: %X\\n\", {resolved});"
                    ));
                } else {
                    body.push("\n\tfatal_error(\"Unimplemented instruction\\n\");".to_owned());
                }
                body.push("\n}\n".to_owned());
            }
            Dispatch::Goto => {
                if let Some(sync) = self.sync_cycle.clone() {
                    body.push(format!("\n\t{sync}(context, target_cycle);"));
                }
                let next = self.next_instruction()?;
                body.extend(next);
                pieces.push("\nunimplemented:".to_owned());
                if self.main_dispatch.len() == 1 {
                    let expr = self
                        .main_dispatch
                        .iter()
                        .next()
                        .cloned()
                        .unwrap_or_default();
                    pieces.push(format!(
                        "\n\tfatal_error(\"Unimplemented instruction: %X\\n\", {expr});"
                    ));
                } else {
                    pieces.push("\n\tfatal_error(\"Unimplemented instruction\\n\");".to_owned());
                }
                pieces.push("\n}".to_owned());
            }
            Dispatch::Switch => {}
        }
        Ok(body.concat() + &pieces.concat())
    }
}
