//! Scope frames and name resolution
//!
//! Resolution order for a parameter: numeric literal, known constant for
//! the name, lexical locals up to the enclosing instruction or subroutine
//! root, bound field/argument values, `meta` aliases, program registers,
//! then pointers. Whatever survives is passed through as opaque C text.
//!
//! Subroutine frames qualify their locals (`<sub>_<local>`) so inlined
//! bodies cannot collide with the caller; block frames resolve plain
//! names. Root frames also collect locals allocated during generation
//! (`cmp_tmp<size>__`), which are declared in the function prologue.

use std::collections::HashMap;

use cinder_dsl::lex;
use cinder_dsl::program::SubRoutine;

use crate::generator::{FieldVals, Generator, Param};

/// One entry of the scope stack.
#[derive(Debug, Default)]
pub(crate) struct Frame {
    /// Subroutine name used to qualify local names.
    pub qualify: Option<String>,
    /// Instruction and subroutine frames stop lexical resolution.
    pub is_root: bool,
    /// Locals visible in this frame.
    pub locals: HashMap<String, u32>,
    /// Subroutine argument widths (root frames only).
    pub args: HashMap<String, u32>,
    /// Locals allocated while generating, in allocation order.
    pub new_locals: Vec<(String, u32)>,
}

impl Frame {
    /// The root frame of an instruction specialization.
    pub fn root(locals: &[(String, u32)]) -> Self {
        Frame {
            is_root: true,
            locals: locals.iter().cloned().collect(),
            ..Frame::default()
        }
    }

    /// The root frame of an inlined subroutine.
    pub fn sub_root(sub: &SubRoutine) -> Self {
        Frame {
            qualify: Some(sub.name.clone()),
            is_root: true,
            locals: sub.locals.iter().cloned().collect(),
            args: sub.args.iter().cloned().collect(),
            ..Frame::default()
        }
    }

    /// A block frame (switch arm, if arm, loop body).
    pub fn block(locals: &[(String, u32)]) -> Self {
        Frame {
            locals: locals.iter().cloned().collect(),
            ..Frame::default()
        }
    }
}

impl Generator<'_> {
    pub(crate) fn push_frame(&mut self, frame: Frame) {
        self.scopes.push(frame);
    }

    pub(crate) fn pop_frame(&mut self) {
        self.scopes.pop();
    }

    /// Swap the locals of the innermost frame (switch arm selection).
    pub(crate) fn set_top_locals(&mut self, locals: &[(String, u32)]) {
        if let Some(frame) = self.scopes.last_mut() {
            frame.locals = locals.iter().cloned().collect();
        }
    }

    /// Resolve a name against the lexical scope chain, stopping at the
    /// innermost instruction or subroutine root.
    pub(crate) fn resolve_local(&self, name: &str) -> Option<String> {
        for frame in self.scopes.iter().rev() {
            if frame.locals.contains_key(name) {
                return Some(match &frame.qualify {
                    Some(sub) => format!("{sub}_{name}"),
                    None => name.to_owned(),
                });
            }
            if frame.is_root {
                break;
            }
        }
        None
    }

    /// Allocate a local in the outermost frame; declared in the prologue.
    pub(crate) fn add_root_local(&mut self, name: &str, size: u32) {
        let Some(root) = self.scopes.first_mut() else {
            return;
        };
        root.locals.insert(name.to_owned(), size);
        root.new_locals.push((name.to_owned(), size));
    }

    /// True when the outermost frame already owns `name`.
    pub(crate) fn root_has_local(&self, name: &str) -> bool {
        self.scopes
            .first()
            .is_some_and(|frame| frame.locals.contains_key(name))
    }

    /// The shared per-size temporary, allocating its slot on first use.
    pub(crate) fn get_temp(&mut self, size: u32) -> String {
        self.temp
            .entry(size)
            .or_insert_with(|| format!("gen_tmp{size}__"))
            .clone()
    }

    /// Bit width of a name: locals and arguments anywhere on the stack,
    /// array elements, registers, temporaries, else a machine word.
    pub(crate) fn param_size(&self, name: &str) -> u32 {
        if let Some(target) = self.meta.get(name) {
            return self.param_size(&target.clone());
        }
        for frame in self.scopes.iter().rev() {
            if let Some(width) = frame.locals.get(name) {
                return *width;
            }
            if let Some(width) = frame.args.get(name) {
                return *width;
            }
        }
        if let Some((begin, _)) = name.split_once('.') {
            if let Some(width) = self.prog.registers.array_width(begin) {
                return width.bits();
            }
        }
        if let Some(width) = self.prog.registers.scalar_width(name) {
            return width.bits();
        }
        for (size, temp) in &self.temp {
            if temp == name {
                return *size;
            }
        }
        32
    }

    /// True when `name` (possibly `array.index`) denotes guest state.
    pub(crate) fn is_reg(&self, name: &str) -> bool {
        match name.split_once('.') {
            Some((begin, _)) => {
                let begin = self.meta.get(begin).map(String::as_str).unwrap_or(begin);
                self.prog.registers.is_array(begin)
            }
            None => self.prog.registers.is_reg(name),
        }
    }

    /// Resolve one parameter. `use_scope` enables local and constant
    /// lookup, `allow_const` permits substituting a folded value, and
    /// `is_dst` records the destination for later flag synthesis.
    pub(crate) fn resolve_param(
        &mut self,
        param: &str,
        field_vals: &FieldVals,
        use_scope: bool,
        allow_const: bool,
        is_dst: bool,
    ) -> Param {
        let mut cur = param.to_owned();
        let mut fields_active = true;
        loop {
            if let Some(value) = lex::parse_int(&cur) {
                if is_dst {
                    self.last_dst = Some(cur);
                    self.last_size = None;
                }
                return Param::Int(value);
            }
            if use_scope {
                if allow_const {
                    if let Some(value) = self.reg_values.get(&cur) {
                        return Param::Int(*value);
                    }
                }
                if let Some(local) = self.resolve_local(&cur) {
                    if is_dst {
                        self.last_dst = Some(cur.clone());
                        self.last_size = None;
                    }
                    if allow_const {
                        if let Some(value) = self.reg_values.get(&local) {
                            return Param::Int(*value);
                        }
                    }
                    return Param::Expr(local);
                }
            }
            if fields_active {
                if let Some(bound) = field_vals.get(&cur) {
                    fields_active = false;
                    match bound {
                        Param::Int(value) => {
                            let value = *value;
                            if is_dst {
                                self.last_dst = Some(value.to_string());
                                self.last_size = None;
                            }
                            return Param::Int(value);
                        }
                        Param::Expr(text) => {
                            cur = text.clone();
                            continue;
                        }
                    }
                }
            }
            if let Some(target) = self.meta.get(&cur) {
                cur = target.clone();
                continue;
            }
            if self.is_reg(&cur) {
                let empty = FieldVals::new();
                let fields = if fields_active { field_vals } else { &empty };
                let name = cur.clone();
                return Param::Expr(self.resolve_reg(&name, fields, use_scope, is_dst));
            }
            if self.prog.registers.is_pointer(&cur) {
                return Param::Expr(format!("context->{cur}"));
            }
            break;
        }
        if is_dst {
            self.last_dst = Some(cur.clone());
            self.last_size = None;
        }
        Param::Expr(cur)
    }

    /// Resolve a register reference (plain, array member, or dotted
    /// `array.index`) to its C lvalue, recording flag-register touches.
    pub(crate) fn resolve_reg(
        &mut self,
        name: &str,
        field_vals: &FieldVals,
        use_scope: bool,
        is_dst: bool,
    ) -> String {
        let (reg_name, lvalue) = if let Some((begin, end)) = name.split_once('.') {
            let begin = self
                .meta
                .get(begin)
                .cloned()
                .unwrap_or_else(|| begin.to_owned());
            let end_expr = if self.prog.registers.member_ref(end).is_none() {
                match self.resolve_param(end, field_vals, use_scope, true, false) {
                    Param::Int(value) => value.to_string(),
                    Param::Expr(text) => text,
                }
            } else {
                end.to_owned()
            };
            let end_expr = match self.prog.registers.member_ref(&end_expr) {
                Some((array, idx)) if array != begin => format!("context->{array}[{idx}]"),
                Some((_, idx)) => idx.to_string(),
                None => end_expr,
            };
            let reg_name = if self.prog.registers.is_counted_array(&begin) {
                None
            } else {
                Some(format!("{begin}.{end_expr}"))
            };
            (reg_name, format!("context->{begin}[{end_expr}]"))
        } else {
            let lvalue = match self.prog.registers.member_ref(name) {
                Some((array, idx)) => format!("context->{array}[{idx}]"),
                None => format!("context->{name}"),
            };
            (Some(name.to_owned()), lvalue)
        };
        if let (Some(reg_name), Some(flag_reg)) = (&reg_name, &self.prog.flags.flag_reg) {
            if reg_name == flag_reg {
                if is_dst {
                    self.need_flag_disperse = true;
                } else {
                    self.need_flag_coalesce = true;
                }
            }
        }
        if is_dst {
            self.last_dst = reg_name.clone();
        }
        lvalue
    }

    /// Resolve a name outside of any lexical scope (flag storage,
    /// dispatch expressions).
    pub(crate) fn resolve_expr(&mut self, name: &str) -> String {
        let empty = FieldVals::new();
        self.resolve_param(name, &empty, false, true, false)
            .to_string()
    }
}
