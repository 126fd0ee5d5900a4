//! Statement representation of instruction and subroutine bodies
//!
//! Bodies are ordered statement lists. A statement is either a plain
//! operation (`NormalOp`) or one of the three control blocks (`switch`,
//! `if`, `loop`), each of which owns the locals declared inside it.
//!
//! Assignment-shaped lines are normalized at parse time into canonical
//! mnemonics, so `a:0 -= b` and `sub b a a 0` are the same statement by the
//! time the code generator sees them.

use std::fmt;

/// A plain operation with positional parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalOp {
    /// Canonical mnemonic (or a raw helper name passed through to C).
    pub op: String,
    /// Positional parameters, destination last for value-producing ops.
    pub params: Vec<String>,
}

impl NormalOp {
    /// Build from a tokenized, already-normalized line.
    pub fn new(mut parts: Vec<String>) -> Self {
        let op = parts.remove(0);
        NormalOp { op, params: parts }
    }
}

/// One arm of a `switch` statement.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Arm {
    /// Locals declared inside the arm.
    pub locals: Vec<(String, u32)>,
    /// Arm body.
    pub body: Vec<Stmt>,
}

/// A `switch` over a discriminator expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Switch {
    /// Discriminator parameter.
    pub param: String,
    /// `case` arms in source order.
    pub cases: Vec<(i64, Arm)>,
    /// Optional `default` arm.
    pub default: Option<Arm>,
}

/// An `if`, either on a boolean/register condition or a comparator
/// (`=`, `!=`, `>=U`) against a preceding `cmp`.
#[derive(Debug, Clone, PartialEq)]
pub struct If {
    /// Condition name or comparator token.
    pub cond: String,
    /// Then-branch locals.
    pub locals: Vec<(String, u32)>,
    /// Then branch.
    pub body: Vec<Stmt>,
    /// Else-branch locals, tracked separately.
    pub else_locals: Vec<(String, u32)>,
    /// Else branch.
    pub else_body: Vec<Stmt>,
}

/// A counted or endless loop.
#[derive(Debug, Clone, PartialEq)]
pub struct Loop {
    /// Iteration count parameter, endless when absent.
    pub count: Option<String>,
    /// Locals declared inside the loop.
    pub locals: Vec<(String, u32)>,
    /// Loop body.
    pub body: Vec<Stmt>,
}

/// One statement of a body.
#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    /// A plain operation.
    Op(NormalOp),
    /// A `switch` block.
    Switch(Switch),
    /// An `if` block.
    If(If),
    /// A `loop` block.
    Loop(Loop),
}

const ASSIGN_OPS: [(&str, &str); 8] = [
    ("=", "mov"),
    ("+=", "add"),
    ("-=", "sub"),
    ("<<=", "lsl"),
    (">>=", "lsr"),
    ("&=", "and"),
    ("|=", "or"),
    ("^=", "xor"),
];

const BINARY_OPS: [(&str, &str); 9] = [
    ("+", "add"),
    ("-", "sub"),
    ("<<", "lsl"),
    (">>", "lsr"),
    ("*", "mulu"),
    ("*S", "muls"),
    ("&", "and"),
    ("|", "or"),
    ("^", "xor"),
];

const UNARY_OPS: [(char, &str); 3] = [('~', "not"), ('!', "lnot"), ('-', "neg")];

fn assign_mnemonic(tok: &str) -> Option<&'static str> {
    ASSIGN_OPS.iter().find(|(t, _)| *t == tok).map(|(_, m)| *m)
}

fn binary_mnemonic(tok: &str) -> Option<&'static str> {
    BINARY_OPS.iter().find(|(t, _)| *t == tok).map(|(_, m)| *m)
}

fn unary_mnemonic(c: char) -> Option<&'static str> {
    UNARY_OPS.iter().find(|(t, _)| *t == c).map(|(_, m)| *m)
}

/// Rewrite an assignment-shaped token list into canonical mnemonic form.
///
/// `dst[:size] op …` becomes `mnemonic … dst [size]`; plain `=` further
/// recognizes a leading unary operator or an infix binary operator on the
/// right-hand side (swapping operands for `-`, whose table entry computes
/// `b - a`). Augmented shifts keep the destination as the shifted operand,
/// other augmented ops append it as the second source. Lines that are not
/// assignments pass through untouched.
pub fn normalize(parts: Vec<String>) -> Vec<String> {
    let Some(op_tok) = parts.get(1).map(String::as_str) else {
        return parts;
    };
    let Some(mnemonic) = assign_mnemonic(op_tok) else {
        return parts;
    };
    let op_tok = op_tok.to_owned();
    let (dst, size) = match parts[0].split_once(':') {
        Some((dst, size)) => (dst.to_owned(), Some(size.to_owned())),
        None => (parts[0].clone(), None),
    };
    let mut out: Vec<String> = Vec::with_capacity(parts.len() + 2);
    out.push(mnemonic.to_owned());
    out.extend(parts.into_iter().skip(2));
    if op_tok == "=" {
        let binary = if out.len() > 2 {
            binary_mnemonic(&out[2]).map(|mnemonic| (out[2] == "-", mnemonic.to_owned()))
        } else {
            None
        };
        if let Some((is_minus, mnemonic)) = binary {
            if is_minus && out.len() > 3 {
                out.swap(1, 3);
            }
            out[0] = mnemonic;
            out.remove(2);
        } else if out.len() > 1 {
            let first = out[1].chars().next();
            if let Some(unary) = first.and_then(unary_mnemonic) {
                let rest = out[1][1..].to_owned();
                if rest.is_empty() {
                    out.remove(1);
                } else {
                    out[1] = rest;
                }
                out[0] = unary.to_owned();
            }
        }
    } else if op_tok == "<<=" || op_tok == ">>=" {
        out.insert(1, dst.clone());
    } else {
        out.push(dst.clone());
    }
    out.push(dst);
    if let Some(size) = size {
        out.push(size);
    }
    out
}

fn write_locals(f: &mut fmt::Formatter<'_>, locals: &[(String, u32)], pad: &str) -> fmt::Result {
    for (name, size) in locals {
        writeln!(f, "{pad}local {name} {size}")?;
    }
    Ok(())
}

fn write_body(f: &mut fmt::Formatter<'_>, body: &[Stmt], depth: usize) -> fmt::Result {
    for stmt in body {
        stmt.write_indented(f, depth)?;
    }
    Ok(())
}

impl Stmt {
    fn write_indented(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        let pad = "\t".repeat(depth);
        match self {
            Stmt::Op(op) => {
                write!(f, "{pad}{}", op.op)?;
                for param in &op.params {
                    write!(f, " {param}")?;
                }
                writeln!(f)
            }
            Stmt::Switch(sw) => {
                writeln!(f, "{pad}switch {}", sw.param)?;
                for (value, arm) in &sw.cases {
                    writeln!(f, "{pad}case {value}")?;
                    write_locals(f, &arm.locals, &pad)?;
                    write_body(f, &arm.body, depth + 1)?;
                }
                if let Some(arm) = &sw.default {
                    writeln!(f, "{pad}default")?;
                    write_locals(f, &arm.locals, &pad)?;
                    write_body(f, &arm.body, depth + 1)?;
                }
                writeln!(f, "{pad}end")
            }
            Stmt::If(block) => {
                writeln!(f, "{pad}if {}", block.cond)?;
                write_locals(f, &block.locals, &pad)?;
                write_body(f, &block.body, depth + 1)?;
                if !block.else_body.is_empty() || !block.else_locals.is_empty() {
                    writeln!(f, "{pad}else")?;
                    write_locals(f, &block.else_locals, &pad)?;
                    write_body(f, &block.else_body, depth + 1)?;
                }
                writeln!(f, "{pad}end")
            }
            Stmt::Loop(block) => {
                match &block.count {
                    Some(count) => writeln!(f, "{pad}loop {count}")?,
                    None => writeln!(f, "{pad}loop")?,
                }
                write_locals(f, &block.locals, &pad)?;
                write_body(f, &block.body, depth + 1)?;
                writeln!(f, "{pad}end")
            }
        }
    }
}

impl fmt::Display for Stmt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write_indented(f, 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn norm(line: &str) -> Vec<String> {
        normalize(line.split_whitespace().map(str::to_owned).collect())
    }

    #[rstest]
    #[case("a = b", &["mov", "b", "a"])]
    #[case("a = 5", &["mov", "5", "a"])]
    #[case("a = b + c", &["add", "b", "c", "a"])]
    #[case("a = b - c", &["sub", "c", "b", "a"])]
    #[case("a = b *S c", &["muls", "b", "c", "a"])]
    #[case("a = ~b", &["not", "b", "a"])]
    #[case("a = !b", &["lnot", "b", "a"])]
    #[case("a = -b", &["neg", "b", "a"])]
    #[case("a += b", &["add", "b", "a", "a"])]
    #[case("a -= b", &["sub", "b", "a", "a"])]
    #[case("a <<= b", &["lsl", "a", "b", "a"])]
    #[case("a >>= 1", &["lsr", "a", "1", "a"])]
    #[case("a &= 0x0f", &["and", "0x0f", "a", "a"])]
    #[case("a:0 -= b", &["sub", "b", "a", "a", "0"])]
    #[case("a:1 = b + c", &["add", "b", "c", "a", "1"])]
    #[case("cycles 4", &["cycles", "4"])]
    #[case("update_flags SZC", &["update_flags", "SZC"])]
    fn assignment_normalization(#[case] line: &str, #[case] expect: &[&str]) {
        assert_eq!(norm(line), expect);
    }
}
