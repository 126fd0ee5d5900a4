//! Register file descriptor
//!
//! Registers are declared one per line inside the `regs` section:
//!
//! ```text
//! regs
//! 	pc 16
//! 	main 8 b c d e h l f a
//! 	scratch 8 4
//! 	mem ptr8 2
//! 	system_ptr sys_context
//! ```
//!
//! Scalars carry a bit width or an opaque C type token, arrays are either
//! uniform-count or list their members by name (each member then also
//! resolves as a scalar with an array back-reference), and pointers carry a
//! `ptr`-prefixed element type with an optional count. Two implicit 32-bit
//! scalars, `cycles` and `sync_cycle`, are always present.

use std::collections::HashMap;
use std::fmt;

use crate::error::ParseError;
use crate::lex;

/// Width of a scalar or array element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Width {
    /// Numeric width in bits.
    Bits(u32),
    /// An opaque C type token forwarded verbatim.
    Opaque(String),
}

impl Width {
    /// Numeric width, treating opaque C types as machine words.
    pub fn bits(&self) -> u32 {
        match self {
            Width::Bits(n) => *n,
            Width::Opaque(_) => 32,
        }
    }
}

/// Array member layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Members {
    /// A uniform array of `count` elements.
    Count(u32),
    /// Members listed by name, each addressable on its own.
    Named(Vec<String>),
}

impl Members {
    /// Number of elements.
    pub fn len(&self) -> u32 {
        match self {
            Members::Count(n) => *n,
            Members::Named(names) => names.len() as u32,
        }
    }

    /// True when the array has no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One declaration line, in source order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decl {
    /// `name width`
    Scalar {
        /// Register name.
        name: String,
        /// Bit width or opaque C type.
        width: Width,
    },
    /// `name width count` / `name width m0 m1 …`
    Array {
        /// Array name.
        name: String,
        /// Element width.
        width: Width,
        /// Element count or member names.
        members: Members,
    },
    /// `name ptrT [count]`
    Pointer {
        /// Pointer field name.
        name: String,
        /// Element type after the first `ptr` prefix; further `ptr`
        /// prefixes deepen the star count.
        target: String,
        /// Element count (1 for a plain pointer).
        count: u32,
    },
}

impl Decl {
    /// Declared name.
    pub fn name(&self) -> &str {
        match self {
            Decl::Scalar { name, .. } | Decl::Array { name, .. } | Decl::Pointer { name, .. } => {
                name
            }
        }
    }
}

/// The register file of the described CPU.
#[derive(Debug, Clone, PartialEq)]
pub struct Registers {
    decls: Vec<Decl>,
    scalars: HashMap<String, Width>,
    arrays: HashMap<String, (Width, Members)>,
    pointers: HashMap<String, (String, u32)>,
    member_of: HashMap<String, (String, u32)>,
}

impl Default for Registers {
    fn default() -> Self {
        Self::new()
    }
}

impl Registers {
    /// An empty register file holding only the implicit cycle counters.
    pub fn new() -> Self {
        let mut regs = Registers {
            decls: Vec::new(),
            scalars: HashMap::new(),
            arrays: HashMap::new(),
            pointers: HashMap::new(),
            member_of: HashMap::new(),
        };
        regs.add_scalar("cycles", Width::Bits(32));
        regs.add_scalar("sync_cycle", Width::Bits(32));
        regs
    }

    /// Declare (or re-declare in place) a scalar register.
    pub fn add_scalar(&mut self, name: &str, width: Width) {
        if let Some(existing) = self.scalars.get_mut(name) {
            *existing = width.clone();
            for decl in &mut self.decls {
                if let Decl::Scalar { name: n, width: w } = decl {
                    if n == name {
                        *w = width;
                        break;
                    }
                }
            }
            return;
        }
        self.scalars.insert(name.to_owned(), width.clone());
        self.decls.push(Decl::Scalar {
            name: name.to_owned(),
            width,
        });
    }

    /// Declare a register array; named members also become scalars.
    pub fn add_array(&mut self, name: &str, width: Width, members: Members) {
        if let Members::Named(names) = &members {
            for (idx, member) in names.iter().enumerate() {
                self.scalars.insert(member.clone(), width.clone());
                self.member_of
                    .insert(member.clone(), (name.to_owned(), idx as u32));
            }
        }
        self.arrays
            .insert(name.to_owned(), (width.clone(), members.clone()));
        self.decls.push(Decl::Array {
            name: name.to_owned(),
            width,
            members,
        });
    }

    /// Declare a pointer field.
    pub fn add_pointer(&mut self, name: &str, target: &str, count: u32) {
        self.pointers
            .insert(name.to_owned(), (target.to_owned(), count));
        self.decls.push(Decl::Pointer {
            name: name.to_owned(),
            target: target.to_owned(),
            count,
        });
    }

    /// True when any declaration already claims `name`.
    fn name_taken(&self, name: &str) -> bool {
        self.scalars.contains_key(name)
            || self.pointers.contains_key(name)
            || self.arrays.contains_key(name)
            || self.member_of.contains_key(name)
    }

    /// Every name must be unique across scalars, members and pointers; a
    /// scalar may be re-declared to change its width.
    fn claim(&self, name: &str, as_scalar: bool, line: usize) -> Result<(), ParseError> {
        let redeclared_scalar = as_scalar && self.scalars.contains_key(name);
        if self.name_taken(name) && !redeclared_scalar {
            return Err(ParseError::DuplicateRegister {
                line,
                name: name.to_owned(),
            });
        }
        Ok(())
    }

    /// Process one body line of the `regs` section.
    pub fn process_line(&mut self, parts: &[String], line: usize) -> Result<(), ParseError> {
        let malformed = || ParseError::MalformedRegister { line };
        match parts {
            [name, kind] => {
                if let Some(target) = kind.strip_prefix("ptr") {
                    self.claim(name, false, line)?;
                    self.add_pointer(name, target, 1);
                } else if kind.chars().all(|c| c.is_ascii_digit()) {
                    self.claim(name, true, line)?;
                    self.add_scalar(name, Width::Bits(lex::parse_uint(kind, line)?));
                } else {
                    self.claim(name, true, line)?;
                    self.add_scalar(name, Width::Opaque(kind.clone()));
                }
            }
            [name, kind, count] if kind.starts_with("ptr") => {
                let target = &kind[3..];
                self.claim(name, false, line)?;
                self.add_pointer(name, target, lex::parse_uint(count, line)?);
            }
            [name, width, count]
                if width.chars().all(|c| c.is_ascii_digit())
                    && count.chars().all(|c| c.is_ascii_digit()) =>
            {
                self.claim(name, false, line)?;
                self.add_array(
                    name,
                    Width::Bits(lex::parse_uint(width, line)?),
                    Members::Count(lex::parse_uint(count, line)?),
                );
            }
            [name, width, count] if !width.chars().all(|c| c.is_ascii_digit()) => {
                self.claim(name, false, line)?;
                self.add_array(
                    name,
                    Width::Opaque(width.clone()),
                    Members::Count(lex::parse_uint(count, line)?),
                );
            }
            [name, width, members @ ..] if !members.is_empty() => {
                let width = width
                    .chars()
                    .all(|c| c.is_ascii_digit())
                    .then(|| lex::parse_uint(width, line))
                    .ok_or_else(malformed)??;
                self.claim(name, false, line)?;
                for member in members {
                    self.claim(member, false, line)?;
                }
                self.add_array(name, Width::Bits(width), Members::Named(members.to_vec()));
            }
            _ => return Err(malformed()),
        }
        Ok(())
    }

    /// True when `name` is a scalar register or a named array member.
    pub fn is_reg(&self, name: &str) -> bool {
        self.scalars.contains_key(name)
    }

    /// True when `name` is a register array.
    pub fn is_array(&self, name: &str) -> bool {
        self.arrays.contains_key(name)
    }

    /// True when `name` is a uniform-count array (no named members).
    pub fn is_counted_array(&self, name: &str) -> bool {
        matches!(self.arrays.get(name), Some((_, Members::Count(_))))
    }

    /// True when `name` is a pointer field.
    pub fn is_pointer(&self, name: &str) -> bool {
        self.pointers.contains_key(name)
    }

    /// Back-reference of a named array member.
    pub fn member_ref(&self, name: &str) -> Option<(&str, u32)> {
        self.member_of
            .get(name)
            .map(|(array, idx)| (array.as_str(), *idx))
    }

    /// Width of a scalar register or named array member.
    pub fn scalar_width(&self, name: &str) -> Option<&Width> {
        self.scalars.get(name)
    }

    /// Element width of an array.
    pub fn array_width(&self, name: &str) -> Option<&Width> {
        self.arrays.get(name).map(|(width, _)| width)
    }

    /// All declarations in source order (implicit counters first).
    pub fn decls(&self) -> &[Decl] {
        &self.decls
    }
}

impl fmt::Display for Registers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for decl in &self.decls {
            match decl {
                Decl::Scalar { name, width } => match width {
                    Width::Bits(n) => writeln!(f, "\t{name} {n}")?,
                    Width::Opaque(ty) => writeln!(f, "\t{name} {ty}")?,
                },
                Decl::Array {
                    name,
                    width,
                    members,
                } => {
                    let width = match width {
                        Width::Bits(n) => n.to_string(),
                        Width::Opaque(ty) => ty.clone(),
                    };
                    match members {
                        Members::Count(count) => writeln!(f, "\t{name} {width} {count}")?,
                        Members::Named(names) => {
                            writeln!(f, "\t{name} {width} {}", names.join(" "))?
                        }
                    }
                }
                Decl::Pointer {
                    name,
                    target,
                    count,
                } => writeln!(f, "\t{name} ptr{target} {count}")?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(regs: &mut Registers, text: &str) {
        let parts: Vec<String> = text.split_whitespace().map(str::to_owned).collect();
        regs.process_line(&parts, 1).unwrap();
    }

    #[test]
    fn implicit_counters_exist() {
        let regs = Registers::new();
        assert!(regs.is_reg("cycles"));
        assert!(regs.is_reg("sync_cycle"));
        assert_eq!(regs.scalar_width("cycles"), Some(&Width::Bits(32)));
    }

    #[test]
    fn named_array_members_are_scalars() {
        let mut regs = Registers::new();
        line(&mut regs, "main 8 b c d e h l f a");
        assert!(regs.is_array("main"));
        assert!(!regs.is_counted_array("main"));
        assert!(regs.is_reg("f"));
        assert_eq!(regs.member_ref("f"), Some(("main", 6)));
        assert_eq!(regs.scalar_width("h"), Some(&Width::Bits(8)));
    }

    #[test]
    fn pointers_and_opaque_types() {
        let mut regs = Registers::new();
        line(&mut regs, "mem_pointers ptr8 4");
        line(&mut regs, "system sys_context");
        assert!(regs.is_pointer("mem_pointers"));
        assert!(regs.is_reg("system"));
        assert_eq!(
            regs.scalar_width("system"),
            Some(&Width::Opaque("sys_context".into()))
        );
    }

    #[test]
    fn redeclaration_updates_in_place() {
        let mut regs = Registers::new();
        line(&mut regs, "cycles 32");
        let count = regs
            .decls()
            .iter()
            .filter(|d| d.name() == "cycles")
            .count();
        assert_eq!(count, 1);
    }

    #[test]
    fn names_are_unique_across_kinds() {
        let mut regs = Registers::new();
        line(&mut regs, "a 8");
        let parts: Vec<String> = ["a", "ptr8", "1"].iter().map(|s| s.to_string()).collect();
        assert_eq!(
            regs.process_line(&parts, 5),
            Err(ParseError::DuplicateRegister {
                line: 5,
                name: "a".into()
            })
        );
        let parts: Vec<String> = ["arr", "8", "a", "b"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(
            regs.process_line(&parts, 6),
            Err(ParseError::DuplicateRegister {
                line: 6,
                name: "a".into()
            })
        );
    }

    #[test]
    fn display_round_trips_declarations() {
        let mut regs = Registers::new();
        line(&mut regs, "pc 16");
        line(&mut regs, "main 8 b c a");
        line(&mut regs, "scratch 8 4");
        let printed = regs.to_string();
        let mut reparsed = Registers::new();
        for text in printed.lines() {
            let parts: Vec<String> =
                text.split_whitespace().map(str::to_owned).collect();
            reparsed.process_line(&parts, 1).unwrap();
        }
        assert_eq!(regs, reparsed);
    }
}
