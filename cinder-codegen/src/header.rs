//! Companion header emission
//!
//! The header declares the `<prefix>options` and `<prefix>context` records
//! (pointers first with their declared star depth, opaque C types verbatim,
//! then numeric fields widest-first for packing), forwards the `declare`
//! lines, and prototypes the `<prefix>execute` entry point.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use cinder_dsl::regs::{Decl, Members, Registers, Width};

use crate::error::Result;
use crate::generator::Generator;

fn write_registers(file: &mut File, registers: &Registers) -> Result<()> {
    struct Field<'a> {
        size: u32,
        count: u32,
        name: &'a str,
    }
    let mut numeric: Vec<Field<'_>> = Vec::new();
    for decl in registers.decls() {
        if let Decl::Pointer {
            name,
            target,
            count,
        } = decl
        {
            let mut stars = "*".to_owned();
            let mut target = target.as_str();
            while let Some(rest) = target.strip_prefix("ptr") {
                stars.push('*');
                target = rest;
            }
            let ptype = if target.chars().all(|c| c.is_ascii_digit()) {
                format!("uint{target}_t")
            } else {
                target.to_owned()
            };
            let array = if *count > 1 {
                format!("[{count}]")
            } else {
                String::new()
            };
            write!(file, "\n\t{ptype} {stars}{name}{array};")?;
        }
    }
    for decl in registers.decls() {
        match decl {
            Decl::Scalar { name, width } => match width {
                Width::Bits(size) => numeric.push(Field {
                    size: *size,
                    count: 1,
                    name,
                }),
                Width::Opaque(ty) => write!(file, "\n\t{ty} {name};")?,
            },
            Decl::Array {
                name,
                width,
                members,
            } => match width {
                Width::Bits(size) => numeric.push(Field {
                    size: *size,
                    count: members.len(),
                    name,
                }),
                Width::Opaque(ty) => {
                    let count = match members {
                        Members::Count(count) => *count,
                        Members::Named(names) => names.len() as u32,
                    };
                    write!(file, "\n\t{ty} {name}[{count}];")?;
                }
            },
            Decl::Pointer { .. } => {}
        }
    }
    // Widest first; declaration order breaks ties.
    numeric.sort_by(|a, b| b.size.cmp(&a.size));
    for field in numeric {
        if field.count > 1 {
            write!(
                file,
                "\n\tuint{}_t {}[{}];",
                field.size, field.name, field.count
            )?;
        } else {
            write!(file, "\n\tuint{}_t {};", field.size, field.name)?;
        }
    }
    Ok(())
}

impl Generator<'_> {
    /// Write the companion header to the path named by `info.header`.
    pub fn write_header(&self, header: &str) -> Result<()> {
        let mut file = File::create(Path::new(header))?;
        let guard = header.to_uppercase().replace('.', "_");
        write!(file, "#ifndef {guard}_")?;
        write!(file, "\n#define {guard}_")?;
        write!(file, "\n#include <stdio.h>")?;
        write!(file, "\n#include \"backend.h\"")?;
        if self.pc_reg.is_some() {
            write!(file, "\n#include \"tern.h\"")?;
        }
        let prefix = &self.prefix;
        write!(file, "\n\ntypedef struct {prefix}options {prefix}options;")?;
        write!(file, "\n\ntypedef struct {prefix}context {prefix}context;")?;
        for declare in &self.prog.declares {
            if let Some(define) = declare.strip_prefix("define ") {
                write!(file, "\n#define {define}")?;
            } else {
                write!(file, "\n{declare}")?;
            }
        }
        write!(file, "\n\nstruct {prefix}options {{")?;
        write!(file, "\n\tcpu_options gen;")?;
        write!(file, "\n\tFILE* address_log;")?;
        write!(file, "\n}};")?;
        write!(file, "\n\nstruct {prefix}context {{")?;
        write!(file, "\n\t{prefix}options *opts;")?;
        if self.pc_reg.is_some() {
            write!(file, "\n\ttern_node *breakpoints;")?;
        }
        write_registers(&mut file, &self.prog.registers)?;
        write!(file, "\n}};")?;
        writeln!(file)?;
        write!(
            file,
            "\nvoid {prefix}execute({} *context, uint32_t target_cycle);",
            self.context_type
        )?;
        write!(file, "\n#endif //{guard}_")?;
        writeln!(file)?;
        Ok(())
    }
}
