//! Line-oriented parser
//!
//! Top-level lines (no leading whitespace) select or create the current
//! container: the `regs`/`info`/`flags`/`declare` sections, an instruction
//! header (`[table] bitpattern name`), or a subroutine (any other single
//! token). Indented lines belong to the current container. All diagnostics
//! are collected; a file parses either to a complete [`Program`] or to the
//! full list of its errors.

use crate::error::{ParseError, ParseErrors};
use crate::ir::{self, Arm, If, Loop, NormalOp, Stmt, Switch};
use crate::lex;
use crate::program::{Instruction, Program, SubRoutine};

const COMPARE_OPS: [&str; 3] = [">=U", "=", "!="];

enum Root {
    Inst { table: String, inst: Instruction },
    Sub(SubRoutine),
}

enum ArmCursor {
    None,
    Case,
    Default,
}

enum Open {
    Switch {
        line: usize,
        param: String,
        cases: Vec<(i64, Arm)>,
        default: Option<Arm>,
        cur: ArmCursor,
    },
    If {
        line: usize,
        cond: String,
        locals: Vec<(String, u32)>,
        body: Vec<Stmt>,
        else_locals: Vec<(String, u32)>,
        else_body: Vec<Stmt>,
        in_else: bool,
    },
    Loop {
        line: usize,
        count: Option<String>,
        locals: Vec<(String, u32)>,
        body: Vec<Stmt>,
    },
}

impl Open {
    fn keyword(&self) -> &'static str {
        match self {
            Open::Switch { .. } => "switch",
            Open::If { .. } => "if",
            Open::Loop { .. } => "loop",
        }
    }

    fn opened_at(&self) -> usize {
        match self {
            Open::Switch { line, .. } | Open::If { line, .. } | Open::Loop { line, .. } => *line,
        }
    }
}

struct CodeBuilder {
    root: Root,
    stack: Vec<Open>,
}

impl CodeBuilder {
    fn push_stmt(&mut self, stmt: Stmt, line: usize) -> Result<(), ParseError> {
        match self.stack.last_mut() {
            Some(Open::Switch {
                cases,
                default,
                cur,
                ..
            }) => match cur {
                ArmCursor::None => Err(ParseError::OrphanSwitchStatement { line }),
                ArmCursor::Case => {
                    if let Some((_, arm)) = cases.last_mut() {
                        arm.body.push(stmt);
                    }
                    Ok(())
                }
                ArmCursor::Default => {
                    if let Some(arm) = default.as_mut() {
                        arm.body.push(stmt);
                    }
                    Ok(())
                }
            },
            Some(Open::If {
                body,
                else_body,
                in_else,
                ..
            }) => {
                if *in_else {
                    else_body.push(stmt);
                } else {
                    body.push(stmt);
                }
                Ok(())
            }
            Some(Open::Loop { body, .. }) => {
                body.push(stmt);
                Ok(())
            }
            None => {
                match &mut self.root {
                    Root::Inst { inst, .. } => inst.implementation.push(stmt),
                    Root::Sub(sub) => sub.implementation.push(stmt),
                }
                Ok(())
            }
        }
    }

    fn add_local(&mut self, name: &str, width: u32, line: usize) -> Result<(), ParseError> {
        let entry = (name.to_owned(), width);
        match self.stack.last_mut() {
            Some(Open::Switch {
                cases,
                default,
                cur,
                ..
            }) => match cur {
                ArmCursor::None => Err(ParseError::OrphanSwitchStatement { line }),
                ArmCursor::Case => {
                    if let Some((_, arm)) = cases.last_mut() {
                        arm.locals.push(entry);
                    }
                    Ok(())
                }
                ArmCursor::Default => {
                    if let Some(arm) = default.as_mut() {
                        arm.locals.push(entry);
                    }
                    Ok(())
                }
            },
            Some(Open::If {
                locals,
                else_locals,
                in_else,
                ..
            }) => {
                if *in_else {
                    else_locals.push(entry);
                } else {
                    locals.push(entry);
                }
                Ok(())
            }
            Some(Open::Loop { locals, .. }) => {
                locals.push(entry);
                Ok(())
            }
            None => {
                match &mut self.root {
                    Root::Inst { inst, .. } => inst.locals.push(entry),
                    Root::Sub(sub) => sub.locals.push(entry),
                }
                Ok(())
            }
        }
    }

    fn close_block(&mut self, line: usize) -> Result<(), ParseError> {
        let open = self.stack.pop().ok_or(ParseError::StrayEnd { line })?;
        let stmt = match open {
            Open::Switch {
                param,
                cases,
                default,
                ..
            } => Stmt::Switch(Switch {
                param,
                cases,
                default,
            }),
            Open::If {
                cond,
                locals,
                body,
                else_locals,
                else_body,
                ..
            } => Stmt::If(If {
                cond,
                locals,
                body,
                else_locals,
                else_body,
            }),
            Open::Loop {
                count,
                locals,
                body,
                ..
            } => Stmt::Loop(Loop {
                count,
                locals,
                body,
            }),
        };
        self.push_stmt(stmt, line)
    }

    fn process_line(&mut self, parts: Vec<String>, line: usize) -> Result<(), ParseError> {
        match parts[0].as_str() {
            "switch" => {
                let param = parts
                    .get(1)
                    .ok_or(ParseError::MalformedStatement {
                        line,
                        what: "switch",
                    })?
                    .clone();
                self.stack.push(Open::Switch {
                    line,
                    param,
                    cases: Vec::new(),
                    default: None,
                    cur: ArmCursor::None,
                });
                Ok(())
            }
            "if" => {
                let cond = if parts.len() == 4 && COMPARE_OPS.contains(&parts[2].as_str()) {
                    self.push_stmt(
                        Stmt::Op(NormalOp {
                            op: "cmp".to_owned(),
                            params: vec![parts[3].clone(), parts[1].clone()],
                        }),
                        line,
                    )?;
                    parts[2].clone()
                } else {
                    parts
                        .get(1)
                        .ok_or(ParseError::MalformedStatement { line, what: "if" })?
                        .clone()
                };
                self.stack.push(Open::If {
                    line,
                    cond,
                    locals: Vec::new(),
                    body: Vec::new(),
                    else_locals: Vec::new(),
                    else_body: Vec::new(),
                    in_else: false,
                });
                Ok(())
            }
            "loop" => {
                self.stack.push(Open::Loop {
                    line,
                    count: parts.get(1).cloned(),
                    locals: Vec::new(),
                    body: Vec::new(),
                });
                Ok(())
            }
            "end" => self.close_block(line),
            "else" => match self.stack.last_mut() {
                Some(Open::If { in_else, .. }) if !*in_else => {
                    *in_else = true;
                    Ok(())
                }
                _ => Err(ParseError::MisplacedElse { line }),
            },
            "case" => match self.stack.last_mut() {
                Some(Open::Switch { cases, cur, .. }) => {
                    let token = parts.get(1).ok_or(ParseError::MalformedStatement {
                        line,
                        what: "case",
                    })?;
                    let value = lex::parse_int(token).ok_or_else(|| ParseError::BadNumber {
                        line,
                        token: token.clone(),
                    })?;
                    cases.push((value, Arm::default()));
                    *cur = ArmCursor::Case;
                    Ok(())
                }
                _ => Err(ParseError::MisplacedArm { line, what: "case" }),
            },
            "default" => match self.stack.last_mut() {
                Some(Open::Switch { default, cur, .. }) => {
                    *default = Some(Arm::default());
                    *cur = ArmCursor::Default;
                    Ok(())
                }
                _ => Err(ParseError::MisplacedArm {
                    line,
                    what: "default",
                }),
            },
            "local" => {
                let [_, name, width] = parts.as_slice() else {
                    return Err(ParseError::MalformedStatement {
                        line,
                        what: "local",
                    });
                };
                let width = lex::parse_uint(width, line)?;
                let name = name.clone();
                self.add_local(&name, width, line)
            }
            "arg" => {
                if !self.stack.is_empty() {
                    return Err(ParseError::MisplacedArg { line });
                }
                let Root::Sub(sub) = &mut self.root else {
                    return Err(ParseError::MisplacedArg { line });
                };
                let [_, name, width] = parts.as_slice() else {
                    return Err(ParseError::MalformedStatement { line, what: "arg" });
                };
                let width = lex::parse_uint(width, line)?;
                sub.args.push((name.clone(), width));
                Ok(())
            }
            "invalid" => {
                let inst = self.instruction_root(line, "invalid")?;
                let params = &parts[1..];
                if params.len() == 2 {
                    let value = lex::parse_uint(&params[1], line)?;
                    inst.add_invalid_value(&params[0], value);
                } else if params.len() >= 4 && params.len() % 2 == 0 {
                    let mut combo = Vec::with_capacity(params.len() / 2);
                    for pair in params.chunks(2) {
                        combo.push((pair[0].clone(), lex::parse_uint(&pair[1], line)?));
                    }
                    inst.invalid_combos.push(combo);
                } else {
                    return Err(ParseError::MalformedStatement {
                        line,
                        what: "invalid",
                    });
                }
                Ok(())
            }
            "nospecialize" => {
                let inst = self.instruction_root(line, "nospecialize")?;
                for field in &parts[1..] {
                    inst.no_specialize.insert(field.clone());
                }
                Ok(())
            }
            _ => {
                let normalized = ir::normalize(parts);
                self.push_stmt(Stmt::Op(NormalOp::new(normalized)), line)
            }
        }
    }

    fn instruction_root(
        &mut self,
        line: usize,
        what: &'static str,
    ) -> Result<&mut Instruction, ParseError> {
        if !self.stack.is_empty() {
            return Err(ParseError::MisplacedInstructionMeta { line, what });
        }
        match &mut self.root {
            Root::Inst { inst, .. } => Ok(inst),
            Root::Sub(_) => Err(ParseError::MisplacedInstructionMeta { line, what }),
        }
    }
}

enum Section {
    None,
    Regs,
    Info,
    Flags,
    Declares,
    Code(CodeBuilder),
}

/// Parse a complete CPU description, collecting every diagnostic.
pub fn parse(source: &str) -> Result<Program, ParseErrors> {
    let mut program = Program::default();
    let mut errors: Vec<ParseError> = Vec::new();
    let mut section = Section::None;

    for (idx, raw) in source.lines().enumerate() {
        let line_no = idx + 1;
        let line = lex::strip_comment(raw);
        if line.trim().is_empty() {
            continue;
        }
        if line.starts_with(char::is_whitespace) {
            let parts = match lex::tokenize(line, line_no) {
                Ok(parts) => parts,
                Err(err) => {
                    errors.push(err);
                    continue;
                }
            };
            if parts.is_empty() {
                continue;
            }
            let result = match &mut section {
                Section::None => Err(ParseError::OrphanLine { line: line_no }),
                Section::Regs => program.registers.process_line(&parts, line_no),
                Section::Info => {
                    program.info.add(&parts[0], parts[1..].to_vec());
                    Ok(())
                }
                Section::Flags => program.flags.process_line(&parts, line_no),
                Section::Declares => {
                    program.declares.push(parts.join(" "));
                    Ok(())
                }
                Section::Code(builder) => builder.process_line(parts, line_no),
            };
            if let Err(err) = result {
                errors.push(err);
            }
            continue;
        }

        // A new top-level object; seal whatever was being built.
        finish_section(&mut section, &mut program, &mut errors);
        let parts: Vec<&str> = line.split_whitespace().collect();
        match parts.as_slice() {
            ["regs"] => section = Section::Regs,
            ["info"] => section = Section::Info,
            ["flags"] => section = Section::Flags,
            ["declare"] => section = Section::Declares,
            [name] => {
                section = Section::Code(CodeBuilder {
                    root: Root::Sub(SubRoutine::new(name)),
                    stack: Vec::new(),
                });
            }
            [pattern, name] | ["main", pattern, name] => {
                match Instruction::from_pattern(pattern, name, line_no) {
                    Ok(inst) => {
                        section = Section::Code(CodeBuilder {
                            root: Root::Inst {
                                table: "main".to_owned(),
                                inst,
                            },
                            stack: Vec::new(),
                        });
                    }
                    Err(err) => {
                        errors.push(err);
                        section = Section::None;
                    }
                }
            }
            [table, pattern, name] => match Instruction::from_pattern(pattern, name, line_no) {
                Ok(inst) => {
                    section = Section::Code(CodeBuilder {
                        root: Root::Inst {
                            table: (*table).to_owned(),
                            inst,
                        },
                        stack: Vec::new(),
                    });
                }
                Err(err) => {
                    errors.push(err);
                    section = Section::None;
                }
            },
            _ => {
                errors.push(ParseError::MalformedHeader { line: line_no });
                section = Section::None;
            }
        }
    }
    finish_section(&mut section, &mut program, &mut errors);

    if errors.is_empty() {
        Ok(program)
    } else {
        Err(ParseErrors(errors))
    }
}

fn finish_section(section: &mut Section, program: &mut Program, errors: &mut Vec<ParseError>) {
    let previous = std::mem::replace(section, Section::None);
    let Section::Code(builder) = previous else {
        return;
    };
    for open in &builder.stack {
        errors.push(ParseError::UnclosedBlock {
            line: open.opened_at(),
            what: open.keyword(),
        });
    }
    match builder.root {
        Root::Inst { table, inst } => {
            program.table_mut(&table).instructions.push(inst);
        }
        Root::Sub(sub) => {
            if sub.implementation.is_empty() {
                errors.push(ParseError::EmptySubroutine {
                    name: sub.name.clone(),
                });
            }
            program.subroutines.push(sub);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SAMPLE: &str = r#"
info
	prefix test_
	opcode_size 8
	body decoder
	header test.h

regs
	pc 16
	a 8
	f 8
	op 8
	scratch 8 4

flags
	register f
	Z 6 zero f.6
	C 0 carry f.0

declare
	define TEST_THING 1

decoder
	op = 5
	dispatch op

10000sss add_s # adds a scratch register
	local tmp 8
	invalid s 5
	tmp = scratch.s
	a += tmp
	update_flags ZC

01000000 jump
	switch a
	case 0
	pc = 0
	default
	pc += 1
	end
	if Z
	cycles 4
	else
	cycles 8
	end
	loop 4
	a <<= 1
	end
"#;

    #[test]
    fn sample_parses_clean() {
        let program = parse(SAMPLE).unwrap();
        assert_eq!(program.info.first("prefix"), Some("test_"));
        assert_eq!(program.subroutines.len(), 1);
        assert_eq!(program.tables.len(), 1);
        assert_eq!(program.tables[0].instructions.len(), 2);
        let add = &program.tables[0].instructions[0];
        assert_eq!(add.name, "add_s");
        assert_eq!(add.varying_bits, 3);
        assert_eq!(add.invalid_values, vec![("s".to_owned(), vec![5])]);
        assert_eq!(add.locals, vec![("tmp".to_owned(), 8)]);
        assert_eq!(program.declares, vec!["define TEST_THING 1".to_owned()]);
    }

    #[test]
    fn blocks_nest() {
        let program = parse(SAMPLE).unwrap();
        let jump = &program.tables[0].instructions[1];
        assert_eq!(jump.implementation.len(), 3);
        let Stmt::Switch(sw) = &jump.implementation[0] else {
            panic!("expected switch");
        };
        assert_eq!(sw.param, "a");
        assert_eq!(sw.cases.len(), 1);
        assert!(sw.default.is_some());
        let Stmt::If(cond) = &jump.implementation[1] else {
            panic!("expected if");
        };
        assert_eq!(cond.cond, "Z");
        assert_eq!(cond.body.len(), 1);
        assert_eq!(cond.else_body.len(), 1);
        let Stmt::Loop(lp) = &jump.implementation[2] else {
            panic!("expected loop");
        };
        assert_eq!(lp.count.as_deref(), Some("4"));
    }

    #[test]
    fn comparison_if_injects_cmp() {
        let source = "sub\n\tif a >=U b\n\tcycles 1\n\tend\n";
        let program = parse(source).unwrap();
        let sub = &program.subroutines[0];
        let Stmt::Op(cmp) = &sub.implementation[0] else {
            panic!("expected injected cmp");
        };
        assert_eq!(cmp.op, "cmp");
        assert_eq!(cmp.params, vec!["b".to_owned(), "a".to_owned()]);
        let Stmt::If(cond) = &sub.implementation[1] else {
            panic!("expected if");
        };
        assert_eq!(cond.cond, ">=U");
    }

    #[test]
    fn errors_are_collected() {
        let source = "\torphan\nsub\n\tend\nbad one two three four\n";
        let errors = parse(source).unwrap_err().0;
        assert!(errors.contains(&ParseError::OrphanLine { line: 1 }));
        assert!(errors.contains(&ParseError::StrayEnd { line: 3 }));
        assert!(errors.contains(&ParseError::MalformedHeader { line: 4 }));
        assert!(errors
            .iter()
            .any(|e| matches!(e, ParseError::EmptySubroutine { .. })));
    }

    #[test]
    fn unclosed_blocks_are_reported() {
        let source = "sub\n\tswitch a\n\tcase 0\n\tcycles 1\n";
        let errors = parse(source).unwrap_err().0;
        assert!(errors.contains(&ParseError::UnclosedBlock {
            line: 2,
            what: "switch"
        }));
    }

    #[test]
    fn explicit_table_headers() {
        let source = "cb 00000000 noop\n\tcycles 1\n";
        let program = parse(source).unwrap();
        assert_eq!(program.tables[0].name, "cb");
    }

    #[test]
    fn round_trip_is_stable() {
        let program = parse(SAMPLE).unwrap();
        let printed = program.to_string();
        let reparsed = parse(&printed).unwrap();
        assert_eq!(program, reparsed);
    }
}
