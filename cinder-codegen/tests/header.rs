//! Companion header layout.

use cinder_codegen::{Dispatch, Generator};

const SOURCE: &str = "\
info
	prefix cpu_
	pc_reg pc
	header cpu.h

regs
	pc 16
	a 8
	wide 32
	main 8 b c
	scratch 16 4
	mem_pointers ptr8 4
	sys system_header
	opaque_arr sys_slot 2

declare
	define MAX_THING 4
	typedef void (*hook_fun)(void *context);

00000000 nop
";

fn written_header() -> String {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("cpu.h");
    let program = cinder_dsl::parse(SOURCE).expect("header source parses");
    let generator = Generator::new(&program, Dispatch::Call, &[]).expect("generator");
    generator
        .write_header(path.to_str().expect("utf-8 temp path"))
        .expect("header written");
    std::fs::read_to_string(&path).expect("header readable")
}

#[test]
fn guard_and_includes() {
    let header = written_header();
    assert!(header.contains("#include <stdio.h>"));
    assert!(header.contains("#include \"backend.h\""));
    // pc_reg pulls in the breakpoint registry.
    assert!(header.contains("#include \"tern.h\""));
    assert!(header.ends_with("\n"));
}

#[test]
fn records_and_prototype() {
    let header = written_header();
    assert!(header.contains("typedef struct cpu_options cpu_options;"));
    assert!(header.contains("typedef struct cpu_context cpu_context;"));
    assert!(header.contains("struct cpu_options {"));
    assert!(header.contains("\n\tcpu_options *opts;"));
    assert!(header.contains("\n\ttern_node *breakpoints;"));
    assert!(header.contains("void cpu_execute(cpu_context *context, uint32_t target_cycle);"));
}

#[test]
fn declares_are_forwarded() {
    let header = written_header();
    assert!(header.contains("\n#define MAX_THING 4"));
    assert!(header.contains("\ntypedef void (*hook_fun)(void *context);"));
}

#[test]
fn pointers_and_opaque_types_come_first() {
    let header = written_header();
    assert!(header.contains("\n\tuint8_t *mem_pointers[4];"));
    assert!(header.contains("\n\tsystem_header sys;"));
    assert!(header.contains("\n\tsys_slot opaque_arr[2];"));
}

#[test]
fn numeric_fields_sort_widest_first() {
    let header = written_header();
    let cycles = header.find("uint32_t cycles;").expect("implicit counter");
    let wide = header.find("uint32_t wide;").expect("wide scalar");
    let pc = header.find("uint16_t pc;").expect("pc");
    let scratch = header.find("uint16_t scratch[4];").expect("scratch array");
    let a = header.find("uint8_t a;").expect("a");
    let main = header.find("uint8_t main[2];").expect("named array");
    // Descending width; declaration order breaks ties.
    assert!(cycles < wide);
    assert!(wide < pc);
    assert!(pc < scratch);
    assert!(scratch < a);
    assert!(a < main);
}
