//! End-to-end generation scenarios over small CPU descriptions.

use cinder_codegen::{Dispatch, Generator};
use pretty_assertions::assert_eq;

fn build_with(source: &str, dispatch: Dispatch, defines: &[(&str, bool)]) -> String {
    let program = cinder_dsl::parse(source).expect("scenario source parses");
    let defines: Vec<(String, bool)> = defines
        .iter()
        .map(|(name, value)| (name.to_string(), *value))
        .collect();
    let mut generator =
        Generator::new(&program, dispatch, &defines).expect("generator construction");
    generator.build().expect("generation succeeds")
}

fn build(source: &str) -> String {
    build_with(source, Dispatch::Call, &[])
}

#[test]
fn nop_table_layout() {
    let source = "\
info
	prefix cpu_
	opcode_size 8
	body decode

regs
	a 16
	op 8

flags
	Z 0 zero a

decode
	dispatch op

00000000 nop
";
    let output = build(source);
    assert!(output.contains("static impl_fun impl_main[256] = {"));
    // Slot zero holds the only implemented opcode.
    assert!(output.contains("impl_main[256] = {\n\t&nop,\n\t&unimplemented,"));
    assert_eq!(output.matches("\n\t&unimplemented,").count(), 255);
    // The nop body declares nothing and does nothing.
    assert!(output.contains("\nstatic void nop(cpu_context *context, uint32_t target_cycle)\n{\n}"));
    // The execute loop inlines the decode subroutine.
    assert!(output.contains("\nvoid cpu_execute(cpu_context *context, uint32_t target_cycle)"));
    assert!(output.contains("\n\twhile (context->cycles < target_cycle)"));
    assert!(output.contains("\n\timpl_main[context->op](context, target_cycle);"));
    // Unimplemented slots report the dispatched opcode expression.
    assert!(output
        .contains("\n\tfatal_error(\"Unimplemented instruction: %X\\n\", context->op);"));
}

#[test]
fn field_specializations_enumerate() {
    let source = "\
info
	prefix cpu_
	opcode_size 8

regs
	op 8

0010ddd nop_d
";
    let output = build(source);
    for value in 0..8u32 {
        let name = format!("nop_d_d_{value:03b}");
        assert!(
            output.contains(&format!("\nstatic void {name}(")),
            "missing specialization {name}"
        );
        assert!(output.contains(&format!("\n\t&{name},")));
    }
}

#[test]
fn constants_fold_without_temporaries() {
    let source = "\
info
	prefix cpu_

regs
	b 16
	op 8

00000001 doit
	local a 16
	a = 5 + 3
	ocall out a

00000010 doreg
	b = 5 + 3
";
    let output = build(source);
    // The folded local feeds the call site as a literal.
    assert!(output.contains("\n\tcpu_out(context, 8);"));
    // A register destination still observes the constant store.
    assert!(output.contains("\n\tcontext->b = 8;"));
    assert!(!output.contains("gen_tmp"));
    assert!(!output.contains("= 5 + 3"));
}

#[test]
fn constant_comparison_folds_away_the_branch() {
    let source = "\
info
	prefix cpu_

regs
	op 8

00000011 dotest
	local a 8
	a = 7
	cmp 0 a
	if >=U
	ocall taken
	end
";
    let output = build(source);
    assert!(output.contains("\n\tcpu_taken(context);"));
    assert!(!output.contains("if ("));
    assert!(!output.contains("cmp_tmp8__ ="));
}

#[test]
fn subword_subtract_preserves_high_bits() {
    let source = "\
info
	prefix cpu_

regs
	a 16
	b 16
	op 8

00000100 dosub
	a:0 -= b
";
    let output = build(source);
    assert!(output.contains("\n\tgen_tmp8__ = (context->a & 255) - (context->b & 255);"));
    assert!(output.contains("\n\tcontext->a = (context->a & ~255) | gen_tmp8__;"));
    assert!(output.contains("\n\tuint8_t gen_tmp8__;"));
}

#[test]
fn adc_without_carry_flag_is_fatal() {
    let source = "\
info
	prefix cpu_

regs
	a 8
	b 8
	c 8
	op 8

00000101 bad
	adc a b c
";
    let program = cinder_dsl::parse(source).unwrap();
    let mut generator = Generator::new(&program, Dispatch::Call, &[]).unwrap();
    let error = generator.build().unwrap_err();
    let message = error.to_string();
    assert!(message.contains("in instruction bad"));
    assert!(
        format!("{error:#}").contains("adc requires a defined carry flag")
            || message.contains("adc requires a defined carry flag")
    );
}

#[test]
fn dead_configuration_branches_vanish() {
    let source = "\
info
	prefix cpu_

regs
	op 8

00000110 db
	if dynarec
	ocall dyn
	else
	ocall interp_path
	end
";
    let output = build(source);
    assert!(!output.contains("cpu_dyn("));
    assert!(output.contains("\n\tcpu_interp_path(context);"));
    assert!(!output.contains("if ("));

    let flipped = build_with(source, Dispatch::Call, &[("dynarec", true)]);
    assert!(flipped.contains("\n\tcpu_dyn(context);"));
    assert!(!flipped.contains("cpu_interp_path("));
}

#[test]
fn switch_with_constant_discriminator_inlines_one_arm() {
    let source = "\
info
	prefix cpu_

regs
	op 8

00100sss swtest
	switch s
	case 0
	ocall zero_case
	default
	ocall other
	end
";
    let output = build(source);
    assert!(!output.contains("switch("));
    assert!(output.contains("\nstatic void swtest_s_000(cpu_context *context"));
    assert!(output.contains("cpu_zero_case(context);"));
    assert!(output.contains("cpu_other(context);"));
    // The s=0 specialization takes the matching case, everything else the
    // default.
    let zero_at = output.find("swtest_s_000").unwrap();
    let zero_body = &output[zero_at..output[zero_at..].find("\n}").unwrap() + zero_at];
    assert!(zero_body.contains("cpu_zero_case"));
    assert!(!zero_body.contains("cpu_other"));
}

#[test]
fn runtime_switch_emits_cases_with_breaks() {
    let source = "\
info
	prefix cpu_

regs
	a 8
	op 8

01000000 swrun
	switch a
	case 0
	ocall zero_case
	default
	ocall other
	end
";
    let output = build(source);
    assert!(output.contains("\n\tswitch(context->a)"));
    assert!(output.contains("\n\tcase 0U: {"));
    assert!(output.contains("\n\tbreak;"));
    assert!(output.contains("\n\tdefault: {"));
}

#[test]
fn loops_flush_folded_locals() {
    let source = "\
info
	prefix cpu_

regs
	a 8
	op 8

01000001 looped
	local t 8
	t = 3
	loop 4
	a += t
	t <<= 1
	end
";
    let output = build(source);
    // The folded value of t lands in its variable before the loop body
    // can observe it changing.
    assert!(output.contains("\n\tt = 3;"));
    assert!(output
        .contains("\n\tfor (uint32_t loop_counter__ = 0; loop_counter__ < 4; loop_counter__++) {"));
    assert!(output.contains("\n\tcontext->a = t + context->a;"));
}

#[test]
fn nospecialize_extracts_at_runtime() {
    let source = "\
info
	prefix cpu_
	body decode

regs
	op 8

decode
	dispatch op

0001dddd move_d
	nospecialize d
	ocall use d
";
    let output = build(source);
    assert!(output.contains("\n\tuint8_t d = context->op & 15;"));
    assert!(output.contains("\n\tcpu_use(context, d);"));
    // One body, sixteen table slots.
    assert_eq!(output.matches("\nstatic void move_d(").count(), 1);
    assert_eq!(output.matches("\n\t&move_d,").count(), 16);
}

#[test]
fn goto_dispatch_threads_labels() {
    let source = "\
info
	prefix cpu_
	body decode
	sync_cycle do_sync

regs
	op 8

decode
	dispatch op

00000000 nop
";
    let output = build_with(source, Dispatch::Goto, &[]);
    assert!(output.contains("\nvoid cpu_execute(cpu_context *context, uint32_t target_cycle)"));
    assert!(output.contains("\n\tstatic void *impl_main[256] = {"));
    assert!(output.contains("\n\t\t&&nop,"));
    assert!(output.contains("\n\t\t&&unimplemented,"));
    assert!(output.contains("\n\tgoto *impl_main[context->op];"));
    assert!(output.contains("\nnop: {"));
    assert!(output.contains("\nunimplemented:"));
    assert!(output.contains("\n\tdo_sync(context, target_cycle);"));
    assert!(output.contains("\n\tif (context->cycles >= target_cycle) { return; }"));
}

#[test]
fn switch_dispatch_mode_is_rejected() {
    let source = "\
info
	prefix cpu_

regs
	op 8

00000000 nop
";
    let program = cinder_dsl::parse(source).unwrap();
    let mut generator = Generator::new(&program, Dispatch::Switch, &[]).unwrap();
    let error = generator.build().unwrap_err();
    assert_eq!(error.to_string(), "unsupported dispatch type switch");
}

#[test]
fn generation_is_deterministic() {
    let source = "\
info
	prefix z_
	opcode_size 8
	body decode

regs
	main 8 b c d e h l f a
	pc 16
	op 8

flags
	register f
	S 7 sign f.7
	Z 6 zero f.6
	C 0 carry f.0

decode
	dispatch op

10000sss add_s
	invalid s 6
	a += main.s
	update_flags SZC

01rrrsss mov_rs
	invalid r 6
	invalid s 6
	main.r = main.s
";
    let first = build(source);
    let second = build(source);
    assert_eq!(first, second);
}

#[test]
fn interrupt_window_brackets_the_execute_loop() {
    let source = "\
info
	prefix cpu_
	body decode
	sync_cycle do_sync
	interrupt irq

regs
	op 8

irq
	ocall check_irq

decode
	dispatch op

00000000 nop
";
    let output = build(source);
    assert!(output.contains("\n\t\tif (context->cycles >= context->sync_cycle) {"));
    assert!(output.contains("\n\t\t\tdo_sync(context, target_cycle);"));
    assert!(output.contains("\n\tcpu_check_irq(context);"));
}

#[test]
fn breakpoints_consult_the_ternary_tree() {
    let source = "\
info
	prefix cpu_
	body decode
	sync_cycle do_sync
	pc_reg pc
	pc_offset 2

regs
	pc 16
	op 8

decode
	dispatch op

00000000 nop
";
    let output = build(source);
    assert!(output.contains("\n\tif (context->breakpoints) {"));
    assert!(output.contains("\n\t\t\tuint32_t debug_pc = context->pc - 2;"));
    assert!(output.contains(
        "debug_handler handler = tern_find_ptr(context->breakpoints, tern_int_key(debug_pc, key_buf));"
    ));
    assert!(output.contains("\n\t\t\t\thandler(context, debug_pc);"));
}

#[test]
fn invalid_field_values_skip_slots() {
    let source = "\
info
	prefix cpu_

regs
	op 8

0010ddd nop_d
	invalid d 3
";
    let output = build(source);
    assert!(!output.contains("nop_d_d_011"));
    assert!(output.contains("nop_d_d_010"));
    assert!(output.contains("nop_d_d_100"));
}
