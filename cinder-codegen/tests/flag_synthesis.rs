//! Flag-update synthesis over the documented calc kinds.

use cinder_codegen::{Dispatch, Generator};

fn build(body: &str) -> String {
    let source = format!(
        "\
info
	prefix cpu_

regs
	a 8
	b 8
	f 8
	szflags 8
	zflag 8
	hflag 8
	cflag 8
	vflag 8
	pflag 8
	op 8

flags
	register f
	S 7 sign szflags.7
	Z 6 zero zflag
	V 5 overflow vflag
	H 4 half-carry hflag.4
	P 2 parity pflag
	C 0 carry cflag

00000000 probe
{body}
"
    );
    let program = cinder_dsl::parse(&source).expect("flag scenario parses");
    let mut generator = Generator::new(&program, Dispatch::Call, &[]).expect("generator");
    generator.build().expect("generation succeeds")
}

#[test]
fn add_synthesizes_sign_zero_half_carry() {
    let output = build("\ta += 3\n\tupdate_flags SZHC");
    // The result stages into a doubled temporary so carry is observable.
    assert!(output.contains("\n\tgen_tmp16__ = 3 + context->a;"));
    // Sign: the storage bit coincides with the result bit, full copy.
    assert!(output.contains("\n\tcontext->szflags = gen_tmp16__;"));
    // Zero: result masked back to the operation size.
    assert!(output.contains("\n\tcontext->zflag = (gen_tmp16__ & 255) == 0;"));
    // Half-carry: bit 4 of a ^ b ^ result, direct-copied.
    assert!(output.contains("\n\tcontext->hflag = (3 ^ context->a ^ gen_tmp16__);"));
    // Carry: bit 8 of the widened result, shifted into an 8-bit scalar.
    assert!(output.contains("\n\tcontext->cflag = gen_tmp16__ >> 1 & 128U;"));
    // The staged result commits back to the real destination.
    assert!(output.contains("\n\tcontext->a = gen_tmp16__;"));
}

#[test]
fn subtract_synthesizes_overflow() {
    let output = build("\ta -= b\n\tupdate_flags V");
    assert!(output.contains("\n\tgen_tmp8__ = context->a - context->b;"));
    assert!(output.contains(
        "\n\tcontext->vflag = (((context->a ^ context->b)) & (context->a ^ gen_tmp8__)) & 128U;"
    ));
    assert!(output.contains("\n\tcontext->a = gen_tmp8__;"));
}

#[test]
fn negate_carry_tests_the_result() {
    let output = build("\ta = -a\n\tupdate_flags C");
    assert!(output.contains("\n\tgen_tmp8__ = -context->a;"));
    assert!(output.contains("\n\tcontext->cflag = gen_tmp8__ != 0;"));
    assert!(output.contains("\n\tcontext->a = gen_tmp8__;"));
}

#[test]
fn shift_left_carry_is_the_shifted_out_bit() {
    let output = build("\ta <<= 1\n\tupdate_flags C");
    assert!(output.contains("\n\tgen_tmp16__ = context->a << 1;"));
    assert!(output.contains("\n\tcontext->cflag = gen_tmp16__ >> 1 & 128U;"));
}

#[test]
fn zero_count_shift_clears_carry_explicitly() {
    let output = build("\ta <<= 0\n\tupdate_flags C");
    assert!(output.contains("\n\tcontext->cflag = 0;"));
    assert!(!output.contains("128U"));
}

#[test]
fn runtime_shift_count_guards_the_carry() {
    let output = build("\ta >>= b\n\tupdate_flags C");
    assert!(output.contains("\n\tgen_tmp8__ = context->a >> context->b;"));
    assert!(output.contains("\n\tif (!context->b) {"));
    assert!(output.contains("\n\tcontext->cflag = 0;"));
    assert!(output.contains("\n\t} else {"));
    assert!(output.contains("\n\tcontext->cflag = !!(context->a & (1 << (context->b - 1)));"));
}

#[test]
fn rotate_carry_reads_the_rotated_in_bit() {
    let output = build("\trol a 1 a\n\tupdate_flags C");
    assert!(output.contains("\n\tcontext->a = context->a << 1 | context->a >> (8 - 1);"));
    assert!(output.contains("\n\tcontext->cflag = context->a & 1U;"));
}

#[test]
fn parity_folds_bytes_through_the_lookup_constant() {
    let output = build("\ta += 3\n\tupdate_flags P");
    assert!(output.contains("\n\tgen_tmp8__ = (context->a ^ (context->a >> 4)) & 0xF;"));
    assert!(output.contains("\n\tcontext->pflag = 0x9669 >> gen_tmp8__ & 1;"));
}

#[test]
fn explicit_writes_set_and_clear_storage() {
    let output = build("\tupdate_flags H1C0");
    assert!(output.contains("\n\tcontext->hflag |= 16;"));
    assert!(output.contains("\n\tcontext->cflag = 0;"));
}

#[test]
fn undefined_flag_letters_are_fatal() {
    let source = "\
info
	prefix cpu_

regs
	a 8
	op 8

00000000 probe
	a += 1
	update_flags Q
";
    let program = cinder_dsl::parse(source).unwrap();
    let mut generator = Generator::new(&program, Dispatch::Call, &[]).unwrap();
    let error = generator.build().unwrap_err().to_string();
    assert!(error.contains("undefined flag Q"));
}
