//! Constant-folding soundness: the operation table's pure evaluators
//! agree with a reference arithmetic model, and folded DSL programs emit
//! the reference result as a literal.

use cinder_codegen::{op_spec, Dispatch, Generator, OpKind};
use quickcheck_macros::quickcheck;
use rstest::rstest;

fn eval(kind: OpKind, args: &[i64]) -> i64 {
    let eval = op_spec(kind).eval.expect("op folds");
    (eval.apply)(args)
}

#[quickcheck]
fn add_matches_reference(a: i32, b: i32) -> bool {
    eval(OpKind::Add, &[a as i64, b as i64]) == a as i64 + b as i64
}

#[quickcheck]
fn sub_is_b_minus_a(a: i32, b: i32) -> bool {
    eval(OpKind::Sub, &[a as i64, b as i64]) == b as i64 - a as i64
}

#[quickcheck]
fn bitwise_ops_match_reference(a: i32, b: i32) -> bool {
    let (a, b) = (a as i64, b as i64);
    eval(OpKind::And, &[a, b]) == (a & b)
        && eval(OpKind::Or, &[a, b]) == (a | b)
        && eval(OpKind::Xor, &[a, b]) == (a ^ b)
}

#[quickcheck]
fn unary_ops_match_reference(a: i32) -> bool {
    let a = a as i64;
    eval(OpKind::Mov, &[a]) == a
        && eval(OpKind::Not, &[a]) == !a
        && eval(OpKind::Neg, &[a]) == -a
        && eval(OpKind::Lnot, &[a]) == i64::from(a == 0)
}

#[quickcheck]
fn shifts_match_reference(a: i32, b: u8) -> bool {
    let a = a as i64;
    let b = i64::from(b % 32);
    eval(OpKind::Lsl, &[a, b]) == (a << b) && eval(OpKind::Lsr, &[a, b]) == (a >> b)
}

#[quickcheck]
fn mulu_matches_reference(a: i16, b: i16) -> bool {
    eval(OpKind::Mulu, &[a as i64, b as i64]) == a as i64 * b as i64
}

#[rstest]
#[case(8, 0)]
#[case(8, 0xFF)]
#[case(8, 0x80)]
#[case(16, 0)]
#[case(16, 0xFFFF)]
#[case(16, 0x8000)]
#[case(32, 0)]
#[case(32, 0xFFFF_FFFF)]
#[case(32, 0x8000_0000)]
fn corner_operands_fold_consistently(#[case] width: u32, #[case] value: i64) {
    let max = if width >= 64 { u64::MAX } else { (1 << width) - 1 } as i64;
    assert_eq!(eval(OpKind::Add, &[value, 0]), value);
    assert_eq!(eval(OpKind::Sub, &[value, value]), 0);
    assert_eq!(eval(OpKind::And, &[value, max]), value & max);
    assert_eq!(eval(OpKind::Or, &[value, 0]), value);
    assert_eq!(eval(OpKind::Xor, &[value, value]), 0);
}

#[test]
fn size_helpers_fold() {
    // addsize/decsize step by two units per size code, one for code zero.
    assert_eq!(eval(OpKind::AddSize, &[0, 10]), 11);
    assert_eq!(eval(OpKind::AddSize, &[1, 10]), 12);
    assert_eq!(eval(OpKind::AddSize, &[2, 10]), 14);
    assert_eq!(eval(OpKind::DecSize, &[0, 10]), 9);
    assert_eq!(eval(OpKind::DecSize, &[2, 10]), 6);
}

fn emitted_constant(expr: &str) -> String {
    let source = format!(
        "\
info
	prefix cpu_

regs
	r 32
	op 8

00000000 fold
	r = {expr}
"
    );
    let program = cinder_dsl::parse(&source).expect("fold source parses");
    let mut generator = Generator::new(&program, Dispatch::Call, &[]).expect("generator");
    let output = generator.build().expect("generation succeeds");
    let needle = "context->r = ";
    let at = output.find(needle).expect("folded store present");
    let rest = &output[at + needle.len()..];
    rest[..rest.find(';').expect("terminated store")].to_owned()
}

#[rstest]
#[case("5 + 3", "8")]
#[case("5 - 3", "2")]
#[case("0x10 | 0x01", "17")]
#[case("0xff & 0x0f", "15")]
#[case("0b1010 ^ 0b0110", "12")]
#[case("1 << 4", "16")]
#[case("0x80 >> 3", "16")]
#[case("6 * 7", "42")]
#[case("~0", "-1")]
#[case("!7", "0")]
#[case("-5", "-5")]
fn folded_literals_reach_the_output(#[case] expr: &str, #[case] expected: &str) {
    assert_eq!(emitted_constant(expr), expected);
}
