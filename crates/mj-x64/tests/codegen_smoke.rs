//! End-to-end lowering of the remaining operator surface: field loads and
//! stores, remainder, negation, stack-passed parameters and mangled call
//! targets.

use mj_x64::ir::{GraphBuilder, Mode};
use mj_x64::mangle::{Mangler, Platform};
use mj_x64::test_harness::*;
use mj_x64::x64::{InstrKind, Operand, Reg, RegRef};

#[test]
fn field_load_and_store_use_base_addressing() {
    let mut b = GraphBuilder::new("field", &[Mode::Int64]);
    let entry = b.entry();
    let this = b.arg(0);
    let mem = b.start_mem();
    let (value, mem) = b.load(entry, mem, this, Mode::Int32);
    let neg = b.neg(entry, value);
    let mem = b.store(entry, mem, this, neg);
    b.ret(entry, mem, None);
    let compiled = compile(&b.finish());

    let instrs = all_instrs(&compiled);
    assert!(has_kind(&instrs, InstrKind::Neg));
    // One load from and one store through the object pointer.
    let mem_reads = instrs
        .iter()
        .filter(|i| matches!(i, mj_x64::x64::Instr::Mov { src: Operand::Mem(..), dst } if !dst.is_mem()))
        .count();
    let mem_writes = instrs
        .iter()
        .filter(|i| matches!(i, mj_x64::x64::Instr::Mov { dst: Operand::Mem(..), .. }))
        .count();
    assert!(mem_reads >= 1, "missing field load");
    assert!(mem_writes >= 1, "missing field store");
}

#[test]
fn remainder_comes_out_of_edx() {
    let mut b = GraphBuilder::new("rem", &[Mode::Int32, Mode::Int32]);
    let entry = b.entry();
    let x = b.arg(0);
    let y = b.arg(1);
    let mem = b.start_mem();
    let (r, mem) = b.modulo(entry, mem, x, y);
    b.ret(entry, mem, Some(r));
    let compiled = compile(&b.finish());

    let instrs = all_instrs(&compiled);
    assert_has_pattern(
        &instrs,
        &[InstrPattern::Cltd, InstrPattern::Idiv { divisor: Pat::Any }],
    );
    // The remainder is copied out of %edx right after the division.
    let idiv_at = instrs
        .iter()
        .position(|i| i.kind() == InstrKind::Idiv)
        .unwrap();
    let copy_out = &instrs[idiv_at + 1];
    assert!(
        matches!(
            copy_out,
            mj_x64::x64::Instr::Mov {
                src: Operand::Reg(_, RegRef::Phys(Reg::D)),
                ..
            }
        ),
        "expected the remainder copy from %edx, got {copy_out}"
    );
}

#[test]
fn seven_parameters_reach_the_callee() {
    // f(p0..p6) forwards all seven to a helper; the seventh travels on the
    // stack in both directions.
    let modes = [Mode::Int32; 7];
    let mut b = GraphBuilder::new("seven", &modes);
    let entry = b.entry();
    let params: Vec<_> = (0..7).map(|i| b.arg(i)).collect();
    let mem = b.start_mem();
    let (res, mem) = b.call(entry, mem, "__Helper_M_take", &params, Some(Mode::Int32));
    b.ret(entry, mem, res);
    let compiled = compile(&b.finish());
    let text = compiled.to_string();

    // Incoming seventh parameter: loaded from above the frame base.
    assert!(text.contains("16(%rbp)"), "stack parameter not loaded:\n{text}");
    // Outgoing seventh argument: stored below the stack pointer.
    assert!(text.contains("(%rsp)"), "stack argument not stored:\n{text}");
    assert!(text.contains("call __Helper_M_take"));
    // The call region is released afterwards.
    assert!(text.contains("addq $16, %rsp"));
}

#[test]
fn mangled_names_flow_through_unchanged() {
    let mangler = Mangler::new(Platform::Linux);
    let entry_sym = mangler.entry();
    let print_sym = mangler.print_int();

    let mut b = GraphBuilder::new(&entry_sym, &[]);
    let entry = b.entry();
    let zero = b.const_i32(0);
    let mem = b.start_mem();
    let (_, mem) = b.call(entry, mem, &print_sym, &[zero], None);
    b.ret(entry, mem, Some(zero));
    let compiled = compile(&b.finish());

    assert_eq!(compiled.name(), "mjMain");
    let text = compiled.to_string();
    assert!(text.contains(".globl mjMain"));
    assert!(text.contains("call print_int"));
}

#[test]
fn allocation_of_method_symbols_on_darwin() {
    let mangler = Mangler::new(Platform::Darwin);
    let mut b = GraphBuilder::new(&mangler.entry(), &[]);
    let entry = b.entry();
    let eight = b.const_(Mode::Int64, 8);
    let one = b.const_(Mode::Int64, 1);
    let mem = b.start_mem();
    let (ptr, mem) = b.call(entry, mem, &mangler.calloc(), &[one, eight], Some(Mode::Int64));
    let mem = b.store(entry, mem, ptr.unwrap(), one);
    let zero = b.const_i32(0);
    b.ret(entry, mem, Some(zero));
    let compiled = compile(&b.finish());

    let text = compiled.to_string();
    assert!(text.contains(".globl _mjMain"));
    assert!(text.contains("call _calloc_impl"));
}
