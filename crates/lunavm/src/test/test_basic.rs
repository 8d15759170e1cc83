// Tests for the basic library
use std::rc::Rc;

use super::*;
use crate::lua_value::{LuaTable, LuaValue};
use crate::lua_vm::{OpCode, RuntimeErrorKind};

#[test]
fn test_type() {
    let mut vm = new_vm();
    let cases = [
        (LuaValue::Nil, "nil"),
        (LuaValue::Boolean(true), "boolean"),
        (num(1.0), "number"),
        (s("x"), "string"),
        (vm.create_table(), "table"),
        (vm.get_global("print"), "function"),
    ];
    for (value, expected) in cases {
        assert_eq!(call_global(&mut vm, "type", vec![value]).unwrap(), s(expected));
    }
    let err = call_global(&mut vm, "type", vec![]).unwrap_err();
    assert_eq!(err.kind(), Some(RuntimeErrorKind::BadArgument));
}

#[test]
fn test_tostring_and_tonumber() {
    let mut vm = new_vm();
    assert_eq!(call_global(&mut vm, "tostring", vec![num(10.0)]).unwrap(), s("10"));
    assert_eq!(call_global(&mut vm, "tostring", vec![num(0.5)]).unwrap(), s("0.5"));
    assert_eq!(call_global(&mut vm, "tostring", vec![LuaValue::Nil]).unwrap(), s("nil"));

    assert_eq!(call_global(&mut vm, "tonumber", vec![s("0x10")]).unwrap(), num(16.0));
    assert_eq!(call_global(&mut vm, "tonumber", vec![s(" 2.5 ")]).unwrap(), num(2.5));
    assert_eq!(call_global(&mut vm, "tonumber", vec![s("ff"), num(16.0)]).unwrap(), num(255.0));
    assert_eq!(call_global(&mut vm, "tonumber", vec![s("z")]).unwrap(), LuaValue::Nil);
    assert_eq!(
        call_global(&mut vm, "tonumber", vec![LuaValue::Boolean(true)]).unwrap(),
        LuaValue::Nil
    );
    let err = call_global(&mut vm, "tonumber", vec![s("10"), num(99.0)]).unwrap_err();
    assert!(err.to_string().contains("base out of range"));
}

#[test]
fn test_select() {
    let mut vm = new_vm();
    let args = |first: LuaValue| vec![first, s("a"), s("b"), s("c")];
    assert_eq!(call_global(&mut vm, "select", args(s("#"))).unwrap(), num(3.0));
    assert_eq!(call_global(&mut vm, "select", args(num(-1.0))).unwrap(), s("c"));
    assert_eq!(
        call_global(&mut vm, "select", args(num(2.0))).unwrap().into_multi(),
        vec![s("b"), s("c")]
    );
    assert!(call_global(&mut vm, "select", args(num(4.0))).unwrap().is_void());
    assert!(call_global(&mut vm, "select", args(num(0.0))).is_err());
}

#[test]
fn test_raw_access() {
    let mut vm = new_vm();
    let t = vm.create_table();
    call_global(&mut vm, "rawset", vec![t.clone(), s("k"), num(1.0)]).unwrap();
    assert_eq!(call_global(&mut vm, "rawget", vec![t.clone(), s("k")]).unwrap(), num(1.0));
    assert_eq!(call_global(&mut vm, "rawlen", vec![s("abcd")]).unwrap(), num(4.0));
    assert_eq!(call_global(&mut vm, "rawlen", vec![t.clone()]).unwrap(), num(0.0));
    assert_eq!(
        call_global(&mut vm, "rawequal", vec![t.clone(), t.clone()]).unwrap(),
        LuaValue::Boolean(true)
    );
    let other = vm.create_table();
    assert_eq!(
        call_global(&mut vm, "rawequal", vec![t, other.clone()]).unwrap(),
        LuaValue::Boolean(false)
    );
    let err = call_global(&mut vm, "rawset", vec![other, LuaValue::Nil, num(1.0)]).unwrap_err();
    assert_eq!(err.kind(), Some(RuntimeErrorKind::InvalidKey));
}

#[test]
fn test_protected_metatable() {
    let mut vm = new_vm();
    let t = vm.create_table();
    let mt = vm.new_table();
    mt.borrow_mut().set_str("__metatable", s("locked")).unwrap();

    let result = call_global(&mut vm, "setmetatable", vec![t.clone(), LuaValue::Table(mt)]).unwrap();
    assert_eq!(result, t);
    assert_eq!(call_global(&mut vm, "getmetatable", vec![t.clone()]).unwrap(), s("locked"));

    let err = call_global(&mut vm, "setmetatable", vec![t, LuaValue::Nil]).unwrap_err();
    assert_eq!(err.to_string(), "cannot change a protected metatable");
}

#[test]
fn test_metatable_from_another_script_is_rejected() {
    let mut vm = new_vm();
    let other = LuaVM::new(SafeOption::default());
    let foreign = other.new_table();
    let t = vm.create_table();
    let err = call_global(&mut vm, "setmetatable", vec![t, LuaValue::Table(foreign)]).unwrap_err();
    assert_eq!(err.kind(), Some(RuntimeErrorKind::CrossScriptLinkage));

    // Free-standing tables link anywhere.
    let free = LuaTable::new_ref();
    let t = vm.create_table();
    assert!(call_global(&mut vm, "setmetatable", vec![t, LuaValue::Table(free)]).is_ok());
}

#[test]
fn test_next_and_invalid_key() {
    let mut vm = new_vm();
    let t = vm.create_array(vec![s("x"), s("y")]).unwrap();
    let first = call_global(&mut vm, "next", vec![t.clone()]).unwrap();
    assert_eq!(first.into_multi(), vec![num(1.0), s("x")]);
    let last = call_global(&mut vm, "next", vec![t.clone(), num(2.0)]).unwrap();
    assert_eq!(last, LuaValue::Nil);
    let err = call_global(&mut vm, "next", vec![t, s("missing")]).unwrap_err();
    assert_eq!(err.to_string(), "invalid key to 'next'");
}

/// Script summing the values of a generic `for` over the iterator triple
/// pushed by `emit_iterable`; `setup` declares and fills the table.
fn sum_loop(
    emit_iterable: impl FnOnce(&mut ChunkBuilder, u32),
    setup: impl FnOnce(&mut ChunkBuilder) -> u32,
) -> ChunkBuilder {
    let mut b = script();
    let t = setup(&mut b);
    let sum = b.local("sum");
    let k = b.local("k");
    let v = b.local("v");
    let top = b.new_label();
    let exit = b.new_label();

    b.load_num(0.0).store(sum);
    emit_iterable(&mut b, t);
    b.op(OpCode::IterPrep);
    b.mark(top);
    b.op_a(OpCode::ExpTuple, 0).call(2);
    b.store_keep(k, 0).store_keep(v, 1);
    b.op_a(OpCode::Copy, 0).jump(OpCode::JNil, exit);
    b.op(OpCode::IterUpd);
    b.load(sum).load(v).op(OpCode::Add).store(sum);
    b.jump(OpCode::Jump, top);
    b.mark(exit).pop(2);
    b.load(sum).ret(1);
    b
}

/// local t = {10, 20, 30}; t.x = 100
fn fill_table(b: &mut ChunkBuilder) -> u32 {
    let t = b.local("t");
    b.op(OpCode::NewTable);
    for n in [10.0, 20.0, 30.0] {
        b.load_num(n).op_a(OpCode::TblInitI, 0);
    }
    b.store(t);
    b.load_num(100.0).load(t).index_set_n("x", 0).pop(1);
    t
}

#[test]
fn test_generic_for_over_plain_table() {
    // for k, v in t do sum = sum + v end
    let mut vm = new_vm();
    let b = sum_loop(
        |b, t| {
            b.load(t).load_nil().load_nil().op_a(OpCode::MkTuple, 3);
        },
        fill_table,
    );
    assert_eq!(run(&mut vm, b).unwrap(), num(160.0));
}

#[test]
fn test_pairs_and_ipairs() {
    let mut vm = new_vm();
    // for k, v in pairs(t) do ... end
    let b = sum_loop(
        |b, t| {
            let pairs = b.global("pairs");
            b.load(pairs).load(t).call(1);
        },
        fill_table,
    );
    assert_eq!(run(&mut vm, b).unwrap(), num(160.0));

    // for i, v in ipairs(t) do ... end stops at the array border
    let b = sum_loop(
        |b, t| {
            let ipairs = b.global("ipairs");
            b.load(ipairs).load(t).call(1);
        },
        fill_table,
    );
    assert_eq!(run(&mut vm, b).unwrap(), num(60.0));
}

#[test]
fn test_register_function() {
    let mut vm = new_vm();
    vm.register_function("double", |_vm, args| {
        let n = args.first().and_then(LuaValue::as_number).unwrap_or(0.0);
        Ok(LuaValue::number(n * 2.0))
    })
    .unwrap();

    // return double(21)
    let mut b = script();
    let double = b.global("double");
    b.load(double).load_num(21.0).call(1).ret(1);
    assert_eq!(run(&mut vm, b).unwrap(), num(42.0));
}

#[test]
fn test_multiple_results_expand_in_last_argument() {
    let mut vm = new_vm();
    vm.register_function("three", |_vm, _args| {
        Ok(LuaValue::tuple(vec![num(1.0), num(2.0), num(3.0)]))
    })
    .unwrap();
    let counted = Rc::new(std::cell::Cell::new(0usize));
    let seen = counted.clone();
    vm.register_function("count", move |_vm, args| {
        seen.set(args.len());
        Ok(LuaValue::Void)
    })
    .unwrap();

    // count(three(), three())  -> 1 + 3 arguments
    let mut b = script();
    let three = b.global("three");
    let count = b.global("count");
    b.load(count).load(three).call(0).load(three).call(0).call(2).pop(1).ret(0);
    run(&mut vm, b).unwrap();
    assert_eq!(counted.get(), 4);
}

#[test]
fn test_constructor_keeps_nil_holes() {
    // return {1, nil, 3, f()} with f() returning 4, 5
    let mut vm = new_vm();
    let mut b = script();
    b.op(OpCode::NewTable);
    b.load_num(1.0).op_a(OpCode::TblInitI, 0);
    b.load_nil().op_a(OpCode::TblInitI, 0);
    b.load_num(3.0).op_a(OpCode::TblInitI, 0);
    b.load_num(4.0).load_num(5.0).op_a(OpCode::MkTuple, 2);
    b.op_a(OpCode::TblInitI, 1).ret(1);
    let t = run(&mut vm, b).unwrap();
    let table = t.as_table().unwrap().borrow();
    assert_eq!(table.get_int(1), num(1.0));
    assert_eq!(table.get_int(2), LuaValue::Nil);
    assert_eq!(table.get_int(3), num(3.0));
    assert_eq!(table.get_int(4), num(4.0));
    assert_eq!(table.get_int(5), num(5.0));
    assert_eq!(table.pairs().count(), 4);
}

#[test]
fn test_constructor_positions_are_per_table() {
    // return {nil, {7}, 8}
    let mut vm = new_vm();
    let mut b = script();
    b.op(OpCode::NewTable);
    b.load_nil().op_a(OpCode::TblInitI, 0);
    b.op(OpCode::NewTable).load_num(7.0).op_a(OpCode::TblInitI, 0);
    b.op_a(OpCode::TblInitI, 0);
    b.load_num(8.0).op_a(OpCode::TblInitI, 0).ret(1);
    let t = run(&mut vm, b).unwrap();
    let table = t.as_table().unwrap().borrow();
    assert_eq!(table.get_int(1), LuaValue::Nil);
    assert_eq!(table.get_int(3), num(8.0));
    let inner = table.get_int(2);
    assert_eq!(inner.as_table().unwrap().borrow().get_int(1), num(7.0));
}
