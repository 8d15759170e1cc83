// Tests for closures and upvalues
use super::*;
use crate::OpCode;

/// function make()
///   local n = 0
///   return function() n = n + 1; return n end
/// end
fn counter_factory() -> Chunk {
    let mut inc = ChunkBuilder::new("inc");
    let n = inc.upvalue("n", true, 0);
    inc.load(n).load_num(1.0).op(OpCode::Add).store(n);
    inc.load(n).ret(1);

    let mut make = ChunkBuilder::new("make");
    let n = make.local("n");
    let p = make.add_proto(inc.build().unwrap());
    make.load_num(0.0).store(n);
    make.closure(p).ret(1);
    make.build().unwrap()
}

#[test]
fn test_counter_keeps_state_after_return() {
    // local c = make(); c(); c(); local d = make()
    // return c() * 10 + d()
    let mut vm = new_vm();
    let mut b = script();
    let c = b.local("c");
    let d = b.local("d");
    let make = b.add_proto(counter_factory());
    b.closure(make).call(0).store(c);
    b.load(c).call(0).pop(1);
    b.load(c).call(0).pop(1);
    b.closure(make).call(0).store(d);
    b.load(c).call(0).load_num(10.0).op(OpCode::Mul);
    b.load(d).call(0).op(OpCode::Add).ret(1);
    assert_eq!(run(&mut vm, b).unwrap(), num(31.0));
}

#[test]
fn test_open_upvalue_shares_the_local() {
    // local x = 1
    // local function set(v) x = v end
    // set(5)
    // return x
    let mut set = ChunkBuilder::new("set");
    let v = set.param("v");
    let x_up = set.upvalue("x", true, 0);
    set.load(v).store(x_up).ret(0);

    let mut vm = new_vm();
    let mut b = script();
    let x = b.local("x");
    let f = b.local("set");
    let p = b.add_proto(set.build().unwrap());
    b.load_num(1.0).store(x);
    b.closure(p).store(f);
    b.load(f).load_num(5.0).call(1).pop(1);
    b.load(x).ret(1);
    assert_eq!(run(&mut vm, b).unwrap(), num(5.0));
}

#[test]
fn test_each_iteration_captures_a_fresh_variable() {
    // local fns = {}
    // for i = 1, 3 do fns[#fns + 1] = function() return i end end
    // return fns[1]() + fns[2]() * 10 + fns[3]() * 100
    let mut get = ChunkBuilder::new("get");
    let i_up = get.upvalue("i", true, 1);
    get.load(i_up).ret(1);

    let mut vm = new_vm();
    let mut b = script();
    let fns = b.local("fns");
    let i = b.local("i");
    let p = b.add_proto(get.build().unwrap());
    let top = b.new_label();
    let exit = b.new_label();

    b.op(OpCode::NewTable).store(fns);
    b.load_num(3.0).op_a(OpCode::ToNum, 1);
    b.load_num(1.0).op_a(OpCode::ToNum, 2);
    b.load_num(1.0).op_a(OpCode::ToNum, 0);
    b.mark(top).jump(OpCode::JFor, exit);
    b.store_keep(i, 0);
    b.closure(p);
    b.load(fns).load(fns).op(OpCode::Len).load_num(1.0).op(OpCode::Add);
    b.index_set(0, 0).pop(1);
    b.clean(1, 1);
    b.op_a(OpCode::Incr, 1).jump(OpCode::Jump, top);
    b.mark(exit).pop(3);

    for (index, scale) in [(1.0, 1.0), (2.0, 10.0), (3.0, 100.0)] {
        b.load(fns).load_num(index).op(OpCode::Index).call(0);
        b.load_num(scale).op(OpCode::Mul);
    }
    b.op(OpCode::Add).op(OpCode::Add).ret(1);
    assert_eq!(run(&mut vm, b).unwrap(), num(321.0));
}

#[test]
fn test_nested_closure_reaches_grandparent_local() {
    // local base = 40
    // local function outer()
    //   return function() return base + 2 end
    // end
    // return outer()()
    let mut inner = ChunkBuilder::new("inner");
    let base_up = inner.upvalue("base", false, 0);
    inner.load(base_up).load_num(2.0).op(OpCode::Add).ret(1);

    let mut outer = ChunkBuilder::new("outer");
    outer.upvalue("base", true, 0);
    let p_inner = outer.add_proto(inner.build().unwrap());
    outer.closure(p_inner).ret(1);

    let mut vm = new_vm();
    let mut b = script();
    let base = b.local("base");
    let p_outer = b.add_proto(outer.build().unwrap());
    b.load_num(40.0).store(base);
    b.closure(p_outer).call(0).call(0).ret(1);
    assert_eq!(run(&mut vm, b).unwrap(), num(42.0));
}

#[test]
fn test_vararg_collects_extra_arguments() {
    // local function f(a, ...) return select("#", ...) end
    // return f(1, 2, 3)
    let mut f = ChunkBuilder::new("f");
    f.param("a");
    let rest = f.vararg();
    let select = f.global("select");
    f.load(select).load_str("#").load(rest).call(2).ret(1);

    let mut vm = new_vm();
    let mut b = script();
    let p = b.add_proto(f.build().unwrap());
    b.closure(p).load_num(1.0).load_num(2.0).load_num(3.0).call(3).ret(1);
    assert_eq!(run(&mut vm, b).unwrap(), num(2.0));
}
