// Tests for tail-call elision and call-depth limits
use super::*;
use crate::OpCode;
use crate::lua_vm::RuntimeErrorKind;

/// function count(n, acc)
///   if n == 0 then return acc end
///   return count(n - 1, acc + 1)
/// end
fn count_proto() -> Chunk {
    let mut f = ChunkBuilder::new("count");
    let n = f.param("n");
    let acc = f.param("acc");
    let count = f.global("count");
    let recurse = f.new_label();
    f.load(n).load_num(0.0).op(OpCode::Eq).jump(OpCode::Jf, recurse);
    f.load(acc).ret(1);
    f.mark(recurse);
    f.load(count);
    f.load(n).load_num(1.0).op(OpCode::Sub);
    f.load(acc).load_num(1.0).op(OpCode::Add);
    f.call(2).ret(1);
    f.build().unwrap()
}

/// function depth(n)
///   if n == 0 then return 0 end
///   return 1 + depth(n - 1)
/// end
fn depth_proto() -> Chunk {
    let mut f = ChunkBuilder::new("depth");
    let n = f.param("n");
    let depth = f.global("depth");
    let recurse = f.new_label();
    f.load(n).load_num(0.0).op(OpCode::Eq).jump(OpCode::Jf, recurse);
    f.load_num(0.0).ret(1);
    f.mark(recurse);
    f.load_num(1.0);
    f.load(depth).load(n).load_num(1.0).op(OpCode::Sub).call(1);
    f.op(OpCode::Add).ret(1);
    f.build().unwrap()
}

/// Define global `name` from `proto`, then return name(args...).
fn call_recursive(vm: &mut LuaVM, name: &str, proto: Chunk, args: &[f64]) -> LuaResult<LuaValue> {
    let mut b = script();
    let g = b.global(name);
    let p = b.add_proto(proto);
    b.closure(p).store(g);
    b.load(g);
    for arg in args {
        b.load_num(*arg);
    }
    b.call(args.len() as i32).ret(1);
    run(vm, b)
}

#[test]
fn test_deep_tail_recursion_runs_in_bounded_frames() {
    let mut vm = new_vm();
    let result = call_recursive(&mut vm, "count", count_proto(), &[1_000_000.0, 0.0]).unwrap();
    assert_eq!(result, num(1_000_000.0));
    let stats = vm.stats();
    assert!(stats.peak_call_depth < 100, "peak depth {}", stats.peak_call_depth);
    assert!(stats.tail_calls > 0);
    assert_eq!(vm.call_depth(), 0);
}

#[test]
fn test_shallow_calls_keep_their_frames() {
    let mut vm = new_vm();
    let result = call_recursive(&mut vm, "count", count_proto(), &[10.0, 0.0]).unwrap();
    assert_eq!(result, num(10.0));
    assert_eq!(vm.stats().tail_calls, 0);
    assert_eq!(vm.stats().peak_call_depth, 12);
}

#[test]
fn test_lower_threshold_elides_earlier() {
    let mut vm = vm_with(SafeOption {
        tail_call_threshold: 4,
        ..SafeOption::default()
    });
    let result = call_recursive(&mut vm, "count", count_proto(), &[50.0, 0.0]).unwrap();
    assert_eq!(result, num(50.0));
    assert!(vm.stats().peak_call_depth <= 6);
}

#[test]
fn test_non_tail_recursion_overflows() {
    let mut vm = vm_with(SafeOption {
        max_call_depth: 50,
        ..SafeOption::default()
    });
    let result = call_recursive(&mut vm, "depth", depth_proto(), &[30.0]).unwrap();
    assert_eq!(result, num(30.0));

    let err = call_recursive(&mut vm, "depth", depth_proto(), &[1000.0]).unwrap_err();
    assert_eq!(err.kind(), Some(RuntimeErrorKind::StackOverflow));
    assert!(err.to_string().ends_with("stack overflow"));
    assert_eq!(vm.call_depth(), 0);
}

#[test]
fn test_tail_recursion_under_pcall() {
    // return pcall(count, 1000000, 0)
    let mut vm = new_vm();
    let mut b = script();
    let g = b.global("count");
    let pcall = b.global("pcall");
    let p = b.add_proto(count_proto());
    b.closure(p).store(g);
    b.load(pcall).load(g).load_num(1_000_000.0).load_num(0.0).call(3).ret(1);
    let result = run(&mut vm, b).unwrap();
    assert_eq!(result.into_multi(), vec![LuaValue::Boolean(true), num(1_000_000.0)]);
    let stats = vm.stats();
    assert!(stats.peak_call_depth < 100, "peak depth {}", stats.peak_call_depth);
    assert!(stats.tail_calls > 0);
    assert_eq!(vm.call_depth(), 0);
}
