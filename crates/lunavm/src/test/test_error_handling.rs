// Tests for pcall / xpcall, error values and error locations
use super::*;
use crate::lua_vm::{LuaError, RuntimeErrorKind};

/// function f(x) return x * 2 end
fn double_proto() -> Chunk {
    let mut f = ChunkBuilder::new("f");
    f.set_source_name("test");
    let x = f.param("x");
    f.load(x).load_num(2.0).op(crate::OpCode::Mul).ret(1);
    f.build().unwrap()
}

/// function f() error(message, level) end
fn raising_proto(message: &str, level: Option<f64>, line: u32) -> Chunk {
    let mut f = ChunkBuilder::new("f");
    f.set_source_name("test");
    f.line(line);
    let error = f.global("error");
    f.load(error).load_str(message);
    match level {
        Some(level) => f.load_num(level).call(2),
        None => f.call(1),
    };
    f.pop(1).ret(0);
    f.build().unwrap()
}

#[test]
fn test_pcall_catches_host_error_with_location() {
    // return pcall(error, "boom")
    let mut vm = new_vm();
    let mut b = script();
    let pcall = b.global("pcall");
    let error = b.global("error");
    b.line(3);
    b.load(pcall).load(error).load_str("boom").call(2).ret(1);
    let result = run(&mut vm, b).unwrap();
    assert_eq!(result.into_multi(), vec![LuaValue::Boolean(false), s("test:3: boom")]);
}

#[test]
fn test_pcall_success_prepends_true() {
    // return pcall(f, 2)
    let mut vm = new_vm();
    let mut b = script();
    let pcall = b.global("pcall");
    let p = b.add_proto(double_proto());
    b.load(pcall).closure(p).load_num(2.0).call(2).ret(1);
    let result = run(&mut vm, b).unwrap();
    assert_eq!(result.into_multi(), vec![LuaValue::Boolean(true), num(4.0)]);
}

#[test]
fn test_error_object_passes_through_untouched() {
    // return pcall(function() error(errobj) end)
    let mut vm = new_vm();
    let errobj = vm.create_table();
    vm.set_global("errobj", errobj.clone()).unwrap();

    let mut f = ChunkBuilder::new("f");
    let error = f.global("error");
    let obj = f.global("errobj");
    f.load(error).load(obj).call(1).pop(1).ret(0);

    let mut b = script();
    let pcall = b.global("pcall");
    let p = b.add_proto(f.build().unwrap());
    b.load(pcall).closure(p).call(1).ret(1);
    let result = run(&mut vm, b).unwrap();
    assert_eq!(result.tuple_get(0), LuaValue::Boolean(false));
    assert_eq!(result.tuple_get(1), errobj);
}

#[test]
fn test_error_level_points_at_caller() {
    // f() raises error("deep", 2) on line 20 and is called on line 10
    let mut vm = new_vm();
    let mut b = script();
    let pcall = b.global("pcall");
    let p = b.add_proto(raising_proto("deep", Some(2.0), 20));
    b.line(10);
    b.load(pcall).closure(p).call(1).ret(1);
    let result = run(&mut vm, b).unwrap();
    assert_eq!(result.tuple_get(1), s("test:10: deep"));

    // Level 1 (default) reports the raising function, level 0 nothing.
    let mut b = script();
    let pcall = b.global("pcall");
    let p = b.add_proto(raising_proto("here", None, 20));
    b.load(pcall).closure(p).call(1).ret(1);
    assert_eq!(run(&mut vm, b).unwrap().tuple_get(1), s("test:20: here"));

    let mut b = script();
    let pcall = b.global("pcall");
    let p = b.add_proto(raising_proto("bare", Some(0.0), 20));
    b.load(pcall).closure(p).call(1).ret(1);
    assert_eq!(run(&mut vm, b).unwrap().tuple_get(1), s("bare"));
}

#[test]
fn test_xpcall_message_handler() {
    // return xpcall(f, h) with f raising error("bad", 0)
    let mut vm = new_vm();
    vm.register_function("h", |_vm, args| {
        Ok(LuaValue::string(format!("handled: {}", args[0])))
    })
    .unwrap();
    let mut b = script();
    let xpcall = b.global("xpcall");
    let h = b.global("h");
    let p = b.add_proto(raising_proto("bad", Some(0.0), 1));
    b.load(xpcall).closure(p).load(h).call(2).ret(1);
    let result = run(&mut vm, b).unwrap();
    assert_eq!(result.into_multi(), vec![LuaValue::Boolean(false), s("handled: bad")]);
}

#[test]
fn test_failing_message_handler() {
    let mut vm = new_vm();
    vm.register_function("h", |_vm, _args| {
        Err(LuaError::runtime(RuntimeErrorKind::User, "handler broke"))
    })
    .unwrap();
    let mut b = script();
    let xpcall = b.global("xpcall");
    let h = b.global("h");
    let p = b.add_proto(raising_proto("bad", None, 1));
    b.load(xpcall).closure(p).load(h).call(2).ret(1);
    let result = run(&mut vm, b).unwrap();
    assert_eq!(result.tuple_get(1), s("error in error handling"));
}

#[test]
fn test_pcall_non_callable() {
    let mut vm = new_vm();
    let result = call_global(&mut vm, "pcall", vec![num(1.0)]).unwrap();
    assert_eq!(
        result.into_multi(),
        vec![LuaValue::Boolean(false), s("attempt to call a number value")]
    );
}

#[test]
fn test_stack_is_restored_after_caught_error() {
    // local a = 1; pcall(f); return a + 1
    let mut vm = new_vm();
    let mut b = script();
    let a = b.local("a");
    let pcall = b.global("pcall");
    let p = b.add_proto(raising_proto("ignored", None, 1));
    b.load_num(1.0).store(a);
    b.load(pcall).closure(p).call(1).pop(1);
    b.load(a).load_num(1.0).op(crate::OpCode::Add).ret(1);
    assert_eq!(run(&mut vm, b).unwrap(), num(2.0));
}

#[test]
fn test_uncaught_error_carries_location() {
    // local x; return x.y   (line 7)
    let mut vm = new_vm();
    let mut b = script();
    let x = b.local("x");
    b.line(7);
    b.load(x).index_n("y").ret(1);
    let err = run(&mut vm, b).unwrap_err();
    assert_eq!(err.kind(), Some(RuntimeErrorKind::NotIndexable));
    assert_eq!(err.to_string(), "test:7: attempt to index a nil value");

    // The VM is usable afterwards.
    assert_eq!(call_global(&mut vm, "type", vec![num(1.0)]).unwrap(), s("number"));
    assert_eq!(vm.call_depth(), 0);
}

#[test]
fn test_assert() {
    let mut vm = new_vm();
    let result = call_global(&mut vm, "assert", vec![num(1.0), s("msg")]).unwrap();
    assert_eq!(result.into_multi(), vec![num(1.0), s("msg")]);

    let err = call_global(&mut vm, "assert", vec![LuaValue::Boolean(false)]).unwrap_err();
    assert!(err.to_string().ends_with("assertion failed!"));
    let err = call_global(&mut vm, "assert", vec![LuaValue::Nil, s("custom")]).unwrap_err();
    assert_eq!(err.to_string(), "custom");
}

#[test]
fn test_traceback_lists_frames() {
    let mut vm = new_vm();
    vm.register_function("trace", |vm, _args| Ok(LuaValue::string(vm.traceback())))
        .unwrap();

    // function f() return trace() end; return f()
    let mut f = ChunkBuilder::new("f");
    f.set_source_name("test");
    f.line(2);
    let trace = f.global("trace");
    f.load(trace).call(0).ret(1);

    let mut b = script();
    let p = b.add_proto(f.build().unwrap());
    b.line(5);
    b.closure(p).call(0).ret(1);
    let result = run(&mut vm, b).unwrap();
    let text = result.as_str().unwrap().to_string();
    assert!(text.starts_with("stack traceback:"));
    let f_pos = text.find("test:2: in function 'f'").unwrap();
    let main_pos = text.find("test:5: in function 'main'").unwrap();
    assert!(f_pos < main_pos);
}

#[test]
fn test_outer_message_handler_sees_error_caught_inside() {
    // function f() pcall(error, "x"); return "done" end
    // return xpcall(f, h)
    let mut f = ChunkBuilder::new("f");
    let pcall = f.global("pcall");
    let error = f.global("error");
    f.load(pcall).load(error).load_str("x").call(2).pop(1);
    f.load_str("done").ret(1);

    let hits = Rc::new(std::cell::Cell::new(0));
    let mut vm = new_vm();
    let counter = hits.clone();
    vm.register_function("h", move |_vm, args| {
        counter.set(counter.get() + 1);
        Ok(args[0].clone())
    })
    .unwrap();
    let mut b = script();
    let xpcall = b.global("xpcall");
    let h = b.global("h");
    let p = b.add_proto(f.build().unwrap());
    b.load(xpcall).closure(p).load(h).call(2).ret(1);
    let result = run(&mut vm, b).unwrap();
    assert_eq!(result.into_multi(), vec![LuaValue::Boolean(true), s("done")]);
    assert_eq!(hits.get(), 1);
}

#[test]
fn test_message_handler_runs_once_when_it_catches() {
    // return xpcall(f, h) with f raising error("bad", 0)
    let hits = Rc::new(std::cell::Cell::new(0));
    let mut vm = new_vm();
    let counter = hits.clone();
    vm.register_function("h", move |_vm, args| {
        counter.set(counter.get() + 1);
        Ok(args[0].clone())
    })
    .unwrap();
    let mut b = script();
    let xpcall = b.global("xpcall");
    let h = b.global("h");
    let p = b.add_proto(raising_proto("bad", Some(0.0), 1));
    b.load(xpcall).closure(p).load(h).call(2).ret(1);
    let result = run(&mut vm, b).unwrap();
    assert_eq!(result.into_multi(), vec![LuaValue::Boolean(false), s("bad")]);
    assert_eq!(hits.get(), 1);
}
