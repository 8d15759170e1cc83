// Tests for metatable dispatch
use super::*;
use crate::lua_value::TableRef;
use crate::lua_vm::{OpCode, RuntimeErrorKind};

/// Table with a fresh metatable; returns both.
fn with_metatable(vm: &LuaVM) -> (LuaValue, TableRef) {
    let t = vm.new_table();
    let mt = vm.new_table();
    t.borrow_mut().set_metatable(Some(mt.clone())).unwrap();
    (LuaValue::Table(t), mt)
}

fn set_handler(
    vm: &LuaVM,
    mt: &TableRef,
    event: &str,
    f: impl Fn(&mut LuaVM, Vec<LuaValue>) -> crate::LuaResult<LuaValue> + 'static,
) {
    let handler = vm.create_function(event, f);
    mt.borrow_mut().set_str(event, handler).unwrap();
}

#[test]
fn test_index_cycle_is_detected() {
    let mut vm = new_vm();
    let (t, mt) = with_metatable(&vm);
    mt.borrow_mut().set_str("__index", t.clone()).unwrap();
    mt.borrow_mut().set_str("__newindex", t.clone()).unwrap();

    let err = vm.index(t.clone(), s("missing")).unwrap_err();
    assert_eq!(err.kind(), Some(RuntimeErrorKind::LoopInIndex));
    assert_eq!(err.to_string(), "loop in index");

    let err = vm.set_index(t.clone(), s("missing"), num(1.0)).unwrap_err();
    assert_eq!(err.kind(), Some(RuntimeErrorKind::LoopInNewIndex));

    // From a script the message carries the location.
    vm.set_global("t", t).unwrap();
    let mut b = script();
    let g = b.global("t");
    b.line(4);
    b.load(g).index_n("missing").ret(1);
    let err = run(&mut vm, b).unwrap_err();
    assert_eq!(err.to_string(), "test:4: loop in index");
}

#[test]
fn test_index_chain_through_tables() {
    let mut vm = new_vm();
    let (t, mt) = with_metatable(&vm);
    let (middle, middle_mt) = with_metatable(&vm);
    let base = vm.new_table();
    base.borrow_mut().set_str("answer", num(42.0)).unwrap();
    mt.borrow_mut().set_str("__index", middle).unwrap();
    middle_mt.borrow_mut().set_str("__index", LuaValue::Table(base)).unwrap();
    assert_eq!(vm.index(t, s("answer")).unwrap(), num(42.0));
}

#[test]
fn test_arithmetic_metamethods() {
    let mut vm = new_vm();
    let (t, mt) = with_metatable(&vm);
    set_handler(&vm, &mt, "__add", |_vm, args| {
        let n = args.iter().find_map(LuaValue::as_number).unwrap_or(0.0);
        Ok(num(n + 100.0))
    });
    set_handler(&vm, &mt, "__unm", |_vm, _args| Ok(s("negated")));
    set_handler(&vm, &mt, "__concat", |_vm, args| {
        Ok(s(&format!("{}+{}", args[0].type_name(), args[1].type_name())))
    });
    vm.set_global("t", t).unwrap();

    // return t + 1, 2 + t, -t, t .. "x"
    let mut b = script();
    let g = b.global("t");
    b.load(g).load_num(1.0).op(OpCode::Add);
    b.load_num(2.0).load(g).op(OpCode::Add);
    b.load(g).op(OpCode::Neg);
    b.load(g).load_str("x").op(OpCode::Concat);
    b.op_a(OpCode::MkTuple, 4).ret(1);
    let result = run(&mut vm, b).unwrap();
    assert_eq!(
        result.into_multi(),
        vec![num(101.0), num(102.0), s("negated"), s("table+string")]
    );
}

#[test]
fn test_arithmetic_without_handler_fails() {
    let mut vm = new_vm();
    let mut b = script();
    b.op(OpCode::NewTable).load_num(1.0).op(OpCode::Add).ret(1);
    let err = run(&mut vm, b).unwrap_err();
    assert_eq!(err.kind(), Some(RuntimeErrorKind::Arithmetic));
}

#[test]
fn test_index_function_written_in_script() {
    // local mt = {}
    // mt.__index = function(self, key) return key .. "!" end
    // local t = setmetatable({}, mt)
    // return t.foo
    let mut handler = ChunkBuilder::new("index");
    handler.param("self");
    let key = handler.param("key");
    handler.load(key).load_str("!").op(OpCode::Concat).ret(1);

    let mut vm = new_vm();
    let mut b = script();
    let mt = b.local("mt");
    let t = b.local("t");
    let setmetatable = b.global("setmetatable");
    let p = b.add_proto(handler.build().unwrap());
    b.op(OpCode::NewTable).store(mt);
    b.closure(p).load(mt).index_set_n("__index", 0).pop(1);
    b.load(setmetatable).op(OpCode::NewTable).load(mt).call(2).store(t);
    b.load(t).index_n("foo").ret(1);
    assert_eq!(run(&mut vm, b).unwrap(), s("foo!"));
}

#[test]
fn test_method_call_through_index() {
    // methods.greet = function(self, name) return self.prefix .. name end
    // return obj:greet("bob")
    let mut greet = ChunkBuilder::new("greet");
    let this = greet.param("self");
    let name = greet.param("name");
    greet.load(this).index_n("prefix").load(name).op(OpCode::Concat).ret(1);

    let mut vm = new_vm();
    let (obj, mt) = with_metatable(&vm);
    let methods = LuaValue::Table(vm.new_table());
    mt.borrow_mut().set_str("__index", methods.clone()).unwrap();
    obj.as_table().unwrap().borrow_mut().set_str("prefix", s("hi ")).unwrap();
    vm.set_global("obj", obj.clone()).unwrap();
    vm.set_global("methods", methods).unwrap();

    let mut b = script();
    let g_obj = b.global("obj");
    let g_methods = b.global("methods");
    let p = b.add_proto(greet.build().unwrap());
    b.closure(p).load(g_methods).index_set_n("greet", 0).pop(1);
    // method lookup leaves [method, obj]
    b.load(g_obj).index_l("greet").load_str("bob").this_call(2).ret(1);
    assert_eq!(run(&mut vm, b).unwrap(), s("hi bob"));
    assert_eq!(obj.as_table().unwrap().borrow().get_str("greet"), LuaValue::Nil);
}

#[test]
fn test_le_falls_back_to_lt() {
    let mut vm = new_vm();
    let make = |vm: &LuaVM, v: f64| {
        let (t, mt) = with_metatable(vm);
        t.as_table().unwrap().borrow_mut().set_str("v", num(v)).unwrap();
        set_handler(vm, &mt, "__lt", |_vm, args| {
            let v = |x: &LuaValue| x.as_table().unwrap().borrow().get_str("v").as_number().unwrap();
            Ok(LuaValue::Boolean(v(&args[0]) < v(&args[1])))
        });
        t
    };
    let a = make(&vm, 1.0);
    let b_val = make(&vm, 2.0);
    vm.set_global("a", a).unwrap();
    vm.set_global("b", b_val).unwrap();

    // return a <= b, b <= a, a < b
    let mut b = script();
    let ga = b.global("a");
    let gb = b.global("b");
    b.load(ga).load(gb).op(OpCode::Le);
    b.load(gb).load(ga).op(OpCode::Le);
    b.load(ga).load(gb).op(OpCode::Lt);
    b.op_a(OpCode::MkTuple, 3).ret(1);
    let result = run(&mut vm, b).unwrap();
    assert_eq!(
        result.into_multi(),
        vec![LuaValue::Boolean(true), LuaValue::Boolean(false), LuaValue::Boolean(true)]
    );
}

#[test]
fn test_eq_and_len_handlers() {
    let mut vm = new_vm();
    let (a, mt) = with_metatable(&vm);
    let b_val = vm.new_table();
    b_val.borrow_mut().set_metatable(Some(mt.clone())).unwrap();
    set_handler(&vm, &mt, "__eq", |_vm, _args| Ok(num(1.0)));
    set_handler(&vm, &mt, "__len", |_vm, _args| Ok(num(7.0)));
    vm.set_global("a", a).unwrap();
    vm.set_global("b", LuaValue::Table(b_val)).unwrap();

    // return a == b, #a
    let mut b = script();
    let ga = b.global("a");
    let gb = b.global("b");
    b.load(ga).load(gb).op(OpCode::Eq);
    b.load(ga).op(OpCode::Len);
    b.op_a(OpCode::MkTuple, 2).ret(1);
    let result = run(&mut vm, b).unwrap();
    assert_eq!(result.into_multi(), vec![LuaValue::Boolean(true), num(7.0)]);
}

#[test]
fn test_call_and_newindex_handlers() {
    let mut vm = new_vm();
    let (t, mt) = with_metatable(&vm);
    let log = vm.new_table();
    set_handler(&vm, &mt, "__call", |_vm, args| {
        assert!(args[0].is_table());
        Ok(num(args[1].as_number().unwrap_or(0.0) * 2.0))
    });
    let sink = log.clone();
    set_handler(&vm, &mt, "__newindex", move |_vm, args| {
        sink.borrow_mut().set(args[1].clone(), args[2].clone())?;
        Ok(s("ignored"))
    });
    vm.set_global("t", t.clone()).unwrap();

    // t.x = 5; return t(21)
    let mut b = script();
    let g = b.global("t");
    b.load_num(5.0).load(g).index_set_n("x", 0).pop(1);
    b.load(g).load_num(21.0).call(1).ret(1);
    assert_eq!(run(&mut vm, b).unwrap(), num(42.0));
    assert_eq!(log.borrow().get_str("x"), num(5.0));
    assert_eq!(t.as_table().unwrap().borrow().get_str("x"), LuaValue::Nil);
}

#[test]
fn test_iterator_metamethod() {
    // for k, v in proxy do sum = sum + v end, proxy iterating `data`
    let mut vm = new_vm();
    let data = vm.create_array(vec![num(1.0), num(2.0), num(3.0)]).unwrap();
    let (proxy, mt) = with_metatable(&vm);
    let inner = data.clone();
    set_handler(&vm, &mt, "__iterator", move |vm, _args| {
        Ok(LuaValue::tuple(vec![vm.get_global("next"), inner.clone(), LuaValue::Nil]))
    });
    vm.set_global("proxy", proxy).unwrap();

    let mut b = script();
    let sum = b.local("sum");
    let v = b.local("v");
    let g = b.global("proxy");
    let top = b.new_label();
    let exit = b.new_label();
    b.load_num(0.0).store(sum);
    b.load(g).load_nil().load_nil().op_a(OpCode::MkTuple, 3).op(OpCode::IterPrep);
    b.mark(top);
    b.op_a(OpCode::ExpTuple, 0).call(2).store_keep(v, 1);
    b.op_a(OpCode::Copy, 0).jump(OpCode::JNil, exit).op(OpCode::IterUpd);
    b.load(sum).load(v).op(OpCode::Add).store(sum).jump(OpCode::Jump, top);
    b.mark(exit).pop(2).load(sum).ret(1);
    assert_eq!(run(&mut vm, b).unwrap(), num(6.0));
}

#[test]
fn test_tostring_metamethod() {
    let mut vm = new_vm();
    let (t, mt) = with_metatable(&vm);
    set_handler(&vm, &mt, "__tostring", |_vm, _args| Ok(s("point")));
    assert_eq!(vm.tostring(&t).unwrap(), "point");
    assert_eq!(call_global(&mut vm, "tostring", vec![t]).unwrap(), s("point"));
}

#[test]
fn test_userdata_index_reads_host_data() {
    struct Point {
        x: f64,
    }
    let mut vm = new_vm();
    let mt = vm.new_table();
    set_handler(&vm, &mt, "__index", |_vm, args| {
        let LuaValue::UserData(u) = &args[0] else {
            return Ok(LuaValue::Nil);
        };
        let x = u.borrow::<Point>().map(|p| p.x).unwrap_or(0.0);
        Ok(match args[1].as_str() {
            Some("x") => num(x),
            _ => LuaValue::Nil,
        })
    });
    let point = LuaValue::UserData(std::rc::Rc::new(crate::lua_value::LuaUserdata::with_metatable(
        Point { x: 3.5 },
        mt,
    )));
    assert_eq!(point.type_name(), "userdata");
    assert_eq!(vm.index(point.clone(), s("x")).unwrap(), num(3.5));
    assert_eq!(vm.index(point.clone(), s("y")).unwrap(), LuaValue::Nil);

    let bare = LuaValue::UserData(std::rc::Rc::new(crate::lua_value::LuaUserdata::new(1u8)));
    let err = vm.index(bare, s("x")).unwrap_err();
    assert_eq!(err.kind(), Some(RuntimeErrorKind::NotIndexable));
}
