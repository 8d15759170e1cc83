// Basic library (_G global functions)
// Implements: print, type, assert, error, tonumber, tostring, select,
// ipairs, pairs, next, pcall, xpcall, getmetatable, setmetatable,
// rawget, rawset, rawlen, rawequal

use std::rc::Rc;

use crate::lib_registry::{LibraryModule, bad_argument, get_arg, require_arg, type_error};
use crate::lua_value::{LuaValue, TailCallData};
use crate::lua_vm::{LuaError, LuaResult, LuaVM, RuntimeError, RuntimeErrorKind, TmKind};

pub fn create_basic_lib() -> LibraryModule {
    LibraryModule::new("_G")
        .with_function("print", lua_print)
        .with_function("type", lua_type)
        .with_function("assert", lua_assert)
        .with_function("error", lua_error)
        .with_function("tonumber", lua_tonumber)
        .with_function("tostring", lua_tostring)
        .with_function("select", lua_select)
        .with_function("ipairs", lua_ipairs)
        .with_function("pairs", lua_pairs)
        .with_function("next", lua_next)
        .with_function("pcall", lua_pcall)
        .with_function("xpcall", lua_xpcall)
        .with_function("getmetatable", lua_getmetatable)
        .with_function("setmetatable", lua_setmetatable)
        .with_function("rawget", lua_rawget)
        .with_function("rawset", lua_rawset)
        .with_function("rawlen", lua_rawlen)
        .with_function("rawequal", lua_rawequal)
        .with_value("_G", |vm| LuaValue::Table(vm.globals()))
        .with_value("_VERSION", |_| LuaValue::string("Lunavm 1.0"))
}

/// print(...) - Print values to stdout, tab separated
fn lua_print(vm: &mut LuaVM, args: Vec<LuaValue>) -> LuaResult<LuaValue> {
    let mut line = String::new();
    for (i, value) in args.iter().enumerate() {
        if i > 0 {
            line.push('\t');
        }
        line.push_str(&vm.tostring(value)?);
    }
    println!("{}", line);
    Ok(LuaValue::Void)
}

/// type(v) - Name of the value's type
fn lua_type(_vm: &mut LuaVM, args: Vec<LuaValue>) -> LuaResult<LuaValue> {
    let value = require_arg(&args, 1, "type")?;
    Ok(LuaValue::string(value.type_name()))
}

/// assert(v [, message, ...]) - Raise an error if v is false or nil
fn lua_assert(_vm: &mut LuaVM, args: Vec<LuaValue>) -> LuaResult<LuaValue> {
    let value = require_arg(&args, 1, "assert")?;
    if value.cast_to_bool() {
        return Ok(LuaValue::from_multi(args));
    }
    match args.into_iter().nth(1) {
        Some(message) if !message.is_nil() => Err(RuntimeError::user(message).into()),
        _ => Err(LuaError::runtime(RuntimeErrorKind::User, "assertion failed!")),
    }
}

/// error(message [, level]) - Raise an error
///
/// String messages get the location of the frame at `level` (default 1,
/// the function calling `error`); level 0 leaves the message untouched.
/// Any other value is raised as is.
fn lua_error(vm: &mut LuaVM, args: Vec<LuaValue>) -> LuaResult<LuaValue> {
    let value = get_arg(&args, 1);
    let level = match get_arg(&args, 2) {
        LuaValue::Nil => 1,
        other => match other.cast_to_number() {
            Some(n) if n >= 0.0 => n as usize,
            Some(_) => 0,
            None => return Err(type_error(2, "error", "number", &other)),
        },
    };
    let mut error = RuntimeError::user(value);
    if error.value.is_none() {
        let decorated = match vm.location_at_level(level) {
            Some(location) if level > 0 => format!("{}: {}", location, error.message),
            _ => error.message.clone(),
        };
        error.decorated = Some(decorated);
    }
    Err(error.into())
}

/// tonumber(v [, base]) - Convert to a number, nil on failure
fn lua_tonumber(_vm: &mut LuaVM, args: Vec<LuaValue>) -> LuaResult<LuaValue> {
    let value = require_arg(&args, 1, "tonumber")?;
    let base = get_arg(&args, 2);
    if base.is_nil() {
        return Ok(value.cast_to_number().map_or(LuaValue::Nil, LuaValue::Number));
    }

    let base = match base.cast_to_number() {
        Some(b) if (2.0..=36.0).contains(&b) && b.fract() == 0.0 => b as u32,
        Some(_) => return Err(bad_argument(2, "tonumber", "base out of range")),
        None => return Err(type_error(2, "tonumber", "number", &base)),
    };
    let Some(text) = value.as_str() else {
        return Err(type_error(1, "tonumber", "string", &value));
    };
    Ok(parse_in_base(text, base).map_or(LuaValue::Nil, LuaValue::Number))
}

fn parse_in_base(text: &str, base: u32) -> Option<f64> {
    let text = text.trim();
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    if digits.is_empty() {
        return None;
    }
    let mut value = 0f64;
    for c in digits.chars() {
        value = value * base as f64 + c.to_digit(base)? as f64;
    }
    Some(if negative { -value } else { value })
}

/// tostring(v) - Convert to a string, honoring `__tostring`
fn lua_tostring(vm: &mut LuaVM, args: Vec<LuaValue>) -> LuaResult<LuaValue> {
    let value = require_arg(&args, 1, "tostring")?;
    Ok(LuaValue::String(vm.tostring(&value)?))
}

/// select(n, ...) - Arguments after position n, or their count for '#'
fn lua_select(_vm: &mut LuaVM, args: Vec<LuaValue>) -> LuaResult<LuaValue> {
    let selector = require_arg(&args, 1, "select")?;
    let mut rest = args;
    rest.remove(0);

    if selector.as_str() == Some("#") {
        return Ok(LuaValue::integer(rest.len() as i64));
    }
    let Some(n) = selector.cast_to_number().and_then(crate::lua_value::number_to_integer) else {
        return Err(type_error(1, "select", "number", &selector));
    };
    let count = rest.len() as i64;
    let start = if n < 0 { count + n } else { n - 1 };
    if n == 0 || start < 0 {
        return Err(bad_argument(1, "select", "index out of range"));
    }
    let start = start.min(count) as usize;
    Ok(LuaValue::from_multi(rest.split_off(start)))
}

/// ipairs(t) - Iterator over t[base], t[base + 1], ... up to the first nil
fn lua_ipairs(vm: &mut LuaVM, args: Vec<LuaValue>) -> LuaResult<LuaValue> {
    let table = require_arg(&args, 1, "ipairs")?;
    let start = vm.safe_option().index_base - 1;
    Ok(LuaValue::tuple(vec![
        LuaValue::host_function("ipairs_iter", ipairs_next),
        table,
        LuaValue::integer(start),
    ]))
}

fn ipairs_next(vm: &mut LuaVM, args: Vec<LuaValue>) -> LuaResult<LuaValue> {
    let table = get_arg(&args, 1);
    let index = get_arg(&args, 2).as_integer().unwrap_or(0) + 1;
    let key = LuaValue::integer(index);
    let value = vm.index(table, key.clone())?;
    if value.is_nil() {
        return Ok(LuaValue::Nil);
    }
    Ok(LuaValue::tuple(vec![key, value]))
}

/// pairs(t) - `next`, t, nil
fn lua_pairs(vm: &mut LuaVM, args: Vec<LuaValue>) -> LuaResult<LuaValue> {
    let table = require_arg(&args, 1, "pairs")?;
    if !table.is_table() {
        return Err(type_error(1, "pairs", "table", &table));
    }
    Ok(LuaValue::tuple(vec![vm.next_function.clone(), table, LuaValue::Nil]))
}

/// next(t [, key]) - Pair following key in traversal order
pub fn lua_next(_vm: &mut LuaVM, args: Vec<LuaValue>) -> LuaResult<LuaValue> {
    let table = get_arg(&args, 1);
    let Some(t) = table.as_table() else {
        return Err(type_error(1, "next", "table", &table));
    };
    let key = get_arg(&args, 2);
    let Some(pair) = t.borrow().next(&key) else {
        return Err(LuaError::runtime(
            RuntimeErrorKind::InvalidKey,
            "invalid key to 'next'",
        ));
    };
    if pair.is_nil() {
        return Ok(LuaValue::Nil);
    }
    Ok(LuaValue::tuple(vec![pair.key, pair.value]))
}

fn check_callable(vm: &LuaVM, func: &LuaValue) -> Option<LuaValue> {
    if func.is_callable() || vm.get_metamethod(func, TmKind::Call).is_some() {
        return None;
    }
    Some(LuaValue::tuple(vec![
        LuaValue::Boolean(false),
        LuaValue::string(format!("attempt to call a {} value", func.type_name())),
    ]))
}

fn protected(function: LuaValue, args: Vec<LuaValue>, msgh: Option<LuaValue>) -> LuaValue {
    let mut call = TailCallData::new(function, args);
    call.continuation = Some(Rc::new(|_vm, value| {
        let mut results = vec![LuaValue::Boolean(true)];
        results.extend(value.into_multi());
        Ok(LuaValue::tuple(results))
    }));
    call.error_handler = Some(Rc::new(|_vm, error| {
        Ok(LuaValue::tuple(vec![LuaValue::Boolean(false), error]))
    }));
    call.pre_unwind = msgh;
    LuaValue::tail_call(call)
}

/// pcall(f, ...) - Call f in protected mode
///
/// The call runs as a frame of the current loop, so a coroutine can yield
/// through it.
fn lua_pcall(vm: &mut LuaVM, args: Vec<LuaValue>) -> LuaResult<LuaValue> {
    let func = require_arg(&args, 1, "pcall")?;
    if let Some(failure) = check_callable(vm, &func) {
        return Ok(failure);
    }
    let mut args = args;
    args.remove(0);
    Ok(protected(func, args, None))
}

/// xpcall(f, msgh, ...) - Protected call with a message handler
fn lua_xpcall(vm: &mut LuaVM, args: Vec<LuaValue>) -> LuaResult<LuaValue> {
    let func = require_arg(&args, 1, "xpcall")?;
    let msgh = require_arg(&args, 2, "xpcall")?;
    if let Some(failure) = check_callable(vm, &func) {
        return Ok(failure);
    }
    let args = args.into_iter().skip(2).collect();
    Ok(protected(func, args, Some(msgh)))
}

/// getmetatable(object) - Metatable, or its `__metatable` field
fn lua_getmetatable(vm: &mut LuaVM, args: Vec<LuaValue>) -> LuaResult<LuaValue> {
    let value = require_arg(&args, 1, "getmetatable")?;
    let Some(mt) = vm.get_metatable(&value) else {
        return Ok(LuaValue::Nil);
    };
    let protected = mt.borrow().get_str(TmKind::Metatable.name());
    if !protected.is_nil() {
        return Ok(protected);
    }
    Ok(LuaValue::Table(mt))
}

/// setmetatable(table, metatable) - Set or clear a table's metatable
fn lua_setmetatable(_vm: &mut LuaVM, args: Vec<LuaValue>) -> LuaResult<LuaValue> {
    let table = get_arg(&args, 1);
    let Some(t) = table.as_table() else {
        return Err(type_error(1, "setmetatable", "table", &table));
    };
    let metatable = match get_arg(&args, 2) {
        LuaValue::Nil => None,
        LuaValue::Table(mt) => Some(mt),
        other => return Err(type_error(2, "setmetatable", "nil or table", &other)),
    };

    if let Some(current) = t.borrow().metatable()
        && !current.borrow().get_str(TmKind::Metatable.name()).is_nil()
    {
        return Err(LuaError::runtime(
            RuntimeErrorKind::BadArgument,
            "cannot change a protected metatable",
        ));
    }
    t.borrow_mut().set_metatable(metatable)?;
    Ok(table)
}

/// rawget(table, index) - Get without metamethods
fn lua_rawget(_vm: &mut LuaVM, args: Vec<LuaValue>) -> LuaResult<LuaValue> {
    let table = get_arg(&args, 1);
    let Some(t) = table.as_table() else {
        return Err(type_error(1, "rawget", "table", &table));
    };
    let key = require_arg(&args, 2, "rawget")?;
    Ok(t.borrow().raw_get(&key))
}

/// rawset(table, index, value) - Set without metamethods
fn lua_rawset(_vm: &mut LuaVM, args: Vec<LuaValue>) -> LuaResult<LuaValue> {
    let table = get_arg(&args, 1);
    let Some(t) = table.as_table() else {
        return Err(type_error(1, "rawset", "table", &table));
    };
    let key = require_arg(&args, 2, "rawset")?;
    let value = require_arg(&args, 3, "rawset")?;
    t.borrow_mut().set(key, value)?;
    Ok(table)
}

/// rawlen(v) - Length without metamethods
fn lua_rawlen(_vm: &mut LuaVM, args: Vec<LuaValue>) -> LuaResult<LuaValue> {
    let value = require_arg(&args, 1, "rawlen")?;
    let len = match &value {
        LuaValue::Table(t) => t.borrow().length(),
        LuaValue::String(s) => s.len(),
        other => return Err(type_error(1, "rawlen", "table or string", other)),
    };
    Ok(LuaValue::integer(len as i64))
}

/// rawequal(v1, v2) - Equality without metamethods
fn lua_rawequal(_vm: &mut LuaVM, args: Vec<LuaValue>) -> LuaResult<LuaValue> {
    let a = require_arg(&args, 1, "rawequal")?;
    let b = require_arg(&args, 2, "rawequal")?;
    Ok(LuaValue::Boolean(a.raw_equals(&b)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_in_base() {
        assert_eq!(parse_in_base("ff", 16), Some(255.0));
        assert_eq!(parse_in_base(" -101 ", 2), Some(-5.0));
        assert_eq!(parse_in_base("zz", 36), Some(1295.0));
        assert_eq!(parse_in_base("19", 8), None);
        assert_eq!(parse_in_base("", 10), None);
    }
}
