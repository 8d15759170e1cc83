// Arithmetic, concatenation, length and comparison
//
// Operands are coerced first (numbers from numeric strings, strings from
// numbers for `..`); when coercion fails the event's handler is spliced.

use smol_str::SmolStr;

use super::{ExecContext, Flow, TmKind};
use crate::lua_value::LuaValue;
use crate::lua_vm::{LuaError, LuaResult, LuaVM, OpCode, RuntimeErrorKind, call_flags};

fn arith_event(op: OpCode) -> TmKind {
    match op {
        OpCode::Add => TmKind::Add,
        OpCode::Sub => TmKind::Sub,
        OpCode::Mul => TmKind::Mul,
        OpCode::Div => TmKind::Div,
        OpCode::Mod => TmKind::Mod,
        OpCode::Pow => TmKind::Pow,
        _ => TmKind::Concat,
    }
}

/// Numeric result of an arithmetic opcode.
pub(crate) fn arith(op: OpCode, x: f64, y: f64) -> f64 {
    match op {
        OpCode::Add => x + y,
        OpCode::Sub => x - y,
        OpCode::Mul => x * y,
        OpCode::Div => x / y,
        OpCode::Mod => x - (x / y).floor() * y,
        OpCode::Pow => x.powf(y),
        _ => f64::NAN,
    }
}

fn arith_error(lhs: &LuaValue, rhs: &LuaValue) -> LuaError {
    let bad = if lhs.cast_to_number().is_none() { lhs } else { rhs };
    LuaError::runtime(
        RuntimeErrorKind::Arithmetic,
        format!("attempt to perform arithmetic on a {} value", bad.type_name()),
    )
}

fn compare_error(lhs: &LuaValue, rhs: &LuaValue) -> LuaError {
    let (t1, t2) = (lhs.type_name(), rhs.type_name());
    let message = if t1 == t2 {
        format!("attempt to compare two {} values", t1)
    } else {
        format!("attempt to compare {} with {}", t1, t2)
    };
    LuaError::runtime(RuntimeErrorKind::Compare, message)
}

impl LuaVM {
    pub(super) fn op_arith(&mut self, op: OpCode, ctx: ExecContext) -> LuaResult<Flow> {
        let rhs = self.pop()?.into_scalar();
        let lhs = self.pop()?.into_scalar();

        if op == OpCode::Concat {
            if let (Some(x), Some(y)) = (lhs.cast_to_string(), rhs.cast_to_string()) {
                let mut s = String::with_capacity(x.len() + y.len());
                s.push_str(&x);
                s.push_str(&y);
                self.push(LuaValue::String(SmolStr::from(s)));
                return Ok(Flow::Next);
            }
            let Some(handler) = self.get_binary_metamethod(&lhs, &rhs, TmKind::Concat) else {
                let bad = if lhs.cast_to_string().is_none() { &lhs } else { &rhs };
                return Err(LuaError::runtime(
                    RuntimeErrorKind::Arithmetic,
                    format!("attempt to concatenate a {} value", bad.type_name()),
                ));
            };
            return self.splice_call(handler, vec![lhs, rhs], call_flags::NONE, ctx);
        }

        if let (Some(x), Some(y)) = (lhs.cast_to_number(), rhs.cast_to_number()) {
            self.push(LuaValue::Number(arith(op, x, y)));
            return Ok(Flow::Next);
        }
        match self.get_binary_metamethod(&lhs, &rhs, arith_event(op)) {
            Some(handler) => self.splice_call(handler, vec![lhs, rhs], call_flags::NONE, ctx),
            None => Err(arith_error(&lhs, &rhs)),
        }
    }

    pub(super) fn op_neg(&mut self, ctx: ExecContext) -> LuaResult<Flow> {
        let value = self.pop()?.into_scalar();
        if let Some(n) = value.cast_to_number() {
            self.push(LuaValue::Number(-n));
            return Ok(Flow::Next);
        }
        match self.get_metamethod(&value, TmKind::Unm) {
            Some(handler) => {
                self.splice_call(handler, vec![value.clone(), value], call_flags::NONE, ctx)
            }
            None => Err(arith_error(&value, &value)),
        }
    }

    pub(super) fn op_len(&mut self, ctx: ExecContext) -> LuaResult<Flow> {
        let value = self.pop()?.into_scalar();
        if let LuaValue::String(s) = &value {
            self.push(LuaValue::integer(s.len() as i64));
            return Ok(Flow::Next);
        }
        if let Some(handler) = self.get_metamethod(&value, TmKind::Len) {
            return self.splice_call(handler, vec![value], call_flags::NONE, ctx);
        }
        match &value {
            LuaValue::Table(t) => {
                let n = t.borrow().length();
                self.push(LuaValue::integer(n as i64));
                Ok(Flow::Next)
            }
            other => Err(LuaError::runtime(
                RuntimeErrorKind::Arithmetic,
                format!("attempt to get length of a {} value", other.type_name()),
            )),
        }
    }

    pub(super) fn op_eq(&mut self, ctx: ExecContext) -> LuaResult<Flow> {
        let rhs = self.pop()?.into_scalar();
        let lhs = self.pop()?.into_scalar();
        if lhs.raw_equals(&rhs) {
            self.push(LuaValue::Boolean(true));
            return Ok(Flow::Next);
        }
        let comparable = matches!(
            (&lhs, &rhs),
            (LuaValue::Table(_), LuaValue::Table(_)) | (LuaValue::UserData(_), LuaValue::UserData(_))
        );
        if comparable {
            if let Some(handler) = self.get_binary_metamethod(&lhs, &rhs, TmKind::Eq) {
                return self.splice_call(handler, vec![lhs, rhs], call_flags::TO_BOOL, ctx);
            }
        }
        self.push(LuaValue::Boolean(false));
        Ok(Flow::Next)
    }

    pub(super) fn op_lt(&mut self, ctx: ExecContext) -> LuaResult<Flow> {
        let rhs = self.pop()?.into_scalar();
        let lhs = self.pop()?.into_scalar();
        if let Some(result) = primitive_compare(&lhs, &rhs, false) {
            self.push(LuaValue::Boolean(result));
            return Ok(Flow::Next);
        }
        match self.get_binary_metamethod(&lhs, &rhs, TmKind::Lt) {
            Some(handler) => self.splice_call(handler, vec![lhs, rhs], call_flags::TO_BOOL, ctx),
            None => Err(compare_error(&lhs, &rhs)),
        }
    }

    /// `a <= b`, falling back to `not (b < a)` when only `__lt` exists.
    pub(super) fn op_le(&mut self, ctx: ExecContext) -> LuaResult<Flow> {
        let rhs = self.pop()?.into_scalar();
        let lhs = self.pop()?.into_scalar();
        if let Some(result) = primitive_compare(&lhs, &rhs, true) {
            self.push(LuaValue::Boolean(result));
            return Ok(Flow::Next);
        }
        if let Some(handler) = self.get_binary_metamethod(&lhs, &rhs, TmKind::Le) {
            return self.splice_call(handler, vec![lhs, rhs], call_flags::TO_BOOL, ctx);
        }
        match self.get_binary_metamethod(&lhs, &rhs, TmKind::Lt) {
            Some(handler) => {
                self.splice_call(handler, vec![rhs, lhs], call_flags::NEGATE_RESULT, ctx)
            }
            None => Err(compare_error(&lhs, &rhs)),
        }
    }
}

/// Ordering of two numbers or two strings (bytewise); `None` otherwise.
pub(crate) fn primitive_compare(lhs: &LuaValue, rhs: &LuaValue, or_equal: bool) -> Option<bool> {
    match (lhs, rhs) {
        (LuaValue::Number(x), LuaValue::Number(y)) => Some(if or_equal { x <= y } else { x < y }),
        (LuaValue::String(x), LuaValue::String(y)) => {
            let (x, y) = (x.as_bytes(), y.as_bytes());
            Some(if or_equal { x <= y } else { x < y })
        }
        _ => None,
    }
}
