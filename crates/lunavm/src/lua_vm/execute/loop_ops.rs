// Numeric and generic `for` support

use super::TmKind;
use crate::lua_value::LuaValue;
use crate::lua_vm::{LuaError, LuaResult, LuaVM, RuntimeErrorKind};

fn for_stage_name(stage: i32) -> &'static str {
    match stage {
        1 => "limit",
        2 => "step",
        _ => "initial value",
    }
}

impl LuaVM {
    fn for_number(&self, depth: usize) -> LuaResult<f64> {
        self.peek(depth)?
            .as_number()
            .ok_or_else(|| LuaError::internal("numeric for slot holds a non-number"))
    }

    /// Loop state is `[limit, step, var]` with `var` on top.
    pub(super) fn for_loop_done(&self) -> LuaResult<bool> {
        let var = self.for_number(0)?;
        let step = self.for_number(1)?;
        let limit = self.for_number(2)?;
        Ok(if step > 0.0 { var > limit } else { var < limit })
    }

    pub(super) fn op_to_num(&mut self, stage: i32) -> LuaResult<()> {
        let value = self.pop()?;
        match value.cast_to_number() {
            Some(n) => {
                self.push(LuaValue::Number(n));
                Ok(())
            }
            None => Err(LuaError::runtime(
                RuntimeErrorKind::Arithmetic,
                format!("'for' {} must be a number", for_stage_name(stage)),
            )),
        }
    }

    pub(super) fn op_incr(&mut self, depth: usize) -> LuaResult<()> {
        let step = self.for_number(depth)?;
        let var = self.for_number(0)?;
        *self.top_mut()? = LuaValue::Number(var + step);
        Ok(())
    }

    /// Normalize the `(f, s, var)` tuple on top. An `__iterator` handler
    /// replaces the triple with its own results; a plain table is walked
    /// with the builtin `next`.
    pub(super) fn op_iter_prep(&mut self) -> LuaResult<()> {
        let triple = self.pop()?;
        let mut f = triple.tuple_get(0);
        let mut s = triple.tuple_get(1);
        let mut var = triple.tuple_get(2);
        if matches!(f, LuaValue::Table(_) | LuaValue::UserData(_)) {
            if let Some(handler) = self.get_metamethod(&f, TmKind::Iterator) {
                let result = self.call(handler, vec![f, s, var])?;
                f = result.tuple_get(0);
                s = result.tuple_get(1);
                var = result.tuple_get(2);
            } else if f.is_table() && self.get_metamethod(&f, TmKind::Call).is_none() {
                s = f;
                f = self.next_function.clone();
                var = LuaValue::Nil;
            }
        }
        self.push(LuaValue::tuple(vec![f, s, var]));
        Ok(())
    }

    /// Pop the iterator call's result and store its first value as the
    /// control variable of the triple below it.
    pub(super) fn op_iter_upd(&mut self) -> LuaResult<()> {
        let result = self.pop()?;
        let triple = self.pop()?;
        self.push(LuaValue::tuple(vec![
            triple.tuple_get(0),
            triple.tuple_get(1),
            result.tuple_get(0),
        ]));
        Ok(())
    }
}
