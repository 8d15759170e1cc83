use crate::lua_vm::lua_limits;

/// Resource limits and tuning knobs of a `LuaVM`.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct SafeOption {
    pub max_stack_size: usize,
    pub max_call_depth: usize,
    pub max_host_call_depth: usize,
    /// Call depth above which a call immediately followed by `Ret 1` reuses
    /// its caller's frame.
    pub tail_call_threshold: usize,
    /// Value-stack size above which the same elision applies.
    pub tail_call_value_threshold: usize,
    /// Instruction budget handed to new coroutines; 0 never forces a yield.
    pub auto_yield_counter: u64,
    pub index_base: i64,
}

impl Default for SafeOption {
    fn default() -> Self {
        Self {
            max_stack_size: lua_limits::MAX_STACK_SIZE,
            max_call_depth: lua_limits::MAX_CALL_DEPTH,
            max_host_call_depth: lua_limits::MAX_HOST_CALL_DEPTH,
            tail_call_threshold: lua_limits::TAIL_CALL_THRESHOLD,
            tail_call_value_threshold: lua_limits::TAIL_CALL_VALUE_THRESHOLD,
            auto_yield_counter: lua_limits::DEFAULT_AUTO_YIELD,
            index_base: lua_limits::DEFAULT_INDEX_BASE,
        }
    }
}

#[cfg(feature = "serde")]
impl SafeOption {
    /// Parse options from JSON; missing fields keep their defaults.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_come_from_limits() {
        let opt = SafeOption::default();
        assert_eq!(opt.max_call_depth, lua_limits::MAX_CALL_DEPTH);
        assert_eq!(opt.index_base, 1);
        assert_eq!(opt.auto_yield_counter, 0);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_partial_json_keeps_defaults() {
        let opt = SafeOption::from_json(r#"{ "tail_call_threshold": 8 }"#).unwrap();
        assert_eq!(opt.tail_call_threshold, 8);
        assert_eq!(opt.max_stack_size, lua_limits::MAX_STACK_SIZE);
    }
}
