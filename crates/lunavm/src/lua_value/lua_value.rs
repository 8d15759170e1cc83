// LuaValue - tagged union of every value the VM can hold
//
// Scalars are stored inline, shared objects (tables, closures, userdata,
// coroutines) behind `Rc`. Three tags never appear in script-visible slots:
// `TailCallRequest`, `YieldRequest` and `AwaitRequest` are return values of
// host functions that ask the dispatch loop to do something on their behalf.
use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;

use smol_str::SmolStr;

use super::{HostCallback, HostFunction, LuaClosure, LuaCoroutine, LuaUserdata, TableRef};
use crate::lua_vm::{LuaResult, LuaVM};

/// Future produced by a host async function.
pub type AsyncFuture = Pin<Box<dyn Future<Output = LuaResult<LuaValue>>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LuaValueKind {
    Nil,
    Void,
    Boolean,
    Number,
    String,
    Function,
    HostFunction,
    Table,
    Tuple,
    UserData,
    Thread,
    TailCallRequest,
    YieldRequest,
    AwaitRequest,
}

#[derive(Clone, Default)]
pub enum LuaValue {
    #[default]
    Nil,
    /// Absence of a value (a function that returned nothing).
    Void,
    Boolean(bool),
    Number(f64),
    String(SmolStr),
    Function(Rc<LuaClosure>),
    HostFunction(Rc<HostFunction>),
    Table(TableRef),
    Tuple(Rc<[LuaValue]>),
    UserData(Rc<LuaUserdata>),
    Thread(Rc<LuaCoroutine>),
    TailCallRequest(Rc<TailCallData>),
    YieldRequest(Rc<YieldRequest>),
    AwaitRequest(Rc<AwaitRequest>),
}

/// Request to call `function` in place of the host function that returned
/// it, optionally guarded by handlers installed on the new frame.
pub struct TailCallData {
    pub function: LuaValue,
    pub args: Vec<LuaValue>,
    /// Applied to the callee's result before it reaches the caller.
    pub continuation: Option<HostCallback>,
    /// Catches runtime errors raised below the new frame.
    pub error_handler: Option<HostCallback>,
    /// Called with the error value before unwinding reaches the handler.
    pub pre_unwind: Option<LuaValue>,
}

impl TailCallData {
    pub fn new(function: LuaValue, args: Vec<LuaValue>) -> Self {
        Self {
            function,
            args,
            continuation: None,
            error_handler: None,
            pre_unwind: None,
        }
    }
}

pub struct YieldRequest {
    pub values: Vec<LuaValue>,
}

pub struct AwaitRequest {
    future: RefCell<Option<AsyncFuture>>,
}

impl AwaitRequest {
    pub fn new(future: AsyncFuture) -> Self {
        Self {
            future: RefCell::new(Some(future)),
        }
    }

    /// Hand the future to the driver; a request can only be awaited once.
    pub fn take_future(&self) -> Option<AsyncFuture> {
        self.future.borrow_mut().take()
    }
}

impl LuaValue {
    // ============ Constructors ============

    #[inline(always)]
    pub fn nil() -> Self {
        LuaValue::Nil
    }

    #[inline(always)]
    pub fn boolean(b: bool) -> Self {
        LuaValue::Boolean(b)
    }

    #[inline(always)]
    pub fn number(n: f64) -> Self {
        LuaValue::Number(n)
    }

    #[inline(always)]
    pub fn integer(i: i64) -> Self {
        LuaValue::Number(i as f64)
    }

    #[inline]
    pub fn string(s: impl Into<SmolStr>) -> Self {
        LuaValue::String(s.into())
    }

    pub fn tuple(values: Vec<LuaValue>) -> Self {
        LuaValue::Tuple(values.into())
    }

    /// No values is `Void`, a single value stays itself, anything else
    /// becomes a tuple.
    pub fn from_multi(mut values: Vec<LuaValue>) -> Self {
        match values.len() {
            0 => LuaValue::Void,
            1 => values.pop().unwrap_or_default(),
            _ => LuaValue::tuple(values),
        }
    }

    pub fn host_function(
        name: impl Into<SmolStr>,
        func: impl Fn(&mut LuaVM, Vec<LuaValue>) -> LuaResult<LuaValue> + 'static,
    ) -> Self {
        LuaValue::HostFunction(Rc::new(HostFunction::new(name, func)))
    }

    pub fn tail_call(data: TailCallData) -> Self {
        LuaValue::TailCallRequest(Rc::new(data))
    }

    pub fn yield_request(values: Vec<LuaValue>) -> Self {
        LuaValue::YieldRequest(Rc::new(YieldRequest { values }))
    }

    pub fn await_request(future: AsyncFuture) -> Self {
        LuaValue::AwaitRequest(Rc::new(AwaitRequest::new(future)))
    }

    // ============ Type queries ============

    pub fn kind(&self) -> LuaValueKind {
        match self {
            LuaValue::Nil => LuaValueKind::Nil,
            LuaValue::Void => LuaValueKind::Void,
            LuaValue::Boolean(_) => LuaValueKind::Boolean,
            LuaValue::Number(_) => LuaValueKind::Number,
            LuaValue::String(_) => LuaValueKind::String,
            LuaValue::Function(_) => LuaValueKind::Function,
            LuaValue::HostFunction(_) => LuaValueKind::HostFunction,
            LuaValue::Table(_) => LuaValueKind::Table,
            LuaValue::Tuple(_) => LuaValueKind::Tuple,
            LuaValue::UserData(_) => LuaValueKind::UserData,
            LuaValue::Thread(_) => LuaValueKind::Thread,
            LuaValue::TailCallRequest(_) => LuaValueKind::TailCallRequest,
            LuaValue::YieldRequest(_) => LuaValueKind::YieldRequest,
            LuaValue::AwaitRequest(_) => LuaValueKind::AwaitRequest,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self.kind() {
            LuaValueKind::Nil => "nil",
            LuaValueKind::Void => "void",
            LuaValueKind::Boolean => "boolean",
            LuaValueKind::Number => "number",
            LuaValueKind::String => "string",
            LuaValueKind::Function | LuaValueKind::HostFunction => "function",
            LuaValueKind::Table => "table",
            LuaValueKind::Tuple => "tuple",
            LuaValueKind::UserData => "userdata",
            LuaValueKind::Thread => "thread",
            LuaValueKind::TailCallRequest => "tailcallrequest",
            LuaValueKind::YieldRequest => "yieldrequest",
            LuaValueKind::AwaitRequest => "awaitrequest",
        }
    }

    /// True for `Nil` and `Void`.
    #[inline(always)]
    pub fn is_nil(&self) -> bool {
        matches!(self, LuaValue::Nil | LuaValue::Void)
    }

    #[inline(always)]
    pub fn is_void(&self) -> bool {
        matches!(self, LuaValue::Void)
    }

    #[inline(always)]
    pub fn is_number(&self) -> bool {
        matches!(self, LuaValue::Number(_))
    }

    #[inline(always)]
    pub fn is_string(&self) -> bool {
        matches!(self, LuaValue::String(_))
    }

    #[inline(always)]
    pub fn is_table(&self) -> bool {
        matches!(self, LuaValue::Table(_))
    }

    #[inline(always)]
    pub fn is_callable(&self) -> bool {
        matches!(self, LuaValue::Function(_) | LuaValue::HostFunction(_))
    }

    /// Values that only travel from host functions to the dispatch loop.
    #[inline(always)]
    pub fn is_request(&self) -> bool {
        matches!(
            self,
            LuaValue::TailCallRequest(_) | LuaValue::YieldRequest(_) | LuaValue::AwaitRequest(_)
        )
    }

    // ============ Accessors ============

    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            LuaValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            LuaValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Integral number that fits an `i64`.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            LuaValue::Number(n) => number_to_integer(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            LuaValue::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_table(&self) -> Option<&TableRef> {
        match self {
            LuaValue::Table(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_thread(&self) -> Option<&Rc<LuaCoroutine>> {
        match self {
            LuaValue::Thread(co) => Some(co),
            _ => None,
        }
    }

    // ============ Tuples ============

    /// First element of a tuple (or `Nil` when empty); `Void` becomes `Nil`,
    /// other values are returned unchanged.
    pub fn to_scalar(&self) -> LuaValue {
        match self {
            LuaValue::Tuple(items) => items.first().map(LuaValue::to_scalar).unwrap_or_default(),
            LuaValue::Void => LuaValue::Nil,
            other => other.clone(),
        }
    }

    pub fn into_scalar(self) -> LuaValue {
        match self {
            LuaValue::Tuple(_) | LuaValue::Void => self.to_scalar(),
            other => other,
        }
    }

    /// Element `index` of a tuple; a non-tuple value acts as a one-element
    /// tuple and `Void` as an empty one.
    pub fn tuple_get(&self, index: usize) -> LuaValue {
        match self {
            LuaValue::Tuple(items) => items.get(index).map(LuaValue::to_scalar).unwrap_or_default(),
            LuaValue::Void => LuaValue::Nil,
            other if index == 0 => other.clone(),
            _ => LuaValue::Nil,
        }
    }

    /// Flatten into a list of scalars (`Void` and empty tuples yield none).
    pub fn into_multi(self) -> Vec<LuaValue> {
        match self {
            LuaValue::Tuple(items) => items.iter().map(LuaValue::to_scalar).collect(),
            LuaValue::Void => Vec::new(),
            other => vec![other],
        }
    }

    // ============ Conversions ============

    /// Numeric coercion: numbers, and strings holding a numeral.
    pub fn cast_to_number(&self) -> Option<f64> {
        match self {
            LuaValue::Number(n) => Some(*n),
            LuaValue::String(s) => parse_number(s),
            LuaValue::Tuple(_) => self.to_scalar().cast_to_number(),
            _ => None,
        }
    }

    /// String coercion: strings, and numbers formatted like `%.14g`.
    pub fn cast_to_string(&self) -> Option<SmolStr> {
        match self {
            LuaValue::String(s) => Some(s.clone()),
            LuaValue::Number(n) => Some(format_number(*n)),
            LuaValue::Tuple(_) => self.to_scalar().cast_to_string(),
            _ => None,
        }
    }

    /// Truthiness: only `nil`, `void` and `false` are false.
    pub fn cast_to_bool(&self) -> bool {
        match self {
            LuaValue::Nil | LuaValue::Void | LuaValue::Boolean(false) => false,
            LuaValue::Tuple(_) => self.to_scalar().cast_to_bool(),
            _ => true,
        }
    }

    /// Address used by `tostring` for reference types.
    pub fn ref_address(&self) -> Option<usize> {
        match self {
            LuaValue::Function(f) => Some(Rc::as_ptr(f) as usize),
            LuaValue::HostFunction(f) => Some(Rc::as_ptr(f) as usize),
            LuaValue::Table(t) => Some(Rc::as_ptr(t) as usize),
            LuaValue::UserData(u) => Some(Rc::as_ptr(u) as usize),
            LuaValue::Thread(co) => Some(Rc::as_ptr(co) as usize),
            _ => None,
        }
    }

    /// Identity/structural equality without metamethods.
    pub fn raw_equals(&self, other: &LuaValue) -> bool {
        match (self, other) {
            (a, b) if a.is_nil() && b.is_nil() => true,
            (LuaValue::Boolean(a), LuaValue::Boolean(b)) => a == b,
            (LuaValue::Number(a), LuaValue::Number(b)) => a == b,
            (LuaValue::String(a), LuaValue::String(b)) => a == b,
            (LuaValue::Function(a), LuaValue::Function(b)) => Rc::ptr_eq(a, b),
            (LuaValue::HostFunction(a), LuaValue::HostFunction(b)) => Rc::ptr_eq(a, b),
            (LuaValue::Table(a), LuaValue::Table(b)) => Rc::ptr_eq(a, b),
            (LuaValue::UserData(a), LuaValue::UserData(b)) => Rc::ptr_eq(a, b),
            (LuaValue::Thread(a), LuaValue::Thread(b)) => Rc::ptr_eq(a, b),
            (LuaValue::Tuple(a), LuaValue::Tuple(b)) => {
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.raw_equals(y))
            }
            (LuaValue::TailCallRequest(a), LuaValue::TailCallRequest(b)) => Rc::ptr_eq(a, b),
            (LuaValue::YieldRequest(a), LuaValue::YieldRequest(b)) => Rc::ptr_eq(a, b),
            (LuaValue::AwaitRequest(a), LuaValue::AwaitRequest(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl PartialEq for LuaValue {
    fn eq(&self, other: &Self) -> bool {
        self.raw_equals(other)
    }
}

impl From<bool> for LuaValue {
    fn from(b: bool) -> Self {
        LuaValue::Boolean(b)
    }
}

impl From<f64> for LuaValue {
    fn from(n: f64) -> Self {
        LuaValue::Number(n)
    }
}

impl From<i64> for LuaValue {
    fn from(i: i64) -> Self {
        LuaValue::integer(i)
    }
}

impl From<&str> for LuaValue {
    fn from(s: &str) -> Self {
        LuaValue::String(SmolStr::new(s))
    }
}

impl From<SmolStr> for LuaValue {
    fn from(s: SmolStr) -> Self {
        LuaValue::String(s)
    }
}

impl From<TableRef> for LuaValue {
    fn from(t: TableRef) -> Self {
        LuaValue::Table(t)
    }
}

impl fmt::Debug for LuaValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LuaValue::String(s) => write!(f, "{:?}", s.as_str()),
            LuaValue::Tuple(items) => f.debug_list().entries(items.iter()).finish(),
            other => write!(f, "{}", other),
        }
    }
}

/// Raw rendering without `__tostring`.
impl fmt::Display for LuaValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LuaValue::Nil => f.write_str("nil"),
            LuaValue::Void => f.write_str("void"),
            LuaValue::Boolean(b) => write!(f, "{}", b),
            LuaValue::Number(n) => f.write_str(&format_number(*n)),
            LuaValue::String(s) => f.write_str(s),
            LuaValue::Function(closure) => match closure.name() {
                "" => write!(f, "function: {:#x}", Rc::as_ptr(closure) as usize),
                name => write!(f, "function: {} {:#x}", name, Rc::as_ptr(closure) as usize),
            },
            LuaValue::HostFunction(func) => write!(f, "function: builtin: {}", func.name),
            LuaValue::Tuple(items) => {
                f.write_str("(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                f.write_str(")")
            }
            LuaValue::TailCallRequest(_) => f.write_str("(tail call request)"),
            LuaValue::YieldRequest(_) => f.write_str("(yield request)"),
            LuaValue::AwaitRequest(_) => f.write_str("(await request)"),
            other => write!(
                f,
                "{}: {:#x}",
                other.type_name(),
                other.ref_address().unwrap_or_default()
            ),
        }
    }
}

// ============ Numbers ============

/// Integral `f64` inside the `i64` range.
#[inline]
pub fn number_to_integer(n: f64) -> Option<i64> {
    if n.fract() == 0.0 && n >= -9_223_372_036_854_775_808.0 && n < 9_223_372_036_854_775_808.0 {
        Some(n as i64)
    } else {
        None
    }
}

/// Format like C's `%.14g`; integral values go through `itoa`.
pub fn format_number(n: f64) -> SmolStr {
    if n.is_nan() {
        return SmolStr::new_inline(if n.is_sign_negative() { "-nan" } else { "nan" });
    }
    if n.is_infinite() {
        return SmolStr::new_inline(if n < 0.0 { "-inf" } else { "inf" });
    }
    if n.fract() == 0.0 && n.abs() < 1e15 {
        if n == 0.0 && n.is_sign_negative() {
            return SmolStr::new_inline("-0");
        }
        let mut buf = itoa::Buffer::new();
        return SmolStr::new(buf.format(n as i64));
    }
    SmolStr::new(format_general(n))
}

fn format_general(n: f64) -> String {
    const PRECISION: i32 = 14;
    let sci = format!("{:.*e}", (PRECISION - 1) as usize, n);
    let Some((mantissa, exponent)) = sci.split_once('e') else {
        return sci;
    };
    let exponent: i32 = exponent.parse().unwrap_or(0);
    let negative = mantissa.starts_with('-');
    let digits: String = mantissa.chars().filter(char::is_ascii_digit).collect();
    let sign = if negative { "-" } else { "" };

    if exponent < -4 || exponent >= PRECISION {
        let (lead, rest) = digits.split_at(1);
        let rest = rest.trim_end_matches('0');
        let exp_sign = if exponent < 0 { '-' } else { '+' };
        if rest.is_empty() {
            format!("{sign}{lead}e{exp_sign}{:02}", exponent.abs())
        } else {
            format!("{sign}{lead}.{rest}e{exp_sign}{:02}", exponent.abs())
        }
    } else if exponent >= 0 {
        let (int_part, frac) = digits.split_at(exponent as usize + 1);
        let frac = frac.trim_end_matches('0');
        if frac.is_empty() {
            format!("{sign}{int_part}")
        } else {
            format!("{sign}{int_part}.{frac}")
        }
    } else {
        let zeros = "0".repeat((-exponent - 1) as usize);
        format!("{sign}0.{zeros}{}", digits.trim_end_matches('0'))
    }
}

/// Parse a numeral the way string-to-number coercion does: decimal with
/// optional exponent, or `0x` hexadecimal integer; surrounding whitespace
/// is allowed.
pub fn parse_number(text: &str) -> Option<f64> {
    let text = text.trim();
    let (negative, body) = match text.as_bytes().first() {
        Some(b'-') => (true, &text[1..]),
        Some(b'+') => (false, &text[1..]),
        _ => (false, text),
    };
    if body.starts_with(['+', '-']) {
        return None;
    }
    if let Some(hex) = body.strip_prefix("0x").or_else(|| body.strip_prefix("0X")) {
        if hex.is_empty() || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        let value = hex
            .bytes()
            .fold(0f64, |acc, b| acc * 16.0 + (b as char).to_digit(16).unwrap_or(0) as f64);
        return Some(if negative { -value } else { value });
    }
    if body.is_empty()
        || !body.bytes().any(|b| b.is_ascii_digit())
        || !body
            .bytes()
            .all(|b| b.is_ascii_digit() || matches!(b, b'.' | b'e' | b'E' | b'+' | b'-'))
    {
        return None;
    }
    let value: f64 = body.parse().ok()?;
    Some(if negative { -value } else { value })
}
