// Standard libraries: the basic global functions and `coroutine`

pub mod basic;
pub mod coroutine;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stdlib {
    Basic,
    Coroutine,

    All,
}
