/*----------------------------------------------------------------------
  Instruction word (64-bit):

        6         4 4         3 3                     0 0       0
        3         8 7         2 1                     8 7       0
        |   C(16)   |   B(16)   |      A(24, signed)   |  Op(8)  |

  A signed argument is represented in excess K: the stored unsigned value
  minus K, where K is half (rounded down) the maximum value of the field.
----------------------------------------------------------------------*/

use super::OpCode;

#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Instruction(u64);

impl Instruction {
    pub const SIZE_OP: u32 = 8;
    pub const SIZE_A: u32 = 24;
    pub const SIZE_B: u32 = 16;
    pub const SIZE_C: u32 = 16;

    pub const POS_OP: u32 = 0;
    pub const POS_A: u32 = Self::POS_OP + Self::SIZE_OP;
    pub const POS_B: u32 = Self::POS_A + Self::SIZE_A;
    pub const POS_C: u32 = Self::POS_B + Self::SIZE_B;

    pub const MAX_A: u32 = (1 << Self::SIZE_A) - 1;
    pub const MAX_B: u32 = (1 << Self::SIZE_B) - 1;
    pub const MAX_C: u32 = (1 << Self::SIZE_C) - 1;

    pub const OFFSET_A: i32 = (Self::MAX_A >> 1) as i32;
    pub const MIN_SIGNED_A: i32 = -Self::OFFSET_A;
    pub const MAX_SIGNED_A: i32 = (Self::MAX_A as i32) - Self::OFFSET_A;

    #[inline(always)]
    const fn mask(size: u32) -> u64 {
        (1u64 << size) - 1
    }

    /// Encode an instruction. Callers keep `a` within
    /// `MIN_SIGNED_A..=MAX_SIGNED_A`; out-of-range bits are truncated.
    #[inline(always)]
    pub const fn new(op: OpCode, a: i32, b: u32, c: u32) -> Self {
        let a = (a + Self::OFFSET_A) as u32 as u64;
        Self(
            ((op as u64) << Self::POS_OP)
                | ((a & Self::mask(Self::SIZE_A)) << Self::POS_A)
                | ((b as u64 & Self::mask(Self::SIZE_B)) << Self::POS_B)
                | ((c as u64 & Self::mask(Self::SIZE_C)) << Self::POS_C),
        )
    }

    #[inline(always)]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline(always)]
    pub fn get_opcode(self) -> Option<OpCode> {
        OpCode::from_u8((self.0 >> Self::POS_OP) as u8)
    }

    #[inline(always)]
    pub const fn get_a(self) -> i32 {
        ((self.0 >> Self::POS_A) & Self::mask(Self::SIZE_A)) as i32 - Self::OFFSET_A
    }

    #[inline(always)]
    pub const fn get_b(self) -> u32 {
        ((self.0 >> Self::POS_B) & Self::mask(Self::SIZE_B)) as u32
    }

    #[inline(always)]
    pub const fn get_c(self) -> u32 {
        ((self.0 >> Self::POS_C) & Self::mask(Self::SIZE_C)) as u32
    }

    /// `A` read as an unsigned count or index; negative operands map to 0.
    #[inline(always)]
    pub const fn get_a_usize(self) -> usize {
        let a = self.get_a();
        if a < 0 { 0 } else { a as usize }
    }

    #[inline(always)]
    pub fn set_a(&mut self, a: i32) {
        let raw = ((a + Self::OFFSET_A) as u32 as u64) & Self::mask(Self::SIZE_A);
        self.0 = (self.0 & !(Self::mask(Self::SIZE_A) << Self::POS_A)) | (raw << Self::POS_A);
    }
}

impl std::fmt::Display for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let Some(op) = self.get_opcode() else {
            return write!(f, "<invalid {:#018x}>", self.0);
        };
        let usage = op.field_usage();
        write!(f, "{:<10}", op.name())?;
        if usage.uses_a() {
            write!(f, " {}", self.get_a())?;
        }
        if usage.uses_b() {
            write!(f, " {}", self.get_b())?;
        }
        if usage.uses_c() {
            write!(f, " {}", self.get_c())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fields_are_independent() {
        let mut i = Instruction::new(OpCode::IndexSetN, -3, 7, Instruction::MAX_C);
        assert_eq!(i.get_opcode(), Some(OpCode::IndexSetN));
        assert_eq!(i.get_a(), -3);
        assert_eq!(i.get_b(), 7);
        assert_eq!(i.get_c(), Instruction::MAX_C);

        i.set_a(Instruction::MAX_SIGNED_A);
        assert_eq!(i.get_a(), Instruction::MAX_SIGNED_A);
        assert_eq!(i.get_b(), 7);
        assert_eq!(i.get_opcode(), Some(OpCode::IndexSetN));
    }

    #[test]
    fn test_signed_a_limits() {
        let lo = Instruction::new(OpCode::Jump, Instruction::MIN_SIGNED_A, 0, 0);
        assert_eq!(lo.get_a(), Instruction::MIN_SIGNED_A);
        assert_eq!(lo.get_a_usize(), 0);
    }

    #[test]
    fn test_display_lists_used_fields() {
        let i = Instruction::new(OpCode::Store, 2, 0, 1);
        assert_eq!(i.to_string(), "STORE      2 0 1");
        assert_eq!(Instruction::new(OpCode::Add, 0, 0, 0).to_string(), "ADD       ");
    }
}
