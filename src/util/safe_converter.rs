//! Numeric conversions between the fixed-width integers of the wire formats and `usize`.

pub trait SafeCast<T> {
    fn safe_cast(self) -> T;
}

#[cfg(not(target_pointer_width = "16"))]
impl SafeCast<usize> for u16 {
    fn safe_cast(self) -> usize {
        self as usize
    }
}

#[cfg(not(target_pointer_width = "16"))]
impl SafeCast<usize> for u32 {
    fn safe_cast(self) -> usize {
        self as usize
    }
}

/// For narrowing casts where business logic ensures that the value is in the narrower type's range.
/// NB: The implementations will panic otherwise
pub trait PrecheckedCast<T> {
    fn prechecked_cast(self) -> T;
}
impl PrecheckedCast<u16> for usize {
    fn prechecked_cast(self) -> u16 {
        self.try_into().expect("this is a bug: application logic should have ensured the value range")
    }
}
impl PrecheckedCast<u32> for usize {
    fn prechecked_cast(self) -> u32 {
        self.try_into().expect("this is a bug: application logic should have ensured the value range")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0)]
    #[case(1)]
    #[case(u16::MAX as usize)]
    fn test_prechecked_u16(#[case] value: usize) {
        let narrowed: u16 = value.prechecked_cast();
        assert_eq!(<u16 as SafeCast<usize>>::safe_cast(narrowed), value);
    }

    #[test]
    #[should_panic]
    fn test_prechecked_u16_out_of_range() {
        let _: u16 = (u16::MAX as usize + 1).prechecked_cast();
    }
}
