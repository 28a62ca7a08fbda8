//! Bit-flag set types.

/// Define a bit-flag set newtype with named flag constants, set operations,
/// iteration and a `Debug` impl listing the set flag names.
macro_rules! bit_flags {
    (
        $(#[$meta:meta])*
        pub struct $name:ident: $ty:ty {
            $(
                $(#[$fmeta:meta])*
                const $flag:ident = $val:expr;
            )*
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
        pub struct $name($ty);

        #[allow(dead_code)]
        impl $name {
            $(
                $(#[$fmeta])*
                pub const $flag: Self = Self($val);
            )*

            const NAMED: &'static [(&'static str, $ty)] = &[$((stringify!($flag), $val)),*];

            /// The empty set.
            pub const fn empty() -> Self {
                Self(0)
            }

            /// Every defined flag.
            pub const fn all() -> Self {
                Self(0 $(| $val)*)
            }

            /// The raw bits.
            pub const fn bits(&self) -> $ty {
                self.0
            }

            /// Convert raw bits, rejecting any undefined bit.
            pub const fn from_bits(bits: $ty) -> Option<Self> {
                if bits & !Self::all().0 == 0 {
                    Some(Self(bits))
                } else {
                    None
                }
            }

            /// Convert raw bits, dropping undefined bits.
            pub const fn from_bits_truncate(bits: $ty) -> Self {
                Self(bits & Self::all().0)
            }

            /// True if no flag is set.
            pub const fn is_empty(&self) -> bool {
                self.0 == 0
            }

            /// True if every flag in `other` is set.
            pub const fn contains(&self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }

            /// True if any flag in `other` is set.
            pub const fn intersects(&self, other: Self) -> bool {
                self.0 & other.0 != 0
            }

            /// Set the flags in `other`.
            pub fn insert(&mut self, other: Self) {
                self.0 |= other.0;
            }

            /// Clear the flags in `other`.
            pub fn remove(&mut self, other: Self) {
                self.0 &= !other.0;
            }

            /// Set or clear the flags in `other`.
            pub fn set(&mut self, other: Self, value: bool) {
                if value {
                    self.insert(other)
                } else {
                    self.remove(other)
                }
            }

            /// Iterate over the set flags, with their names.
            pub fn iter(&self) -> impl Iterator<Item = (&'static str, Self)> + '_ {
                Self::NAMED
                    .iter()
                    .filter(|(_, v)| self.0 & *v == *v && *v != 0)
                    .map(|(n, v)| (*n, Self(*v)))
            }
        }

        impl core::ops::BitOr for $name {
            type Output = Self;
            fn bitor(self, rhs: Self) -> Self {
                Self(self.0 | rhs.0)
            }
        }

        impl core::ops::BitOrAssign for $name {
            fn bitor_assign(&mut self, rhs: Self) {
                self.0 |= rhs.0;
            }
        }

        impl core::ops::BitAnd for $name {
            type Output = Self;
            fn bitand(self, rhs: Self) -> Self {
                Self(self.0 & rhs.0)
            }
        }

        impl core::fmt::Debug for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(stringify!($name))?;
                f.write_str("(")?;
                let mut first = true;
                for (n, _) in self.iter() {
                    if !first {
                        f.write_str(" | ")?;
                    }
                    f.write_str(n)?;
                    first = false;
                }
                let extra = self.0 & !Self::all().0;
                if extra != 0 {
                    if !first {
                        f.write_str(" | ")?;
                    }
                    write!(f, "0x{extra:x}")?;
                }
                f.write_str(")")
            }
        }
    };
}

pub(crate) use bit_flags;

#[cfg(test)]
mod tests {
    bit_flags! {
        /// Test set.
        pub struct Abc: u8 {
            const A = 0x1;
            const B = 0x2;
            const C = 0x8;
        }
    }

    #[test]
    fn set_operations() {
        let mut s = Abc::A | Abc::C;
        assert!(s.contains(Abc::A));
        assert!(!s.contains(Abc::A | Abc::B));
        assert!(s.intersects(Abc::A | Abc::B));
        s.insert(Abc::B);
        s.remove(Abc::A);
        assert_eq!(s.bits(), 0xA);
        assert_eq!(Abc::all().bits(), 0xB);
        assert_eq!(Abc::from_bits(0x4), None);
        assert_eq!(Abc::from_bits_truncate(0xF).bits(), 0xB);
        let names: Vec<_> = s.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["B", "C"]);
        assert_eq!(format!("{s:?}"), "Abc(B | C)");
    }
}
