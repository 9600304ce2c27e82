macro_rules! impl_addr {
    ($name:ident, $doc:expr) => {
        #[doc = concat!("A ", $doc, ".")]
        #[derive(
            Default,
            Clone,
            Copy,
            PartialEq,
            Eq,
            PartialOrd,
            Ord,
            Hash,
            ::serde::Serialize,
            ::serde::Deserialize,
        )]
        pub struct $name(pub u64);

        impl $name {
            #[doc = concat!("Creates a new `", stringify!($name), "`.")]
            pub const fn new(value: u64) -> Self {
                Self(value)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self(value)
            }
        }

        impl From<$name> for u64 {
            fn from(value: $name) -> u64 {
                value.0
            }
        }

        impl ::std::ops::Add<u64> for $name {
            type Output = $name;

            fn add(self, rhs: u64) -> Self::Output {
                Self(self.0 + rhs)
            }
        }

        impl ::std::ops::AddAssign<u64> for $name {
            fn add_assign(&mut self, rhs: u64) {
                self.0 += rhs;
            }
        }

        impl ::std::ops::Sub<u64> for $name {
            type Output = $name;

            fn sub(self, rhs: u64) -> Self::Output {
                Self(self.0 - rhs)
            }
        }

        impl ::std::ops::Sub<$name> for $name {
            type Output = u64;

            fn sub(self, rhs: $name) -> u64 {
                self.0 - rhs.0
            }
        }

        impl ::std::ops::BitAnd<u64> for $name {
            type Output = $name;

            fn bitand(self, rhs: u64) -> Self::Output {
                Self(self.0 & rhs)
            }
        }

        impl ::std::ops::BitOr<u64> for $name {
            type Output = $name;

            fn bitor(self, rhs: u64) -> Self::Output {
                Self(self.0 | rhs)
            }
        }

        impl ::std::fmt::Debug for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
                write!(f, "0x{:016x}", self.0)
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
                write!(f, "0x{:016x}", self.0)
            }
        }

        impl ::std::fmt::LowerHex for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
                ::std::fmt::LowerHex::fmt(&self.0, f)
            }
        }
    };
}

pub(crate) use impl_addr;
