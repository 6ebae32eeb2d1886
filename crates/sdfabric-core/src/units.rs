#![allow(missing_docs)]
//! Types for representing units.

macro_rules! unit {
    ($name: ident) => {
        #[derive(
            Debug,
            Default,
            Copy,
            Clone,
            PartialOrd,
            Ord,
            PartialEq,
            Eq,
            Hash,
            derive_more::Add,
            derive_more::Sub,
            derive_more::AddAssign,
            derive_more::SubAssign,
            derive_more::Sum,
            derive_more::FromStr,
            serde::Serialize,
            serde::Deserialize,
        )]
        pub struct $name(u64);

        impl $name {
            pub const ZERO: $name = Self::new(0);
            pub const MAX: $name = Self::new(u64::MAX);

            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            pub const fn into_u64(self) -> u64 {
                self.0
            }

            pub fn scale_by(self, val: f64) -> Self {
                let inner = self.0 as f64 * val;
                Self(inner.round() as u64)
            }

            pub const fn saturating_sub(self, other: Self) -> Self {
                Self(self.0.saturating_sub(other.0))
            }
        }

        impl From<$name> for u64 {
            fn from(val: $name) -> Self {
                val.into_u64()
            }
        }
    };
}

unit!(BitsPerSec);

impl std::fmt::Display for BitsPerSec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}bps", self.0)
    }
}

unit!(Mbps);

impl std::fmt::Display for Mbps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}Mbps", self.0)
    }
}

unit!(Gbps);

impl std::fmt::Display for Gbps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}Gbps", self.0)
    }
}

impl From<Mbps> for BitsPerSec {
    fn from(val: Mbps) -> Self {
        Self::new(val.0 * 1_000_000)
    }
}

impl From<Gbps> for BitsPerSec {
    fn from(val: Gbps) -> Self {
        Self::new(val.0 * 1_000_000_000)
    }
}

unit!(Megabytes);

impl std::fmt::Display for Megabytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}MB", self.0)
    }
}
