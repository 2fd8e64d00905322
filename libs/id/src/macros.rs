//! Macros for defining typed ID types.

/// Macro to define a typed random ID of `$bytes` bytes.
///
/// This generates a newtype wrapper around a fixed byte array with:
/// - `generate()` to draw a fresh random ID
/// - `generate_unique()` to draw one that a predicate reports as unused
/// - `parse()` to parse from lowercase hex
/// - `Display`, `FromStr`, `Serialize` and `Deserialize`
/// - `Ord` and `Hash`, so IDs can key ordered maps
///
/// # Example
///
/// ```ignore
/// define_id!(WorkloadId, 8);
///
/// let id = WorkloadId::generate();
/// let parsed: WorkloadId = id.to_string().parse()?;
/// ```
#[macro_export]
macro_rules! define_id {
    ($name:ident, $bytes:literal) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name([u8; $bytes]);

        impl $name {
            /// Length of the hex representation.
            pub const HEX_LEN: usize = $bytes * 2;

            /// Attempts made by [`Self::generate_unique`] before giving up.
            pub const MAX_ATTEMPTS: u32 = 64;

            /// Draws a fresh random ID.
            #[must_use]
            pub fn generate() -> Self {
                Self(rand::random::<[u8; $bytes]>())
            }

            /// Draws random IDs until `in_use` returns false.
            pub fn generate_unique<F>(mut in_use: F) -> Result<Self, $crate::IdError>
            where
                F: FnMut(&Self) -> bool,
            {
                for _ in 0..Self::MAX_ATTEMPTS {
                    let candidate = Self::generate();
                    if !in_use(&candidate) {
                        return Ok(candidate);
                    }
                }
                Err($crate::IdError::Exhausted {
                    attempts: Self::MAX_ATTEMPTS,
                })
            }

            /// Creates an ID from raw bytes.
            #[must_use]
            pub const fn from_bytes(bytes: [u8; $bytes]) -> Self {
                Self(bytes)
            }

            /// Returns the raw bytes.
            #[must_use]
            pub const fn as_bytes(&self) -> &[u8; $bytes] {
                &self.0
            }

            /// Parses an ID from its lowercase hex form.
            pub fn parse(s: &str) -> Result<Self, $crate::IdError> {
                if s.is_empty() {
                    return Err($crate::IdError::Empty);
                }
                if s.len() != Self::HEX_LEN {
                    return Err($crate::IdError::InvalidLength {
                        expected: Self::HEX_LEN,
                        actual: s.len(),
                    });
                }
                if let Some((offset, found)) = s
                    .char_indices()
                    .find(|(_, c)| !matches!(c, '0'..='9' | 'a'..='f'))
                {
                    return Err($crate::IdError::InvalidCharacter { found, offset });
                }

                let mut bytes = [0u8; $bytes];
                hex::decode_to_slice(s, &mut bytes).map_err(|_| {
                    $crate::IdError::InvalidLength {
                        expected: Self::HEX_LEN,
                        actual: s.len(),
                    }
                })?;
                Ok(Self(bytes))
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&hex::encode(self.0))
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.serialize_str(&self.to_string())
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let s = String::deserialize(deserializer)?;
                Self::parse(&s).map_err(serde::de::Error::custom)
            }
        }
    };
}
