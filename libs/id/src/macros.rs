//! Macro for defining typed ID types.

/// Define a typed, prefixed ULID newtype.
///
/// The generated type carries:
/// - a `PREFIX` constant and strict `parse()`
/// - `Display`/`FromStr` using the `{prefix}_{ulid}` form
/// - serde support through the string form
///
/// # Example
///
/// ```ignore
/// define_id!(ResourceUid, "res");
///
/// let uid = ResourceUid::new();
/// let parsed: ResourceUid = "res_01HV4Z2WQXKJNM8GPQY6VBKC3D".parse()?;
/// ```
#[macro_export]
macro_rules! define_id {
    ($name:ident, $prefix:literal) => {
        #[doc = concat!("Typed ID rendered as `", $prefix, "_{ulid}`.")]
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash,
            serde::Serialize, serde::Deserialize,
        )]
        #[serde(try_from = "String", into = "String")]
        pub struct $name($crate::Ulid);

        impl $name {
            /// The prefix for this ID type.
            pub const PREFIX: &'static str = $prefix;

            /// Creates a new ID with a fresh ULID.
            #[must_use]
            pub fn new() -> Self {
                Self($crate::Ulid::new())
            }

            /// Creates an ID from a raw ULID.
            #[must_use]
            pub const fn from_ulid(ulid: $crate::Ulid) -> Self {
                Self(ulid)
            }

            /// Returns the underlying ULID.
            #[must_use]
            pub const fn ulid(&self) -> $crate::Ulid {
                self.0
            }

            /// Parses an ID of the form `{prefix}_{ulid}`.
            pub fn parse(s: &str) -> Result<Self, $crate::IdError> {
                const ID_TYPE: &str = stringify!($name);

                let (prefix, ulid) = match s.split_once('_') {
                    _ if s.is_empty() => return Err($crate::IdError::Empty { id_type: ID_TYPE }),
                    Some(parts) => parts,
                    None => {
                        return Err($crate::IdError::Malformed {
                            id_type: ID_TYPE,
                            input: s.to_string(),
                        })
                    }
                };
                if prefix != Self::PREFIX {
                    return Err($crate::IdError::WrongType {
                        id_type: ID_TYPE,
                        expected: Self::PREFIX,
                        found: prefix.to_string(),
                    });
                }
                ulid.parse::<$crate::Ulid>()
                    .map(Self)
                    .map_err(|e| $crate::IdError::InvalidUlid {
                        id_type: ID_TYPE,
                        reason: e.to_string(),
                    })
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}_{}", Self::PREFIX, self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl TryFrom<String> for $name {
            type Error = $crate::IdError;

            fn try_from(s: String) -> Result<Self, Self::Error> {
                Self::parse(&s)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.to_string()
            }
        }
    };
}
