//! Small typed identifiers shared across the runtime.

use std::fmt;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
        pub struct $name(u64);

        impl $name {
            pub const INVALID: $name = $name(u64::MAX);

            pub fn new(raw: u64) -> Self {
                $name(raw)
            }

            pub fn raw(self) -> u64 {
                self.0
            }

            pub fn is_valid(self) -> bool {
                self.0 != u64::MAX
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                if self.is_valid() {
                    write!(f, "{}", self.0)
                } else {
                    f.write_str("invalid")
                }
            }
        }
    };
}

id_type! {
    /// Identifies a built registry instance across reload generations.
    RegistryId
}

id_type! {
    /// Identifies a repository row independently of its typed content.
    AttachmentId
}

id_type! {
    /// Identifies an in-flight resource request against the provider.
    RequestId
}

id_type! {
    /// Identifies a loaded resource container published by the provider.
    ContainerId
}
