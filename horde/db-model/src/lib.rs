// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Structures stored to the database.
//!
//! Each entity has a model type, used by the stores' callers, and a `*Row`
//! type that mirrors the table layout and is loaded with raw SQL.  Rows are
//! converted into models with `TryFrom`, failing with an internal error when
//! a column holds a value the model cannot represent.

mod apn;
mod collection;
mod device;
mod downstream;
mod firmware;
mod output;
pub mod schema;
mod tags;
mod team;
mod user;

pub use apn::*;
pub use collection::*;
pub use device::*;
pub use downstream::*;
pub use firmware::*;
pub use output::*;
pub use tags::*;
pub use team::*;
pub use user::*;

use chrono::DateTime;
use chrono::NaiveDateTime;
use chrono::SubsecRound;
use chrono::Utc;

/// Returns the current time at the precision the production dialect stores
/// (microseconds), so that values written to both tiers compare equal.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Converts a `TIMESTAMP` column value into a UTC time.
pub(crate) fn from_column_time(t: NaiveDateTime) -> DateTime<Utc> {
    t.and_utc()
}

/// Converts a UTC time into the value bound to a `TIMESTAMP` column.
pub fn to_column_time(t: &DateTime<Utc>) -> NaiveDateTime {
    t.naive_utc()
}

/// Helper for enums stored as single-character codes in `VARCHAR(1)`
/// columns.
macro_rules! impl_code_enum {
    (
        $(#[$enum_meta:meta])*
        pub enum $name:ident {
            $(
                $(#[$variant_meta:meta])*
                $variant:ident => $code:literal,
            )*
        }
    ) => {
        $(#[$enum_meta])*
        pub enum $name {
            $(
                $(#[$variant_meta])*
                $variant,
            )*
        }

        impl $name {
            /// Storage code for this value.
            pub fn code(&self) -> &'static str {
                match self {
                    $( $name::$variant => $code, )*
                }
            }

            /// Parses a storage code.
            pub fn from_code(code: &str) -> Option<Self> {
                match code {
                    $( $code => Some($name::$variant), )*
                    _ => None,
                }
            }
        }
    };
}
pub(crate) use impl_code_enum;
