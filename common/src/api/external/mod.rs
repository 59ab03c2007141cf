// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Data structures and related facilities for representing resources at the
//! boundary of the core
//!
//! The contents here are all transport-agnostic.

mod error;
pub use error::*;

use serde::Deserialize;
use serde::Serialize;
use std::fmt::Display;
use std::fmt::Formatter;
use std::fmt::Result as FormatResult;

// The type aliases below exist primarily to ensure consistency among return
// types for functions on the stores.

/// Result of a create operation for the specified type
pub type CreateResult<T> = Result<T, Error>;
/// Result of a delete operation for the specified type
pub type DeleteResult = Result<(), Error>;
/// Result of a list operation that returns a vector
pub type ListResultVec<T> = Result<Vec<T>, Error>;
/// Result of a lookup operation for the specified type
pub type LookupResult<T> = Result<T, Error>;
/// Result of an update operation for the specified type
pub type UpdateResult<T> = Result<T, Error>;

/// Identifies a type of resource stored by the core
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum ResourceType {
    Allocation,
    Apn,
    Collection,
    Device,
    DownstreamMessage,
    Firmware,
    Invite,
    Member,
    Nas,
    Output,
    Sequence,
    Team,
    Token,
    User,
}

impl Display for ResourceType {
    fn fmt(&self, f: &mut Formatter) -> FormatResult {
        write!(
            f,
            "{}",
            match self {
                ResourceType::Allocation => "allocation",
                ResourceType::Apn => "apn",
                ResourceType::Collection => "collection",
                ResourceType::Device => "device",
                ResourceType::DownstreamMessage => "downstream message",
                ResourceType::Firmware => "firmware",
                ResourceType::Invite => "invite",
                ResourceType::Member => "member",
                ResourceType::Nas => "nas",
                ResourceType::Output => "output",
                ResourceType::Sequence => "sequence",
                ResourceType::Team => "team",
                ResourceType::Token => "token",
                ResourceType::User => "user",
            }
        )
    }
}
