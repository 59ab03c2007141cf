// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error handling facilities for the Horde core

use crate::api::external::ResourceType;
use crate::key::Key;
use serde::Deserialize;
use serde::Serialize;
use std::fmt::Display;

/// An error that can be generated within the core
///
/// These may be generated while handling a request from one of the outer
/// surfaces (REST, transport listeners) or as part of background operation.
/// The outer surfaces convert an `Error` into their own representation as one
/// of the last steps in processing the request, which keeps the core agnostic
/// of the transport used to reach it.
///
/// Lookups of objects the acting user is not allowed to see report
/// [`Error::ObjectNotFound`], never [`Error::AccessDenied`], so that the
/// existence of other teams' objects does not leak.
#[derive(Clone, Debug, Deserialize, thiserror::Error, PartialEq, Serialize)]
pub enum Error {
    /// An object needed as part of this operation was not found.
    #[error("Object (of type {lookup_type:?}) not found: {type_name}")]
    ObjectNotFound { type_name: ResourceType, lookup_type: LookupType },
    /// The object is visible to the acting user, but the operation requires
    /// administrative rights.
    #[error("Access denied to {type_name} ({lookup_type:?})")]
    AccessDenied { type_name: ResourceType, lookup_type: LookupType },
    /// An object already exists with the specified name or identifier.
    #[error("Object (of type {type_name:?}) already exists: {object_name}")]
    ObjectAlreadyExists { type_name: ResourceType, object_name: String },
    /// A firmware image with the same SHA-256 already exists in the
    /// collection.
    #[error("Firmware with SHA-256 {sha256} already exists")]
    ShaAlreadyExists { sha256: String },
    /// The object cannot be removed because other objects refer to it.
    #[error("Object (of type {type_name:?}) is still referenced: {object_name}")]
    Referenced { type_name: ResourceType, object_name: String },
    /// The request was well-formed, but the operation cannot be completed given
    /// the current state of the system.
    #[error("Invalid Request: {message}")]
    InvalidRequest { message: String },

    /// The system encountered an unhandled operational error.
    #[error("Internal Error: {internal_message}")]
    InternalError { internal_message: String },
    /// The system (or part of it) is unavailable.
    #[error("Service Unavailable: {internal_message}")]
    ServiceUnavailable { internal_message: String },
}

/// Indicates how an object was looked up (for an `ObjectNotFound` error)
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub enum LookupType {
    /// a specific key was requested
    ById(Key),
    /// a specific name was requested
    ByName(String),
    /// a device was looked up by its IMSI
    ByImsi(i64),
    /// a secret (token or invite code) was requested; the secret itself is
    /// not recorded
    BySecret,
    /// a specific id was requested with some composite type
    /// (caller summarizes it)
    ByCompositeId(String),
}

impl LookupType {
    /// Returns an ObjectNotFound error appropriate for the case where this
    /// lookup failed
    pub fn into_not_found(self, type_name: ResourceType) -> Error {
        Error::ObjectNotFound { type_name, lookup_type: self }
    }

    /// Returns an AccessDenied error appropriate for the case where this
    /// lookup found an object the caller cannot modify
    pub fn into_access_denied(self, type_name: ResourceType) -> Error {
        Error::AccessDenied { type_name, lookup_type: self }
    }
}

impl From<&str> for LookupType {
    fn from(name: &str) -> Self {
        LookupType::ByName(name.to_owned())
    }
}

impl From<Key> for LookupType {
    fn from(key: Key) -> Self {
        LookupType::ById(key)
    }
}

impl Error {
    /// Returns whether the error is likely transient and could reasonably be
    /// retried
    pub fn retryable(&self) -> bool {
        match self {
            Error::ServiceUnavailable { .. } => true,

            Error::ObjectNotFound { .. }
            | Error::AccessDenied { .. }
            | Error::ObjectAlreadyExists { .. }
            | Error::ShaAlreadyExists { .. }
            | Error::Referenced { .. }
            | Error::InvalidRequest { .. }
            | Error::InternalError { .. } => false,
        }
    }

    /// Generates an [`Error::ObjectNotFound`] error for a lookup by object
    /// name.
    pub fn not_found_by_name(type_name: ResourceType, name: &str) -> Error {
        LookupType::from(name).into_not_found(type_name)
    }

    /// Generates an [`Error::ObjectNotFound`] error for a lookup by key.
    pub fn not_found_by_id(type_name: ResourceType, id: Key) -> Error {
        LookupType::ById(id).into_not_found(type_name)
    }

    /// Generates an [`Error::AccessDenied`] error for an object identified by
    /// key.
    pub fn access_denied_by_id(type_name: ResourceType, id: Key) -> Error {
        LookupType::ById(id).into_access_denied(type_name)
    }

    /// Generates an [`Error::ObjectAlreadyExists`] error.
    pub fn already_exists(type_name: ResourceType, object_name: &str) -> Error {
        Error::ObjectAlreadyExists {
            type_name,
            object_name: object_name.to_owned(),
        }
    }

    /// Generates an [`Error::Referenced`] error.
    pub fn referenced(type_name: ResourceType, object_name: &str) -> Error {
        Error::Referenced { type_name, object_name: object_name.to_owned() }
    }

    /// Generates an [`Error::InternalError`] error with the specific message
    ///
    /// InternalError should be used for operational conditions that should not
    /// happen but that we cannot reasonably handle at runtime (e.g.,
    /// deserializing a value from the database, or finding two records for
    /// something that is supposed to be unique).
    pub fn internal_error(internal_message: &str) -> Error {
        Error::InternalError { internal_message: internal_message.to_owned() }
    }

    /// Generates an [`Error::InvalidRequest`] error with the specific message
    ///
    /// This should be used for failures due possibly to invalid client input
    /// or malformed requests.
    pub fn invalid_request(message: &str) -> Error {
        Error::InvalidRequest { message: message.to_owned() }
    }

    /// Generates an [`Error::ServiceUnavailable`] error with the specific
    /// message
    ///
    /// This should be used for transient failures where the caller might be
    /// expected to retry, including an exhausted address range.
    pub fn unavail(message: &str) -> Error {
        Error::ServiceUnavailable { internal_message: message.to_owned() }
    }

    /// Given an [`Error`] with an internal message, return the same error with
    /// `context` prepended to it to provide more context
    ///
    /// If the error has no internal message, then it is returned unchanged.
    pub fn internal_context<C>(self, context: C) -> Error
    where
        C: Display + Send + Sync + 'static,
    {
        match self {
            Error::ObjectNotFound { .. }
            | Error::AccessDenied { .. }
            | Error::ObjectAlreadyExists { .. }
            | Error::ShaAlreadyExists { .. }
            | Error::Referenced { .. }
            | Error::InvalidRequest { .. } => self,
            Error::InternalError { internal_message } => Error::InternalError {
                internal_message: format!("{}: {}", context, internal_message),
            },
            Error::ServiceUnavailable { internal_message } => {
                Error::ServiceUnavailable {
                    internal_message: format!(
                        "{}: {}",
                        context, internal_message
                    ),
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::Error;
    use super::LookupType;
    use crate::api::external::ResourceType;
    use crate::key::Key;

    #[test]
    fn test_context() {
        // test `internal_context()` and (separately) `InternalError` display
        // and debug output
        let error: Error = Error::internal_error("boom")
            .internal_context(format!("uh-oh (#{:2})", 2))
            .internal_context("Outer context");
        assert_eq!(
            error.to_string(),
            "Internal Error: Outer context: uh-oh (# 2): boom"
        );

        // Variants without an internal message are left unchanged.
        let error = Error::not_found_by_id(ResourceType::Team, Key::from(7))
            .internal_context("ignored");
        assert_eq!(
            error,
            Error::ObjectNotFound {
                type_name: ResourceType::Team,
                lookup_type: LookupType::ById(Key::from(7)),
            }
        );
    }

    #[test]
    fn test_retryable() {
        assert!(Error::unavail("pool exhausted").retryable());
        assert!(!Error::internal_error("boom").retryable());
        assert!(!Error::referenced(ResourceType::Apn, "1").retryable());
    }
}
