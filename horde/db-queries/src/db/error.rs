// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error handling and conversions.

use diesel::result::DatabaseErrorInformation;
use diesel::result::DatabaseErrorKind as DieselErrorKind;
use diesel::result::Error as DieselError;
use horde_common::api::external::Error as PublicError;
use horde_common::api::external::LookupType;
use horde_common::api::external::ResourceType;

/// Error which may be returned from a transaction closure.
///
/// Database errors are translated into public errors once the transaction
/// has been rolled back, using the context of the whole operation.  Errors
/// detected by the operation itself (failed authorization, missing
/// referents) are carried through unchanged.
#[derive(Debug, thiserror::Error)]
pub enum TransactionError {
    #[error(transparent)]
    Custom(PublicError),
    #[error("Database error")]
    Database(#[from] DieselError),
}

impl From<PublicError> for TransactionError {
    fn from(err: PublicError) -> Self {
        TransactionError::Custom(err)
    }
}

impl TransactionError {
    /// Converts into a public error for an operation on an object of type
    /// `resource_type` looked up by `lookup_type`.
    pub fn into_public(
        self,
        resource_type: ResourceType,
        lookup_type: LookupType,
    ) -> PublicError {
        match self {
            TransactionError::Custom(err) => err,
            TransactionError::Database(err) => {
                public_error_from_diesel(err, resource_type, lookup_type)
            }
        }
    }
}

/// Integrity constraints whose violation maps onto a public error
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConstraintViolation {
    /// Unique or primary key
    Unique,
    /// Foreign key
    ForeignKey,
}

/// Classifies a database error as a constraint violation.
///
/// The driver's error kind is authoritative.  Drivers that report a
/// violation without a kind are recognized by the text of the message.
pub fn constraint_violation(
    kind: &DieselErrorKind,
    message: &str,
) -> Option<ConstraintViolation> {
    match kind {
        DieselErrorKind::UniqueViolation => {
            return Some(ConstraintViolation::Unique)
        }
        DieselErrorKind::ForeignKeyViolation => {
            return Some(ConstraintViolation::ForeignKey)
        }
        _ => (),
    }
    let message = message.to_lowercase();
    if message.contains("unique constraint") || message.contains("duplicate key")
    {
        Some(ConstraintViolation::Unique)
    } else if message.contains("foreign key constraint") {
        Some(ConstraintViolation::ForeignKey)
    } else {
        None
    }
}

/// Summarizes details provided with a database error.
fn format_database_error(
    kind: DieselErrorKind,
    info: &dyn DatabaseErrorInformation,
) -> String {
    let mut rv =
        format!("database error (kind = {:?}): {}\n", kind, info.message());
    if let Some(details) = info.details() {
        rv.push_str(&format!("DETAILS: {}\n", details));
    }
    if let Some(hint) = info.hint() {
        rv.push_str(&format!("HINT: {}\n", hint));
    }
    if let Some(table_name) = info.table_name() {
        rv.push_str(&format!("TABLE NAME: {}\n", table_name));
    }
    if let Some(column_name) = info.column_name() {
        rv.push_str(&format!("COLUMN NAME: {}\n", column_name));
    }
    if let Some(constraint_name) = info.constraint_name() {
        rv.push_str(&format!("CONSTRAINT NAME: {}\n", constraint_name));
    }
    rv
}

/// Renders a lookup as the object name of a conflict error.
fn object_name(lookup_type: &LookupType) -> String {
    match lookup_type {
        LookupType::ById(id) => id.to_string(),
        LookupType::ByName(name) => name.clone(),
        LookupType::ByImsi(imsi) => imsi.to_string(),
        LookupType::BySecret => "(secret)".to_string(),
        LookupType::ByCompositeId(label) => label.clone(),
    }
}

/// Converts a Diesel error to an external error.
///
/// A missing row is reported as the object not being found, a unique
/// violation as the object already existing, and a foreign key violation as
/// the object still being referenced.  Anything else is an internal error
/// carrying the database's description of the failure.
pub fn public_error_from_diesel(
    error: DieselError,
    resource_type: ResourceType,
    lookup_type: LookupType,
) -> PublicError {
    match error {
        DieselError::NotFound => PublicError::ObjectNotFound {
            type_name: resource_type,
            lookup_type,
        },
        DieselError::DatabaseError(kind, info) => {
            match constraint_violation(&kind, info.message()) {
                Some(ConstraintViolation::Unique) => {
                    PublicError::ObjectAlreadyExists {
                        type_name: resource_type,
                        object_name: object_name(&lookup_type),
                    }
                }
                Some(ConstraintViolation::ForeignKey) => {
                    PublicError::Referenced {
                        type_name: resource_type,
                        object_name: object_name(&lookup_type),
                    }
                }
                None => PublicError::internal_error(&format_database_error(
                    kind, &*info,
                )),
            }
        }
        error => PublicError::internal_error(&format!(
            "Unknown diesel error: {:?}",
            error
        )),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_matches::assert_matches;
    use horde_common::key::Key;

    #[derive(Debug)]
    struct Info(&'static str);

    impl DatabaseErrorInformation for Info {
        fn message(&self) -> &str {
            self.0
        }
        fn details(&self) -> Option<&str> {
            None
        }
        fn hint(&self) -> Option<&str> {
            None
        }
        fn table_name(&self) -> Option<&str> {
            None
        }
        fn column_name(&self) -> Option<&str> {
            None
        }
        fn constraint_name(&self) -> Option<&str> {
            None
        }
        fn statement_position(&self) -> Option<i32> {
            None
        }
    }

    fn db_error(kind: DieselErrorKind, message: &'static str) -> DieselError {
        DieselError::DatabaseError(kind, Box::new(Info(message)))
    }

    #[test]
    fn test_native_kinds() {
        let lookup = LookupType::ById(Key::from(5));
        assert_matches!(
            public_error_from_diesel(
                db_error(DieselErrorKind::UniqueViolation, "whatever"),
                ResourceType::Team,
                lookup.clone(),
            ),
            PublicError::ObjectAlreadyExists { type_name: ResourceType::Team, object_name }
                if object_name == "5"
        );
        assert_matches!(
            public_error_from_diesel(
                db_error(DieselErrorKind::ForeignKeyViolation, "whatever"),
                ResourceType::Collection,
                lookup.clone(),
            ),
            PublicError::Referenced { type_name: ResourceType::Collection, .. }
        );
        assert_matches!(
            public_error_from_diesel(
                DieselError::NotFound,
                ResourceType::Device,
                lookup,
            ),
            PublicError::ObjectNotFound { type_name: ResourceType::Device, .. }
        );
    }

    #[test]
    fn test_message_fallback() {
        let unknown = DieselErrorKind::Unknown;
        for message in [
            "UNIQUE constraint failed: team.team_id",
            "duplicate key value violates unique constraint \"team_pkey\"",
        ] {
            assert_eq!(
                constraint_violation(&unknown, message),
                Some(ConstraintViolation::Unique)
            );
        }
        for message in [
            "FOREIGN KEY constraint failed",
            "update or delete on table \"team\" violates foreign key \
             constraint \"collection_team_id_fkey\"",
        ] {
            assert_eq!(
                constraint_violation(&unknown, message),
                Some(ConstraintViolation::ForeignKey)
            );
        }
        assert_eq!(
            constraint_violation(&unknown, "canceling statement due to timeout"),
            None
        );
    }

    #[test]
    fn test_other_errors_are_internal() {
        let err = public_error_from_diesel(
            db_error(DieselErrorKind::Unknown, "disk I/O error"),
            ResourceType::Team,
            LookupType::BySecret,
        );
        assert_matches!(
            err,
            PublicError::InternalError { internal_message }
                if internal_message.contains("disk I/O error")
        );
    }
}
