// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error handling and conversions.

use diesel::result::DatabaseErrorInformation;
use diesel::result::DatabaseErrorKind as DieselErrorKind;
use diesel::result::Error as DieselError;
use ironplane_common::api::external::Error as PublicError;
use ironplane_common::api::external::ResourceType;

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

/// Returns true if `error` is PostgreSQL giving up on a lock wait because
/// `lock_timeout` ran out.
pub fn is_lock_timeout(error: &DieselError) -> bool {
    match error {
        DieselError::DatabaseError(_, info) => {
            info.message().contains("lock timeout")
        }
        _ => false,
    }
}

/// Converts a Diesel error to an external error.
pub fn public_error_from_diesel(error: DieselError) -> PublicError {
    match error {
        DieselError::DatabaseError(kind, info) => {
            PublicError::internal_error(&format_database_error(kind, &*info))
        }
        error => PublicError::internal_error(&format!(
            "Unknown diesel error: {:?}",
            error
        )),
    }
}

/// Converts a Diesel error to an external error, when requested as
/// part of a creation operation.
pub fn public_error_from_diesel_create(
    error: DieselError,
    resource_type: ResourceType,
    object_name: &str,
) -> PublicError {
    match error {
        DieselError::DatabaseError(DieselErrorKind::UniqueViolation, _) => {
            PublicError::ObjectAlreadyExists {
                type_name: resource_type,
                object_name: object_name.to_string(),
            }
        }
        _ => public_error_from_diesel(error),
    }
}
