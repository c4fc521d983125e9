// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use diesel::backend::Backend;
use diesel::deserialize::{self, FromSql};
use diesel::pg::Pg;
use diesel::serialize::{self, ToSql};
use diesel::sql_types;
use serde::{Deserialize, Serialize};

/// Representation of a [`u32`] in the database.
/// We need this because the database does not support unsigned types.
/// This handles converting from the database's INT8 to the actual u32.
#[derive(
    Copy,
    Clone,
    Debug,
    AsExpression,
    Eq,
    Ord,
    PartialEq,
    PartialOrd,
    FromSqlRow,
    Serialize,
    Deserialize,
)]
#[diesel(sql_type = sql_types::BigInt)]
#[repr(transparent)]
pub struct SqlU32(pub u32);

NewtypeFrom! { () pub struct SqlU32(u32); }
NewtypeDeref! { () pub struct SqlU32(u32); }

impl SqlU32 {
    pub fn new(value: u32) -> Self {
        Self(value)
    }
}

impl ToSql<sql_types::BigInt, Pg> for SqlU32 {
    fn to_sql<'a>(
        &'a self,
        out: &mut serialize::Output<'a, '_, Pg>,
    ) -> serialize::Result {
        <i64 as ToSql<sql_types::BigInt, Pg>>::to_sql(
            &i64::from(self.0),
            &mut out.reborrow(),
        )
    }
}

impl<DB> FromSql<sql_types::BigInt, DB> for SqlU32
where
    DB: Backend,
    i64: FromSql<sql_types::BigInt, DB>,
{
    fn from_sql(bytes: DB::RawValue<'_>) -> deserialize::Result<Self> {
        u32::try_from(i64::from_sql(bytes)?).map(SqlU32).map_err(|e| e.into())
    }
}
