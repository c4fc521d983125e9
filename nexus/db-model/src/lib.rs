// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Structures stored in the control plane ledger

#[macro_use]
extern crate diesel;
#[macro_use]
extern crate newtype_derive;

mod allocation;
mod allocation_constraint;
mod instance;
mod instance_type;
mod ip_block;
mod machine;
pub mod schema;
mod subnet;
mod sql_u32;

pub use allocation::*;
pub use allocation_constraint::*;
pub use instance::*;
pub use instance_type::*;
pub use ip_block::*;
pub use machine::*;
pub use subnet::*;
pub use sql_u32::SqlU32;

use ironplane_common::api::external::ResourceType;
use uuid::Uuid;

/// Implemented by every row type so that the ledger can store, look up and
/// report on rows without knowing their shape.
pub trait Resource: Clone + std::fmt::Debug + Send + Sync + 'static {
    const RESOURCE_TYPE: ResourceType;

    fn id(&self) -> Uuid;
}

macro_rules! impl_resource {
    ($model:ty, $resource_type:ident) => {
        impl $crate::Resource for $model {
            const RESOURCE_TYPE: ironplane_common::api::external::ResourceType =
                ironplane_common::api::external::ResourceType::$resource_type;

            fn id(&self) -> uuid::Uuid {
                self.id
            }
        }
    };
}

pub(crate) use impl_resource;

/// Defines a Postgres enum type and the Rust enum stored in it
///
/// The first item is the diesel SQL type, the second the model enum.  Each
/// variant is followed by the label it is stored as.
macro_rules! impl_enum_type {
    (
        $(#[$enum_meta:meta])*
        pub struct $diesel_type:ident;

        $(#[$model_meta:meta])*
        pub enum $model_type:ident;
        $(
            $(#[$item_meta:meta])*
            $enum_item:ident => $sql_value:literal
        )+
    ) => {
        $(#[$enum_meta])*
        pub struct $diesel_type;

        $(#[$model_meta])*
        #[diesel(sql_type = $diesel_type)]
        pub enum $model_type {
            $(
                $(#[$item_meta])*
                $enum_item,
            )*
        }

        impl ::diesel::serialize::ToSql<$diesel_type, ::diesel::pg::Pg>
            for $model_type
        {
            fn to_sql<'a>(
                &'a self,
                out: &mut ::diesel::serialize::Output<'a, '_, ::diesel::pg::Pg>,
            ) -> ::diesel::serialize::Result {
                use ::std::io::Write;
                match self {
                    $(
                    $model_type::$enum_item => {
                        out.write_all($sql_value)?
                    }
                    )*
                }
                Ok(::diesel::serialize::IsNull::No)
            }
        }

        impl ::diesel::deserialize::FromSql<$diesel_type, ::diesel::pg::Pg>
            for $model_type
        {
            fn from_sql(
                bytes: <::diesel::pg::Pg as ::diesel::backend::Backend>::RawValue<'_>,
            ) -> ::diesel::deserialize::Result<Self> {
                match bytes.as_bytes() {
                    $(
                    $sql_value => {
                        Ok($model_type::$enum_item)
                    }
                    )*
                    other => {
                        let s = concat!(
                            "Unrecognized enum variant for ",
                            stringify!{$model_type}
                        );
                        Err(format!("{}: (raw bytes: {:?})", s, other).into())
                    }
                }
            }
        }
    }
}

pub(crate) use impl_enum_type;
