// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::impl_enum_type;
use crate::impl_resource;
use crate::schema::machine;
use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

impl_enum_type!(
    #[derive(SqlType, Debug, QueryId)]
    #[diesel(postgres_type(name = "machine_status"))]
    pub struct MachineStatusEnum;

    #[derive(
        Clone,
        Copy,
        Debug,
        AsExpression,
        FromSqlRow,
        Deserialize,
        Eq,
        PartialEq,
        Serialize,
        strum::Display,
    )]
    pub enum MachineStatus;

    Unknown => b"unknown"
    Initializing => b"initializing"
    Ready => b"ready"
    Reset => b"reset"
    InUse => b"in_use"
    Maintenance => b"maintenance"
    Error => b"error"
    Decommissioned => b"decommissioned"
);

impl MachineStatus {
    /// Machines in these states may be newly associated with an
    /// InstanceType.
    pub fn is_assignable(&self) -> bool {
        matches!(self, MachineStatus::Ready | MachineStatus::Reset)
    }

    /// Machines in these states count towards an InstanceType's supply.
    pub fn counts_as_supply(&self) -> bool {
        matches!(
            self,
            MachineStatus::Ready | MachineStatus::Reset | MachineStatus::InUse
        )
    }

    /// The states for which [`MachineStatus::counts_as_supply`] is true
    pub const SUPPLY: [MachineStatus; 3] =
        [MachineStatus::Ready, MachineStatus::Reset, MachineStatus::InUse];
}

/// A physical host at a Site
#[derive(
    Clone,
    Debug,
    Deserialize,
    PartialEq,
    Serialize,
    Queryable,
    Insertable,
    Selectable,
    AsChangeset,
)]
#[diesel(table_name = machine, treat_none_as_null = true)]
pub struct Machine {
    pub id: Uuid,
    pub infrastructure_provider_id: Uuid,
    pub site_id: Uuid,
    pub instance_type_id: Option<Uuid>,
    pub status: MachineStatus,
    pub time_created: DateTime<Utc>,
    pub time_modified: DateTime<Utc>,
}

impl Machine {
    pub fn new(
        infrastructure_provider_id: Uuid,
        site_id: Uuid,
        status: MachineStatus,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            infrastructure_provider_id,
            site_id,
            instance_type_id: None,
            status,
            time_created: now,
            time_modified: now,
        }
    }
}

impl_resource!(Machine, Machine);

#[cfg(test)]
mod test {
    use super::MachineStatus;

    #[test]
    fn test_supply_states() {
        let all = [
            MachineStatus::Unknown,
            MachineStatus::Initializing,
            MachineStatus::Ready,
            MachineStatus::Reset,
            MachineStatus::InUse,
            MachineStatus::Maintenance,
            MachineStatus::Error,
            MachineStatus::Decommissioned,
        ];
        let supply: Vec<_> =
            all.into_iter().filter(|s| s.counts_as_supply()).collect();
        assert_eq!(supply, MachineStatus::SUPPLY);
        assert!(MachineStatus::SUPPLY
            .iter()
            .filter(|s| s.is_assignable())
            .all(|s| *s != MachineStatus::InUse));
    }
}
