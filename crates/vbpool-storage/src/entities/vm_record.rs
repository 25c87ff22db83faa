use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// One managed VM. `id` is the monotonic ordering key: lease takes the
/// lowest available id, decommission walks the same order.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "vm_records")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub pool: String,
    pub vmid: String,
    pub state: VmState,
    pub creation_time: DateTimeUtc,
    pub ready_time: Option<DateTimeUtc>,
    pub assign_time: Option<DateTimeUtc>,
    pub heartbeat_time: Option<DateTimeUtc>,
    pub reset_time: Option<DateTimeUtc>,
    pub retries: i32,
    pub room_id: Option<String>,
    pub uid: Option<String>,
    /// Cached provider descriptor, JSON.
    pub data: Option<String>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "lowercase")]
pub enum VmState {
    #[sea_orm(string_value = "staging")]
    Staging,
    #[sea_orm(string_value = "available")]
    Available,
    #[sea_orm(string_value = "used")]
    Used,
}
