use sea_orm_migration::prelude::*;

pub struct Migration;

impl MigrationName for Migration {
    fn name(&self) -> &str {
        "m001_initial_schema"
    }
}

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(VmRecords::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(VmRecords::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(VmRecords::Pool).string_len(64).not_null())
                    .col(ColumnDef::new(VmRecords::Vmid).string_len(64).not_null())
                    .col(ColumnDef::new(VmRecords::State).string_len(16).not_null())
                    .col(
                        ColumnDef::new(VmRecords::CreationTime)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(ColumnDef::new(VmRecords::ReadyTime).timestamp_with_time_zone())
                    .col(ColumnDef::new(VmRecords::AssignTime).timestamp_with_time_zone())
                    .col(ColumnDef::new(VmRecords::HeartbeatTime).timestamp_with_time_zone())
                    .col(ColumnDef::new(VmRecords::ResetTime).timestamp_with_time_zone())
                    .col(
                        ColumnDef::new(VmRecords::Retries)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(VmRecords::RoomId).string_len(64))
                    .col(ColumnDef::new(VmRecords::Uid).string_len(64))
                    .col(ColumnDef::new(VmRecords::Data).text())
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_vm_records_pool_vmid")
                    .table(VmRecords::Table)
                    .col(VmRecords::Pool)
                    .col(VmRecords::Vmid)
                    .unique()
                    .to_owned(),
            )
            .await?;

        // Lease and shrink both scan (pool, state) ordered by id.
        manager
            .create_index(
                Index::create()
                    .name("idx_vm_records_pool_state")
                    .table(VmRecords::Table)
                    .col(VmRecords::Pool)
                    .col(VmRecords::State)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(RoomQueue::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(RoomQueue::RoomId)
                            .string_len(64)
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(RoomQueue::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(RoomQueue::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(VmRecords::Table).to_owned())
            .await?;
        Ok(())
    }
}

#[derive(DeriveIden)]
enum VmRecords {
    Table,
    Id,
    Pool,
    Vmid,
    State,
    CreationTime,
    ReadyTime,
    AssignTime,
    HeartbeatTime,
    ResetTime,
    Retries,
    RoomId,
    Uid,
    Data,
}

#[derive(DeriveIden)]
enum RoomQueue {
    Table,
    RoomId,
    CreatedAt,
}
