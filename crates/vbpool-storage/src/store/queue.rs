use chrono::{DateTime, Utc};
use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ActiveValue::Set, ColumnTrait, ConnectionTrait, DbErr, EntityTrait, PaginatorTrait,
    QueryFilter,
};

use crate::entities::room_queue::{self, Column as QueueCol, Entity as QueueEntity};
use crate::error::Result;
use crate::store::VmStore;

/// `room_queue` is owned by the session service; these helpers exist so the
/// assignment protocol's liveness check can be driven end to end (and so
/// the ops API can stand in for that service).
impl VmStore {
    pub async fn enqueue_room(&self, room_id: &str, now: DateTime<Utc>) -> Result<()> {
        let am = room_queue::ActiveModel {
            room_id: Set(room_id.to_owned()),
            created_at: Set(now),
        };
        let res = QueueEntity::insert(am)
            .on_conflict(
                OnConflict::column(QueueCol::RoomId)
                    .do_nothing()
                    .to_owned(),
            )
            .exec(&self.db)
            .await;
        match res {
            Ok(_) | Err(DbErr::RecordNotInserted) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn dequeue_room(&self, room_id: &str) -> Result<bool> {
        let res = QueueEntity::delete_by_id(room_id).exec(&self.db).await?;
        Ok(res.rows_affected > 0)
    }

    pub async fn is_room_waiting(&self, room_id: &str) -> Result<bool> {
        Self::is_room_waiting_in(&self.db, room_id).await
    }

    /// Membership check on the caller's connection, so the assignment
    /// transaction re-reads the queue on every lease attempt.
    pub async fn is_room_waiting_in<C: ConnectionTrait>(conn: &C, room_id: &str) -> Result<bool> {
        let n = QueueEntity::find()
            .filter(QueueCol::RoomId.eq(room_id))
            .count(conn)
            .await?;
        Ok(n > 0)
    }
}
