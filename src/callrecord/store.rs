use super::{CallDirection, CallRecord, CallStatus};
use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, QuerySelect, Set,
};
use serde::Serialize;
use std::collections::HashMap;

use crate::models::call_log::{ActiveModel, Column, Entity, Model};

#[derive(Debug, Clone, Default, Serialize)]
pub struct CallStats {
    pub total_calls: u64,
    pub by_status: HashMap<String, u64>,
    pub by_direction: HashMap<String, u64>,
    pub total_duration_seconds: u64,
    pub avg_duration_seconds: f64,
}

/// Fields known when an attempt opens. Everything else arrives with the
/// single terminal update.
#[derive(Debug, Clone, Default)]
pub struct NewCall {
    pub direction: CallDirection,
    pub caller_id: Option<String>,
    pub dialed_number: Option<String>,
    pub destination: Option<String>,
    pub speed_dial_code: Option<String>,
}

/// The call-log table. All writes funnel through the persistence sink;
/// reads serve the surrounding application's query API.
#[derive(Clone)]
pub struct CallLogStore {
    db: DatabaseConnection,
}

impl CallLogStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Open an attempt as in-progress; returns the record id.
    pub async fn insert_in_progress(&self, call: NewCall) -> Result<i64> {
        let model = ActiveModel {
            timestamp: Set(Utc::now()),
            direction: Set(call.direction.as_str().to_string()),
            status: Set(CallStatus::InProgress.as_str().to_string()),
            caller_id: Set(call.caller_id),
            dialed_number: Set(call.dialed_number),
            destination: Set(call.destination),
            speed_dial_code: Set(call.speed_dial_code),
            duration_seconds: Set(0),
            ..Default::default()
        };
        let inserted = model.insert(&self.db).await.context("insert call record")?;
        Ok(inserted.id)
    }

    /// Record an attempt that was refused outright; the row is born closed.
    pub async fn insert_closed(
        &self,
        call: NewCall,
        status: CallStatus,
        error_message: Option<String>,
    ) -> Result<i64> {
        let now = Utc::now();
        let model = ActiveModel {
            timestamp: Set(now),
            direction: Set(call.direction.as_str().to_string()),
            status: Set(status.as_str().to_string()),
            caller_id: Set(call.caller_id),
            dialed_number: Set(call.dialed_number),
            destination: Set(call.destination),
            speed_dial_code: Set(call.speed_dial_code),
            duration_seconds: Set(0),
            ended_at: Set(Some(now)),
            error_message: Set(error_message),
            ..Default::default()
        };
        let inserted = model.insert(&self.db).await.context("insert call record")?;
        Ok(inserted.id)
    }

    /// The one permitted mutation: close an in-progress record.
    pub async fn close(
        &self,
        record_id: i64,
        status: CallStatus,
        duration_seconds: u64,
        error_message: Option<String>,
    ) -> Result<()> {
        let ended_at = Utc::now();
        let answered_at = if duration_seconds > 0 {
            Some(ended_at - ChronoDuration::seconds(duration_seconds as i64))
        } else {
            None
        };
        let model = ActiveModel {
            id: Set(record_id),
            status: Set(status.as_str().to_string()),
            duration_seconds: Set(duration_seconds as i32),
            answered_at: Set(answered_at),
            ended_at: Set(Some(ended_at)),
            error_message: Set(error_message),
            ..Default::default()
        };
        model.update(&self.db).await.context("close call record")?;
        Ok(())
    }

    pub async fn get(&self, record_id: i64) -> Result<Option<CallRecord>> {
        let found = Entity::find_by_id(record_id)
            .one(&self.db)
            .await
            .context("load call record")?;
        Ok(found.map(CallRecord::from))
    }

    /// Most recent first.
    pub async fn list(&self, limit: u64) -> Result<Vec<CallRecord>> {
        let rows = Entity::find()
            .order_by_desc(Column::Timestamp)
            .order_by_desc(Column::Id)
            .limit(limit)
            .all(&self.db)
            .await
            .context("list call records")?;
        Ok(rows.into_iter().map(CallRecord::from).collect())
    }

    pub async fn delete(&self, record_id: i64) -> Result<bool> {
        let result = Entity::delete_by_id(record_id)
            .exec(&self.db)
            .await
            .context("delete call record")?;
        Ok(result.rows_affected > 0)
    }

    pub async fn in_progress_count(&self) -> Result<u64> {
        let count = Entity::find()
            .filter(Column::Status.eq(CallStatus::InProgress.as_str()))
            .count(&self.db)
            .await
            .context("count in-progress records")?;
        Ok(count)
    }

    pub async fn stats_over_days(&self, days: u32) -> Result<CallStats> {
        let cutoff: DateTime<Utc> = Utc::now() - ChronoDuration::days(days as i64);

        let total_calls = Entity::find()
            .filter(Column::Timestamp.gte(cutoff))
            .count(&self.db)
            .await?;

        let by_status: Vec<(String, i64)> = Entity::find()
            .select_only()
            .column(Column::Status)
            .column_as(Column::Id.count(), "count")
            .filter(Column::Timestamp.gte(cutoff))
            .group_by(Column::Status)
            .into_tuple()
            .all(&self.db)
            .await?;

        let by_direction: Vec<(String, i64)> = Entity::find()
            .select_only()
            .column(Column::Direction)
            .column_as(Column::Id.count(), "count")
            .filter(Column::Timestamp.gte(cutoff))
            .group_by(Column::Direction)
            .into_tuple()
            .all(&self.db)
            .await?;

        let completed_durations: Vec<i32> = Entity::find()
            .select_only()
            .column(Column::DurationSeconds)
            .filter(Column::Timestamp.gte(cutoff))
            .filter(Column::Status.eq(CallStatus::Completed.as_str()))
            .into_tuple()
            .all(&self.db)
            .await?;

        let total_duration_seconds: u64 = completed_durations.iter().map(|d| *d as u64).sum();
        let avg_duration_seconds = if completed_durations.is_empty() {
            0.0
        } else {
            total_duration_seconds as f64 / completed_durations.len() as f64
        };

        Ok(CallStats {
            total_calls,
            by_status: by_status
                .into_iter()
                .map(|(status, count)| (status, count as u64))
                .collect(),
            by_direction: by_direction
                .into_iter()
                .map(|(direction, count)| (direction, count as u64))
                .collect(),
            total_duration_seconds,
            avg_duration_seconds,
        })
    }
}

impl From<Model> for CallRecord {
    fn from(model: Model) -> Self {
        CallRecord {
            id: model.id,
            timestamp: model.timestamp,
            direction: CallDirection::parse(&model.direction),
            status: CallStatus::parse(&model.status),
            caller_id: model.caller_id,
            dialed_number: model.dialed_number,
            destination: model.destination,
            speed_dial_code: model.speed_dial_code,
            duration_seconds: model.duration_seconds as u64,
            answered_at: model.answered_at,
            ended_at: model.ended_at,
            error_message: model.error_message,
        }
    }
}
