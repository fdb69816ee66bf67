//! Postgres-backed stores.
//!
//! Schema is bootstrapped on connect (idempotent DDL). Every incident
//! mutation is a single field-scoped `UPDATE`; concurrent writers touching
//! disjoint fields never clobber each other.

use std::collections::BTreeSet;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, QueryBuilder, Row};
use uuid::Uuid;

use opspulse_core::{
    Event, EventId, Incident, IncidentId, IncidentStatus, ServiceStats, Severity,
};

use crate::error::StoreError;
use crate::query::{EventFilter, EventSort, IncidentFilter, IncidentSort, Page, Pagination};
use crate::traits::{
    EventStatsSummary, EventStore, IncidentPatch, IncidentStore, InsertReport, StatsStore,
};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS events (
        event_id    UUID PRIMARY KEY,
        service     TEXT NOT NULL,
        severity    SMALLINT NOT NULL CHECK (severity BETWEEN 1 AND 5),
        timestamp   TIMESTAMPTZ NOT NULL,
        metadata    JSONB NOT NULL DEFAULT '{}'::jsonb,
        tags        TEXT[] NOT NULL DEFAULT '{}',
        incident_id UUID
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_events_ts_service ON events (timestamp DESC, service)",
    "CREATE INDEX IF NOT EXISTS idx_events_service_sev ON events (service, severity, timestamp DESC)",
    "CREATE INDEX IF NOT EXISTS idx_events_incident ON events (incident_id)",
    r#"
    CREATE TABLE IF NOT EXISTS incidents (
        incident_id          UUID PRIMARY KEY,
        event_ids            UUID[] NOT NULL DEFAULT '{}',
        status               TEXT NOT NULL,
        severity_score       SMALLINT NOT NULL,
        affected_services    TEXT[] NOT NULL,
        summary              TEXT NOT NULL DEFAULT '',
        ai_generated_summary TEXT NOT NULL DEFAULT '',
        root_cause           TEXT NOT NULL DEFAULT '',
        resolution           TEXT NOT NULL DEFAULT '',
        suggested_actions    TEXT[] NOT NULL DEFAULT '{}',
        assigned_to          TEXT,
        created_at           TIMESTAMPTZ NOT NULL,
        updated_at           TIMESTAMPTZ NOT NULL,
        acknowledged_at      TIMESTAMPTZ,
        resolved_at          TIMESTAMPTZ
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_incidents_status ON incidents (status, created_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_incidents_severity ON incidents (severity_score DESC, status)",
    "CREATE INDEX IF NOT EXISTS idx_incidents_services ON incidents USING GIN (affected_services)",
    r#"
    CREATE TABLE IF NOT EXISTS service_stats (
        service    TEXT NOT NULL,
        window_key TEXT NOT NULL,
        count      BIGINT NOT NULL DEFAULT 0,
        timestamp  TIMESTAMPTZ NOT NULL,
        PRIMARY KEY (service, window_key)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_stats_ts ON service_stats (timestamp)",
];

/// One pool backing all three store contracts.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect, bound by the store timeout, and bootstrap the schema.
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(timeout)
            .connect(url)
            .await?;
        let store = Self { pool };
        store.bootstrap().await?;
        Ok(store)
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn bootstrap(&self) -> Result<(), StoreError> {
        for ddl in SCHEMA {
            sqlx::query(ddl).execute(&self.pool).await?;
        }
        Ok(())
    }
}

fn event_from_row(row: &PgRow) -> Result<Event, StoreError> {
    let tags: Vec<String> = row.try_get("tags").map_err(StoreError::from)?;
    Ok(Event {
        event_id: EventId::from_uuid(row.try_get::<Uuid, _>("event_id")?),
        service: row.try_get("service")?,
        severity: Severity::clamped(row.try_get::<i16, _>("severity")? as i64),
        timestamp: row.try_get("timestamp")?,
        metadata: row.try_get("metadata")?,
        tags: tags.into_iter().collect(),
        incident_id: row
            .try_get::<Option<Uuid>, _>("incident_id")?
            .map(IncidentId::from_uuid),
    })
}

fn incident_from_row(row: &PgRow) -> Result<Incident, StoreError> {
    let status_raw: String = row.try_get("status")?;
    let status = IncidentStatus::from_str(&status_raw)
        .map_err(|e| StoreError::Corrupt(e.to_string()))?;
    let event_ids: Vec<Uuid> = row.try_get("event_ids")?;
    let services: Vec<String> = row.try_get("affected_services")?;
    Ok(Incident {
        incident_id: IncidentId::from_uuid(row.try_get::<Uuid, _>("incident_id")?),
        event_ids: event_ids.into_iter().map(EventId::from_uuid).collect(),
        status,
        severity_score: row.try_get::<i16, _>("severity_score")? as u8,
        affected_services: services.into_iter().collect::<BTreeSet<String>>(),
        summary: row.try_get("summary")?,
        ai_generated_summary: row.try_get("ai_generated_summary")?,
        root_cause: row.try_get("root_cause")?,
        resolution: row.try_get("resolution")?,
        suggested_actions: row.try_get("suggested_actions")?,
        assigned_to: row.try_get("assigned_to")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        acknowledged_at: row.try_get("acknowledged_at")?,
        resolved_at: row.try_get("resolved_at")?,
    })
}

fn push_event_filters(builder: &mut QueryBuilder<'_, Postgres>, filter: &EventFilter) {
    if let Some(service) = &filter.service {
        builder.push(" AND service = ").push_bind(service.clone());
    }
    if let Some(severity) = filter.severity {
        builder
            .push(" AND severity = ")
            .push_bind(severity as i16);
    }
    if let Some(min) = filter.min_severity {
        builder.push(" AND severity >= ").push_bind(min as i16);
    }
    if let Some(max) = filter.max_severity {
        builder.push(" AND severity <= ").push_bind(max as i16);
    }
    if let Some(start) = filter.start {
        builder.push(" AND timestamp >= ").push_bind(start);
    }
    if let Some(end) = filter.end {
        builder.push(" AND timestamp <= ").push_bind(end);
    }
    if !filter.tags.is_empty() {
        builder
            .push(" AND tags @> ")
            .push_bind(filter.tags.clone());
    }
}

fn push_incident_filters(builder: &mut QueryBuilder<'_, Postgres>, filter: &IncidentFilter) {
    if let Some(status) = filter.status {
        builder
            .push(" AND status = ")
            .push_bind(status.as_str().to_string());
    }
    if let Some(min) = filter.min_severity {
        builder
            .push(" AND severity_score >= ")
            .push_bind(min as i16);
    }
    if let Some(service) = &filter.service {
        builder
            .push(" AND ")
            .push_bind(service.clone())
            .push(" = ANY(affected_services)");
    }
    if let Some(start) = filter.start {
        builder.push(" AND created_at >= ").push_bind(start);
    }
    if let Some(end) = filter.end {
        builder.push(" AND created_at <= ").push_bind(end);
    }
}

#[async_trait]
impl EventStore for PostgresStore {
    async fn insert_many(&self, events: Vec<Event>) -> Result<InsertReport, StoreError> {
        // Unordered semantics: each row stands alone, duplicates are
        // reported rather than aborting the batch.
        let mut report = InsertReport::default();
        for event in events {
            let tags: Vec<String> = event.tags.iter().cloned().collect();
            let result = sqlx::query(
                r#"
                INSERT INTO events (event_id, service, severity, timestamp, metadata, tags, incident_id)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (event_id) DO NOTHING
                "#,
            )
            .bind(event.event_id.as_uuid())
            .bind(&event.service)
            .bind(event.severity.get() as i16)
            .bind(event.timestamp)
            .bind(&event.metadata)
            .bind(&tags)
            .bind(event.incident_id.map(Uuid::from))
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 0 {
                report.duplicates.push(event.event_id);
            } else {
                report.inserted += 1;
            }
        }
        Ok(report)
    }

    async fn find_recent_unassigned(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<Event>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM events WHERE timestamp >= $1 AND incident_id IS NULL \
             ORDER BY timestamp DESC",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(event_from_row).collect()
    }

    async fn find_by_ids(&self, ids: &[EventId], limit: usize) -> Result<Vec<Event>, StoreError> {
        let uuids: Vec<Uuid> = ids.iter().map(|id| *id.as_uuid()).collect();
        let rows = sqlx::query(
            "SELECT * FROM events WHERE event_id = ANY($1) ORDER BY timestamp DESC LIMIT $2",
        )
        .bind(&uuids)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(event_from_row).collect()
    }

    async fn assign_incident(
        &self,
        ids: &[EventId],
        incident_id: IncidentId,
    ) -> Result<u64, StoreError> {
        let uuids: Vec<Uuid> = ids.iter().map(|id| *id.as_uuid()).collect();
        let result = sqlx::query(
            "UPDATE events SET incident_id = $2 WHERE event_id = ANY($1) AND incident_id IS NULL",
        )
        .bind(&uuids)
        .bind(incident_id.as_uuid())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn get_event(&self, id: EventId) -> Result<Option<Event>, StoreError> {
        let row = sqlx::query("SELECT * FROM events WHERE event_id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(event_from_row).transpose()
    }

    async fn list_events(
        &self,
        filter: &EventFilter,
        pagination: Pagination,
        sort: EventSort,
    ) -> Result<Page<Event>, StoreError> {
        let mut count_builder =
            QueryBuilder::<Postgres>::new("SELECT COUNT(*) AS n FROM events WHERE TRUE");
        push_event_filters(&mut count_builder, filter);
        let total: i64 = count_builder
            .build()
            .fetch_one(&self.pool)
            .await?
            .try_get("n")?;

        let mut builder = QueryBuilder::<Postgres>::new("SELECT * FROM events WHERE TRUE");
        push_event_filters(&mut builder, filter);
        builder.push(match sort {
            EventSort::TimestampDesc => " ORDER BY timestamp DESC",
            EventSort::TimestampAsc => " ORDER BY timestamp ASC",
            EventSort::SeverityDesc => " ORDER BY severity DESC, timestamp DESC",
            EventSort::SeverityAsc => " ORDER BY severity ASC, timestamp DESC",
        });
        builder
            .push(" LIMIT ")
            .push_bind(pagination.limit as i64)
            .push(" OFFSET ")
            .push_bind(pagination.offset() as i64);

        let rows = builder.build().fetch_all(&self.pool).await?;
        let items: Vec<Event> = rows
            .iter()
            .map(event_from_row)
            .collect::<Result<_, _>>()?;
        Ok(Page::new(items, pagination, total as u64))
    }

    async fn stats(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<EventStatsSummary, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT service, severity, COUNT(*) AS n
            FROM events
            WHERE ($1::timestamptz IS NULL OR timestamp >= $1)
              AND ($2::timestamptz IS NULL OR timestamp <= $2)
            GROUP BY service, severity
            "#,
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;

        let mut summary = EventStatsSummary::default();
        for row in rows {
            let service: String = row.try_get("service")?;
            let severity: i16 = row.try_get("severity")?;
            let n: i64 = row.try_get("n")?;
            summary.total += n as u64;
            *summary.by_severity.entry(severity as u8).or_insert(0) += n as u64;
            *summary.by_service.entry(service).or_insert(0) += n as u64;
        }
        Ok(summary)
    }
}

#[async_trait]
impl IncidentStore for PostgresStore {
    async fn create(&self, incident: &Incident) -> Result<(), StoreError> {
        let event_ids: Vec<Uuid> = incident.event_ids.iter().map(|id| *id.as_uuid()).collect();
        let services: Vec<String> = incident.affected_services.iter().cloned().collect();
        sqlx::query(
            r#"
            INSERT INTO incidents (
                incident_id, event_ids, status, severity_score, affected_services,
                summary, ai_generated_summary, root_cause, resolution,
                suggested_actions, assigned_to, created_at, updated_at,
                acknowledged_at, resolved_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(incident.incident_id.as_uuid())
        .bind(&event_ids)
        .bind(incident.status.as_str())
        .bind(incident.severity_score as i16)
        .bind(&services)
        .bind(&incident.summary)
        .bind(&incident.ai_generated_summary)
        .bind(&incident.root_cause)
        .bind(&incident.resolution)
        .bind(&incident.suggested_actions)
        .bind(&incident.assigned_to)
        .bind(incident.created_at)
        .bind(incident.updated_at)
        .bind(incident.acknowledged_at)
        .bind(incident.resolved_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_incident(&self, id: IncidentId) -> Result<Option<Incident>, StoreError> {
        let row = sqlx::query("SELECT * FROM incidents WHERE incident_id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(incident_from_row).transpose()
    }

    async fn list_incidents(
        &self,
        filter: &IncidentFilter,
        pagination: Pagination,
        sort: IncidentSort,
    ) -> Result<Page<Incident>, StoreError> {
        let mut count_builder =
            QueryBuilder::<Postgres>::new("SELECT COUNT(*) AS n FROM incidents WHERE TRUE");
        push_incident_filters(&mut count_builder, filter);
        let total: i64 = count_builder
            .build()
            .fetch_one(&self.pool)
            .await?
            .try_get("n")?;

        let mut builder = QueryBuilder::<Postgres>::new("SELECT * FROM incidents WHERE TRUE");
        push_incident_filters(&mut builder, filter);
        builder.push(match sort {
            IncidentSort::CreatedDesc => " ORDER BY created_at DESC",
            IncidentSort::CreatedAsc => " ORDER BY created_at ASC",
            IncidentSort::SeverityDesc => " ORDER BY severity_score DESC, created_at DESC",
            IncidentSort::UpdatedDesc => " ORDER BY updated_at DESC",
        });
        builder
            .push(" LIMIT ")
            .push_bind(pagination.limit as i64)
            .push(" OFFSET ")
            .push_bind(pagination.offset() as i64);

        let rows = builder.build().fetch_all(&self.pool).await?;
        let items: Vec<Incident> = rows
            .iter()
            .map(incident_from_row)
            .collect::<Result<_, _>>()?;
        Ok(Page::new(items, pagination, total as u64))
    }

    async fn active(&self) -> Result<Vec<Incident>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM incidents WHERE status IN ('active', 'investigating') \
             ORDER BY severity_score DESC, created_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(incident_from_row).collect()
    }

    async fn find_extension_candidate(
        &self,
        service: &str,
        created_after: DateTime<Utc>,
    ) -> Result<Option<Incident>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT * FROM incidents
            WHERE status IN ('active', 'investigating')
              AND $1 = ANY(affected_services)
              AND created_at >= $2
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(service)
        .bind(created_after)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(incident_from_row).transpose()
    }

    async fn find_summary_needed(
        &self,
        created_after: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Incident>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM incidents
            WHERE status IN ('active', 'investigating')
              AND ai_generated_summary = ''
              AND created_at >= $1
            ORDER BY severity_score DESC, created_at DESC
            LIMIT $2
            "#,
        )
        .bind(created_after)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(incident_from_row).collect()
    }

    async fn update(
        &self,
        id: IncidentId,
        patch: &IncidentPatch,
    ) -> Result<Option<Incident>, StoreError> {
        // One field-scoped UPDATE. CASE/COALESCE branches read the OLD row,
        // which is what keeps severity monotone and appends gated on the
        // pre-update status.
        let append_ids: Option<Vec<Uuid>> = patch
            .append_event_ids
            .as_ref()
            .map(|ids| ids.iter().map(|id| *id.as_uuid()).collect());
        let status = patch.status.map(|s| s.as_str().to_string());

        let row = sqlx::query(
            r#"
            UPDATE incidents SET
                status = CASE
                    WHEN $2::text IS NOT NULL AND status <> 'resolved' THEN $2
                    ELSE status
                END,
                severity_score = CASE
                    WHEN $3::smallint IS NOT NULL AND status IN ('active', 'investigating')
                    THEN GREATEST(severity_score, $3)
                    ELSE severity_score
                END,
                summary = COALESCE($4, summary),
                event_ids = CASE
                    WHEN $5::uuid[] IS NOT NULL AND status IN ('active', 'investigating')
                    THEN event_ids || (
                        SELECT COALESCE(array_agg(x), ARRAY[]::uuid[])
                        FROM unnest($5::uuid[]) AS t(x)
                        WHERE NOT x = ANY(event_ids)
                    )
                    ELSE event_ids
                END,
                affected_services = CASE
                    WHEN $6::text[] IS NOT NULL
                    THEN (
                        SELECT array_agg(DISTINCT s ORDER BY s)
                        FROM unnest(affected_services || $6::text[]) AS u(s)
                    )
                    ELSE affected_services
                END,
                ai_generated_summary = COALESCE($7, ai_generated_summary),
                root_cause = COALESCE($8, root_cause),
                resolution = COALESCE($9, resolution),
                suggested_actions = COALESCE($10, suggested_actions),
                assigned_to = COALESCE($11, assigned_to),
                acknowledged_at = CASE
                    WHEN $11::text IS NOT NULL THEN COALESCE(acknowledged_at, now())
                    ELSE acknowledged_at
                END,
                resolved_at = CASE
                    WHEN $2::text = 'resolved' THEN COALESCE(resolved_at, now())
                    ELSE resolved_at
                END,
                updated_at = now()
            WHERE incident_id = $1
            RETURNING *
            "#,
        )
        .bind(id.as_uuid())
        .bind(status)
        .bind(patch.severity_score.map(|s| s as i16))
        .bind(&patch.summary)
        .bind(append_ids)
        .bind(&patch.add_affected_services)
        .bind(&patch.ai_generated_summary)
        .bind(&patch.root_cause)
        .bind(&patch.resolution)
        .bind(&patch.suggested_actions)
        .bind(&patch.assigned_to)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(incident_from_row).transpose()
    }
}

#[async_trait]
impl StatsStore for PostgresStore {
    async fn upsert_count(
        &self,
        service: &str,
        window_key: &str,
        delta: u64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO service_stats (service, window_key, count, timestamp)
            VALUES ($1, $2, $3, now())
            ON CONFLICT (service, window_key)
            DO UPDATE SET count = service_stats.count + EXCLUDED.count, timestamp = now()
            "#,
        )
        .bind(service)
        .bind(window_key)
        .bind(delta as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_recent(
        &self,
        service: &str,
        limit: usize,
    ) -> Result<Vec<ServiceStats>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT service, window_key, count, timestamp
            FROM service_stats
            WHERE service = $1
            ORDER BY substring(window_key FROM 3)::bigint DESC
            LIMIT $2
            "#,
        )
        .bind(service)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(ServiceStats {
                    service: row.try_get("service")?,
                    window_key: row.try_get("window_key")?,
                    count: row.try_get::<i64, _>("count")? as u64,
                    timestamp: row.try_get("timestamp")?,
                })
            })
            .collect()
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM service_stats WHERE timestamp < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
