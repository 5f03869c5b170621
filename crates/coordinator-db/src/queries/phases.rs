//! Query functions for the `phases` table.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::PgPool;

use crate::models::{Phase, PhaseStatus};

/// Replace the entire phase layering, used both by C1's initial dependency
/// analysis and by C9 recovery's phase recomputation after a backlog merge.
/// Phase 0 (if any tasks exist with no dependencies) starts `active`; every
/// other phase starts `pending`.
pub async fn replace_phases(pool: &PgPool, phases: &[(String, Vec<String>)]) -> Result<()> {
    let mut tx = pool.begin().await.context("failed to start transaction")?;

    sqlx::query("DELETE FROM phases")
        .execute(&mut *tx)
        .await
        .context("failed to clear phases")?;

    for (idx, (name, task_ids)) in phases.iter().enumerate() {
        let status = if idx == 0 { PhaseStatus::Active } else { PhaseStatus::Pending };
        let started_at = if idx == 0 { Some(Utc::now()) } else { None };
        sqlx::query(
            "INSERT INTO phases (id, name, task_ids, status, started_at, completed_at) \
             VALUES ($1, $2, $3, $4, $5, NULL)",
        )
        .bind(idx as i32)
        .bind(name)
        .bind(task_ids)
        .bind(status)
        .bind(started_at)
        .execute(&mut *tx)
        .await
        .context("failed to insert phase")?;
    }

    tx.commit().await.context("failed to commit phase replacement")?;
    Ok(())
}

/// Fetch a single phase by id.
pub async fn get_phase(pool: &PgPool, id: i32) -> Result<Option<Phase>> {
    sqlx::query_as::<_, Phase>("SELECT * FROM phases WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch phase")
}

/// List every phase, in layer order.
pub async fn list_phases(pool: &PgPool) -> Result<Vec<Phase>> {
    sqlx::query_as::<_, Phase>("SELECT * FROM phases ORDER BY id ASC")
        .fetch_all(pool)
        .await
        .context("failed to list phases")
}

/// The currently active phase, if any (C7's advancement target).
pub async fn get_current_phase(pool: &PgPool) -> Result<Option<Phase>> {
    sqlx::query_as::<_, Phase>("SELECT * FROM phases WHERE status = 'active' ORDER BY id ASC LIMIT 1")
        .fetch_optional(pool)
        .await
        .context("failed to fetch current phase")
}

/// The first phase that is not yet `completed` -- used on restart to decide
/// where to resume (SPEC_FULL §9 resolution for the phase-reset ambiguity).
pub async fn first_non_completed_phase(pool: &PgPool) -> Result<Option<Phase>> {
    sqlx::query_as::<_, Phase>(
        "SELECT * FROM phases WHERE status != 'completed' ORDER BY id ASC LIMIT 1",
    )
    .fetch_optional(pool)
    .await
    .context("failed to fetch first non-completed phase")
}

/// Activate a phase (clears any other active phase first; at most one phase
/// is ever active at a time).
pub async fn set_phase_active(pool: &PgPool, id: i32) -> Result<()> {
    let mut tx = pool.begin().await.context("failed to start transaction")?;

    sqlx::query("UPDATE phases SET status = 'pending' WHERE status = 'active'")
        .execute(&mut *tx)
        .await
        .context("failed to clear prior active phase")?;

    sqlx::query("UPDATE phases SET status = 'active', started_at = $1 WHERE id = $2")
        .bind(Utc::now())
        .bind(id)
        .execute(&mut *tx)
        .await
        .context("failed to activate phase")?;

    tx.commit().await.context("failed to commit phase activation")?;
    Ok(())
}

/// Mark a phase completed (C7, once every member task reaches a terminal state).
pub async fn set_phase_completed(pool: &PgPool, id: i32) -> Result<()> {
    sqlx::query("UPDATE phases SET status = 'completed', completed_at = $1 WHERE id = $2")
        .bind(Utc::now())
        .bind(id)
        .execute(pool)
        .await
        .context("failed to complete phase")?;
    Ok(())
}
