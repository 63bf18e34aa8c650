use crate::model::{DefaultSettings, ImageGeneration};
use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::instrument;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized).await?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the
/// parent directory exists. Leaves in-memory URLs untouched.
fn prepare_sqlite_url(url: &str) -> String {
    let Some(rest) = url.strip_prefix("sqlite:") else {
        return url.to_string();
    };
    if rest.starts_with(":memory") {
        return url.to_string();
    }

    let rest = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match rest.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (rest, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(tail), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), tail),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    match query_part {
        Some(q) => format!("sqlite://{}?{}", expanded_path, q),
        None => format!("sqlite://{}", expanded_path),
    }
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Insert a generation record. The store assigns `id` and `created_at`; the
/// returned value carries both. Fails on a duplicate (message_id, sort_order).
#[instrument(skip_all)]
pub async fn create_generation(
    pool: &Pool,
    generation: &ImageGeneration,
) -> Result<ImageGeneration> {
    let created_at = Utc::now();
    let rec = sqlx::query(
        "INSERT INTO image_generations (interaction_id, message_id, member_id, sort_order, \
         prompt, negative_prompt, width, height, restore_faces, enable_hr, hires_width, \
         hires_height, denoising_strength, batch_count, batch_size, seed, subseed, \
         subseed_strength, sampler_name, cfg_scale, steps, processed, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
         RETURNING id",
    )
    .bind(&generation.interaction_id)
    .bind(&generation.message_id)
    .bind(&generation.member_id)
    .bind(generation.sort_order)
    .bind(&generation.prompt)
    .bind(&generation.negative_prompt)
    .bind(generation.width)
    .bind(generation.height)
    .bind(generation.restore_faces)
    .bind(generation.enable_hr)
    .bind(generation.hires_width)
    .bind(generation.hires_height)
    .bind(generation.denoising_strength)
    .bind(generation.batch_count)
    .bind(generation.batch_size)
    .bind(generation.seed)
    .bind(generation.subseed)
    .bind(generation.subseed_strength)
    .bind(&generation.sampler_name)
    .bind(generation.cfg_scale)
    .bind(generation.steps)
    .bind(generation.processed)
    .bind(created_at)
    .fetch_one(pool)
    .await
    .context("failed to insert generation record")?;

    let mut created = generation.clone();
    created.id = rec.get::<i64, _>("id");
    created.created_at = created_at;
    Ok(created)
}

/// Fetch the record at a batch position within a result message. Position 0
/// is the lead record; 1..N are the per-image records.
#[instrument(skip_all)]
pub async fn get_generation_by_message_and_sort(
    pool: &Pool,
    message_id: &str,
    sort_order: i64,
) -> Result<Option<ImageGeneration>> {
    let row = sqlx::query(
        "SELECT id, interaction_id, message_id, member_id, sort_order, prompt, \
         negative_prompt, width, height, restore_faces, enable_hr, hires_width, \
         hires_height, denoising_strength, batch_count, batch_size, seed, subseed, \
         subseed_strength, sampler_name, cfg_scale, steps, processed, created_at \
         FROM image_generations WHERE message_id = ? AND sort_order = ?",
    )
    .bind(message_id)
    .bind(sort_order)
    .fetch_optional(pool)
    .await?;

    row.map(|r| row_to_generation(&r)).transpose()
}

fn row_to_generation(row: &SqliteRow) -> Result<ImageGeneration> {
    Ok(ImageGeneration {
        id: row.try_get("id")?,
        interaction_id: row.try_get("interaction_id")?,
        message_id: row.try_get("message_id")?,
        member_id: row.try_get("member_id")?,
        sort_order: row.try_get("sort_order")?,
        prompt: row.try_get("prompt")?,
        negative_prompt: row.try_get("negative_prompt")?,
        width: row.try_get("width")?,
        height: row.try_get("height")?,
        restore_faces: row.try_get("restore_faces")?,
        enable_hr: row.try_get("enable_hr")?,
        hires_width: row.try_get("hires_width")?,
        hires_height: row.try_get("hires_height")?,
        denoising_strength: row.try_get("denoising_strength")?,
        batch_count: row.try_get("batch_count")?,
        batch_size: row.try_get("batch_size")?,
        seed: row.try_get("seed")?,
        subseed: row.try_get("subseed")?,
        subseed_strength: row.try_get("subseed_strength")?,
        sampler_name: row.try_get("sampler_name")?,
        cfg_scale: row.try_get("cfg_scale")?,
        steps: row.try_get("steps")?,
        processed: row.try_get("processed")?,
        created_at: row.try_get("created_at")?,
    })
}

/// Fetch the defaults row for a scope, `None` if it was never written.
#[instrument(skip_all)]
pub async fn get_settings_by_scope(pool: &Pool, scope_key: &str) -> Result<Option<DefaultSettings>> {
    let row = sqlx::query(
        "SELECT scope_key, width, height, batch_count, batch_size \
         FROM default_settings WHERE scope_key = ?",
    )
    .bind(scope_key)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|r| DefaultSettings {
        scope_key: r.get("scope_key"),
        width: r.get("width"),
        height: r.get("height"),
        batch_count: r.get("batch_count"),
        batch_size: r.get("batch_size"),
    }))
}

/// Idempotent replace of the defaults row for a scope.
#[instrument(skip_all)]
pub async fn upsert_settings(pool: &Pool, settings: &DefaultSettings) -> Result<DefaultSettings> {
    sqlx::query(
        "INSERT OR REPLACE INTO default_settings (scope_key, width, height, batch_count, batch_size) \
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&settings.scope_key)
    .bind(settings.width)
    .bind(settings.height)
    .bind(settings.batch_count)
    .bind(settings.batch_size)
    .execute(pool)
    .await
    .context("failed to upsert default settings")?;

    Ok(settings.clone())
}
