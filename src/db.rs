use crate::config::DatabaseTarget;
use crate::domain::{creation_timestamp, Drawing, NewDrawing, Page};
use crate::error::{DigitError, Result};
use crate::storage::DrawingStore;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Builder, Connection, Database, Row, Value};
use std::sync::Arc;
use tracing::{debug, info};

const DRAWING_COLUMNS: &str = "id, pixels, predicted_digit, confidence, probabilities, created_at";

pub struct DatabaseManager {
    db: Database,
}

impl DatabaseManager {
    /// Open the database described by `target`. Local files get their parent
    /// directory created.
    pub async fn new(target: &DatabaseTarget) -> Result<Self> {
        let db = match target {
            DatabaseTarget::Local { path } => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent)?;
                }
                info!("Opening local database at {}", path.display());
                Builder::new_local(path).build().await
            }
            DatabaseTarget::Remote { url, auth_token } => {
                info!("Connecting to remote database at {}", url);
                Builder::new_remote(url.clone(), auth_token.clone())
                    .build()
                    .await
            }
        }
        .map_err(|e| DigitError::database(format!("Failed to open database: {e}")))?;

        Ok(Self { db })
    }

    /// Get a connection to the database. Dropping it releases it.
    pub fn get_connection(&self) -> Result<Connection> {
        self.db
            .connect()
            .map_err(|e| DigitError::database(format!("Failed to get database connection: {e}")))
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations...");

        let conn = self.get_connection()?;
        let migration_sql = include_str!("../migrations/001_create_drawings.sql");

        conn.execute_batch(migration_sql)
            .await
            .map_err(|e| DigitError::database(format!("Failed to run migrations: {e}")))?;

        info!("Database migrations completed successfully");
        Ok(())
    }
}

/// Drawing store backed by libSQL.
pub struct LibsqlDrawingStore {
    db: Arc<DatabaseManager>,
}

impl LibsqlDrawingStore {
    pub fn new(db: Arc<DatabaseManager>) -> Self {
        Self { db }
    }

    /// Open the database and apply migrations.
    pub async fn connect(target: &DatabaseTarget) -> Result<Self> {
        let db = DatabaseManager::new(target).await?;
        db.run_migrations().await?;
        Ok(Self::new(Arc::new(db)))
    }

    fn encode_values(values: &[f64]) -> Result<String> {
        serde_json::to_string(values)
            .map_err(|e| DigitError::database(format!("Failed to serialize values: {e}")))
    }

    fn decode_values(data: &str) -> Result<Vec<f64>> {
        serde_json::from_str(data)
            .map_err(|e| DigitError::database(format!("Failed to deserialize values: {e}")))
    }

    fn encode_timestamp(ts: &DateTime<Utc>) -> String {
        // Fixed-width UTC so lexical order in SQL matches time order.
        ts.to_rfc3339_opts(SecondsFormat::Micros, true)
    }

    fn row_to_drawing(row: &Row) -> Result<Drawing> {
        let read_err = |column: &str, e: libsql::Error| {
            DigitError::database(format!("Failed to read {column}: {e}"))
        };

        let id: i64 = row.get(0).map_err(|e| read_err("id", e))?;
        let pixels: String = row.get(1).map_err(|e| read_err("pixels", e))?;
        let digit: i64 = row.get(2).map_err(|e| read_err("predicted_digit", e))?;
        let confidence = match row.get_value(3).map_err(|e| read_err("confidence", e))? {
            Value::Null => None,
            Value::Real(v) => Some(v),
            Value::Integer(v) => Some(v as f64),
            other => {
                return Err(DigitError::database(format!(
                    "Unexpected confidence value {other:?}"
                )))
            }
        };
        let probabilities = match row.get_value(4).map_err(|e| read_err("probabilities", e))? {
            Value::Null => None,
            Value::Text(data) => Some(Self::decode_values(&data)?),
            other => {
                return Err(DigitError::database(format!(
                    "Unexpected probabilities value {other:?}"
                )))
            }
        };
        let created_at: String = row.get(5).map_err(|e| read_err("created_at", e))?;

        Ok(Drawing {
            id,
            pixels: Self::decode_values(&pixels)?,
            predicted_digit: u8::try_from(digit)
                .map_err(|_| DigitError::database(format!("Invalid predicted_digit {digit}")))?,
            confidence,
            probabilities,
            created_at: DateTime::parse_from_rfc3339(&created_at)
                .map_err(|e| DigitError::database(format!("Invalid created_at '{created_at}': {e}")))?
                .with_timezone(&Utc),
        })
    }
}

#[async_trait]
impl DrawingStore for LibsqlDrawingStore {
    async fn create(&self, drawing: NewDrawing) -> Result<Drawing> {
        let pixels = Self::encode_values(drawing.pixels())?;
        let probabilities = match drawing.probabilities() {
            Some(p) => Value::Text(Self::encode_values(p)?),
            None => Value::Null,
        };
        let confidence = drawing.confidence().map(Value::Real).unwrap_or(Value::Null);
        let created_at = creation_timestamp();

        let conn = self.db.get_connection()?;
        let tx = conn
            .transaction()
            .await
            .map_err(|e| DigitError::database(format!("Failed to begin transaction: {e}")))?;

        let inserted = tx
            .execute(
                "INSERT INTO drawings (pixels, predicted_digit, confidence, probabilities, created_at) VALUES (?, ?, ?, ?, ?)",
                libsql::params![
                    pixels,
                    i64::from(drawing.predicted_digit()),
                    confidence,
                    probabilities,
                    Self::encode_timestamp(&created_at)
                ],
            )
            .await;

        if let Err(e) = inserted {
            if let Err(rollback_err) = tx.rollback().await {
                debug!("Rollback after failed insert also failed: {}", rollback_err);
            }
            return Err(DigitError::database(format!("Failed to insert drawing: {e}")));
        }

        let id = tx.last_insert_rowid();
        tx.commit()
            .await
            .map_err(|e| DigitError::database(format!("Failed to commit drawing: {e}")))?;

        debug!("Inserted drawing {}", id);
        Ok(drawing.into_drawing(id, created_at))
    }

    async fn list(&self, page: Page) -> Result<Vec<Drawing>> {
        let conn = self.db.get_connection()?;

        let mut rows = conn
            .query(
                &format!(
                    "SELECT {DRAWING_COLUMNS} FROM drawings ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?"
                ),
                libsql::params![i64::from(page.limit), i64::from(page.offset)],
            )
            .await
            .map_err(|e| DigitError::database(format!("Failed to query drawings: {e}")))?;

        let mut results = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DigitError::database(format!("Failed to read row: {e}")))?
        {
            results.push(Self::row_to_drawing(&row)?);
        }

        Ok(results)
    }

    async fn get(&self, id: i64) -> Result<Drawing> {
        let conn = self.db.get_connection()?;

        let mut rows = conn
            .query(
                &format!("SELECT {DRAWING_COLUMNS} FROM drawings WHERE id = ?"),
                libsql::params![id],
            )
            .await
            .map_err(|e| DigitError::database(format!("Failed to query drawing: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| DigitError::database(format!("Failed to read row: {e}")))?
        {
            Some(row) => Self::row_to_drawing(&row),
            None => Err(DigitError::NotFound(id)),
        }
    }

    async fn delete(&self, id: i64) -> Result<()> {
        let conn = self.db.get_connection()?;

        let affected = conn
            .execute("DELETE FROM drawings WHERE id = ?", libsql::params![id])
            .await
            .map_err(|e| DigitError::database(format!("Failed to delete drawing: {e}")))?;

        if affected == 0 {
            return Err(DigitError::NotFound(id));
        }

        debug!("Deleted drawing {}", id);
        Ok(())
    }
}
