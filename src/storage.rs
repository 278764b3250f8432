use crate::domain::{creation_timestamp, Drawing, NewDrawing, Page};
use crate::error::{DigitError, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::Mutex;
use tracing::debug;

/// Repository for drawing records. Records are created, read and deleted,
/// never updated.
#[async_trait]
pub trait DrawingStore: Send + Sync {
    /// Persist a drawing, assigning its id and creation time.
    async fn create(&self, drawing: NewDrawing) -> Result<Drawing>;

    /// Most recent first.
    async fn list(&self, page: Page) -> Result<Vec<Drawing>>;

    async fn get(&self, id: i64) -> Result<Drawing>;

    async fn delete(&self, id: i64) -> Result<()>;
}

/// In-memory storage implementation for development/testing
#[derive(Default)]
pub struct InMemoryStorage {
    inner: Mutex<InMemoryState>,
}

#[derive(Default)]
struct InMemoryState {
    drawings: BTreeMap<i64, Drawing>,
    last_id: i64,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DrawingStore for InMemoryStorage {
    async fn create(&self, drawing: NewDrawing) -> Result<Drawing> {
        let mut state = self.inner.lock().await;
        state.last_id += 1;
        let id = state.last_id;

        let drawing = drawing.into_drawing(id, creation_timestamp());
        state.drawings.insert(id, drawing.clone());

        debug!("Created drawing {} (digit {})", id, drawing.predicted_digit);
        Ok(drawing)
    }

    async fn list(&self, page: Page) -> Result<Vec<Drawing>> {
        let state = self.inner.lock().await;
        let mut drawings: Vec<&Drawing> = state.drawings.values().collect();
        drawings.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        Ok(drawings
            .into_iter()
            .skip(page.offset as usize)
            .take(page.limit as usize)
            .cloned()
            .collect())
    }

    async fn get(&self, id: i64) -> Result<Drawing> {
        let state = self.inner.lock().await;
        state
            .drawings
            .get(&id)
            .cloned()
            .ok_or(DigitError::NotFound(id))
    }

    async fn delete(&self, id: i64) -> Result<()> {
        let mut state = self.inner.lock().await;
        if state.drawings.remove(&id).is_none() {
            return Err(DigitError::NotFound(id));
        }
        debug!("Deleted drawing {}", id);
        Ok(())
    }
}
