use anyhow::{bail, Result};

use super::schema::Database;
use super::types::Folder;
use crate::util::clean_text;

impl Database {
    // ========================================================================
    // Folder Operations
    // ========================================================================

    /// SEC-014: Sanitize and validate a folder title.
    fn sanitize_folder_title(title: &str) -> Result<String> {
        let clean = clean_text(title);
        if clean.is_empty() {
            bail!("Folder title cannot be empty or whitespace-only");
        }
        Ok(clean)
    }

    /// Create a folder, or return the existing one with the same title.
    pub async fn create_folder(&self, title: &str) -> Result<Folder> {
        let title = Self::sanitize_folder_title(title)?;

        // The no-op update makes RETURNING yield the existing row on conflict
        let folder: Folder = sqlx::query_as(
            r#"
            INSERT INTO folders (title) VALUES (?)
            ON CONFLICT(title) DO UPDATE SET title = excluded.title
            RETURNING id, title, is_expanded
        "#,
        )
        .bind(&title)
        .fetch_one(&self.pool)
        .await?;

        Ok(folder)
    }

    pub async fn rename_folder(&self, folder_id: i64, title: &str) -> Result<()> {
        let title = Self::sanitize_folder_title(title)?;
        sqlx::query("UPDATE folders SET title = ? WHERE id = ?")
            .bind(&title)
            .bind(folder_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn toggle_folder_expanded(&self, folder_id: i64, expanded: bool) -> Result<()> {
        sqlx::query("UPDATE folders SET is_expanded = ? WHERE id = ?")
            .bind(expanded)
            .bind(folder_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Delete a folder. Its feeds move to the top level.
    pub async fn delete_folder(&self, folder_id: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE feeds SET folder_id = NULL WHERE folder_id = ?")
            .bind(folder_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM folders WHERE id = ?")
            .bind(folder_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn list_folders(&self) -> Result<Vec<Folder>> {
        let folders = sqlx::query_as::<_, Folder>(
            "SELECT id, title, is_expanded FROM folders ORDER BY title COLLATE NOCASE",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(folders)
    }
}
