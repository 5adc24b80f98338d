//! JSON file session store.
//!
//! Each session is one `<id>.json` file under a directory. Writes go to a
//! temporary file that is renamed over the previous copy, so a crash never
//! leaves a half-written session behind.

use std::io;
use std::path::{Path, PathBuf};

use cartsettle::BoxFuture;
use cartsettle::session::{CheckoutSession, SessionError, SessionStore};

/// Stores sessions as JSON files in one directory.
#[derive(Debug, Clone)]
pub struct FileSessionStore {
    dir: PathBuf,
}

impl FileSessionStore {
    /// Creates a store rooted at `dir`. The directory is created on first
    /// write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory holding the session files.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &str) -> Result<PathBuf, SessionError> {
        let valid = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid session id {id:?}"),
            )
            .into());
        }
        Ok(self.dir.join(format!("{id}.json")))
    }
}

impl SessionStore for FileSessionStore {
    fn load<'a>(
        &'a self,
        id: &'a str,
    ) -> BoxFuture<'a, Result<Option<CheckoutSession>, SessionError>> {
        Box::pin(async move {
            let path = self.path_for(id)?;
            match tokio::fs::read_to_string(&path).await {
                Ok(json) => Ok(Some(serde_json::from_str(&json)?)),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
    }

    fn persist<'a>(
        &'a self,
        session: &'a CheckoutSession,
    ) -> BoxFuture<'a, Result<(), SessionError>> {
        Box::pin(async move {
            let path = self.path_for(&session.id)?;
            let json = serde_json::to_vec_pretty(session)?;
            tokio::fs::create_dir_all(&self.dir).await?;
            let tmp = path.with_extension("json.tmp");
            tokio::fs::write(&tmp, json).await?;
            tokio::fs::rename(&tmp, &path).await?;
            tracing::debug!(session = %session.id, path = %path.display(), "session persisted");
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::B256;
    use cartsettle::attempt::OrderId;
    use cartsettle::cart::{Cart, LineItem};
    use cartsettle::proof::SettlementProof;
    use rust_decimal_macros::dec;

    fn scratch_dir() -> PathBuf {
        std::env::temp_dir().join(format!("cartsettle-sessions-{}", OrderId::generate()))
    }

    #[tokio::test]
    async fn persisted_session_reloads() {
        let store = FileSessionStore::new(scratch_dir());
        let cart = Cart::from_items("USD", vec![LineItem::new("p1", "v1", dec!(12.50), 2)]).unwrap();
        let mut session = CheckoutSession::new("s-1", cart);
        session.discount_code = Some("TEN".into());
        session.processed.insert(&SettlementProof::Transaction {
            tx_hash: B256::repeat_byte(7),
        });

        store.persist(&session).await.unwrap();
        let loaded = store.load("s-1").await.unwrap().unwrap();
        assert_eq!(loaded, session);

        tokio::fs::remove_dir_all(store.dir()).await.unwrap();
    }

    #[tokio::test]
    async fn unknown_session_is_none() {
        let store = FileSessionStore::new(scratch_dir());
        assert!(store.load("nobody").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn path_like_ids_are_refused() {
        let store = FileSessionStore::new(scratch_dir());
        let err = store.load("../etc/passwd").await.unwrap_err();
        assert!(matches!(err, SessionError::Io(ref e) if e.kind() == io::ErrorKind::InvalidInput));
    }
}
