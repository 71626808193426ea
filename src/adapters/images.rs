//! In-memory firmware image repository
//!
//! Keyed by filename, each image carries the revision its header reports.
//! Used by simulation mode and tests; a production build would read the same
//! contract from the image partition.

use std::collections::HashMap;

use bytes::Bytes;

use crate::domain::ports::{ImageHeader, ImageRepository};
use crate::error::{Error, Result};

#[derive(Default)]
pub struct InMemoryImageRepository {
    images: HashMap<String, (String, Bytes)>,
}

impl InMemoryImageRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an image under a filename with the revision its header carries.
    pub fn insert(&mut self, filename: impl Into<String>, revision: impl Into<String>, body: Bytes) {
        self.images.insert(filename.into(), (revision.into(), body));
    }
}

impl ImageRepository for InMemoryImageRepository {
    fn read_header(&self, filename: &str) -> Result<ImageHeader> {
        let (revision, body) = self
            .images
            .get(filename)
            .ok_or_else(|| Error::BadImage {
                filename: filename.to_string(),
                reason: "not found in repository".to_string(),
            })?;
        Ok(ImageHeader {
            revision: revision.clone(),
            byte_len: body.len(),
        })
    }

    fn open_image(&self, filename: &str) -> Result<Bytes> {
        let (_, body) = self
            .images
            .get(filename)
            .ok_or_else(|| Error::BadImage {
                filename: filename.to_string(),
                reason: "not found in repository".to_string(),
            })?;
        Ok(body.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_matches_inserted_image() {
        let mut repo = InMemoryImageRepository::new();
        repo.insert("ps_fw.bin", "2.17", Bytes::from_static(b"payload"));

        let header = repo.read_header("ps_fw.bin").unwrap();
        assert_eq!(header.revision, "2.17");
        assert_eq!(header.byte_len, 7);
        assert_eq!(repo.open_image("ps_fw.bin").unwrap().len(), 7);
    }

    #[test]
    fn test_missing_image_is_bad_image() {
        let repo = InMemoryImageRepository::new();
        let err = repo.read_header("nope.bin").unwrap_err();
        assert!(matches!(err, Error::BadImage { .. }));
    }
}
