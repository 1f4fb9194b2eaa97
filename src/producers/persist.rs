//! Persisting the paper library.
//!
//! The library is written twice: a JSON database and a compact binary cache
//! for fast startup. Both writes are tasks chained by tag so that the cache is
//! never written while the JSON it mirrors, or a parse feeding either, is in
//! flight. Files are replaced atomically.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, warn};

use super::extract::{PaperMetadata, EXTRACT_TAG};
use crate::scheduler::{LoomHandle, SubmitError, TaskError, TaskHandle, TaskSpec};

/// Tag of JSON export tasks.
pub const WRITE_JSON_TAG: &str = "write-json";

/// Tag of cache export tasks.
pub const WRITE_CACHE_TAG: &str = "write-cache";

/// Priority of persistence writes. Anything interactive goes first.
pub const PERSIST_PRIORITY: i32 = 5;

/// A library that cannot be represented in the binary cache.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("{what} does not fit a u32 length ({len})")]
    TooLong { what: &'static str, len: usize },

    #[error("PDF path is not valid UTF-8: {}", path.display())]
    NonUtf8Path { path: PathBuf },
}

/// Input of an export task.
#[derive(Debug)]
pub struct Export<T> {
    pub path: PathBuf,
    pub records: Arc<T>,
}

/// Replace `path` with `contents` atomically.
///
/// The data goes to a temporary file in the same directory which is then
/// renamed over `path`, so readers see either the old or the new file.
pub fn write_atomic(
    path: &Path,
    contents: &[u8],
) -> io::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut file = NamedTempFile::new_in(dir)?;
    file.write_all(contents)?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|error| error.error)?;
    Ok(())
}

/// Build a task writing `records` as pretty JSON to `path`.
pub fn export_json<T, C>(
    path: impl Into<PathBuf>,
    records: Arc<T>,
    on_complete: C,
) -> TaskSpec
where
    T: Serialize + Send + Sync + 'static,
    C: FnOnce(&Path, Result<(), TaskError>) + Send + 'static,
{
    TaskSpec::builder(WRITE_JSON_TAG)
        .priority(PERSIST_PRIORITY)
        .depends_on(EXTRACT_TAG)
        .build(
            Export {
                path: path.into(),
                records,
            },
            |export: &Export<T>, _| {
                let json = serde_json::to_vec_pretty(&*export.records)?;
                write_atomic(&export.path, &json)?;
                debug!(path = %export.path.display(), bytes = json.len(), "wrote json");
                Ok(())
            },
            move |export: &Export<T>, result| on_complete(&export.path, result),
        )
}

/// Build a task writing `encode(records)` to `path`.
pub fn export_cache<T, E, C>(
    path: impl Into<PathBuf>,
    records: Arc<T>,
    encode: E,
    on_complete: C,
) -> TaskSpec
where
    T: Send + Sync + 'static,
    E: FnOnce(&T) -> anyhow::Result<Vec<u8>> + Send + 'static,
    C: FnOnce(&Path, Result<(), TaskError>) + Send + 'static,
{
    TaskSpec::builder(WRITE_CACHE_TAG)
        .priority(PERSIST_PRIORITY)
        .dependencies([WRITE_JSON_TAG, EXTRACT_TAG])
        .build(
            Export {
                path: path.into(),
                records,
            },
            move |export: &Export<T>, _| {
                let bytes = encode(&export.records)?;
                write_atomic(&export.path, &bytes)?;
                debug!(path = %export.path.display(), bytes = bytes.len(), "wrote cache");
                Ok(())
            },
            move |export: &Export<T>, result| on_complete(&export.path, result),
        )
}

/// Queue both library writes. Failures are logged.
pub fn sync_json_and_cache(
    loom: &LoomHandle,
    json_path: impl Into<PathBuf>,
    cache_path: impl Into<PathBuf>,
    papers: Arc<Vec<PaperMetadata>>,
) -> Result<(TaskHandle, TaskHandle), SubmitError> {
    let json = loom.submit(export_json(json_path, papers.clone(), |path, result| {
        if let Err(error) = result {
            warn!("Error writing JSON to {}: {}", path.display(), error);
        }
    }))?;
    let cache = loom.submit(export_cache(
        cache_path,
        papers,
        |papers: &Vec<PaperMetadata>| Ok(encode_cache(papers)?),
        |path, result| {
            if let Err(error) = result {
                warn!("Error writing cache to {}: {}", path.display(), error);
            }
        },
    ))?;
    Ok((json, cache))
}

/// Encode papers in the binary cache format.
///
/// Little-endian `u32` entry count, then per paper: `u32` year, title,
/// `u32` author count and authors, `u32` keyword count and keywords,
/// abstract, arXiv ID, DOI and PDF path. Strings are a `u32` byte length
/// followed by UTF-8; a missing string has length 0.
///
/// Fails rather than truncate a length or drop a non-UTF-8 path.
pub fn encode_cache(papers: &[PaperMetadata]) -> Result<Vec<u8>, CacheError> {
    fn length(
        what: &'static str,
        len: usize,
    ) -> Result<u32, CacheError> {
        u32::try_from(len).map_err(|_| CacheError::TooLong { what, len })
    }
    fn put_u32(
        buffer: &mut Vec<u8>,
        value: u32,
    ) {
        buffer.extend_from_slice(&value.to_le_bytes());
    }
    fn put_str(
        buffer: &mut Vec<u8>,
        what: &'static str,
        value: Option<&str>,
    ) -> Result<(), CacheError> {
        let bytes = value.unwrap_or_default().as_bytes();
        put_u32(buffer, length(what, bytes.len())?);
        buffer.extend_from_slice(bytes);
        Ok(())
    }

    let mut buffer = Vec::new();
    put_u32(&mut buffer, length("paper count", papers.len())?);
    for paper in papers {
        let pdf_file = paper.pdf_file.to_str().ok_or_else(|| CacheError::NonUtf8Path {
            path: paper.pdf_file.clone(),
        })?;

        put_u32(&mut buffer, paper.year);
        put_str(&mut buffer, "title", paper.title.as_deref())?;
        put_u32(&mut buffer, length("author count", paper.authors.len())?);
        for author in &paper.authors {
            put_str(&mut buffer, "author", Some(author))?;
        }
        put_u32(&mut buffer, length("keyword count", paper.keywords.len())?);
        for keyword in &paper.keywords {
            put_str(&mut buffer, "keyword", Some(keyword))?;
        }
        put_str(&mut buffer, "abstract", paper.abstract_text.as_deref())?;
        put_str(&mut buffer, "arXiv ID", paper.arxiv_id.as_deref())?;
        put_str(&mut buffer, "DOI", paper.doi.as_deref())?;
        put_str(&mut buffer, "PDF path", Some(pdf_file))?;
    }
    Ok(buffer)
}

/// Decode a cache written by [`encode_cache`]. `None` if it is truncated or
/// not UTF-8.
pub fn decode_cache(data: &[u8]) -> Option<Vec<PaperMetadata>> {
    struct Reader<'a> {
        data: &'a [u8],
    }

    impl<'a> Reader<'a> {
        fn take(
            &mut self,
            len: usize,
        ) -> Option<&'a [u8]> {
            if self.data.len() < len {
                return None;
            }
            let (head, rest) = self.data.split_at(len);
            self.data = rest;
            Some(head)
        }

        fn u32(&mut self) -> Option<u32> {
            let head = self.take(4)?;
            Some(u32::from_le_bytes(head.try_into().ok()?))
        }

        fn string(&mut self) -> Option<Option<String>> {
            let len = self.u32()? as usize;
            let text = std::str::from_utf8(self.take(len)?).ok()?;
            Some((!text.is_empty()).then(|| text.to_string()))
        }

        fn strings(&mut self) -> Option<Vec<String>> {
            let count = self.u32()?;
            (0..count)
                .map(|_| self.string().map(Option::unwrap_or_default))
                .collect()
        }
    }

    let mut reader = Reader { data };
    let count = reader.u32()?;
    let mut papers = Vec::new();
    for _ in 0..count {
        let year = reader.u32()?;
        let title = reader.string()?;
        let authors = reader.strings()?;
        let keywords = reader.strings()?;
        let abstract_text = reader.string()?;
        let arxiv_id = reader.string()?;
        let doi = reader.string()?;
        let pdf_file = reader.string()?.unwrap_or_default();
        papers.push(PaperMetadata {
            title,
            authors,
            year,
            keywords,
            abstract_text,
            arxiv_id,
            doi,
            pdf_file: PathBuf::from(pdf_file),
        });
    }
    Some(papers)
}

/// Whether the cache at `cache_path` is at least as new as the JSON.
pub fn cache_up_to_date(
    json_path: &Path,
    cache_path: &Path,
) -> bool {
    let modified = |path: &Path| fs::metadata(path).and_then(|meta| meta.modified());
    match (modified(json_path), modified(cache_path)) {
        (Ok(json), Ok(cache)) => cache >= json,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{Loom, Tag};

    fn library() -> Arc<Vec<PaperMetadata>> {
        let mut paper = PaperMetadata::new("papers/attention.pdf");
        paper.title = Some("Attention Is All You Need".to_string());
        paper.authors = vec!["Ashish Vaswani".to_string(), "Noam Shazeer".to_string()];
        paper.year = 2017;
        Arc::new(vec![paper, PaperMetadata::new("papers/untitled.pdf")])
    }

    #[test]
    fn test_export_specs_are_chained() {
        let json = export_json("db.json", library(), |_, _| {});
        assert_eq!(json.tag(), Tag::new(WRITE_JSON_TAG));
        assert_eq!(json.priority(), PERSIST_PRIORITY);
        assert_eq!(json.dependencies(), &[Tag::new(EXTRACT_TAG)]);

        let cache = export_cache("db.cache", library(), |_| Ok(Vec::new()), |_, _| {});
        assert_eq!(cache.tag(), Tag::new(WRITE_CACHE_TAG));
        assert_eq!(
            cache.dependencies(),
            &[Tag::new(WRITE_JSON_TAG), Tag::new(EXTRACT_TAG)]
        );
    }

    #[test]
    fn test_write_atomic_replaces_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("db.json");
        write_atomic(&path, b"old").unwrap();
        write_atomic(&path, b"new").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"new");
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_cache_layout() {
        let bytes = encode_cache(&[PaperMetadata::new("a.pdf")]).unwrap();
        let mut expected = Vec::new();
        expected.extend_from_slice(&1u32.to_le_bytes()); // count
        expected.extend_from_slice(&0u32.to_le_bytes()); // year
        expected.extend_from_slice(&0u32.to_le_bytes()); // title
        expected.extend_from_slice(&0u32.to_le_bytes()); // authors
        expected.extend_from_slice(&0u32.to_le_bytes()); // keywords
        expected.extend_from_slice(&0u32.to_le_bytes()); // abstract
        expected.extend_from_slice(&0u32.to_le_bytes()); // arxiv id
        expected.extend_from_slice(&0u32.to_le_bytes()); // doi
        expected.extend_from_slice(&5u32.to_le_bytes());
        expected.extend_from_slice(b"a.pdf");
        assert_eq!(bytes, expected);
    }

    #[test]
    fn test_decode_cache() {
        let papers = library();
        let bytes = encode_cache(&papers).unwrap();
        assert_eq!(decode_cache(&bytes).unwrap(), *papers);

        assert!(decode_cache(&bytes[..bytes.len() - 1]).is_none());
        assert!(decode_cache(&[]).is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_non_utf8_path_is_not_cached() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let paper = PaperMetadata::new(OsStr::from_bytes(b"papers/\xff.pdf"));
        let err = encode_cache(&[paper]).unwrap_err();
        assert!(matches!(err, CacheError::NonUtf8Path { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn test_unencodable_library_fails_the_write() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let dir = tempfile::TempDir::new().unwrap();
        let cache_path = dir.path().join("pp.cache");
        let papers = Arc::new(vec![PaperMetadata::new(OsStr::from_bytes(b"\xfe.pdf"))]);
        let mut loom = Loom::with_capacity(1).unwrap();
        let (tx, rx) = crossbeam::channel::bounded(1);

        loom.submit(export_cache(
            &cache_path,
            papers,
            |papers: &Vec<PaperMetadata>| Ok(encode_cache(papers)?),
            move |_, result| {
                let _ = tx.send(result.map_err(|e| e.to_string()));
            },
        ))
        .unwrap();
        loom.run_until_idle();
        assert!(rx.try_recv().unwrap().unwrap_err().contains("not valid UTF-8"));
        assert!(!cache_path.exists());
    }

    #[test]
    fn test_sync_json_and_cache_writes_both() {
        let dir = tempfile::TempDir::new().unwrap();
        let json_path = dir.path().join("ppdb.json");
        let cache_path = dir.path().join("pp.cache");

        let mut loom = Loom::with_capacity(2).unwrap();
        let (json, cache) =
            sync_json_and_cache(&loom.handle(), &json_path, &cache_path, library()).unwrap();
        assert_eq!(json.tag(), Tag::new(WRITE_JSON_TAG));
        assert_eq!(cache.tag(), Tag::new(WRITE_CACHE_TAG));
        loom.run_until_idle();
        assert_eq!(loom.stats().completed, 2);

        let written: Vec<PaperMetadata> =
            serde_json::from_slice(&fs::read(&json_path).unwrap()).unwrap();
        assert_eq!(written, *library());
        assert_eq!(decode_cache(&fs::read(&cache_path).unwrap()).unwrap(), *library());
        assert!(cache_up_to_date(&json_path, &cache_path));
    }

    #[test]
    fn test_failed_write_is_reported() {
        let dir = tempfile::TempDir::new().unwrap();
        let missing = dir.path().join("no-such-dir").join("ppdb.json");
        let mut loom = Loom::with_capacity(1).unwrap();
        let (tx, rx) = crossbeam::channel::bounded(1);

        loom.submit(export_json(&missing, library(), move |_, result| {
            let _ = tx.send(result.is_err());
        }))
        .unwrap();
        loom.run_until_idle();
        assert!(rx.try_recv().unwrap());
        assert_eq!(loom.stats().failed, 1);
    }
}
