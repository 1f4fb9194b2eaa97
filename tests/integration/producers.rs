use std::fs;
use std::sync::Arc;

use parking_lot::Mutex;
use taskloom::producers::persist::{decode_cache, encode_cache, export_cache, export_json};
use taskloom::producers::{extract_metadata, render_page, PaperMetadata, EXTRACT_TAG};
use taskloom::{Loom, Tag, TaskError, TaskSpec};

fn papers() -> Arc<Vec<PaperMetadata>> {
    let mut paper = PaperMetadata::new("library/lamport-1978.pdf");
    paper.title = Some("Time, Clocks, and the Ordering of Events".to_string());
    paper.authors = vec!["Leslie Lamport".to_string()];
    paper.year = 1978;
    Arc::new(vec![paper])
}

/// A parse in flight holds back both library writes; renders go first.
#[test]
fn test_library_pipeline_ordering() {
    let dir = tempfile::TempDir::new().unwrap();
    let json_path = dir.path().join("ppdb.json");
    let cache_path = dir.path().join("pp.cache");
    let log = Arc::new(Mutex::new(Vec::<String>::new()));
    let mut loom = Loom::with_capacity(1).unwrap();

    let (release, gate) = crossbeam::channel::bounded::<()>(1);
    let parse_log = log.clone();
    loom.submit(TaskSpec::builder(EXTRACT_TAG).build(
        gate,
        |gate, _| {
            let _ = gate.recv_timeout(std::time::Duration::from_secs(10));
            Ok(())
        },
        move |_, _: Result<(), TaskError>| parse_log.lock().push("parser".to_string()),
    ))
    .unwrap();

    let json_log = log.clone();
    loom.submit(export_json(&json_path, papers(), move |_, result| {
        assert!(result.is_ok());
        json_log.lock().push("write-json".to_string());
    }))
    .unwrap();
    let cache_log = log.clone();
    loom.submit(export_cache(
        &cache_path,
        papers(),
        |papers: &Vec<PaperMetadata>| Ok(encode_cache(papers)?),
        move |_, result| {
            assert!(result.is_ok());
            cache_log.lock().push("write-cache".to_string());
        },
    ))
    .unwrap();
    for page in [1, 2] {
        let render_log = log.clone();
        loom.submit(render_page(
            page,
            page,
            |page: &u32, _| Ok(*page),
            move |page: &u32, _: Result<u32, TaskError>| {
                render_log.lock().push(format!("render-page-{}", page));
            },
        ))
        .unwrap();
    }

    assert_eq!(
        loom.pending_tags(),
        vec![
            Tag::new("render-page-2"),
            Tag::new("render-page-1"),
            Tag::new("write-json"),
            Tag::new("write-cache"),
        ]
    );

    release.send(()).unwrap();
    loom.run_until_idle();
    assert_eq!(
        *log.lock(),
        vec!["parser", "render-page-2", "render-page-1", "write-json", "write-cache"]
    );

    let json: Vec<PaperMetadata> =
        serde_json::from_str(&fs::read_to_string(&json_path).unwrap()).unwrap();
    assert_eq!(json, *papers());
    assert_eq!(decode_cache(&fs::read(&cache_path).unwrap()).unwrap(), *papers());
}

#[test]
fn test_extract_failure_is_delivered() {
    let mut loom = Loom::with_capacity(1).unwrap();
    let (tx, rx) = crossbeam::channel::bounded(1);

    // Nothing at the override, and nothing called paperparser next to the
    // test binary or on PATH.
    std::env::set_var("PAPERPARSER_PATH", "/nonexistent/paperparser");
    loom.submit(extract_metadata("missing.pdf", move |pdf, result| {
        let _ = tx.send((pdf.clone(), result.map_err(|e| e.to_string())));
    }))
    .unwrap();
    loom.run_until_idle();

    let (pdf, result) = rx.try_recv().unwrap();
    assert_eq!(pdf, std::path::PathBuf::from("missing.pdf"));
    assert_eq!(result.unwrap_err(), "could not locate 'paperparser' anywhere");
    assert_eq!(loom.stats().failed, 1);
}
