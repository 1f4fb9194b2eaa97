//! Task producers for a PDF library application.
//!
//! Each producer builds a ready-to-submit [`TaskSpec`](crate::scheduler::TaskSpec)
//! carrying the tag, priority and dependencies that keep the application's
//! background work ordered:
//!
//! | producer  | tag               | priority | lifo | waits on                 |
//! |-----------|-------------------|----------|------|--------------------------|
//! | render    | `render-page-{n}` | -1       | yes  |                          |
//! | extract   | `parser`          | 0        | no   |                          |
//! | persist   | `write-json`      | 5        | no   | `parser`                 |
//! | persist   | `write-cache`     | 5        | no   | `write-json`, `parser`   |

pub mod extract;
pub mod persist;
pub mod render;

pub use extract::{extract_metadata, locate_parser, run_parser, ExtractError, PaperMetadata, EXTRACT_TAG};
pub use persist::{
    export_cache, export_json, sync_json_and_cache, CacheError, WRITE_CACHE_TAG, WRITE_JSON_TAG,
};
pub use render::{render_page, render_tag, RENDER_PRIORITY};
